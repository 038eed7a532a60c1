//! Connection resolution
//!
//! Turns an AppBinding descriptor and the data of its secret(s) into a
//! `ConnectionInfo`. Resolution itself never touches the filesystem: the TLS
//! material that the PostgreSQL client tools need on disk is described by
//! `ConnectionInfo::scratch_files` and written by `utils::apply_scratch_files`.

pub(crate) mod binding;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use url::Url;

use crate::errors::{AppError, Result};

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_TLS_USER: &str = "postgres";

/// Candidate keys for the database user, in priority order. The second entry
/// is the legacy key kept for secrets created by older operators.
pub const USERNAME_KEYS: &[&str] = &["username", "POSTGRES_USER"];
/// Candidate keys for the database password, in priority order.
pub const PASSWORD_KEYS: &[&str] = &["password", "POSTGRES_PASSWORD"];

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
pub const CA_CERT_FILE: &str = "ca.crt";

pub const ENV_PG_PASSWORD: &str = "PGPASSWORD";
pub const ENV_PG_SSL_CERT: &str = "PGSSLCERT";
pub const ENV_PG_SSL_KEY: &str = "PGSSLKEY";
pub const ENV_PG_SSL_ROOT_CERT: &str = "PGSSLROOTCERT";
pub const ENV_PG_SSL_MODE: &str = "PGSSLMODE";

pub const SCRATCH_FILE_MODE: u32 = 0o600;

/// Raw secret data as stored in a Kubernetes `Secret`.
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Where the database can be reached, as declared by the AppBinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Service {
        name: String,
        namespace: String,
        port: Option<u16>,
        query: Option<String>,
    },
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub endpoint: Endpoint,
    pub ca_bundle: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

impl FromStr for SslMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(AppError::Config(format!(
                "unknown sslmode {:?}: expected one of disable, allow, prefer, require, verify-ca, verify-full",
                other
            ))),
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client certificate and key used for certificate based authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientTls {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub ssl_mode: Option<SslMode>,
    pub client_tls: Option<ClientTls>,
    pub ca_bundle: Option<Vec<u8>>,
}

// Credentials stay out of logs.
impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssl_mode", &self.ssl_mode)
            .field("client_tls", &self.client_tls.as_ref().map(|_| "<redacted>"))
            .field("ca_bundle", &self.ca_bundle.as_ref().map(|b| b.len()))
            .finish()
    }
}

/// A file the connection needs on disk before any client tool runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchFile {
    pub path: PathBuf,
    pub contents: Vec<u8>,
    pub mode: u32,
}

impl ConnectionInfo {
    /// Files to stage in `scratch_dir`: the client certificate pair and the CA bundle.
    pub fn scratch_files(&self, scratch_dir: &Path) -> Vec<ScratchFile> {
        let mut files = Vec::new();
        if let Some(tls) = &self.client_tls {
            files.push(ScratchFile {
                path: scratch_dir.join(TLS_CERT_KEY),
                contents: tls.cert.clone(),
                mode: SCRATCH_FILE_MODE,
            });
            files.push(ScratchFile {
                path: scratch_dir.join(TLS_PRIVATE_KEY_KEY),
                contents: tls.key.clone(),
                mode: SCRATCH_FILE_MODE,
            });
        }
        if let Some(ca) = &self.ca_bundle {
            files.push(ScratchFile {
                path: scratch_dir.join(CA_CERT_FILE),
                contents: ca.clone(),
                mode: SCRATCH_FILE_MODE,
            });
        }
        files
    }

    /// Environment for `pg_dump`, `pg_dumpall`, `psql` and `pg_isready`.
    /// Paths point at the files returned by `scratch_files`.
    pub fn child_env(&self, scratch_dir: &Path) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        if let Some(password) = &self.password {
            env.push((ENV_PG_PASSWORD, password.clone()));
        }
        if self.client_tls.is_some() {
            env.push((
                ENV_PG_SSL_CERT,
                scratch_dir.join(TLS_CERT_KEY).display().to_string(),
            ));
            env.push((
                ENV_PG_SSL_KEY,
                scratch_dir.join(TLS_PRIVATE_KEY_KEY).display().to_string(),
            ));
        }
        if self.ca_bundle.is_some() {
            env.push((
                ENV_PG_SSL_ROOT_CERT,
                scratch_dir.join(CA_CERT_FILE).display().to_string(),
            ));
        }
        if let Some(mode) = self.ssl_mode {
            env.push((ENV_PG_SSL_MODE, mode.to_string()));
        }
        env
    }
}

/// Returns the value of the first key in `keys` that is present in `data`.
pub fn lookup_first<'a>(data: &'a SecretData, keys: &[&str]) -> Option<(&'a str, &'a [u8])> {
    keys.iter()
        .find_map(|k| data.get_key_value(*k))
        .map(|(k, v)| (k.as_str(), v.as_slice()))
}

fn secret_string(key: &str, value: &[u8]) -> Result<String> {
    String::from_utf8(value.to_vec())
        .map_err(|_| AppError::Config(format!("secret key {:?} is not valid UTF-8", key)))
}

/// Parses the `sslmode=<value>` fragment attached to a service reference.
pub fn parse_sslmode_query(query: &str) -> Result<Option<SslMode>> {
    if query.trim().is_empty() {
        return Ok(None);
    }
    let parts: Vec<&str> = query.split('=').collect();
    if parts.len() != 2 || parts[0].trim() != "sslmode" {
        return Err(AppError::Config(
            "the sslmode is not valid. please provide the valid template. the template should be like this: sslmode=<your_desire_sslmode>"
                .to_string(),
        ));
    }
    parts[1].trim().parse().map(Some)
}

fn resolve_endpoint(endpoint: &Endpoint) -> Result<(String, u16, Option<SslMode>)> {
    match endpoint {
        Endpoint::Service {
            name,
            namespace,
            port,
            query,
        } => {
            if name.trim().is_empty() {
                return Err(AppError::Config(
                    "AppBinding service reference has an empty name".to_string(),
                ));
            }
            let port = port.filter(|p| *p != 0).unwrap_or(DEFAULT_PORT);
            let ssl_mode = match query {
                Some(q) => parse_sslmode_query(q)?,
                None => None,
            };
            Ok((format!("{}.{}.svc", name, namespace), port, ssl_mode))
        }
        Endpoint::Url(raw) => {
            let url = Url::parse(raw)
                .map_err(|e| AppError::Config(format!("invalid AppBinding url {:?}: {}", raw, e)))?;
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| AppError::Config(format!("AppBinding url {:?} has no host", raw)))?
                .to_string();
            let port = url.port().unwrap_or(DEFAULT_PORT);
            let ssl_mode = url
                .query_pairs()
                .find(|(k, _)| k == "sslmode")
                .map(|(_, v)| v.trim().parse::<SslMode>())
                .transpose()?;
            Ok((host, port, ssl_mode))
        }
    }
}

/// Builds the connection for `binding` from the binding's secret data.
///
/// A secret carrying `tls.key` selects certificate authentication and the
/// basic-auth keys are then never consulted. Otherwise the username and
/// password are taken from `USERNAME_KEYS` and `PASSWORD_KEYS`.
pub fn resolve(
    binding: &BindingInfo,
    secret: &SecretData,
    tls_username: Option<&str>,
) -> Result<ConnectionInfo> {
    let (host, port, ssl_mode) = resolve_endpoint(&binding.endpoint)?;

    let (username, password, client_tls) = if secret.contains_key(TLS_PRIVATE_KEY_KEY) {
        let cert = secret
            .get(TLS_CERT_KEY)
            .ok_or_else(|| AppError::Config("can't find client cert".to_string()))?;
        let key = secret
            .get(TLS_PRIVATE_KEY_KEY)
            .ok_or_else(|| AppError::Config("can't find client private key".to_string()))?;
        let username = tls_username.unwrap_or(DEFAULT_TLS_USER).to_string();
        let tls = ClientTls {
            cert: cert.clone(),
            key: key.clone(),
        };
        (username, None, Some(tls))
    } else {
        let (user_key, user) = lookup_first(secret, USERNAME_KEYS).ok_or_else(|| {
            AppError::Config(format!(
                "missing database username: secret has none of the keys {:?}",
                USERNAME_KEYS
            ))
        })?;
        let (pass_key, pass) = lookup_first(secret, PASSWORD_KEYS).ok_or_else(|| {
            AppError::Config(format!(
                "missing database password: secret has none of the keys {:?}",
                PASSWORD_KEYS
            ))
        })?;
        (
            secret_string(user_key, user)?,
            Some(secret_string(pass_key, pass)?),
            None,
        )
    };

    Ok(ConnectionInfo {
        host,
        port,
        username,
        password,
        ssl_mode,
        client_tls,
        ca_bundle: binding.ca_bundle.clone(),
    })
}
