// Backup repository location and credentials for restic.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use kube::Client;
use tracing::{debug, info, warn};

use crate::config::{CredentialSource, Provider, StorageConfig};
use crate::connection::binding::get_secret;
use crate::connection::{SCRATCH_FILE_MODE, ScratchFile, SecretData};
use crate::errors::{AppError, Result};

pub const RESTIC_REPOSITORY: &str = "RESTIC_REPOSITORY";
pub const RESTIC_PASSWORD: &str = "RESTIC_PASSWORD";
pub const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
pub const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const GOOGLE_SERVICE_ACCOUNT_JSON_KEY: &str = "GOOGLE_SERVICE_ACCOUNT_JSON_KEY";
pub const CA_CERT_DATA: &str = "CA_CERT_DATA";

const DEFAULT_S3_ENDPOINT: &str = "s3.amazonaws.com";
const GCS_KEY_FILE: &str = "gcs-sa-key.json";
const REPOSITORY_CA_FILE: &str = "repository-ca.crt";
const CACHE_DIR: &str = "restic-cache";

/// Storage secret keys exported verbatim to the restic environment.
pub const CREDENTIAL_ENV_KEYS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "GOOGLE_PROJECT_ID",
    "AZURE_ACCOUNT_NAME",
    "AZURE_ACCOUNT_KEY",
    "OS_AUTH_URL",
    "OS_USERNAME",
    "OS_PASSWORD",
    "OS_REGION_NAME",
    "OS_TENANT_ID",
    "OS_TENANT_NAME",
    "OS_USER_DOMAIN_NAME",
    "OS_PROJECT_NAME",
    "OS_PROJECT_DOMAIN_NAME",
    "OS_STORAGE_URL",
    "OS_AUTH_TOKEN",
    "ST_AUTH",
    "ST_USER",
    "ST_KEY",
    "B2_ACCOUNT_ID",
    "B2_ACCOUNT_KEY",
    "REST_SERVER_USERNAME",
    "REST_SERVER_PASSWORD",
];

/// Everything restic needs to reach a repository.
#[derive(Clone, PartialEq, Eq)]
pub struct Repository {
    pub url: String,
    pub global_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub scratch_files: Vec<ScratchFile>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("url", &self.url)
            .field("global_args", &self.global_args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn repository_url(storage: &StorageConfig) -> String {
    let bucket = storage.bucket.as_str();
    let path = storage.path.as_str();
    match storage.provider {
        Provider::Local => {
            let joined = join_path(&[bucket, path]);
            if bucket.starts_with('/') || (bucket.is_empty() && path.starts_with('/')) {
                format!("/{}", joined)
            } else {
                joined
            }
        }
        Provider::S3 => {
            let endpoint = storage
                .endpoint
                .as_deref()
                .map(|e| e.trim_end_matches('/'))
                .unwrap_or(DEFAULT_S3_ENDPOINT);
            format!("s3:{}/{}", endpoint, join_path(&[bucket, path]))
        }
        Provider::Gcs => format!("gs:{}:/{}", bucket, join_path(&[path])),
        Provider::Azure => format!("azure:{}:/{}", bucket, join_path(&[path])),
        Provider::Swift => format!("swift:{}:/{}", bucket, join_path(&[path])),
        Provider::B2 => format!("b2:{}:/{}", bucket, join_path(&[path])),
        Provider::Rest => {
            let endpoint = storage.endpoint.as_deref().unwrap_or_default();
            let path = join_path(&[path]);
            if path.is_empty() {
                format!("rest:{}", endpoint.trim_end_matches('/'))
            } else {
                format!("rest:{}/{}", endpoint.trim_end_matches('/'), path)
            }
        }
    }
}

fn connections_option(provider: Provider) -> Option<&'static str> {
    match provider {
        Provider::Gcs => Some("gs.connections"),
        Provider::Azure => Some("azure.connections"),
        Provider::B2 => Some("b2.connections"),
        _ => None,
    }
}

fn utf8_value(key: &str, value: &[u8]) -> Result<String> {
    String::from_utf8(value.to_vec())
        .map(|v| v.trim_end_matches(['\r', '\n']).to_string())
        .map_err(|_| AppError::Config(format!("storage secret key {} is not valid UTF-8", key)))
}

/// Builds the restic repository description from the storage flags and the
/// storage secret. Nothing is written here; see `Repository::scratch_files`.
pub fn plan_repository(storage: &StorageConfig, credentials: &SecretData) -> Result<Repository> {
    let url = repository_url(storage);
    let mut env = BTreeMap::new();
    let mut global_args = Vec::new();
    let mut scratch_files = Vec::new();

    let password = credentials.get(RESTIC_PASSWORD).ok_or_else(|| {
        AppError::Config(format!("storage secret is missing {}", RESTIC_PASSWORD))
    })?;
    env.insert(RESTIC_PASSWORD.to_string(), utf8_value(RESTIC_PASSWORD, password)?);
    env.insert(RESTIC_REPOSITORY.to_string(), url.clone());

    for key in CREDENTIAL_ENV_KEYS {
        if let Some(value) = credentials.get(*key) {
            env.insert(key.to_string(), utf8_value(key, value)?);
        }
    }
    if let Some(region) = &storage.region {
        env.insert(AWS_DEFAULT_REGION.to_string(), region.clone());
    }

    if let Some(key) = credentials.get(GOOGLE_SERVICE_ACCOUNT_JSON_KEY) {
        let path = storage.scratch_dir.join(GCS_KEY_FILE);
        env.insert(
            GOOGLE_APPLICATION_CREDENTIALS.to_string(),
            path.display().to_string(),
        );
        scratch_files.push(ScratchFile {
            path,
            contents: key.clone(),
            mode: SCRATCH_FILE_MODE,
        });
    }
    if let Some(ca) = credentials.get(CA_CERT_DATA) {
        let path = storage.scratch_dir.join(REPOSITORY_CA_FILE);
        global_args.push("--cacert".to_string());
        global_args.push(path.display().to_string());
        scratch_files.push(ScratchFile {
            path,
            contents: ca.clone(),
            mode: SCRATCH_FILE_MODE,
        });
    }

    if let Some(n) = storage.max_connections {
        match connections_option(storage.provider) {
            Some(option) => {
                global_args.push("-o".to_string());
                global_args.push(format!("{}={}", option, n));
            }
            None => warn!(
                provider = ?storage.provider,
                "--max-connections is only supported for gcs, azure and b2, ignoring"
            ),
        }
    }

    if storage.enable_cache {
        global_args.push("--cache-dir".to_string());
        global_args.push(cache_dir(&storage.scratch_dir).display().to_string());
    } else {
        global_args.push("--no-cache".to_string());
    }

    Ok(Repository {
        url,
        global_args,
        env,
        scratch_files,
    })
}

pub fn cache_dir(scratch_dir: &Path) -> PathBuf {
    scratch_dir.join(CACHE_DIR)
}

/// Reads a mounted secret. Every regular file becomes one key; the `..data`
/// bookkeeping entries of a Kubernetes volume are skipped.
pub fn read_secret_dir(dir: &Path) -> Result<SecretData> {
    let entries = fs::read_dir(dir).map_err(|e| {
        AppError::Config(format!(
            "failed to read storage secret directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut data = SecretData::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if !fs::metadata(&path)?.is_file() {
            continue;
        }
        data.insert(name, fs::read(&path)?);
    }
    debug!(dir = %dir.display(), keys = data.len(), "read storage secret directory");
    Ok(data)
}

pub async fn load_credentials(client: &Client, storage: &StorageConfig) -> Result<SecretData> {
    match &storage.credentials {
        CredentialSource::Dir(dir) => read_secret_dir(dir),
        CredentialSource::Secret { name, namespace } => {
            info!(secret = %name, namespace = %namespace, "Loading storage secret");
            get_secret(client, namespace, name).await
        }
    }
}
