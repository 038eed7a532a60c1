// Pre-flight shared by backup-pg and restore-pg.
use std::path::Path;

use tracing::info;

use crate::config::AppConfig;
use crate::connection::binding::{build_client, fetch_binding};
use crate::connection::{self, BindingInfo, ConnectionInfo, SecretData};
use crate::errors::Result;
use crate::report::Target;
use crate::session::repository::{load_credentials, plan_repository};
use crate::session::restic::ResticSession;
use crate::utils::apply_scratch_files;

/// Everything a flow needs once the cluster has been read.
pub struct Prepared {
    pub conn: ConnectionInfo,
    pub session: ResticSession,
    pub target: Target,
}

/// Resolves the connection and only then stages its TLS files, so a failed
/// resolution leaves the scratch directory untouched.
pub fn prepare_connection(
    binding: &BindingInfo,
    secret: &SecretData,
    tls_username: Option<&str>,
    scratch_dir: &Path,
) -> Result<ConnectionInfo> {
    let conn = connection::resolve(binding, secret, tls_username)?;
    apply_scratch_files(&conn.scratch_files(scratch_dir))?;
    Ok(conn)
}

pub async fn prepare(config: &AppConfig, tls_username: Option<&str>) -> Result<Prepared> {
    let cluster = &config.cluster;
    let storage = &config.storage;

    let client = build_client(cluster.master.as_deref(), cluster.kubeconfig.as_deref()).await?;
    let (binding, secret) =
        fetch_binding(&client, &cluster.appbinding_namespace, &cluster.appbinding).await?;
    let conn = prepare_connection(&binding, &secret, tls_username, &storage.scratch_dir)?;
    info!(connection = ?conn, "Resolved database connection");

    let credentials = load_credentials(&client, storage).await?;
    let repository = plan_repository(storage, &credentials)?;
    let session = ResticSession::new(&repository)?.with_scheduling(config.scheduling.clone());
    apply_scratch_files(&repository.scratch_files)?;
    info!(repository = %repository.url, "Using backup repository");

    Ok(Prepared {
        conn,
        session,
        target: Target {
            name: cluster.appbinding.clone(),
            namespace: cluster.appbinding_namespace.clone(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{basic_auth_secret, service_binding};
    use crate::errors::AppError;

    #[test]
    fn test_missing_password_writes_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut binding = service_binding(None);
        binding.ca_bundle = Some(b"CA".to_vec());
        let mut secret = basic_auth_secret();
        secret.remove("password");
        secret.remove("POSTGRES_PASSWORD");

        let err = prepare_connection(&binding, &secret, None, dir.path()).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_ca_bundle_is_staged() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut binding = service_binding(None);
        binding.ca_bundle = Some(b"CA".to_vec());

        let conn = prepare_connection(&binding, &basic_auth_secret(), None, dir.path())?;
        assert_eq!(conn.password.as_deref(), Some("s3cret"));
        assert_eq!(std::fs::read(dir.path().join("ca.crt"))?, b"CA");
        Ok(())
    }
}
