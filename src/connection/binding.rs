// AppBinding custom resource and the Kubernetes reads behind connection resolution.
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use super::{BindingInfo, Endpoint, SecretData};
use crate::errors::{AppError, Result};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "appcatalog.appscode.com",
    version = "v1alpha1",
    kind = "AppBinding",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AppBindingSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,
    pub client_config: ClientConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<LocalObjectReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ca_bundle: Option<ByteString>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    pub name: String,
    #[serde(default)]
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Builds a client from `--kubeconfig`/`--master`, falling back to in-cluster
/// or default kubeconfig discovery.
pub async fn build_client(master: Option<&str>, kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                AppError::KubeConfig(format!("failed to read kubeconfig {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| AppError::KubeConfig(e.to_string()))?
        }
        None => Config::infer()
            .await
            .map_err(|e| AppError::KubeConfig(e.to_string()))?,
    };
    if let Some(master) = master.filter(|m| !m.is_empty()) {
        config.cluster_url = master
            .parse()
            .map_err(|e| AppError::KubeConfig(format!("invalid master url {:?}: {}", master, e)))?;
    }
    Ok(Client::try_from(config)?)
}

impl AppBindingSpec {
    /// Connection descriptor for the binding living in `namespace`.
    pub fn binding_info(&self, namespace: &str) -> Result<BindingInfo> {
        let endpoint = match (&self.client_config.url, &self.client_config.service) {
            (Some(url), _) if !url.is_empty() => Endpoint::Url(url.clone()),
            (_, Some(svc)) => Endpoint::Service {
                name: svc.name.clone(),
                namespace: namespace.to_string(),
                port: u16::try_from(svc.port).ok(),
                query: svc.query.clone().filter(|q| !q.is_empty()),
            },
            _ => {
                return Err(AppError::Config(
                    "AppBinding has neither clientConfig.url nor clientConfig.service".to_string(),
                ));
            }
        };
        Ok(BindingInfo {
            endpoint,
            ca_bundle: self
                .client_config
                .ca_bundle
                .as_ref()
                .map(|b| b.0.clone())
                .filter(|b| !b.is_empty()),
        })
    }
}

pub fn secret_data(secret: Secret) -> SecretData {
    let mut data: SecretData = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect();
    // stringData is only populated on objects that were never round-tripped, keep it anyway.
    for (k, v) in secret.string_data.unwrap_or_default() {
        data.entry(k).or_insert_with(|| v.into_bytes());
    }
    data
}

pub async fn get_secret(client: &Client, namespace: &str, name: &str) -> Result<SecretData> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get(name).await?;
    debug!(secret = name, namespace, "fetched secret");
    Ok(secret_data(secret))
}

/// Reads the AppBinding and the secret data it references. When the binding
/// names a separate TLS secret its keys are merged over the auth secret.
pub async fn fetch_binding(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<(BindingInfo, SecretData)> {
    let bindings: Api<AppBinding> = Api::namespaced(client.clone(), namespace);
    let binding = bindings.get(name).await?;
    info!(appbinding = name, namespace, "fetched AppBinding");

    let info = binding.spec.binding_info(namespace)?;

    let mut data = match &binding.spec.secret {
        Some(reference) => get_secret(client, namespace, &reference.name).await?,
        None => SecretData::new(),
    };
    if let Some(reference) = &binding.spec.tls_secret {
        data.extend(get_secret(client, namespace, &reference.name).await?);
    }
    if data.is_empty() {
        return Err(AppError::Config(format!(
            "AppBinding {}/{} does not reference any credentials secret",
            namespace, name
        )));
    }
    Ok((info, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_binding_from_json() -> anyhow::Result<()> {
        let spec: AppBindingSpec = serde_json::from_value(json!({
            "type": "kubedb.com/postgres",
            "clientConfig": {
                "service": { "name": "pg", "port": 0, "scheme": "postgresql", "query": "sslmode=require" },
                "caBundle": "Q0E="
            },
            "secret": { "name": "pg-auth" }
        }))?;
        let info = spec.binding_info("demo")?;
        assert_eq!(
            info.endpoint,
            Endpoint::Service {
                name: "pg".to_string(),
                namespace: "demo".to_string(),
                port: Some(0),
                query: Some("sslmode=require".to_string()),
            }
        );
        assert_eq!(info.ca_bundle.as_deref(), Some(&b"CA"[..]));
        Ok(())
    }

    #[test]
    fn test_url_takes_precedence() -> anyhow::Result<()> {
        let spec: AppBindingSpec = serde_json::from_value(json!({
            "clientConfig": {
                "url": "postgres://db:5433/app",
                "service": { "name": "pg", "port": 5432 }
            }
        }))?;
        let info = spec.binding_info("demo")?;
        assert_eq!(info.endpoint, Endpoint::Url("postgres://db:5433/app".to_string()));
        assert!(info.ca_bundle.is_none());
        Ok(())
    }

    #[test]
    fn test_binding_without_endpoint_fails() {
        let spec = AppBindingSpec::default();
        assert!(matches!(spec.binding_info("demo"), Err(AppError::Config(_))));
    }

    #[test]
    fn test_secret_data_merges_string_data() {
        let mut secret = Secret::default();
        secret.data = Some(
            [("password".to_string(), ByteString(b"a".to_vec()))]
                .into_iter()
                .collect(),
        );
        secret.string_data = Some(
            [
                ("password".to_string(), "b".to_string()),
                ("username".to_string(), "u".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let data = secret_data(secret);
        assert_eq!(data.get("password").map(Vec::as_slice), Some(&b"a"[..]));
        assert_eq!(data.get("username").map(Vec::as_slice), Some(&b"u"[..]));
    }
}
