//! Secret preconditions and signing-key publication

use tracing::{debug, info};

use super::request::SigningKeys;
use crate::kube::{ClusterApi, ClusterError, SecretFile};

/// Data key every registry pull secret must carry
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

/// Secret the loader reads the secure boot key pair from
pub const SIGNING_SECRET_NAME: &str = "vastnfs-signing-keys";

/// Why a pull secret is not usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullSecretProblem {
    Missing,
    NoDockerConfig,
}

/// Check the pull secret exists and carries registry credentials
///
/// `Ok(None)` means usable; cluster errors are returned as is.
pub async fn check_pull_secret(
    api: &dyn ClusterApi,
    namespace: &str,
    name: &str,
) -> Result<Option<PullSecretProblem>, ClusterError> {
    if !api.secret_exists(namespace, name).await? {
        return Ok(Some(PullSecretProblem::Missing));
    }

    match api.read_secret_key(namespace, name, DOCKER_CONFIG_KEY).await? {
        Some(value) if !value.trim().is_empty() => {
            debug!("Pull secret {}/{} looks usable", namespace, name);
            Ok(None)
        }
        _ => Ok(Some(PullSecretProblem::NoDockerConfig)),
    }
}

/// Secret entries for a signing key pair
pub fn signing_secret_files(keys: &SigningKeys) -> Vec<SecretFile> {
    vec![
        SecretFile {
            key: "key".to_string(),
            path: keys.key.clone(),
        },
        SecretFile {
            key: "cert".to_string(),
            path: keys.cert.clone(),
        },
    ]
}

/// Create or update the signing secret in the target namespace
pub async fn publish_signing_keys(
    api: &dyn ClusterApi,
    namespace: &str,
    keys: &SigningKeys,
) -> Result<(), ClusterError> {
    api.publish_secret(namespace, SIGNING_SECRET_NAME, &signing_secret_files(keys))
        .await?;
    info!("Published signing keys to {}/{}", namespace, SIGNING_SECRET_NAME);
    Ok(())
}
