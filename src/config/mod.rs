//! Settings for vastnfs-k8s
//!
//! Loaded once from `~/.vastnfs-k8s/config.yaml` (or `--config`), every field
//! optional. A missing file yields the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deploy::{ReadinessTimings, ReconcilerOptions, RetryPolicy};
use crate::kube::KubectlConfig;

/// Default config file location: ~/.vastnfs-k8s/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vastnfs-k8s")
        .join("config.yaml")
}

/// Errors that can occur while loading settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How kubectl is invoked
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KubectlSettings {
    pub binary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
}

impl Default for KubectlSettings {
    fn default() -> Self {
        Self {
            binary: "kubectl".to_string(),
            context: None,
            kubeconfig: None,
        }
    }
}

/// Pods used to run scripts on nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecSettings {
    pub image: String,
    pub namespace: String,
    pub timeout_secs: u64,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            image: "busybox:1.36".to_string(),
            namespace: "default".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReadinessSettings {
    pub poll_interval_secs: u64,
    pub workers_appear_secs: u64,
    pub worker_ready_secs: u64,
    pub prebuilt_ready_secs: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            workers_appear_secs: 60,
            worker_ready_secs: 300,
            prebuilt_ready_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSettings {
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UnloadSettings {
    /// Pause after flushing caches, before the base module goes
    pub drain_pause_secs: u64,
}

impl Default for UnloadSettings {
    fn default() -> Self {
        Self {
            drain_pause_secs: 2,
        }
    }
}

/// The complete settings file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub kubectl: KubectlSettings,
    pub exec: ExecSettings,
    pub probe_concurrency: usize,
    pub worker_selector: String,
    pub readiness: ReadinessSettings,
    pub logs: LogSettings,
    pub unload: UnloadSettings,
    /// Skip redeploying when every node already runs the target version
    pub fast_path_when_current: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kubectl: KubectlSettings::default(),
            exec: ExecSettings::default(),
            probe_concurrency: crate::module::aggregate::DEFAULT_PROBE_CONCURRENCY,
            worker_selector: "app.kubernetes.io/name=vastnfs".to_string(),
            readiness: ReadinessSettings::default(),
            logs: LogSettings::default(),
            unload: UnloadSettings::default(),
            fast_path_when_current: false,
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse settings from YAML
pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    let settings: Settings =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    settings.validate()?;
    Ok(settings)
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kubectl.binary.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "kubectl.binary",
                reason: "must not be empty".to_string(),
            });
        }
        if self.probe_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "probe_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.readiness.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "readiness.poll_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.logs.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "logs.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.worker_selector.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "worker_selector",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Override the kubectl context, e.g. from the command line
    pub fn with_context(mut self, context: Option<String>) -> Self {
        if context.is_some() {
            self.kubectl.context = context;
        }
        self
    }

    pub fn kubectl_config(&self) -> KubectlConfig {
        KubectlConfig {
            binary: shellexpand::tilde(&self.kubectl.binary).into_owned(),
            context: self.kubectl.context.clone(),
            kubeconfig: self
                .kubectl
                .kubeconfig
                .as_deref()
                .map(|p| shellexpand::tilde(p).into_owned()),
            exec_image: self.exec.image.clone(),
            exec_namespace: self.exec.namespace.clone(),
            timeout: Duration::from_secs(self.exec.timeout_secs),
        }
    }

    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            worker_selector: self.worker_selector.clone(),
            probe_concurrency: self.probe_concurrency,
            drain_pause: Duration::from_secs(self.unload.drain_pause_secs),
            timings: ReadinessTimings {
                poll_interval: Duration::from_secs(self.readiness.poll_interval_secs),
                workers_appear: Duration::from_secs(self.readiness.workers_appear_secs),
                worker_ready: Duration::from_secs(self.readiness.worker_ready_secs),
                prebuilt_ready: Duration::from_secs(self.readiness.prebuilt_ready_secs),
            },
            retry: RetryPolicy {
                max_attempts: self.logs.max_attempts,
                backoff: Duration::from_secs(self.logs.backoff_secs),
            },
            fast_path_when_current: self.fast_path_when_current,
        }
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load settings from the default location
pub fn load_settings() -> Result<Settings, ConfigError> {
    load_settings_from(&default_config_path())
}

/// Load settings from a specific path; a missing file yields defaults
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.kubectl.binary, "kubectl");
        assert_eq!(settings.exec.image, "busybox:1.36");
        assert_eq!(settings.probe_concurrency, 8);
        assert_eq!(settings.logs.max_attempts, 10);
        assert!(!settings.fast_path_when_current);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_partial() {
        let yaml = r#"
kubectl:
  context: prod-east
readiness:
  worker_ready_secs: 600
fast_path_when_current: true
"#;
        let settings = parse_settings(yaml).unwrap();
        assert_eq!(settings.kubectl.context.as_deref(), Some("prod-east"));
        assert_eq!(settings.kubectl.binary, "kubectl");
        assert_eq!(settings.readiness.worker_ready_secs, 600);
        assert_eq!(settings.readiness.poll_interval_secs, 2);
        assert!(settings.fast_path_when_current);
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_settings("").unwrap(), Settings::default());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = parse_settings("probe_concurrency: [not, a, number]");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = parse_settings("probe_concurrency: 0");
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "probe_concurrency",
                ..
            })
        ));
    }

    #[test]
    fn test_reconciler_options() {
        let settings = parse_settings("logs:\n  backoff_secs: 5\nunload:\n  drain_pause_secs: 0\n").unwrap();
        let options = settings.reconciler_options();
        assert_eq!(options.retry.backoff, Duration::from_secs(5));
        assert_eq!(options.retry.max_attempts, 10);
        assert_eq!(options.drain_pause, Duration::ZERO);
        assert_eq!(options.timings.prebuilt_ready, Duration::from_secs(30));
    }

    #[test]
    fn test_kubectl_config() {
        let settings = parse_settings("kubectl:\n  kubeconfig: /etc/kube/admin.conf\nexec:\n  timeout_secs: 30\n")
            .unwrap()
            .with_context(Some("lab".to_string()));
        let config = settings.kubectl_config();
        assert_eq!(config.context.as_deref(), Some("lab"));
        assert_eq!(config.kubeconfig.as_deref(), Some("/etc/kube/admin.conf"));
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_with_context_none_keeps_file_value() {
        let settings = parse_settings("kubectl:\n  context: prod\n").unwrap().with_context(None);
        assert_eq!(settings.kubectl.context.as_deref(), Some("prod"));
    }

    #[test]
    fn test_load_settings_file() {
        let file = create_temp_file("worker_selector: app=nfs-loader\n");
        let settings = load_settings_from(file.path()).unwrap();
        assert_eq!(settings.worker_selector, "app=nfs-loader");
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let settings = load_settings_from(Path::new("/nonexistent/config.yaml")).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
