//! Daemon configuration
//!
//! Everything has a default, so an empty file (or no file at all) yields a
//! working standalone control plane with both simulated providers enabled.
//!
//! ```yaml
//! orchestrator:
//!   call_timeout_secs: 30
//! event_bus:
//!   workers: 4
//! reconcile:
//!   high_interval_secs: 60
//! providers:
//!   gcp:
//!     enabled: false
//! credentials:
//!   - id: cred-1
//!     provider: aws
//!     secrets:
//!       access_key: AKIA...
//!       secret_key: ...
//! ```

use crate::controlplane::{
    BaselineCredential, CredentialEntry, OrchestratorConfig, ReconcileConfig,
};
use crate::error::{Error, Result};
use crate::events::EventBusConfig;
use crate::providers::ProvidersConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Top-level configuration of the control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub orchestrator: OrchestratorConfig,
    pub event_bus: EventBusConfig,
    pub reconcile: ReconcileConfig,
    pub providers: ProvidersConfig,
    pub credentials: Vec<CredentialEntry>,
}

impl ControlPlaneConfig {
    /// Load and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&content)?;
        info!(
            path = %path.display(),
            credentials = config.credentials.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty mapping
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.call_timeout_secs == 0 {
            return Err(Error::Configuration(
                "orchestrator.call_timeout_secs must be positive".into(),
            ));
        }
        if self.event_bus.queue_capacity == 0 || self.event_bus.workers == 0 {
            return Err(Error::Configuration(
                "event_bus.queue_capacity and event_bus.workers must be positive".into(),
            ));
        }
        if self.event_bus.observer_buffer == 0 {
            return Err(Error::Configuration(
                "event_bus.observer_buffer must be positive".into(),
            ));
        }
        let reconcile = &self.reconcile;
        if reconcile.enabled && (reconcile.high_interval_secs == 0 || reconcile.medium_interval_secs == 0)
        {
            return Err(Error::Configuration(
                "reconcile intervals must be positive".into(),
            ));
        }
        if reconcile.high_interval_secs > reconcile.medium_interval_secs {
            return Err(Error::Configuration(format!(
                "reconcile.high_interval_secs ({}) exceeds medium_interval_secs ({})",
                reconcile.high_interval_secs, reconcile.medium_interval_secs
            )));
        }
        if reconcile.medium_interval_secs > reconcile.low_interval_secs {
            return Err(Error::Configuration(format!(
                "reconcile.medium_interval_secs ({}) exceeds low_interval_secs ({})",
                reconcile.medium_interval_secs, reconcile.low_interval_secs
            )));
        }
        Ok(())
    }

    /// Enabled credentials, swept in their provider's default regions
    pub fn baseline_credentials(&self) -> Vec<BaselineCredential> {
        self.credentials
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| BaselineCredential::new(&entry.id, &entry.provider))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ControlPlaneConfig::from_yaml_str("").unwrap();
        assert_eq!(config.orchestrator.call_timeout_secs, 30);
        assert_eq!(config.event_bus.queue_capacity, 1024);
        assert_eq!(config.event_bus.workers, 4);
        assert_eq!(config.event_bus.observer_buffer, 256);
        assert_eq!(config.reconcile.high_interval_secs, 60);
        assert_eq!(config.reconcile.medium_interval_secs, 180);
        assert_eq!(config.reconcile.low_interval_secs, 600);
        assert_eq!(config.reconcile.low_priority_regions["gcp"].len(), 4);
        assert!(config.providers.aws.enabled);
        assert!(config.providers.gcp.enabled);
        assert!(config.credentials.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
orchestrator:
  call_timeout_secs: 10
providers:
  gcp:
    enabled: false
credentials:
  - id: cred-1
    provider: aws
    secrets:
      access_key: AKIAEXAMPLE
      secret_key: secret
  - id: cred-2
    provider: gcp
    enabled: false
"#
        )
        .unwrap();

        let config = ControlPlaneConfig::from_file(file.path()).unwrap();
        assert_eq!(config.orchestrator.call_timeout_secs, 10);
        assert!(config.orchestrator.audit_enabled);
        assert!(!config.providers.gcp.enabled);
        assert_eq!(config.providers.aws.default_region, "us-east-1");
        assert_eq!(config.credentials.len(), 2);
        assert_eq!(
            config.credentials[0].secrets.get("access_key").map(String::as_str),
            Some("AKIAEXAMPLE")
        );
        assert!(!config.credentials[1].enabled);

        let baseline = config.baseline_credentials();
        assert_eq!(baseline, vec![BaselineCredential::new("cred-1", "aws")]);
    }

    #[test]
    fn test_invalid_values() {
        assert_matches!(
            ControlPlaneConfig::from_yaml_str("event_bus:\n  workers: 0\n"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ControlPlaneConfig::from_yaml_str(
                "reconcile:\n  high_interval_secs: 600\n  medium_interval_secs: 60\n"
            ),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ControlPlaneConfig::from_yaml_str(
                "reconcile:\n  medium_interval_secs: 900\n  low_interval_secs: 600\n"
            ),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ControlPlaneConfig::from_yaml_str("orchestrator: [1, 2]"),
            Err(Error::YamlParse(_))
        );
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(
            ControlPlaneConfig::from_file("/nonexistent/config.yaml"),
            Err(Error::Io(_))
        );
    }
}
