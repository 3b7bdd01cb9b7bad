//! Static credential resolver
//!
//! Standalone deployments list their provider credentials in the daemon
//! configuration. Real deployments put an encrypted store behind the same
//! port.

use crate::domain::model::{Credential, ProviderId, SecretBundle};
use crate::domain::ports::CredentialResolver;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// One credential as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Disabled credentials resolve to `PermissionDenied`
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

/// Credential resolver over a fixed set of entries
#[derive(Debug, Default)]
pub struct StaticCredentialResolver {
    entries: HashMap<String, CredentialEntry>,
}

impl StaticCredentialResolver {
    pub fn new(entries: impl IntoIterator<Item = CredentialEntry>) -> Result<Self> {
        let mut map = HashMap::new();
        for entry in entries {
            if entry.id.trim().is_empty() {
                return Err(Error::Configuration("credential id must not be empty".into()));
            }
            if map.contains_key(&entry.id) {
                return Err(Error::Configuration(format!(
                    "duplicate credential id: {}",
                    entry.id
                )));
            }
            map.insert(entry.id.clone(), entry);
        }
        Ok(Self { entries: map })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, credential_id: &str) -> Result<Credential> {
        let entry = self
            .entries
            .get(credential_id)
            .ok_or_else(|| Error::not_found("Credential", credential_id))?;
        if !entry.enabled {
            return Err(Error::PermissionDenied(format!(
                "credential {} is disabled",
                credential_id
            )));
        }

        debug!(credential_id, provider = %entry.provider, "Resolved credential");
        Ok(Credential {
            id: entry.id.clone(),
            provider: ProviderId::new(&entry.provider),
            workspace_id: entry.workspace_id.clone(),
            secrets: SecretBundle::from(entry.secrets.clone()),
        })
    }
}
