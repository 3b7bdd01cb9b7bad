//! Audit sinks

use crate::domain::ports::{AuditRecord, AuditSink};
use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

/// Writes audit records to the `audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_action(&self, record: AuditRecord) -> Result<()> {
        let details = serde_json::to_string(&record.details)?;
        info!(
            target: "audit",
            actor = %record.actor_id,
            action = %record.action,
            resource_type = %record.resource_type,
            resource_id = %record.resource_id,
            provider = %record.provider,
            details = %details,
            "audit"
        );
        Ok(())
    }
}
