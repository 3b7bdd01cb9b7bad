//! Control Plane Module
//!
//! The orchestration core: single-resource lifecycle operations, the
//! composite cluster-with-network operation, the reconciliation sweep and
//! default implementations of the credential and audit ports.

pub mod audit;
pub mod composite;
pub mod credentials;
pub mod orchestrator;
pub mod reconciler;

#[cfg(test)]
pub(crate) mod testing;

pub use audit::TracingAuditSink;
pub use composite::{
    ClusterWithNetwork, CompositeClusterRequest, CompositeReport, NetworkSpec, RuleSetSpec,
    StepOutcome, StepReport, SubnetSpec,
};
pub use credentials::{CredentialEntry, StaticCredentialResolver};
pub use orchestrator::{OrchestratorConfig, ResourceOrchestrator};
pub use reconciler::{
    BaselineCredential, ReconcileConfig, Reconciler, SweepPriority, SweepReport,
};
