//! Multi-Cloud Orchestrator - Control Plane Core
//!
//! Manages Kubernetes clusters and network resources across cloud
//! providers through one uniform contract, and propagates every lifecycle
//! outcome to connected observers as topic-routed events.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          Resource Orchestrator                              │
//! │   validate ─► resolve credential ─► dispatch ─► publish event ─► audit      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────┐            ┌──────────────────────────────┐   │
//! │  │    Provider Registry     │            │       Event Publisher        │   │
//! │  │  ┌────────┐  ┌────────┐  │            │  {family}.{provider}.{scope} │   │
//! │  │  │  AWS   │  │  GCP   │  │            │   .{region}.{resource}.{act} │   │
//! │  │  │EKS/EC2 │  │GKE/GCE │  │            └──────────────┬───────────────┘   │
//! │  │  └────────┘  └────────┘  │                           │                   │
//! │  └──────────────────────────┘            ┌──────────────┴───────────────┐   │
//! │                                          │  Event Bus (bounded workers) │   │
//! │  ┌──────────────────────────┐            └──────────────┬───────────────┘   │
//! │  │       Reconciler         │◄── interest ┌─────────────┴────────────────┐  │
//! │  │  (periodic list sweeps)  │─────────────│   Subscription Registry      │  │
//! │  └──────────────────────────┘             │   (64-way sharded owners)    │  │
//! │                                           └──────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator, composite operations, reconciliation
//! - [`providers`]: Provider registry and the AWS / GCP adapters
//! - [`events`]: Topics, subscriptions, the event bus and publisher
//! - [`domain`]: Core model, ports and call context
//! - [`config`]: Daemon configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod events;
pub mod providers;

// Re-export commonly used types
pub use config::ControlPlaneConfig;

pub use controlplane::{
    ClusterWithNetwork, CompositeClusterRequest, CompositeReport, CredentialEntry,
    OrchestratorConfig, ReconcileConfig, Reconciler, ResourceOrchestrator,
    StaticCredentialResolver, StepOutcome, TracingAuditSink,
};

pub use domain::context::CallContext;
pub use domain::model::{
    ClusterStatus, Credential, ManagedCluster, NodeGroup, ProviderId, SecurityRuleSet, Subnet,
    VirtualNetwork,
};
pub use domain::ports::{AuditSink, CredentialResolver, ProviderAdapter, ProviderCapabilities};

pub use error::{Error, ErrorKind, Result};

pub use events::{
    topic_matches, Event, EventAction, EventBus, EventBusConfig, EventPublisher,
    SubscriptionFilter, SubscriptionRegistry, SubscriptionRequest,
};

pub use providers::{ProviderFactory, ProviderRegistry, ProvidersConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
