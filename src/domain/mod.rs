//! Domain layer - Core model and port definitions
//!
//! This module defines the normalized entities and the traits (ports) that
//! adapters implement, following hexagonal architecture principles.

pub mod context;
pub mod model;
pub mod ports;

pub use context::*;
pub use model::*;
pub use ports::*;
