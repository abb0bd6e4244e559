//! # Connector Contract
//!
//! The surface the provisioning engine uses to reach external identity
//! systems (directories, databases, SaaS APIs).
//!
//! ## Crate Organization
//!
//! - [`ids`] - Type-safe identifiers (`SystemId`, `AccountId`, `OperationId`)
//! - [`types`] - Operation type enum
//! - [`error`] - Error types with transient/permanent classification
//! - [`traits`] - `Connector` and `ConnectorProvider`
//! - [`config`] - Connection settings

pub mod config;
pub mod error;
pub mod ids;
pub mod traits;
pub mod types;

pub use config::ConnectionSettings;
pub use error::{ConnectorError, ConnectorResult};
pub use ids::{AccountId, OperationId, SystemId};
pub use traits::{Connector, ConnectorProvider, ConnectorRequest, ConnectorResponse};
pub use types::{OperationType, ParseOperationTypeError};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::ConnectionSettings;
    pub use crate::error::{ConnectorError, ConnectorResult};
    pub use crate::ids::{AccountId, OperationId, SystemId};
    pub use crate::traits::{Connector, ConnectorProvider, ConnectorRequest, ConnectorResponse};
    pub use crate::types::OperationType;
}

// Re-export async_trait for connector implementors
pub use async_trait::async_trait;
