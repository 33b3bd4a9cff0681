//! Kubernetes Volume Broker
//!
//! An Open Service Broker that provisions Kubernetes PersistentVolumes
//! backed by CSI drivers and binds them to applications through
//! PersistentVolumeClaims.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                     Marketplace API (OSB v2, basic auth)                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                       Resource Lifecycle Controller                          │
//! │   Provision / Deprovision / Bind / Unbind, conflict checks, compensation    │
//! ├──────────────────────┬──────────────────────────┬───────────────────────────┤
//! │   Services Registry  │      Cluster Gateway     │       State Store         │
//! │   (catalog + lazy    │   (PersistentVolume /    │   (JSON snapshot of       │
//! │    driver clients)   │    Claim create/delete)  │    instances, bindings)   │
//! └──────────────────────┴──────────────────────────┴───────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`api`]: OSB REST endpoints and the server hosting them
//! - [`broker`]: Lifecycle controller, request parsing, cluster gateway
//! - [`catalog`]: Service offerings and the driver-client registry
//! - [`domain`]: Records, value types and the traits at the seams
//! - [`store`]: Snapshot-backed state store
//! - [`metrics`]: Prometheus operation metrics
//! - [`error`]: Error types and handling

pub mod api;
pub mod broker;
pub mod catalog;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, BrokerCredentials, RestRouter};

pub use broker::{Broker, BrokerConfig, KubeGateway};

pub use catalog::{
    load_catalog, CatalogService, GrpcConnector, Plan, ServiceOffering, ServicesRegistry,
};

pub use domain::ports::{
    BrokerStore, ClusterGateway, ControllerClient, DriverConnector, IdentityClient,
};

pub use domain::records::{
    Binding, InstanceRecord, StoredFingerprint, VolumeFingerprint, VolumeMount,
};

pub use error::{Error, ErrorKind, Result};

pub use metrics::BrokerMetrics;

pub use store::{SnapshotStore, StoreBackend};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
