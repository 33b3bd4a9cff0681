//! Domain Ports - Core trait definitions for the broker
//!
//! These traits define the boundaries between the lifecycle controller and
//! external systems: the state store, the cluster, and CSI drivers.
//! Adapters implement these traits to provide concrete functionality.

use crate::domain::records::{BindingRecord, InstanceRecord};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// State Store Port
// =============================================================================

/// Durable bookkeeping of instances and bindings
///
/// `save` is the durability boundary: it must be safe to call several times
/// per request.
#[async_trait]
pub trait BrokerStore: Send + Sync {
    /// Load the last durable snapshot
    async fn restore(&self) -> Result<()>;

    /// Flush the current state durably
    async fn save(&self) -> Result<()>;

    async fn create_instance_details(&self, instance_id: &str, record: InstanceRecord) -> Result<()>;

    async fn retrieve_instance_details(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    async fn delete_instance_details(&self, instance_id: &str) -> Result<()>;

    /// True when a record exists under `instance_id` whose content differs
    async fn is_instance_conflict(&self, instance_id: &str, record: &InstanceRecord) -> bool;

    async fn create_binding_details(&self, binding_id: &str, record: BindingRecord) -> Result<()>;

    async fn retrieve_binding_details(&self, binding_id: &str) -> Result<Option<BindingRecord>>;

    async fn delete_binding_details(&self, binding_id: &str) -> Result<()>;

    /// True when a record exists under `binding_id` whose content differs
    async fn is_binding_conflict(&self, binding_id: &str, record: &BindingRecord) -> bool;
}

// =============================================================================
// Cluster Gateway Port
// =============================================================================

/// Create/delete access to the cluster's volume objects
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn create_volume(&self, volume: PersistentVolume) -> Result<PersistentVolume>;

    async fn delete_volume(&self, name: &str) -> Result<()>;

    async fn create_claim(
        &self,
        namespace: &str,
        claim: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;
}

// =============================================================================
// CSI Driver Ports
// =============================================================================

/// Plugin identity reported by a driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
    #[serde(default)]
    pub manifest: BTreeMap<String, String>,
}

/// Capability advertised by a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginCapability {
    ControllerService,
    AccessibilityConstraints,
    #[serde(other)]
    Unknown,
}

/// Capability of a driver's controller service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    GetCapacity,
    #[serde(other)]
    Unknown,
}

/// Volume creation request sent to a driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverVolumeRequest {
    pub name: String,
    pub required_bytes: i64,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Volume as reported by a driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverVolume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Identity service of a CSI driver
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn plugin_info(&self) -> Result<PluginInfo>;

    async fn plugin_capabilities(&self) -> Result<Vec<PluginCapability>>;

    /// Liveness probe; `true` when the driver is ready
    async fn probe(&self) -> Result<bool>;
}

/// Controller service of a CSI driver
#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn create_volume(&self, request: DriverVolumeRequest) -> Result<DriverVolume>;

    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    async fn controller_capabilities(&self) -> Result<Vec<ControllerCapability>>;
}

/// Established gRPC connection to a driver endpoint
#[derive(Debug, Clone)]
pub struct DriverChannel {
    /// Address the channel was dialed from
    pub address: String,
    /// HTTP/2 channel shared by the driver's identity and controller clients
    pub channel: tonic::transport::Channel,
}

/// Opens connections to driver endpoints
#[async_trait]
pub trait DriverConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<DriverChannel>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type BrokerStoreRef = Arc<dyn BrokerStore>;
pub type ClusterGatewayRef = Arc<dyn ClusterGateway>;
pub type DriverConnectorRef = Arc<dyn DriverConnector>;
pub type IdentityClientRef = Arc<dyn IdentityClient>;
pub type ControllerClientRef = Arc<dyn ControllerClient>;
