//! CSI Driver Clients
//!
//! No-op clients for offerings without a driver endpoint, and gRPC clients
//! for the CSI identity and controller services of a live driver.

use crate::domain::ports::{
    ControllerCapability, ControllerClient, DriverChannel, DriverConnector, DriverVolume,
    DriverVolumeRequest, IdentityClient, PluginCapability, PluginInfo,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, info};

/// Messages and clients generated from `proto/csi.proto`
#[allow(clippy::all, missing_docs)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}

use csi::controller_client::ControllerClient as CsiControllerClient;
use csi::identity_client::IdentityClient as CsiIdentityClient;

// =============================================================================
// No-op Clients
// =============================================================================

/// Identity client for drivers without a live control plane
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIdentityClient;

#[async_trait]
impl IdentityClient for NoopIdentityClient {
    async fn plugin_info(&self) -> Result<PluginInfo> {
        Ok(PluginInfo::default())
    }

    async fn plugin_capabilities(&self) -> Result<Vec<PluginCapability>> {
        Ok(Vec::new())
    }

    async fn probe(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Controller client for drivers without a live control plane
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopControllerClient;

#[async_trait]
impl ControllerClient for NoopControllerClient {
    async fn create_volume(&self, request: DriverVolumeRequest) -> Result<DriverVolume> {
        Ok(DriverVolume {
            volume_id: request.name,
            capacity_bytes: request.required_bytes,
            attributes: request.parameters,
        })
    }

    async fn delete_volume(&self, _volume_id: &str) -> Result<()> {
        Ok(())
    }

    async fn controller_capabilities(&self) -> Result<Vec<ControllerCapability>> {
        Ok(Vec::new())
    }
}

// =============================================================================
// gRPC Connector
// =============================================================================

/// Configuration for driver connections
#[derive(Debug, Clone)]
pub struct GrpcConnectorConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Per-call timeout
    pub request_timeout: Duration,
}

impl Default for GrpcConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens gRPC channels to CSI driver endpoints
#[derive(Debug, Clone, Default)]
pub struct GrpcConnector {
    config: GrpcConnectorConfig,
}

impl GrpcConnector {
    pub fn new(config: GrpcConnectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DriverConnector for GrpcConnector {
    async fn connect(&self, address: &str) -> Result<DriverChannel> {
        let endpoint = driver_endpoint(address)?
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout);
        debug!(address = %address, uri = %endpoint.uri(), "Dialing driver endpoint");

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| transport_error(address, e))?;

        info!(address = %address, "Driver connection established");
        Ok(DriverChannel {
            address: address.to_string(),
            channel,
        })
    }
}

/// Endpoint for a configured driver address
///
/// Addresses without a scheme are plain `host:port` endpoints.
pub fn driver_endpoint(address: &str) -> Result<Endpoint> {
    let address = address.trim();
    let uri = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };
    Endpoint::from_shared(uri).map_err(|e| transport_error(address, e))
}

fn transport_error(address: &str, err: impl std::error::Error) -> Error {
    let mut reason = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        reason.push_str(": ");
        reason.push_str(&cause.to_string());
        source = cause.source();
    }

    Error::Transport {
        address: address.to_string(),
        reason,
    }
}

fn status_error(address: &str, operation: &str, status: Status) -> Error {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded => Error::Transport {
            address: address.to_string(),
            reason: status.message().to_string(),
        },
        code => Error::BackendOperationFailed {
            operation: operation.to_string(),
            reason: format!("driver at {} answered {:?}: {}", address, code, status.message()),
        },
    }
}

// =============================================================================
// gRPC Clients
// =============================================================================

/// CSI identity service client
#[derive(Debug, Clone)]
pub struct GrpcIdentityClient {
    address: String,
    client: CsiIdentityClient<Channel>,
}

impl GrpcIdentityClient {
    pub fn new(channel: DriverChannel) -> Self {
        Self {
            client: CsiIdentityClient::new(channel.channel),
            address: channel.address,
        }
    }
}

#[async_trait]
impl IdentityClient for GrpcIdentityClient {
    async fn plugin_info(&self) -> Result<PluginInfo> {
        let info = self
            .client
            .clone()
            .get_plugin_info(csi::GetPluginInfoRequest {})
            .await
            .map_err(|s| status_error(&self.address, "plugin-info", s))?
            .into_inner();

        Ok(PluginInfo {
            name: info.name,
            vendor_version: info.vendor_version,
            manifest: info.manifest.into_iter().collect(),
        })
    }

    async fn plugin_capabilities(&self) -> Result<Vec<PluginCapability>> {
        let response = self
            .client
            .clone()
            .get_plugin_capabilities(csi::GetPluginCapabilitiesRequest {})
            .await
            .map_err(|s| status_error(&self.address, "plugin-capabilities", s))?
            .into_inner();

        Ok(response
            .capabilities
            .into_iter()
            .map(plugin_capability)
            .collect())
    }

    async fn probe(&self) -> Result<bool> {
        let response = self
            .client
            .clone()
            .probe(csi::ProbeRequest {})
            .await
            .map_err(|s| status_error(&self.address, "probe", s))?
            .into_inner();

        // An unset flag means the driver does not gate readiness
        Ok(response.ready.unwrap_or(true))
    }
}

/// CSI controller service client
#[derive(Debug, Clone)]
pub struct GrpcControllerClient {
    address: String,
    client: CsiControllerClient<Channel>,
}

impl GrpcControllerClient {
    pub fn new(channel: DriverChannel) -> Self {
        Self {
            client: CsiControllerClient::new(channel.channel),
            address: channel.address,
        }
    }
}

#[async_trait]
impl ControllerClient for GrpcControllerClient {
    async fn create_volume(&self, request: DriverVolumeRequest) -> Result<DriverVolume> {
        use csi::volume_capability::{access_mode::Mode, AccessMode, AccessType, MountVolume};

        let name = request.name.clone();
        let request = csi::CreateVolumeRequest {
            name: request.name,
            capacity_range: Some(csi::CapacityRange {
                required_bytes: request.required_bytes,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![csi::VolumeCapability {
                access_type: Some(AccessType::Mount(MountVolume::default())),
                access_mode: Some(AccessMode {
                    mode: Mode::MultiNodeMultiWriter as i32,
                }),
            }],
            parameters: request.parameters.into_iter().collect(),
            ..Default::default()
        };

        let volume = self
            .client
            .clone()
            .create_volume(request)
            .await
            .map_err(|s| status_error(&self.address, "create-volume", s))?
            .into_inner()
            .volume
            .ok_or_else(|| Error::BackendOperationFailed {
                operation: "create-volume".to_string(),
                reason: format!("driver at {} returned no volume for {}", self.address, name),
            })?;

        Ok(DriverVolume {
            volume_id: volume.volume_id,
            capacity_bytes: volume.capacity_bytes,
            attributes: volume.volume_context.into_iter().collect(),
        })
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let request = csi::DeleteVolumeRequest {
            volume_id: volume_id.to_string(),
            ..Default::default()
        };

        match self.client.clone().delete_volume(request).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => {
                debug!(volume_id = %volume_id, "Driver volume already gone");
                Ok(())
            }
            Err(status) => Err(status_error(&self.address, "delete-volume", status)),
        }
    }

    async fn controller_capabilities(&self) -> Result<Vec<ControllerCapability>> {
        let response = self
            .client
            .clone()
            .controller_get_capabilities(csi::ControllerGetCapabilitiesRequest {})
            .await
            .map_err(|s| status_error(&self.address, "controller-capabilities", s))?
            .into_inner();

        Ok(response
            .capabilities
            .into_iter()
            .map(controller_capability)
            .collect())
    }
}

fn plugin_capability(capability: csi::PluginCapability) -> PluginCapability {
    use csi::plugin_capability::{service, Type};

    match capability.r#type {
        Some(Type::Service(svc)) => match svc.r#type() {
            service::Type::ControllerService => PluginCapability::ControllerService,
            service::Type::VolumeAccessibilityConstraints => {
                PluginCapability::AccessibilityConstraints
            }
            _ => PluginCapability::Unknown,
        },
        _ => PluginCapability::Unknown,
    }
}

fn controller_capability(capability: csi::ControllerServiceCapability) -> ControllerCapability {
    use csi::controller_service_capability::{rpc, Type};

    match capability.r#type {
        Some(Type::Rpc(call)) => match call.r#type() {
            rpc::Type::CreateDeleteVolume => ControllerCapability::CreateDeleteVolume,
            rpc::Type::PublishUnpublishVolume => ControllerCapability::PublishUnpublishVolume,
            rpc::Type::ListVolumes => ControllerCapability::ListVolumes,
            rpc::Type::GetCapacity => ControllerCapability::GetCapacity,
            _ => ControllerCapability::Unknown,
        },
        None => ControllerCapability::Unknown,
    }
}
