//! Cluster Gateway
//!
//! Builds the PersistentVolume/PersistentVolumeClaim objects the broker
//! hands to the cluster, and the [`ClusterGateway`] adapter over the
//! `kube` client.

use crate::broker::request::{AccessMode, ValidatedVolume, ACCESS_READ_WRITE_MANY};
use crate::domain::ports::ClusterGateway;
use crate::domain::records::RESOURCE_STORAGE;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Label tying a claim's selector to its volume
pub const VOLUME_NAME_LABEL: &str = "name";

// =============================================================================
// Object Builders
// =============================================================================

/// PersistentVolume for a validated provision request
pub fn build_volume(volume: &ValidatedVolume, driver: &str, handle: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(volume.name.clone()),
            labels: Some(BTreeMap::from([(
                VOLUME_NAME_LABEL.to_string(),
                volume.name.clone(),
            )])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec![ACCESS_READ_WRITE_MANY.to_string()]),
            capacity: Some(BTreeMap::from([(
                RESOURCE_STORAGE.to_string(),
                volume.capacity.clone(),
            )])),
            csi: Some(CSIPersistentVolumeSource {
                driver: driver.to_string(),
                volume_handle: handle.to_string(),
                volume_attributes: Some(BTreeMap::from([
                    ("server".to_string(), volume.share.server.clone()),
                    ("share".to_string(), volume.share.share.clone()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Claim selecting the volume named `volume_name`
pub fn build_claim(
    volume_name: &str,
    access: AccessMode,
    capacity: Option<Quantity>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(volume_name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access.claim_access_mode().to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: capacity
                    .map(|quantity| BTreeMap::from([(RESOURCE_STORAGE.to_string(), quantity)])),
                ..Default::default()
            }),
            selector: Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: VOLUME_NAME_LABEL.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![volume_name.to_string()]),
                }]),
                match_labels: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Kube Gateway
// =============================================================================

/// [`ClusterGateway`] talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn create_volume(&self, volume: PersistentVolume) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let created = api.create(&PostParams::default(), &volume).await?;
        info!(volume = ?created.metadata.name, "PersistentVolume created");
        Ok(created)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(volume = %name, "PersistentVolume deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(volume = %name, "PersistentVolume already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let created = api.create(&PostParams::default(), &claim).await?;
        info!(
            namespace = %namespace,
            claim = ?created.metadata.name,
            "PersistentVolumeClaim created"
        );
        Ok(created)
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = %namespace, claim = %name, "PersistentVolumeClaim deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(namespace = %namespace, claim = %name, "PersistentVolumeClaim already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
