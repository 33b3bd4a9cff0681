//! Resource Lifecycle Controller
//!
//! Drives provision, deprovision, bind and unbind against the cluster and
//! keeps the state store consistent with what was created there:
//! - Conflicting re-requests for an instance or binding id are rejected
//! - A cluster object created by a step whose bookkeeping then fails is
//!   deleted again before the error is returned
//! - Store mutation and flush never interleave between operations

use crate::broker::gateway::{build_claim, build_volume};
use crate::broker::request::{BindParameters, VolumeRequest};
use crate::catalog::{CatalogService, ServicesRegistry};
use crate::domain::ports::{BrokerStoreRef, ClusterGatewayRef};
use crate::domain::records::{
    BindDetails, Binding, DeprovisionDetails, DeprovisionServiceSpec, InstanceRecord,
    LastOperation, ProvisionDetails, ProvisionedServiceSpec, SharedDevice, UnbindDetails,
    UpdateDetails, UpdateServiceSpec, VolumeFingerprint, VolumeMount,
};
use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Volume driver reported in every volume mount
pub const VOLUME_MOUNT_DRIVER: &str = "csi";

/// Device type reported in every volume mount
pub const DEVICE_TYPE_SHARED: &str = "shared";

/// Operation token returned by deprovision
pub const OPERATION_DEPROVISION: &str = "deprovision";

// =============================================================================
// Broker Configuration
// =============================================================================

/// Configuration for the broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Namespace claims are created in
    pub namespace: String,
    /// Base of the container path when a binding names no mount
    pub default_container_path: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            namespace: "opi".to_string(),
            default_container_path: "/var/vcap/data".to_string(),
        }
    }
}

/// Claim created by a bind that still awaits the state flush
struct BoundClaim {
    claim_name: String,
    params: BindParameters,
    /// Binding record replaced by this bind
    previous: Option<BindDetails>,
}

// =============================================================================
// Broker
// =============================================================================

/// Lifecycle controller shared by all request handlers
pub struct Broker {
    config: BrokerConfig,
    store: BrokerStoreRef,
    gateway: ClusterGatewayRef,
    registry: Arc<ServicesRegistry>,
    /// Serializes conflict check, store write and flush
    lock: Mutex<()>,
}

impl Broker {
    /// Create a broker, restoring the store's last snapshot first
    pub async fn new(
        config: BrokerConfig,
        store: BrokerStoreRef,
        gateway: ClusterGatewayRef,
        registry: Arc<ServicesRegistry>,
    ) -> Result<Arc<Self>> {
        store.restore().await.map_err(|e| {
            error!("Failed to restore broker state: {}", e);
            e
        })?;

        info!(namespace = %config.namespace, "Broker initialized");

        Ok(Arc::new(Self {
            config,
            store,
            gateway,
            registry,
            lock: Mutex::new(()),
        }))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Marketplace catalog
    pub fn services(&self) -> Vec<CatalogService> {
        self.registry.broker_services()
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Create the cluster volume described by the provision parameters and
    /// record it under `instance_id`
    #[instrument(skip(self, details), fields(service_id = %details.service_id))]
    pub async fn provision(
        &self,
        instance_id: &str,
        details: ProvisionDetails,
        _async_allowed: bool,
    ) -> Result<ProvisionedServiceSpec> {
        info!("Provisioning service instance");

        let volume = VolumeRequest::parse(details.parameters.as_ref())?.validate()?;
        let handle = Uuid::new_v4().to_string();
        let driver = self.registry.driver_name(&details.service_id)?;

        let created = self
            .gateway
            .create_volume(build_volume(&volume, &driver, &handle))
            .await
            .map_err(|e| {
                error!(volume = %volume.name, "Failed to create volume: {}", e);
                e
            })?;
        debug!(volume = %volume.name, handle = %handle, "Volume created");

        let record = InstanceRecord {
            service_id: details.service_id,
            plan_id: details.plan_id,
            organization_guid: details.organization_guid,
            space_guid: details.space_guid,
            fingerprint: VolumeFingerprint::new(volume.name.clone(), created).into(),
        };

        let persisted = {
            let _guard = self.lock.lock().await;
            self.persist_instance(instance_id, record).await
        };

        if let Err(e) = persisted {
            if self.recorded_volume(instance_id).await.as_deref() == Some(volume.name.as_str()) {
                warn!(volume = %volume.name, "Provisioning failed, volume belongs to the recorded instance: {}", e);
            } else {
                warn!(volume = %volume.name, "Provisioning failed, deleting volume: {}", e);
                self.compensate_volume(&volume.name).await;
            }
            return Err(e);
        }

        info!(volume = %volume.name, "Service instance provisioned");
        Ok(ProvisionedServiceSpec {
            is_async: false,
            ..Default::default()
        })
    }

    /// Delete the instance's cluster volume and forget the instance
    #[instrument(skip(self, _details))]
    pub async fn deprovision(
        &self,
        instance_id: &str,
        _details: DeprovisionDetails,
        _async_allowed: bool,
    ) -> Result<DeprovisionServiceSpec> {
        if instance_id.is_empty() {
            return Err(Error::Validation(
                "volume deletion requires instance ID".to_string(),
            ));
        }

        info!("Deprovisioning service instance");

        let record = self.instance_record(instance_id).await?;
        let fingerprint = record.fingerprint.decode()?;

        self.gateway
            .delete_volume(fingerprint.volume_name())
            .await
            .map_err(|e| {
                error!(volume = %fingerprint.volume_name(), "Failed to delete volume: {}", e);
                e
            })?;

        {
            let _guard = self.lock.lock().await;
            let deleted = self.store.delete_instance_details(instance_id).await;
            let saved = self.store.save().await;
            deleted.and(saved)?;
        }

        info!(volume = %fingerprint.volume_name(), "Service instance deprovisioned");
        Ok(DeprovisionServiceSpec {
            is_async: false,
            operation_data: Some(OPERATION_DEPROVISION.to_string()),
        })
    }

    /// Update in place is not offered by this broker
    pub async fn update(
        &self,
        instance_id: &str,
        _details: UpdateDetails,
        _async_allowed: bool,
    ) -> Result<UpdateServiceSpec> {
        warn!(instance_id = %instance_id, "Rejecting update request");
        Err(Error::Unsupported {
            operation: "update".to_string(),
        })
    }

    /// Every operation completes synchronously, so there is never state
    pub async fn last_operation(
        &self,
        instance_id: &str,
        operation_data: Option<&str>,
    ) -> Result<LastOperation> {
        debug!(instance_id = %instance_id, operation = ?operation_data, "Last operation polled");
        Ok(LastOperation::default())
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    /// Create a claim on the instance's volume and hand back its mount
    #[instrument(skip(self, details))]
    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        details: BindDetails,
    ) -> Result<Binding> {
        let _guard = self.lock.lock().await;
        info!("Binding service instance");

        let bound = self.bind_claim(instance_id, binding_id, details).await;
        let saved = self.store.save().await;

        let bound = match (bound, saved) {
            (Err(e), saved) => {
                if let Err(save_err) = saved {
                    warn!("Failed to save broker state after failed bind: {}", save_err);
                }
                return Err(e);
            }
            (Ok(bound), Err(e)) => {
                warn!(claim = %bound.claim_name, "Saving binding failed, deleting claim: {}", e);
                self.rollback_binding(binding_id, bound.previous).await;
                self.compensate_claim(&bound.claim_name).await;
                return Err(e);
            }
            (Ok(bound), Ok(())) => bound,
        };

        let claim_name = bound.claim_name;
        let mount_config = Map::from_iter([("name".to_string(), Value::String(claim_name.clone()))]);

        info!(claim = %claim_name, mode = bound.params.access.mount_mode(), "Service instance bound");
        Ok(Binding {
            credentials: Value::Object(Map::new()),
            volume_mounts: vec![VolumeMount {
                driver: VOLUME_MOUNT_DRIVER.to_string(),
                container_dir: bound
                    .params
                    .container_dir(&self.config.default_container_path, instance_id),
                mode: bound.params.access.mount_mode().to_string(),
                device_type: DEVICE_TYPE_SHARED.to_string(),
                device: SharedDevice {
                    volume_id: format!("{}-volume", instance_id),
                    mount_config,
                },
            }],
        })
    }

    /// Delete the binding's claim and forget the binding
    #[instrument(skip(self, _details))]
    pub async fn unbind(
        &self,
        instance_id: &str,
        binding_id: &str,
        _details: UnbindDetails,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        info!("Unbinding service instance");

        let unbound = self.unbind_claim(instance_id, binding_id).await;
        let saved = self.store.save().await;

        let claim_name = match (unbound, saved) {
            (Err(e), saved) => {
                if let Err(save_err) = saved {
                    warn!("Failed to save broker state after failed unbind: {}", save_err);
                }
                return Err(e);
            }
            (Ok(_), Err(e)) => return Err(e),
            (Ok(claim_name), Ok(())) => claim_name,
        };

        info!(claim = %claim_name, "Service instance unbound");
        Ok(())
    }

    /// Claim creation and binding write; caller holds the lock and saves
    async fn bind_claim(
        &self,
        instance_id: &str,
        binding_id: &str,
        details: BindDetails,
    ) -> Result<BoundClaim> {
        let record = self.instance_record(instance_id).await?;
        let fingerprint = record.fingerprint.decode()?;

        let params = BindParameters::parse_map(details.parameters.as_ref())?;

        if self.store.is_binding_conflict(binding_id, &details).await {
            return Err(Error::BindingAlreadyExists {
                binding_id: binding_id.to_string(),
            });
        }

        let params = BindParameters::from_map(&params)?;
        let claim_name = fingerprint.volume_name().to_string();

        self.gateway
            .create_claim(
                &self.config.namespace,
                build_claim(&claim_name, params.access, fingerprint.capacity().cloned()),
            )
            .await
            .map_err(|e| {
                error!(claim = %claim_name, "Failed to create claim: {}", e);
                e
            })?;

        let previous = match self.write_binding(binding_id, details).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(claim = %claim_name, "Binding failed, deleting claim: {}", e);
                self.compensate_claim(&claim_name).await;
                return Err(e);
            }
        };

        Ok(BoundClaim {
            claim_name,
            params,
            previous,
        })
    }

    /// Claim deletion and binding removal; caller holds the lock and saves
    async fn unbind_claim(&self, instance_id: &str, binding_id: &str) -> Result<String> {
        let record = self.instance_record(instance_id).await?;
        let fingerprint = record.fingerprint.decode()?;

        if self.store.retrieve_binding_details(binding_id).await?.is_none() {
            return Err(Error::BindingDoesNotExist {
                binding_id: binding_id.to_string(),
            });
        }

        let claim_name = fingerprint.volume_name().to_string();
        self.gateway
            .delete_claim(&self.config.namespace, &claim_name)
            .await
            .map_err(|e| {
                error!(claim = %claim_name, "Failed to delete claim: {}", e);
                e
            })?;

        self.store.delete_binding_details(binding_id).await?;
        Ok(claim_name)
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Probe the driver of every offering
    pub async fn drivers_health(&self) -> BTreeMap<String, bool> {
        let probes = self.registry.service_ids().into_iter().map(|service_id| async move {
            let healthy = match self.registry.identity_client(&service_id).await {
                Ok(client) => match client.probe().await {
                    Ok(ready) => ready,
                    Err(e) => {
                        warn!(service_id = %service_id, "Driver probe failed: {}", e);
                        false
                    }
                },
                Err(e) => {
                    warn!(service_id = %service_id, "Driver unreachable: {}", e);
                    false
                }
            };
            (service_id, healthy)
        });

        futures::future::join_all(probes).await.into_iter().collect()
    }

    // =========================================================================
    // Store Helpers
    // =========================================================================

    async fn instance_record(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.store
            .retrieve_instance_details(instance_id)
            .await?
            .ok_or_else(|| Error::InstanceDoesNotExist {
                instance_id: instance_id.to_string(),
            })
    }

    /// Conflict check, write and flush; caller holds the lock
    async fn persist_instance(&self, instance_id: &str, record: InstanceRecord) -> Result<()> {
        let previous = self.store.retrieve_instance_details(instance_id).await?;

        let written = if self.store.is_instance_conflict(instance_id, &record).await {
            Err(Error::InstanceAlreadyExists {
                instance_id: instance_id.to_string(),
            })
        } else {
            self.store.create_instance_details(instance_id, record).await
        };
        let saved = self.store.save().await;

        written?;
        if let Err(e) = saved {
            let rollback = match previous {
                Some(previous) => self.store.create_instance_details(instance_id, previous).await,
                None => self.store.delete_instance_details(instance_id).await,
            };
            if let Err(rollback_err) = rollback {
                error!(instance_id = %instance_id, "Failed to roll back instance record: {}", rollback_err);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Write a binding record, returning the one it replaced
    async fn write_binding(
        &self,
        binding_id: &str,
        details: BindDetails,
    ) -> Result<Option<BindDetails>> {
        let previous = self.store.retrieve_binding_details(binding_id).await?;
        self.store.create_binding_details(binding_id, details).await?;
        Ok(previous)
    }

    async fn rollback_binding(&self, binding_id: &str, previous: Option<BindDetails>) {
        let rollback = match previous {
            Some(previous) => self.store.create_binding_details(binding_id, previous).await,
            None => self.store.delete_binding_details(binding_id).await,
        };
        if let Err(e) = rollback {
            error!(binding_id = %binding_id, "Failed to roll back binding record: {}", e);
        }
    }

    /// Volume name recorded for the instance, if any
    async fn recorded_volume(&self, instance_id: &str) -> Option<String> {
        let record = self.store.retrieve_instance_details(instance_id).await.ok()??;
        let fingerprint = record.fingerprint.decode().ok()?;
        Some(fingerprint.volume_name().to_string())
    }

    async fn compensate_volume(&self, name: &str) {
        if let Err(e) = self.gateway.delete_volume(name).await {
            error!(volume = %name, "Failed to delete volume during rollback: {}", e);
        }
    }

    async fn compensate_claim(&self, name: &str) {
        if let Err(e) = self.gateway.delete_claim(&self.config.namespace, name).await {
            error!(claim = %name, "Failed to delete claim during rollback: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::registry::tests::{offering, CountingConnector};
    use crate::domain::ports::{BrokerStore, ClusterGateway};
    use crate::domain::records::{BindingRecord, StoredFingerprint};
    use crate::store::{SnapshotStore, StoreBackend};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // =========================================================================
    // Fakes
    // =========================================================================

    fn failure(operation: &str) -> Error {
        Error::BackendOperationFailed {
            operation: operation.to_string(),
            reason: "injected".to_string(),
        }
    }

    /// Gateway keeping created objects in memory
    #[derive(Default)]
    pub(crate) struct RecordingGateway {
        pub volumes: SyncMutex<BTreeMap<String, PersistentVolume>>,
        pub claims: SyncMutex<BTreeMap<String, PersistentVolumeClaim>>,
        pub deleted_volumes: SyncMutex<Vec<String>>,
        pub deleted_claims: SyncMutex<Vec<String>>,
        pub fail_create_volume: AtomicBool,
        pub fail_delete_volume: AtomicBool,
        pub fail_create_claim: AtomicBool,
        pub fail_delete_claim: AtomicBool,
    }

    #[async_trait]
    impl ClusterGateway for RecordingGateway {
        async fn create_volume(&self, volume: PersistentVolume) -> Result<PersistentVolume> {
            if self.fail_create_volume.load(Ordering::SeqCst) {
                return Err(failure("create-volume"));
            }
            let name = volume.metadata.name.clone().unwrap_or_default();
            self.volumes.lock().insert(name, volume.clone());
            Ok(volume)
        }

        async fn delete_volume(&self, name: &str) -> Result<()> {
            if self.fail_delete_volume.load(Ordering::SeqCst) {
                return Err(failure("delete-volume"));
            }
            self.volumes.lock().remove(name);
            self.deleted_volumes.lock().push(name.to_string());
            Ok(())
        }

        async fn create_claim(
            &self,
            namespace: &str,
            claim: PersistentVolumeClaim,
        ) -> Result<PersistentVolumeClaim> {
            if self.fail_create_claim.load(Ordering::SeqCst) {
                return Err(failure("create-claim"));
            }
            let name = claim.metadata.name.clone().unwrap_or_default();
            self.claims
                .lock()
                .insert(format!("{}/{}", namespace, name), claim.clone());
            Ok(claim)
        }

        async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
            if self.fail_delete_claim.load(Ordering::SeqCst) {
                return Err(failure("delete-claim"));
            }
            let key = format!("{}/{}", namespace, name);
            self.claims.lock().remove(&key);
            self.deleted_claims.lock().push(key);
            Ok(())
        }
    }

    /// Store wrapper with injectable write/flush failures
    #[derive(Default)]
    struct FlakyStore {
        inner: SnapshotStore,
        fail_create_instance: AtomicBool,
        fail_create_binding: AtomicBool,
        fail_save: AtomicBool,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl BrokerStore for FlakyStore {
        async fn restore(&self) -> Result<()> {
            self.inner.restore().await
        }

        async fn save(&self) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_save.load(Ordering::SeqCst) {
                return Err(Error::Persistence("injected".into()));
            }
            self.inner.save().await
        }

        async fn create_instance_details(&self, id: &str, record: InstanceRecord) -> Result<()> {
            if self.fail_create_instance.load(Ordering::SeqCst) {
                return Err(Error::Persistence("injected".into()));
            }
            self.inner.create_instance_details(id, record).await
        }

        async fn retrieve_instance_details(&self, id: &str) -> Result<Option<InstanceRecord>> {
            self.inner.retrieve_instance_details(id).await
        }

        async fn delete_instance_details(&self, id: &str) -> Result<()> {
            self.inner.delete_instance_details(id).await
        }

        async fn is_instance_conflict(&self, id: &str, record: &InstanceRecord) -> bool {
            self.inner.is_instance_conflict(id, record).await
        }

        async fn create_binding_details(&self, id: &str, record: BindingRecord) -> Result<()> {
            if self.fail_create_binding.load(Ordering::SeqCst) {
                return Err(Error::Persistence("injected".into()));
            }
            self.inner.create_binding_details(id, record).await
        }

        async fn retrieve_binding_details(&self, id: &str) -> Result<Option<BindingRecord>> {
            self.inner.retrieve_binding_details(id).await
        }

        async fn delete_binding_details(&self, id: &str) -> Result<()> {
            self.inner.delete_binding_details(id).await
        }

        async fn is_binding_conflict(&self, id: &str, record: &BindingRecord) -> bool {
            self.inner.is_binding_conflict(id, record).await
        }
    }

    struct Fixture {
        broker: Arc<Broker>,
        gateway: Arc<RecordingGateway>,
        store: Arc<FlakyStore>,
    }

    fn registry() -> Arc<ServicesRegistry> {
        Arc::new(
            ServicesRegistry::new(
                Arc::new(CountingConnector::default()),
                vec![offering("ServiceOne", "")],
            )
            .unwrap(),
        )
    }

    async fn fixture() -> Fixture {
        let gateway = Arc::new(RecordingGateway::default());
        let store = Arc::new(FlakyStore::default());
        let broker = Broker::new(
            BrokerConfig::default(),
            store.clone(),
            gateway.clone(),
            registry(),
        )
        .await
        .unwrap();

        Fixture {
            broker,
            gateway,
            store,
        }
    }

    fn provision_details(name: &str, plan_id: &str) -> ProvisionDetails {
        ProvisionDetails {
            service_id: "ServiceOne".into(),
            plan_id: plan_id.into(),
            organization_guid: "org".into(),
            space_guid: "space".into(),
            parameters: Some(json!({
                "name": name,
                "capacity_range": {"requiredBytes": "2"},
                "parameters": {"server": "10.0.0.5", "share": "/export/x"}
            })),
        }
    }

    fn bind_details(parameters: Value) -> BindDetails {
        BindDetails {
            app_guid: Some("app".into()),
            plan_id: "plan".into(),
            service_id: "ServiceOne".into(),
            bind_resource: None,
            parameters: Some(parameters),
        }
    }

    // =========================================================================
    // Provision
    // =========================================================================

    #[tokio::test]
    async fn test_provision_creates_volume_and_record() {
        let f = fixture().await;

        let spec = f
            .broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        assert!(!spec.is_async);

        let volumes = f.gateway.volumes.lock();
        let pv = &volumes["k8s-volume"];
        let csi = pv.spec.as_ref().unwrap().csi.as_ref().unwrap();
        assert_eq!(csi.driver, "ServiceOne-driver");
        assert!(Uuid::parse_str(&csi.volume_handle).is_ok());

        assert_eq!(f.store.inner.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_provision_identical_request_is_not_a_conflict() {
        let f = fixture().await;

        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();

        assert_eq!(f.store.inner.instance_count(), 1);
        assert!(f.gateway.deleted_volumes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_provision_conflict_keeps_first_record() {
        let f = fixture().await;

        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        let result = f
            .broker
            .provision("i1", provision_details("other-volume", "other-plan"), false)
            .await;

        assert_matches!(result, Err(Error::InstanceAlreadyExists { instance_id }) if instance_id == "i1");
        assert_eq!(*f.gateway.deleted_volumes.lock(), vec!["other-volume".to_string()]);
        assert!(f.gateway.volumes.lock().contains_key("k8s-volume"));

        let record = f.store.retrieve_instance_details("i1").await.unwrap().unwrap();
        assert_eq!(record.plan_id, "plan");
        assert_eq!(record.fingerprint.decode().unwrap().name, "k8s-volume");
    }

    #[tokio::test]
    async fn test_provision_conflicting_volume_details_keep_first_record() {
        let f = fixture().await;

        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();

        let mut details = provision_details("k8s-volume", "plan");
        details.parameters = Some(json!({
            "name": "k8s-volume",
            "capacity_range": {"requiredBytes": "5Gi"},
            "parameters": {"server": "10.0.0.5", "share": "/export/other"}
        }));
        let result = f.broker.provision("i1", details, false).await;
        assert_matches!(result, Err(Error::InstanceAlreadyExists { instance_id }) if instance_id == "i1");

        let record = f.store.retrieve_instance_details("i1").await.unwrap().unwrap();
        let fingerprint = record.fingerprint.decode().unwrap();
        assert_eq!(fingerprint.capacity(), Some(&Quantity("2".into())));
        let attributes = fingerprint
            .volume
            .spec
            .as_ref()
            .and_then(|spec| spec.csi.as_ref())
            .and_then(|csi| csi.volume_attributes.clone())
            .unwrap();
        assert_eq!(attributes["share"], "/export/x");

        // The volume name is the recorded instance's, so it is left alone
        assert!(f.gateway.deleted_volumes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_conflicting_provisions() {
        let f = fixture().await;

        let (first, second) = tokio::join!(
            f.broker.provision("i1", provision_details("vol-a", "plan-a"), false),
            f.broker.provision("i1", provision_details("vol-b", "plan-b"), false),
        );

        assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
        assert_eq!(f.store.inner.instance_count(), 1);
        assert_eq!(f.gateway.volumes.lock().len(), 1);
        assert_eq!(f.gateway.deleted_volumes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_provision_store_failure_deletes_volume() {
        let f = fixture().await;
        f.store.fail_create_instance.store(true, Ordering::SeqCst);

        let result = f
            .broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await;

        assert_matches!(result, Err(Error::Persistence(_)));
        assert!(f.gateway.volumes.lock().is_empty());
        assert_eq!(*f.gateway.deleted_volumes.lock(), vec!["k8s-volume".to_string()]);
    }

    #[tokio::test]
    async fn test_provision_save_failure_rolls_back() {
        let f = fixture().await;
        f.store.fail_save.store(true, Ordering::SeqCst);

        let result = f
            .broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await;

        assert_matches!(result, Err(Error::Persistence(_)));
        assert!(f.gateway.volumes.lock().is_empty());
        assert_eq!(f.store.inner.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_provision_compensation_failure_keeps_original_error() {
        let f = fixture().await;
        f.store.fail_create_instance.store(true, Ordering::SeqCst);
        f.gateway.fail_delete_volume.store(true, Ordering::SeqCst);

        let result = f
            .broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await;

        assert_matches!(result, Err(Error::Persistence(_)));
    }

    #[tokio::test]
    async fn test_provision_rejects_incomplete_parameters() {
        let f = fixture().await;

        let mut details = provision_details("v", "plan");
        details.parameters = Some(json!({
            "name": "v",
            "capacity_range": {"requiredBytes": 2},
            "parameters": {"server": "10.0.0.5"}
        }));
        let err = f.broker.provision("i1", details, false).await.unwrap_err();
        assert_eq!(err.to_string(), "config requires a \"share\"");

        let mut details = provision_details("v", "plan");
        details.parameters = None;
        let err = f.broker.provision("i1", details, false).await.unwrap_err();
        assert_eq!(err.to_string(), "config requires a \"name\"");

        assert!(f.gateway.volumes.lock().is_empty());
        assert_eq!(f.store.inner.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_provision_unknown_service() {
        let f = fixture().await;

        let mut details = provision_details("v", "plan");
        details.service_id = "missing".into();

        assert_matches!(
            f.broker.provision("i1", details, false).await,
            Err(Error::ServiceNotFound { .. })
        );
        assert!(f.gateway.volumes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_provision_gateway_failure_persists_nothing() {
        let f = fixture().await;
        f.gateway.fail_create_volume.store(true, Ordering::SeqCst);

        assert_matches!(
            f.broker
                .provision("i1", provision_details("v", "plan"), false)
                .await,
            Err(Error::BackendOperationFailed { .. })
        );
        assert_eq!(f.store.inner.instance_count(), 0);
    }

    // =========================================================================
    // Deprovision
    // =========================================================================

    #[tokio::test]
    async fn test_deprovision_requires_instance_id() {
        let f = fixture().await;
        let err = f
            .broker
            .deprovision("", DeprovisionDetails::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "volume deletion requires instance ID");
    }

    #[tokio::test]
    async fn test_deprovision_gateway_failure_keeps_record() {
        let f = fixture().await;
        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        f.gateway.fail_delete_volume.store(true, Ordering::SeqCst);

        assert!(f
            .broker
            .deprovision("i1", DeprovisionDetails::default(), false)
            .await
            .is_err());
        assert_eq!(f.store.inner.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_fingerprint() {
        let f = fixture().await;
        f.store
            .create_instance_details(
                "i1",
                InstanceRecord {
                    service_id: "ServiceOne".into(),
                    plan_id: "plan".into(),
                    organization_guid: "org".into(),
                    space_guid: "space".into(),
                    fingerprint: StoredFingerprint::Document(json!("invalid-json")),
                },
            )
            .await
            .unwrap();

        assert_matches!(
            f.broker
                .deprovision("i1", DeprovisionDetails::default(), false)
                .await,
            Err(Error::FingerprintDecode(_))
        );
        assert_matches!(
            f.broker.bind("i1", "b1", bind_details(json!({}))).await,
            Err(Error::FingerprintDecode(_))
        );
        assert!(f.gateway.deleted_volumes.lock().is_empty());
        assert!(f.gateway.claims.lock().is_empty());
    }

    // =========================================================================
    // Bind / Unbind
    // =========================================================================

    #[tokio::test]
    async fn test_bind_claim_follows_fingerprint() {
        let f = fixture().await;
        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();

        let binding = f
            .broker
            .bind("i1", "b1", bind_details(json!({"readonly": true})))
            .await
            .unwrap();
        assert_eq!(binding.volume_mounts[0].mode, "r");

        let claims = f.gateway.claims.lock();
        let spec = claims["opi/k8s-volume"].spec.as_ref().unwrap();
        assert_eq!(spec.access_modes.as_deref(), Some(&["ReadOnlyMany".to_string()][..]));
        assert_eq!(
            spec.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"],
            Quantity("2".into())
        );
    }

    #[tokio::test]
    async fn test_bind_custom_mount() {
        let f = fixture().await;
        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();

        let binding = f
            .broker
            .bind(
                "i1",
                "b1",
                bind_details(json!({"mount": "/var/vcap/otherdir/something"})),
            )
            .await
            .unwrap();

        let mount = &binding.volume_mounts[0];
        assert_eq!(mount.container_dir, "/var/vcap/otherdir/something");
        assert_eq!(mount.mode, "rw");
    }

    #[tokio::test]
    async fn test_bind_errors() {
        let f = fixture().await;

        assert_matches!(
            f.broker.bind("missing", "b1", bind_details(json!({}))).await,
            Err(Error::InstanceDoesNotExist { .. })
        );

        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();

        assert_matches!(
            f.broker.bind("i1", "b1", bind_details(json!("nope"))).await,
            Err(Error::InvalidRequest(_))
        );
        assert_matches!(
            f.broker
                .bind("i1", "b1", bind_details(json!({"readonly": "yes"})))
                .await,
            Err(Error::InvalidRequest(_))
        );

        f.broker.bind("i1", "b1", bind_details(json!({}))).await.unwrap();
        assert_matches!(
            f.broker
                .bind("i1", "b1", bind_details(json!({"readonly": true})))
                .await,
            Err(Error::BindingAlreadyExists { binding_id }) if binding_id == "b1"
        );
    }

    #[tokio::test]
    async fn test_bind_claim_failure_persists_nothing() {
        let f = fixture().await;
        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        f.gateway.fail_create_claim.store(true, Ordering::SeqCst);

        assert!(f.broker.bind("i1", "b1", bind_details(json!({}))).await.is_err());
        assert_eq!(f.store.inner.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_store_failure_deletes_claim() {
        let f = fixture().await;
        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        f.store.fail_create_binding.store(true, Ordering::SeqCst);

        assert_matches!(
            f.broker.bind("i1", "b1", bind_details(json!({}))).await,
            Err(Error::Persistence(_))
        );
        assert!(f.gateway.claims.lock().is_empty());
        assert_eq!(
            *f.gateway.deleted_claims.lock(),
            vec!["opi/k8s-volume".to_string()]
        );
    }

    #[tokio::test]
    async fn test_bind_save_failure_rolls_back() {
        let f = fixture().await;
        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        f.store.fail_save.store(true, Ordering::SeqCst);

        assert_matches!(
            f.broker.bind("i1", "b1", bind_details(json!({}))).await,
            Err(Error::Persistence(_))
        );
        assert!(f.gateway.claims.lock().is_empty());
        assert_eq!(f.store.inner.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_unbind_errors() {
        let f = fixture().await;

        assert_matches!(
            f.broker.unbind("i1", "b1", UnbindDetails::default()).await,
            Err(Error::InstanceDoesNotExist { .. })
        );

        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        assert_matches!(
            f.broker.unbind("i1", "b1", UnbindDetails::default()).await,
            Err(Error::BindingDoesNotExist { binding_id }) if binding_id == "b1"
        );
        assert!(f.gateway.deleted_claims.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unbind_gateway_failure_keeps_binding() {
        let f = fixture().await;
        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        f.broker.bind("i1", "b1", bind_details(json!({}))).await.unwrap();
        f.gateway.fail_delete_claim.store(true, Ordering::SeqCst);

        assert!(f
            .broker
            .unbind("i1", "b1", UnbindDetails::default())
            .await
            .is_err());
        assert_eq!(f.store.inner.binding_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_and_unbind_always_save() {
        let f = fixture().await;
        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        f.broker.bind("i1", "b1", bind_details(json!({}))).await.unwrap();

        let saves = || f.store.saves.load(Ordering::SeqCst);
        let before = saves();

        assert_matches!(
            f.broker.unbind("missing", "b1", UnbindDetails::default()).await,
            Err(Error::InstanceDoesNotExist { .. })
        );
        assert_eq!(saves(), before + 1);

        f.gateway.fail_delete_claim.store(true, Ordering::SeqCst);
        assert_matches!(
            f.broker.unbind("i1", "b1", UnbindDetails::default()).await,
            Err(Error::BackendOperationFailed { .. })
        );
        assert_eq!(saves(), before + 2);

        f.gateway.fail_create_claim.store(true, Ordering::SeqCst);
        assert_matches!(
            f.broker.bind("i1", "b2", bind_details(json!({}))).await,
            Err(Error::BackendOperationFailed { .. })
        );
        assert_eq!(saves(), before + 3);

        assert_matches!(
            f.broker.bind("i1", "b1", bind_details(json!({"readonly": true}))).await,
            Err(Error::BindingAlreadyExists { .. })
        );
        assert_eq!(saves(), before + 4);
    }

    #[tokio::test]
    async fn test_failed_bind_keeps_first_error_when_save_fails() {
        let f = fixture().await;
        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        f.gateway.fail_create_claim.store(true, Ordering::SeqCst);
        f.store.fail_save.store(true, Ordering::SeqCst);

        assert_matches!(
            f.broker.bind("i1", "b1", bind_details(json!({}))).await,
            Err(Error::BackendOperationFailed { .. })
        );
        assert_eq!(f.store.inner.binding_count(), 0);
    }

    // =========================================================================
    // Other Operations
    // =========================================================================

    #[tokio::test]
    async fn test_update_is_unsupported() {
        let f = fixture().await;
        assert_matches!(
            f.broker.update("i1", UpdateDetails::default(), false).await,
            Err(Error::Unsupported { operation }) if operation == "update"
        );
    }

    #[tokio::test]
    async fn test_last_operation_is_empty() {
        let f = fixture().await;
        let op = f.broker.last_operation("i1", None).await.unwrap();
        assert_eq!(op, LastOperation::default());
    }

    #[tokio::test]
    async fn test_services_come_from_registry() {
        let f = fixture().await;
        let services = f.broker.services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "ServiceOne");
    }

    #[tokio::test]
    async fn test_drivers_health() {
        let connector = Arc::new(CountingConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let registry = Arc::new(
            ServicesRegistry::new(
                connector,
                vec![
                    offering("ServiceOne", "127.0.0.1:50051"),
                    offering("ServiceTwo", ""),
                ],
            )
            .unwrap(),
        );
        let broker = Broker::new(
            BrokerConfig::default(),
            Arc::new(SnapshotStore::in_memory()),
            Arc::new(RecordingGateway::default()),
            registry,
        )
        .await
        .unwrap();

        let health = broker.drivers_health().await;
        assert_eq!(health["ServiceOne"], false);
        assert_eq!(health["ServiceTwo"], true);
    }

    #[tokio::test]
    async fn test_restored_records_drive_bind() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StoreBackend::in_data_dir(dir.path());

        {
            let broker = Broker::new(
                BrokerConfig::default(),
                Arc::new(SnapshotStore::new(backend.clone())),
                Arc::new(RecordingGateway::default()),
                registry(),
            )
            .await
            .unwrap();
            broker
                .provision("i1", provision_details("k8s-volume", "plan"), false)
                .await
                .unwrap();
        }

        let gateway = Arc::new(RecordingGateway::default());
        let broker = Broker::new(
            BrokerConfig::default(),
            Arc::new(SnapshotStore::new(backend)),
            gateway.clone(),
            registry(),
        )
        .await
        .unwrap();

        broker.bind("i1", "b1", bind_details(json!({}))).await.unwrap();
        let claims = gateway.claims.lock();
        let spec = claims["opi/k8s-volume"].spec.as_ref().unwrap();
        assert_eq!(
            spec.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"],
            Quantity("2".into())
        );
    }

    // =========================================================================
    // Full Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_full_lifecycle() {
        let f = fixture().await;

        f.broker
            .provision("i1", provision_details("k8s-volume", "plan"), false)
            .await
            .unwrap();
        assert_eq!(f.gateway.volumes.lock().len(), 1);
        assert!(f.store.retrieve_instance_details("i1").await.unwrap().is_some());

        let binding = f.broker.bind("i1", "b1", bind_details(json!({}))).await.unwrap();
        assert_eq!(binding.credentials, json!({}));
        let mount = &binding.volume_mounts[0];
        assert_eq!(mount.driver, "csi");
        assert_eq!(mount.device_type, "shared");
        assert_eq!(mount.mode, "rw");
        assert_eq!(mount.container_dir, "/var/vcap/data/i1");
        assert_eq!(mount.device.volume_id, "i1-volume");
        assert_eq!(mount.device.mount_config["name"], "k8s-volume");
        assert!(f.gateway.claims.lock().contains_key("opi/k8s-volume"));

        f.broker
            .unbind("i1", "b1", UnbindDetails::default())
            .await
            .unwrap();
        assert!(f.gateway.claims.lock().is_empty());
        assert_eq!(f.store.inner.binding_count(), 0);

        let spec = f
            .broker
            .deprovision("i1", DeprovisionDetails::default(), false)
            .await
            .unwrap();
        assert_eq!(spec.operation_data.as_deref(), Some("deprovision"));
        assert!(f.gateway.volumes.lock().is_empty());
        assert_eq!(f.store.inner.instance_count(), 0);

        assert_matches!(
            f.broker
                .deprovision("i1", DeprovisionDetails::default(), false)
                .await,
            Err(Error::InstanceDoesNotExist { instance_id }) if instance_id == "i1"
        );
    }
}
