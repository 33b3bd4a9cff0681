//! Broker records and marketplace value types
//!
//! The records kept in the state store, plus the request and response
//! shapes exchanged with the marketplace layer.

use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Capacity key on PV/PVC resource lists
pub const RESOURCE_STORAGE: &str = "storage";

// =============================================================================
// Volume Fingerprint
// =============================================================================

/// Identifies the backend volume provisioned for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeFingerprint {
    /// Volume name, also the PV name and the PVC name used when binding
    pub name: String,
    /// The PV as returned by the cluster on creation
    pub volume: PersistentVolume,
}

impl VolumeFingerprint {
    pub fn new(name: impl Into<String>, volume: PersistentVolume) -> Self {
        Self {
            name: name.into(),
            volume,
        }
    }

    /// Name of the cluster volume object
    ///
    /// Falls back to the fingerprint name when the returned object carries
    /// no metadata name.
    pub fn volume_name(&self) -> &str {
        self.volume
            .metadata
            .name
            .as_deref()
            .unwrap_or(self.name.as_str())
    }

    /// Recorded storage capacity of the volume
    pub fn capacity(&self) -> Option<&Quantity> {
        self.volume
            .spec
            .as_ref()
            .and_then(|spec| spec.capacity.as_ref())
            .and_then(|capacity| capacity.get(RESOURCE_STORAGE))
    }

    /// Whether both fingerprints describe the same requested volume
    ///
    /// Everything the provision request determines is compared: name,
    /// labels, capacity, access modes, CSI driver and volume attributes.
    /// The generated volume handle and fields filled in by the cluster are
    /// not.
    pub fn same_volume(&self, other: &VolumeFingerprint) -> bool {
        self.name == other.name && self.requested() == other.requested()
    }

    fn requested(&self) -> RequestedVolume<'_> {
        let spec = self.volume.spec.as_ref();
        let csi = spec.and_then(|spec| spec.csi.as_ref());
        RequestedVolume {
            name: self.volume.metadata.name.as_deref(),
            labels: self.volume.metadata.labels.as_ref(),
            capacity: spec.and_then(|spec| spec.capacity.as_ref()),
            access_modes: spec.and_then(|spec| spec.access_modes.as_ref()),
            driver: csi.map(|csi| csi.driver.as_str()),
            attributes: csi.and_then(|csi| csi.volume_attributes.as_ref()),
        }
    }
}

/// Request-determined part of a persistent volume
#[derive(PartialEq)]
struct RequestedVolume<'a> {
    name: Option<&'a str>,
    labels: Option<&'a BTreeMap<String, String>>,
    capacity: Option<&'a BTreeMap<String, Quantity>>,
    access_modes: Option<&'a Vec<String>>,
    driver: Option<&'a str>,
    attributes: Option<&'a BTreeMap<String, String>>,
}

/// Fingerprint as held by the store
///
/// Records written in-process keep the typed value; records restored from a
/// serialized snapshot come back as a generic JSON document and need a
/// decode step.
#[derive(Debug, Clone)]
pub enum StoredFingerprint {
    Typed(VolumeFingerprint),
    Document(Value),
}

impl StoredFingerprint {
    /// Decode into a typed fingerprint
    pub fn decode(&self) -> Result<Cow<'_, VolumeFingerprint>> {
        match self {
            StoredFingerprint::Typed(fingerprint) => Ok(Cow::Borrowed(fingerprint)),
            StoredFingerprint::Document(document) => {
                serde_json::from_value::<VolumeFingerprint>(document.clone())
                    .map(Cow::Owned)
                    .map_err(|e| Error::FingerprintDecode(e.to_string()))
            }
        }
    }
}

impl From<VolumeFingerprint> for StoredFingerprint {
    fn from(fingerprint: VolumeFingerprint) -> Self {
        StoredFingerprint::Typed(fingerprint)
    }
}

impl Serialize for StoredFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            StoredFingerprint::Typed(fingerprint) => fingerprint.serialize(serializer),
            StoredFingerprint::Document(document) => document.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for StoredFingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(StoredFingerprint::Document)
    }
}

// =============================================================================
// Instance / Binding Records
// =============================================================================

/// Bookkeeping for one provisioned service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    pub fingerprint: StoredFingerprint,
}

impl InstanceRecord {
    /// Whether `other` is a different request for the same instance id
    ///
    /// Every field takes part except the generated volume handle, so an
    /// identical re-request never conflicts. An undecodable fingerprint on
    /// either side does.
    pub fn conflicts_with(&self, other: &InstanceRecord) -> bool {
        if self.service_id != other.service_id
            || self.plan_id != other.plan_id
            || self.organization_guid != other.organization_guid
            || self.space_guid != other.space_guid
        {
            return true;
        }

        match (self.fingerprint.decode(), other.fingerprint.decode()) {
            (Ok(mine), Ok(theirs)) => !mine.same_volume(&theirs),
            _ => true,
        }
    }
}

/// Bookkeeping for one binding: the bind request as received
pub type BindingRecord = BindDetails;

// =============================================================================
// Marketplace Requests
// =============================================================================

/// Body of a provision request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionDetails {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub organization_guid: String,
    #[serde(default)]
    pub space_guid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Query of a deprovision request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeprovisionDetails {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
}

/// Resource the binding is created for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

/// Body of a bind request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_guid: Option<String>,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_resource: Option<BindResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Query of an unbind request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnbindDetails {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
}

/// Body of an update request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDetails {
    #[serde(default)]
    pub service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

// =============================================================================
// Marketplace Responses
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedServiceSpec {
    #[serde(skip)]
    pub is_async: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(rename = "operation", skip_serializing_if = "Option::is_none")]
    pub operation_data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeprovisionServiceSpec {
    #[serde(skip)]
    pub is_async: bool,
    #[serde(rename = "operation", skip_serializing_if = "Option::is_none")]
    pub operation_data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateServiceSpec {
    #[serde(skip)]
    pub is_async: bool,
    #[serde(rename = "operation", skip_serializing_if = "Option::is_none")]
    pub operation_data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    Succeeded,
    Failed,
}

/// State of the last asynchronous operation; always empty for this broker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastOperation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<LastOperationState>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub description: String,
}

/// Device section of a shared volume mount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedDevice {
    pub volume_id: String,
    pub mount_config: Map<String, Value>,
}

/// Volume mount handed to the platform on bind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub driver: String,
    pub container_dir: String,
    pub mode: String,
    pub device_type: String,
    pub device: SharedDevice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// Always present; the platform rejects bindings without credentials
    pub credentials: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}
