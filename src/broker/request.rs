//! Request Parameters
//!
//! Typed parsing of the free-form parameters carried by provision and bind
//! requests.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// =============================================================================
// Provision Parameters
// =============================================================================

/// Byte count as sent by clients: a JSON number or a string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteCount(pub String);

impl<'de> Deserialize<'de> for ByteCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => Ok(ByteCount(n.to_string())),
            Value::String(s) => Ok(ByteCount(s)),
            other => Err(serde::de::Error::custom(format!(
                "expected a byte count, found {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapacityRange {
    #[serde(alias = "requiredBytes")]
    pub required_bytes: Option<ByteCount>,
    #[serde(default, alias = "limitBytes")]
    pub limit_bytes: Option<ByteCount>,
}

/// Volume-creation request carried in the provision parameters
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "capacityRange")]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// NFS share the volume points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsShare {
    pub server: String,
    pub share: String,
}

/// Provision parameters after validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedVolume {
    pub name: String,
    pub capacity: Quantity,
    pub share: NfsShare,
}

impl VolumeRequest {
    /// Parse raw provision parameters
    ///
    /// Absent parameters parse as an empty request and fail validation on
    /// the missing name.
    pub fn parse(raw: Option<&Value>) -> Result<Self> {
        match raw {
            None | Some(Value::Null) => Ok(Self {
                name: String::new(),
                capacity_range: None,
                parameters: BTreeMap::new(),
            }),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::InvalidRequest(e.to_string())),
        }
    }

    /// Check mandatory fields and canonicalize the capacity
    pub fn validate(self) -> Result<ValidatedVolume> {
        if self.name.is_empty() {
            return Err(requires("name"));
        }

        let range = self.capacity_range.ok_or_else(|| requires("capacity_range"))?;

        let share = NfsShare {
            server: required_param(&self.parameters, "server")?,
            share: required_param(&self.parameters, "share")?,
        };

        let required = range.required_bytes.map(|b| b.0).unwrap_or_else(|| "0".into());
        let capacity = parse_quantity(&required)?;

        Ok(ValidatedVolume {
            name: self.name,
            capacity,
            share,
        })
    }
}

fn requires(field: &str) -> Error {
    Error::Validation(format!("config requires a \"{}\"", field))
}

fn required_param(parameters: &BTreeMap<String, String>, key: &str) -> Result<String> {
    parameters.get(key).cloned().ok_or_else(|| requires(key))
}

/// Canonical quantity holding a plain byte count
pub fn parse_quantity(raw: &str) -> Result<Quantity> {
    parse_capacity(raw).map(|bytes| Quantity(bytes.to_string()))
}

/// Parse capacity string (e.g., "2", "100Gi", "1T") to bytes
///
/// Binary suffixes (`Ki`, `Mi`, ...) are powers of 1024, decimal suffixes
/// (`k`, `M`, ...) powers of 1000.
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }
    if s.starts_with('-') {
        return Err(Error::CapacityParse(format!("negative capacity: {}", s)));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: u64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", s)))?;

    let multiplier: u64 = match unit_str {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        _ => {
            return Err(Error::CapacityParse(format!(
                "unknown unit: {}",
                unit_str
            )))
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| Error::CapacityParse(format!("capacity overflows: {}", s)))
}

// =============================================================================
// Bind Parameters
// =============================================================================

/// Mount mode handed to the platform
pub const MODE_READ_ONLY: &str = "r";
pub const MODE_READ_WRITE: &str = "rw";

/// PV/PVC access modes
pub const ACCESS_READ_WRITE_MANY: &str = "ReadWriteMany";
pub const ACCESS_READ_ONLY_MANY: &str = "ReadOnlyMany";

/// Access requested by a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    /// Mode token of the volume mount
    pub fn mount_mode(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => MODE_READ_ONLY,
            AccessMode::ReadWrite => MODE_READ_WRITE,
        }
    }

    /// Access mode of the claim
    pub fn claim_access_mode(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => ACCESS_READ_ONLY_MANY,
            AccessMode::ReadWrite => ACCESS_READ_WRITE_MANY,
        }
    }
}

/// Recognized bind parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindParameters {
    pub access: AccessMode,
    pub mount: Option<String>,
}

impl BindParameters {
    /// Parse raw bind parameters as a JSON object; absent means empty
    pub fn parse_map(raw: Option<&Value>) -> Result<Map<String, Value>> {
        match raw {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(other) => Err(Error::InvalidRequest(format!(
                "bind parameters must be an object, found {}",
                other
            ))),
        }
    }

    /// Extract the recognized keys
    pub fn from_map(params: &Map<String, Value>) -> Result<Self> {
        let access = match params.get("readonly") {
            None => AccessMode::ReadWrite,
            Some(Value::Bool(true)) => AccessMode::ReadOnly,
            Some(Value::Bool(false)) => AccessMode::ReadWrite,
            Some(other) => {
                return Err(Error::InvalidRequest(format!(
                    "\"readonly\" must be a boolean, found {}",
                    other
                )))
            }
        };

        let mount = match params.get("mount") {
            None | Some(Value::Null) => None,
            Some(Value::String(path)) if path.is_empty() => None,
            Some(Value::String(path)) => Some(path.clone()),
            Some(other) => {
                return Err(Error::InvalidRequest(format!(
                    "\"mount\" must be a string, found {}",
                    other
                )))
            }
        };

        Ok(Self { access, mount })
    }

    /// Container path: the `mount` parameter or `<base>/<instance_id>`
    pub fn container_dir(&self, default_base: &str, instance_id: &str) -> String {
        match &self.mount {
            Some(path) => path.clone(),
            None => format!("{}/{}", default_base.trim_end_matches('/'), instance_id),
        }
    }
}
