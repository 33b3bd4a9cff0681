//! Service Catalog
//!
//! Static service offerings loaded from the services config, their
//! marketplace view, and the registry resolving offerings to CSI drivers.

pub mod driver;
pub mod registry;

pub use driver::*;
pub use registry::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{error, info};

/// Permission required by offerings that hand out volume mounts
pub const PERMISSION_VOLUME_MOUNT: &str = "volume_mount";

// =============================================================================
// Offerings
// =============================================================================

/// Plan of a service offering
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Offering as configured, including the driver it is served by
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceOffering {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default, alias = "plan_updateable")]
    pub plan_updatable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// CSI driver serving this offering
    #[serde(default)]
    pub driver_name: String,
    /// Driver endpoint; empty means a no-op driver
    #[serde(default)]
    pub connection_address: String,
}

impl ServiceOffering {
    /// Whether the offering carries every mandatory catalog field
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
            && !self.name.is_empty()
            && !self.description.is_empty()
            && !self.plans.is_empty()
    }

    /// Marketplace view of this offering
    pub fn to_catalog(&self) -> CatalogService {
        CatalogService {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            bindable: self.bindable,
            plan_updateable: self.plan_updatable,
            tags: self.tags.clone(),
            requires: self.requires.clone(),
            plans: self.plans.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Offering as advertised in the marketplace catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogService {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub plan_updateable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    pub plans: Vec<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

// =============================================================================
// Loading
// =============================================================================

/// Parse offerings from config text
///
/// YAML is accepted when `yaml` is set; JSON otherwise.
pub fn parse_catalog(content: &str, yaml: bool) -> Result<Vec<ServiceOffering>> {
    if yaml {
        serde_yaml::from_str(content).map_err(|e| Error::CatalogParse(e.to_string()))
    } else {
        serde_json::from_str(content).map_err(|e| Error::CatalogParse(e.to_string()))
    }
}

/// Read offerings from the services config file
pub fn load_catalog(path: impl AsRef<Path>) -> Result<Vec<ServiceOffering>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        error!(file = %path.display(), "Failed to read services config: {}", e);
        e
    })?;

    let yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );

    let offerings = parse_catalog(&content, yaml).map_err(|e| {
        error!(file = %path.display(), "Failed to parse services config: {}", e);
        e
    })?;

    info!(file = %path.display(), services = offerings.len(), "Services config loaded");
    Ok(offerings)
}
