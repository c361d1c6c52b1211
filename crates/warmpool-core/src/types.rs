//! Pool definitions shared by the manager, the outbox, and the scheduler.

use serde::{Deserialize, Serialize};

/// Variant ID used for instances produced from the pool's base spec.
pub const DEFAULT_VARIANT_ID: &str = "default";

/// Label key that exempts an instance from age-based purging.
pub const RETAIN_LABEL: &str = "retain";

/// Label key marking an instance with an extended (7 day) busy lifetime.
pub const TTL_LABEL: &str = "ttl";

/// Operating system and architecture a pool's VMs run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub version: String,
    /// Distribution name, e.g. "ubuntu".
    #[serde(default)]
    pub os_name: String,
}

/// The base machine shape for a pool.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSpec {
    pub image: String,
    /// Instance size / machine type.
    pub size: String,
    pub region: String,
    /// Candidate zones; empty means the driver decides.
    pub zones: Vec<String>,
    /// Root disk size in GB (0 = driver default).
    pub disk_size: u64,
    pub disk_type: String,
    pub nested_virtualization: bool,
}

/// A sub-template overriding part of the base spec.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantSpec {
    pub variant_id: String,
    pub resource_class: String,
    pub image_name: String,
    pub machine_type: String,
    pub nested_virtualization: bool,
    pub zones: Vec<String>,
    pub disk_size: u64,
    pub disk_type: String,
    /// Warm instances to keep for this variant.
    pub min_size: u32,
}

/// A named pool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    /// Driver tag, e.g. "fake" or "google".
    pub driver: String,
    pub platform: Platform,
    #[serde(default)]
    pub min_size: u32,
    pub max_size: u32,
    #[serde(default)]
    pub spec: MachineSpec,
    #[serde(default, rename = "variant")]
    pub variants: Vec<VariantSpec>,
}

/// Request-time machine overrides.
///
/// Carried verbatim in `setup_instance` outbox params, so every field is
/// optional and serializable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nested_virtualization: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_type: Option<String>,
}

/// The effective shape of a VM after merging pool, variant, and request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMachine {
    pub variant_id: String,
    pub image: String,
    pub size: String,
    pub region: String,
    pub zones: Vec<String>,
    pub disk_size: u64,
    pub disk_type: String,
    pub nested_virtualization: bool,
}

impl PoolSpec {
    /// Look up a variant by ID.
    pub fn variant(&self, variant_id: &str) -> Option<&VariantSpec> {
        self.variants.iter().find(|v| v.variant_id == variant_id)
    }

    /// Find the variant serving a resource class, if any.
    pub fn variant_for_resource_class(&self, resource_class: &str) -> Option<&VariantSpec> {
        self.variants
            .iter()
            .find(|v| !v.resource_class.is_empty() && v.resource_class == resource_class)
    }

    /// Warm target for a variant (`"default"` uses the pool's `min_size`).
    pub fn min_size_for(&self, variant_id: &str) -> u32 {
        if variant_id == DEFAULT_VARIANT_ID {
            return self.min_size;
        }
        self.variant(variant_id).map(|v| v.min_size).unwrap_or(0)
    }

    /// All variant IDs this pool produces, default first.
    pub fn variant_ids(&self) -> Vec<String> {
        let mut ids = vec![DEFAULT_VARIANT_ID.to_string()];
        ids.extend(self.variants.iter().map(|v| v.variant_id.clone()));
        ids
    }

    /// Merge the base spec, the selected variant, and request overrides.
    pub fn resolve(&self, config: &MachineConfig) -> ResolvedMachine {
        let variant = config
            .variant_id
            .as_deref()
            .and_then(|id| self.variant(id))
            .or_else(|| {
                config
                    .resource_class
                    .as_deref()
                    .and_then(|rc| self.variant_for_resource_class(rc))
            });

        let mut resolved = ResolvedMachine {
            variant_id: DEFAULT_VARIANT_ID.to_string(),
            image: self.spec.image.clone(),
            size: self.spec.size.clone(),
            region: self.spec.region.clone(),
            zones: self.spec.zones.clone(),
            disk_size: self.spec.disk_size,
            disk_type: self.spec.disk_type.clone(),
            nested_virtualization: self.spec.nested_virtualization,
        };

        if let Some(v) = variant {
            resolved.variant_id = v.variant_id.clone();
            override_str(&mut resolved.image, &v.image_name);
            override_str(&mut resolved.size, &v.machine_type);
            override_str(&mut resolved.disk_type, &v.disk_type);
            if !v.zones.is_empty() {
                resolved.zones = v.zones.clone();
            }
            if v.disk_size > 0 {
                resolved.disk_size = v.disk_size;
            }
            resolved.nested_virtualization |= v.nested_virtualization;
        }

        if let Some(image) = &config.image {
            override_str(&mut resolved.image, image);
        }
        if let Some(machine_type) = &config.machine_type {
            override_str(&mut resolved.size, machine_type);
        }
        if let Some(disk_type) = &config.disk_type {
            override_str(&mut resolved.disk_type, disk_type);
        }
        if let Some(disk_size) = config.disk_size.filter(|s| *s > 0) {
            resolved.disk_size = disk_size;
        }
        if let Some(nested) = config.nested_virtualization {
            resolved.nested_virtualization = nested;
        }
        if let Some(zone) = config.zone.as_ref().filter(|z| !z.is_empty()) {
            resolved.zones = vec![zone.clone()];
        }

        resolved
    }
}

impl VariantSpec {
    /// The overrides a `setup_instance` job needs to build this variant.
    pub fn to_machine_config(&self) -> MachineConfig {
        MachineConfig {
            variant_id: Some(self.variant_id.clone()),
            resource_class: non_empty(&self.resource_class),
            image: non_empty(&self.image_name),
            machine_type: non_empty(&self.machine_type),
            zone: None,
            nested_virtualization: self.nested_virtualization.then_some(true),
            disk_size: (self.disk_size > 0).then_some(self.disk_size),
            disk_type: non_empty(&self.disk_type),
        }
    }
}

fn override_str(target: &mut String, value: &str) {
    if !value.is_empty() {
        *target = value.to_string();
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
