//! Core management-layer abstraction trait.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::schema::PropertyKey;
use crate::types::*;

/// Parameters for defining a new domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDomain {
    pub name: String,
    pub klass: Klass,
    pub label: String,
    /// Template the domain is based on (AppVM/DispVM) or cloned from.
    pub template: Option<String>,
}

/// Access to the Qubes OS management layer.
///
/// Read operations form the State Query Interface the reconcilers diff
/// against; write operations are the mutations they stage. Implementations
/// never retry: every call is attempted exactly once.
#[async_trait]
pub trait QubesApi: Send + Sync {
    // =========================================================================
    // Host
    // =========================================================================

    /// Check that the management layer is reachable.
    async fn health_check(&self) -> Result<bool>;

    /// List all domains, `dom0` included.
    async fn list_domains(&self) -> Result<Vec<DomainInfo>>;

    /// Fetch one domain. Fails with `DomainNotFound` if absent.
    async fn get_domain(&self, name: &str) -> Result<DomainInfo>;

    /// Current system default network domain.
    async fn default_netvm(&self) -> Result<Option<String>>;

    /// Current system default template.
    async fn default_template(&self) -> Result<Option<String>>;

    // =========================================================================
    // Domain lifecycle
    // =========================================================================

    /// Define a new domain based on a template.
    async fn create_domain(&self, domain: &NewDomain) -> Result<()>;

    /// Define a new domain as a copy of `source`.
    async fn clone_domain(&self, source: &str, name: &str, klass: Klass) -> Result<()>;

    /// Delete a domain definition. The domain must be halted.
    async fn remove_domain(&self, name: &str) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    /// Request a graceful shutdown. Returns before the domain has halted.
    async fn shutdown(&self, name: &str) -> Result<()>;

    /// Kill the domain immediately. Fails with `NotRunning` if already halted.
    async fn kill(&self, name: &str) -> Result<()>;

    async fn pause(&self, name: &str) -> Result<()>;

    async fn unpause(&self, name: &str) -> Result<()>;

    // =========================================================================
    // Properties, features, tags, volumes
    // =========================================================================

    async fn get_properties(&self, name: &str) -> Result<DomainProperties>;

    async fn set_property(&self, name: &str, key: PropertyKey, value: PropValue) -> Result<()>;

    async fn get_features(&self, name: &str) -> Result<BTreeMap<String, String>>;

    async fn set_feature(&self, name: &str, feature: &str, value: &str) -> Result<()>;

    async fn remove_feature(&self, name: &str, feature: &str) -> Result<()>;

    async fn get_tags(&self, name: &str) -> Result<BTreeSet<String>>;

    async fn add_tag(&self, name: &str, tag: &str) -> Result<()>;

    /// Remove a tag. Fails with `TagNotFound` if it is not attached.
    async fn remove_tag(&self, name: &str, tag: &str) -> Result<()>;

    /// Resize a volume (grow only). Returns whether the size changed.
    async fn resize_volume(&self, name: &str, volume: &str, size: u64) -> Result<bool>;

    // =========================================================================
    // Devices
    // =========================================================================

    /// Device classes known to the management layer (e.g. `pci`, `block`).
    async fn device_classes(&self) -> Result<Vec<String>>;

    /// Devices of `devclass` exposed by the `backend` domain.
    async fn available_devices(&self, backend: &str, devclass: &str) -> Result<Vec<DeviceInfo>>;

    /// Resolve a device descriptor. Fails with `DeviceNotFound` if absent.
    async fn resolve_device(&self, spec: &DeviceSpec) -> Result<DeviceInfo>;

    async fn assigned_devices(&self, name: &str, devclass: &str) -> Result<Vec<DeviceAssignment>>;

    async fn assign_device(&self, name: &str, assignment: &DeviceAssignment) -> Result<()>;

    async fn unassign_device(&self, name: &str, device: &DeviceSpec) -> Result<()>;
}
