//! Type definitions for domains, power states and device assignments.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ReconcileError;
use crate::schema::PropertyKey;

/// Name of the administrative domain. Excluded from listings and inventory.
pub const ADMIN_DOMAIN: &str = "dom0";

/// Labels understood by the management layer.
pub const KNOWN_LABELS: &[&str] = &[
    "red", "orange", "yellow", "green", "gray", "blue", "purple", "black",
];

// =============================================================================
// DOMAIN
// =============================================================================

/// Domain type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Klass {
    AppVM,
    TemplateVM,
    #[serde(alias = "StandAloneVM")]
    StandaloneVM,
    DispVM,
    /// The administrative domain (`dom0`). Never created or removed.
    AdminVM,
}

impl Klass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Klass::AppVM => "AppVM",
            Klass::TemplateVM => "TemplateVM",
            Klass::StandaloneVM => "StandaloneVM",
            Klass::DispVM => "DispVM",
            Klass::AdminVM => "AdminVM",
        }
    }

    /// Volume names that may be resized on a domain of this class.
    pub fn resizable_volumes(&self) -> &'static [&'static str] {
        match self {
            Klass::AppVM => &["private"],
            Klass::StandaloneVM | Klass::TemplateVM => &["root"],
            Klass::DispVM | Klass::AdminVM => &[],
        }
    }

    /// Whether creating a domain of this class clones an existing template.
    pub fn is_cloned(&self) -> bool {
        matches!(self, Klass::StandaloneVM | Klass::TemplateVM)
    }
}

impl Default for Klass {
    fn default() -> Self {
        Self::AppVM
    }
}

impl fmt::Display for Klass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed power state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Paused,
    Shutdown,
    /// Observed only, never a valid target.
    Crashed,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Running => "running",
            PowerState::Paused => "paused",
            PowerState::Shutdown => "shutdown",
            PowerState::Crashed => "crashed",
        }
    }
}

impl Default for PowerState {
    fn default() -> Self {
        Self::Shutdown
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target intent for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Present,
    Running,
    Shutdown,
    Destroyed,
    #[serde(alias = "pause")]
    Paused,
    #[serde(alias = "undefine")]
    Absent,
}

impl Intent {
    /// The power state a list filter for this intent selects, if any.
    pub fn as_power_state(&self) -> Option<PowerState> {
        match self {
            Intent::Running => Some(PowerState::Running),
            Intent::Paused => Some(PowerState::Paused),
            Intent::Shutdown | Intent::Destroyed => Some(PowerState::Shutdown),
            Intent::Present | Intent::Absent => None,
        }
    }
}

/// Basic domain information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    /// Unique domain name
    pub name: String,
    /// Domain class
    pub klass: Klass,
    /// Current power state
    pub state: PowerState,
    /// Label (colour) name
    pub label: String,
    /// Whether other domains may use this one as their netvm
    pub provides_network: bool,
    /// Whether disposables may be based on this one
    pub template_for_dispvms: bool,
}

/// Live scalar properties of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainProperties {
    pub autostart: bool,
    pub debug: bool,
    pub include_in_backups: bool,
    pub kernel: String,
    pub label: String,
    pub maxmem: i64,
    pub memory: i64,
    pub provides_network: bool,
    pub netvm: Option<String>,
    pub default_dispvm: Option<String>,
    pub template: Option<String>,
    pub template_for_dispvms: bool,
    pub vcpus: i64,
    pub virt_mode: String,
}

impl Default for DomainProperties {
    fn default() -> Self {
        Self {
            autostart: false,
            debug: false,
            include_in_backups: true,
            kernel: String::new(),
            label: "red".to_string(),
            maxmem: 4000,
            memory: 400,
            provides_network: false,
            netvm: None,
            default_dispvm: None,
            template: None,
            template_for_dispvms: false,
            vcpus: 2,
            virt_mode: "pvh".to_string(),
        }
    }
}

impl DomainProperties {
    /// Read a scalar property. Returns `None` for keys that are not scalars.
    pub fn get(&self, key: PropertyKey) -> Option<PropValue> {
        let value = match key {
            PropertyKey::Autostart => PropValue::Bool(self.autostart),
            PropertyKey::Debug => PropValue::Bool(self.debug),
            PropertyKey::IncludeInBackups => PropValue::Bool(self.include_in_backups),
            PropertyKey::Kernel => PropValue::Text(self.kernel.clone()),
            PropertyKey::Label => PropValue::Text(self.label.clone()),
            PropertyKey::Maxmem => PropValue::Int(self.maxmem),
            PropertyKey::Memory => PropValue::Int(self.memory),
            PropertyKey::ProvidesNetwork => PropValue::Bool(self.provides_network),
            PropertyKey::Netvm => PropValue::Domain(self.netvm.clone()),
            PropertyKey::DefaultDispvm => PropValue::Domain(self.default_dispvm.clone()),
            PropertyKey::Template => PropValue::Domain(self.template.clone()),
            PropertyKey::TemplateForDispvms => PropValue::Bool(self.template_for_dispvms),
            PropertyKey::Vcpus => PropValue::Int(self.vcpus),
            PropertyKey::VirtMode => PropValue::Text(self.virt_mode.clone()),
            PropertyKey::Features | PropertyKey::Services | PropertyKey::Volume => return None,
        };
        Some(value)
    }

    /// Write a scalar property. The value variant must match the key.
    pub fn set(&mut self, key: PropertyKey, value: PropValue) -> Result<(), String> {
        match (key, value) {
            (PropertyKey::Autostart, PropValue::Bool(v)) => self.autostart = v,
            (PropertyKey::Debug, PropValue::Bool(v)) => self.debug = v,
            (PropertyKey::IncludeInBackups, PropValue::Bool(v)) => self.include_in_backups = v,
            (PropertyKey::Kernel, PropValue::Text(v)) => self.kernel = v,
            (PropertyKey::Label, PropValue::Text(v)) => self.label = v,
            (PropertyKey::Maxmem, PropValue::Int(v)) => self.maxmem = v,
            (PropertyKey::Memory, PropValue::Int(v)) => self.memory = v,
            (PropertyKey::ProvidesNetwork, PropValue::Bool(v)) => self.provides_network = v,
            (PropertyKey::Netvm, PropValue::Domain(v)) => self.netvm = v,
            (PropertyKey::DefaultDispvm, PropValue::Domain(v)) => self.default_dispvm = v,
            (PropertyKey::Template, PropValue::Domain(v)) => self.template = v,
            (PropertyKey::TemplateForDispvms, PropValue::Bool(v)) => self.template_for_dispvms = v,
            (PropertyKey::Vcpus, PropValue::Int(v)) => self.vcpus = v,
            (PropertyKey::VirtMode, PropValue::Text(v)) => self.virt_mode = v,
            (key, value) => return Err(format!("cannot set {} to {:?}", key, value)),
        }
        Ok(())
    }
}

/// A typed scalar property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Text(String),
    /// Reference to another domain, `None` meaning unset.
    Domain(Option<String>),
}

/// Where a newly created domain gets its network from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetvmChoice {
    /// The system default network domain at the time of the call.
    Default,
    /// No network.
    None,
    /// A named network-providing domain.
    Named(String),
}

impl NetvmChoice {
    /// Parse a netvm request value, recognising the default and empty sentinels.
    pub fn parse(value: &str) -> Self {
        match value {
            "default" | "*default*" => NetvmChoice::Default,
            "" | "none" | "None" => NetvmChoice::None,
            name => NetvmChoice::Named(name.to_string()),
        }
    }
}

// =============================================================================
// DEVICES
// =============================================================================

/// Identity of an assignable device: `(class, backend domain, port)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub devclass: String,
    pub backend: String,
    pub port_id: String,
    /// Optional sub-device identifier. Not part of the identity key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// The part of a [`DeviceSpec`] that identifies an assignment.
pub type DeviceKey = (String, String, String);

impl DeviceSpec {
    pub fn new(
        devclass: impl Into<String>,
        backend: impl Into<String>,
        port_id: impl Into<String>,
    ) -> Self {
        Self {
            devclass: devclass.into(),
            backend: backend.into(),
            port_id: port_id.into(),
            device_id: None,
        }
    }

    pub fn key(&self) -> DeviceKey {
        (self.devclass.clone(), self.backend.clone(), self.port_id.clone())
    }
}

impl FromStr for DeviceSpec {
    type Err = ReconcileError;

    /// Parse `<devclass>:<backend_domain>:<port_id>[:<dev_id>]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ReconcileError::InvalidDeviceSpec {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.splitn(4, ':').collect();
        if parts.len() < 3 {
            return Err(invalid("expected <devclass>:<backend_domain>:<port_id>[:<dev_id>]"));
        }
        if parts[..3].iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("empty component"));
        }

        let device_id = match parts.get(3) {
            Some(id) if id.is_empty() => return Err(invalid("empty device id")),
            Some(id) => Some(id.to_string()),
            None => None,
        };

        Ok(Self {
            devclass: parts[0].to_string(),
            backend: parts[1].to_string(),
            port_id: parts[2].to_string(),
            device_id,
        })
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.devclass, self.backend, self.port_id)?;
        if let Some(ref id) = self.device_id {
            write!(f, ":{}", id)?;
        }
        Ok(())
    }
}

/// Assignment policy for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentMode {
    Required,
    AutoAttach,
    AskToAttach,
    Manual,
}

impl AssignmentMode {
    /// Mode used when a desired entry does not name one.
    pub fn default_for(devclass: &str) -> Self {
        if devclass == "pci" {
            AssignmentMode::Required
        } else {
            AssignmentMode::AutoAttach
        }
    }
}

/// Assignment options. Compared as a whole, never merged.
pub type DeviceOptions = BTreeMap<String, serde_json::Value>;

/// A device assigned to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub device: DeviceSpec,
    pub mode: AssignmentMode,
    #[serde(default)]
    pub options: DeviceOptions,
}

/// A device exposed by a backend domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device: DeviceSpec,
    /// Interface descriptors, e.g. `p020000` for an ethernet controller
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_spec() {
        let spec: DeviceSpec = "pci:dom0:00_05.0".parse().unwrap();
        assert_eq!(spec.devclass, "pci");
        assert_eq!(spec.backend, "dom0");
        assert_eq!(spec.port_id, "00_05.0");
        assert_eq!(spec.device_id, None);
        assert_eq!(spec.to_string(), "pci:dom0:00_05.0");

        let spec: DeviceSpec = "usb:sys-usb:2-1:0781:5583".parse().unwrap();
        assert_eq!(spec.port_id, "2-1");
        assert_eq!(spec.device_id.as_deref(), Some("0781:5583"));
    }

    #[test]
    fn test_parse_device_spec_rejects_malformed() {
        for bad in ["pci", "pci:dom0", "pci::5", ":dom0:5", "pci:dom0:5:"] {
            let err = bad.parse::<DeviceSpec>().unwrap_err();
            assert!(
                matches!(err, ReconcileError::InvalidDeviceSpec { ref spec, .. } if spec == bad),
                "{bad} -> {err:?}"
            );
        }
    }

    #[test]
    fn test_default_mode_depends_on_class() {
        assert_eq!(AssignmentMode::default_for("pci"), AssignmentMode::Required);
        assert_eq!(AssignmentMode::default_for("block"), AssignmentMode::AutoAttach);
    }

    #[test]
    fn test_netvm_sentinels() {
        assert_eq!(NetvmChoice::parse("*default*"), NetvmChoice::Default);
        assert_eq!(NetvmChoice::parse(""), NetvmChoice::None);
        assert_eq!(NetvmChoice::parse("None"), NetvmChoice::None);
        assert_eq!(NetvmChoice::parse("sys-net"), NetvmChoice::Named("sys-net".into()));
    }

    #[test]
    fn test_volume_names_by_class() {
        assert_eq!(Klass::AppVM.resizable_volumes(), &["private"]);
        assert_eq!(Klass::StandaloneVM.resizable_volumes(), &["root"]);
        assert!(Klass::DispVM.resizable_volumes().is_empty());
    }

    #[test]
    fn test_properties_reject_mismatched_value() {
        let mut props = DomainProperties::default();
        props.set(PropertyKey::Memory, PropValue::Int(1024)).unwrap();
        assert_eq!(props.get(PropertyKey::Memory), Some(PropValue::Int(1024)));
        assert!(props.set(PropertyKey::Memory, PropValue::Text("big".into())).is_err());
        assert_eq!(props.get(PropertyKey::Features), None);
    }
}
