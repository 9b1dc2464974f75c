//! Property schema: recognised keys, their declared types and typed values.
//!
//! Keys are declared in a fixed order. [`PropertyKey`] derives `Ord` from that
//! order so any `BTreeMap<PropertyKey, _>` iterates deterministically.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ReconcileError;
use crate::types::{NetvmChoice, PropValue};

/// Feature value that removes the feature instead of setting it.
pub const FEATURE_DELETE_SENTINEL: &str = "None";

/// A recognised property name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKey {
    Autostart,
    Debug,
    IncludeInBackups,
    Kernel,
    Label,
    Maxmem,
    Memory,
    ProvidesNetwork,
    Netvm,
    DefaultDispvm,
    Template,
    TemplateForDispvms,
    Vcpus,
    VirtMode,
    Features,
    /// Write-only alias folded into `features`.
    Services,
    Volume,
}

/// Declared type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Str,
    Map,
    List,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Str => "str",
            ValueKind::Map => "dict",
            ValueKind::List => "list",
        }
    }
}

impl PropertyKey {
    pub const ALL: [PropertyKey; 17] = [
        PropertyKey::Autostart,
        PropertyKey::Debug,
        PropertyKey::IncludeInBackups,
        PropertyKey::Kernel,
        PropertyKey::Label,
        PropertyKey::Maxmem,
        PropertyKey::Memory,
        PropertyKey::ProvidesNetwork,
        PropertyKey::Netvm,
        PropertyKey::DefaultDispvm,
        PropertyKey::Template,
        PropertyKey::TemplateForDispvms,
        PropertyKey::Vcpus,
        PropertyKey::VirtMode,
        PropertyKey::Features,
        PropertyKey::Services,
        PropertyKey::Volume,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKey::Autostart => "autostart",
            PropertyKey::Debug => "debug",
            PropertyKey::IncludeInBackups => "include_in_backups",
            PropertyKey::Kernel => "kernel",
            PropertyKey::Label => "label",
            PropertyKey::Maxmem => "maxmem",
            PropertyKey::Memory => "memory",
            PropertyKey::ProvidesNetwork => "provides_network",
            PropertyKey::Netvm => "netvm",
            PropertyKey::DefaultDispvm => "default_dispvm",
            PropertyKey::Template => "template",
            PropertyKey::TemplateForDispvms => "template_for_dispvms",
            PropertyKey::Vcpus => "vcpus",
            PropertyKey::VirtMode => "virt_mode",
            PropertyKey::Features => "features",
            PropertyKey::Services => "services",
            PropertyKey::Volume => "volume",
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            PropertyKey::Autostart
            | PropertyKey::Debug
            | PropertyKey::IncludeInBackups
            | PropertyKey::ProvidesNetwork
            | PropertyKey::TemplateForDispvms => ValueKind::Bool,
            PropertyKey::Maxmem | PropertyKey::Memory | PropertyKey::Vcpus => ValueKind::Int,
            PropertyKey::Kernel
            | PropertyKey::Label
            | PropertyKey::Netvm
            | PropertyKey::DefaultDispvm
            | PropertyKey::Template
            | PropertyKey::VirtMode => ValueKind::Str,
            PropertyKey::Features | PropertyKey::Volume => ValueKind::Map,
            PropertyKey::Services => ValueKind::List,
        }
    }

    /// Type-check a raw value against this key and convert it.
    pub fn parse_value(&self, raw: &Value) -> Result<DesiredValue, ReconcileError> {
        let wrong_type = || ReconcileError::InvalidValueType {
            key: self.as_str().to_string(),
            expected: self.kind().as_str(),
        };

        let value = match (self.kind(), raw) {
            (ValueKind::Bool, Value::Bool(b)) => DesiredValue::Scalar(PropValue::Bool(*b)),
            (ValueKind::Int, Value::Number(n)) => {
                DesiredValue::Scalar(PropValue::Int(n.as_i64().ok_or_else(wrong_type)?))
            }
            (ValueKind::Str, Value::String(s)) => match self {
                PropertyKey::Netvm => DesiredValue::Netvm(NetvmChoice::parse(s)),
                PropertyKey::DefaultDispvm | PropertyKey::Template => {
                    DesiredValue::Scalar(PropValue::Domain(Some(s.clone())))
                }
                _ => DesiredValue::Scalar(PropValue::Text(s.clone())),
            },
            (ValueKind::Map, Value::Object(map)) if *self == PropertyKey::Features => {
                let mut features = BTreeMap::new();
                for (name, value) in map {
                    features.insert(name.clone(), FeatureValue::parse(value).ok_or_else(wrong_type)?);
                }
                DesiredValue::Features(features)
            }
            (ValueKind::Map, Value::Object(map)) => DesiredValue::Volume(VolumeRequest::parse(raw, map)?),
            (ValueKind::List, Value::Array(items)) => {
                let services = items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(wrong_type)?;
                DesiredValue::Services(services)
            }
            _ => return Err(wrong_type()),
        };

        Ok(value)
    }
}

impl FromStr for PropertyKey {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PropertyKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ReconcileError::InvalidProperty(s.to_string()))
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A desired feature value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureValue {
    Set(String),
    Delete,
}

impl FeatureValue {
    fn parse(raw: &Value) -> Option<Self> {
        let text = match raw {
            Value::String(s) => s.clone(),
            Value::Bool(true) => "1".to_string(),
            Value::Bool(false) => String::new(),
            Value::Number(n) => n.to_string(),
            Value::Null => return Some(FeatureValue::Delete),
            _ => return None,
        };
        if text == FEATURE_DELETE_SENTINEL {
            Some(FeatureValue::Delete)
        } else {
            Some(FeatureValue::Set(text))
        }
    }
}

/// A requested volume resize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    pub name: String,
    pub size: u64,
}

impl VolumeRequest {
    fn parse(raw: &Value, map: &serde_json::Map<String, Value>) -> Result<Self, ReconcileError> {
        let name = map
            .get("name")
            .ok_or_else(|| ReconcileError::VolumeMissingName(raw.to_string()))?;
        let size = map
            .get("size")
            .ok_or_else(|| ReconcileError::VolumeMissingSize(raw.to_string()))?;

        let name = name.as_str().ok_or_else(|| ReconcileError::InvalidValueType {
            key: "volume.name".to_string(),
            expected: ValueKind::Str.as_str(),
        })?;
        let size = size.as_u64().ok_or_else(|| ReconcileError::InvalidValueType {
            key: "volume.size".to_string(),
            expected: ValueKind::Int.as_str(),
        })?;

        Ok(Self { name: name.to_string(), size })
    }
}

/// A type-checked desired property value.
#[derive(Debug, Clone, PartialEq)]
pub enum DesiredValue {
    Scalar(PropValue),
    Netvm(NetvmChoice),
    Features(BTreeMap<String, FeatureValue>),
    Services(Vec<String>),
    Volume(VolumeRequest),
}

/// Validated desired properties, iterated in declaration order.
pub type DesiredProperties = BTreeMap<PropertyKey, DesiredValue>;
