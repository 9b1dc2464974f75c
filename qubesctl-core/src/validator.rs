//! Pre-flight validation of a desired-properties payload.
//!
//! Runs before any mutation. The first violation aborts the whole request.

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ReconcileError;
use crate::schema::{DesiredProperties, DesiredValue, PropertyKey};
use crate::snapshot::HostSnapshot;
use crate::types::{Klass, NetvmChoice, PropValue, KNOWN_LABELS};

/// Validate `raw` for a domain of class `klass` created with `label`.
pub fn validate(
    raw: &Map<String, Value>,
    klass: Klass,
    label: &str,
    host: &HostSnapshot,
) -> Result<DesiredProperties, ReconcileError> {
    validate_label(label)?;

    let mut desired = DesiredProperties::new();
    for (name, value) in raw {
        let key: PropertyKey = name.parse()?;
        let value = key.parse_value(value)?;
        check_references(key, &value, klass, host)?;
        desired.insert(key, value);
    }

    debug!(keys = desired.len(), klass = %klass, "Properties validated");
    Ok(desired)
}

pub fn validate_label(label: &str) -> Result<(), ReconcileError> {
    if KNOWN_LABELS.contains(&label) {
        Ok(())
    } else {
        Err(ReconcileError::InvalidLabel(label.to_string()))
    }
}

fn check_references(
    key: PropertyKey,
    value: &DesiredValue,
    klass: Klass,
    host: &HostSnapshot,
) -> Result<(), ReconcileError> {
    match (key, value) {
        (PropertyKey::Netvm, DesiredValue::Netvm(NetvmChoice::Named(name))) => {
            let netvm = host
                .domain(name)
                .ok_or_else(|| ReconcileError::MissingNetvm(name.clone()))?;
            if !netvm.provides_network {
                return Err(ReconcileError::NetvmCapability(name.clone()));
            }
        }
        (PropertyKey::DefaultDispvm, DesiredValue::Scalar(PropValue::Domain(Some(name)))) => {
            let dispvm = host
                .domain(name)
                .ok_or_else(|| ReconcileError::MissingDefaultDispvm(name.clone()))?;
            if !dispvm.template_for_dispvms {
                return Err(ReconcileError::DispvmCapability(name.clone()));
            }
        }
        (PropertyKey::Template, DesiredValue::Scalar(PropValue::Domain(Some(name)))) => {
            match host.domain(name) {
                Some(template) if template.klass == Klass::TemplateVM => {}
                _ => return Err(ReconcileError::MissingTemplate(name.clone())),
            }
        }
        (PropertyKey::Label, DesiredValue::Scalar(PropValue::Text(label))) => {
            validate_label(label)?;
        }
        (PropertyKey::Volume, DesiredValue::Volume(volume)) => {
            let allowed = klass.resizable_volumes();
            if !allowed.contains(&volume.name.as_str()) {
                return Err(ReconcileError::WrongVolumeName {
                    name: volume.name.clone(),
                    allowed: allowed.to_vec(),
                });
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DomainInfo, PowerState};
    use serde_json::json;

    fn domain(name: &str, klass: Klass, provides_network: bool, dispvm_template: bool) -> DomainInfo {
        DomainInfo {
            name: name.to_string(),
            klass,
            state: PowerState::Shutdown,
            label: "red".to_string(),
            provides_network,
            template_for_dispvms: dispvm_template,
        }
    }

    fn host() -> HostSnapshot {
        let mut host = HostSnapshot::default();
        for d in [
            domain("sys-firewall", Klass::AppVM, true, false),
            domain("work", Klass::AppVM, false, false),
            domain("default-dvm", Klass::AppVM, false, true),
            domain("fedora-40", Klass::TemplateVM, false, false),
        ] {
            host.domains.insert(d.name.clone(), d);
        }
        host
    }

    fn props(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_accepts_well_formed_payload() {
        let raw = props(json!({
            "memory": 800,
            "netvm": "sys-firewall",
            "default_dispvm": "default-dvm",
            "template": "fedora-40",
            "features": {"gui": "1"},
        }));
        let desired = validate(&raw, Klass::AppVM, "blue", &host()).unwrap();
        assert_eq!(desired.len(), 5);
    }

    #[test]
    fn test_rejects_unknown_key_and_wrong_type() {
        let err = validate(&props(json!({"titi": "toto"})), Klass::AppVM, "red", &host()).unwrap_err();
        assert!(err.to_string().starts_with("Invalid property"));

        let err = validate(&props(json!({"memory": "big"})), Klass::AppVM, "red", &host()).unwrap_err();
        assert!(err.to_string().contains("Invalid property value type"));
    }

    #[test]
    fn test_netvm_must_exist_and_provide_network() {
        let err = validate(&props(json!({"netvm": "toto"})), Klass::AppVM, "red", &host()).unwrap_err();
        assert_eq!(err, ReconcileError::MissingNetvm("toto".into()));

        let err = validate(&props(json!({"netvm": "work"})), Klass::AppVM, "red", &host()).unwrap_err();
        assert_eq!(err, ReconcileError::NetvmCapability("work".into()));

        for sentinel in ["", "none", "None", "*default*", "default"] {
            assert!(validate(&props(json!({"netvm": sentinel})), Klass::AppVM, "red", &host()).is_ok());
        }
    }

    #[test]
    fn test_default_dispvm_must_be_dispvm_template() {
        let err = validate(&props(json!({"default_dispvm": "toto"})), Klass::AppVM, "red", &host())
            .unwrap_err();
        assert_eq!(err, ReconcileError::MissingDefaultDispvm("toto".into()));

        let err = validate(&props(json!({"default_dispvm": "work"})), Klass::AppVM, "red", &host())
            .unwrap_err();
        assert_eq!(err, ReconcileError::DispvmCapability("work".into()));
    }

    #[test]
    fn test_default_dispvm_has_no_sentinels() {
        for value in ["", "none", "None", "default", "*default*"] {
            let err = validate(&props(json!({"default_dispvm": value})), Klass::AppVM, "red", &host())
                .unwrap_err();
            assert_eq!(err, ReconcileError::MissingDefaultDispvm(value.into()));
        }
    }

    #[test]
    fn test_volume_name_depends_on_klass() {
        let private = props(json!({"volume": {"name": "private", "size": 10}}));
        let root = props(json!({"volume": {"name": "root", "size": 10}}));

        assert!(validate(&private, Klass::AppVM, "red", &host()).is_ok());
        let err = validate(&root, Klass::AppVM, "red", &host()).unwrap_err();
        assert!(err.to_string().starts_with("Wrong volume name"));
        assert!(validate(&root, Klass::StandaloneVM, "red", &host()).is_ok());
        assert!(validate(&root, Klass::TemplateVM, "red", &host()).is_ok());
    }

    #[test]
    fn test_labels_and_templates_are_checked() {
        let err = validate(&Map::new(), Klass::AppVM, "pink", &host()).unwrap_err();
        assert_eq!(err, ReconcileError::InvalidLabel("pink".into()));

        let err = validate(&props(json!({"template": "work"})), Klass::AppVM, "red", &host())
            .unwrap_err();
        assert_eq!(err, ReconcileError::MissingTemplate("work".into()));
    }
}
