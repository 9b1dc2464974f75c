//! Device reconciler: converges device assignments per device class.
//!
//! ## Strategies
//!
//! | Strategy | Live only        | Both, drifted          | Desired only |
//! |----------|------------------|------------------------|--------------|
//! | strict   | unassign         | unassign then reassign | assign       |
//! | append   | left in place    | left in place          | assign       |
//!
//! Classes are processed one after another. A failure in one class does not
//! roll back assignments already changed in another.
//!
//! Repeating an entry is allowed only if every copy asks for the same mode
//! and options.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};

use crate::error::{BackendError, ReconcileError};
use crate::snapshot::{DomainSnapshot, HostSnapshot};
use crate::traits::QubesApi;
use crate::types::*;

/// Device synchronisation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Post-call assignments equal the desired set exactly.
    #[default]
    Strict,
    /// Only add missing assignments; never unassign or touch existing ones.
    Append,
}

/// One desired device, either a bare spec string or a detailed entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DeviceEntry {
    Spec(String),
    Detailed {
        #[serde(alias = "device")]
        spec: String,
        #[serde(default)]
        mode: Option<AssignmentMode>,
        #[serde(default)]
        options: DeviceOptions,
    },
}

impl DeviceEntry {
    fn spec(&self) -> &str {
        match self {
            DeviceEntry::Spec(spec) | DeviceEntry::Detailed { spec, .. } => spec,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DevicePolicyInput {
    List(Vec<DeviceEntry>),
    Explicit {
        #[serde(default)]
        strategy: Strategy,
        #[serde(default)]
        items: Vec<DeviceEntry>,
    },
}

/// Desired device assignments with their sync strategy.
///
/// Deserializes from either a list of entries (strict) or
/// `{strategy: strict|append, items: [...]}`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(from = "DevicePolicyInput")]
pub struct DevicePolicy {
    pub strategy: Strategy,
    pub entries: Vec<DeviceEntry>,
}

impl From<DevicePolicyInput> for DevicePolicy {
    fn from(input: DevicePolicyInput) -> Self {
        match input {
            DevicePolicyInput::List(entries) => Self { strategy: Strategy::Strict, entries },
            DevicePolicyInput::Explicit { strategy, items } => Self { strategy, entries: items },
        }
    }
}

impl DevicePolicy {
    pub fn strict(entries: Vec<DeviceEntry>) -> Self {
        Self { strategy: Strategy::Strict, entries }
    }

    pub fn append(entries: Vec<DeviceEntry>) -> Self {
        Self { strategy: Strategy::Append, entries }
    }
}

/// Result of a device reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceOutcome {
    pub changed: bool,
    pub assigned: Vec<String>,
    pub unassigned: Vec<String>,
}

/// Desired assignments keyed by class, then by identity key.
type DesiredByClass = BTreeMap<String, BTreeMap<DeviceKey, DeviceAssignment>>;

/// A device policy whose entries have all been parsed and resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePlan {
    strategy: Strategy,
    desired: DesiredByClass,
}

/// Parse, classify and resolve every entry. Performs no mutation.
pub async fn prepare(
    api: &dyn QubesApi,
    host: &HostSnapshot,
    policy: &DevicePolicy,
) -> Result<DevicePlan, ReconcileError> {
    let mut desired = DesiredByClass::new();

    for entry in &policy.entries {
        let device: DeviceSpec = entry.spec().parse()?;
        if !host.knows_device_class(&device.devclass) {
            return Err(ReconcileError::UnknownDeviceClass {
                class: device.devclass.clone(),
                spec: entry.spec().to_string(),
            });
        }

        api.resolve_device(&device).await.map_err(|e| match e {
            BackendError::DeviceNotFound(_) => ReconcileError::DeviceNotFound(device.to_string()),
            other => other.into(),
        })?;

        let (mode, options) = match entry {
            DeviceEntry::Spec(_) => (None, DeviceOptions::new()),
            DeviceEntry::Detailed { mode, options, .. } => (*mode, options.clone()),
        };
        let assignment = DeviceAssignment {
            mode: mode.unwrap_or_else(|| AssignmentMode::default_for(&device.devclass)),
            device,
            options,
        };

        let class = desired.entry(assignment.device.devclass.clone()).or_default();
        match class.get(&assignment.device.key()) {
            Some(previous) if *previous != assignment => {
                return Err(ReconcileError::InvalidDeviceSpec {
                    spec: entry.spec().to_string(),
                    reason: "listed twice with different mode or options".to_string(),
                });
            }
            Some(_) => {}
            None => {
                class.insert(assignment.device.key(), assignment);
            }
        }
    }

    Ok(DevicePlan { strategy: policy.strategy, desired })
}

/// Prepare and apply `policy` in one step.
pub async fn reconcile(
    api: &dyn QubesApi,
    host: &HostSnapshot,
    domain: &DomainSnapshot,
    policy: &DevicePolicy,
) -> Result<DeviceOutcome, ReconcileError> {
    let plan = prepare(api, host, policy).await?;
    apply(api, host, domain, &plan).await
}

#[instrument(skip_all, fields(domain = %domain.info.name, strategy = ?plan.strategy))]
pub async fn apply(
    api: &dyn QubesApi,
    host: &HostSnapshot,
    domain: &DomainSnapshot,
    plan: &DevicePlan,
) -> Result<DeviceOutcome, ReconcileError> {
    let desired = &plan.desired;
    let mut outcome = DeviceOutcome::default();

    let classes: BTreeSet<&String> = match plan.strategy {
        Strategy::Strict => host.device_classes.iter().chain(desired.keys()).collect(),
        Strategy::Append => desired.keys().collect(),
    };

    let empty = BTreeMap::new();
    for devclass in classes {
        let wanted = desired.get(devclass).unwrap_or(&empty);
        let current: BTreeMap<DeviceKey, &DeviceAssignment> = domain
            .assignments
            .get(devclass)
            .map(|list| list.iter().map(|a| (a.device.key(), a)).collect())
            .unwrap_or_default();

        let mut sync = ClassSync { api, name: &domain.info.name, outcome: &mut outcome };
        match plan.strategy {
            Strategy::Strict => sync.strict(&current, wanted).await?,
            Strategy::Append => sync.append(&current, wanted).await?,
        }
    }

    if outcome.changed {
        info!(assigned = ?outcome.assigned, unassigned = ?outcome.unassigned, "Devices updated");
    } else {
        debug!("Devices already converged");
    }
    Ok(outcome)
}

struct ClassSync<'a> {
    api: &'a dyn QubesApi,
    name: &'a str,
    outcome: &'a mut DeviceOutcome,
}

impl ClassSync<'_> {
    async fn strict(
        &mut self,
        current: &BTreeMap<DeviceKey, &DeviceAssignment>,
        wanted: &BTreeMap<DeviceKey, DeviceAssignment>,
    ) -> Result<(), ReconcileError> {
        for (key, live) in current {
            if !wanted.contains_key(key) {
                self.unassign(&live.device).await?;
            }
        }

        for (key, target) in wanted {
            match current.get(key) {
                Some(live) if live.mode == target.mode && live.options == target.options => {}
                Some(live) => {
                    debug!(device = %target.device, "Assignment drifted, reassigning");
                    self.unassign(&live.device).await?;
                    self.assign(target).await?;
                }
                None => self.assign(target).await?,
            }
        }
        Ok(())
    }

    async fn append(
        &mut self,
        current: &BTreeMap<DeviceKey, &DeviceAssignment>,
        wanted: &BTreeMap<DeviceKey, DeviceAssignment>,
    ) -> Result<(), ReconcileError> {
        for (key, target) in wanted {
            if !current.contains_key(key) {
                self.assign(target).await?;
            }
        }
        Ok(())
    }

    async fn assign(&mut self, assignment: &DeviceAssignment) -> Result<(), ReconcileError> {
        let spec = assignment.device.to_string();
        debug!(device = %spec, mode = ?assignment.mode, "Assigning device");
        self.api
            .assign_device(self.name, assignment)
            .await
            .map_err(|e| ReconcileError::AssignFailed { spec: spec.clone(), reason: e.to_string() })?;
        self.outcome.changed = true;
        self.outcome.assigned.push(spec);
        Ok(())
    }

    async fn unassign(&mut self, device: &DeviceSpec) -> Result<(), ReconcileError> {
        let spec = device.to_string();
        debug!(device = %spec, "Unassigning device");
        self.api
            .unassign_device(self.name, device)
            .await
            .map_err(|e| ReconcileError::UnassignFailed { spec: spec.clone(), reason: e.to_string() })?;
        self.outcome.changed = true;
        self.outcome.unassigned.push(spec);
        Ok(())
    }
}

// =============================================================================
// DEVICE FACTS
// =============================================================================

const NET_INTERFACE: &str = "p02";
const USB_INTERFACE: &str = "p0c03";
const AUDIO_INTERFACE: &str = "p0403";

/// PCI devices exposed by `dom0`, grouped by interface class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceFacts {
    pub pci_net: Vec<String>,
    pub pci_usb: Vec<String>,
    pub pci_audio: Vec<String>,
}

/// Read-only inventory of the host's PCI devices.
pub async fn gather_facts(api: &dyn QubesApi) -> Result<DeviceFacts, ReconcileError> {
    let mut facts = DeviceFacts::default();

    for info in api.available_devices(ADMIN_DOMAIN, "pci").await? {
        let Some(interface) = info.interfaces.first() else {
            continue;
        };
        let spec = DeviceSpec::new("pci", ADMIN_DOMAIN, info.device.port_id.clone()).to_string();
        if interface.starts_with(NET_INTERFACE) {
            facts.pci_net.push(spec);
        } else if interface.starts_with(USB_INTERFACE) {
            facts.pci_usb.push(spec);
        } else if interface.starts_with(AUDIO_INTERFACE) {
            facts.pci_audio.push(spec);
        }
    }

    debug!(
        net = facts.pci_net.len(),
        usb = facts.pci_usb.len(),
        audio = facts.pci_audio.len(),
        "Gathered device facts"
    );
    Ok(facts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockQubes;
    use serde_json::json;

    async fn sync(api: &MockQubes, name: &str, policy: DevicePolicy) -> Result<DeviceOutcome, ReconcileError> {
        let host = HostSnapshot::capture(api).await.unwrap();
        let domain = DomainSnapshot::capture(api, name, &host.device_classes).await.unwrap();
        reconcile(api, &host, &domain, &policy).await
    }

    fn entries(specs: &[&str]) -> Vec<DeviceEntry> {
        specs.iter().map(|s| DeviceEntry::Spec(s.to_string())).collect()
    }

    #[test]
    fn test_policy_deserializes_both_shapes() {
        let policy: DevicePolicy = serde_json::from_value(json!(["pci:dom0:00_05.0"])).unwrap();
        assert_eq!(policy.strategy, Strategy::Strict);
        assert_eq!(policy.entries.len(), 1);

        let policy: DevicePolicy = serde_json::from_value(json!({
            "strategy": "append",
            "items": [
                "block:dom0:vdb",
                {"device": "pci:dom0:00_05.0", "mode": "required", "options": {"no-strict-reset": true}}
            ]
        }))
        .unwrap();
        assert_eq!(policy.strategy, Strategy::Append);
        assert!(matches!(
            &policy.entries[1],
            DeviceEntry::Detailed { spec, mode: Some(AssignmentMode::Required), options }
                if spec == "pci:dom0:00_05.0" && options.contains_key("no-strict-reset")
        ));
    }

    #[tokio::test]
    async fn test_strict_leaves_identical_assignment_untouched() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        api.seed_assignment("work", "pci:dom0:00_05.0", AssignmentMode::Required);
        api.seed_assignment("work", "block:dom0:vdb", AssignmentMode::AutoAttach);
        api.clear_calls();

        let outcome = sync(&api, "work", DevicePolicy::strict(entries(&["pci:dom0:00_05.0"])))
            .await
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.unassigned, vec!["block:dom0:vdb".to_string()]);
        assert!(outcome.assigned.is_empty());
        assert_eq!(api.assigned_specs("work"), vec!["pci:dom0:00_05.0".to_string()]);
        assert!(api.calls().iter().all(|c| !c.contains("00_05.0")));
    }

    #[tokio::test]
    async fn test_strict_converges_to_desired_set() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        api.seed_assignment("work", "pci:dom0:00_06.0", AssignmentMode::Required);

        let desired = ["pci:dom0:00_05.0", "pci:dom0:00_14.0", "block:dom0:vdb"];
        sync(&api, "work", DevicePolicy::strict(entries(&desired))).await.unwrap();

        let mut expected: Vec<String> = desired.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(api.assigned_specs("work"), expected);

        let again = sync(&api, "work", DevicePolicy::strict(entries(&desired))).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_strict_reassigns_on_mode_drift() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        api.seed_assignment("work", "block:dom0:vdb", AssignmentMode::AutoAttach);

        let entry = DeviceEntry::Detailed {
            spec: "block:dom0:vdb".into(),
            mode: Some(AssignmentMode::Required),
            options: DeviceOptions::from([("read-only".to_string(), json!(true))]),
        };
        let outcome = sync(&api, "work", DevicePolicy::strict(vec![entry])).await.unwrap();
        assert_eq!(outcome.unassigned, vec!["block:dom0:vdb".to_string()]);
        assert_eq!(outcome.assigned, vec!["block:dom0:vdb".to_string()]);

        let live = api.assignments_of("work", "block");
        assert_eq!(live[0].mode, AssignmentMode::Required);
        assert_eq!(live[0].options.get("read-only"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_append_never_unassigns_or_fixes_drift() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        api.seed_assignment("work", "pci:dom0:00_05.0", AssignmentMode::AutoAttach);

        let policy = DevicePolicy::append(vec![
            DeviceEntry::Detailed {
                spec: "pci:dom0:00_05.0".into(),
                mode: Some(AssignmentMode::Required),
                options: DeviceOptions::new(),
            },
            DeviceEntry::Spec("pci:dom0:00_14.0".into()),
            DeviceEntry::Spec("block:dom0:vdb".into()),
        ]);
        let outcome = sync(&api, "work", policy).await.unwrap();
        assert!(outcome.unassigned.is_empty());
        assert_eq!(outcome.assigned.len(), 2);

        let pci = api.assignments_of("work", "pci");
        let kept = pci.iter().find(|a| a.device.port_id == "00_05.0").unwrap();
        assert_eq!(kept.mode, AssignmentMode::AutoAttach);
        let added = pci.iter().find(|a| a.device.port_id == "00_14.0").unwrap();
        assert_eq!(added.mode, AssignmentMode::Required);
        assert_eq!(api.assignments_of("work", "block")[0].mode, AssignmentMode::AutoAttach);
    }

    #[tokio::test]
    async fn test_bad_entries_fail_before_any_mutation() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        api.seed_assignment("work", "block:dom0:vdb", AssignmentMode::AutoAttach);
        api.clear_calls();

        let err = sync(&api, "work", DevicePolicy::strict(entries(&["pci:dom0"]))).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidDeviceSpec { .. }));

        let err = sync(&api, "work", DevicePolicy::strict(entries(&["gpu:dom0:1"]))).await.unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownDeviceClass { ref class, .. } if class == "gpu"));

        let err = sync(&api, "work", DevicePolicy::strict(entries(&["pci:dom0:ff_00.0"])))
            .await
            .unwrap_err();
        assert_eq!(err, ReconcileError::DeviceNotFound("pci:dom0:ff_00.0".into()));

        assert!(api.calls().is_empty());
        assert_eq!(api.assigned_specs("work"), vec!["block:dom0:vdb".to_string()]);
    }

    #[tokio::test]
    async fn test_conflicting_duplicate_entries_are_rejected() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);

        let conflicting: DevicePolicy = serde_json::from_value(json!([
            "pci:dom0:00_05.0",
            {"device": "pci:dom0:00_05.0", "mode": "ask-to-attach"}
        ]))
        .unwrap();
        let err = sync(&api, "work", conflicting).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidDeviceSpec { ref spec, .. } if spec == "pci:dom0:00_05.0"));
        assert!(api.assigned_specs("work").is_empty());

        let repeated = DevicePolicy::strict(entries(&["pci:dom0:00_05.0", "pci:dom0:00_05.0"]));
        let outcome = sync(&api, "work", repeated).await.unwrap();
        assert_eq!(outcome.assigned, vec!["pci:dom0:00_05.0".to_string()]);
    }

    #[tokio::test]
    async fn test_assign_failure_names_device() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        api.add_domain("other", Klass::AppVM);
        api.seed_assignment("other", "pci:dom0:00_05.0", AssignmentMode::Required);

        // PCI devices can only be attached to one domain at a time.
        let err = sync(&api, "work", DevicePolicy::strict(entries(&["block:dom0:vdb", "pci:dom0:00_05.0"])))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::AssignFailed { ref spec, .. } if spec == "pci:dom0:00_05.0"));
        // The block class was processed first and stays applied.
        assert_eq!(api.assigned_specs("work"), vec!["block:dom0:vdb".to_string()]);
    }

    #[tokio::test]
    async fn test_facts_group_by_interface() {
        let api = MockQubes::with_defaults();
        let facts = gather_facts(&api).await.unwrap();
        assert_eq!(facts.pci_net, vec!["pci:dom0:00_05.0".to_string(), "pci:dom0:00_06.0".to_string()]);
        assert_eq!(facts.pci_usb, vec!["pci:dom0:00_14.0".to_string()]);
        assert_eq!(facts.pci_audio, vec!["pci:dom0:00_1f.3".to_string()]);
    }
}
