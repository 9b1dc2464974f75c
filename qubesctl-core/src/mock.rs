//! In-memory management layer for testing and development.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument};

use crate::error::{BackendError, ReconcileError, Result};
use crate::schema::PropertyKey;
use crate::traits::{NewDomain, QubesApi};
use crate::types::*;

const DEFAULT_PRIVATE_SIZE: u64 = 2048;
const DEFAULT_ROOT_SIZE: u64 = 10240;

/// Mock management layer.
///
/// Simulates a Qubes host in memory without talking to `qubesd`. Useful for:
/// - Unit and integration testing
/// - Dry runs of a request against a described host (`--world host.yaml`)
///
/// Power transitions requested through `shutdown` and `kill` can be made to
/// lag behind by a number of state reads, or to never complete at all.
pub struct MockQubes {
    host: RwLock<MockHost>,
    calls: Mutex<Vec<String>>,
    unreachable: AtomicBool,
}

#[derive(Default)]
struct MockHost {
    domains: BTreeMap<String, MockDomain>,
    default_netvm: Option<String>,
    default_template: Option<String>,
    device_classes: Vec<String>,
    devices: Vec<DeviceInfo>,
    shutdown_lag: u32,
    kill_lag: u32,
    unresponsive: BTreeSet<String>,
    exit_before_kill: BTreeSet<String>,
    fail_resize: bool,
}

#[derive(Clone)]
struct MockDomain {
    klass: Klass,
    state: PowerState,
    properties: DomainProperties,
    features: BTreeMap<String, String>,
    tags: BTreeSet<String>,
    volumes: BTreeMap<String, u64>,
    assignments: BTreeMap<String, Vec<DeviceAssignment>>,
    pending: Option<Pending>,
}

/// A transition that completes after `reads_left` more state reads.
#[derive(Clone, Copy)]
struct Pending {
    target: PowerState,
    reads_left: u32,
}

impl MockDomain {
    fn new(klass: Klass, properties: DomainProperties) -> Self {
        let volumes = match klass {
            Klass::AppVM | Klass::DispVM => BTreeMap::from([("private".to_string(), DEFAULT_PRIVATE_SIZE)]),
            Klass::StandaloneVM | Klass::TemplateVM => BTreeMap::from([
                ("private".to_string(), DEFAULT_PRIVATE_SIZE),
                ("root".to_string(), DEFAULT_ROOT_SIZE),
            ]),
            Klass::AdminVM => BTreeMap::new(),
        };
        Self {
            klass,
            state: PowerState::Shutdown,
            properties,
            features: BTreeMap::new(),
            tags: BTreeSet::new(),
            volumes,
            assignments: BTreeMap::new(),
            pending: None,
        }
    }

    fn info(&self, name: &str) -> DomainInfo {
        DomainInfo {
            name: name.to_string(),
            klass: self.klass,
            state: self.state,
            label: self.properties.label.clone(),
            provides_network: self.properties.provides_network,
            template_for_dispvms: self.properties.template_for_dispvms,
        }
    }

    /// Advance a pending transition by one observation.
    fn tick(&mut self) {
        if let Some(mut pending) = self.pending.take() {
            if pending.reads_left == 0 {
                self.state = pending.target;
            } else {
                pending.reads_left -= 1;
                self.pending = Some(pending);
            }
        }
    }

    fn halt(&mut self, lag: u32) {
        if lag == 0 {
            self.state = PowerState::Shutdown;
            self.pending = None;
        } else {
            self.pending = Some(Pending { target: PowerState::Shutdown, reads_left: lag - 1 });
        }
    }
}

impl MockHost {
    fn domain(&self, name: &str) -> Result<&MockDomain> {
        self.domains
            .get(name)
            .ok_or_else(|| BackendError::DomainNotFound(name.to_string()))
    }

    fn domain_mut(&mut self, name: &str) -> Result<&mut MockDomain> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| BackendError::DomainNotFound(name.to_string()))
    }

    fn insert(&mut self, name: &str, klass: Klass, configure: impl FnOnce(&mut DomainProperties)) {
        let mut properties = DomainProperties::default();
        if matches!(klass, Klass::AppVM | Klass::DispVM) {
            properties.template = self.default_template.clone();
            properties.netvm = self.default_netvm.clone();
        }
        configure(&mut properties);
        self.domains.insert(name.to_string(), MockDomain::new(klass, properties));
    }

    fn expose(&mut self, spec: DeviceSpec, interface: &str, description: &str) {
        self.devices.push(DeviceInfo {
            device: spec,
            interfaces: vec![interface.to_string()],
            description: description.to_string(),
        });
    }

    /// Domain other than `except` holding an assignment with `key`.
    fn holder_of(&self, key: &DeviceKey, except: &str) -> Option<&str> {
        self.domains.iter().find_map(|(name, d)| {
            let holds = d
                .assignments
                .get(&key.0)
                .is_some_and(|list| list.iter().any(|a| &a.device.key() == key));
            (holds && name != except).then_some(name.as_str())
        })
    }
}

impl MockQubes {
    /// Create an empty mock host.
    pub fn new() -> Self {
        info!("Creating mock management layer");
        Self {
            host: RwLock::new(MockHost::default()),
            calls: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
        }
    }

    /// A small but complete host: `dom0`, a network chain, a template, a
    /// disposable template and a USB qube, with PCI, block, mic and USB
    /// devices to assign.
    pub fn with_defaults() -> Self {
        let mock = Self::new();
        {
            let mut host = mock.host_mut();
            host.default_template = Some("fedora-40".to_string());
            host.default_netvm = Some("sys-firewall".to_string());
            host.device_classes = ["block", "mic", "pci", "usb"].map(String::from).to_vec();

            host.insert(ADMIN_DOMAIN, Klass::AdminVM, |p| {
                p.label = "black".to_string();
                p.netvm = None;
            });
            host.insert("fedora-40", Klass::TemplateVM, |p| p.label = "black".to_string());
            host.insert("sys-net", Klass::AppVM, |p| {
                p.provides_network = true;
                p.netvm = None;
            });
            host.insert("sys-firewall", Klass::AppVM, |p| {
                p.label = "green".to_string();
                p.provides_network = true;
                p.netvm = Some("sys-net".to_string());
            });
            host.insert("sys-usb", Klass::AppVM, |p| p.netvm = None);
            host.insert("default-dvm", Klass::AppVM, |p| {
                p.label = "gray".to_string();
                p.template_for_dispvms = true;
            });
            for name in [ADMIN_DOMAIN, "sys-net", "sys-firewall", "sys-usb"] {
                if let Some(domain) = host.domains.get_mut(name) {
                    domain.state = PowerState::Running;
                }
            }

            for (port, interface, description) in [
                ("00_02.0", "p030000", "VGA compatible controller"),
                ("00_05.0", "p020000", "Ethernet controller"),
                ("00_06.0", "p028000", "Network controller"),
                ("00_14.0", "p0c0330", "USB controller"),
                ("00_1f.3", "p040300", "Audio device"),
            ] {
                host.expose(DeviceSpec::new("pci", ADMIN_DOMAIN, port), interface, description);
            }
            host.expose(DeviceSpec::new("block", ADMIN_DOMAIN, "vdb"), "b******", "Data disk");
            host.expose(DeviceSpec::new("mic", ADMIN_DOMAIN, "mic"), "m******", "Microphone");
            host.expose(DeviceSpec::new("usb", "sys-usb", "2-1"), "u080650", "Mass storage");
        }
        mock
    }

    /// Seed a mock host from a world description.
    pub fn from_world(world: World) -> std::result::Result<Self, ReconcileError> {
        let mock = Self::new();
        {
            let mut host = mock.host_mut();
            host.default_netvm = world.default_netvm;
            host.default_template = world.default_template;
            host.device_classes = world.device_classes;

            for device in world.devices {
                let spec: DeviceSpec = device.spec.parse()?;
                host.devices.push(DeviceInfo {
                    device: spec,
                    interfaces: device.interfaces,
                    description: device.description,
                });
            }

            for seed in world.domains {
                let mut domain = MockDomain::new(seed.klass, seed.properties);
                domain.state = seed.state;
                domain.features = seed.features;
                domain.tags = seed.tags;
                domain.volumes.extend(seed.volumes);
                for entry in seed.assignments {
                    let device: DeviceSpec = entry.device.parse()?;
                    let mode = entry
                        .mode
                        .unwrap_or_else(|| AssignmentMode::default_for(&device.devclass));
                    domain
                        .assignments
                        .entry(device.devclass.clone())
                        .or_default()
                        .push(DeviceAssignment { device, mode, options: entry.options });
                }
                host.domains.insert(seed.name, domain);
            }
        }
        Ok(mock)
    }

    /// Describe the current host as a world, e.g. to persist it after a run.
    pub fn to_world(&self) -> World {
        let host = self.host_ref();
        World {
            default_netvm: host.default_netvm.clone(),
            default_template: host.default_template.clone(),
            device_classes: host.device_classes.clone(),
            devices: host
                .devices
                .iter()
                .map(|d| WorldDevice {
                    spec: d.device.to_string(),
                    interfaces: d.interfaces.clone(),
                    description: d.description.clone(),
                })
                .collect(),
            domains: host
                .domains
                .iter()
                .map(|(name, d)| WorldDomain {
                    name: name.clone(),
                    klass: d.klass,
                    state: d.state,
                    properties: d.properties.clone(),
                    features: d.features.clone(),
                    tags: d.tags.clone(),
                    volumes: d.volumes.clone(),
                    assignments: d
                        .assignments
                        .values()
                        .flatten()
                        .map(|a| WorldAssignment {
                            device: a.device.to_string(),
                            mode: Some(a.mode),
                            options: a.options.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    fn host_ref(&self) -> RwLockReadGuard<'_, MockHost> {
        self.host.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn host_mut(&self) -> RwLockWriteGuard<'_, MockHost> {
        self.host.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MockHost>> {
        self.ensure_reachable()?;
        self.host
            .read()
            .map_err(|_| BackendError::Internal("Lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MockHost>> {
        self.ensure_reachable()?;
        self.host
            .write()
            .map_err(|_| BackendError::Internal("Lock poisoned".to_string()))
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionFailed("qubesd is not responding".to_string()));
        }
        Ok(())
    }

    fn record(&self, call: String) {
        debug!(call = %call, "Mock mutation");
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    // =========================================================================
    // Test controls
    // =========================================================================

    /// Add a halted domain of `klass` with default properties.
    pub fn add_domain(&self, name: &str, klass: Klass) {
        self.host_mut().insert(name, klass, |_| {});
    }

    /// Add a halted AppVM that provides network.
    pub fn add_netvm(&self, name: &str) {
        self.host_mut().insert(name, Klass::AppVM, |p| p.provides_network = true);
    }

    pub fn has_domain(&self, name: &str) -> bool {
        self.host_ref().domains.contains_key(name)
    }

    /// Current state without advancing pending transitions.
    pub fn state_of(&self, name: &str) -> PowerState {
        self.host_ref()
            .domains
            .get(name)
            .map(|d| d.state)
            .unwrap_or_default()
    }

    /// Set the state directly and drop any pending transition.
    pub fn force_state(&self, name: &str, state: PowerState) {
        if let Some(domain) = self.host_mut().domains.get_mut(name) {
            domain.state = state;
            domain.pending = None;
        }
    }

    pub fn properties_of(&self, name: &str) -> DomainProperties {
        self.host_ref()
            .domains
            .get(name)
            .map(|d| d.properties.clone())
            .unwrap_or_default()
    }

    pub fn features_of(&self, name: &str) -> BTreeMap<String, String> {
        self.host_ref()
            .domains
            .get(name)
            .map(|d| d.features.clone())
            .unwrap_or_default()
    }

    pub fn set_live_feature(&self, name: &str, feature: &str, value: &str) {
        if let Some(domain) = self.host_mut().domains.get_mut(name) {
            domain.features.insert(feature.to_string(), value.to_string());
        }
    }

    pub fn tags_of(&self, name: &str) -> BTreeSet<String> {
        self.host_ref()
            .domains
            .get(name)
            .map(|d| d.tags.clone())
            .unwrap_or_default()
    }

    pub fn set_live_tag(&self, name: &str, tag: &str) {
        if let Some(domain) = self.host_mut().domains.get_mut(name) {
            domain.tags.insert(tag.to_string());
        }
    }

    pub fn volume_size(&self, name: &str, volume: &str) -> Option<u64> {
        self.host_ref()
            .domains
            .get(name)
            .and_then(|d| d.volumes.get(volume).copied())
    }

    pub fn set_default_netvm(&self, netvm: Option<&str>) {
        self.host_mut().default_netvm = netvm.map(str::to_string);
    }

    /// Attach a device without going through `assign_device`. Not recorded.
    /// Malformed specs are ignored.
    pub fn seed_assignment(&self, name: &str, spec: &str, mode: AssignmentMode) {
        let Ok(device) = spec.parse::<DeviceSpec>() else {
            return;
        };
        if let Some(domain) = self.host_mut().domains.get_mut(name) {
            domain
                .assignments
                .entry(device.devclass.clone())
                .or_default()
                .push(DeviceAssignment { device, mode, options: DeviceOptions::new() });
        }
    }

    pub fn assignments_of(&self, name: &str, devclass: &str) -> Vec<DeviceAssignment> {
        self.host_ref()
            .domains
            .get(name)
            .and_then(|d| d.assignments.get(devclass).cloned())
            .unwrap_or_default()
    }

    /// All assigned device specs of `name`, sorted.
    pub fn assigned_specs(&self, name: &str) -> Vec<String> {
        let mut specs: Vec<String> = self
            .host_ref()
            .domains
            .get(name)
            .map(|d| d.assignments.values().flatten().map(|a| a.device.to_string()).collect())
            .unwrap_or_default();
        specs.sort();
        specs
    }

    /// `shutdown` completes after this many further state reads.
    pub fn set_shutdown_lag(&self, reads: u32) {
        self.host_mut().shutdown_lag = reads;
    }

    /// `kill` completes after this many further state reads.
    pub fn set_kill_lag(&self, reads: u32) {
        self.host_mut().kill_lag = reads;
    }

    /// Accept `shutdown` and `kill` for `name` but never halt it.
    pub fn set_unresponsive(&self, name: &str) {
        self.host_mut().unresponsive.insert(name.to_string());
    }

    /// Halt `name` on its own just before the next `kill` reaches it.
    pub fn set_exit_before_kill(&self, name: &str) {
        self.host_mut().exit_before_kill.insert(name.to_string());
    }

    /// Make every `resize_volume` call fail.
    pub fn set_resize_failure(&self, fail: bool) {
        self.host_mut().fail_resize = fail;
    }

    /// Make every call fail with `ConnectionFailed`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Mutating calls that took effect so far, e.g. `"remove work"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for MockQubes {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QubesApi for MockQubes {
    async fn health_check(&self) -> Result<bool> {
        self.ensure_reachable()?;
        Ok(true)
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>> {
        let host = self.read()?;
        Ok(host.domains.iter().map(|(name, d)| d.info(name)).collect())
    }

    async fn get_domain(&self, name: &str) -> Result<DomainInfo> {
        let mut host = self.write()?;
        let domain = host.domain_mut(name)?;
        domain.tick();
        Ok(domain.info(name))
    }

    async fn default_netvm(&self) -> Result<Option<String>> {
        Ok(self.read()?.default_netvm.clone())
    }

    async fn default_template(&self) -> Result<Option<String>> {
        Ok(self.read()?.default_template.clone())
    }

    #[instrument(skip(self, domain), fields(domain = %domain.name, klass = %domain.klass))]
    async fn create_domain(&self, domain: &NewDomain) -> Result<()> {
        let mut host = self.write()?;

        if host.domains.contains_key(&domain.name) {
            return Err(BackendError::OperationFailed(format!(
                "VM {} already exists",
                domain.name
            )));
        }
        if let Some(ref template) = domain.template {
            if host.domain(template)?.klass != Klass::TemplateVM {
                return Err(BackendError::OperationFailed(format!(
                    "{} is not a TemplateVM",
                    template
                )));
            }
        } else if domain.klass == Klass::AppVM {
            return Err(BackendError::OperationFailed(
                "AppVM requires a template".to_string(),
            ));
        }

        let label = domain.label.clone();
        let template = domain.template.clone();
        host.insert(&domain.name, domain.klass, |p| {
            p.label = label;
            p.template = template;
        });
        self.record(format!("create {}", domain.name));
        info!("Mock domain created");
        Ok(())
    }

    #[instrument(skip(self, source, name), fields(domain = %name, source = %source))]
    async fn clone_domain(&self, source: &str, name: &str, klass: Klass) -> Result<()> {
        let mut host = self.write()?;

        if host.domains.contains_key(name) {
            return Err(BackendError::OperationFailed(format!("VM {} already exists", name)));
        }
        let mut copy = host.domain(source)?.clone();
        copy.klass = klass;
        copy.state = PowerState::Shutdown;
        copy.pending = None;
        copy.tags.clear();
        copy.assignments.clear();
        copy.properties.template = None;
        copy.volumes.entry("root".to_string()).or_insert(DEFAULT_ROOT_SIZE);
        host.domains.insert(name.to_string(), copy);
        self.record(format!("clone {} {}", source, name));
        info!("Mock domain cloned");
        Ok(())
    }

    #[instrument(skip(self, name), fields(domain = %name))]
    async fn remove_domain(&self, name: &str) -> Result<()> {
        let mut host = self.write()?;

        let domain = host.domain(name)?;
        if domain.klass == Klass::AdminVM {
            return Err(BackendError::OperationFailed("cannot remove dom0".to_string()));
        }
        if domain.state != PowerState::Shutdown {
            return Err(BackendError::InvalidState(format!("{} is {}", name, domain.state)));
        }
        host.domains.remove(name);
        self.record(format!("remove {}", name));
        info!("Mock domain removed");
        Ok(())
    }

    #[instrument(skip(self, name), fields(domain = %name))]
    async fn start(&self, name: &str) -> Result<()> {
        let mut host = self.write()?;
        let domain = host.domain_mut(name)?;
        if domain.state != PowerState::Shutdown {
            return Err(BackendError::InvalidState(format!("{} is {}", name, domain.state)));
        }
        domain.state = PowerState::Running;
        domain.pending = None;
        self.record(format!("start {}", name));
        info!("Mock domain started");
        Ok(())
    }

    #[instrument(skip(self, name), fields(domain = %name))]
    async fn shutdown(&self, name: &str) -> Result<()> {
        let mut host = self.write()?;
        let lag = host.shutdown_lag;
        let unresponsive = host.unresponsive.contains(name);
        let domain = host.domain_mut(name)?;
        if domain.state == PowerState::Shutdown {
            return Err(BackendError::NotRunning(name.to_string()));
        }
        if !unresponsive {
            domain.halt(lag);
        }
        self.record(format!("shutdown {}", name));
        info!("Mock domain shutdown requested");
        Ok(())
    }

    #[instrument(skip(self, name), fields(domain = %name))]
    async fn kill(&self, name: &str) -> Result<()> {
        let mut host = self.write()?;
        let lag = host.kill_lag;
        let unresponsive = host.unresponsive.contains(name);
        let exits_first = host.exit_before_kill.remove(name);
        let domain = host.domain_mut(name)?;
        if exits_first {
            domain.halt(0);
        }
        if domain.state == PowerState::Shutdown {
            return Err(BackendError::NotRunning(name.to_string()));
        }
        if !unresponsive {
            domain.halt(lag);
        }
        self.record(format!("kill {}", name));
        info!("Mock domain killed");
        Ok(())
    }

    async fn pause(&self, name: &str) -> Result<()> {
        let mut host = self.write()?;
        let domain = host.domain_mut(name)?;
        if domain.state != PowerState::Running {
            return Err(BackendError::InvalidState("VM is not running".to_string()));
        }
        domain.state = PowerState::Paused;
        self.record(format!("pause {}", name));
        Ok(())
    }

    async fn unpause(&self, name: &str) -> Result<()> {
        let mut host = self.write()?;
        let domain = host.domain_mut(name)?;
        if domain.state != PowerState::Paused {
            return Err(BackendError::InvalidState("VM is not paused".to_string()));
        }
        domain.state = PowerState::Running;
        self.record(format!("unpause {}", name));
        Ok(())
    }

    async fn get_properties(&self, name: &str) -> Result<DomainProperties> {
        Ok(self.read()?.domain(name)?.properties.clone())
    }

    async fn set_property(&self, name: &str, key: PropertyKey, value: PropValue) -> Result<()> {
        let mut host = self.write()?;
        let domain = host.domain_mut(name)?;
        domain
            .properties
            .set(key, value)
            .map_err(BackendError::OperationFailed)?;
        self.record(format!("set {} {}", name, key));
        Ok(())
    }

    async fn get_features(&self, name: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.read()?.domain(name)?.features.clone())
    }

    async fn set_feature(&self, name: &str, feature: &str, value: &str) -> Result<()> {
        let mut host = self.write()?;
        host.domain_mut(name)?
            .features
            .insert(feature.to_string(), value.to_string());
        self.record(format!("feature {} {}", name, feature));
        Ok(())
    }

    async fn remove_feature(&self, name: &str, feature: &str) -> Result<()> {
        let mut host = self.write()?;
        host.domain_mut(name)?.features.remove(feature);
        self.record(format!("unfeature {} {}", name, feature));
        Ok(())
    }

    async fn get_tags(&self, name: &str) -> Result<BTreeSet<String>> {
        Ok(self.read()?.domain(name)?.tags.clone())
    }

    async fn add_tag(&self, name: &str, tag: &str) -> Result<()> {
        let mut host = self.write()?;
        host.domain_mut(name)?.tags.insert(tag.to_string());
        self.record(format!("tag {} {}", name, tag));
        Ok(())
    }

    async fn remove_tag(&self, name: &str, tag: &str) -> Result<()> {
        let mut host = self.write()?;
        if !host.domain_mut(name)?.tags.remove(tag) {
            return Err(BackendError::TagNotFound(tag.to_string()));
        }
        self.record(format!("untag {} {}", name, tag));
        Ok(())
    }

    async fn resize_volume(&self, name: &str, volume: &str, size: u64) -> Result<bool> {
        let mut host = self.write()?;
        if host.fail_resize {
            return Err(BackendError::OperationFailed("storage pool is full".to_string()));
        }
        let current = host
            .domain_mut(name)?
            .volumes
            .get_mut(volume)
            .ok_or_else(|| BackendError::OperationFailed(format!("no volume {}", volume)))?;

        if size < *current {
            return Err(BackendError::OperationFailed(format!(
                "shrinking {} from {} to {} is not supported",
                volume, current, size
            )));
        }
        let resized = size > *current;
        *current = size;
        self.record(format!("resize {} {}", name, volume));
        Ok(resized)
    }

    async fn device_classes(&self) -> Result<Vec<String>> {
        Ok(self.read()?.device_classes.clone())
    }

    async fn available_devices(&self, backend: &str, devclass: &str) -> Result<Vec<DeviceInfo>> {
        let host = self.read()?;
        host.domain(backend)?;
        let mut devices: Vec<DeviceInfo> = host
            .devices
            .iter()
            .filter(|d| d.device.backend == backend && d.device.devclass == devclass)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.device.port_id.cmp(&b.device.port_id));
        Ok(devices)
    }

    async fn resolve_device(&self, spec: &DeviceSpec) -> Result<DeviceInfo> {
        let host = self.read()?;
        host.devices
            .iter()
            .find(|d| d.device.key() == spec.key())
            .cloned()
            .ok_or_else(|| BackendError::DeviceNotFound(spec.to_string()))
    }

    async fn assigned_devices(&self, name: &str, devclass: &str) -> Result<Vec<DeviceAssignment>> {
        let host = self.read()?;
        Ok(host
            .domain(name)?
            .assignments
            .get(devclass)
            .cloned()
            .unwrap_or_default())
    }

    #[instrument(skip(self, name, assignment), fields(domain = %name, device = %assignment.device))]
    async fn assign_device(&self, name: &str, assignment: &DeviceAssignment) -> Result<()> {
        let mut host = self.write()?;
        let key = assignment.device.key();

        if assignment.device.devclass == "pci" {
            if let Some(holder) = host.holder_of(&key, name) {
                return Err(BackendError::OperationFailed(format!(
                    "{} is already attached to {}",
                    assignment.device, holder
                )));
            }
        }

        let list = host
            .domain_mut(name)?
            .assignments
            .entry(assignment.device.devclass.clone())
            .or_default();
        if list.iter().any(|a| a.device.key() == key) {
            return Err(BackendError::OperationFailed(format!(
                "{} is already assigned",
                assignment.device
            )));
        }
        list.push(assignment.clone());
        self.record(format!("assign {} {}", name, assignment.device));
        info!("Mock device assigned");
        Ok(())
    }

    #[instrument(skip(self, name, device), fields(domain = %name, device = %device))]
    async fn unassign_device(&self, name: &str, device: &DeviceSpec) -> Result<()> {
        let mut host = self.write()?;
        let key = device.key();
        let list = host
            .domain_mut(name)?
            .assignments
            .entry(device.devclass.clone())
            .or_default();
        let before = list.len();
        list.retain(|a| a.device.key() != key);
        if list.len() == before {
            return Err(BackendError::DeviceNotFound(device.to_string()));
        }
        self.record(format!("unassign {} {}", name, device));
        info!("Mock device unassigned");
        Ok(())
    }
}

// =============================================================================
// WORLD FILES
// =============================================================================

/// Serializable description of a mock host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct World {
    pub default_netvm: Option<String>,
    pub default_template: Option<String>,
    pub device_classes: Vec<String>,
    pub devices: Vec<WorldDevice>,
    pub domains: Vec<WorldDomain>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldDevice {
    pub spec: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldDomain {
    pub name: String,
    #[serde(default)]
    pub klass: Klass,
    #[serde(default)]
    pub state: PowerState,
    #[serde(default)]
    pub properties: DomainProperties,
    #[serde(default)]
    pub features: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub volumes: BTreeMap<String, u64>,
    #[serde(default)]
    pub assignments: Vec<WorldAssignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldAssignment {
    pub device: String,
    #[serde(default)]
    pub mode: Option<AssignmentMode>,
    #[serde(default)]
    pub options: DeviceOptions,
}

impl World {
    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn to_yaml(&self) -> std::result::Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);

        api.start("work").await.unwrap();
        assert_eq!(api.get_domain("work").await.unwrap().state, PowerState::Running);
        assert!(api.start("work").await.is_err());

        api.pause("work").await.unwrap();
        api.unpause("work").await.unwrap();
        assert!(matches!(api.remove_domain("work").await, Err(BackendError::InvalidState(_))));

        api.kill("work").await.unwrap();
        assert!(matches!(api.kill("work").await, Err(BackendError::NotRunning(_))));
        api.remove_domain("work").await.unwrap();
        assert!(matches!(api.get_domain("work").await, Err(BackendError::DomainNotFound(_))));
    }

    #[tokio::test]
    async fn test_shutdown_lag_counts_reads() {
        let api = MockQubes::with_defaults();
        api.set_shutdown_lag(2);

        api.shutdown("sys-usb").await.unwrap();
        assert_eq!(api.get_domain("sys-usb").await.unwrap().state, PowerState::Running);
        assert_eq!(api.get_domain("sys-usb").await.unwrap().state, PowerState::Shutdown);
    }

    #[tokio::test]
    async fn test_unreachable_fails_every_call() {
        let api = MockQubes::with_defaults();
        api.set_unreachable(true);
        assert!(matches!(api.health_check().await, Err(BackendError::ConnectionFailed(_))));
        assert!(matches!(api.list_domains().await, Err(BackendError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_refused_calls_are_not_recorded() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);

        assert!(api.kill("work").await.is_err());
        assert!(api.remove_domain("dom0").await.is_err());
        api.set_unreachable(true);
        assert!(api.start("work").await.is_err());
        assert!(api.calls().is_empty());

        api.set_unreachable(false);
        api.start("work").await.unwrap();
        assert_eq!(api.calls(), vec!["start work".to_string()]);
    }

    #[tokio::test]
    async fn test_exit_before_kill_reports_not_running() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        api.start("work").await.unwrap();
        api.set_exit_before_kill("work");

        assert!(matches!(api.kill("work").await, Err(BackendError::NotRunning(_))));
        assert_eq!(api.state_of("work"), PowerState::Shutdown);
    }

    #[tokio::test]
    async fn test_volume_grow_only() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);

        assert!(api.resize_volume("work", "private", 4096).await.unwrap());
        assert!(!api.resize_volume("work", "private", 4096).await.unwrap());
        assert!(api.resize_volume("work", "private", 1024).await.is_err());
        assert_eq!(api.volume_size("work", "private"), Some(4096));
    }

    #[tokio::test]
    async fn test_world_round_trip_preserves_state() {
        let yaml = r#"
default_netvm: sys-net
default_template: debian-12
device_classes: [pci]
devices:
  - spec: "pci:dom0:00_05.0"
    interfaces: [p020000]
domains:
  - name: debian-12
    klass: TemplateVM
  - name: sys-net
    state: running
    properties:
      provides_network: true
    assignments:
      - device: "pci:dom0:00_05.0"
"#;
        let world = World::from_yaml(yaml).unwrap();
        let api = MockQubes::from_world(world).unwrap();

        let net = api.get_domain("sys-net").await.unwrap();
        assert!(net.provides_network);
        assert_eq!(net.state, PowerState::Running);
        assert_eq!(api.assignments_of("sys-net", "pci")[0].mode, AssignmentMode::Required);

        let again = MockQubes::from_world(World::from_yaml(&api.to_world().to_yaml().unwrap()).unwrap())
            .unwrap();
        assert_eq!(again.assigned_specs("sys-net"), vec!["pci:dom0:00_05.0".to_string()]);
        assert_eq!(again.to_world(), api.to_world());
    }
}
