//! Power state machine.
//!
//! ```text
//!            start                pause
//!  shutdown ───────▶ running ◀───────────▶ paused
//!     ▲  ▲   shutdown/kill │     unpause      │
//!     │  └─────────────────┘                  │
//!     └───────────────── kill ────────────────┘
//! ```
//!
//! Every transition reports `changed = true` only if an action was issued.
//! Waiting is bounded by a [`PollPolicy`]; exhausting it is a `Timeout` error.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::{EngineConfig, PollPolicy};
use crate::error::{BackendError, ReconcileError};
use crate::schema::PropertyKey;
use crate::traits::{NewDomain, QubesApi};
use crate::types::*;
use crate::validator::validate_label;

/// An action issued against a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Create,
    Start,
    Unpause,
    Shutdown,
    Kill,
    Pause,
    Remove,
}

/// Result of a power transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub changed: bool,
    pub actions: Vec<PowerAction>,
}

impl Transition {
    fn unchanged() -> Self {
        Self::default()
    }

    fn with(actions: Vec<PowerAction>) -> Self {
        Self { changed: !actions.is_empty(), actions }
    }
}

/// Parameters for creating a missing domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    pub name: String,
    pub klass: Klass,
    pub label: String,
    pub template: Option<String>,
    pub netvm: NetvmChoice,
}

/// Drives one domain through power transitions.
pub struct PowerMachine<'a> {
    api: &'a dyn QubesApi,
    config: &'a EngineConfig,
}

impl<'a> PowerMachine<'a> {
    pub fn new(api: &'a dyn QubesApi, config: &'a EngineConfig) -> Self {
        Self { api, config }
    }

    /// Registry entry for `name`, or `None` if the domain does not exist.
    async fn observe(&self, name: &str) -> Result<Option<DomainInfo>, ReconcileError> {
        match self.api.get_domain(name).await {
            Ok(info) => Ok(Some(info)),
            Err(BackendError::DomainNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Current state of `name`. Fails if the domain does not exist.
    pub async fn status(&self, name: &str) -> Result<PowerState, ReconcileError> {
        self.observe(name)
            .await?
            .map(|info| info.state)
            .ok_or_else(|| ReconcileError::DomainNotFound(name.to_string()))
    }

    /// Force-stop `name` right away. `dom0` is refused before any call.
    pub async fn destroy(&self, name: &str) -> Result<(), ReconcileError> {
        let info = self
            .observe(name)
            .await?
            .ok_or_else(|| ReconcileError::DomainNotFound(name.to_string()))?;
        guard(&info, "destroy")?;
        self.api.kill(name).await?;
        Ok(())
    }

    /// Converge `name` towards `intent`.
    ///
    /// `create` is used only for `Intent::Present` on a missing domain.
    #[instrument(skip(self, name, create), fields(domain = %name))]
    pub async fn converge(
        &self,
        name: &str,
        intent: Intent,
        wait: bool,
        create: Option<&CreateSpec>,
    ) -> Result<Transition, ReconcileError> {
        let observed = self.observe(name).await?;
        if let Some(info) = &observed {
            match intent {
                Intent::Absent => guard(info, "remove")?,
                Intent::Destroyed => guard(info, "destroy")?,
                _ => {}
            }
        }
        let current = observed.map(|info| info.state);
        debug!(current = ?current, "Observed power state");

        let transition = match (intent, current) {
            (Intent::Absent, None) => Transition::unchanged(),
            (Intent::Absent, Some(state)) => self.remove(name, state).await?,
            (Intent::Present, None) => match create {
                Some(spec) => {
                    self.create(spec).await?;
                    Transition::with(vec![PowerAction::Create])
                }
                None => return Err(ReconcileError::DomainNotFound(name.to_string())),
            },
            (Intent::Present, Some(_)) => Transition::unchanged(),
            (_, None) => return Err(ReconcileError::DomainNotFound(name.to_string())),

            (Intent::Running, Some(PowerState::Running)) => Transition::unchanged(),
            (Intent::Running, Some(PowerState::Paused)) => {
                self.api.unpause(name).await?;
                Transition::with(vec![PowerAction::Unpause])
            }
            (Intent::Running, Some(_)) => {
                self.api.start(name).await?;
                Transition::with(vec![PowerAction::Start])
            }

            (Intent::Shutdown, Some(PowerState::Shutdown)) => Transition::unchanged(),
            (Intent::Shutdown, Some(_)) => {
                self.api.shutdown(name).await?;
                if wait {
                    self.wait_for(name, PowerState::Shutdown, &self.config.shutdown_wait)
                        .await?;
                }
                Transition::with(vec![PowerAction::Shutdown])
            }

            (Intent::Destroyed, Some(PowerState::Shutdown)) => Transition::unchanged(),
            (Intent::Destroyed, Some(_)) => {
                self.api.kill(name).await?;
                Transition::with(vec![PowerAction::Kill])
            }

            (Intent::Paused, Some(PowerState::Running)) => {
                self.api.pause(name).await?;
                Transition::with(vec![PowerAction::Pause])
            }
            (Intent::Paused, Some(_)) => Transition::unchanged(),
        };

        if transition.changed {
            info!(intent = ?intent, actions = ?transition.actions, "Power transition applied");
        }
        Ok(transition)
    }

    /// Kill if needed, wait for `shutdown`, then delete the definition.
    async fn remove(&self, name: &str, state: PowerState) -> Result<Transition, ReconcileError> {
        let mut actions = Vec::new();

        if state != PowerState::Shutdown {
            match self.api.kill(name).await {
                Ok(()) => actions.push(PowerAction::Kill),
                Err(BackendError::NotRunning(_)) => debug!("Domain already stopped"),
                Err(e) => return Err(e.into()),
            }
            self.wait_for(name, PowerState::Shutdown, &self.config.removal_wait)
                .await?;
        }

        self.api.remove_domain(name).await?;
        actions.push(PowerAction::Remove);
        Ok(Transition::with(actions))
    }

    /// Poll until `name` is observed in `target` or the policy is exhausted.
    pub async fn wait_for(
        &self,
        name: &str,
        target: PowerState,
        policy: &PollPolicy,
    ) -> Result<(), ReconcileError> {
        if self.status(name).await? == target {
            return Ok(());
        }

        for attempt in 0..policy.max_attempts {
            tokio::time::sleep(policy.delay(attempt)).await;
            if self.status(name).await? == target {
                debug!(attempts = attempt + 1, state = %target, "Domain reached state");
                return Ok(());
            }
        }

        warn!(domain = %name, state = %target, attempts = policy.max_attempts, "Gave up waiting");
        Err(ReconcileError::Timeout {
            name: name.to_string(),
            target,
            attempts: policy.max_attempts,
        })
    }

    /// Define a new domain.
    #[instrument(skip(self, spec), fields(domain = %spec.name, klass = %spec.klass))]
    pub async fn create(&self, spec: &CreateSpec) -> Result<(), ReconcileError> {
        validate_label(&spec.label)?;

        let template = match &spec.template {
            Some(template) => Some(template.clone()),
            None => self.config.defaults.template.clone(),
        };

        if spec.klass.is_cloned() {
            let source = template.ok_or_else(|| ReconcileError::CreateRejected {
                name: spec.name.clone(),
                reason: format!("{} requires a template to clone", spec.klass),
            })?;
            self.api.clone_domain(&source, &spec.name, spec.klass).await?;
            if spec.klass == Klass::StandaloneVM {
                self.api
                    .set_property(&spec.name, PropertyKey::Label, PropValue::Text(spec.label.clone()))
                    .await?;
            }
        } else if spec.klass == Klass::AdminVM {
            return Err(ReconcileError::CreateRejected {
                name: spec.name.clone(),
                reason: "AdminVM domains cannot be created".to_string(),
            });
        } else {
            let template = match template {
                Some(t) => Some(t),
                None => self.api.default_template().await?,
            };
            self.api
                .create_domain(&NewDomain {
                    name: spec.name.clone(),
                    klass: spec.klass,
                    label: spec.label.clone(),
                    template,
                })
                .await?;
        }

        match &spec.netvm {
            NetvmChoice::Default => {}
            NetvmChoice::None => {
                self.api
                    .set_property(&spec.name, PropertyKey::Netvm, PropValue::Domain(None))
                    .await?;
            }
            NetvmChoice::Named(netvm) => {
                self.api
                    .set_property(&spec.name, PropertyKey::Netvm, PropValue::Domain(Some(netvm.clone())))
                    .await?;
            }
        }

        info!("Domain created");
        Ok(())
    }
}

/// Reject destructive actions against the admin domain.
fn guard(info: &DomainInfo, action: &'static str) -> Result<(), ReconcileError> {
    if info.klass == Klass::AdminVM {
        return Err(ReconcileError::ProtectedDomain {
            name: info.name.clone(),
            action,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::MockQubes;

    fn spec(name: &str, klass: Klass, template: Option<&str>) -> CreateSpec {
        CreateSpec {
            name: name.to_string(),
            klass,
            label: "green".to_string(),
            template: template.map(str::to_string),
            netvm: NetvmChoice::Default,
        }
    }

    #[tokio::test]
    async fn test_running_transitions() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);

        let t = machine.converge("work", Intent::Running, false, None).await.unwrap();
        assert_eq!(t.actions, vec![PowerAction::Start]);

        let t = machine.converge("work", Intent::Running, false, None).await.unwrap();
        assert!(!t.changed);

        machine.converge("work", Intent::Paused, false, None).await.unwrap();
        assert_eq!(machine.status("work").await.unwrap(), PowerState::Paused);

        let t = machine.converge("work", Intent::Paused, false, None).await.unwrap();
        assert!(!t.changed);

        let t = machine.converge("work", Intent::Running, false, None).await.unwrap();
        assert_eq!(t.actions, vec![PowerAction::Unpause]);
    }

    #[tokio::test]
    async fn test_pause_from_shutdown_is_noop() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);

        let t = machine.converge("work", Intent::Paused, false, None).await.unwrap();
        assert!(!t.changed);
        let t = machine.converge("work", Intent::Destroyed, false, None).await.unwrap();
        assert!(!t.changed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_and_without_wait() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        api.set_shutdown_lag(3);
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);

        machine.converge("work", Intent::Running, false, None).await.unwrap();
        let t = machine.converge("work", Intent::Shutdown, false, None).await.unwrap();
        assert_eq!(t.actions, vec![PowerAction::Shutdown]);
        assert_eq!(api.state_of("work"), PowerState::Running);

        api.force_state("work", PowerState::Running);
        machine.converge("work", Intent::Shutdown, true, None).await.unwrap();
        assert_eq!(api.state_of("work"), PowerState::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_kills_waits_and_removes() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        api.set_kill_lag(2);
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);
        machine.converge("work", Intent::Running, false, None).await.unwrap();

        let t = machine.converge("work", Intent::Absent, false, None).await.unwrap();
        assert_eq!(t.actions, vec![PowerAction::Kill, PowerAction::Remove]);
        assert!(!api.has_domain("work"));

        let t = machine.converge("work", Intent::Absent, false, None).await.unwrap();
        assert!(!t.changed);
    }

    #[tokio::test]
    async fn test_absent_on_halted_domain_skips_kill() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        api.clear_calls();
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);

        let t = machine.converge("work", Intent::Absent, false, None).await.unwrap();
        assert_eq!(t.actions, vec![PowerAction::Remove]);
        assert_eq!(api.calls(), vec!["remove work".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_domain_times_out() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);
        machine.converge("work", Intent::Running, false, None).await.unwrap();
        api.set_unresponsive("work");

        let err = machine.converge("work", Intent::Absent, false, None).await.unwrap_err();
        assert_eq!(
            err,
            ReconcileError::Timeout {
                name: "work".into(),
                target: PowerState::Shutdown,
                attempts: config.removal_wait.max_attempts,
            }
        );
        assert!(api.has_domain("work"));
    }

    #[tokio::test]
    async fn test_admin_domain_is_never_stopped_or_removed() {
        let api = MockQubes::with_defaults();
        api.clear_calls();
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);

        for intent in [Intent::Absent, Intent::Destroyed] {
            let err = machine.converge("dom0", intent, false, None).await.unwrap_err();
            assert!(matches!(err, ReconcileError::ProtectedDomain { .. }));
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert!(machine.destroy("dom0").await.is_err());

        assert!(api.calls().is_empty());
        assert_eq!(api.state_of("dom0"), PowerState::Running);
    }

    #[tokio::test]
    async fn test_absent_tolerates_domain_exiting_before_kill() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);
        machine.converge("work", Intent::Running, false, None).await.unwrap();
        api.set_exit_before_kill("work");
        api.clear_calls();

        let t = machine.converge("work", Intent::Absent, false, None).await.unwrap();
        assert_eq!(t.actions, vec![PowerAction::Remove]);
        assert_eq!(api.calls(), vec!["remove work".to_string()]);
        assert!(!api.has_domain("work"));
    }

    #[tokio::test]
    async fn test_crashed_domain_is_killed() {
        let api = MockQubes::with_defaults();
        api.add_domain("work", Klass::AppVM);
        api.add_domain("gone", Klass::AppVM);
        api.force_state("work", PowerState::Crashed);
        api.force_state("gone", PowerState::Crashed);
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);

        let t = machine.converge("work", Intent::Destroyed, false, None).await.unwrap();
        assert_eq!(t.actions, vec![PowerAction::Kill]);
        assert_eq!(api.state_of("work"), PowerState::Shutdown);

        let t = machine.converge("gone", Intent::Absent, false, None).await.unwrap();
        assert_eq!(t.actions, vec![PowerAction::Kill, PowerAction::Remove]);
        assert!(!api.has_domain("gone"));
    }

    #[tokio::test]
    async fn test_present_creates_once() {
        let api = MockQubes::with_defaults();
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);
        let create = spec("work", Klass::AppVM, None);

        let t = machine.converge("work", Intent::Present, false, Some(&create)).await.unwrap();
        assert_eq!(t.actions, vec![PowerAction::Create]);
        assert_eq!(api.properties_of("work").template.as_deref(), Some("fedora-40"));
        assert_eq!(api.properties_of("work").label, "green");

        let t = machine.converge("work", Intent::Present, false, Some(&create)).await.unwrap();
        assert!(!t.changed);
    }

    #[tokio::test]
    async fn test_standalone_requires_template() {
        let api = MockQubes::with_defaults();
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);

        let err = machine.create(&spec("sa", Klass::StandaloneVM, None)).await.unwrap_err();
        assert!(matches!(err, ReconcileError::CreateRejected { .. }));

        machine.create(&spec("sa", Klass::StandaloneVM, Some("fedora-40"))).await.unwrap();
        let info = api.get_domain("sa").await.unwrap();
        assert_eq!(info.klass, Klass::StandaloneVM);
        assert_eq!(info.label, "green");
    }

    #[tokio::test]
    async fn test_missing_domain_fails_power_targets() {
        let api = MockQubes::with_defaults();
        let config = EngineConfig::default();
        let machine = PowerMachine::new(&api, &config);

        let err = machine.converge("ghost", Intent::Running, false, None).await.unwrap_err();
        assert_eq!(err, ReconcileError::DomainNotFound("ghost".into()));
    }
}
