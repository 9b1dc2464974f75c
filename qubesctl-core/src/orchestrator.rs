//! Orchestrator: the single entry point turning one request into a response.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::devices::{self, DeviceFacts, DeviceOutcome};
use crate::error::{BackendError, ErrorKind, ReconcileError};
use crate::inventory;
use crate::power::{CreateSpec, PowerAction, PowerMachine, Transition};
use crate::properties;
use crate::request::{Directive, DomainCommand, HostCommand, Request};
use crate::schema::{DesiredProperties, DesiredValue, PropertyKey};
use crate::snapshot::{DomainSnapshot, HostSnapshot};
use crate::traits::QubesApi;
use crate::types::*;
use crate::validator;

/// Process status returned to the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    Failed = 1,
    Unavailable = 2,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Summary of one domain as reported by `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainSummary {
    pub state: PowerState,
    pub provides_network: bool,
    pub label: String,
}

/// Successful result payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Converged {
        changed: bool,
        #[serde(rename = "Properties updated")]
        properties_updated: Vec<PropertyKey>,
        #[serde(skip_serializing_if = "Option::is_none")]
        created: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tags_added: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        devices: Option<DeviceOutcome>,
    },
    Transition(Transition),
    Created {
        changed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        created: Option<String>,
    },
    Executed {
        changed: bool,
        command: &'static str,
    },
    Status {
        status: PowerState,
    },
    TagsRemoved {
        #[serde(rename = "Message")]
        message: &'static str,
        changed: bool,
        removed: Vec<String>,
    },
    Domains {
        list_vms: Vec<String>,
    },
    Info(BTreeMap<String, DomainSummary>),
    States {
        states: Vec<String>,
    },
    Inventory {
        status: &'static str,
    },
    DeviceFacts(DeviceFacts),
}

impl Reply {
    /// Whether the call mutated anything.
    pub fn changed(&self) -> bool {
        match self {
            Reply::Converged { changed, .. }
            | Reply::Created { changed, .. }
            | Reply::Executed { changed, .. }
            | Reply::TagsRemoved { changed, .. } => *changed,
            Reply::Transition(t) => t.changed,
            Reply::Status { .. }
            | Reply::Domains { .. }
            | Reply::Info(_)
            | Reply::States { .. }
            | Reply::Inventory { .. }
            | Reply::DeviceFacts(_) => false,
        }
    }
}

/// Outcome of one orchestration call. Callers branch on [`Response::status`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(Reply),
    Failed(ReconcileError),
    Unavailable(String),
}

impl Response {
    pub fn status(&self) -> Status {
        match self {
            Response::Success(_) => Status::Success,
            Response::Failed(_) => Status::Failed,
            Response::Unavailable(_) => Status::Unavailable,
        }
    }

    /// JSON document for the front end.
    pub fn to_json(&self) -> Value {
        match self {
            Response::Success(reply) => json!({
                "rc": self.status().code(),
                "result": reply,
            }),
            Response::Failed(e) => json!({
                "rc": self.status().code(),
                "msg": e.to_string(),
            }),
            Response::Unavailable(msg) => json!({
                "rc": self.status().code(),
                "msg": msg,
            }),
        }
    }

    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Response::Success(reply) => Some(reply),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ReconcileError> {
        match self {
            Response::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Result<Reply, ReconcileError>> for Response {
    fn from(result: Result<Reply, ReconcileError>) -> Self {
        match result {
            Ok(reply) => Response::Success(reply),
            Err(e) if e.kind() == ErrorKind::Unavailable => Response::Unavailable(e.to_string()),
            Err(e) => Response::Failed(e),
        }
    }
}

/// Runs requests against a management layer.
pub struct Orchestrator {
    api: Arc<dyn QubesApi>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn QubesApi>, config: EngineConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle one request. Never panics; every failure becomes a response.
    #[instrument(skip_all, fields(domain = ?request.name, state = ?request.state, command = ?request.command))]
    pub async fn handle(&self, request: &Request) -> Response {
        let response: Response = self.run(request).await.into();
        match &response {
            Response::Success(reply) => info!(changed = reply.changed(), "Request succeeded"),
            Response::Failed(e) => warn!(error = %e, "Request failed"),
            Response::Unavailable(msg) => error!(error = %msg, "Management layer unavailable"),
        }
        response
    }

    async fn run(&self, request: &Request) -> Result<Reply, ReconcileError> {
        let directive = request.directive()?;
        debug!(directive = ?directive, "Resolved directive");

        match self.api.health_check().await {
            Ok(true) => {}
            Ok(false) => return Err(ReconcileError::Unavailable("health check failed".to_string())),
            Err(e) => return Err(ReconcileError::Unavailable(e.to_string())),
        }

        let host = HostSnapshot::capture(self.api.as_ref()).await?;
        let desired = match &request.properties {
            Some(raw) if !raw.is_empty() && directive != Directive::GatherFacts => {
                let klass = request
                    .name
                    .as_deref()
                    .and_then(|name| host.domain(name))
                    .map(|d| d.klass)
                    .unwrap_or_else(|| self.request_klass(request));
                validator::validate(raw, klass, self.request_label(request), &host)?
            }
            _ => DesiredProperties::new(),
        };

        match directive {
            Directive::GatherFacts => Ok(Reply::DeviceFacts(
                devices::gather_facts(self.api.as_ref()).await?,
            )),
            Directive::Converge { name } => self.converge(request, &host, &name, &desired).await,
            Directive::Power { name, intent } => {
                let create = self.create_spec(request, &name, &desired);
                let machine = self.power();
                let transition = machine.converge(&name, intent, request.wait, Some(&create)).await?;
                if transition.actions.contains(&PowerAction::Create) {
                    self.add_tags(&name, &BTreeSet::new(), &request.tags).await?;
                }
                Ok(Reply::Transition(transition))
            }
            Directive::Domain { name, command } => {
                self.domain_command(request, &name, command, &desired).await
            }
            Directive::Host { command, filter } => self.host_command(&host, command, filter).await,
        }
    }

    fn power(&self) -> PowerMachine<'_> {
        PowerMachine::new(self.api.as_ref(), &self.config)
    }

    fn request_klass(&self, request: &Request) -> Klass {
        request.klass.unwrap_or(self.config.defaults.klass)
    }

    fn request_label<'r>(&'r self, request: &'r Request) -> &'r str {
        request.label.as_deref().unwrap_or(&self.config.defaults.label)
    }

    fn create_spec(&self, request: &Request, name: &str, desired: &DesiredProperties) -> CreateSpec {
        let netvm = match desired.get(&PropertyKey::Netvm) {
            Some(DesiredValue::Netvm(choice)) => choice.clone(),
            _ => NetvmChoice::Default,
        };
        CreateSpec {
            name: name.to_string(),
            klass: self.request_klass(request),
            label: self.request_label(request).to_string(),
            template: request.template().map(str::to_string),
            netvm,
        }
    }

    /// Create if missing, then properties, tags and devices, in that order.
    async fn converge(
        &self,
        request: &Request,
        host: &HostSnapshot,
        name: &str,
        desired: &DesiredProperties,
    ) -> Result<Reply, ReconcileError> {
        let api = self.api.as_ref();
        let plan = match &request.devices {
            Some(policy) => Some(devices::prepare(api, host, policy).await?),
            None => None,
        };

        let created = if host.domain(name).is_none() {
            self.power().create(&self.create_spec(request, name, desired)).await?;
            Some(name.to_string())
        } else {
            None
        };

        let domain = DomainSnapshot::capture(api, name, &host.device_classes).await?;
        let props = properties::reconcile(api, host, &domain, desired).await?;
        let tags_added = self.add_tags(name, &domain.tags, &request.tags).await?;
        let devices = match plan {
            Some(plan) => Some(devices::apply(api, host, &domain, &plan).await?),
            None => None,
        };

        let changed = created.is_some()
            || props.changed
            || !tags_added.is_empty()
            || devices.as_ref().is_some_and(|d| d.changed);
        Ok(Reply::Converged {
            changed,
            properties_updated: props.changed_fields,
            created,
            tags_added,
            devices,
        })
    }

    /// Attach each tag not already present. Returns the tags added.
    async fn add_tags(
        &self,
        name: &str,
        current: &BTreeSet<String>,
        tags: &[String],
    ) -> Result<Vec<String>, ReconcileError> {
        let mut added = Vec::new();
        for tag in tags {
            if current.contains(tag) || added.contains(tag) {
                continue;
            }
            self.api.add_tag(name, tag).await?;
            added.push(tag.clone());
        }
        if !added.is_empty() {
            debug!(domain = %name, tags = ?added, "Tags added");
        }
        Ok(added)
    }

    async fn domain_command(
        &self,
        request: &Request,
        name: &str,
        command: DomainCommand,
        desired: &DesiredProperties,
    ) -> Result<Reply, ReconcileError> {
        let api = self.api.as_ref();
        let executed = |command: &'static str| Reply::Executed { changed: true, command };

        match command {
            DomainCommand::Create => {
                let exists = match api.get_domain(name).await {
                    Ok(_) => true,
                    Err(BackendError::DomainNotFound(_)) => false,
                    Err(e) => return Err(e.into()),
                };
                if exists {
                    return Ok(Reply::Created { changed: false, created: None });
                }
                self.power().create(&self.create_spec(request, name, desired)).await?;
                Ok(Reply::Created { changed: true, created: Some(name.to_string()) })
            }
            DomainCommand::Destroy => {
                self.power().destroy(name).await?;
                Ok(executed("destroy"))
            }
            DomainCommand::Pause => {
                api.pause(name).await?;
                Ok(executed("pause"))
            }
            DomainCommand::Shutdown => {
                api.shutdown(name).await?;
                Ok(executed("shutdown"))
            }
            DomainCommand::Start => {
                api.start(name).await?;
                Ok(executed("start"))
            }
            DomainCommand::Unpause => {
                api.unpause(name).await?;
                Ok(executed("unpause"))
            }
            DomainCommand::Status => Ok(Reply::Status { status: self.power().status(name).await? }),
            DomainCommand::RemoveTags => self.remove_tags(name, &request.tags).await,
            DomainCommand::Remove => Ok(Reply::Transition(
                self.power().converge(name, Intent::Absent, false, None).await?,
            )),
        }
    }

    async fn remove_tags(&self, name: &str, tags: &[String]) -> Result<Reply, ReconcileError> {
        if tags.is_empty() {
            return Err(ReconcileError::MissingTags);
        }
        self.api.get_domain(name).await?;

        let mut removed = Vec::new();
        for tag in tags {
            match self.api.remove_tag(name, tag).await {
                Ok(()) => removed.push(tag.clone()),
                Err(BackendError::TagNotFound(_)) => debug!(tag = %tag, "Tag not attached"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Reply::TagsRemoved {
            message: "Removed the tag(s).",
            changed: !removed.is_empty(),
            removed,
        })
    }

    async fn host_command(
        &self,
        host: &HostSnapshot,
        command: HostCommand,
        filter: Option<PowerState>,
    ) -> Result<Reply, ReconcileError> {
        let guests = host.domains.values().filter(|d| d.name != ADMIN_DOMAIN);

        let reply = match command {
            HostCommand::ListVms => Reply::Domains {
                list_vms: guests
                    .filter(|d| filter.map_or(true, |state| d.state == state))
                    .map(|d| d.name.clone())
                    .collect(),
            },
            HostCommand::Info => Reply::Info(
                guests
                    .map(|d| {
                        let summary = DomainSummary {
                            state: d.state,
                            provides_network: d.provides_network,
                            label: d.label.clone(),
                        };
                        (d.name.clone(), summary)
                    })
                    .collect(),
            ),
            HostCommand::GetStates => Reply::States {
                states: host
                    .domains
                    .values()
                    .map(|d| format!("{} {}", d.name, d.state))
                    .collect(),
            },
            HostCommand::CreateInventory => {
                let domains: Vec<DomainInfo> = host.domains.values().cloned().collect();
                inventory::create(&domains, &self.config.inventory_path)?;
                Reply::Inventory { status: "successful" }
            }
        };
        Ok(reply)
    }
}
