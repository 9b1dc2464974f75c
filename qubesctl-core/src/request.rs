//! Request documents and their resolution into a single directive.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::devices::DevicePolicy;
use crate::error::ReconcileError;
use crate::types::{Intent, Klass, PowerState};

/// Template value meaning "use the system default".
const DEFAULT_TEMPLATE: &str = "default";

/// One request, as handed over by the front end.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Request {
    #[serde(alias = "guest")]
    pub name: Option<String>,
    /// Target intent. Kept as text so unknown values fail as a directive error.
    pub state: Option<String>,
    pub command: Option<String>,
    #[serde(alias = "vmtype")]
    pub klass: Option<Klass>,
    pub label: Option<String>,
    pub template: Option<String>,
    pub properties: Option<Map<String, Value>>,
    pub tags: Vec<String>,
    pub devices: Option<DevicePolicy>,
    /// Wait for `state: shutdown` to be observed
    pub wait: bool,
    pub gather_device_facts: bool,
}

/// Commands acting on the named domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainCommand {
    Create,
    Destroy,
    Pause,
    Shutdown,
    Start,
    Unpause,
    Status,
    RemoveTags,
    Remove,
}

/// Commands acting on the whole host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    Info,
    ListVms,
    GetStates,
    CreateInventory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Domain(DomainCommand),
    Host(HostCommand),
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Domain(DomainCommand::Create) => "create",
            Command::Domain(DomainCommand::Destroy) => "destroy",
            Command::Domain(DomainCommand::Pause) => "pause",
            Command::Domain(DomainCommand::Shutdown) => "shutdown",
            Command::Domain(DomainCommand::Start) => "start",
            Command::Domain(DomainCommand::Unpause) => "unpause",
            Command::Domain(DomainCommand::Status) => "status",
            Command::Domain(DomainCommand::RemoveTags) => "removetags",
            Command::Domain(DomainCommand::Remove) => "remove",
            Command::Host(HostCommand::Info) => "info",
            Command::Host(HostCommand::ListVms) => "list_vms",
            Command::Host(HostCommand::GetStates) => "get_states",
            Command::Host(HostCommand::CreateInventory) => "createinventory",
        }
    }
}

impl FromStr for Command {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = match s {
            "create" => Command::Domain(DomainCommand::Create),
            "destroy" => Command::Domain(DomainCommand::Destroy),
            "pause" => Command::Domain(DomainCommand::Pause),
            "shutdown" | "stop" => Command::Domain(DomainCommand::Shutdown),
            "start" => Command::Domain(DomainCommand::Start),
            "unpause" => Command::Domain(DomainCommand::Unpause),
            "status" => Command::Domain(DomainCommand::Status),
            "removetags" => Command::Domain(DomainCommand::RemoveTags),
            "remove" => Command::Domain(DomainCommand::Remove),
            "info" => Command::Host(HostCommand::Info),
            "list_vms" => Command::Host(HostCommand::ListVms),
            "get_states" => Command::Host(HostCommand::GetStates),
            "createinventory" => Command::Host(HostCommand::CreateInventory),
            other => return Err(ReconcileError::Unrecognized(format!("command {}", other))),
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse_intent(state: &str) -> Result<Intent, ReconcileError> {
    serde_json::from_value(Value::String(state.to_string()))
        .map_err(|_| ReconcileError::Unrecognized(format!("state {}", state)))
}

/// What a request asks for, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Read-only PCI device inventory.
    GatherFacts,
    /// Create if missing, then converge properties, tags and devices.
    Converge { name: String },
    /// Converge the power state.
    Power { name: String, intent: Intent },
    /// One-shot command against a domain.
    Domain { name: String, command: DomainCommand },
    /// Host-wide query. `filter` only applies to `list_vms`.
    Host { command: HostCommand, filter: Option<PowerState> },
}

impl Request {
    /// Resolve the request into one directive without touching any backend.
    pub fn directive(&self) -> Result<Directive, ReconcileError> {
        let intent = self.state.as_deref().map(parse_intent).transpose()?;
        let command = self.command.as_deref().map(str::parse::<Command>).transpose()?;

        if self.gather_device_facts {
            return Ok(Directive::GatherFacts);
        }

        let wants_converge = self.has_properties() || self.devices.is_some();
        if intent == Some(Intent::Present) && wants_converge {
            return Ok(Directive::Converge { name: self.require_name("state")? });
        }

        match (intent, command) {
            (Some(intent), Some(Command::Host(HostCommand::ListVms))) => Ok(Directive::Host {
                command: HostCommand::ListVms,
                filter: intent.as_power_state(),
            }),
            (Some(intent), _) => Ok(Directive::Power {
                name: self.require_name("state change")?,
                intent,
            }),
            (None, Some(Command::Domain(command))) => Ok(Directive::Domain {
                name: self.require_name(Command::Domain(command).as_str())?,
                command,
            }),
            (None, Some(Command::Host(command))) => Ok(Directive::Host { command, filter: None }),
            (None, None) => Err(ReconcileError::NoDirective),
        }
    }

    pub fn has_properties(&self) -> bool {
        self.properties.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Requested template, with the `default` placeholder mapped to `None`.
    pub fn template(&self) -> Option<&str> {
        self.template.as_deref().filter(|t| *t != DEFAULT_TEMPLATE)
    }

    fn require_name(&self, what: &str) -> Result<String, ReconcileError> {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ => Err(ReconcileError::MissingDomainName(what.to_string())),
        }
    }
}
