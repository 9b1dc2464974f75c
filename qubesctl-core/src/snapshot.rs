//! Point-in-time reads shared by all reconcilers within one orchestration call.
//!
//! Nothing here is cached across calls, and no lock is held between the read
//! and the writes that follow it.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::traits::QubesApi;
use crate::types::*;

/// Host-wide state: the domain registry and system defaults.
#[derive(Debug, Clone, Default)]
pub struct HostSnapshot {
    pub domains: BTreeMap<String, DomainInfo>,
    pub default_netvm: Option<String>,
    pub default_template: Option<String>,
    pub device_classes: Vec<String>,
}

impl HostSnapshot {
    #[instrument(skip(api))]
    pub async fn capture(api: &dyn QubesApi) -> Result<Self> {
        let domains = api
            .list_domains()
            .await?
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect::<BTreeMap<_, _>>();
        let default_netvm = api.default_netvm().await?;
        let default_template = api.default_template().await?;
        let device_classes = api.device_classes().await?;

        debug!(
            domains = domains.len(),
            default_netvm = ?default_netvm,
            "Captured host snapshot"
        );

        Ok(Self {
            domains,
            default_netvm,
            default_template,
            device_classes,
        })
    }

    pub fn domain(&self, name: &str) -> Option<&DomainInfo> {
        self.domains.get(name)
    }

    pub fn knows_device_class(&self, devclass: &str) -> bool {
        self.device_classes.iter().any(|c| c == devclass)
    }
}

/// State of the one domain being reconciled.
#[derive(Debug, Clone)]
pub struct DomainSnapshot {
    pub info: DomainInfo,
    pub properties: DomainProperties,
    pub features: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
    /// Current assignments keyed by device class.
    pub assignments: BTreeMap<String, Vec<DeviceAssignment>>,
}

impl DomainSnapshot {
    #[instrument(skip(api, device_classes))]
    pub async fn capture(api: &dyn QubesApi, name: &str, device_classes: &[String]) -> Result<Self> {
        let info = api.get_domain(name).await?;
        let properties = api.get_properties(name).await?;
        let features = api.get_features(name).await?;
        let tags = api.get_tags(name).await?;

        let mut assignments = BTreeMap::new();
        for devclass in device_classes {
            assignments.insert(devclass.clone(), api.assigned_devices(name, devclass).await?);
        }

        Ok(Self {
            info,
            properties,
            features,
            tags,
            assignments,
        })
    }
}
