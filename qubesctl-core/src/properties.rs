//! Property reconciler: diffs desired against live properties, features and
//! volumes and applies the minimal set of mutations.
//!
//! Each mutation is applied independently. A failure part-way through leaves
//! earlier mutations in place.

use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use crate::error::ReconcileError;
use crate::schema::{DesiredProperties, DesiredValue, FeatureValue, PropertyKey, VolumeRequest};
use crate::snapshot::{DomainSnapshot, HostSnapshot};
use crate::traits::QubesApi;
use crate::types::{NetvmChoice, PropValue};

/// Feature set to `"1"` for each name listed under `services`.
pub fn service_feature(service: &str) -> String {
    format!("service.{}", service)
}

/// Result of a property reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyOutcome {
    pub changed: bool,
    /// Changed keys in declaration order.
    pub changed_fields: Vec<PropertyKey>,
}

impl PropertyOutcome {
    fn record(&mut self, key: PropertyKey) {
        self.changed = true;
        self.changed_fields.push(key);
    }
}

#[instrument(skip_all, fields(domain = %domain.info.name))]
pub async fn reconcile(
    api: &dyn QubesApi,
    host: &HostSnapshot,
    domain: &DomainSnapshot,
    desired: &DesiredProperties,
) -> Result<PropertyOutcome, ReconcileError> {
    let name = domain.info.name.as_str();
    let mut outcome = PropertyOutcome::default();

    for (&key, value) in desired {
        let changed = match (key, value) {
            (PropertyKey::Features, _) => apply_features(api, domain, desired).await?,
            // Folded into `features`; only handled here when `features` is absent.
            (PropertyKey::Services, _) if desired.contains_key(&PropertyKey::Features) => continue,
            (PropertyKey::Services, _) => {
                if apply_features(api, domain, desired).await? {
                    outcome.record(PropertyKey::Features);
                }
                continue;
            }
            (PropertyKey::Volume, DesiredValue::Volume(volume)) => {
                apply_volume(api, name, volume).await?
            }
            (PropertyKey::Netvm, DesiredValue::Netvm(choice)) => {
                let target = match choice {
                    NetvmChoice::Default => host.default_netvm.clone(),
                    NetvmChoice::None => None,
                    NetvmChoice::Named(netvm) => Some(netvm.clone()),
                };
                apply_scalar(api, domain, key, PropValue::Domain(target)).await?
            }
            (key, DesiredValue::Scalar(target)) => {
                apply_scalar(api, domain, key, target.clone()).await?
            }
            (key, other) => {
                warn!(key = %key, value = ?other, "Ignoring value not matching its key");
                false
            }
        };

        if changed {
            outcome.record(key);
        }
    }

    if outcome.changed {
        info!(changed = ?outcome.changed_fields, "Properties updated");
    } else {
        debug!("Properties already converged");
    }
    Ok(outcome)
}

async fn apply_scalar(
    api: &dyn QubesApi,
    domain: &DomainSnapshot,
    key: PropertyKey,
    target: PropValue,
) -> Result<bool, ReconcileError> {
    if domain.properties.get(key).as_ref() == Some(&target) {
        return Ok(false);
    }
    debug!(key = %key, value = ?target, "Setting property");
    api.set_property(&domain.info.name, key, target).await?;
    Ok(true)
}

/// Merge explicit features with the ones synthesised from `services`.
fn desired_features(desired: &DesiredProperties) -> BTreeMap<String, FeatureValue> {
    let mut features = match desired.get(&PropertyKey::Features) {
        Some(DesiredValue::Features(explicit)) => explicit.clone(),
        _ => BTreeMap::new(),
    };
    if let Some(DesiredValue::Services(services)) = desired.get(&PropertyKey::Services) {
        for service in services {
            features.insert(service_feature(service), FeatureValue::Set("1".to_string()));
        }
    }
    features
}

async fn apply_features(
    api: &dyn QubesApi,
    domain: &DomainSnapshot,
    desired: &DesiredProperties,
) -> Result<bool, ReconcileError> {
    let name = domain.info.name.as_str();
    let mut changed = false;

    for (feature, value) in desired_features(desired) {
        let current = domain.features.get(&feature);
        match (value, current) {
            (FeatureValue::Delete, Some(_)) => {
                debug!(feature = %feature, "Removing feature");
                api.remove_feature(name, &feature).await?;
                changed = true;
            }
            (FeatureValue::Delete, None) => {}
            (FeatureValue::Set(value), current) if current != Some(&value) => {
                debug!(feature = %feature, value = %value, "Setting feature");
                api.set_feature(name, &feature, &value).await?;
                changed = true;
            }
            (FeatureValue::Set(_), _) => {}
        }
    }

    Ok(changed)
}

async fn apply_volume(
    api: &dyn QubesApi,
    name: &str,
    volume: &VolumeRequest,
) -> Result<bool, ReconcileError> {
    match api.resize_volume(name, &volume.name, volume.size).await {
        Ok(resized) => {
            if resized {
                info!(volume = %volume.name, size = volume.size, "Volume resized");
            }
            Ok(resized)
        }
        Err(e) => {
            warn!(volume = %volume.name, size = volume.size, error = %e, "Volume resize failed");
            Err(ReconcileError::VolumeResize {
                name: volume.name.clone(),
                reason: e.to_string(),
            })
        }
    }
}
