//! Ansible-style inventory of the host's domains.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;
use tracing::info;

use crate::error::ReconcileError;
use crate::types::{DomainInfo, Klass, ADMIN_DOMAIN};

/// Domain names grouped by class, `dom0` excluded.
pub fn group_by_klass(domains: &[DomainInfo]) -> BTreeMap<Klass, Vec<String>> {
    let mut groups: BTreeMap<Klass, Vec<String>> = BTreeMap::new();
    for domain in domains.iter().filter(|d| d.name != ADMIN_DOMAIN) {
        groups.entry(domain.klass).or_default().push(domain.name.clone());
    }
    groups
}

/// Render the inventory text.
pub fn render(groups: &BTreeMap<Klass, Vec<String>>) -> String {
    let mut out = String::from("[local]\nlocalhost\n\n[local:vars]\nansible_connection=local\n");

    for (section, klass) in [
        ("appvms", Klass::AppVM),
        ("templatevms", Klass::TemplateVM),
        ("standalonevms", Klass::StandaloneVM),
    ] {
        let _ = write!(out, "\n[{}]\n", section);
        for name in groups.get(&klass).into_iter().flatten() {
            let _ = writeln!(out, "{}", name);
        }
    }

    for section in ["appvms", "templatevms", "standalonevms"] {
        let _ = write!(out, "\n[{}:vars]\nansible_connection=qubes\n", section);
    }
    out
}

/// Render and write the inventory for `domains` to `path`.
pub fn create(domains: &[DomainInfo], path: &Path) -> Result<(), ReconcileError> {
    let content = render(&group_by_klass(domains));
    std::fs::write(path, content).map_err(|e| ReconcileError::Inventory {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    info!(path = %path.display(), domains = domains.len(), "Inventory written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PowerState;

    fn domain(name: &str, klass: Klass) -> DomainInfo {
        DomainInfo {
            name: name.to_string(),
            klass,
            state: PowerState::Shutdown,
            label: "red".to_string(),
            provides_network: false,
            template_for_dispvms: false,
        }
    }

    #[test]
    fn test_render_groups_by_klass() {
        let domains = vec![
            domain("dom0", Klass::AdminVM),
            domain("work", Klass::AppVM),
            domain("fedora-40", Klass::TemplateVM),
            domain("vault", Klass::AppVM),
            domain("legacy", Klass::StandaloneVM),
        ];
        let text = render(&group_by_klass(&domains));

        assert!(text.starts_with("[local]\nlocalhost\n"));
        assert!(text.contains("[appvms]\nwork\nvault\n"));
        assert!(text.contains("[templatevms]\nfedora-40\n"));
        assert!(text.contains("[standalonevms]\nlegacy\n"));
        assert!(text.contains("[standalonevms:vars]\nansible_connection=qubes"));
        assert!(!text.contains("dom0"));
    }

    #[test]
    fn test_create_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory");

        create(&[domain("work", Klass::AppVM)], &path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[appvms]\nwork\n"));

        let err = create(&[], &dir.path().join("missing/inventory")).unwrap_err();
        assert!(matches!(err, ReconcileError::Inventory { .. }));
    }
}
