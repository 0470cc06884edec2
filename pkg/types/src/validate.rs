use anyhow::{Result, bail};
use std::collections::HashSet;

use crate::united::UnitedDeployment;

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Check the topology invariants the controller relies on: DNS-label pool
/// names, unique within the resource, and a well-formed selector.
pub fn validate_topology(ud: &UnitedDeployment) -> Result<()> {
    ud.spec.selector.validate()?;
    if ud.spec.selector.is_empty() {
        bail!("spec.selector must not be empty");
    }

    let mut seen = HashSet::new();
    for pool in &ud.spec.topology.pools {
        validate_name(&pool.name)
            .map_err(|e| anyhow::anyhow!("invalid pool name: {}", e))?;
        if !seen.insert(pool.name.as_str()) {
            bail!("duplicated pool name '{}' in topology", pool.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::LabelSelector;
    use crate::united::{PoolSpec, UnitedDeploymentSpec};

    #[test]
    fn valid_names() {
        assert!(validate_name("nginx").is_ok());
        assert!(validate_name("my-app").is_ok());
        assert!(validate_name("app-123").is_ok());
        assert!(validate_name("a").is_ok());
        assert!(validate_name("a-b-c-d").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("My-App").is_err());
        assert!(validate_name("my_app").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name("special!char").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    fn ud_with_pools(names: &[&str]) -> UnitedDeployment {
        UnitedDeployment {
            spec: UnitedDeploymentSpec {
                selector: LabelSelector::from_labels([("app", "web")]),
                topology: crate::united::Topology {
                    pools: names
                        .iter()
                        .map(|n| PoolSpec {
                            name: n.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn topology_rejects_duplicates() {
        assert!(validate_topology(&ud_with_pools(&["beijing", "hangzhou"])).is_ok());
        assert!(validate_topology(&ud_with_pools(&["beijing", "beijing"])).is_err());
        assert!(validate_topology(&ud_with_pools(&["Bei_jing"])).is_err());
    }

    #[test]
    fn topology_rejects_empty_selector() {
        let mut ud = ud_with_pools(&["beijing"]);
        ud.spec.selector = LabelSelector::default();
        assert!(validate_topology(&ud).is_err());
    }
}
