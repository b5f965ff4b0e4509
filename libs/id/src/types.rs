//! Typed names and IDs used across the deployer.

use crate::{define_id, define_name};

// =============================================================================
// Names
// =============================================================================

define_name!(ClusterName, "cluster name", 64);
define_name!(Version, "version", 40);
define_name!(FleetId, "fleet id", 64);
define_name!(StackName, "stack name", 128);

// =============================================================================
// Invocation IDs
// =============================================================================

define_id!(DeployId, "dep");

// =============================================================================
// Stack naming
// =============================================================================

const FLEET_INFIX: &str = "-fleet-";

impl StackName {
    /// The long-lived cluster stack: `{cluster}-cluster`.
    #[must_use]
    pub fn for_cluster(cluster: &ClusterName) -> Self {
        Self(format!("{cluster}-cluster"))
    }

    /// The versioned fleet stack: `{cluster}-fleet-{version}`.
    #[must_use]
    pub fn for_fleet(cluster: &ClusterName, version: &Version) -> Self {
        Self(format!("{cluster}{FLEET_INFIX}{version}"))
    }

    /// The stack holding the health-check task definition.
    #[must_use]
    pub fn for_health_task(cluster: &ClusterName) -> Self {
        Self(format!("{cluster}-cluster-health-task"))
    }

    /// The deployment pipeline stack: `{cluster}-pipeline`.
    #[must_use]
    pub fn for_pipeline(cluster: &ClusterName) -> Self {
        Self(format!("{cluster}-pipeline"))
    }

    /// Recovers the version a fleet stack would have if `cluster` owned it.
    ///
    /// Returns `None` for non-fleet stacks and names without the cluster
    /// prefix. A match is not proof of ownership: `a-fleet-b-fleet-v1` of
    /// cluster `a-fleet-b` parses here as version `b-fleet-v1` of `a`, so
    /// callers confirm against the stack's `Version` parameter.
    #[must_use]
    pub fn fleet_version(&self, cluster: &ClusterName) -> Option<Version> {
        let rest = self.0.strip_prefix(cluster.as_str())?;
        let version = rest.strip_prefix(FLEET_INFIX)?;
        Version::parse(version).ok()
    }
}

impl ClusterName {
    /// PascalCase form of the cluster name, one capitalised word per
    /// dash-separated segment (`scaling-kloudcover` -> `ScalingKloudcover`).
    #[must_use]
    pub fn pascal_case(&self) -> String {
        self.0
            .split('-')
            .filter(|word| !word.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                    }
                    None => String::new(),
                }
            })
            .collect()
    }
}
