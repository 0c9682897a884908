//! Sandbox security profiles and their per-repository policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

/// Strength of the isolation applied to an attempt.
///
/// Variants are declared weakest first, so `Ord` ranks them by strength.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum SecurityProfile {
    /// Container with no network and a read-only workspace mount.
    Minimal,
    /// Minimal plus a read-only root, dropped capabilities and
    /// `no-new-privileges`.
    #[default]
    Standard,
    /// Standard inside a user-space kernel runtime (gVisor).
    Maximum,
}

impl SecurityProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "MINIMAL",
            Self::Standard => "STANDARD",
            Self::Maximum => "MAXIMUM",
        }
    }
}

/// Default and per-repository security profiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub default_profile: SecurityProfile,
    /// Per-repository profiles. These act as a floor: a job may ask for
    /// stronger isolation but never weaker.
    pub repositories: HashMap<String, SecurityProfile>,
}

impl SecurityPolicy {
    /// Effective profile for a job on `repository` that asked for `requested`.
    pub fn resolve(
        &self,
        repository: &str,
        requested: Option<SecurityProfile>,
    ) -> SecurityProfile {
        match (requested, self.repositories.get(repository).copied()) {
            (Some(requested), Some(floor)) => requested.max(floor),
            (Some(requested), None) => requested,
            (None, Some(configured)) => configured,
            (None, None) => self.default_profile,
        }
    }

    /// Parse `owner/repo=profile` pairs separated by commas.
    pub fn parse_overrides(raw: &str) -> crate::Result<HashMap<String, SecurityProfile>> {
        let mut overrides = HashMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (repo, profile) = pair.rsplit_once('=').ok_or_else(|| {
                crate::Error::config(format!("expected repository=profile, got '{pair}'"))
            })?;
            let profile = profile.trim().parse::<SecurityProfile>().map_err(|_| {
                crate::Error::config(format!("unknown security profile '{}'", profile.trim()))
            })?;
            overrides.insert(repo.trim().to_string(), profile);
        }
        Ok(overrides)
    }
}
