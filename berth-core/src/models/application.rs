use std::collections::BTreeSet;

use anyhow::{ensure, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

lazy_static! {
    /// Versions are used verbatim as image tags.
    static ref VERSION_RE: Regex = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("invalid version regex");
}

/// Validate the given application version.
pub fn validate_version(version: &str) -> Result<()> {
    ensure!(
        VERSION_RE.is_match(version),
        AppError::InvalidInput(format!("invalid version {:?}, versions must be valid image tags", version))
    );
    Ok(())
}

/// An application deployed on the platform.
///
/// Applications are created by the app management layer. The control plane only mutates an
/// application's version and its set of linked data sources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// The unique name of this application.
    pub name: String,
    /// The name of the owning account.
    pub owner: String,
    /// The image tag of the currently deployed version.
    pub version: String,
    /// Names of the data sources linked to this application.
    #[serde(default)]
    pub data_sources: BTreeSet<String>,
    /// Optimistic concurrency counter.
    #[serde(default)]
    pub revision: u64,
}

impl Application {
    pub fn new(name: &str, owner: &str, version: &str) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            version: version.into(),
            data_sources: Default::default(),
            revision: 0,
        }
    }

    /// The image reference of this application's current version, relative to the given registry.
    pub fn image(&self, registry: &str) -> String {
        format!("{}/{}:{}", registry.trim_end_matches('/'), self.name, self.version)
    }
}
