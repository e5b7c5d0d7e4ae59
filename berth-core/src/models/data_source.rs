use std::fmt;
use std::str::FromStr;

use anyhow::{bail, ensure, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::AgentToken;
use crate::error::AppError;

/// The instance count used when a create request does not specify one.
pub const DEFAULT_INSTANCES: u32 = 1;
/// The largest instance count a data source may request, bounded by the orchestrator's replica field.
pub const MAX_INSTANCES: i64 = i32::MAX as i64;

lazy_static! {
    /// Data source names must be usable as a DNS label once prefixed by the operator.
    static ref NAME_RE: Regex = Regex::new(r"^[a-z0-9]([a-z0-9-]{0,38}[a-z0-9])?$").expect("invalid data source name regex");
}

/// Validate the given data source name.
pub fn validate_name(name: &str) -> Result<()> {
    ensure!(!name.is_empty(), AppError::InvalidInput("data source name must not be empty".into()));
    ensure!(
        NAME_RE.is_match(name),
        AppError::InvalidInput(format!(
            "invalid data source name {:?}, names must be 1-40 lowercase alphanumeric characters or '-', starting and ending with an alphanumeric",
            name
        ))
    );
    Ok(())
}

/// The supported kinds of clustered data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceKind {
    /// A Redis cache cluster.
    Redis,
    /// A MongoDB document-store cluster.
    Mongodb,
}

impl DataSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Mongodb => "mongodb",
        }
    }

    /// The image reference of this kind's service, relative to the given registry.
    pub fn image(&self, registry: &str) -> String {
        format!("{}/{}:latest", registry.trim_end_matches('/'), self.as_str())
    }
}

impl fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSourceKind {
    type Err = anyhow::Error;

    fn from_str(val: &str) -> Result<Self> {
        match val {
            "redis" => Ok(Self::Redis),
            "mongodb" => Ok(Self::Mongodb),
            _ => bail!(AppError::InvalidInput(format!("unknown data source type {:?}, expected one of redis, mongodb", val))),
        }
    }
}

/// The caller-supplied portion of a new data source.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DataSourceSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub instances: Option<i64>,
}

/// A named, horizontally-scaled stateful service managed by the platform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    /// The unique name of this data source.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DataSourceKind,
    /// The name of the owning account.
    pub owner: String,
    /// The desired number of service replicas, always >= 1.
    pub instances: u32,
    /// The credential accepted from this data source's node agents.
    pub agent_token: AgentToken,
    /// Seconds timestamp of creation.
    pub created_at: i64,
    /// Optimistic concurrency counter.
    pub version: u64,
}

impl DataSource {
    /// Build a new data source from the given spec, validating all input.
    ///
    /// A fresh agent token is minted for the new data source.
    pub fn from_spec(spec: DataSourceSpec, owner: &str) -> Result<Self> {
        validate_name(&spec.name)?;
        let kind: DataSourceKind = spec.kind.parse()?;
        let instances = match spec.instances {
            Some(instances) => Self::validate_instances(instances)?,
            None => DEFAULT_INSTANCES,
        };
        Ok(Self {
            name: spec.name,
            kind,
            owner: owner.into(),
            instances,
            agent_token: AgentToken::mint(),
            created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
            version: 0,
        })
    }

    /// Validate a requested instance count.
    pub fn validate_instances(instances: i64) -> Result<u32> {
        ensure!(instances >= 1, AppError::InvalidInput(format!("instances must be at least 1, got {}", instances)));
        ensure!(
            instances <= MAX_INSTANCES,
            AppError::InvalidInput(format!("instances must be at most {}, got {}", MAX_INSTANCES, instances))
        );
        u32::try_from(instances).map_err(|_| AppError::InvalidInput(format!("instances value {} is too large", instances)).into())
    }
}
