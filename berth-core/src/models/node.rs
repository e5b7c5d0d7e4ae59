use std::fmt;
use std::str::FromStr;

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The maximum length of a node host.
const MAX_HOST_LEN: usize = 253;

/// Validate the given node host.
pub fn validate_host(host: &str) -> Result<()> {
    ensure!(!host.is_empty(), AppError::InvalidInput("node host must not be empty".into()));
    ensure!(
        host.len() <= MAX_HOST_LEN,
        AppError::InvalidInput(format!("node host must be at most {} characters", MAX_HOST_LEN))
    );
    ensure!(
        !host.chars().any(|c| c == '/' || c.is_whitespace() || c.is_control()),
        AppError::InvalidInput(format!("invalid node host {:?}", host))
    );
    Ok(())
}

/// The role of a node within its data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Replica,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Replica => "replica",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = anyhow::Error;

    fn from_str(val: &str) -> Result<Self> {
        match val {
            "master" => Ok(Self::Master),
            "replica" => Ok(Self::Replica),
            _ => bail!(AppError::InvalidInput(format!("unknown node role {:?}, expected one of master, replica", val))),
        }
    }
}

/// A command awaiting delivery to a node agent.
///
/// Commands describe the desired role of the node rather than a transition, so applying the
/// same command twice is harmless.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    /// Become the master of the data source.
    Promote,
    /// Become a replica following the given master.
    Demote {
        #[serde(rename = "masterHost")]
        master_host: String,
    },
}

/// One running instance of a data source, registered by its agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceNode {
    /// The name of the owning data source.
    pub data_source: String,
    /// The network address of this node, unique within its data source.
    pub host: String,
    pub role: NodeRole,
    /// The host this node follows. Equal to `host` for a master.
    pub master_host: String,
    /// The most recent undelivered command, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_command: Option<Command>,
    /// Optimistic concurrency counter.
    pub version: u64,
}

impl DataSourceNode {
    /// Create a new node with the given role.
    ///
    /// A new replica follows `master_host`; a new master follows itself.
    pub fn new(data_source: &str, host: &str, role: NodeRole, master_host: Option<&str>) -> Self {
        let master_host = match role {
            NodeRole::Master => host.to_string(),
            NodeRole::Replica => master_host.unwrap_or_default().to_string(),
        };
        Self {
            data_source: data_source.into(),
            host: host.into(),
            role,
            master_host,
            pending_command: None,
            version: 0,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }
}

/// A generic update to a node.
///
/// Role changes are only accepted when they restate the node's current role; transitions must go
/// through the master transition instead.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub master_host: Option<String>,
}
