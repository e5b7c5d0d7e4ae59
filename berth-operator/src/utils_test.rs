use anyhow::Result;

use crate::utils;
use berth_core::models::{Command, DataSourceNode, NodeRole};

#[test]
fn node_keys_share_data_source_prefix() {
    let key = utils::node_key("cache1", "10.0.0.5");
    let prefix = utils::node_prefix("cache1");
    assert!(key.starts_with(&prefix), "expected key {} to start with prefix {}", key, prefix);
    // A data source whose name extends another's must not share its node range.
    let other = utils::node_key("cache10", "10.0.0.5");
    assert!(!other.starts_with(&prefix), "expected key {} not to start with prefix {}", other, prefix);
}

#[test]
fn models_survive_storage_encoding() -> Result<()> {
    let mut node = DataSourceNode::new("cache1", "10.0.0.6", NodeRole::Replica, Some("10.0.0.5"));
    node.pending_command = Some(Command::Demote { master_host: "10.0.0.5".into() });

    let decoded: DataSourceNode = utils::decode_model(&utils::encode_model(&node)?)?;

    assert_eq!(decoded, node, "expected decoded node to match original");
    Ok(())
}

#[test]
fn env_name_fragment_is_shell_safe() {
    assert_eq!(utils::env_name_fragment("my-cache-1"), "MY_CACHE_1");
    assert_eq!(utils::env_name_fragment("redis"), "REDIS");
}
