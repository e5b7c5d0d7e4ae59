use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The separator between a data source name and a node host in node keys.
///
/// Data source names can not contain this character, so a data source's nodes always form a
/// contiguous key range.
const NODE_KEY_SEPARATOR: char = '/';

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Serialize>(model: &M) -> Result<Vec<u8>> {
    serde_json::to_vec(model).context("error serializing data model")
}

/// Decode an object from the given buffer.
pub fn decode_model<M: DeserializeOwned>(data: &[u8]) -> Result<M> {
    serde_json::from_slice(data).context("error decoding object from storage")
}

/// Build the storage key of a data source node.
pub fn node_key(data_source: &str, host: &str) -> String {
    format!("{}{}{}", data_source, NODE_KEY_SEPARATOR, host)
}

/// Build the key prefix shared by all nodes of a data source.
pub fn node_prefix(data_source: &str) -> String {
    format!("{}{}", data_source, NODE_KEY_SEPARATOR)
}

/// Build an env var name fragment from the given resource name.
pub fn env_name_fragment(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}
