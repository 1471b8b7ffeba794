//! Response bodies of the Kubo RPC API.
use serde::Deserialize;
use std::collections::HashMap;

/// Output of `version`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionInfo {
    /// Kubo version, e.g. `0.38.1`.
    pub version: String,
    /// Git commit Kubo was built from.
    #[serde(default)]
    pub commit: String,
    /// Repository version.
    #[serde(default)]
    pub repo: String,
    /// Target system.
    #[serde(default)]
    pub system: String,
    /// Go toolchain version.
    #[serde(default)]
    pub golang: String,
}

/// Output of `id`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerInfo {
    /// Peer id of the node.
    #[serde(rename = "ID")]
    pub id: String,
    /// Public key of the node.
    #[serde(default)]
    pub public_key: String,
    /// Listen addresses, absent while the node is offline.
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
    /// Agent version string.
    #[serde(default)]
    pub agent_version: String,
    /// Supported protocols.
    #[serde(default)]
    pub protocols: Option<Vec<String>>,
}

/// One line of `add` output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct AddEntry {
    pub(crate) hash: String,
}

/// Output of `pin/ls`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct PinList {
    #[serde(rename = "Keys", default)]
    pub(crate) keys: HashMap<String, PinEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PinEntry {
    #[serde(rename = "Type")]
    pub(crate) kind: String,
}

/// Body of a failed RPC call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct RpcErrorBody {
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) code: i64,
    #[serde(rename = "Type", default)]
    pub(crate) kind: String,
}
