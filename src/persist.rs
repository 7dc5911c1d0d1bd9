//! Per-user state file.
//!
//! A logged-off user keeps its node (address, routing table, stored user
//! records) and its messaging state in `<state_dir>/<username>.json`. The file
//! is written atomically: the snapshot goes to a sibling temp file which is
//! then renamed over the old one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::{NodeId, RoutingEntry};
use crate::protocol::Message;

/// Persisted form of a [`crate::DhtNode`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub ip_addr: String,
    pub node_id: NodeId,
    /// Bucket contents, least recently seen first.
    pub routing_table: Vec<Vec<RoutingEntry>>,
    pub kv: HashMap<NodeId, String>,
}

/// Persisted form of a [`crate::User`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub name: String,
    pub node: NodeSnapshot,
    pub message_history: HashMap<String, Vec<Message>>,
    pub pending_messages: HashMap<String, VecDeque<Message>>,
    pub received_message_identifiers: HashSet<i64>,
}

/// Location of `username`'s state file inside `state_dir`.
///
/// Bytes outside `[A-Za-z0-9_-]` are percent-encoded so that any username
/// maps to a single file name and distinct usernames never share one.
pub fn username_to_path(state_dir: &Path, username: &str) -> PathBuf {
    let mut file = String::with_capacity(username.len() + 5);
    for byte in username.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            file.push(byte as char);
        } else {
            file.push_str(&format!("%{byte:02X}"));
        }
    }
    file.push_str(".json");
    state_dir.join(file)
}

pub async fn save(path: &Path, snapshot: &UserSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Read a state file. A missing file is `Ok(None)`; an unreadable or corrupt
/// one is an error.
pub async fn load(path: &Path) -> Result<Option<UserSnapshot>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", path.display()));
        }
    };
    let snapshot = serde_json::from_slice(&bytes)
        .with_context(|| format!("corrupt state file {}", path.display()))?;
    Ok(Some(snapshot))
}
