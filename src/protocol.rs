//! RPC message definitions.
//!
//! Every RPC is a single [`Request`]/[`Response`] pair carried as JSON inside
//! one frame (see [`crate::framing`]). The enum variant names the method being
//! invoked; the payload structs below are its arguments and reply.

use serde::{Deserialize, Serialize};

use crate::core::{NodeId, RoutingEntry, RoutingEntryDist};

/// Liveness probe. The reply carries the callee's identifier so the caller can
/// check that the address still belongs to the node it expects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingArgs {
    pub querying_node_id: NodeId,
    pub querying_ip_addr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReply {
    pub queried_node_id: NodeId,
}

/// Record `announced_user_id -> announced_ip_addr` at the callee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUserArgs {
    pub querying_node_id: NodeId,
    pub querying_ip_addr: String,
    /// Hash of the announced username.
    pub announced_user_id: NodeId,
    pub announced_ip_addr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUserReply {
    pub queried_node_id: NodeId,
}

/// Shared arguments of FindNode and FindUser.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindIdArgs {
    pub querying_node_id: NodeId,
    pub querying_ip_addr: String,
    pub target_id: NodeId,
}

/// Reply to FindNode and FindUser.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindIdReply {
    pub queried_node_id: NodeId,
    pub queried_ip_addr: String,
    /// The callee's closest known peers to the target, nearest first.
    pub try_nodes: Vec<RoutingEntryDist>,
    /// Set only by FindUser when the callee holds a record for the target.
    pub target_ip_addr: Option<String>,
}

impl FindIdReply {
    /// The identity of the node that produced this reply.
    pub fn queried(&self) -> RoutingEntry {
        RoutingEntry {
            node_id: self.queried_node_id,
            ip_addr: self.queried_ip_addr.clone(),
        }
    }
}

/// A chat message. The same struct is the DeliverMessage argument, the queued
/// pending entry and the stored history entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SendMessageArgs {
    pub content: String,
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: i64,
    pub to_username: String,
    pub from_username: String,
    /// Random per-message value; the receiver's deduplication key.
    pub message_identifier: i64,
}

pub type Message = SendMessageArgs;

/// An inbound call. The variant is the method name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Ping(PingArgs),
    StoreUser(StoreUserArgs),
    FindNode(FindIdArgs),
    FindUser(FindIdArgs),
    DeliverMessage(SendMessageArgs),
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Ping(_) => "Ping",
            Request::StoreUser(_) => "StoreUser",
            Request::FindNode(_) => "FindNode",
            Request::FindUser(_) => "FindUser",
            Request::DeliverMessage(_) => "DeliverMessage",
        }
    }
}

/// The reply to a [`Request`]. `Error` carries a handler failure back to the
/// caller, which treats it like any other failed call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Ping(PingReply),
    StoreUser(StoreUserReply),
    FindNode(FindIdReply),
    FindUser(FindIdReply),
    DeliverMessage,
    Error(String),
}

impl Response {
    pub fn method(&self) -> &'static str {
        match self {
            Response::Ping(_) => "Ping",
            Response::StoreUser(_) => "StoreUser",
            Response::FindNode(_) => "FindNode",
            Response::FindUser(_) => "FindUser",
            Response::DeliverMessage => "DeliverMessage",
            Response::Error(_) => "Error",
        }
    }
}
