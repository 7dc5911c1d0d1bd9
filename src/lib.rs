//! # peerchat
//!
//! A peer-to-peer node-discovery and messaging substrate. Every participant
//! runs a DHT node addressed by a hash of its network address, keeps a partial
//! view of the network in a Kademlia-style routing table, and locates other
//! participants through iterative, bounded-concurrency lookups. On top of the
//! DHT a per-user messaging layer delivers chat messages with at-least-once
//! transmission, deduplicates them by message identifier, and caches
//! undeliverable messages at the nodes nearest to the recipient.
//!
//! The crate is split into a handful of modules:
//!
//! - [`core`]: identifiers, the XOR metric, the routing table, the
//!   [`DhtNetwork`] transport seam and the [`DhtNode`] state machine with its
//!   RPC handlers and iterative lookup.
//! - [`protocol`]: the JSON serialisable RPC arguments and replies.
//! - [`framing`]: length-prefixed frames over any async byte stream.
//! - [`net`]: [`TcpNetwork`], the timeout-bounded TCP transport.
//! - [`server`]: the [`RpcHandler`] dispatch trait and the TCP accept loop.
//! - [`user`]: the messaging layer, login and logoff.
//! - [`persist`]: the per-user state file.
//! - [`config`]: tunables shared by the node and the user.
//!
//! ## Getting started
//!
//! ```no_run
//! use anyhow::Result;
//! use peerchat::{Config, User};
//!
//! # async fn launch() -> Result<()> {
//! let config = Config::default();
//! let alice = User::register_and_login("alice", "127.0.0.1:4444", None, config.clone()).await?;
//! let bob = User::register_and_login("bob", "127.0.0.1:5555", Some("127.0.0.1:4444"), config).await?;
//!
//! alice.send_message("bob", "hello").await;
//! # let _ = bob.messages_from("alice").await;
//! # alice.logoff().await?;
//! # bob.logoff().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod framing;
pub mod net;
pub mod persist;
pub mod protocol;
pub mod server;
pub mod user;

pub use crate::config::Config;
pub use crate::core::{
    bucket_index, hash_to_id, xor_distance, DhtNetwork, DhtNode, LookupMode, LookupOutcome,
    NodeId, RoutingEntry, RoutingEntryDist, RoutingTable, TelemetrySnapshot, ALPHA, ID_LEN, K,
};
pub use crate::net::TcpNetwork;
pub use crate::protocol::{Message, Request, Response, SendMessageArgs};
pub use crate::server::{handle_connection, serve, RpcHandler};
pub use crate::user::User;
