//! Core DHT logic: transport-agnostic Kademlia routing and lookup.
//!
//! This module contains the fundamental building blocks of the node:
//!
//! - **Identity & Hashing**: [`NodeId`], [`hash_to_id`]
//! - **Distance Metrics**: [`xor_distance`] and [`bucket_index`]
//! - **Routing**: [`RoutingTable`], [`RoutingEntry`], [`RoutingEntryDist`]
//! - **Transport seam**: [`DhtNetwork`]
//! - **Node State Machine**: [`DhtNode`], its RPC handlers and the iterative
//!   lookup ([`DhtNode::id_lookup`])

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::persist::NodeSnapshot;
use crate::protocol::{
    FindIdArgs, FindIdReply, PingArgs, PingReply, Request, Response, SendMessageArgs,
    StoreUserArgs, StoreUserReply,
};

// ============================================================================
// Identifiers
// ============================================================================

/// A 64-bit identifier shared by nodes and hashed usernames.
///
/// Identifiers are the low 64 bits of a SHA-1 digest. Truncating the digest
/// makes collisions far more likely than the full 160 bits would at large
/// network sizes; bucket count and wire format both depend on the width.
pub type NodeId = u64;

/// Bit width of [`NodeId`] and therefore the number of routing buckets.
pub const ID_LEN: usize = 64;

/// Default bucket capacity and lookup result bound.
pub const K: usize = 20;

/// Default number of lookup queries kept in flight.
pub const ALPHA: usize = 3;

/// Derive an identifier from a string (an `ip:port` address or a username).
///
/// The identifier is the last eight bytes of the SHA-1 digest, big-endian:
///
/// ```
/// use peerchat::hash_to_id;
///
/// assert_eq!(hash_to_id("alice"), hash_to_id("alice"));
/// assert_ne!(hash_to_id("alice"), hash_to_id("bob"));
/// ```
pub fn hash_to_id(s: &str) -> NodeId {
    let digest = Sha1::digest(s.as_bytes());
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&digest[digest.len() - 8..]);
    u64::from_be_bytes(tail)
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// XOR distance between two identifiers.
///
/// - `xor_distance(a, a) == 0`
/// - `xor_distance(a, b) == xor_distance(b, a)`
pub fn xor_distance(a: NodeId, b: NodeId) -> NodeId {
    a ^ b
}

/// Index of the first differing bit of `a` and `b`, counted from the most
/// significant bit.
///
/// Bucket 0 holds the farthest peers. Equal identifiers and identifiers that
/// differ only in the lowest bit both land in the last bucket. Both ends of a
/// contact compute this independently, so it depends only on `a ^ b`.
pub fn bucket_index(a: NodeId, b: NodeId) -> usize {
    (xor_distance(a, b).leading_zeros() as usize).min(ID_LEN - 1)
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Entries
// ─────────────────────────────────────────────────────────────────────────────

/// One known peer.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub node_id: NodeId,
    /// `ip:port` the peer listens on.
    pub ip_addr: String,
}

impl RoutingEntry {
    /// Build the entry for a node listening on `ip_addr`; its identifier is the
    /// hash of the address.
    pub fn from_addr(ip_addr: impl Into<String>) -> Self {
        let ip_addr = ip_addr.into();
        Self {
            node_id: hash_to_id(&ip_addr),
            ip_addr,
        }
    }

    /// Annotate this entry with its distance to `target`.
    pub fn with_distance(self, target: NodeId) -> RoutingEntryDist {
        RoutingEntryDist {
            distance: xor_distance(self.node_id, target),
            entry: self,
        }
    }
}

impl fmt::Display for RoutingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}@{}", self.node_id, self.ip_addr)
    }
}

/// A peer annotated with its distance to some lookup target.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RoutingEntryDist {
    pub distance: NodeId,
    pub entry: RoutingEntry,
}

/// Insert `candidate` into `set`, which is kept sorted ascending by distance
/// and holds at most `bound` entries with distinct node ids.
///
/// Returns true when the set changed.
fn insert_bounded(set: &mut Vec<RoutingEntryDist>, candidate: RoutingEntryDist, bound: usize) -> bool {
    if bound == 0 {
        return false;
    }
    if set
        .iter()
        .any(|existing| existing.entry.node_id == candidate.entry.node_id)
    {
        return false;
    }
    let pos = set.partition_point(|existing| existing.distance < candidate.distance);
    if pos >= bound {
        return false;
    }
    set.insert(pos, candidate);
    set.truncate(bound);
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Table
// ─────────────────────────────────────────────────────────────────────────────

/// One k-bucket. The front holds the contact heard from longest ago.
#[derive(Debug, Default, Clone)]
struct Bucket {
    contacts: Vec<RoutingEntry>,
}

/// What happened when a contact was offered to its bucket.
#[derive(Debug)]
enum Admission {
    Added,
    /// Already known; moved to the back with the offered address.
    Moved,
    /// No room. `stale` has to be pinged before `candidate` can get in.
    Full {
        stale: RoutingEntry,
        candidate: RoutingEntry,
    },
}

/// A full bucket waiting on the ping of its stalest contact.
#[derive(Clone, Debug)]
pub(crate) struct EvictionCheck {
    bucket: usize,
    stale: RoutingEntry,
    candidate: RoutingEntry,
}

impl Bucket {
    fn position(&self, id: NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| c.node_id == id)
    }

    fn admit(&mut self, contact: RoutingEntry, k: usize) -> Admission {
        if let Some(pos) = self.position(contact.node_id) {
            self.contacts.remove(pos);
            self.contacts.push(contact);
            Admission::Moved
        } else if self.contacts.len() < k {
            self.contacts.push(contact);
            Admission::Added
        } else {
            Admission::Full {
                stale: self.contacts[0].clone(),
                candidate: contact,
            }
        }
    }
}

/// Kademlia routing table with one bucket per identifier bit.
///
/// Bucket `n` holds peers whose first differing bit from the owner is bit `n`
/// (see [`bucket_index`]). Each bucket keeps at most `k` contacts ordered from
/// least to most recently confirmed alive. The owner never appears in its own
/// table.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let buckets = vec![Bucket::default(); ID_LEN];
        Self {
            self_id,
            k,
            buckets,
        }
    }

    /// Rebuild a table from persisted buckets.
    ///
    /// Every entry is re-placed with [`bucket_index`], so misplaced or
    /// overflowing input cannot break the table's invariants.
    pub fn from_buckets(self_id: NodeId, k: usize, buckets: Vec<Vec<RoutingEntry>>) -> Self {
        let mut table = Self::new(self_id, k);
        for entry in buckets.into_iter().flatten() {
            table.update(entry);
        }
        table
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Add or refresh a contact without a liveness check.
    ///
    /// When the target bucket is full the new contact is dropped; the node
    /// uses [`DhtNode::observe_contact`] instead, which pings the oldest
    /// contact and evicts it if it stays silent.
    pub fn update(&mut self, contact: RoutingEntry) {
        let _ = self.admit(contact);
    }

    /// Like [`update`](Self::update), but hands back the eviction check a
    /// full bucket needs instead of dropping the contact.
    pub(crate) fn admit(&mut self, contact: RoutingEntry) -> Option<EvictionCheck> {
        if contact.node_id == self.self_id {
            return None;
        }
        let bucket = bucket_index(self.self_id, contact.node_id);
        match self.buckets[bucket].admit(contact, self.k) {
            Admission::Added | Admission::Moved => None,
            Admission::Full { stale, candidate } => Some(EvictionCheck {
                bucket,
                stale,
                candidate,
            }),
        }
    }

    /// Settle an eviction check once the stale contact's ping has come back.
    ///
    /// If it answered it goes to the back and the candidate is forgotten.
    /// Otherwise it is dropped and the candidate appended, provided the bucket
    /// still has room and does not already hold it.
    pub(crate) fn settle_eviction(&mut self, check: EvictionCheck, stale_alive: bool) {
        let k = self.k;
        let bucket = &mut self.buckets[check.bucket];
        let stale = bucket
            .position(check.stale.node_id)
            .map(|pos| bucket.contacts.remove(pos));
        if stale_alive {
            bucket.contacts.extend(stale);
        } else if bucket.contacts.len() < k && bucket.position(check.candidate.node_id).is_none() {
            bucket.contacts.push(check.candidate);
        }
    }

    /// Drop a contact, wherever it is.
    pub fn remove(&mut self, id: NodeId) -> bool {
        if id == self.self_id {
            return false;
        }
        let bucket = &mut self.buckets[bucket_index(self.self_id, id)];
        let before = bucket.contacts.len();
        bucket.contacts.retain(|c| c.node_id != id);
        bucket.contacts.len() != before
    }

    /// Up to `n` known peers, nearest to `target` first, without duplicates.
    ///
    /// The scan starts at the bucket sharing the longest prefix with `target`,
    /// continues with every bucket above it (all nearer than anything below)
    /// and then walks downward one bucket at a time, stopping as soon as `n`
    /// entries are held and no remaining bucket can contain a nearer one.
    pub fn closest(&self, n: usize, target: NodeId) -> Vec<RoutingEntryDist> {
        if n == 0 {
            return Vec::new();
        }
        if self.is_empty() {
            warn!(node = self.self_id, "routing table is empty");
            return Vec::new();
        }

        let start = bucket_index(target, self.self_id);
        let mut tiers: Vec<Vec<usize>> = Vec::with_capacity(start + 2);
        tiers.push(vec![start]);
        tiers.push((start + 1..ID_LEN).collect());
        tiers.extend((0..start).rev().map(|idx| vec![idx]));

        let mut best: Vec<RoutingEntryDist> = Vec::with_capacity(n + 1);
        for tier in tiers {
            if best.len() >= n {
                break;
            }
            for idx in tier {
                for contact in &self.buckets[idx].contacts {
                    insert_bounded(&mut best, contact.clone().with_distance(target), n);
                }
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.contacts.is_empty())
    }

    pub fn bucket_len(&self, idx: usize) -> usize {
        self.buckets.get(idx).map_or(0, |b| b.contacts.len())
    }

    /// Contacts of one bucket, least recently seen first.
    pub fn bucket(&self, idx: usize) -> &[RoutingEntry] {
        self.buckets
            .get(idx)
            .map_or(&[][..], |b| b.contacts.as_slice())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id != self.self_id
            && self.buckets[bucket_index(self.self_id, id)]
                .contacts
                .iter()
                .any(|c| c.node_id == id)
    }

    /// Every contact, bucket by bucket.
    pub fn entries(&self) -> Vec<RoutingEntry> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }

    /// Bucket contents in persisted form.
    pub fn to_buckets(&self) -> Vec<Vec<RoutingEntry>> {
        self.buckets.iter().map(|b| b.contacts.clone()).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Network Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Transport abstraction for RPC calls.
///
/// Implementations only provide [`call`](Self::call); it must give up after a
/// bounded time and report dial failures, timeouts and remote errors as `Err`.
/// The reply is meaningless whenever `Err` is returned. The provided methods
/// unwrap the reply matching each request.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Send `request` to the node listening on `addr` and wait for its reply.
    async fn call(&self, addr: &str, request: Request) -> Result<Response>;

    async fn ping(&self, addr: &str, args: PingArgs) -> Result<PingReply> {
        match self.call(addr, Request::Ping(args)).await? {
            Response::Ping(reply) => Ok(reply),
            other => unexpected_reply("Ping", other),
        }
    }

    async fn store_user(&self, addr: &str, args: StoreUserArgs) -> Result<StoreUserReply> {
        match self.call(addr, Request::StoreUser(args)).await? {
            Response::StoreUser(reply) => Ok(reply),
            other => unexpected_reply("StoreUser", other),
        }
    }

    async fn find_node(&self, addr: &str, args: FindIdArgs) -> Result<FindIdReply> {
        match self.call(addr, Request::FindNode(args)).await? {
            Response::FindNode(reply) => Ok(reply),
            other => unexpected_reply("FindNode", other),
        }
    }

    async fn find_user(&self, addr: &str, args: FindIdArgs) -> Result<FindIdReply> {
        match self.call(addr, Request::FindUser(args)).await? {
            Response::FindUser(reply) => Ok(reply),
            other => unexpected_reply("FindUser", other),
        }
    }

    async fn deliver_message(&self, addr: &str, args: SendMessageArgs) -> Result<()> {
        match self.call(addr, Request::DeliverMessage(args)).await? {
            Response::DeliverMessage => Ok(()),
            other => unexpected_reply("DeliverMessage", other),
        }
    }
}

fn unexpected_reply<T>(method: &str, response: Response) -> Result<T> {
    match response {
        Response::Error(msg) => bail!("{method} failed remotely: {msg}"),
        other => bail!("{method} answered with {}", other.method()),
    }
}

/// Ping `to` and check that the answer comes from the expected node.
async fn probe<N: DhtNetwork>(network: &N, from: &RoutingEntry, to: &RoutingEntry) -> bool {
    let args = PingArgs {
        querying_node_id: from.node_id,
        querying_ip_addr: from.ip_addr.clone(),
    };
    match network.ping(&to.ip_addr, args).await {
        Ok(reply) if reply.queried_node_id == to.node_id => true,
        Ok(reply) => {
            debug!(
                peer = to.node_id,
                addr = %to.ip_addr,
                answered = reply.queried_node_id,
                "ping answered by a different node"
            );
            false
        }
        Err(err) => {
            debug!(peer = to.node_id, addr = %to.ip_addr, "ping failed: {err:#}");
            false
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DHT Node
// ─────────────────────────────────────────────────────────────────────────────

/// Which question an [`id lookup`](DhtNode::id_lookup) asks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupMode {
    /// Find the `k` nodes closest to the target.
    Node,
    /// Find the address registered for a hashed username.
    User,
}

/// Result of an iterative lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LookupOutcome {
    /// Best peers seen, nearest first. May include the local node.
    pub closest: Vec<RoutingEntryDist>,
    /// Set when a user-mode lookup found a record.
    pub resolved: Option<String>,
}

/// Snapshot of current DHT node state for telemetry and debugging.
#[derive(Clone, Debug, Default)]
pub struct TelemetrySnapshot {
    /// Contacts across all buckets.
    pub routing_entries: usize,
    /// User records held for other peers (and self).
    pub stored_users: usize,
    pub k: usize,
    pub alpha: usize,
}

/// A DHT node: routing table, user records and the transport used to reach
/// other nodes.
///
/// The routing table and the record map each sit behind their own lock and are
/// never held together or across a network call.
///
/// # Key Methods
///
/// * [`observe_contact`](Self::observe_contact) - feed a contact to the routing table
/// * [`id_lookup`](Self::id_lookup) - iterative lookup in node or user mode
/// * [`announce_user`](Self::announce_user) - register a username at the closest nodes
/// * [`get_user_ip`](Self::get_user_ip) - resolve a username to its address
/// * `handle_*` - the RPC handlers peers invoke
pub struct DhtNode<N: DhtNetwork> {
    /// This node's identifier, the hash of its address.
    pub id: NodeId,
    pub self_entry: RoutingEntry,
    routing: Arc<Mutex<RoutingTable>>,
    /// Hashed username to last announced address.
    kv: Arc<Mutex<HashMap<NodeId, String>>>,
    network: Arc<N>,
    k: usize,
    alpha: usize,
}

impl<N: DhtNetwork> DhtNode<N> {
    /// Create a node listening on `ip_addr` with an empty routing table.
    pub fn new(ip_addr: impl Into<String>, network: N, k: usize, alpha: usize) -> Self {
        let self_entry = RoutingEntry::from_addr(ip_addr);
        let id = self_entry.node_id;
        Self {
            id,
            self_entry,
            routing: Arc::new(Mutex::new(RoutingTable::new(id, k))),
            kv: Arc::new(Mutex::new(HashMap::new())),
            network: Arc::new(network),
            k,
            alpha,
        }
    }

    /// Restore a node from its persisted form. The identifier is recomputed
    /// from the address.
    pub fn from_snapshot(snapshot: NodeSnapshot, network: N, k: usize, alpha: usize) -> Self {
        let self_entry = RoutingEntry::from_addr(snapshot.ip_addr);
        let id = self_entry.node_id;
        if id != snapshot.node_id {
            warn!(
                stored = snapshot.node_id,
                derived = id,
                "persisted node id does not match its address; using the derived id"
            );
        }
        Self {
            id,
            self_entry,
            routing: Arc::new(Mutex::new(RoutingTable::from_buckets(
                id,
                k,
                snapshot.routing_table,
            ))),
            kv: Arc::new(Mutex::new(snapshot.kv)),
            network: Arc::new(network),
            k,
            alpha,
        }
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        let routing_table = self.routing.lock().await.to_buckets();
        let kv = self.kv.lock().await.clone();
        NodeSnapshot {
            ip_addr: self.self_entry.ip_addr.clone(),
            node_id: self.id,
            routing_table,
            kv,
        }
    }

    pub fn ip_addr(&self) -> &str {
        &self.self_entry.ip_addr
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn alpha(&self) -> usize {
        self.alpha
    }

    /// Copy of the routing table, for inspection.
    pub async fn routing_table(&self) -> RoutingTable {
        self.routing.lock().await.clone()
    }

    /// Feed a contact to the routing table.
    ///
    /// If its bucket is full, a background task pings the bucket's oldest
    /// contact and evicts it in favour of the newcomer if it does not answer.
    pub async fn observe_contact(&self, contact: RoutingEntry) {
        if contact.node_id == self.id {
            return;
        }
        let check = self.routing.lock().await.admit(contact);
        if let Some(check) = check {
            self.spawn_bucket_refresh(check);
        }
    }

    /// Ping-before-evict for a full bucket.
    fn spawn_bucket_refresh(&self, check: EvictionCheck) {
        let network = self.network.clone();
        let routing = self.routing.clone();
        let self_entry = self.self_entry.clone();
        tokio::spawn(async move {
            let alive = probe(&*network, &self_entry, &check.stale).await;
            if !alive {
                debug!(
                    evicted = check.stale.node_id,
                    admitted = check.candidate.node_id,
                    "replacing unresponsive contact"
                );
            }
            routing.lock().await.settle_eviction(check, alive);
        });
    }

    /// Ping a peer. A peer that answers with the expected identifier is fed to
    /// the routing table.
    pub async fn ping(&self, entry: &RoutingEntry) -> bool {
        if entry.node_id == self.id {
            return true;
        }
        let alive = probe(&*self.network, &self.self_entry, entry).await;
        if alive {
            self.observe_contact(entry.clone()).await;
        }
        alive
    }

    /// Ping every entry concurrently and keep only those that answer.
    ///
    /// Returns the number of entries admitted.
    pub async fn readmit(&self, entries: Vec<RoutingEntry>) -> usize {
        let results = join_all(entries.iter().map(|entry| self.ping(entry))).await;
        results.into_iter().filter(|alive| *alive).count()
    }

    /// Join a network through the node listening on `addr`.
    pub async fn bootstrap(&self, addr: &str) -> Result<()> {
        let entry = RoutingEntry::from_addr(addr);
        if entry.node_id == self.id {
            bail!("cannot bootstrap from our own address {addr}");
        }
        if !self.ping(&entry).await {
            bail!("bootstrap peer {addr} did not answer");
        }
        info!(peer = %entry, "bootstrapped");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local state
    // ─────────────────────────────────────────────────────────────────────

    /// Up to `n` known peers closest to `target`.
    pub async fn closest(&self, n: usize, target: NodeId) -> Vec<RoutingEntryDist> {
        self.routing.lock().await.closest(n, target)
    }

    /// Record `user_id -> ip_addr`, replacing any earlier record.
    pub async fn store_local(&self, user_id: NodeId, ip_addr: &str) {
        self.kv.lock().await.insert(user_id, ip_addr.to_string());
    }

    pub async fn lookup_local(&self, user_id: NodeId) -> Option<String> {
        self.kv.lock().await.get(&user_id).cloned()
    }

    /// The reply this node gives to a FindNode/FindUser for `target`.
    async fn local_find(&self, target: NodeId, mode: LookupMode) -> FindIdReply {
        let target_ip_addr = match mode {
            LookupMode::User => self.lookup_local(target).await,
            LookupMode::Node => None,
        };
        let try_nodes = if target_ip_addr.is_some() {
            Vec::new()
        } else {
            self.closest(self.k, target).await
        };
        FindIdReply {
            queried_node_id: self.id,
            queried_ip_addr: self.self_entry.ip_addr.clone(),
            try_nodes,
            target_ip_addr,
        }
    }

    pub async fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let routing_entries = self.routing.lock().await.len();
        let stored_users = self.kv.lock().await.len();
        TelemetrySnapshot {
            routing_entries,
            stored_users,
            k: self.k,
            alpha: self.alpha,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // RPC handlers
    // ─────────────────────────────────────────────────────────────────────

    /// Handle an incoming Ping.
    pub async fn handle_ping(&self, args: PingArgs) -> PingReply {
        self.observe_contact(RoutingEntry {
            node_id: args.querying_node_id,
            ip_addr: args.querying_ip_addr,
        })
        .await;
        PingReply {
            queried_node_id: self.id,
        }
    }

    /// Handle an incoming StoreUser. Last writer wins.
    pub async fn handle_store_user(&self, args: StoreUserArgs) -> StoreUserReply {
        self.observe_contact(RoutingEntry {
            node_id: args.querying_node_id,
            ip_addr: args.querying_ip_addr,
        })
        .await;
        debug!(
            user = args.announced_user_id,
            addr = %args.announced_ip_addr,
            "storing user record"
        );
        self.store_local(args.announced_user_id, &args.announced_ip_addr)
            .await;
        StoreUserReply {
            queried_node_id: self.id,
        }
    }

    /// Handle an incoming FindNode: the `k` closest known peers to the target.
    pub async fn handle_find_node(&self, args: FindIdArgs) -> FindIdReply {
        self.observe_contact(RoutingEntry {
            node_id: args.querying_node_id,
            ip_addr: args.querying_ip_addr,
        })
        .await;
        self.local_find(args.target_id, LookupMode::Node).await
    }

    /// Handle an incoming FindUser: the stored address if this node holds the
    /// record, otherwise the `k` closest known peers.
    pub async fn handle_find_user(&self, args: FindIdArgs) -> FindIdReply {
        self.observe_contact(RoutingEntry {
            node_id: args.querying_node_id,
            ip_addr: args.querying_ip_addr,
        })
        .await;
        self.local_find(args.target_id, LookupMode::User).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lookups
    // ─────────────────────────────────────────────────────────────────────

    /// Query one lookup candidate. The local node answers itself.
    async fn query(
        &self,
        peer: RoutingEntryDist,
        target: NodeId,
        mode: LookupMode,
    ) -> (RoutingEntryDist, Result<FindIdReply>) {
        if peer.entry.node_id == self.id {
            let reply = self.local_find(target, mode).await;
            return (peer, Ok(reply));
        }
        let args = FindIdArgs {
            querying_node_id: self.id,
            querying_ip_addr: self.self_entry.ip_addr.clone(),
            target_id: target,
        };
        let result = match mode {
            LookupMode::Node => self.network.find_node(&peer.entry.ip_addr, args).await,
            LookupMode::User => self.network.find_user(&peer.entry.ip_addr, args).await,
        };
        (peer, result)
    }

    /// Iterative lookup for `target`.
    ///
    /// The lookup:
    /// 1. Seeds its candidate set with the `alpha` closest known peers and the
    ///    local node
    /// 2. Keeps up to `alpha` queries in flight, always to the best untried
    ///    candidates
    /// 3. Merges every reply into the set (deduplicated, nearest `k` kept)
    /// 4. In user mode, stops at the first reply carrying an address
    /// 5. Otherwise stops once a reply leaves the set unchanged, every member
    ///    has been tried and nothing is still in flight
    ///
    /// Unreachable peers are dropped from the set and never re-admitted by a
    /// later merge. Every query is sent to a distinct peer, so the lookup ends
    /// after at most one query per peer it learns about.
    pub async fn id_lookup(&self, target: NodeId, mode: LookupMode) -> LookupOutcome {
        let bound = self.k.max(1);
        let mut closest_set = self.closest(self.alpha, target).await;
        insert_bounded(
            &mut closest_set,
            self.self_entry.clone().with_distance(target),
            bound,
        );
        closest_set.truncate(bound);

        let mut tried: HashSet<NodeId> = HashSet::new();
        let mut failed: HashSet<NodeId> = HashSet::new();
        // Peers that answered a user-mode query without the record.
        let mut unresolved: Vec<RoutingEntryDist> = Vec::new();
        let mut in_flight = FuturesUnordered::new();
        let mut replies = 0usize;

        loop {
            while in_flight.len() < self.alpha {
                let Some(next) = closest_set
                    .iter()
                    .find(|c| !tried.contains(&c.entry.node_id))
                    .cloned()
                else {
                    break;
                };
                tried.insert(next.entry.node_id);
                in_flight.push(self.query(next, target, mode));
            }

            let Some((peer, result)) = in_flight.next().await else {
                break;
            };
            replies += 1;
            debug_assert!(replies <= tried.len(), "lookup received an unrequested reply");

            let reply = match result {
                Ok(reply) => reply,
                Err(err) => {
                    debug!(
                        peer = peer.entry.node_id,
                        addr = %peer.entry.ip_addr,
                        "lookup query failed: {err:#}"
                    );
                    failed.insert(peer.entry.node_id);
                    closest_set.retain(|c| c.entry.node_id != peer.entry.node_id);
                    continue;
                }
            };
            self.observe_contact(reply.queried()).await;

            if mode == LookupMode::User {
                if let Some(ip) = reply.target_ip_addr {
                    debug!(user = target, addr = %ip, via = peer.entry.node_id, "user resolved");
                    self.cache_resolution(target, &ip, &unresolved);
                    return LookupOutcome {
                        closest: closest_set,
                        resolved: Some(ip),
                    };
                }
                unresolved.push(peer);
            }

            let before = closest_set.clone();
            for candidate in reply.try_nodes {
                if failed.contains(&candidate.entry.node_id) {
                    continue;
                }
                // Distances are recomputed locally rather than trusted.
                insert_bounded(&mut closest_set, candidate.entry.with_distance(target), bound);
            }
            closest_set.truncate(bound);

            let all_tried = closest_set
                .iter()
                .all(|c| tried.contains(&c.entry.node_id));
            if closest_set == before && all_tried && in_flight.is_empty() {
                break;
            }
        }

        LookupOutcome {
            closest: closest_set,
            resolved: None,
        }
    }

    /// Store a freshly resolved record at the nearest peer that was asked and
    /// did not have it, so the next lookup for the same user ends sooner.
    /// Best effort: failures are only logged.
    fn cache_resolution(&self, target: NodeId, ip: &str, unresolved: &[RoutingEntryDist]) {
        let Some(peer) = unresolved
            .iter()
            .filter(|p| p.entry.node_id != self.id)
            .min_by_key(|p| p.distance)
        else {
            return;
        };
        let network = self.network.clone();
        let addr = peer.entry.ip_addr.clone();
        let args = StoreUserArgs {
            querying_node_id: self.id,
            querying_ip_addr: self.self_entry.ip_addr.clone(),
            announced_user_id: target,
            announced_ip_addr: ip.to_string(),
        };
        tokio::spawn(async move {
            if let Err(err) = network.store_user(&addr, args).await {
                debug!(addr = %addr, "caching user record failed: {err:#}");
            }
        });
    }

    /// Node-mode lookup: the `k` closest peers to `target`, self included.
    pub async fn find_nodes(&self, target: NodeId) -> Vec<RoutingEntryDist> {
        self.id_lookup(target, LookupMode::Node).await.closest
    }

    /// Resolve a username to the address it last announced.
    pub async fn get_user_ip(&self, username: &str) -> Option<String> {
        self.id_lookup(hash_to_id(username), LookupMode::User)
            .await
            .resolved
    }

    /// Register `username -> ip_addr` in the network.
    ///
    /// Looks up our own identifier first so that peers near us learn about
    /// us, then stores the record locally and at the `k` nodes closest to the
    /// hashed username. Returns how many remote nodes accepted the record.
    pub async fn announce_user(&self, username: &str, ip_addr: &str) -> usize {
        let user_id = hash_to_id(username);
        self.store_local(user_id, ip_addr).await;

        let _ = self.find_nodes(self.id).await;
        let closest = self.find_nodes(user_id).await;

        let stores = closest
            .into_iter()
            .filter(|peer| peer.entry.node_id != self.id)
            .map(|peer| {
                let args = StoreUserArgs {
                    querying_node_id: self.id,
                    querying_ip_addr: self.self_entry.ip_addr.clone(),
                    announced_user_id: user_id,
                    announced_ip_addr: ip_addr.to_string(),
                };
                async move {
                    match self.network.store_user(&peer.entry.ip_addr, args).await {
                        Ok(reply) => {
                            self.observe_contact(RoutingEntry {
                                node_id: reply.queried_node_id,
                                ip_addr: peer.entry.ip_addr.clone(),
                            })
                            .await;
                            true
                        }
                        Err(err) => {
                            debug!(peer = %peer.entry, "store user failed: {err:#}");
                            false
                        }
                    }
                }
            });
        let stored = join_all(stores).await.into_iter().filter(|ok| *ok).count();
        info!(user = username, addr = ip_addr, replicas = stored, "announced user");
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: NodeId) -> RoutingEntry {
        RoutingEntry {
            node_id: id,
            ip_addr: format!("10.0.0.1:{}", id % 60000),
        }
    }

    #[test]
    fn hash_to_id_takes_low_digest_bytes() {
        let digest = Sha1::digest(b"127.0.0.1:4444");
        let expected = u64::from_be_bytes(digest[12..20].try_into().unwrap());
        assert_eq!(hash_to_id("127.0.0.1:4444"), expected);
        assert_eq!(hash_to_id("127.0.0.1:4444"), hash_to_id("127.0.0.1:4444"));
        assert_ne!(hash_to_id("127.0.0.1:4444"), hash_to_id("127.0.0.1:5555"));
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_on_self() {
        let a = 0xDEAD_BEEF_0000_0001;
        let b = 0x0123_4567_89AB_CDEF;
        assert_eq!(xor_distance(a, a), 0);
        assert_eq!(xor_distance(a, b), xor_distance(b, a));
        assert_eq!(xor_distance(a, b), a ^ b);
    }

    #[test]
    fn bucket_index_finds_first_different_bit() {
        assert_eq!(bucket_index(0, 1 << 63), 0);
        assert_eq!(bucket_index(0, 1 << 52), 11);
        assert_eq!(bucket_index(0b1000, 0b1100), 61);
        assert_eq!(bucket_index(0, 1), 63);
        assert_eq!(bucket_index(42, 42), 63);
        assert_eq!(bucket_index(5, 9), bucket_index(9, 5));
    }

    #[test]
    fn bucket_moves_refreshed_contact_to_back() {
        let mut table = RoutingTable::new(0, 4);
        for id in [1u64 << 63, (1 << 63) | 1, (1 << 63) | 2] {
            table.update(entry(id));
        }
        table.update(entry(1 << 63));
        let ids: Vec<NodeId> = table.bucket(0).iter().map(|c| c.node_id).collect();
        assert_eq!(ids, vec![(1 << 63) | 1, (1 << 63) | 2, 1 << 63]);
    }

    #[test]
    fn full_bucket_keeps_live_oldest_contact() {
        let mut table = RoutingTable::new(0, 2);
        table.update(entry(1 << 63));
        table.update(entry((1 << 63) | 1));

        let check = table.admit(entry((1 << 63) | 2)).expect("bucket is full");
        assert_eq!(check.stale.node_id, 1 << 63);

        table.settle_eviction(check, true);
        let ids: Vec<NodeId> = table.bucket(0).iter().map(|c| c.node_id).collect();
        assert_eq!(ids, vec![(1 << 63) | 1, 1 << 63]);
    }

    #[test]
    fn full_bucket_replaces_dead_oldest_contact() {
        let mut table = RoutingTable::new(0, 2);
        table.update(entry(1 << 63));
        table.update(entry((1 << 63) | 1));

        let check = table.admit(entry((1 << 63) | 2)).expect("bucket is full");
        table.settle_eviction(check, false);

        let ids: Vec<NodeId> = table.bucket(0).iter().map(|c| c.node_id).collect();
        assert_eq!(ids, vec![(1 << 63) | 1, (1 << 63) | 2]);
        assert_eq!(table.bucket_len(0), 2);
    }

    #[test]
    fn eviction_check_tolerates_a_bucket_that_moved_on() {
        let mut table = RoutingTable::new(0, 2);
        table.update(entry(1 << 63));
        table.update(entry((1 << 63) | 1));
        let check = table.admit(entry((1 << 63) | 2)).expect("bucket is full");

        // The stale contact is gone and the candidate got in some other way.
        assert!(table.remove(1 << 63));
        assert!(!table.remove(1 << 63));
        table.update(entry((1 << 63) | 2));
        table.settle_eviction(check.clone(), false);
        let ids: Vec<NodeId> = table.bucket(0).iter().map(|c| c.node_id).collect();
        assert_eq!(ids, vec![(1 << 63) | 1, (1 << 63) | 2]);

        // A late "alive" answer for a contact no longer held changes nothing.
        table.settle_eviction(check, true);
        assert_eq!(table.bucket_len(0), 2);
        assert!(!table.contains(1 << 63));
    }

    #[test]
    fn table_never_holds_its_owner() {
        let mut table = RoutingTable::new(99, 4);
        table.update(entry(99));
        assert!(table.is_empty());
        assert!(!table.contains(99));
    }

    #[test]
    fn closest_on_empty_table_is_empty() {
        let table = RoutingTable::new(7, 20);
        assert!(table.closest(5, 1234).is_empty());
    }

    #[test]
    fn closest_matches_exhaustive_sort() {
        let self_id = 0x5555_0000_0000_0000;
        let mut table = RoutingTable::new(self_id, 20);
        let ids: Vec<NodeId> = (0..200u64)
            .map(|i| i.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .collect();
        for id in &ids {
            table.update(entry(*id));
        }

        for target in [self_id, 0, u64::MAX, 0x1234_5678_9ABC_DEF0] {
            let mut expected: Vec<(NodeId, NodeId)> = table
                .entries()
                .iter()
                .map(|c| (c.node_id ^ target, c.node_id))
                .collect();
            expected.sort();
            expected.truncate(8);

            let got: Vec<(NodeId, NodeId)> = table
                .closest(8, target)
                .iter()
                .map(|c| (c.distance, c.entry.node_id))
                .collect();
            assert_eq!(got, expected, "target {target:x}");
        }
    }

    #[test]
    fn from_buckets_replaces_entries_correctly() {
        let mut original = RoutingTable::new(0, 3);
        for id in [1u64 << 63, 1 << 40, 1 << 10, 3] {
            original.update(entry(id));
        }
        // Flatten into a single (wrong) bucket; placement must be recomputed.
        let scrambled = vec![original.entries()];
        let restored = RoutingTable::from_buckets(0, 3, scrambled);
        assert_eq!(restored.len(), 4);
        assert_eq!(restored.bucket_len(0), 1);
        assert_eq!(restored.bucket_len(23), 1);
        assert_eq!(restored.bucket_len(62), 1);
    }

    #[test]
    fn insert_bounded_keeps_best_unique_entries() {
        let mut set = Vec::new();
        for id in [9u64, 3, 7, 3, 1] {
            insert_bounded(&mut set, entry(id).with_distance(0), 3);
        }
        let ids: Vec<NodeId> = set.iter().map(|c| c.entry.node_id).collect();
        assert_eq!(ids, vec![1, 3, 7]);
    }
}
