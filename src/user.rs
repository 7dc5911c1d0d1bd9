//! Messaging layer on top of a [`DhtNode`].
//!
//! A [`User`] owns one DHT node plus per-peer message state:
//!
//! - `message_history`: messages received, keyed by sender
//! - `pending_messages`: outbound FIFO queues, keyed by recipient. A queue may
//!   also hold messages relayed on behalf of other users.
//! - `received_message_identifiers`: identifiers already accepted, so a message
//!   that arrives several times is recorded once
//!
//! Two background loops run while the user is logged in. The sender loop
//! resolves each recipient and drains its queue; the persistor loop writes the
//! user's state file on a fixed interval.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::core::{hash_to_id, DhtNetwork, DhtNode, RoutingEntry, TelemetrySnapshot};
use crate::net::TcpNetwork;
use crate::persist::{self, username_to_path, UserSnapshot};
use crate::protocol::{Message, Request, Response, SendMessageArgs};
use crate::server::{self, RpcHandler};

/// Capacity of the new-message notification channel.
const NOTIFICATION_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct MessageState {
    message_history: HashMap<String, Vec<Message>>,
    pending_messages: HashMap<String, VecDeque<Message>>,
    received_message_identifiers: HashSet<i64>,
    /// Senders with messages not yet fetched through `messages_from`.
    unread: HashSet<String>,
}

/// A chat participant bound to one address.
pub struct User<N: DhtNetwork> {
    name: String,
    node: Arc<DhtNode<N>>,
    config: Config,
    path: PathBuf,
    state: Mutex<MessageState>,
    rng: Mutex<StdRng>,
    notifications: broadcast::Sender<String>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    online: AtomicBool,
    persist_lock: Mutex<()>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

impl<N: DhtNetwork> User<N> {
    /// Restore `username` from its state file, or create it if there is none.
    ///
    /// When the stored address differs from `my_ip` the node takes the
    /// identifier of the new address and starts from an empty routing table;
    /// peers from the old table are re-admitted only if they answer a ping.
    /// A corrupt state file is an error.
    pub async fn open(username: &str, my_ip: &str, network: N, config: Config) -> Result<Arc<Self>> {
        let path = username_to_path(&config.state_dir, username);
        let (node, state) = match persist::load(&path).await? {
            Some(snapshot) => {
                if snapshot.name != username {
                    bail!(
                        "state file {} belongs to {:?}, not {username:?}",
                        path.display(),
                        snapshot.name
                    );
                }
                Self::restore(snapshot, my_ip, network, &config).await
            }
            None => {
                info!(user = username, addr = my_ip, "creating new user");
                (
                    DhtNode::new(my_ip, network, config.k, config.alpha),
                    MessageState::default(),
                )
            }
        };

        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            name: username.to_string(),
            node: Arc::new(node),
            rng: Mutex::new(config.rng()),
            config,
            path,
            state: Mutex::new(state),
            notifications,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
            persist_lock: Mutex::new(()),
        }))
    }

    async fn restore(
        snapshot: UserSnapshot,
        my_ip: &str,
        network: N,
        config: &Config,
    ) -> (DhtNode<N>, MessageState) {
        let state = MessageState {
            message_history: snapshot.message_history,
            pending_messages: snapshot.pending_messages,
            received_message_identifiers: snapshot.received_message_identifiers,
            unread: HashSet::new(),
        };

        if snapshot.node.ip_addr == my_ip {
            info!(user = %snapshot.name, addr = my_ip, "restored user");
            let node = DhtNode::from_snapshot(snapshot.node, network, config.k, config.alpha);
            return (node, state);
        }

        let old_ip = snapshot.node.ip_addr;
        let old_peers: Vec<RoutingEntry> = snapshot.node.routing_table.into_iter().flatten().collect();
        let node = DhtNode::new(my_ip, network, config.k, config.alpha);
        for (user_id, ip) in snapshot.node.kv {
            node.store_local(user_id, &ip).await;
        }
        let known = old_peers.len();
        let admitted = node.readmit(old_peers).await;
        info!(
            user = %snapshot.name,
            old_addr = %old_ip,
            addr = my_ip,
            admitted,
            known,
            "address changed; re-admitted live peers"
        );
        (node, state)
    }

    /// Join the network and start the background loops.
    ///
    /// The RPC listener must already be running so that peers contacted
    /// during the announcement can reach back.
    pub async fn start(self: &Arc<Self>, bootstrap: Option<&str>) -> Result<()> {
        let span = info_span!("user", name = %self.name, node = self.node.id);
        async {
            if let Some(addr) = bootstrap {
                self.node.bootstrap(addr).await?;
            }
            self.node.announce_user(&self.name, self.node.ip_addr()).await;
            anyhow::Ok(())
        }
        .instrument(span.clone())
        .await?;

        let sender = tokio::spawn(
            self.clone()
                .sender_loop(self.shutdown.subscribe())
                .instrument(span.clone()),
        );
        let persistor = tokio::spawn(
            self.clone()
                .persistor_loop(self.shutdown.subscribe())
                .instrument(span),
        );
        self.tasks.lock().await.extend([sender, persistor]);
        info!(user = %self.name, addr = self.node.ip_addr(), "logged in");
        Ok(())
    }

    /// Hand the task serving this user's RPCs to the user, so that logoff
    /// waits for it.
    pub async fn attach_listener(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    /// Receiver that turns true when the user logs off.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop the listener and the background loops, then persist.
    ///
    /// Calling it again is a no-op.
    pub async fn logoff(&self) -> Result<()> {
        if !self.stop().await {
            return Ok(());
        }
        self.persist().await?;
        info!(user = %self.name, "logged off");
        Ok(())
    }

    /// Signal shutdown and wait for every attached task. Returns false if the
    /// user was already stopped.
    async fn stop(&self) -> bool {
        if !self.online.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(user = %self.name, "background task ended abnormally: {err}");
            }
        }
        true
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &Arc<DhtNode<N>> {
        &self.node
    }

    pub fn is_logged_in(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────

    /// Queue a message for `to`. Delivery happens in the background; the
    /// returned value is the message identifier.
    pub async fn send_message(&self, to: &str, content: &str) -> i64 {
        let message_identifier = self.rng.lock().await.gen_range(0..1i64 << 62);
        let message = Message {
            content: content.to_string(),
            timestamp: now_millis(),
            to_username: to.to_string(),
            from_username: self.name.clone(),
            message_identifier,
        };
        self.state
            .lock()
            .await
            .pending_messages
            .entry(to.to_string())
            .or_default()
            .push_back(message);
        message_identifier
    }

    /// One pass of the sender loop over every non-empty queue.
    pub async fn deliver_pending(&self) {
        let recipients: Vec<String> = {
            let state = self.state.lock().await;
            state
                .pending_messages
                .iter()
                .filter(|(_, queue)| !queue.is_empty())
                .map(|(recipient, _)| recipient.clone())
                .collect()
        };
        for recipient in recipients {
            self.deliver_to(&recipient).await;
        }
    }

    async fn deliver_to(&self, recipient: &str) {
        let Some(ip) = self.node.get_user_ip(recipient).await else {
            debug!(recipient, "recipient not resolvable; keeping messages queued");
            return;
        };
        if !self.node.ping(&RoutingEntry::from_addr(ip.clone())).await {
            let queued = self.pending_for(recipient).await;
            if !queued.is_empty() {
                debug!(recipient, addr = %ip, queued = queued.len(), "recipient offline; caching at neighbours");
                self.forward_to_neighbors(recipient, &ip, &queued).await;
            }
            return;
        }

        loop {
            let next = {
                let mut state = self.state.lock().await;
                state
                    .pending_messages
                    .get_mut(recipient)
                    .and_then(|queue| queue.pop_front())
            };
            let Some(message) = next else {
                break;
            };

            match self
                .node
                .network()
                .deliver_message(&ip, message.clone())
                .await
            {
                Ok(()) => {
                    debug!(
                        recipient,
                        id = message.message_identifier,
                        "delivered message"
                    );
                }
                Err(err) => {
                    warn!(recipient, addr = %ip, "delivery failed, caching at neighbours: {err:#}");
                    self.state
                        .lock()
                        .await
                        .pending_messages
                        .entry(recipient.to_string())
                        .or_default()
                        .push_front(message.clone());
                    self.forward_to_neighbors(recipient, &ip, &[message]).await;
                    break;
                }
            }
        }

        let mut state = self.state.lock().await;
        if state
            .pending_messages
            .get(recipient)
            .is_some_and(|queue| queue.is_empty())
        {
            state.pending_messages.remove(recipient);
        }
    }

    /// Hand a copy of each message to the nodes closest to the recipient's
    /// hashed name, so one of them can deliver it later. The local queue is
    /// left as it is.
    async fn forward_to_neighbors(&self, recipient: &str, recipient_ip: &str, messages: &[Message]) {
        let neighbors: Vec<String> = self
            .node
            .find_nodes(hash_to_id(recipient))
            .await
            .into_iter()
            .filter(|peer| peer.entry.node_id != self.node.id && peer.entry.ip_addr != recipient_ip)
            .map(|peer| peer.entry.ip_addr)
            .collect();
        let network = self.node.network();
        let sends = neighbors.iter().flat_map(|peer| {
            messages.iter().map(move |message| async move {
                if let Err(err) = network.deliver_message(peer, message.clone()).await {
                    debug!(%peer, "relay hand-off failed: {err:#}");
                    false
                } else {
                    true
                }
            })
        });
        let accepted = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        debug!(recipient, accepted, "cached messages at neighbours");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Receiving
    // ─────────────────────────────────────────────────────────────────────

    /// Accept an inbound message.
    ///
    /// A message for this user is recorded once per identifier; repeats are
    /// dropped. A message for someone else is queued for relaying unless the
    /// same identifier is already queued.
    pub async fn handle_send_message(&self, args: SendMessageArgs) -> Result<()> {
        if args.to_username != self.name {
            let mut state = self.state.lock().await;
            let queue = state
                .pending_messages
                .entry(args.to_username.clone())
                .or_default();
            if queue
                .iter()
                .any(|queued| queued.message_identifier == args.message_identifier)
            {
                return Ok(());
            }
            debug!(
                to = %args.to_username,
                from = %args.from_username,
                id = args.message_identifier,
                "queued message for relay"
            );
            queue.push_back(args);
            return Ok(());
        }

        {
            let mut state = self.state.lock().await;
            if !state
                .received_message_identifiers
                .insert(args.message_identifier)
            {
                debug!(
                    from = %args.from_username,
                    id = args.message_identifier,
                    "dropping duplicate message"
                );
                return Ok(());
            }
            state.unread.insert(args.from_username.clone());
            state
                .message_history
                .entry(args.from_username.clone())
                .or_default()
                .push(args.clone());
        }

        // Nobody listening is fine.
        let _ = self.notifications.send(args.from_username.clone());

        if let Err(err) = self.persist().await {
            warn!(user = %self.name, "persisting received message failed: {err:#}");
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Whether `username` resolves to an address that answers a ping.
    pub async fn is_online(&self, username: &str) -> bool {
        match self.node.get_user_ip(username).await {
            Some(ip) => self.node.ping(&RoutingEntry::from_addr(ip)).await,
            None => false,
        }
    }

    /// History from `peer`, oldest first. Marks the conversation read.
    pub async fn messages_from(&self, peer: &str) -> Vec<Message> {
        let mut state = self.state.lock().await;
        state.unread.remove(peer);
        let mut messages = state
            .message_history
            .get(peer)
            .cloned()
            .unwrap_or_default();
        messages.sort_by_key(|message| message.timestamp);
        messages
    }

    /// History from `peer` in arrival order, without touching unread marks.
    pub async fn message_history(&self, peer: &str) -> Vec<Message> {
        self.state
            .lock()
            .await
            .message_history
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn has_new_messages_from(&self, peer: &str) -> bool {
        self.state.lock().await.unread.contains(peer)
    }

    /// Peers this user has received messages from.
    pub async fn conversations(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .state
            .lock()
            .await
            .message_history
            .keys()
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    /// Messages still queued for `recipient`.
    pub async fn pending_for(&self, recipient: &str) -> Vec<Message> {
        self.state
            .lock()
            .await
            .pending_messages
            .get(recipient)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages queued across all recipients.
    pub async fn pending_count(&self) -> usize {
        self.state
            .lock()
            .await
            .pending_messages
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// Log one telemetry line for this user and its node.
    pub async fn log_telemetry(&self) -> TelemetrySnapshot {
        let snapshot = self.node.telemetry_snapshot().await;
        let pending = self.pending_count().await;
        info!(
            user = %self.name,
            routing_entries = snapshot.routing_entries,
            stored_users = snapshot.stored_users,
            pending,
            k = snapshot.k,
            alpha = snapshot.alpha,
            "telemetry"
        );
        snapshot
    }

    /// Subscribe to the names of senders of newly received messages.
    pub fn notifications(&self) -> broadcast::Receiver<String> {
        self.notifications.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> UserSnapshot {
        let node = self.node.snapshot().await;
        let state = self.state.lock().await;
        UserSnapshot {
            name: self.name.clone(),
            node,
            message_history: state.message_history.clone(),
            pending_messages: state.pending_messages.clone(),
            received_message_identifiers: state.received_message_identifiers.clone(),
        }
    }

    /// Write the state file now.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot().await;
        persist::save(&self.path, &snapshot).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Background loops
    // ─────────────────────────────────────────────────────────────────────

    async fn sender_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.config.send_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => self.deliver_pending().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("sender loop stopped");
    }

    async fn persistor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.config.persist_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.persist().await {
                        warn!("periodic persist failed: {err:#}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("persistor loop stopped");
    }
}

/// A logged-in user answers the DHT RPCs through its node and accepts
/// messages. A logged-off user answers nothing.
#[async_trait]
impl<N: DhtNetwork> RpcHandler for User<N> {
    async fn handle(&self, request: Request) -> Result<Response> {
        if !self.is_logged_in() {
            bail!("{} is logged off", self.name);
        }
        match request {
            Request::DeliverMessage(args) => {
                self.handle_send_message(args).await?;
                Ok(Response::DeliverMessage)
            }
            other => self.node.handle(other).await,
        }
    }
}

impl User<TcpNetwork> {
    /// Log in as an existing user (or create it) on `my_ip`, without a
    /// bootstrap peer. Peers are found through the restored routing table.
    pub async fn login(username: &str, my_ip: &str, config: Config) -> Result<Arc<Self>> {
        Self::register_and_login(username, my_ip, None, config).await
    }

    /// Log in on `my_ip`, joining the network through `bootstrap` if given.
    ///
    /// Starts the TCP listener, announces the user and starts the background
    /// loops.
    pub async fn register_and_login(
        username: &str,
        my_ip: &str,
        bootstrap: Option<&str>,
        config: Config,
    ) -> Result<Arc<Self>> {
        let read_timeout = config.rpc_timeout;
        let network = TcpNetwork::new(read_timeout);
        let user = Self::open(username, my_ip, network, config).await?;
        let listener = server::bind(my_ip).await?;

        let handler = user.clone();
        let shutdown = user.shutdown_signal();
        let span = info_span!("listener", user = username);
        let listening = tokio::spawn(
            async move {
                if let Err(err) = server::serve(listener, handler, shutdown, read_timeout).await {
                    warn!("listener failed: {err:#}");
                }
            }
            .instrument(span),
        );
        user.attach_listener(listening).await;

        if let Err(err) = user.start(bootstrap).await {
            // A failed login leaves the state file untouched.
            user.stop().await;
            return Err(err);
        }
        Ok(user)
    }
}
