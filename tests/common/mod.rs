#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration, Instant};

use peerchat::{Config, DhtNetwork, DhtNode, Request, Response, RpcHandler, User};

/// In-memory transport. Calls are dispatched straight to the handler
/// registered for the address; each node gets its own instance so failures
/// can be injected per caller.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    failures: Arc<Mutex<HashSet<String>>>,
    method_failures: Arc<Mutex<HashSet<(String, &'static str)>>>,
    calls: Arc<Mutex<Vec<(String, &'static str)>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>) -> Self {
        Self {
            registry,
            failures: Arc::new(Mutex::new(HashSet::new())),
            method_failures: Arc::new(Mutex::new(HashSet::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make every call from this network to `addr` fail.
    pub async fn set_failure(&self, addr: &str, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(addr.to_string());
        } else {
            failures.remove(addr);
        }
    }

    /// Make calls of one method from this network to `addr` fail.
    pub async fn set_method_failure(&self, addr: &str, method: &'static str, fail: bool) {
        let mut failures = self.method_failures.lock().await;
        if fail {
            failures.insert((addr.to_string(), method));
        } else {
            failures.remove(&(addr.to_string(), method));
        }
    }

    pub async fn calls(&self) -> Vec<(String, &'static str)> {
        self.calls.lock().await.clone()
    }

    pub async fn calls_of(&self, method: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(_, m)| *m == method)
            .count()
    }
}

#[async_trait::async_trait]
impl DhtNetwork for TestNetwork {
    async fn call(&self, addr: &str, request: Request) -> Result<Response> {
        let method = request.method();
        self.calls.lock().await.push((addr.to_string(), method));

        if self.failures.lock().await.contains(addr) {
            return Err(anyhow!("injected network failure"));
        }
        if self
            .method_failures
            .lock()
            .await
            .contains(&(addr.to_string(), method))
        {
            return Err(anyhow!("injected {method} failure"));
        }

        let handler = self
            .registry
            .get(addr)
            .await
            .ok_or_else(|| anyhow!("no peer listening on {addr}"))?;
        match handler.handle(request).await {
            Ok(Response::Error(msg)) => Err(anyhow!("remote error: {msg}")),
            Ok(response) => Ok(response),
            Err(err) => Err(err),
        }
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, addr: &str, handler: Arc<dyn RpcHandler>) {
        self.peers.write().await.insert(addr.to_string(), handler);
    }

    pub async fn unregister(&self, addr: &str) {
        self.peers.write().await.remove(addr);
    }

    pub async fn get(&self, addr: &str) -> Option<Arc<dyn RpcHandler>> {
        self.peers.read().await.get(addr).cloned()
    }
}

pub fn make_addr(index: usize) -> String {
    format!("10.0.{}.{}:4000", index / 250, index % 250 + 1)
}

/// A bare DHT node registered on the in-memory network.
pub struct TestNode {
    pub node: Arc<DhtNode<TestNetwork>>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: usize, k: usize, alpha: usize) -> Self {
        let network = TestNetwork::new(registry.clone());
        let node = Arc::new(DhtNode::new(make_addr(index), network.clone(), k, alpha));
        registry.register(node.ip_addr(), node.clone()).await;
        Self { node, network }
    }

    pub fn addr(&self) -> &str {
        self.node.ip_addr()
    }
}

/// A user registered on the in-memory network.
pub struct TestPeer {
    pub user: Arc<User<TestNetwork>>,
    pub network: TestNetwork,
}

impl TestPeer {
    /// Open (or restore) `name` on `addr`, register it and start it.
    pub async fn login(
        registry: Arc<NetworkRegistry>,
        name: &str,
        addr: &str,
        bootstrap: Option<&str>,
        config: Config,
    ) -> Result<Self> {
        let network = TestNetwork::new(registry.clone());
        let user = User::open(name, addr, network.clone(), config).await?;
        registry.register(addr, user.clone()).await;
        user.start(bootstrap).await?;
        Ok(Self { user, network })
    }

    pub fn addr(&self) -> &str {
        self.user.node().ip_addr()
    }
}

pub fn test_config(state_dir: &Path) -> Config {
    Config::default()
        .with_state_dir(state_dir)
        .with_send_interval(Duration::from_millis(20))
        .with_persist_interval(Duration::from_millis(200))
}

/// Poll `check` until it holds or `timeout` elapses. Returns its last answer.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
