//! Tunables shared by a [`crate::DhtNode`] and the [`crate::User`] that owns it.

use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Duration;

use crate::core::{ALPHA, K};
use crate::net::RPC_TIMEOUT;

/// How often the sender loop walks the pending queues.
const SEND_INTERVAL: Duration = Duration::from_millis(200);

/// How often the persistor loop snapshots the user to disk.
const PERSIST_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct Config {
    /// Bucket capacity and lookup result bound.
    pub k: usize,
    /// Number of lookup queries kept in flight.
    pub alpha: usize,
    /// Upper bound on a single RPC, dial included.
    pub rpc_timeout: Duration,
    pub send_interval: Duration,
    pub persist_interval: Duration,
    /// Directory holding one state file per username.
    pub state_dir: PathBuf,
    /// Seed for message identifiers. `None` draws from OS entropy.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            rpc_timeout: RPC_TIMEOUT,
            send_interval: SEND_INTERVAL,
            persist_interval: PERSIST_INTERVAL,
            state_dir: std::env::temp_dir(),
            rng_seed: None,
        }
    }
}

impl Config {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha.max(1);
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the random source used for message identifiers.
    pub(crate) fn rng(&self) -> StdRng {
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}
