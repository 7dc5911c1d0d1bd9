//! Network implementation over plain TCP.
//!
//! This module provides [`TcpNetwork`], the [`DhtNetwork`] used outside of
//! tests. Every call opens a fresh connection, writes one JSON encoded
//! [`Request`] frame and reads one [`Response`] frame back (see
//! [`crate::framing`]). The whole exchange, dial included, is bounded by the
//! configured timeout.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{self, Duration};

use crate::core::DhtNetwork;
use crate::framing::{read_frame, write_frame};
use crate::protocol::{Request, Response};

/// Default upper bound on a single RPC.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout-bounded TCP transport.
#[derive(Clone, Debug)]
pub struct TcpNetwork {
    timeout: Duration,
}

impl Default for TcpNetwork {
    fn default() -> Self {
        Self::new(RPC_TIMEOUT)
    }
}

impl TcpNetwork {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

async fn exchange(addr: &str, request: &Request) -> Result<Response> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    stream.set_nodelay(true)?;

    let bytes = serde_json::to_vec(request)?;
    write_frame(&mut stream, &bytes)
        .await
        .with_context(|| format!("sending {} to {addr}", request.method()))?;

    let Some(reply) = read_frame(&mut stream).await? else {
        bail!("{addr} closed the connection without answering {}", request.method());
    };
    let response = serde_json::from_slice(&reply)
        .with_context(|| format!("decoding {} reply from {addr}", request.method()))?;
    Ok(response)
}

#[async_trait]
impl DhtNetwork for TcpNetwork {
    async fn call(&self, addr: &str, request: Request) -> Result<Response> {
        match time::timeout(self.timeout, exchange(addr, &request)).await {
            Ok(result) => result,
            Err(_) => bail!(
                "{} to {addr} timed out after {:?}",
                request.method(),
                self.timeout
            ),
        }
    }
}
