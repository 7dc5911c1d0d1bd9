//! Inbound side of the RPC layer.
//!
//! [`serve`] accepts TCP connections and hands each one to
//! [`handle_connection`], which reads a single request frame, dispatches it to
//! an [`RpcHandler`] and writes back a single response frame. A handler error
//! travels back as [`Response::Error`], so the caller sees a failed call.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::core::{DhtNetwork, DhtNode};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{Request, Response};

/// Something that can answer RPCs.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Response>;
}

/// A bare DHT node answers the routing RPCs only; message delivery needs a
/// logged-in [`crate::User`].
#[async_trait]
impl<N: DhtNetwork> RpcHandler for DhtNode<N> {
    async fn handle(&self, request: Request) -> Result<Response> {
        let response = match request {
            Request::Ping(args) => Response::Ping(self.handle_ping(args).await),
            Request::StoreUser(args) => Response::StoreUser(self.handle_store_user(args).await),
            Request::FindNode(args) => Response::FindNode(self.handle_find_node(args).await),
            Request::FindUser(args) => Response::FindUser(self.handle_find_user(args).await),
            Request::DeliverMessage(_) => {
                anyhow::bail!("DeliverMessage is not served by a bare DHT node")
            }
        };
        Ok(response)
    }
}

/// Serve one request on `stream`. A peer that does not finish sending its
/// request within `read_timeout` is dropped.
pub async fn handle_connection<H>(handler: &H, mut stream: TcpStream, read_timeout: Duration) -> Result<()>
where
    H: RpcHandler + ?Sized,
{
    let frame = time::timeout(read_timeout, read_frame(&mut stream))
        .await
        .with_context(|| format!("no request within {read_timeout:?}"))?;
    let Some(bytes) = frame? else {
        return Ok(());
    };
    let request: Request = serde_json::from_slice(&bytes).context("decoding request")?;
    let method = request.method();

    let response = match handler.handle(request).await {
        Ok(response) => response,
        Err(err) => {
            debug!(method, "handler rejected request: {err:#}");
            Response::Error(format!("{err:#}"))
        }
    };

    let reply = serde_json::to_vec(&response)?;
    write_frame(&mut stream, &reply).await?;
    stream.shutdown().await?;
    Ok(())
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))
}

/// Accept connections until `shutdown` turns true, one task per connection.
pub async fn serve<H>(
    listener: TcpListener,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
    read_timeout: Duration,
) -> Result<()>
where
    H: RpcHandler + ?Sized,
{
    let local = listener.local_addr()?;
    info!(addr = %local, "listening");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(addr = %local, "accept failed: {err}");
                        continue;
                    }
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(&*handler, stream, read_timeout).await {
                        debug!(peer = %peer, "connection error: {err:#}");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(addr = %local, "stopped listening");
    Ok(())
}
