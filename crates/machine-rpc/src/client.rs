//! The host side of a plugin channel

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::{read_frame, write_frame};
use crate::errors::RpcError;
use crate::message::{Request, RequestFrame, Response};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Channel {
    reader: BoxedReader,
    writer: BoxedWriter,
}

/// Issues calls to a driver plugin.
///
/// Calls are serialized: a plugin serves one request at a time, so the client
/// holds its channel for the full round trip. A call that times out leaves the
/// channel in an unknown position, after which every later call fails with
/// [`RpcError::Closed`].
pub struct Client {
    channel: Mutex<Channel>,
    next_id: AtomicU64,
    broken: AtomicBool,
}

impl Client {
    /// Wraps the two halves of a plugin's stdio.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Client {
            channel: Mutex::new(Channel {
                reader: Box::new(reader),
                writer: Box::new(writer),
            }),
            next_id: AtomicU64::new(1),
            broken: AtomicBool::new(false),
        }
    }

    /// Sends `request` and decodes the reply into `T`, failing if the whole
    /// round trip exceeds `timeout`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<T, RpcError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let method = request.method();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        trace!(id, method, "calling plugin");

        let mut channel = self.channel.lock().await;
        let round_trip = async {
            write_frame(&mut channel.writer, &RequestFrame { id, request }).await?;
            match read_frame::<_, Response>(&mut channel.reader).await? {
                Some(resp) if resp.id == id => Ok(resp),
                Some(resp) => Err(RpcError::UnexpectedReply { got: resp.id, want: id }),
                None => Err(RpcError::Closed),
            }
        };
        let resp = match tokio::time::timeout(timeout, round_trip).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                self.broken.store(true, Ordering::SeqCst);
                return Err(e);
            }
            Err(_) => {
                self.broken.store(true, Ordering::SeqCst);
                return Err(RpcError::Timeout {
                    method: method.to_owned(),
                    timeout,
                });
            }
        };
        if let Some(e) = resp.error {
            debug!(id, method, error = %e, "plugin returned an error");
            return Err(RpcError::Remote(e));
        }
        Ok(serde_json::from_value(resp.result)?)
    }

    /// Like [`Client::call`] for methods that return nothing.
    pub async fn call_unit(&self, request: Request, timeout: Duration) -> Result<(), RpcError> {
        self.call::<serde_json::Value>(request, timeout)
            .await
            .map(|_| ())
    }

    /// True once a transport failure or timeout has poisoned the channel.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Pings the plugin every `interval` until the client is dropped or the
    /// channel breaks.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Client> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let client = match weak.upgrade() {
                    Some(c) => c,
                    None => return,
                };
                if client.is_broken() {
                    return;
                }
                if let Err(e) = client.call_unit(Request::Heartbeat, interval).await {
                    warn!(error = %e, "plugin heartbeat failed");
                    return;
                }
            }
        })
    }
}
