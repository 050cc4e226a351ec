//! The plugin side of a plugin channel

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::codec::{read_frame, write_frame};
use crate::errors::RpcError;
use crate::message::{Request, RequestFrame, Response};

/// Implemented by anything that can answer driver calls.
#[async_trait]
pub trait Handler: Send {
    /// Answers one call. Errors are sent back to the host as strings.
    async fn handle(&mut self, request: Request) -> Result<serde_json::Value, String>;
}

/// Tunables for [`serve`].
#[derive(Clone, Debug)]
pub struct ServeOptions {
    /// Exit when no frame at all arrives for this long. `None` waits forever.
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        ServeOptions {
            heartbeat_timeout: Some(crate::HEARTBEAT_INTERVAL * 3),
        }
    }
}

/// Serves calls from `reader` until the host hangs up or stops sending
/// heartbeats.
pub async fn serve<R, W, H>(
    mut reader: R,
    mut writer: W,
    handler: &mut H,
    opts: ServeOptions,
) -> Result<(), RpcError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Unpin,
    H: Handler,
{
    // Frames are read on their own task so a heartbeat deadline never cancels
    // a half-read frame.
    let (tx, mut rx) = mpsc::channel::<Result<RequestFrame, RpcError>>(16);
    let pump = tokio::spawn(async move {
        loop {
            match read_frame::<_, RequestFrame>(&mut reader).await {
                Ok(Some(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });

    let result = loop {
        let next = match opts.heartbeat_timeout {
            Some(t) => match tokio::time::timeout(t, rx.recv()).await {
                Ok(next) => next,
                Err(_) => break Err(RpcError::HeartbeatTimeout(t)),
            },
            None => rx.recv().await,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Err(e),
            None => {
                info!("host closed the plugin channel");
                break Ok(());
            }
        };
        let RequestFrame { id, request } = frame;
        let resp = match request {
            Request::Heartbeat => Response::ok(id, serde_json::Value::Null),
            request => {
                let method = request.method();
                debug!(id, method, "serving plugin call");
                match handler.handle(request).await {
                    Ok(v) => Response::ok(id, v),
                    Err(e) => {
                        error!(id, method, error = %e, "driver call failed");
                        Response::err(id, e)
                    }
                }
            }
        };
        if let Err(e) = write_frame(&mut writer, &resp).await {
            break Err(e);
        }
    };
    pump.abort();
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{read_frame, write_frame};

    struct Counter(u32);

    #[async_trait]
    impl Handler for Counter {
        async fn handle(&mut self, _request: Request) -> Result<serde_json::Value, String> {
            self.0 += 1;
            Ok(serde_json::json!(self.0))
        }
    }

    #[tokio::test]
    async fn heartbeats_are_answered_without_the_handler() {
        let (mut host, plugin) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(plugin);
        let server = tokio::spawn(async move {
            let mut counter = Counter(0);
            serve(r, w, &mut counter, ServeOptions::default()).await?;
            Ok::<u32, RpcError>(counter.0)
        });

        for (id, request) in [(1, Request::Heartbeat), (2, Request::GetState)] {
            write_frame(&mut host, &RequestFrame { id, request })
                .await
                .unwrap();
            let resp: Response = read_frame(&mut host).await.unwrap().unwrap();
            assert_eq!(resp.id, id);
        }
        drop(host);
        assert_eq!(server.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn silence_ends_the_plugin() {
        let (_host, plugin) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(plugin);
        let mut counter = Counter(0);
        let res = serve(
            r,
            w,
            &mut counter,
            ServeOptions {
                heartbeat_timeout: Some(Duration::from_millis(50)),
            },
        )
        .await;
        assert!(matches!(res, Err(RpcError::HeartbeatTimeout(_))));
    }
}
