//! Accepts guest connections and serves the export root over each one.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::Error;
use crate::fcall::{Rmessage, Tmessage};
use crate::fs::Session;
use crate::{DEFAULT_MSIZE, VERSION_9P2000_L};

/// Bytes of framing and header that precede the payload of `Rread`.
const IOHDRSZ: u32 = 24;

/// Exports one host directory.
#[derive(Clone, Debug)]
pub struct Server {
    root: PathBuf,
    msize: u32,
}

impl Server {
    /// Creates a server exporting `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Server {
            root: root.into(),
            msize: DEFAULT_MSIZE,
        }
    }

    /// Caps the message size offered to clients.
    pub fn with_msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    /// The directory being exported.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Accepts connections until `shutdown` is cancelled. Live connections are
    /// dropped when that happens.
    #[instrument(level = "info", skip(self, listener, shutdown), fields(root = %self.root.display()))]
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), Error> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("9p server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    info!(%peer, "guest connected");
                    let server = self.clone();
                    let token = shutdown.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            res = server.serve_connection(stream) => {
                                if let Err(e) = res {
                                    warn!(%peer, error = %e, "9p connection ended with an error");
                                }
                            }
                            _ = token.cancelled() => {}
                        }
                    });
                }
            }
        }
    }

    /// Serves a single connection until the client disconnects.
    pub async fn serve_connection<S>(&self, mut stream: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut msize = self.msize;
        let mut session = Session::new(self.root.clone(), msize.saturating_sub(IOHDRSZ));
        loop {
            let mut size_buf = [0u8; 4];
            match stream.read_exact(&mut size_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("guest disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            let size = u32::from_le_bytes(size_buf);
            if size > msize || size < 7 {
                return Err(Error::TooLarge { size, msize });
            }
            let mut buf = vec![0u8; size as usize];
            buf[..4].copy_from_slice(&size_buf);
            stream.read_exact(&mut buf[4..]).await?;
            let raw_tag = u16::from_le_bytes([buf[5], buf[6]]);

            let (tag, reply) = match Tmessage::decode(&buf) {
                Ok((tag, Tmessage::Version { msize: want, version })) => {
                    msize = want.min(self.msize);
                    // A version message aborts every outstanding fid
                    session = Session::new(self.root.clone(), msize.saturating_sub(IOHDRSZ));
                    let version = if version.starts_with(VERSION_9P2000_L) {
                        VERSION_9P2000_L.to_owned()
                    } else {
                        warn!(%version, "guest asked for an unsupported 9p dialect");
                        "unknown".to_owned()
                    };
                    (tag, Rmessage::Version { msize, version })
                }
                Ok((tag, msg)) => {
                    let moved = session;
                    let (back, reply) = tokio::task::spawn_blocking(move || {
                        let mut s = moved;
                        let reply = s.handle(msg);
                        (s, reply)
                    })
                    .await
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    session = back;
                    (tag, reply)
                }
                Err(Error::UnknownType(t)) => {
                    debug!(typ = t, "unsupported 9p message");
                    (
                        raw_tag,
                        Rmessage::Lerror {
                            ecode: libc::EOPNOTSUPP as u32,
                        },
                    )
                }
                Err(e) => {
                    warn!(error = %e, "malformed 9p message");
                    (
                        raw_tag,
                        Rmessage::Lerror {
                            ecode: libc::EINVAL as u32,
                        },
                    )
                }
            };
            stream.write_all(&reply.encode(tag)).await?;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fcall::{NOFID, NOTAG};

    async fn roundtrip<S>(stream: &mut S, tag: u16, msg: Tmessage) -> Rmessage
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&msg.encode(tag).unwrap()).await.unwrap();
        let mut size = [0u8; 4];
        stream.read_exact(&mut size).await.unwrap();
        let n = u32::from_le_bytes(size) as usize;
        let mut buf = vec![0u8; n];
        buf[..4].copy_from_slice(&size);
        stream.read_exact(&mut buf[4..]).await.unwrap();
        let (got, reply) = Rmessage::decode(&buf).unwrap();
        assert_eq!(got, tag);
        reply
    }

    #[tokio::test]
    async fn negotiates_and_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("motd"), "hello from the host").unwrap();
        let server = Server::new(dir.path()).with_msize(8192);
        let (mut client, srv) = tokio::io::duplex(65536);
        let task = tokio::spawn(async move { server.serve_connection(srv).await });

        let reply = roundtrip(
            &mut client,
            NOTAG,
            Tmessage::Version {
                msize: 65536,
                version: "9P2000.L".into(),
            },
        )
        .await;
        assert_eq!(
            reply,
            Rmessage::Version {
                msize: 8192,
                version: "9P2000.L".into()
            }
        );

        let reply = roundtrip(
            &mut client,
            1,
            Tmessage::Attach {
                fid: 0,
                afid: NOFID,
                uname: "docker".into(),
                aname: String::new(),
                n_uname: 1000,
            },
        )
        .await;
        assert!(matches!(reply, Rmessage::Attach { .. }));

        let reply = roundtrip(
            &mut client,
            2,
            Tmessage::Walk {
                fid: 0,
                newfid: 1,
                wnames: vec!["motd".into()],
            },
        )
        .await;
        assert!(matches!(reply, Rmessage::Walk { ref qids } if qids.len() == 1));

        let reply = roundtrip(&mut client, 3, Tmessage::Lopen { fid: 1, flags: 0 }).await;
        assert!(matches!(reply, Rmessage::Lopen { .. }));

        let reply = roundtrip(
            &mut client,
            4,
            Tmessage::Read {
                fid: 1,
                offset: 0,
                count: 4096,
            },
        )
        .await;
        assert_eq!(
            reply,
            Rmessage::Read {
                data: b"hello from the host".to_vec()
            }
        );

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_dialects_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(dir.path());
        let (mut client, srv) = tokio::io::duplex(65536);
        tokio::spawn(async move { server.serve_connection(srv).await });
        let reply = roundtrip(
            &mut client,
            NOTAG,
            Tmessage::Version {
                msize: 8192,
                version: "9P2000.u".into(),
            },
        )
        .await;
        assert_eq!(
            reply,
            Rmessage::Version {
                msize: 8192,
                version: "unknown".into()
            }
        );
    }

    #[tokio::test]
    async fn missing_files_report_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(dir.path());
        let (mut client, srv) = tokio::io::duplex(65536);
        tokio::spawn(async move { server.serve_connection(srv).await });
        roundtrip(
            &mut client,
            1,
            Tmessage::Attach {
                fid: 0,
                afid: NOFID,
                uname: "docker".into(),
                aname: String::new(),
                n_uname: 1000,
            },
        )
        .await;
        let reply = roundtrip(
            &mut client,
            2,
            Tmessage::Walk {
                fid: 0,
                newfid: 1,
                wnames: vec!["nope".into()],
            },
        )
        .await;
        assert_eq!(
            reply,
            Rmessage::Lerror {
                ecode: libc::ENOENT as u32
            }
        );
    }
}
