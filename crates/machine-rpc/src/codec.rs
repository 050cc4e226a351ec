//! Framing: a 4 byte big-endian length followed by that many bytes of JSON.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::RpcError;

/// Frames larger than this are rejected without being read.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serializes `msg` and writes it as a single frame, flushing afterwards.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the stream on a
/// frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{Request, RequestFrame};

    #[tokio::test]
    async fn frames_survive_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let sent = RequestFrame {
            id: 7,
            request: Request::GetSshPort,
        };
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &sent).await.unwrap();
        });
        let got: RequestFrame = read_frame(&mut b).await.unwrap().unwrap();
        writer.await.unwrap();
        assert_eq!(got.id, 7);
        assert_eq!(got.request, Request::GetSshPort);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let got: Option<RequestFrame> = read_frame(&mut b).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        let res: Result<Option<RequestFrame>, _> = read_frame(&mut b).await;
        assert!(matches!(res, Err(RpcError::FrameTooLarge(_))));
    }
}
