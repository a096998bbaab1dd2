//! An asynchronous source of whole frames from a TCP read half.

use std::sync::Arc;
use std::time::Duration;

use spiral_common::error::{ProxyError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::session::Session;

use super::packet_buffer::PacketBuffer;

/// Idle deadline for a single read, chosen to be double the
/// serverbound Keep Alive Rsp interval. A party that stays silent for
/// this long has zombied the connection.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Adapts one direction of a session into an iterator-style source of
/// `(encrypted, frame bytes)` pairs.
///
/// Buffers socket data until a complete frame can be pulled out;
/// decryption is handled internally against the session's AES context
/// for this direction, which appears mid-stream once the handshake
/// completes.
pub struct FrameStream<R> {
    reader: R,
    session: Arc<Mutex<Session>>,
    client: bool,
    buffer: PacketBuffer,
}

impl<R: AsyncRead + Unpin> FrameStream<R> {
    pub fn new(reader: R, session: Arc<Mutex<Session>>, client: bool) -> Self {
        Self {
            reader,
            session,
            client,
            buffer: PacketBuffer::new(),
        }
    }

    /// Waits for the next whole frame.
    ///
    /// Returns `None` once the peer has shut down the stream. Going
    /// [`IDLE_TIMEOUT`] without any data is a [`ProxyError::Timeout`].
    pub async fn next_frame(&mut self) -> Result<Option<(bool, Vec<u8>)>> {
        loop {
            // If a frame is ready to be consumed, return it.
            {
                let mut session = self.session.lock().await;
                let aes = session.aes_context(self.client);
                if let Some(frame) = self.buffer.poll_frame(aes)? {
                    return Ok(Some(frame));
                }
            }

            // Otherwise, wait for more stream data and try again.
            let mut chunk = [0u8; 4096];
            let n = timeout(IDLE_TIMEOUT, self.reader.read(&mut chunk))
                .await
                .map_err(|_| ProxyError::Timeout)??;
            if n == 0 {
                return Ok(None);
            }

            self.buffer.feed(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use spiral_common::crypto::KeyChain;
    use spiral_common::proto::SocketAddress;

    fn test_session() -> Arc<Mutex<Session>> {
        Arc::new(Mutex::new(Session::new(
            SocketAddress::new("127.0.0.1", 1),
            SocketAddress::new("127.0.0.1", 2),
            0,
            Arc::new(KeyChain::from_parts(Vec::new(), Vec::new(), Vec::new(), Vec::new())),
            None,
        )))
    }

    #[tokio::test]
    async fn test_yields_frames_then_eof() {
        let first = hex::decode("0df00800010300000a0b0c0d").unwrap();
        let second = [0x0D, 0xF0, 0x04, 0x00, 0x01, 0x05, 0x00, 0x00];

        let mut wire = first.clone();
        wire.extend_from_slice(&second);

        let mut stream = FrameStream::new(wire.as_slice(), test_session(), true);
        assert_eq!(stream.next_frame().await.unwrap().unwrap().1, first);
        assert_eq!(stream.next_frame().await.unwrap().unwrap().1, second);
        assert!(stream.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_magic_is_fatal() {
        let wire = [0u8; 8];
        let mut stream = FrameStream::new(&wire[..], test_session(), true);
        assert!(matches!(
            stream.next_frame().await,
            Err(ProxyError::BadMagic(0))
        ));
    }
}
