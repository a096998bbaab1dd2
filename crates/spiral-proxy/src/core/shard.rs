//! Representation of an individual server in the proxy.
//!
//! Each shard is bound to one specific game server; all clients that
//! would normally connect to that server connect to the shard instead.
//! Shards talk to the proxy supervisor to spawn siblings when a client
//! is redirected to another server.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use spiral_common::crypto::{ClientSig, KeyChain};
use spiral_common::error::{ProxyError, Result};
use spiral_common::proto::bytes::ByteBuffer;
use spiral_common::proto::{Frame, SocketAddress};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info};

use crate::plugin::{Context, Direction, PluginCollection};
use crate::session::Session;
use crate::transport::FrameStream;

use super::parcel::Parcel;

/// A TCP acceptor bound to a specific upstream game server, tunneling
/// every accepted client through the plugin pipeline.
pub struct Shard {
    plugins: Arc<PluginCollection>,
    key_chain: Arc<KeyChain>,
    client_sig: Option<Arc<ClientSig>>,
    pub(crate) proxy_tx: mpsc::Sender<Parcel>,

    /// The local address clients connect to. Assigned at bind time,
    /// before the first client is accepted.
    pub self_addr: SocketAddress,
    /// The upstream game server this shard proxies.
    pub remote_addr: SocketAddress,

    next_sid: AtomicU64,
}

impl Shard {
    /// Binds a listener on `(host, 0)` and starts serving.
    ///
    /// The OS picks the port; the assigned address is recorded on the
    /// shard and returned to the supervisor for its shard table.
    pub async fn spawn(
        host: &str,
        remote: SocketAddress,
        plugins: Arc<PluginCollection>,
        key_chain: Arc<KeyChain>,
        client_sig: Option<Arc<ClientSig>>,
        proxy_tx: mpsc::Sender<Parcel>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind((host, 0)).await?;
        let local = listener.local_addr()?;

        let shard = Arc::new(Self {
            plugins,
            key_chain,
            client_sig,
            proxy_tx,
            self_addr: SocketAddress::new(local.ip().to_string(), local.port()),
            remote_addr: remote,
            next_sid: AtomicU64::new(0),
        });

        info!("[{}] Spawning shard to {}", shard.self_addr, shard.remote_addr);

        tokio::spawn(Arc::clone(&shard).serve(listener));

        Ok(shard)
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let shard = Arc::clone(&self);
                    tokio::spawn(shard.handle_client(socket));
                }
                Err(e) => {
                    error!("[{}] Failed to accept connection: {}", self.self_addr, e);
                }
            }
        }
    }

    /// Runs one proxied connection to completion.
    async fn handle_client(self: Arc<Self>, inbound: TcpStream) {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);

        let client = match inbound.peer_addr() {
            Ok(peer) => SocketAddress::new(peer.ip().to_string(), peer.port()),
            Err(e) => {
                error!("[{}] Client {} vanished before setup: {}", self.self_addr, sid, e);
                return;
            }
        };

        let outbound = match TcpStream::connect((self.remote_addr.ip.as_str(), self.remote_addr.port))
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    "[{}] Client {} could not reach upstream {}: {}",
                    self.self_addr, sid, self.remote_addr, e
                );
                return;
            }
        };

        info!("[{}] Client {} ({}) connected", self.self_addr, sid, client);

        let session = Arc::new(Mutex::new(Session::new(
            client,
            self.remote_addr.clone(),
            sid,
            Arc::clone(&self.key_chain),
            self.client_sig.clone(),
        )));
        let ctx = Context::new(Arc::clone(&self), Arc::clone(&session));

        let (client_rd, client_wr) = inbound.into_split();
        let (server_rd, server_wr) = outbound.into_split();

        // The two directions run concurrently and share the session.
        // The first to finish, either way, tears the pair down.
        let result = tokio::select! {
            res = self.tunnel(Direction::ClientToServer, &ctx, client_rd, server_wr) => res,
            res = self.tunnel(Direction::ServerToClient, &ctx, server_rd, client_wr) => res,
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                // Pranked by a peer disconnecting unexpectedly; not
                // worth bringing any attention to.
            }
            Err(ProxyError::Timeout) => {
                info!(
                    "[{}] Client {} disconnected due to inactivity",
                    self.self_addr, sid
                );
            }
            Err(e) => {
                error!("[{}] Client {} crashed: {}", self.self_addr, sid, e);
            }
        }
    }

    /// Forwards frames in one direction until EOF or error.
    async fn tunnel<R, W>(
        &self,
        direction: Direction,
        ctx: &Context,
        reader: R,
        mut writer: W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let is_client = direction == Direction::ClientToServer;
        let mut stream = FrameStream::new(reader, Arc::clone(&ctx.session), is_client);
        let mut buf = ByteBuffer::new();

        while let Some((encrypted, raw_frame)) = stream.next_frame().await? {
            // Deserialize the received frame.
            buf.load_frame(&raw_frame);
            let mut frame = Frame::read(&mut buf)?;

            // Run all plugins and decide whether to omit the frame.
            if !self.plugins.dispatch(direction, ctx, &mut frame).await? {
                continue;
            }

            // A dirty frame needs reserializing; otherwise reuse the
            // original wire bytes verbatim.
            let raw = if frame.dirty {
                frame.write(&mut buf);
                buf.as_slice().to_vec()
            } else {
                frame.original
            };

            let wire = if encrypted {
                let mut session = ctx.session.lock().await;
                let aes = session.aes_context(is_client).ok_or_else(|| {
                    ProxyError::HandshakeInvalid(
                        "encrypted frame without established secrets".into(),
                    )
                })?;
                aes.encrypt(&raw)
            } else {
                raw
            };

            writer.write_all(&wire).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;

    use crate::plugin::builtin::Builtin;

    fn empty_chain() -> Arc<KeyChain> {
        Arc::new(KeyChain::from_parts(Vec::new(), Vec::new(), Vec::new(), Vec::new()))
    }

    #[tokio::test]
    async fn test_plaintext_frames_forwarded_verbatim() {
        let upstream = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel::<Parcel>(1);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let mut plugins = PluginCollection::new();
        plugins.add(Builtin::plugin());

        let shard = Shard::spawn(
            "127.0.0.1",
            SocketAddress::new(upstream_addr.ip().to_string(), upstream_addr.port()),
            Arc::new(plugins),
            empty_chain(),
            None,
            tx,
        )
        .await
        .unwrap();

        let mut client =
            TcpStream::connect((shard.self_addr.ip.as_str(), shard.self_addr.port))
                .await
                .unwrap();
        let (mut server, _) = upstream.accept().await.unwrap();

        // Server to client: a keep-alive style control frame passes
        // through byte for byte.
        let frame = hex::decode("0df00800010300000a0b0c0d").unwrap();
        server.write_all(&frame).await.unwrap();

        let mut got = vec![0u8; frame.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, frame);

        // Client to server, same story.
        let frame = [0x0D, 0xF0, 0x04, 0x00, 0x01, 0x03, 0x00, 0x00];
        client.write_all(&frame).await.unwrap();

        let mut got = [0u8; 8];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn test_session_ids_are_monotonic() {
        let upstream = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel::<Parcel>(1);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let shard = Shard::spawn(
            "127.0.0.1",
            SocketAddress::new(upstream_addr.ip().to_string(), upstream_addr.port()),
            Arc::new(PluginCollection::new()),
            empty_chain(),
            None,
            tx,
        )
        .await
        .unwrap();

        for expected in 0..3u64 {
            let _client =
                TcpStream::connect((shard.self_addr.ip.as_str(), shard.self_addr.port))
                    .await
                    .unwrap();
            let (_server, _) = upstream.accept().await.unwrap();

            // The accept handler takes the next id as it starts up.
            tokio::task::yield_now().await;
            assert!(shard.next_sid.load(Ordering::Relaxed) >= expected);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A context over a freshly spawned shard with an inert upstream,
    /// for exercising plugin dispatch without real traffic.
    pub(crate) async fn context() -> Context {
        let (tx, mut rx) = mpsc::channel::<Parcel>(1);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let shard = Shard::spawn(
            "127.0.0.1",
            SocketAddress::new("127.0.0.1", 1),
            Arc::new(PluginCollection::new()),
            Arc::new(KeyChain::from_parts(Vec::new(), Vec::new(), Vec::new(), Vec::new())),
            None,
            tx,
        )
        .await
        .unwrap();

        let session = Arc::new(Mutex::new(Session::new(
            SocketAddress::new("127.0.0.1", 2),
            shard.remote_addr.clone(),
            0,
            Arc::new(KeyChain::from_parts(Vec::new(), Vec::new(), Vec::new(), Vec::new())),
            None,
        )));

        Context::new(shard, session)
    }
}
