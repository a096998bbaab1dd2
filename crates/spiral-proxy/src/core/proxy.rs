//! The proxy supervisor.
//!
//! A proxy governs many shards, each representing a tunnel to one game
//! server. Communication between shards and the proxy happens through
//! message passing; the shard table is touched only by the supervisor,
//! so no further synchronization exists.

use std::collections::HashMap;
use std::sync::Arc;

use spiral_common::crypto::{ClientSig, KeyChain};
use spiral_common::error::Result;
use spiral_common::proto::SocketAddress;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::plugin::builtin::Builtin;
use crate::plugin::{Plugin, PluginCollection};

use super::parcel::Parcel;
use super::shard::Shard;

/// Spawn requests in flight at once before shards start backpressuring.
const SPAWN_QUEUE_CAPACITY: usize = 32;

/// Top-level supervisor owning the key chain, the plugin registry and
/// the shard table.
pub struct Proxy {
    host: String,
    key_chain: Arc<KeyChain>,
    client_sig: Option<Arc<ClientSig>>,
    plugins: Arc<PluginCollection>,

    /// Upstream address to local shard address; spawns are idempotent.
    shards: HashMap<SocketAddress, SocketAddress>,

    tx: mpsc::Sender<Parcel>,
    rx: mpsc::Receiver<Parcel>,
}

impl Proxy {
    /// Creates a proxy with the built-in handshake/redirect plugin
    /// registered first.
    pub fn new(host: Option<String>, key_chain: KeyChain, client_sig: Option<ClientSig>) -> Self {
        let mut plugins = PluginCollection::new();
        plugins.add(Builtin::plugin());

        let (tx, rx) = mpsc::channel(SPAWN_QUEUE_CAPACITY);

        Self {
            host: host.unwrap_or_else(|| "0.0.0.0".to_owned()),
            key_chain: Arc::new(key_chain),
            client_sig: client_sig.map(Arc::new),
            plugins: Arc::new(plugins),
            shards: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Registers an additional plugin.
    ///
    /// Only effective before the first shard is spawned; the registry
    /// is frozen once shards share it.
    pub fn add_plugin(&mut self, plugin: Plugin) {
        match Arc::get_mut(&mut self.plugins) {
            Some(plugins) => plugins.add(plugin),
            None => warn!("Ignoring plugin registered after shards started"),
        }
    }

    /// Ensures a shard proxying `upstream` exists and returns its
    /// local address. Duplicate requests return the existing shard.
    pub async fn spawn_shard(&mut self, upstream: SocketAddress) -> Result<SocketAddress> {
        if let Some(local) = self.shards.get(&upstream) {
            return Ok(local.clone());
        }

        let shard = Shard::spawn(
            &self.host,
            upstream.clone(),
            Arc::clone(&self.plugins),
            Arc::clone(&self.key_chain),
            self.client_sig.clone(),
            self.tx.clone(),
        )
        .await?;

        let local = shard.self_addr.clone();
        self.shards.insert(upstream, local.clone());
        Ok(local)
    }

    /// Serves spawn requests forever.
    pub async fn run(mut self) {
        while let Some(parcel) = self.rx.recv().await {
            match self.spawn_shard(parcel.upstream.clone()).await {
                Ok(local) => parcel.answer(local),
                Err(e) => {
                    // The requesting session dies with its plugin
                    // call; the proxy keeps serving everyone else.
                    error!("Failed to spawn shard to {}: {}", parcel.upstream, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_proxy() -> Proxy {
        Proxy::new(
            Some("127.0.0.1".to_owned()),
            KeyChain::from_parts(Vec::new(), Vec::new(), Vec::new(), Vec::new()),
            None,
        )
    }

    #[tokio::test]
    async fn test_spawn_shard_is_idempotent() {
        let mut proxy = test_proxy();
        let upstream = SocketAddress::new("203.0.113.1", 12000);

        let first = proxy.spawn_shard(upstream.clone()).await.unwrap();
        let second = proxy.spawn_shard(upstream.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first.port, 0);

        let other = proxy
            .spawn_shard(SocketAddress::new("203.0.113.2", 12000))
            .await
            .unwrap();
        assert_ne!(other, first);
    }

    #[tokio::test]
    async fn test_spawned_shard_accepts_connections() {
        let mut proxy = test_proxy();

        let local = proxy
            .spawn_shard(SocketAddress::new("203.0.113.1", 12000))
            .await
            .unwrap();

        // The listener is live even though the upstream is unreachable.
        tokio::net::TcpStream::connect((local.ip.as_str(), local.port))
            .await
            .unwrap();
    }
}
