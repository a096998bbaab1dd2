//! Request/response messaging between shards and the proxy.

use spiral_common::proto::SocketAddress;
use tokio::sync::oneshot;

/// A spawn request traveling from a shard to the proxy supervisor.
///
/// Carries the upstream address a client is being redirected to; the
/// supervisor answers with the local address of the shard that now
/// proxies it.
pub struct Parcel {
    pub upstream: SocketAddress,
    reply: oneshot::Sender<SocketAddress>,
}

impl Parcel {
    pub fn new(upstream: SocketAddress) -> (Self, oneshot::Receiver<SocketAddress>) {
        let (reply, rx) = oneshot::channel();
        (Self { upstream, reply }, rx)
    }

    /// Answers the request. The requester may have given up waiting,
    /// which is fine to ignore.
    pub fn answer(self, local: SocketAddress) {
        let _ = self.reply.send(local);
    }
}
