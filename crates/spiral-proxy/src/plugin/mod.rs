//! Plugins extend the proxy by listening for selected frames.
//!
//! A listener declares a [`Filter`] naming the traffic direction plus a
//! frame selector, and receives every matching frame before it is
//! forwarded. Listeners may mutate the frame (it is reserialized when a
//! dirty listener has seen it) or veto forwarding altogether.
//!
//! Dispatch against a single plugin is serialized through an exclusion
//! lock, so plugin state needs no synchronization of its own.

pub mod builtin;
pub mod capture;
pub mod log;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use spiral_common::error::{ProxyError, Result};
use spiral_common::proto::{Frame, SocketAddress};
use tokio::sync::Mutex;

use crate::core::parcel::Parcel;
use crate::core::shard::Shard;
use crate::session::Session;

/// The direction in which a frame is traveling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Frames going from server to client.
    ServerToClient,
    /// Frames going from client to server.
    ClientToServer,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ServerToClient => write!(f, "S -> C"),
            Direction::ClientToServer => write!(f, "C -> S"),
        }
    }
}

/// Selects which frames of a direction a listener wants to see.
///
/// Control and data frames are disjoint by construction, so a selector
/// can never ask for an opcode and a service at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// Every frame; used by taps like the log and capture plugins.
    Any,
    /// Control frames with the given opcode.
    Opcode(u8),
    /// Data frames of the given service, any order.
    Service(u8),
    /// Data frames of the given service and order.
    ServiceOrder(u8, u8),
}

/// A listener's complete dispatch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub direction: Direction,
    pub selector: Selector,
}

impl Filter {
    pub const fn new(direction: Direction, selector: Selector) -> Self {
        Self {
            direction,
            selector,
        }
    }

    /// Whether a frame traveling in `direction` matches this filter.
    pub fn can_dispatch(&self, direction: Direction, frame: &Frame) -> bool {
        if self.direction != direction {
            return false;
        }

        match self.selector {
            Selector::Any => true,
            Selector::Opcode(opcode) => frame.opcode() == Some(opcode),
            Selector::Service(service_id) => frame.service_id() == Some(service_id),
            Selector::ServiceOrder(service_id, order) => {
                frame.service_id() == Some(service_id) && frame.order() == Some(order)
            }
        }
    }
}

/// A packet listener inside a proxy plugin.
///
/// Listeners may return `false` to omit the frame from forwarding.
/// When a listener with a set dirty bit runs, the frame is reserialized
/// before being sent on; keep filters conservative in what they accept
/// to keep the number of reserializations low.
#[async_trait]
pub trait FrameListener: Send + Sync {
    fn filter(&self) -> Filter;

    /// Whether frames seen by this listener must be reserialized.
    fn dirty(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &Context, frame: &mut Frame) -> Result<bool>;
}

/// A plugin: an ordered table of listeners plus an exclusion lock.
pub struct Plugin {
    listeners: Vec<Arc<dyn FrameListener>>,
    lock: Mutex<()>,
}

impl Plugin {
    pub fn new(listeners: Vec<Arc<dyn FrameListener>>) -> Self {
        Self {
            listeners,
            lock: Mutex::new(()),
        }
    }

    async fn dispatch(&self, direction: Direction, ctx: &Context, frame: &mut Frame) -> Result<bool> {
        let mut forward = true;

        for listener in &self.listeners {
            if !listener.filter().can_dispatch(direction, frame) {
                continue;
            }

            {
                let _guard = self.lock.lock().await;
                forward &= listener.handle(ctx, frame).await?;
            }
            frame.dirty |= listener.dirty();
        }

        Ok(forward)
    }
}

/// All registered plugins, shared with every shard.
///
/// A call to [`PluginCollection::dispatch`] invokes all eligible
/// listeners throughout all registered plugins, in registration order,
/// and ANDs their forwarding verdicts.
#[derive(Default)]
pub struct PluginCollection {
    plugins: Vec<Plugin>,
}

impl PluginCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Plugin) {
        self.plugins.push(plugin);
    }

    pub async fn dispatch(
        &self,
        direction: Direction,
        ctx: &Context,
        frame: &mut Frame,
    ) -> Result<bool> {
        let mut forward = true;
        for plugin in &self.plugins {
            forward &= plugin.dispatch(direction, ctx, frame).await?;
        }
        Ok(forward)
    }
}

/// Processing context handed to every listener invocation.
///
/// Provides introspection into the connection a frame belongs to and
/// access to the supervisor for spawning sibling shards.
#[derive(Clone)]
pub struct Context {
    shard: Arc<Shard>,
    pub session: Arc<Mutex<Session>>,
}

impl Context {
    pub fn new(shard: Arc<Shard>, session: Arc<Mutex<Session>>) -> Self {
        Self { shard, session }
    }

    /// The local address of the shard this frame passed through.
    pub fn shard_addr(&self) -> SocketAddress {
        self.shard.self_addr.clone()
    }

    /// The upstream game server this shard proxies.
    pub fn remote_addr(&self) -> SocketAddress {
        self.shard.remote_addr.clone()
    }

    /// Asks the supervisor for a shard to `upstream`, returning its
    /// local address. Idempotent across sessions and shards.
    pub async fn spawn_shard(&self, upstream: SocketAddress) -> Result<SocketAddress> {
        let (parcel, reply) = Parcel::new(upstream);

        self.shard
            .proxy_tx
            .send(parcel)
            .await
            .map_err(|_| ProxyError::SpawnReject)?;
        reply.await.map_err(|_| ProxyError::SpawnReject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use spiral_common::proto::FrameKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn control_frame(opcode: u8) -> Frame {
        Frame {
            original: vec![0xAA],
            kind: FrameKind::Control { opcode },
            payload: Vec::new(),
            dirty: false,
        }
    }

    fn data_frame(service_id: u8, order: u8) -> Frame {
        Frame {
            original: vec![0xBB],
            kind: FrameKind::Data { service_id, order },
            payload: Vec::new(),
            dirty: false,
        }
    }

    #[test]
    fn test_filter_matching() {
        let by_opcode = Filter::new(Direction::ServerToClient, Selector::Opcode(5));
        assert!(by_opcode.can_dispatch(Direction::ServerToClient, &control_frame(5)));
        assert!(!by_opcode.can_dispatch(Direction::ClientToServer, &control_frame(5)));
        assert!(!by_opcode.can_dispatch(Direction::ServerToClient, &control_frame(4)));
        assert!(!by_opcode.can_dispatch(Direction::ServerToClient, &data_frame(5, 0)));

        let by_service = Filter::new(Direction::ServerToClient, Selector::Service(7));
        assert!(by_service.can_dispatch(Direction::ServerToClient, &data_frame(7, 3)));
        assert!(by_service.can_dispatch(Direction::ServerToClient, &data_frame(7, 9)));
        assert!(!by_service.can_dispatch(Direction::ServerToClient, &control_frame(7)));

        let exact = Filter::new(Direction::ServerToClient, Selector::ServiceOrder(7, 3));
        assert!(exact.can_dispatch(Direction::ServerToClient, &data_frame(7, 3)));
        assert!(!exact.can_dispatch(Direction::ServerToClient, &data_frame(7, 4)));

        let any = Filter::new(Direction::ClientToServer, Selector::Any);
        assert!(any.can_dispatch(Direction::ClientToServer, &control_frame(0)));
        assert!(any.can_dispatch(Direction::ClientToServer, &data_frame(1, 2)));
    }

    struct CountingListener {
        filter: Filter,
        dirty: bool,
        verdict: bool,
        hits: AtomicUsize,
    }

    #[async_trait]
    impl FrameListener for Arc<CountingListener> {
        fn filter(&self) -> Filter {
            self.filter
        }

        fn dirty(&self) -> bool {
            self.dirty
        }

        async fn handle(&self, _ctx: &Context, _frame: &mut Frame) -> Result<bool> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(self.verdict)
        }
    }

    fn counting(
        direction: Direction,
        selector: Selector,
        dirty: bool,
        verdict: bool,
    ) -> Arc<CountingListener> {
        Arc::new(CountingListener {
            filter: Filter::new(direction, selector),
            dirty,
            verdict,
            hits: AtomicUsize::new(0),
        })
    }

    async fn test_context() -> Context {
        crate::core::shard::test_support::context().await
    }

    #[tokio::test]
    async fn test_dispatch_marks_dirty_and_ands_verdicts() {
        let keep = counting(Direction::ClientToServer, Selector::Opcode(3), false, true);
        let drop = counting(Direction::ClientToServer, Selector::Any, true, false);
        let missed = counting(Direction::ServerToClient, Selector::Any, true, true);

        let mut plugins = PluginCollection::new();
        plugins.add(Plugin::new(vec![
            Arc::new(keep.clone()),
            Arc::new(drop.clone()),
            Arc::new(missed.clone()),
        ]));

        let ctx = test_context().await;
        let mut frame = control_frame(3);
        let forward = plugins
            .dispatch(Direction::ClientToServer, &ctx, &mut frame)
            .await
            .unwrap();

        assert!(!forward);
        assert_eq!(keep.hits.load(Ordering::SeqCst), 1);
        assert_eq!(drop.hits.load(Ordering::SeqCst), 1);
        assert_eq!(missed.hits.load(Ordering::SeqCst), 0);
        assert!(frame.dirty);
    }

    #[tokio::test]
    async fn test_clean_listeners_leave_frame_clean() {
        let tap = counting(Direction::ClientToServer, Selector::Any, false, true);

        let mut plugins = PluginCollection::new();
        plugins.add(Plugin::new(vec![Arc::new(tap.clone())]));

        let ctx = test_context().await;
        let mut frame = data_frame(7, 3);
        let forward = plugins
            .dispatch(Direction::ClientToServer, &ctx, &mut frame)
            .await
            .unwrap();

        assert!(forward);
        assert!(!frame.dirty);
    }
}
