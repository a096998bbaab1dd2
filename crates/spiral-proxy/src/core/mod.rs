//! The proxy's supervision tree: one proxy, many shards.

pub mod parcel;
pub mod proxy;
pub mod shard;

pub use proxy::Proxy;
pub use shard::Shard;
