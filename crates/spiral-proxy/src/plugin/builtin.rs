//! Core functionality of the proxy, modeled as a built-in plugin.
//!
//! Does the crypto handshake rewriting that makes proxying work at all
//! and handles redirects of the client to other shards when gameplay
//! moves it between servers.

use std::sync::Arc;

use async_trait::async_trait;
use spiral_common::error::Result;
use spiral_common::proto::dml::{DmlType, DmlValue, Layout, Record};
use spiral_common::proto::{Frame, SocketAddress};

use super::{Context, Direction, Filter, FrameListener, Plugin, Selector};

pub const MSG_CHARACTERSELECTED: Layout = Layout::new(&[
    ("IP", DmlType::Str),
    ("TCPPort", DmlType::Int),
    ("UDPPort", DmlType::Int),
    ("Key", DmlType::Str),
    ("UserID", DmlType::Gid),
    ("CharID", DmlType::Gid),
    ("ZoneID", DmlType::Gid),
    ("ZoneName", DmlType::Str),
    ("Location", DmlType::Str),
    ("Slot", DmlType::Int),
    ("PrepPhase", DmlType::Int),
    ("Error", DmlType::Int),
    ("LoginServer", DmlType::Str),
]);

pub const MSG_SERVERTRANSFER: Layout = Layout::new(&[
    ("IP", DmlType::Str),
    ("TCPPort", DmlType::Int),
    ("UDPPort", DmlType::Int),
    ("Key", DmlType::Int),
    ("UserID", DmlType::Gid),
    ("CharID", DmlType::Gid),
    ("ZoneName", DmlType::Str),
    ("ZoneID", DmlType::Gid),
    ("Location", DmlType::Str),
    ("Slot", DmlType::Int),
    ("SessionID", DmlType::Gid),
    ("SessionSlot", DmlType::Int),
    ("TargetPlayerID", DmlType::Gid),
    ("FallbackIP", DmlType::Str),
    ("FallbackTCPPort", DmlType::Int),
    ("FallbackUDPPort", DmlType::Int),
    ("FallbackKey", DmlType::Int),
    ("FallbackZone", DmlType::Str),
    ("FallbackZoneID", DmlType::Gid),
    ("TransitionID", DmlType::Int),
]);

pub const MSG_CONNECTIONSTATS: Layout = Layout::new(&[
    ("ServerHostname", DmlType::Str),
    ("ServerPort", DmlType::Int),
    ("ConnectMS", DmlType::Int),
    ("Timeouts", DmlType::Int),
    ("Errors", DmlType::Int),
]);

/// The built-in plugin; always registered first.
pub struct Builtin;

impl Builtin {
    pub fn plugin() -> Plugin {
        Plugin::new(vec![
            Arc::new(PatchSessionOffer),
            Arc::new(PatchSessionAccept),
            Arc::new(RedirectCharacterSelected),
            Arc::new(RedirectServerTransfer),
            Arc::new(PatchConnectionStats),
        ])
    }
}

fn record_addr(record: &Record) -> Result<SocketAddress> {
    Ok(SocketAddress::new(
        record.str_field("IP")?,
        record.int_field("TCPPort")? as u16,
    ))
}

fn set_addr(record: &mut Record, ip_field: &str, port_field: &str, addr: &SocketAddress) -> Result<()> {
    record.set(ip_field, DmlValue::Str(addr.ip.clone().into_bytes()))?;
    record.set(port_field, DmlValue::Int(addr.port as i32))?;
    Ok(())
}

struct PatchSessionOffer;

#[async_trait]
impl FrameListener for PatchSessionOffer {
    fn filter(&self) -> Filter {
        Filter::new(Direction::ServerToClient, Selector::Opcode(0))
    }

    async fn handle(&self, ctx: &Context, frame: &mut Frame) -> Result<bool> {
        ctx.session.lock().await.session_offer(frame)?;
        Ok(true)
    }
}

struct PatchSessionAccept;

#[async_trait]
impl FrameListener for PatchSessionAccept {
    fn filter(&self) -> Filter {
        Filter::new(Direction::ClientToServer, Selector::Opcode(5))
    }

    async fn handle(&self, ctx: &Context, frame: &mut Frame) -> Result<bool> {
        ctx.session.lock().await.session_accept(frame)?;
        Ok(true)
    }
}

struct RedirectCharacterSelected;

#[async_trait]
impl FrameListener for RedirectCharacterSelected {
    fn filter(&self) -> Filter {
        Filter::new(Direction::ServerToClient, Selector::ServiceOrder(7, 3))
    }

    async fn handle(&self, ctx: &Context, frame: &mut Frame) -> Result<bool> {
        let mut msg = MSG_CHARACTERSELECTED.decode(&frame.payload)?;

        // Extract the server that should be proxied; error responses
        // carry no endpoint and pass through untouched.
        let upstream = record_addr(&msg)?;
        if upstream.is_empty() {
            return Ok(true);
        }

        // Spawn a shard for the new server and point the client at it.
        let shard = ctx.spawn_shard(upstream).await?;
        set_addr(&mut msg, "IP", "TCPPort", &shard)?;

        frame.payload = MSG_CHARACTERSELECTED.encode(&msg);
        Ok(true)
    }
}

struct RedirectServerTransfer;

#[async_trait]
impl FrameListener for RedirectServerTransfer {
    fn filter(&self) -> Filter {
        Filter::new(Direction::ServerToClient, Selector::ServiceOrder(5, 221))
    }

    async fn handle(&self, ctx: &Context, frame: &mut Frame) -> Result<bool> {
        let mut msg = MSG_SERVERTRANSFER.decode(&frame.payload)?;

        let upstream = record_addr(&msg)?;
        let shard = ctx.spawn_shard(upstream).await?;

        // Point the client at the new shard and use the current shard
        // as the fallback just in case.
        set_addr(&mut msg, "IP", "TCPPort", &shard)?;
        set_addr(&mut msg, "FallbackIP", "FallbackTCPPort", &ctx.shard_addr())?;

        frame.payload = MSG_SERVERTRANSFER.encode(&msg);
        Ok(true)
    }
}

struct PatchConnectionStats;

#[async_trait]
impl FrameListener for PatchConnectionStats {
    fn filter(&self) -> Filter {
        Filter::new(Direction::ClientToServer, Selector::ServiceOrder(53, 67))
    }

    async fn handle(&self, ctx: &Context, frame: &mut Frame) -> Result<bool> {
        let mut msg = MSG_CONNECTIONSTATS.decode(&frame.payload)?;

        // The client periodically reports the host it believes it is
        // connected to. Spoof our address back to the upstream's own
        // or the server notices it is being proxied.
        set_addr(&mut msg, "ServerHostname", "ServerPort", &ctx.remote_addr())?;

        frame.payload = MSG_CONNECTIONSTATS.encode(&msg);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use spiral_common::proto::FrameKind;
    use spiral_common::proto::bytes::ByteBuffer;

    fn character_selected_payload(ip: &str, port: i32) -> Vec<u8> {
        let mut buf = ByteBuffer::new();
        buf.write_string(ip.as_bytes());
        buf.write_i32(port);
        buf.write_i32(0); // UDPPort
        buf.write_string(b"abcdef"); // Key
        buf.write_u64(1); // UserID
        buf.write_u64(2); // CharID
        buf.write_u64(3); // ZoneID
        buf.write_string(b"WizardCity"); // ZoneName
        buf.write_string(b"Start"); // Location
        buf.write_i32(0); // Slot
        buf.write_i32(0); // PrepPhase
        buf.write_i32(0); // Error
        buf.write_string(b"login"); // LoginServer
        buf.into_vec()
    }

    fn data_frame(service_id: u8, order: u8, payload: Vec<u8>) -> Frame {
        Frame {
            original: Vec::new(),
            kind: FrameKind::Data { service_id, order },
            payload,
            dirty: false,
        }
    }

    #[tokio::test]
    async fn test_connection_stats_spoofed() {
        let ctx = crate::core::shard::test_support::context().await;

        let mut buf = ByteBuffer::new();
        buf.write_string(b"10.0.0.1");
        buf.write_i32(40000);
        buf.write_i32(12);
        buf.write_i32(0);
        buf.write_i32(0);

        let mut frame = data_frame(53, 67, buf.into_vec());
        PatchConnectionStats
            .handle(&ctx, &mut frame)
            .await
            .unwrap();

        let msg = MSG_CONNECTIONSTATS.decode(&frame.payload).unwrap();
        let remote = ctx.remote_addr();
        assert_eq!(msg.str_field("ServerHostname").unwrap(), remote.ip);
        assert_eq!(msg.int_field("ServerPort").unwrap(), remote.port as i32);
        assert_eq!(msg.int_field("ConnectMS").unwrap(), 12);
    }

    #[tokio::test]
    async fn test_character_selected_without_endpoint_untouched() {
        let ctx = crate::core::shard::test_support::context().await;

        let payload = character_selected_payload("", 0);
        let mut frame = data_frame(7, 3, payload.clone());

        let forward = RedirectCharacterSelected
            .handle(&ctx, &mut frame)
            .await
            .unwrap();
        assert!(forward);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_layout_shapes() {
        assert_eq!(MSG_CHARACTERSELECTED.fields.len(), 13);
        assert_eq!(MSG_SERVERTRANSFER.fields.len(), 20);
        assert_eq!(MSG_CONNECTIONSTATS.fields.len(), 5);
    }
}
