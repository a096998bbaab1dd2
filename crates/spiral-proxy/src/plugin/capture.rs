//! Writes proxied frames to a pcapng file.
//!
//! Every forwarded frame is reserialized in its decrypted form and
//! written as a synthetic Ethernet/IPv4/TCP packet pretending to be
//! exchanged directly between the client and the remote server, so the
//! capture opens in standard tooling. Each packet carries a comment
//! naming the shard that produced it and the session it belongs to.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use spiral_common::error::Result;
use spiral_common::proto::bytes::ByteBuffer;
use spiral_common::proto::{Frame, SocketAddress};

use super::{Context, Direction, Filter, FrameListener, Plugin, Selector};

const BLOCK_SECTION_HEADER: u32 = 0x0A0D_0D0A;
const BLOCK_INTERFACE: u32 = 0x0000_0001;
const BLOCK_ENHANCED_PACKET: u32 = 0x0000_0006;

const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
const LINKTYPE_ETHERNET: u16 = 1;

const OPT_COMMENT: u16 = 1;
const OPT_END: u16 = 0;

fn pad4(len: usize) -> usize {
    len.next_multiple_of(4)
}

/// Minimal pcapng block writer: one section, one Ethernet interface,
/// enhanced packet blocks with a comment option.
pub struct PcapNgWriter {
    file: BufWriter<File>,
}

impl PcapNgWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut writer = Self {
            file: BufWriter::new(File::create(path)?),
        };

        // Section Header Block with an unspecified section length.
        let mut body = Vec::new();
        body.extend_from_slice(&BYTE_ORDER_MAGIC.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&u64::MAX.to_le_bytes());
        writer.write_block(BLOCK_SECTION_HEADER, &body)?;

        // Interface Description Block; snap length unlimited.
        let mut body = Vec::new();
        body.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        writer.write_block(BLOCK_INTERFACE, &body)?;

        Ok(writer)
    }

    fn write_block(&mut self, block_type: u32, body: &[u8]) -> io::Result<()> {
        let total_len = (12 + pad4(body.len())) as u32;

        self.file.write_all(&block_type.to_le_bytes())?;
        self.file.write_all(&total_len.to_le_bytes())?;
        self.file.write_all(body)?;
        self.file.write_all(&[0; 3][..pad4(body.len()) - body.len()])?;
        self.file.write_all(&total_len.to_le_bytes())?;

        Ok(())
    }

    /// Writes one packet with a microsecond timestamp and a comment.
    pub fn write_packet(
        &mut self,
        source: &SocketAddress,
        dest: &SocketAddress,
        payload: &[u8],
        comment: &str,
    ) -> io::Result<()> {
        let packet = synthesize_tcp_packet(source, dest, payload);
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        let mut body = Vec::with_capacity(32 + packet.len() + comment.len());
        body.extend_from_slice(&0u32.to_le_bytes()); // Interface id.
        body.extend_from_slice(&((micros >> 32) as u32).to_le_bytes());
        body.extend_from_slice(&(micros as u32).to_le_bytes());
        body.extend_from_slice(&(packet.len() as u32).to_le_bytes());
        body.extend_from_slice(&(packet.len() as u32).to_le_bytes());
        body.extend_from_slice(&packet);
        body.resize(pad4(body.len()), 0);

        body.extend_from_slice(&OPT_COMMENT.to_le_bytes());
        body.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        body.extend_from_slice(comment.as_bytes());
        body.resize(pad4(body.len()), 0);
        body.extend_from_slice(&OPT_END.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());

        self.write_block(BLOCK_ENHANCED_PACKET, &body)?;
        self.file.flush()
    }
}

fn ipv4_octets(addr: &SocketAddress) -> [u8; 4] {
    // Hostnames end up as the unspecified address; the capture is
    // about payloads, not routing.
    addr.ip
        .parse::<Ipv4Addr>()
        .map(|ip| ip.octets())
        .unwrap_or([0; 4])
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for word in header.chunks(2) {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Wraps a frame into Ethernet/IPv4/TCP headers.
fn synthesize_tcp_packet(source: &SocketAddress, dest: &SocketAddress, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(54 + payload.len());

    // Ethernet: zeroed MACs, IPv4 ethertype.
    out.extend_from_slice(&[0; 12]);
    out.extend_from_slice(&0x0800u16.to_be_bytes());

    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&((20 + 20 + payload.len()) as u16).to_be_bytes());
    ip[8] = 64; // TTL.
    ip[9] = 6; // TCP.
    ip[12..16].copy_from_slice(&ipv4_octets(source));
    ip[16..20].copy_from_slice(&ipv4_octets(dest));
    let checksum = ipv4_checksum(&ip);
    ip[10..12].copy_from_slice(&checksum.to_be_bytes());
    out.extend_from_slice(&ip);

    let mut tcp = [0u8; 20];
    tcp[0..2].copy_from_slice(&source.port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dest.port.to_be_bytes());
    tcp[12] = 0x50; // Data offset 5 words.
    tcp[13] = 0x18; // PSH | ACK.
    tcp[14..16].copy_from_slice(&0xFFFFu16.to_be_bytes());
    out.extend_from_slice(&tcp);

    out.extend_from_slice(payload);
    out
}

/// A plugin which writes frame data to pcapng files.
pub struct Capture;

impl Capture {
    pub fn plugin(path: &Path) -> io::Result<Plugin> {
        let writer = Arc::new(Mutex::new(PcapNgWriter::create(path)?));

        Ok(Plugin::new(vec![
            Arc::new(Tap {
                direction: Direction::ClientToServer,
                writer: Arc::clone(&writer),
            }),
            Arc::new(Tap { direction: Direction::ServerToClient, writer }),
        ]))
    }
}

struct Tap {
    direction: Direction,
    writer: Arc<Mutex<PcapNgWriter>>,
}

#[async_trait]
impl FrameListener for Tap {
    fn filter(&self) -> Filter {
        Filter::new(self.direction, Selector::Any)
    }

    fn dirty(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &Context, frame: &mut Frame) -> Result<bool> {
        let mut buf = ByteBuffer::new();
        frame.write(&mut buf);
        let raw = buf.into_vec();

        let (source, dest, comment) = {
            let session = ctx.session.lock().await;
            let (source, dest) = match self.direction {
                Direction::ClientToServer => (session.client.clone(), session.server.clone()),
                Direction::ServerToClient => (session.server.clone(), session.client.clone()),
            };
            let comment = format!("Shard {}, client {}", ctx.shard_addr(), session.sid);
            (source, dest, comment)
        };

        // File writing would stall the tunnel; push it to a worker.
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
            writer.write_packet(&source, &dest, &raw, &comment)
        })
        .await
        .map_err(io::Error::other)??;

        Ok(true)
    }
}
