/*! Detector simulator.

Enough of the GeRM electronics to run the full pipeline without
hardware: a REP register server with the firmware's echo semantics, a
PUB event publisher for the streaming path, and the datagram builder
for the UDP path. The `germ-sim` binary drives these; the integration
tests reuse the pieces directly.
*/
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::collector::PACKET_BYTES;
use crate::control::{OP_READ, OP_WRITE, START_DAQ};
use crate::event::{self, Endian, EventColumns};
use crate::ingest::{TOPIC_DATA, TOPIC_META};
use crate::sink::{CLOSE_SENTINEL, OPEN_SENTINEL};
use crate::{Result, collector};

/// The simulated register file, shared so tests can inspect it.
pub type SharedRegisters = Arc<std::sync::Mutex<HashMap<u32, u32>>>;

/// Bind a register server on an ephemeral port and serve it in a
/// task. Returns the register file, the endpoint to connect to, and a
/// channel that fires on every START write.
pub async fn spawn_register_server()
-> Result<(SharedRegisters, String, tokio::sync::mpsc::UnboundedReceiver<()>)> {
    let mut rep = zeromq::RepSocket::new();
    let endpoint = rep.bind("tcp://127.0.0.1:0").await?;
    let regs: SharedRegisters = Arc::new(std::sync::Mutex::new(HashMap::new()));
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let regs2 = regs.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_registers(rep, regs2, tx).await {
            warn!("register server died: {e}");
        }
    });
    Ok((regs, endpoint.to_string(), rx))
}

/// Serve the register protocol forever: writes are stored and echoed,
/// reads echo with the value filled in, anything else gets the
/// firmware's `0xdead` triple. A write of 1 to register 0 (START)
/// additionally fires `start_tx`.
pub async fn serve_registers(
    mut rep: zeromq::RepSocket,
    regs: SharedRegisters,
    start_tx: tokio::sync::mpsc::UnboundedSender<()>,
) -> Result<()> {
    loop {
        let msg = rep.recv().await?;
        let reply = register_reply(&msg, &regs, &start_tx);
        rep.send(ZmqMessage::from(Bytes::from(reply))).await?;
    }
}

fn register_reply(
    msg: &ZmqMessage,
    regs: &SharedRegisters,
    start_tx: &tokio::sync::mpsc::UnboundedSender<()>,
) -> Vec<u8> {
    let dead = || {
        let mut buf = Vec::with_capacity(12);
        for _ in 0..3 {
            buf.extend_from_slice(&0xdeadu32.to_le_bytes());
        }
        buf
    };
    let Some(frame) = msg.get(0) else {
        return dead();
    };
    if frame.len() != 12 {
        return dead();
    }
    let w = |i: usize| u32::from_le_bytes(frame[i * 4..i * 4 + 4].try_into().unwrap());
    let (op, addr, value) = (w(0), w(1), w(2));
    match op {
        OP_WRITE => {
            regs.lock().unwrap().insert(addr, value);
            if (addr, value) == START_DAQ {
                debug!("sim: START");
                let _ = start_tx.send(());
            }
            frame.to_vec()
        }
        OP_READ => {
            let stored = regs.lock().unwrap().get(&addr).copied().unwrap_or(0);
            let mut buf = Vec::with_capacity(12);
            buf.extend_from_slice(&OP_READ.to_le_bytes());
            buf.extend_from_slice(&addr.to_le_bytes());
            buf.extend_from_slice(&stored.to_le_bytes());
            buf
        }
        _ => dead(),
    }
}

/// Build a `"data"` message for the PUB socket.
pub fn data_message(cols: &EventColumns) -> ZmqMessage {
    let mut m = ZmqMessage::from(Bytes::from(TOPIC_DATA.to_vec()));
    m.push_back(Bytes::from(event::encode_bytes(cols, Endian::Native)));
    m
}

/// Build the end-of-frame `"meta"` message.
pub fn meta_message(frame_num: u32, overflow: u32) -> ZmqMessage {
    let mut payload = frame_num.to_ne_bytes().to_vec();
    payload.extend_from_slice(&overflow.to_ne_bytes());
    let mut m = ZmqMessage::from(Bytes::from(TOPIC_META.to_vec()));
    m.push_back(Bytes::from(payload));
    m
}

/// Build the hello datagram that latches (or unlatches) the sender as
/// the collector's data source.
pub fn hello_datagram(enable: bool) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&collector::HELLO_SIG.to_be_bytes());
    buf[8..12].copy_from_slice(&(enable as u32).to_be_bytes());
    buf
}

/// Split one frame of events into the fixed-size datagram sequence:
/// full 1024-word packets, then a final packet ending in the overflow
/// count and close sentinel.
pub fn udp_packets(cols: &EventColumns, frame_num: u32, overflow: u32) -> Vec<Vec<u8>> {
    let payload = event::encode_bytes(cols, Endian::Big);
    let mut packets = Vec::new();
    let mut off = 0;
    let mut seq: u32 = 0;
    loop {
        let mut pkt = Vec::with_capacity(PACKET_BYTES);
        pkt.extend_from_slice(&seq.to_be_bytes());
        if seq == 0 {
            pkt.extend_from_slice(&OPEN_SENTINEL.to_be_bytes());
            pkt.extend_from_slice(&frame_num.to_be_bytes());
        }
        pkt.extend_from_slice(&[0u8; 4]); // pad
        let cap = PACKET_BYTES - pkt.len();
        let remaining = payload.len() - off;
        if remaining + 8 <= cap {
            // Fits as the final packet, trailer included.
            pkt.extend_from_slice(&payload[off..]);
            pkt.extend_from_slice(&overflow.to_be_bytes());
            pkt.extend_from_slice(&CLOSE_SENTINEL.to_be_bytes());
            packets.push(pkt);
            return packets;
        }
        pkt.extend_from_slice(&payload[off..off + cap]);
        off += cap;
        packets.push(pkt);
        seq += 1;
    }
}

/// Deterministic event generator in the shape of real GeRM frames:
/// events sweep the chips and channels while the coarse timestamp
/// climbs by a fixed gap, wrapping at 31 bits.
pub struct SimDetector {
    /// Events per frame.
    pub events_per_frame: usize,
    /// Bunches the frame is split into on the ZMQ path.
    pub bunches: usize,
    /// Ticks between consecutive events.
    pub tick_gap: u32,
    frame_num: u32,
    ts_cursor: u32,
    seq: u64,
}

impl SimDetector {
    /// New generator; `tick_gap` of 5000 is roughly 50k events over a
    /// one-second frame.
    pub fn new(events_per_frame: usize, bunches: usize, tick_gap: u32) -> Self {
        Self {
            events_per_frame,
            bunches: bunches.max(1),
            tick_gap,
            frame_num: 0,
            ts_cursor: 0,
            seq: 0,
        }
    }

    fn next_event(&mut self) -> event::Event {
        let i = self.seq;
        self.seq += 1;
        self.ts_cursor = (self.ts_cursor.wrapping_add(self.tick_gap)) & 0x7fff_ffff;
        let pix = (i * 193) % 384;
        (
            (pix / 32) as u8,
            (pix % 32) as u8,
            ((i * 41) % 1024) as u16,
            (2048 + ((i * 97) % 512)) as u16,
            self.ts_cursor,
        )
    }

    /// Generate the bunches of the next frame and its frame number.
    pub fn next_frame(&mut self) -> (Vec<EventColumns>, u32) {
        self.frame_num += 1;
        let per_bunch = self.events_per_frame.div_ceil(self.bunches);
        let mut bunches = Vec::new();
        let mut left = self.events_per_frame;
        while left > 0 {
            let n = left.min(per_bunch);
            let mut cols = EventColumns::default();
            for _ in 0..n {
                let ev = self.next_event();
                cols.push(ev);
            }
            left -= n;
            bunches.push(cols);
        }
        (bunches, self.frame_num)
    }
}

/// Run the streaming-path simulator: registers on `ctrl_endpoint`,
/// events published on `data_endpoint`, one frame per START write.
pub async fn run_zmq_sim(
    ctrl_endpoint: &str,
    data_endpoint: &str,
    mut det: SimDetector,
) -> Result<()> {
    let mut rep = zeromq::RepSocket::new();
    let ctrl = rep.bind(ctrl_endpoint).await?;
    let mut publisher = zeromq::PubSocket::new();
    let data = publisher.bind(data_endpoint).await?;
    info!("sim: registers on {ctrl}, data on {data}");
    let regs: SharedRegisters = Arc::new(std::sync::Mutex::new(HashMap::new()));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = serve_registers(rep, regs, tx).await {
            warn!("sim register server died: {e}");
        }
    });
    while rx.recv().await.is_some() {
        let (bunches, frame_num) = det.next_frame();
        let count: usize = bunches.iter().map(|b| b.len()).sum();
        for bunch in &bunches {
            publisher.send(data_message(bunch)).await?;
        }
        publisher.send(meta_message(frame_num, 0)).await?;
        info!("sim: published frame {frame_num} with {count} events");
    }
    Ok(())
}

/// Run the high-speed-path simulator: registers served the same way,
/// and one UDP frame fired at `collector_addr` per START write.
pub async fn run_udp_sim(
    ctrl_endpoint: &str,
    collector_addr: &str,
    mut det: SimDetector,
) -> Result<()> {
    let mut rep = zeromq::RepSocket::new();
    let ctrl = rep.bind(ctrl_endpoint).await?;
    info!("sim: registers on {ctrl}, datagrams to {collector_addr}");
    let regs: SharedRegisters = Arc::new(std::sync::Mutex::new(HashMap::new()));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = serve_registers(rep, regs, tx).await {
            warn!("sim register server died: {e}");
        }
    });
    let sock = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    sock.connect(collector_addr).await?;
    // Latch ourselves as the data source.
    sock.send(&hello_datagram(true)).await?;
    let mut ok = [0u8; 8];
    let n = sock.recv(&mut ok).await?;
    if n != 8 || &ok[4..] != b"Okay" {
        warn!("sim: unexpected hello reply");
    }
    while rx.recv().await.is_some() {
        let (bunches, frame_num) = det.next_frame();
        let mut cols = EventColumns::default();
        for b in &bunches {
            cols.extend_from(b);
        }
        let packets = udp_packets(&cols, frame_num, 0);
        let npkts = packets.len();
        for pkt in packets {
            sock.send(&pkt).await?;
        }
        info!(
            "sim: fired frame {frame_num}: {} events in {npkts} datagrams",
            cols.len()
        );
    }
    Ok(())
}
