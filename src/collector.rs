/*! UDP collector: the high-speed data path.

The detector's DMA engine fires fixed-size datagrams of 1024 big-endian
u32 words at the collector:

```text
packet 0:    [seq=0] [0xFEEDFACE] [frame_num] [pad] [payload ...]
packet N>0:  [seq]   [pad]        [payload ...]
final:       ...payload, [overflow] [0xDECAFBAD]   (shorter than 1024)
```

The collector reassembles them into one raw frame file per frame
(layout in [`crate::sink`]) and answers the acquisition controller on
a REQ/REP handshake socket:

1. controller sends the output path, collector answers
   `"Received Filename"`;
2. controller asserts START and sends `"ack"`; the collector answers
   with `[frame_num, event_count, overflow]` as three little-endian
   u64 once the close sentinel lands;
3. controller sends `"ack"`, collector answers with the written path.

A 12-byte hello datagram `(0xDEADBEEF, reserved, enable)` latches the
sender as the data source; the collector answers 8 bytes ending in
`"Okay"`.

Sequence gaps are recorded as loss and degrade the frame but never
prevent it from closing: the close sentinel is the one authoritative
end-of-frame.
*/
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::sink::{CLOSE_SENTINEL, OPEN_SENTINEL};
use crate::{Error, Result};

/// Fixed size of a non-final data packet, in u32 words.
pub const PACKET_WORDS: usize = 1024;
/// Fixed size of a non-final data packet, in bytes.
pub const PACKET_BYTES: usize = PACKET_WORDS * 4;

/// Hello datagram signature.
pub const HELLO_SIG: u32 = 0xDEADBEEF;
/// Last four bytes of the hello reply: "Okay".
pub const HELLO_OK: u32 = 0x4F6B6179;

/// Collector reply to a valid filename.
pub const FILENAME_ACK: &[u8] = b"Received Filename";

fn word(buf: &[u8], i: usize) -> u32 {
    u32::from_be_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap())
}

/// One parsed data datagram.
#[derive(Debug, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Sequence number, 0-based within the frame.
    pub seq: u32,
    /// Frame number; only packet 0 carries it.
    pub frame_num: Option<u32>,
    /// Event word bytes, still big-endian.
    pub payload: &'a [u8],
    /// Overflow count when this is the final packet.
    pub trailer: Option<u32>,
}

/// Parse one datagram. Non-final packets are exactly [`PACKET_BYTES`]
/// long; the final packet is shorter and must end with the close
/// sentinel.
pub fn parse_packet(buf: &[u8]) -> Result<Packet<'_>> {
    if !buf.len().is_multiple_of(4) || buf.len() < 16 {
        return Err(Error::Protocol(format!(
            "data packet of {} bytes",
            buf.len()
        )));
    }
    if buf.len() > PACKET_BYTES {
        return Err(Error::Protocol(format!(
            "data packet of {} bytes exceeds the {PACKET_BYTES} byte format",
            buf.len()
        )));
    }
    let nwords = buf.len() / 4;
    let seq = word(buf, 0);
    let (frame_num, body) = if seq == 0 {
        if word(buf, 1) != OPEN_SENTINEL {
            return Err(Error::Protocol(format!(
                "packet 0 sentinel is {:#010x}, want {OPEN_SENTINEL:#010x}",
                word(buf, 1)
            )));
        }
        (Some(word(buf, 2)), 16)
    } else {
        (None, 8)
    };
    if word(buf, nwords - 1) != CLOSE_SENTINEL {
        // Not the frame trailer, so it must be a full data packet.
        if buf.len() != PACKET_BYTES {
            return Err(Error::Protocol(format!(
                "short packet without close sentinel (last word {:#010x})",
                word(buf, nwords - 1)
            )));
        }
        return Ok(Packet {
            seq,
            frame_num,
            payload: &buf[body..],
            trailer: None,
        });
    }
    let trailer_at = buf.len() - 8;
    if trailer_at < body {
        return Err(Error::Protocol("truncated final packet".into()));
    }
    Ok(Packet {
        seq,
        frame_num,
        payload: &buf[body..trailer_at],
        trailer: Some(word(buf, nwords - 2)),
    })
}

/// Result of one reassembled frame, as reported in the handshake.
#[derive(Debug, Clone)]
pub struct Summary {
    /// Frame number from packet 0.
    pub frame_num: u64,
    /// Events written to the file.
    pub events: u64,
    /// Detector-side overflow count from the trailer.
    pub overflow: u64,
    /// The file that was written.
    pub path: PathBuf,
}

struct InFrame {
    path: PathBuf,
    writer: std::io::BufWriter<std::fs::File>,
    header_written: bool,
    frame_num: u32,
    expect_seq: u32,
    events: u64,
    lost: u64,
    degraded: bool,
}

enum Phase {
    Idle,
    Collecting(InFrame),
    Done { summary: Summary, sent_triple: bool },
}

enum Wake {
    Ctrl(ZmqMessage),
    Data(usize, SocketAddr),
    Stalled,
}

/// The collector service: one UDP data socket, one REP handshake
/// socket, one frame at a time.
pub struct Collector {
    data: tokio::net::UdpSocket,
    ctrl: zeromq::RepSocket,
    latched: Option<SocketAddr>,
    phase: Phase,
    /// An `"ack"` arrived while the frame was still open; the reply
    /// is owed as soon as the close sentinel lands.
    pending_ack: bool,
    idle_timeout: std::time::Duration,
}

impl Collector {
    /// Bind the data socket and the handshake socket. Returns the
    /// resolved data address and handshake endpoint, which matters
    /// when binding port 0 in tests.
    pub async fn bind(
        data_addr: &str,
        ctrl_endpoint: &str,
    ) -> Result<(Self, SocketAddr, String)> {
        let data = tokio::net::UdpSocket::bind(data_addr).await?;
        let local = data.local_addr()?;
        let mut ctrl = zeromq::RepSocket::new();
        let endpoint = ctrl.bind(ctrl_endpoint).await?;
        info!("Collector: data on {local}, handshake on {endpoint}");
        Ok((
            Self {
                data,
                ctrl,
                latched: None,
                phase: Phase::Idle,
                pending_ack: false,
                idle_timeout: std::time::Duration::from_secs(60),
            },
            local,
            endpoint.to_string(),
        ))
    }

    /// Replace the no-data timeout that force-closes a frame whose
    /// summary is already owed.
    pub fn with_idle_timeout(mut self, idle_timeout: std::time::Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Serve forever. Only returns on socket failure.
    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; PACKET_BYTES + 4];
        loop {
            // The stall timer only runs once the summary is owed, so
            // an abandoned frame cannot wedge the handshake socket.
            let stalled = self.pending_ack
                && matches!(self.phase, Phase::Collecting(_));
            let wake = tokio::select! {
                m = self.ctrl.recv(), if !self.pending_ack => Wake::Ctrl(m?),
                r = self.data.recv_from(&mut buf) => {
                    let (n, addr) = r?;
                    Wake::Data(n, addr)
                }
                _ = tokio::time::sleep(self.idle_timeout), if stalled => Wake::Stalled,
            };
            match wake {
                Wake::Ctrl(msg) => self.handle_ctrl(msg).await?,
                Wake::Data(n, addr) => self.handle_data(&buf[..n], addr).await?,
                Wake::Stalled => {
                    warn!(
                        "Collector: no data for {:?} with summary owed, closing degraded",
                        self.idle_timeout
                    );
                    if let Phase::Collecting(frame) = &mut self.phase {
                        frame.degraded = true;
                    }
                    self.close_frame(0).await?;
                }
            }
        }
    }

    async fn reply(&mut self, payload: Vec<u8>) -> Result<()> {
        self.ctrl.send(ZmqMessage::from(Bytes::from(payload))).await?;
        Ok(())
    }

    async fn handle_ctrl(&mut self, msg: ZmqMessage) -> Result<()> {
        let bytes: Vec<u8> = msg.get(0).map(|b| b.to_vec()).unwrap_or_default();
        match &mut self.phase {
            Phase::Idle => {
                if bytes == b"ack" {
                    warn!("Collector: ack with no frame armed");
                    self.reply(b"Error: no frame armed".to_vec()).await
                } else {
                    self.open_frame(&bytes).await
                }
            }
            Phase::Collecting(frame) => {
                if bytes == b"ack" {
                    trace!("Collector: ack pending until frame closes");
                    self.pending_ack = true;
                    Ok(())
                } else {
                    // The controller gave up on the old frame and is
                    // arming a new one.
                    warn!(
                        "Collector: abandoning unfinished frame {}",
                        frame.path.display()
                    );
                    self.phase = Phase::Idle;
                    self.open_frame(&bytes).await
                }
            }
            Phase::Done {
                summary,
                sent_triple,
            } => {
                if bytes != b"ack" {
                    warn!("Collector: expected ack after frame close");
                    self.phase = Phase::Idle;
                    return self.reply(b"Error: expected ack".to_vec()).await;
                }
                if !*sent_triple {
                    let reply = summary_triple(summary);
                    *sent_triple = true;
                    self.reply(reply).await
                } else {
                    let path = summary.path.to_string_lossy().into_owned();
                    self.phase = Phase::Idle;
                    self.reply(path.into_bytes()).await
                }
            }
        }
    }

    async fn open_frame(&mut self, bytes: &[u8]) -> Result<()> {
        let path = match std::str::from_utf8(bytes) {
            Ok(s) if !s.is_empty() => PathBuf::from(s),
            _ => {
                warn!("Collector: filename is not UTF-8");
                return self.reply(b"Error: bad filename".to_vec()).await;
            }
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Collector: cannot create {}: {e}", parent.display());
                return self.reply(format!("Error: {e}").into_bytes()).await;
            }
        }
        let file = std::fs::File::options()
            .write(true)
            .create_new(true)
            .open(&path);
        match file {
            Ok(f) => {
                info!("Collector: armed for {}", path.display());
                self.phase = Phase::Collecting(InFrame {
                    path,
                    writer: std::io::BufWriter::new(f),
                    header_written: false,
                    frame_num: 0,
                    expect_seq: 0,
                    events: 0,
                    lost: 0,
                    degraded: false,
                });
                self.reply(FILENAME_ACK.to_vec()).await
            }
            Err(e) => {
                warn!("Collector: cannot open {}: {e}", path.display());
                self.reply(format!("Error: {e}").into_bytes()).await
            }
        }
    }

    async fn handle_data(&mut self, buf: &[u8], addr: SocketAddr) -> Result<()> {
        if buf.len() == 12 {
            return self.handle_hello(buf, addr).await;
        }
        if let Some(latched) = self.latched {
            if addr != latched {
                trace!("Collector: data from unlatched {addr}, dropping");
                return Ok(());
            }
        }
        let Phase::Collecting(frame) = &mut self.phase else {
            debug!("Collector: data with no open frame, dropping");
            return Ok(());
        };
        let pkt = match parse_packet(buf) {
            Ok(p) => p,
            Err(e) => {
                warn!("Collector: bad packet: {e}");
                frame.degraded = true;
                return Ok(());
            }
        };
        if pkt.seq != frame.expect_seq {
            let missed = pkt.seq.saturating_sub(frame.expect_seq);
            warn!(
                "Collector: sequence gap, got {} want {} ({missed} lost)",
                pkt.seq, frame.expect_seq
            );
            frame.lost += missed as u64;
            frame.degraded = true;
        }
        frame.expect_seq = pkt.seq + 1;
        if !frame.header_written {
            match pkt.frame_num {
                Some(n) => frame.frame_num = n,
                None => {
                    // Packet 0 never arrived; the frame number is
                    // unknowable but the data is still worth keeping.
                    warn!("Collector: first packet of frame is seq {}", pkt.seq);
                    frame.degraded = true;
                }
            }
            frame.writer.write_all(&OPEN_SENTINEL.to_be_bytes())?;
            frame.writer.write_all(&frame.frame_num.to_be_bytes())?;
            frame.header_written = true;
        }
        frame.writer.write_all(pkt.payload)?;
        frame.events += (pkt.payload.len() / 8) as u64;
        if let Some(overflow) = pkt.trailer {
            self.close_frame(overflow).await?;
        }
        Ok(())
    }

    async fn close_frame(&mut self, overflow: u32) -> Result<()> {
        let Phase::Collecting(frame) = &mut self.phase else {
            unreachable!("close_frame outside collection");
        };
        if !frame.header_written {
            frame.writer.write_all(&OPEN_SENTINEL.to_be_bytes())?;
            frame.writer.write_all(&frame.frame_num.to_be_bytes())?;
            frame.header_written = true;
        }
        frame.writer.write_all(&overflow.to_be_bytes())?;
        frame.writer.write_all(&CLOSE_SENTINEL.to_be_bytes())?;
        frame.writer.flush()?;
        frame.writer.get_ref().sync_all()?;
        let summary = Summary {
            frame_num: frame.frame_num as u64,
            events: frame.events,
            overflow: overflow as u64,
            path: frame.path.clone(),
        };
        info!(
            "Collector: frame {} closed, {} events, overflow {}, lost {} packets{}",
            summary.frame_num,
            summary.events,
            summary.overflow,
            frame.lost,
            if frame.degraded { " (degraded)" } else { "" },
        );
        let mut sent_triple = false;
        if self.pending_ack {
            self.pending_ack = false;
            let reply = summary_triple(&summary);
            self.reply(reply).await?;
            sent_triple = true;
        }
        self.phase = Phase::Done {
            summary,
            sent_triple,
        };
        Ok(())
    }

    async fn handle_hello(&mut self, buf: &[u8], addr: SocketAddr) -> Result<()> {
        let sig = word(buf, 0);
        if sig != HELLO_SIG {
            debug!("Collector: 12-byte datagram with signature {sig:#010x}");
            return Ok(());
        }
        let enable = word(buf, 2);
        if enable == 1 {
            info!("Collector: latched data source {addr}");
            self.latched = Some(addr);
        } else {
            info!("Collector: unlatched data source");
            self.latched = None;
        }
        let mut reply = [0u8; 8];
        reply[4..].copy_from_slice(&HELLO_OK.to_be_bytes());
        self.data.send_to(&reply, addr).await?;
        Ok(())
    }
}

fn summary_triple(s: &Summary) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(&s.frame_num.to_le_bytes());
    buf.extend_from_slice(&s.events.to_le_bytes());
    buf.extend_from_slice(&s.overflow.to_le_bytes());
    buf
}

/// Controller side of the collector handshake. One client per
/// acquisition; the REQ socket does not survive a broken handshake.
pub struct CollectorClient {
    sock: zeromq::ReqSocket,
    timeout: std::time::Duration,
}

impl CollectorClient {
    /// Connect to the collector handshake endpoint.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let mut sock = zeromq::ReqSocket::new();
        sock.connect(endpoint).await?;
        Ok(Self {
            sock,
            timeout: std::time::Duration::from_secs(5),
        })
    }

    /// Deadline for the filename and path steps.
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(
        &mut self,
        payload: Vec<u8>,
        deadline: std::time::Duration,
    ) -> Result<Vec<u8>> {
        self.sock.send(ZmqMessage::from(Bytes::from(payload))).await?;
        let reply = tokio::time::timeout(deadline, self.sock.recv())
            .await
            .map_err(|_| {
                Error::Handshake(format!("no collector reply within {deadline:?}"))
            })??;
        Ok(reply.get(0).map(|b| b.to_vec()).unwrap_or_default())
    }

    /// Step 1: announce the output path.
    pub async fn send_filename(&mut self, path: &Path) -> Result<()> {
        let reply = self
            .exchange(path.to_string_lossy().into_owned().into_bytes(), self.timeout)
            .await?;
        if reply != FILENAME_ACK {
            return Err(Error::Handshake(format!(
                "filename answered {:?}",
                String::from_utf8_lossy(&reply)
            )));
        }
        Ok(())
    }

    /// Step 2: ack and wait for the frame summary. The deadline
    /// covers the whole frame, so it is the frame time plus slack.
    pub async fn wait_summary(
        &mut self,
        deadline: std::time::Duration,
    ) -> Result<(u64, u64, u64)> {
        let reply = self.exchange(b"ack".to_vec(), deadline).await?;
        if reply.len() != 24 {
            return Err(Error::Handshake(format!(
                "summary is {} bytes, want 24",
                reply.len()
            )));
        }
        let mut vals = [0u64; 3];
        for (v, c) in vals.iter_mut().zip(reply.chunks_exact(8)) {
            *v = u64::from_le_bytes(c.try_into().unwrap());
        }
        Ok((vals[0], vals[1], vals[2]))
    }

    /// Step 3: ack and fetch the written path.
    pub async fn fetch_path(&mut self) -> Result<PathBuf> {
        let reply = self.exchange(b"ack".to_vec(), self.timeout).await?;
        let s = String::from_utf8(reply)
            .map_err(|_| Error::Handshake("written path is not UTF-8".into()))?;
        if s.is_empty() || s.starts_with("Error") {
            return Err(Error::Handshake(format!("path step answered {s:?}")));
        }
        Ok(PathBuf::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{self, EventColumns};
    use crate::sim;

    #[test]
    fn parse_first_packet() -> Result<()> {
        let cols = EventColumns::from_events(&[(1, 2, 3, 4, 5)]);
        let pkts = sim::udp_packets(&cols, 12, 0);
        assert_eq!(pkts.len(), 1);
        let pkt = parse_packet(&pkts[0])?;
        assert_eq!(pkt.seq, 0);
        assert_eq!(pkt.frame_num, Some(12));
        assert_eq!(pkt.trailer, Some(0));
        let decoded = event::decode_bytes(pkt.payload, event::Endian::Big)?;
        assert_eq!(decoded, cols);
        Ok(())
    }

    #[test]
    fn non_final_packets_are_full_size() {
        // 1031 events need three packets: 510 + 511 + 10.
        let cols = EventColumns::from_events(
            &(0..1031)
                .map(|i| (0, 0, 0, 0, i as u32))
                .collect::<Vec<_>>(),
        );
        let pkts = sim::udp_packets(&cols, 3, 5);
        assert_eq!(pkts.len(), 3);
        assert_eq!(pkts[0].len(), PACKET_BYTES);
        assert_eq!(pkts[1].len(), PACKET_BYTES);
        assert!(pkts[2].len() < PACKET_BYTES);
        let p0 = parse_packet(&pkts[0]).unwrap();
        let p1 = parse_packet(&pkts[1]).unwrap();
        let p2 = parse_packet(&pkts[2]).unwrap();
        assert_eq!((p0.seq, p1.seq, p2.seq), (0, 1, 2));
        assert_eq!(p0.payload.len() / 4, 1020);
        assert_eq!(p1.payload.len() / 4, 1022);
        assert_eq!(p2.trailer, Some(5));
        let total = p0.payload.len() + p1.payload.len() + p2.payload.len();
        assert_eq!(total / 8, 1031);
    }

    #[test]
    fn bad_open_sentinel_rejected() {
        let cols = EventColumns::from_events(&[(1, 2, 3, 4, 5)]);
        let mut pkt = sim::udp_packets(&cols, 12, 0).remove(0);
        pkt[4..8].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(parse_packet(&pkt), Err(Error::Protocol(_))));
    }

    #[test]
    fn short_packet_without_close_sentinel_rejected() {
        let cols = EventColumns::from_events(&[(1, 2, 3, 4, 5)]);
        let mut pkt = sim::udp_packets(&cols, 12, 0).remove(0);
        let n = pkt.len();
        pkt[n - 4..].copy_from_slice(&0x12345678u32.to_be_bytes());
        assert!(matches!(parse_packet(&pkt), Err(Error::Protocol(_))));
    }

    #[test]
    fn exactly_full_frame_gets_trailer_packet() {
        // 510 events fill packet 0 to the word; the trailer must come
        // as its own 16-byte datagram.
        let cols = EventColumns::from_events(
            &(0..510).map(|i| (0, 0, 0, 0, i as u32)).collect::<Vec<_>>(),
        );
        let pkts = sim::udp_packets(&cols, 1, 2);
        assert_eq!(pkts.len(), 2);
        assert_eq!(pkts[0].len(), PACKET_BYTES);
        assert_eq!(pkts[1].len(), 16);
        let trailer = parse_packet(&pkts[1]).unwrap();
        assert_eq!(trailer.seq, 1);
        assert!(trailer.payload.is_empty());
        assert_eq!(trailer.trailer, Some(2));
    }
}
