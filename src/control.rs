/*! Register access to the detector.

Every transaction on the REQ/REP control socket is a single 12-byte
frame of three little-endian u32 words `[opcode, addr, value]`. A read
(`opcode 0`) is answered with the value field filled in; a write
(`opcode 1`) bounces the whole message back.

The client serializes callers with an async lock, so a reply always
reaches the caller that sent the matching request even when the
acquisition controller and control-plane handlers talk to the detector
concurrently.
*/
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace};
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::{Error, Result};

/// Register read.
pub const OP_READ: u32 = 0;
/// Register write.
pub const OP_WRITE: u32 = 1;
/// Kick the high-speed DMA engine.
pub const OP_START_DMA: u32 = 2;

/// Frame-time register, in 1 µs units.
pub const FRAMETIME_REG: u32 = 0xD4;
/// Seconds per frame-time count.
pub const FRAMETIME_RESOLUTION: f64 = 1e-6;

/// Largest programmable frame time, in seconds.
pub fn frametime_max() -> f64 {
    (u32::MAX as f64) * FRAMETIME_RESOLUTION
}

/// Start data taking.
pub const START_DAQ: (u32, u32) = (0x00, 0x01);
/// Stop data taking.
pub const STOP_DAQ: (u32, u32) = (0x00, 0x00);

/// One step of the arming program.
#[derive(Debug, Clone, Copy)]
pub enum ArmStep {
    /// Register write.
    Write(u32, u32),
    /// Fixed settle delay.
    Sleep(Duration),
}

/// The arming program. Order matters: trigger setup, FPGA state
/// machine reset, ADC read count, FIFO reset with settle times, then
/// DAQ enable.
pub const ARM_SEQUENCE: &[ArmStep] = &[
    ArmStep::Write(0x00, 0x40),
    ArmStep::Write(0x00, 0x00),
    ArmStep::Write(0x10, 0x01),
    ArmStep::Write(0x18, 0x02),
    ArmStep::Write(0x68, 0x04),
    ArmStep::Sleep(Duration::from_millis(10)),
    ArmStep::Write(0x68, 0x00),
    ArmStep::Sleep(Duration::from_millis(10)),
    ArmStep::Write(0x68, 0x01),
    ArmStep::Write(0xD0, 0x01),
];

/// Default reply deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

fn pack(words: [u32; 3]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    for w in words {
        buf.extend_from_slice(&w.to_le_bytes());
    }
    buf
}

fn unpack(msg: &ZmqMessage) -> Result<[u32; 3]> {
    if msg.len() != 1 {
        return Err(Error::Protocol(format!(
            "control reply has {} frames, want 1",
            msg.len()
        )));
    }
    let buf = msg.get(0).unwrap();
    if buf.len() != 12 {
        return Err(Error::Protocol(format!(
            "control reply is {} bytes, want 12",
            buf.len()
        )));
    }
    let mut words = [0u32; 3];
    for (w, c) in words.iter_mut().zip(buf.chunks_exact(4)) {
        *w = u32::from_le_bytes(c.try_into().unwrap());
    }
    Ok(words)
}

/// Client side of the detector control socket.
pub struct ControlClient {
    endpoint: String,
    sock: tokio::sync::Mutex<zeromq::ReqSocket>,
    timeout: Duration,
}

impl ControlClient {
    /// Connect to the detector control endpoint
    /// (e.g. `tcp://germ-det:5555`).
    pub async fn connect(endpoint: &str) -> Result<Self> {
        debug!("ControlClient: connecting to {endpoint}");
        let mut sock = zeromq::ReqSocket::new();
        sock.connect(endpoint).await?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            sock: tokio::sync::Mutex::new(sock),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Replace the reply deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One atomic request/reply. Holding the lock across both halves
    /// is what keeps transactions from interleaving.
    async fn transact(&self, req: [u32; 3]) -> Result<[u32; 3]> {
        let mut sock = self.sock.lock().await;
        trace!(
            "ControlClient: [{:#x}, {:#x}, {:#x}]",
            req[0], req[1], req[2]
        );
        sock.send(ZmqMessage::from(Bytes::from(pack(req)))).await?;
        match tokio::time::timeout(self.timeout, sock.recv()).await {
            Ok(reply) => unpack(&reply?),
            Err(_) => {
                // The REQ state machine is now stuck mid-transaction;
                // a fresh socket restores send/recv alternation. Not
                // a retry: the caller still sees the timeout.
                let mut fresh = zeromq::ReqSocket::new();
                fresh.connect(&self.endpoint).await?;
                *sock = fresh;
                Err(Error::Timeout(self.timeout))
            }
        }
    }

    /// Read register `addr`.
    pub async fn read(&self, addr: u32) -> Result<u32> {
        let rep = self.transact([OP_READ, addr, 0]).await?;
        if rep[0] != OP_READ || rep[1] != addr {
            return Err(Error::Protocol(format!(
                "read {addr:#x} answered for opcode {:#x} addr {:#x}",
                rep[0], rep[1]
            )));
        }
        Ok(rep[2])
    }

    /// Write `value` to register `addr`. The detector echoes the full
    /// message; anything else is a protocol error.
    pub async fn write(&self, addr: u32, value: u32) -> Result<()> {
        debug!("ControlClient: write {addr:#04x} <- {value:#x}");
        let rep = self.transact([OP_WRITE, addr, value]).await?;
        if rep != [OP_WRITE, addr, value] {
            return Err(Error::Protocol(format!(
                "write {addr:#x} echoed [{:#x}, {:#x}, {:#x}]",
                rep[0], rep[1], rep[2]
            )));
        }
        Ok(())
    }

    /// Kick the DMA engine for the high-speed path.
    pub async fn start_dma(&self) -> Result<()> {
        let rep = self.transact([OP_START_DMA, 0, 0]).await?;
        if rep[0] != OP_START_DMA {
            return Err(Error::Protocol(format!(
                "start_dma answered with opcode {:#x}",
                rep[0]
            )));
        }
        Ok(())
    }

    /// Run the arming program.
    pub async fn arm(&self) -> Result<()> {
        for step in ARM_SEQUENCE {
            match *step {
                ArmStep::Write(addr, value) => self.write(addr, value).await?,
                ArmStep::Sleep(d) => tokio::time::sleep(d).await,
            }
        }
        Ok(())
    }

    /// Assert detector START.
    pub async fn start(&self) -> Result<()> {
        self.write(START_DAQ.0, START_DAQ.1).await
    }

    /// Assert detector STOP.
    pub async fn stop(&self) -> Result<()> {
        self.write(STOP_DAQ.0, STOP_DAQ.1).await
    }
}
