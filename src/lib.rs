#![warn(missing_docs)]
/*! Acquisition-side core for the GeRM (Germanium Resistive Micromegas)
detector.

The detector electronics emit a stream of per-event records over two
transports: a ZMQ REQ/REP control channel for register access, and a
high-throughput data channel that is either a ZMQ PUB/SUB stream or a
raw UDP datagram stream.

This crate is the pipeline between those sockets and a self-describing
per-frame file:

```text
   [ Register client ]──arm/start/stop──► detector
           │
   [ ZMQ ingester ]  or  [ UDP collector ]
           ↓                    ↓
     [ Event codec ]      (raw passthrough)
           ↓                    ↓
     [ Frame buffer ]     [ frame file ]
           ↓
      [ File sink ]
           ↓
   [ Asset registry ]
           ↓
   [ Control-plane server ] ◄── experiment control clients
```

The acquisition controller owns the whole sequence: it arms the
detector through a fixed register program, enables one of the two
ingest paths, waits for the end-of-frame marker, commits the frame to
disk, registers the artifact, and publishes counters and per-column
datum identifiers on the control plane.

Everything runs on a single-threaded cooperative runtime. The three
long-lived tasks (ingester, control-plane server, controller) suspend
on I/O and conditions only; register transactions are serialized by an
async lock so control traffic from different tasks never interleaves.

# Example

Decode a bunch of event words and reconstruct monotonic time:

```
use germ::event::{self, Endian, EventColumns, TimeParams};
let cols = EventColumns::from_events(&[(3, 17, 500, 2048, 1_000_000)]);
let bytes = event::encode_bytes(&cols, Endian::Big);
let back = event::decode_bytes(&bytes, Endian::Big)?;
assert_eq!(back, cols);
let (ts64, _state) = event::reconstruct_time(&back.ts, None, &TimeParams::default())?;
assert_eq!(ts64, vec![1_000_000]);
# Ok::<(), germ::Error>(())
```
*/

pub mod collector;
pub mod config;
pub mod control;
pub mod controller;
pub mod event;
pub mod frame;
pub mod ingest;
pub mod registry;
pub mod server;
pub mod sim;
pub mod sink;

/// Crate error type.
///
/// The variants map to the failure kinds that the control plane
/// reports: a malformed message or sentinel is `Protocol`, a missed
/// control deadline is `Timeout`, and so on. I/O and transport errors
/// are carried through so that `?` works at the seams.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed message shape, bad bitfield tag, or sentinel mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Control-socket deadline exceeded.
    #[error("control request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The UDP collector handshake broke sequence.
    #[error("collector handshake violation: {0}")]
    Handshake(String),

    /// `max_events` exceeded before the frame meta arrived.
    #[error("desynchronized: {got} events with cap {cap} and no frame meta")]
    Desynchronized {
        /// Events collected when the cap was crossed.
        got: usize,
        /// The configured cap.
        cap: usize,
    },

    /// Freshly generated output path already exists.
    #[error("output file already exists: {0}")]
    FileExists(std::path::PathBuf),

    /// A client wrote an out-of-range or mistyped value.
    #[error("value out of bounds: {0}")]
    Bounds(String),

    /// Bad or contradictory configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Plain I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level ZMQ error.
    #[error("zmq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HDF5 backend error.
    #[cfg(feature = "hdf5")]
    #[error("hdf5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
}

impl Error {
    /// Short kind tag used by the control-plane wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Protocol(_) => "Protocol",
            Error::Timeout(_) => "Timeout",
            Error::Handshake(_) => "HandshakeViolation",
            Error::Desynchronized { .. } => "Desynchronized",
            Error::FileExists(_) => "FileExists",
            Error::Bounds(_) => "Bounds",
            Error::Config(_) => "Config",
            Error::Io(_) => "IOError",
            Error::Zmq(_) => "IOError",
            Error::Json(_) => "Protocol",
            #[cfg(feature = "hdf5")]
            Error::Hdf5(_) => "IOError",
        }
    }
}

/// Crate result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
