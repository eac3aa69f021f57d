/*! GeRM detector simulator.

Serves the register protocol and, on every START write, emits one
frame of synthetic events, published on the ZMQ data socket or fired
at a UDP collector.

```text
$ germ-sim --mode zmq
$ germ-sim --mode udp --collector 127.0.0.1:5558
```
*/
use anyhow::Result;
use clap::Parser;

use germ::sim::{self, SimDetector};

#[derive(clap::ValueEnum, Clone, Debug)]
enum Mode {
    /// Publish events on a PUB socket.
    Zmq,
    /// Fire datagrams at a UDP collector.
    Udp,
}

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    #[arg(long, value_enum, default_value = "zmq")]
    mode: Mode,

    /// Register socket bind endpoint.
    #[arg(long, default_value = "tcp://0.0.0.0:5555")]
    ctrl: String,

    /// Event publisher bind endpoint (zmq mode).
    #[arg(long, default_value = "tcp://0.0.0.0:5556")]
    data: String,

    /// Collector data address (udp mode).
    #[arg(long, default_value = "127.0.0.1:5558")]
    collector: String,

    /// Events per frame.
    #[arg(long, default_value = "50000")]
    events: usize,

    /// Bunches per frame on the zmq path.
    #[arg(long, default_value = "10")]
    bunches: usize,

    /// Coarse-timestamp ticks between events.
    #[arg(long = "tick-gap", default_value = "5000")]
    tick_gap: u32,

    #[arg(short, default_value = "0")]
    verbose: usize,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("germ")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let det = SimDetector::new(opt.events, opt.bunches, opt.tick_gap);
    match opt.mode {
        Mode::Zmq => rt.block_on(sim::run_zmq_sim(&opt.ctrl, &opt.data, det))?,
        Mode::Udp => rt.block_on(sim::run_udp_sim(&opt.ctrl, &opt.collector, det))?,
    }
    Ok(())
}
