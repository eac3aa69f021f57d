/*! GeRM acquisition daemon.

```text
$ germd 10.0.0.7                  # streaming (ZMQ) data path
$ germd 10.0.0.7 10.0.0.8         # high-speed (UDP collector) path
$ germd 10.0.0.7 127.0.0.1 --run-collector -v 2
```

Connects to the detector's register socket, runs the chosen data path
plus the acquisition controller, and serves the control-plane channels
on TCP. Exits non-zero when a socket cannot be bound.
*/
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use germ::collector::Collector;
use germ::config::Config;
use germ::control::ControlClient;
use germ::controller::{AcqMode, Controller, ControllerConfig};
use germ::ingest::{IngestShared, ZmqIngester};
use germ::registry::JsonlRegistry;
use germ::server::{ChannelHub, Server};

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// Detector host (register and event sockets).
    detector_host: String,

    /// UDP collector host; given, the high-speed path is used instead
    /// of the ZMQ stream.
    collector_host: Option<String>,

    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control-plane listen address override.
    #[arg(long)]
    listen: Option<String>,

    /// Also run the UDP collector in this process (single-host
    /// setups).
    #[arg(long = "run-collector")]
    run_collector: bool,

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

    // Everything cooperates on one thread; see the crate docs.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(opt))
}

async fn run(opt: Opt) -> Result<()> {
    let mut cfg = match &opt.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    cfg.detector_host = opt.detector_host;
    if opt.collector_host.is_some() {
        cfg.collector_host = opt.collector_host.clone();
    }
    if let Some(listen) = opt.listen {
        cfg.listen = listen;
    }
    cfg.validate()?;

    let control = Arc::new(
        ControlClient::connect(&cfg.control_endpoint())
            .await?
            .with_timeout(std::time::Duration::from_millis(cfg.control_timeout_ms)),
    );
    let hub = ChannelHub::new(&cfg);
    let registry = Arc::new(JsonlRegistry::open(&cfg.registry_path)?);

    let mode = match cfg.collector_endpoint() {
        Some(endpoint) => {
            if opt.run_collector {
                let (collector, _, _) = Collector::bind(
                    &format!("0.0.0.0:{}", cfg.collector_data_port),
                    &format!("tcp://0.0.0.0:{}", cfg.collector_port),
                )
                .await?;
                tokio::spawn(async move {
                    if let Err(e) = collector.run().await {
                        log::error!("collector died: {e}");
                    }
                });
            }
            info!("high-speed path via collector at {endpoint}");
            AcqMode::Udp {
                ctrl_endpoint: endpoint,
            }
        }
        None => {
            let shared = IngestShared::new(cfg.max_events);
            let ingester =
                ZmqIngester::connect(&cfg.data_endpoint(), shared.clone()).await?;
            tokio::spawn(async move {
                if let Err(e) = ingester.run().await {
                    log::error!("ingester died: {e}");
                }
            });
            info!("streaming path via {}", cfg.data_endpoint());
            AcqMode::Zmq(shared)
        }
    };

    let (controller, acq_tx) = Controller::new(
        control.clone(),
        hub.clone(),
        registry,
        mode,
        ControllerConfig {
            collect_slack: std::time::Duration::from_secs_f64(cfg.collect_slack_secs),
            sink: cfg.sink,
            ..Default::default()
        },
    );
    tokio::spawn(controller.run());

    let listener = tokio::net::TcpListener::bind(&cfg.listen).await?;
    let server = Arc::new(Server {
        hub,
        control,
        acq_tx,
    });
    tokio::select! {
        r = server.serve(listener) => r?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }
    Ok(())
}
