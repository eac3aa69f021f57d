//! End-to-end acquisition scenarios over loopback sockets: simulated
//! register server, real PUB/SUB event stream, real control-plane TCP
//! clients, files on disk.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use zeromq::{Socket, SocketSend};

use germ::config::Config;
use germ::control::ControlClient;
use germ::controller::{AcqMode, Controller, ControllerConfig};
use germ::event::EventColumns;
use germ::ingest::{IngestShared, ZmqIngester};
use germ::registry::{BinaryGermReader, JsonlRegistry, RegistryIndex};
use germ::server::{ChannelHub, Server};
use germ::sim;

const WAIT: Duration = Duration::from_secs(10);

struct Rig {
    publisher: zeromq::PubSocket,
    regs: sim::SharedRegisters,
    start_rx: tokio::sync::mpsc::UnboundedReceiver<()>,
    server_addr: std::net::SocketAddr,
    registry_path: PathBuf,
    _dir: tempfile::TempDir,
}

async fn rig(max_events: Option<usize>) -> Result<Rig> {
    let (regs, ctrl_ep, start_rx) = sim::spawn_register_server().await?;
    let mut publisher = zeromq::PubSocket::new();
    let data_ep = publisher.bind("tcp://127.0.0.1:0").await?.to_string();

    let control = Arc::new(ControlClient::connect(&ctrl_ep).await?);
    let shared = IngestShared::new(max_events);
    let ingester = ZmqIngester::connect(&data_ep, shared.clone()).await?;
    tokio::spawn(async move {
        let _ = ingester.run().await;
    });

    let dir = tempfile::tempdir()?;
    let mut cfg = Config::default();
    cfg.filepath = dir.path().join("frames").display().to_string();
    let hub = ChannelHub::new(&cfg);
    let registry_path = dir.path().join("registry.jsonl");
    let registry = Arc::new(JsonlRegistry::open(&registry_path)?);

    let (controller, acq_tx) = Controller::new(
        control.clone(),
        hub.clone(),
        registry,
        AcqMode::Zmq(shared),
        ControllerConfig::default(),
    );
    tokio::spawn(controller.run());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = listener.local_addr()?;
    let server = Arc::new(Server {
        hub,
        control,
        acq_tx,
    });
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    // Let the SUB subscription propagate before anything publishes.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(Rig {
        publisher,
        regs,
        start_rx,
        server_addr,
        registry_path,
        _dir: dir,
    })
}

/// Line-oriented JSON client for the control plane.
struct Client {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    write: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    async fn next_json(&mut self) -> Result<serde_json::Value> {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await??
            .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Send one request and read its reply, skipping pushed updates.
    async fn request(&mut self, req: serde_json::Value) -> Result<serde_json::Value> {
        self.write.write_all(req.to_string().as_bytes()).await?;
        self.write.write_all(b"\n").await?;
        loop {
            let v = self.next_json().await?;
            if v.get("event").is_none() {
                return Ok(v);
            }
        }
    }

    async fn read_channel(&mut self, channel: &str) -> Result<serde_json::Value> {
        let resp = self
            .request(serde_json::json!({"op": "read", "channel": channel}))
            .await?;
        anyhow::ensure!(resp["ok"] == true, "read {channel} failed: {resp}");
        Ok(resp["value"].clone())
    }

    async fn write_channel(
        &mut self,
        channel: &str,
        value: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.request(serde_json::json!({
            "op": "write", "channel": channel, "value": value,
        }))
        .await
    }

    /// Wait for a pushed update matching `channel` and `value`.
    async fn await_update(
        &mut self,
        channel: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "no {channel}={value} update in time"
            );
            let v = self.next_json().await?;
            if v.get("event").is_some() && v["channel"] == channel && &v["value"] == value
            {
                return Ok(());
            }
        }
    }
}

async fn subscribed_client(addr: std::net::SocketAddr) -> Result<Client> {
    let mut c = Client::connect(addr).await?;
    let resp = c
        .request(serde_json::json!({"op": "subscribe", "channel": "*"}))
        .await?;
    anyhow::ensure!(resp["ok"] == true, "subscribe failed: {resp}");
    Ok(c)
}

async fn wait_start(rig: &mut Rig) -> Result<()> {
    tokio::time::timeout(WAIT, rig.start_rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("register server gone"))?;
    // The START write has echoed, so collection is live; leave a
    // moment for the PUB side of fresh messages to flush.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

#[tokio::test]
async fn s1_empty_frame() -> Result<()> {
    let mut rig = rig(None).await?;
    let mut sub = subscribed_client(rig.server_addr).await?;
    let mut cmd = Client::connect(rig.server_addr).await?;

    let resp = cmd.write_channel("acquire", serde_json::json!(1)).await?;
    anyhow::ensure!(resp["ok"] == true, "acquire write failed: {resp}");
    wait_start(&mut rig).await?;
    rig.publisher.send(sim::meta_message(7, 0)).await?;
    sub.await_update("acquire", &serde_json::json!(0)).await?;

    assert_eq!(cmd.read_channel("COUNT").await?, serde_json::json!(0));
    assert_eq!(cmd.read_channel("last_frame").await?, serde_json::json!(7));
    assert_eq!(cmd.read_channel("overfill").await?, serde_json::json!(0));
    let last_file = cmd.read_channel("last_file").await?;
    let path = PathBuf::from(last_file.as_str().unwrap());
    assert!(path.extension().is_some_and(|e| e == "bin"));

    // Five zero-length columns behind valid sentinels.
    let reader = BinaryGermReader::open(&path)?;
    assert!(reader.is_empty());
    assert_eq!(reader.frame_num, 7);
    assert_eq!(reader.overflow, 0);

    // Every column got a datum identifier resolving to an empty
    // column.
    let datum = cmd.read_channel("UUID:CHIP").await?;
    let index = RegistryIndex::load(&rig.registry_path)?;
    assert_eq!(index.fetch(datum.as_str().unwrap())?, Vec::<u32>::new());
    Ok(())
}

#[tokio::test]
async fn s2_single_event() -> Result<()> {
    let mut rig = rig(None).await?;
    let mut sub = subscribed_client(rig.server_addr).await?;
    let mut cmd = Client::connect(rig.server_addr).await?;

    cmd.write_channel("acquire", serde_json::json!(1)).await?;
    wait_start(&mut rig).await?;
    let cols = EventColumns::from_events(&[(3, 17, 500, 2048, 1_000_000)]);
    rig.publisher.send(sim::data_message(&cols)).await?;
    rig.publisher.send(sim::meta_message(8, 0)).await?;
    sub.await_update("acquire", &serde_json::json!(0)).await?;

    assert_eq!(cmd.read_channel("COUNT").await?, serde_json::json!(1));
    assert_eq!(cmd.read_channel("last_frame").await?, serde_json::json!(8));
    let path = PathBuf::from(
        cmd.read_channel("last_file").await?.as_str().unwrap(),
    );
    let reader = BinaryGermReader::open(&path)?;
    assert_eq!(reader.len(), 1);
    assert_eq!(reader.columns().event(0), (3, 17, 500, 2048, 1_000_000));

    // The registry resolves every column to the persisted scalar.
    let index = RegistryIndex::load(&rig.registry_path)?;
    for (channel, want) in [
        ("UUID:CHIP", 3u32),
        ("UUID:CHAN", 17),
        ("UUID:TD", 500),
        ("UUID:PD", 2048),
        ("UUID:TS", 1_000_000),
    ] {
        let datum = cmd.read_channel(channel).await?;
        assert_eq!(index.fetch(datum.as_str().unwrap())?, vec![want]);
    }
    Ok(())
}

#[tokio::test]
async fn s5_desynchronization() -> Result<()> {
    let mut rig = rig(Some(100)).await?;
    let mut sub = subscribed_client(rig.server_addr).await?;
    let mut cmd = Client::connect(rig.server_addr).await?;

    cmd.write_channel("acquire", serde_json::json!(1)).await?;
    wait_start(&mut rig).await?;
    // 150 events, no meta: the cap declares the frame desynchronized.
    for bunch in 0..3 {
        let cols = EventColumns::from_events(
            &(0..50)
                .map(|i| (1, 2, 3, 4, (bunch * 50 + i) as u32))
                .collect::<Vec<_>>(),
        );
        rig.publisher.send(sim::data_message(&cols)).await?;
    }
    sub.await_update("acquire", &serde_json::json!(0)).await?;

    assert_eq!(cmd.read_channel("COUNT").await?, serde_json::json!(150));
    assert_eq!(
        cmd.read_channel("last_frame").await?,
        serde_json::Value::Null
    );
    assert_eq!(cmd.read_channel("overfill").await?, serde_json::json!(0));
    let path = PathBuf::from(
        cmd.read_channel("last_file").await?.as_str().unwrap(),
    );
    assert_eq!(BinaryGermReader::open(&path)?.len(), 150);
    Ok(())
}

#[tokio::test]
async fn s6_frametime_bounds() -> Result<()> {
    let rig = rig(None).await?;
    let mut cmd = Client::connect(rig.server_addr).await?;

    let resp = cmd
        .write_channel("frametime", serde_json::json!(2.5))
        .await?;
    anyhow::ensure!(resp["ok"] == true, "frametime write failed: {resp}");
    assert_eq!(
        rig.regs.lock().unwrap().get(&0xD4).copied(),
        Some(2_500_000)
    );

    let resp = cmd
        .write_channel("frametime", serde_json::json!(-1.0))
        .await?;
    assert_eq!(resp["ok"], serde_json::json!(false));
    assert_eq!(resp["error"], serde_json::json!("Bounds"));
    // Channel and device register both untouched.
    assert_eq!(
        cmd.read_channel("frametime").await?,
        serde_json::json!(2.5)
    );
    assert_eq!(
        rig.regs.lock().unwrap().get(&0xD4).copied(),
        Some(2_500_000)
    );
    Ok(())
}

#[tokio::test]
async fn cancel_mid_collection_produces_no_file() -> Result<()> {
    let mut rig = rig(None).await?;
    let mut sub = subscribed_client(rig.server_addr).await?;
    let mut cmd = Client::connect(rig.server_addr).await?;

    cmd.write_channel("acquire", serde_json::json!(1)).await?;
    wait_start(&mut rig).await?;
    let cols = EventColumns::from_events(&[(1, 1, 1, 1, 1)]);
    rig.publisher.send(sim::data_message(&cols)).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    cmd.write_channel("acquire", serde_json::json!(0)).await?;
    sub.await_update("acquire", &serde_json::json!(0)).await?;

    // Abandoned: nothing committed, STOP reached the detector.
    assert_eq!(
        cmd.read_channel("last_file").await?,
        serde_json::json!("null")
    );
    assert_eq!(cmd.read_channel("COUNT").await?, serde_json::json!(0));
    assert_eq!(rig.regs.lock().unwrap().get(&0x00).copied(), Some(0));
    Ok(())
}
