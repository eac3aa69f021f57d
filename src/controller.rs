/*! Acquisition controller.

The only component that changes acquisition state:

```text
Idle ──arm──► Arming ──trigger_ok──► Collecting ──meta|sentinel──► Committing ──ok──► Idle
                 │                                                                    ▲
                 └──err──► Failed ────────────────────────────────────────────────────┘
```

One acquisition is: run the arming register program, enable the data
path (ZMQ ingester or UDP collector handshake), assert START, wait for
frame completion with a timeout of frame time plus slack, assert STOP,
commit the frame (time-sorted write, registry rows), and publish the
results on the control plane. Failures surface as an alarm before
`acquire` drops back to 0; a client writing 0 mid-collection cancels
and abandons the frame.
*/
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::collector::CollectorClient;
use crate::control::ControlClient;
use crate::event::{self, TimeParams};
use crate::frame::FrameBuffer;
use crate::ingest::IngestShared;
use crate::registry::{self, Registry};
use crate::server::{ChannelHub, Value, chan};
use crate::sink::{FileSink, SinkFormat};
use crate::{Error, Result};

/// Commands from the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqCommand {
    /// `acquire = 1`: run one acquisition.
    Start,
    /// `acquire = 0`: cancel the one in flight.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Arming,
    Collecting,
    Committing,
    Failed,
}

/// Which data path this controller drives.
pub enum AcqMode {
    /// Streaming path: in-process ingester on the detector's PUB
    /// socket.
    Zmq(Arc<IngestShared>),
    /// High-speed path: external (or co-hosted) UDP collector, spoken
    /// to over its handshake endpoint.
    Udp {
        /// Collector handshake endpoint.
        ctrl_endpoint: String,
    },
}

/// Controller settings that do not live on channels.
pub struct ControllerConfig {
    /// Slack added to the frame time when waiting for completion.
    pub collect_slack: Duration,
    /// Frame file backend for the ZMQ path.
    pub sink: SinkFormat,
    /// Wrap parameters for time reconstruction at commit.
    pub time: TimeParams,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            collect_slack: Duration::from_secs(5),
            sink: SinkFormat::Raw,
            time: TimeParams::default(),
        }
    }
}

/// The acquisition controller task.
pub struct Controller {
    control: Arc<ControlClient>,
    hub: Arc<ChannelHub>,
    registry: Arc<dyn Registry>,
    mode: AcqMode,
    cfg: ControllerConfig,
    rx: tokio::sync::mpsc::Receiver<AcqCommand>,
    state: State,
    last_committed_frame: Option<u32>,
}

/// What one wait-for-completion ended with.
enum CollectOutcome {
    Completed,
    TimedOut,
    Cancelled,
}

impl Controller {
    /// Build the controller and the command sender the control plane
    /// uses to reach it.
    pub fn new(
        control: Arc<ControlClient>,
        hub: Arc<ChannelHub>,
        registry: Arc<dyn Registry>,
        mode: AcqMode,
        cfg: ControllerConfig,
    ) -> (Self, tokio::sync::mpsc::Sender<AcqCommand>) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        (
            Self {
                control,
                hub,
                registry,
                mode,
                cfg,
                rx,
                state: State::Idle,
                last_committed_frame: None,
            },
            tx,
        )
    }

    /// Command loop. Runs until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                AcqCommand::Start => self.acquire().await,
                // Nothing in flight to cancel.
                AcqCommand::Cancel => debug!("cancel while idle, ignoring"),
            }
        }
    }

    fn set_state(&mut self, next: State) {
        debug!("acquisition state {:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// One full acquisition, ending with `acquire = 0` no matter what.
    async fn acquire(&mut self) {
        let started = std::time::Instant::now();
        match self.acquire_inner().await {
            Ok(Some(count)) => {
                info!(
                    "acquisition done: {count} events in {:?}",
                    started.elapsed()
                );
                self.set_state(State::Idle);
            }
            Ok(None) => {
                info!("acquisition cancelled");
                self.set_state(State::Idle);
            }
            Err(e) => {
                self.set_state(State::Failed);
                warn!("acquisition failed: {e}");
                self.hub.alarm(chan::ACQUIRE, &format!("{}: {e}", e.kind()));
                self.set_state(State::Idle);
            }
        }
        self.hub.set(chan::ACQUIRE, Value::Int(0));
    }

    /// Returns the committed event count, or None when cancelled.
    async fn acquire_inner(&mut self) -> Result<Option<usize>> {
        self.set_state(State::Arming);
        self.control.arm().await?;
        match &self.mode {
            AcqMode::Zmq(shared) => {
                let shared = shared.clone();
                self.acquire_zmq(shared).await
            }
            AcqMode::Udp { ctrl_endpoint } => {
                let endpoint = ctrl_endpoint.clone();
                self.acquire_udp(endpoint).await
            }
        }
    }

    fn collect_deadline(&self) -> Duration {
        let frametime = match self.hub.get(chan::FRAMETIME) {
            Some(Value::Double(s)) if s >= 0.0 => s,
            _ => 1.0,
        };
        Duration::from_secs_f64(frametime) + self.cfg.collect_slack
    }

    /// Drain a cancel command, dropping queued re-triggers.
    async fn wait_cancel(rx: &mut tokio::sync::mpsc::Receiver<AcqCommand>) {
        loop {
            match rx.recv().await {
                Some(AcqCommand::Cancel) | None => return,
                Some(AcqCommand::Start) => {
                    warn!("acquire written while already collecting, ignoring");
                }
            }
        }
    }

    async fn acquire_zmq(&mut self, shared: Arc<IngestShared>) -> Result<Option<usize>> {
        shared.begin();
        if let Err(e) = self.control.start().await {
            shared.abort();
            return Err(e);
        }
        self.set_state(State::Collecting);
        let deadline = self.collect_deadline();
        let outcome = tokio::select! {
            _ = shared.done.notified() => CollectOutcome::Completed,
            _ = Self::wait_cancel(&mut self.rx) => CollectOutcome::Cancelled,
            _ = tokio::time::sleep(deadline) => CollectOutcome::TimedOut,
        };
        // STOP is owed in every outcome.
        let stop = self.control.stop().await;
        match outcome {
            CollectOutcome::Cancelled => {
                shared.abort();
                shared.take();
                stop?;
                return Ok(None);
            }
            CollectOutcome::TimedOut => {
                warn!("no frame meta within {deadline:?}, committing degraded");
                shared.abort();
            }
            CollectOutcome::Completed => {}
        }
        stop?;
        let mut frame = shared.take();
        if matches!(outcome, CollectOutcome::TimedOut) {
            frame.degraded = true;
            self.hub.alarm(
                chan::ACQUIRE,
                &format!("Timeout: no frame meta within {deadline:?}"),
            );
        } else if frame.frame_num.is_none() {
            let e = Error::Desynchronized {
                got: frame.len(),
                cap: shared.max_events().unwrap_or(0),
            };
            self.hub.alarm(chan::ACQUIRE, &format!("{}: {e}", e.kind()));
        }
        self.set_state(State::Committing);
        let count = frame.len();
        self.commit_zmq(frame).await?;
        Ok(Some(count))
    }

    /// Output directory: `filepath` as-is when absolute, otherwise
    /// under `write_root`.
    fn output_dir(&self) -> Result<PathBuf> {
        let filepath = self.channel_string(chan::FILEPATH)?;
        let path = PathBuf::from(&filepath);
        if path.is_absolute() {
            return Ok(path);
        }
        let root = PathBuf::from(self.channel_string(chan::WRITE_ROOT)?);
        Ok(root.join(path))
    }

    fn channel_string(&self, name: &str) -> Result<String> {
        match self.hub.get(name) {
            Some(Value::Str(s)) => Ok(s),
            other => Err(Error::Bounds(format!(
                "channel {name} holds {other:?}, want a string"
            ))),
        }
    }

    /// Sort the frame by reconstructed time. Reconstruction problems
    /// degrade the frame instead of failing the commit.
    fn time_sort(&self, frame: &mut FrameBuffer) {
        if frame.columns.is_empty() {
            return;
        }
        match event::reconstruct_time(&frame.columns.ts, None, &self.cfg.time) {
            Ok((ts64, _)) => {
                let perm = event::argsort_by_time(&ts64);
                frame.columns = frame.columns.reorder(&perm);
            }
            Err(e) => {
                warn!("time reconstruction failed, keeping arrival order: {e}");
                frame.degraded = true;
            }
        }
    }

    async fn commit_zmq(&mut self, mut frame: FrameBuffer) -> Result<()> {
        self.time_sort(&mut frame);
        let sink = FileSink {
            dir: self.output_dir()?,
            format: self.cfg.sink,
        };
        let path = sink.write_frame(&frame)?;
        let count = frame.len();
        let frame_num = frame.frame_num;
        let overfill = frame.overfill;
        self.register_and_publish(
            self.cfg.sink.spec(),
            &path,
            count as i64,
            overfill as i64,
            frame_num,
        )
        .await
    }

    async fn acquire_udp(&mut self, endpoint: String) -> Result<Option<usize>> {
        // Path discipline mirrors the device setup: a relative
        // per-experiment directory under an absolute write root.
        let filepath = PathBuf::from(self.channel_string(chan::FILEPATH)?);
        let write_root = PathBuf::from(self.channel_string(chan::WRITE_ROOT)?);
        let read_root = PathBuf::from(self.channel_string(chan::READ_ROOT)?);
        if filepath.is_absolute() {
            return Err(Error::Bounds("filepath must not be absolute".into()));
        }
        if !write_root.is_absolute() {
            return Err(Error::Bounds("write_root must be absolute".into()));
        }
        if !read_root.is_absolute() {
            return Err(Error::Bounds("read_root must be absolute".into()));
        }
        let intended = write_root
            .join(&filepath)
            .join(format!("{}.bin", uuid::Uuid::new_v4()));

        let mut collector = CollectorClient::connect(&endpoint).await?;
        collector.send_filename(&intended).await?;
        self.control.start().await?;
        self.set_state(State::Collecting);
        let deadline = self.collect_deadline();
        let outcome = tokio::select! {
            summary = collector.wait_summary(deadline) => Some(summary),
            _ = Self::wait_cancel(&mut self.rx) => None,
        };
        let summary = match outcome {
            None => {
                self.control.stop().await?;
                return Ok(None);
            }
            Some(Ok(s)) => s,
            Some(Err(e)) => {
                // STOP still gets issued on a broken handshake.
                if let Err(e2) = self.control.stop().await {
                    warn!("STOP after handshake failure also failed: {e2}");
                }
                return Err(e);
            }
        };
        let written = match collector.fetch_path().await {
            Ok(p) => p,
            Err(e) => {
                if let Err(e2) = self.control.stop().await {
                    warn!("STOP after handshake failure also failed: {e2}");
                }
                return Err(e);
            }
        };
        self.control.stop().await?;

        self.set_state(State::Committing);
        let (frame_num, events, overflow) = summary;
        let local = self.translate_mounts(&written)?;
        self.register_and_publish(
            SinkFormat::Raw.spec(),
            &local,
            events as i64,
            overflow as i64,
            Some(frame_num as u32),
        )
        .await?;
        Ok(Some(events as usize))
    }

    /// Re-root the collector's view of the written path onto ours.
    fn translate_mounts(&self, written: &Path) -> Result<PathBuf> {
        let src = PathBuf::from(self.channel_string(chan::SRC_MOUNT)?);
        let dest = PathBuf::from(self.channel_string(chan::DEST_MOUNT)?);
        match written.strip_prefix(&src) {
            Ok(rel) => Ok(dest.join(rel)),
            Err(_) => Err(Error::Bounds(format!(
                "collector path {} is outside src_mount {}",
                written.display(),
                src.display()
            ))),
        }
    }

    async fn register_and_publish(
        &mut self,
        spec: &str,
        path: &Path,
        count: i64,
        overfill: i64,
        frame_num: Option<u32>,
    ) -> Result<()> {
        let write_root = PathBuf::from(self.channel_string(chan::WRITE_ROOT)?);
        let read_root = self.channel_string(chan::READ_ROOT)?;
        let (root, rpath) = match path.strip_prefix(&write_root) {
            Ok(rel) => (read_root, rel.to_path_buf()),
            // Not under the root; register it where it is.
            Err(_) => ("/".to_string(), path.to_path_buf()),
        };
        let sha = match registry::file_sha256(path) {
            Ok(s) => Some(s),
            Err(e) => {
                debug!("no checksum for {}: {e}", path.display());
                None
            }
        };
        let resource = self
            .registry
            .insert_resource(spec, &root, &rpath.to_string_lossy(), sha)
            .await?;
        let uuid_channels = [
            chan::UUID_CHIP,
            chan::UUID_CHAN,
            chan::UUID_TD,
            chan::UUID_PD,
            chan::UUID_TS,
        ];
        for (channel, column) in uuid_channels.into_iter().zip(event::COLUMN_NAMES) {
            let datum = self.registry.insert_datum(&resource, column).await?;
            self.hub.set(channel, Value::Str(datum));
        }
        if let (Some(n), Some(prev)) = (frame_num, self.last_committed_frame) {
            if n <= prev {
                warn!("frame number went {prev} -> {n}, expected strictly increasing");
            }
        }
        if let Some(n) = frame_num {
            self.last_committed_frame = Some(n);
        }
        self.hub
            .set(chan::LAST_FILE, Value::Str(path.display().to_string()));
        self.hub.set(chan::COUNT, Value::Int(count));
        self.hub.set(chan::OVERFILL, Value::Int(overfill));
        self.hub.set(
            chan::LAST_FRAME,
            frame_num.map_or(Value::Null, |n| Value::Int(n as i64)),
        );
        info!(
            "committed frame {frame_num:?}: {count} events, overfill {overfill}, {}",
            path.display()
        );
        Ok(())
    }
}
