/*! Control-plane server.

The daemon's face to the experiment-control world: a set of named,
typed channels with read/write/subscribe semantics, spoken over a
newline-delimited JSON protocol on TCP.

```text
-> {"op":"write","channel":"acquire","value":1}
<- {"ok":true,"channel":"acquire","value":1}
-> {"op":"subscribe","channel":"*"}
<- {"ok":true,"subscribed":"*"}
<- {"event":"update","channel":"COUNT","value":150}
```

Channel updates flow over a broadcast bus: writers publish onto the
hub, subscribed connections forward from it. The acquisition
controller is reached the same way, through a command channel, so
nothing here holds a reference cycle and no handler ever blocks the
accept loop; the only suspensions are socket and register I/O.

Writes go through per-channel validators; a rejected write leaves both
the channel and the detector untouched.
*/
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::control::{ControlClient, FRAMETIME_REG, FRAMETIME_RESOLUTION, frametime_max};
use crate::controller::AcqCommand;
use crate::{Error, Result};

/// Channel names.
pub mod chan {
    /// Acquisition trigger; reverts to 0 on completion.
    pub const ACQUIRE: &str = "acquire";
    /// Frame time in seconds, 1 µs device resolution.
    pub const FRAMETIME: &str = "frametime";
    /// Output directory, absolute or relative to `write_root`.
    pub const FILEPATH: &str = "filepath";
    /// Root of the writable data filesystem.
    pub const WRITE_ROOT: &str = "write_root";
    /// Root readers resolve resources against.
    pub const READ_ROOT: &str = "read_root";
    /// Collector's mount of the data filesystem.
    pub const SRC_MOUNT: &str = "src_mount";
    /// This daemon's mount of the same filesystem.
    pub const DEST_MOUNT: &str = "dest_mount";
    /// Path of the last committed file.
    pub const LAST_FILE: &str = "last_file";
    /// Event count of the last committed frame.
    pub const COUNT: &str = "COUNT";
    /// Overflow count of the last committed frame.
    pub const OVERFILL: &str = "overfill";
    /// Frame number of the last committed frame; null when
    /// desynchronized.
    pub const LAST_FRAME: &str = "last_frame";
    /// Datum identifier channels, one per column.
    pub const UUID_CHIP: &str = "UUID:CHIP";
    /// Channel column datum identifier.
    pub const UUID_CHAN: &str = "UUID:CHAN";
    /// Fine-timestamp column datum identifier.
    pub const UUID_TD: &str = "UUID:TD";
    /// Energy column datum identifier.
    pub const UUID_PD: &str = "UUID:PD";
    /// Coarse-timestamp column datum identifier.
    pub const UUID_TS: &str = "UUID:TS";
}

/// A channel value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent/invalid, serialized as JSON null.
    Null,
    /// Integer channel.
    Int(i64),
    /// Floating-point channel.
    Double(f64),
    /// String channel.
    Str(String),
}

/// One published channel update.
#[derive(Debug, Clone, Serialize)]
pub struct Update {
    /// Channel name.
    pub channel: String,
    /// New value.
    pub value: Value,
    /// Alarm message when the update reports a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm: Option<String>,
}

/// The channel store plus its update bus.
pub struct ChannelHub {
    values: std::sync::Mutex<HashMap<String, Value>>,
    tx: tokio::sync::broadcast::Sender<Update>,
}

impl ChannelHub {
    /// Build the hub with the full channel table and its initial
    /// values.
    pub fn new(cfg: &crate::config::Config) -> Arc<Self> {
        let mut values = HashMap::new();
        values.insert(chan::ACQUIRE.into(), Value::Int(0));
        values.insert(chan::FRAMETIME.into(), Value::Double(1.0));
        values.insert(chan::FILEPATH.into(), Value::Str(cfg.filepath.clone()));
        values.insert(chan::WRITE_ROOT.into(), Value::Str(cfg.write_root.clone()));
        values.insert(chan::READ_ROOT.into(), Value::Str(cfg.read_root.clone()));
        values.insert(chan::SRC_MOUNT.into(), Value::Str(cfg.src_mount.clone()));
        values.insert(chan::DEST_MOUNT.into(), Value::Str(cfg.dest_mount.clone()));
        values.insert(chan::LAST_FILE.into(), Value::Str("null".into()));
        values.insert(chan::COUNT.into(), Value::Int(0));
        values.insert(chan::OVERFILL.into(), Value::Int(0));
        values.insert(chan::LAST_FRAME.into(), Value::Int(0));
        for c in [
            chan::UUID_CHIP,
            chan::UUID_CHAN,
            chan::UUID_TD,
            chan::UUID_PD,
            chan::UUID_TS,
        ] {
            values.insert(c.into(), Value::Str("null".into()));
        }
        let (tx, _) = tokio::sync::broadcast::channel(256);
        Arc::new(Self {
            values: std::sync::Mutex::new(values),
            tx,
        })
    }

    /// Current value of a channel.
    pub fn get(&self, channel: &str) -> Option<Value> {
        self.values.lock().unwrap().get(channel).cloned()
    }

    /// Store and publish a new value.
    pub fn set(&self, channel: &str, value: Value) {
        self.values
            .lock()
            .unwrap()
            .insert(channel.into(), value.clone());
        // Send errors just mean nobody is subscribed.
        let _ = self.tx.send(Update {
            channel: channel.into(),
            value,
            alarm: None,
        });
    }

    /// Publish an alarm on a channel, leaving its value as is.
    pub fn alarm(&self, channel: &str, message: &str) {
        warn!("alarm on {channel}: {message}");
        let value = self.get(channel).unwrap_or(Value::Null);
        let _ = self.tx.send(Update {
            channel: channel.into(),
            value,
            alarm: Some(message.into()),
        });
    }

    /// Subscribe to the update bus.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Update> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", deny_unknown_fields)]
enum Request {
    Read { channel: String },
    Write { channel: String, value: Value },
    Subscribe { channel: String },
}

/// The control-plane server.
pub struct Server {
    /// Channel store.
    pub hub: Arc<ChannelHub>,
    /// Register access for the device-backed channels.
    pub control: Arc<ControlClient>,
    /// Command bus to the acquisition controller.
    pub acq_tx: tokio::sync::mpsc::Sender<AcqCommand>,
}

const STRING_CHANNELS: [&str; 5] = [
    chan::FILEPATH,
    chan::WRITE_ROOT,
    chan::READ_ROOT,
    chan::SRC_MOUNT,
    chan::DEST_MOUNT,
];

impl Server {
    /// Accept loop. Each connection becomes its own cooperative task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("control plane listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("control plane client {peer}");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.client_loop(stream).await {
                    debug!("client {peer} closed: {e}");
                }
            });
        }
    }

    async fn client_loop(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut updates = self.hub.subscribe();
        let mut subscription: Option<String> = None;
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { return Ok(()) };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = self.dispatch(&line, &mut subscription).await;
                    write.write_all(reply.to_string().as_bytes()).await?;
                    write.write_all(b"\n").await?;
                }
                upd = updates.recv(), if subscription.is_some() => {
                    let upd = match upd {
                        Ok(u) => u,
                        // Fell behind the bus; skip what was lost.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => return Ok(()),
                    };
                    let want = subscription.as_deref().unwrap();
                    if want != "*" && want != upd.channel {
                        continue;
                    }
                    let mut body = serde_json::to_value(&upd)?;
                    body["event"] = "update".into();
                    write.write_all(body.to_string().as_bytes()).await?;
                    write.write_all(b"\n").await?;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        line: &str,
        subscription: &mut Option<String>,
    ) -> serde_json::Value {
        let req: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                return serde_json::json!({
                    "ok": false, "error": "Protocol", "message": e.to_string(),
                });
            }
        };
        match req {
            Request::Read { channel } => match self.handle_read(&channel).await {
                Ok(value) => serde_json::json!({
                    "ok": true, "channel": channel, "value": value,
                }),
                Err(e) => error_reply(&channel, &e),
            },
            Request::Write { channel, value } => {
                match self.handle_write(&channel, value).await {
                    Ok(value) => serde_json::json!({
                        "ok": true, "channel": channel, "value": value,
                    }),
                    Err(e) => error_reply(&channel, &e),
                }
            }
            Request::Subscribe { channel } => {
                if channel != "*" && self.hub.get(&channel).is_none() {
                    return error_reply(
                        &channel,
                        &Error::Bounds(format!("no channel {channel:?}")),
                    );
                }
                *subscription = Some(channel.clone());
                serde_json::json!({"ok": true, "subscribed": channel})
            }
        }
    }

    /// Read one channel. `frametime` reads through to the device so
    /// the answer reflects the register, not a cached write.
    pub async fn handle_read(&self, channel: &str) -> Result<Value> {
        if channel == chan::FRAMETIME {
            let counts = self.control.read(FRAMETIME_REG).await?;
            let secs = counts as f64 * FRAMETIME_RESOLUTION;
            let value = Value::Double(secs);
            self.hub.set(chan::FRAMETIME, value.clone());
            return Ok(value);
        }
        self.hub
            .get(channel)
            .ok_or_else(|| Error::Bounds(format!("no channel {channel:?}")))
    }

    /// Validate and apply one channel write.
    pub async fn handle_write(&self, channel: &str, value: Value) -> Result<Value> {
        match channel {
            chan::ACQUIRE => match value {
                Value::Int(1) => {
                    self.hub.set(chan::ACQUIRE, Value::Int(1));
                    self.acq_tx
                        .send(AcqCommand::Start)
                        .await
                        .map_err(|_| Error::Protocol("controller is gone".into()))?;
                    Ok(Value::Int(1))
                }
                Value::Int(0) => {
                    self.acq_tx
                        .send(AcqCommand::Cancel)
                        .await
                        .map_err(|_| Error::Protocol("controller is gone".into()))?;
                    Ok(Value::Int(0))
                }
                other => Err(Error::Bounds(format!(
                    "acquire takes 0 or 1, not {other:?}"
                ))),
            },
            chan::FRAMETIME => {
                let secs = match value {
                    Value::Int(i) => i as f64,
                    Value::Double(d) => d,
                    other => {
                        return Err(Error::Bounds(format!(
                            "frametime takes seconds, not {other:?}"
                        )));
                    }
                };
                if !(0.0..=frametime_max()).contains(&secs) {
                    return Err(Error::Bounds(format!(
                        "frametime {secs} outside [0, {}]",
                        frametime_max()
                    )));
                }
                let counts = (secs / FRAMETIME_RESOLUTION).round();
                self.control.write(FRAMETIME_REG, counts as u32).await?;
                let value = Value::Double(secs);
                self.hub.set(chan::FRAMETIME, value.clone());
                Ok(value)
            }
            c if STRING_CHANNELS.contains(&c) => match value {
                Value::Str(s) => {
                    let value = Value::Str(s);
                    self.hub.set(c, value.clone());
                    Ok(value)
                }
                other => Err(Error::Bounds(format!(
                    "{c} takes a string, not {other:?}"
                ))),
            },
            c if self.hub.get(c).is_some() => {
                Err(Error::Bounds(format!("channel {c:?} is read-only")))
            }
            c => Err(Error::Bounds(format!("no channel {c:?}"))),
        }
    }
}

fn error_reply(channel: &str, e: &Error) -> serde_json::Value {
    serde_json::json!({
        "ok": false,
        "channel": channel,
        "error": e.kind(),
        "message": e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;

    #[test]
    fn value_serde() {
        let v: Value = serde_json::from_str("null").unwrap();
        assert_eq!(v, Value::Null);
        let v: Value = serde_json::from_str("42").unwrap();
        assert_eq!(v, Value::Int(42));
        let v: Value = serde_json::from_str("1.5").unwrap();
        assert_eq!(v, Value::Double(1.5));
        let v: Value = serde_json::from_str("\"x\"").unwrap();
        assert_eq!(v, Value::Str("x".into()));
        assert_eq!(serde_json::to_string(&Value::Null).unwrap(), "null");
        assert_eq!(serde_json::to_string(&Value::Int(7)).unwrap(), "7");
    }

    #[test]
    fn hub_set_get_and_broadcast() {
        let hub = ChannelHub::new(&crate::config::Config::default());
        assert_eq!(hub.get(chan::ACQUIRE), Some(Value::Int(0)));
        assert_eq!(hub.get("bogus"), None);
        let mut rx = hub.subscribe();
        hub.set(chan::COUNT, Value::Int(9));
        let upd = rx.try_recv().unwrap();
        assert_eq!(upd.channel, chan::COUNT);
        assert_eq!(upd.value, Value::Int(9));
        assert!(upd.alarm.is_none());
        hub.alarm(chan::ACQUIRE, "boom");
        let upd = rx.try_recv().unwrap();
        assert_eq!(upd.alarm.as_deref(), Some("boom"));
    }

    async fn server_with_sim() -> Result<(Arc<Server>, sim::SharedRegisters)> {
        let (regs, endpoint, _start) = sim::spawn_register_server().await?;
        let control = Arc::new(ControlClient::connect(&endpoint).await?);
        let hub = ChannelHub::new(&crate::config::Config::default());
        let (acq_tx, _acq_rx) = tokio::sync::mpsc::channel(8);
        Ok((
            Arc::new(Server {
                hub,
                control,
                acq_tx,
            }),
            regs,
        ))
    }

    #[tokio::test]
    async fn frametime_write_programs_register() -> Result<()> {
        let (server, regs) = server_with_sim().await?;
        server
            .handle_write(chan::FRAMETIME, Value::Double(2.5))
            .await?;
        assert_eq!(regs.lock().unwrap().get(&FRAMETIME_REG), Some(&2_500_000));
        assert_eq!(
            server.handle_read(chan::FRAMETIME).await?,
            Value::Double(2.5)
        );
        Ok(())
    }

    #[tokio::test]
    async fn frametime_bounds_rejected_without_side_effects() -> Result<()> {
        let (server, regs) = server_with_sim().await?;
        server
            .handle_write(chan::FRAMETIME, Value::Double(2.5))
            .await?;
        let err = server
            .handle_write(chan::FRAMETIME, Value::Double(-1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bounds(_)));
        // Channel and register both keep the previous value.
        assert_eq!(server.hub.get(chan::FRAMETIME), Some(Value::Double(2.5)));
        assert_eq!(regs.lock().unwrap().get(&FRAMETIME_REG), Some(&2_500_000));
        let err = server
            .handle_write(chan::FRAMETIME, Value::Double(5e6))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bounds(_)));
        Ok(())
    }

    #[tokio::test]
    async fn read_only_and_unknown_channels() -> Result<()> {
        let (server, _regs) = server_with_sim().await?;
        assert!(matches!(
            server.handle_write(chan::COUNT, Value::Int(3)).await,
            Err(Error::Bounds(_))
        ));
        assert!(matches!(
            server.handle_write("nonsense", Value::Int(3)).await,
            Err(Error::Bounds(_))
        ));
        assert!(matches!(
            server.handle_write(chan::ACQUIRE, Value::Int(7)).await,
            Err(Error::Bounds(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn string_channels_accept_strings_only() -> Result<()> {
        let (server, _regs) = server_with_sim().await?;
        server
            .handle_write(chan::FILEPATH, Value::Str("/data/germ".into()))
            .await?;
        assert_eq!(
            server.hub.get(chan::FILEPATH),
            Some(Value::Str("/data/germ".into()))
        );
        assert!(matches!(
            server.handle_write(chan::FILEPATH, Value::Int(3)).await,
            Err(Error::Bounds(_))
        ));
        Ok(())
    }
}
