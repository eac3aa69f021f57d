//! Daemon configuration.
//!
//! Everything has a workable default; a JSON config file and the CLI
//! flags override. Ports follow the detector firmware: 5555 control,
//! 5556 data, 5557 collector handshake.
use std::path::PathBuf;

use serde::Deserialize;

use crate::Result;
use crate::sink::SinkFormat;

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Detector host name or address.
    pub detector_host: String,
    /// Detector register socket port.
    pub control_port: u16,
    /// Detector event publisher port.
    pub data_port: u16,
    /// UDP collector host, when running the high-speed path.
    pub collector_host: Option<String>,
    /// Collector handshake socket port.
    pub collector_port: u16,
    /// UDP port the collector receives event datagrams on.
    pub collector_data_port: u16,
    /// Control-plane listen address.
    pub listen: String,
    /// Frame file backend.
    pub sink: SinkFormat,
    /// Asset registry file.
    pub registry_path: PathBuf,
    /// Event cap before a frame is declared desynchronized.
    pub max_events: Option<usize>,
    /// Register reply deadline, milliseconds.
    pub control_timeout_ms: u64,
    /// Slack added to the frame time when waiting for completion,
    /// seconds.
    pub collect_slack_secs: f64,
    /// Initial `filepath` channel value: output directory, absolute or
    /// relative to `write_root`.
    pub filepath: String,
    /// Initial `write_root` channel value.
    pub write_root: String,
    /// Initial `read_root` channel value.
    pub read_root: String,
    /// Initial `src_mount` channel value (collector's view of the
    /// data filesystem).
    pub src_mount: String,
    /// Initial `dest_mount` channel value (this daemon's view of the
    /// same filesystem).
    pub dest_mount: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detector_host: "localhost".into(),
            control_port: 5555,
            data_port: 5556,
            collector_host: None,
            collector_port: 5557,
            collector_data_port: 5558,
            listen: "0.0.0.0:5064".into(),
            sink: SinkFormat::Raw,
            registry_path: "germ-registry.jsonl".into(),
            max_events: None,
            control_timeout_ms: 1000,
            collect_slack_secs: 5.0,
            filepath: "/tmp/test".into(),
            write_root: "/".into(),
            read_root: "/".into(),
            src_mount: "/".into(),
            dest_mount: "/".into(),
        }
    }
}

impl Config {
    /// Load from a JSON file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        let cfg: Config = serde_json::from_reader(std::io::BufReader::new(f))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        #[cfg(not(feature = "hdf5"))]
        if self.sink == SinkFormat::Hdf5 {
            return Err(crate::Error::Config(
                "sink \"hdf5\" requires building with the hdf5 feature".into(),
            ));
        }
        if self.collect_slack_secs < 0.0 {
            return Err(crate::Error::Config(
                "collect_slack_secs must be >= 0".into(),
            ));
        }
        Ok(())
    }

    /// Detector register endpoint.
    pub fn control_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.detector_host, self.control_port)
    }

    /// Detector event publisher endpoint.
    pub fn data_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.detector_host, self.data_port)
    }

    /// Collector handshake endpoint, when configured.
    pub fn collector_endpoint(&self) -> Option<String> {
        self.collector_host
            .as_ref()
            .map(|h| format!("tcp://{}:{}", h, self.collector_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_and_endpoints() {
        let cfg = Config::default();
        assert_eq!(cfg.control_endpoint(), "tcp://localhost:5555");
        assert_eq!(cfg.data_endpoint(), "tcp://localhost:5556");
        assert!(cfg.collector_endpoint().is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_overrides() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("germ.json");
        let mut f = std::fs::File::create(&path)?;
        writeln!(
            f,
            r#"{{"detector_host": "10.0.0.7", "collector_host": "10.0.0.8",
                 "max_events": 1000000, "sink": "raw"}}"#
        )?;
        let cfg = Config::load(&path)?;
        assert_eq!(cfg.control_endpoint(), "tcp://10.0.0.7:5555");
        assert_eq!(
            cfg.collector_endpoint().as_deref(),
            Some("tcp://10.0.0.8:5557")
        );
        assert_eq!(cfg.max_events, Some(1000000));
        Ok(())
    }

    #[test]
    fn unknown_keys_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("germ.json");
        std::fs::write(&path, r#"{"detector": "oops"}"#)?;
        assert!(Config::load(&path).is_err());
        Ok(())
    }
}
