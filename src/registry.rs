/*! Asset registry.

Every committed frame becomes one *resource* row (which file, what
format, where it lives) plus five *datum* rows (one per column). The
datum identifiers are what the control plane publishes; a downstream
reader resolves one back to a column of numbers without knowing
anything about the acquisition.

The store is a JSON-lines file, one row per line, append-only, fsynced
before identifiers are handed out.
*/
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::{self, EventColumns};
use crate::sink::{CLOSE_SENTINEL, OPEN_SENTINEL};
use crate::{Error, Result};

/// A resource row: one committed file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRow {
    /// Row discriminator, `"resource"`.
    pub row: String,
    /// Resource identifier.
    pub uid: String,
    /// Format tag: `"GeRM"` (HDF5) or `"BinaryGeRM"` (raw).
    pub spec: String,
    /// Reader-side root the relative path hangs off.
    pub root: String,
    /// Path relative to `root`.
    pub resource_path: String,
    /// Free-form kwargs; empty for this detector.
    pub resource_kwargs: serde_json::Map<String, serde_json::Value>,
    /// Checksum of the committed file, when it was reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// A datum row: one column of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatumRow {
    /// Row discriminator, `"datum"`.
    pub row: String,
    /// Datum identifier, the value published on the `UUID:*` channels.
    pub datum_id: String,
    /// Owning resource uid.
    pub resource: String,
    /// Which column this datum resolves to.
    pub datum_kwargs: DatumKwargs,
}

/// Datum kwargs; only the column name for this detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatumKwargs {
    /// Persisted dataset name.
    pub column: String,
}

/// Where committed frames get registered.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Insert a resource, returning its uid.
    async fn insert_resource(
        &self,
        spec: &str,
        root: &str,
        resource_path: &str,
        sha256: Option<String>,
    ) -> Result<String>;

    /// Insert a datum for `column` of an existing resource, returning
    /// the datum identifier.
    async fn insert_datum(&self, resource_uid: &str, column: &str) -> Result<String>;
}

/// JSON-lines file registry.
pub struct JsonlRegistry {
    path: PathBuf,
    file: std::sync::Mutex<std::fs::File>,
}

impl JsonlRegistry {
    /// Open (append) or create the registry file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::options()
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: std::sync::Mutex::new(file),
        })
    }

    /// Registry file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: String) -> Result<()> {
        let mut f = self.file.lock().unwrap();
        writeln!(f, "{line}")?;
        f.sync_all()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Registry for JsonlRegistry {
    async fn insert_resource(
        &self,
        spec: &str,
        root: &str,
        resource_path: &str,
        sha256: Option<String>,
    ) -> Result<String> {
        let uid = uuid::Uuid::new_v4().to_string();
        let row = ResourceRow {
            row: "resource".into(),
            uid: uid.clone(),
            spec: spec.into(),
            root: root.into(),
            resource_path: resource_path.into(),
            resource_kwargs: serde_json::Map::new(),
            sha256,
        };
        debug!("JsonlRegistry: resource {uid} ({spec}) {root} / {resource_path}");
        self.append(serde_json::to_string(&row)?)?;
        Ok(uid)
    }

    async fn insert_datum(&self, resource_uid: &str, column: &str) -> Result<String> {
        let datum_id = uuid::Uuid::new_v4().to_string();
        let row = DatumRow {
            row: "datum".into(),
            datum_id: datum_id.clone(),
            resource: resource_uid.into(),
            datum_kwargs: DatumKwargs {
                column: column.into(),
            },
        };
        self.append(serde_json::to_string(&row)?)?;
        Ok(datum_id)
    }
}

/// Checksum of a committed file, hex encoded.
pub fn file_sha256(path: &Path) -> Result<String> {
    let data = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Read-side index over a registry file.
pub struct RegistryIndex {
    resources: HashMap<String, ResourceRow>,
    datums: HashMap<String, DatumRow>,
}

/// A resolved datum: which file, which format, which column.
#[derive(Debug, Clone)]
pub struct DatumRef {
    /// Format tag of the owning resource.
    pub spec: String,
    /// Full path of the resource file.
    pub path: PathBuf,
    /// Column to serve.
    pub column: String,
}

impl RegistryIndex {
    /// Load every row of a registry file.
    pub fn load(path: &Path) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        let mut resources = HashMap::new();
        let mut datums = HashMap::new();
        for line in std::io::BufReader::new(f).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // Rows are self-describing via the "row" field.
            let v: serde_json::Value = serde_json::from_str(&line)?;
            match v.get("row").and_then(|r| r.as_str()) {
                Some("resource") => {
                    let row: ResourceRow = serde_json::from_value(v)?;
                    resources.insert(row.uid.clone(), row);
                }
                Some("datum") => {
                    let row: DatumRow = serde_json::from_value(v)?;
                    datums.insert(row.datum_id.clone(), row);
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "registry row kind {other:?}"
                    )));
                }
            }
        }
        Ok(Self { resources, datums })
    }

    /// Resolve a datum identifier to its file and column.
    pub fn resolve(&self, datum_id: &str) -> Option<DatumRef> {
        let datum = self.datums.get(datum_id)?;
        let res = self.resources.get(&datum.resource)?;
        Some(DatumRef {
            spec: res.spec.clone(),
            path: Path::new(&res.root).join(&res.resource_path),
            column: datum.datum_kwargs.column.clone(),
        })
    }

    /// Resolve and materialize one column, dispatching on the
    /// resource spec.
    pub fn fetch(&self, datum_id: &str) -> Result<Vec<u32>> {
        let datum = self.resolve(datum_id).ok_or_else(|| {
            Error::Protocol(format!("unknown datum {datum_id:?}"))
        })?;
        match datum.spec.as_str() {
            "BinaryGeRM" => BinaryGermReader::open(&datum.path)?.column(&datum.column),
            #[cfg(feature = "hdf5")]
            "GeRM" => GermReader::open(&datum.path)?.column(&datum.column),
            other => Err(Error::Protocol(format!(
                "no reader for resource spec {other:?}"
            ))),
        }
    }
}

/// Reader for raw sentinel-delimited frame files.
///
/// Both sentinels are validated before anything is decoded, so a
/// truncated or corrupt file never produces partial columns.
pub struct BinaryGermReader {
    cols: EventColumns,
    /// Frame number from the file header.
    pub frame_num: u32,
    /// Overflow count from the file trailer.
    pub overflow: u32,
}

impl BinaryGermReader {
    /// Open and fully decode a raw frame file.
    pub fn open(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        if !data.len().is_multiple_of(4) || data.len() < 16 {
            return Err(Error::Protocol(format!(
                "raw frame file of {} bytes",
                data.len()
            )));
        }
        let word = |i: usize| {
            u32::from_be_bytes(data[i * 4..i * 4 + 4].try_into().unwrap())
        };
        let nwords = data.len() / 4;
        if word(0) != OPEN_SENTINEL {
            return Err(Error::Protocol(format!(
                "first word is {:#010x}, want {OPEN_SENTINEL:#010x}",
                word(0)
            )));
        }
        if word(nwords - 1) != CLOSE_SENTINEL {
            return Err(Error::Protocol(format!(
                "last word is {:#010x}, want {CLOSE_SENTINEL:#010x}",
                word(nwords - 1)
            )));
        }
        let cols =
            event::decode_bytes(&data[8..data.len() - 8], event::Endian::Big)?;
        Ok(Self {
            cols,
            frame_num: word(1),
            overflow: word(nwords - 2),
        })
    }

    /// Event count.
    pub fn len(&self) -> usize {
        self.cols.len()
    }

    /// True when the frame holds no events.
    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    /// One column, widened to u32.
    pub fn column(&self, name: &str) -> Result<Vec<u32>> {
        self.cols
            .column(name)
            .ok_or_else(|| Error::Protocol(format!("no column {name:?}")))
    }

    /// All five columns.
    pub fn columns(&self) -> &EventColumns {
        &self.cols
    }
}

/// Reader for HDF5 frame files.
#[cfg(feature = "hdf5")]
pub struct GermReader {
    group: hdf5::Group,
}

#[cfg(feature = "hdf5")]
impl GermReader {
    /// Open the `GeRM` group of a structured frame file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = hdf5::File::open(path)?;
        Ok(Self {
            group: file.group("GeRM")?,
        })
    }

    /// One column, widened to u32.
    pub fn column(&self, name: &str) -> Result<Vec<u32>> {
        let ds = self.group.dataset(name)?;
        Ok(match name {
            "chip" | "chan" => ds
                .read_raw::<u8>()?
                .into_iter()
                .map(|v| v as u32)
                .collect(),
            "timestamp_fine" | "energy" => ds
                .read_raw::<u16>()?
                .into_iter()
                .map(|v| v as u32)
                .collect(),
            _ => ds.read_raw::<u32>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventColumns;
    use crate::frame::FrameBuffer;
    use crate::sink::raw_frame_bytes;

    #[tokio::test]
    async fn rows_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("registry.jsonl");
        let reg = JsonlRegistry::open(&path)?;
        let uid = reg
            .insert_resource("BinaryGeRM", "/data", "frames/a.bin", None)
            .await?;
        let d1 = reg.insert_datum(&uid, "chip").await?;
        let d2 = reg.insert_datum(&uid, "timestamp_coarse").await?;
        assert_ne!(d1, d2);

        let index = RegistryIndex::load(&path)?;
        let r = index.resolve(&d1).unwrap();
        assert_eq!(r.spec, "BinaryGeRM");
        assert_eq!(r.path, Path::new("/data/frames/a.bin"));
        assert_eq!(r.column, "chip");
        assert_eq!(index.resolve(&d2).unwrap().column, "timestamp_coarse");
        assert!(index.resolve("nope").is_none());
        Ok(())
    }

    fn write_raw_frame(dir: &Path) -> Result<PathBuf> {
        let mut frame = FrameBuffer::default();
        frame.append_bunch(&EventColumns::from_events(&[
            (3, 17, 500, 2048, 1_000_000),
            (4, 18, 501, 2049, 1_000_010),
        ]));
        frame.frame_num = Some(8);
        frame.overfill = 5;
        let path = dir.join("frame.bin");
        std::fs::write(&path, raw_frame_bytes(&frame))?;
        Ok(path)
    }

    #[test]
    fn binary_reader_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_raw_frame(dir.path())?;
        let rd = BinaryGermReader::open(&path)?;
        assert_eq!(rd.len(), 2);
        assert_eq!(rd.frame_num, 8);
        assert_eq!(rd.overflow, 5);
        assert_eq!(rd.column("chip")?, vec![3, 4]);
        assert_eq!(rd.column("energy")?, vec![2048, 2049]);
        assert_eq!(rd.column("timestamp_coarse")?, vec![1_000_000, 1_000_010]);
        assert!(rd.column("germ_pd").is_err());
        Ok(())
    }

    #[test]
    fn missing_sentinels_fail_loudly() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_raw_frame(dir.path())?;
        let good = std::fs::read(&path)?;

        // Clobbered header.
        let mut bad = good.clone();
        bad[0..4].copy_from_slice(&0u32.to_be_bytes());
        let p = dir.path().join("bad-head.bin");
        std::fs::write(&p, &bad)?;
        assert!(matches!(
            BinaryGermReader::open(&p),
            Err(Error::Protocol(_))
        ));

        // Truncated trailer.
        let p = dir.path().join("bad-tail.bin");
        std::fs::write(&p, &good[..good.len() - 4])?;
        assert!(matches!(
            BinaryGermReader::open(&p),
            Err(Error::Protocol(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn fetch_dispatches_to_binary_reader() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let frame_path = write_raw_frame(dir.path())?;
        let reg_path = dir.path().join("registry.jsonl");
        let reg = JsonlRegistry::open(&reg_path)?;
        let sha = file_sha256(&frame_path)?;
        let uid = reg
            .insert_resource(
                "BinaryGeRM",
                &dir.path().to_string_lossy(),
                "frame.bin",
                Some(sha),
            )
            .await?;
        let datum = reg.insert_datum(&uid, "energy").await?;
        let index = RegistryIndex::load(&reg_path)?;
        assert_eq!(index.fetch(&datum)?, vec![2048, 2049]);
        Ok(())
    }
}
