/*! Per-frame file sink.

Two backends:

* **Raw**: the byte-exact UDP reassembly stream. Big-endian u32 words:
  `0xFEEDFACE ‖ frame_num ‖ event word pairs ‖ overflow ‖ 0xDECAFBAD`.
* **Hdf5** (feature `hdf5`): a group `GeRM` of five equal-length
  datasets, one per column. Gated because it needs the system HDF5
  library.

Each frame gets a freshly generated `{dir}/{uuid}.{ext}` path, opened
create-exclusive, and is fsynced before the registry hears about it.
*/
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::frame::FrameBuffer;
use crate::{Error, Result, event};

/// First word of a raw frame file.
pub const OPEN_SENTINEL: u32 = 0xFEEDFACE;
/// Last word of a raw frame file.
pub const CLOSE_SENTINEL: u32 = 0xDECAFBAD;

/// Frame file backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkFormat {
    /// Raw sentinel-delimited word stream, `.bin`.
    Raw,
    /// HDF5 group of five columns, `.h5`.
    Hdf5,
}

impl SinkFormat {
    /// File extension for the backend.
    pub fn extension(&self) -> &'static str {
        match self {
            SinkFormat::Raw => "bin",
            SinkFormat::Hdf5 => "h5",
        }
    }

    /// Asset registry spec tag for files written by this backend.
    pub fn spec(&self) -> &'static str {
        match self {
            SinkFormat::Raw => "BinaryGeRM",
            SinkFormat::Hdf5 => "GeRM",
        }
    }
}

/// Serialize a frame into the raw file layout.
pub fn raw_frame_bytes(frame: &FrameBuffer) -> Vec<u8> {
    let events = event::encode_bytes(&frame.columns, event::Endian::Big);
    let mut buf = Vec::with_capacity(16 + events.len());
    buf.extend_from_slice(&OPEN_SENTINEL.to_be_bytes());
    buf.extend_from_slice(&frame.frame_num.unwrap_or(0).to_be_bytes());
    buf.extend_from_slice(&events);
    buf.extend_from_slice(&frame.overfill.to_be_bytes());
    buf.extend_from_slice(&CLOSE_SENTINEL.to_be_bytes());
    buf
}

/// Writes one file per committed frame.
#[derive(Debug, Clone)]
pub struct FileSink {
    /// Output directory; created if missing.
    pub dir: PathBuf,
    /// Selected backend.
    pub format: SinkFormat,
}

impl FileSink {
    /// Write `frame` to a fresh `{dir}/{uuid}.{ext}` path and fsync.
    pub fn write_frame(&self, frame: &FrameBuffer) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let name = format!("{}.{}", uuid::Uuid::new_v4(), self.format.extension());
        let path = self.dir.join(name);
        self.write_frame_at(frame, &path)?;
        Ok(path)
    }

    /// Write `frame` to an exact path. Collision fails; fresh names
    /// come from [`FileSink::write_frame`].
    pub fn write_frame_at(&self, frame: &FrameBuffer, path: &Path) -> Result<()> {
        debug!(
            "FileSink: writing {} events to {}",
            frame.len(),
            path.display()
        );
        match self.format {
            SinkFormat::Raw => write_raw(frame, path),
            #[cfg(feature = "hdf5")]
            SinkFormat::Hdf5 => write_hdf5(frame, path),
            #[cfg(not(feature = "hdf5"))]
            SinkFormat::Hdf5 => Err(Error::Config(
                "hdf5 sink selected but the hdf5 feature is not built".into(),
            )),
        }
    }
}

fn create_excl(path: &Path) -> Result<std::fs::File> {
    std::fs::File::options()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::FileExists(path.to_path_buf())
            } else {
                e.into()
            }
        })
}

fn write_raw(frame: &FrameBuffer, path: &Path) -> Result<()> {
    let f = create_excl(path)?;
    let mut w = std::io::BufWriter::new(f);
    w.write_all(&raw_frame_bytes(frame))?;
    w.flush()?;
    w.get_ref().sync_all()?;
    Ok(())
}

#[cfg(feature = "hdf5")]
fn write_hdf5(frame: &FrameBuffer, path: &Path) -> Result<()> {
    if path.exists() {
        return Err(Error::FileExists(path.to_path_buf()));
    }
    let file = hdf5::File::create_excl(path)?;
    let g = file.create_group("GeRM")?;
    let cols = &frame.columns;
    g.new_dataset_builder().with_data(&cols.chip).create("chip")?;
    g.new_dataset_builder().with_data(&cols.chan).create("chan")?;
    g.new_dataset_builder()
        .with_data(&cols.td)
        .create("timestamp_fine")?;
    g.new_dataset_builder().with_data(&cols.pd).create("energy")?;
    g.new_dataset_builder()
        .with_data(&cols.ts)
        .create("timestamp_coarse")?;
    file.flush()?;
    Ok(())
}
