/*! GeRM event codec.

One event is two 32-bit words:

```text
word A:  "0" [4 bit chip] [5 bit chan] [10 bit TD] [12 bit PD]
word B:  "1" [31 bit coarse timestamp]
```

The concatenation `(A << 32) | B` is the canonical 64-bit record, but
everything in this crate works on the u32 pair form, since that is what
both transports carry. The stream is big-endian on the UDP/raw-file
path and native order on the ZMQ path, so the byte-level entry points
take an explicit [`Endian`].

The coarse timestamp is a free-running counter at a 40 ns tick and
wraps; [`reconstruct_time`] undoes the wrap into a monotonic u64 tick
count.
*/
use crate::{Error, Result};

/// Tag bit distinguishing word B from word A.
const WORD_B_TAG: u32 = 1 << 31;

const CHIP_MASK: u32 = 0xf;
const CHAN_MASK: u32 = 0x1f;
const TD_MASK: u32 = 0x3ff;
const PD_MASK: u32 = 0xfff;
const TS_MASK: u32 = 0x7fff_ffff;

/// Coarse timestamp tick.
pub const TICK: std::time::Duration = std::time::Duration::from_nanos(40);

/// One decoded event, as `(chip, chan, td, pd, ts)`.
pub type Event = (u8, u8, u16, u16, u32);

/// Byte order of an encoded event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// UDP datagrams and raw frame files.
    Big,
    /// ZMQ payloads, published as platform-width words.
    Native,
}

/// Column-major event storage. All five columns always have the same
/// length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventColumns {
    /// Chip address, 0..=15.
    pub chip: Vec<u8>,
    /// Channel address, 0..=31.
    pub chan: Vec<u8>,
    /// Fine timestamp, 0..=1023.
    pub td: Vec<u16>,
    /// Energy reading, 0..=4095.
    pub pd: Vec<u16>,
    /// Coarse timestamp, 31 bits.
    pub ts: Vec<u32>,
}

impl EventColumns {
    /// Number of events held.
    pub fn len(&self) -> usize {
        self.chip.len()
    }

    /// True if no events are held.
    pub fn is_empty(&self) -> bool {
        self.chip.is_empty()
    }

    /// Append one event.
    pub fn push(&mut self, ev: Event) {
        let (chip, chan, td, pd, ts) = ev;
        self.chip.push(chip);
        self.chan.push(chan);
        self.td.push(td);
        self.pd.push(pd);
        self.ts.push(ts);
    }

    /// Event at index `i`.
    pub fn event(&self, i: usize) -> Event {
        (self.chip[i], self.chan[i], self.td[i], self.pd[i], self.ts[i])
    }

    /// Build columns from a slice of events.
    pub fn from_events(events: &[Event]) -> Self {
        let mut cols = Self::default();
        for ev in events {
            cols.push(*ev);
        }
        cols
    }

    /// Append all events from `other`.
    pub fn extend_from(&mut self, other: &EventColumns) {
        self.chip.extend_from_slice(&other.chip);
        self.chan.extend_from_slice(&other.chan);
        self.td.extend_from_slice(&other.td);
        self.pd.extend_from_slice(&other.pd);
        self.ts.extend_from_slice(&other.ts);
    }

    /// Reorder every column by `perm`, where `perm[i]` is the source
    /// index of output row `i`.
    pub fn reorder(&self, perm: &[usize]) -> EventColumns {
        let mut out = EventColumns::default();
        for &i in perm {
            out.push(self.event(i));
        }
        out
    }

    /// One column widened to u32, by its persisted dataset name.
    pub fn column(&self, name: &str) -> Option<Vec<u32>> {
        Some(match name {
            "chip" => self.chip.iter().map(|&v| v as u32).collect(),
            "chan" => self.chan.iter().map(|&v| v as u32).collect(),
            "timestamp_fine" => self.td.iter().map(|&v| v as u32).collect(),
            "energy" => self.pd.iter().map(|&v| v as u32).collect(),
            "timestamp_coarse" => self.ts.clone(),
            _ => return None,
        })
    }
}

/// Persisted dataset names, in canonical column order.
pub const COLUMN_NAMES: [&str; 5] =
    ["chip", "chan", "timestamp_fine", "energy", "timestamp_coarse"];

/// Decode a word stream into columns.
///
/// The word count must be even and the `0`/`1` tag bits must
/// alternate; anything else is a [`Error::Protocol`]. Word layouts
/// from older firmware (`"1000"` tag plus 28-bit timestamp, u64-packed
/// records) fail the tag check here and are deliberately not
/// accepted.
pub fn decode_words(words: &[u32]) -> Result<EventColumns> {
    if !words.len().is_multiple_of(2) {
        return Err(Error::Protocol(format!(
            "odd event word count {}",
            words.len()
        )));
    }
    let mut cols = EventColumns::default();
    cols.chip.reserve(words.len() / 2);
    for pair in words.chunks_exact(2) {
        let (a, b) = (pair[0], pair[1]);
        if a & WORD_B_TAG != 0 {
            return Err(Error::Protocol(format!(
                "word A has tag bit set: {a:#010x}"
            )));
        }
        if b & WORD_B_TAG == 0 {
            return Err(Error::Protocol(format!(
                "word B missing tag bit: {b:#010x}"
            )));
        }
        cols.push((
            ((a >> 27) & CHIP_MASK) as u8,
            ((a >> 22) & CHAN_MASK) as u8,
            ((a >> 12) & TD_MASK) as u16,
            (a & PD_MASK) as u16,
            b & TS_MASK,
        ));
    }
    Ok(cols)
}

/// Encode columns back into the two-word stream. Exact inverse of
/// [`decode_words`] for in-range columns; out-of-range values are
/// masked the way the firmware would truncate them.
pub fn encode_words(cols: &EventColumns) -> Vec<u32> {
    let mut words = Vec::with_capacity(cols.len() * 2);
    for (&chip, &chan, &td, &pd, &ts) in
        itertools::izip!(&cols.chip, &cols.chan, &cols.td, &cols.pd, &cols.ts)
    {
        words.push(
            ((chip as u32 & CHIP_MASK) << 27)
                | ((chan as u32 & CHAN_MASK) << 22)
                | ((td as u32 & TD_MASK) << 12)
                | (pd as u32 & PD_MASK),
        );
        words.push(WORD_B_TAG | (ts & TS_MASK));
    }
    words
}

/// Decode a byte buffer of event words in the given byte order.
pub fn decode_bytes(buf: &[u8], endian: Endian) -> Result<EventColumns> {
    if !buf.len().is_multiple_of(4) {
        return Err(Error::Protocol(format!(
            "event payload of {} bytes is not word aligned",
            buf.len()
        )));
    }
    let words: Vec<u32> = buf
        .chunks_exact(4)
        .map(|c| {
            let c = c.try_into().unwrap();
            match endian {
                Endian::Big => u32::from_be_bytes(c),
                Endian::Native => u32::from_ne_bytes(c),
            }
        })
        .collect();
    decode_words(&words)
}

/// Encode columns to bytes in the given byte order.
pub fn encode_bytes(cols: &EventColumns, endian: Endian) -> Vec<u8> {
    let words = encode_words(cols);
    let mut buf = Vec::with_capacity(words.len() * 4);
    for w in words {
        match endian {
            Endian::Big => buf.extend_from_slice(&w.to_be_bytes()),
            Endian::Native => buf.extend_from_slice(&w.to_ne_bytes()),
        }
    }
    buf
}

/// Wrap-detection parameters for [`reconstruct_time`].
#[derive(Debug, Clone)]
pub struct TimeParams {
    /// Minimum magnitude of a tick difference treated as a wrap, not
    /// local reordering. Local reordering is on the order of a dozen
    /// ticks; the default leaves five orders of magnitude of headroom.
    pub thresh: i64,
    /// Wrap modulus of the coarse timestamp counter. The canonical
    /// stream carries a 31-bit counter; 29-bit firmware variants can
    /// set `1 << 29` here.
    pub jump: u64,
}

impl Default for TimeParams {
    fn default() -> Self {
        Self {
            thresh: 1 << 26,
            jump: 1 << 31,
        }
    }
}

/// Resumable state for chunked [`reconstruct_time`] calls: the last
/// reconstructed tick and the accumulated wrap bias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeState {
    /// Last reconstructed tick, in input order.
    pub last: u64,
    /// Accumulated bias, a multiple of the wrap modulus.
    pub bias: u64,
}

/// Undo coarse-timestamp wraparound, producing monotonic u64 ticks.
///
/// The output is aligned with the input (no sorting is applied here;
/// use [`argsort_by_time`] to order full event columns by the result).
/// A difference below `-thresh` is a wrap and adds `jump` to the
/// running bias; a difference above `+thresh` is a reordered event
/// from before the wrap and removes it once. Reorderings smaller than
/// `thresh` pass through untouched.
///
/// Pass the returned [`TimeState`] back in to process a stream in
/// chunks. One chunk must span less time than `jump` ticks (about
/// 85 s for the 31-bit counter); a chunk that does not is
/// indistinguishable from a double wrap and fails with
/// [`Error::Protocol`].
pub fn reconstruct_time(
    ts: &[u32],
    state: Option<TimeState>,
    params: &TimeParams,
) -> Result<(Vec<u64>, TimeState)> {
    let mut bias = state.map_or(0, |s| s.bias);
    let mut prev_raw: Option<u32> = state.map(|s| (s.last - s.bias) as u32);
    let mut out = Vec::with_capacity(ts.len());
    for &t in ts {
        if let Some(p) = prev_raw {
            let diff = t as i64 - p as i64;
            if diff < -params.thresh {
                bias += params.jump;
            } else if diff > params.thresh {
                if bias >= params.jump {
                    bias -= params.jump;
                } else {
                    // A forward leap with no wrap to rewind. Real
                    // streams produce this only on multi-second dead
                    // time, so keep the samples as they are.
                    log::warn!(
                        "time reconstruction: +{diff} tick leap with no prior wrap"
                    );
                }
            }
        }
        out.push(t as u64 + bias);
        prev_raw = Some(t);
    }
    if let (Some(&lo), Some(&hi)) = (out.iter().min(), out.iter().max()) {
        if hi - lo >= params.jump {
            return Err(Error::Protocol(format!(
                "chunk spans {} ticks, at least one full wrap of {}; \
                 shrink the chunk below the wrap period",
                hi - lo,
                params.jump
            )));
        }
    }
    let state = TimeState {
        last: out.last().copied().unwrap_or_else(|| {
            state.map_or(0, |s| s.last)
        }),
        bias,
    };
    Ok((out, state))
}

/// Stable argsort of a reconstructed time column. `result[i]` is the
/// input index of the event that belongs at output row `i`.
pub fn argsort_by_time(ts64: &[u64]) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..ts64.len()).collect();
    perm.sort_by_key(|&i| ts64[i]);
    perm
}
