/*! ZMQ data ingester.

Subscribes to the detector's `"data"` and `"meta"` topics and fills
the frame buffer while an acquisition is live. Outside an acquisition
the socket is still drained (messages are received and dropped) so
the subscription never accumulates back-pressure.

The controller flips `collecting` on (after clearing the buffer) and
waits on the completion condition; the ingester flips it off and
signals when the frame meta arrives, or when the event cap is crossed
and the frame is declared desynchronized.

Decode problems never escape this task: they mark the frame degraded
and the loop keeps going.
*/
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, trace, warn};
use zeromq::{Socket, SocketRecv, ZmqMessage};

use crate::frame::FrameBuffer;
use crate::{Result, event};

/// Data topic.
pub const TOPIC_DATA: &[u8] = b"data";
/// End-of-frame topic.
pub const TOPIC_META: &[u8] = b"meta";

/// State shared between the controller and the ingester task.
pub struct IngestShared {
    collecting: AtomicBool,
    frame: std::sync::Mutex<FrameBuffer>,
    /// Signaled exactly once per completed (or desynchronized) frame.
    pub done: tokio::sync::Notify,
    max_events: Option<usize>,
}

impl IngestShared {
    /// New shared state with an optional event cap.
    pub fn new(max_events: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            collecting: AtomicBool::new(false),
            frame: std::sync::Mutex::new(FrameBuffer::default()),
            done: tokio::sync::Notify::new(),
            max_events,
        })
    }

    /// Clear the buffer and start collecting. Controller only.
    pub fn begin(&self) {
        self.frame.lock().unwrap().clear();
        self.collecting.store(true, Ordering::SeqCst);
    }

    /// Stop collecting without completion (cancellation or timeout).
    pub fn abort(&self) {
        self.collecting.store(false, Ordering::SeqCst);
    }

    /// True while a frame is being collected.
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    /// Take the collected frame, leaving an empty buffer.
    pub fn take(&self) -> FrameBuffer {
        std::mem::take(&mut *self.frame.lock().unwrap())
    }

    /// The configured event cap.
    pub fn max_events(&self) -> Option<usize> {
        self.max_events
    }

    fn finish(&self) {
        self.collecting.store(false, Ordering::SeqCst);
        self.done.notify_one();
    }
}

/// The ingester task.
pub struct ZmqIngester {
    sub: zeromq::SubSocket,
    shared: Arc<IngestShared>,
}

impl ZmqIngester {
    /// Connect and subscribe to both topics.
    pub async fn connect(endpoint: &str, shared: Arc<IngestShared>) -> Result<Self> {
        debug!("ZmqIngester: connecting to {endpoint}");
        let mut sub = zeromq::SubSocket::new();
        sub.connect(endpoint).await?;
        sub.subscribe("data").await?;
        sub.subscribe("meta").await?;
        Ok(Self { sub, shared })
    }

    /// Receive loop. Only returns on socket failure.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let msg = self.sub.recv().await?;
            self.handle(msg);
        }
    }

    fn handle(&self, msg: ZmqMessage) {
        if !self.shared.is_collecting() {
            trace!("ZmqIngester: idle, dropping message");
            return;
        }
        let (Some(topic), Some(payload)) = (msg.get(0), msg.get(1)) else {
            warn!("ZmqIngester: multipart message with {} frames", msg.len());
            self.shared.frame.lock().unwrap().degraded = true;
            return;
        };
        let topic: &[u8] = topic.as_ref();
        if topic == TOPIC_DATA {
            self.handle_data(payload);
        } else if topic == TOPIC_META {
            self.handle_meta(payload);
        } else {
            warn!(
                "ZmqIngester: unexpected topic {:?}",
                String::from_utf8_lossy(topic)
            );
        }
    }

    fn handle_data(&self, payload: &[u8]) {
        // The publisher sends platform-width words.
        let bunch = match event::decode_bytes(payload, event::Endian::Native) {
            Ok(b) => b,
            Err(e) => {
                warn!("ZmqIngester: undecodable bunch: {e}");
                self.shared.frame.lock().unwrap().degraded = true;
                return;
            }
        };
        let mut frame = self.shared.frame.lock().unwrap();
        frame.append_bunch(&bunch);
        trace!(
            "ZmqIngester: bunch of {}, frame at {}",
            bunch.len(),
            frame.len()
        );
        if let Some(cap) = self.shared.max_events {
            if frame.len() > cap {
                // Out of sync with the detector's frame marker. Keep
                // what arrived, but the frame number is meaningless.
                info!(
                    "ZmqIngester: {} events exceed cap {cap}, desynchronized",
                    frame.len()
                );
                frame.frame_num = None;
                frame.degraded = true;
                drop(frame);
                self.shared.finish();
            }
        }
    }

    fn handle_meta(&self, payload: &[u8]) {
        let mut frame = self.shared.frame.lock().unwrap();
        if payload.len() == 8 {
            let num = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
            let overfill = u32::from_ne_bytes(payload[4..8].try_into().unwrap());
            frame.frame_num = Some(num);
            frame.overfill = overfill;
            debug!("ZmqIngester: frame {num} done, overfill {overfill}");
        } else {
            // Single-word metas come from legacy simulators; the
            // canonical marker carries [frame_num, overflow].
            warn!(
                "ZmqIngester: meta payload of {} bytes, want 8",
                payload.len()
            );
            frame.frame_num = None;
            frame.degraded = true;
        }
        drop(frame);
        self.shared.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventColumns;

    fn ingester_for_test(shared: Arc<IngestShared>) -> ZmqIngester {
        ZmqIngester {
            sub: zeromq::SubSocket::new(),
            shared,
        }
    }

    fn msg(topic: &[u8], payload: Vec<u8>) -> ZmqMessage {
        let mut m = ZmqMessage::from(bytes::Bytes::from(topic.to_vec()));
        m.push_back(bytes::Bytes::from(payload));
        m
    }

    #[test]
    fn drops_while_idle() {
        let shared = IngestShared::new(None);
        let ing = ingester_for_test(shared.clone());
        let cols = EventColumns::from_events(&[(1, 2, 3, 4, 5)]);
        ing.handle(msg(
            TOPIC_DATA,
            event::encode_bytes(&cols, event::Endian::Native),
        ));
        assert!(shared.take().is_empty());
    }

    #[test]
    fn collects_then_completes_on_meta() {
        let shared = IngestShared::new(None);
        let ing = ingester_for_test(shared.clone());
        shared.begin();
        let cols = EventColumns::from_events(&[(1, 2, 3, 4, 5), (6, 7, 8, 9, 10)]);
        ing.handle(msg(
            TOPIC_DATA,
            event::encode_bytes(&cols, event::Endian::Native),
        ));
        let mut meta = 42u32.to_ne_bytes().to_vec();
        meta.extend_from_slice(&3u32.to_ne_bytes());
        ing.handle(msg(TOPIC_META, meta));
        assert!(!shared.is_collecting());
        let frame = shared.take();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.frame_num, Some(42));
        assert_eq!(frame.overfill, 3);
        assert!(!frame.degraded);
    }

    #[test]
    fn event_cap_desynchronizes() {
        let shared = IngestShared::new(Some(3));
        let ing = ingester_for_test(shared.clone());
        shared.begin();
        let bunch = EventColumns::from_events(&[(0, 0, 0, 0, 1), (0, 0, 0, 0, 2)]);
        let payload = event::encode_bytes(&bunch, event::Endian::Native);
        ing.handle(msg(TOPIC_DATA, payload.clone()));
        assert!(shared.is_collecting());
        ing.handle(msg(TOPIC_DATA, payload));
        assert!(!shared.is_collecting());
        let frame = shared.take();
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.frame_num, None);
        assert!(frame.degraded);
    }

    #[test]
    fn bad_bunch_degrades_but_continues() {
        let shared = IngestShared::new(None);
        let ing = ingester_for_test(shared.clone());
        shared.begin();
        ing.handle(msg(TOPIC_DATA, vec![1, 2, 3]));
        assert!(shared.is_collecting());
        let mut meta = 1u32.to_ne_bytes().to_vec();
        meta.extend_from_slice(&0u32.to_ne_bytes());
        ing.handle(msg(TOPIC_META, meta));
        let frame = shared.take();
        assert!(frame.degraded);
        assert_eq!(frame.frame_num, Some(1));
    }

    #[test]
    fn legacy_one_word_meta_rejected() {
        let shared = IngestShared::new(None);
        let ing = ingester_for_test(shared.clone());
        shared.begin();
        ing.handle(msg(TOPIC_META, 9u32.to_ne_bytes().to_vec()));
        let frame = shared.take();
        assert_eq!(frame.frame_num, None);
        assert!(frame.degraded);
    }
}
