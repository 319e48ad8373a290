use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::events::OutboundEvent;

pub type SinkId = u64;

#[derive(Debug)]
struct Sink {
    id: SinkId,
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

/// Dynamic set of subscriber connections for one active session.
///
/// Late joiners see only events published after they attach; replaying
/// history is the job of the session read APIs, not the live broadcast.
#[derive(Debug, Default)]
pub struct SinkSet {
    inner: Mutex<SinkSetInner>,
}

#[derive(Debug, Default)]
struct SinkSetInner {
    sinks: Vec<Sink>,
    next_id: SinkId,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink and returns its id plus the receiving half handed to the
    /// transport layer.
    pub fn attach(&self) -> (SinkId, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sinks.push(Sink { id, tx });
        (id, rx)
    }

    /// Removes a sink. Safe to call repeatedly or for ids never attached.
    pub fn detach(&self, id: SinkId) {
        self.inner.lock().sinks.retain(|sink| sink.id != id);
    }

    /// Writes the event to every attached sink. A dead sink is logged and
    /// dropped from the set; delivery to the remaining sinks continues.
    pub fn publish(&self, event: &OutboundEvent) {
        let mut inner = self.inner.lock();
        inner.sinks.retain(|sink| {
            if sink.tx.send(event.clone()).is_err() {
                tracing::warn!(sink = sink.id, event = event.name(), "sink gone, dropping");
                false
            } else {
                true
            }
        });
    }

    /// Closes every sink; their receivers observe end-of-stream.
    pub fn close_all(&self) {
        self.inner.lock().sinks.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().sinks.is_empty()
    }
}
