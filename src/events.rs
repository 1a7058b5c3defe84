//! Event bus for broadcasting collection events

use std::sync::Arc;
use tokio::sync::broadcast;

/// Observable moments in a source's collection lifecycle.
#[derive(Debug, Clone)]
pub enum CollectEvent {
    /// The monitored file's inode changed (or it shrank below the stored
    /// offset); the watermark was reset to the start of the new file.
    Rotation {
        source_id: i64,
        old_inode: i64,
        new_inode: i64,
    },
    /// A fact batch was committed and the watermark advanced.
    BatchWritten { source_id: i64, rows: usize },
    /// A cycle aborted; the watermark is untouched and the error is recorded
    /// on the source.
    CycleFailed { source_id: i64, error: String },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<CollectEvent>>,
}

impl EventBus {
    pub fn new(sender: broadcast::Sender<Arc<CollectEvent>>) -> Self {
        Self { sender }
    }

    pub fn publish(&self, event: CollectEvent) {
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CollectEvent>> {
        self.sender.subscribe()
    }
}
