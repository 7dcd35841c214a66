use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{channel, Sink, SinkHandle};

/// Collects everything it receives, mostly for tests and replay buffers.
pub struct CollectSink<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Default for CollectSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CollectSink<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared view of the collected values, readable after `drained()`.
    pub fn items(&self) -> Arc<Mutex<Vec<T>>> {
        self.items.clone()
    }
}

impl<T: Send + 'static> Sink<T> for CollectSink<T> {
    fn into_parts(self) -> (mpsc::Sender<T>, SinkHandle) {
        let (tx, mut rx) = channel::<T>();
        let items = self.items;
        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                items.lock().push(item);
            }
        });
        (tx, SinkHandle::new(task))
    }
}
