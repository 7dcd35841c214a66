use tokio::sync::mpsc;

use super::{channel, Source};

/// Emits a fixed sequence of values, then closes.
pub struct IterSource<T> {
    items: Vec<T>,
}

impl<T> IterSource<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

impl<T: Send + 'static> Source<T> for IterSource<T> {
    fn into_outlet(self) -> mpsc::Receiver<T> {
        let (tx, rx) = channel();
        tokio::spawn(async move {
            for item in self.items {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}
