//! Source → Flow → Sink composition
//!
//! Stages talk over bounded channels of capacity 1, so a slow sink pushes
//! back all the way to the producer. Every connection between two stages
//! is one forwarding task that owns the only sender of the downstream
//! channel: when the upstream channel closes the task returns and the
//! downstream channel closes with it, exactly once, by drop.

mod flow;
mod sink;
mod source;
mod window;

pub use flow::{pass_through, FilterMap, Map};
pub use sink::CollectSink;
pub use source::IterSource;
pub use window::DiscardingWindow;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

pub const CHANNEL_CAPACITY: usize = 1;

/// Produces values until it closes its outlet.
pub trait Source<T: Send + 'static>: Sized {
    fn into_outlet(self) -> mpsc::Receiver<T>;

    fn via<O, F>(self, flow: F) -> Stream<O>
    where
        O: Send + 'static,
        F: Flow<T, O>,
    {
        let (inlet, outlet) = flow.into_parts();
        tokio::spawn(forward(self.into_outlet(), inlet));
        Stream::new(outlet)
    }

    fn to<S: Sink<T>>(self, sink: S) -> SinkHandle {
        let (inlet, handle) = sink.into_parts();
        tokio::spawn(forward(self.into_outlet(), inlet));
        handle
    }
}

/// Transforms values. A flow may drop a value but keeps going with the next.
pub trait Flow<I, O> {
    /// Starts the flow's worker and returns its inlet and outlet.
    fn into_parts(self) -> (mpsc::Sender<I>, mpsc::Receiver<O>);
}

/// Consumes values until its inlet closes, then releases its resources.
pub trait Sink<T> {
    fn into_parts(self) -> (mpsc::Sender<T>, SinkHandle);
}

/// The outlet of a composed pipeline section.
pub struct Stream<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Stream<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T: Send + 'static> Source<T> for Stream<T> {
    fn into_outlet(self) -> mpsc::Receiver<T> {
        self.rx
    }
}

/// Completion handle of a running sink.
pub struct SinkHandle {
    task: JoinHandle<()>,
}

impl SinkHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Resolves once the sink drained its inlet and released its resources.
    pub async fn drained(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "sink task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub fn channel<T>() -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel(CHANNEL_CAPACITY)
}

async fn forward<T>(mut from: mpsc::Receiver<T>, to: mpsc::Sender<T>) {
    while let Some(item) = from.recv().await {
        if to.send(item).await.is_err() {
            // downstream gone; dropping `from` lets upstream notice
            break;
        }
    }
}
