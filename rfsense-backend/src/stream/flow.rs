use tokio::sync::mpsc;

use super::{channel, Flow};

/// One output per input.
pub struct Map<F> {
    f: F,
}

impl<F> Map<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<I, O, F> Flow<I, O> for Map<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> O + Send + 'static,
{
    fn into_parts(mut self) -> (mpsc::Sender<I>, mpsc::Receiver<O>) {
        let (in_tx, mut in_rx) = channel::<I>();
        let (out_tx, out_rx) = channel::<O>();
        tokio::spawn(async move {
            while let Some(item) = in_rx.recv().await {
                if out_tx.send((self.f)(item)).await.is_err() {
                    break;
                }
            }
        });
        (in_tx, out_rx)
    }
}

/// Zero or one output per input; `None` drops the value and moves on.
pub struct FilterMap<F> {
    f: F,
}

impl<F> FilterMap<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<I, O, F> Flow<I, O> for FilterMap<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Option<O> + Send + 'static,
{
    fn into_parts(mut self) -> (mpsc::Sender<I>, mpsc::Receiver<O>) {
        let (in_tx, mut in_rx) = channel::<I>();
        let (out_tx, out_rx) = channel::<O>();
        tokio::spawn(async move {
            while let Some(item) = in_rx.recv().await {
                let Some(out) = (self.f)(item) else { continue };
                if out_tx.send(out).await.is_err() {
                    break;
                }
            }
        });
        (in_tx, out_rx)
    }
}

pub fn pass_through<T>() -> Map<fn(T) -> T> {
    Map::new(std::convert::identity::<T> as fn(T) -> T)
}
