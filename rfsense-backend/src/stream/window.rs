use std::marker::PhantomData;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use super::{channel, Flow};

type TimestampFn<T> = Box<dyn Fn(&T) -> i64 + Send + Sync>;

/// Thins a stream: a value passes only if its timestamp is more than
/// `slide` after the last value that passed. Everything else is dropped.
///
/// Without an extractor the processing time is used; with one, event time
/// (nanoseconds) taken from each value, which keeps replays deterministic.
pub struct DiscardingWindow<T> {
    slide: Duration,
    extractor: Option<TimestampFn<T>>,
    _marker: PhantomData<fn(T)>,
}

impl<T> DiscardingWindow<T> {
    pub fn new(slide: Duration) -> Self {
        Self {
            slide,
            extractor: None,
            _marker: PhantomData,
        }
    }

    pub fn with_timestamps<F>(slide: Duration, extractor: F) -> Self
    where
        F: Fn(&T) -> i64 + Send + Sync + 'static,
    {
        Self {
            slide,
            extractor: Some(Box::new(extractor)),
            _marker: PhantomData,
        }
    }

    fn timestamp(&self, item: &T) -> i64 {
        match &self.extractor {
            Some(f) => f(item),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or_default(),
        }
    }
}

impl<T: Send + 'static> Flow<T, T> for DiscardingWindow<T> {
    fn into_parts(self) -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
        let (in_tx, mut in_rx) = channel::<T>();
        let (out_tx, out_rx) = channel::<T>();
        let slide = i64::try_from(self.slide.as_nanos()).unwrap_or(i64::MAX);
        tokio::spawn(async move {
            let mut last: Option<i64> = None;
            while let Some(item) = in_rx.recv().await {
                let ts = self.timestamp(&item);
                if last.is_some_and(|l| ts.saturating_sub(l) <= slide) {
                    continue;
                }
                last = Some(ts);
                if out_tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        (in_tx, out_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{CollectSink, IterSource, Source};

    #[tokio::test]
    async fn test_event_time_thinning() {
        let ms = 1_000_000i64;
        let sink = CollectSink::new();
        let items = sink.items();

        IterSource::new([0, 10 * ms, 60 * ms, 90 * ms, 200 * ms])
            .via(DiscardingWindow::with_timestamps(Duration::from_millis(50), |t: &i64| *t))
            .to(sink)
            .drained()
            .await;

        assert_eq!(*items.lock(), vec![0, 60 * ms, 200 * ms]);
    }

    #[tokio::test]
    async fn test_extreme_timestamps_do_not_overflow() {
        let sink = CollectSink::new();
        let items = sink.items();

        IterSource::new([i64::MIN, 0, i64::MAX, i64::MIN])
            .via(DiscardingWindow::with_timestamps(Duration::from_millis(10), |t: &i64| *t))
            .to(sink)
            .drained()
            .await;

        // going back in time counts as inside the window
        assert_eq!(*items.lock(), vec![i64::MIN, 0, i64::MAX]);
    }

    #[tokio::test]
    async fn test_huge_slide_keeps_only_the_first() {
        let sink = CollectSink::new();
        let items = sink.items();

        IterSource::new([0, i64::MAX / 2, i64::MAX])
            .via(DiscardingWindow::with_timestamps(Duration::MAX, |t: &i64| *t))
            .to(sink)
            .drained()
            .await;

        assert_eq!(*items.lock(), vec![0]);
    }
}
