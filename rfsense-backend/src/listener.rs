//! Raw ingestion listener
//!
//! Accepts TCP connections from nodes, reads one frame per connection and
//! pushes the decoded value into its outlet. Each connection runs in its
//! own task and walks `Accepted → Reading → Decoding → Delivered|Dropped →
//! Closed`; `Closed` is always reached. A bad frame only ever affects its
//! own connection.
//!
//! Shutdown is cooperative: the accept loop stops, in-flight handlers get a
//! bounded time to finish, then the loop's sender is dropped.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::pipeline::IngestStats;
use crate::samples::{read_frame, DecodeError, Framing, SampleRecord, SampleSchema};
use crate::stream::{channel, Source};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Turns one raw frame into the value the listener emits.
pub trait FrameDecoder: Send + Sync + 'static {
    type Output: Send + 'static;

    fn decode(&self, frame: Vec<u8>) -> Result<Self::Output, DecodeError>;
}

/// A decoded record together with the bytes it came from.
#[derive(Debug, Clone)]
pub struct SampleFrame {
    pub record: SampleRecord,
    pub payload: Vec<u8>,
}

pub struct SampleDecoder {
    schema: SampleSchema,
}

impl SampleDecoder {
    pub fn new(schema: SampleSchema) -> Self {
        Self { schema }
    }
}

impl FrameDecoder for SampleDecoder {
    type Output = SampleFrame;

    fn decode(&self, frame: Vec<u8>) -> Result<SampleFrame, DecodeError> {
        let record = self.schema.decode(&frame)?;
        Ok(SampleFrame { record, payload: frame })
    }
}

/// Frames only; decoding is left to a later stage.
pub struct RawDecoder;

impl FrameDecoder for RawDecoder {
    type Output = Vec<u8>;

    fn decode(&self, frame: Vec<u8>) -> Result<Vec<u8>, DecodeError> {
        if frame.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(frame)
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub addr: SocketAddr,
    pub framing: Framing,
    pub max_frame_bytes: usize,
    pub drain_timeout: Duration,
    /// A peer that has not finished sending its frame by then is dropped.
    pub read_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ConnState {
    Accepted,
    Reading,
    Decoding,
    Delivered,
    Dropped,
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Accepted => "accepted",
            ConnState::Reading => "reading",
            ConnState::Decoding => "decoding",
            ConnState::Delivered => "delivered",
            ConnState::Dropped => "dropped",
            ConnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct Conn {
    peer: SocketAddr,
    state: ConnState,
}

impl Conn {
    fn to(&mut self, next: ConnState) {
        // forward-only; Delivered and Dropped both lead straight to Closed
        debug_assert!(next > self.state, "{} -> {}", self.state, next);
        debug!(peer = %self.peer, from = %self.state, to = %next, "connection state");
        self.state = next;
    }
}

/// Outlet side of a bound listener.
pub struct TcpSource<T> {
    rx: mpsc::Receiver<T>,
    local_addr: SocketAddr,
}

impl<T> TcpSource<T> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl<T: Send + 'static> Source<T> for TcpSource<T> {
    fn into_outlet(self) -> mpsc::Receiver<T> {
        self.rx
    }
}

/// Control side of a bound listener.
pub struct ListenerHandle {
    cancel: CancellationToken,
    accept_loop: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, waits for in-flight handlers (bounded), closes the outlet.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.accept_loop.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
    }
}

/// Binds the collector socket and starts accepting.
pub async fn bind<D: FrameDecoder>(
    cfg: ListenerConfig,
    decoder: D,
    stats: Arc<IngestStats>,
) -> std::io::Result<(TcpSource<D::Output>, ListenerHandle)> {
    let listener = TcpListener::bind(cfg.addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, framing = ?cfg.framing, "collector listening");

    let (tx, rx) = channel::<D::Output>();
    let cancel = CancellationToken::new();
    let accept_loop = tokio::spawn(accept_loop(
        listener,
        cfg,
        Arc::new(decoder),
        tx,
        stats,
        cancel.clone(),
    ));

    Ok((
        TcpSource { rx, local_addr },
        ListenerHandle {
            cancel,
            accept_loop,
            local_addr,
        },
    ))
}

async fn accept_loop<D: FrameDecoder>(
    listener: TcpListener,
    cfg: ListenerConfig,
    decoder: Arc<D>,
    out: mpsc::Sender<D::Output>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) {
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                stats.accepted.fetch_add(1, Ordering::Relaxed);
                tracker.spawn(handle_connection(
                    stream,
                    peer,
                    cfg.clone(),
                    decoder.clone(),
                    out.clone(),
                    stats.clone(),
                    cancel.clone(),
                ));
            }
        }
    }

    drop(listener);
    tracker.close();
    if tokio::time::timeout(cfg.drain_timeout, tracker.wait()).await.is_err() {
        warn!(
            in_flight = tracker.len(),
            "handlers still running after drain timeout; outlet closes when they finish"
        );
    }
    info!("collector stopped accepting");
}

async fn handle_connection<D: FrameDecoder>(
    mut stream: TcpStream,
    peer: SocketAddr,
    cfg: ListenerConfig,
    decoder: Arc<D>,
    out: mpsc::Sender<D::Output>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) {
    let mut conn = Conn {
        peer,
        state: ConnState::Accepted,
    };
    debug!(peer = %peer, "connection accepted");

    conn.to(ConnState::Reading);
    let frame = tokio::select! {
        () = cancel.cancelled() => None,
        frame = tokio::time::timeout(
            cfg.read_timeout,
            read_frame(&mut stream, cfg.framing, cfg.max_frame_bytes),
        ) => match frame {
            Ok(Ok(frame)) => Some(frame),
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "frame read failed");
                None
            }
            Err(_) => {
                warn!(peer = %peer, timeout = ?cfg.read_timeout, "frame read timed out");
                None
            }
        },
    };

    let delivered = match frame {
        Some(frame) => {
            conn.to(ConnState::Decoding);
            match decoder.decode(frame) {
                Ok(item) => {
                    // counted before the send so downstream stages can reclassify it
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    let sent = out.send(item).await.is_ok();
                    if !sent {
                        stats.delivered.fetch_sub(1, Ordering::Relaxed);
                    }
                    sent
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "frame decode failed");
                    false
                }
            }
        }
        None => false,
    };

    if delivered {
        conn.to(ConnState::Delivered);
    } else {
        conn.to(ConnState::Dropped);
        stats.dropped.fetch_add(1, Ordering::Relaxed);
    }

    let _ = stream.shutdown().await;
    drop(stream);
    conn.to(ConnState::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::write_frame;
    use crate::stream::Stream;

    fn cfg(framing: Framing) -> ListenerConfig {
        ListenerConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            framing,
            max_frame_bytes: 1024,
            drain_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_secs(5),
        }
    }

    async fn send(addr: SocketAddr, framing: Framing, payload: &[u8]) {
        let mut s = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut s, framing, payload).await.unwrap();
        s.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_frames_are_delivered() {
        let stats = Arc::new(IngestStats::default());
        let (source, handle) = bind(cfg(Framing::LengthPrefixed), RawDecoder, stats.clone())
            .await
            .unwrap();
        let addr = source.local_addr();
        let mut out = Stream::new(source.into_outlet());

        send(addr, Framing::LengthPrefixed, b"first").await;
        assert_eq!(out.recv().await.unwrap(), b"first");

        handle.shutdown().await;
        assert!(out.recv().await.is_none());
        assert_eq!(stats.snapshot().delivered, 1);
    }

    #[tokio::test]
    async fn test_bad_frame_does_not_break_listener() {
        let stats = Arc::new(IngestStats::default());
        let schema = SampleSchema::bundled().unwrap();
        let (source, handle) = bind(
            cfg(Framing::WholeConnection),
            SampleDecoder::new(schema.clone()),
            stats.clone(),
        )
        .await
        .unwrap();
        let addr = source.local_addr();
        let mut out = Stream::new(source.into_outlet());

        send(addr, Framing::WholeConnection, b"\x01\x02 not avro").await;

        let rec = SampleRecord {
            sensor_id: "s1".into(),
            campaign_id: "c1".into(),
            sample_type: "PSD".into(),
            time: Default::default(),
            config: Default::default(),
            data: vec![1.0, 2.0],
        };
        send(addr, Framing::WholeConnection, &schema.encode(&rec).unwrap()).await;

        let frame = out.recv().await.unwrap();
        assert_eq!(frame.record, rec);

        handle.shutdown().await;
        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.dropped, 1);
    }

    #[tokio::test]
    async fn test_idle_peer_is_dropped_after_read_timeout() {
        let stats = Arc::new(IngestStats::default());
        let mut conf = cfg(Framing::LengthPrefixed);
        conf.read_timeout = Duration::from_millis(100);
        let (source, handle) = bind(conf, RawDecoder, stats.clone()).await.unwrap();
        let addr = source.local_addr();
        let _out = Stream::new(source.into_outlet());

        // connects and never writes
        let _idle = TcpStream::connect(addr).await.unwrap();

        let started = std::time::Instant::now();
        while stats.snapshot().dropped == 0 {
            assert!(started.elapsed() < Duration::from_secs(2), "idle peer still held");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(stats.snapshot().delivered, 0);
        handle.shutdown().await;
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(ConnState::Accepted < ConnState::Reading);
        assert!(ConnState::Decoding < ConnState::Delivered);
        assert!(ConnState::Delivered < ConnState::Closed);
        assert!(ConnState::Dropped < ConnState::Closed);
    }
}
