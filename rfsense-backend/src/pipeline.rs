//! Ingestion pipeline: collector socket → partition keying → sample store.

use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CollectorConf;
use crate::listener::{self, ListenerConfig, ListenerHandle, RawDecoder, SampleDecoder, SampleFrame};
use crate::samples::{DecodeError, SampleSchema};
use crate::store::{AppendStore, KeyedBytes, StoreError, StoreSink};
use crate::stream::{FilterMap, Map, SinkHandle, Source};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("cannot bind collector on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("sample store: {0}")]
    Store(#[from] StoreError),
    #[error("sample schema: {0}")]
    Schema(#[from] DecodeError),
}

/// Counters shared by the listener, the keying stage and the store sink.
///
/// Every accepted frame ends as exactly one of `delivered` or `dropped`;
/// delivered frames then end as `stored` or `write_errors`.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub accepted: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub stored: AtomicU64,
    pub write_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub accepted: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub stored: u64,
    pub write_errors: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct IngestionPipeline {
    listener: ListenerHandle,
    sink: SinkHandle,
    store: Arc<AppendStore>,
    stats: Arc<IngestStats>,
}

impl IngestionPipeline {
    /// Opens the store, binds the collector and wires everything up.
    /// Any failure here is fatal: nothing is left running.
    pub async fn start(
        cfg: &CollectorConf,
        store_path: &Path,
        schema: SampleSchema,
    ) -> Result<Self, IngestError> {
        let store = Arc::new(AppendStore::open(store_path, cfg.sequence_bandwidth)?);
        let stats = Arc::new(IngestStats::default());

        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
        let lcfg = ListenerConfig {
            addr,
            framing: cfg.framing,
            max_frame_bytes: cfg.max_frame_bytes,
            drain_timeout: cfg.drain_timeout(),
            read_timeout: cfg.read_timeout(),
        };
        let sink = StoreSink::new(store.clone(), stats.clone());

        let (listener, sink) = if cfg.decode_in_listener {
            let (source, handle) = listener::bind(lcfg, SampleDecoder::new(schema), stats.clone())
                .await
                .map_err(|source| IngestError::Bind { addr, source })?;
            let keyed = source.via(Map::new(|frame: SampleFrame| KeyedBytes {
                partition: frame.record.partition_key(),
                bytes: frame.payload,
            }));
            (handle, keyed.to(sink))
        } else {
            let (source, handle) = listener::bind(lcfg, RawDecoder, stats.clone())
                .await
                .map_err(|source| IngestError::Bind { addr, source })?;
            let counters = stats.clone();
            let keyed = source.via(FilterMap::new(move |bytes: Vec<u8>| {
                match schema.partition_key(&bytes) {
                    Ok(partition) => Some(KeyedBytes { partition, bytes }),
                    Err(e) => {
                        // the listener counted it delivered; it ends up dropped instead
                        counters.delivered.fetch_sub(1, Ordering::Relaxed);
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "cannot key frame, dropping");
                        None
                    }
                }
            }));
            (handle, keyed.to(sink))
        };

        info!(
            addr = %listener.local_addr(),
            decode_in_listener = cfg.decode_in_listener,
            "ingestion pipeline started"
        );
        Ok(Self {
            listener,
            sink,
            store,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn store(&self) -> Arc<AppendStore> {
        self.store.clone()
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Stops the listener, lets the sink drain and close the store.
    pub async fn shutdown(self) -> IngestSnapshot {
        self.listener.shutdown().await;
        self.sink.drained().await;
        let snapshot = self.stats.snapshot();
        info!(?snapshot, "ingestion pipeline stopped");
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::{write_frame, Framing, PartitionKey, SampleRecord};
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn conf(decode_in_listener: bool) -> CollectorConf {
        CollectorConf {
            port: 0,
            decode_in_listener,
            ..Default::default()
        }
    }

    fn record(sensor: &str) -> SampleRecord {
        SampleRecord {
            sensor_id: sensor.into(),
            campaign_id: "c1".into(),
            sample_type: "PSD".into(),
            time: Default::default(),
            config: Default::default(),
            data: vec![0.5; 8],
        }
    }

    async fn push(addr: SocketAddr, payload: &[u8]) {
        let addr = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        let mut s = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut s, Framing::LengthPrefixed, payload).await.unwrap();
        s.shutdown().await.unwrap();
    }

    async fn run(decode_in_listener: bool) {
        let dir = TempDir::new().unwrap();
        let schema = SampleSchema::bundled().unwrap();
        let pipeline = IngestionPipeline::start(
            &conf(decode_in_listener),
            &dir.path().join("samples.redb"),
            schema.clone(),
        )
        .await
        .unwrap();
        let addr = pipeline.local_addr();
        let store = pipeline.store();

        push(addr, &schema.encode(&record("s1")).unwrap()).await;
        push(addr, &schema.encode(&record("s2")).unwrap()).await;
        push(addr, b"garbage").await;

        let stats = pipeline.stats();
        for _ in 0..100 {
            let s = stats.snapshot();
            if s.stored + s.dropped == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let snap = pipeline.shutdown().await;
        assert_eq!(snap.stored, 2);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.accepted, 3);
        assert_eq!(snap.delivered, 2, "decode_in_listener={decode_in_listener}");
        assert_eq!(snap.accepted, snap.delivered + snap.dropped);

        let entries = store.scan(&PartitionKey::new("c1", "s1"), .., None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(schema.decode(&entries[0].bytes).unwrap(), record("s1"));
    }

    #[tokio::test]
    async fn test_decoding_in_listener() {
        run(true).await;
    }

    #[tokio::test]
    async fn test_keying_raw_frames() {
        run(false).await;
    }
}
