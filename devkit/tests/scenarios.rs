//! End-to-end scenarios across broker, scatter-gather, ingestion and storage.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rfsense_backend::gather::{self, GatherError, PingConfig};
use rfsense_backend::models::{InboxEnvelope, NodeStats};
use rfsense_backend::mqtt::{inbox_topic, OUTBOX_TOPIC, PRESENCE_TOPIC};
use rfsense_backend::samples::{Framing, PartitionKey};
use rfsense_backend::store::AppendStore;
use rfsense_devkit::{encoded_sample, NodeMessageBuilder, TestHarness};
use tempfile::TempDir;

#[tokio::test]
async fn ping_with_one_silent_subscriber_times_out_with_partial_results() {
    let mut harness = TestHarness::new().unwrap();
    harness.add_node("a", &["node.all"]).unwrap();
    harness.add_node("b", &["node.all"]).unwrap();
    harness.add_silent_node("c", &["node.all"]).unwrap();

    let started = Instant::now();
    let result = gather::ping::<NodeStats>(
        &harness.client(),
        "node.all",
        "node.get.all",
        PingConfig::default(),
    )
    .await;
    let elapsed = started.elapsed();

    match result {
        Err(GatherError::TimedOut { partial, expected, .. }) => {
            assert_eq!(expected, 3);
            let ids: HashSet<_> = partial.into_iter().map(|s| s.id).collect();
            assert_eq!(ids, HashSet::from(["a".to_string(), "b".to_string()]));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(1000));
    harness.shutdown().await;
}

#[tokio::test]
async fn ping_without_subscribers_publishes_nothing() {
    let harness = TestHarness::new().unwrap();
    let before = harness.service.broker_stats().published;

    let result = gather::ping::<NodeStats>(
        &harness.client(),
        "node.all",
        "node.get.all",
        PingConfig::default(),
    )
    .await
    .unwrap();

    assert!(result.is_empty());
    assert_eq!(harness.service.broker_stats().published, before);
    harness.shutdown().await;
}

#[tokio::test]
async fn length_prefixed_sample_lands_in_its_partition() {
    let harness = TestHarness::new().unwrap();
    let cfg = TestHarness::collector_conf(Framing::LengthPrefixed, true);
    let (pipeline, writer) = harness.start_pipeline(&cfg).await.unwrap();

    let payload = encoded_sample(&harness.schema, "c1", "s1", 1_700_000_000).unwrap();
    writer.send(&payload).await.unwrap();
    TestHarness::wait_for_ingest(&pipeline, 2000, |s| s.stored == 1).await.unwrap();

    let store = pipeline.store();
    let entries = store.scan(&PartitionKey::new("c1", "s1"), .., None).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].bytes, payload);
    assert!(store.scan(&PartitionKey::new("c1", "s2"), .., None).unwrap().is_empty());

    let snapshot = pipeline.shutdown().await;
    assert_eq!(snapshot.stored, 1);
    assert_eq!(snapshot.dropped, 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn corrupt_frame_does_not_stop_the_collector() {
    for decode_in_listener in [true, false] {
        let harness = TestHarness::new().unwrap();
        let cfg = TestHarness::collector_conf(Framing::WholeConnection, decode_in_listener);
        let (pipeline, writer) = harness.start_pipeline(&cfg).await.unwrap();

        writer.send(b"\xff\xff\xff definitely not avro").await.unwrap();
        let good = encoded_sample(&harness.schema, "c2", "s9", 10).unwrap();
        writer.send(&good).await.unwrap();

        let snapshot = TestHarness::wait_for_ingest(&pipeline, 2000, |s| s.stored + s.dropped == 2)
            .await
            .unwrap();
        assert_eq!(snapshot.stored, 1, "decode_in_listener={decode_in_listener}");
        assert_eq!(snapshot.dropped, 1, "decode_in_listener={decode_in_listener}");

        let entries = pipeline
            .store()
            .scan(&PartitionKey::new("c2", "s9"), .., None)
            .unwrap();
        assert_eq!(entries.len(), 1);

        pipeline.shutdown().await;
        harness.shutdown().await;
    }
}

#[test]
fn concurrent_appends_get_unique_increasing_sequences() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(AppendStore::open(dir.path().join("seq.redb"), 7).unwrap());
    let key = PartitionKey::new("c1", "s1");

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let key = key.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                for i in 0..50u32 {
                    seen.push(store.append(&key, &i.to_be_bytes()).unwrap());
                }
                seen
            })
        })
        .collect();

    let mut all = HashSet::new();
    for worker in workers {
        let seen = worker.join().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        all.extend(seen);
    }
    assert_eq!(all.len(), 200);
    assert_eq!(store.scan(&key, .., None).unwrap().len(), 200);
}

#[test]
fn partitions_do_not_bleed_into_each_other() {
    let dir = TempDir::new().unwrap();
    let store = AppendStore::open(dir.path().join("iso.redb"), 100).unwrap();
    let short = PartitionKey::new("c1", "s1");
    let long = PartitionKey::new("c1", "s10");

    for i in 0..5u8 {
        store.append(&short, &[i]).unwrap();
        store.append(&long, &[100 + i]).unwrap();
    }

    let entries = store.scan(&short, .., None).unwrap();
    assert_eq!(entries.len(), 5);
    assert!(entries.iter().all(|e| e.bytes[0] < 100));
    assert_eq!(store.scan(&long, .., None).unwrap().len(), 5);
}

#[tokio::test]
async fn mqtt_node_answers_a_ping_through_the_bridge() {
    let harness = TestHarness::new().unwrap();
    let directory = harness.node_directory(Duration::from_secs(30));
    directory
        .handle_publish(PRESENCE_TOPIC, &NodeMessageBuilder::presence("n1", &["node.all"]))
        .unwrap();

    let client = harness.client();
    let ping = tokio::spawn(async move {
        gather::ping::<NodeStats>(&client, "node.all", "node.get.all", PingConfig::default()).await
    });

    let payload = harness
        .wait_for_relay(&inbox_topic("n1"), 1000)
        .await
        .expect("node never got the ping");
    let envelope: InboxEnvelope = serde_json::from_slice(&payload).unwrap();
    let stats = serde_json::to_value(rfsense_devkit::MockNode::node_stats("n1")).unwrap();
    let reply = NodeMessageBuilder::reply_to(&envelope, stats).unwrap();
    directory.handle_publish(OUTBOX_TOPIC, &reply).unwrap();

    let nodes = ping.await.unwrap().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, "n1");
    harness.shutdown().await;
}
