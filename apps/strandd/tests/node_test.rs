//! Standalone-node tests: config-driven wiring, durable local shards,
//! and epoch continuity across restarts.

use std::collections::BTreeMap;
use std::sync::Arc;
use strand_epoch::InMemoryVersionedStore;
use strand_membership::{FailureDomainScope, NodeConfig};
use strand_record::{Epoch, LogId, Lsn, Payload};
use strand_reader::ClientReadEvent;
use strandd::{ClusterConfig, LogGroupConfig, Node};
use tempfile::TempDir;

const LOG: LogId = LogId(7);

fn config() -> ClusterConfig {
    let mut nodes = BTreeMap::new();
    nodes.insert(0u16, NodeConfig::both("n0", "127.0.0.1:4440", 2));
    ClusterConfig {
        cluster: "standalone".to_string(),
        version: 1,
        nodes: Some(nodes),
        metadata_logs: None,
        logs: vec![LogGroupConfig {
            name: "test".to_string(),
            id_range: (1, 100),
            replication: BTreeMap::from([(FailureDomainScope::Node, 1)]),
            nodeset_size: 2,
            backlog_seconds: None,
            sequencer_affinity: None,
            max_writes_in_flight: None,
        }],
        principals: vec![],
        security_information: BTreeMap::new(),
        traffic_shaping: None,
        read_throttling: None,
        server_settings: BTreeMap::new(),
        client_settings: BTreeMap::new(),
        zookeeper: None,
        log_namespace_delimiter: "/".to_string(),
        cluster_creation_time: None,
        custom: BTreeMap::new(),
    }
}

async fn read_payloads(node: &Node, until: Lsn) -> Vec<Payload> {
    let mut stream = node.read(LOG, Lsn::OLDEST, until);
    let mut payloads = Vec::new();
    while let Some(event) = stream.next().await.unwrap() {
        if let ClientReadEvent::Record(r) = event {
            payloads.push(r.payload);
        }
    }
    payloads
}

#[tokio::test(flavor = "multi_thread")]
async fn append_and_read_roundtrip() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(0, config(), dir.path(), None).unwrap();

    let mut last = Lsn::INVALID;
    for i in 0..3 {
        last = node
            .append(LOG, Payload::flat(format!("p{i}").into_bytes()))
            .await
            .unwrap();
    }
    assert_eq!(last.epoch(), Epoch(1));

    let payloads = read_payloads(&node, last).await;
    assert_eq!(
        payloads,
        vec![
            Payload::flat(b"p0".to_vec()),
            Payload::flat(b"p1".to_vec()),
            Payload::flat(b"p2".to_vec()),
        ]
    );
    node.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn records_survive_restart_with_epoch_bump() {
    let dir = TempDir::new().unwrap();
    let coordinator = Arc::new(InMemoryVersionedStore::new());

    {
        let node = Node::open(0, config(), dir.path(), Some(coordinator.clone())).unwrap();
        for i in 0..3 {
            node.append(LOG, Payload::flat(format!("old{i}").into_bytes()))
                .await
                .unwrap();
        }
        node.shutdown();
    }

    let node = Node::open(0, config(), dir.path(), Some(coordinator)).unwrap();
    let last = node
        .append(LOG, Payload::flat(b"new".to_vec()))
        .await
        .unwrap();
    // The restarted sequencer must not reuse the old epoch.
    assert_eq!(last.epoch(), Epoch(2));

    let payloads = read_payloads(&node, last).await;
    assert_eq!(payloads.len(), 4);
    assert_eq!(payloads[0], Payload::flat(b"old0".to_vec()));
    assert_eq!(payloads[3], Payload::flat(b"new".to_vec()));
    node.shutdown();
}

#[tokio::test]
async fn cluster_marker_guards_foreign_shards() {
    let dir = TempDir::new().unwrap();
    {
        let node = Node::open(0, config(), dir.path(), None).unwrap();
        node.shutdown();
    }
    let mut foreign = config();
    foreign.cluster = "other-cluster".to_string();
    let err = Node::open(0, foreign, dir.path(), None).unwrap_err();
    assert!(matches!(
        err,
        strandd::NodeError::Storage(strand_storage::LogStoreError::ClusterMarkerMismatch { .. })
    ));
}

/// Batched writes through the node: the buffered writer coalesces
/// appends into one record, readers unbatch it.
#[tokio::test(flavor = "multi_thread")]
async fn buffered_writer_batches_through_the_node() {
    use strand_client::{BatchSink, BufferedWriter, BufferedWriterOptions};
    use strand_record::{decode_batch, RecordFlags};
    use strand_sequencer::AppendAttrs;
    use strand_wire::Status;

    struct NodeSink {
        node: Arc<Node>,
    }

    #[async_trait::async_trait]
    impl BatchSink for NodeSink {
        async fn append_batch(
            &self,
            log: LogId,
            encoded: Payload,
            _count: usize,
        ) -> Result<Lsn, Status> {
            let seq = self
                .node
                .sequencer(log)
                .await
                .map_err(|_| Status::NoSequencer)?;
            seq.append_with_attrs(
                encoded,
                AppendAttrs {
                    batch: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| e.status())
        }
    }

    let dir = TempDir::new().unwrap();
    let node = Arc::new(Node::open(0, config(), dir.path(), None).unwrap());

    let writer = BufferedWriter::new(
        LOG,
        Arc::new(NodeSink { node: node.clone() }),
        BufferedWriterOptions {
            size_trigger: Some(1),
            mode: strand_client::BatchMode::OneAtATime,
            ..Default::default()
        },
    );
    let inputs = vec![
        Payload::flat(b"alpha".to_vec()),
        Payload::flat(b"beta".to_vec()),
        Payload::flat(b"gamma".to_vec()),
    ];
    let mut receivers = Vec::new();
    for payload in &inputs {
        receivers.push(writer.append(payload.clone()).unwrap());
    }
    let mut last = Lsn::INVALID;
    for rx in receivers {
        last = rx.await.unwrap().unwrap().lsn;
    }

    // Read the batches back and unbatch.
    let mut stream = node.read(LOG, Lsn::OLDEST, last);
    let mut unbatched = Vec::new();
    while let Some(event) = stream.next().await.unwrap() {
        if let ClientReadEvent::Record(r) = event {
            assert!(r.flags.contains(RecordFlags::BUFFERED_WRITER_BATCH));
            unbatched.extend(decode_batch(r.payload.as_flat().unwrap()).unwrap());
        }
    }
    assert_eq!(unbatched, inputs, "unbatched payloads preserve order");
    node.shutdown();
}

#[tokio::test]
async fn unknown_log_is_rejected() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(0, config(), dir.path(), None).unwrap();
    let err = node
        .append(LogId::new(5000), Payload::flat(b"x".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, strandd::NodeError::UnknownLog(_)));
    node.shutdown();
}
