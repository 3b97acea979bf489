//! Integration tests for the client read stream over in-process
//! storage nodes.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use strand_epoch::{
    EpochMetadata, EpochStore, EpochStoreConfig, InMemoryVersionedStore, MetadataUpdate,
};
use strand_membership::{MembershipView, NodeConfig, NodesConfiguration, ShardId};
use strand_placement::ReplicationProperty;
use strand_reader::{
    ClientReadEvent, ClientReadStream, ReadError, ReadStreamConfig, ShardSource,
    ShardSourceFactory, StreamState,
};
use strand_record::{
    ChecksumKind, DataRecord, Epoch, Esn, GapKind, LogId, Lsn, Payload,
};
use strand_storage::{MemoryLogStore, ReadStreamParams, StorageNode, StoredRecord};

const LOG: LogId = LogId(11);

fn lsn(e: u32, n: u32) -> Lsn {
    Lsn::new(Epoch(e), Esn(n))
}

struct Cluster {
    nodes: BTreeMap<u16, Arc<StorageNode>>,
    epoch_store: Arc<EpochStore>,
    view: Arc<MembershipView>,
}

impl Cluster {
    async fn new(n: u16) -> Self {
        let mut config = NodesConfiguration::new(1);
        let mut nodes = BTreeMap::new();
        for i in 0..n {
            config
                .nodes
                .insert(i, NodeConfig::storage_node(format!("n{i}"), format!("h{i}:4440"), 1));
            let node = Arc::new(StorageNode::new(i));
            node.add_shard(Arc::new(MemoryLogStore::new(ShardId::new(i, 0))));
            nodes.insert(i, node);
        }
        let epoch_store = Arc::new(EpochStore::new(
            Arc::new(InMemoryVersionedStore::new()),
            EpochStoreConfig::default(),
        ));
        let nodeset: Vec<ShardId> = (0..n).map(|i| ShardId::new(i, 0)).collect();
        let replication = ReplicationProperty::from_factor(2).unwrap();
        epoch_store
            .create_or_update_metadata(LOG, move |_| {
                Ok(MetadataUpdate::Update(EpochMetadata {
                    epoch: Epoch(1),
                    nodeset: nodeset.clone(),
                    replication: replication.clone(),
                    effective_since: Epoch(1),
                    nodeset_params: 1,
                    writer_node: Some(0),
                }))
            })
            .await
            .unwrap();
        Cluster {
            nodes,
            epoch_store,
            view: Arc::new(MembershipView::new(config)),
        }
    }

    /// Stores a record on the given nodes with the full nodeset as its
    /// copyset.
    async fn put(&self, record: DataRecord, on: &[u16]) {
        let copyset: Vec<ShardId> = self.nodes.keys().map(|&i| ShardId::new(i, 0)).collect();
        for &idx in on {
            let store = self.nodes[&idx].shard_store(0).unwrap();
            store
                .write_record(
                    LOG,
                    StoredRecord {
                        record: record.clone(),
                        copyset: copyset.clone(),
                        wave: 1,
                    },
                )
                .await
                .unwrap();
        }
    }

    async fn release_all(&self, lsn: Lsn) {
        for node in self.nodes.values() {
            node.release(LOG, lsn).await;
        }
    }

    fn factory(&self, fail_nodes: Vec<u16>) -> Arc<NodeFactory> {
        Arc::new(NodeFactory {
            nodes: self.nodes.clone(),
            fail_nodes,
        })
    }

    fn stream(&self, start: Lsn, until: Lsn, factory: Arc<NodeFactory>, scd: bool) -> ClientReadStream {
        let mut config = ReadStreamConfig::fast();
        config.scd = scd;
        ClientReadStream::new(
            LOG,
            start,
            until,
            factory,
            self.epoch_store.clone(),
            self.view.clone(),
            config,
        )
    }
}

struct NodeFactory {
    nodes: BTreeMap<u16, Arc<StorageNode>>,
    /// Nodes whose sub-streams fail to open (simulated down nodes).
    fail_nodes: Vec<u16>,
}

#[async_trait]
impl ShardSourceFactory for NodeFactory {
    async fn open(
        &self,
        log: LogId,
        shard: ShardId,
        start: Lsn,
        until: Lsn,
        scd: bool,
        send_all: bool,
    ) -> Result<Box<dyn ShardSource>, ReadError> {
        if self.fail_nodes.contains(&shard.node) {
            return Err(ReadError::ShardUnavailable(shard));
        }
        let node = self
            .nodes
            .get(&shard.node)
            .ok_or(ReadError::ShardUnavailable(shard))?;
        let mut stream = node
            .open_read_stream(ReadStreamParams {
                log,
                shard,
                start,
                until,
                window_bytes: 1 << 20,
                scd,
                filter: None,
            })
            .ok_or(ReadError::ShardUnavailable(shard))?;
        if send_all {
            stream.set_send_all(true);
        }
        Ok(Box::new(stream))
    }
}

fn data_record(e: u32, n: u32, body: &str) -> DataRecord {
    let mut r = DataRecord::new(LOG, lsn(e, n), 1000 + n as u64, Payload::flat(body.as_bytes().to_vec()));
    r.flags = r.flags.with_checksum(ChecksumKind::Crc32);
    r
}

async fn collect_n(stream: &mut ClientReadStream, n: usize) -> Vec<ClientReadEvent> {
    let mut out = Vec::new();
    for _ in 0..n {
        match stream.next().await.unwrap() {
            Some(event) => out.push(event),
            None => break,
        }
    }
    out
}

#[tokio::test]
async fn merges_records_in_lsn_order() {
    let cluster = Cluster::new(3).await;
    for n in 1..=5u32 {
        cluster.put(data_record(1, n, &format!("r{n}")), &[0, 1, 2]).await;
    }
    cluster.release_all(lsn(1, 5)).await;

    let mut stream = cluster.stream(lsn(1, 1), lsn(1, 5), cluster.factory(vec![]), false);
    assert_eq!(stream.state(), StreamState::Initializing);

    let events = collect_n(&mut stream, 5).await;
    let lsns: Vec<Lsn> = events
        .iter()
        .map(|e| match e {
            ClientReadEvent::Record(r) => r.lsn,
            other => panic!("expected record, got {other:?}"),
        })
        .collect();
    assert_eq!(lsns, (1..=5).map(|n| lsn(1, n)).collect::<Vec<_>>());
    assert_eq!(stream.next().await.unwrap(), None);
    assert_eq!(stream.state(), StreamState::Done);
}

#[tokio::test]
async fn bridge_record_crosses_epochs() {
    let cluster = Cluster::new(3).await;
    for n in 1..=2u32 {
        cluster.put(data_record(1, n, "e1"), &[0, 1, 2]).await;
    }
    cluster
        .put(DataRecord::bridge(LOG, lsn(1, 3), 0), &[0, 1, 2])
        .await;
    for n in 1..=2u32 {
        cluster.put(data_record(2, n, "e2"), &[0, 1, 2]).await;
    }
    cluster.release_all(lsn(2, 2)).await;

    let mut stream = cluster.stream(lsn(1, 1), lsn(2, 2), cluster.factory(vec![]), false);
    let events = collect_n(&mut stream, 5).await;

    assert!(matches!(&events[0], ClientReadEvent::Record(r) if r.lsn == lsn(1, 1)));
    assert!(matches!(&events[1], ClientReadEvent::Record(r) if r.lsn == lsn(1, 2)));
    match &events[2] {
        ClientReadEvent::Gap(g) => {
            assert_eq!(g.kind, GapKind::Bridge);
            assert_eq!(g.lo, lsn(1, 3));
        }
        other => panic!("expected bridge gap, got {other:?}"),
    }
    assert!(matches!(&events[3], ClientReadEvent::Record(r) if r.lsn == lsn(2, 1)));
    assert!(matches!(&events[4], ClientReadEvent::Record(r) if r.lsn == lsn(2, 2)));
}

#[tokio::test]
async fn hole_records_surface_as_hole_gaps() {
    let cluster = Cluster::new(3).await;
    cluster.put(data_record(1, 1, "a"), &[0, 1, 2]).await;
    cluster
        .put(DataRecord::hole(LOG, lsn(1, 2), 0), &[0, 1, 2])
        .await;
    cluster.put(data_record(1, 3, "b"), &[0, 1, 2]).await;
    cluster.release_all(lsn(1, 3)).await;

    let mut stream = cluster.stream(lsn(1, 1), lsn(1, 3), cluster.factory(vec![]), false);
    let events = collect_n(&mut stream, 3).await;
    assert!(matches!(&events[0], ClientReadEvent::Record(_)));
    match &events[1] {
        ClientReadEvent::Gap(g) => {
            assert_eq!(g.kind, GapKind::Hole);
            assert_eq!((g.lo, g.hi), (lsn(1, 2), lsn(1, 2)));
        }
        other => panic!("expected hole gap, got {other:?}"),
    }
    assert!(matches!(&events[2], ClientReadEvent::Record(r) if r.lsn == lsn(1, 3)));
}

#[tokio::test]
async fn proven_missing_range_becomes_dataloss_gap() {
    let cluster = Cluster::new(3).await;
    for n in [1u32, 2, 4, 5] {
        cluster.put(data_record(1, n, "x"), &[0, 1, 2]).await;
    }
    cluster.release_all(lsn(1, 5)).await;

    let mut stream = cluster.stream(lsn(1, 1), lsn(1, 5), cluster.factory(vec![]), false);
    let events = collect_n(&mut stream, 5).await;

    assert!(matches!(&events[0], ClientReadEvent::Record(r) if r.lsn == lsn(1, 1)));
    assert!(matches!(&events[1], ClientReadEvent::Record(r) if r.lsn == lsn(1, 2)));
    match &events[2] {
        ClientReadEvent::Gap(g) => {
            assert_eq!(g.kind, GapKind::Dataloss);
            assert_eq!((g.lo, g.hi), (lsn(1, 3), lsn(1, 3)));
        }
        other => panic!("expected dataloss gap, got {other:?}"),
    }
    assert!(matches!(&events[3], ClientReadEvent::Record(r) if r.lsn == lsn(1, 4)));
    assert!(matches!(&events[4], ClientReadEvent::Record(r) if r.lsn == lsn(1, 5)));
}

#[tokio::test]
async fn scd_failover_recovers_records_from_surviving_copies() {
    let cluster = Cluster::new(3).await;
    // Every record on every shard; under SCD each shard only sends the
    // records it is rotation-primary for.
    for n in 1..=6u32 {
        cluster.put(data_record(1, n, "x"), &[0, 1, 2]).await;
    }
    cluster.release_all(lsn(1, 6)).await;

    // Node 1 is down: its primaries go missing until failover.
    let mut stream = cluster.stream(lsn(1, 1), lsn(1, 6), cluster.factory(vec![1]), true);
    let events = collect_n(&mut stream, 6).await;
    let mut got: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            ClientReadEvent::Record(r) => Some(r.lsn.esn().as_u32()),
            _ => None,
        })
        .collect();
    got.sort_unstable();
    assert_eq!(got, vec![1, 2, 3, 4, 5, 6], "all records must be recovered");
    // Two of three shards respond and the factor is 2: still healthy.
    assert!(stream.is_healthy());
}

#[tokio::test]
async fn stop_silences_the_stream() {
    let cluster = Cluster::new(3).await;
    cluster.put(data_record(1, 1, "x"), &[0, 1, 2]).await;
    cluster.release_all(lsn(1, 1)).await;

    let mut stream = cluster.stream(lsn(1, 1), Lsn::MAX, cluster.factory(vec![]), false);
    assert!(stream.next().await.unwrap().is_some());
    stream.stop();
    assert_eq!(stream.next().await.unwrap(), None);
    assert_eq!(stream.state(), StreamState::Done);
}

#[tokio::test]
async fn trim_gap_passes_through() {
    let cluster = Cluster::new(3).await;
    for n in 1..=4u32 {
        cluster.put(data_record(1, n, "x"), &[0, 1, 2]).await;
    }
    for node in cluster.nodes.values() {
        node.trim(0, LOG, lsn(1, 2)).await.unwrap();
    }
    cluster.release_all(lsn(1, 4)).await;

    let mut stream = cluster.stream(lsn(1, 1), lsn(1, 4), cluster.factory(vec![]), false);
    let events = collect_n(&mut stream, 3).await;
    match &events[0] {
        ClientReadEvent::Gap(g) => {
            assert_eq!(g.kind, GapKind::Trim);
            assert_eq!((g.lo, g.hi), (lsn(1, 1), lsn(1, 2)));
        }
        other => panic!("expected trim gap, got {other:?}"),
    }
    assert!(matches!(&events[1], ClientReadEvent::Record(r) if r.lsn == lsn(1, 3)));
    assert!(matches!(&events[2], ClientReadEvent::Record(r) if r.lsn == lsn(1, 4)));
}
