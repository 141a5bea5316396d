//! Response bus: agent responses out to Kafka.
//!
//! Records are keyed by the job id they answer and partitioned by an FNV-1a
//! hash of that key, so every response to one job lands on one partition.
//! [`KafkaProducer`] batches in a background task and flushes on whichever
//! comes first: `responses_batch_size` records, `responses_batch_bytes`
//! bytes, or `responses_batch_timeout_ms` since the first queued record.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rskafka::client::partition::{Compression, OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::metrics;
use crate::protocol::PayloadMessage;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rskafka::client::error::Error),
    #[error("topic {0} not found")]
    UnknownTopic(String),
    #[error("response queue is full")]
    Full,
    #[error("response producer is shut down")]
    Closed,
    #[error("unable to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A response from an agent, as published for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub account: String,
    pub sender: String,
    pub message_type: String,
    /// The job this answers; also the record key.
    pub message_id: String,
    pub payload: Value,
    pub code: i64,
    pub in_response_to: String,
    pub serial: i64,
}

impl ResponseRecord {
    pub fn from_payload(account: &str, msg: &PayloadMessage) -> Self {
        Self {
            account: account.to_string(),
            sender: msg.routing.sender.clone(),
            message_type: msg.data.message_type.clone(),
            message_id: msg.data.in_response_to.clone(),
            payload: msg.data.raw_payload.clone(),
            code: msg.data.code,
            in_response_to: msg.data.in_response_to.clone(),
            serial: msg.data.serial,
        }
    }

    pub fn key(&self) -> &str {
        &self.message_id
    }
}

#[async_trait]
pub trait ResponseBus: Send + Sync {
    async fn publish(&self, record: ResponseRecord) -> Result<(), QueueError>;
}

/// 32-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

/// Partition for `key` among `count` partitions.
pub fn partition_for(key: &[u8], count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    fnv1a(key) as usize % count
}

struct Pending {
    key: String,
    value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_records: usize,
    pub max_bytes: usize,
    pub linger: Duration,
}

impl From<&KafkaConfig> for BatchSettings {
    fn from(cfg: &KafkaConfig) -> Self {
        Self {
            max_records: cfg.responses_batch_size.max(1),
            max_bytes: cfg.responses_batch_bytes.max(1),
            linger: Duration::from_millis(cfg.responses_batch_timeout_ms),
        }
    }
}

/// Kafka-backed [`ResponseBus`].
pub struct KafkaProducer {
    tx: mpsc::Sender<Pending>,
    stopped: CancellationToken,
}

impl KafkaProducer {
    /// Connect, discover the topic's partitions and start the batching task.
    /// The task flushes what it holds and exits when `shutdown` fires.
    pub async fn start(cfg: &KafkaConfig, shutdown: CancellationToken) -> Result<Self, QueueError> {
        let client = ClientBuilder::new(cfg.brokers.clone()).build().await?;
        let partitions = topic_partitions(&client, &cfg.responses_topic).await?;

        let mut clients = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let pc = client
                .partition_client(cfg.responses_topic.clone(), partition, UnknownTopicHandling::Retry)
                .await?;
            clients.push(pc);
        }
        info!(
            topic = %cfg.responses_topic,
            partitions = clients.len(),
            "Kafka response producer started"
        );

        let settings = BatchSettings::from(cfg);
        let (tx, rx) = mpsc::channel(settings.max_records * 10);
        let stopped = CancellationToken::new();
        let done = stopped.clone();
        tokio::spawn(async move {
            batch_loop(rx, KafkaSink { clients }, settings, shutdown).await;
            done.cancel();
        });
        Ok(Self { tx, stopped })
    }

    /// Resolves once the batching task has flushed and exited.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }
}

#[async_trait]
impl ResponseBus for KafkaProducer {
    async fn publish(&self, record: ResponseRecord) -> Result<(), QueueError> {
        let value = serde_json::to_vec(&record)?;
        self.tx
            .try_send(Pending {
                key: record.message_id,
                value,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            })
    }
}

/// Where a flushed batch goes.
#[async_trait]
trait BatchSink: Send {
    async fn write(&mut self, batch: Vec<Pending>);
}

struct KafkaSink {
    clients: Vec<PartitionClient>,
}

#[async_trait]
impl BatchSink for KafkaSink {
    async fn write(&mut self, batch: Vec<Pending>) {
        let mut by_partition: HashMap<usize, Vec<Record>> = HashMap::new();
        for pending in batch {
            let partition = partition_for(pending.key.as_bytes(), self.clients.len());
            by_partition.entry(partition).or_default().push(Record {
                key: Some(pending.key.into_bytes()),
                value: Some(pending.value),
                headers: BTreeMap::new(),
                timestamp: Utc::now(),
            });
        }

        for (partition, records) in by_partition {
            let count = records.len();
            let Some(pc) = self.clients.get(partition) else {
                continue;
            };
            match pc.produce(records, Compression::NoCompression).await {
                Ok(_) => debug!(partition, count, "Published response batch"),
                Err(e) => {
                    metrics::kafka_write_failed(count);
                    error!(partition, count, error = %e, "Unable to publish responses");
                }
            }
        }
    }
}

async fn batch_loop<S: BatchSink>(
    mut rx: mpsc::Receiver<Pending>,
    mut sink: S,
    settings: BatchSettings,
    shutdown: CancellationToken,
) {
    let mut batch: Vec<Pending> = Vec::new();
    let mut batch_bytes = 0usize;
    let linger = tokio::time::sleep(settings.linger);
    tokio::pin!(linger);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            next = rx.recv() => {
                let Some(pending) = next else { break };
                if batch.is_empty() {
                    linger.as_mut().reset(tokio::time::Instant::now() + settings.linger);
                }
                batch_bytes += pending.key.len() + pending.value.len();
                batch.push(pending);
                if batch.len() >= settings.max_records || batch_bytes >= settings.max_bytes {
                    sink.write(std::mem::take(&mut batch)).await;
                    batch_bytes = 0;
                }
            }
            () = &mut linger, if !batch.is_empty() => {
                sink.write(std::mem::take(&mut batch)).await;
                batch_bytes = 0;
            }
        }
    }

    while let Ok(pending) = rx.try_recv() {
        batch.push(pending);
    }
    if !batch.is_empty() {
        sink.write(batch).await;
    }
    debug!("Response batching task stopped");
}

async fn topic_partitions(client: &Client, topic: &str) -> Result<Vec<i32>, QueueError> {
    let topics = client.list_topics().await?;
    topics
        .into_iter()
        .find(|t| t.name == topic)
        .map(|t| t.partitions.into_iter().collect())
        .ok_or_else(|| QueueError::UnknownTopic(topic.to_string()))
}

/// In-process [`ResponseBus`] that keeps everything it is given.
#[derive(Clone, Default)]
pub struct MemoryBus {
    records: Arc<Mutex<Vec<ResponseRecord>>>,
    failing: Arc<std::sync::atomic::AtomicBool>,
}

impl MemoryBus {
    pub fn records(&self) -> Vec<ResponseRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Make subsequent publishes fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl ResponseBus for MemoryBus {
    async fn publish(&self, record: ResponseRecord) -> Result<(), QueueError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        Ok(())
    }
}

/// A record read back off a topic.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    pub value: String,
}

/// Tail every partition of `topic`, starting at `start_offset`
/// (-1 latest, -2 earliest, otherwise absolute), into `tx`.
pub async fn consume_topic(
    cfg: &KafkaConfig,
    topic: &str,
    start_offset: i64,
    tx: mpsc::Sender<ConsumedRecord>,
    shutdown: CancellationToken,
) -> Result<(), QueueError> {
    let client = ClientBuilder::new(cfg.brokers.clone()).build().await?;
    let partitions = topic_partitions(&client, topic).await?;

    let mut tasks = Vec::new();
    for partition in partitions {
        let pc = client
            .partition_client(topic.to_string(), partition, UnknownTopicHandling::Retry)
            .await?;
        let offset = match start_offset {
            -1 => pc.get_offset(OffsetAt::Latest).await?,
            -2 => pc.get_offset(OffsetAt::Earliest).await?,
            n => n,
        };
        tasks.push(tokio::spawn(tail_partition(
            pc,
            partition,
            offset,
            tx.clone(),
            shutdown.clone(),
        )));
    }

    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn tail_partition(
    pc: PartitionClient,
    partition: i32,
    mut offset: i64,
    tx: mpsc::Sender<ConsumedRecord>,
    shutdown: CancellationToken,
) {
    loop {
        let fetched = tokio::select! {
            () = shutdown.cancelled() => return,
            fetched = pc.fetch_records(offset, 1..1_000_000, 1_000) => fetched,
        };
        let records = match fetched {
            Ok((records, _high_watermark)) => records,
            Err(e) => {
                warn!(partition, error = %e, "Fetch failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        for r in records {
            offset = r.offset + 1;
            let consumed = ConsumedRecord {
                partition,
                offset: r.offset,
                key: String::from_utf8_lossy(r.record.key.as_deref().unwrap_or_default()).into_owned(),
                value: String::from_utf8_lossy(r.record.value.as_deref().unwrap_or_default())
                    .into_owned(),
            };
            if tx.send(consumed).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InnerEnvelope, RoutingMessage, Timestamp};
    use serde_json::json;

    #[derive(Clone, Default)]
    struct RecordingSink {
        batches: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn write(&mut self, batch: Vec<Pending>) {
            self.batches
                .lock()
                .unwrap()
                .push(batch.into_iter().map(|p| p.key).collect());
        }
    }

    fn pending(key: &str, size: usize) -> Pending {
        Pending {
            key: key.to_string(),
            value: vec![b'x'; size],
        }
    }

    fn settings() -> BatchSettings {
        BatchSettings {
            max_records: 3,
            max_bytes: 1024,
            linger: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_record_from_payload() {
        let msg = PayloadMessage {
            routing: RoutingMessage {
                sender: "node-a".into(),
                recipient: "node-cloud".into(),
                route_list: vec!["node-a".into()],
            },
            data: InnerEnvelope {
                message_id: "m-1".into(),
                in_response_to: "job-7".into(),
                message_type: "response".into(),
                raw_payload: json!({"ok": true}),
                timestamp: Timestamp::parse("2024-01-02T03:04:05.123456").unwrap(),
                serial: 2,
                ..InnerEnvelope::default()
            },
        };
        let record = ResponseRecord::from_payload("01", &msg);
        assert_eq!(record.key(), "job-7");
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "account": "01",
                "sender": "node-a",
                "message_type": "response",
                "message_id": "job-7",
                "payload": {"ok": true},
                "code": 0,
                "in_response_to": "job-7",
                "serial": 2,
            })
        );
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_same_key_same_partition() {
        let p = partition_for(b"job-7", 6);
        assert!(p < 6);
        assert_eq!(partition_for(b"job-7", 6), p);
        assert_eq!(partition_for(b"job-7", 0), 0);
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let sink = RecordingSink::default();
        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(batch_loop(rx, sink.clone(), settings(), shutdown.clone()));

        for key in ["a", "b", "c"] {
            tx.send(pending(key, 1)).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();
        assert_eq!(*sink.batches.lock().unwrap(), vec![vec!["a", "b", "c"]]);
    }

    #[tokio::test]
    async fn test_flush_on_batch_bytes() {
        let sink = RecordingSink::default();
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(batch_loop(rx, sink.clone(), settings(), CancellationToken::new()));

        tx.send(pending("big", 2048)).await.unwrap();
        tx.send(pending("next", 1)).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(
            *sink.batches.lock().unwrap(),
            vec![vec!["big".to_string()], vec!["next".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_linger() {
        let sink = RecordingSink::default();
        let (tx, rx) = mpsc::channel(16);
        let _task = tokio::spawn(batch_loop(rx, sink.clone(), settings(), CancellationToken::new()));

        tx.send(pending("lonely", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*sink.batches.lock().unwrap(), vec![vec!["lonely"]]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remainder() {
        let sink = RecordingSink::default();
        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(batch_loop(rx, sink.clone(), settings(), shutdown.clone()));

        tx.send(pending("x", 1)).await.unwrap();
        tokio::task::yield_now().await;
        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(*sink.batches.lock().unwrap(), vec![vec!["x"]]);
    }

    #[tokio::test]
    async fn test_memory_bus() {
        let bus = MemoryBus::default();
        let record = ResponseRecord {
            account: "01".into(),
            sender: "node-a".into(),
            message_type: "response".into(),
            message_id: "job-1".into(),
            payload: json!(null),
            code: 0,
            in_response_to: "job-1".into(),
            serial: 0,
        };
        bus.publish(record.clone()).await.unwrap();
        bus.set_failing(true);
        assert!(bus.publish(record.clone()).await.is_err());
        assert_eq!(bus.records(), vec![record]);
    }
}
