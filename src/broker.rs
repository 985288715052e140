use crate::config::Settings;
use crate::error::CliError;
use crate::protocol::{Assignment, Delivery, Offset, OutgoingMessage, Record};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{BaseConsumer, Consumer, DefaultConsumerContext, StreamConsumer};
use rdkafka::message::{Message, Timestamp};
use rdkafka::error::KafkaResult;
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset as KafkaOffset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

/// One subscription to a single (topic, partition).
#[async_trait]
pub trait PartitionStream: Send {
    fn assignment(&self) -> &Assignment;

    /// Waits for the next record. Must be safe to drop mid-wait.
    async fn recv(&mut self) -> Result<Record, CliError>;

    async fn close(self: Box<Self>);
}

/// The shared connection handle every command runs against.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn topics(&self) -> Result<Vec<String>, CliError>;

    /// Partition ids of `topic`, ascending.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, CliError>;

    /// Opens one stream per assignment, all starting at `offset`. Either
    /// every stream opens or none does.
    async fn open(
        &self,
        assignments: &[Assignment],
        offset: Offset,
    ) -> Result<Vec<Box<dyn PartitionStream>>, CliError>;

    /// Sends one message and waits for the broker acknowledgement.
    async fn send(
        &self,
        message: OutgoingMessage,
        required_acks: i16,
    ) -> Result<Delivery, CliError>;
}

pub struct KafkaCluster {
    settings: Settings,
    metadata: Arc<BaseConsumer>,
}

impl KafkaCluster {
    /// Builds the client and checks the brokers answer a metadata request
    /// within the dial timeout.
    pub async fn connect(settings: Settings) -> Result<Self, CliError> {
        let brokers = settings.brokers.join(",");
        let metadata: BaseConsumer = client_config(&settings)
            .create()
            .map_err(|source| CliError::Connection {
                brokers: brokers.clone(),
                source,
            })?;
        let cluster = Self {
            metadata: Arc::new(metadata),
            settings,
        };

        let md = cluster
            .fetch_metadata(None)
            .await?
            .map_err(|source| CliError::Connection { brokers, source })?;
        info!(
            "Connected to {} broker(s) as {}",
            md.brokers,
            cluster.settings.client_id
        );
        debug!(
            "Metadata retries ({} max) are handled by the client; zookeepers {:?} unused",
            cluster.settings.metadata_retry_max, cluster.settings.zookeepers
        );
        Ok(cluster)
    }

    pub fn close(self) {
        info!("Closing connection to {}", self.settings.brokers.join(","));
    }

    /// Metadata calls block, so they run off the async workers.
    async fn fetch_metadata(
        &self,
        topic: Option<String>,
    ) -> Result<KafkaResult<ClusterView>, CliError> {
        let client = Arc::clone(&self.metadata);
        let timeout = self.settings.dial_timeout;
        let view = task::spawn_blocking(move || {
            client
                .fetch_metadata(topic.as_deref(), timeout)
                .map(|md| ClusterView::from(&md))
        })
        .await?;
        Ok(view)
    }

    fn consumer_config(&self) -> Result<ClientConfig, CliError> {
        let mut config = client_config(&self.settings);
        config
            .set("group.id", &self.settings.client_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false");

        if let Some(tuning) = &self.settings.consumer {
            config
                .set(
                    "fetch.wait.max.ms",
                    bounded_millis("maxwaittime", tuning.max_wait_time, 0, 300_000),
                )
                .set(
                    "fetch.error.backoff.ms",
                    bounded_millis("retry.backoff", tuning.retry_backoff, 0, 300_000),
                )
                .set(
                    "fetch.min.bytes",
                    bounded("fetch.min", tuning.fetch_min.into(), 1, 100_000_000),
                )
                .set(
                    "max.partition.fetch.bytes",
                    bounded("fetch.default", tuning.fetch_default.into(), 1, 1_000_000_000),
                )
                .set(
                    "auto.commit.interval.ms",
                    bounded_millis("offsets.commitinterval", tuning.commit_interval, 0, 86_400_000),
                )
                .set("auto.offset.reset", tuning.auto_offset_reset()?);
            if tuning.fetch_max > 0 {
                config.set(
                    "fetch.max.bytes",
                    bounded("fetch.max", tuning.fetch_max.into(), 0, 2_147_483_135),
                );
            }
            debug!(
                "maxprocessingtime {:?} has no client equivalent",
                tuning.max_processing_time
            );
        }
        Ok(config)
    }
}

fn client_config(settings: &Settings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", settings.brokers.join(","))
        .set("client.id", &settings.client_id)
        .set(
            "socket.connection.setup.timeout.ms",
            bounded_millis("net.dialtimeout", settings.dial_timeout, 1_000, i32::MAX.into()),
        )
        .set(
            "socket.timeout.ms",
            bounded_millis("net.readtimeout/writetimeout", settings.socket_timeout, 10, 300_000),
        )
        .set(
            "max.in.flight.requests.per.connection",
            bounded("net.maxopenrequests", settings.max_open_requests.into(), 1, 1_000_000),
        )
        .set(
            "socket.keepalive.enable",
            (!settings.keepalive.is_zero()).to_string(),
        )
        .set(
            "topic.metadata.refresh.interval.ms",
            metadata_refresh(settings.metadata_refresh),
        )
        .set(
            "topic.metadata.refresh.fast.interval.ms",
            bounded_millis("metadata.retry.backoff", settings.metadata_retry_backoff, 1, 60_000),
        )
        .set_log_level(if settings.verbose {
            RDKafkaLogLevel::Debug
        } else {
            RDKafkaLogLevel::Warning
        });

    if let Some(credentials) = &settings.credentials {
        config
            .set("security.protocol", "SASL_PLAINTEXT")
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", &credentials.user)
            .set("sasl.password", &credentials.password);
    }
    config
}

/// Owned copy of the parts of a metadata response this tool reads.
struct ClusterView {
    brokers: usize,
    topics: Vec<TopicView>,
}

struct TopicView {
    name: String,
    partitions: Vec<i32>,
    healthy: bool,
}

impl From<&Metadata> for ClusterView {
    fn from(md: &Metadata) -> Self {
        Self {
            brokers: md.brokers().len(),
            topics: md
                .topics()
                .iter()
                .map(|t| TopicView {
                    name: t.name().to_string(),
                    partitions: t.partitions().iter().map(|p| p.id()).collect(),
                    healthy: t.error().is_none(),
                })
                .collect(),
        }
    }
}

/// Fits a flag value into the range librdkafka accepts for its property.
fn bounded(flag: &str, value: i64, min: i64, max: i64) -> String {
    let fitted = value.clamp(min, max);
    if fitted != value {
        warn!(
            "--{} {} is outside the client range {}..{}, using {}",
            flag, value, min, max, fitted
        );
    }
    fitted.to_string()
}

fn bounded_millis(flag: &str, d: Duration, min: i64, max: i64) -> String {
    bounded(flag, i64::try_from(d.as_millis()).unwrap_or(i64::MAX), min, max)
}

/// Zero disables periodic refresh.
fn metadata_refresh(d: Duration) -> String {
    if d.is_zero() {
        "-1".to_string()
    } else {
        bounded_millis("metadata.refresh", d, 1, 3_600_000)
    }
}

fn kafka_offset(offset: Offset) -> KafkaOffset {
    match offset {
        Offset::Newest => KafkaOffset::End,
        Offset::Oldest => KafkaOffset::Beginning,
        Offset::At(n) => KafkaOffset::Offset(n),
    }
}

#[async_trait]
impl Cluster for KafkaCluster {
    async fn topics(&self) -> Result<Vec<String>, CliError> {
        let md = self.fetch_metadata(None).await??;
        let mut names: Vec<String> = md.topics.into_iter().map(|t| t.name).collect();
        names.sort();
        Ok(names)
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, CliError> {
        let md = self.fetch_metadata(Some(topic.to_string())).await??;
        let mut ids = md
            .topics
            .into_iter()
            .find(|t| t.name == topic)
            .filter(|t| t.healthy && !t.partitions.is_empty())
            .map(|t| t.partitions)
            .ok_or_else(|| CliError::TopicNotFound(topic.to_string()))?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn open(
        &self,
        assignments: &[Assignment],
        offset: Offset,
    ) -> Result<Vec<Box<dyn PartitionStream>>, CliError> {
        let consumer: StreamConsumer = self.consumer_config()?.create()?;
        let consumer = Arc::new(consumer);

        let mut tpl = TopicPartitionList::new();
        for a in assignments {
            tpl.add_partition_offset(&a.topic, a.partition, kafka_offset(offset))
                .map_err(|e| open_error(a, e))?;
        }
        consumer.assign(&tpl)?;

        // Every queue is split before the main queue is first polled, so no
        // record of an assigned partition is delivered there.
        let mut queues = Vec::with_capacity(assignments.len());
        for a in assignments {
            let queue = consumer
                .split_partition_queue(&a.topic, a.partition)
                .ok_or_else(|| open_error(a, "partition queue unavailable"))?;
            queues.push((a.clone(), queue));
        }

        // Partition queues only make progress while the main queue is polled.
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let main = Arc::clone(&consumer);
        let pump = tokio::spawn(async move {
            loop {
                let reason = match main.recv().await {
                    Ok(m) => format!(
                        "record {}({}:{}) arrived outside its partition queue",
                        m.topic(),
                        m.partition(),
                        m.offset()
                    ),
                    Err(e) => e.to_string(),
                };
                if errors_tx.send(reason).is_err() {
                    break;
                }
            }
        });
        let main_queue = Arc::new(MainQueue {
            pump,
            errors: tokio::sync::Mutex::new(errors_rx),
        });

        let mut streams: Vec<Box<dyn PartitionStream>> = Vec::with_capacity(queues.len());
        for (assignment, queue) in queues {
            debug!("Opened {} at offset {}", assignment, offset);
            streams.push(Box::new(KafkaPartitionStream {
                assignment,
                queue,
                main_queue: Arc::clone(&main_queue),
            }));
        }
        Ok(streams)
    }

    async fn send(
        &self,
        message: OutgoingMessage,
        required_acks: i16,
    ) -> Result<Delivery, CliError> {
        let mut config = client_config(&self.settings);
        config.set("request.required.acks", required_acks.to_string());
        let producer: FutureProducer = config.create()?;

        let mut record =
            FutureRecord::<str, [u8]>::to(&message.topic).payload(message.value.as_slice());
        if let Some(key) = message.key.as_deref() {
            record = record.key(key);
        }
        let (partition, offset) = producer
            .send(record, self.settings.socket_timeout)
            .await
            .map_err(|(source, _)| CliError::Send {
                topic: message.topic.clone(),
                source,
            })?;
        Ok(Delivery { partition, offset })
    }
}

fn open_error(a: &Assignment, reason: impl ToString) -> CliError {
    CliError::PartitionOpen {
        topic: a.topic.clone(),
        partition: a.partition,
        reason: reason.to_string(),
    }
}

/// Polls the consumer's main queue for as long as any partition stream
/// lives. Whatever surfaces there is handed to the first stream that asks.
struct MainQueue {
    pump: JoinHandle<()>,
    errors: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl MainQueue {
    async fn next_error(&self) -> String {
        match self.errors.lock().await.recv().await {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

impl Drop for MainQueue {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct KafkaPartitionStream {
    assignment: Assignment,
    queue: StreamPartitionQueue<DefaultConsumerContext>,
    main_queue: Arc<MainQueue>,
}

#[async_trait]
impl PartitionStream for KafkaPartitionStream {
    fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    async fn recv(&mut self) -> Result<Record, CliError> {
        tokio::select! {
            message = self.queue.recv() => match message {
                Ok(message) => Ok(to_record(&message)),
                Err(e) => Err(CliError::Stream {
                    topic: self.assignment.topic.clone(),
                    partition: self.assignment.partition,
                    reason: e.to_string(),
                }),
            },
            reason = self.main_queue.next_error() => Err(CliError::Consumer(reason)),
        }
    }

    async fn close(self: Box<Self>) {
        debug!("Closed {}", self.assignment);
    }
}

fn to_record<M: Message>(message: &M) -> Record {
    let (create_time, log_append_time) = match message.timestamp() {
        Timestamp::CreateTime(ms) => (from_millis(ms), None),
        Timestamp::LogAppendTime(ms) => (None, from_millis(ms)),
        Timestamp::NotAvailable => (None, None),
    };
    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        create_time,
        log_append_time,
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}
