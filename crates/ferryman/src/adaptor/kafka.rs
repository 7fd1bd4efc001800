//! Kafka source and sink.
//!
//! Every topic is a namespace. The reader consumes each topic on its own
//! task and marks records [`Mode::Sync`](crate::message::Mode::Sync) so the
//! pipeline logs them before writing. The writer publishes each message as a
//! JSON payload to the first configured topic.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{parse_duration, DEFAULT_TIMEOUT};
use super::{Adaptor, Role, ALL_ROLES};
use crate::client::{channel, emit, read_fn, Client, NamespaceFilter, ReadFn, Reader, Session, Writer};
use crate::error::{Error, Result};
use crate::message::{Message, MessageSet, Op};
use crate::pipeline::resume::ResumeMap;

/// Default broker list.
pub const DEFAULT_URI: &str = "kafka://localhost:9092";

const DESCRIPTION: &str = "an adaptor that handles publish/subscribe messaging with Kafka";

const SAMPLE_CONFIG: &str = r#"{
  "uri": "kafka://localhost:9092/topic"
  // "timeout": "30s",
  // "topics": ["orders", "users"], // overrides the topics in the uri path
  // "group_id": "",                // random when empty
  // "offset": "latest"             // or "earliest"
}"#;

/// Kafka adaptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Kafka {
    /// `kafka://host:port[,host:port]/topic[,topic]`.
    pub uri: String,
    /// Metadata and delivery timeout.
    pub timeout: String,
    /// Topics to consume or produce to; read from the uri path when empty.
    pub topics: Vec<String>,
    /// Consumer group; a random one is generated when empty.
    pub group_id: String,
    /// Where a new consumer group starts: `latest` or `earliest`.
    pub offset: String,
}

impl Default for Kafka {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            timeout: DEFAULT_TIMEOUT.to_string(),
            topics: Vec::new(),
            group_id: String::new(),
            offset: "latest".to_string(),
        }
    }
}

/// Registry factory.
pub fn factory() -> Box<dyn Adaptor> {
    Box::new(Kafka::default())
}

/// Splits a kafka uri into its broker list and path topics.
fn parse_uri(uri: &str) -> Result<(String, Vec<String>)> {
    let rest = uri.strip_prefix("kafka://").unwrap_or(uri);
    let (brokers, path) = rest.split_once('/').unwrap_or((rest, ""));
    if brokers.is_empty() {
        return Err(Error::InvalidUri(format!("{uri}: no broker given")));
    }
    let topics = path
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect();
    Ok((brokers.to_string(), topics))
}

impl Kafka {
    fn settings(&self) -> Result<KafkaSession> {
        let (brokers, uri_topics) = parse_uri(&self.uri)?;
        let offset = match self.offset.as_str() {
            "latest" | "earliest" => self.offset.clone(),
            other => {
                return Err(Error::Config(format!(
                    "kafka offset must be 'latest' or 'earliest', got '{other}'"
                )))
            }
        };
        let group_id = if self.group_id.is_empty() {
            format!("ferryman-{}", uuid::Uuid::new_v4())
        } else {
            self.group_id.clone()
        };
        Ok(KafkaSession {
            brokers,
            topics: if self.topics.is_empty() {
                uri_topics
            } else {
                self.topics.clone()
            },
            group_id,
            offset,
            timeout: parse_duration(&self.timeout)?,
        })
    }
}

#[async_trait]
impl Adaptor for Kafka {
    fn name(&self) -> &'static str {
        "kafka"
    }

    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn sample_config(&self) -> &'static str {
        SAMPLE_CONFIG
    }

    fn roles(&self) -> &'static [Role] {
        ALL_ROLES
    }

    fn client(&self) -> Result<Box<dyn Client>> {
        Ok(Box::new(KafkaClient {
            settings: self.settings()?,
        }))
    }

    fn reader(&self) -> Result<Box<dyn Reader>> {
        Ok(Box::new(KafkaReader))
    }

    fn writer(&self, session: Session, _cancel: CancellationToken) -> Result<Box<dyn Writer>> {
        KafkaWriter::new(session.into_kafka()?).map(|w| Box::new(w) as Box<dyn Writer>)
    }
}

/// Broker settings shared by readers and writers.
#[derive(Debug, Clone)]
pub struct KafkaSession {
    /// Comma separated `host:port` list.
    pub brokers: String,
    /// Configured topics; empty means every topic on the cluster.
    pub topics: Vec<String>,
    /// Consumer group id.
    pub group_id: String,
    /// `auto.offset.reset` value.
    pub offset: String,
    /// Metadata and delivery timeout.
    pub timeout: Duration,
}

impl KafkaSession {
    fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", &self.offset);
        config
    }

    /// Lists the topics known to the cluster. Internal topics are skipped.
    async fn cluster_topics(&self) -> Result<Vec<String>> {
        let config = self.consumer_config();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let consumer: BaseConsumer = config.create()?;
            let metadata = consumer.fetch_metadata(None, timeout)?;
            let mut topics: Vec<String> = metadata
                .topics()
                .iter()
                .map(|t| t.name().to_string())
                .filter(|name| !name.starts_with("__"))
                .collect();
            topics.sort();
            Ok(topics)
        })
        .await
        .map_err(|e| Error::Kafka(format!("metadata task failed: {e}")))?
    }
}

/// Checks that the brokers answer a metadata request.
pub struct KafkaClient {
    settings: KafkaSession,
}

#[async_trait]
impl Client for KafkaClient {
    async fn connect(&mut self) -> Result<Session> {
        let topics = self
            .settings
            .cluster_topics()
            .await
            .map_err(|e| Error::Connect(format!("{}: {e}", self.settings.brokers)))?;
        debug!(brokers = %self.settings.brokers, topics = topics.len(), "connected to kafka");
        Ok(Session::Kafka(self.settings.clone()))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Consumes every topic accepted by the filter, one task per topic.
pub struct KafkaReader;

impl Reader for KafkaReader {
    fn read(&self, _resume: ResumeMap, filter: NamespaceFilter) -> ReadFn {
        read_fn(move |session: Session, cancel: CancellationToken| async move {
            let session = session.into_kafka()?;
            let topics = if session.topics.is_empty() {
                let topics = session.cluster_topics().await?;
                info!(topics = ?topics, "no topic name given, consuming from every topic");
                topics
            } else {
                info!(topics = ?session.topics, "consuming from topics");
                session.topics.clone()
            };
            let topics: Vec<String> = topics.into_iter().filter(|t| filter.matches(t)).collect();

            let mut consumers = Vec::with_capacity(topics.len());
            for topic in &topics {
                let consumer: StreamConsumer = session.consumer_config().create()?;
                consumer.subscribe(&[topic.as_str()])?;
                consumers.push((topic.clone(), consumer));
            }

            let (tx, rx) = channel();
            for (topic, consumer) in consumers {
                let tx = tx.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    consume_topic(&topic, consumer, &tx, &cancel).await;
                    info!(topic = %topic, "consuming complete");
                });
            }
            Ok(rx)
        })
    }
}

async fn consume_topic(
    topic: &str,
    consumer: StreamConsumer,
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = consumer.recv() => received,
        };
        let set = match received {
            Ok(record) => {
                let Some(payload) = record.payload() else {
                    continue;
                };
                match serde_json::from_slice::<Value>(payload) {
                    Ok(value) => {
                        debug!(topic = %topic, offset = record.offset(), "record received");
                        MessageSet::sync(Message::from_value(Op::Insert, topic, value))
                    }
                    Err(e) => {
                        error!(topic = %topic, error = %e, "unable to decode message to JSON");
                        continue;
                    }
                }
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "error while consuming");
                continue;
            }
        };
        if !emit(tx, cancel, set).await {
            break;
        }
    }
    consumer.unsubscribe();
}

/// Publishes messages as JSON to the first configured topic.
pub struct KafkaWriter {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaWriter {
    fn new(session: KafkaSession) -> Result<Self> {
        let topic = session
            .topics
            .first()
            .cloned()
            .ok_or_else(|| Error::Config("kafka writer needs a topic".to_string()))?;
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &session.brokers)
            .set(
                "message.timeout.ms",
                session.timeout.as_millis().to_string(),
            )
            .create()?;
        Ok(Self {
            producer,
            topic,
            timeout: session.timeout,
        })
    }
}

#[async_trait]
impl Writer for KafkaWriter {
    async fn write(&self, mut msg: Message) -> Result<()> {
        let payload = serde_json::to_vec(&msg.data)?;
        let key = msg.id().unwrap_or_else(|| msg.namespace.clone());
        let record = FutureRecord::to(&self.topic)
            .key(key.as_str())
            .payload(payload.as_slice());
        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| Error::from(e))?;
        msg.ack();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| Error::Kafka(format!("flush task failed: {e}")))??;
        Ok(())
    }
}
