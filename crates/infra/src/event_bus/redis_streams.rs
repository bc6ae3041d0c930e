//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! One stream per subject (`fakturenn:events:<subject>`), one Redis consumer
//! group per durable group. Messages persist until XACK'd; entries pending
//! longer than the visibility window are XCLAIM'd and redelivered, and
//! entries exceeding the retry limit move to a dead-letter stream.
//!
//! A background thread per subscription polls Redis and forwards deliveries
//! over a channel; the ack responder issues XACK only after the consumer
//! settles the delivery, so a crashed consumer's messages redeliver.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, warn};

use fakturenn_events::bus::{
    AckDisposition, BusRecvError, BusSubscription, Delivery, EventBus,
};

/// Default stream key prefix; the subject is appended per stream.
const DEFAULT_STREAM_PREFIX: &str = "fakturenn:events";

/// Default dead-letter stream.
const DEFAULT_DLQ_KEY: &str = "fakturenn:events:dlq";

/// Default max delivery attempts before dead-lettering.
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default visibility window: pending entries older than this are
/// redelivered.
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

pub struct RedisStreamsEventBus<M> {
    client: Arc<redis::Client>,
    stream_prefix: String,
    dlq_key: String,
    max_retries: u32,
    pending_timeout_ms: u64,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Clone for RedisStreamsEventBus<M> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            stream_prefix: self.stream_prefix.clone(),
            dlq_key: self.dlq_key.clone(),
            max_retries: self.max_retries,
            pending_timeout_ms: self.pending_timeout_ms,
            _marker: PhantomData,
        }
    }
}

impl<M> RedisStreamsEventBus<M> {
    /// Create a bus over `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            dlq_key: DEFAULT_DLQ_KEY.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
            _marker: PhantomData,
        })
    }

    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    pub fn with_visibility_timeout(mut self, visibility: Duration) -> Self {
        self.pending_timeout_ms = visibility.as_millis() as u64;
        self
    }

    fn stream_key(&self, subject: &str) -> String {
        format!("{}:{subject}", self.stream_prefix)
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Ensure a consumer group exists (idempotent; the "group already
    /// exists" error is ignored).
    fn ensure_consumer_group(
        &self,
        stream_key: &str,
        group_name: &str,
    ) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        Ok(())
    }

    fn acknowledge(&self, stream_key: &str, group_name: &str, message_id: &str) {
        match self.connection() {
            Ok(mut conn) => {
                let result: Result<u64, _> = redis::cmd("XACK")
                    .arg(stream_key)
                    .arg(group_name)
                    .arg(message_id)
                    .query(&mut conn);
                if let Err(e) = result {
                    error!(message_id, "XACK failed: {e}");
                }
            }
            Err(e) => error!(message_id, "acknowledge connection failed: {e}"),
        }
    }

    fn send_to_dlq(&self, stream_key: &str, message_id: &str, payload: &str, attempts: u32) {
        match self.connection() {
            Ok(mut conn) => {
                let result: Result<String, _> = redis::cmd("XADD")
                    .arg(&self.dlq_key)
                    .arg("*")
                    .arg("origin_stream")
                    .arg(stream_key)
                    .arg("original_message_id")
                    .arg(message_id)
                    .arg("attempts")
                    .arg(attempts.to_string())
                    .arg("failed_at")
                    .arg(chrono::Utc::now().to_rfc3339())
                    .arg("payload")
                    .arg(payload)
                    .query(&mut conn);
                match result {
                    Ok(_) => warn!(message_id, attempts, "message sent to dead-letter stream"),
                    Err(e) => error!(message_id, "DLQ XADD failed: {e}"),
                }
            }
            Err(e) => error!(message_id, "DLQ connection failed: {e}"),
        }
    }
}

/// Raw entry pulled from a stream.
struct StreamEntry {
    message_id: String,
    payload: String,
    attempt: u32,
}

impl<M> RedisStreamsEventBus<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    fn publish_sync(&self, subject: &str, message: &M) -> Result<(), RedisStreamsError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;

        let mut conn = self.connection()?;
        let _: String = redis::cmd("XADD")
            .arg(self.stream_key(subject))
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    /// Claim entries pending past the visibility window (redelivery), then
    /// read new entries.
    fn read_group(
        &self,
        stream_key: &str,
        group_name: &str,
        consumer_name: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, RedisStreamsError> {
        let mut conn = self.connection()?;

        let pending =
            self.claim_expired(&mut conn, stream_key, group_name, consumer_name, count)?;
        if !pending.is_empty() {
            return Ok(pending);
        }

        self.read_new(&mut conn, stream_key, group_name, consumer_name, count, block_ms)
    }

    fn claim_expired(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
        group_name: &str,
        consumer_name: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, RedisStreamsError> {
        // XPENDING summary form: (id, consumer, idle_ms, delivery_count)
        let pending_info: redis::RedisResult<Vec<(String, String, u64, u64)>> =
            redis::cmd("XPENDING")
                .arg(stream_key)
                .arg(group_name)
                .arg("IDLE")
                .arg(self.pending_timeout_ms.to_string())
                .arg("-")
                .arg("+")
                .arg(count.to_string())
                .query(conn);

        let pending = match pending_info {
            Ok(entries) => entries,
            Err(_) => return Ok(vec![]),
        };
        if pending.is_empty() {
            return Ok(vec![]);
        }

        let attempts: HashMap<String, u32> = pending
            .iter()
            .map(|(id, _, _, delivered)| (id.clone(), *delivered as u32))
            .collect();
        let ids: Vec<String> = pending.into_iter().map(|(id, _, _, _)| id).collect();

        let claimed: redis::RedisResult<Vec<redis::Value>> = redis::cmd("XCLAIM")
            .arg(stream_key)
            .arg(group_name)
            .arg(consumer_name)
            .arg(self.pending_timeout_ms.to_string())
            .arg(&ids[..])
            .query(conn);

        let entries = match claimed {
            Ok(entries) => entries,
            Err(_) => return Ok(vec![]),
        };

        let mut result = Vec::new();
        for entry in entries {
            if let Ok(mut parsed) = parse_stream_entry(entry) {
                // The claim itself is one more delivery.
                parsed.attempt = attempts
                    .get(&parsed.message_id)
                    .copied()
                    .unwrap_or(0)
                    .saturating_add(1);
                result.push(parsed);
            }
        }
        Ok(result)
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
        group_name: &str,
        consumer_name: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, RedisStreamsError> {
        let result: redis::RedisResult<HashMap<String, Vec<redis::Value>>> =
            redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(group_name)
                .arg(consumer_name)
                .arg("COUNT")
                .arg(count.to_string())
                .arg("BLOCK")
                .arg(block_ms.to_string())
                .arg("STREAMS")
                .arg(stream_key)
                .arg(">")
                .query(conn);

        let stream_data = match result {
            Ok(data) => data,
            // A nil reply (blocking timeout, no new messages) surfaces as a
            // type error in redis-rs.
            Err(_) => return Ok(vec![]),
        };

        let entries = stream_data.get(stream_key).cloned().unwrap_or_default();
        let mut parsed = Vec::new();
        for entry in entries {
            if let Ok(e) = parse_stream_entry(entry) {
                parsed.push(e);
            }
        }
        Ok(parsed)
    }
}

/// Parse `[message_id, [field, value, ...]]` into a `StreamEntry`.
fn parse_stream_entry(entry: redis::Value) -> Result<StreamEntry, RedisStreamsError> {
    let entry_vec: Vec<redis::Value> = match entry {
        redis::Value::Bulk(v) => v,
        _ => return Err(RedisStreamsError::Deserialization("invalid entry format".into())),
    };
    if entry_vec.len() < 2 {
        return Err(RedisStreamsError::Deserialization("entry too short".into()));
    }

    let message_id = match &entry_vec[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        _ => return Err(RedisStreamsError::Deserialization("invalid message id".into())),
    };

    let fields_vec: Vec<redis::Value> = match &entry_vec[1] {
        redis::Value::Bulk(v) => v.clone(),
        _ => return Err(RedisStreamsError::Deserialization("invalid fields format".into())),
    };

    let mut payload = None;
    for chunk in fields_vec.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            if key.as_slice() == b"payload".as_slice() {
                payload = Some(String::from_utf8_lossy(value).to_string());
            }
        }
    }

    let payload = payload
        .ok_or_else(|| RedisStreamsError::Deserialization("missing payload field".into()))?;
    Ok(StreamEntry {
        message_id,
        payload,
        attempt: 1,
    })
}

impl<M> EventBus<M> for RedisStreamsEventBus<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    type Error = RedisStreamsError;
    type Subscription = RedisStreamsSubscription<M>;

    fn publish(&self, subject: &str, message: M) -> Result<(), Self::Error> {
        self.publish_sync(subject, &message)
    }

    fn subscribe(&self, subject: &str, durable_group: &str) -> Self::Subscription {
        let stream_key = self.stream_key(subject);
        let group_name = durable_group.to_string();
        let consumer_name = format!("consumer-{}", uuid::Uuid::now_v7());

        if let Err(e) = self.ensure_consumer_group(&stream_key, &group_name) {
            error!(stream = %stream_key, group = %group_name, "failed to create consumer group: {e}");
        }

        let (tx, rx) = mpsc::channel::<Delivery<M>>();
        let bus = self.clone();

        std::thread::spawn(move || {
            poll_loop(bus, stream_key, group_name, consumer_name, tx);
        });

        RedisStreamsSubscription { receiver: rx }
    }
}

fn poll_loop<M>(
    bus: RedisStreamsEventBus<M>,
    stream_key: String,
    group_name: String,
    consumer_name: String,
    tx: mpsc::Sender<Delivery<M>>,
) where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    loop {
        let entries = match bus.read_group(&stream_key, &group_name, &consumer_name, 10, 100) {
            Ok(entries) => entries,
            Err(e) => {
                error!(stream = %stream_key, "failed to read from stream: {e}");
                std::thread::sleep(Duration::from_millis(500));
                continue;
            }
        };

        for entry in entries {
            if entry.attempt > bus.max_retries {
                bus.send_to_dlq(&stream_key, &entry.message_id, &entry.payload, entry.attempt);
                bus.acknowledge(&stream_key, &group_name, &entry.message_id);
                continue;
            }

            let message: M = match serde_json::from_str(&entry.payload) {
                Ok(m) => m,
                Err(e) => {
                    error!(message_id = %entry.message_id, "undecodable payload: {e}");
                    bus.send_to_dlq(&stream_key, &entry.message_id, &entry.payload, entry.attempt);
                    bus.acknowledge(&stream_key, &group_name, &entry.message_id);
                    continue;
                }
            };

            let responder_bus = bus.clone();
            let responder_stream = stream_key.clone();
            let responder_group = group_name.clone();
            let message_id = entry.message_id.clone();
            let delivery = Delivery::new(message, entry.attempt, move |disposition| {
                // Nak leaves the entry pending; the visibility window
                // redelivers it.
                if disposition == AckDisposition::Ack {
                    responder_bus.acknowledge(&responder_stream, &responder_group, &message_id);
                }
            });

            if tx.send(delivery).is_err() {
                return; // subscription dropped
            }
        }

        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Channel-backed subscription fed by the polling thread.
pub struct RedisStreamsSubscription<M> {
    receiver: mpsc::Receiver<Delivery<M>>,
}

impl<M> BusSubscription<M> for RedisStreamsSubscription<M>
where
    M: Send,
{
    fn recv_timeout(&self, timeout: Duration) -> Result<Delivery<M>, BusRecvError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(delivery) => Ok(delivery),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(BusRecvError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(BusRecvError::Closed),
        }
    }
}
