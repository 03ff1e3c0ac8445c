//! Sled-backed embedded stream broker.

use std::path::Path;
use std::time::Duration as StdDuration;

use cartographus_types::Fingerprint;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sled::{Db, Tree};
use tokio::time::Instant;

use crate::error::{BrokerError, Result};
use crate::types::{BrokerMessage, ConsumerConfig, Delivery, PublishOutcome, RetentionPolicy, StreamConfig};

const DEAD_LETTER_SUFFIX: &str = ".dead_letter";

fn stream_prefix(name: &str) -> [u8; 8] {
    let hash = blake3::hash(name.as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash.as_bytes()[0..8]);
    out
}

fn message_key(prefix: [u8; 8], sequence: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[0..8].copy_from_slice(&prefix);
    key[8..16].copy_from_slice(&sequence.to_be_bytes());
    key
}

fn inflight_prefix(consumer: &str) -> Vec<u8> {
    let mut key = consumer.as_bytes().to_vec();
    key.push(0);
    key
}

fn inflight_key(consumer: &str, sequence: u64) -> Vec<u8> {
    let mut key = inflight_prefix(consumer);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// An embedded, durable, multi-subject stream broker.
///
/// Four trees cooperate: `streams` holds declarations, `messages` holds
/// the append-only per-stream log, `dedup_window` implements the
/// publisher-side stream dedup described in §4.6, `consumers` persists
/// each durable consumer's cursor, and `inflight` tracks fetched-but-
/// unacked deliveries so `ack_wait` redelivery survives a restart.
pub struct SledBroker {
    _db: Db,
    streams: Tree,
    messages: Tree,
    dedup_window: Tree,
    consumers: Tree,
    inflight: Tree,
    acks: Tree,
}

impl SledBroker {
    /// Open or create a broker at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::Config::default().path(path).open()?;
        Self::from_db(db)
    }

    /// Open a temporary, auto-cleaned broker for tests.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(Self {
            streams: db.open_tree("broker_streams")?,
            messages: db.open_tree("broker_messages")?,
            dedup_window: db.open_tree("broker_dedup_window")?,
            consumers: db.open_tree("broker_consumers")?,
            inflight: db.open_tree("broker_inflight")?,
            acks: db.open_tree("broker_acks")?,
            _db: db,
        })
    }

    /// Declare (or redeclare) a stream.
    pub fn declare_stream(&self, config: StreamConfig) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(&config)?;
        self.streams.insert(config.name.as_bytes(), bytes)?;
        tracing::info!(stream = %config.name, "stream declared");
        Ok(())
    }

    fn load_stream(&self, name: &str) -> Result<StreamConfig> {
        let bytes = self
            .streams
            .get(name.as_bytes())?
            .ok_or_else(|| BrokerError::UnknownStream(name.to_string()))?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    fn stream_for_subject(&self, subject: &str) -> Result<StreamConfig> {
        for item in self.streams.iter() {
            let (_, value) = item?;
            let config: StreamConfig = rmp_serde::from_slice(&value)?;
            if config.subjects.iter().any(|pattern| subject.starts_with(pattern.as_str())) {
                return Ok(config);
            }
        }
        Err(BrokerError::NoMatchingStream(subject.to_string()))
    }

    fn next_sequence(&self, stream: &str) -> Result<u64> {
        let updated = self
            .messages
            .update_and_fetch(format!("__seq__{stream}").as_bytes(), |old| {
                let next = old
                    .and_then(|bytes| bytes.try_into().ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(0)
                    + 1;
                Some(next.to_be_bytes().to_vec())
            })?
            .expect("update_and_fetch always returns Some when the closure returns Some");
        Ok(u64::from_be_bytes(updated.as_ref().try_into().expect("8 bytes")))
    }

    /// Publish `payload` under `subject`. Returns the assigned sequence,
    /// or the original sequence when the stream-level dedup window
    /// collapses this publish into an earlier one.
    pub fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        fingerprint: Fingerprint,
        wal_key: String,
    ) -> Result<PublishOutcome> {
        let stream = self.stream_for_subject(subject)?;
        let prefix = stream_prefix(&stream.name);
        let now = Utc::now();

        let dedup_key = {
            let mut key = prefix.to_vec();
            key.extend_from_slice(&fingerprint);
            key
        };

        if let Some(existing) = self.dedup_window.get(&dedup_key)? {
            let seq = u64::from_be_bytes(existing[0..8].try_into().expect("8 bytes"));
            let published_millis = i64::from_be_bytes(existing[8..16].try_into().expect("8 bytes"));
            let published_at = DateTime::from_timestamp_millis(published_millis).unwrap_or(now);
            if now - published_at < stream.dedup_window() {
                tracing::debug!(stream = %stream.name, sequence = seq, "stream dedup window hit");
                return Ok(PublishOutcome {
                    sequence: seq,
                    deduplicated: true,
                });
            }
        }

        let sequence = self.next_sequence(&stream.name)?;
        let message = BrokerMessage {
            subject: subject.to_string(),
            sequence,
            payload,
            fingerprint,
            wal_key,
            timestamp: now,
            delivery_count: 0,
        };
        let bytes = rmp_serde::to_vec_named(&message)?;
        self.messages.insert(message_key(prefix, sequence), bytes)?;

        let mut dedup_value = sequence.to_be_bytes().to_vec();
        dedup_value.extend_from_slice(&now.timestamp_millis().to_be_bytes());
        self.dedup_window.insert(dedup_key, dedup_value)?;

        Ok(PublishOutcome {
            sequence,
            deduplicated: false,
        })
    }

    /// Register a durable consumer, creating its cursor at the tail of
    /// the stream if it does not already exist.
    pub fn declare_consumer(&self, config: ConsumerConfig) -> Result<()> {
        // load_stream validates the stream exists before persisting.
        self.load_stream(&config.stream)?;
        if self.consumers.get(config.name.as_bytes())?.is_some() {
            return Ok(());
        }
        let record = PersistedConsumer {
            stream: config.stream,
            filter_subject: config.filter_subject,
            cursor: 0,
            ack_wait_secs: config.ack_wait.num_seconds().max(1) as u64,
            max_inflight: config.max_inflight,
            max_deliveries: config.max_deliveries,
        };
        let bytes = rmp_serde::to_vec_named(&record)?;
        self.consumers.insert(config.name.as_bytes(), bytes)?;
        Ok(())
    }

    fn load_consumer(&self, name: &str) -> Result<PersistedConsumer> {
        let bytes = self
            .consumers
            .get(name.as_bytes())?
            .ok_or_else(|| BrokerError::UnknownConsumer(name.to_string()))?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    fn store_consumer(&self, name: &str, record: &PersistedConsumer) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(record)?;
        self.consumers.insert(name.as_bytes(), bytes)?;
        Ok(())
    }

    fn load_message(&self, prefix: [u8; 8], sequence: u64) -> Result<Option<BrokerMessage>> {
        match self.messages.get(message_key(prefix, sequence))? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn redeliver_timed_out(&self, consumer: &str, record: &mut PersistedConsumer, prefix: [u8; 8], now: DateTime<Utc>, out: &mut Vec<Delivery>, budget: usize) -> Result<()> {
        let mut expired = Vec::new();
        for item in self.inflight.scan_prefix(inflight_prefix(consumer)) {
            if out.len() >= budget {
                break;
            }
            let (key, value) = item?;
            let deadline_millis = i64::from_be_bytes(value[0..8].try_into().expect("8 bytes"));
            let deadline = DateTime::from_timestamp_millis(deadline_millis).unwrap_or(now);
            if deadline > now {
                continue;
            }
            let delivery_count = u32::from_be_bytes(value[8..12].try_into().expect("4 bytes"));
            expired.push((key.to_vec(), delivery_count));
        }

        for (key, delivery_count) in expired {
            let sequence = u64::from_be_bytes(key[key.len() - 8..].try_into().expect("8 bytes"));
            let Some(mut message) = self.load_message(prefix, sequence)? else {
                self.inflight.remove(&key)?;
                continue;
            };

            if delivery_count + 1 > record.max_deliveries {
                self.dead_letter(&message, consumer)?;
                self.inflight.remove(&key)?;
                continue;
            }

            let new_deadline = now + ChronoDuration::seconds(record.ack_wait_secs as i64);
            let mut value = new_deadline.timestamp_millis().to_be_bytes().to_vec();
            value.extend_from_slice(&(delivery_count + 1).to_be_bytes());
            self.inflight.insert(&key, value)?;

            message.delivery_count = delivery_count + 1;
            out.push(Delivery {
                message,
                consumer: consumer.to_string(),
            });
        }
        Ok(())
    }

    fn dead_letter(&self, message: &BrokerMessage, consumer: &str) -> Result<()> {
        let stream = self.stream_for_subject(&message.subject)?;
        let prefix = stream_prefix(&stream.name);
        let sequence = self.next_sequence(&stream.name)?;
        let mut dead = message.clone();
        dead.subject = format!("{}{DEAD_LETTER_SUFFIX}", message.subject);
        dead.sequence = sequence;
        let bytes = rmp_serde::to_vec_named(&dead)?;
        self.messages.insert(message_key(prefix, sequence), bytes)?;
        self.register_ack(&stream.name, message.sequence, consumer)?;
        tracing::warn!(subject = %message.subject, consumer, "message dead-lettered");
        Ok(())
    }

    fn register_ack(&self, stream: &str, sequence: u64, consumer: &str) -> Result<()> {
        let prefix = stream_prefix(stream);
        let key = message_key(prefix, sequence);
        let mut acked: Vec<String> = match self.acks.get(key)? {
            Some(bytes) => rmp_serde::from_slice(&bytes)?,
            None => Vec::new(),
        };
        if !acked.iter().any(|c| c == consumer) {
            acked.push(consumer.to_string());
        }
        self.acks.insert(key, rmp_serde::to_vec_named(&acked)?)?;
        Ok(())
    }

    /// Pull up to `batch` deliveries for `consumer`, waiting up to
    /// `timeout` for new messages to arrive if none are immediately
    /// available. Timed-out in-flight redeliveries are served first.
    pub async fn fetch(&self, consumer: &str, batch: usize, timeout: StdDuration) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut record = self.load_consumer(consumer)?;
            let prefix = stream_prefix(&record.stream);
            let now = Utc::now();
            let mut out = Vec::with_capacity(batch);

            self.redeliver_timed_out(consumer, &mut record, prefix, now, &mut out, batch)?;

            let inflight_count = self.inflight.scan_prefix(inflight_prefix(consumer)).count();
            let mut budget = batch.saturating_sub(out.len());
            budget = budget.min(record.max_inflight.saturating_sub(inflight_count));

            let mut cursor = record.cursor;
            while budget > 0 {
                cursor += 1;
                match self.load_message(prefix, cursor)? {
                    Some(message) if message.subject.ends_with(DEAD_LETTER_SUFFIX) => {
                        // dead-lettered copies are informational only, skip past them
                        record.cursor = cursor;
                        continue;
                    }
                    Some(message) => {
                        if let Some(filter) = &record.filter_subject {
                            if !message.subject.starts_with(filter.as_str()) {
                                record.cursor = cursor;
                                continue;
                            }
                        }
                        let key = inflight_key(consumer, cursor);
                        let expires_at = now + ChronoDuration::seconds(record.ack_wait_secs as i64);
                        let mut value = expires_at.timestamp_millis().to_be_bytes().to_vec();
                        value.extend_from_slice(&1u32.to_be_bytes());
                        self.inflight.insert(key, value)?;

                        record.cursor = cursor;
                        let mut delivered = message;
                        delivered.delivery_count = 1;
                        out.push(Delivery {
                            message: delivered,
                            consumer: consumer.to_string(),
                        });
                        budget -= 1;
                    }
                    None => {
                        cursor -= 1;
                        break;
                    }
                }
            }

            self.store_consumer(consumer, &record)?;

            if !out.is_empty() || Instant::now() >= deadline {
                return Ok(out);
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
    }

    /// Acknowledge `sequence` for `consumer`, releasing its in-flight
    /// entry.
    pub fn ack(&self, consumer: &str, sequence: u64) -> Result<()> {
        let key = inflight_key(consumer, sequence);
        if self.inflight.remove(&key)?.is_none() {
            return Err(BrokerError::NotInFlight {
                consumer: consumer.to_string(),
                sequence,
            });
        }
        let record = self.load_consumer(consumer)?;
        self.register_ack(&record.stream, sequence, consumer)?;
        Ok(())
    }

    /// Negatively acknowledge `sequence`, making it immediately eligible
    /// for redelivery on the next `Fetch` rather than waiting out
    /// `ack_wait`.
    pub fn nack(&self, consumer: &str, sequence: u64) -> Result<()> {
        let key = inflight_key(consumer, sequence);
        let Some(existing) = self.inflight.get(&key)? else {
            return Err(BrokerError::NotInFlight {
                consumer: consumer.to_string(),
                sequence,
            });
        };
        let delivery_count = u32::from_be_bytes(existing[8..12].try_into().expect("4 bytes"));
        let mut value = Utc::now().timestamp_millis().to_be_bytes().to_vec();
        value.extend_from_slice(&delivery_count.to_be_bytes());
        self.inflight.insert(key, value)?;
        Ok(())
    }

    /// Run the retention sweep across every declared stream. Returns the
    /// number of messages physically removed.
    pub fn gc(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0usize;
        let mut configs = Vec::new();
        for item in self.streams.iter() {
            let (_, value) = item?;
            configs.push(rmp_serde::from_slice::<StreamConfig>(&value)?);
        }

        for config in configs {
            let prefix = stream_prefix(&config.name);
            match &config.retention {
                RetentionPolicy::Time { max_age_secs } => {
                    let cutoff = now - ChronoDuration::seconds(*max_age_secs);
                    removed += self.sweep_stream(prefix, |msg| msg.timestamp < cutoff)?;
                }
                RetentionPolicy::Ack => {
                    let consumers = self.consumers_for_stream(&config.name)?;
                    removed += self.sweep_stream(prefix, |msg| {
                        self.all_consumers_acked(&config.name, msg.sequence, &consumers)
                    })?;
                }
                RetentionPolicy::Limits { max_messages } => {
                    removed += self.sweep_over_limit(prefix, *max_messages)?;
                }
            }
        }
        tracing::info!(removed, "broker retention sweep complete");
        Ok(removed)
    }

    fn consumers_for_stream(&self, stream: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for item in self.consumers.iter() {
            let (key, value) = item?;
            let record: PersistedConsumer = rmp_serde::from_slice(&value)?;
            if record.stream == stream {
                names.push(String::from_utf8_lossy(&key).to_string());
            }
        }
        Ok(names)
    }

    fn all_consumers_acked(&self, stream: &str, sequence: u64, consumers: &[String]) -> bool {
        if consumers.is_empty() {
            return false;
        }
        let prefix = stream_prefix(stream);
        let key = message_key(prefix, sequence);
        let acked: Vec<String> = match self.acks.get(key) {
            Ok(Some(bytes)) => rmp_serde::from_slice(&bytes).unwrap_or_default(),
            _ => Vec::new(),
        };
        consumers.iter().all(|c| acked.contains(c))
    }

    fn sweep_stream(&self, prefix: [u8; 8], mut doomed: impl FnMut(&BrokerMessage) -> bool) -> Result<usize> {
        let mut removed = 0usize;
        let mut keys = Vec::new();
        for item in self.messages.scan_prefix(prefix) {
            let (key, value) = item?;
            if key.len() != 16 {
                continue;
            }
            let message: BrokerMessage = rmp_serde::from_slice(&value)?;
            if doomed(&message) {
                keys.push(key.to_vec());
            }
        }
        for key in keys {
            self.messages.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn sweep_over_limit(&self, prefix: [u8; 8], max_messages: u64) -> Result<usize> {
        let mut keys = Vec::new();
        for item in self.messages.scan_prefix(prefix) {
            let (key, _) = item?;
            if key.len() == 16 {
                keys.push(key.to_vec());
            }
        }
        let over = keys.len().saturating_sub(max_messages as usize);
        let mut removed = 0usize;
        for key in keys.into_iter().take(over) {
            self.messages.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PersistedConsumer {
    stream: String,
    filter_subject: Option<String>,
    cursor: u64,
    ack_wait_secs: u64,
    max_inflight: usize,
    max_deliveries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(name: &str, window_secs: u64) -> StreamConfig {
        StreamConfig {
            name: name.to_string(),
            subjects: vec![name.to_string()],
            retention: RetentionPolicy::Limits { max_messages: 1000 },
            max_bytes: 1024 * 1024,
            dedup_window_secs: window_secs,
        }
    }

    #[tokio::test]
    async fn publish_then_fetch_delivers_in_order() {
        let broker = SledBroker::temporary().unwrap();
        broker.declare_stream(stream("plex.play", 5)).unwrap();
        broker
            .declare_consumer(ConsumerConfig {
                stream: "plex.play".to_string(),
                name: "workers".to_string(),
                filter_subject: None,
                ack_wait: ChronoDuration::seconds(5),
                max_inflight: 10,
                max_deliveries: 3,
            })
            .unwrap();

        broker
            .publish("plex.play", b"one".to_vec(), [1u8; 32], "1:1".to_string())
            .unwrap();
        broker
            .publish("plex.play", b"two".to_vec(), [2u8; 32], "2:1".to_string())
            .unwrap();

        let delivered = broker
            .fetch("workers", 10, StdDuration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].message.payload, b"one");
        assert_eq!(delivered[1].message.payload, b"two");
    }

    #[tokio::test]
    async fn duplicate_fingerprint_within_window_collapses() {
        let broker = SledBroker::temporary().unwrap();
        broker.declare_stream(stream("plex.play", 60)).unwrap();

        let first = broker
            .publish("plex.play", b"one".to_vec(), [9u8; 32], "1:1".to_string())
            .unwrap();
        let second = broker
            .publish("plex.play", b"one-again".to_vec(), [9u8; 32], "2:1".to_string())
            .unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.sequence, second.sequence);
    }

    #[tokio::test]
    async fn ack_removes_message_from_inflight() {
        let broker = SledBroker::temporary().unwrap();
        broker.declare_stream(stream("plex.play", 5)).unwrap();
        broker
            .declare_consumer(ConsumerConfig {
                stream: "plex.play".to_string(),
                name: "workers".to_string(),
                filter_subject: None,
                ack_wait: ChronoDuration::seconds(5),
                max_inflight: 10,
                max_deliveries: 3,
            })
            .unwrap();
        broker
            .publish("plex.play", b"one".to_vec(), [1u8; 32], "1:1".to_string())
            .unwrap();
        let delivered = broker
            .fetch("workers", 10, StdDuration::from_millis(50))
            .await
            .unwrap();

        broker.ack("workers", delivered[0].message.sequence).unwrap();
        let result = broker.ack("workers", delivered[0].message.sequence);
        assert!(matches!(result, Err(BrokerError::NotInFlight { .. })));
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered_after_ack_wait() {
        let broker = SledBroker::temporary().unwrap();
        broker.declare_stream(stream("plex.play", 5)).unwrap();
        broker
            .declare_consumer(ConsumerConfig {
                stream: "plex.play".to_string(),
                name: "workers".to_string(),
                filter_subject: None,
                ack_wait: ChronoDuration::milliseconds(-1),
                max_inflight: 10,
                max_deliveries: 3,
            })
            .unwrap();
        broker
            .publish("plex.play", b"one".to_vec(), [1u8; 32], "1:1".to_string())
            .unwrap();

        let first = broker
            .fetch("workers", 10, StdDuration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let redelivered = broker
            .fetch("workers", 10, StdDuration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].message.delivery_count, 2);
    }

    #[tokio::test]
    async fn exceeding_max_deliveries_dead_letters_the_message() {
        let broker = SledBroker::temporary().unwrap();
        broker.declare_stream(stream("plex.play", 5)).unwrap();
        broker
            .declare_consumer(ConsumerConfig {
                stream: "plex.play".to_string(),
                name: "workers".to_string(),
                filter_subject: None,
                ack_wait: ChronoDuration::milliseconds(-1),
                max_inflight: 10,
                max_deliveries: 1,
            })
            .unwrap();
        broker
            .publish("plex.play", b"one".to_vec(), [1u8; 32], "1:1".to_string())
            .unwrap();

        broker.fetch("workers", 10, StdDuration::from_millis(50)).await.unwrap();
        let redelivered = broker
            .fetch("workers", 10, StdDuration::from_millis(50))
            .await
            .unwrap();
        assert!(redelivered.is_empty(), "message should have been dead-lettered, not redelivered");
    }
}
