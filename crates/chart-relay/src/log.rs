//! Durable, capped, session-scoped event logs over a `KvStore`
//!
//! One stored record per `(family, session)` pair: a JSON array of events,
//! oldest first. The chart flavor is a log of current chart identities
//! (replace-on-id keeps one entry per chart id); the message flavor is a
//! plain append log.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StorageError;
use crate::event::{id_timestamp_ms, Event, LogFamily, SessionKey};
use crate::kv::KvStore;

const DEFAULT_CHART_CAP: usize = 50;
const DEFAULT_MESSAGE_CAP: usize = 100;
const DEFAULT_CHART_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Retention settings per log family
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub chart_cap: usize,
    pub message_cap: usize,
    /// Whole-record expiry for chart logs
    pub chart_ttl: Option<Duration>,
    /// Whole-record expiry for message logs
    pub message_ttl: Option<Duration>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            chart_cap: DEFAULT_CHART_CAP,
            message_cap: DEFAULT_MESSAGE_CAP,
            chart_ttl: Some(DEFAULT_CHART_TTL),
            message_ttl: None,
        }
    }
}

impl LogConfig {
    fn cap(&self, family: LogFamily) -> usize {
        match family {
            LogFamily::Chart => self.chart_cap,
            LogFamily::Message => self.message_cap,
        }
    }

    fn ttl(&self, family: LogFamily) -> Option<Duration> {
        match family {
            LogFamily::Chart => self.chart_ttl,
            LogFamily::Message => self.message_ttl,
        }
    }
}

/// Collapsed "currently active chart" entry (tombstone rule applied)
#[derive(Debug, Clone, Serialize)]
pub struct ChartState {
    pub chart_id: String,
    pub config: serde_json::Value,
    /// Id of the upsert event that produced this state
    pub event_id: String,
    pub updated_at_ms: i64,
}

/// Append/read interface over the external KV store
#[derive(Clone)]
pub struct DurableLog<S: KvStore> {
    store: S,
    config: LogConfig,
    /// Per-key write locks: every rewrite of a log record is a
    /// load-modify-store pair, and concurrent pairs on the same key would
    /// erase each other's entries. One lock per key keeps partitions from
    /// blocking each other.
    write_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl<S: KvStore> DurableLog<S> {
    pub fn new(store: S, config: LogConfig) -> Self {
        Self {
            store,
            config,
            write_locks: Arc::new(DashMap::new()),
        }
    }

    fn write_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    fn key(family: LogFamily, session: &SessionKey) -> String {
        format!("relay:{}:{}", family.key_prefix(), session.storage_segment())
    }

    /// Append one event to its family's log for its session.
    ///
    /// Chart events replace any stored entry carrying the same chart id
    /// before being appended; message events append as-is. The log is then
    /// trimmed FIFO to the family cap and rewritten with the family TTL.
    pub async fn append(&self, event: &Event) -> Result<(), StorageError> {
        let family = event.family();
        let key = Self::key(family, &event.session);
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;
        let mut events = self.load(&key).await?;

        if family == LogFamily::Chart {
            if let Some(chart_id) = event.chart_id() {
                events.retain(|e| e.chart_id() != Some(chart_id));
            }
        }
        events.push(event.clone());

        let cap = self.config.cap(family);
        if events.len() > cap {
            events.drain(0..events.len() - cap);
        }

        self.write(&key, &events, self.config.ttl(family)).await
    }

    /// Recent events for a partition, oldest first, at most `limit`
    pub async fn read_recent(
        &self,
        family: LogFamily,
        session: &SessionKey,
        limit: usize,
    ) -> Result<Vec<Event>, StorageError> {
        let key = Self::key(family, session);
        let mut events = self.load(&key).await?;
        if events.len() > limit {
            events.drain(0..events.len() - limit);
        }
        Ok(events)
    }

    /// Events strictly after a high-water-mark event id.
    ///
    /// `None` means "from the beginning". If the cursor id has been evicted
    /// from the log, falls back to the timestamp embedded in the id so a
    /// lagging poller still sees everything that remains.
    pub async fn events_after(
        &self,
        family: LogFamily,
        session: &SessionKey,
        cursor: Option<&str>,
    ) -> Result<Vec<Event>, StorageError> {
        let cap = self.config.cap(family);
        let events = self.read_recent(family, session, cap).await?;
        let Some(cursor) = cursor else {
            return Ok(events);
        };

        if let Some(pos) = events.iter().position(|e| e.id == cursor) {
            return Ok(events[pos + 1..].to_vec());
        }
        // Inclusive bound: an event sharing the evicted cursor's millisecond
        // may or may not have been delivered already, and redelivery is the
        // safe side (consumers dedup by id).
        let floor = id_timestamp_ms(cursor).unwrap_or(i64::MIN);
        Ok(events
            .into_iter()
            .filter(|e| e.timestamp_ms >= floor)
            .collect())
    }

    /// Delete one family's log for a partition. Idempotent.
    pub async fn clear(&self, family: LogFamily, session: &SessionKey) -> Result<(), StorageError> {
        self.store.delete(&Self::key(family, session)).await
    }

    /// Delete both logs for a partition. Idempotent.
    pub async fn clear_session(&self, session: &SessionKey) -> Result<(), StorageError> {
        self.clear(LogFamily::Message, session).await?;
        self.clear(LogFamily::Chart, session).await
    }

    /// Hard delete: rewrite the stored chart log dropping every entry for
    /// `chart_id`. Distinct from the soft tombstone published on the stream.
    pub async fn remove_chart(
        &self,
        session: &SessionKey,
        chart_id: &str,
    ) -> Result<(), StorageError> {
        let key = Self::key(LogFamily::Chart, session);
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;
        let mut events = self.load(&key).await?;
        let before = events.len();
        events.retain(|e| e.chart_id() != Some(chart_id));
        if events.len() == before {
            return Ok(());
        }
        if events.is_empty() {
            self.store.delete(&key).await
        } else {
            self.write(&key, &events, self.config.ttl(LogFamily::Chart))
                .await
        }
    }

    async fn load(&self, key: &str) -> Result<Vec<Event>, StorageError> {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(Vec::new());
        };
        Ok(decode_events(key, &bytes))
    }

    async fn write(
        &self,
        key: &str,
        events: &[Event],
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(events)?;
        self.store.put(key, bytes, ttl).await
    }
}

/// Decode a stored log record, skipping malformed entries rather than
/// aborting the whole read.
fn decode_events(key: &str, bytes: &[u8]) -> Vec<Event> {
    let values: Vec<serde_json::Value> = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => {
            warn!(key, error = %e, "Stored log record unreadable, treating as empty");
            return Vec::new();
        }
    };
    values
        .into_iter()
        .filter_map(|v| match serde_json::from_value::<Event>(v) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(key, error = %e, "Skipping malformed stored event");
                None
            }
        })
        .collect()
}

/// Tombstone-collapse rule: walk oldest to newest, upserts override earlier
/// state for their chart id, removes delete it. Result ordered by recency of
/// last upsert.
pub fn collapse_charts(events: &[Event]) -> Vec<ChartState> {
    let mut current: Vec<ChartState> = Vec::new();
    for event in events {
        match &event.kind {
            crate::event::EventKind::ChartUpsert { chart_id, config } => {
                current.retain(|c| c.chart_id != *chart_id);
                current.push(ChartState {
                    chart_id: chart_id.clone(),
                    config: config.clone(),
                    event_id: event.id.clone(),
                    updated_at_ms: event.timestamp_ms,
                });
            }
            crate::event::EventKind::ChartRemove { chart_id } => {
                current.retain(|c| c.chart_id != *chart_id);
            }
            crate::event::EventKind::Message { .. } => {}
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::kv::MemoryKv;

    fn log() -> DurableLog<MemoryKv> {
        DurableLog::new(MemoryKv::new(), LogConfig::default())
    }

    fn msg(content: &str, session: &SessionKey) -> Event {
        Event::new(
            EventKind::Message {
                content: content.to_string(),
            },
            session.clone(),
        )
    }

    fn upsert(chart_id: &str, title: &str, session: &SessionKey) -> Event {
        Event::new(
            EventKind::ChartUpsert {
                chart_id: chart_id.to_string(),
                config: serde_json::json!({ "title": title }),
            },
            session.clone(),
        )
    }

    #[tokio::test]
    async fn message_log_appends_in_order() {
        let log = log();
        let session = SessionKey::Named("s1".into());
        for i in 0..3 {
            log.append(&msg(&format!("m{}", i), &session)).await.unwrap();
        }
        let events = log
            .read_recent(LogFamily::Message, &session, 100)
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        match &events[0].kind {
            EventKind::Message { content } => assert_eq!(content, "m0"),
            _ => panic!("wrong kind"),
        }
    }

    #[tokio::test]
    async fn cap_evicts_oldest_first() {
        let log = DurableLog::new(
            MemoryKv::new(),
            LogConfig {
                message_cap: 3,
                ..LogConfig::default()
            },
        );
        let session = SessionKey::Global;
        for i in 0..4 {
            log.append(&msg(&format!("m{}", i), &session)).await.unwrap();
        }
        let events = log
            .read_recent(LogFamily::Message, &session, 100)
            .await
            .unwrap();
        let contents: Vec<_> = events
            .iter()
            .map(|e| match &e.kind {
                EventKind::Message { content } => content.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn chart_log_replaces_on_id() {
        let log = log();
        let session = SessionKey::Named("s1".into());
        log.append(&upsert("a", "one", &session)).await.unwrap();
        log.append(&upsert("b", "two", &session)).await.unwrap();
        log.append(&upsert("a", "three", &session)).await.unwrap();
        let events = log
            .read_recent(LogFamily::Chart, &session, 50)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].chart_id(), Some("b"));
        assert_eq!(events[1].chart_id(), Some("a"));
    }

    #[tokio::test]
    async fn remove_chart_is_a_hard_delete() {
        let log = log();
        let session = SessionKey::Global;
        log.append(&upsert("a", "one", &session)).await.unwrap();
        log.append(&upsert("b", "two", &session)).await.unwrap();
        log.remove_chart(&session, "a").await.unwrap();
        let events = log
            .read_recent(LogFamily::Chart, &session, 50)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].chart_id(), Some("b"));
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let log = log();
        let session = SessionKey::Named("s1".into());
        log.append(&msg("m", &session)).await.unwrap();
        log.clear_session(&session).await.unwrap();
        log.clear_session(&session).await.unwrap();
        assert!(log
            .read_recent(LogFamily::Message, &session, 100)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn events_after_cursor_and_eviction_fallback() {
        let log = log();
        let session = SessionKey::Global;
        let first = msg("m0", &session);
        log.append(&first).await.unwrap();
        log.append(&msg("m1", &session)).await.unwrap();
        log.append(&msg("m2", &session)).await.unwrap();

        let after = log
            .events_after(LogFamily::Message, &session, Some(&first.id))
            .await
            .unwrap();
        assert_eq!(after.len(), 2);

        // Evicted cursor id falls back to its embedded timestamp
        let stale = format!("{}-deadbeef", first.timestamp_ms - 1);
        let all = log
            .events_after(LogFamily::Message, &session, Some(&stale))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn evicted_cursor_fallback_keeps_same_millisecond_events() {
        let log = log();
        let session = SessionKey::Global;
        let first = msg("m0", &session);
        log.append(&first).await.unwrap();
        log.append(&msg("m1", &session)).await.unwrap();

        // An evicted cursor minted in the same millisecond as a surviving
        // event must not hide that event; a duplicate is acceptable, a gap
        // is not.
        let stale = format!("{}-deadbeef", first.timestamp_ms);
        let events = log
            .events_after(LogFamily::Message, &session, Some(&stale))
            .await
            .unwrap();
        assert!(events.iter().any(|e| e.id == first.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_every_event() {
        let log = log();
        let session = SessionKey::Named("s1".into());
        let mut handles = Vec::new();
        for i in 0..100 {
            let log = log.clone();
            let event = msg(&format!("m{}", i), &session);
            handles.push(tokio::spawn(async move { log.append(&event).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let events = log
            .read_recent(LogFamily::Message, &session, 100)
            .await
            .unwrap();
        assert_eq!(events.len(), 100);
    }

    #[tokio::test]
    async fn malformed_stored_entries_are_skipped() {
        let kv = MemoryKv::new();
        let log = DurableLog::new(kv.clone(), LogConfig::default());
        let session = SessionKey::Global;
        let good = msg("ok", &session);
        let record = serde_json::json!([serde_json::to_value(&good).unwrap(), {"junk": true}]);
        kv.put(
            "relay:msg:global",
            serde_json::to_vec(&record).unwrap(),
            None,
        )
        .await
        .unwrap();

        let events = log
            .read_recent(LogFamily::Message, &session, 100)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, good.id);
    }

    #[test]
    fn collapse_applies_tombstones_and_overrides() {
        let session = SessionKey::Global;
        let a1 = upsert("a", "one", &session);
        let b = upsert("b", "two", &session);
        let a2 = upsert("a", "three", &session);
        let rm_b = Event::new(
            EventKind::ChartRemove {
                chart_id: "b".into(),
            },
            session,
        );
        let current = collapse_charts(&[a1, b, a2.clone(), rm_b]);
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].chart_id, "a");
        assert_eq!(current[0].event_id, a2.id);
        assert_eq!(current[0].config, serde_json::json!({ "title": "three" }));
    }
}
