//! In-memory record of server-to-client events, for resuming SSE streams.
//!
//! A session owns one [`EventStore`]. Every stream in it is an append-only
//! log with sequence numbers starting at 1. The standalone stream (the one a
//! client opens with GET) exists from the start; each POST answered over SSE
//! gets a fresh request stream that is completed once all its responses are
//! written.
//!
//! Event ids are `"<seq>"` on the standalone stream and `"<stream>/<seq>"`
//! elsewhere, so a `Last-Event-ID` alone says which stream to resume.

use std::{
    collections::{HashMap, VecDeque},
    fmt::Display,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::Stream;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::{model::ServerJsonRpcMessage, transport::common::server_side_http::ServerSseMessage};

pub type StreamId = Arc<str>;

pub const STANDALONE_STREAM_ID: &str = "_standalone";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    #[error("invalid event id `{0}`")]
    InvalidEventId(String),
    #[error("unknown stream `{0}`")]
    UnknownStream(StreamId),
    #[error("event {seq} was never recorded on stream `{stream_id}`")]
    UnknownEvent { stream_id: StreamId, seq: u64 },
    #[error("stream `{0}` is already complete")]
    StreamCompleted(StreamId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    pub stream_id: StreamId,
    pub seq: u64,
}

impl EventId {
    pub fn standalone(seq: u64) -> Self {
        Self {
            stream_id: STANDALONE_STREAM_ID.into(),
            seq,
        }
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if &*self.stream_id == STANDALONE_STREAM_ID {
            write!(f, "{}", self.seq)
        } else {
            write!(f, "{}/{}", self.stream_id, self.seq)
        }
    }
}

impl FromStr for EventId {
    type Err = EventStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EventStoreError::InvalidEventId(s.to_owned());
        let (stream_id, seq) = match s.trim().split_once('/') {
            Some((stream_id, seq)) if !stream_id.is_empty() => (stream_id.into(), seq),
            Some(_) => return Err(invalid()),
            None => (STANDALONE_STREAM_ID.into(), s.trim()),
        };
        let seq = seq.parse().map_err(|_| invalid())?;
        Ok(Self { stream_id, seq })
    }
}

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: EventId,
    pub message: Arc<ServerJsonRpcMessage>,
}

impl From<StoredEvent> for ServerSseMessage {
    fn from(event: StoredEvent) -> Self {
        ServerSseMessage {
            event_id: Some(event.id.to_string()),
            message: event.message,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursor {
    latest: u64,
    completed: bool,
}

#[derive(Debug)]
struct StreamLog {
    events: Vec<Arc<ServerJsonRpcMessage>>,
    cursor: watch::Sender<Cursor>,
}

impl StreamLog {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            cursor: watch::Sender::new(Cursor::default()),
        }
    }
}

#[derive(Debug)]
pub struct EventStore {
    streams: Mutex<HashMap<StreamId, StreamLog>>,
    next_stream: AtomicU64,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::from([(
                StreamId::from(STANDALONE_STREAM_ID),
                StreamLog::new(),
            )])),
            next_stream: AtomicU64::new(0),
        }
    }

    /// Open a fresh request stream.
    pub async fn open_stream(&self) -> StreamId {
        let stream_id: StreamId = self
            .next_stream
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
            .into();
        self.streams
            .lock()
            .await
            .insert(stream_id.clone(), StreamLog::new());
        stream_id
    }

    pub async fn append(
        &self,
        stream_id: &str,
        message: ServerJsonRpcMessage,
    ) -> Result<EventId, EventStoreError> {
        let mut streams = self.streams.lock().await;
        let log = streams
            .get_mut(stream_id)
            .ok_or_else(|| EventStoreError::UnknownStream(stream_id.into()))?;
        let stream_id = StreamId::from(stream_id);
        if log.cursor.borrow().completed {
            return Err(EventStoreError::StreamCompleted(stream_id));
        }
        log.events.push(Arc::new(message));
        let seq = log.events.len() as u64;
        log.cursor.send_modify(|cursor| cursor.latest = seq);
        tracing::trace!(%stream_id, seq, "event appended");
        Ok(EventId { stream_id, seq })
    }

    /// Mark a stream finished; subscribers end after draining it.
    pub async fn complete(&self, stream_id: &str) -> Result<(), EventStoreError> {
        let streams = self.streams.lock().await;
        let log = streams
            .get(stream_id)
            .ok_or_else(|| EventStoreError::UnknownStream(stream_id.into()))?;
        log.cursor.send_modify(|cursor| cursor.completed = true);
        Ok(())
    }

    pub async fn latest(&self, stream_id: &str) -> Result<u64, EventStoreError> {
        let streams = self.streams.lock().await;
        let log = streams
            .get(stream_id)
            .ok_or_else(|| EventStoreError::UnknownStream(stream_id.into()))?;
        Ok(log.events.len() as u64)
    }

    /// Every event of `stream_id` with a sequence number greater than `after`, in order.
    pub async fn replay_after(
        &self,
        stream_id: &str,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self.streams.lock().await;
        let (stream_id, log) = streams
            .get_key_value(stream_id)
            .ok_or_else(|| EventStoreError::UnknownStream(stream_id.into()))?;
        let latest = log.events.len() as u64;
        if after > latest {
            return Err(EventStoreError::UnknownEvent {
                stream_id: stream_id.clone(),
                seq: after,
            });
        }
        Ok(log
            .events
            .iter()
            .enumerate()
            .skip(after as usize)
            .map(|(index, message)| StoredEvent {
                id: EventId {
                    stream_id: stream_id.clone(),
                    seq: index as u64 + 1,
                },
                message: message.clone(),
            })
            .collect())
    }

    /// Parse a `Last-Event-ID` and check that this store recorded it.
    pub async fn resolve(&self, last_event_id: &str) -> Result<EventId, EventStoreError> {
        let event_id: EventId = last_event_id.parse()?;
        let latest = self.latest(&event_id.stream_id).await?;
        if event_id.seq > latest {
            return Err(EventStoreError::UnknownEvent {
                stream_id: event_id.stream_id,
                seq: event_id.seq,
            });
        }
        Ok(event_id)
    }

    /// Replay the events after `after`, then follow the stream live.
    ///
    /// The returned stream ends when the stream is completed and drained,
    /// when the store is cleared, or when `ct` is cancelled.
    pub async fn subscribe(
        self: &Arc<Self>,
        stream_id: &str,
        after: u64,
        ct: CancellationToken,
    ) -> Result<impl Stream<Item = StoredEvent> + Send + 'static, EventStoreError> {
        let (stream_id, cursor) = {
            let streams = self.streams.lock().await;
            let (stream_id, log) = streams
                .get_key_value(stream_id)
                .ok_or_else(|| EventStoreError::UnknownStream(stream_id.into()))?;
            if after > log.events.len() as u64 {
                return Err(EventStoreError::UnknownEvent {
                    stream_id: stream_id.clone(),
                    seq: after,
                });
            }
            (stream_id.clone(), log.cursor.subscribe())
        };
        let subscription = Subscription {
            store: self.clone(),
            stream_id,
            after,
            cursor,
            pending: VecDeque::new(),
            ct,
        };
        Ok(futures::stream::unfold(subscription, Subscription::next))
    }

    /// Drop every stream. Live subscribers end once they drain.
    pub async fn clear(&self) {
        self.streams.lock().await.clear();
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }
}

struct Subscription {
    store: Arc<EventStore>,
    stream_id: StreamId,
    after: u64,
    cursor: watch::Receiver<Cursor>,
    pending: VecDeque<StoredEvent>,
    ct: CancellationToken,
}

impl Subscription {
    async fn next(mut self) -> Option<(StoredEvent, Self)> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.after = event.id.seq;
                return Some((event, self));
            }
            let cursor = *self.cursor.borrow_and_update();
            if cursor.latest > self.after {
                let events = self.store.replay_after(&self.stream_id, self.after).await.ok()?;
                self.pending.extend(events);
                continue;
            }
            if cursor.completed {
                return None;
            }
            tokio::select! {
                changed = self.cursor.changed() => changed.ok()?,
                _ = self.ct.cancelled() => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::model::JsonRpcMessage;

    fn message(n: i64) -> ServerJsonRpcMessage {
        JsonRpcMessage::notification(
            "notifications/message",
            Some(crate::object!({"level": "info", "data": n})),
        )
    }

    fn data(event: &StoredEvent) -> i64 {
        match event.message.as_ref() {
            JsonRpcMessage::Notification(n) => n.params.as_ref().unwrap()["data"].as_i64().unwrap(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_event_id_format() {
        assert_eq!(EventId::standalone(7).to_string(), "7");
        let sub = EventId {
            stream_id: "3".into(),
            seq: 2,
        };
        assert_eq!(sub.to_string(), "3/2");
        assert_eq!("3/2".parse::<EventId>().unwrap(), sub);
        assert_eq!("7".parse::<EventId>().unwrap(), EventId::standalone(7));
        assert!("abc".parse::<EventId>().is_err());
        assert!("/4".parse::<EventId>().is_err());
    }

    #[tokio::test]
    async fn test_sequence_starts_at_one_per_stream() {
        let store = EventStore::new();
        let first = store.append(STANDALONE_STREAM_ID, message(1)).await.unwrap();
        assert_eq!(first.seq, 1);
        let stream = store.open_stream().await;
        let other = store.append(&stream, message(2)).await.unwrap();
        assert_eq!(other.seq, 1);
        assert_eq!(store.latest(STANDALONE_STREAM_ID).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replay_after_returns_strictly_later_events() {
        let store = EventStore::new();
        for n in 1..=5 {
            store.append(STANDALONE_STREAM_ID, message(n)).await.unwrap();
        }
        for k in 0..=5u64 {
            let replayed = store.replay_after(STANDALONE_STREAM_ID, k).await.unwrap();
            let seqs: Vec<u64> = replayed.iter().map(|e| e.id.seq).collect();
            assert_eq!(seqs, ((k + 1)..=5).collect::<Vec<_>>());
        }
        assert!(matches!(
            store.replay_after(STANDALONE_STREAM_ID, 6).await,
            Err(EventStoreError::UnknownEvent { seq: 6, .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_rejects_unknown_cursors() {
        let store = EventStore::new();
        store.append(STANDALONE_STREAM_ID, message(1)).await.unwrap();
        assert_eq!(store.resolve("1").await.unwrap(), EventId::standalone(1));
        assert_eq!(store.resolve("0").await.unwrap(), EventId::standalone(0));
        assert!(matches!(
            store.resolve("2").await,
            Err(EventStoreError::UnknownEvent { .. })
        ));
        assert!(matches!(
            store.resolve("99/1").await,
            Err(EventStoreError::UnknownStream(_))
        ));
        assert!(matches!(
            store.resolve("garbage").await,
            Err(EventStoreError::InvalidEventId(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_follows_live() {
        let store = Arc::new(EventStore::new());
        store.append(STANDALONE_STREAM_ID, message(1)).await.unwrap();
        store.append(STANDALONE_STREAM_ID, message(2)).await.unwrap();

        let ct = CancellationToken::new();
        let mut events = Box::pin(
            store
                .subscribe(STANDALONE_STREAM_ID, 1, ct.clone())
                .await
                .unwrap(),
        );
        let replayed = events.next().await.unwrap();
        assert_eq!((replayed.id.seq, data(&replayed)), (2, 2));

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(STANDALONE_STREAM_ID, message(3)).await.unwrap();
            writer.append(STANDALONE_STREAM_ID, message(4)).await.unwrap();
        });
        for expected in [3, 4] {
            let live = tokio::time::timeout(Duration::from_secs(1), events.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(live.id.seq, expected as u64);
            assert_eq!(data(&live), expected);
        }

        ct.cancel();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_completed_stream_ends_after_drain() {
        let store = Arc::new(EventStore::new());
        let stream = store.open_stream().await;
        store.append(&stream, message(1)).await.unwrap();
        store.complete(&stream).await.unwrap();
        assert!(matches!(
            store.append(&stream, message(2)).await,
            Err(EventStoreError::StreamCompleted(_))
        ));

        let events: Vec<_> = store
            .subscribe(&stream, 0, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.to_string(), format!("{stream}/1"));
    }

    #[tokio::test]
    async fn test_clear_ends_live_subscribers() {
        let store = Arc::new(EventStore::new());
        let mut events = Box::pin(
            store
                .subscribe(STANDALONE_STREAM_ID, 0, CancellationToken::new())
                .await
                .unwrap(),
        );
        let clearer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            clearer.clear().await;
        });
        let end = tokio::time::timeout(Duration::from_secs(1), events.next()).await;
        assert!(matches!(end, Ok(None)));
        assert_eq!(store.stream_count().await, 0);
    }
}
