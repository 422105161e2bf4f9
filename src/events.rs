//! Event log consumer.
//!
//! Every state move appends one record to the queue's event log inside the
//! same store transaction. [`QueueEvents`] turns those records into typed
//! [`QueueEvent`]s and hands each subscriber its own channel, fed by a
//! background reader that owns the subscriber's cursor.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::QueueResult;
use crate::jobs::JobId;
use crate::store::{AtomicStore, EventId, EventRecord, event_name};

const DEFAULT_BATCH: usize = 100;
const DEFAULT_BLOCK: Duration = Duration::from_secs(5);
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventCursor {
    /// Only events appended after subscribing
    #[default]
    Latest,
    /// Events strictly after the given id
    After(EventId),
}

impl EventCursor {
    /// Replays the whole retained log.
    pub fn beginning() -> Self {
        EventCursor::After(EventId::ZERO)
    }
}

/// Typed lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Waiting {
        job_id: JobId,
        prev: Option<String>,
    },
    /// `due` is the timestamp the job becomes ready at
    Delayed { job_id: JobId, due: i64 },
    Active {
        job_id: JobId,
        prev: Option<String>,
    },
    Progress { job_id: JobId, data: JsonValue },
    Completed {
        job_id: JobId,
        return_value: JsonValue,
    },
    Failed {
        job_id: JobId,
        failed_reason: String,
    },
    Stalled { job_id: JobId },
    Removed { job_id: JobId },
    Paused,
    Resumed,
    Drained,
    Cleaned { count: u64 },
    /// A record this version does not know how to read
    Unknown { name: String },
}

impl QueueEvent {
    /// Decodes one log record. Records missing a required field come back
    /// as [`QueueEvent::Unknown`].
    pub fn from_record(record: &EventRecord) -> Self {
        let unknown = || QueueEvent::Unknown {
            name: record.name.clone(),
        };
        let job_id = record.job_id.clone();
        let prev = record.field("prev").map(str::to_string);

        match (record.name.as_str(), job_id) {
            (event_name::WAITING, Some(job_id)) => QueueEvent::Waiting { job_id, prev },
            (event_name::DELAYED, Some(job_id)) => match record.field("delay").and_then(|d| d.parse().ok()) {
                Some(due) => QueueEvent::Delayed { job_id, due },
                None => unknown(),
            },
            (event_name::ACTIVE, Some(job_id)) => QueueEvent::Active { job_id, prev },
            (event_name::PROGRESS, Some(job_id)) => QueueEvent::Progress {
                job_id,
                data: json_field(record, "data"),
            },
            (event_name::COMPLETED, Some(job_id)) => QueueEvent::Completed {
                job_id,
                return_value: json_field(record, "returnvalue"),
            },
            (event_name::FAILED, Some(job_id)) => QueueEvent::Failed {
                job_id,
                failed_reason: record.field("failedReason").unwrap_or_default().to_string(),
            },
            (event_name::STALLED, Some(job_id)) => QueueEvent::Stalled { job_id },
            (event_name::REMOVED, Some(job_id)) => QueueEvent::Removed { job_id },
            (event_name::PAUSED, _) => QueueEvent::Paused,
            (event_name::RESUMED, _) => QueueEvent::Resumed,
            (event_name::DRAINED, _) => QueueEvent::Drained,
            (event_name::CLEANED, _) => QueueEvent::Cleaned {
                count: record
                    .field("count")
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0),
            },
            _ => unknown(),
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            QueueEvent::Waiting { job_id, .. }
            | QueueEvent::Delayed { job_id, .. }
            | QueueEvent::Active { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Stalled { job_id }
            | QueueEvent::Removed { job_id } => Some(job_id),
            _ => None,
        }
    }
}

/// Stored values are JSON text; anything unparsable is kept as a string.
fn json_field(record: &EventRecord, field: &str) -> JsonValue {
    match record.field(field) {
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::from(raw)),
        None => JsonValue::Null,
    }
}

/// One delivered record: its log position and decoded event.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub id: EventId,
    pub event: QueueEvent,
}

/// Subscription handle. Dropping it stops the background reader.
pub struct EventSubscription {
    receiver: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl EventSubscription {
    /// Next event, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    pub fn close(&mut self) {
        self.cancel.cancel();
        self.receiver.close();
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Event consumer of one queue.
pub struct QueueEvents {
    store: Arc<dyn AtomicStore>,
    batch: usize,
    block: Duration,
    shutdown: CancellationToken,
}

impl QueueEvents {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self {
            store,
            batch: DEFAULT_BATCH,
            block: DEFAULT_BLOCK,
            shutdown: CancellationToken::new(),
        }
    }

    /// How long a single read waits for new records.
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Starts a reader task from `from` and returns its channel.
    ///
    /// [`EventCursor::Latest`] is resolved here, so every event appended
    /// after this call returns is delivered.
    pub async fn subscribe(&self, from: EventCursor) -> QueueResult<EventSubscription> {
        let mut cursor = match from {
            EventCursor::Latest => self.store.last_event_id().await?.unwrap_or(EventId::ZERO),
            EventCursor::After(id) => id,
        };

        let (sender, receiver) = mpsc::channel(self.batch);
        let cancel = self.shutdown.child_token();
        let task_cancel = cancel.clone();
        let store = Arc::clone(&self.store);
        let (batch, block) = (self.batch, self.block);

        tokio::spawn(async move {
            let queue = store.queue_name().to_string();
            loop {
                let read = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    read = store.read_events(cursor, batch, block) => read,
                };

                match read {
                    Ok(records) => {
                        for record in records {
                            cursor = record.id;
                            let event = StreamEvent {
                                id: record.id,
                                event: QueueEvent::from_record(&record),
                            };
                            if sender.send(event).await.is_err() {
                                debug!(queue = %queue, "Event subscriber dropped");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Failed to read events, retrying");
                        tokio::select! {
                            _ = task_cancel.cancelled() => break,
                            _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
            debug!(queue = %queue, cursor = %cursor, "Event reader stopped");
        });

        Ok(EventSubscription { receiver, cancel })
    }

    /// Trims the log to roughly `max_len` records.
    pub async fn trim(&self, max_len: u64) -> QueueResult<u64> {
        Ok(self.store.trim_events(max_len).await?)
    }

    /// Stops every subscription created by this consumer.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}
