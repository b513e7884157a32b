//! Bounded traffic record store
//!
//! Records are kept in creation order. Once the cap is exceeded the oldest
//! record is evicted, whatever its state. Every mutation is announced on a
//! broadcast channel so a control surface never has to poll.

use chrono::{DateTime, Utc};
use intercept_common::{HttpRequest, HttpResponse, RedirectHop};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::breakpoint::{PauseDirection, PauseOutcome};
use crate::environment::RewriteSource;
use crate::error::InterceptError;
use crate::pinning::PinningResult;

pub const DEFAULT_MAX_RECORDS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficState {
    Pending,
    Completed,
    /// See the record's `error`
    Failed,
    Mocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSummary {
    pub spki_sha256: Option<String>,
    pub der_len: usize,
}

/// TLS details of the connection that served the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub certificates: Vec<CertificateSummary>,
    /// Label of the trust mode the connection was judged under
    pub trust_mode: String,
    pub trusted: bool,
    pub pinning: Option<PinningResult>,
}

/// Breakpoint stop recorded on the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseNote {
    pub direction: PauseDirection,
    pub outcome: PauseOutcome,
    pub edited: bool,
}

/// Outcome of one intercepted request/response cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    /// Request as it was (or would have been) sent
    pub request: HttpRequest,
    /// Request as the host application issued it, when it was rewritten
    pub original_request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    pub security: Option<SecurityInfo>,
    #[serde(default)]
    pub redirects: Vec<RedirectHop>,
    pub rewrite: Option<RewriteSource>,
    pub mock_rule_id: Option<Uuid>,
    #[serde(default)]
    pub pauses: Vec<PauseNote>,
    pub state: TrafficState,
    pub error: Option<InterceptError>,
}

impl TrafficRecord {
    pub fn pending(request: HttpRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_ms: None,
            request,
            original_request: None,
            response: None,
            security: None,
            redirects: Vec::new(),
            rewrite: None,
            mock_rule_id: None,
            pauses: Vec::new(),
            state: TrafficState::Pending,
            error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == TrafficState::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.state == TrafficState::Failed
    }

    /// Stamp the elapsed time since `started_at`
    pub fn finish(&mut self) {
        let elapsed = Utc::now() - self.started_at;
        self.duration_ms = Some(elapsed.num_milliseconds().max(0) as u64);
    }
}

/// Change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Added(Uuid),
    Updated(Uuid),
    Removed(Uuid),
    Evicted(Uuid),
    Cleared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    /// Requests recorded since creation or the last clear
    pub total_requests: u64,
    /// Requests that ended failed since creation or the last clear
    pub error_count: u64,
    /// Retained records still in flight
    pub pending_count: u64,
    pub retained: usize,
    pub max_records: usize,
}

#[derive(Debug)]
struct Inner {
    records: VecDeque<TrafficRecord>,
    max_records: usize,
    total_requests: u64,
    error_count: u64,
}

impl Inner {
    fn evict_overflow(&mut self, evicted: &mut Vec<Uuid>) {
        while self.records.len() > self.max_records {
            if let Some(oldest) = self.records.pop_front() {
                evicted.push(oldest.id);
            }
        }
    }
}

#[derive(Debug)]
pub struct TrafficStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for TrafficStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}

impl TrafficStore {
    /// `max_records` below 1 is raised to 1
    pub fn new(max_records: usize) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner {
                records: VecDeque::new(),
                max_records: max_records.max(1),
                total_requests: 0,
                error_count: 0,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Append a record, evicting the oldest ones past the cap
    pub fn insert(&self, record: TrafficRecord) -> Uuid {
        let id = record.id;
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.total_requests += 1;
            if record.is_failed() {
                inner.error_count += 1;
            }
            inner.records.push_back(record);
            inner.evict_overflow(&mut evicted);
        }

        self.notify(StoreEvent::Added(id));
        for old in evicted {
            debug!("Evicted traffic record {}", old);
            self.notify(StoreEvent::Evicted(old));
        }
        id
    }

    /// Mutate a record in place. Returns false when it is gone (evicted,
    /// removed or cleared).
    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut TrafficRecord)) -> bool {
        {
            let mut inner = self.inner.lock();
            let Some(record) = inner.records.iter_mut().find(|r| r.id == id) else {
                return false;
            };
            let was_failed = record.is_failed();
            f(record);
            let now_failed = record.is_failed();
            if now_failed && !was_failed {
                inner.error_count += 1;
            }
        }
        self.notify(StoreEvent::Updated(id));
        true
    }

    pub fn get(&self, id: Uuid) -> Option<TrafficRecord> {
        self.inner.lock().records.iter().find(|r| r.id == id).cloned()
    }

    /// Oldest first
    pub fn records(&self) -> Vec<TrafficRecord> {
        self.inner.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TrafficStats {
        let inner = self.inner.lock();
        TrafficStats {
            total_requests: inner.total_requests,
            error_count: inner.error_count,
            pending_count: inner.records.iter().filter(|r| r.is_pending()).count() as u64,
            retained: inner.records.len(),
            max_records: inner.max_records,
        }
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let before = inner.records.len();
            inner.records.retain(|r| r.id != id);
            inner.records.len() != before
        };
        if removed {
            self.notify(StoreEvent::Removed(id));
        }
        removed
    }

    /// Drop every record and reset the counters
    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock();
            inner.records.clear();
            inner.total_requests = 0;
            inner.error_count = 0;
        }
        info!("Traffic records cleared");
        self.notify(StoreEvent::Cleared);
    }

    pub fn max_records(&self) -> usize {
        self.inner.lock().max_records
    }

    /// Change the cap, evicting immediately if the store is over it
    pub fn set_max_records(&self, max_records: usize) {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.max_records = max_records.max(1);
            inner.evict_overflow(&mut evicted);
        }
        for old in evicted {
            self.notify(StoreEvent::Evicted(old));
        }
    }
}
