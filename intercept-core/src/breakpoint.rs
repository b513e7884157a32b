//! Breakpoints: suspend matching traffic until an operator (or a timer)
//! decides what happens next.
//!
//! Each pause owns a oneshot channel. Whoever removes the pause from the
//! shared map first (operator resume, cancel, edit-and-resume, or the
//! auto-resume timer) is the only one allowed to send on it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use intercept_common::{Headers, HttpRequest, HttpResponse};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::policy::BreakpointRule;

/// Which half of the exchange is held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseDirection {
    Request,
    Response,
}

/// Snapshot of a paused exchange, as the control surface sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedRequest {
    pub id: Uuid,
    pub direction: PauseDirection,
    pub request: HttpRequest,
    /// Present when paused on the response direction
    pub response: Option<HttpResponse>,
    pub host: String,
    pub path: String,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub paused_at: DateTime<Utc>,
    pub auto_resume_at: Option<DateTime<Utc>>,
}

/// Operator edit applied on release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseEdit {
    /// Replacement request (request direction only)
    Request(HttpRequest),
    /// Substituted status code and headers (response direction only)
    Response { status_code: u16, headers: Headers },
}

/// How a pause ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resumed { edit: Option<PauseEdit> },
    AutoResumed,
    Cancelled,
}

impl Resolution {
    pub fn outcome(&self) -> PauseOutcome {
        match self {
            Resolution::Resumed { .. } => PauseOutcome::Resumed,
            Resolution::AutoResumed => PauseOutcome::AutoResumed,
            Resolution::Cancelled => PauseOutcome::Cancelled,
        }
    }
}

/// Terminal state label, without the edit payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseOutcome {
    Resumed,
    AutoResumed,
    Cancelled,
}

/// Change notification for the control surface
#[derive(Debug, Clone)]
pub enum BreakpointEvent {
    Paused(PausedRequest),
    Resolved { id: Uuid, outcome: PauseOutcome },
}

/// Handle the paused pipeline awaits
///
/// Dropping the ticket before the pause resolves (the request future was
/// dropped) cancels the pause so it does not linger in the paused set.
#[derive(Debug)]
pub struct PauseTicket {
    pub id: Uuid,
    receiver: oneshot::Receiver<Resolution>,
    registry: Weak<PauseRegistry>,
}

impl PauseTicket {
    /// Suspend until the pause is resolved. A pause dropped without a
    /// resolution (engine torn down) counts as cancelled.
    pub async fn wait(mut self) -> Resolution {
        match (&mut self.receiver).await {
            Ok(resolution) => resolution,
            Err(_) => {
                warn!("Pause {} dropped without resolution", self.id);
                Resolution::Cancelled
            }
        }
    }
}

impl Drop for PauseTicket {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if registry.resolve(self.id, Resolution::Cancelled) {
            debug!("Pause {} abandoned by its request", self.id);
        }
    }
}

#[derive(Debug)]
struct PendingPause {
    info: PausedRequest,
    sender: oneshot::Sender<Resolution>,
    timer: Option<AbortHandle>,
}

/// Shared between the engine and its auto-resume timers
#[derive(Debug)]
struct PauseRegistry {
    pending: DashMap<Uuid, PendingPause>,
    events: broadcast::Sender<BreakpointEvent>,
}

impl PauseRegistry {
    fn resolve(&self, id: Uuid, resolution: Resolution) -> bool {
        self.resolve_if(id, resolution, |_| true)
    }

    /// Atomic removal decides the winner; losers see `false`
    fn resolve_if(
        &self,
        id: Uuid,
        resolution: Resolution,
        accept: impl FnOnce(&PendingPause) -> bool,
    ) -> bool {
        let Some((_, pending)) = self.pending.remove_if(&id, |_, pending| accept(pending)) else {
            return false;
        };

        if let Some(timer) = pending.timer {
            timer.abort();
        }

        let outcome = resolution.outcome();
        info!("Pause {} resolved: {:?}", id, outcome);
        // The waiter may have gone away (request future dropped)
        let _ = pending.sender.send(resolution);
        let _ = self.events.send(BreakpointEvent::Resolved { id, outcome });
        true
    }
}

/// Breakpoint rules plus the set of currently paused exchanges
#[derive(Debug)]
pub struct BreakpointEngine {
    rules: RwLock<Vec<BreakpointRule>>,
    enabled: AtomicBool,
    registry: Arc<PauseRegistry>,
}

impl Default for BreakpointEngine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl BreakpointEngine {
    pub fn new(enabled: bool) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            rules: RwLock::new(Vec::new()),
            enabled: AtomicBool::new(enabled),
            registry: Arc::new(PauseRegistry {
                pending: DashMap::new(),
                events,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Disabling stops new pauses; requests already paused stay paused
    pub fn set_enabled(&self, enabled: bool) {
        info!("Breakpoints {}", if enabled { "enabled" } else { "disabled" });
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakpointEvent> {
        self.registry.events.subscribe()
    }

    /// First enabled rule covering `direction` that matches `req`
    pub fn matching_rule(&self, req: &HttpRequest, direction: PauseDirection) -> Option<BreakpointRule> {
        self.matching_rules(req, direction).into_iter().next()
    }

    /// Every enabled rule covering `direction` that matches `req`, in rule order
    fn matching_rules(&self, req: &HttpRequest, direction: PauseDirection) -> Vec<BreakpointRule> {
        if !self.is_enabled() {
            return Vec::new();
        }
        self.rules
            .read()
            .iter()
            .filter(|rule| rule.enabled)
            .filter(|rule| match direction {
                PauseDirection::Request => rule.direction.includes_request(),
                PauseDirection::Response => rule.direction.includes_response(),
            })
            .filter(|rule| rule.matcher.matches(req))
            .cloned()
            .collect()
    }

    /// Pause `req` before it is sent, if any request breakpoint matches
    pub fn pause_request(&self, req: &HttpRequest) -> Option<PauseTicket> {
        self.pause(PauseDirection::Request, req, None)
    }

    /// Pause `resp` before it is handed back, if any response breakpoint matches
    pub fn pause_response(&self, req: &HttpRequest, resp: &HttpResponse) -> Option<PauseTicket> {
        self.pause(PauseDirection::Response, req, Some(resp))
    }

    /// The first match names the pause; the first match carrying a delay
    /// arms the auto-resume timer.
    fn pause(
        &self,
        direction: PauseDirection,
        req: &HttpRequest,
        resp: Option<&HttpResponse>,
    ) -> Option<PauseTicket> {
        let matched = self.matching_rules(req, direction);
        let rule = matched.first()?;
        let auto_resume = matched.iter().find_map(BreakpointRule::auto_resume);
        Some(self.register(rule, auto_resume, direction, req.clone(), resp.cloned()))
    }

    fn register(
        &self,
        rule: &BreakpointRule,
        auto_resume: Option<Duration>,
        direction: PauseDirection,
        request: HttpRequest,
        response: Option<HttpResponse>,
    ) -> PauseTicket {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let info = PausedRequest {
            id,
            direction,
            host: request.host().unwrap_or_default(),
            path: request.path(),
            request,
            response,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            paused_at: now,
            auto_resume_at: auto_resume
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d),
        };

        let (sender, receiver) = oneshot::channel();
        info!(
            "Paused {:?} {} {} on breakpoint {}",
            direction, info.request.method, info.request.url, rule.name
        );
        let announced = info.clone();
        self.registry.pending.insert(
            id,
            PendingPause {
                info,
                sender,
                timer: None,
            },
        );
        let _ = self.registry.events.send(BreakpointEvent::Paused(announced));

        if let Some(delay) = auto_resume {
            self.arm_timer(id, delay);
        }

        PauseTicket {
            id,
            receiver,
            registry: Arc::downgrade(&self.registry),
        }
    }

    fn arm_timer(&self, id: Uuid, delay: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, auto-resume for pause {} is disabled", id);
            return;
        };

        let registry = self.registry.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if registry.resolve(id, Resolution::AutoResumed) {
                debug!("Pause {} auto-resumed after {:?}", id, delay);
            }
        });

        // Resolved before the handle could be attached: nothing left to time
        match self.registry.pending.get_mut(&id) {
            Some(mut pending) => pending.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }
    }

    // Operator actions

    pub fn resume(&self, id: Uuid) -> bool {
        self.registry.resolve(id, Resolution::Resumed { edit: None })
    }

    /// Resume a request-direction pause with a replacement request
    pub fn resume_with_request(&self, id: Uuid, request: HttpRequest) -> bool {
        self.registry.resolve_if(
            id,
            Resolution::Resumed {
                edit: Some(PauseEdit::Request(request)),
            },
            |pending| pending.info.direction == PauseDirection::Request,
        )
    }

    /// Resume a response-direction pause with a substituted status and headers
    pub fn resume_with_response(&self, id: Uuid, status_code: u16, headers: Headers) -> bool {
        self.registry.resolve_if(
            id,
            Resolution::Resumed {
                edit: Some(PauseEdit::Response {
                    status_code,
                    headers,
                }),
            },
            |pending| pending.info.direction == PauseDirection::Response,
        )
    }

    pub fn cancel(&self, id: Uuid) -> bool {
        self.registry.resolve(id, Resolution::Cancelled)
    }

    pub fn resume_all(&self) -> usize {
        self.pending_ids()
            .into_iter()
            .filter(|id| self.resume(*id))
            .count()
    }

    pub fn cancel_all(&self) -> usize {
        self.pending_ids()
            .into_iter()
            .filter(|id| self.cancel(*id))
            .count()
    }

    fn pending_ids(&self) -> Vec<Uuid> {
        self.registry.pending.iter().map(|e| *e.key()).collect()
    }

    /// Currently paused exchanges, oldest first
    pub fn paused(&self) -> Vec<PausedRequest> {
        let mut paused: Vec<PausedRequest> = self
            .registry
            .pending
            .iter()
            .map(|e| e.value().info.clone())
            .collect();
        paused.sort_by_key(|p| p.paused_at);
        paused
    }

    pub fn paused_request(&self, id: Uuid) -> Option<PausedRequest> {
        self.registry.pending.get(&id).map(|e| e.value().info.clone())
    }

    pub fn paused_count(&self) -> usize {
        self.registry.pending.len()
    }

    // Rules

    pub fn rules(&self) -> Vec<BreakpointRule> {
        self.rules.read().clone()
    }

    pub fn add_rule(&self, rule: BreakpointRule) -> Uuid {
        let id = rule.id;
        info!("Adding breakpoint {} ({:?})", rule.name, rule.direction);
        self.rules.write().push(rule);
        id
    }

    pub fn update_rule(&self, rule: BreakpointRule) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                *existing = rule;
                true
            }
            None => false,
        }
    }

    pub fn remove_rule(&self, id: Uuid) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    pub fn set_rule_enabled(&self, id: Uuid, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn replace_rules(&self, rules: Vec<BreakpointRule>) {
        info!("Loaded {} breakpoint rule(s)", rules.len());
        *self.rules.write() = rules;
    }

    pub fn clear_rules(&self) {
        self.rules.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{BreakpointDirection, RequestMatcher};
    use std::sync::Barrier;

    fn engine_with(direction: BreakpointDirection) -> BreakpointEngine {
        let engine = BreakpointEngine::default();
        engine.add_rule(BreakpointRule::new(
            "users",
            RequestMatcher::url("/users"),
            direction,
        ));
        engine
    }

    fn users() -> HttpRequest {
        HttpRequest::get("https://api.example.com/users")
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let engine = engine_with(BreakpointDirection::Request);
        let ticket = engine.pause_request(&users()).expect("should pause");

        let paused = engine.paused();
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].host, "api.example.com");
        assert_eq!(paused[0].path, "/users");

        assert!(engine.resume(ticket.id));
        assert_eq!(ticket.wait().await, Resolution::Resumed { edit: None });
        assert_eq!(engine.paused_count(), 0);
    }

    #[tokio::test]
    async fn test_only_first_resolution_counts() {
        let engine = engine_with(BreakpointDirection::Request);
        let ticket = engine.pause_request(&users()).unwrap();
        let id = ticket.id;

        assert!(engine.cancel(id));
        assert!(!engine.resume(id));
        assert!(!engine.cancel(id));
        assert_eq!(ticket.wait().await, Resolution::Cancelled);
    }

    #[tokio::test]
    async fn test_no_pause_when_disabled_or_unmatched() {
        let engine = engine_with(BreakpointDirection::Request);
        assert!(engine
            .pause_request(&HttpRequest::get("https://api.example.com/health"))
            .is_none());

        engine.set_enabled(false);
        assert!(engine.pause_request(&users()).is_none());
    }

    #[tokio::test]
    async fn test_direction_filtering() {
        let engine = engine_with(BreakpointDirection::Response);
        assert!(engine.pause_request(&users()).is_none());

        let ticket = engine
            .pause_response(&users(), &HttpResponse::new(200))
            .expect("response breakpoint");
        assert_eq!(
            engine.paused_request(ticket.id).unwrap().direction,
            PauseDirection::Response
        );

        let both = engine_with(BreakpointDirection::Both);
        assert!(both.pause_request(&users()).is_some());
        assert!(both.pause_response(&users(), &HttpResponse::new(200)).is_some());
    }

    #[tokio::test]
    async fn test_edits_must_match_direction() {
        let engine = engine_with(BreakpointDirection::Both);
        let request_ticket = engine.pause_request(&users()).unwrap();

        assert!(!engine.resume_with_response(request_ticket.id, 500, Headers::new()));
        let edited = HttpRequest::get("https://api.example.com/users?edited=1");
        assert!(engine.resume_with_request(request_ticket.id, edited.clone()));
        assert_eq!(
            request_ticket.wait().await,
            Resolution::Resumed {
                edit: Some(PauseEdit::Request(edited))
            }
        );

        let response_ticket = engine
            .pause_response(&users(), &HttpResponse::new(200))
            .unwrap();
        assert!(!engine.resume_with_request(response_ticket.id, users()));
        assert!(engine.resume_with_response(response_ticket.id, 418, Headers::new()));
        assert!(matches!(
            response_ticket.wait().await,
            Resolution::Resumed {
                edit: Some(PauseEdit::Response {
                    status_code: 418,
                    ..
                })
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_resume_carries_original_request() {
        let engine = BreakpointEngine::default();
        engine.add_rule(
            BreakpointRule::new("slow", RequestMatcher::any(), BreakpointDirection::Request)
                .with_auto_resume(Duration::from_secs(1)),
        );

        let started = tokio::time::Instant::now();
        let ticket = engine.pause_request(&users()).unwrap();
        let id = ticket.id;
        assert!(engine.paused_request(id).unwrap().auto_resume_at.is_some());

        assert_eq!(ticket.wait().await, Resolution::AutoResumed);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1100));

        // Late operator action is a no-op
        assert!(!engine.resume(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_comes_from_first_timed_rule() {
        let engine = BreakpointEngine::default();
        engine.add_rule(BreakpointRule::new(
            "hold",
            RequestMatcher::any(),
            BreakpointDirection::Request,
        ));
        engine.add_rule(
            BreakpointRule::new("timed", RequestMatcher::any(), BreakpointDirection::Request)
                .with_auto_resume(Duration::from_secs(1)),
        );

        let ticket = engine.pause_request(&users()).unwrap();
        let paused = engine.paused_request(ticket.id).unwrap();
        assert_eq!(paused.rule_name, "hold");
        assert!(paused.auto_resume_at.is_some());

        let resolution = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
            .await
            .expect("timed rule should release the pause");
        assert_eq!(resolution, Resolution::AutoResumed);
    }

    #[tokio::test]
    async fn test_dropped_ticket_releases_pause() {
        let engine = engine_with(BreakpointDirection::Request);
        let mut events = engine.subscribe();

        let ticket = engine.pause_request(&users()).unwrap();
        let id = ticket.id;
        drop(ticket);

        assert_eq!(engine.paused_count(), 0);
        assert!(!engine.resume(id));
        assert!(matches!(events.recv().await, Ok(BreakpointEvent::Paused(_))));
        assert!(matches!(
            events.recv().await,
            Ok(BreakpointEvent::Resolved {
                outcome: PauseOutcome::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_action_disarms_timer() {
        let engine = BreakpointEngine::default();
        engine.add_rule(
            BreakpointRule::new("slow", RequestMatcher::any(), BreakpointDirection::Request)
                .with_auto_resume(Duration::from_secs(1)),
        );
        let mut events = engine.subscribe();

        let ticket = engine.pause_request(&users()).unwrap();
        let id = ticket.id;
        assert!(engine.cancel(id));
        assert_eq!(ticket.wait().await, Resolution::Cancelled);

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(matches!(events.recv().await, Ok(BreakpointEvent::Paused(_))));
        assert!(matches!(
            events.recv().await,
            Ok(BreakpointEvent::Resolved {
                outcome: PauseOutcome::Cancelled,
                ..
            })
        ));
        // No second resolution from the timer
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resume_all_and_cancel_all() {
        let engine = engine_with(BreakpointDirection::Request);
        let first = engine.pause_request(&users()).unwrap();
        let second = engine.pause_request(&users()).unwrap();
        assert_eq!(engine.resume_all(), 2);
        assert!(matches!(first.wait().await, Resolution::Resumed { .. }));
        assert!(matches!(second.wait().await, Resolution::Resumed { .. }));

        let third = engine.pause_request(&users()).unwrap();
        assert_eq!(engine.cancel_all(), 1);
        assert_eq!(third.wait().await, Resolution::Cancelled);
        assert_eq!(engine.cancel_all(), 0);
    }

    #[tokio::test]
    async fn test_disabling_keeps_existing_pauses() {
        let engine = engine_with(BreakpointDirection::Request);
        let ticket = engine.pause_request(&users()).unwrap();
        engine.set_enabled(false);
        assert_eq!(engine.paused_count(), 1);
        assert!(engine.resume(ticket.id));
    }

    #[tokio::test]
    async fn test_dropped_engine_cancels_waiters() {
        let engine = engine_with(BreakpointDirection::Request);
        let ticket = engine.pause_request(&users()).unwrap();
        drop(engine);
        assert_eq!(ticket.wait().await, Resolution::Cancelled);
    }

    #[test]
    fn test_concurrent_resume_and_cancel_resolve_once() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        for _ in 0..50 {
            let engine = Arc::new(engine_with(BreakpointDirection::Request));
            let ticket = runtime.block_on(async { engine.pause_request(&users()).unwrap() });
            let id = ticket.id;
            let barrier = Arc::new(Barrier::new(2));

            let resumer = {
                let (engine, barrier) = (engine.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    engine.resume(id)
                })
            };
            let canceller = {
                let (engine, barrier) = (engine.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    engine.cancel(id)
                })
            };

            let resumed = resumer.join().unwrap();
            let cancelled = canceller.join().unwrap();
            assert!(resumed ^ cancelled, "exactly one resolution must win");

            let resolution = runtime.block_on(ticket.wait());
            if resumed {
                assert_eq!(resolution, Resolution::Resumed { edit: None });
            } else {
                assert_eq!(resolution, Resolution::Cancelled);
            }
        }
    }
}
