//! Per-request interception pipeline
//!
//! `Received -> Rewritten -> request breakpoint -> mock | passthrough ->
//! network -> response breakpoint -> TLS evaluation -> recorded`
//!
//! The controller owns nothing but `Arc` handles, so the same engines can be
//! driven from the admin API or the host application while requests run.

use intercept_common::{HttpRequest, HttpResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::breakpoint::{BreakpointEngine, PauseDirection, PauseEdit, Resolution};
use crate::config::InterceptorConfig;
use crate::environment::EnvironmentEngine;
use crate::error::{InterceptError, Result};
use crate::mock::MockEngine;
use crate::persistence::{EnvironmentDocument, RuleDocument, RuleRepository};
use crate::pinning::{spki_sha256, PinningResult, PinningValidator};
use crate::policy::{MockAction, ResponseModification};
use crate::store::{
    CertificateSummary, PauseNote, SecurityInfo, TrafficRecord, TrafficState, TrafficStore,
};
use crate::transport::{Transport, TransportOptions};
use crate::trust::{TlsConnectionInfo, TrustEvaluator, TrustMode};

/// Final disposition handed back to the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interception {
    pub record_id: Uuid,
    pub outcome: std::result::Result<HttpResponse, InterceptError>,
}

impl Interception {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Ends the pipeline early with the state to record
struct Stop {
    state: TrafficState,
    outcome: std::result::Result<HttpResponse, InterceptError>,
}

impl Stop {
    fn failed(error: InterceptError) -> Self {
        Self {
            state: TrafficState::Failed,
            outcome: Err(error),
        }
    }
}

/// Fails a record whose request future was dropped mid-pipeline
struct AbandonGuard<'a> {
    store: &'a TrafficStore,
    record_id: Uuid,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let abandoned = self.store.update(self.record_id, |record| {
            if record.state == TrafficState::Pending {
                record.state = TrafficState::Failed;
                record.error = Some(InterceptError::Cancelled);
                record.finish();
            }
        });
        if abandoned {
            info!("Record {} abandoned before completion", self.record_id);
        }
    }
}

pub struct InterceptController {
    environments: Arc<EnvironmentEngine>,
    mocks: Arc<MockEngine>,
    breakpoints: Arc<BreakpointEngine>,
    trust: Arc<TrustEvaluator>,
    pinning: Arc<PinningValidator>,
    store: Arc<TrafficStore>,
    transport: Arc<dyn Transport>,
}

impl InterceptController {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            environments: Arc::new(EnvironmentEngine::new()),
            mocks: Arc::new(MockEngine::default()),
            breakpoints: Arc::new(BreakpointEngine::default()),
            trust: Arc::new(TrustEvaluator::default()),
            pinning: Arc::new(PinningValidator::new()),
            store: Arc::new(TrafficStore::default()),
            transport,
        }
    }

    pub fn from_config(config: &InterceptorConfig, transport: Arc<dyn Transport>) -> Self {
        info!(
            max_records = config.max_records,
            trust_mode = ?config.trust_mode,
            "Creating interception controller"
        );
        Self {
            mocks: Arc::new(MockEngine::new(config.mock_enabled)),
            breakpoints: Arc::new(BreakpointEngine::new(config.breakpoints_enabled)),
            trust: Arc::new(TrustEvaluator::new(config.build_trust_mode())),
            store: Arc::new(TrafficStore::new(config.max_records)),
            ..Self::new(transport)
        }
    }

    pub fn with_environments(mut self, environments: Arc<EnvironmentEngine>) -> Self {
        self.environments = environments;
        self
    }

    pub fn with_mocks(mut self, mocks: Arc<MockEngine>) -> Self {
        self.mocks = mocks;
        self
    }

    pub fn with_breakpoints(mut self, breakpoints: Arc<BreakpointEngine>) -> Self {
        self.breakpoints = breakpoints;
        self
    }

    pub fn with_trust(mut self, trust: Arc<TrustEvaluator>) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_pinning(mut self, pinning: Arc<PinningValidator>) -> Self {
        self.pinning = pinning;
        self
    }

    pub fn with_store(mut self, store: Arc<TrafficStore>) -> Self {
        self.store = store;
        self
    }

    pub fn environments(&self) -> &Arc<EnvironmentEngine> {
        &self.environments
    }

    pub fn mocks(&self) -> &Arc<MockEngine> {
        &self.mocks
    }

    pub fn breakpoints(&self) -> &Arc<BreakpointEngine> {
        &self.breakpoints
    }

    pub fn trust(&self) -> &Arc<TrustEvaluator> {
        &self.trust
    }

    pub fn pinning(&self) -> &Arc<PinningValidator> {
        &self.pinning
    }

    pub fn store(&self) -> &Arc<TrafficStore> {
        &self.store
    }

    /// Populate the engines from saved documents
    pub fn load_rules(&self, repository: &dyn RuleRepository) -> Result<()> {
        let environments = repository.load_environments()?;
        self.environments.replace_groups(environments.groups);

        let rules = repository.load_rules()?;
        self.mocks.replace_rules(rules.mock_rules);
        self.breakpoints.replace_rules(rules.breakpoint_rules);
        self.pinning.clear();
        for (host, pins) in rules.pins {
            self.pinning.set_pins(&host, pins);
        }
        Ok(())
    }

    /// Write the current rule set back
    pub fn save_rules(&self, repository: &dyn RuleRepository) -> Result<()> {
        repository.save_environments(&EnvironmentDocument::new(self.environments.groups()))?;

        let pins = self
            .pinning
            .pinned_hosts()
            .into_iter()
            .map(|host| {
                let pins = self.pinning.pins_for(&host);
                (host, pins)
            })
            .collect();
        repository.save_rules(&RuleDocument::new(
            self.mocks.rules(),
            self.breakpoints.rules(),
            pins,
        ))
    }

    /// Run one request through the pipeline and record the outcome
    pub async fn handle(&self, request: HttpRequest) -> Interception {
        let record_id = self.store.insert(TrafficRecord::pending(request.clone()));
        debug!("Intercepted {} {} as {}", request.method, request.url, record_id);

        let mut guard = AbandonGuard {
            store: &self.store,
            record_id,
            armed: true,
        };
        let (state, outcome) = match self.run(record_id, request).await {
            Ok(response) => (TrafficState::Completed, Ok(response)),
            Err(stop) => (stop.state, stop.outcome),
        };
        guard.armed = false;

        match &outcome {
            Ok(response) => debug!("Record {} {:?} with {}", record_id, state, response.status_code),
            Err(err) if err.is_cancellation() => info!("Record {} cancelled by operator", record_id),
            Err(err) => warn!("Record {} failed: {}", record_id, err),
        }

        self.store.update(record_id, |record| {
            record.state = state;
            match &outcome {
                Ok(response) => record.response = Some(response.clone()),
                Err(err) => record.error = Some(err.clone()),
            }
            record.finish();
        });

        Interception { record_id, outcome }
    }

    async fn run(
        &self,
        record_id: Uuid,
        request: HttpRequest,
    ) -> std::result::Result<HttpResponse, Stop> {
        let has_host = Url::parse(&request.url).map_or(false, |url| url.host_str().is_some());
        if !has_host {
            return Err(Stop::failed(InterceptError::InvalidRequest {
                reason: format!("malformed URL '{}'", request.url),
            }));
        }

        // Rewrite
        let rewrite = self.environments.rewrite(&request.url);
        let mut outbound = rewrite.apply(&request);
        if !rewrite.is_noop() {
            debug!("Rewrote {} -> {}", request.url, outbound.url);
            let rewritten = outbound.clone();
            let source = rewrite.source.clone();
            self.store.update(record_id, move |record| {
                record.original_request = Some(request);
                record.request = rewritten;
                record.rewrite = source;
            });
        }
        let trust_mode = rewrite.trust_mode.unwrap_or_else(|| self.trust.mode());

        // Request breakpoint
        if let Some(ticket) = self.breakpoints.pause_request(&outbound) {
            let resolution = ticket.wait().await;
            let edited = matches!(resolution, Resolution::Resumed { edit: Some(_) });
            self.note_pause(record_id, PauseDirection::Request, &resolution, edited);

            match resolution {
                Resolution::Cancelled => return Err(Stop::failed(InterceptError::Cancelled)),
                Resolution::Resumed {
                    edit: Some(PauseEdit::Request(replacement)),
                } => {
                    outbound = replacement;
                    let snapshot = outbound.clone();
                    self.store.update(record_id, move |record| record.request = snapshot);
                }
                _ => {}
            }
        }

        // Mock rules
        let mut modification: Option<ResponseModification> = None;
        if let Some(found) = self.mocks.evaluate(&outbound) {
            let rule_id = found.rule_id;
            self.store.update(record_id, move |record| record.mock_rule_id = Some(rule_id));
            if found.action.short_circuits() {
                debug!("Mock rule {} answered {}", found.rule_name, outbound.url);
            }

            match found.action {
                MockAction::Respond(response) => {
                    return Err(Stop {
                        state: TrafficState::Mocked,
                        outcome: Ok(response),
                    });
                }
                MockAction::Error { kind, message } => {
                    return Err(Stop {
                        state: TrafficState::Mocked,
                        outcome: Err(InterceptError::network(kind, message)),
                    });
                }
                MockAction::Delay { delay_ms } => {
                    debug!("Mock rule {} delaying {}ms", found.rule_name, delay_ms);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                MockAction::Passthrough => {}
                MockAction::ModifyResponse(change) => modification = Some(change),
            }
        }

        // Network
        let performed = self
            .transport
            .perform(&outbound, TransportOptions::new(trust_mode.clone()))
            .await
            .map_err(|e| Stop::failed(e.into()))?;

        let mut response = performed.response.clone();
        if let Some(change) = &modification {
            change.apply(&mut response);
        }
        if !performed.redirects.is_empty() {
            let hops = performed.redirects.clone();
            self.store.update(record_id, move |record| record.redirects = hops);
        }

        // Response breakpoint
        if let Some(ticket) = self.breakpoints.pause_response(&outbound, &response) {
            let resolution = ticket.wait().await;
            let edited = matches!(resolution, Resolution::Resumed { edit: Some(_) });
            self.note_pause(record_id, PauseDirection::Response, &resolution, edited);

            match resolution {
                Resolution::Cancelled => return Err(Stop::failed(InterceptError::Cancelled)),
                Resolution::Resumed {
                    edit: Some(PauseEdit::Response { status_code, headers }),
                } => {
                    response.status_code = status_code;
                    response.headers = headers;
                }
                _ => {}
            }
        }

        // TLS, judged per connection against the host it was made to
        for hop in &performed.hop_tls {
            if let Some(hop_host) = secure_host(&hop.url) {
                let (trusted, pinning) = self.judge(&trust_mode, &hop.tls, &hop_host);
                debug!("Redirect hop {} trusted={} pinned={}", hop.url, trusted, pinning.is_pinned);
                verdict(&trust_mode, &hop.tls, &hop_host, trusted, &pinning).map_err(Stop::failed)?;
            }
        }
        let final_url = performed.final_url(&outbound.url);
        if let (Some(final_host), Some(tls)) = (secure_host(final_url), &performed.tls) {
            self.check_tls(record_id, &trust_mode, tls, &final_host)
                .map_err(Stop::failed)?;
        }

        Ok(response)
    }

    fn note_pause(&self, record_id: Uuid, direction: PauseDirection, resolution: &Resolution, edited: bool) {
        let note = PauseNote {
            direction,
            outcome: resolution.outcome(),
            edited,
        };
        self.store.update(record_id, move |record| record.pauses.push(note));
    }

    fn judge(&self, mode: &TrustMode, tls: &TlsConnectionInfo, host: &str) -> (bool, PinningResult) {
        (
            TrustEvaluator::evaluate_with(mode, tls, host),
            self.pinning.validate(&tls.chain, host),
        )
    }

    /// Trust then pinning. Security details are recorded either way.
    fn check_tls(
        &self,
        record_id: Uuid,
        mode: &TrustMode,
        tls: &TlsConnectionInfo,
        host: &str,
    ) -> std::result::Result<(), InterceptError> {
        let (trusted, pinning) = self.judge(mode, tls, host);

        let security = SecurityInfo {
            protocol_version: tls.protocol_version.clone(),
            cipher_suite: tls.cipher_suite.clone(),
            certificates: tls
                .chain
                .iter()
                .map(|cert| CertificateSummary {
                    spki_sha256: spki_sha256(&cert.der),
                    der_len: cert.der.len(),
                })
                .collect(),
            trust_mode: mode.label().to_string(),
            trusted,
            pinning: pinning.is_pinned.then(|| pinning.clone()),
        };
        self.store.update(record_id, move |record| record.security = Some(security));

        verdict(mode, tls, host, trusted, &pinning)
    }
}

/// Lowercase host of an `https` URL
fn secure_host(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "https" {
        return None;
    }
    parsed.host_str().map(str::to_ascii_lowercase)
}

fn verdict(
    mode: &TrustMode,
    tls: &TlsConnectionInfo,
    host: &str,
    trusted: bool,
    pinning: &PinningResult,
) -> std::result::Result<(), InterceptError> {
    if !trusted {
        let issues: Vec<String> = tls
            .platform_issues
            .iter()
            .map(|issue| format!("{:?}", issue))
            .collect();
        return Err(InterceptError::TrustRejected {
            host: host.to_string(),
            reason: format!(
                "certificate chain rejected under {} mode ({})",
                mode.label(),
                issues.join(", ")
            ),
        });
    }
    if !pinning.is_valid {
        return Err(InterceptError::TrustRejected {
            host: host.to_string(),
            reason: "certificate pin mismatch".to_string(),
        });
    }
    Ok(())
}
