//! Intercept Core Library
//!
//! In-process HTTP interception and policy engine. Every outgoing request of
//! the host application passes through [`InterceptController::handle`], which
//! applies environment rewriting, breakpoints, mock rules and TLS trust
//! checks, then records the outcome in a bounded traffic store.

pub mod admin;
pub mod breakpoint;
pub mod controller;
pub mod environment;
pub mod filter;
pub mod mock;
pub mod pinning;
pub mod store;
pub mod transport;
pub mod trust;

/// Configuration types and utilities
pub mod config;

/// Rule primitives shared by the engines
pub mod policy;

/// Error types for engine and pipeline operations
pub mod error;

pub mod logging;

/// Saved rule and environment documents
pub mod persistence;

pub use breakpoint::{BreakpointEngine, BreakpointEvent, PauseEdit, PausedRequest, Resolution};
pub use config::{AdminConfig, InterceptorConfig};
pub use controller::{InterceptController, Interception};
pub use environment::{Environment, EnvironmentEngine, EnvironmentGroup, RewriteResult};
pub use error::{CoreError, InterceptError, NetworkErrorKind, Result};
pub use filter::HostPattern;
pub use logging::{init_logging, LoggingConfig};
pub use mock::{MockEngine, MockMatch};
pub use persistence::{JsonFileRepository, RuleRepository};
pub use pinning::{PinningResult, PinningValidator};
pub use policy::{
    BreakpointDirection, BreakpointRule, MockAction, MockRule, RequestMatcher,
    ResponseModification, RuleLimits,
};
pub use store::{StoreEvent, TrafficRecord, TrafficState, TrafficStore};
pub use transport::{
    HopTls, ReqwestTransport, Transport, TransportError, TransportOptions, TransportResponse,
};
pub use trust::{TlsConnectionInfo, TrustEvaluator, TrustIssue, TrustMode, TrustModeSelector};
