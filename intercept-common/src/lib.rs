//! Shared HTTP snapshot types used by the interception engines and their callers.

pub mod http;

pub use http::{HttpRequest, HttpResponse, Headers, RedirectHop};
