//! Request and response snapshots
//!
//! These are the value types that flow through every interception stage:
//! the rewrite engine produces new ones, breakpoints let an operator edit
//! them, and the record store keeps them for later inspection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header set. Names keep the casing they were sent with; lookups through
/// [`header_value`] are case-insensitive.
pub type Headers = HashMap<String, String>;

/// Case-insensitive header lookup
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Insert a header, replacing any existing header with the same name
/// regardless of casing.
pub fn set_header(headers: &mut Headers, name: &str, value: &str) {
    headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
    headers.insert(name.to_string(), value.to_string());
}

/// Captured outgoing request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "body_base64")]
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        set_header(&mut self.headers, name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Lowercased host of the request URL, if the URL parses
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(|h| h.to_ascii_lowercase()))
    }

    pub fn scheme(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .map(|parsed| parsed.scheme().to_string())
    }

    /// Path plus query, used for display next to the host
    pub fn path(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(parsed) => match parsed.query() {
                Some(query) => format!("{}?{}", parsed.path(), query),
                None => parsed.path().to_string(),
            },
            Err(_) => self.url.clone(),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.scheme().as_deref() == Some("https")
    }

    /// Body decoded as UTF-8; invalid sequences are replaced
    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|body| String::from_utf8_lossy(body).into_owned())
    }
}

/// Captured response, real or mocked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "body_base64")]
    pub body: Option<Vec<u8>>,
}

impl HttpResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        set_header(&mut self.headers, name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

/// One hop of a redirect chain observed by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectHop {
    pub from_url: String,
    pub to_url: String,
    pub status_code: u16,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Bodies are stored as base64 strings so persisted documents stay readable.
mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match body {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
