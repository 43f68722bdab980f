//! Session store: cookie jar plus string-keyed metadata, exportable to a
//! single transportable string.
//!
//! The export format must stay stable for cross-version compatibility:
//! `{"cookies": <jar-native>, "metadata": {...}, "exportedAt": ISO-8601}`.
//! Import additionally tolerates two historical shapes - a raw jar object
//! with no metadata, and a malformed double-wrapped shape that an old
//! version produced (`{cookies: {cookies: ..., metadata: ...}}`).

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, SET_COOKIE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// One cookie as held in the jar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CookieRecord {
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl CookieRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|at| at <= now).unwrap_or(false)
    }

    /// RFC 6265 domain-match: exact host or a dot-suffix of it
    fn matches_domain(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        host == domain || host.ends_with(&format!(".{}", domain))
    }

    fn matches_path(&self, path: &str) -> bool {
        path == self.path
            || (path.starts_with(&self.path)
                && (self.path.ends_with('/')
                    || path.as_bytes().get(self.path.len()) == Some(&b'/')))
    }
}

/// Ordered cookie jar. Insertion order is preserved so the Cookie header
/// stays stable across exports.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CookieJar {
    pub cookies: Vec<CookieRecord>,
}

impl CookieJar {
    /// Insert or replace a cookie keyed by (domain, path, name)
    pub fn upsert(&mut self, cookie: CookieRecord) {
        let existing = self.cookies.iter_mut().find(|c| {
            c.domain == cookie.domain && c.path == cookie.path && c.name == cookie.name
        });
        match existing {
            Some(slot) => *slot = cookie,
            None => self.cookies.push(cookie),
        }
    }

    /// Merge every Set-Cookie header of a response into the jar. Must run
    /// before the next request is issued. Cookies expired by the server
    /// (past Expires / Max-Age=0) are dropped.
    pub fn store_response_cookies(&mut self, headers: &HeaderMap, url: &Url) {
        let default_domain = url.host_str().unwrap_or_default().to_string();
        let now = Utc::now();

        for header in headers.get_all(SET_COOKIE) {
            let Ok(raw) = header.to_str() else { continue };
            let Some(cookie) = parse_set_cookie(raw, &default_domain) else {
                continue;
            };
            if cookie.is_expired(now) {
                self.cookies.retain(|c| {
                    !(c.domain == cookie.domain
                        && c.path == cookie.path
                        && c.name == cookie.name)
                });
            } else {
                self.upsert(cookie);
            }
        }
    }

    /// Build the Cookie header value for a request to `url`, or None when
    /// nothing in the jar applies.
    pub fn request_cookies(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        let path = if url.path().is_empty() { "/" } else { url.path() };
        let https = url.scheme() == "https";
        let now = Utc::now();

        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| !c.is_expired(now))
            .filter(|c| c.matches_domain(host))
            .filter(|c| c.matches_path(path))
            .filter(|c| https || !c.secure)
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Value of a named cookie regardless of domain, newest occurrence wins
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .rev()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// Parse a single Set-Cookie header value
fn parse_set_cookie(raw: &str, default_domain: &str) -> Option<CookieRecord> {
    let mut parts = raw.split(';');

    let (name, value) = parts.next()?.trim().split_once('=')?;
    if name.is_empty() {
        return None;
    }

    let mut cookie = CookieRecord {
        domain: default_domain.to_string(),
        path: "/".to_string(),
        name: name.trim().to_string(),
        value: value.trim().to_string(),
        secure: false,
        http_only: false,
        expires: None,
    };

    for attr in parts {
        let attr = attr.trim();
        let (key, val) = match attr.split_once('=') {
            Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim()),
            None => (attr.to_ascii_lowercase(), ""),
        };
        match key.as_str() {
            "domain" if !val.is_empty() => cookie.domain = val.to_string(),
            "path" if !val.is_empty() => cookie.path = val.to_string(),
            "secure" => cookie.secure = true,
            "httponly" => cookie.http_only = true,
            "max-age" => {
                if let Ok(secs) = val.parse::<i64>() {
                    cookie.expires = Some(Utc::now() + chrono::Duration::seconds(secs));
                }
            }
            "expires" => {
                // Max-Age wins over Expires when both are present
                if cookie.expires.is_none() {
                    if let Ok(at) = DateTime::parse_from_rfc2822(val) {
                        cookie.expires = Some(at.with_timezone(&Utc));
                    }
                }
            }
            _ => {}
        }
    }

    Some(cookie)
}

/// A login session: cookie jar plus arbitrary metadata (tokens, derived
/// mailbox id, expiry timestamps). Owned exclusively by one attempt while
/// active; ownership transfers through export/import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub jar: CookieJar,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn remove_metadata(&mut self, key: &str) -> Option<Value> {
        self.metadata.remove(key)
    }

    pub fn metadata_map(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Serialize the jar and metadata into the stable export wrapper
    pub fn export(&self) -> String {
        let wrapper = serde_json::json!({
            "cookies": self.jar,
            "metadata": self.metadata,
            "exportedAt": Utc::now().to_rfc3339(),
        });
        wrapper.to_string()
    }

    /// Rebuild a session from an exported string.
    ///
    /// Accepts the current wrapper, a bare jar object, and the historical
    /// double-wrapped shape. Any unparseable input yields None so the
    /// caller can fall back to a fresh empty session.
    pub fn import(raw: &str) -> Option<Session> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let obj = value.as_object()?;

        let inner = obj.get("cookies")?;

        let (jar_value, metadata) = match inner {
            // Bare jar: top-level "cookies" is already the cookie array
            Value::Array(_) => (value.clone(), Map::new()),
            Value::Object(inner_obj) => {
                if inner_obj.contains_key("metadata") {
                    // Double-wrapped: {cookies: {cookies: ..., metadata: ...}}
                    let jar = inner_obj.get("cookies").cloned().unwrap_or(Value::Null);
                    let jar = match jar {
                        Value::Array(_) => {
                            serde_json::json!({ "cookies": jar })
                        }
                        other => other,
                    };
                    let metadata = inner_obj
                        .get("metadata")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    (jar, metadata)
                } else {
                    // Current wrapper: "cookies" holds the jar object
                    let metadata = obj
                        .get("metadata")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    (inner.clone(), metadata)
                }
            }
            _ => return None,
        };

        let jar: CookieJar = serde_json::from_value(jar_value).ok()?;
        Some(Session { jar, metadata })
    }
}
