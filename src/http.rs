//! HTTP transport for the protocol engine.
//!
//! Redirects are never auto-followed - every response comes back to the
//! flow engine, which inspects and decides. The session's cookie jar is
//! consulted before each request and merged from Set-Cookie headers after
//! each response, so the jar always reflects the latest page transition.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, COOKIE, LOCATION, USER_AGENT};
use reqwest::{redirect, Client, Method};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::HttpConfig;
use crate::error::{AuthError, Result};
use crate::session::Session;

/// Fixed realistic browser header profile carried on every request
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const BROWSER_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const SEC_CH_UA: &str = "\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\"";

/// A captured HTTP response, normalized for classification
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// The URL the request was sent to (redirect targets resolve against it)
    pub url: Url,
    pub body: String,
}

impl PageResponse {
    /// The Location header, when present
    pub fn location(&self) -> Option<&str> {
        self.headers.get(LOCATION).and_then(|v| v.to_str().ok())
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status) && self.location().is_some()
    }

    /// Resolve a possibly relative target against this response's URL
    pub fn resolve(&self, target: &str) -> Result<Url> {
        self.url
            .join(target)
            .map_err(|e| AuthError::ProtocolViolation(format!("bad redirect target {target:?}: {e}")))
    }
}

/// Request body variants the flow engine needs
pub enum Payload<'a> {
    None,
    Form(&'a [(String, String)]),
    Json(&'a Value),
    Multipart(Vec<(String, String)>),
}

/// HTTP client wrapper with the browser profile, disabled redirects and
/// jar-controlled cookies.
#[derive(Debug, Clone)]
pub struct AuthHttpClient {
    client: Client,
}

impl AuthHttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static(BROWSER_ACCEPT_LANGUAGE),
        );
        headers.insert("sec-ch-ua", HeaderValue::from_static(SEC_CH_UA));
        headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));

        let mut builder = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(config.request_timeout())
            .default_headers(headers);

        if let Some(proxy) = &config.proxy {
            let mut p = reqwest::Proxy::all(proxy.url())?;
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                p = p.basic_auth(user, pass);
            }
            builder = builder.proxy(p);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// GET a page with the session's cookies
    pub async fn get(&self, session: &mut Session, url: &str) -> Result<PageResponse> {
        self.request(session, Method::GET, url, Payload::None, &[])
            .await
    }

    /// POST a urlencoded form with the session's cookies
    pub async fn post_form(
        &self,
        session: &mut Session,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<PageResponse> {
        self.request(session, Method::POST, url, Payload::Form(fields), &[])
            .await
    }

    /// Issue a request, threading the jar through both directions
    pub async fn request(
        &self,
        session: &mut Session,
        method: Method,
        url: &str,
        payload: Payload<'_>,
        extra_headers: &[(&str, String)],
    ) -> Result<PageResponse> {
        let parsed = Url::parse(url)
            .map_err(|e| AuthError::ProtocolViolation(format!("invalid URL {url:?}: {e}")))?;

        let mut builder = self.client.request(method.clone(), parsed.clone());

        if let Some(cookie_header) = session.jar.request_cookies(&parsed) {
            builder = builder.header(COOKIE, cookie_header);
        }
        for (name, value) in extra_headers {
            builder = builder.header(*name, value);
        }

        builder = match payload {
            Payload::None => builder,
            Payload::Form(fields) => builder.form(fields),
            Payload::Json(body) => builder.json(body),
            Payload::Multipart(parts) => {
                let mut form = reqwest::multipart::Form::new();
                for (name, value) in parts {
                    form = form.text(name, value);
                }
                builder.multipart(form)
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();

        session.jar.store_response_cookies(&headers, &parsed);

        let body = response.text().await?;
        debug!(%method, url, status, body_len = body.len(), "request completed");

        Ok(PageResponse {
            status,
            headers,
            url: parsed,
            body,
        })
    }
}
