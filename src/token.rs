//! Token lifecycle: probe cached tokens, refresh when stale, fall back to a
//! full OAuth acquisition. Every newly obtained set is written back into
//! session metadata immediately so a crash mid-flow never loses progress.

use chrono::Utc;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{AuthError, Result};
use crate::http::{AuthHttpClient, Payload};
use crate::models::TokenSet;
use crate::oauth::{self, OAuthProfile};
use crate::session::Session;

/// Session metadata keys (stable - part of the export format)
pub const META_TOKENS: &str = "outlookTokens";
pub const META_MAILBOX: &str = "mailboxValue";
pub const META_TOKENS_EXPIRY: &str = "outlookTokensExpiry";

/// Cheapest authenticated OWA call observed; any 2xx means the token lives
const DEFAULT_PROBE_URL: &str =
    "https://outlook.live.com/owa/0/service.svc?action=GetOwaUserConfiguration";

/// Manages the access-token lifecycle for one mailbox session
#[derive(Debug, Clone)]
pub struct TokenManager {
    http: AuthHttpClient,
    profile: OAuthProfile,
    probe_url: String,
}

/// A usable access token plus its anchor mailbox
#[derive(Debug, Clone)]
pub struct ActiveTokens {
    pub access_token: String,
    pub mailbox: String,
}

impl TokenManager {
    pub fn new(http: AuthHttpClient, profile: OAuthProfile) -> Self {
        Self {
            http,
            profile,
            probe_url: DEFAULT_PROBE_URL.to_string(),
        }
    }

    /// Override the liveness-probe endpoint (tests)
    pub fn with_probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = url.into();
        self
    }

    /// Produce a valid access token for the session, reusing, refreshing or
    /// re-acquiring as needed. Tokens are written back into `session`
    /// metadata before returning; the caller persists the session to the
    /// account's own durable record.
    pub async fn ensure_tokens(
        &self,
        session: &mut Session,
        login_hint: Option<&str>,
    ) -> Result<ActiveTokens> {
        let cached = cached_tokens(session);

        if let Some((tokens, mailbox, expiry_millis)) = &cached {
            let now_millis = Utc::now().timestamp_millis();
            if *expiry_millis > now_millis
                && self.probe(session, &tokens.access_token, mailbox).await
            {
                debug!(mailbox, "cached access token still valid");
                return Ok(ActiveTokens {
                    access_token: tokens.access_token.clone(),
                    mailbox: mailbox.clone(),
                });
            }

            if let Some(refresh_token) = tokens.refresh_token.clone() {
                match oauth::refresh(&self.http, session, &self.profile, &refresh_token).await {
                    Ok(refreshed) => {
                        let mailbox = mailbox.clone();
                        store_tokens(session, &refreshed, &mailbox);
                        info!(mailbox, "access token refreshed");
                        return Ok(ActiveTokens {
                            access_token: refreshed.access_token,
                            mailbox,
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "refresh grant failed, falling back to full acquisition");
                    }
                }
            }
        }

        let acquired = oauth::acquire(&self.http, session, &self.profile, login_hint).await?;
        store_tokens(session, &acquired.tokens, &acquired.mailbox);
        info!(mailbox = acquired.mailbox, "access token acquired");
        Ok(ActiveTokens {
            access_token: acquired.tokens.access_token,
            mailbox: acquired.mailbox,
        })
    }

    /// Lightweight authenticated call; any 2xx confirms liveness
    async fn probe(&self, session: &mut Session, access_token: &str, mailbox: &str) -> bool {
        let headers = [
            ("Authorization", format!("Bearer {access_token}")),
            ("X-AnchorMailbox", mailbox.to_string()),
        ];
        match self
            .http
            .request(session, Method::GET, &self.probe_url, Payload::None, &headers)
            .await
        {
            Ok(resp) => (200..300).contains(&resp.status),
            Err(_) => false,
        }
    }
}

/// Read the cached token set, mailbox and absolute expiry from metadata
pub fn cached_tokens(session: &Session) -> Option<(TokenSet, String, i64)> {
    let tokens: TokenSet =
        serde_json::from_value(session.metadata(META_TOKENS)?.clone()).ok()?;
    let mailbox = session.metadata(META_MAILBOX)?.as_str()?.to_string();
    let expiry = session
        .metadata(META_TOKENS_EXPIRY)
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Some((tokens, mailbox, expiry))
}

/// Write a token set and its derived fields into session metadata
pub fn store_tokens(session: &mut Session, tokens: &TokenSet, mailbox: &str) {
    let expiry_millis = Utc::now().timestamp_millis() + (tokens.expires_in as i64) * 1000;
    session.set_metadata(
        META_TOKENS,
        serde_json::json!({
            "access_token": tokens.access_token,
            "refresh_token": tokens.refresh_token,
            "id_token": tokens.id_token,
            "expires_in": tokens.expires_in,
        }),
    );
    session.set_metadata(META_MAILBOX, Value::String(mailbox.to_string()));
    session.set_metadata(META_TOKENS_EXPIRY, Value::from(expiry_millis));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_manager(server: &MockServer) -> TokenManager {
        let profile = OAuthProfile {
            client_id: "client-1".to_string(),
            scopes: "openid Mail.Read".to_string(),
            redirect_uri: "https://outlook.live.com/mail/".to_string(),
            authorize_url: format!("{}/authorize", server.uri()),
            token_url: format!("{}/token", server.uri()),
            login_url: format!("{}/login.srf", server.uri()),
        };
        let http = AuthHttpClient::new(&HttpConfig::default()).unwrap();
        TokenManager::new(http, profile).with_probe_url(format!("{}/probe", server.uri()))
    }

    fn seeded_session(expires_in: u64, expiry_millis: i64) -> Session {
        let mut session = Session::new();
        store_tokens(
            &mut session,
            &TokenSet {
                access_token: "CACHED_AT".to_string(),
                refresh_token: Some("RT".to_string()),
                id_token: None,
                expires_in,
            },
            "puid@tenant",
        );
        session.set_metadata(META_TOKENS_EXPIRY, Value::from(expiry_millis));
        session
    }

    #[test]
    fn test_store_and_read_back() {
        let mut session = Session::new();
        let tokens = TokenSet {
            access_token: "AT".to_string(),
            refresh_token: None,
            id_token: None,
            expires_in: 3600,
        };
        store_tokens(&mut session, &tokens, "m@tenant");

        let (cached, mailbox, expiry) = cached_tokens(&session).unwrap();
        assert_eq!(cached.access_token, "AT");
        assert_eq!(mailbox, "m@tenant");
        assert!(expiry > Utc::now().timestamp_millis());
    }

    #[tokio::test]
    async fn test_valid_cached_token_reused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/probe"))
            .and(header("Authorization", "Bearer CACHED_AT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let manager = test_manager(&server);
        let far_future = Utc::now().timestamp_millis() + 3_600_000;
        let mut session = seeded_session(3600, far_future);

        let active = manager.ensure_tokens(&mut session, None).await.unwrap();
        assert_eq!(active.access_token, "CACHED_AT");
        assert_eq!(active.mailbox, "puid@tenant");
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_with_monotonic_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=RT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "FRESH_AT",
                "refresh_token": "RT2",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = test_manager(&server);
        let stale_expiry = Utc::now().timestamp_millis() - 1000;
        let mut session = seeded_session(3600, stale_expiry);

        let active = manager.ensure_tokens(&mut session, None).await.unwrap();
        assert_eq!(active.access_token, "FRESH_AT");

        // Write-back happened and the new expiry strictly exceeds the old
        let (tokens, _, new_expiry) = cached_tokens(&session).unwrap();
        assert_eq!(tokens.refresh_token.as_deref(), Some("RT2"));
        assert!(new_expiry > stale_expiry);
    }

    #[tokio::test]
    async fn test_refresh_failure_falls_back_to_full_acquisition() {
        let server = MockServer::start().await;
        // Refresh grant rejected
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;
        // Full acquisition succeeds
        Mock::given(method("GET"))
            .and(path("/authorize"))
            .respond_with(ResponseTemplate::new(302).insert_header(
                "Location",
                "https://outlook.live.com/mail/#code=CODE2&state=s",
            ))
            .mount(&server)
            .await;
        let id_token = format!(
            "{}.{}.s",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#),
            URL_SAFE_NO_PAD.encode(r#"{"puid":"777"}"#),
        );
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "NEW_AT",
                "refresh_token": "NEW_RT",
                "id_token": id_token,
                "expires_in": 1200,
            })))
            .mount(&server)
            .await;

        let manager = test_manager(&server);
        let stale_expiry = Utc::now().timestamp_millis() - 1000;
        let mut session = seeded_session(3600, stale_expiry);

        let active = manager.ensure_tokens(&mut session, None).await.unwrap();
        assert_eq!(active.access_token, "NEW_AT");
        assert!(active.mailbox.starts_with("777@"));
    }
}
