//! OAuth2/PKCE token acquisition for the mail API.
//!
//! Builds a signed authorization URL for a client profile, drives the
//! silent/iframe redirect chain until an authorization code appears in a
//! fragment, exchanges the code at the token endpoint and decodes the
//! id_token claims to derive the anchor mailbox identifier.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::{AuthError, Result};
use crate::http::AuthHttpClient;
use crate::models::TokenSet;
use crate::pkce;
use crate::session::Session;

/// Consumer tenant GUID used as the anchor-mailbox suffix
pub const CONSUMER_TENANT: &str = "84df9e7f-e9f6-40af-b435-aaaaaaaaaaaa";

/// Maximum silent-iframe redirect hops before giving up on a code
const MAX_SILENT_HOPS: usize = 2;

/// One full acquisition retry after a silent re-entry, never more
const MAX_ACQUISITION_ATTEMPTS: usize = 2;

/// Endpoint and client identity for one OAuth client profile
#[derive(Debug, Clone)]
pub struct OAuthProfile {
    pub client_id: String,
    pub scopes: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    /// Provider login endpoint used for the single silent re-entry when no
    /// code comes back
    pub login_url: String,
}

impl OAuthProfile {
    /// The Outlook web client profile
    pub fn outlook() -> Self {
        Self {
            client_id: "27922004-5251-4030-b22d-91ecd9a37ea4".to_string(),
            scopes: "openid profile offline_access https://outlook.office.com/Mail.Read"
                .to_string(),
            redirect_uri: "https://outlook.live.com/mail/".to_string(),
            authorize_url:
                "https://login.microsoftonline.com/consumers/oauth2/v2.0/authorize".to_string(),
            token_url: "https://login.microsoftonline.com/consumers/oauth2/v2.0/token"
                .to_string(),
            login_url: "https://login.live.com/login.srf".to_string(),
        }
    }
}

/// Per-attempt secrets backing one authorization request
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub nonce: String,
    pub correlation_id: String,
    pub code_verifier: String,
}

/// Build the authorization URL with fresh PKCE material.
///
/// `login_hint` also drives the anchor-mailbox parameter; both are omitted
/// when no hint is supplied.
pub fn build_authorization_request(
    profile: &OAuthProfile,
    login_hint: Option<&str>,
) -> Result<AuthorizationRequest> {
    let state = pkce::encode_state("silent");
    let nonce = pkce::generate_guid();
    let correlation_id = pkce::generate_guid();
    let code_verifier = pkce::generate_code_verifier();
    let code_challenge = pkce::generate_code_challenge(&code_verifier);

    let mut url = Url::parse(&profile.authorize_url)
        .map_err(|e| AuthError::TokenAcquisition(format!("bad authorize URL: {e}")))?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("client_id", &profile.client_id)
            .append_pair("scope", &profile.scopes)
            .append_pair("redirect_uri", &profile.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("response_mode", "fragment")
            .append_pair("state", &state)
            .append_pair("nonce", &nonce)
            .append_pair("client-request-id", &correlation_id)
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("prompt", "none");
        if let Some(hint) = login_hint {
            q.append_pair("login_hint", hint)
                .append_pair("X-AnchorMailbox", &format!("UPN:{hint}"));
        }
    }

    Ok(AuthorizationRequest {
        url: url.to_string(),
        state,
        nonce,
        correlation_id,
        code_verifier,
    })
}

/// Extract the authorization code from a redirect target whose fragment is
/// shaped like a query string (`...#code=...&state=...`).
pub fn code_from_redirect(location: &str) -> Option<String> {
    let fragment = location.split_once('#').map(|(_, f)| f)?;
    for pair in fragment.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == "code" && !value.is_empty() {
                return Some(
                    urlencoding::decode(value)
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| value.to_string()),
                );
            }
        }
    }
    None
}

/// True when the redirect target reports a terminal authorization error
fn is_error_redirect(location: &str) -> bool {
    location.contains("interaction_required") || location.contains("error=")
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    expires_in: u64,
}

/// Tokens plus the mailbox identifier derived from the id_token claims
#[derive(Debug, Clone)]
pub struct AcquiredTokens {
    pub tokens: TokenSet,
    pub mailbox: String,
}

/// Decode the payload segment of a JWT without verifying the signature.
/// The login flow already authenticated the channel; we only need claims.
pub fn decode_jwt_claims(token: &str) -> Result<Value> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::TokenAcquisition("id_token is not a JWT".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::TokenAcquisition(format!("id_token payload: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::TokenAcquisition(format!("id_token claims: {e}")))
}

/// Derive the anchor-mailbox identifier from id_token claims
fn mailbox_from_claims(claims: &Value) -> Result<String> {
    let puid = claims
        .get("puid")
        .or_else(|| claims.get("oid"))
        .or_else(|| claims.get("sub"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AuthError::TokenAcquisition("id_token carries no puid/oid/sub claim".to_string())
        })?;
    Ok(format!("{puid}@{CONSUMER_TENANT}"))
}

/// Acquire a token set by driving the silent authorization chain.
///
/// On a missing code the provider login endpoint is re-entered silently
/// once and the whole acquisition retried - an explicit bounded retry, not
/// recursion. A second failure is fatal.
pub async fn acquire(
    http: &AuthHttpClient,
    session: &mut Session,
    profile: &OAuthProfile,
    login_hint: Option<&str>,
) -> Result<AcquiredTokens> {
    for attempt in 1..=MAX_ACQUISITION_ATTEMPTS {
        match try_acquire_code(http, session, profile, login_hint).await? {
            Some((code, request)) => {
                return exchange_code(http, session, profile, &code, &request).await;
            }
            None if attempt < MAX_ACQUISITION_ATTEMPTS => {
                warn!(attempt, "no authorization code; silent re-entry and retry");
                http.get(session, &profile.login_url).await?;
            }
            None => {
                return Err(AuthError::TokenAcquisition(
                    "no authorization code after silent re-entry retry".to_string(),
                ));
            }
        }
    }
    unreachable!("bounded retry loop always returns")
}

/// One pass over the authorize endpoint and its silent redirect hops.
/// Ok(None) means the chain ended without a code (retryable once).
async fn try_acquire_code(
    http: &AuthHttpClient,
    session: &mut Session,
    profile: &OAuthProfile,
    login_hint: Option<&str>,
) -> Result<Option<(String, AuthorizationRequest)>> {
    let request = build_authorization_request(profile, login_hint)?;
    let mut response = http.get(session, &request.url).await?;

    for hop in 0..=MAX_SILENT_HOPS {
        let Some(location) = response.location().map(str::to_string) else {
            debug!(hop, status = response.status, "authorize chain ended without redirect");
            return Ok(None);
        };

        if let Some(code) = code_from_redirect(&location) {
            debug!(hop, "authorization code obtained");
            return Ok(Some((code, request)));
        }
        if is_error_redirect(&location) {
            debug!(hop, "authorize chain reported an error fragment");
            return Ok(None);
        }
        if hop == MAX_SILENT_HOPS {
            break;
        }

        let target = response.resolve(&location)?;
        response = http.get(session, target.as_str()).await?;
    }

    Ok(None)
}

/// Exchange an authorization code for a token set
async fn exchange_code(
    http: &AuthHttpClient,
    session: &mut Session,
    profile: &OAuthProfile,
    code: &str,
    request: &AuthorizationRequest,
) -> Result<AcquiredTokens> {
    let fields = vec![
        ("client_id".to_string(), profile.client_id.clone()),
        ("grant_type".to_string(), "authorization_code".to_string()),
        ("code".to_string(), code.to_string()),
        ("redirect_uri".to_string(), profile.redirect_uri.clone()),
        ("code_verifier".to_string(), request.code_verifier.clone()),
        ("scope".to_string(), profile.scopes.clone()),
        ("client-request-id".to_string(), request.correlation_id.clone()),
        ("client_info".to_string(), "1".to_string()),
        ("x-client-SKU".to_string(), "msal.js.browser".to_string()),
        ("x-client-VER".to_string(), "3.7.1".to_string()),
    ];

    let response = http
        .post_form(session, &profile.token_url, &fields)
        .await?;
    if response.status != 200 {
        return Err(AuthError::TokenAcquisition(format!(
            "token endpoint returned {}: {}",
            response.status, response.body
        )));
    }

    let parsed: TokenEndpointResponse = serde_json::from_str(&response.body)
        .map_err(|e| AuthError::TokenAcquisition(format!("token response: {e}")))?;

    let id_token = parsed.id_token.clone().ok_or_else(|| {
        AuthError::TokenAcquisition("token response carries no id_token".to_string())
    })?;
    let claims = decode_jwt_claims(&id_token)?;
    let mailbox = mailbox_from_claims(&claims)?;

    Ok(AcquiredTokens {
        tokens: TokenSet {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            id_token: Some(id_token),
            expires_in: parsed.expires_in,
        },
        mailbox,
    })
}

/// Refresh-token grant against the same token endpoint
pub async fn refresh(
    http: &AuthHttpClient,
    session: &mut Session,
    profile: &OAuthProfile,
    refresh_token: &str,
) -> Result<TokenSet> {
    let fields = vec![
        ("client_id".to_string(), profile.client_id.clone()),
        ("grant_type".to_string(), "refresh_token".to_string()),
        ("refresh_token".to_string(), refresh_token.to_string()),
        ("scope".to_string(), profile.scopes.clone()),
        ("client_info".to_string(), "1".to_string()),
    ];

    let response = http
        .post_form(session, &profile.token_url, &fields)
        .await?;
    if response.status != 200 {
        return Err(AuthError::TokenAcquisition(format!(
            "refresh grant returned {}: {}",
            response.status, response.body
        )));
    }

    let parsed: TokenEndpointResponse = serde_json::from_str(&response.body)
        .map_err(|e| AuthError::TokenAcquisition(format!("refresh response: {e}")))?;

    Ok(TokenSet {
        access_token: parsed.access_token,
        // Providers may rotate or omit the refresh token; keep the old one
        // when omitted
        refresh_token: parsed.refresh_token.or(Some(refresh_token.to_string())),
        id_token: parsed.id_token,
        expires_in: parsed.expires_in,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fake_jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.sig")
    }

    fn test_profile(server: &MockServer) -> OAuthProfile {
        OAuthProfile {
            client_id: "client-1".to_string(),
            scopes: "openid Mail.Read".to_string(),
            redirect_uri: "https://outlook.live.com/mail/".to_string(),
            authorize_url: format!("{}/authorize", server.uri()),
            token_url: format!("{}/token", server.uri()),
            login_url: format!("{}/login.srf", server.uri()),
        }
    }

    #[test]
    fn test_authorization_request_parameters() {
        let profile = OAuthProfile::outlook();
        let request = build_authorization_request(&profile, Some("user@example.com")).unwrap();
        let url = Url::parse(&request.url).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("response_type"), Some("code"));
        assert_eq!(get("response_mode"), Some("fragment"));
        assert_eq!(get("code_challenge_method"), Some("S256"));
        assert_eq!(get("login_hint"), Some("user@example.com"));
        assert_eq!(get("X-AnchorMailbox"), Some("UPN:user@example.com"));
        assert_eq!(
            get("code_challenge"),
            Some(pkce::generate_code_challenge(&request.code_verifier).as_str())
        );
    }

    #[test]
    fn test_login_hint_omitted() {
        let profile = OAuthProfile::outlook();
        let request = build_authorization_request(&profile, None).unwrap();
        assert!(!request.url.contains("login_hint"));
        assert!(!request.url.contains("X-AnchorMailbox"));
    }

    #[test]
    fn test_code_from_redirect_fragment() {
        assert_eq!(
            code_from_redirect("https://outlook.live.com/mail/#code=M.C1_ABC&state=s"),
            Some("M.C1_ABC".to_string())
        );
        assert_eq!(
            code_from_redirect("https://outlook.live.com/mail/#state=s&code=x%2Fy"),
            Some("x/y".to_string())
        );
        assert_eq!(code_from_redirect("https://outlook.live.com/mail/?code=q"), None);
        assert_eq!(
            code_from_redirect("https://x/#error=interaction_required"),
            None
        );
    }

    #[test]
    fn test_decode_jwt_claims() {
        let token = fake_jwt(serde_json::json!({"puid": "0003BFFD", "aud": "client"}));
        let claims = decode_jwt_claims(&token).unwrap();
        assert_eq!(claims["puid"], "0003BFFD");

        assert!(decode_jwt_claims("notajwt").is_err());
    }

    #[test]
    fn test_mailbox_from_claims_fallback_order() {
        let puid = serde_json::json!({"puid": "p1", "oid": "o1"});
        assert_eq!(
            mailbox_from_claims(&puid).unwrap(),
            format!("p1@{CONSUMER_TENANT}")
        );

        let oid_only = serde_json::json!({"oid": "o1"});
        assert_eq!(
            mailbox_from_claims(&oid_only).unwrap(),
            format!("o1@{CONSUMER_TENANT}")
        );

        assert!(mailbox_from_claims(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn test_acquire_happy_path() {
        let server = MockServer::start().await;
        let profile = test_profile(&server);

        Mock::given(method("GET"))
            .and(path("/authorize"))
            .and(query_param("response_type", "code"))
            .respond_with(ResponseTemplate::new(302).insert_header(
                "Location",
                "https://outlook.live.com/mail/#code=AUTHCODE&state=s",
            ))
            .mount(&server)
            .await;

        let id_token = fake_jwt(serde_json::json!({"puid": "123456789"}));
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=AUTHCODE"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "AT",
                "refresh_token": "RT",
                "id_token": id_token,
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;

        let http = AuthHttpClient::new(&HttpConfig::default()).unwrap();
        let mut session = Session::new();
        let acquired = acquire(&http, &mut session, &profile, Some("u@example.com"))
            .await
            .unwrap();

        assert_eq!(acquired.tokens.access_token, "AT");
        assert_eq!(acquired.tokens.refresh_token.as_deref(), Some("RT"));
        assert_eq!(acquired.mailbox, format!("123456789@{CONSUMER_TENANT}"));
    }

    #[tokio::test]
    async fn test_acquire_retries_once_then_fails() {
        let server = MockServer::start().await;
        let profile = test_profile(&server);

        // Authorize never yields a code
        Mock::given(method("GET"))
            .and(path("/authorize"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .expect(2)
            .mount(&server)
            .await;
        // Silent re-entry happens exactly once between the two attempts
        Mock::given(method("GET"))
            .and(path("/login.srf"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let http = AuthHttpClient::new(&HttpConfig::default()).unwrap();
        let mut session = Session::new();
        let result = acquire(&http, &mut session, &profile, None).await;
        assert!(matches!(result, Err(AuthError::TokenAcquisition(_))));
    }

    #[tokio::test]
    async fn test_refresh_keeps_old_refresh_token_when_omitted() {
        let server = MockServer::start().await;
        let profile = test_profile(&server);

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "AT2",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;

        let http = AuthHttpClient::new(&HttpConfig::default()).unwrap();
        let mut session = Session::new();
        let tokens = refresh(&http, &mut session, &profile, "OLD_RT").await.unwrap();
        assert_eq!(tokens.access_token, "AT2");
        assert_eq!(tokens.refresh_token.as_deref(), Some("OLD_RT"));
    }
}
