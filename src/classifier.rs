//! Response classification: maps an HTTP response to one of a closed set of
//! semantic page states.
//!
//! Detection is a pure function over a normalized representation (parsed
//! DOM plus the extracted inline server-data JSON), evaluated in a fixed
//! precedence order because several markers can co-occur on one page.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::http::PageResponse;
use crate::models::AuthState;

/// Path/host markers the provider embeds in interstitial pages
pub const ABUSE_MARKER: &str = "account.live.com/Abuse";
pub const IDENTITY_CONFIRM_MARKER: &str = "account.live.com/identity/confirm";
pub const PASSKEY_INTERRUPT_MARKER: &str = "account.live.com/proofs/interrupt/passkey";
pub const RECOVERY_PROOF_MARKER: &str = "account.live.com/proofs/Add";
pub const TERMS_UPDATE_MARKER: &str = "account.live.com/tou/accrue";
pub const PRIVACY_NOTICE_HOST: &str = "privacynotice.account.microsoft.com";
pub const ACCOUNT_HOME_HOST: &str = "account.microsoft.com";
pub const ACCOUNT_HOME_TITLE: &str = "Microsoft account | Home";

/// Locates the inline server-data assignment. The object itself is then
/// carved out with a balanced-brace scan since it routinely nests.
static SERVER_DATA_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:var\s+ServerData|\$Config)\s*=\s*\{").unwrap());

static TITLE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static FORM_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("form").unwrap());

/// Typed view over the embedded server-data blob
#[derive(Debug, Clone, Default)]
pub struct ServerData {
    /// Anti-forgery flow token required on the next POST (`sFT`)
    pub flow_token: Option<String>,
    /// URL the next form must be posted to (`urlPost`)
    pub post_url: Option<String>,
    /// Inline error text shown to the user (`sErrTxt`)
    pub error_text: Option<String>,
    /// Username of an already signed-in session (`sUsername`)
    pub signed_in_username: Option<String>,
    pub raw: Value,
}

impl ServerData {
    /// Extract and parse the first server-data blob in a page body
    pub fn extract(body: &str) -> Option<ServerData> {
        let m = SERVER_DATA_START.find(body)?;
        // The match ends on the opening brace
        let json_start = m.end() - 1;
        let blob = balanced_json_object(&body[json_start..])?;
        let raw: Value = serde_json::from_str(blob).ok()?;

        let field = |name: &str| {
            raw.get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Some(ServerData {
            flow_token: field("sFT"),
            post_url: field("urlPost"),
            error_text: field("sErrTxt"),
            signed_in_username: field("sUsername"),
            raw,
        })
    }
}

/// Slice out one JSON object starting at an opening brace, honoring string
/// literals and escapes.
fn balanced_json_object(input: &str) -> Option<&str> {
    let bytes = input.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&input[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// The page `<title>`, when one exists
pub fn page_title(body: &str) -> Option<String> {
    let document = Html::parse_document(body);
    document
        .select(&TITLE_SELECTOR)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// True when some `<form>` on the page posts to the privacy-notice domain
fn has_privacy_notice_form(body: &str) -> bool {
    let document = Html::parse_document(body);
    document
        .select(&FORM_SELECTOR)
        .filter_map(|form| form.value().attr("action"))
        .any(|action| action.contains(PRIVACY_NOTICE_HOST))
}

/// Classify a response into a semantic auth state.
///
/// Precedence matters: rules are evaluated in this fixed order and the
/// first match wins. `Unknown` is fatal to the caller - it means a new
/// classifier rule is needed, not a retry.
pub fn classify(response: &PageResponse) -> AuthState {
    // 1. Redirect straight into the account home
    if response.is_redirect() {
        if let Some(location) = response.location() {
            if location.contains(ACCOUNT_HOME_HOST) {
                return AuthState::AlreadyAuthenticated;
            }
        }
    }

    let server_data = ServerData::extract(&response.body);

    // 2. Inline error text
    if let Some(data) = &server_data {
        if let Some(err) = &data.error_text {
            if err.to_lowercase().contains("incorrect") {
                return AuthState::InvalidCredentials;
            }
        }
    }

    // 3-7. Interstitial path markers, most severe first
    let body = &response.body;
    if body.contains(ABUSE_MARKER) {
        return AuthState::AccountLocked;
    }
    if body.contains(IDENTITY_CONFIRM_MARKER) {
        return AuthState::ReauthNeeded;
    }
    if body.contains(PASSKEY_INTERRUPT_MARKER) {
        return AuthState::PasskeyInterrupt;
    }
    if body.contains(RECOVERY_PROOF_MARKER) {
        return AuthState::NeedToAddRecoveryProof;
    }
    if body.contains(TERMS_UPDATE_MARKER) {
        return AuthState::TermsUpdate;
    }

    // 8. Consent interstitial posting to the privacy-notice domain
    if has_privacy_notice_form(body) {
        return AuthState::PrivacyNotice;
    }

    // 9-10. Server-data shape
    if let Some(data) = &server_data {
        if data.signed_in_username.is_some() {
            return AuthState::KmsiOk;
        }
        if data.flow_token.is_some() {
            return AuthState::InitialPageOk;
        }
    }

    // 11. Account home rendered directly
    if let Some(title) = page_title(body) {
        if title.contains(ACCOUNT_HOME_TITLE) {
            return AuthState::AlreadyAuthenticated;
        }
    }

    AuthState::Unknown
}
