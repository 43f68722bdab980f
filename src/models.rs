use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Semantic state of a login page response
///
/// Transient - never persisted, recomputed from each response by the
/// classifier. `Unknown` means no rule matched and is fatal to the caller:
/// it signals missing classifier coverage, not a condition worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthState {
    /// Entry page with a live flow token, ready for credential submission
    InitialPageOk,
    /// Password accepted, "keep me signed in" confirmation pending
    KmsiOk,
    /// Credentials rejected by the provider
    InvalidCredentials,
    /// Account pushed into the abuse/lockout flow
    AccountLocked,
    /// Provider demands an identity re-confirmation
    ReauthNeeded,
    /// Passkey enrollment interrupt (unsupported, terminal)
    PasskeyInterrupt,
    /// Privacy-notice consent interstitial
    PrivacyNotice,
    /// Provider asks to add a recovery proof (email/phone)
    NeedToAddRecoveryProof,
    /// Terms-of-use acceptance interstitial
    TermsUpdate,
    /// Session already signed in to the account home
    AlreadyAuthenticated,
    /// No known marker matched
    Unknown,
}

impl AuthState {
    /// States that permanently block an unattended login attempt
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            AuthState::AccountLocked
                | AuthState::ReauthNeeded
                | AuthState::PasskeyInterrupt
                | AuthState::NeedToAddRecoveryProof
        )
    }
}

/// OAuth token set as stored in session metadata
///
/// `expires_in` is the provider-reported lifetime in seconds; the absolute
/// expiry is derived once at acquisition time and stored separately under
/// the `outlookTokensExpiry` metadata key (epoch millis).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    pub expires_in: u64,
}

/// Summary of a mail item examined during OTP retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSummary {
    pub subject: String,
    pub sender: String,
    pub delivery_time: DateTime<Utc>,
    pub preview: String,
}

/// How an OTP code was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpMethod {
    /// Scanned from the bulk mailbox snapshot listing
    Snapshot,
    /// Found via an explicit conversation search
    Search,
    /// Supplied by a fixed test source
    Fixed,
}

/// A retrieved one-time passcode, produced once per verification step and
/// consumed immediately - never persisted.
#[derive(Debug, Clone)]
pub struct OtpResult {
    /// 4-8 digit code
    pub code: String,
    /// The email the code was extracted from, when one exists
    pub source_email: Option<EmailSummary>,
    pub method: OtpMethod,
}

/// Final result of a login attempt, handed back to the orchestration layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginOutcome {
    pub success: bool,
    /// Serialized session (cookie jar + metadata) for persistence.
    /// The wire name is part of the cross-version outcome format.
    #[serde(rename = "cookieJar", skip_serializing_if = "Option::is_none")]
    pub cookie_jar: Option<String>,
    /// Serialized recovery-mailbox session when OTP retrieval refreshed its
    /// tokens; the caller persists it to the secondary account's own record
    #[serde(rename = "recoveryCookieJar", skip_serializing_if = "Option::is_none")]
    pub recovery_cookie_jar: Option<String>,
    /// Human-readable failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The auth state the attempt ended in, when classification got that far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<AuthState>,
}

impl LoginOutcome {
    pub fn success(cookie_jar: String) -> Self {
        Self {
            success: true,
            cookie_jar: Some(cookie_jar),
            recovery_cookie_jar: None,
            error: None,
            state: None,
        }
    }

    pub fn failure(error: String, state: Option<AuthState>) -> Self {
        Self {
            success: false,
            cookie_jar: None,
            recovery_cookie_jar: None,
            error: Some(error),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_states() {
        assert!(AuthState::AccountLocked.is_blocking());
        assert!(AuthState::ReauthNeeded.is_blocking());
        assert!(AuthState::PasskeyInterrupt.is_blocking());
        assert!(AuthState::NeedToAddRecoveryProof.is_blocking());

        assert!(!AuthState::InitialPageOk.is_blocking());
        assert!(!AuthState::KmsiOk.is_blocking());
        assert!(!AuthState::AlreadyAuthenticated.is_blocking());
        assert!(!AuthState::Unknown.is_blocking());
    }

    #[test]
    fn test_auth_state_serialization() {
        let json = serde_json::to_string(&AuthState::NeedToAddRecoveryProof).unwrap();
        assert_eq!(json, "\"need-to-add-recovery-proof\"");

        let state: AuthState = serde_json::from_str("\"kmsi-ok\"").unwrap();
        assert_eq!(state, AuthState::KmsiOk);
    }

    #[test]
    fn test_token_set_tolerates_missing_optional_fields() {
        let json = r#"{"access_token": "at", "expires_in": 3600}"#;
        let tokens: TokenSet = serde_json::from_str(json).unwrap();
        assert_eq!(tokens.access_token, "at");
        assert!(tokens.refresh_token.is_none());
        assert!(tokens.id_token.is_none());
    }

    #[test]
    fn test_login_outcome_constructors() {
        let ok = LoginOutcome::success("{\"cookies\":[]}".to_string());
        assert!(ok.success);
        assert!(ok.cookie_jar.is_some());
        assert!(ok.error.is_none());

        let failed = LoginOutcome::failure(
            "account locked".to_string(),
            Some(AuthState::AccountLocked),
        );
        assert!(!failed.success);
        assert_eq!(failed.state, Some(AuthState::AccountLocked));
    }

    #[test]
    fn test_login_outcome_wire_format() {
        let mut outcome = LoginOutcome::success("{\"cookies\":[]}".to_string());
        outcome.recovery_cookie_jar = Some("{\"cookies\":[]}".to_string());
        let json = serde_json::to_value(&outcome).unwrap();

        // camelCase jar keys are part of the stable outcome shape
        assert!(json.get("cookieJar").is_some());
        assert!(json.get("recoveryCookieJar").is_some());
        assert!(json.get("cookie_jar").is_none());
        // absent optionals are omitted, not null
        assert!(json.get("error").is_none());
    }
}
