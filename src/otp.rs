//! OTP retrieval from a secondary mailbox.
//!
//! Two extraction paths tried in priority order on every poll iteration:
//! the bulk mailbox snapshot (whose conversation listing is scanned before
//! any further network call) and an explicit conversation search. Codes are
//! pulled from preview text by a prioritized labeled-pattern set before any
//! bare digit run is considered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Method;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{HttpConfig, OtpPollOptions, RecoveryAccount};
use crate::error::{AuthError, Result};
use crate::http::{AuthHttpClient, Payload};
use crate::models::{EmailSummary, OtpMethod, OtpResult};
use crate::oauth::OAuthProfile;
use crate::session::Session;
use crate::token::TokenManager;

/// Subject keywords marking a candidate OTP mail
static SUBJECT_KEYWORDS: &[&str] = &["security code", "verification code", "security info", "verify"];

/// Sender fragments recognized as the provider's security mails
static SENDER_KEYWORDS: &[&str] = &[
    "microsoft",
    "accountprotection",
    "account-security-noreply",
    "outlook.com",
];

/// Search query used for the explicit conversation-search fallback
const SEARCH_QUERY: &str = "security code";

/// Labeled code patterns, tried in priority order before the bare fallback.
/// Multi-language labels cover the provider's localized templates.
static LABELED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)security code[^0-9]{0,20}(\d{4,8})",
        r"(?i)verification code[^0-9]{0,20}(\d{4,8})",
        r"(?i)one-time code[^0-9]{0,20}(\d{4,8})",
        r"(?i)\bOTP\b[^0-9]{0,20}(\d{4,8})",
        r"(?i)passcode[^0-9]{0,20}(\d{4,8})",
        r"(?i)access code[^0-9]{0,20}(\d{4,8})",
        r"(?i)c[oó]digo(?: de segur(?:idad|an[çc]a))?[^0-9]{0,20}(\d{4,8})",
        r"(?i)code de s[ée]curit[ée][^0-9]{0,20}(\d{4,8})",
        r"(?i)sicherheitscode[^0-9]{0,20}(\d{4,8})",
        r"(?i)\bcode\b[^0-9]{0,20}(\d{4,8})",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Bare 4-8 digit run, only consulted when no labeled pattern matches
static BARE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4,8})\b").unwrap());

/// Extract a 4-8 digit OTP code from free text.
///
/// Labeled patterns win over the bare-digit fallback so surrounding numbers
/// (dates, ticket ids) cannot shadow the actual code.
pub fn extract_otp_code(text: &str) -> Option<String> {
    for pattern in LABELED_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            return Some(caps[1].to_string());
        }
    }
    BARE_DIGITS
        .captures(text)
        .map(|caps| caps[1].to_string())
}

/// Filter mail summaries down to plausible OTP candidates, newest first
pub fn filter_candidates(
    emails: &[EmailSummary],
    max_age: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<EmailSummary> {
    let mut candidates: Vec<EmailSummary> = emails
        .iter()
        .filter(|e| {
            let subject = e.subject.to_lowercase();
            SUBJECT_KEYWORDS.iter().any(|kw| subject.contains(kw))
        })
        .filter(|e| {
            let sender = e.sender.to_lowercase();
            SENDER_KEYWORDS.iter().any(|kw| sender.contains(kw))
        })
        .filter(|e| now.signed_duration_since(e.delivery_time) <= max_age)
        .cloned()
        .collect();
    candidates.sort_by(|a, b| b.delivery_time.cmp(&a.delivery_time));
    candidates
}

/// Mailbox access seam so the poll loop is testable without a live mailbox
#[async_trait]
pub trait MailClient: Send {
    /// Bulk snapshot call whose response includes a recent conversation
    /// listing - the cheapest path, scanned first
    async fn mailbox_snapshot(&mut self) -> Result<Vec<EmailSummary>>;

    /// Explicit conversation search fallback
    async fn search_conversations(&mut self, query: &str) -> Result<Vec<EmailSummary>>;

    /// Drop any cached folder/conversation identifiers so the next lookup
    /// sees fresh mail state
    fn invalidate_cache(&mut self);
}

/// How long a resolved folder id stays usable between invalidations
const FOLDER_CACHE_TTL: Duration = Duration::from_secs(300);

/// OWA-backed mail client for the secondary mailbox
pub struct OwaMailClient {
    http: AuthHttpClient,
    base_url: String,
    session: Session,
    access_token: String,
    mailbox: String,
    folder_cache: Option<(String, Instant)>,
}

impl OwaMailClient {
    /// Authenticate against the mailbox and build a client. Token refresh
    /// writes go into `session`, retrievable via [`Self::session`] for
    /// write-back to the secondary account's own record.
    pub async fn connect(
        http_config: &HttpConfig,
        profile: OAuthProfile,
        mut session: Session,
        login_hint: Option<&str>,
    ) -> Result<Self> {
        let http = AuthHttpClient::new(http_config)?;
        let manager = TokenManager::new(http.clone(), profile);
        let active = manager.ensure_tokens(&mut session, login_hint).await?;
        Ok(Self {
            http,
            base_url: "https://outlook.live.com".to_string(),
            session,
            access_token: active.access_token,
            mailbox: active.mailbox,
            folder_cache: None,
        })
    }

    /// Point the client at a different OWA host (tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// The secondary session including any token-refresh write-backs
    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn service_call(&mut self, action: &str, body: Value) -> Result<Value> {
        let url = format!("{}/owa/0/service.svc?action={}", self.base_url, action);
        let headers = [
            ("Authorization", format!("Bearer {}", self.access_token)),
            ("X-AnchorMailbox", self.mailbox.clone()),
        ];
        let response = self
            .http
            .request(&mut self.session, Method::POST, &url, Payload::Json(&body), &headers)
            .await?;
        if !(200..300).contains(&response.status) {
            return Err(AuthError::OtpError(format!(
                "mailbox call {action} returned {}",
                response.status
            )));
        }
        serde_json::from_str(&response.body)
            .map_err(|e| AuthError::OtpError(format!("mailbox call {action}: {e}")))
    }

    /// Resolve (and cache) the inbox folder id
    async fn inbox_folder_id(&mut self) -> Result<String> {
        if let Some((id, at)) = &self.folder_cache {
            if at.elapsed() < FOLDER_CACHE_TTL {
                return Ok(id.clone());
            }
        }

        let body = serde_json::json!({
            "FolderShape": { "BaseShape": "IdOnly" },
            "ParentFolderIds": [{ "DistinguishedFolderId": "msgfolderroot" }],
        });
        let value = self.service_call("FindFolder", body).await?;
        let folders = value
            .pointer("/Body/RootFolder/Folders")
            .and_then(Value::as_array)
            .ok_or_else(|| AuthError::OtpError("FindFolder: no folder list".to_string()))?;
        let inbox = folders
            .iter()
            .find(|f| f["DisplayName"].as_str() == Some("Inbox"))
            .and_then(|f| f.pointer("/FolderId/Id"))
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::OtpError("FindFolder: inbox not found".to_string()))?
            .to_string();

        self.folder_cache = Some((inbox.clone(), Instant::now()));
        Ok(inbox)
    }
}

/// Parse an OWA conversation array into mail summaries
fn parse_conversations(conversations: &Value) -> Vec<EmailSummary> {
    let Some(items) = conversations.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|c| {
            let subject = c["ConversationTopic"].as_str()?.to_string();
            let sender = c["UniqueSenders"]
                .as_array()
                .and_then(|s| s.first())
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let delivery_time = c["LastDeliveryTime"]
                .as_str()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))?;
            let preview = c["Preview"].as_str().unwrap_or_default().to_string();
            Some(EmailSummary {
                subject,
                sender,
                delivery_time,
                preview,
            })
        })
        .collect()
}

#[async_trait]
impl MailClient for OwaMailClient {
    async fn mailbox_snapshot(&mut self) -> Result<Vec<EmailSummary>> {
        let body = serde_json::json!({});
        let value = self.service_call("StartupData", body).await?;
        let conversations = value
            .pointer("/findConversation/Body/Conversations")
            .cloned()
            .unwrap_or(Value::Null);
        Ok(parse_conversations(&conversations))
    }

    async fn search_conversations(&mut self, query: &str) -> Result<Vec<EmailSummary>> {
        let folder_id = self.inbox_folder_id().await?;
        let body = serde_json::json!({
            "ParentFolderId": { "BaseFolderId": { "FolderId": { "Id": folder_id } } },
            "QueryString": query,
            "ConversationShape": { "BaseShape": "Default" },
            "Paging": { "MaxEntriesReturned": 25, "Offset": 0 },
        });
        let value = self.service_call("FindConversation", body).await?;
        let conversations = value
            .pointer("/Body/Conversations")
            .cloned()
            .unwrap_or(Value::Null);
        Ok(parse_conversations(&conversations))
    }

    fn invalidate_cache(&mut self) {
        self.folder_cache = None;
    }
}

/// Drives the poll loop over a mail client
#[derive(Debug, Clone)]
pub struct OtpRetriever {
    options: OtpPollOptions,
}

impl OtpRetriever {
    pub fn new(options: OtpPollOptions) -> Self {
        Self { options }
    }

    /// Poll the mailbox until a code appears or the timeout budget runs
    /// out. Each iteration invalidates the folder cache first so it sees
    /// fresh mail state.
    pub async fn retrieve(&self, client: &mut dyn MailClient) -> Result<OtpResult> {
        tokio::time::sleep(self.options.initial_delay()).await;

        let started = Instant::now();
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            client.invalidate_cache();

            match self.lookup_once(client).await {
                Ok(Some(result)) => {
                    info!(attempts, method = ?result.method, "OTP code retrieved");
                    return Ok(result);
                }
                Ok(None) => debug!(attempts, "no OTP candidate yet"),
                Err(e) => warn!(attempts, error = %e, "OTP lookup attempt failed"),
            }

            let elapsed = started.elapsed();
            if elapsed >= self.options.timeout() {
                return Err(AuthError::OtpTimeout {
                    attempts,
                    waited_secs: elapsed.as_secs(),
                });
            }
            let remaining = self.options.timeout() - elapsed;
            tokio::time::sleep(self.options.poll_interval().min(remaining)).await;
        }
    }

    /// One full lookup: snapshot listing first, search fallback second
    async fn lookup_once(&self, client: &mut dyn MailClient) -> Result<Option<OtpResult>> {
        let now = Utc::now();
        let max_age = self.options.max_age();

        let snapshot = client.mailbox_snapshot().await?;
        if let Some(result) = first_code(&snapshot, max_age, now, OtpMethod::Snapshot) {
            return Ok(Some(result));
        }

        let searched = client.search_conversations(SEARCH_QUERY).await?;
        Ok(first_code(&searched, max_age, now, OtpMethod::Search))
    }
}

fn first_code(
    emails: &[EmailSummary],
    max_age: chrono::Duration,
    now: DateTime<Utc>,
    method: OtpMethod,
) -> Option<OtpResult> {
    for candidate in filter_candidates(emails, max_age, now) {
        if let Some(code) = extract_otp_code(&candidate.preview) {
            return Some(OtpResult {
                code,
                source_email: Some(candidate),
                method,
            });
        }
    }
    None
}

/// Strategy seam for the verify-OTP step: one production implementation
/// (automatic mailbox fetch), one fixed-value test implementation. There is
/// deliberately no interactive fallback.
#[async_trait]
pub trait OtpSource: Send {
    async fn fetch_code(&mut self) -> Result<OtpResult>;

    /// The recovery session after token write-backs, when fetching the code
    /// refreshed one. The flow surfaces it in the outcome so the caller can
    /// persist it to the secondary account's own record.
    fn updated_session(&self) -> Option<&Session> {
        None
    }
}

/// Production source: authenticates the recovery mailbox and polls it
pub struct MailboxOtpSource {
    http_config: HttpConfig,
    profile: OAuthProfile,
    recovery: RecoveryAccount,
    options: OtpPollOptions,
    /// Secondary session after token write-backs, for caller persistence
    updated_session: Option<Session>,
}

impl MailboxOtpSource {
    pub fn new(
        http_config: HttpConfig,
        profile: OAuthProfile,
        recovery: RecoveryAccount,
        options: OtpPollOptions,
    ) -> Self {
        Self {
            http_config,
            profile,
            recovery,
            options,
            updated_session: None,
        }
    }
}

#[async_trait]
impl OtpSource for MailboxOtpSource {
    async fn fetch_code(&mut self) -> Result<OtpResult> {
        let session = self.recovery.resolve_session().ok_or_else(|| {
            AuthError::OtpError(
                "no recovery session configured for OTP retrieval".to_string(),
            )
        })?;
        let hint = self.recovery.email.clone();

        let mut client = OwaMailClient::connect(
            &self.http_config,
            self.profile.clone(),
            session,
            hint.as_deref(),
        )
        .await?;

        let result = OtpRetriever::new(self.options).retrieve(&mut client).await;
        self.updated_session = Some(client.session().clone());
        result
    }

    /// Token-refresh writes belong to the secondary account's durable
    /// record, never the primary's
    fn updated_session(&self) -> Option<&Session> {
        self.updated_session.as_ref()
    }
}

/// Test source returning a canned code
pub struct FixedOtpSource {
    code: String,
}

impl FixedOtpSource {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

#[async_trait]
impl OtpSource for FixedOtpSource {
    async fn fetch_code(&mut self) -> Result<OtpResult> {
        Ok(OtpResult {
            code: self.code.clone(),
            source_email: None,
            method: OtpMethod::Fixed,
        })
    }
}
