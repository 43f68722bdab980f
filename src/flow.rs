//! The credential flow state machine and its redirect-driving loop.
//!
//! One login attempt runs strictly sequentially: entry page, username
//! existence check, password submission, KMSI confirmation, then a bounded
//! redirect loop until the provider lands on a final page. Every response
//! gates the next request; nothing is followed automatically.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Method;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::classifier::{self, ServerData, PRIVACY_NOTICE_HOST};
use crate::config::LoginOptions;
use crate::error::{AuthError, Result};
use crate::http::{AuthHttpClient, PageResponse, Payload};
use crate::models::{AuthState, LoginOutcome};
use crate::oauth::OAuthProfile;
use crate::otp::{MailboxOtpSource, OtpSource};
use crate::pkce;
use crate::resolver::{self, NextAction, OTP_CODE_FIELD, OTP_PROOF_FIELD};
use crate::session::Session;

/// Provider login entry point
pub const LOGIN_ENTRY_URL: &str = "https://login.live.com/login.srf";
/// Username existence-check endpoint
pub const CREDENTIAL_TYPE_URL: &str = "https://login.live.com/GetCredentialType.srf";
/// Profile page used to verify which account the session is bound to
pub const PROFILE_URL: &str = "https://account.microsoft.com/profile/";
/// Fixed consent-recording endpoint of the privacy-notice sub-flow
pub const CONSENT_RECORD_URL: &str = "https://privacynotice.account.microsoft.com/recordConsent";

/// Maximum follow-up requests the redirect loop performs before bailing
pub const MAX_REDIRECT_STEPS: usize = 20;

static FORM_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("form").unwrap());
static HIDDEN_INPUT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("input[type=hidden]").unwrap());

/// Consent-record fields embedded in the privacy-notice response script
static CONSENT_CLIENT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""clientId"\s*:\s*"([^"]+)""#).unwrap());
static CONSENT_CORRELATION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""correlationId"\s*:\s*"([^"]+)""#).unwrap());
static CONSENT_ENCRYPTED_REQUEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""encryptedRequest"\s*:\s*"([^"]+)""#).unwrap());

/// Mutable state threaded through one attempt. The terms-update flag lives
/// here, never in global state, and grants exactly one extra pass through
/// the entry point.
#[derive(Debug, Clone, Default)]
pub struct FlowContext {
    pub flow_token: String,
    pub post_url: String,
    pub terms_update_pending: bool,
}

/// Bounded resolve-dispatch loop over page transitions
pub struct RedirectDriver<'a> {
    http: &'a AuthHttpClient,
    options: &'a LoginOptions,
    otp_source: &'a mut dyn OtpSource,
}

impl<'a> RedirectDriver<'a> {
    pub fn new(
        http: &'a AuthHttpClient,
        options: &'a LoginOptions,
        otp_source: &'a mut dyn OtpSource,
    ) -> Self {
        Self {
            http,
            options,
            otp_source,
        }
    }

    /// Resolve the current response, dispatch the indicated call, repeat.
    /// At most [`MAX_REDIRECT_STEPS`] follow-up requests; the final page is
    /// returned so later steps can reuse it.
    pub async fn drive(
        &mut self,
        session: &mut Session,
        initial: PageResponse,
        ctx: &mut FlowContext,
    ) -> Result<PageResponse> {
        let mut response = initial;
        for step in 0..MAX_REDIRECT_STEPS {
            let action = resolver::resolve(&response, response.url.as_str(), self.options)?;
            if action == NextAction::Finish {
                debug!(step, url = %response.url, "redirect loop reached final page");
                return Ok(response);
            }
            response = self.dispatch(session, action, ctx).await?;
        }
        Err(AuthError::RedirectLoopExceeded {
            steps: MAX_REDIRECT_STEPS,
        })
    }

    async fn dispatch(
        &mut self,
        session: &mut Session,
        action: NextAction,
        ctx: &mut FlowContext,
    ) -> Result<PageResponse> {
        match action {
            NextAction::FollowRedirect { url } => self.http.get(session, &url).await,
            NextAction::SubmitForm {
                url,
                fields,
                terms_update,
            } => {
                if terms_update {
                    debug!(url, "accepting terms update; entry re-entry pending");
                    ctx.terms_update_pending = true;
                }
                self.http.post_form(session, &url, &fields).await
            }
            NextAction::ConfirmProofFreshness { url, fields }
            | NextAction::RecoveryProof { url, fields } => {
                self.http.post_form(session, &url, &fields).await
            }
            NextAction::VerifyOtp { url, mut fields } => {
                let recovery_email = self.options.recovery_email()?.ok_or_else(|| {
                    AuthError::OtpError(
                        "OTP verification requested but no recovery account is configured"
                            .to_string(),
                    )
                })?;
                let proof = format!("OTT||{recovery_email}||Email||0||o");
                let otp = self.otp_source.fetch_code().await?;
                info!(method = ?otp.method, "submitting OTP verification form");
                fields.push((OTP_PROOF_FIELD.to_string(), proof));
                fields.push((OTP_CODE_FIELD.to_string(), otp.code));
                self.http.post_form(session, &url, &fields).await
            }
            NextAction::ResubmitCredentials { url, flow_token } => {
                debug!(url, "credentials page mid-chain; resubmitting");
                let fields = password_fields(self.options, &flow_token);
                self.http.post_form(session, &url, &fields).await
            }
            NextAction::Finish => unreachable!("Finish is handled by the drive loop"),
        }
    }
}

/// One login attempt against the provider
pub struct LoginFlow {
    http: AuthHttpClient,
    options: LoginOptions,
    otp_source: Box<dyn OtpSource>,
    entry_url: String,
    credential_type_url: String,
    profile_url: String,
    consent_record_url: String,
}

impl LoginFlow {
    pub fn new(options: LoginOptions) -> Result<Self> {
        let http = AuthHttpClient::new(&options.config.http)?;
        let otp_source = Box::new(MailboxOtpSource::new(
            options.config.http.clone(),
            OAuthProfile::outlook(),
            options.recovery.clone().unwrap_or_default(),
            options.config.otp,
        ));
        Ok(Self {
            http,
            options,
            otp_source,
            entry_url: LOGIN_ENTRY_URL.to_string(),
            credential_type_url: CREDENTIAL_TYPE_URL.to_string(),
            profile_url: PROFILE_URL.to_string(),
            consent_record_url: CONSENT_RECORD_URL.to_string(),
        })
    }

    /// Swap the OTP strategy (tests use a fixed-value source)
    pub fn with_otp_source(mut self, source: Box<dyn OtpSource>) -> Self {
        self.otp_source = source;
        self
    }

    pub fn with_entry_url(mut self, url: impl Into<String>) -> Self {
        self.entry_url = url.into();
        self
    }

    pub fn with_credential_type_url(mut self, url: impl Into<String>) -> Self {
        self.credential_type_url = url.into();
        self
    }

    pub fn with_profile_url(mut self, url: impl Into<String>) -> Self {
        self.profile_url = url.into();
        self
    }

    pub fn with_consent_record_url(mut self, url: impl Into<String>) -> Self {
        self.consent_record_url = url.into();
        self
    }

    /// Run the attempt to completion.
    ///
    /// Protocol-state blocks (locked account, bad password, reauth, ...)
    /// come back as a structured failure outcome carrying the state; only
    /// configuration and transport errors propagate as `Err`.
    pub async fn run(mut self) -> Result<LoginOutcome> {
        let mut session = match &self.options.cookie_jar {
            Some(raw) => Session::import(raw).ok_or_else(|| {
                AuthError::ConfigError("cached cookie jar could not be parsed".to_string())
            })?,
            None => Session::new(),
        };

        let result = self.attempt(&mut session).await;
        // Token refreshes made while fetching an OTP belong to the recovery
        // account's record; hand the updated session back either way
        let recovery_jar = self.otp_source.updated_session().map(Session::export);

        match result {
            Ok(state) => {
                info!(email = %self.options.email, ?state, "login succeeded");
                let mut outcome = LoginOutcome::success(session.export());
                outcome.state = Some(state);
                outcome.recovery_cookie_jar = recovery_jar;
                Ok(outcome)
            }
            Err(e) => match e.state() {
                Some(state) => {
                    warn!(email = %self.options.email, ?state, error = %e, "login blocked");
                    let mut outcome = LoginOutcome::failure(e.to_string(), Some(state));
                    outcome.recovery_cookie_jar = recovery_jar;
                    Ok(outcome)
                }
                None => Err(e),
            },
        }
    }

    /// The state machine proper; returns the state the attempt ended in
    async fn attempt(&mut self, session: &mut Session) -> Result<AuthState> {
        let mut ctx = FlowContext::default();
        // Terms and consent interstitials each grant a single restart
        let mut terms_handled = false;
        let mut consent_handled = false;

        loop {
            // Step 1: entry page
            let entry = self.http.get(session, &self.entry_url).await?;
            match classifier::classify(&entry) {
                AuthState::AlreadyAuthenticated => return Ok(AuthState::AlreadyAuthenticated),
                AuthState::TermsUpdate if !terms_handled => {
                    terms_handled = true;
                    self.drive(session, entry, &mut ctx).await?;
                    continue;
                }
                AuthState::PrivacyNotice if !consent_handled => {
                    consent_handled = true;
                    self.run_consent(session, &entry).await?;
                    continue;
                }
                AuthState::InitialPageOk => {}
                state => return Err(state_error(state, "login entry page")),
            }
            self.store_credentials_page(&entry, &mut ctx)?;

            // Step 2: username existence check
            self.check_username(session, &ctx).await?;

            // Step 3: password submission
            let fields = password_fields(&self.options, &ctx.flow_token);
            let response = self.http.post_form(session, &ctx.post_url, &fields).await?;
            match classifier::classify(&response) {
                AuthState::AlreadyAuthenticated => return Ok(AuthState::AlreadyAuthenticated),
                AuthState::TermsUpdate if !terms_handled => {
                    terms_handled = true;
                    self.drive(session, response, &mut ctx).await?;
                    continue;
                }
                AuthState::PrivacyNotice if !consent_handled => {
                    consent_handled = true;
                    self.run_consent(session, &response).await?;
                    continue;
                }
                AuthState::KmsiOk => {
                    // Fresh flow token and post URL for the KMSI confirm
                    self.store_credentials_page(&response, &mut ctx)?;
                }
                AuthState::InvalidCredentials => {
                    let detail = ServerData::extract(&response.body)
                        .and_then(|d| d.error_text)
                        .unwrap_or_else(|| "password rejected".to_string());
                    return Err(AuthError::InvalidCredentials(detail));
                }
                state => return Err(state_error(state, "password submission")),
            }

            // Step 4: KMSI confirmation, then drive to the final page
            let kmsi = self
                .http
                .post_form(session, &ctx.post_url, &kmsi_fields(&ctx.flow_token))
                .await?;
            if !kmsi.is_redirect() {
                return Err(AuthError::ProtocolViolation(format!(
                    "KMSI confirmation returned {} without a redirect",
                    kmsi.status
                )));
            }
            let final_page = self.drive(session, kmsi, &mut ctx).await?;

            match classifier::classify(&final_page) {
                AuthState::PrivacyNotice => {
                    self.run_consent(session, &final_page).await?;
                }
                state if state.is_blocking() => {
                    return Err(state_error(state, "post-login redirect chain"))
                }
                _ => {}
            }

            // Terms accepted mid-chain settle only after one more entry pass
            if ctx.terms_update_pending {
                ctx.terms_update_pending = false;
                let entry = self.http.get(session, &self.entry_url).await?;
                self.drive(session, entry, &mut ctx).await?;
            }

            self.verify_identity(session).await?;
            return Ok(AuthState::KmsiOk);
        }
    }

    async fn drive(
        &mut self,
        session: &mut Session,
        initial: PageResponse,
        ctx: &mut FlowContext,
    ) -> Result<PageResponse> {
        RedirectDriver::new(&self.http, &self.options, self.otp_source.as_mut())
            .drive(session, initial, ctx)
            .await
    }

    /// Pull the flow token and post URL out of a credentials page
    fn store_credentials_page(&self, page: &PageResponse, ctx: &mut FlowContext) -> Result<()> {
        let data = ServerData::extract(&page.body).ok_or_else(|| {
            AuthError::ProtocolViolation("credentials page carries no server data".to_string())
        })?;
        let flow_token = data.flow_token.ok_or_else(|| {
            AuthError::ProtocolViolation("credentials page carries no flow token".to_string())
        })?;
        let post_url = data.post_url.ok_or_else(|| {
            AuthError::ProtocolViolation("credentials page carries no post URL".to_string())
        })?;
        ctx.flow_token = flow_token;
        ctx.post_url = page.resolve(&post_url)?.to_string();
        Ok(())
    }

    /// Username existence check; a non-zero `IfExistsResult` is fatal
    async fn check_username(&self, session: &mut Session, ctx: &FlowContext) -> Result<()> {
        let body = serde_json::json!({
            "username": self.options.email,
            "uaid": pkce::generate_guid(),
            "isOtherIdpSupported": false,
            "isRemoteNGCSupported": true,
            "isFidoSupported": true,
            "isCookieBannerShown": false,
            "flowToken": ctx.flow_token,
            "originalRequest": "",
        });
        let response = self
            .http
            .request(
                session,
                Method::POST,
                &self.credential_type_url,
                Payload::Json(&body),
                &[],
            )
            .await?;
        let value: serde_json::Value = serde_json::from_str(&response.body).map_err(|e| {
            AuthError::ProtocolViolation(format!("credential-type response: {e}"))
        })?;
        let if_exists = value["IfExistsResult"].as_i64().unwrap_or(0);
        if if_exists != 0 {
            return Err(AuthError::AccountNotFound(self.options.email.clone()));
        }
        Ok(())
    }

    /// Privacy-notice consent sub-flow: POST the interstitial form, pull the
    /// consent-record fields out of the follow-up page, POST the multipart
    /// consent record, then GET the form's `ru` parameter to resume.
    async fn run_consent(&self, session: &mut Session, page: &PageResponse) -> Result<()> {
        let (action_url, fields) = consent_form(page)?;
        let resume_url = Url::parse(&action_url)
            .ok()
            .and_then(|u| {
                u.query_pairs()
                    .find(|(k, _)| k == "ru")
                    .map(|(_, v)| v.into_owned())
            });

        let response = self.http.post_form(session, &action_url, &fields).await?;

        let record = ConsentRecord::extract(&response.body).ok_or_else(|| {
            AuthError::ProtocolViolation(
                "privacy-notice response carries no consent record data".to_string(),
            )
        })?;
        let parts = vec![
            ("clientId".to_string(), record.client_id),
            ("correlationId".to_string(), record.correlation_id),
            ("encryptedRequest".to_string(), record.encrypted_request),
            ("decision".to_string(), "Accept".to_string()),
        ];
        self.http
            .request(
                session,
                Method::POST,
                &self.consent_record_url,
                Payload::Multipart(parts),
                &[],
            )
            .await?;

        if let Some(ru) = resume_url {
            debug!(ru, "resuming flow after consent");
            self.http.get(session, &ru).await?;
        }
        Ok(())
    }

    /// The session must actually be bound to the requested account
    async fn verify_identity(&self, session: &mut Session) -> Result<()> {
        let response = self.http.get(session, &self.profile_url).await?;
        let expected = self.options.email.to_lowercase();
        if response.body.to_lowercase().contains(&expected) {
            return Ok(());
        }
        let actual = ServerData::extract(&response.body)
            .and_then(|d| d.signed_in_username)
            .unwrap_or_else(|| "unknown".to_string());
        Err(AuthError::IdentityMismatch {
            expected: self.options.email.clone(),
            actual,
        })
    }
}

/// Map an unexpected classification to the matching error variant
fn state_error(state: AuthState, context: &str) -> AuthError {
    match state {
        AuthState::Unknown => AuthError::UnknownPage(format!("{context}: no marker matched")),
        state => AuthError::ProtocolState {
            state,
            message: format!("blocked at {context}"),
        },
    }
}

/// The full password-submission form as the live login page posts it
fn password_fields(options: &LoginOptions, flow_token: &str) -> Vec<(String, String)> {
    let field = |name: &str, value: &str| (name.to_string(), value.to_string());
    vec![
        field("i13", "0"),
        field("login", &options.email),
        field("loginfmt", &options.email),
        field("type", "11"),
        field("LoginOptions", "3"),
        field("lrt", ""),
        field("lrtPartition", ""),
        field("hisRegion", ""),
        field("hisScaleUnit", ""),
        field("passwd", &options.password),
        field("ps", "2"),
        field("psRNGCDefaultType", ""),
        field("psRNGCEntropy", ""),
        field("psRNGCSLK", ""),
        field("canary", ""),
        field("ctx", ""),
        field("hpgrequestid", ""),
        field("PPFT", flow_token),
        field("PPSX", "Passpor"),
        field("NewUser", "1"),
        field("FoundMSAs", ""),
        field("fspost", "0"),
        field("i21", "0"),
        field("CookieDisclosure", "0"),
        field("IsFidoSupported", "1"),
        field("isSignupPost", "0"),
        field("isRecoveryAttemptPost", "0"),
        field("i19", "16199"),
    ]
}

/// "Stay signed in" confirmation form
fn kmsi_fields(flow_token: &str) -> Vec<(String, String)> {
    vec![
        ("LoginOptions".to_string(), "1".to_string()),
        ("type".to_string(), "28".to_string()),
        ("ctx".to_string(), String::new()),
        ("hpgrequestid".to_string(), String::new()),
        ("PPFT".to_string(), flow_token.to_string()),
        ("canary".to_string(), String::new()),
    ]
}

/// The privacy-notice form's action URL and hidden fields
fn consent_form(page: &PageResponse) -> Result<(String, Vec<(String, String)>)> {
    let document = Html::parse_document(&page.body);
    for form in document.select(&FORM_SELECTOR) {
        let Some(action) = form.value().attr("action") else {
            continue;
        };
        if !action.contains(PRIVACY_NOTICE_HOST) {
            continue;
        }
        let fields = form
            .select(&HIDDEN_INPUT_SELECTOR)
            .filter_map(|input| {
                let name = input.value().attr("name")?;
                let value = input.value().attr("value").unwrap_or("");
                Some((name.to_string(), value.to_string()))
            })
            .collect();
        let url = page.resolve(action)?.to_string();
        return Ok((url, fields));
    }
    Err(AuthError::ProtocolViolation(
        "page carries no privacy-notice form".to_string(),
    ))
}

/// Consent-record fields parsed from the second inline blob
#[derive(Debug, Clone)]
struct ConsentRecord {
    client_id: String,
    correlation_id: String,
    encrypted_request: String,
}

impl ConsentRecord {
    fn extract(body: &str) -> Option<ConsentRecord> {
        let capture = |re: &Regex| re.captures(body).map(|c| c[1].to_string());
        Some(ConsentRecord {
            client_id: capture(&CONSENT_CLIENT_ID)?,
            correlation_id: capture(&CONSENT_CORRELATION_ID)?,
            encrypted_request: capture(&CONSENT_ENCRYPTED_REQUEST)?,
        })
    }
}
