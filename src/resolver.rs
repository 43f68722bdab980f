//! Form/redirect resolution: given a classified response, decide the next
//! HTTP action and build its payload.
//!
//! The action set is closed - anything the resolver cannot map onto one of
//! these variants is a terminal "final page", not a guess.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::classifier::{ServerData, RECOVERY_PROOF_MARKER, TERMS_UPDATE_MARKER};
use crate::config::LoginOptions;
use crate::error::{AuthError, Result};
use crate::http::PageResponse;

/// Form action marker for the proof-freshness confirmation page
pub const PROOF_FRESHNESS_MARKER: &str = "account.live.com/proofs/Confirm";
/// Name of the one-time-code input on the OTP verification form
pub const OTP_CODE_FIELD: &str = "otc";
/// Name of the proof-option input on the OTP verification form
pub const OTP_PROOF_FIELD: &str = "iProofOptions";

static FORM_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("form").unwrap());
static INPUT_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("input").unwrap());
static HIDDEN_INPUT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("input[type=hidden]").unwrap());
static ANCHOR_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static META_REFRESH_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta[http-equiv]").unwrap());

/// Meta-refresh content: `0; url=https://...`
static META_REFRESH_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)url\s*=\s*['\x22]?([^'\x22>\s]+)").unwrap());

/// The next HTTP call the flow engine must perform
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Follow a redirect (30x Location, "Object moved" page or meta refresh)
    FollowRedirect { url: String },
    /// Auto-submit a hidden form; `terms_update` flags the terms-acceptance
    /// endpoint, which grants one extra pass through the entry point
    SubmitForm {
        url: String,
        fields: Vec<(String, String)>,
        terms_update: bool,
    },
    /// Confirm the proof-freshness page with an explicit confirm flag
    ConfirmProofFreshness {
        url: String,
        fields: Vec<(String, String)>,
    },
    /// Answer the add-recovery-proof page (action and email already decided
    /// from configuration)
    RecoveryProof {
        url: String,
        fields: Vec<(String, String)>,
    },
    /// A verification form asking for an emailed one-time code; the flow
    /// engine fills the code via its OTP source
    VerifyOtp {
        url: String,
        fields: Vec<(String, String)>,
    },
    /// A credentials page reached mid-chain; resubmit against its own post
    /// URL with its freshly extracted flow token
    ResubmitCredentials { url: String, flow_token: String },
    /// Terminal: 200 page with no redirect and no known form
    Finish,
}

/// Harvest all hidden-input name/value pairs of a form
fn hidden_fields(form: ElementRef<'_>) -> Vec<(String, String)> {
    form.select(&HIDDEN_INPUT_SELECTOR)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value").unwrap_or("");
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// True when every input of the form is hidden (auto-submitting relay form)
fn is_auto_submit(form: ElementRef<'_>) -> bool {
    let mut saw_input = false;
    for input in form.select(&INPUT_SELECTOR) {
        saw_input = true;
        let ty = input.value().attr("type").unwrap_or("text");
        if !ty.eq_ignore_ascii_case("hidden") && !ty.eq_ignore_ascii_case("submit") {
            return false;
        }
    }
    saw_input
}

fn has_input_named(form: ElementRef<'_>, name: &str) -> bool {
    form.select(&INPUT_SELECTOR)
        .any(|input| input.value().attr("name") == Some(name))
}

/// Resolve a response into the next action.
///
/// `last_url` is the URL of the response being resolved; relative targets
/// resolve against it.
pub fn resolve(
    response: &PageResponse,
    last_url: &str,
    options: &LoginOptions,
) -> Result<NextAction> {
    // Transport-level redirect
    if response.is_redirect() {
        let location = response.location().unwrap_or_default();
        let absolute = response.resolve(location)?;
        return Ok(NextAction::FollowRedirect {
            url: absolute.to_string(),
        });
    }

    // "Object moved" stub page: the target is its only anchor
    if response.body.contains("Object moved") {
        let document = Html::parse_document(&response.body);
        if let Some(href) = document
            .select(&ANCHOR_SELECTOR)
            .filter_map(|a| a.value().attr("href"))
            .next()
        {
            let absolute = response.resolve(href)?;
            return Ok(NextAction::FollowRedirect {
                url: absolute.to_string(),
            });
        }
    }

    // Meta refresh
    let document = Html::parse_document(&response.body);
    for meta in document.select(&META_REFRESH_SELECTOR) {
        let equiv = meta.value().attr("http-equiv").unwrap_or_default();
        if !equiv.eq_ignore_ascii_case("refresh") {
            continue;
        }
        if let Some(content) = meta.value().attr("content") {
            if let Some(caps) = META_REFRESH_URL.captures(content) {
                let absolute = response.resolve(&caps[1])?;
                return Ok(NextAction::FollowRedirect {
                    url: absolute.to_string(),
                });
            }
        }
    }

    // Known form shapes
    for form in document.select(&FORM_SELECTOR) {
        let action = form.value().attr("action").unwrap_or_default();
        if action.is_empty() {
            continue;
        }
        let url = response.resolve(action)?.to_string();

        if has_input_named(form, OTP_CODE_FIELD) {
            debug!(url, "resolved OTP verification form");
            return Ok(NextAction::VerifyOtp {
                url,
                fields: hidden_fields(form),
            });
        }

        if action.contains(RECOVERY_PROOF_MARKER) {
            let mut fields = hidden_fields(form);
            let add = options.recovery.as_ref().map(|r| r.add).unwrap_or(false);
            if add {
                // recovery_email errors out when Add is set with no email
                let email = options
                    .recovery_email()?
                    .ok_or_else(|| {
                        AuthError::ConfigError(
                            "recovery proof requested but no recovery email configured"
                                .to_string(),
                        )
                    })?
                    .to_string();
                fields.push(("Action".to_string(), "Add".to_string()));
                fields.push(("EmailAddress".to_string(), email));
            } else {
                fields.push(("Action".to_string(), "Skip".to_string()));
                fields.push(("EmailAddress".to_string(), String::new()));
            }
            return Ok(NextAction::RecoveryProof { url, fields });
        }

        if action.contains(PROOF_FRESHNESS_MARKER) {
            let mut fields = hidden_fields(form);
            fields.push(("iProofConfirmation".to_string(), "1".to_string()));
            return Ok(NextAction::ConfirmProofFreshness { url, fields });
        }

        if is_auto_submit(form) {
            return Ok(NextAction::SubmitForm {
                url,
                fields: hidden_fields(form),
                terms_update: action.contains(TERMS_UPDATE_MARKER),
            });
        }
    }
    drop(document);

    // A credentials page reached mid-chain: fresh token, own post URL
    if let Some(data) = ServerData::extract(&response.body) {
        if let (Some(flow_token), Some(post_url)) = (data.flow_token, data.post_url) {
            let url = response.resolve(&post_url)?.to_string();
            let _ = last_url; // targets resolve against the response URL
            return Ok(NextAction::ResubmitCredentials { url, flow_token });
        }
    }

    Ok(NextAction::Finish)
}
