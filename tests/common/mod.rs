//! Shared fixture builders for integration tests.

#![allow(dead_code)]

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install the test log subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A credentials page: server-data blob with a flow token and post URL
pub fn credentials_page(flow_token: &str, post_url: &str) -> String {
    format!(
        r#"<html><head><title>Sign in to your Microsoft account</title>
        <script type="text/javascript">var ServerData = {{"sFT": "{flow_token}",
        "urlPost": "{post_url}"}};//]]></script></head>
        <body><input type="password" name="passwd"/></body></html>"#
    )
}

/// A KMSI confirmation page: signed-in username plus a fresh token/post URL
pub fn kmsi_page(username: &str, flow_token: &str, post_url: &str) -> String {
    format!(
        r#"<html><head><title>Stay signed in?</title>
        <script type="text/javascript">var ServerData = {{"sUsername": "{username}",
        "sFT": "{flow_token}", "urlPost": "{post_url}"}};//]]></script></head>
        <body></body></html>"#
    )
}

/// A credentials page carrying an inline error message
pub fn error_page(error_text: &str, flow_token: &str) -> String {
    format!(
        r#"<html><head><script>var ServerData = {{"sErrTxt": "{error_text}",
        "sFT": "{flow_token}", "urlPost": "https://login.live.com/ppsecure/post.srf"}};
        </script></head><body></body></html>"#
    )
}

/// An auto-submitting relay form with one hidden field
pub fn relay_form(action: &str, name: &str, value: &str) -> String {
    format!(
        r#"<html><body><form action="{action}" method="post">
        <input type="hidden" name="{name}" value="{value}"/>
        <input type="submit" value="Continue"/></form></body></html>"#
    )
}

/// The account home page that marks a completed login
pub fn account_home(email: &str) -> String {
    format!(
        r#"<html><head><title>Microsoft account | Home</title></head>
        <body><span class="signed-in">{email}</span></body></html>"#
    )
}

/// Minimal profile page echoing the signed-in account's email
pub fn profile_page(email: &str) -> String {
    format!(
        r#"<html><head><title>Profile</title></head>
        <body><div id="profile-email">{email}</div></body></html>"#
    )
}
