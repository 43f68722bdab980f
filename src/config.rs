use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AuthError, Result};
use crate::session::Session;

/// Tunables for the automation core, loadable from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub otp: OtpPollOptions,
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| AuthError::ConfigError(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }
}

/// HTTP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout in seconds; aborts the in-flight call rather
    /// than hanging indefinitely
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            proxy: None,
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Static outbound proxy for one attempt (rotation policy is the caller's)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Proxy URL in the form reqwest expects
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Polling discipline for OTP retrieval
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OtpPollOptions {
    /// Total budget for the poll loop in seconds
    #[serde(default = "default_otp_timeout_secs")]
    pub timeout_secs: u64,
    /// Sleep between poll iterations in seconds
    #[serde(default = "default_otp_interval_secs")]
    pub poll_interval_secs: u64,
    /// One-time delay before the first lookup, giving the provider time to
    /// deliver the mail
    #[serde(default = "default_otp_initial_delay_secs")]
    pub initial_delay_secs: u64,
    /// Emails older than this never qualify as OTP candidates
    #[serde(default = "default_otp_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for OtpPollOptions {
    fn default() -> Self {
        Self {
            timeout_secs: default_otp_timeout_secs(),
            poll_interval_secs: default_otp_interval_secs(),
            initial_delay_secs: default_otp_initial_delay_secs(),
            max_age_secs: default_otp_max_age_secs(),
        }
    }
}

impl OtpPollOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_age_secs as i64)
    }
}

/// Secondary mailbox used to receive OTP codes on behalf of the primary
/// account. Supplied by the caller; read-only to the core except for token
/// refresh write-back into its own session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecoveryAccount {
    /// When true, the add-recovery-proof page is answered with `email`
    /// instead of being skipped
    #[serde(rename = "Add", default)]
    pub add: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Serialized session for the recovery mailbox
    #[serde(default)]
    pub cookie_jar: Option<String>,
    /// Pre-authenticated session, preferred over `cookie_jar` when present
    #[serde(skip)]
    pub session: Option<Session>,
}

impl RecoveryAccount {
    /// The recovery session, importing `cookie_jar` when no live session
    /// was supplied. `None` means OTP retrieval cannot run.
    pub fn resolve_session(&self) -> Option<Session> {
        if let Some(session) = &self.session {
            return Some(session.clone());
        }
        self.cookie_jar.as_deref().and_then(Session::import)
    }
}

/// Everything one login attempt needs
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    pub email: String,
    pub password: String,
    /// Previously exported session to resume from
    pub cookie_jar: Option<String>,
    pub recovery: Option<RecoveryAccount>,
    pub config: Config,
}

impl LoginOptions {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// The configured recovery email, required when `recovery.add` is set.
    /// Missing email with `add == true` is a configuration error raised
    /// immediately, not silently skipped.
    pub fn recovery_email(&self) -> Result<Option<&str>> {
        match &self.recovery {
            Some(recovery) => match (&recovery.email, recovery.add) {
                (Some(email), _) => Ok(Some(email.as_str())),
                (None, true) => Err(AuthError::ConfigError(
                    "recovery.Add is set but no recovery email is configured".to_string(),
                )),
                (None, false) => Ok(None),
            },
            None => Ok(None),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_otp_timeout_secs() -> u64 {
    120
}

fn default_otp_interval_secs() -> u64 {
    10
}

fn default_otp_initial_delay_secs() -> u64 {
    5
}

fn default_otp_max_age_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http.request_timeout_secs, 30);
        assert_eq!(config.otp.timeout_secs, 120);
        assert_eq!(config.otp.poll_interval_secs, 10);
        assert_eq!(config.otp.initial_delay_secs, 5);
        assert_eq!(config.otp.max_age_secs, 300);
    }

    #[tokio::test]
    async fn test_load_partial_toml() {
        let toml_content = r#"
            [otp]
            timeout_secs = 60

            [http]
            request_timeout_secs = 15
        "#;
        let temp = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(temp.path(), toml_content).await.unwrap();

        let config = Config::load(temp.path()).await.unwrap();
        assert_eq!(config.otp.timeout_secs, 60);
        // Unset fields fall back to defaults
        assert_eq!(config.otp.poll_interval_secs, 10);
        assert_eq!(config.http.request_timeout_secs, 15);
        assert!(config.http.proxy.is_none());
    }

    #[tokio::test]
    async fn test_load_invalid_toml() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(temp.path(), "not [valid toml").await.unwrap();

        let result = Config::load(temp.path()).await;
        assert!(matches!(result, Err(AuthError::ConfigError(_))));
    }

    #[test]
    fn test_proxy_url() {
        let proxy = ProxyConfig {
            host: "10.0.0.1".to_string(),
            port: 8080,
            username: None,
            password: None,
        };
        assert_eq!(proxy.url(), "http://10.0.0.1:8080");
    }

    #[test]
    fn test_recovery_email_required_when_add() {
        let mut options = LoginOptions::new("user@example.com", "hunter2");
        options.recovery = Some(RecoveryAccount {
            add: true,
            ..Default::default()
        });
        assert!(matches!(
            options.recovery_email(),
            Err(AuthError::ConfigError(_))
        ));

        options.recovery.as_mut().unwrap().email = Some("backup@example.com".to_string());
        assert_eq!(options.recovery_email().unwrap(), Some("backup@example.com"));
    }

    #[test]
    fn test_recovery_email_optional_without_add() {
        let mut options = LoginOptions::new("user@example.com", "hunter2");
        assert_eq!(options.recovery_email().unwrap(), None);

        options.recovery = Some(RecoveryAccount::default());
        assert_eq!(options.recovery_email().unwrap(), None);
    }
}
