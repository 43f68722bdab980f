//! Headless login automation for Microsoft-account-style sign-in.
//!
//! Drives the multi-page CSRF-protected credential flow page by page:
//! classify each response into a closed state set, resolve the next form or
//! redirect, dispatch it, repeat under an explicit step bound. On top of the
//! core flow the crate carries OAuth2/PKCE token acquisition for the mail
//! API, a token lifecycle manager with probe/refresh/reacquire fallback, and
//! OTP retrieval from a secondary mailbox.
//!
//! The typical entry point is [`flow::LoginFlow`]:
//!
//! ```no_run
//! use msa_login::config::LoginOptions;
//! use msa_login::flow::LoginFlow;
//!
//! # async fn example() -> msa_login::error::Result<()> {
//! let options = LoginOptions::new("user@example.com", "password");
//! let outcome = LoginFlow::new(options)?.run().await?;
//! if outcome.success {
//!     // persist outcome.cookie_jar for session resumption
//! }
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod error;
pub mod flow;
pub mod http;
pub mod models;
pub mod oauth;
pub mod otp;
pub mod pkce;
pub mod resolver;
pub mod session;
pub mod token;

pub use config::{Config, LoginOptions, OtpPollOptions, RecoveryAccount};
pub use error::{AuthError, Result};
pub use flow::LoginFlow;
pub use models::{AuthState, LoginOutcome, OtpResult, TokenSet};
pub use session::{CookieJar, Session};
