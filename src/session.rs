//! Session state and the resolver that infers privilege from a stored credential.
//!
//! There is no "who am I" endpoint. A credential is only known to be admin after
//! a privileged resource has answered it successfully; until then it is a
//! regular user.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::credential::CredentialStore;

/// Privilege tier, ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
  Anonymous,
  User,
  Admin,
}

impl Tier {
  pub fn label(self) -> &'static str {
    match self {
      Tier::Anonymous => "anonymous",
      Tier::User => "user",
      Tier::Admin => "admin",
    }
  }
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

/// One client session. Passed explicitly to every component that needs it.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
  token: Option<String>,
  subject: Option<String>,
  tier: Tier,
}

impl fmt::Debug for Session {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Session")
      .field("token", &self.token.as_ref().map(|_| "<redacted>"))
      .field("subject", &self.subject)
      .field("tier", &self.tier)
      .finish()
  }
}

impl Session {
  pub fn anonymous() -> Self {
    Self { token: None, subject: None, tier: Tier::Anonymous }
  }

  /// A session holding `token`, not yet proven to be privileged.
  pub fn authenticated(token: impl Into<String>) -> Self {
    let token = token.into();
    let subject = subject_from_token(&token);
    Self { token: Some(token), subject, tier: Tier::User }
  }

  pub fn token(&self) -> Option<&str> {
    self.token.as_deref()
  }

  /// Identifier the push channel is subscribed under.
  pub fn subject(&self) -> Option<&str> {
    self.subject.as_deref()
  }

  pub fn tier(&self) -> Tier {
    self.tier
  }

  pub fn is_authenticated(&self) -> bool {
    self.token.is_some()
  }

  pub fn is_admin(&self) -> bool {
    self.tier == Tier::Admin
  }

  /// Record the outcome of a privilege probe. Anonymous sessions stay anonymous.
  pub(crate) fn confirm_tier(&mut self, tier: Tier) {
    if self.token.is_none() {
      return;
    }
    if self.tier != tier {
      info!(from = %self.tier, to = %tier, "session: tier changed");
    }
    self.tier = tier.max(Tier::User);
  }

  /// Drop the credential after the backend stopped accepting it.
  pub fn invalidate(&mut self) {
    if self.token.is_some() {
      warn!("session: credential invalidated");
    }
    *self = Self::anonymous();
  }
}

/// Best-effort read of the subject from a JWT's claims. The token is not verified;
/// the value is only used to address the push channel.
pub fn subject_from_token(token: &str) -> Option<String> {
  let payload = token.split('.').nth(1)?;
  let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
  let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
  match claims.get("id") {
    Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
    Some(serde_json::Value::String(s)) if !s.is_empty() => return Some(s.clone()),
    _ => {}
  }
  claims.get("sub").and_then(|s| s.as_str()).filter(|s| !s.is_empty()).map(str::to_string)
}

pub struct SessionResolver {
  backend: Arc<dyn Backend>,
  credentials: Arc<dyn CredentialStore>,
}

impl SessionResolver {
  pub fn new(backend: Arc<dyn Backend>, credentials: Arc<dyn CredentialStore>) -> Self {
    Self { backend, credentials }
  }

  /// Build the session for the stored credential. Never fails: an unreadable
  /// store counts as logged out and any probe failure leaves the tier at user.
  pub async fn resolve(&self) -> Session {
    let token = match self.credentials.load() {
      Ok(Some(token)) => token,
      Ok(None) => {
        debug!("session: no stored credential");
        return Session::anonymous();
      }
      Err(e) => {
        warn!(err = %e, "session: failed to read credential, continuing anonymously");
        return Session::anonymous();
      }
    };

    let mut session = Session::authenticated(token.clone());
    match self.backend.fetch_private_library(&token).await {
      Ok(_) => session.confirm_tier(Tier::Admin),
      Err(e) => {
        debug!(err = %e, "session: privilege probe rejected");
        session.confirm_tier(Tier::User);
      }
    }
    info!(tier = %session.tier(), subject = ?session.subject(), "session: resolved");
    session
  }

  /// Persist a freshly issued token and return its (unprobed) session.
  pub fn login(&self, token: &str) -> anyhow::Result<Session> {
    self.credentials.save(token)?;
    Ok(Session::authenticated(token))
  }

  pub fn logout(&self, session: &mut Session) -> anyhow::Result<()> {
    self.credentials.clear()?;
    *session = Session::anonymous();
    info!("session: logged out");
    Ok(())
  }
}
