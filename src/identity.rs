//! Lock-holder identity for the object store.
//!
//! A [`LockerIdentity`] names the user and edit session behind a lock
//! request, plus two override flags that relax the single-writer rule:
//!
//! - `override_same_user`: supersede a lock held by the *same* user in a
//!   different session (e.g. a browser that lost its session cookie).
//! - `override_different_user`: supersede any lock regardless of holder
//!   (administrative takeover). This subsumes the same-user override.
//!
//! Identities are compared with [`LockerIdentity::same_id`], not structural
//! equality: two identities count as the same holder when the user matches
//! and either the sessions match or one side carries a same-user override.

use serde::{Deserialize, Serialize};

/// Identity of a lock holder: user, session, and override flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockerIdentity {
    /// User name from the security token.
    pub user: String,

    /// Session identifier for this edit session.
    pub session: String,

    /// Allow this request to supersede a lock held by the same user in
    /// another session.
    #[serde(default)]
    pub override_same_user: bool,

    /// Allow this request to supersede a lock held by anyone.
    #[serde(default)]
    pub override_different_user: bool,
}

impl LockerIdentity {
    /// Create an identity with no override flags.
    pub fn new(user: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            session: session.into(),
            override_same_user: false,
            override_different_user: false,
        }
    }

    /// Set the same-user override flag.
    pub fn with_override_same_user(mut self, value: bool) -> Self {
        self.override_same_user = value;
        self
    }

    /// Set the different-user override flag.
    pub fn with_override_different_user(mut self, value: bool) -> Self {
        self.override_different_user = value;
        self
    }

    /// Build a local administrative identity from the environment.
    ///
    /// The user comes from `USER`/`USERNAME`, the session from the host name
    /// and process id, so two processes on one machine never share a session.
    pub fn local_system() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());

        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self::new(user, format!("{}:{}", host, std::process::id()))
    }

    /// `user@host`-style display string for diagnostics and audit records.
    pub fn actor_string(&self) -> String {
        format!("{}@{}", self.user, self.session)
    }

    /// Whether this identity carries same-user override semantics.
    ///
    /// `override_different_user` implies `override_same_user`.
    pub fn overrides_same_user(&self) -> bool {
        self.override_same_user || self.override_different_user
    }

    /// Whether two identities count as the same lock holder.
    ///
    /// True when the user names match and either the sessions match or
    /// either side requests the same-user override. This is deliberately
    /// symmetric: a holder that acquired with an override flag set accepts
    /// re-acquisition from any of that user's sessions, and vice versa.
    pub fn same_id(&self, other: &LockerIdentity) -> bool {
        self.user == other.user
            && (self.session == other.session
                || self.overrides_same_user()
                || other.overrides_same_user())
    }

    /// Whether this identity may take over a lock held by `holder`.
    pub fn may_supersede(&self, holder: &LockerIdentity) -> bool {
        self.override_different_user || self.same_id(holder)
    }
}

impl std::fmt::Display for LockerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (session {})", self.user, self.session)
    }
}
