//! Owner bearer tokens.
//!
//! Token format: `<owner_id>.<expires_at_ms>.<hex mac>` where the MAC is a
//! keyed BLAKE3 hash of `<owner_id>.<expires_at_ms>` under a key derived from
//! the configured signing secret. Registration and login live elsewhere; this
//! module only answers "which owner is this caller, if any".

use crate::error::{Result, SyncError};
use crate::types::{Scope, now_millis};
use std::fmt;
use std::time::Duration;
use tracing::debug;

const TOKEN_KEY_CONTEXT: &str = "settingsync 2024-06-01 owner bearer token mac";

/// Who is making a request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    Anonymous,
    Owner(String),
}

impl Caller {
    pub fn can_access(&self, scope: &Scope) -> bool {
        match (self, scope) {
            (_, Scope::Public) => true,
            (Caller::Owner(me), Scope::Owner(owner)) => me == owner,
            (Caller::Anonymous, Scope::Owner(_)) => false,
        }
    }

    pub fn authorize(&self, scope: &Scope) -> Result<()> {
        if self.can_access(scope) {
            Ok(())
        } else {
            Err(SyncError::Authorization(format!(
                "caller is not permitted for scope {}",
                scope
            )))
        }
    }
}

pub struct Authenticator {
    key: [u8; 32],
}

impl Authenticator {
    pub fn new(signing_secret: &str) -> Result<Self> {
        if signing_secret.is_empty() {
            return Err(SyncError::FatalConfiguration(
                "signing secret must not be empty".into(),
            ));
        }
        Ok(Self {
            key: blake3::derive_key(TOKEN_KEY_CONTEXT, signing_secret.as_bytes()),
        })
    }

    pub fn issue(&self, owner_id: &str, ttl: Duration) -> String {
        self.issue_until(owner_id, now_millis().saturating_add(ttl.as_millis() as i64))
    }

    pub fn issue_until(&self, owner_id: &str, expires_at: i64) -> String {
        let mac = self.mac(owner_id, expires_at);
        format!("{}.{}.{}", owner_id, expires_at, hex::encode(mac.as_bytes()))
    }

    /// Verify a token and return the owner id it was issued for
    pub fn verify(&self, token: &str) -> Result<String> {
        let invalid = || SyncError::Authorization("invalid token".into());

        let (claims, signature) = token.rsplit_once('.').ok_or_else(invalid)?;
        let (owner_id, expires_at) = claims.rsplit_once('.').ok_or_else(invalid)?;
        if owner_id.is_empty() {
            return Err(invalid());
        }
        let expires_at: i64 = expires_at.parse().map_err(|_| invalid())?;

        let provided: [u8; 32] = hex::decode(signature)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(invalid)?;
        // blake3::Hash equality is constant time
        if blake3::Hash::from(provided) != self.mac(owner_id, expires_at) {
            debug!("rejected token with bad signature");
            return Err(invalid());
        }

        if expires_at < now_millis() {
            return Err(SyncError::Authorization("token expired".into()));
        }
        Ok(owner_id.to_string())
    }

    /// No token means anonymous; a bad token is an authorization failure
    pub fn authenticate(&self, token: Option<&str>) -> Result<Caller> {
        match token {
            None | Some("") => Ok(Caller::Anonymous),
            Some(token) => self.verify(token).map(Caller::Owner),
        }
    }

    fn mac(&self, owner_id: &str, expires_at: i64) -> blake3::Hash {
        blake3::keyed_hash(&self.key, format!("{}.{}", owner_id, expires_at).as_bytes())
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_verify() {
        let auth = Authenticator::new("secret").unwrap();
        let token = auth.issue("42", Duration::from_secs(60));
        assert_eq!(auth.verify(&token).unwrap(), "42");
        assert_eq!(
            auth.authenticate(Some(&token)).unwrap(),
            Caller::Owner("42".into())
        );
    }

    #[test]
    fn test_owner_id_may_contain_dots() {
        let auth = Authenticator::new("secret").unwrap();
        let token = auth.issue("a.b@c.d", Duration::from_secs(60));
        assert_eq!(auth.verify(&token).unwrap(), "a.b@c.d");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = Authenticator::new("secret").unwrap();
        let verifier = Authenticator::new("other").unwrap();
        let token = issuer.issue("42", Duration::from_secs(60));
        assert!(matches!(
            verifier.verify(&token),
            Err(SyncError::Authorization(_))
        ));
    }

    #[test]
    fn test_tampered_owner_rejected() {
        let auth = Authenticator::new("secret").unwrap();
        let token = auth.issue("42", Duration::from_secs(60));
        let forged = token.replacen("42", "43", 1);
        assert!(auth.verify(&forged).is_err());
    }

    #[test]
    fn test_expired_rejected() {
        let auth = Authenticator::new("secret").unwrap();
        let token = auth.issue_until("42", now_millis() - 1);
        assert!(auth.verify(&token).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        let auth = Authenticator::new("secret").unwrap();
        for token in ["", "abc", "a.b", ".1.00", "42.notanumber.00", "42.1.zz"] {
            assert!(auth.verify(token).is_err(), "accepted {:?}", token);
        }
    }

    #[test]
    fn test_missing_token_is_anonymous() {
        let auth = Authenticator::new("secret").unwrap();
        assert_eq!(auth.authenticate(None).unwrap(), Caller::Anonymous);
        assert_eq!(auth.authenticate(Some("")).unwrap(), Caller::Anonymous);
        assert!(auth.authenticate(Some("junk")).is_err());
    }

    #[test]
    fn test_empty_secret_is_fatal() {
        assert!(matches!(
            Authenticator::new(""),
            Err(SyncError::FatalConfiguration(_))
        ));
    }

    #[test]
    fn test_scope_access() {
        let anon = Caller::Anonymous;
        let owner = Caller::Owner("1".into());
        assert!(anon.can_access(&Scope::Public));
        assert!(!anon.can_access(&Scope::owner("1")));
        assert!(owner.can_access(&Scope::Public));
        assert!(owner.can_access(&Scope::owner("1")));
        assert!(!owner.can_access(&Scope::owner("2")));
        assert!(matches!(
            anon.authorize(&Scope::owner("1")),
            Err(SyncError::Authorization(_))
        ));
    }
}
