//! Credential validation behind the [`Authenticator`] seam.
//!
//! The supervisor only frames the credential payload (see
//! [`crate::protocol`]); deciding whether it names a real user is delegated
//! through this trait. The bundled [`UserTable`] implementation validates
//! against the `[[auth.users]]` entries of the config file, which is enough
//! for small installations and for tests. A deployment with a real account
//! database supplies its own implementation.

use serde::Deserialize;
use tracing::debug;

use crate::config::UserEntry;

/// A non-zero user identity. `0` is never a valid userid; the original
/// wire contract uses it as the "authentication failed" sentinel.
pub type UserId = u32;

/// The credential collaborator: maps a complete credential frame to a
/// userid, or `None` when the frame does not authenticate.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, frame: &[u8]) -> Option<UserId>;
}

/// Credential payload shape accepted by [`UserTable`].
///
/// `u`/`p` are accepted as short aliases so thin clients can keep their
/// frames small.
#[derive(Deserialize)]
struct Credentials {
    #[serde(alias = "u")]
    user: String,
    #[serde(alias = "p")]
    pass: String,
}

/// Config-backed user table.
pub struct UserTable {
    users: Vec<UserEntry>,
}

impl UserTable {
    pub fn new(users: Vec<UserEntry>) -> Self {
        Self { users }
    }
}

impl Authenticator for UserTable {
    fn authenticate(&self, frame: &[u8]) -> Option<UserId> {
        let creds: Credentials = match serde_json::from_slice(frame) {
            Ok(c) => c,
            Err(e) => {
                debug!("Unparseable credential frame: {e}");
                return None;
            }
        };

        let entry = self.users.iter().find(|u| u.name == creds.user)?;
        if constant_time_eq(entry.password.as_bytes(), creds.pass.as_bytes()) {
            Some(entry.id)
        } else {
            None
        }
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so an attacker cannot determine the password length
/// from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> UserTable {
        UserTable::new(vec![
            UserEntry {
                name: "alice".to_string(),
                password: "secret".to_string(),
                id: 7,
            },
            UserEntry {
                name: "bob".to_string(),
                password: "hunter2".to_string(),
                id: 9,
            },
        ])
    }

    #[test]
    fn test_valid_credentials() {
        let auth = table();
        assert_eq!(
            auth.authenticate(b"{\"user\":\"alice\",\"pass\":\"secret\"}"),
            Some(7)
        );
    }

    #[test]
    fn test_short_aliases() {
        let auth = table();
        assert_eq!(auth.authenticate(b"{\"u\":\"bob\",\"p\":\"hunter2\"}"), Some(9));
    }

    #[test]
    fn test_wrong_password() {
        let auth = table();
        assert_eq!(
            auth.authenticate(b"{\"user\":\"alice\",\"pass\":\"wrong\"}"),
            None
        );
    }

    #[test]
    fn test_unknown_user() {
        let auth = table();
        assert_eq!(
            auth.authenticate(b"{\"user\":\"mallory\",\"pass\":\"x\"}"),
            None
        );
    }

    #[test]
    fn test_malformed_json() {
        let auth = table();
        assert_eq!(auth.authenticate(b"{\"user\":"), None);
        assert_eq!(auth.authenticate(b"not json at all}"), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }
}
