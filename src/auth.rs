//! Rotating request tokens.
//!
//! A token is a double hash over `host + time bucket + caller identifier`.
//! It deters casual abuse of the HTTP surface; it is not a security boundary.
use sha2::{Digest, Sha256};

use crate::config::AuthConfig;
use crate::types::Token;

/// Hash `seed`, take hex chars `7..27` of the digest, hash that again.
pub fn derive_token(seed: &str) -> String {
    let first = hex::encode(Sha256::digest(seed.as_bytes()));
    let second = Sha256::digest(first[7..27].as_bytes());
    hex::encode(second)
}

/// Index of the rotation bucket `now_ms` falls in.
pub fn window_index(now_ms: u64, window_minutes: u64) -> u64 {
    now_ms / window_minutes.max(1).saturating_mul(60_000)
}

pub fn seed(host: &str, caller: &str, window_start: u64) -> String {
    format!("{host}{window_start}{caller}")
}

/// Accept the ephemeral token, or the permanent secret when one is configured.
pub fn validate(supplied: &str, ephemeral: &str, permanent: Option<&str>) -> bool {
    supplied == ephemeral || permanent.is_some_and(|p| supplied == p)
}

fn now_ms() -> u64 {
    let nanos = ::time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}

/// Derives per-request [`AuthContext`]s from the configured window and secret.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthority {
    config: AuthConfig,
}

impl TokenAuthority {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn secret_configured(&self) -> bool {
        self.config.secret.is_some()
    }

    pub fn token_at(&self, host: &str, caller: &str, now_ms: u64) -> Token {
        let window_start = window_index(now_ms, self.config.window_minutes);
        Token {
            value: derive_token(&seed(host, caller, window_start)),
            window_start,
        }
    }

    pub fn context(&self, host: &str, caller: &str) -> AuthContext {
        self.context_at(host, caller, now_ms())
    }

    pub fn context_at(&self, host: &str, caller: &str, now_ms: u64) -> AuthContext {
        AuthContext {
            ephemeral: self.token_at(host, caller, now_ms),
            secret: self.config.secret.clone(),
        }
    }
}

/// Tokens valid for one request. Computed per request, never shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub ephemeral: Token,
    pub secret: Option<String>,
}

impl AuthContext {
    /// The permanent token: the configured secret, or the ephemeral token.
    pub fn permanent(&self) -> &str {
        self.secret.as_deref().unwrap_or(&self.ephemeral.value)
    }

    pub fn secret_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn accepts(&self, supplied: Option<&str>) -> bool {
        supplied.is_some_and(|s| validate(s, &self.ephemeral.value, Some(self.permanent())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_760_000_000_000;

    fn authority(secret: Option<&str>) -> TokenAuthority {
        TokenAuthority::new(AuthConfig {
            secret: secret.map(str::to_string),
            ..AuthConfig::default()
        })
    }

    #[test]
    fn derive_is_deterministic_lowercase_hex() {
        let a = derive_token("example.com12345Mozilla");
        let b = derive_token("example.com12345Mozilla");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn every_seed_component_changes_the_token() {
        let auth = authority(None);
        let base = auth.token_at("a.example", "ua", NOW);
        assert_ne!(base, auth.token_at("b.example", "ua", NOW));
        assert_ne!(base, auth.token_at("a.example", "other-ua", NOW));
        assert_ne!(base.value, auth.token_at("a.example", "ua", NOW + 31 * 60_000).value);
    }

    #[test]
    fn token_is_stable_inside_its_bucket() {
        let auth = authority(None);
        let start = window_index(NOW, 31) * 31 * 60_000;
        let first = auth.token_at("h", "ua", start);
        let last = auth.token_at("h", "ua", start + 31 * 60_000 - 1);
        assert_eq!(first, last);
        assert_ne!(first, auth.token_at("h", "ua", start + 31 * 60_000));
    }

    #[test]
    fn huge_window_does_not_overflow() {
        assert_eq!(window_index(NOW, u64::MAX), 0);
        let auth = TokenAuthority::new(AuthConfig {
            window_minutes: u64::MAX,
            ..AuthConfig::default()
        });
        assert_eq!(auth.token_at("h", "ua", NOW).window_start, 0);
    }

    #[test]
    fn window_index_floors() {
        assert_eq!(window_index(0, 31), 0);
        assert_eq!(window_index(31 * 60_000 - 1, 31), 0);
        assert_eq!(window_index(31 * 60_000, 31), 1);
    }

    #[test]
    fn validate_without_secret_accepts_only_ephemeral() {
        let ctx = authority(None).context_at("h", "ua", NOW);
        let tok = ctx.ephemeral.value.clone();
        assert!(ctx.accepts(Some(&tok)));
        assert!(!ctx.accepts(Some("nope")));
        assert!(!ctx.accepts(None));
        assert_eq!(ctx.permanent(), tok);
    }

    #[test]
    fn validate_with_secret_accepts_both() {
        let ctx = authority(Some("s3cret")).context_at("h", "ua", NOW);
        let tok = ctx.ephemeral.value.clone();
        assert!(ctx.accepts(Some("s3cret")));
        assert!(ctx.accepts(Some(&tok)));
        assert!(!ctx.accepts(Some("")));
    }

    #[test]
    fn free_validate_function() {
        assert!(validate("a", "a", None));
        assert!(validate("p", "a", Some("p")));
        assert!(!validate("p", "a", None));
    }
}
