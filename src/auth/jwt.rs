use std::fmt;
use std::time::Duration;

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;

use crate::config::JwtConfig;

/// JWT payload used for authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user email
    pub iat: i64,    // issued at (unix timestamp)
    pub exp: i64,    // expires at (unix timestamp)
    pub iss: String,
    pub aud: String,
}

/// What a successfully validated token tells us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedToken {
    pub subject: String,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// The only error callers ever see from [`TokenService::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid token")]
pub struct InvalidToken;

/// Why a token was turned down. Logged, never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenRejection {
    Malformed,
    BadSignature,
    ClaimMismatch,
    Expired,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token ttl is out of range")]
    TtlOutOfRange,
    #[error("token signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// Signs and validates access tokens with the process-wide HS256 secret.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    pub access_ttl: Duration,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("access_ttl", &self.access_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(cfg: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(std::slice::from_ref(&cfg.audience));
        validation.set_issuer(std::slice::from_ref(&cfg.issuer));
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);
        // Expiry is checked by hand so that `now == exp` already counts as expired.
        validation.validate_exp = false;
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(cfg.secret_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret_bytes()),
            validation,
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            access_ttl: ttl_from_minutes(cfg.ttl_minutes),
        }
    }

    /// Mints a token for `subject` that expires `ttl` from now.
    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String, TokenError> {
        self.issue_at(subject, ttl, OffsetDateTime::now_utc())
    }

    pub(crate) fn issue_at(
        &self,
        subject: &str,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<String, TokenError> {
        let ttl_secs = i64::try_from(ttl.as_secs()).map_err(|_| TokenError::TtlOutOfRange)?;
        let exp = now
            .checked_add(TimeDuration::seconds(ttl_secs))
            .ok_or(TokenError::TtlOutOfRange)?;
        let claims = Claims {
            sub: subject.to_owned(),
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        debug!(exp = claims.exp, "jwt signed");
        Ok(token)
    }

    /// Validates a token and returns its subject and lifetime.
    ///
    /// Expired, tampered, foreign and garbled tokens all come back as the
    /// same [`InvalidToken`]; the precise reason only goes to the debug log.
    pub fn decode(&self, token: &str) -> Result<DecodedToken, InvalidToken> {
        self.decode_at(token, OffsetDateTime::now_utc())
    }

    pub(crate) fn decode_at(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<DecodedToken, InvalidToken> {
        self.inspect(token, now).map_err(|reason| {
            debug!(?reason, "jwt rejected");
            InvalidToken
        })
    }

    pub(crate) fn inspect(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<DecodedToken, TokenRejection> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| classify(e.kind()))?;
        let claims = data.claims;

        if now.unix_timestamp() >= claims.exp {
            return Err(TokenRejection::Expired);
        }
        if claims.sub.is_empty() {
            return Err(TokenRejection::Malformed);
        }

        let issued_at = OffsetDateTime::from_unix_timestamp(claims.iat)
            .map_err(|_| TokenRejection::Malformed)?;
        let expires_at = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| TokenRejection::Malformed)?;

        Ok(DecodedToken {
            subject: claims.sub,
            issued_at,
            expires_at,
        })
    }
}

/// Negative values become zero, oversized ones saturate.
fn ttl_from_minutes(minutes: i64) -> Duration {
    let minutes = u64::try_from(minutes).unwrap_or(0);
    Duration::from_secs(minutes.saturating_mul(60))
}

fn classify(kind: &ErrorKind) -> TokenRejection {
    match kind {
        ErrorKind::InvalidSignature => TokenRejection::BadSignature,
        ErrorKind::ExpiredSignature => TokenRejection::Expired,
        ErrorKind::InvalidIssuer
        | ErrorKind::InvalidAudience
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::MissingRequiredClaim(_) => TokenRejection::ClaimMismatch,
        _ => TokenRejection::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn make_service(secret: &str, issuer: &str, audience: &str) -> TokenService {
        TokenService::new(&JwtConfig {
            secret: SecretString::from(secret.to_string()),
            issuer: issuer.into(),
            audience: audience.into(),
            ttl_minutes: 5,
        })
    }

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn issue_and_decode_roundtrip() {
        let tokens = make_service("dev-secret", "test-issuer", "test-aud");
        let token = tokens
            .issue("alice@example.com", Duration::from_secs(300))
            .expect("sign token");
        let decoded = tokens.decode(&token).expect("decode token");
        assert_eq!(decoded.subject, "alice@example.com");
        assert_eq!(
            decoded.expires_at - decoded.issued_at,
            TimeDuration::seconds(300)
        );
    }

    #[test]
    fn token_is_valid_until_expiry_then_rejected() {
        let tokens = make_service("dev-secret", "iss", "aud");
        let token = tokens
            .issue_at("a@x.com", Duration::from_secs(60), t0())
            .unwrap();

        let just_before = t0() + TimeDuration::seconds(59);
        assert_eq!(tokens.decode_at(&token, just_before).unwrap().subject, "a@x.com");

        let at_expiry = t0() + TimeDuration::seconds(60);
        assert_eq!(tokens.decode_at(&token, at_expiry), Err(InvalidToken));
        assert_eq!(
            tokens.inspect(&token, at_expiry),
            Err(TokenRejection::Expired)
        );
    }

    #[test]
    fn zero_ttl_token_is_already_expired() {
        let tokens = make_service("dev-secret", "iss", "aud");
        let token = tokens.issue("a@x.com", Duration::ZERO).unwrap();
        assert_eq!(tokens.decode(&token), Err(InvalidToken));
    }

    #[test]
    fn any_single_character_change_is_rejected() {
        let tokens = make_service("dev-secret", "iss", "aud");
        let token = tokens
            .issue_at("a@x.com", Duration::from_secs(600), t0())
            .unwrap();
        let now = t0() + TimeDuration::seconds(1);
        assert!(tokens.decode_at(&token, now).is_ok());

        for (i, c) in token.char_indices() {
            let replacement = if c == 'A' { 'B' } else { 'A' };
            let mut tampered = token.clone();
            tampered.replace_range(i..i + c.len_utf8(), &replacement.to_string());
            assert_eq!(
                tokens.decode_at(&tampered, now),
                Err(InvalidToken),
                "tampering position {i} was accepted"
            );
        }
    }

    #[test]
    fn foreign_secret_is_a_bad_signature() {
        let ours = make_service("secret-one", "iss", "aud");
        let theirs = make_service("secret-two", "iss", "aud");
        let token = theirs
            .issue_at("a@x.com", Duration::from_secs(600), t0())
            .unwrap();
        assert_eq!(
            ours.inspect(&token, t0()),
            Err(TokenRejection::BadSignature)
        );
        assert_eq!(ours.decode_at(&token, t0()), Err(InvalidToken));
    }

    #[test]
    fn wrong_issuer_or_audience_is_rejected() {
        let good = make_service("same-secret", "good-iss", "good-aud");
        let other = make_service("same-secret", "bad-iss", "bad-aud");
        let token = good
            .issue_at("a@x.com", Duration::from_secs(600), t0())
            .unwrap();
        assert_eq!(
            other.inspect(&token, t0()),
            Err(TokenRejection::ClaimMismatch)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let tokens = make_service("dev-secret", "iss", "aud");
        assert_eq!(
            tokens.inspect("not.a.jwt", t0()),
            Err(TokenRejection::Malformed)
        );
        assert_eq!(tokens.decode(""), Err(InvalidToken));
    }

    #[test]
    fn extreme_ttl_minutes_do_not_overflow() {
        assert_eq!(ttl_from_minutes(30), Duration::from_secs(1800));
        assert_eq!(ttl_from_minutes(-1), Duration::ZERO);
        assert_eq!(ttl_from_minutes(i64::MAX), Duration::from_secs(u64::MAX));

        let tokens = TokenService::new(&JwtConfig {
            secret: SecretString::from("dev-secret".to_string()),
            issuer: "iss".into(),
            audience: "aud".into(),
            ttl_minutes: i64::MAX,
        });
        assert!(matches!(
            tokens.issue("a@x.com", tokens.access_ttl),
            Err(TokenError::TtlOutOfRange)
        ));
    }

    #[test]
    fn debug_does_not_leak_keys() {
        let tokens = make_service("super-secret-key", "iss", "aud");
        let printed = format!("{:?}", tokens);
        assert!(!printed.contains("super-secret-key"));
    }
}
