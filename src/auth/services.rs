use std::sync::Arc;

use lazy_static::lazy_static;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{is_valid_email, is_valid_username},
        jwt::TokenService,
        password::{hash_password, verify_password, PasswordError},
        repo::{StorageError, UserRepository},
        repo_types::{NewUser, User},
    },
    error::AuthError,
};

lazy_static! {
    /// Verified against when the login identifier is unknown, so both
    /// failure paths pay for one Argon2 run.
    static ref DUMMY_HASH: String = hash_password("chipper-dummy-password").unwrap_or_default();
}

/// Input for [`Authenticator::register`]. Holds the plaintext password, so
/// it deliberately has no `Debug`.
pub struct Registration {
    pub email: String,
    pub username: String,
    pub full_name: String,
    pub password: String,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Registration, login and per-request identity resolution.
#[derive(Clone)]
pub struct Authenticator {
    users: Arc<dyn UserRepository>,
    tokens: TokenService,
}

impl Authenticator {
    pub fn new(users: Arc<dyn UserRepository>, tokens: TokenService) -> Self {
        Self { users, tokens }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    #[instrument(skip_all, fields(email = %registration.email, username = %registration.username))]
    pub async fn register(&self, registration: Registration) -> Result<User, AuthError> {
        let email = normalize_email(&registration.email);
        let username = registration.username.trim().to_owned();

        if !is_valid_email(&email) {
            return Err(AuthError::validation("Invalid email"));
        }
        // Login treats anything with '@' as an email, so usernames must not carry one.
        if !is_valid_username(&username) {
            return Err(AuthError::validation(
                "Username must be 3-32 letters, digits, '.', '_' or '-'",
            ));
        }

        if self.users.find_user_by_email(&email).await?.is_some() {
            warn!("email already registered");
            return Err(AuthError::DuplicateUser);
        }
        if self.users.find_user_by_username(&username).await?.is_some() {
            warn!("username already taken");
            return Err(AuthError::DuplicateUser);
        }

        let password_hash = hash_password(&registration.password).map_err(|e| {
            if matches!(e, PasswordError::Hashing(_)) {
                AuthError::Internal(e.into())
            } else {
                AuthError::validation(e.to_string())
            }
        })?;

        let user = self
            .users
            .insert_user(NewUser {
                email,
                username,
                full_name: registration.full_name.trim().to_owned(),
                password_hash,
            })
            .await
            .map_err(|e| {
                if matches!(e, StorageError::UniqueViolation) {
                    warn!("concurrent registration won the unique constraint");
                }
                AuthError::from(e)
            })?;

        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Checks credentials and mints an access token whose subject is the
    /// user's email. `identifier` is an email if it contains `@`, otherwise
    /// a username.
    #[instrument(skip(self, password))]
    pub async fn login(&self, identifier: &str, password: &str) -> Result<String, AuthError> {
        let identifier = identifier.trim();
        let found = if identifier.contains('@') {
            self.users
                .find_user_by_email(&normalize_email(identifier))
                .await?
        } else {
            self.users.find_user_by_username(identifier).await?
        };

        let Some(user) = found else {
            let _ = verify_password(password, &DUMMY_HASH);
            warn!("login unknown identifier");
            return Err(AuthError::InvalidCredentials);
        };

        if !verify_password(password, &user.password_hash) {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            warn!(user_id = %user.id, "login on inactive account");
            return Err(AuthError::InvalidCredentials);
        }

        let token = self
            .tokens
            .issue(&user.email, self.tokens.access_ttl)
            .map_err(|e| AuthError::Internal(e.into()))?;

        info!(user_id = %user.id, "user logged in");
        Ok(token)
    }

    /// Maps a bearer token back to a live user record. The user is looked
    /// up on every call; a valid signature alone is not enough.
    #[instrument(skip_all)]
    pub async fn resolve_identity(&self, token: &str) -> Result<User, AuthError> {
        let decoded = self
            .tokens
            .decode(token)
            .map_err(|_| AuthError::Unauthenticated)?;

        match self.users.find_user_by_email(&decoded.subject).await? {
            Some(user) if user.is_active => Ok(user),
            Some(user) => {
                warn!(user_id = %user.id, "token for inactive account");
                Err(AuthError::Unauthenticated)
            }
            None => {
                warn!("token subject no longer exists");
                Err(AuthError::Unauthenticated)
            }
        }
    }
}
