use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::{
        repo_types::User,
        services::{normalize_email, Registration},
    },
    error::AuthError,
};

pub const MIN_PASSWORD_CHARS: usize = 8;
const MAX_FULL_NAME_CHARS: usize = 100;

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    static ref USERNAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_.-]{3,32}$").unwrap();
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

pub(crate) fn is_valid_username(username: &str) -> bool {
    USERNAME_RE.is_match(username)
}

/// Request body for user registration.
#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub full_name: String,
    pub password: String,
}

impl RegisterRequest {
    pub fn validate(self) -> Result<Registration, AuthError> {
        let email = normalize_email(&self.email);
        if !is_valid_email(&email) {
            return Err(AuthError::validation("Invalid email"));
        }

        let username = self.username.trim().to_owned();
        if !is_valid_username(&username) {
            return Err(AuthError::validation(
                "Username must be 3-32 letters, digits, '.', '_' or '-'",
            ));
        }

        let full_name = self.full_name.trim().to_owned();
        if full_name.is_empty() || full_name.chars().count() > MAX_FULL_NAME_CHARS {
            return Err(AuthError::validation("Invalid full name"));
        }

        if self.password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(AuthError::validation("Password too short"));
        }

        Ok(Registration {
            email,
            username,
            full_name,
            password: self.password,
        })
    }
}

/// Request body for login. `username` may also hold an email.
#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(alias = "email")]
    pub username: String,
    pub password: String,
}

/// OAuth2 password grant form, as sent to `/auth/token`.
#[derive(Deserialize)]
pub struct TokenForm {
    #[serde(default)]
    pub grant_type: Option<String>,
    pub username: String,
    pub password: String,
}

/// Response returned after a successful login.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

impl TokenResponse {
    pub fn bearer(access_token: String, expires_in: u64) -> Self {
        Self {
            access_token,
            token_type: "bearer",
            expires_in,
        }
    }
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub full_name: String,
    pub is_active: bool,
    pub is_admin: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            email: u.email,
            username: u.username,
            full_name: u.full_name,
            is_active: u.is_active,
            is_admin: u.is_admin,
            created_at: u.created_at,
        }
    }
}
