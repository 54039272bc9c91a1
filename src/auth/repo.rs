use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::auth::repo_types::{NewUser, User};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A unique constraint (email or username) rejected the write.
    #[error("unique constraint violated")]
    UniqueViolation,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// User persistence consumed by the authentication flow.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError>;

    /// Persists a new user. Uniqueness is enforced here, not by the caller.
    async fn insert_user(&self, user: NewUser) -> Result<User, StorageError>;
}

const USER_COLUMNS: &str =
    "id, email, username, full_name, password_hash, is_active, is_admin, created_at";

/// PostgreSQL-backed [`UserRepository`].
#[derive(Clone)]
pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("find user by email")?;
        Ok(user)
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(&self.db)
        .await
        .context("find user by username")?;
        Ok(user)
    }

    async fn insert_user(&self, user: NewUser) -> Result<User, StorageError> {
        let mut tx = self.db.begin().await.context("begin tx")?;

        // Dropping `tx` on the error path rolls the insert back.
        let created = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, username, full_name, password_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.full_name)
        .bind(&user.password_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_insert_error)?;

        tx.commit().await.context("commit tx")?;
        debug!(user_id = %created.id, "user row inserted");
        Ok(created)
    }
}

fn map_insert_error(err: sqlx::Error) -> StorageError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.is_unique_violation() {
            return StorageError::UniqueViolation;
        }
    }
    StorageError::Backend(anyhow::Error::new(err).context("insert user"))
}
