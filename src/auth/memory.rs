use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::{
    repo::{StorageError, UserRepository},
    repo_types::{NewUser, User},
};

/// Map-backed [`UserRepository`] with the same uniqueness rules as the
/// `users` table.
#[derive(Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<Uuid, User>>,
    fail_writes: AtomicBool,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the user with `email`, returning whether one existed.
    pub async fn remove_by_email(&self, email: &str) -> bool {
        let mut users = self.users.write().await;
        let before = users.len();
        users.retain(|_, u| u.email != email);
        users.len() != before
    }

    pub async fn set_active(&self, email: &str, active: bool) {
        let mut users = self.users.write().await;
        if let Some(user) = users.values_mut().find(|u| u.email == email) {
            user.is_active = active;
        }
    }

    /// Makes every subsequent insert fail as if the backend were down.
    pub fn simulate_outage(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.username == username).cloned())
    }

    async fn insert_user(&self, user: NewUser) -> Result<User, StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(anyhow::anyhow!(
                "connection refused (127.0.0.1:5432)"
            )));
        }

        let mut users = self.users.write().await;
        if users
            .values()
            .any(|u| u.email == user.email || u.username == user.username)
        {
            return Err(StorageError::UniqueViolation);
        }

        let created = User {
            id: Uuid::new_v4(),
            email: user.email,
            username: user.username,
            full_name: user.full_name,
            password_hash: user.password_hash,
            is_active: true,
            is_admin: false,
            created_at: OffsetDateTime::now_utc(),
        };
        users.insert(created.id, created.clone());
        Ok(created)
    }
}
