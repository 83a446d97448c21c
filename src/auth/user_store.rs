//! User Storage
//! Mission: Securely store and manage user accounts in Postgres

use crate::auth::models::User;
use anyhow::{Context, Result};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Errors the store surfaces distinctly so the API layer can map them to
/// specific HTTP statuses instead of a blanket 500.
#[derive(Debug, Error)]
pub enum UserStoreError {
    #[error("email already registered")]
    EmailTaken,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// User storage backed by the shared Postgres pool.
pub struct UserStore {
    pool: PgPool,
}

impl UserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new user. Returns `UserStoreError::EmailTaken` on a unique
    /// constraint violation of `users.email`.
    pub async fn create_user(&self, email: &str, password: &str) -> Result<User, UserStoreError> {
        let password_hash = hash(password, DEFAULT_COST).context("failed to hash password")?;
        let id = Uuid::new_v4();
        let created_at = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "INSERT INTO users (id, email, password_hash, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(email)
        .bind(&password_hash)
        .bind(&created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(%id, "created user");
                Ok(User {
                    id,
                    email: email.to_string(),
                    password_hash,
                    created_at,
                })
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(UserStoreError::EmailTaken)
            }
            Err(e) => Err(UserStoreError::Other(e.into())),
        }
    }

    /// Look up a user by email.
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, password_hash, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query user by email")?;

        Ok(row.map(Into::into))
    }

    /// Verify email and password, returning the user on success.
    pub async fn verify_password(&self, email: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.get_user_by_email(email).await? else {
            return Ok(None);
        };
        let valid = verify(password, &user.password_hash).context("failed to verify password")?;
        Ok(if valid { Some(user) } else { None })
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    password_hash: String,
    created_at: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            created_at: row.created_at,
        }
    }
}
