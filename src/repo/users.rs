use rand::RngExt;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::db::models::{Role, User};
use crate::db::pool::ConnectionPool;
use crate::error::{BistroError, Result};

/// How many random membership codes to try before giving up.
const CODE_ATTEMPTS: usize = 50;

/// SHA-256 hex digest used for passwords at rest.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct UsersRepo {
    pool: ConnectionPool,
}

impl UsersRepo {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Verify credentials and atomically claim the login flag.
    ///
    /// The conditional update is what enforces the single-session invariant:
    /// a second login loses the `is_logged_in = 0` race and gets a conflict.
    pub async fn login(&self, username: &str, password: &str) -> Result<User> {
        let mut conn = self.pool.acquire().await?;

        let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&mut *conn)
            .await?;

        let mut user = match user {
            Some(u) if u.password == hash_password(password) => u,
            _ => {
                return Err(BistroError::Unauthorized(
                    "invalid username or password".into(),
                ))
            }
        };

        let claimed =
            sqlx::query("UPDATE users SET is_logged_in = 1 WHERE user_id = ? AND is_logged_in = 0")
                .bind(user.user_id)
                .execute(&mut *conn)
                .await?;

        if claimed.rows_affected() == 0 {
            return Err(BistroError::Conflict(format!(
                "user {username} is already logged in"
            )));
        }

        user.is_logged_in = true;
        Ok(user)
    }

    pub async fn set_login_flag(&self, user_id: i64, logged_in: bool) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("UPDATE users SET is_logged_in = ? WHERE user_id = ?")
            .bind(logged_in)
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Clear login flags left behind by an unclean shutdown. Runs once at
    /// server startup.
    pub async fn reset_all_login_flags(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query("UPDATE users SET is_logged_in = 0 WHERE is_logged_in = 1")
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_by_id(&self, user_id: i64) -> Result<User> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query_as("SELECT * FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| BistroError::NotFound(format!("no user {user_id}")))
    }

    /// Look up a member by the 6-digit code on their card/QR. No login flag
    /// change: this only identifies a physical terminal session.
    pub async fn get_by_membership_code(&self, code: i64) -> Result<User> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query_as("SELECT * FROM users WHERE member_code = ?")
            .bind(code)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| BistroError::NotFound("unknown membership code".into()))
    }

    /// Register a new member with a freshly allocated unique 6-digit code.
    pub async fn register_member(&self, draft: &User) -> Result<User> {
        let mut conn = self.pool.acquire().await?;

        let taken: Option<(i64,)> = sqlx::query_as("SELECT user_id FROM users WHERE username = ?")
            .bind(&draft.username)
            .fetch_optional(&mut *conn)
            .await?;
        if taken.is_some() {
            return Err(BistroError::Conflict(format!(
                "username {} is already taken",
                draft.username
            )));
        }

        for _ in 0..CODE_ATTEMPTS {
            let code: i64 = rand::rng().random_range(100_000..1_000_000);
            let inserted = sqlx::query_as::<_, User>(
                "INSERT INTO users (username, password, first_name, last_name, role, phone, email, member_code) \
                 SELECT ?, ?, ?, ?, 'MEMBER', ?, ?, ? \
                 WHERE NOT EXISTS (SELECT 1 FROM users WHERE member_code = ?) \
                 RETURNING *",
            )
            .bind(&draft.username)
            .bind(hash_password(&draft.password))
            .bind(&draft.first_name)
            .bind(&draft.last_name)
            .bind(&draft.phone)
            .bind(&draft.email)
            .bind(code)
            .bind(code)
            .fetch_optional(&mut *conn)
            .await;

            match inserted {
                Ok(Some(user)) => {
                    info!(user = %user.username, code, "Registered member");
                    return Ok(user);
                }
                Ok(None) => continue, // code collision: draw again
                Err(e) if is_unique_violation(&e) => {
                    return Err(BistroError::Conflict(format!(
                        "username {} is already taken",
                        draft.username
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BistroError::System(anyhow::anyhow!(
            "could not allocate a unique membership code"
        )))
    }

    /// Partial contact update; absent fields keep their stored value.
    pub async fn update_contact(
        &self,
        user_id: i64,
        phone: Option<&str>,
        email: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<User> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query_as(
            "UPDATE users SET \
                 phone = COALESCE(?, phone), \
                 email = COALESCE(?, email), \
                 first_name = COALESCE(?, first_name), \
                 last_name = COALESCE(?, last_name) \
             WHERE user_id = ? RETURNING *",
        )
        .bind(phone)
        .bind(email)
        .bind(first_name)
        .bind(last_name)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| BistroError::NotFound(format!("no user {user_id}")))
    }

}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Blank user record for registration drafts and tests.
pub fn blank_user() -> User {
    User {
        user_id: 0,
        username: String::new(),
        password: String::new(),
        first_name: String::new(),
        last_name: String::new(),
        role: Role::Member,
        phone: String::new(),
        email: String::new(),
        member_code: None,
        is_logged_in: false,
    }
}
