//! In-memory session tracking and authorization gates.
//!
//! The database login flag is the authoritative single-session guard; the
//! maps here bind connections to users for authorization and are torn down
//! from the read-loop exit path when a connection drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::db::models::{Order, Role, User};
use crate::db::pool::ConnectionPool;
use crate::error::{BistroError, Result};
use crate::repo::users::UsersRepo;
use crate::server::registry::ClientId;

#[derive(Clone)]
struct SessionEntry {
    user: User,
    /// True for credential logins; false for terminals identified by
    /// membership code only.
    authenticated: bool,
}

#[derive(Default)]
struct SessionMaps {
    by_conn: HashMap<ClientId, SessionEntry>,
    /// user-id → connection, authenticated sessions only. Injective both
    /// ways: one connection per user, one user per connection.
    by_user: HashMap<i64, ClientId>,
}

#[derive(Clone)]
pub struct SessionManager {
    users: UsersRepo,
    inner: Arc<Mutex<SessionMaps>>,
}

impl SessionManager {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            users: UsersRepo::new(pool),
            inner: Arc::new(Mutex::new(SessionMaps::default())),
        }
    }

    pub async fn login(&self, conn: ClientId, username: &str, password: &str) -> Result<User> {
        {
            let maps = self.inner.lock().expect("session lock poisoned");
            if maps.by_conn.get(&conn).is_some_and(|e| e.authenticated) {
                return Err(BistroError::Conflict(
                    "this terminal is already logged in".into(),
                ));
            }
        }

        // The conditional flag update inside the repo rejects a second
        // session for the same account.
        let user = self.users.login(username, password).await?;

        {
            let mut maps = self.inner.lock().expect("session lock poisoned");
            maps.by_user.insert(user.user_id, conn);
            maps.by_conn.insert(
                conn,
                SessionEntry {
                    user: user.clone(),
                    authenticated: true,
                },
            );
        }
        info!(user = %user.username, conn, "Logged in");
        Ok(user)
    }

    pub async fn logout(&self, conn: ClientId) -> Result<()> {
        let entry = {
            let mut maps = self.inner.lock().expect("session lock poisoned");
            let entry = maps.by_conn.remove(&conn);
            if let Some(e) = &entry {
                if e.authenticated && maps.by_user.get(&e.user.user_id) == Some(&conn) {
                    maps.by_user.remove(&e.user.user_id);
                }
            }
            entry
        };

        if let Some(e) = entry {
            if e.authenticated {
                self.users.set_login_flag(e.user.user_id, false).await?;
                info!(user = %e.user.username, conn, "Logged out");
            }
        }
        Ok(())
    }

    /// Dropped-connection path: same cleanup as logout, never fails the
    /// caller.
    pub async fn cleanup_connection(&self, conn: ClientId) {
        if let Err(e) = self.logout(conn).await {
            warn!(conn, error = %e, "Session cleanup failed");
        }
    }

    /// Bind a terminal to a member identity by card/QR code. Does not touch
    /// login flags and never displaces a credential login on the terminal.
    pub async fn identify_by_code(&self, conn: ClientId, code: i64) -> Result<User> {
        let user = self.users.get_by_membership_code(code).await?;
        {
            let mut maps = self.inner.lock().expect("session lock poisoned");
            match maps.by_conn.get(&conn) {
                Some(e) if e.authenticated => {}
                _ => {
                    maps.by_conn.insert(
                        conn,
                        SessionEntry {
                            user: user.clone(),
                            authenticated: false,
                        },
                    );
                }
            }
        }
        Ok(user)
    }

    /// The user bound to a connection, by login or terminal identification.
    pub fn current(&self, conn: ClientId) -> Option<User> {
        let maps = self.inner.lock().expect("session lock poisoned");
        maps.by_conn.get(&conn).map(|e| e.user.clone())
    }

    pub fn require_staff(&self, conn: ClientId) -> Result<User> {
        match self.authenticated_entry(conn) {
            Some(user) if user.role.is_staff() => Ok(user),
            Some(_) => Err(BistroError::Unauthorized("staff access required".into())),
            None => Err(BistroError::Unauthorized("login required".into())),
        }
    }

    pub fn require_manager(&self, conn: ClientId) -> Result<User> {
        match self.authenticated_entry(conn) {
            Some(user) if user.role == Role::Manager => Ok(user),
            Some(_) => Err(BistroError::Unauthorized("manager access required".into())),
            None => Err(BistroError::Unauthorized("login required".into())),
        }
    }

    /// Owner check for cancel/pay/leave operations: staff may act on any
    /// order, a member order only its member, and a guest order whoever
    /// presents the phone or email it was booked with.
    pub fn authorize_order_access(
        &self,
        conn: ClientId,
        order: &Order,
        presented_phone: Option<&str>,
        presented_email: Option<&str>,
    ) -> Result<()> {
        let session = self.current(conn);
        if let Some(user) = &session {
            if user.role.is_staff() && self.authenticated_entry(conn).is_some() {
                return Ok(());
            }
        }

        if let Some(member_id) = order.member_id() {
            return match session {
                Some(user) if user.user_id == member_id => Ok(()),
                _ => Err(BistroError::Unauthorized(
                    "only the owning member may manage this order".into(),
                )),
            };
        }

        let phone_matches = presented_phone
            .is_some_and(|p| !p.is_empty() && p == order.phone && !order.phone.is_empty());
        let email_matches = presented_email
            .is_some_and(|e| !e.is_empty() && e == order.email && !order.email.is_empty());
        if phone_matches || email_matches {
            Ok(())
        } else {
            Err(BistroError::Unauthorized(
                "the presented contact does not match this order".into(),
            ))
        }
    }

    /// Number of connections currently bound to a user (0 or 1).
    #[cfg(test)]
    pub fn sessions_for_user(&self, user_id: i64) -> usize {
        let maps = self.inner.lock().expect("session lock poisoned");
        usize::from(maps.by_user.contains_key(&user_id))
    }

    fn authenticated_entry(&self, conn: ClientId) -> Option<User> {
        let maps = self.inner.lock().expect("session lock poisoned");
        maps.by_conn
            .get(&conn)
            .filter(|e| e.authenticated)
            .map(|e| e.user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::repo::users::blank_user;

    async fn manager_with_repo() -> (SessionManager, UsersRepo, Database) {
        let db = Database::test_db().await;
        (
            SessionManager::new(db.pool.clone()),
            UsersRepo::new(db.pool.clone()),
            db,
        )
    }

    async fn register(users: &UsersRepo, name: &str) -> User {
        users
            .register_member(&User {
                username: name.into(),
                password: "pw".into(),
                phone: "0501234567".into(),
                email: format!("{name}@example.com"),
                ..blank_user()
            })
            .await
            .unwrap()
    }

    fn guest_order(phone: &str, email: &str) -> Order {
        Order {
            order_number: 1,
            order_date: 0,
            number_of_guests: 2,
            confirmation_code: 1234,
            subscriber_id: None,
            date_of_placing_order: 0,
            status: crate::db::models::OrderStatus::Pending,
            total_price: None,
            phone: phone.into(),
            email: email.into(),
            customer_name: "Guest".into(),
            entered_waitlist: false,
            actual_arrival_time: None,
            actual_leave_time: None,
            assigned_table_id: None,
        }
    }

    #[tokio::test]
    async fn second_login_is_refused_until_logout() {
        let (sessions, users, _db) = manager_with_repo().await;
        let user = register(&users, "alice").await;

        let first = sessions.login(1, "alice", "pw").await.unwrap();
        assert_eq!(first.user_id, user.user_id);
        assert_eq!(sessions.sessions_for_user(user.user_id), 1);

        // Same account from another terminal: refused.
        let err = sessions.login(2, "alice", "pw").await.unwrap_err();
        assert!(matches!(err, BistroError::Conflict(_)));
        assert_eq!(sessions.sessions_for_user(user.user_id), 1);

        sessions.logout(1).await.unwrap();
        assert_eq!(sessions.sessions_for_user(user.user_id), 0);
        sessions.login(2, "alice", "pw").await.unwrap();
    }

    #[tokio::test]
    async fn dropped_connection_cleanup_releases_the_account() {
        let (sessions, users, _db) = manager_with_repo().await;
        let user = register(&users, "alice").await;

        sessions.login(7, "alice", "pw").await.unwrap();
        sessions.cleanup_connection(7).await;

        assert!(!users.get_by_id(user.user_id).await.unwrap().is_logged_in);
        sessions.login(8, "alice", "pw").await.unwrap();
    }

    #[tokio::test]
    async fn identify_binds_without_login_flag() {
        let (sessions, users, _db) = manager_with_repo().await;
        let user = register(&users, "alice").await;

        let identified = sessions
            .identify_by_code(3, user.member_code.unwrap())
            .await
            .unwrap();
        assert_eq!(identified.user_id, user.user_id);
        assert_eq!(sessions.current(3).unwrap().user_id, user.user_id);

        // No login happened: flag untouched, account still free.
        assert!(!users.get_by_id(user.user_id).await.unwrap().is_logged_in);
        assert_eq!(sessions.sessions_for_user(user.user_id), 0);
        sessions.login(4, "alice", "pw").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_membership_code_is_not_found() {
        let (sessions, _, _db) = manager_with_repo().await;
        assert!(matches!(
            sessions.identify_by_code(1, 111_111).await.unwrap_err(),
            BistroError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn guest_order_requires_matching_contact() {
        let (sessions, _, _db) = manager_with_repo().await;
        let order = guest_order("0501111111", "guest@example.com");

        sessions
            .authorize_order_access(1, &order, Some("0501111111"), None)
            .unwrap();
        sessions
            .authorize_order_access(1, &order, None, Some("guest@example.com"))
            .unwrap();

        assert!(sessions
            .authorize_order_access(1, &order, Some("0509999999"), None)
            .is_err());
        assert!(sessions.authorize_order_access(1, &order, None, None).is_err());
        // Empty strings never match.
        assert!(sessions
            .authorize_order_access(1, &guest_order("", ""), Some(""), Some(""))
            .is_err());
    }

    #[tokio::test]
    async fn member_order_requires_the_owner() {
        let (sessions, users, _db) = manager_with_repo().await;
        let owner = register(&users, "alice").await;
        let other = register(&users, "bob").await;

        let mut order = guest_order("0501111111", "");
        order.subscriber_id = Some(owner.user_id);

        // Nobody bound to the terminal: refused, contact match does not help.
        assert!(sessions
            .authorize_order_access(1, &order, Some("0501111111"), None)
            .is_err());

        sessions
            .identify_by_code(1, owner.member_code.unwrap())
            .await
            .unwrap();
        sessions.authorize_order_access(1, &order, None, None).unwrap();

        sessions
            .identify_by_code(2, other.member_code.unwrap())
            .await
            .unwrap();
        assert!(sessions.authorize_order_access(2, &order, None, None).is_err());
    }
}
