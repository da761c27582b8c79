use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Member,
    Worker,
    Manager,
    Guest,
}

impl Role {
    pub fn is_staff(self) -> bool {
        matches!(self, Role::Worker | Role::Manager)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Waiting,
    Notified,
    Seated,
    Billed,
    Completed,
    Cancelled,
    NoShow,
}

impl OrderStatus {
    /// Terminal states are never mutated again; everything else is active.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::NoShow
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableStatus {
    Available,
    Occupied,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    /// SHA-256 digest at rest; accepted from the wire, never echoed back.
    #[serde(skip_serializing, default)]
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub phone: String,
    pub email: String,
    pub member_code: Option<i64>,
    pub is_logged_in: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DiningTable {
    pub table_id: i64,
    pub capacity: i64,
    pub status: TableStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub order_number: i64,
    /// Scheduled time, epoch milliseconds.
    pub order_date: i64,
    pub number_of_guests: i64,
    pub confirmation_code: i64,
    /// Member who placed the order; None (or 0) for guest orders.
    pub subscriber_id: Option<i64>,
    pub date_of_placing_order: i64,
    pub status: OrderStatus,
    pub total_price: Option<f64>,
    pub phone: String,
    pub email: String,
    pub customer_name: String,
    pub entered_waitlist: bool,
    pub actual_arrival_time: Option<i64>,
    pub actual_leave_time: Option<i64>,
    pub assigned_table_id: Option<i64>,
}

impl Order {
    /// The member owning this order, if it was placed by one.
    pub fn member_id(&self) -> Option<i64> {
        self.subscriber_id.filter(|id| *id > 0)
    }
}

/// Incoming reservation/walk-in request before a code and status exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDraft {
    /// Requested time, epoch milliseconds.
    pub order_date: i64,
    pub number_of_guests: i64,
    #[serde(default)]
    pub subscriber_id: Option<i64>,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub customer_name: String,
}

impl OrderDraft {
    pub fn has_contact(&self) -> bool {
        !self.phone.trim().is_empty() || !self.email.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OpeningHours {
    #[serde(default)]
    pub id: i64,
    /// ISO weekday, Monday = 1 … Sunday = 7. NULL for date overrides.
    pub day_of_week: Option<i64>,
    /// Calendar-date override; beats the weekday rule for that date.
    pub specific_date: Option<NaiveDate>,
    pub open_time: NaiveTime,
    pub close_time: NaiveTime,
    pub is_closed: bool,
}
