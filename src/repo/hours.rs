use chrono::{Datelike, NaiveDate};

use crate::db::models::OpeningHours;
use crate::db::pool::ConnectionPool;
use crate::error::{BistroError, Result};

/// ISO weekday number, Monday = 1 … Sunday = 7.
pub fn weekday_number(date: NaiveDate) -> i64 {
    date.weekday().number_from_monday() as i64
}

#[derive(Clone)]
pub struct HoursRepo {
    pool: ConnectionPool,
}

impl HoursRepo {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<OpeningHours>> {
        let mut conn = self.pool.acquire().await?;
        Ok(sqlx::query_as(
            "SELECT * FROM opening_hours ORDER BY specific_date IS NOT NULL, day_of_week, specific_date",
        )
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Effective rule for a calendar date: a date override beats the weekly
    /// rule. None when no rule covers the date at all.
    pub async fn get_for_date(&self, date: NaiveDate) -> Result<Option<OpeningHours>> {
        let mut conn = self.pool.acquire().await?;

        let by_date: Option<OpeningHours> =
            sqlx::query_as("SELECT * FROM opening_hours WHERE specific_date = ?")
                .bind(date)
                .fetch_optional(&mut *conn)
                .await?;
        if by_date.is_some() {
            return Ok(by_date);
        }

        Ok(sqlx::query_as(
            "SELECT * FROM opening_hours WHERE day_of_week = ? AND specific_date IS NULL",
        )
        .bind(weekday_number(date))
        .fetch_optional(&mut *conn)
        .await?)
    }

    /// Insert or replace the rule for a weekday or a specific date.
    pub async fn upsert(&self, rule: &OpeningHours) -> Result<OpeningHours> {
        if rule.specific_date.is_none() {
            match rule.day_of_week {
                Some(1..=7) => {}
                _ => {
                    return Err(BistroError::Validation(
                        "day_of_week must be 1-7 when no specific date is given".into(),
                    ))
                }
            }
        }
        if !rule.is_closed && rule.close_time <= rule.open_time {
            return Err(BistroError::Validation(
                "close time must be after open time".into(),
            ));
        }

        let mut conn = self.pool.acquire().await?;

        let updated: Option<OpeningHours> = if let Some(date) = rule.specific_date {
            sqlx::query_as(
                "UPDATE opening_hours SET open_time = ?, close_time = ?, is_closed = ?, day_of_week = NULL \
                 WHERE specific_date = ? RETURNING *",
            )
            .bind(rule.open_time)
            .bind(rule.close_time)
            .bind(rule.is_closed)
            .bind(date)
            .fetch_optional(&mut *conn)
            .await?
        } else {
            sqlx::query_as(
                "UPDATE opening_hours SET open_time = ?, close_time = ?, is_closed = ? \
                 WHERE day_of_week = ? AND specific_date IS NULL RETURNING *",
            )
            .bind(rule.open_time)
            .bind(rule.close_time)
            .bind(rule.is_closed)
            .bind(rule.day_of_week)
            .fetch_optional(&mut *conn)
            .await?
        };
        if let Some(row) = updated {
            return Ok(row);
        }

        Ok(sqlx::query_as(
            "INSERT INTO opening_hours (day_of_week, specific_date, open_time, close_time, is_closed) \
             VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(rule.day_of_week)
        .bind(rule.specific_date)
        .bind(rule.open_time)
        .bind(rule.close_time)
        .bind(rule.is_closed)
        .fetch_one(&mut *conn)
        .await?)
    }
}
