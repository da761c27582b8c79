use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use rand::RngExt;
use tracing::info;

use crate::clock::{self, HOUR_MS, MINUTE_MS};
use crate::db::models::{Order, OrderDraft, OrderStatus};
use crate::db::pool::ConnectionPool;
use crate::error::{BistroError, Result};

/// SQL fragment listing the active (non-terminal) statuses.
const ACTIVE: &str = "'PENDING','WAITING','NOTIFIED','SEATED','BILLED'";

/// How many random confirmation codes to try before giving up.
const CODE_ATTEMPTS: usize = 50;

/// Orders within this window of a timestamp compete for the same tables.
pub const OVERLAP_WINDOW_MS: i64 = 2 * HOUR_MS;

/// Arrivals later than this past the scheduled time are cancelled.
pub const LATE_THRESHOLD_MS: i64 = 15 * MINUTE_MS;

/// Flat price per guest used for billing.
pub const PRICE_PER_GUEST: f64 = 100.0;

/// Result of one late-cancellation sweep.
#[derive(Debug, Default)]
pub struct LateCancellations {
    pub no_show: Vec<Order>,
    pub cancelled_waiting: u64,
    pub freed_tables: Vec<i64>,
}

impl LateCancellations {
    pub fn is_empty(&self) -> bool {
        self.no_show.is_empty() && self.cancelled_waiting == 0
    }
}

#[derive(Clone)]
pub struct OrdersRepo {
    pool: ConnectionPool,
}

impl OrdersRepo {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Insert a new order with a freshly allocated confirmation code, unique
    /// among orders in active states. The insert re-checks uniqueness so two
    /// concurrent creations cannot share a code.
    pub async fn create(
        &self,
        draft: &OrderDraft,
        status: OrderStatus,
        entered_waitlist: bool,
        now_ms: i64,
    ) -> Result<Order> {
        let mut conn = self.pool.acquire().await?;

        for _ in 0..CODE_ATTEMPTS {
            let code: i64 = rand::rng().random_range(1_000..10_000);
            let sql = format!(
                "INSERT INTO \"order\" (order_date, number_of_guests, confirmation_code, subscriber_id, \
                     date_of_placing_order, status, phone, email, customer_name, entered_waitlist) \
                 SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ? \
                 WHERE NOT EXISTS (SELECT 1 FROM \"order\" WHERE confirmation_code = ? AND status IN ({ACTIVE})) \
                 RETURNING *"
            );
            let inserted: Option<Order> = sqlx::query_as(&sql)
                .bind(draft.order_date)
                .bind(draft.number_of_guests)
                .bind(code)
                .bind(draft.subscriber_id)
                .bind(now_ms)
                .bind(status)
                .bind(&draft.phone)
                .bind(&draft.email)
                .bind(&draft.customer_name)
                .bind(entered_waitlist)
                .bind(code)
                .fetch_optional(&mut *conn)
                .await?;

            if let Some(order) = inserted {
                info!(order = order.order_number, code, status = ?status, "Created order");
                return Ok(order);
            }
            // code collision with a live order: draw again
        }

        Err(BistroError::System(anyhow::anyhow!(
            "could not allocate a unique confirmation code"
        )))
    }

    pub async fn get_by_id(&self, order_number: i64) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        Ok(sqlx::query_as("SELECT * FROM \"order\" WHERE order_number = ?")
            .bind(order_number)
            .fetch_optional(&mut *conn)
            .await?)
    }

    /// Look up an order by confirmation code among active states only -
    /// terminal orders release their code for reuse.
    pub async fn get_by_active_code(&self, code: i64) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT * FROM \"order\" WHERE confirmation_code = ? AND status IN ({ACTIVE}) LIMIT 1"
        );
        Ok(sqlx::query_as(&sql)
            .bind(code)
            .fetch_optional(&mut *conn)
            .await?)
    }

    /// Active orders scheduled today that carry the given contact.
    pub async fn get_by_contact_active_today(
        &self,
        phone: &str,
        email: &str,
        now_ms: i64,
    ) -> Result<Vec<Order>> {
        let (day_start, day_end) = clock::day_bounds(now_ms);
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT * FROM \"order\" WHERE status IN ({ACTIVE}) \
             AND ((? != '' AND phone = ?) OR (? != '' AND email = ?)) \
             AND order_date >= ? AND order_date < ? ORDER BY order_date"
        );
        Ok(sqlx::query_as(&sql)
            .bind(phone)
            .bind(phone)
            .bind(email)
            .bind(email)
            .bind(day_start)
            .bind(day_end)
            .fetch_all(&mut *conn)
            .await?)
    }

    pub async fn has_active_order_today(
        &self,
        phone: &str,
        email: &str,
        now_ms: i64,
    ) -> Result<bool> {
        Ok(!self
            .get_by_contact_active_today(phone, email, now_ms)
            .await?
            .is_empty())
    }

    /// The live waitlist (WAITING and NOTIFIED) plus today's PENDING
    /// reservations: what the host stand works from.
    pub async fn get_live_waitlist_and_today_pending(&self, now_ms: i64) -> Result<Vec<Order>> {
        let (day_start, day_end) = clock::day_bounds(now_ms);
        let mut conn = self.pool.acquire().await?;
        Ok(sqlx::query_as(
            "SELECT * FROM \"order\" WHERE status IN ('WAITING','NOTIFIED') \
             OR (status = 'PENDING' AND order_date >= ? AND order_date < ?) \
             ORDER BY order_date",
        )
        .bind(day_start)
        .bind(day_end)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Active orders whose scheduled time falls within ±2 h of the given
    /// timestamp: the competitors in a feasibility check.
    pub async fn get_overlapping_active(&self, center_ms: i64) -> Result<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT * FROM \"order\" WHERE status IN ({ACTIVE}) \
             AND order_date >= ? AND order_date <= ? ORDER BY order_date"
        );
        Ok(sqlx::query_as(&sql)
            .bind(center_ms - OVERLAP_WINDOW_MS)
            .bind(center_ms + OVERLAP_WINDOW_MS)
            .fetch_all(&mut *conn)
            .await?)
    }

    /// Seat an order on the smallest free table that fits. The table claim is
    /// a conditional update; losing the race retries with the next candidate
    /// scan, so the table/order pair is never written inconsistently.
    pub async fn assign_free_table_and_seat(
        &self,
        order_number: i64,
        guests: i64,
        now_ms: i64,
    ) -> Result<Order> {
        let mut conn = self.pool.acquire().await?;

        for _ in 0..5 {
            let candidate: Option<(i64,)> = sqlx::query_as(
                "SELECT table_id FROM tables WHERE status = 'AVAILABLE' AND capacity >= ? \
                 ORDER BY capacity, table_id LIMIT 1",
            )
            .bind(guests)
            .fetch_optional(&mut *conn)
            .await?;

            let table_id = match candidate {
                Some((id,)) => id,
                None => {
                    return Err(BistroError::NoResource(format!(
                        "no free table for {guests} guests"
                    )))
                }
            };

            let claimed = sqlx::query(
                "UPDATE tables SET status = 'OCCUPIED' WHERE table_id = ? AND status = 'AVAILABLE'",
            )
            .bind(table_id)
            .execute(&mut *conn)
            .await?;
            if claimed.rows_affected() == 0 {
                continue; // another handler took it: rescan
            }

            let seated: Option<Order> = sqlx::query_as(
                "UPDATE \"order\" SET status = 'SEATED', assigned_table_id = ?, actual_arrival_time = ? \
                 WHERE order_number = ? AND status IN ('PENDING','NOTIFIED','WAITING') RETURNING *",
            )
            .bind(table_id)
            .bind(now_ms)
            .bind(order_number)
            .fetch_optional(&mut *conn)
            .await?;

            return match seated {
                Some(order) => {
                    info!(order = order_number, table = table_id, "Seated order");
                    Ok(order)
                }
                None => {
                    // The order changed state under us: give the table back.
                    sqlx::query("UPDATE tables SET status = 'AVAILABLE' WHERE table_id = ?")
                        .bind(table_id)
                        .execute(&mut *conn)
                        .await?;
                    Err(BistroError::WrongState(format!(
                        "order {order_number} can no longer be seated"
                    )))
                }
            };
        }

        Err(BistroError::NoResource(format!(
            "no free table for {guests} guests"
        )))
    }

    /// Cancel an active order. Frees its table when one is held so table
    /// ownership stays consistent; the order row is cleared first.
    pub async fn cancel(&self, order_number: i64) -> Result<Order> {
        let mut conn = self.pool.acquire().await?;

        let held: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT assigned_table_id FROM \"order\" WHERE order_number = ?")
                .bind(order_number)
                .fetch_optional(&mut *conn)
                .await?;
        let held = match held {
            Some((t,)) => t,
            None => return Err(BistroError::NotFound(format!("no order {order_number}"))),
        };

        let sql = format!(
            "UPDATE \"order\" SET status = 'CANCELLED', assigned_table_id = NULL \
             WHERE order_number = ? AND status IN ({ACTIVE}) RETURNING *"
        );
        let order: Order = sqlx::query_as(&sql)
            .bind(order_number)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| {
                BistroError::WrongState(format!("order {order_number} is already closed"))
            })?;

        // Order row cleared first, then the table: no occupied table is ever
        // left without a holder.
        if let Some(table_id) = held {
            sqlx::query("UPDATE tables SET status = 'AVAILABLE' WHERE table_id = ?")
                .bind(table_id)
                .execute(&mut *conn)
                .await?;
        }

        info!(order = order_number, "Cancelled order");
        Ok(order)
    }

    /// Complete an order: set the final price, stamp the leave time, drop the
    /// table reference, then free the table. Returns the freed table id.
    pub async fn process_payment(
        &self,
        order_number: i64,
        final_price: f64,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;

        let held: Option<(Option<i64>,)> = sqlx::query_as(
            "SELECT assigned_table_id FROM \"order\" \
             WHERE order_number = ? AND status IN ('SEATED','BILLED')",
        )
        .bind(order_number)
        .fetch_optional(&mut *conn)
        .await?;
        let held = match held {
            Some((t,)) => t,
            None => {
                return Err(BistroError::WrongState(format!(
                    "order {order_number} has no open bill"
                )))
            }
        };

        let completed = sqlx::query(
            "UPDATE \"order\" SET status = 'COMPLETED', total_price = ?, \
                 actual_leave_time = ?, assigned_table_id = NULL \
             WHERE order_number = ? AND status IN ('SEATED','BILLED')",
        )
        .bind(final_price)
        .bind(now_ms)
        .bind(order_number)
        .execute(&mut *conn)
        .await?;
        if completed.rows_affected() == 0 {
            return Err(BistroError::WrongState(format!(
                "order {order_number} has no open bill"
            )));
        }

        if let Some(table_id) = held {
            sqlx::query("UPDATE tables SET status = 'AVAILABLE' WHERE table_id = ?")
                .bind(table_id)
                .execute(&mut *conn)
                .await?;
        }

        info!(order = order_number, price = final_price, "Processed payment");
        Ok(held)
    }

    /// One late-cancellation sweep: WAITING orders past the threshold are
    /// CANCELLED; PENDING/NOTIFIED become NO_SHOW with their table (if any)
    /// freed. The order rows are cleared before the table reset so no
    /// observer sees an occupied table without a holder.
    pub async fn cancel_late_orders(&self, now_ms: i64) -> Result<LateCancellations> {
        let threshold = now_ms - LATE_THRESHOLD_MS;
        let mut conn = self.pool.acquire().await?;

        let late: Vec<Order> = sqlx::query_as(
            "SELECT * FROM \"order\" WHERE status IN ('PENDING','NOTIFIED') AND order_date < ?",
        )
        .bind(threshold)
        .fetch_all(&mut *conn)
        .await?;

        let mut result = LateCancellations::default();
        if !late.is_empty() {
            let ids = join_ids(&late.iter().map(|o| o.order_number).collect::<Vec<_>>());
            let sql = format!(
                "UPDATE \"order\" SET status = 'NO_SHOW', assigned_table_id = NULL \
                 WHERE order_number IN ({ids}) AND status IN ('PENDING','NOTIFIED')"
            );
            sqlx::query(&sql).execute(&mut *conn).await?;

            result.freed_tables = late.iter().filter_map(|o| o.assigned_table_id).collect();
            if !result.freed_tables.is_empty() {
                let tables = join_ids(&result.freed_tables);
                let sql = format!("UPDATE tables SET status = 'AVAILABLE' WHERE table_id IN ({tables})");
                sqlx::query(&sql).execute(&mut *conn).await?;
            }
            result.no_show = late;
        }

        let waiting = sqlx::query("UPDATE \"order\" SET status = 'CANCELLED' WHERE status = 'WAITING' AND order_date < ?")
            .bind(threshold)
            .execute(&mut *conn)
            .await?;
        result.cancelled_waiting = waiting.rows_affected();

        Ok(result)
    }

    /// Select PENDING orders due for the 2-hour reminder and advance them to
    /// NOTIFIED in the same statement, so a tick replay reminds nobody twice.
    pub async fn take_reminders(&self, now_ms: i64) -> Result<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;
        Ok(sqlx::query_as(
            "UPDATE \"order\" SET status = 'NOTIFIED' \
             WHERE status = 'PENDING' AND order_date >= ? AND order_date <= ? RETURNING *",
        )
        .bind(now_ms + 115 * MINUTE_MS)
        .bind(now_ms + 125 * MINUTE_MS)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Select SEATED orders past the 2-hour stay and bill them in the same
    /// statement, pricing at guests × 100.
    pub async fn take_automatic_invoices(&self, now_ms: i64) -> Result<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "UPDATE \"order\" SET status = 'BILLED', total_price = number_of_guests * {PRICE_PER_GUEST:.1} \
             WHERE status = 'SEATED' AND actual_arrival_time IS NOT NULL \
               AND actual_arrival_time <= ? RETURNING *"
        );
        Ok(sqlx::query_as(&sql)
            .bind(now_ms - 2 * HOUR_MS)
            .fetch_all(&mut *conn)
            .await?)
    }

    /// Manual "complete" from staff: bill a seated order at the flat rate
    /// unless a price is already stored.
    pub async fn bill_manual(&self, order_number: i64) -> Result<Order> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "UPDATE \"order\" SET status = 'BILLED', \
                 total_price = COALESCE(total_price, number_of_guests * {PRICE_PER_GUEST:.1}) \
             WHERE order_number = ? AND status = 'SEATED' RETURNING *"
        );
        sqlx::query_as(&sql)
            .bind(order_number)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| BistroError::WrongState(format!("order {order_number} is not seated")))
    }

    /// Walk-in fallback: the free table vanished between the scan and the
    /// claim: park the order on the waitlist instead.
    pub async fn move_to_waitlist(&self, order_number: i64) -> Result<Order> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query_as(
            "UPDATE \"order\" SET status = 'WAITING', entered_waitlist = 1 \
             WHERE order_number = ? AND status = 'PENDING' RETURNING *",
        )
        .bind(order_number)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| {
            BistroError::WrongState(format!("order {order_number} cannot join the waitlist"))
        })
    }

    /// Promote the earliest WAITING order that fits the freed capacity:
    /// advance it to NOTIFIED and restart its 15-minute clock. The inner
    /// select and the status guard make the advance race-free.
    pub async fn promote_waitlist_head(&self, capacity: i64, now_ms: i64) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        Ok(sqlx::query_as(
            "UPDATE \"order\" SET status = 'NOTIFIED', order_date = ? \
             WHERE order_number = ( \
                 SELECT order_number FROM \"order\" \
                 WHERE status = 'WAITING' AND number_of_guests <= ? \
                 ORDER BY date_of_placing_order, order_number LIMIT 1) \
               AND status = 'WAITING' \
             RETURNING *",
        )
        .bind(now_ms)
        .bind(capacity)
        .fetch_optional(&mut *conn)
        .await?)
    }

    /// Future reservations that have not been seated yet: the candidates a
    /// capacity change or hours change may invalidate.
    pub async fn get_future_unseated(&self, now_ms: i64) -> Result<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;
        Ok(sqlx::query_as(
            "SELECT * FROM \"order\" WHERE status IN ('PENDING','NOTIFIED') AND order_date > ? \
             ORDER BY order_date",
        )
        .bind(now_ms)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// A member's active orders scheduled today.
    pub async fn get_relevant_orders_for_today(
        &self,
        member_id: i64,
        now_ms: i64,
    ) -> Result<Vec<Order>> {
        let (day_start, day_end) = clock::day_bounds(now_ms);
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT * FROM \"order\" WHERE subscriber_id = ? AND status IN ({ACTIVE}) \
             AND order_date >= ? AND order_date < ? ORDER BY order_date"
        );
        Ok(sqlx::query_as(&sql)
            .bind(member_id)
            .bind(day_start)
            .bind(day_end)
            .fetch_all(&mut *conn)
            .await?)
    }

    /// Every active order scheduled today (staff listing).
    pub async fn get_all_active_today(&self, now_ms: i64) -> Result<Vec<Order>> {
        let (day_start, day_end) = clock::day_bounds(now_ms);
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT * FROM \"order\" WHERE status IN ({ACTIVE}) \
             AND order_date >= ? AND order_date < ? ORDER BY order_date"
        );
        Ok(sqlx::query_as(&sql)
            .bind(day_start)
            .bind(day_end)
            .fetch_all(&mut *conn)
            .await?)
    }

    /// Parties currently at a table.
    pub async fn get_active_diners(&self) -> Result<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;
        Ok(sqlx::query_as(
            "SELECT * FROM \"order\" WHERE status IN ('SEATED','BILLED') ORDER BY assigned_table_id",
        )
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Full order history of one member, newest first.
    pub async fn get_member_history(&self, member_id: i64) -> Result<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;
        Ok(sqlx::query_as(
            "SELECT * FROM \"order\" WHERE subscriber_id = ? ORDER BY order_date DESC",
        )
        .bind(member_id)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Monthly service-performance aggregates.
    ///
    /// Keys: avg_arrival_delay_min, avg_stay_min, avg_overstay_min,
    /// late_count, completed_count, waitlist_count.
    pub async fn performance_report(&self, month: u32, year: i32) -> Result<HashMap<String, f64>> {
        let orders = self.orders_in_month(month, year).await?;

        let mut delays = Vec::new();
        let mut stays = Vec::new();
        let mut overstays = Vec::new();
        let mut late_count = 0u64;
        let mut completed_count = 0u64;
        let mut waitlist_count = 0u64;

        for order in &orders {
            if let Some(arrival) = order.actual_arrival_time {
                let delay = (arrival - order.order_date).max(0);
                delays.push(delay);
                if delay > LATE_THRESHOLD_MS {
                    late_count += 1;
                }
                if let Some(leave) = order.actual_leave_time {
                    let stay = leave - arrival;
                    stays.push(stay);
                    overstays.push((stay - 2 * HOUR_MS).max(0));
                }
            }
            if order.status == OrderStatus::NoShow {
                late_count += 1;
            }
            if order.status == OrderStatus::Completed {
                completed_count += 1;
            }
            if order.entered_waitlist {
                waitlist_count += 1;
            }
        }

        let mut report = HashMap::new();
        report.insert("avg_arrival_delay_min".into(), avg_minutes(&delays));
        report.insert("avg_stay_min".into(), avg_minutes(&stays));
        report.insert("avg_overstay_min".into(), avg_minutes(&overstays));
        report.insert("late_count".into(), late_count as f64);
        report.insert("completed_count".into(), completed_count as f64);
        report.insert("waitlist_count".into(), waitlist_count as f64);
        Ok(report)
    }

    /// Monthly member-subscription series: per-day order counts keyed by day
    /// number, and per-day waitlist entries keyed with a `W-` prefix.
    pub async fn subscription_report(&self, month: u32, year: i32) -> Result<HashMap<String, f64>> {
        let orders = self.orders_in_month(month, year).await?;

        let mut report: HashMap<String, f64> = HashMap::new();
        for order in orders.iter().filter(|o| o.member_id().is_some()) {
            let day = clock::date_of(order.order_date).day();
            *report.entry(day.to_string()).or_insert(0.0) += 1.0;
            if order.entered_waitlist {
                *report.entry(format!("W-{day}")).or_insert(0.0) += 1.0;
            }
        }
        Ok(report)
    }

    async fn orders_in_month(&self, month: u32, year: i32) -> Result<Vec<Order>> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| BistroError::Validation(format!("invalid month {month}/{year}")))?;
        let end = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .ok_or_else(|| BistroError::Validation(format!("invalid month {month}/{year}")))?;

        let start_ms = clock::at(start, chrono::NaiveTime::MIN);
        let end_ms = clock::at(end, chrono::NaiveTime::MIN);

        let mut conn = self.pool.acquire().await?;
        Ok(sqlx::query_as(
            "SELECT * FROM \"order\" WHERE order_date >= ? AND order_date < ? ORDER BY order_date",
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&mut *conn)
        .await?)
    }
}

fn avg_minutes(samples: &[i64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: i64 = samples.iter().sum();
    total as f64 / samples.len() as f64 / MINUTE_MS as f64
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
