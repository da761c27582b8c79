//! Reservation approval: opening hours, booking window, and table
//! feasibility over the overlap window.

pub mod bestfit;

use chrono::{NaiveDate, Timelike};

use crate::clock::{self, DAY_MS, MINUTE_MS};
use crate::db::models::{OrderDraft, TableStatus};
use crate::db::pool::ConnectionPool;
use crate::error::{BistroError, Result};
use crate::repo::hours::HoursRepo;
use crate::repo::orders::OrdersRepo;
use crate::repo::tables::TablesRepo;

/// Minimum notice for a reservation.
pub const MIN_LEAD_MS: i64 = 60 * MINUTE_MS;

/// How far ahead the booking window opens.
pub const MAX_LEAD_MS: i64 = 31 * DAY_MS;

/// Offsets probed, in order, when the requested time is infeasible.
const ALTERNATIVE_OFFSETS_MIN: [i64; 4] = [-30, 30, -60, 60];

/// Granularity of the available-slots walk.
const SLOT_STEP_MIN: i64 = 30;

/// Outcome of an availability check: the requested time works, or a list of
/// feasible nearby times (possibly empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Alternatives(Vec<i64>),
}

#[derive(Clone)]
pub struct ReservationEngine {
    orders: OrdersRepo,
    tables: TablesRepo,
    hours: HoursRepo,
}

impl ReservationEngine {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            orders: OrdersRepo::new(pool.clone()),
            tables: TablesRepo::new(pool.clone()),
            hours: HoursRepo::new(pool),
        }
    }

    /// Decide whether a reservation request can be approved at its requested
    /// time, and if not, which of the nearby offsets would work.
    pub async fn check_availability(&self, draft: &OrderDraft, now_ms: i64) -> Result<Decision> {
        if draft.number_of_guests <= 0 {
            return Err(BistroError::Validation(
                "guest count must be positive".into(),
            ));
        }
        if !draft.has_contact() {
            return Err(BistroError::Validation(
                "a phone number or email is required".into(),
            ));
        }
        self.check_window(draft.order_date, now_ms)?;
        self.check_hours(draft.order_date).await?;

        let capacities = self.tables.capacities().await?;
        if capacities.iter().max().copied().unwrap_or(0) < draft.number_of_guests {
            return Err(BistroError::NoResource(format!(
                "no table seats {} guests",
                draft.number_of_guests
            )));
        }

        if self
            .feasible_at(draft.order_date, draft.number_of_guests, &capacities)
            .await?
        {
            return Ok(Decision::Approved);
        }

        let mut alternatives = Vec::new();
        for offset in ALTERNATIVE_OFFSETS_MIN {
            let at = draft.order_date + offset * MINUTE_MS;
            if self.check_window(at, now_ms).is_err() || self.check_hours(at).await.is_err() {
                continue;
            }
            if self.feasible_at(at, draft.number_of_guests, &capacities).await? {
                alternatives.push(at);
            }
        }
        Ok(Decision::Alternatives(alternatives))
    }

    /// Can a party arriving without a reservation be seated right now?
    /// Feasibility here is physical: a free table with enough seats.
    pub async fn free_table_exists(&self, guests: i64) -> Result<bool> {
        Ok(self
            .tables
            .available()
            .await?
            .iter()
            .any(|t| t.status == TableStatus::Available && t.capacity >= guests))
    }

    /// Enumerate bookable `HH:MM` slots for a date and party size.
    ///
    /// `["CLOSED"]` means the day is closed, `["FULL"]` that every bucket was
    /// infeasible. Buckets run every 30 minutes from open to one hour before
    /// close, skipping anything inside the minimum-notice window.
    pub async fn available_slots(
        &self,
        date: NaiveDate,
        guests: i64,
        now_ms: i64,
    ) -> Result<Vec<String>> {
        if guests <= 0 {
            return Err(BistroError::Validation(
                "guest count must be positive".into(),
            ));
        }

        let rule = match self.hours.get_for_date(date).await? {
            Some(rule) if !rule.is_closed => rule,
            _ => return Ok(vec!["CLOSED".into()]),
        };

        let capacities = self.tables.capacities().await?;
        let open_min = minutes_of_day(rule.open_time);
        let close_min = minutes_of_day(rule.close_time);

        let mut slots = Vec::new();
        let mut minute = open_min;
        while minute + 60 <= close_min {
            let at = clock::at(date, rule.open_time) + (minute - open_min) * MINUTE_MS;
            if at >= now_ms + MIN_LEAD_MS && self.feasible_at(at, guests, &capacities).await? {
                slots.push(format!("{:02}:{:02}", minute / 60, minute % 60));
            }
            minute += SLOT_STEP_MIN;
        }

        if slots.is_empty() {
            return Ok(vec!["FULL".into()]);
        }
        Ok(slots)
    }

    /// Does a timestamp fall inside the effective opening hours of its day?
    pub async fn within_opening_hours(&self, at_ms: i64) -> Result<bool> {
        match self.check_hours(at_ms).await {
            Ok(()) => Ok(true),
            Err(BistroError::Validation(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// A time is feasible iff all overlapping active orders plus the new
    /// party can be assigned distinct sufficient tables.
    async fn feasible_at(&self, at_ms: i64, guests: i64, capacities: &[i64]) -> Result<bool> {
        let overlapping = self.orders.get_overlapping_active(at_ms).await?;
        let mut groups: Vec<i64> = overlapping.iter().map(|o| o.number_of_guests).collect();
        groups.push(guests);
        Ok(bestfit::feasible(&groups, capacities))
    }

    fn check_window(&self, at_ms: i64, now_ms: i64) -> Result<()> {
        if at_ms < now_ms + MIN_LEAD_MS {
            return Err(BistroError::Validation(
                "reservations require at least one hour of notice".into(),
            ));
        }
        if at_ms > now_ms + MAX_LEAD_MS {
            return Err(BistroError::Validation(
                "reservations open at most 31 days ahead".into(),
            ));
        }
        Ok(())
    }

    async fn check_hours(&self, at_ms: i64) -> Result<()> {
        let rule = self.hours.get_for_date(clock::date_of(at_ms)).await?;
        let rule = match rule {
            Some(rule) if !rule.is_closed => rule,
            _ => {
                return Err(BistroError::Validation(
                    "the restaurant is closed on that day".into(),
                ))
            }
        };

        let time = clock::time_of(at_ms);
        if time < rule.open_time || time > rule.close_time {
            return Err(BistroError::Validation(
                "the requested time is outside opening hours".into(),
            ));
        }
        Ok(())
    }
}

fn minutes_of_day(time: chrono::NaiveTime) -> i64 {
    (time.hour() * 60 + time.minute()) as i64
}
