//! Seating and waitlist control: arrivals, walk-ins, payment, promotion,
//! and the re-checks behind administrative mutations.

use tracing::info;

use crate::clock::MINUTE_MS;
use crate::db::models::{Order, OrderDraft, OrderStatus, Role, User};
use crate::db::pool::ConnectionPool;
use crate::engine::{bestfit, Decision, ReservationEngine};
use crate::error::{BistroError, Result};
use crate::repo::orders::{OrdersRepo, PRICE_PER_GUEST};
use crate::repo::tables::TablesRepo;
use crate::server::protocol::Envelope;
use crate::server::registry::ClientRegistry;

/// Arrivals are honored within this window around the scheduled time,
/// covering early arrivals as well; the scheduler enforces the hard
/// 15-minute late cutoff independently.
const ARRIVAL_TOLERANCE_MS: i64 = 20 * MINUTE_MS;

/// Member discount applied when the paying session owns the order.
const MEMBER_DISCOUNT: f64 = 0.10;

/// Outcome of a reservation request.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(Order),
    Alternatives(Vec<i64>),
}

#[derive(Clone)]
pub struct SeatingController {
    orders: OrdersRepo,
    tables: TablesRepo,
    engine: ReservationEngine,
}

impl SeatingController {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            orders: OrdersRepo::new(pool.clone()),
            tables: TablesRepo::new(pool.clone()),
            engine: ReservationEngine::new(pool),
        }
    }

    /// Book a future table: approved requests become PENDING orders with a
    /// fresh confirmation code, infeasible ones come back with alternatives.
    pub async fn create_reservation(
        &self,
        draft: &OrderDraft,
        now_ms: i64,
    ) -> Result<CreateOutcome> {
        match self.engine.check_availability(draft, now_ms).await? {
            Decision::Approved => {
                let order = self
                    .orders
                    .create(draft, OrderStatus::Pending, false, now_ms)
                    .await?;
                Ok(CreateOutcome::Created(order))
            }
            Decision::Alternatives(alternatives) => Ok(CreateOutcome::Alternatives(alternatives)),
        }
    }

    /// Check in a reservation by confirmation code and seat it on the
    /// smallest free table that fits.
    pub async fn validate_arrival(&self, code: i64, now_ms: i64) -> Result<Order> {
        let order = self
            .orders
            .get_by_active_code(code)
            .await?
            .ok_or_else(|| BistroError::NotFound("no active order with that code".into()))?;

        if !matches!(order.status, OrderStatus::Pending | OrderStatus::Notified) {
            return Err(BistroError::WrongState(format!(
                "order {} is not awaiting arrival",
                order.order_number
            )));
        }
        if (now_ms - order.order_date).abs() > ARRIVAL_TOLERANCE_MS {
            return Err(BistroError::Validation(
                "arrival is outside the 20-minute window around the reserved time".into(),
            ));
        }

        self.orders
            .assign_free_table_and_seat(order.order_number, order.number_of_guests, now_ms)
            .await
    }

    /// Walk-in entry: seat immediately when a sufficient table is free,
    /// otherwise join the waitlist. One active order per contact per day.
    pub async fn enter_waitlist(&self, draft: &OrderDraft, now_ms: i64) -> Result<Order> {
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
        if self
            .orders
            .has_active_order_today(&draft.phone, &draft.email, now_ms)
            .await?
        {
            return Err(BistroError::Conflict(
                "an active order already exists for this contact today".into(),
            ));
        }

        let mut walk_in = draft.clone();
        walk_in.order_date = now_ms;

        if self.engine.free_table_exists(draft.number_of_guests).await? {
            let order = self
                .orders
                .create(&walk_in, OrderStatus::Pending, false, now_ms)
                .await?;
            match self
                .orders
                .assign_free_table_and_seat(order.order_number, order.number_of_guests, now_ms)
                .await
            {
                Ok(seated) => return Ok(seated),
                // Lost the table between scan and claim: fall through to the
                // waitlist with the same code.
                Err(BistroError::NoResource(_)) => {
                    return self.orders.move_to_waitlist(order.order_number).await;
                }
                Err(e) => return Err(e),
            }
        }

        self.orders
            .create(&walk_in, OrderStatus::Waiting, true, now_ms)
            .await
    }

    /// Leave the queue (or drop a reservation) by confirmation code.
    pub async fn leave_waitlist(&self, code: i64) -> Result<Order> {
        let order = self
            .orders
            .get_by_active_code(code)
            .await?
            .ok_or_else(|| BistroError::NotFound("no active order with that code".into()))?;

        if !matches!(
            order.status,
            OrderStatus::Waiting | OrderStatus::Notified | OrderStatus::Pending
        ) {
            return Err(BistroError::WrongState(format!(
                "order {} can no longer be withdrawn",
                order.order_number
            )));
        }
        self.orders.cancel(order.order_number).await
    }

    /// Settle the bill for a seated or billed order. Members paying for
    /// their own order get the discount; completion frees the table and
    /// promotes the waitlist.
    pub async fn pay_bill(
        &self,
        code: i64,
        session_user: Option<&User>,
        now_ms: i64,
        registry: &ClientRegistry,
    ) -> Result<Order> {
        let order = self
            .orders
            .get_by_active_code(code)
            .await?
            .ok_or_else(|| BistroError::NotFound("no active order with that code".into()))?;

        if !matches!(order.status, OrderStatus::Seated | OrderStatus::Billed) {
            return Err(BistroError::WrongState(format!(
                "order {} has no open bill",
                order.order_number
            )));
        }

        let base = order
            .total_price
            .unwrap_or(order.number_of_guests as f64 * PRICE_PER_GUEST);
        let discounted = session_user
            .filter(|u| u.role == Role::Member)
            .and_then(|u| order.member_id().filter(|m| *m == u.user_id))
            .is_some();
        let final_price = if discounted {
            round_to_cents(base * (1.0 - MEMBER_DISCOUNT))
        } else {
            round_to_cents(base)
        };

        self.complete_order(&order, final_price, now_ms, registry)
            .await
    }

    /// Staff status override for an order, honoring the state machine.
    pub async fn staff_update_status(
        &self,
        order_number: i64,
        new_status: OrderStatus,
        now_ms: i64,
        registry: &ClientRegistry,
    ) -> Result<Order> {
        let order = self
            .orders
            .get_by_id(order_number)
            .await?
            .ok_or_else(|| BistroError::NotFound(format!("no order {order_number}")))?;
        if order.status.is_terminal() {
            return Err(BistroError::WrongState(format!(
                "order {order_number} is already closed"
            )));
        }

        match new_status {
            OrderStatus::Seated => {
                self.orders
                    .assign_free_table_and_seat(order_number, order.number_of_guests, now_ms)
                    .await
            }
            OrderStatus::Billed => {
                let billed = self.orders.bill_manual(order_number).await?;
                registry.broadcast(&Envelope::notification(format!(
                    "INVOICE: order {} billed {:.2}",
                    billed.confirmation_code,
                    billed.total_price.unwrap_or(0.0)
                )));
                Ok(billed)
            }
            OrderStatus::Completed => {
                let price = order
                    .total_price
                    .unwrap_or(order.number_of_guests as f64 * PRICE_PER_GUEST);
                self.complete_order(&order, round_to_cents(price), now_ms, registry)
                    .await
            }
            OrderStatus::Cancelled => self.orders.cancel(order_number).await,
            _ => Err(BistroError::WrongState(format!(
                "cannot move order {order_number} to {new_status:?} manually"
            ))),
        }
    }

    /// Re-run feasibility for future reservations after the table set or
    /// capacities changed; cancel those that no longer fit and tell everyone.
    pub async fn recheck_future_reservations(
        &self,
        now_ms: i64,
        registry: &ClientRegistry,
    ) -> Result<Vec<Order>> {
        let capacities = self.tables.capacities().await?;
        let future = self.orders.get_future_unseated(now_ms).await?;

        let mut cancelled = Vec::new();
        for order in future {
            if cancelled.iter().any(|c: &Order| c.order_number == order.order_number) {
                continue;
            }
            let overlapping = self.orders.get_overlapping_active(order.order_date).await?;
            let groups: Vec<i64> = overlapping.iter().map(|o| o.number_of_guests).collect();
            if !bestfit::feasible(&groups, &capacities) {
                let gone = self.orders.cancel(order.order_number).await?;
                registry.broadcast(&Envelope::notification(format!(
                    "CANCELLED: order {} no longer fits the table plan",
                    gone.confirmation_code
                )));
                info!(order = gone.order_number, "Cancelled infeasible reservation");
                cancelled.push(gone);
            }
        }
        Ok(cancelled)
    }

    /// Cancel future reservations that an opening-hours change pushed out of
    /// bounds; returns the cancelled orders for the summary.
    pub async fn cancel_out_of_hours(
        &self,
        now_ms: i64,
        registry: &ClientRegistry,
    ) -> Result<Vec<Order>> {
        let future = self.orders.get_future_unseated(now_ms).await?;

        let mut cancelled = Vec::new();
        for order in future {
            if self.engine.within_opening_hours(order.order_date).await? {
                continue;
            }
            let gone = self.orders.cancel(order.order_number).await?;
            registry.broadcast(&Envelope::notification(format!(
                "CANCELLED: order {} falls outside the new opening hours",
                gone.confirmation_code
            )));
            info!(order = gone.order_number, "Cancelled out-of-hours reservation");
            cancelled.push(gone);
        }
        Ok(cancelled)
    }

    async fn complete_order(
        &self,
        order: &Order,
        final_price: f64,
        now_ms: i64,
        registry: &ClientRegistry,
    ) -> Result<Order> {
        let freed = self
            .orders
            .process_payment(order.order_number, final_price, now_ms)
            .await?;

        if let Some(table_id) = freed {
            let capacity = self.tables.get_capacity(table_id).await?;
            if let Some(promoted) = self.orders.promote_waitlist_head(capacity, now_ms).await? {
                registry.broadcast(&Envelope::notification(format!(
                    "TABLE_READY: a table is ready for order {}, please arrive within 15 minutes",
                    promoted.confirmation_code
                )));
                info!(
                    promoted = promoted.order_number,
                    table = table_id,
                    "Promoted waitlist order"
                );
            }
        }

        self.orders
            .get_by_id(order.order_number)
            .await?
            .ok_or_else(|| BistroError::NotFound(format!("no order {}", order.order_number)))
    }
}

/// Round half-up to cents.
fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
