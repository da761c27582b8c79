//! Time-driven order maintenance.
//!
//! One background timer: after a 5-second warmup it ticks every 10 seconds,
//! running late cancellation, reservation reminders, and automatic invoicing
//! against the database. Every sub-step is isolated: a failure is logged
//! and the next tick runs regardless. Ticks never overlap: the interval is
//! polled only after the previous body finishes, without catch-up bursts.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::clock;
use crate::db::Database;
use crate::repo::orders::OrdersRepo;
use crate::server::protocol::Envelope;
use crate::server::registry::ClientRegistry;

/// Delay before the first tick.
const WARMUP: Duration = Duration::from_secs(5);

/// Interval between ticks.
const TICK_PERIOD: Duration = Duration::from_secs(10);

pub fn spawn(db: Database, registry: ClientRegistry) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(WARMUP).await;
        let mut interval = tokio::time::interval(TICK_PERIOD);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tick(&db, &registry, clock::now_ms()).await;
        }
    })
}

/// One maintenance pass. Replaying a tick on unchanged state is a no-op:
/// every sub-step advances order status as part of its selection.
pub async fn tick(db: &Database, registry: &ClientRegistry, now_ms: i64) {
    let orders = OrdersRepo::new(db.pool.clone());

    // 1. Late cancellation: WAITING past the threshold is cancelled,
    //    PENDING/NOTIFIED becomes NO_SHOW with its table freed.
    match orders.cancel_late_orders(now_ms).await {
        Ok(sweep) if !sweep.is_empty() => {
            info!(
                no_show = sweep.no_show.len(),
                cancelled_waiting = sweep.cancelled_waiting,
                freed_tables = sweep.freed_tables.len(),
                "Cancelled late orders"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Late-cancellation sweep failed"),
    }

    // 2. Reminders for reservations two hours out.
    match orders.take_reminders(now_ms).await {
        Ok(reminded) => {
            for order in reminded {
                registry.broadcast(&Envelope::notification(format!(
                    "REMINDER: order {} is expected at {}",
                    order.confirmation_code,
                    clock::to_datetime(order.order_date).format("%H:%M")
                )));
                info!(order = order.order_number, "Sent reservation reminder");
            }
        }
        Err(e) => warn!(error = %e, "Reminder sweep failed"),
    }

    // 3. Automatic invoices for parties seated two hours.
    match orders.take_automatic_invoices(now_ms).await {
        Ok(billed) => {
            for order in billed {
                registry.broadcast(&Envelope::notification(format!(
                    "INVOICE: order {} billed {:.2}",
                    order.confirmation_code,
                    order.total_price.unwrap_or(0.0)
                )));
                info!(order = order.order_number, "Issued automatic invoice");
            }
        }
        Err(e) => warn!(error = %e, "Automatic-invoice sweep failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{HOUR_MS, MINUTE_MS};
    use crate::db::models::{OrderDraft, OrderStatus, TableStatus};
    use crate::repo::tables::TablesRepo;

    const T0: i64 = 1_767_225_600_000; // 2026-01-01T00:00:00Z

    fn draft(guests: i64, at_ms: i64) -> OrderDraft {
        OrderDraft {
            order_date: at_ms,
            number_of_guests: guests,
            subscriber_id: None,
            phone: "0501111111".into(),
            email: "guest@example.com".into(),
            customer_name: "Guest".into(),
        }
    }

    #[tokio::test]
    async fn late_pending_becomes_no_show_and_frees_its_table() {
        let db = Database::test_db().await;
        let registry = ClientRegistry::new();
        let orders = OrdersRepo::new(db.pool.clone());
        let tables = TablesRepo::new(db.pool.clone());

        tables.add(1, 4).await.unwrap();
        let order = orders
            .create(&draft(2, T0 - 16 * MINUTE_MS), OrderStatus::Pending, false, T0 - HOUR_MS)
            .await
            .unwrap();

        tick(&db, &registry, T0).await;

        let after = orders.get_by_id(order.order_number).await.unwrap().unwrap();
        assert_eq!(after.status, OrderStatus::NoShow);
        assert_eq!(after.assigned_table_id, None);
        assert_eq!(tables.get(1).await.unwrap().status, TableStatus::Available);

        // Second tick on the same state changes nothing.
        tick(&db, &registry, T0).await;
        let again = orders.get_by_id(order.order_number).await.unwrap().unwrap();
        assert_eq!(again.status, OrderStatus::NoShow);
    }

    #[tokio::test]
    async fn reminder_and_invoice_notifications_reach_clients_once() {
        let db = Database::test_db().await;
        let registry = ClientRegistry::new();
        let (_id, mut rx) = registry.register();
        let orders = OrdersRepo::new(db.pool.clone());
        let tables = TablesRepo::new(db.pool.clone());

        tables.add(1, 4).await.unwrap();

        // Reservation two hours out: reminded.
        let reminded = orders
            .create(&draft(2, T0 + 2 * HOUR_MS), OrderStatus::Pending, false, T0)
            .await
            .unwrap();

        // Party seated 2.5 hours ago: auto-billed.
        let seated = orders
            .create(&draft(3, T0 - 3 * HOUR_MS), OrderStatus::Pending, false, T0 - 3 * HOUR_MS)
            .await
            .unwrap();
        orders
            .assign_free_table_and_seat(seated.order_number, 3, T0 - 150 * MINUTE_MS)
            .await
            .unwrap();

        tick(&db, &registry, T0).await;

        let reminder = rx.try_recv().unwrap();
        let text = reminder.data.as_str().unwrap().to_string();
        assert!(text.starts_with("REMINDER"));
        assert!(text.contains(&reminded.confirmation_code.to_string()));

        let invoice = rx.try_recv().unwrap();
        let text = invoice.data.as_str().unwrap().to_string();
        assert!(text.starts_with("INVOICE"));
        assert!(text.contains("300.00"));

        assert_eq!(
            orders.get_by_id(reminded.order_number).await.unwrap().unwrap().status,
            OrderStatus::Notified
        );
        assert_eq!(
            orders.get_by_id(seated.order_number).await.unwrap().unwrap().status,
            OrderStatus::Billed
        );

        // Replay: no further notifications.
        tick(&db, &registry, T0).await;
        assert!(rx.try_recv().is_err());
    }
}
