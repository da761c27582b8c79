//! End-to-end flow tests.
//!
//! These drive the dispatcher with literal wire envelopes against an
//! in-memory database, covering the scripted scenarios and the
//! cross-component invariants:
//!
//! - **walk_in_seats_immediately**: free table → SEATED on the smallest
//!   fitting table, arrival stamped, table occupied.
//! - **reservation_conflict_yields_alternatives**: CREATE_ORDER colliding
//!   with a pending 4-top answers ORDER_ALTERNATIVES, feasible offsets only.
//! - **scheduler_cancels_late_arrival**: a 16-minute-late PENDING order
//!   becomes NO_SHOW on one tick; a second tick is a no-op.
//! - **payment_promotes_waitlist**: PAY_BILL completes the order, frees the
//!   table, promotes the earliest fitting WAITING order, and broadcasts a
//!   TABLE_READY push naming its code.
//! - **double_login_refused**: second LOGIN for the same account answers
//!   null until the first terminal logs out.
//! - **hours_change_cancels_future_order**: closing a day cancels its
//!   pending reservations and broadcasts the cancellation.
//! - **staff_gating**: table listings and reports refuse non-staff callers;
//!   reports additionally refuse non-managers.
//! - **confirmation_codes_unique_among_active**: live orders never share a
//!   code.
//!
//! # Test infrastructure
//!
//! - **`test_state()`**: in-memory SQLite with migrations, fresh session
//!   map and client registry.
//! - **`insert_staff()`**: seeds a WORKER/MANAGER row (staff accounts are
//!   not self-service).
//! - **`open_all_week()`**: permissive opening hours so booking-window
//!   checks are exercised in isolation.
//! - **`send()`**: one dispatcher round-trip.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::clock::{self, DAY_MS, HOUR_MS, MINUTE_MS};
use crate::config::AppConfig;
use crate::db::models::{OrderDraft, OrderStatus, TableStatus};
use crate::db::Database;
use crate::repo::users::hash_password;
use crate::scheduler;
use crate::server::dispatcher;
use crate::server::protocol::{ActionTag, Envelope};
use crate::server::registry::ClientId;
use crate::AppState;

async fn test_state() -> Arc<AppState> {
    let config = AppConfig {
        listen_port: 5555,
        database_url: "sqlite::memory:".into(),
        db_password: None,
        pool_capacity: 10,
    };
    Arc::new(AppState::new(config, Database::test_db().await))
}

async fn insert_staff(state: &AppState, username: &str, role: &str) {
    let mut conn = state.db.pool.acquire().await.unwrap();
    sqlx::query(
        "INSERT INTO users (username, password, first_name, last_name, role, phone, email) \
         VALUES (?, ?, '', '', ?, '', '')",
    )
    .bind(username)
    .bind(hash_password("pw"))
    .bind(role)
    .execute(&mut *conn)
    .await
    .unwrap();
}

async fn open_all_week(state: &AppState) {
    for day in 1..=7 {
        state
            .hours
            .upsert(&crate::db::models::OpeningHours {
                id: 0,
                day_of_week: Some(day),
                specific_date: None,
                open_time: chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                close_time: chrono::NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
                is_closed: false,
            })
            .await
            .unwrap();
    }
}

async fn send(state: &AppState, conn: ClientId, tag: ActionTag, data: Value) -> Envelope {
    dispatcher::dispatch(state, conn, Envelope { tag, data })
        .await
        .expect("dispatcher reply")
}

fn guest_draft(guests: i64, phone: &str) -> Value {
    json!({
        "order_date": 0,
        "number_of_guests": guests,
        "phone": phone,
        "email": format!("{phone}@example.com"),
        "customer_name": "Guest"
    })
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn walk_in_seats_immediately() {
    let state = test_state().await;
    state.tables.add(1, 2).await.unwrap();
    state.tables.add(2, 4).await.unwrap();

    let before = clock::now_ms();
    let reply = send(&state, 1, ActionTag::EnterWaitlist, guest_draft(2, "0501111111")).await;
    assert_eq!(reply.tag, ActionTag::EnterWaitlist);

    assert_eq!(reply.data["status"], "SEATED");
    assert_eq!(reply.data["assigned_table_id"], 1);
    let arrival = reply.data["actual_arrival_time"].as_i64().unwrap();
    assert!((arrival - before).abs() <= 1_000);

    assert_eq!(
        state.tables.get(1).await.unwrap().status,
        TableStatus::Occupied
    );
}

#[tokio::test]
async fn reservation_conflict_yields_alternatives() {
    let state = test_state().await;
    open_all_week(&state).await;
    state.tables.add(1, 2).await.unwrap();
    state.tables.add(2, 4).await.unwrap();

    // An approved 4-top already holds the only 4-seat table at the
    // requested time.
    let now = clock::now_ms();
    let at = now + DAY_MS;
    state
        .orders
        .create(
            &OrderDraft {
                order_date: at,
                number_of_guests: 4,
                subscriber_id: None,
                phone: "0509999999".into(),
                email: "holder@example.com".into(),
                customer_name: "Holder".into(),
            },
            OrderStatus::Pending,
            false,
            now,
        )
        .await
        .unwrap();

    let mut draft = guest_draft(4, "0501111111");
    draft["order_date"] = json!(at);
    let reply = send(&state, 1, ActionTag::CreateOrder, draft).await;

    // The response switches tags; every offset still collides with the
    // holder's ±2 h window, so the list is empty.
    assert_eq!(reply.tag, ActionTag::OrderAlternatives);
    assert_eq!(reply.data, json!([]));

    // A 2-top fits alongside on table 1.
    let mut small = guest_draft(2, "0502222222");
    small["order_date"] = json!(at);
    let reply = send(&state, 1, ActionTag::CreateOrder, small).await;
    assert_eq!(reply.tag, ActionTag::CreateOrder);
    assert_eq!(reply.data["status"], "PENDING");
    let code = reply.data["confirmation_code"].as_i64().unwrap();
    assert!((1_000..10_000).contains(&code));
}

#[tokio::test]
async fn scheduler_cancels_late_arrival() {
    let state = test_state().await;
    state.tables.add(1, 4).await.unwrap();

    let now = clock::now_ms();
    let order = state
        .orders
        .create(
            &OrderDraft {
                order_date: now - 16 * MINUTE_MS,
                number_of_guests: 2,
                subscriber_id: None,
                phone: "0501111111".into(),
                email: "late@example.com".into(),
                customer_name: "Late".into(),
            },
            OrderStatus::Pending,
            false,
            now - HOUR_MS,
        )
        .await
        .unwrap();

    scheduler::tick(&state.db, &state.registry, now).await;
    let after = state
        .orders
        .get_by_id(order.order_number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, OrderStatus::NoShow);
    assert_eq!(after.assigned_table_id, None);
    assert_eq!(
        state.tables.get(1).await.unwrap().status,
        TableStatus::Available
    );

    // Second tick leaves state unchanged.
    scheduler::tick(&state.db, &state.registry, now).await;
    let again = state
        .orders
        .get_by_id(order.order_number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.status, OrderStatus::NoShow);
}

#[tokio::test]
async fn payment_promotes_waitlist() {
    let state = test_state().await;
    state.tables.add(1, 4).await.unwrap();
    let (_watcher, mut pushes) = state.registry.register();

    // A seats on the only table; B queues behind it.
    let a = send(&state, 1, ActionTag::EnterWaitlist, guest_draft(2, "0501111111")).await;
    assert_eq!(a.data["status"], "SEATED");
    let b = send(&state, 2, ActionTag::EnterWaitlist, guest_draft(2, "0502222222")).await;
    assert_eq!(b.data["status"], "WAITING");
    let b_code = b.data["confirmation_code"].as_i64().unwrap();

    let pay = send(
        &state,
        1,
        ActionTag::PayBill,
        json!({
            "confirmation_code": a.data["confirmation_code"],
            "phone": "0501111111"
        }),
    )
    .await;
    assert_eq!(pay.data, "OK");

    let a_after = state
        .orders
        .get_by_id(a.data["order_number"].as_i64().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a_after.status, OrderStatus::Completed);
    assert_eq!(
        state.tables.get(1).await.unwrap().status,
        TableStatus::Available
    );

    let b_after = state
        .orders
        .get_by_id(b.data["order_number"].as_i64().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b_after.status, OrderStatus::Notified);

    let push = pushes.try_recv().unwrap();
    assert_eq!(push.tag, ActionTag::ServerNotification);
    let text = push.data.as_str().unwrap();
    assert!(text.contains("TABLE_READY"));
    assert!(text.contains(&b_code.to_string()));
}

#[tokio::test]
async fn double_login_refused() {
    let state = test_state().await;
    insert_staff(&state, "alice", "WORKER").await;

    let first = send(
        &state,
        1,
        ActionTag::Login,
        json!({"username": "alice", "password": "pw"}),
    )
    .await;
    assert_eq!(first.data["username"], "alice");

    // Second terminal, same account: null.
    let second = send(
        &state,
        2,
        ActionTag::Login,
        json!({"username": "alice", "password": "pw"}),
    )
    .await;
    assert!(second.data.is_null());

    send(&state, 1, ActionTag::Logout, Value::Null).await;

    let third = send(
        &state,
        2,
        ActionTag::Login,
        json!({"username": "alice", "password": "pw"}),
    )
    .await;
    assert_eq!(third.data["username"], "alice");
}

#[tokio::test]
async fn hours_change_cancels_future_order() {
    let state = test_state().await;
    open_all_week(&state).await;
    state.tables.add(1, 4).await.unwrap();
    insert_staff(&state, "boss", "MANAGER").await;
    send(
        &state,
        1,
        ActionTag::Login,
        json!({"username": "boss", "password": "pw"}),
    )
    .await;

    let (_watcher, mut pushes) = state.registry.register();

    // Pending order tomorrow evening.
    let now = clock::now_ms();
    let tomorrow_eve = clock::at(
        clock::date_of(now + DAY_MS),
        chrono::NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
    );
    let mut draft = guest_draft(2, "0501111111");
    draft["order_date"] = json!(tomorrow_eve);
    let created = send(&state, 2, ActionTag::CreateOrder, draft).await;
    assert_eq!(created.tag, ActionTag::CreateOrder);
    let code = created.data["confirmation_code"].as_i64().unwrap();

    // Close tomorrow entirely.
    let reply = send(
        &state,
        1,
        ActionTag::UpdateOpeningHours,
        json!({
            "day_of_week": null,
            "specific_date": clock::date_of(tomorrow_eve).to_string(),
            "open_time": "00:00:00",
            "close_time": "00:00:00",
            "is_closed": true
        }),
    )
    .await;
    assert_eq!(reply.tag, ActionTag::UpdateOpeningHours);
    assert!(reply.data.as_str().unwrap().contains("1 reservations cancelled"));

    let after = state
        .orders
        .get_by_id(created.data["order_number"].as_i64().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, OrderStatus::Cancelled);

    let push = pushes.try_recv().unwrap();
    let text = push.data.as_str().unwrap();
    assert!(text.contains("CANCELLED"));
    assert!(text.contains(&code.to_string()));
}

// ---------------------------------------------------------------------------
// Authorization and invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn staff_gating() {
    let state = test_state().await;
    insert_staff(&state, "worker", "WORKER").await;

    // Anonymous callers are refused.
    let reply = send(&state, 1, ActionTag::GetAllTables, Value::Null).await;
    assert_eq!(reply.data, "login required");

    send(
        &state,
        1,
        ActionTag::Login,
        json!({"username": "worker", "password": "pw"}),
    )
    .await;
    let reply = send(&state, 1, ActionTag::GetAllTables, Value::Null).await;
    assert_eq!(reply.data, json!([]));

    // Reports are manager-only; a worker is refused.
    let reply = send(
        &state,
        1,
        ActionTag::GetPerformanceReport,
        json!({"month": 1, "year": 2026}),
    )
    .await;
    assert_eq!(reply.data, "manager access required");
}

#[tokio::test]
async fn guest_cancel_requires_matching_contact() {
    let state = test_state().await;
    state.tables.add(1, 4).await.unwrap();

    let order = send(&state, 1, ActionTag::EnterWaitlist, guest_draft(2, "0501111111")).await;
    let code = order.data["confirmation_code"].as_i64().unwrap();

    // Bare code without the booked contact: refused.
    let reply = send(&state, 2, ActionTag::CancelOrder, json!(code)).await;
    assert!(reply.data.as_str().unwrap().contains("contact"));

    let reply = send(
        &state,
        2,
        ActionTag::CancelOrder,
        json!({"confirmation_code": code, "phone": "0501111111"}),
    )
    .await;
    assert_eq!(reply.data, "OK");
    assert_eq!(
        state.tables.get(1).await.unwrap().status,
        TableStatus::Available
    );
}

#[tokio::test]
async fn confirmation_codes_unique_among_active() {
    let state = test_state().await;
    let now = clock::now_ms();

    let mut codes = std::collections::HashSet::new();
    for i in 0..40_i64 {
        let order = state
            .orders
            .create(
                &OrderDraft {
                    order_date: now + HOUR_MS + i * MINUTE_MS,
                    number_of_guests: 2,
                    subscriber_id: None,
                    phone: format!("05011{i:05}"),
                    email: String::new(),
                    customer_name: "Guest".into(),
                },
                OrderStatus::Pending,
                false,
                now,
            )
            .await
            .unwrap();
        assert!(
            codes.insert(order.confirmation_code),
            "duplicate confirmation code among active orders"
        );
    }
}

#[tokio::test]
async fn client_quit_ends_the_conversation() {
    let state = test_state().await;
    let reply = dispatcher::dispatch(
        &state,
        1,
        Envelope {
            tag: ActionTag::ClientQuit,
            data: Value::Null,
        },
    )
    .await;
    assert!(reply.is_none());
}
