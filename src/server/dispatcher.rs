//! Envelope dispatch: decode the payload, authorize, call the domain layer,
//! and encode the reply. Domain errors answer only the requesting
//! connection; system errors are logged and masked.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::clock;
use crate::db::models::{OrderDraft, User};
use crate::error::{BistroError, Result};
use crate::repo::users::blank_user;
use crate::seating::CreateOutcome;
use crate::AppState;

use super::protocol::{
    ActionTag, AvailableTimesRequest, CodeRequest, Envelope, LoginRequest, RegisterRequest,
    ReportRequest, RestoreCodeRequest, TableRequest, UpdateOrderStatusRequest,
    UpdateUserInfoRequest,
};
use super::registry::ClientId;

/// Handle one request envelope. `None` ends the connection (CLIENT_QUIT).
pub async fn dispatch(state: &AppState, conn: ClientId, envelope: Envelope) -> Option<Envelope> {
    let tag = envelope.tag;
    let data = envelope.data;

    let reply = match tag {
        ActionTag::Login => login(state, conn, &data).await,
        ActionTag::RegisterClient => register_client(state, conn, &data).await,
        ActionTag::IdentifyByQr => identify_by_qr(state, conn, &data).await,
        ActionTag::GetUserHistory => get_user_history(state, conn, &data).await,
        ActionTag::UpdateUserInfo => update_user_info(state, conn, &data).await,
        ActionTag::GetOrderByCode => get_order_by_code(state, &data).await,
        ActionTag::CancelOrder => cancel_order(state, conn, &data).await,
        ActionTag::GetAvailableTimes => get_available_times(state, &data).await,
        ActionTag::CreateOrder => create_order(state, &data).await,
        ActionTag::EnterWaitlist => enter_waitlist(state, &data).await,
        ActionTag::LeaveWaitlist => leave_waitlist(state, conn, &data).await,
        ActionTag::ValidateArrival => validate_arrival(state, &data).await,
        ActionTag::PayBill => pay_bill(state, conn, &data).await,
        ActionTag::UpdateOrderStatus => update_order_status(state, conn, &data).await,
        ActionTag::GetOpeningHours => get_opening_hours(state).await,
        ActionTag::UpdateOpeningHours => update_opening_hours(state, conn, &data).await,
        ActionTag::GetAllTables => get_all_tables(state, conn).await,
        ActionTag::AddTable => add_table(state, conn, &data).await,
        ActionTag::RemoveTable => remove_table(state, conn, &data).await,
        ActionTag::UpdateTable => update_table(state, conn, &data).await,
        ActionTag::GetActiveDiners => get_active_diners(state, conn).await,
        ActionTag::GetAllActiveOrders => get_all_active_orders(state, conn).await,
        ActionTag::GetWaitingList => get_waiting_list(state, conn).await,
        ActionTag::GetRelevantOrders => get_relevant_orders(state, conn, &data).await,
        ActionTag::GetPerformanceReport => performance_report(state, conn, &data).await,
        ActionTag::GetSubscriptionReport => subscription_report(state, conn, &data).await,
        ActionTag::RestoreCode => restore_code(state, conn, &data).await,
        ActionTag::Logout => logout(state, conn).await,
        ActionTag::ServerNotification => Err(BistroError::Validation(
            "SERVER_NOTIFICATION is server push only".into(),
        )),
        ActionTag::OrderAlternatives => Err(BistroError::Validation(
            "ORDER_ALTERNATIVES is a response tag".into(),
        )),
        ActionTag::ClientQuit => return None,
    };

    Some(match reply {
        Ok(envelope) => envelope,
        Err(err) => failure(tag, err),
    })
}

/// Shape the failure reply for a tag. LOGIN answers null so terminals can
/// treat any refusal uniformly; UPDATE_USER_INFO reports the literal
/// "ERROR"; everything else carries the error string.
fn failure(tag: ActionTag, err: BistroError) -> Envelope {
    let message = err.client_message(&format!("{tag:?}"));
    debug!(tag = ?tag, error = %message, "Request failed");
    match tag {
        ActionTag::Login => Envelope::null(tag),
        ActionTag::UpdateUserInfo => Envelope::error(tag, "ERROR"),
        _ => Envelope::error(tag, message),
    }
}

fn parse<T: DeserializeOwned>(data: &Value) -> Result<T> {
    serde_json::from_value(data.clone())
        .map_err(|e| BistroError::Validation(format!("bad request payload: {e}")))
}

/// Numeric payloads may arrive as numbers or strings (QR scans).
fn parse_i64(data: &Value) -> Result<i64> {
    data.as_i64()
        .or_else(|| data.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| BistroError::Validation("expected a numeric payload".into()))
}

fn parse_code(data: &Value) -> Result<CodeRequest> {
    CodeRequest::parse(data)
        .ok_or_else(|| BistroError::Validation("expected a confirmation code".into()))
}

/// Staff may act on anyone; otherwise the bound session must be the user.
fn require_self_or_staff(state: &AppState, conn: ClientId, user_id: i64) -> Result<()> {
    if state.sessions.require_staff(conn).is_ok() {
        return Ok(());
    }
    match state.sessions.current(conn) {
        Some(user) if user.user_id == user_id => Ok(()),
        _ => Err(BistroError::Unauthorized(
            "not authorized for this account".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

async fn login(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    let req: LoginRequest = parse(data)?;
    match state.sessions.login(conn, &req.username, &req.password).await {
        Ok(user) => Ok(Envelope::new(ActionTag::Login, user)),
        Err(err) => {
            // Refusals (bad credentials, already online) answer null.
            let _ = err.client_message("login");
            Ok(Envelope::null(ActionTag::Login))
        }
    }
}

async fn logout(state: &AppState, conn: ClientId) -> Result<Envelope> {
    state.sessions.logout(conn).await?;
    Ok(Envelope::new(ActionTag::Logout, "OK"))
}

async fn register_client(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    state.sessions.require_staff(conn)?;
    let req: RegisterRequest = parse(data)?;
    let draft = User {
        username: req.username,
        password: req.password,
        first_name: req.first_name,
        last_name: req.last_name,
        phone: req.phone,
        email: req.email,
        ..blank_user()
    };
    let user = state.users.register_member(&draft).await?;
    Ok(Envelope::new(ActionTag::RegisterClient, user))
}

async fn identify_by_qr(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    let code = parse_i64(data)?;
    let user = state.sessions.identify_by_code(conn, code).await?;
    Ok(Envelope::new(ActionTag::IdentifyByQr, user))
}

async fn get_user_history(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    let user_id = parse_i64(data)?;
    require_self_or_staff(state, conn, user_id)?;
    let history = state.orders.get_member_history(user_id).await?;
    Ok(Envelope::new(ActionTag::GetUserHistory, history))
}

async fn update_user_info(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    let req: UpdateUserInfoRequest = parse(data)?;
    require_self_or_staff(state, conn, req.user_id)?;
    state
        .users
        .update_contact(
            req.user_id,
            req.phone.as_deref(),
            req.email.as_deref(),
            req.first_name.as_deref(),
            req.last_name.as_deref(),
        )
        .await?;
    Ok(Envelope::new(ActionTag::UpdateUserInfo, "OK"))
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

async fn get_order_by_code(state: &AppState, data: &Value) -> Result<Envelope> {
    let req = parse_code(data)?;
    match state.orders.get_by_active_code(req.confirmation_code).await? {
        Some(order) => Ok(Envelope::new(ActionTag::GetOrderByCode, order)),
        None => Ok(Envelope::null(ActionTag::GetOrderByCode)),
    }
}

async fn cancel_order(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    let req = parse_code(data)?;
    let order = state
        .orders
        .get_by_active_code(req.confirmation_code)
        .await?
        .ok_or_else(|| BistroError::NotFound("no active order with that code".into()))?;
    state
        .sessions
        .authorize_order_access(conn, &order, req.phone.as_deref(), req.email.as_deref())?;
    state.orders.cancel(order.order_number).await?;
    Ok(Envelope::new(ActionTag::CancelOrder, "OK"))
}

async fn get_available_times(state: &AppState, data: &Value) -> Result<Envelope> {
    let req: AvailableTimesRequest = parse(data)?;
    let slots = state
        .engine
        .available_slots(req.date, req.guests, clock::now_ms())
        .await?;
    Ok(Envelope::new(ActionTag::GetAvailableTimes, slots))
}

async fn create_order(state: &AppState, data: &Value) -> Result<Envelope> {
    let draft: OrderDraft = parse(data)?;
    match state
        .seating
        .create_reservation(&draft, clock::now_ms())
        .await?
    {
        CreateOutcome::Created(order) => Ok(Envelope::new(ActionTag::CreateOrder, order)),
        CreateOutcome::Alternatives(times) => {
            Ok(Envelope::new(ActionTag::OrderAlternatives, times))
        }
    }
}

async fn enter_waitlist(state: &AppState, data: &Value) -> Result<Envelope> {
    let draft: OrderDraft = parse(data)?;
    let order = state.seating.enter_waitlist(&draft, clock::now_ms()).await?;
    Ok(Envelope::new(ActionTag::EnterWaitlist, order))
}

async fn leave_waitlist(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    let req = parse_code(data)?;
    let order = state
        .orders
        .get_by_active_code(req.confirmation_code)
        .await?
        .ok_or_else(|| BistroError::NotFound("no active order with that code".into()))?;
    state
        .sessions
        .authorize_order_access(conn, &order, req.phone.as_deref(), req.email.as_deref())?;
    state.seating.leave_waitlist(req.confirmation_code).await?;
    Ok(Envelope::new(ActionTag::LeaveWaitlist, "OK"))
}

async fn validate_arrival(state: &AppState, data: &Value) -> Result<Envelope> {
    let req = parse_code(data)?;
    let order = state
        .seating
        .validate_arrival(req.confirmation_code, clock::now_ms())
        .await?;
    Ok(Envelope::new(ActionTag::ValidateArrival, order))
}

async fn pay_bill(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    let req = parse_code(data)?;
    let order = state
        .orders
        .get_by_active_code(req.confirmation_code)
        .await?
        .ok_or_else(|| BistroError::NotFound("no active order with that code".into()))?;
    state
        .sessions
        .authorize_order_access(conn, &order, req.phone.as_deref(), req.email.as_deref())?;

    let session_user = state.sessions.current(conn);
    state
        .seating
        .pay_bill(
            req.confirmation_code,
            session_user.as_ref(),
            clock::now_ms(),
            &state.registry,
        )
        .await?;
    Ok(Envelope::new(ActionTag::PayBill, "OK"))
}

async fn update_order_status(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    state.sessions.require_staff(conn)?;
    let req: UpdateOrderStatusRequest = parse(data)?;
    state
        .seating
        .staff_update_status(req.order_number, req.status, clock::now_ms(), &state.registry)
        .await?;
    Ok(Envelope::new(ActionTag::UpdateOrderStatus, "OK"))
}

async fn restore_code(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    let req: RestoreCodeRequest = parse(data)?;
    let now = clock::now_ms();

    let orders = if let Some(member_code) = req.member_code {
        let user = state.users.get_by_membership_code(member_code).await?;
        state
            .orders
            .get_relevant_orders_for_today(user.user_id, now)
            .await?
    } else {
        let phone = req.phone.unwrap_or_default();
        let email = req.email.unwrap_or_default();
        if phone.trim().is_empty() && email.trim().is_empty() {
            return Err(BistroError::Validation(
                "a phone, email, or membership code is required".into(),
            ));
        }
        state
            .orders
            .get_by_contact_active_today(&phone, &email, now)
            .await?
    };

    if orders.is_empty() {
        return Err(BistroError::NotFound("no active order found today".into()));
    }

    let codes: Vec<String> = orders
        .iter()
        .map(|o| o.confirmation_code.to_string())
        .collect();
    state.registry.send_to(
        conn,
        Envelope::notification(format!("Your confirmation code(s): {}", codes.join(", "))),
    );
    Ok(Envelope::new(ActionTag::RestoreCode, "OK"))
}

// ---------------------------------------------------------------------------
// Staff operations
// ---------------------------------------------------------------------------

async fn get_opening_hours(state: &AppState) -> Result<Envelope> {
    let hours = state.hours.list().await?;
    Ok(Envelope::new(ActionTag::GetOpeningHours, hours))
}

async fn update_opening_hours(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    state.sessions.require_staff(conn)?;
    let rule = parse(data)?;
    state.hours.upsert(&rule).await?;
    let cancelled = state
        .seating
        .cancel_out_of_hours(clock::now_ms(), &state.registry)
        .await?;
    Ok(Envelope::new(
        ActionTag::UpdateOpeningHours,
        format!("opening hours updated; {} reservations cancelled", cancelled.len()),
    ))
}

async fn get_all_tables(state: &AppState, conn: ClientId) -> Result<Envelope> {
    state.sessions.require_staff(conn)?;
    Ok(Envelope::new(ActionTag::GetAllTables, state.tables.list().await?))
}

async fn add_table(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    state.sessions.require_staff(conn)?;
    let req: TableRequest = parse(data)?;
    let capacity = req
        .capacity
        .ok_or_else(|| BistroError::Validation("a capacity is required".into()))?;
    state.tables.add(req.table_id, capacity).await?;
    Ok(Envelope::new(ActionTag::AddTable, state.tables.list().await?))
}

async fn remove_table(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    state.sessions.require_staff(conn)?;
    let req = TableRequest::parse(data)
        .ok_or_else(|| BistroError::Validation("expected a table id".into()))?;
    state.tables.delete_safely(req.table_id).await?;
    let cancelled = state
        .seating
        .recheck_future_reservations(clock::now_ms(), &state.registry)
        .await?;
    Ok(Envelope::new(
        ActionTag::RemoveTable,
        format!(
            "table {} removed; {} reservations cancelled",
            req.table_id,
            cancelled.len()
        ),
    ))
}

async fn update_table(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    state.sessions.require_staff(conn)?;
    let req: TableRequest = parse(data)?;
    let capacity = req
        .capacity
        .ok_or_else(|| BistroError::Validation("a capacity is required".into()))?;
    state.tables.update_capacity(req.table_id, capacity).await?;
    let cancelled = state
        .seating
        .recheck_future_reservations(clock::now_ms(), &state.registry)
        .await?;
    Ok(Envelope::new(
        ActionTag::UpdateTable,
        format!(
            "table {} capacity set to {}; {} reservations cancelled",
            req.table_id,
            capacity,
            cancelled.len()
        ),
    ))
}

async fn get_active_diners(state: &AppState, conn: ClientId) -> Result<Envelope> {
    state.sessions.require_staff(conn)?;
    Ok(Envelope::new(
        ActionTag::GetActiveDiners,
        state.orders.get_active_diners().await?,
    ))
}

async fn get_all_active_orders(state: &AppState, conn: ClientId) -> Result<Envelope> {
    state.sessions.require_staff(conn)?;
    Ok(Envelope::new(
        ActionTag::GetAllActiveOrders,
        state.orders.get_all_active_today(clock::now_ms()).await?,
    ))
}

async fn get_waiting_list(state: &AppState, conn: ClientId) -> Result<Envelope> {
    state.sessions.require_staff(conn)?;
    Ok(Envelope::new(
        ActionTag::GetWaitingList,
        state
            .orders
            .get_live_waitlist_and_today_pending(clock::now_ms())
            .await?,
    ))
}

async fn get_relevant_orders(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    let member_id = parse_i64(data)?;
    require_self_or_staff(state, conn, member_id)?;
    Ok(Envelope::new(
        ActionTag::GetRelevantOrders,
        state
            .orders
            .get_relevant_orders_for_today(member_id, clock::now_ms())
            .await?,
    ))
}

async fn performance_report(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    state.sessions.require_manager(conn)?;
    let req: ReportRequest = parse(data)?;
    Ok(Envelope::new(
        ActionTag::GetPerformanceReport,
        state.orders.performance_report(req.month, req.year).await?,
    ))
}

async fn subscription_report(state: &AppState, conn: ClientId, data: &Value) -> Result<Envelope> {
    state.sessions.require_manager(conn)?;
    let req: ReportRequest = parse(data)?;
    Ok(Envelope::new(
        ActionTag::GetSubscriptionReport,
        state.orders.subscription_report(req.month, req.year).await?,
    ))
}
