//! Wire envelope and request payloads.
//!
//! Every message is `{ "type": <tag>, "data": <payload> }`, serialized as a
//! JSON document inside a length-prefixed frame. Timestamps are epoch
//! milliseconds, dates `YYYY-MM-DD`, times of day `HH:MM:SS`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::models::OrderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionTag {
    Login,
    RegisterClient,
    IdentifyByQr,
    GetUserHistory,
    UpdateUserInfo,
    GetOrderByCode,
    CancelOrder,
    GetAvailableTimes,
    CreateOrder,
    OrderAlternatives,
    EnterWaitlist,
    LeaveWaitlist,
    ValidateArrival,
    PayBill,
    UpdateOrderStatus,
    GetOpeningHours,
    UpdateOpeningHours,
    GetAllTables,
    AddTable,
    RemoveTable,
    UpdateTable,
    GetActiveDiners,
    GetAllActiveOrders,
    GetWaitingList,
    GetRelevantOrders,
    GetPerformanceReport,
    GetSubscriptionReport,
    RestoreCode,
    ServerNotification,
    Logout,
    ClientQuit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub tag: ActionTag,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(tag: ActionTag, data: impl Serialize) -> Self {
        Self {
            tag,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn null(tag: ActionTag) -> Self {
        Self {
            tag,
            data: Value::Null,
        }
    }

    pub fn error(tag: ActionTag, message: impl Into<String>) -> Self {
        Self {
            tag,
            data: Value::String(message.into()),
        }
    }

    /// Unsolicited server push carrying human-readable text.
    pub fn notification(text: impl Into<String>) -> Self {
        Self {
            tag: ActionTag::ServerNotification,
            data: Value::String(text.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
}

/// Confirmation-code request; guests attach the contact they booked with for
/// the ownership check.
#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub confirmation_code: i64,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl CodeRequest {
    /// Accept either a bare code or the full object form.
    pub fn parse(data: &Value) -> Option<Self> {
        if let Some(code) = data.as_i64() {
            return Some(Self {
                confirmation_code: code,
                phone: None,
                email: None,
            });
        }
        serde_json::from_value(data.clone()).ok()
    }
}

#[derive(Debug, Deserialize)]
pub struct AvailableTimesRequest {
    pub date: NaiveDate,
    pub guests: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserInfoRequest {
    pub user_id: i64,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrderStatusRequest {
    pub order_number: i64,
    pub status: OrderStatus,
}

/// Table payload: ADD/UPDATE carry a capacity, REMOVE may send just an id.
#[derive(Debug, Deserialize)]
pub struct TableRequest {
    pub table_id: i64,
    #[serde(default)]
    pub capacity: Option<i64>,
}

impl TableRequest {
    /// Accept either a bare table id or the full object form.
    pub fn parse(data: &Value) -> Option<Self> {
        if let Some(id) = data.as_i64() {
            return Some(Self {
                table_id: id,
                capacity: None,
            });
        }
        serde_json::from_value(data.clone()).ok()
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub month: u32,
    pub year: i32,
}

#[derive(Debug, Deserialize)]
pub struct RestoreCodeRequest {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub member_code: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_use_wire_names() {
        assert_eq!(
            serde_json::to_value(ActionTag::IdentifyByQr).unwrap(),
            serde_json::json!("IDENTIFY_BY_QR")
        );
        assert_eq!(
            serde_json::to_value(ActionTag::PayBill).unwrap(),
            serde_json::json!("PAY_BILL")
        );
    }

    #[test]
    fn envelope_round_trips() {
        let env = Envelope::new(ActionTag::GetAvailableTimes, serde_json::json!({"guests": 4}));
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"type\":\"GET_AVAILABLE_TIMES\""));

        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.tag, ActionTag::GetAvailableTimes);
        assert_eq!(back.data["guests"], 4);
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let env: Envelope = serde_json::from_str(r#"{"type":"GET_OPENING_HOURS"}"#).unwrap();
        assert_eq!(env.tag, ActionTag::GetOpeningHours);
        assert!(env.data.is_null());
    }

    #[test]
    fn code_request_accepts_bare_number_and_object() {
        let bare = CodeRequest::parse(&serde_json::json!(4321)).unwrap();
        assert_eq!(bare.confirmation_code, 4321);
        assert_eq!(bare.phone, None);

        let full = CodeRequest::parse(&serde_json::json!({
            "confirmation_code": 1234,
            "phone": "0501111111"
        }))
        .unwrap();
        assert_eq!(full.confirmation_code, 1234);
        assert_eq!(full.phone.as_deref(), Some("0501111111"));

        assert!(CodeRequest::parse(&serde_json::json!("nope")).is_none());
    }
}
