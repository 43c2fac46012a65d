//! Types for communication with the zca-js sidecar.

use {
    serde::{Deserialize, Serialize},
    zalo_accounts::AccountAction,
};

/// Messages sent from Rust to the sidecar.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// Log in with a stored cookie.
    LoginCookie {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        proxy: Option<String>,
        imei: String,
        cookie: serde_json::Value,
        #[serde(rename = "userAgent")]
        user_agent: String,
    },
    /// Start a QR login. The sidecar emits `qr` first and answers the request
    /// once the code has been scanned.
    LoginQr {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        proxy: Option<String>,
    },
    FetchAccountInfo {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Current `{imei, cookie, userAgent}` of a session.
    GetContext {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Run an account action such as sending a message or looking up a
    /// user. The reply carries the platform's result as `data`.
    Action {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        action: AccountAction,
    },
    StartListener {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Stop {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl GatewayMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::LoginCookie { request_id, .. }
            | Self::LoginQr { request_id, .. }
            | Self::FetchAccountInfo { request_id, .. }
            | Self::GetContext { request_id, .. }
            | Self::Action { request_id, .. } => Some(request_id),
            Self::StartListener { .. } | Self::Stop { .. } => None,
        }
    }
}

/// Messages received from the sidecar.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarMessage {
    Qr {
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Base64 PNG, without the `data:` prefix.
        image: String,
    },
    Response {
        #[serde(rename = "requestId")]
        request_id: String,
        ok: bool,
        #[serde(default)]
        data: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Push event of a listening session.
    Event {
        #[serde(rename = "sessionId")]
        session_id: String,
        kind: String,
        data: serde_json::Value,
    },
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Closed {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        code: Option<i64>,
        #[serde(default)]
        reason: Option<String>,
    },
    Error {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
        error: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn login_cookie_wire_format() {
        let msg = GatewayMessage::LoginCookie {
            request_id: "r1".into(),
            session_id: "s1".into(),
            proxy: None,
            imei: "imei".into(),
            cookie: json!([]),
            user_agent: "ua".into(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "login_cookie",
                "requestId": "r1",
                "sessionId": "s1",
                "imei": "imei",
                "cookie": [],
                "userAgent": "ua"
            })
        );
        assert_eq!(msg.request_id(), Some("r1"));
    }

    #[test]
    fn action_wire_format() {
        let msg = GatewayMessage::Action {
            request_id: "r2".into(),
            session_id: "s1".into(),
            action: AccountAction::AddGroupMember {
                group_id: "g1".into(),
                member_id: "m1".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "action",
                "requestId": "r2",
                "sessionId": "s1",
                "action": {"kind": "add_group_member", "groupId": "g1", "memberId": "m1"}
            })
        );
        assert_eq!(msg.request_id(), Some("r2"));
    }

    #[test]
    fn parses_sidecar_messages() {
        let msg: SidecarMessage = serde_json::from_value(json!({
            "type": "closed",
            "sessionId": "s1",
            "code": 1000
        }))
        .unwrap();
        assert!(matches!(
            msg,
            SidecarMessage::Closed { code: Some(1000), reason: None, .. }
        ));

        let msg: SidecarMessage = serde_json::from_value(json!({
            "type": "response",
            "requestId": "r1",
            "ok": false,
            "error": "cookie expired"
        }))
        .unwrap();
        assert!(matches!(
            msg,
            SidecarMessage::Response { ok: false, error: Some(ref e), .. } if e == "cookie expired"
        ));
    }
}
