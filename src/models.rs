// Data model for the Infinichat protocol
// Wire descriptions, entity snapshots, font options, and reply codes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A user's standing relative to the local account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRelation {
    Friend,
    PendingFriend,
    Me,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UserStatus {
    Available,
    Away,
    Busy,
    Offline,
    Unknown,
}

impl UserStatus {
    /// Anything the client does not recognize maps to `Unknown` rather than
    /// failing the surrounding description.
    pub fn from_name(raw: &str) -> UserStatus {
        match raw {
            "Available" => UserStatus::Available,
            "Away" => UserStatus::Away,
            "Busy" => UserStatus::Busy,
            "Offline" => UserStatus::Offline,
            _ => UserStatus::Unknown,
        }
    }
}

impl<'de> Deserialize<'de> for UserStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(UserStatus::from_name(&raw))
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UserStatus::Available => "Available",
            UserStatus::Away => "Away",
            UserStatus::Busy => "Busy",
            UserStatus::Offline => "Offline",
            UserStatus::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Text style flags carried with every chat message.
///
/// The wire form is a string of style letters (`b`, `i`, `u`) in any order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FontStyle {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
}

impl FontStyle {
    pub fn to_wire(&self) -> String {
        let mut s = String::new();
        if self.bold {
            s.push('b');
        }
        if self.italic {
            s.push('i');
        }
        if self.underline {
            s.push('u');
        }
        s
    }

    /// Decoding is order-independent; unknown letters are ignored.
    pub fn from_wire(raw: &str) -> Self {
        FontStyle {
            bold: raw.contains('b'),
            italic: raw.contains('i'),
            underline: raw.contains('u'),
        }
    }
}

/// An RGB color, written on the wire as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn parse_hex(raw: &str) -> Option<Rgb> {
        let digits = raw.strip_prefix('#')?;
        if digits.len() != 6 {
            return None;
        }
        let r = u8::from_str_radix(&digits[0..2], 16).ok()?;
        let g = u8::from_str_radix(&digits[2..4], 16).ok()?;
        let b = u8::from_str_radix(&digits[4..6], 16).ok()?;
        Some(Rgb { r, g, b })
    }
}

/// Font settings attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontOptions {
    pub family: String,
    pub color: Rgb,
    pub style: FontStyle,
}

impl Default for FontOptions {
    fn default() -> Self {
        FontOptions {
            family: "Segoe UI".to_string(),
            color: Rgb::BLACK,
            style: FontStyle::default(),
        }
    }
}

impl FontOptions {
    pub fn to_wire(&self) -> Value {
        json!({
            "family": self.family,
            "color": self.color.to_hex(),
            "style": self.style.to_wire(),
        })
    }

    /// Missing or malformed fields fall back to defaults rather than failing
    /// the whole message; an unparseable color becomes black.
    pub fn from_wire(raw: &Value) -> FontOptions {
        let family = raw
            .get("family")
            .and_then(Value::as_str)
            .unwrap_or("Segoe UI")
            .to_string();
        let color = raw
            .get("color")
            .and_then(Value::as_str)
            .and_then(Rgb::parse_hex)
            .unwrap_or(Rgb::BLACK);
        let style = raw
            .get("style")
            .and_then(Value::as_str)
            .map(FontStyle::from_wire)
            .unwrap_or_default();
        FontOptions { family, color, style }
    }
}

/// Server-sent description of a user, as carried by `detail.users` and the
/// `me` field of the login reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDescription {
    #[serde(rename = "username")]
    pub name: String,
    pub display_name: String,
    pub status: UserStatus,
    #[serde(default)]
    pub friend: Option<bool>,
}

/// Server-sent description of a group, as carried by `detail.groups`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDescription {
    #[serde(rename = "groupname")]
    pub name: String,
    pub display_name: String,
    #[serde(rename = "members", default)]
    pub member_names: Vec<String>,
    #[serde(default)]
    pub member: Option<bool>,
}

/// A user as currently known to the session.
///
/// The session's entity cache owns the authoritative copy; values handed out
/// through events and accessors are point-in-time snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub display_name: String,
    pub status: UserStatus,
    pub relation: UserRelation,
}

impl User {
    /// A placeholder for a name seen in chat traffic but never detailed by
    /// the server.
    pub fn ghost(name: &str) -> User {
        User {
            name: name.to_string(),
            display_name: name.to_string(),
            status: UserStatus::Unknown,
            relation: UserRelation::None,
        }
    }

    pub(crate) fn apply(&mut self, description: &UserDescription, me_name: Option<&str>) {
        self.name = description.name.clone();
        self.display_name = description.display_name.clone();
        self.status = description.status;
        self.relation = if description.friend.unwrap_or(false) {
            UserRelation::Friend
        } else if me_name == Some(description.name.as_str()) {
            UserRelation::Me
        } else {
            UserRelation::None
        };
    }
}

/// A group as currently known to the session. Members are user names which
/// resolve through the session's user cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub display_name: String,
    pub members: Vec<String>,
    pub joined: bool,
}

/// A contact a conversation can be held with.
#[derive(Debug, Clone)]
pub enum Contact {
    User(User),
    Group(Group),
}

impl Contact {
    pub fn name(&self) -> &str {
        match self {
            Contact::User(user) => &user.name,
            Contact::Group(group) => &group.name,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Contact::User(user) => &user.display_name,
            Contact::Group(group) => &group.display_name,
        }
    }
}

/// A single chat message, inbound or locally echoed.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub sender: User,
    pub font: FontOptions,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Reply codes. Codes in the 100s are client-defined for client use only and
/// never appear on the wire; 200s are success, 400s client error, 500s
/// server error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    NotSent = 100,
    NoReply = 101,
    BadMessage = 102,

    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,
    ResetContent = 205,
    PartialContent = 206,

    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,

    InternalError = 500,
    NotImplemented = 501,
    ServiceUnavailable = 503,
    VersionUnsupported = 505,
}

impl ResultCode {
    pub fn from_code(code: i64) -> Option<ResultCode> {
        let known = match code {
            100 => ResultCode::NotSent,
            101 => ResultCode::NoReply,
            102 => ResultCode::BadMessage,
            200 => ResultCode::Ok,
            201 => ResultCode::Created,
            202 => ResultCode::Accepted,
            204 => ResultCode::NoContent,
            205 => ResultCode::ResetContent,
            206 => ResultCode::PartialContent,
            400 => ResultCode::BadRequest,
            401 => ResultCode::Unauthorized,
            403 => ResultCode::Forbidden,
            404 => ResultCode::NotFound,
            500 => ResultCode::InternalError,
            501 => ResultCode::NotImplemented,
            503 => ResultCode::ServiceUnavailable,
            505 => ResultCode::VersionUnsupported,
            _ => return None,
        };
        Some(known)
    }
}

/// The outcome of one request/reply round trip. Synthetic replies (raw code
/// in the 100s) mean the client never heard back, as opposed to the server
/// saying no.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: i64,
    pub result: Option<ResultCode>,
    pub message: String,
    pub payload: Option<Value>,
}

impl Reply {
    pub fn success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn synthetic(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub(crate) fn from_payload(payload: Value) -> Reply {
        let code = payload.get("result").and_then(Value::as_i64).unwrap_or(0);
        let message = payload
            .get("result_message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Reply {
            code,
            result: ResultCode::from_code(code),
            message,
            payload: Some(payload),
        }
    }

    pub(crate) fn local(code: ResultCode, message: &str) -> Reply {
        Reply {
            code: code as i64,
            result: Some(code),
            message: message.to_string(),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn font_style_round_trips() {
        let all = FontStyle { bold: true, italic: true, underline: true };
        assert_eq!(FontStyle::from_wire(&all.to_wire()), all);

        let some = FontStyle { bold: true, italic: false, underline: true };
        assert_eq!(FontStyle::from_wire(&some.to_wire()), some);

        assert_eq!(FontStyle::from_wire(""), FontStyle::default());
    }

    #[test]
    fn font_style_decoding_is_order_independent() {
        let expected = FontStyle { bold: true, italic: false, underline: true };
        assert_eq!(FontStyle::from_wire("bu"), expected);
        assert_eq!(FontStyle::from_wire("ub"), expected);
        assert_eq!(FontStyle::from_wire("uxb"), expected);
    }

    #[test]
    fn rgb_hex_round_trips() {
        let color = Rgb { r: 0x12, g: 0xab, b: 0xff };
        assert_eq!(Rgb::parse_hex(&color.to_hex()), Some(color));
        assert_eq!(Rgb::parse_hex("#000000"), Some(Rgb::BLACK));
        assert_eq!(Rgb::parse_hex("123456"), None);
        assert_eq!(Rgb::parse_hex("#12345"), None);
        assert_eq!(Rgb::parse_hex("#1234zz"), None);
    }

    #[test]
    fn font_options_round_trip_through_wire_form() {
        let font = FontOptions {
            family: "Consolas".to_string(),
            color: Rgb { r: 255, g: 0, b: 128 },
            style: FontStyle { bold: false, italic: true, underline: true },
        };
        let decoded = FontOptions::from_wire(&font.to_wire());
        assert_eq!(decoded, font);
    }

    #[test]
    fn malformed_font_falls_back_to_defaults() {
        let decoded = FontOptions::from_wire(&json!({ "color": "notacolor" }));
        assert_eq!(decoded.color, Rgb::BLACK);
        assert_eq!(decoded.family, "Segoe UI");
        assert_eq!(decoded.style, FontStyle::default());
    }

    #[test]
    fn user_description_parses_login_shape() {
        let description: UserDescription = serde_json::from_value(json!({
            "username": "alice",
            "display_name": "Alice",
            "status": "Available",
            "friend": false,
        }))
        .unwrap();
        assert_eq!(description.name, "alice");
        assert_eq!(description.status, UserStatus::Available);
        assert_eq!(description.friend, Some(false));
    }

    #[test]
    fn unknown_status_deserializes_to_unknown() {
        let status: UserStatus = serde_json::from_value(json!("OnVacation")).unwrap();
        assert_eq!(status, UserStatus::Unknown);
    }

    #[test]
    fn result_codes_map_from_raw() {
        assert_eq!(ResultCode::from_code(200), Some(ResultCode::Ok));
        assert_eq!(ResultCode::from_code(101), Some(ResultCode::NoReply));
        assert_eq!(ResultCode::from_code(418), None);
    }

    #[test]
    fn reply_success_is_the_200_range() {
        assert!(Reply::from_payload(json!({"result": 204, "result_message": ""})).success());
        assert!(!Reply::from_payload(json!({"result": 401, "result_message": "no"})).success());
        let local = Reply::local(ResultCode::NoReply, "timed out");
        assert!(!local.success());
        assert!(local.synthetic());
    }
}
