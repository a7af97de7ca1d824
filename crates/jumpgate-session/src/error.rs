// Client-visible error kinds
//
// Numeric codes are part of the wire contract and stay stable across
// versions. Each error carries a data map the localizer uses to render
// the message in the client's language.

use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    NoPermission,
    Unauthorized,
    InvalidSessionId,
    WrongPublicKey,
    HasDependency,
    ConnectServer,
    IdleTimeout,
    AccessTime,
    AdminClose,
    Internal,
}

impl ErrorCode {
    /// Stable numeric code.
    pub fn value(&self) -> u32 {
        match self {
            ErrorCode::InvalidArgument => 400,
            ErrorCode::NoPermission => 403,
            ErrorCode::Unauthorized => 401,
            ErrorCode::InvalidSessionId => 404,
            ErrorCode::WrongPublicKey => 405,
            ErrorCode::HasDependency => 406,
            ErrorCode::ConnectServer => 500,
            ErrorCode::IdleTimeout => 504,
            ErrorCode::AccessTime => 5041,
            ErrorCode::AdminClose => 5042,
            ErrorCode::Internal => 5000,
        }
    }

    /// Message catalog key.
    pub fn key(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::NoPermission => "no_permission",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::InvalidSessionId => "invalid_session_id",
            ErrorCode::WrongPublicKey => "wrong_public_key",
            ErrorCode::HasDependency => "has_dependency",
            ErrorCode::ConnectServer => "connect_server",
            ErrorCode::IdleTimeout => "idle_timeout",
            ErrorCode::AccessTime => "access_time",
            ErrorCode::AdminClose => "admin_close",
            ErrorCode::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ErrorCode,
    pub data: Map<String, Value>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fallback_message())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            data: Map::new(),
        }
    }

    pub fn with(code: ErrorCode, key: &str, value: impl Into<Value>) -> Self {
        let mut data = Map::new();
        data.insert(key.to_string(), value.into());
        Self { code, data }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::with(ErrorCode::Internal, "err", err.to_string())
    }

    pub fn connect_server(err: impl std::fmt::Display) -> Self {
        Self::with(ErrorCode::ConnectServer, "err", err.to_string())
    }

    /// English rendering used when no localizer is in play (logs, tests).
    pub fn fallback_message(&self) -> String {
        match self.code {
            ErrorCode::InvalidArgument => format!("invalid argument: {}", self.detail("err")),
            ErrorCode::NoPermission => format!("no permission: {}", self.detail("perm")),
            ErrorCode::Unauthorized => format!("unauthorized: {}", self.detail("perm")),
            ErrorCode::InvalidSessionId => {
                format!("invalid session id {}", self.detail("sessionId"))
            }
            ErrorCode::WrongPublicKey => "wrong public key".to_string(),
            ErrorCode::HasDependency => format!("resource in use by {}", self.detail("by")),
            ErrorCode::ConnectServer => format!("failed to connect server: {}", self.detail("err")),
            ErrorCode::IdleTimeout => {
                format!("closed due to idle timeout ({}s)", self.detail("second"))
            }
            ErrorCode::AccessTime => "access not allowed at this time".to_string(),
            ErrorCode::AdminClose => format!("closed by {}", self.detail("admin")),
            ErrorCode::Internal => format!("internal error: {}", self.detail("err")),
        }
    }

    fn detail(&self, key: &str) -> String {
        match self.data.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::IdleTimeout.value(), 504);
        assert_eq!(ErrorCode::AccessTime.value(), 5041);
        assert_eq!(ErrorCode::AdminClose.value(), 5042);
        assert_eq!(ErrorCode::ConnectServer.value(), 500);
    }

    #[test]
    fn test_admin_close_message_carries_admin() {
        let err = ApiError::with(ErrorCode::AdminClose, "admin", "alice");
        assert_eq!(err.to_string(), "closed by alice");
    }

    #[test]
    fn test_idle_timeout_message_carries_seconds() {
        let err = ApiError::with(ErrorCode::IdleTimeout, "second", 30);
        assert_eq!(err.to_string(), "closed due to idle timeout (30s)");
    }
}
