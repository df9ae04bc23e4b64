use serde::{Deserialize, Serialize};
use std::fmt;

/// Device status category, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    Ok,
    Warn,
    Busy,
    NotReached,
    Disabled,
    Error,
    Unknown,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::Warn => "WARN",
            StatusCode::Busy => "BUSY",
            StatusCode::NotReached => "NOTREACHED",
            StatusCode::Disabled => "DISABLED",
            StatusCode::Error => "ERROR",
            StatusCode::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Status as stored under `<device>/status`: a code plus a free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub text: String,
}

impl Status {
    pub fn new(code: StatusCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn ok(text: impl Into<String>) -> Self {
        Self::new(StatusCode::Ok, text)
    }

    pub fn busy(text: impl Into<String>) -> Self {
        Self::new(StatusCode::Busy, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(StatusCode::Error, text)
    }

    pub fn is_busy(&self) -> bool {
        self.code == StatusCode::Busy
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_json_shape() {
        let status = Status::busy("moving to 5");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({"code": "busy", "text": "moving to 5"}));
        assert!(StatusCode::Error > StatusCode::Busy);
        assert_eq!(status.to_string(), "BUSY: moving to 5");
    }
}
