use serde_json::Value;

use crate::ipc::error::err;
use crate::store::Tree;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("bad_params", message)
}

pub fn conflict(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("conflict", message)
}

pub fn not_found(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("not_found", message)
}

pub fn store_read(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("store_read_failed", e.to_string())
}

pub fn store_write(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("store_write_failed", e.to_string())
}

/// Required, trimmed, non-empty string parameter.
pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    match get_optional_str(params, key) {
        Some(s) => Ok(s),
        None => Err(bad_params(format!("missing {}", key))),
    }
}

/// Trimmed string parameter; absent or blank both count as absent.
pub fn get_optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn get_str_or_default(params: &Value, key: &str) -> String {
    get_optional_str(params, key).unwrap_or_default()
}

pub const DEFAULT_PROFILE_IMAGE: &str = "/default-profile.png";

pub fn profile_image(params: &Value) -> String {
    get_optional_str(params, "profileImage").unwrap_or_else(|| DEFAULT_PROFILE_IMAGE.to_string())
}

/// Linear username scan over the Users accounts, the way the backing tree
/// is actually laid out (no secondary index).
pub fn username_taken(tree: &Tree, candidate: &str) -> Result<bool, HandlerErr> {
    for (_, user) in tree.children("Users").map_err(store_read)? {
        if user.get("username").and_then(|v| v.as_str()) == Some(candidate) {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
