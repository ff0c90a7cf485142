//! Bounds on user-controlled sizes and strings
//!
//! Every request that carries one of these values checks it when the request
//! is constructed (or parsed off the wire), so nothing downstream of the
//! protocol layer has to re-validate.

use std::collections::HashMap;

use crate::error::ProtocolError;

/// Minimum terminal width in columns
pub const MIN_COLUMNS: u16 = 1;
/// Maximum terminal width in columns
pub const MAX_COLUMNS: u16 = 1000;
/// Minimum terminal height in rows
pub const MIN_ROWS: u16 = 1;
/// Maximum terminal height in rows
pub const MAX_ROWS: u16 = 500;

/// Maximum length of a session id
pub const MAX_SESSION_ID_LEN: usize = 256;
/// Maximum length of a shell path
pub const MAX_SHELL_PATH_LEN: usize = 1024;
/// Maximum length of a working directory
pub const MAX_WORKING_DIR_LEN: usize = 4096;
/// Maximum number of environment variables per request
pub const MAX_ENV_ENTRIES: usize = 100;
/// Maximum length of an environment variable name
pub const MAX_ENV_KEY_LEN: usize = 256;
/// Maximum length of an environment variable value
pub const MAX_ENV_VALUE_LEN: usize = 4096;
/// Maximum clipboard payload (1 MiB)
pub const MAX_CLIPBOARD_BYTES: usize = 1024 * 1024;
/// Maximum length of an authentication token
pub const MAX_TOKEN_LEN: usize = 1024;

pub fn validate_columns(columns: u16) -> Result<(), ProtocolError> {
    if !(MIN_COLUMNS..=MAX_COLUMNS).contains(&columns) {
        return Err(ProtocolError::invalid(
            "columns",
            format!("{} is outside {}..={}", columns, MIN_COLUMNS, MAX_COLUMNS),
        ));
    }
    Ok(())
}

pub fn validate_rows(rows: u16) -> Result<(), ProtocolError> {
    if !(MIN_ROWS..=MAX_ROWS).contains(&rows) {
        return Err(ProtocolError::invalid(
            "rows",
            format!("{} is outside {}..={}", rows, MIN_ROWS, MAX_ROWS),
        ));
    }
    Ok(())
}

pub fn validate_session_id(id: &str) -> Result<(), ProtocolError> {
    if id.is_empty() {
        return Err(ProtocolError::invalid("session_id", "must not be empty"));
    }
    check_len("session_id", id, MAX_SESSION_ID_LEN)
}

pub fn validate_shell_path(path: &str) -> Result<(), ProtocolError> {
    if path.is_empty() {
        return Err(ProtocolError::invalid("shell", "must not be empty"));
    }
    if path.contains('\0') {
        return Err(ProtocolError::invalid("shell", "contains a NUL byte"));
    }
    check_len("shell", path, MAX_SHELL_PATH_LEN)
}

pub fn validate_working_dir(dir: &str) -> Result<(), ProtocolError> {
    if dir.contains('\0') {
        return Err(ProtocolError::invalid("working_dir", "contains a NUL byte"));
    }
    check_len("working_dir", dir, MAX_WORKING_DIR_LEN)
}

pub fn validate_env(env: &HashMap<String, String>) -> Result<(), ProtocolError> {
    validate_env_entries(env.iter().map(|(k, v)| (k.as_str(), v.as_str())), env.len())
}

pub fn validate_env_pairs(env: &[(String, String)]) -> Result<(), ProtocolError> {
    validate_env_entries(env.iter().map(|(k, v)| (k.as_str(), v.as_str())), env.len())
}

fn validate_env_entries<'a>(
    entries: impl Iterator<Item = (&'a str, &'a str)>,
    count: usize,
) -> Result<(), ProtocolError> {
    if count > MAX_ENV_ENTRIES {
        return Err(ProtocolError::invalid(
            "env",
            format!("{} entries exceeds maximum of {}", count, MAX_ENV_ENTRIES),
        ));
    }
    for (key, value) in entries {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(ProtocolError::invalid(
                "env",
                format!("invalid variable name {:?}", key),
            ));
        }
        check_len("env", key, MAX_ENV_KEY_LEN)?;
        check_len("env", value, MAX_ENV_VALUE_LEN)?;
    }
    Ok(())
}

pub fn validate_clipboard(content: &str) -> Result<(), ProtocolError> {
    if content.len() > MAX_CLIPBOARD_BYTES {
        return Err(ProtocolError::invalid(
            "content",
            format!(
                "{} bytes exceeds maximum of {} bytes",
                content.len(),
                MAX_CLIPBOARD_BYTES
            ),
        ));
    }
    Ok(())
}

pub fn validate_token(token: &str) -> Result<(), ProtocolError> {
    check_len("token", token, MAX_TOKEN_LEN)
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ProtocolError> {
    let len = value.chars().count();
    if len > max {
        return Err(ProtocolError::invalid(
            field,
            format!("length {} exceeds maximum of {}", len, max),
        ));
    }
    Ok(())
}
