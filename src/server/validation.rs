use crate::server::response::ApiError;

const MAX_STACK_NAME_LEN: usize = 128;
const MAX_SERVER_NAME_LEN: usize = 64;
const MAX_USERNAME_LEN: usize = 64;
const MAX_PATTERN_LEN: usize = 128;
const MIN_PASSWORD_LEN: usize = 8;

fn is_valid_name_char(c: char, allow_period: bool) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || (allow_period && c == '.')
}

fn validate_name(
    name: &str,
    entity: &str,
    max_len: usize,
    allow_period: bool,
    forbid_leading_special: bool,
) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("{entity} name cannot be empty"));
    }
    if name.len() > max_len {
        return Err(format!("{entity} name cannot exceed {max_len} characters"));
    }
    if !name.chars().all(|c| is_valid_name_char(c, allow_period)) {
        let mut allowed = "alphanumeric characters, hyphens, and underscores".to_string();
        if allow_period {
            allowed.push_str(", and periods");
        }
        return Err(format!("{entity} name can only contain {allowed}"));
    }
    if forbid_leading_special && (name.starts_with('-') || name.starts_with('_')) {
        return Err(format!(
            "{entity} name cannot start with a hyphen or underscore"
        ));
    }
    Ok(())
}

/// Stack names come from compose project directories and may contain periods.
pub fn validate_stack_name(name: &str) -> Result<(), ApiError> {
    validate_name(name, "Stack", MAX_STACK_NAME_LEN, true, false).map_err(ApiError::bad_request)
}

pub fn validate_server_name(name: &str) -> Result<(), ApiError> {
    validate_name(name, "Server", MAX_SERVER_NAME_LEN, true, true).map_err(ApiError::bad_request)
}

pub fn validate_username(name: &str) -> Result<(), ApiError> {
    validate_name(name, "User", MAX_USERNAME_LEN, true, true).map_err(ApiError::bad_request)
}

/// Patterns are stack names with `*` wildcards.
pub fn validate_stack_pattern(pattern: &str) -> Result<(), ApiError> {
    if pattern.is_empty() {
        return Err(ApiError::bad_request("Stack pattern cannot be empty"));
    }
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(ApiError::bad_request(format!(
            "Stack pattern cannot exceed {MAX_PATTERN_LEN} characters"
        )));
    }
    if !pattern
        .chars()
        .all(|c| c == '*' || is_valid_name_char(c, true))
    {
        return Err(ApiError::bad_request(
            "Stack pattern can only contain stack name characters and '*'",
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}
