//! Subscription and send address construction
//!
//! Addresses have the form `<service>/share:<share>:<pattern>` for shared
//! subscriptions and `<service>/private:<pattern>` otherwise.

use crate::error::ClientError;

const SHARE_DELIMITER: char = ':';

/// Build the address of a subscription
///
/// `pattern` must be non-empty and `share`, when present, must not contain
/// the `:` delimiter.
pub fn build_address(service: &str, pattern: &str, share: Option<&str>) -> Result<String, ClientError> {
    validate_pattern(pattern)?;
    let scope = match share {
        Some(share) => {
            validate_share(share)?;
            format!("share:{share}:")
        }
        None => "private:".to_string(),
    };
    Ok(format!("{}/{scope}{pattern}", trim_service(service)))
}

/// Build the address messages for `topic` are sent to
pub fn build_send_address(service: &str, topic: &str) -> Result<String, ClientError> {
    if topic.is_empty() {
        return Err(ClientError::validation("Cannot send to an empty topic"));
    }
    Ok(format!("{}/{topic}", trim_service(service)))
}

pub fn validate_pattern(pattern: &str) -> Result<(), ClientError> {
    if pattern.is_empty() {
        return Err(ClientError::validation("Cannot subscribe to an empty pattern"));
    }
    Ok(())
}

pub fn validate_share(share: &str) -> Result<(), ClientError> {
    if share.contains(SHARE_DELIMITER) {
        return Err(ClientError::validation(format!(
            "Share name '{share}' must not contain the '{SHARE_DELIMITER}' character"
        )));
    }
    Ok(())
}

fn trim_service(service: &str) -> &str {
    service.strip_suffix('/').unwrap_or(service)
}
