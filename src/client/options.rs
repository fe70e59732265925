//! Typed operation options
//!
//! Subscribe and unsubscribe accept options as a key/value map so they can be
//! classified by the argument resolver; this module turns such maps into
//! typed values and rejects bad ones.

use crate::error::ClientError;
use crate::transport::QoS;
use serde_json::{Map, Value};
use std::time::Duration;

/// Default link credit for a subscription
pub const DEFAULT_CREDIT: u32 = 1024;

/// Options for [`crate::Client::subscribe`]
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOptions {
    pub qos: QoS,
    /// Confirm at-least-once deliveries as soon as they are emitted
    pub auto_confirm: bool,
    /// How long the server keeps the destination after the last subscriber leaves
    pub ttl: Duration,
    /// Messages the server may deliver before credit is replenished
    pub credit: u32,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            auto_confirm: true,
            ttl: Duration::ZERO,
            credit: DEFAULT_CREDIT,
        }
    }
}

impl SubscribeOptions {
    /// Parse recognised keys from `map`; unknown keys are ignored
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, ClientError> {
        let mut options = Self::default();

        if let Some(value) = map.get("qos") {
            options.qos = parse_qos(value)?;
        }
        if let Some(value) = map.get("autoConfirm").or_else(|| map.get("auto_confirm")) {
            options.auto_confirm = value.as_bool().ok_or_else(|| {
                ClientError::validation(format!("autoConfirm must be a boolean, got {value}"))
            })?;
        }
        if let Some(value) = map.get("ttl") {
            options.ttl = parse_ttl(value)?;
        }
        if let Some(value) = map.get("credit") {
            options.credit = value
                .as_u64()
                .and_then(|credit| u32::try_from(credit).ok())
                .ok_or_else(|| {
                    ClientError::validation(format!(
                        "credit must be a non-negative integer, got {value}"
                    ))
                })?;
        }

        if options.qos == QoS::AtMostOnce && !options.auto_confirm {
            return Err(ClientError::validation(
                "autoConfirm cannot be false for at-most-once subscriptions",
            ));
        }

        Ok(options)
    }
}

/// Options for [`crate::Client::unsubscribe`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnsubscribeOptions {
    /// Only a ttl of zero (discard the destination now) is allowed
    pub ttl: Option<Duration>,
}

impl UnsubscribeOptions {
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, ClientError> {
        match map.get("ttl") {
            None => Ok(Self::default()),
            Some(value) => {
                let ttl = parse_ttl(value)?;
                if !ttl.is_zero() {
                    return Err(ClientError::validation(format!(
                        "unsubscribe ttl must be 0, got {value}"
                    )));
                }
                Ok(Self { ttl: Some(ttl) })
            }
        }
    }
}

/// Options for [`crate::Client::send`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub qos: QoS,
    /// Time to live of the message
    pub ttl: Option<Duration>,
}

impl SendOptions {
    pub fn at_least_once() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self, ClientError> {
        let mut options = Self::default();
        if let Some(value) = map.get("qos") {
            options.qos = parse_qos(value)?;
        }
        if let Some(value) = map.get("ttl") {
            let ttl = parse_ttl(value)?;
            if ttl.is_zero() {
                return Err(ClientError::validation("message ttl must be greater than 0"));
            }
            options.ttl = Some(ttl);
        }
        Ok(options)
    }
}

fn parse_qos(value: &Value) -> Result<QoS, ClientError> {
    value
        .as_u64()
        .and_then(|qos| u8::try_from(qos).ok())
        .and_then(QoS::from_u8)
        .ok_or_else(|| ClientError::validation(format!("qos must be 0 or 1, got {value}")))
}

/// Milliseconds; fractional values are rounded
fn parse_ttl(value: &Value) -> Result<Duration, ClientError> {
    match value.as_f64() {
        Some(ms) if ms >= 0.0 && ms.is_finite() => Ok(Duration::from_millis(ms.round() as u64)),
        _ => Err(ClientError::validation(format!(
            "ttl must be a non-negative number, got {value}"
        ))),
    }
}
