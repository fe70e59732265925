//! Messenger transport seam
//!
//! The client core never speaks AMQP itself. It drives a [`Messenger`], the
//! capability set of the underlying messenger engine, and learns about
//! completion of network operations only by polling it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Kind of fault reported by the messenger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerErrorKind {
    /// Connectivity fault (broken socket, refused connection, lost link)
    Network,
    /// TLS trust or identity verification failure
    Security,
    /// The messenger rejected an argument (bad service, bad address)
    InvalidArgument,
    /// Anything else the engine reports
    Other,
}

/// Fault raised by a messenger call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct MessengerError {
    pub kind: MessengerErrorKind,
    pub message: String,
}

impl MessengerError {
    pub fn new<S: Into<String>>(kind: MessengerErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::new(MessengerErrorKind::Network, message)
    }

    pub fn security<S: Into<String>>(message: S) -> Self {
        Self::new(MessengerErrorKind::Security, message)
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::new(MessengerErrorKind::InvalidArgument, message)
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::new(MessengerErrorKind::Other, message)
    }
}

/// Quality of service for a link or a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QoS {
    /// Fire and forget
    #[default]
    AtMostOnce,
    /// Delivery is confirmed by the remote peer
    AtLeastOnce,
}

impl QoS {
    /// Numeric wire value (0 or 1)
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            _ => None,
        }
    }
}

/// Message payload
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Binary(Bytes),
    Json(serde_json::Value),
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Text(value.to_string())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Text(value)
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Body::Binary(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Binary(Bytes::from(value))
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Body::Json(value)
    }
}

/// Message handed to [`Messenger::put`]
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub address: String,
    pub body: Body,
    pub ttl: Option<Duration>,
}

/// Message returned by [`Messenger::receive`]
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Address of the link the message arrived on
    pub link_address: String,
    /// Address the message was originally sent to
    pub address: String,
    pub body: Body,
    pub tracker: Tracker,
}

/// Opaque handle the messenger uses to track a single delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tracker(pub u64);

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Settlement status of an outbound delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Unknown,
    Pending,
    Accepted,
    Rejected,
    Released,
    Modified,
    Aborted,
    Settled,
}

impl DeliveryStatus {
    /// True when the remote peer refused the delivery
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Rejected
                | DeliveryStatus::Released
                | DeliveryStatus::Modified
                | DeliveryStatus::Aborted
        )
    }
}

/// Capability set of the messenger engine consumed by the client core
///
/// Calls are non-blocking. Completion of connect, subscribe, unsubscribe,
/// send and stop is observed by repeatedly calling the matching predicate
/// until it returns `true` or fails.
pub trait Messenger: Send + 'static {
    /// Start connecting to `service`
    fn connect(
        &mut self,
        service: &Url,
        tls_trust_certificate: Option<&str>,
        tls_verify_name: bool,
    ) -> Result<(), MessengerError>;

    /// Poll predicate for connect completion
    fn connected(&mut self) -> Result<bool, MessengerError> {
        Ok(true)
    }

    fn subscribe(
        &mut self,
        address: &str,
        qos: QoS,
        ttl: Duration,
        credit: u32,
    ) -> Result<(), MessengerError>;

    /// Poll predicate for subscribe completion
    fn subscribed(&mut self, address: &str) -> Result<bool, MessengerError>;

    fn unsubscribe(&mut self, address: &str, ttl: Option<Duration>) -> Result<(), MessengerError>;

    /// Poll predicate for unsubscribe completion
    fn unsubscribed(&mut self, address: &str) -> Result<bool, MessengerError>;

    /// Queue a message for sending
    fn put(&mut self, message: &OutboundMessage, qos: QoS) -> Result<Tracker, MessengerError>;

    /// Push queued messages towards the network
    fn send(&mut self) -> Result<(), MessengerError>;

    fn status(&mut self, tracker: Tracker) -> Result<DeliveryStatus, MessengerError>;

    /// Poll predicate for outbound settlement
    fn settled(&mut self, tracker: Tracker) -> Result<bool, MessengerError>;

    /// Request shutdown; returns `true` once the messenger has stopped
    fn stop(&mut self) -> Result<bool, MessengerError>;

    /// Idle timeout negotiated by the remote peer, `None` when unknown
    fn remote_idle_timeout(&mut self, address: &str) -> Option<Duration>;

    /// Grant `credit` more messages to the link at `address`
    fn flow(&mut self, address: &str, credit: u32);

    fn receive(&mut self) -> Result<Vec<InboundMessage>, MessengerError>;

    fn accept(&mut self, tracker: Tracker) -> Result<(), MessengerError>;

    fn settle(&mut self, tracker: Tracker) -> Result<(), MessengerError>;

    /// Process pending protocol work, including keep-alive frames
    fn work(&mut self) -> Result<(), MessengerError>;
}

impl<M: Messenger + ?Sized> Messenger for Box<M> {
    fn connect(
        &mut self,
        service: &Url,
        tls_trust_certificate: Option<&str>,
        tls_verify_name: bool,
    ) -> Result<(), MessengerError> {
        (**self).connect(service, tls_trust_certificate, tls_verify_name)
    }

    fn connected(&mut self) -> Result<bool, MessengerError> {
        (**self).connected()
    }

    fn subscribe(
        &mut self,
        address: &str,
        qos: QoS,
        ttl: Duration,
        credit: u32,
    ) -> Result<(), MessengerError> {
        (**self).subscribe(address, qos, ttl, credit)
    }

    fn subscribed(&mut self, address: &str) -> Result<bool, MessengerError> {
        (**self).subscribed(address)
    }

    fn unsubscribe(&mut self, address: &str, ttl: Option<Duration>) -> Result<(), MessengerError> {
        (**self).unsubscribe(address, ttl)
    }

    fn unsubscribed(&mut self, address: &str) -> Result<bool, MessengerError> {
        (**self).unsubscribed(address)
    }

    fn put(&mut self, message: &OutboundMessage, qos: QoS) -> Result<Tracker, MessengerError> {
        (**self).put(message, qos)
    }

    fn send(&mut self) -> Result<(), MessengerError> {
        (**self).send()
    }

    fn status(&mut self, tracker: Tracker) -> Result<DeliveryStatus, MessengerError> {
        (**self).status(tracker)
    }

    fn settled(&mut self, tracker: Tracker) -> Result<bool, MessengerError> {
        (**self).settled(tracker)
    }

    fn stop(&mut self) -> Result<bool, MessengerError> {
        (**self).stop()
    }

    fn remote_idle_timeout(&mut self, address: &str) -> Option<Duration> {
        (**self).remote_idle_timeout(address)
    }

    fn flow(&mut self, address: &str, credit: u32) {
        (**self).flow(address, credit)
    }

    fn receive(&mut self) -> Result<Vec<InboundMessage>, MessengerError> {
        (**self).receive()
    }

    fn accept(&mut self, tracker: Tracker) -> Result<(), MessengerError> {
        (**self).accept(tracker)
    }

    fn settle(&mut self, tracker: Tracker) -> Result<(), MessengerError> {
        (**self).settle(tracker)
    }

    fn work(&mut self) -> Result<(), MessengerError> {
        (**self).work()
    }
}
