//! MQ Light messaging client core
//!
//! An asynchronous publish/subscribe client that drives a poll-based AMQP
//! messenger engine. The crate provides:
//! - a connection state machine with observable transitions
//! - subscribe and unsubscribe with shared and private destinations
//! - at-most-once and at-least-once send
//! - message delivery with confirmation and link credit replenishment
//! - a [`transport::Messenger`] seam and an in-memory mock for tests
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqlight::{callback, Client, ClientEvent, ClientOptions};
//! use mqlight::testing::MockMessenger;
//!
//! # tokio_test::block_on(async {
//! let client = Client::new(ClientOptions::new("amqp://localhost"), MockMessenger::new())?;
//! let mut events = client.events();
//!
//! client.connect_with(|client, result| {
//!     if result.is_ok() {
//!         let _ = client.subscribe(vec![
//!             "/sports/#".into(),
//!             callback(|_, result| println!("{result:?}")),
//!         ]);
//!     }
//! })?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let ClientEvent::Message(delivery) = event {
//!         println!("{}: {:?}", delivery.topic, delivery.body);
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod testing;
pub mod transport;

pub use client::{
    callback, Arg, Client, ClientEvent, ClientState, Delivery, SendOptions, SentMessage,
    SubscribeOptions, Subscription, SubscriptionArg, UnsubscribeOptions,
};
pub use config::{ClientOptions, ConfigError};
pub use error::{ClientError, ClientResult, ErrorKind};
pub use transport::{Body, Messenger, MessengerError, MessengerErrorKind, QoS};
