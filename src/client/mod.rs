//! Messaging client facade
//!
//! [`Client`] is the handle applications hold. It composes the argument
//! resolver, the address builder, the connection state machine and the poll
//! engine into connect, disconnect, subscribe, unsubscribe and send.
//!
//! # Architecture
//!
//! - [`args`] - classification of dynamically typed subscribe arguments
//! - [`address`] - subscription and send address construction
//! - [`options`] - typed subscribe, unsubscribe and send options
//! - [`poll`] - retry-until-settled combinator shared by every operation
//! - [`state`] - connection lifecycle state machine
//!
//! Validation and state errors are returned from the call itself. Network
//! and security errors arrive later, through the operation's callback or,
//! when no callback was given, as a [`ClientEvent::Error`].
//!
//! Every completion callback takes two parameters: the client the operation
//! was issued on and the operation's result.
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqlight::client::{callback, Client};
//! use mqlight::config::ClientOptions;
//! use mqlight::testing::MockMessenger;
//!
//! # tokio_test::block_on(async {
//! let client = Client::new(ClientOptions::new("amqp://localhost:5672"), MockMessenger::new())?;
//! client.connect_with(|client, result| {
//!     if result.is_ok() {
//!         let _ = client.subscribe(vec![
//!             "/news/#".into(),
//!             "workers".into(),
//!             callback(|_, result| println!("subscribed: {result:?}")),
//!         ]);
//!     }
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod address;
pub mod args;
pub mod options;
pub mod poll;
pub mod state;

pub use address::{build_address, build_send_address};
pub use args::{resolve, Arg, SubscriptionRequest};
pub use options::{SendOptions, SubscribeOptions, UnsubscribeOptions};
pub use poll::{poll_until_settled, poll_until_settled_then, OperationKind, PendingOperation};
pub use state::{ClientState, ConnectionStateMachine, StateEvent};

use crate::{client_span, messenger_span};
use crate::config::{generate_client_id, ClientOptions, ConfigError};
use crate::error::{ClientError, ClientResult};
use crate::transport::{
    Body, DeliveryStatus, InboundMessage, Messenger, MessengerError, MessengerErrorKind,
    OutboundMessage, QoS, Tracker,
};
use state::{ConnectDecision, DisconnectDecision};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn, Instrument};
use url::Url;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const MIN_RECEIVE_INTERVAL: Duration = Duration::from_millis(1);

/// Completion callback for connect and disconnect
pub type ConnectCallback = Box<dyn FnOnce(&Client, Result<(), ClientError>) + Send>;

/// Completion callback for subscribe and unsubscribe
pub type SubscriptionCallback = Box<dyn FnOnce(&Client, Result<Subscription, ClientError>) + Send>;

/// Completion callback for send
pub type SendCallback = Box<dyn FnOnce(&Client, Result<SentMessage, ClientError>) + Send>;

/// Argument accepted by [`Client::subscribe`] and [`Client::unsubscribe`]
pub type SubscriptionArg = Arg<SubscriptionCallback>;

/// Wrap a closure as the callback argument of subscribe or unsubscribe
pub fn callback<F>(f: F) -> SubscriptionArg
where
    F: FnOnce(&Client, Result<Subscription, ClientError>) + Send + 'static,
{
    Arg::callback(Box::new(f))
}

/// A subscription as seen by completion callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub address: String,
    pub pattern: String,
    pub share: Option<String>,
}

/// A message accepted by the messenger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub topic: String,
    pub address: String,
    pub qos: QoS,
}

/// A message received on one of the client's subscriptions
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub body: Body,
    pub topic: String,
    pub pattern: Option<String>,
    pub share: Option<String>,
    pub qos: QoS,
    pub link_address: String,
    confirmation: Option<Tracker>,
}

impl Delivery {
    /// True when [`Client::confirm`] has to be called for this delivery
    pub fn needs_confirmation(&self) -> bool {
        self.confirmation.is_some()
    }
}

/// Events emitted by a client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// An asynchronous failure no callback was registered for
    Error(ClientError),
    Message(Delivery),
}

struct ActiveSubscription {
    subscription: Subscription,
    options: SubscribeOptions,
    /// Deliveries consumed since credit was last replenished
    consumed: u32,
}

#[derive(Default)]
struct Registry {
    connect_waiters: Vec<ConnectCallback>,
    disconnect_waiters: Vec<ConnectCallback>,
    subscribing: HashMap<String, Vec<Option<SubscriptionCallback>>>,
    unsubscribing: HashMap<String, Vec<Option<SubscriptionCallback>>>,
    subscriptions: HashMap<String, ActiveSubscription>,
    unconfirmed: HashMap<Tracker, String>,
}

struct ClientInner {
    id: String,
    service: String,
    service_url: Url,
    options: ClientOptions,
    state: ConnectionStateMachine,
    messenger: Mutex<Box<dyn Messenger>>,
    registry: Mutex<Registry>,
    events: broadcast::Sender<ClientEvent>,
}

/// Handle to a messaging client
///
/// Cloning is cheap; clones share the same connection. Operations spawn
/// Tokio tasks, so they must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("service", &self.inner.service)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Client {
    /// Create a disconnected client that owns `messenger`
    pub fn new<M: Messenger>(options: ClientOptions, messenger: M) -> Result<Self, ConfigError> {
        let service_url = options.validate()?;
        let id = options.id.clone().unwrap_or_else(generate_client_id);
        let service = options.service.trim_end_matches('/').to_string();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(client_id = %id, %service, "Created client");

        Ok(Self {
            inner: Arc::new(ClientInner {
                id,
                service,
                service_url,
                options,
                state: ConnectionStateMachine::new(),
                messenger: Mutex::new(Box::new(messenger)),
                registry: Mutex::new(Registry::default()),
                events,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn state(&self) -> ClientState {
        self.inner.state.state()
    }

    /// Receiver notified on every state transition
    ///
    /// A reconnect policy can watch this for `Disconnected` and call
    /// [`Client::connect`] again.
    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Settled subscriptions, ordered by address
    ///
    /// A lost connection keeps the list as it was, so after a reconnect it
    /// can name links the new connection does not have. Only
    /// [`Client::disconnect`] clears it.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let registry = self.registry();
        let mut subscriptions: Vec<_> = registry
            .subscriptions
            .values()
            .map(|active| active.subscription.clone())
            .collect();
        subscriptions.sort_by(|a, b| a.address.cmp(&b.address));
        subscriptions
    }

    /// Connect; failures are emitted as [`ClientEvent::Error`]
    pub fn connect(&self) -> ClientResult<&Self> {
        self.start_connect(None)
    }

    /// Connect and call `callback` once the connection is established or fails
    ///
    /// Calling this while connected runs the callback with success; calling
    /// it while a connect is in flight attaches the callback to that attempt.
    pub fn connect_with<F>(&self, callback: F) -> ClientResult<&Self>
    where
        F: FnOnce(&Client, Result<(), ClientError>) + Send + 'static,
    {
        self.start_connect(Some(Box::new(callback)))
    }

    pub fn disconnect(&self) -> &Self {
        self.start_disconnect(None)
    }

    /// Disconnect and call `callback` once the messenger has stopped
    pub fn disconnect_with<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&Client, Result<(), ClientError>) + Send + 'static,
    {
        self.start_disconnect(Some(Box::new(callback)))
    }

    /// Subscribe to `(pattern, [share], [options], [callback])`
    ///
    /// Returns the client for chaining. Argument, state and address problems
    /// are returned immediately and nothing reaches the messenger. A
    /// subscribe to an address whose subscribe is already in flight joins
    /// that operation.
    pub fn subscribe<I>(&self, args: I) -> ClientResult<&Self>
    where
        I: IntoIterator<Item = SubscriptionArg>,
    {
        let request = args::resolve("subscribe", args)?;
        let options = match &request.options {
            Some(map) => SubscribeOptions::from_map(map)?,
            None => SubscribeOptions::default(),
        };
        self.inner.state.require_connected("subscribe")?;
        let address = build_address(&self.inner.service, &request.pattern, request.share.as_deref())?;

        let subscription = Subscription {
            address: address.clone(),
            pattern: request.pattern,
            share: request.share,
        };

        {
            let mut registry = self.registry();
            if let Some(waiters) = registry.subscribing.get_mut(&address) {
                debug!(%address, "Joining subscribe already in flight");
                waiters.push(request.callback);
                return Ok(self);
            }
            registry
                .subscribing
                .insert(address.clone(), vec![request.callback]);
        }

        debug!(%address, qos = options.qos.as_u8(), credit = options.credit, "Subscribing");
        let started = self.with_messenger(|messenger| {
            messenger.subscribe(&address, options.qos, options.ttl, options.credit)
        });
        if let Err(e) = &started {
            self.observe_fault(e);
        }

        let client = self.clone();
        let span = client_span!(client_id = %self.id(), operation = "subscribe");
        tokio::spawn(
            async move {
                let result = match started {
                    Ok(()) => {
                        poll_until_settled(OperationKind::Subscribe, client.poll_interval(), || {
                            client.poll_step(OperationKind::Subscribe, ClientState::Connected, |m| {
                                m.subscribed(&subscription.address)
                            })
                        })
                        .await
                    }
                    Err(e) => Err(e.into()),
                };
                client.finish_subscribe(subscription, options, result);
            }
            .instrument(span),
        );

        Ok(self)
    }

    /// Unsubscribe from `(pattern, [share], [options], [callback])`
    ///
    /// The address must belong to a settled subscription.
    pub fn unsubscribe<I>(&self, args: I) -> ClientResult<&Self>
    where
        I: IntoIterator<Item = SubscriptionArg>,
    {
        let request = args::resolve("unsubscribe", args)?;
        let options = match &request.options {
            Some(map) => UnsubscribeOptions::from_map(map)?,
            None => UnsubscribeOptions::default(),
        };
        self.inner.state.require_connected("unsubscribe")?;
        let address = build_address(&self.inner.service, &request.pattern, request.share.as_deref())?;

        let subscription = Subscription {
            address: address.clone(),
            pattern: request.pattern,
            share: request.share,
        };

        {
            let mut registry = self.registry();
            if let Some(waiters) = registry.unsubscribing.get_mut(&address) {
                debug!(%address, "Joining unsubscribe already in flight");
                waiters.push(request.callback);
                return Ok(self);
            }
            if !registry.subscriptions.contains_key(&address) {
                return Err(ClientError::validation(format!(
                    "client is not subscribed to pattern '{}'{}",
                    subscription.pattern,
                    subscription
                        .share
                        .as_ref()
                        .map(|share| format!(" with share '{share}'"))
                        .unwrap_or_default()
                )));
            }
            registry
                .unsubscribing
                .insert(address.clone(), vec![request.callback]);
        }

        debug!(%address, "Unsubscribing");
        let started = self.with_messenger(|messenger| messenger.unsubscribe(&address, options.ttl));
        if let Err(e) = &started {
            self.observe_fault(e);
        }

        let client = self.clone();
        let span = client_span!(client_id = %self.id(), operation = "unsubscribe");
        tokio::spawn(
            async move {
                let result = match started {
                    Ok(()) => {
                        poll_until_settled(OperationKind::Unsubscribe, client.poll_interval(), || {
                            client.poll_step(OperationKind::Unsubscribe, ClientState::Connected, |m| {
                                m.unsubscribed(&subscription.address)
                            })
                        })
                        .await
                    }
                    Err(e) => Err(e.into()),
                };
                client.finish_unsubscribe(subscription, result);
            }
            .instrument(span),
        );

        Ok(self)
    }

    /// Send `body` to `topic`; failures are emitted as [`ClientEvent::Error`]
    pub fn send<B: Into<Body>>(&self, topic: &str, body: B, options: SendOptions) -> ClientResult<&Self> {
        self.start_send(topic, body.into(), options, None)
    }

    /// Send `body` to `topic` and call `callback` once it is sent
    ///
    /// At-most-once messages complete as soon as the messenger has them;
    /// at-least-once messages complete when the server settles them.
    pub fn send_with<B, F>(&self, topic: &str, body: B, options: SendOptions, callback: F) -> ClientResult<&Self>
    where
        B: Into<Body>,
        F: FnOnce(&Client, Result<SentMessage, ClientError>) + Send + 'static,
    {
        self.start_send(topic, body.into(), options, Some(Box::new(callback)))
    }

    /// Confirm an at-least-once delivery received with auto-confirm disabled
    pub fn confirm(&self, delivery: &Delivery) -> ClientResult<()> {
        self.inner.state.require_connected("confirm")?;
        let tracker = delivery
            .confirmation
            .ok_or_else(|| ClientError::validation("delivery does not need confirmation"))?;
        let link_address = self
            .registry()
            .unconfirmed
            .remove(&tracker)
            .ok_or_else(|| ClientError::validation(format!("delivery {tracker} is already confirmed")))?;

        let outcome = self.with_messenger(|messenger| {
            messenger.accept(tracker)?;
            messenger.settle(tracker)
        });
        if let Err(e) = outcome {
            // still unconfirmed, so a retry can settle it
            self.registry().unconfirmed.insert(tracker, link_address);
            self.observe_fault(&e);
            return Err(e.into());
        }
        self.consume_credit(&link_address);
        Ok(())
    }

    fn start_connect(&self, callback: Option<ConnectCallback>) -> ClientResult<&Self> {
        let mut registry = self.registry();
        match self.inner.state.begin_connect() {
            ConnectDecision::Start => {
                registry.connect_waiters.extend(callback);
                drop(registry);

                let client = self.clone();
                let span = client_span!(client_id = %self.id(), operation = "connect");
                tokio::spawn(async move { client.run_connect().await }.instrument(span));
            }
            ConnectDecision::InProgress => {
                debug!("Connect already in progress");
                registry.connect_waiters.extend(callback);
            }
            ConnectDecision::AlreadyConnected => {
                drop(registry);
                if let Some(callback) = callback {
                    let client = self.clone();
                    tokio::spawn(async move { callback(&client, Ok(())) });
                }
            }
            ConnectDecision::Rejected(state) => return Err(ClientError::state("connect", state)),
        }
        Ok(self)
    }

    async fn run_connect(&self) {
        let options = &self.inner.options;
        info!(service = %self.inner.service, "Connecting");

        // Set when a disconnect overtakes this attempt
        let mut interrupted = None;
        let result = match self.with_messenger(|messenger| {
            messenger.connect(
                &self.inner.service_url,
                options.tls_trust_certificate.as_deref(),
                options.tls_verify_name,
            )
        }) {
            Ok(()) => {
                poll_until_settled(OperationKind::Connect, self.poll_interval(), || {
                    match self.state() {
                        ClientState::Connecting => self.with_messenger(|m| m.connected()),
                        state => {
                            interrupted = Some(state);
                            Err(MessengerError::other(format!("client became {state} while connecting")))
                        }
                    }
                })
                .await
            }
            Err(e) => Err(ClientError::from_connect_failure(e)),
        };

        let (outcome, waiters) = {
            let mut registry = self.registry();
            let outcome = match (result, interrupted) {
                (_, Some(state)) => Err(ClientError::state("complete connect", state)),
                (Ok(()), None) => self.inner.state.connect_succeeded(),
                (Err(e), None) => {
                    self.inner.state.connect_failed();
                    Err(e)
                }
            };
            (outcome, std::mem::take(&mut registry.connect_waiters))
        };

        match &outcome {
            Ok(()) => {
                self.start_background_tasks();
                self.emit(ClientEvent::Connected);
            }
            Err(e) => {
                error!("Connect failed: {}", e);
                if waiters.is_empty() {
                    self.emit(ClientEvent::Error(e.clone()));
                }
            }
        }

        for waiter in waiters {
            waiter(self, outcome.clone());
        }
    }

    fn start_disconnect(&self, callback: Option<ConnectCallback>) -> &Self {
        let mut registry = self.registry();
        match self.inner.state.begin_disconnect() {
            DisconnectDecision::Start => {
                registry.disconnect_waiters.extend(callback);
                drop(registry);

                let client = self.clone();
                let span = client_span!(client_id = %self.id(), operation = "disconnect");
                tokio::spawn(async move { client.run_disconnect().await }.instrument(span));
            }
            DisconnectDecision::InProgress => {
                registry.disconnect_waiters.extend(callback);
            }
            DisconnectDecision::AlreadyDisconnected => {
                drop(registry);
                if let Some(callback) = callback {
                    let client = self.clone();
                    tokio::spawn(async move { callback(&client, Ok(())) });
                }
            }
        }
        self
    }

    async fn run_disconnect(&self) {
        info!("Disconnecting");
        let result = poll_until_settled(OperationKind::Disconnect, self.poll_interval(), || {
            self.with_messenger(|messenger| messenger.stop())
        })
        .await;

        if let Err(e) = &result {
            warn!("Messenger reported a fault while stopping: {}", e);
        }

        let waiters = {
            let mut registry = self.registry();
            self.inner.state.stop_confirmed();
            registry.subscriptions.clear();
            registry.unconfirmed.clear();
            std::mem::take(&mut registry.disconnect_waiters)
        };

        self.emit(ClientEvent::Disconnected);
        for waiter in waiters {
            waiter(self, result.clone());
        }
    }

    fn start_send(
        &self,
        topic: &str,
        body: Body,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> ClientResult<&Self> {
        let address = build_send_address(&self.inner.service, topic)?;
        self.inner.state.require_connected("send")?;

        let message = OutboundMessage {
            address: address.clone(),
            body,
            ttl: options.ttl,
        };
        let qos = options.qos;
        debug!(%address, qos = qos.as_u8(), "Sending message");
        let put = self.with_messenger(|messenger| {
            let tracker = messenger.put(&message, qos)?;
            messenger.send()?;
            Ok::<_, MessengerError>(tracker)
        });
        if let Err(e) = &put {
            self.observe_fault(e);
        }

        let sent = SentMessage {
            topic: topic.to_string(),
            address,
            qos,
        };
        let client = self.clone();
        let span = client_span!(client_id = %self.id(), operation = "send");
        tokio::spawn(
            async move {
                let result = match (put, qos) {
                    (Err(e), _) => Err(e.into()),
                    (Ok(_), QoS::AtMostOnce) => Ok(()),
                    (Ok(tracker), QoS::AtLeastOnce) => {
                        poll_until_settled(OperationKind::Send, client.poll_interval(), || {
                            client.poll_step(OperationKind::Send, ClientState::Connected, |m| {
                                send_settled(m, tracker)
                            })
                        })
                        .await
                    }
                };
                client.complete(callback, result.map(|()| sent));
            }
            .instrument(span),
        );

        Ok(self)
    }

    fn finish_subscribe(
        &self,
        subscription: Subscription,
        options: SubscribeOptions,
        result: Result<(), ClientError>,
    ) {
        let waiters = {
            let mut registry = self.registry();
            if result.is_ok() {
                registry.subscriptions.insert(
                    subscription.address.clone(),
                    ActiveSubscription {
                        subscription: subscription.clone(),
                        options,
                        consumed: 0,
                    },
                );
            }
            registry
                .subscribing
                .remove(&subscription.address)
                .unwrap_or_default()
        };
        match &result {
            Ok(()) => info!(address = %subscription.address, "Subscribed"),
            Err(e) => warn!(address = %subscription.address, "Subscribe failed: {}", e),
        }
        self.complete_all(waiters, result.map(|()| subscription));
    }

    fn finish_unsubscribe(&self, subscription: Subscription, result: Result<(), ClientError>) {
        let waiters = {
            let mut registry = self.registry();
            if result.is_ok() {
                registry.subscriptions.remove(&subscription.address);
                registry
                    .unconfirmed
                    .retain(|_, link| *link != subscription.address);
            }
            registry
                .unsubscribing
                .remove(&subscription.address)
                .unwrap_or_default()
        };
        match &result {
            Ok(()) => info!(address = %subscription.address, "Unsubscribed"),
            Err(e) => warn!(address = %subscription.address, "Unsubscribe failed: {}", e),
        }
        self.complete_all(waiters, result.map(|()| subscription));
    }

    /// Deliver `result` to every waiter; report a failure once if any
    /// waiter had no callback
    fn complete_all<T: Clone>(
        &self,
        waiters: Vec<Option<Box<dyn FnOnce(&Client, Result<T, ClientError>) + Send>>>,
        result: Result<T, ClientError>,
    ) {
        let mut unobserved = false;
        for waiter in waiters {
            match waiter {
                Some(callback) => callback(self, result.clone()),
                None => unobserved = true,
            }
        }
        if let Err(e) = result {
            if unobserved {
                self.emit(ClientEvent::Error(e));
            }
        }
    }

    fn complete<T: Clone>(
        &self,
        callback: Option<Box<dyn FnOnce(&Client, Result<T, ClientError>) + Send>>,
        result: Result<T, ClientError>,
    ) {
        self.complete_all(vec![callback], result);
    }

    /// One poll attempt, gated on the client still being in `expected`
    ///
    /// A network fault reported by the messenger also drops the connection.
    fn poll_step<F>(&self, operation: OperationKind, expected: ClientState, poll: F) -> Result<bool, MessengerError>
    where
        F: FnOnce(&mut dyn Messenger) -> Result<bool, MessengerError>,
    {
        let state = self.state();
        if state != expected {
            return Err(MessengerError::network(format!(
                "client became {state} before {operation} completed"
            )));
        }
        let _span = messenger_span!(operation = %operation).entered();
        let outcome = self.with_messenger(poll);
        if let Err(e) = &outcome {
            self.observe_fault(e);
        }
        outcome
    }

    /// Drop the connection if `error` is a network fault
    fn observe_fault(&self, error: &MessengerError) {
        if error.kind == MessengerErrorKind::Network {
            self.connection_fault(&error.message);
        }
    }

    fn connection_fault(&self, reason: &str) {
        if self.inner.state.connection_lost(reason) {
            self.registry().unconfirmed.clear();
            self.emit(ClientEvent::Disconnected);
        }
    }

    fn start_background_tasks(&self) {
        let idle_timeout = self.with_messenger(|messenger| messenger.remote_idle_timeout(&self.inner.service));
        if let Some(timeout) = idle_timeout.filter(|timeout| !timeout.is_zero()) {
            let client = self.clone();
            let span = client_span!(client_id = %self.id(), operation = "heartbeat");
            tokio::spawn(async move { client.run_heartbeat(timeout / 2).await }.instrument(span));
        }

        let client = self.clone();
        let span = client_span!(client_id = %self.id(), operation = "receive");
        tokio::spawn(async move { client.run_receive().await }.instrument(span));
    }

    /// Keep an idle connection alive until the client leaves `Connected`
    async fn run_heartbeat(&self, interval: Duration) {
        debug!(interval_ms = interval.as_millis() as u64, "Starting heartbeat");
        self.while_connected(interval, |client| {
            client
                .with_messenger(|messenger| messenger.work())
                .map_err(|e| MessengerError::network(format!("heartbeat failed: {}", e.message)))
        })
        .await;
    }

    async fn run_receive(&self) {
        let interval = self.inner.options.receive_interval().max(MIN_RECEIVE_INTERVAL);
        self.while_connected(interval, |client| {
            let messages = client.with_messenger(|messenger| messenger.receive())?;
            for message in messages {
                if let Err(e) = client.deliver(message) {
                    if e.kind == MessengerErrorKind::Network {
                        return Err(e);
                    }
                    warn!("Failed to settle inbound message: {}", e);
                    client.emit(ClientEvent::Error(e.into()));
                }
            }
            Ok(())
        })
        .await;
    }

    /// Run `work` every `interval` while connected
    ///
    /// A network fault drops the connection, which ends the loop. Any other
    /// fault is reported as an error event and the loop carries on.
    async fn while_connected<F>(&self, interval: Duration, mut work: F)
    where
        F: FnMut(&Client) -> Result<(), MessengerError>,
    {
        let mut state_rx = self.state_changes();
        if *state_rx.borrow_and_update() != ClientState::Connected {
            return;
        }
        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow_and_update() != ClientState::Connected {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = work(self) {
                        if e.kind == MessengerErrorKind::Network {
                            error!("Background messenger work lost the connection: {}", e);
                            self.connection_fault(&e.message);
                            break;
                        }
                        warn!("Background messenger work failed: {}", e);
                        self.emit(ClientEvent::Error(e.into()));
                    }
                }
            }
        }
    }

    fn deliver(&self, message: InboundMessage) -> Result<(), MessengerError> {
        let active = {
            let registry = self.registry();
            registry
                .subscriptions
                .get(&message.link_address)
                .map(|active| (active.subscription.clone(), active.options.clone()))
        };
        let Some((subscription, options)) = active else {
            warn!(link = %message.link_address, "Dropping message for unknown subscription");
            return Ok(());
        };

        let needs_confirmation = options.qos == QoS::AtLeastOnce && !options.auto_confirm;
        if needs_confirmation {
            self.registry()
                .unconfirmed
                .insert(message.tracker, message.link_address.clone());
        } else {
            if options.qos == QoS::AtLeastOnce {
                self.with_messenger(|messenger| {
                    messenger.accept(message.tracker)?;
                    messenger.settle(message.tracker)
                })?;
            }
            self.consume_credit(&message.link_address);
        }

        let topic = message
            .address
            .strip_prefix(&self.inner.service)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(&message.address)
            .to_string();

        debug!(%topic, link = %message.link_address, "Message received");
        self.emit(ClientEvent::Message(Delivery {
            body: message.body,
            topic,
            pattern: Some(subscription.pattern),
            share: subscription.share,
            qos: options.qos,
            link_address: message.link_address,
            confirmation: needs_confirmation.then_some(message.tracker),
        }));
        Ok(())
    }

    /// Replenish link credit once half of it has been used
    fn consume_credit(&self, link_address: &str) {
        let replenish = {
            let mut registry = self.registry();
            let Some(active) = registry.subscriptions.get_mut(link_address) else {
                return;
            };
            active.consumed += 1;
            let threshold = (active.options.credit / 2).max(1);
            if active.options.credit > 0 && active.consumed >= threshold {
                Some(std::mem::take(&mut active.consumed))
            } else {
                None
            }
        };
        if let Some(credit) = replenish {
            debug!(link = %link_address, credit, "Replenishing link credit");
            self.with_messenger(|messenger| messenger.flow(link_address, credit));
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(broadcast::error::SendError(event)) = self.inner.events.send(event) {
            if let ClientEvent::Error(e) = event {
                error!(client_id = %self.id(), "Unhandled client error: {}", e);
            }
        }
    }

    fn poll_interval(&self) -> Duration {
        self.inner.options.poll_interval()
    }

    fn with_messenger<R>(&self, f: impl FnOnce(&mut dyn Messenger) -> R) -> R {
        let mut messenger = self
            .inner
            .messenger
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut **messenger)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Poll predicate for an at-least-once send
fn send_settled(messenger: &mut dyn Messenger, tracker: Tracker) -> Result<bool, MessengerError> {
    match messenger.status(tracker)? {
        status if status.is_failure() => Err(MessengerError::other(format!(
            "message {tracker} was not delivered: {status:?}"
        ))),
        DeliveryStatus::Accepted | DeliveryStatus::Settled => messenger.settled(tracker),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMessenger;

    fn client() -> Client {
        Client::new(ClientOptions::new("amqp://host:5672"), MockMessenger::new()).unwrap()
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let client = client();
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.id().starts_with("AUTO_"));
        assert_eq!(client.service(), "amqp://host:5672");
        assert!(client.subscriptions().is_empty());
    }

    #[test]
    fn test_explicit_id_and_trailing_slash() {
        let options = ClientOptions::new("amqp://host/").with_id("client_1");
        let client = Client::new(options, MockMessenger::new()).unwrap();
        assert_eq!(client.id(), "client_1");
        assert_eq!(client.service(), "amqp://host");
    }

    #[test]
    fn test_invalid_options_rejected() {
        let result = Client::new(ClientOptions::new("http://host"), MockMessenger::new());
        assert!(matches!(result, Err(ConfigError::InvalidService(_))));
    }

    #[test]
    fn test_clones_are_equal() {
        let client = client();
        assert_eq!(client, client.clone());
        assert_ne!(client, self::client());
    }

    #[test]
    fn test_send_settled_statuses() {
        let mut messenger = MockMessenger::new();
        let tracker = Tracker(1);

        messenger.set_send_status(DeliveryStatus::Pending);
        assert_eq!(send_settled(&mut messenger, tracker), Ok(false));

        messenger.set_send_status(DeliveryStatus::Rejected);
        assert!(send_settled(&mut messenger, tracker).is_err());
    }
}
