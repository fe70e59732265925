//! Mock messenger for testing
//!
//! [`MockMessenger`] implements [`Messenger`] in memory. Clones share state,
//! so a test keeps one clone for inspection and fault injection while the
//! client owns another.
//!
//! Default behaviour:
//! - connect succeeds unless the service contains `bad` (invalid argument)
//!   or the trust certificate names `BadCertificate`, or `BadVerify` while
//!   name verification is on (security)
//! - subscribe, unsubscribe, stop and at-least-once settlement complete on
//!   the second poll
//! - at-most-once messages report status `Unknown`, at-least-once `Settled`

use crate::transport::{
    Body, DeliveryStatus, InboundMessage, Messenger, MessengerError, OutboundMessage, QoS,
    Tracker,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use url::Url;

/// Polls a predicate needs before it reports completion
pub const DEFAULT_SETTLE_AFTER: usize = 2;

/// Recorded [`Messenger::connect`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCall {
    pub service: String,
    pub tls_trust_certificate: Option<String>,
    pub tls_verify_name: bool,
}

/// Recorded [`Messenger::subscribe`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeCall {
    pub address: String,
    pub qos: QoS,
    pub ttl: Duration,
    pub credit: u32,
}

#[derive(Debug)]
struct MockState {
    settle_after: usize,
    polls: HashMap<String, usize>,
    network_fault: Option<MessengerError>,
    connect_error: Option<MessengerError>,
    subscribe_error: Option<MessengerError>,
    subscribed_error: Option<MessengerError>,
    unsubscribe_error: Option<MessengerError>,
    receive_error: Option<MessengerError>,
    accept_error: Option<MessengerError>,
    subscriptions_held: bool,
    send_blocked: bool,
    send_status: Option<DeliveryStatus>,
    remote_idle_timeout: Option<Duration>,
    connect_calls: Vec<ConnectCall>,
    subscribe_calls: Vec<SubscribeCall>,
    unsubscribe_calls: Vec<(String, Option<Duration>)>,
    sent: Vec<(OutboundMessage, QoS)>,
    trackers: HashMap<Tracker, QoS>,
    next_tracker: u64,
    inbound: VecDeque<InboundMessage>,
    flow_calls: Vec<(String, u32)>,
    accepted: Vec<Tracker>,
    settled: Vec<Tracker>,
    work_calls: usize,
    stop_calls: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            settle_after: DEFAULT_SETTLE_AFTER,
            polls: HashMap::new(),
            network_fault: None,
            connect_error: None,
            subscribe_error: None,
            subscribed_error: None,
            unsubscribe_error: None,
            receive_error: None,
            accept_error: None,
            subscriptions_held: false,
            send_blocked: false,
            send_status: None,
            remote_idle_timeout: None,
            connect_calls: Vec::new(),
            subscribe_calls: Vec::new(),
            unsubscribe_calls: Vec::new(),
            sent: Vec::new(),
            trackers: HashMap::new(),
            next_tracker: 1,
            inbound: VecDeque::new(),
            flow_calls: Vec::new(),
            accepted: Vec::new(),
            settled: Vec::new(),
            work_calls: 0,
            stop_calls: 0,
        }
    }
}

impl MockState {
    fn fault(&self) -> Result<(), MessengerError> {
        match &self.network_fault {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Count one poll of `key`; true once it reached `settle_after`
    fn poll(&mut self, key: String) -> bool {
        let settle_after = self.settle_after;
        let count = self.polls.entry(key).or_insert(0);
        *count += 1;
        *count >= settle_after
    }
}

/// In-memory [`Messenger`]
#[derive(Debug, Clone, Default)]
pub struct MockMessenger {
    state: Arc<Mutex<MockState>>,
}

impl MockMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predicates complete on poll number `polls`
    pub fn with_settle_after(polls: usize) -> Self {
        let messenger = Self::new();
        messenger.lock().settle_after = polls.max(1);
        messenger
    }

    /// Fail every fallible call with a network fault until cleared
    pub fn set_network_fault<S: Into<String>>(&self, message: S) {
        self.lock().network_fault = Some(MessengerError::network(message));
    }

    pub fn clear_network_fault(&self) {
        self.lock().network_fault = None;
    }

    pub fn fail_connect_with(&self, error: MessengerError) {
        self.lock().connect_error = Some(error);
    }

    /// Make the next [`Messenger::subscribe`] call fail
    pub fn fail_subscribe_with(&self, error: MessengerError) {
        self.lock().subscribe_error = Some(error);
    }

    /// Make the next [`Messenger::subscribed`] poll fail
    pub fn fail_subscribed_with(&self, error: MessengerError) {
        self.lock().subscribed_error = Some(error);
    }

    pub fn fail_unsubscribe_with(&self, error: MessengerError) {
        self.lock().unsubscribe_error = Some(error);
    }

    /// Make the next [`Messenger::receive`] call fail
    pub fn fail_receive_with(&self, error: MessengerError) {
        self.lock().receive_error = Some(error);
    }

    /// Make the next [`Messenger::accept`] call fail
    pub fn fail_accept_with(&self, error: MessengerError) {
        self.lock().accept_error = Some(error);
    }

    /// Keep subscribe polls unsettled while `held`
    pub fn set_subscriptions_held(&self, held: bool) {
        self.lock().subscriptions_held = held;
    }

    /// Keep every outbound delivery pending while `blocked`
    pub fn set_send_blocked(&self, blocked: bool) {
        self.lock().send_blocked = blocked;
    }

    /// Report `status` for every outbound delivery
    pub fn set_send_status(&self, status: DeliveryStatus) {
        self.lock().send_status = Some(status);
    }

    pub fn set_remote_idle_timeout(&self, timeout: Option<Duration>) {
        self.lock().remote_idle_timeout = timeout;
    }

    /// Queue a message for the next [`Messenger::receive`]
    pub fn push_message<B: Into<Body>>(&self, link_address: &str, address: &str, body: B) -> Tracker {
        let mut state = self.lock();
        let tracker = Tracker(state.next_tracker);
        state.next_tracker += 1;
        state.inbound.push_back(InboundMessage {
            link_address: link_address.to_string(),
            address: address.to_string(),
            body: body.into(),
            tracker,
        });
        tracker
    }

    pub fn connect_calls(&self) -> Vec<ConnectCall> {
        self.lock().connect_calls.clone()
    }

    pub fn subscribe_calls(&self) -> Vec<SubscribeCall> {
        self.lock().subscribe_calls.clone()
    }

    pub fn last_subscribed_address(&self) -> Option<String> {
        self.lock()
            .subscribe_calls
            .last()
            .map(|call| call.address.clone())
    }

    pub fn unsubscribe_calls(&self) -> Vec<(String, Option<Duration>)> {
        self.lock().unsubscribe_calls.clone()
    }

    pub fn sent_messages(&self) -> Vec<(OutboundMessage, QoS)> {
        self.lock().sent.clone()
    }

    pub fn flow_calls(&self) -> Vec<(String, u32)> {
        self.lock().flow_calls.clone()
    }

    pub fn accepted(&self) -> Vec<Tracker> {
        self.lock().accepted.clone()
    }

    pub fn settled_deliveries(&self) -> Vec<Tracker> {
        self.lock().settled.clone()
    }

    pub fn work_calls(&self) -> usize {
        self.lock().work_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.lock().stop_calls
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Messenger for MockMessenger {
    fn connect(
        &mut self,
        service: &Url,
        tls_trust_certificate: Option<&str>,
        tls_verify_name: bool,
    ) -> Result<(), MessengerError> {
        let mut state = self.lock();
        state.connect_calls.push(ConnectCall {
            service: service.to_string(),
            tls_trust_certificate: tls_trust_certificate.map(str::to_string),
            tls_verify_name,
        });
        state.polls.clear();

        if let Some(error) = state.connect_error.clone() {
            return Err(error);
        }
        state.fault()?;
        if service.as_str().contains("bad") {
            return Err(MessengerError::invalid_argument(format!(
                "bad service: {service}"
            )));
        }
        match tls_trust_certificate {
            Some(cert) if cert.contains("BadCertificate") => {
                Err(MessengerError::security("certificate verify failed"))
            }
            Some(cert) if cert.contains("BadVerify") && tls_verify_name => {
                Err(MessengerError::security("hostname verification failed"))
            }
            _ => Ok(()),
        }
    }

    fn connected(&mut self) -> Result<bool, MessengerError> {
        self.lock().fault()?;
        Ok(true)
    }

    fn subscribe(
        &mut self,
        address: &str,
        qos: QoS,
        ttl: Duration,
        credit: u32,
    ) -> Result<(), MessengerError> {
        let mut state = self.lock();
        state.subscribe_calls.push(SubscribeCall {
            address: address.to_string(),
            qos,
            ttl,
            credit,
        });
        state.fault()?;
        if let Some(error) = state.subscribe_error.take() {
            return Err(error);
        }
        state.polls.remove(&format!("subscribed:{address}"));
        Ok(())
    }

    fn subscribed(&mut self, address: &str) -> Result<bool, MessengerError> {
        let mut state = self.lock();
        state.fault()?;
        if let Some(error) = state.subscribed_error.take() {
            return Err(error);
        }
        if state.subscriptions_held {
            return Ok(false);
        }
        Ok(state.poll(format!("subscribed:{address}")))
    }

    fn unsubscribe(&mut self, address: &str, ttl: Option<Duration>) -> Result<(), MessengerError> {
        let mut state = self.lock();
        state.unsubscribe_calls.push((address.to_string(), ttl));
        state.fault()?;
        if let Some(error) = state.unsubscribe_error.take() {
            return Err(error);
        }
        state.polls.remove(&format!("unsubscribed:{address}"));
        Ok(())
    }

    fn unsubscribed(&mut self, address: &str) -> Result<bool, MessengerError> {
        let mut state = self.lock();
        state.fault()?;
        Ok(state.poll(format!("unsubscribed:{address}")))
    }

    fn put(&mut self, message: &OutboundMessage, qos: QoS) -> Result<Tracker, MessengerError> {
        let mut state = self.lock();
        state.fault()?;
        let tracker = Tracker(state.next_tracker);
        state.next_tracker += 1;
        state.trackers.insert(tracker, qos);
        state.sent.push((message.clone(), qos));
        Ok(tracker)
    }

    fn send(&mut self) -> Result<(), MessengerError> {
        self.lock().fault()
    }

    fn status(&mut self, tracker: Tracker) -> Result<DeliveryStatus, MessengerError> {
        let state = self.lock();
        state.fault()?;
        if state.send_blocked {
            return Ok(DeliveryStatus::Pending);
        }
        if let Some(status) = state.send_status {
            return Ok(status);
        }
        Ok(match state.trackers.get(&tracker) {
            Some(QoS::AtLeastOnce) => DeliveryStatus::Settled,
            _ => DeliveryStatus::Unknown,
        })
    }

    fn settled(&mut self, tracker: Tracker) -> Result<bool, MessengerError> {
        let mut state = self.lock();
        state.fault()?;
        if state.send_blocked {
            return Ok(false);
        }
        Ok(state.poll(format!("settled:{tracker}")))
    }

    fn stop(&mut self) -> Result<bool, MessengerError> {
        let mut state = self.lock();
        state.stop_calls += 1;
        Ok(state.poll("stop".to_string()))
    }

    fn remote_idle_timeout(&mut self, _address: &str) -> Option<Duration> {
        self.lock().remote_idle_timeout
    }

    fn flow(&mut self, address: &str, credit: u32) {
        self.lock().flow_calls.push((address.to_string(), credit));
    }

    fn receive(&mut self) -> Result<Vec<InboundMessage>, MessengerError> {
        let mut state = self.lock();
        state.fault()?;
        if let Some(error) = state.receive_error.take() {
            return Err(error);
        }
        Ok(state.inbound.drain(..).collect())
    }

    fn accept(&mut self, tracker: Tracker) -> Result<(), MessengerError> {
        let mut state = self.lock();
        state.fault()?;
        if let Some(error) = state.accept_error.take() {
            return Err(error);
        }
        state.accepted.push(tracker);
        Ok(())
    }

    fn settle(&mut self, tracker: Tracker) -> Result<(), MessengerError> {
        let mut state = self.lock();
        state.fault()?;
        state.settled.push(tracker);
        Ok(())
    }

    fn work(&mut self) -> Result<(), MessengerError> {
        let mut state = self.lock();
        state.work_calls += 1;
        state.fault()
    }
}
