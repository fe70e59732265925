//! Test helpers and utilities for integration tests

use mqlight::testing::MockMessenger;
use mqlight::{callback, Client, ClientError, ClientEvent, ClientOptions, Subscription, SubscriptionArg};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;

pub const SERVICE: &str = "amqp://host";

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Disconnected client over a fresh mock messenger
#[allow(dead_code)]
pub fn test_client(service: &str) -> (Client, MockMessenger) {
    test_client_with(ClientOptions::new(service))
}

#[allow(dead_code)]
pub fn test_client_with(options: ClientOptions) -> (Client, MockMessenger) {
    let messenger = MockMessenger::new();
    let client = Client::new(
        options.with_receive_interval(Duration::from_millis(5)),
        messenger.clone(),
    )
    .unwrap();
    (client, messenger)
}

/// Connected client against [`SERVICE`]
#[allow(dead_code)]
pub async fn connected_client() -> (Client, MockMessenger) {
    let (client, messenger) = test_client(SERVICE);
    connect(&client).await.unwrap();
    (client, messenger)
}

/// Connect and wait for the callback
#[allow(dead_code)]
pub async fn connect(client: &Client) -> Result<(), ClientError> {
    let (tx, rx) = oneshot::channel();
    client.connect_with(move |_, result| {
        let _ = tx.send(result);
    })?;
    recv(rx).await
}

/// Disconnect and wait for the callback
#[allow(dead_code)]
pub async fn disconnect(client: &Client) -> Result<(), ClientError> {
    let (tx, rx) = oneshot::channel();
    client.disconnect_with(move |_, result| {
        let _ = tx.send(result);
    });
    recv(rx).await
}

/// Callback argument that forwards its result to the returned receiver
#[allow(dead_code)]
pub fn forwarding_callback() -> (
    SubscriptionArg,
    oneshot::Receiver<Result<Subscription, ClientError>>,
) {
    let (tx, rx) = oneshot::channel();
    let arg = callback(move |_, result| {
        let _ = tx.send(result);
    });
    (arg, rx)
}

/// Subscribe to `pattern` and wait for the outcome
#[allow(dead_code)]
pub async fn subscribe(client: &Client, mut args: Vec<SubscriptionArg>) -> Result<Subscription, ClientError> {
    let (arg, rx) = forwarding_callback();
    args.push(arg);
    client.subscribe(args)?;
    recv(rx).await
}

/// Await a oneshot, failing the test after [`WAIT`]
#[allow(dead_code)]
pub async fn recv<T>(rx: oneshot::Receiver<T>) -> T {
    timeout(WAIT, rx)
        .await
        .expect("timed out waiting for callback")
        .expect("callback dropped without being called")
}

/// Next event, failing the test after [`WAIT`]
#[allow(dead_code)]
pub async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until one matches `predicate`
#[allow(dead_code)]
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<ClientEvent>, predicate: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if predicate(&event) {
            return event;
        }
    }
}
