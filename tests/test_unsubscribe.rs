//! Unsubscribe behaviour against the mock messenger

mod test_helpers;

use mqlight::{callback, ClientEvent, ErrorKind, MessengerError, SubscriptionArg};
use serde_json::json;
use std::time::Duration;
use test_helpers::*;
use tokio::sync::oneshot;

async fn unsubscribe(
    client: &mqlight::Client,
    mut args: Vec<SubscriptionArg>,
) -> Result<mqlight::Subscription, mqlight::ClientError> {
    let (arg, rx) = forwarding_callback();
    args.push(arg);
    client.unsubscribe(args)?;
    recv(rx).await
}

#[tokio::test]
async fn test_unsubscribe_removes_subscription() {
    // Arrange
    let (client, messenger) = connected_client().await;
    subscribe(&client, vec!["/news/#".into()]).await.unwrap();
    assert_eq!(client.subscriptions().len(), 1);

    // Act
    let subscription = unsubscribe(&client, vec!["/news/#".into()]).await.unwrap();

    // Assert
    assert_eq!(subscription.address, "amqp://host/private:/news/#");
    assert!(client.subscriptions().is_empty());
    assert_eq!(
        messenger.unsubscribe_calls(),
        vec![("amqp://host/private:/news/#".to_string(), None)]
    );
}

#[tokio::test]
async fn test_unsubscribe_shared_destination() {
    let (client, messenger) = connected_client().await;
    subscribe(&client, vec!["/jobs".into(), "pool".into()]).await.unwrap();

    let subscription = unsubscribe(&client, vec!["/jobs".into(), "pool".into()])
        .await
        .unwrap();

    assert_eq!(subscription.share.as_deref(), Some("pool"));
    assert_eq!(messenger.unsubscribe_calls()[0].0, "amqp://host/share:pool:/jobs");
}

#[tokio::test]
async fn test_unsubscribe_with_zero_ttl() {
    let (client, messenger) = connected_client().await;
    subscribe(&client, vec!["/foo".into()]).await.unwrap();

    unsubscribe(&client, vec!["/foo".into(), json!({"ttl": 0}).into()])
        .await
        .unwrap();

    assert_eq!(messenger.unsubscribe_calls()[0].1, Some(Duration::ZERO));
}

#[tokio::test]
async fn test_unsubscribe_rejects_non_zero_ttl() {
    let (client, messenger) = connected_client().await;
    subscribe(&client, vec!["/foo".into()]).await.unwrap();

    let error = client
        .unsubscribe(vec!["/foo".into(), json!({"ttl": 1000}).into()])
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Validation);
    assert!(messenger.unsubscribe_calls().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_unknown_subscription() {
    let (client, messenger) = connected_client().await;

    let error = client.unsubscribe(vec!["/never".into()]).unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Validation);
    assert!(error.to_string().contains("/never"));
    assert!(messenger.unsubscribe_calls().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_share_must_match() {
    let (client, _messenger) = connected_client().await;
    subscribe(&client, vec!["/foo".into(), "a".into()]).await.unwrap();

    let error = client
        .unsubscribe(vec!["/foo".into(), "b".into()])
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Validation);
    assert_eq!(client.subscriptions().len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_when_disconnected() {
    let (client, _messenger) = test_client(SERVICE);

    let error = client.unsubscribe(vec!["/foo".into()]).unwrap_err();

    assert_eq!(error.kind(), ErrorKind::State);
}

#[tokio::test]
async fn test_unsubscribe_callback_receives_client() {
    let (client, _messenger) = connected_client().await;
    subscribe(&client, vec!["/foo".into()]).await.unwrap();
    let (tx, rx) = oneshot::channel();

    client
        .unsubscribe(vec![
            "/foo".into(),
            callback(move |client, result| {
                let _ = tx.send((client.clone(), result.is_ok()));
            }),
        ])
        .unwrap();

    let (called_on, ok) = recv(rx).await;
    assert_eq!(called_on, client);
    assert!(ok);
}

#[tokio::test]
async fn test_unsubscribe_failure_without_callback_emits_error() {
    let (client, messenger) = connected_client().await;
    subscribe(&client, vec!["/foo".into()]).await.unwrap();
    messenger.fail_unsubscribe_with(MessengerError::other("link detach refused"));
    let mut events = client.events();

    client.unsubscribe(vec!["/foo".into()]).unwrap();

    let event = wait_for_event(&mut events, |event| matches!(event, ClientEvent::Error(_))).await;
    assert!(matches!(event, ClientEvent::Error(e) if e.to_string().contains("link detach refused")));
    assert_eq!(client.subscriptions().len(), 1);
}
