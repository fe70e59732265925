//! Retry-until-settled combinator
//!
//! The messenger reports completion of network operations only through
//! predicates that have to be asked again and again. [`poll_until_settled`]
//! wraps that protocol once so connect, send, subscribe, unsubscribe and
//! disconnect all share the same loop.

use crate::error::ClientError;
use crate::transport::MessengerError;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Network operation whose completion is being polled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Connect => "connect",
            OperationKind::Send => "send",
            OperationKind::Subscribe => "subscribe",
            OperationKind::Unsubscribe => "unsubscribe",
            OperationKind::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one run of the poll loop
#[derive(Debug)]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub attempts: u64,
    started: Instant,
}

impl PendingOperation {
    fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            attempts: 0,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Poll `poll_fn` until it reports completion
///
/// `Ok(true)` settles the operation, `Ok(false)` schedules another attempt
/// and `Err` ends it. Between attempts the task yields to the scheduler
/// (zero interval) or sleeps for `interval`. There is no attempt limit: an
/// operation the messenger never settles never completes.
pub async fn poll_until_settled<F>(
    kind: OperationKind,
    interval: Duration,
    mut poll_fn: F,
) -> Result<(), ClientError>
where
    F: FnMut() -> Result<bool, MessengerError>,
{
    let mut operation = PendingOperation::new(kind);
    loop {
        operation.attempts += 1;
        match poll_fn() {
            Ok(true) => {
                debug!(
                    operation = %operation.kind,
                    attempts = operation.attempts,
                    elapsed_ms = operation.elapsed().as_millis() as u64,
                    "Operation settled"
                );
                return Ok(());
            }
            Ok(false) => {
                trace!(operation = %operation.kind, attempts = operation.attempts, "Not settled yet");
            }
            Err(e) => {
                warn!(
                    operation = %operation.kind,
                    attempts = operation.attempts,
                    "Operation failed while polling: {}",
                    e
                );
                return Err(e.into());
            }
        }
        tick(interval).await;
    }
}

/// Spawn [`poll_until_settled`] and hand its outcome to `on_done`
///
/// `on_done` runs exactly once, on the spawned task, never inside this call.
pub fn poll_until_settled_then<F, D>(
    kind: OperationKind,
    interval: Duration,
    poll_fn: F,
    on_done: D,
) -> JoinHandle<()>
where
    F: FnMut() -> Result<bool, MessengerError> + Send + 'static,
    D: FnOnce(Result<(), ClientError>) + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = poll_until_settled(kind, interval, poll_fn).await;
        on_done(outcome);
    })
}

async fn tick(interval: Duration) {
    if interval.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    fn settles_after(polls: usize) -> (Arc<AtomicUsize>, impl FnMut() -> Result<bool, MessengerError>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let poll = move || Ok(counter.fetch_add(1, Ordering::SeqCst) + 1 >= polls);
        (count, poll)
    }

    #[tokio::test]
    async fn test_immediate_settlement() {
        let (count, poll) = settles_after(1);
        let result = poll_until_settled(OperationKind::Subscribe, Duration::ZERO, poll).await;
        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settlement_after_several_polls() {
        let (count, poll) = settles_after(5);
        let result = poll_until_settled(OperationKind::Unsubscribe, Duration::ZERO, poll).await;
        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_interval_between_polls() {
        let (count, poll) = settles_after(3);
        let start = Instant::now();
        poll_until_settled(OperationKind::Send, Duration::from_millis(10), poll)
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_fault_mid_poll_is_network_error() {
        let mut polls = 0;
        let result = poll_until_settled(OperationKind::Subscribe, Duration::ZERO, || {
            polls += 1;
            if polls == 3 {
                Err(MessengerError::other("error on subscribe: 1"))
            } else {
                Ok(false)
            }
        })
        .await;

        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Network);
        assert_eq!(polls, 3);
    }

    #[tokio::test]
    async fn test_callback_invoked_exactly_once() {
        let scenarios: Vec<Box<dyn FnMut() -> Result<bool, MessengerError> + Send>> = vec![
            Box::new(settles_after(1).1),
            Box::new(settles_after(4).1),
            Box::new({
                let mut polls = 0;
                move || {
                    polls += 1;
                    if polls > 2 {
                        Err(MessengerError::network("broken pipe"))
                    } else {
                        Ok(false)
                    }
                }
            }),
        ];

        for (index, poll) in scenarios.into_iter().enumerate() {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let recorded = calls.clone();
            let (done_tx, done_rx) = oneshot::channel();
            poll_until_settled_then(OperationKind::Send, Duration::ZERO, poll, move |outcome| {
                recorded.lock().unwrap().push(outcome.is_ok());
                let _ = done_tx.send(());
            })
            .await
            .unwrap();
            done_rx.await.unwrap();

            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 1, "scenario {index}");
            assert_eq!(calls[0], index < 2, "scenario {index}");
        }
    }

    #[tokio::test]
    async fn test_callback_not_invoked_synchronously() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let flag = invoked.clone();
        let handle = poll_until_settled_then(
            OperationKind::Connect,
            Duration::ZERO,
            || Ok(true),
            move |_| {
                flag.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        handle.await.unwrap();
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_operation_kind_display() {
        assert_eq!(OperationKind::Subscribe.to_string(), "subscribe");
        assert_eq!(OperationKind::Disconnect.to_string(), "disconnect");
    }
}
