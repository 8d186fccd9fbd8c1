use core::sync::atomic::{AtomicU32, Ordering};

use mixcomms_primitives::{IdType, Status};
use tokio::sync::Mutex;

use super::*;

struct FakeLink {
    id: Id,
    has_address: bool,
    establish_error: Mutex<Option<Error>>,
    establishes: AtomicU32,
    resets: AtomicU32,
    observed: AtomicU32,
    failures: AtomicU32,
}

impl FakeLink {
    fn new() -> Self {
        Self {
            id: Id::new([5; 32], IdType::Node),
            has_address: true,
            establish_error: Mutex::new(None),
            establishes: AtomicU32::new(0),
            resets: AtomicU32::new(0),
            observed: AtomicU32::new(0),
            failures: AtomicU32::new(0),
        }
    }
}

impl Link for FakeLink {
    type Channel = u32;

    fn id(&self) -> &Id {
        &self.id
    }

    fn has_address(&self) -> bool {
        self.has_address
    }

    async fn establish(&self) -> Result<u32, Error> {
        if let Some(err) = self.establish_error.lock().await.take() {
            return Err(err);
        }
        Ok(self.establishes.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn reset(&self) {
        let _ = self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn record_failure(&self, _: &Error) {
        let _ = self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn observe<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        let _ = self.observed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

#[tokio::test]
async fn test_connection_errors_retry_up_to_bound() {
    let link = FakeLink::new();
    let calls = &AtomicU32::new(0);

    let result: Result<(), _> = transmit(&link, move |_| async move {
        let _ = calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Disconnected)
    })
    .await;

    let Err(Error::Transmit { id, attempts, source }) = result else {
        panic!("expected the last error with call context, got {result:?}");
    };
    assert_eq!(id, link.id);
    assert_eq!(attempts, MAX_RETRIES);
    assert!(matches!(*source, Error::Disconnected));
    assert_eq!(source.class(), ErrorClass::Connection);
    assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES);
    assert_eq!(link.resets.load(Ordering::SeqCst), MAX_RETRIES);
}

#[tokio::test]
async fn test_domain_error_is_not_retried() {
    let link = FakeLink::new();
    let calls = &AtomicU32::new(0);

    let result: Result<(), _> = transmit(&link, move |_| async move {
        let _ = calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::from(Status::not_found("no such round")))
    })
    .await;

    assert!(matches!(result, Err(Error::Status(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(link.resets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_auth_error_reauthenticates_then_succeeds() -> Result<(), Error> {
    let link = FakeLink::new();

    let channel = transmit(&link, |channel| async move {
        if channel == 1 {
            Err(Error::from(Status::unauthenticated("failed to authenticate id: abc")))
        } else {
            Ok(channel)
        }
    })
    .await?;

    assert_eq!(channel, 2, "second attempt used a fresh channel");
    assert_eq!(link.resets.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn test_peer_reported_connection_failure_is_retried() {
    let link = FakeLink::new();

    let result: Result<(), _> = transmit(&link, |_| async {
        Err(Error::from(Status::unavailable("dial tcp 10.0.0.1:443: connection refused")))
    })
    .await;

    let err = result.unwrap_err();
    assert!(
        matches!(err, Error::Transmit { ref source, .. } if matches!(**source, Error::Status(_))),
        "{err}"
    );
    assert!(err.to_string().contains("connection refused"), "{err}");
    assert_eq!(link.establishes.load(Ordering::SeqCst), MAX_RETRIES);
}

#[tokio::test]
async fn test_host_without_address_is_rejected() {
    let mut link = FakeLink::new();
    link.has_address = false;

    let result: Result<(), _> = transmit(&link, |_| async { Ok(()) }).await;

    assert!(matches!(result, Err(Error::NoAddress(_))));
    assert_eq!(link.establishes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_establish_failure_is_fatal() {
    let link = FakeLink::new();
    *link.establish_error.lock().await = Some(Error::Unauthenticated(link.id));
    let calls = &AtomicU32::new(0);

    let result: Result<(), _> = transmit(&link, move |_| async move {
        let _ = calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .await;

    assert!(matches!(result, Err(Error::Unauthenticated(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(link.failures.load(Ordering::SeqCst), 1);
    assert_eq!(link.observed.load(Ordering::SeqCst), 0, "no call outcome to record");
}

#[tokio::test]
async fn test_only_call_outcomes_are_observed() {
    let link = FakeLink::new();

    let result: Result<(), _> = transmit(&link, |_| async {
        Err(Error::from(Status::unavailable("could not reach target host")))
    })
    .await;

    assert!(matches!(result, Err(Error::Status(_))));
    assert_eq!(link.establishes.load(Ordering::SeqCst), 1);
    assert_eq!(link.observed.load(Ordering::SeqCst), 1, "establishing is not a call outcome");
    assert_eq!(link.failures.load(Ordering::SeqCst), 0);
}
