//! Retry loop every outbound call passes through.

#[cfg(test)]
#[path = "tests/transmit.rs"]
mod tests;

use core::future::Future;

use mixcomms_primitives::Id;
use tracing::{debug, warn};

use crate::config::MAX_RETRIES;
use crate::{Error, ErrorClass};

/// The per-peer state [`transmit`] drives.
pub(crate) trait Link {
    type Channel;

    fn id(&self) -> &Id;

    fn has_address(&self) -> bool;

    /// Connects and authenticates as needed, then hands out a channel.
    async fn establish(&self) -> Result<Self::Channel, Error>;

    /// Drops the connection and any transmission token.
    fn reset(&self);

    /// Counts a failure to connect or authenticate. These say nothing about
    /// calls the peer proxies, so they only reach the error metric.
    fn record_failure(&self, err: &Error);

    /// Records the outcome of one call, possibly rewriting its error.
    fn observe<T>(&self, result: Result<T, Error>) -> Result<T, Error>;
}

/// Runs `operation` over `link`, reconnecting or re-authenticating after
/// connection and authentication failures, at most [`MAX_RETRIES`] times.
///
/// Any other error is returned as is. Once attempts are exhausted the last
/// error is returned as [`Error::Transmit`], naming the host and the number
/// of attempts made.
pub(crate) async fn transmit<L, F, Fut, T>(link: &L, mut operation: F) -> Result<T, Error>
where
    L: Link,
    F: FnMut(L::Channel) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    if !link.has_address() {
        return Err(Error::NoAddress(*link.id()));
    }

    let mut attempt = 0;

    loop {
        attempt += 1;

        let channel = match link.establish().await {
            Ok(channel) => channel,
            Err(err) => {
                link.record_failure(&err);
                return Err(err);
            }
        };

        let err = match link.observe(operation(channel).await) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match err.class() {
            ErrorClass::Other => return Err(err),
            class => {
                link.reset();

                if attempt >= MAX_RETRIES {
                    debug!(id = %link.id(), attempt, %err, "giving up");
                    return Err(Error::Transmit {
                        id: *link.id(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }

                warn!(id = %link.id(), attempt, ?class, %err, "call failed, retrying");
            }
        }
    }
}
