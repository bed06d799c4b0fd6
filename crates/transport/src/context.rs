//! Dial context: cancellation and timeout for in-flight dials

use crate::TransportError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Carried alongside every dial. Cancelling the token (or hitting the
/// timeout) aborts the in-flight dial and drops any partially opened socket.
#[derive(Debug, Clone, Default)]
pub struct DialContext {
    token: CancellationToken,
    timeout: Option<Duration>,
}

impl DialContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout: Some(timeout),
        }
    }

    /// Derived context: cancelled when the parent is, never the other way
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            timeout: self.timeout,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `fut` until it completes, the context is cancelled or the timeout
    /// elapses. The losing future is dropped.
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<TransportError>,
    {
        if self.token.is_cancelled() {
            return Err(TransportError::Canceled);
        }

        let guarded = async {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result.map_err(Into::into),
                    Err(_) => Err(TransportError::Timeout(limit)),
                },
                None => fut.await.map_err(Into::into),
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(TransportError::Canceled),
            result = guarded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = DialContext::new();
        let value = ctx.run(async { Ok::<_, io::Error>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_already_cancelled() {
        let ctx = DialContext::new();
        ctx.cancel();
        let result = ctx.run(async { Ok::<_, io::Error>(()) }).await;
        assert!(matches!(result, Err(TransportError::Canceled)));
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_dial() {
        let ctx = DialContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = ctx
            .run(std::future::pending::<Result<(), io::Error>>())
            .await;
        assert!(matches!(result, Err(TransportError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let ctx = DialContext::with_timeout(Duration::from_secs(5));
        let result = ctx
            .run(std::future::pending::<Result<(), io::Error>>())
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(d)) if d == Duration::from_secs(5)));
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = DialContext::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_error_converted() {
        let ctx = DialContext::new();
        let result = ctx
            .run(async { Err::<(), _>(io::Error::new(io::ErrorKind::ConnectionRefused, "no")) })
            .await;
        match result {
            Err(TransportError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
