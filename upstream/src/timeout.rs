//! Per-attempt request timeout.
//!
//! The layer sits beneath the retry policy, so every attempt gets the full budget.

use std::time::Duration;

/// Apply [`AttemptTimeout`] to a service.
#[derive(Debug, Clone)]
pub struct AttemptTimeoutLayer {
    timeout: Duration,
}

impl AttemptTimeoutLayer {
    /// Fail any single attempt which runs longer than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> tower::Layer<S> for AttemptTimeoutLayer {
    type Service = AttemptTimeout<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AttemptTimeout {
            service: inner,
            timeout: self.timeout,
        }
    }
}

/// Fails a request with [`hyperdriver::client::Error::RequestTimeout`] when the
/// inner service has not produced a response in time.
#[derive(Debug, Clone)]
pub struct AttemptTimeout<S> {
    service: S,
    timeout: Duration,
}

impl<S, R> tower::Service<R> for AttemptTimeout<S>
where
    S: tower::Service<R, Error = hyperdriver::client::Error>,
{
    type Response = S::Response;
    type Error = hyperdriver::client::Error;
    type Future = self::future::TimeoutFuture<S::Future>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, req: R) -> Self::Future {
        self::future::TimeoutFuture::new(self.service.call(req), self.timeout)
    }
}

mod future {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{ready, Context, Poll};
    use std::time::Duration;

    use pin_project::pin_project;
    use tokio::time::Timeout;

    #[pin_project]
    #[derive(Debug)]
    pub struct TimeoutFuture<F> {
        #[pin]
        future: Timeout<F>,
    }

    impl<F: Future> TimeoutFuture<F> {
        pub(super) fn new(future: F, timeout: Duration) -> Self {
            Self {
                future: tokio::time::timeout(timeout, future),
            }
        }
    }

    impl<F, R> Future for TimeoutFuture<F>
    where
        F: Future<Output = Result<R, hyperdriver::client::Error>>,
    {
        type Output = Result<R, hyperdriver::client::Error>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            Poll::Ready(match ready!(self.project().future.poll(cx)) {
                Ok(result) => result,
                Err(_) => Err(hyperdriver::client::Error::RequestTimeout),
            })
        }
    }
}
