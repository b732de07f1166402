use std::time::Duration;

use http::Request;
use hyperdriver::Body;
use rand::Rng as _;
use tower::retry::Policy;

/// Retry requests which failed to produce any response, with exponential backoff
/// and jitter.
///
/// Responses are never retried, whatever their status: an upstream 5xx is an
/// answer and is handed back to the caller.
#[derive(Debug, Clone)]
pub struct NetworkRetry {
    remaining: usize,
    delay: Duration,
    max_delay: Duration,
}

impl NetworkRetry {
    /// Retry up to `retries` times, starting at `delay` and doubling up to `max_delay`.
    pub fn new(retries: usize, delay: Duration, max_delay: Duration) -> Self {
        Self {
            remaining: retries,
            delay,
            max_delay,
        }
    }

    /// The next sleep: the current delay plus up to half of it again.
    fn next_delay(&mut self) -> Duration {
        let base = self.delay;
        self.delay = self.delay.saturating_mul(2).min(self.max_delay);

        let spread = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread)
        };
        base + Duration::from_millis(jitter)
    }
}

impl<Res, E> Policy<Request<Body>, Res, E> for NetworkRetry
where
    E: std::fmt::Display,
{
    type Future = tokio::time::Sleep;

    fn retry(
        &mut self,
        req: &mut Request<Body>,
        result: &mut Result<Res, E>,
    ) -> Option<Self::Future> {
        let Err(error) = result else {
            return None;
        };
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delay = self.next_delay();
        tracing::warn!(
            uri = %req.uri(),
            %error,
            ?delay,
            remaining = self.remaining,
            "retrying upstream request"
        );
        Some(tokio::time::sleep(delay))
    }

    fn clone_request(&mut self, req: &Request<Body>) -> Option<Request<Body>> {
        try_clone_request(req)
    }
}

pub(crate) fn try_clone_request(req: &Request<Body>) -> Option<Request<Body>> {
    let body = req.body().try_clone()?;

    let mut next = Request::new(body);
    *next.method_mut() = req.method().clone();
    *next.uri_mut() = req.uri().clone();
    *next.version_mut() = req.version();
    *next.headers_mut() = req.headers().clone();
    *next.extensions_mut() = req.extensions().clone();

    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let mut policy =
            NetworkRetry::new(5, Duration::from_millis(100), Duration::from_millis(250));

        let first = policy.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));

        let second = policy.next_delay();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));

        let third = policy.next_delay();
        assert!(third >= Duration::from_millis(250) && third <= Duration::from_millis(375));
    }

    #[test]
    fn responses_are_not_retried() {
        let mut policy = NetworkRetry::new(2, Duration::ZERO, Duration::ZERO);
        let mut req = Request::new(Body::empty());
        let mut result: Result<u16, String> = Ok(503);
        assert!(policy.retry(&mut req, &mut result).is_none());
    }

    #[tokio::test]
    async fn errors_are_retried_until_exhausted() {
        let mut policy = NetworkRetry::new(2, Duration::ZERO, Duration::ZERO);
        let mut req = Request::new(Body::empty());
        let mut result: Result<u16, String> = Err("connection reset".into());

        assert!(policy.retry(&mut req, &mut result).is_some());
        assert!(policy.retry(&mut req, &mut result).is_some());
        assert!(policy.retry(&mut req, &mut result).is_none());
    }
}
