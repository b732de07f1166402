//! An in-process upstream for tests.
//!
//! [`MockService`] is a tower service answering from a table of routes keyed by
//! request path. Clones share the route table and request log, so a test can
//! hand one clone to an [`UpstreamFetcher`](crate::UpstreamFetcher) and inspect
//! hit counts and captured headers through another.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use hyperdriver::Body;
use parking_lot::Mutex;

use crate::BoxFuture;

/// A canned response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl MockResponse {
    /// An empty response with `status`.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// `200 OK` with `body`.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK).body(body)
    }

    /// `200 OK` with a JSON body.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::ok(value.to_string()).header("content-type", "application/json")
    }

    /// Add a header.
    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.append(name, value);
        }
        self
    }

    /// Replace the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// A request the mock received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request method.
    pub method: Method,
    /// Full request URI.
    pub uri: Uri,
    /// Request headers.
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
struct Route {
    response: MockResponse,
    authorization: Option<(HeaderValue, MockResponse)>,
    failures: usize,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct State {
    routes: HashMap<String, Route>,
    requests: Vec<RecordedRequest>,
}

/// A scripted upstream server.
#[derive(Debug, Default, Clone)]
pub struct MockService {
    state: Arc<Mutex<State>>,
}

impl MockService {
    /// A mock with no routes. Unknown paths answer 404.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer requests for `path` with `response`.
    pub fn add(&self, path: &str, response: MockResponse) -> &Self {
        self.state.lock().routes.insert(
            path.to_owned(),
            Route {
                response,
                authorization: None,
                failures: 0,
                delay: None,
            },
        );
        self
    }

    /// Answer `rejection` unless the request carries exactly `authorization`.
    pub fn require_authorization(
        &self,
        path: &str,
        authorization: &str,
        rejection: MockResponse,
    ) -> &Self {
        let value = HeaderValue::from_str(authorization).unwrap_or(HeaderValue::from_static(""));
        if let Some(route) = self.state.lock().routes.get_mut(path) {
            route.authorization = Some((value, rejection));
        }
        self
    }

    /// Fail the next `times` requests for `path` with a connection-level error.
    pub fn fail_next(&self, path: &str, times: usize) -> &Self {
        if let Some(route) = self.state.lock().routes.get_mut(path) {
            route.failures = times;
        }
        self
    }

    /// Delay every answer for `path`.
    pub fn delay(&self, path: &str, delay: Duration) -> &Self {
        if let Some(route) = self.state.lock().routes.get_mut(path) {
            route.delay = Some(delay);
        }
        self
    }

    /// Number of requests received for `path`, including failed ones.
    pub fn hits(&self, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|req| req.uri.path() == path)
            .count()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    fn answer(&self, req: &Request<Body>) -> (Option<Duration>, Option<MockResponse>) {
        let mut state = self.state.lock();
        state.requests.push(RecordedRequest {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
        });

        let Some(route) = state.routes.get_mut(req.uri().path()) else {
            return (None, Some(MockResponse::new(StatusCode::NOT_FOUND)));
        };

        if route.failures > 0 {
            route.failures -= 1;
            return (route.delay, None);
        }

        let response = match &route.authorization {
            Some((expected, rejection))
                if req.headers().get(http::header::AUTHORIZATION) != Some(expected) =>
            {
                rejection.clone()
            }
            _ => route.response.clone(),
        };
        (route.delay, Some(response))
    }
}

impl tower::Service<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = hyperdriver::client::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let (delay, response) = self.answer(&req);
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match response {
                Some(response) => Ok(response.into_response()),
                None => Err(hyperdriver::client::Error::RequestTimeout),
            }
        })
    }
}
