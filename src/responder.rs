//! The canned-response handler behind [`FakeHttpServer`](crate::FakeHttpServer).
//!
//! A [`FakeResponder`] answers every request with the same configured body and
//! status, and remembers the URL of the last request it saw.
//!
//! `handle` takes `&mut self` and the responder holds no lock of its own. When
//! several requests reach the same responder at once, the caller has to
//! serialize them; the hosting server does that with a mutex, and whichever
//! request takes the lock last is the one left in `last_url_received`.
use hyper::header::{HeaderValue, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use hyper::{Body, Request, Uri};
use serde::Serialize;

use crate::StatusCode;

pub type Response = hyper::Response<Body>;

/// Body written in place of the configured one when an error status is injected.
pub const INJECTED_ERROR_BODY: &str = "Test-injected error\n";

#[derive(Debug, Default, Clone)]
pub struct FakeResponder {
    response_json: String,
    response_http_status: Option<u16>,
    last_url_received: Option<Uri>,
}

impl FakeResponder {
    pub fn new(response_json: impl Into<String>) -> FakeResponder {
        FakeResponder {
            response_json: response_json.into(),
            ..FakeResponder::default()
        }
    }

    /// Serializes `value` into the canned body.
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<FakeResponder, serde_json::Error> {
        Ok(FakeResponder::new(serde_json::to_string(value)?))
    }

    /// `0` is the same as leaving the status unset.
    pub fn response_http_status(mut self, status: u16) -> FakeResponder {
        self.response_http_status = Some(status);
        self
    }

    pub fn configure(&mut self, response_json: impl Into<String>, status: Option<u16>) {
        self.response_json = response_json.into();
        self.response_http_status = status;
    }

    pub fn set_response_json(&mut self, response_json: impl Into<String>) {
        self.response_json = response_json.into();
    }

    pub fn set_response_http_status(&mut self, status: Option<u16>) {
        self.response_http_status = status;
    }

    pub fn response_json(&self) -> &str {
        &self.response_json
    }

    pub fn last_url_received(&self) -> Option<&Uri> {
        self.last_url_received.as_ref()
    }

    /// Records the request URL, then builds the canned response.
    ///
    /// Method, headers and body of the request are ignored. An injected status
    /// the HTTP layer refuses (say `1000`) surfaces as the builder's error.
    pub fn handle<B>(&mut self, req: &Request<B>) -> Result<Response, hyper::http::Error> {
        self.last_url_received = Some(req.uri().clone());

        match self.injected_status() {
            Some(status) => hyper::Response::builder()
                .status(status)
                .header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))
                .header(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"))
                .body(Body::from(INJECTED_ERROR_BODY)),
            None => hyper::Response::builder()
                .status(StatusCode::OK)
                .body(Body::from(self.response_json.clone())),
        }
    }

    fn injected_status(&self) -> Option<u16> {
        self.response_http_status
            .filter(|status| *status != 0 && *status != StatusCode::OK.as_u16())
    }
}
