use std::cell::{Cell, RefCell};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{FetchError, service_error_in};
use crate::retry::{Attempt, RetryPolicy};

/// Shared HTTP state for one pipeline run.
///
/// Every component borrows the same session, so request pacing and counters
/// cover the whole run. Open it with [`Session::scoped`] to guarantee it is
/// closed on both success and failure.
#[derive(Debug)]
pub struct Session {
    http: RefCell<HttpClient>,
    timeout: Duration,
    verify: Cell<bool>,
    throttle: Duration,
    retry: RetryPolicy,

    last_request: Cell<Option<Instant>>,
    requests: Cell<u64>,
    failures: Cell<u64>,
}

impl Session {
    pub fn open(config: &Config) -> Result<Self> {
        let retry = RetryPolicy {
            max_attempts: config.retry_max,
            delay: config.retry_delay,
            max_delay: config.retry_delay_max,
        };
        Self::with_settings(config.timeout, config.verify, config.throttle, retry)
    }

    pub fn with_settings(
        timeout: Duration,
        verify: bool,
        throttle: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let http = build_http(timeout, verify)?;
        Ok(Self {
            http: RefCell::new(http),
            timeout,
            verify: Cell::new(verify),
            throttle,
            retry,
            last_request: Cell::new(None),
            requests: Cell::new(0),
            failures: Cell::new(0),
        })
    }

    /// Opens a session, runs `f` with it and closes it whatever `f` returns.
    ///
    /// The session is also closed if `f` panics, as it is dropped while unwinding.
    pub fn scoped<T>(config: &Config, f: impl FnOnce(&Session) -> T) -> Result<T> {
        let session = Self::open(config)?;
        let out = f(&session);
        session.close();
        Ok(out)
    }

    pub fn close(self) {
        drop(self);
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn requests(&self) -> u64 {
        self.requests.get()
    }

    pub fn verifies_tls(&self) -> bool {
        self.verify.get()
    }

    /// Rebuilds the HTTP client with certificate verification disabled.
    pub fn disable_tls_verification(&self) -> Result<()> {
        let http = build_http(self.timeout, false)?;
        *self.http.borrow_mut() = http;
        self.verify.set(false);
        warn!("TLS certificate verification disabled for the rest of this run");
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Attempt<T> {
        self.send(url, |http| http.get(url).query(query))
            .and_then(|text| decode_json(url, &text))
    }

    pub fn post_form_json<T: DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Attempt<T> {
        self.send(url, |http| http.post(url).form(form))
            .and_then(|text| decode_json(url, &text))
    }

    pub fn get_text(&self, url: &str) -> Attempt<String> {
        self.send(url, |http| http.get(url))
    }

    fn send<F>(&self, url: &str, build: F) -> Attempt<String>
    where
        F: FnOnce(&HttpClient) -> RequestBuilder,
    {
        self.pace();
        self.requests.set(self.requests.get() + 1);
        debug!(url, "request");

        let http = self.http.borrow().clone();
        let attempt = match build(&http).send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                match resp.text() {
                    Ok(text) if (200..300).contains(&status) => {
                        match service_error_in(status, url, &text) {
                            Some(err) => Attempt::from_error(err),
                            None => Attempt::Done(text),
                        }
                    }
                    Ok(text) => Attempt::from_error(
                        service_error_in(status, url, &text).unwrap_or(FetchError::Status {
                            url: url.to_string(),
                            status,
                        }),
                    ),
                    Err(e) => Attempt::Retryable(network_error(url, &e)),
                }
            }
            Err(e) => Attempt::Retryable(network_error(url, &e)),
        };

        if !matches!(attempt, Attempt::Done(_)) {
            self.failures.set(self.failures.get() + 1);
        }
        attempt
    }

    fn pace(&self) {
        if let Some(last) = self.last_request.get() {
            let elapsed = last.elapsed();
            if elapsed < self.throttle {
                thread::sleep(self.throttle - elapsed);
            }
        }
        self.last_request.set(Some(Instant::now()));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        info!(
            requests = self.requests.get(),
            failures = self.failures.get(),
            "session closed"
        );
    }
}

fn build_http(timeout: Duration, verify: bool) -> Result<HttpClient> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("floodfetch/{}", env!("CARGO_PKG_VERSION")))
            .unwrap_or(HeaderValue::from_static("floodfetch")),
    );
    default_headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    default_headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

    let mut builder = HttpClient::builder()
        .default_headers(default_headers)
        .timeout(timeout);

    if !verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().context("failed to build HTTP client")
}

fn decode_json<T: DeserializeOwned>(url: &str, text: &str) -> Result<T, FetchError> {
    serde_json::from_str::<T>(text).map_err(|e| FetchError::Parse {
        url: url.to_string(),
        message: e.to_string(),
    })
}

fn network_error(url: &str, err: &reqwest::Error) -> FetchError {
    // reqwest's Display stops at the outermost layer; the cause chain names the real problem.
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    FetchError::Network {
        url: url.to_string(),
        message,
    }
}

/// Whether a failure was caused by certificate verification.
pub fn is_certificate_error(err: &FetchError) -> bool {
    let inner = match err {
        FetchError::Exhausted { last, .. } => last.as_ref(),
        other => other,
    };
    match inner {
        FetchError::Network { message, .. } => message.to_lowercase().contains("certificate"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::AssertUnwindSafe;
    use std::sync::{Arc, Mutex};

    #[test]
    fn certificate_errors_are_recognized_through_exhaustion() {
        let err = FetchError::Exhausted {
            attempts: 2,
            last: Box::new(FetchError::Network {
                url: "https://x".into(),
                message: "error sending request: invalid peer certificate: UnknownIssuer".into(),
            }),
        };
        assert!(is_certificate_error(&err));
        assert!(!is_certificate_error(&FetchError::Status {
            url: "u".into(),
            status: 500
        }));
    }

    #[test]
    fn decode_failure_is_a_parse_error() {
        let err = decode_json::<serde_json::Value>("http://x", "<html>").unwrap_err();
        assert!(err.is_parse());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn scoped_session_closes_when_the_body_panics() {
        let logs = Captured::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let config = Config {
            progress: false,
            ..Config::default()
        };
        let outcome = tracing::subscriber::with_default(subscriber, || {
            std::panic::catch_unwind(AssertUnwindSafe(|| {
                Session::scoped(&config, |_| -> () { panic!("body failed") })
            }))
        });

        assert!(outcome.is_err());
        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("session closed"), "{text}");
    }
}
