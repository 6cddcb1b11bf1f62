//! In-process delivery client and notifier for tests

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::delivery::DeliveryClient;
use crate::error::{DeliveryError, StorePassError};
use crate::notifier::Notifier;

/// Records every URL and answers from a script, then with a fixed status
pub struct MockDeliveryClient {
    default_status: u16,
    script: Mutex<VecDeque<Result<u16, DeliveryError>>>,
    requests: Mutex<Vec<String>>,
}

impl MockDeliveryClient {
    pub fn new(default_status: u16) -> Self {
        Self {
            default_status,
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a one-off response for the next request
    pub fn push_response(&self, response: Result<u16, DeliveryError>) {
        self.script.lock().push_back(response);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl DeliveryClient for MockDeliveryClient {
    async fn deliver(&self, url: &str) -> Result<u16, DeliveryError> {
        info!(url, "Mock gateway request");
        self.requests.lock().push(url.to_string());
        match self.script.lock().pop_front() {
            Some(response) => response,
            None => Ok(self.default_status),
        }
    }
}

/// Keeps every failure it is told about
pub struct RecordingNotifier {
    enabled: bool,
    failures: Mutex<Vec<(String, String)>>,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self {
            enabled: true,
            failures: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports itself as disabled; the scheduler should never call it
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// `(store, trace)` pairs in notification order
    pub fn failures(&self) -> Vec<(String, String)> {
        self.failures.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_store_failure(&self, error: &StorePassError) {
        self.failures
            .lock()
            .push((error.store.clone(), error.trace()));
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
