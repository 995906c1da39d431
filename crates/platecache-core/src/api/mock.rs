//! Scriptable in-memory transport.
//!
//! Routes are matched on method and exact URL. Unmatched requests get a 404.
//! Every call to `send` is recorded, including calls made while offline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::transport::{Method, Request, Response, Transport};
use super::ApiError;

#[derive(Default)]
struct MockState {
    online: bool,
    latency: Option<Duration>,
    routes: HashMap<(Method, String), Response>,
    requests: Vec<Request>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create an online transport with no routes.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                online: true,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    /// Delay every response, so concurrent callers overlap.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Answer `method url` with a status and JSON body.
    pub fn respond(&self, method: Method, url: &str, status: u16, body: Value) {
        self.state().routes.insert(
            (method, url.to_string()),
            Response {
                status,
                body: body.to_string(),
            },
        );
    }

    /// Every request sent so far, oldest first.
    pub fn requests(&self) -> Vec<Request> {
        self.state().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &Request) -> Result<Response, ApiError> {
        let latency = {
            let mut state = self.state();
            state.requests.push(request.clone());
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let state = self.state();
        if !state.online {
            return Err(ApiError::Offline(format!(
                "{} {} failed: network is down",
                request.method, request.url
            )));
        }
        Ok(state
            .routes
            .get(&(request.method, request.url.clone()))
            .cloned()
            .unwrap_or(Response {
                status: 404,
                body: String::from("Not Found"),
            }))
    }
}
