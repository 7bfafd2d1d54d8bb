//! ScriptedTransport - テスト用の Transport
//!
//! Replays queued responses in order, then answers with a default status.
//! Every request is recorded.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use crate::ports::{Transport, TransportError, TransportRequest, TransportResponse};

struct State {
    replies: VecDeque<Result<TransportResponse, TransportError>>,
    requests: Vec<TransportRequest>,
    default_status: u16,
    default_body: Bytes,
}

pub struct ScriptedTransport {
    state: Mutex<State>,
}

impl ScriptedTransport {
    /// Answers 200 with an empty body unless scripted otherwise.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                replies: VecDeque::new(),
                requests: Vec::new(),
                default_status: 200,
                default_body: Bytes::new(),
            }),
        }
    }

    pub fn with_default_status(self, status: u16) -> Self {
        self.state().default_status = status;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_response(&self, response: TransportResponse) {
        self.state().replies.push_back(Ok(response));
    }

    /// Queue a JSON body with the given status.
    pub fn push_json(&self, status: u16, body: &serde_json::Value) {
        let mut response = TransportResponse::new(status, body.to_string());
        response
            .headers
            .push(("content-type".to_string(), "application/json".to_string()));
        self.push_response(response);
    }

    pub fn push_error(&self, error: TransportError) {
        self.state().replies.push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.state().requests.clone()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut state = self.state();
        state.requests.push(request);
        match state.replies.pop_front() {
            Some(reply) => reply,
            None => Ok(TransportResponse::new(
                state.default_status,
                state.default_body.clone(),
            )),
        }
    }
}
