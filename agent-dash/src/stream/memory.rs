//! In-process [`DurableStream`] with failure injection.
//!
//! Behaves like the HTTP service: creating an existing key conflicts and
//! appending to a missing key is a 404. Used by tests and for running the
//! publisher without a stream server.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::StreamError;
use crate::session::protocol::decode_record;
use crate::stream::client::DurableStream;

#[derive(Debug, Default)]
struct MemoryState {
    streams: HashMap<String, Vec<String>>,
    failing_creates: usize,
    failing_appends: usize,
    create_calls: usize,
    append_calls: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStream {
    state: Mutex<MemoryState>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` append calls fail with a 503
    pub fn fail_next_appends(&self, n: usize) {
        self.state().failing_appends = n;
    }

    /// Make the next `n` create calls fail with a 503
    pub fn fail_next_creates(&self, n: usize) {
        self.state().failing_creates = n;
    }

    pub fn exists(&self, key: &str) -> bool {
        self.state().streams.contains_key(key)
    }

    /// Raw records appended to `key`
    pub fn records(&self, key: &str) -> Vec<String> {
        self.state().streams.get(key).cloned().unwrap_or_default()
    }

    /// Records of `key` decoded as `T`; undecodable records are skipped
    pub fn decoded<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        self.records(key)
            .iter()
            .filter_map(|line| decode_record(line).ok())
            .collect()
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    pub fn append_calls(&self) -> usize {
        self.state().append_calls
    }
}

fn unavailable(key: &str) -> StreamError {
    StreamError::Status {
        key: key.to_string(),
        status: 503,
        message: "injected failure".to_string(),
    }
}

#[async_trait]
impl DurableStream for MemoryStream {
    async fn create(&self, key: &str) -> Result<(), StreamError> {
        let mut state = self.state();
        state.create_calls += 1;
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(unavailable(key));
        }
        if state.streams.contains_key(key) {
            return Err(StreamError::Conflict(key.to_string()));
        }
        state.streams.insert(key.to_string(), Vec::new());
        Ok(())
    }

    async fn append(&self, key: &str, records: &[String]) -> Result<(), StreamError> {
        let mut state = self.state();
        state.append_calls += 1;
        if state.failing_appends > 0 {
            state.failing_appends -= 1;
            return Err(unavailable(key));
        }
        match state.streams.get_mut(key) {
            Some(stream) => {
                stream.extend(records.iter().cloned());
                Ok(())
            }
            None => Err(StreamError::Status {
                key: key.to_string(),
                status: 404,
                message: "stream not found".to_string(),
            }),
        }
    }

    async fn read(&self, key: &str) -> Result<Vec<String>, StreamError> {
        self.state()
            .streams
            .get(key)
            .cloned()
            .ok_or_else(|| StreamError::Status {
                key: key.to_string(),
                status: 404,
                message: "stream not found".to_string(),
            })
    }
}
