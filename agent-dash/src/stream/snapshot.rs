//! Session state folded from the registry and session streams.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::StreamError;
use crate::session::protocol::{
    decode_record, session_stream_key, RegistryEvent, SessionStatus, SessionStreamEvent,
    TokenUsage, REGISTRY_STREAM_KEY,
};
use crate::stream::client::DurableStream;

/// What a watcher knows about one session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: Option<SessionStatus>,
    pub output_count: usize,
    /// Total bytes of output content
    pub output_len: usize,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub cli_session_id: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

impl SessionSnapshot {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Fold a registry record; records of other sessions are ignored
    pub fn apply_registry(&mut self, event: &RegistryEvent) {
        if event.session_id() != self.session_id {
            return;
        }

        match event {
            RegistryEvent::SessionCreated { .. } => {
                if self.status.is_none() {
                    self.status = Some(SessionStatus::Pending);
                }
            }
            RegistryEvent::SessionCompleted {
                timestamp,
                token_usage,
                ..
            } => {
                self.status = Some(SessionStatus::Completed);
                self.completed_at = Some(*timestamp);
                self.token_usage = token_usage.clone();
            }
            RegistryEvent::SessionFailed {
                timestamp, error, ..
            } => {
                self.status = Some(SessionStatus::Failed);
                self.completed_at = Some(*timestamp);
                self.error = Some(error.clone());
            }
            RegistryEvent::SessionCancelled { timestamp, .. } => {
                self.status = Some(SessionStatus::Cancelled);
                self.completed_at = Some(*timestamp);
            }
        }
    }

    pub fn apply_session(&mut self, event: &SessionStreamEvent) {
        match event {
            SessionStreamEvent::Output { chunk, .. } => {
                self.output_count += 1;
                self.output_len += chunk.content.len();
            }
            SessionStreamEvent::CliSessionId { cli_session_id, .. } => {
                self.cli_session_id = Some(cli_session_id.clone());
            }
            SessionStreamEvent::StatusChanged { status, .. } => {
                // The registry's terminal verdict is final
                if !self.is_terminal() {
                    self.status = Some(*status);
                }
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(|s| s.is_terminal())
    }

    /// Cheap digest that changes whenever something a watcher shows changes
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.status.map(|s| s.as_str()).unwrap_or("none"));
        hasher.update([0u8]);
        hasher.update(self.output_len.to_le_bytes());
        hasher.update(self.output_count.to_le_bytes());
        hasher.update([0u8]);
        if let Some(completed_at) = self.completed_at {
            hasher.update(completed_at.to_rfc3339());
        }
        hasher.update([0u8]);
        if let Some(error) = &self.error {
            hasher.update(error);
        }
        hex::encode(hasher.finalize())
    }
}

/// Where a watcher reads session state from
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// `None` when the session is not (yet) known
    async fn snapshot(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StreamError>;
}

/// Rebuilds snapshots by reading the registry and session streams
pub struct StreamSnapshotSource {
    client: Arc<dyn DurableStream>,
}

impl StreamSnapshotSource {
    pub fn new(client: Arc<dyn DurableStream>) -> Self {
        Self { client }
    }

    /// A stream that was never created reads as empty
    async fn read_or_empty(&self, key: &str) -> Result<Vec<String>, StreamError> {
        match self.client.read(key).await {
            Ok(records) => Ok(records),
            Err(StreamError::Status { status: 404, .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

fn decode_all<T: for<'de> serde::Deserialize<'de>>(key: &str, records: &[String]) -> Vec<T> {
    records
        .iter()
        .filter_map(|line| match decode_record(line) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!(stream = key, error = %e, "skipping undecodable record");
                None
            }
        })
        .collect()
}

#[async_trait]
impl SnapshotSource for StreamSnapshotSource {
    async fn snapshot(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StreamError> {
        let registry = self.read_or_empty(REGISTRY_STREAM_KEY).await?;
        let registry: Vec<RegistryEvent> = decode_all(REGISTRY_STREAM_KEY, &registry);

        let session_key = session_stream_key(session_id);
        let events = self.read_or_empty(&session_key).await?;
        let events: Vec<SessionStreamEvent> = decode_all(&session_key, &events);

        let known = registry.iter().any(|e| e.session_id() == session_id);
        if !known && events.is_empty() {
            return Ok(None);
        }

        let mut snapshot = SessionSnapshot::new(session_id);
        for event in &registry {
            snapshot.apply_registry(event);
        }
        for event in &events {
            snapshot.apply_session(event);
        }
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::protocol::{encode_record, AgentType, OutputChunk, OutputKind};
    use crate::stream::memory::MemoryStream;

    fn created(session_id: &str) -> RegistryEvent {
        RegistryEvent::SessionCreated {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            agent_type: AgentType::Codex,
            prompt: "p".into(),
            model: None,
            working_dir: "/w".into(),
        }
    }

    #[test]
    fn test_terminal_registry_status_wins() {
        let mut snapshot = SessionSnapshot::new("s");
        snapshot.apply_registry(&created("s"));
        assert_eq!(snapshot.status, Some(SessionStatus::Pending));

        snapshot.apply_registry(&RegistryEvent::SessionCancelled {
            session_id: "s".into(),
            timestamp: Utc::now(),
        });
        snapshot.apply_session(&SessionStreamEvent::status(SessionStatus::Working));
        assert_eq!(snapshot.status, Some(SessionStatus::Cancelled));
        assert!(snapshot.completed_at.is_some());
    }

    #[test]
    fn test_other_sessions_are_ignored() {
        let mut snapshot = SessionSnapshot::new("s");
        snapshot.apply_registry(&created("other"));
        assert_eq!(snapshot.status, None);
    }

    #[test]
    fn test_fingerprint_tracks_visible_changes() {
        let mut snapshot = SessionSnapshot::new("s");
        snapshot.apply_session(&SessionStreamEvent::status(SessionStatus::Idle));
        let idle = snapshot.fingerprint();
        assert_eq!(idle, snapshot.clone().fingerprint());

        snapshot.apply_session(&SessionStreamEvent::CliSessionId {
            timestamp: Utc::now(),
            cli_session_id: "cli".into(),
        });
        assert_eq!(idle, snapshot.fingerprint(), "cli id is not shown");

        snapshot.apply_session(&SessionStreamEvent::output(OutputChunk::new(
            OutputKind::Stdout,
            "more",
        )));
        assert_ne!(idle, snapshot.fingerprint());
        assert_eq!(snapshot.fingerprint().len(), 64);
    }

    #[tokio::test]
    async fn test_stream_source_folds_both_streams() {
        let store = Arc::new(MemoryStream::new());
        store.create(REGISTRY_STREAM_KEY).await.unwrap();
        store.create("sessions/s").await.unwrap();
        store
            .append(
                REGISTRY_STREAM_KEY,
                &[encode_record(&created("s")).unwrap(), "not json".to_string()],
            )
            .await
            .unwrap();
        store
            .append(
                "sessions/s",
                &[
                    encode_record(&SessionStreamEvent::status(SessionStatus::Working)).unwrap(),
                    encode_record(&SessionStreamEvent::output(OutputChunk::new(
                        OutputKind::Stdout,
                        "hello",
                    )))
                    .unwrap(),
                ],
            )
            .await
            .unwrap();

        let source = StreamSnapshotSource::new(store.clone());
        let snapshot = source.snapshot("s").await.unwrap().unwrap();
        assert_eq!(snapshot.status, Some(SessionStatus::Working));
        assert_eq!(snapshot.output_count, 1);
        assert_eq!(snapshot.output_len, 5);

        assert!(source.snapshot("unknown").await.unwrap().is_none());
    }
}
