//! Polls one session's state on the adaptive schedule and cues a sound when
//! it reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use crate::error::StreamError;
use crate::session::notify::{AudioPayload, NotificationPlayer};
use crate::session::polling::{AdaptivePollingPolicy, PollDecision, PollingParams};
use crate::session::protocol::SessionStatus;
use crate::stream::snapshot::{SessionSnapshot, SnapshotSource};

/// Give up on a session nobody has published yet after this many polls
pub const DEFAULT_MAX_UNKNOWN_POLLS: u32 = 15;
/// Consecutive failed fetches tolerated by [`SessionWatcher::run`]
pub const DEFAULT_MAX_FETCH_ERRORS: u32 = 10;

/// Sounds cued when a watched session finishes
pub struct TerminalCues {
    pub player: Arc<NotificationPlayer>,
    pub completed: Option<AudioPayload>,
    pub failed: Option<AudioPayload>,
}

impl TerminalCues {
    fn cue_for(&self, status: SessionStatus) -> Option<&AudioPayload> {
        match status {
            SessionStatus::Completed => self.completed.as_ref(),
            SessionStatus::Failed => self.failed.as_ref(),
            _ => None,
        }
    }
}

/// Result of one poll
#[derive(Debug, Clone, PartialEq)]
pub struct WatchStep {
    pub snapshot: Option<SessionSnapshot>,
    pub decision: PollDecision,
}

pub struct SessionWatcher {
    source: Arc<dyn SnapshotSource>,
    policy: AdaptivePollingPolicy,
    cues: Option<TerminalCues>,
    session_id: String,
    last_status: Option<SessionStatus>,
    unknown_polls: u32,
    max_unknown_polls: u32,
    max_fetch_errors: u32,
}

impl SessionWatcher {
    pub fn new(source: Arc<dyn SnapshotSource>, session_id: impl Into<String>) -> Self {
        Self::with_params(source, session_id, PollingParams::default())
    }

    pub fn with_params(
        source: Arc<dyn SnapshotSource>,
        session_id: impl Into<String>,
        params: PollingParams,
    ) -> Self {
        Self {
            source,
            policy: AdaptivePollingPolicy::new(params),
            cues: None,
            session_id: session_id.into(),
            last_status: None,
            unknown_polls: 0,
            max_unknown_polls: DEFAULT_MAX_UNKNOWN_POLLS,
            max_fetch_errors: DEFAULT_MAX_FETCH_ERRORS,
        }
    }

    pub fn with_cues(mut self, cues: TerminalCues) -> Self {
        self.cues = Some(cues);
        self
    }

    pub fn with_max_unknown_polls(mut self, polls: u32) -> Self {
        self.max_unknown_polls = polls;
        self
    }

    pub fn with_max_fetch_errors(mut self, errors: u32) -> Self {
        self.max_fetch_errors = errors;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn policy(&self) -> &AdaptivePollingPolicy {
        &self.policy
    }

    /// Point the watcher at another session. Backoff and transition
    /// tracking start over.
    pub fn watch(&mut self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        if session_id == self.session_id {
            return;
        }
        tracing::debug!(from = %self.session_id, to = %session_id, "switching watched session");
        self.session_id = session_id;
        self.policy.reset();
        self.last_status = None;
        self.unknown_polls = 0;
    }

    /// Fetch the current snapshot once and decide when to look again
    pub async fn poll_once(&mut self) -> Result<WatchStep, StreamError> {
        let snapshot = self.source.snapshot(&self.session_id).await?;

        let Some(snapshot) = snapshot else {
            // Not published yet; keep looking at the base rate for a while
            self.unknown_polls += 1;
            let decision = if self.unknown_polls > self.max_unknown_polls {
                tracing::debug!(session_id = %self.session_id, "session never appeared");
                PollDecision::Stop
            } else {
                PollDecision::After(Duration::from_millis(self.policy.params().base_interval_ms))
            };
            return Ok(WatchStep {
                snapshot: None,
                decision,
            });
        };
        self.unknown_polls = 0;

        if let Some(status) = snapshot.status {
            let was_running = self.last_status.is_some_and(|s| !s.is_terminal());
            if was_running && status.is_terminal() {
                self.on_finished(status);
            }
            self.last_status = Some(status);
        }

        let decision = self.policy.observe(snapshot.status, &snapshot.fingerprint());
        tracing::trace!(
            session_id = %self.session_id,
            status = ?snapshot.status,
            ?decision,
            "polled session"
        );

        Ok(WatchStep {
            snapshot: Some(snapshot),
            decision,
        })
    }

    /// Poll until polling stops; returns the last snapshot seen.
    ///
    /// A failed fetch is retried at the current interval. More than
    /// `max_fetch_errors` failures in a row end the watch with the last error.
    pub async fn run(&mut self) -> Result<Option<SessionSnapshot>, StreamError> {
        let mut last = None;
        let mut fetch_errors = 0;
        loop {
            let step = match self.poll_once().await {
                Ok(step) => {
                    fetch_errors = 0;
                    step
                }
                Err(e) => {
                    fetch_errors += 1;
                    if fetch_errors > self.max_fetch_errors {
                        tracing::warn!(session_id = %self.session_id, error = %e, "giving up on session");
                        return Err(e);
                    }
                    let retry = Duration::from_millis(self.policy.state().current_interval_ms);
                    tracing::debug!(
                        session_id = %self.session_id,
                        error = %e,
                        attempt = fetch_errors,
                        "snapshot fetch failed, retrying"
                    );
                    tokio::time::sleep(retry).await;
                    continue;
                }
            };
            if step.snapshot.is_some() {
                last = step.snapshot;
            }
            match step.decision {
                PollDecision::Stop => return Ok(last),
                PollDecision::After(interval) => tokio::time::sleep(interval).await,
            }
        }
    }

    fn on_finished(&self, status: SessionStatus) {
        tracing::info!(session_id = %self.session_id, %status, "session finished");

        let Some(cues) = &self.cues else {
            return;
        };
        let Some(cue) = cues.cue_for(status) else {
            return;
        };

        let pending = cues.player.enqueue(cue.clone());
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = pending.await {
                tracing::debug!(%session_id, error = %e, "finish cue not played");
            }
        });
    }
}
