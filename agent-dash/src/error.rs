//! Error taxonomy for the daemon/stream/notification core.
//!
//! Kill failures have no variant: `DaemonSpawner::kill` reports them
//! as `false` and logs. Destination conflicts surface as
//! [`StreamError::Conflict`] and are mapped to success by the publisher.

use thiserror::Error;

/// Failure to launch a daemon process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn daemon for session {session_id}: {source}")]
    SpawnFailed {
        session_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid spawn config: {0}")]
    InvalidConfig(String),
}

/// Errors reported by a [`crate::stream::DurableStream`] implementation.
#[derive(Debug, Error)]
pub enum StreamError {
    /// `create` found the destination already present.
    #[error("stream {0} already exists")]
    Conflict(String),

    #[error("stream server returned {status} for {key}: {message}")]
    Status {
        key: String,
        status: u16,
        message: String,
    },

    /// The base url or a stream key can't be turned into a request url.
    #[error("invalid stream url: {0}")]
    InvalidUrl(String),

    #[error("stream transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode stream record: {0}")]
    Decode(#[from] serde_json::Error),
}

impl StreamError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Errors surfaced by the stream publisher.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish to {destination} failed: {source}")]
    Stream {
        destination: String,
        #[source]
        source: StreamError,
    },

    #[error("gave up on {count} events for {destination} after {attempts} failed flushes")]
    DeadLettered {
        destination: String,
        count: usize,
        attempts: u32,
    },
}

impl PublishError {
    pub fn destination(&self) -> Option<&str> {
        match self {
            Self::Encode(_) => None,
            Self::Stream { destination, .. } | Self::DeadLettered { destination, .. } => {
                Some(destination)
            }
        }
    }
}

/// Errors settled on a queued notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("playback failed: {0}")]
    PlaybackFailed(String),

    #[error("no audio output device available")]
    NoOutputDevice,

    #[error("failed to decode audio: {0}")]
    Decode(String),

    /// The item was still queued when the player was stopped.
    #[error("notification queue cleared")]
    Cleared,

    /// The item was playing when the player was stopped.
    #[error("playback stopped")]
    Stopped,

    #[error("notification player is closed")]
    PlayerClosed,
}

/// Errors loading cues from a sound pack.
#[derive(Debug, Error)]
pub enum SoundPackError {
    #[error("failed to open sound pack {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read sound pack archive: {0}")]
    Archive(String),

    #[error("no sound files matching '{0}'")]
    NotFound(String),
}
