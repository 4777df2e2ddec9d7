// Agent session lifecycle: detached daemons, durable event publishing,
// adaptive polling, and serialized audio notifications

// Session management module (shared between the launcher and the daemon)
pub mod session;

// Durable stream client, publisher, and session snapshots
pub mod stream;

// Daemon binary discovery
pub mod cli_paths;

pub mod error;

pub use error::{NotificationError, PublishError, SoundPackError, SpawnError, StreamError};
pub use session::notify::NotificationPlayer;
pub use session::polling::AdaptivePollingPolicy;
pub use session::spawner::DaemonSpawner;
pub use stream::StreamPublisher;
