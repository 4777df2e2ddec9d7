//! Serialized audio notifications for session state changes.
//!
//! [`NotificationPlayer`] owns a FIFO of pending cues drained by a single
//! consumer task, so at most one cue plays at a time. Each enqueue returns a
//! [`PendingNotification`] that settles when that cue finished or failed; a
//! failed cue never blocks the ones behind it.
//!
//! Cues come from ZIP sound packs (`<name>.mp3` or `<name>.<variant>.mp3`)
//! and are played through an [`AudioBackend`], rodio by default.

use std::collections::VecDeque;
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use rc_zip_sync::ReadZip;
use tokio::sync::{oneshot, Notify};

use crate::error::{NotificationError, SoundPackError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Encoded audio (mp3, wav, ogg...) plus a label for logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    pub label: String,
    pub bytes: Arc<[u8]>,
}

impl AudioPayload {
    pub fn new(label: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            label: label.into(),
            bytes: bytes.into(),
        }
    }
}

/// Platform audio primitive.
pub trait AudioBackend: Send + Sync + 'static {
    /// Play `payload` to the end, blocking the calling thread.
    fn play(&self, payload: &AudioPayload) -> Result<(), NotificationError>;

    /// Halt the current playback so a blocked `play` returns.
    fn stop(&self);
}

type Outcome = Result<(), NotificationError>;

struct QueuedNotification {
    payload: AudioPayload,
    done: oneshot::Sender<Outcome>,
}

struct PlayerShared {
    queue: Mutex<VecDeque<QueuedNotification>>,
    wake: Notify,
    playing: AtomicBool,
    /// Bumped by `stop()`; a playback started under an older generation was interrupted
    generation: AtomicU64,
    closed: AtomicBool,
}

/// Settles when the enqueued cue has played (or failed to).
#[must_use = "dropping the handle does not cancel playback, but the outcome is lost"]
pub struct PendingNotification {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for PendingNotification {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(NotificationError::PlayerClosed)))
    }
}

/// Single-flight notification queue.
///
/// Must be created inside a Tokio runtime; the drain task is spawned there
/// and exits once the player is dropped and the in-flight cue finished.
pub struct NotificationPlayer {
    shared: Arc<PlayerShared>,
    backend: Arc<dyn AudioBackend>,
}

impl NotificationPlayer {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        let shared = Arc::new(PlayerShared {
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            playing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(drain(Arc::clone(&shared), Arc::clone(&backend)));

        Self { shared, backend }
    }

    /// Queue a cue without waiting for it.
    pub fn enqueue(&self, payload: AudioPayload) -> PendingNotification {
        let (done, rx) = oneshot::channel();

        if self.shared.closed.load(Ordering::SeqCst) {
            let _ = done.send(Err(NotificationError::PlayerClosed));
        } else {
            tracing::trace!(label = %payload.label, "queued notification");
            lock(&self.shared.queue).push_back(QueuedNotification { payload, done });
            self.shared.wake.notify_one();
        }

        PendingNotification { rx }
    }

    /// True while a cue is being played
    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Halt the current cue and reject everything still queued.
    ///
    /// Queued cues settle with [`NotificationError::Cleared`], the interrupted
    /// one with [`NotificationError::Stopped`]. Already-settled cues are
    /// unaffected.
    pub fn stop(&self) {
        let cleared: Vec<QueuedNotification> = {
            let mut queue = lock(&self.shared.queue);
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            queue.drain(..).collect()
        };
        self.backend.stop();

        if !cleared.is_empty() {
            tracing::debug!(count = cleared.len(), "cleared queued notifications");
        }
        for item in cleared {
            let _ = item.done.send(Err(NotificationError::Cleared));
        }
    }
}

impl Drop for NotificationPlayer {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let abandoned: Vec<QueuedNotification> = lock(&self.shared.queue).drain(..).collect();
        for item in abandoned {
            let _ = item.done.send(Err(NotificationError::PlayerClosed));
        }
        self.shared.wake.notify_one();
    }
}

async fn drain(shared: Arc<PlayerShared>, backend: Arc<dyn AudioBackend>) {
    loop {
        // Pair the item with the generation it was dequeued under
        let next = {
            let mut queue = lock(&shared.queue);
            queue
                .pop_front()
                .map(|item| (item, shared.generation.load(Ordering::SeqCst)))
        };

        let Some((item, generation)) = next else {
            shared.playing.store(false, Ordering::SeqCst);
            if shared.closed.load(Ordering::SeqCst) {
                break;
            }
            shared.wake.notified().await;
            continue;
        };

        shared.playing.store(true, Ordering::SeqCst);
        let QueuedNotification { payload, done } = item;
        let label = payload.label.clone();

        let playback = {
            let shared = Arc::clone(&shared);
            let backend = Arc::clone(&backend);
            tokio::task::spawn_blocking(move || {
                if shared.generation.load(Ordering::SeqCst) != generation {
                    return Err(NotificationError::Stopped);
                }
                backend.play(&payload)
            })
        };

        let mut outcome = match playback.await {
            Ok(outcome) => outcome,
            Err(e) => Err(NotificationError::PlaybackFailed(format!(
                "playback task failed: {}",
                e
            ))),
        };
        if shared.generation.load(Ordering::SeqCst) != generation {
            outcome = Err(NotificationError::Stopped);
        }

        match &outcome {
            Ok(()) => tracing::debug!(%label, "notification played"),
            Err(e) => tracing::warn!(%label, error = %e, "notification playback failed"),
        }
        let _ = done.send(outcome);
    }
}

// ============================================================================
// Rodio backend
// ============================================================================

#[cfg(feature = "audio")]
pub use self::rodio_backend::{AudioOutput, RodioBackend};

#[cfg(feature = "audio")]
mod rodio_backend {
    use super::{lock, AudioBackend, AudioPayload};
    use crate::error::NotificationError;
    use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
    use std::io::{BufReader, Cursor};
    use std::sync::{Arc, Mutex};

    /// Keeps the output device open; must stay alive on the thread that created it
    pub struct AudioOutput {
        _stream: OutputStream,
    }

    pub struct RodioBackend {
        handle: OutputStreamHandle,
        current: Mutex<Option<Arc<Sink>>>,
    }

    impl RodioBackend {
        /// Open the default output device
        pub fn try_default() -> Result<(Self, AudioOutput), NotificationError> {
            let (stream, handle) = OutputStream::try_default().map_err(|e| {
                tracing::warn!(error = %e, "failed to initialize audio device");
                NotificationError::NoOutputDevice
            })?;

            Ok((
                Self {
                    handle,
                    current: Mutex::new(None),
                },
                AudioOutput { _stream: stream },
            ))
        }
    }

    impl AudioBackend for RodioBackend {
        fn play(&self, payload: &AudioPayload) -> Result<(), NotificationError> {
            let source = Decoder::new(BufReader::new(Cursor::new(payload.bytes.to_vec())))
                .map_err(|e| NotificationError::Decode(e.to_string()))?;

            let sink = Sink::try_new(&self.handle).map_err(|e| {
                NotificationError::PlaybackFailed(format!("failed to create audio sink: {}", e))
            })?;
            let sink = Arc::new(sink);
            sink.append(source);

            *lock(&self.current) = Some(Arc::clone(&sink));
            sink.sleep_until_end();
            lock(&self.current).take();
            Ok(())
        }

        fn stop(&self) {
            if let Some(sink) = lock(&self.current).take() {
                sink.stop();
            }
        }
    }
}

// ============================================================================
// Sound packs
// ============================================================================

/// ZIP archive of mp3 cues
#[derive(Debug, Clone)]
pub struct SoundPack {
    path: PathBuf,
}

/// Entries named `<name>.mp3` or `<name>.<anything>.mp3`, case-insensitive
fn matching_sound_files<I, S>(entries: I, name: &str) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let name = name.to_lowercase();
    let exact_pattern = format!("{}.mp3", name);
    let variant_prefix = format!("{}.", name);

    let mut matches: Vec<String> = entries
        .into_iter()
        .filter(|entry| {
            let entry_name = entry.as_ref().to_lowercase();
            entry_name == exact_pattern
                || (entry_name.starts_with(&variant_prefix) && entry_name.ends_with(".mp3"))
        })
        .map(|entry| entry.as_ref().to_string())
        .collect();
    matches.sort();
    matches
}

impl SoundPack {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File, SoundPackError> {
        File::open(&self.path).map_err(|source| SoundPackError::Open {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Names of all variants of cue `name`
    pub fn variations(&self, name: &str) -> Result<Vec<String>, SoundPackError> {
        let file = self.open()?;
        let archive = file
            .read_zip()
            .map_err(|e| SoundPackError::Archive(e.to_string()))?;
        Ok(matching_sound_files(
            archive.entries().map(|entry| entry.name.to_string()),
            name,
        ))
    }

    /// Load cue `name`; `invocation` rotates through its variants
    pub fn cue(&self, name: &str, invocation: u32) -> Result<AudioPayload, SoundPackError> {
        let file = self.open()?;
        let archive = file
            .read_zip()
            .map_err(|e| SoundPackError::Archive(e.to_string()))?;

        let matching =
            matching_sound_files(archive.entries().map(|entry| entry.name.to_string()), name);
        if matching.is_empty() {
            return Err(SoundPackError::NotFound(name.to_string()));
        }
        let selected = &matching[invocation as usize % matching.len()];

        let entry = archive
            .by_name(selected)
            .ok_or_else(|| SoundPackError::NotFound(selected.clone()))?;
        let bytes = entry
            .bytes()
            .map_err(|e| SoundPackError::Archive(format!("failed to read {}: {}", selected, e)))?;

        Ok(AudioPayload::new(selected.clone(), bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Records play order; fails payloads whose label starts with "bad"
    #[derive(Default)]
    struct FakeBackend {
        played: Mutex<Vec<String>>,
        active: AtomicBool,
        overlapped: AtomicBool,
        stopped: AtomicBool,
        delay: Duration,
    }

    impl FakeBackend {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn played(&self) -> Vec<String> {
            lock(&self.played).clone()
        }
    }

    impl AudioBackend for FakeBackend {
        fn play(&self, payload: &AudioPayload) -> Result<(), NotificationError> {
            if self.active.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            lock(&self.played).push(payload.label.clone());

            let deadline = std::time::Instant::now() + self.delay;
            while std::time::Instant::now() < deadline && !self.stopped.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
            self.active.store(false, Ordering::SeqCst);

            if payload.label.starts_with("bad") {
                Err(NotificationError::PlaybackFailed("autoplay blocked".into()))
            } else {
                Ok(())
            }
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn cue(label: &str) -> AudioPayload {
        AudioPayload::new(label, vec![0u8; 4])
    }

    #[tokio::test]
    async fn test_failed_cue_does_not_block_queue() {
        let backend = Arc::new(FakeBackend::with_delay(Duration::from_millis(10)));
        let player = NotificationPlayer::new(backend.clone());

        let first = player.enqueue(cue("one"));
        let second = player.enqueue(cue("bad-two"));
        let third = player.enqueue(cue("three"));

        assert_eq!(first.await, Ok(()));
        assert!(matches!(
            second.await,
            Err(NotificationError::PlaybackFailed(_))
        ));
        assert_eq!(third.await, Ok(()));

        assert_eq!(backend.played(), vec!["one", "bad-two", "three"]);
        assert!(!backend.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_is_playing_tracks_in_flight_cue() {
        let backend = Arc::new(FakeBackend::with_delay(Duration::from_millis(50)));
        let player = NotificationPlayer::new(backend);
        assert!(!player.is_playing());

        let pending = player.enqueue(cue("one"));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !player.is_playing() {
            assert!(std::time::Instant::now() < deadline, "never started playing");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        pending.await.unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while player.is_playing() {
            assert!(std::time::Instant::now() < deadline, "flag never cleared");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_stop_clears_queue_and_interrupts_current() {
        let backend = Arc::new(FakeBackend::with_delay(Duration::from_secs(10)));
        let player = NotificationPlayer::new(backend.clone());

        let current = player.enqueue(cue("long"));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !player.is_playing() {
            assert!(std::time::Instant::now() < deadline, "never started playing");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let queued_a = player.enqueue(cue("a"));
        let queued_b = player.enqueue(cue("b"));
        assert_eq!(player.queued(), 2);

        player.stop();

        assert_eq!(queued_a.await, Err(NotificationError::Cleared));
        assert_eq!(queued_b.await, Err(NotificationError::Cleared));
        assert_eq!(current.await, Err(NotificationError::Stopped));
        assert_eq!(backend.played(), vec!["long"]);
    }

    #[tokio::test]
    async fn test_player_keeps_working_after_stop() {
        let backend = Arc::new(FakeBackend::default());
        let player = NotificationPlayer::new(backend.clone());
        player.stop();

        backend.stopped.store(false, Ordering::SeqCst);
        assert_eq!(player.enqueue(cue("after")).await, Ok(()));
    }

    #[tokio::test]
    async fn test_settled_cue_unaffected_by_stop() {
        let backend = Arc::new(FakeBackend::default());
        let player = NotificationPlayer::new(backend);
        let done = player.enqueue(cue("quick"));
        assert_eq!(done.await, Ok(()));
        player.stop();
        assert_eq!(player.queued(), 0);
    }

    #[test]
    fn test_matching_sound_files() {
        let entries = [
            "complete.mp3",
            "Complete.2.MP3",
            "complete.wav",
            "completed.mp3",
            "failed.mp3",
        ];
        assert_eq!(
            matching_sound_files(entries, "complete"),
            vec!["Complete.2.MP3", "complete.mp3"]
        );
        assert!(matching_sound_files(entries, "missing").is_empty());
    }

    #[test]
    fn test_missing_sound_pack_reports_path() {
        let pack = SoundPack::new("/definitely/not/here.zip");
        let err = pack.cue("complete", 0).unwrap_err();
        assert!(matches!(err, SoundPackError::Open { .. }));
        assert!(err.to_string().contains("here.zip"));
    }
}
