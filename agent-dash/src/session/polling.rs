//! Adaptive refetch interval for watching a session.
//!
//! Active sessions are polled at the base interval. Idle ones back off
//! geometrically once their content fingerprint has been stable for a few
//! observations, and snap back to the base interval on any change. Terminal
//! sessions are not polled at all. Every returned interval carries ±10%
//! jitter so many watchers don't refetch in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::session::protocol::SessionStatus;

pub const BASE_INTERVAL_MS: u64 = 2_000;
pub const MAX_INTERVAL_MS: u64 = 30_000;
pub const BACKOFF_MULTIPLIER: f64 = 1.5;
/// Consecutive unchanged observations before backing off
pub const STABILITY_THRESHOLD: u32 = 3;
pub const JITTER_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollingParams {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub stability_threshold: u32,
    pub jitter_factor: f64,
}

impl Default for PollingParams {
    fn default() -> Self {
        Self {
            base_interval_ms: BASE_INTERVAL_MS,
            max_interval_ms: MAX_INTERVAL_MS,
            backoff_multiplier: BACKOFF_MULTIPLIER,
            stability_threshold: STABILITY_THRESHOLD,
            jitter_factor: JITTER_FACTOR,
        }
    }
}

impl PollingParams {
    /// Bring out-of-range values back into range: `max >= base >= 1`, a
    /// multiplier of at least 1 and a jitter factor within `0..=1`.
    pub fn normalized(self) -> Self {
        let base_interval_ms = self.base_interval_ms.max(1);
        Self {
            base_interval_ms,
            max_interval_ms: self.max_interval_ms.max(base_interval_ms),
            backoff_multiplier: if self.backoff_multiplier.is_finite() {
                self.backoff_multiplier.max(1.0)
            } else {
                1.0
            },
            stability_threshold: self.stability_threshold,
            jitter_factor: if self.jitter_factor.is_finite() {
                self.jitter_factor.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }
}

/// Backoff state of one watcher. Never share between watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingState {
    pub current_interval_ms: u64,
    pub stable_count: u32,
    pub last_fingerprint: Option<String>,
}

impl PollingState {
    pub fn new(params: &PollingParams) -> Self {
        Self {
            current_interval_ms: params.base_interval_ms,
            stable_count: 0,
            last_fingerprint: None,
        }
    }
}

/// What the caller should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// Don't schedule another check
    Stop,
    After(Duration),
}

impl PollDecision {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            PollDecision::Stop => None,
            PollDecision::After(interval) => Some(*interval),
        }
    }
}

/// Pure transition: the pre-jitter interval in ms (`None` = stop polling)
/// and the next state.
pub fn next_interval(
    params: &PollingParams,
    enabled: bool,
    status: Option<SessionStatus>,
    fingerprint: &str,
    previous: &PollingState,
) -> (Option<u64>, PollingState) {
    let Some(status) = status.filter(|_| enabled) else {
        return (None, previous.clone());
    };

    if status.is_terminal() {
        return (None, previous.clone());
    }

    let mut state = previous.clone();

    if status.is_active() {
        if state.current_interval_ms != params.base_interval_ms {
            state.current_interval_ms = params.base_interval_ms;
            state.stable_count = 0;
        }
        return (Some(params.base_interval_ms), state);
    }

    if state.last_fingerprint.as_deref() == Some(fingerprint) {
        state.stable_count += 1;
        if state.stable_count >= params.stability_threshold {
            let grown = (state.current_interval_ms as f64 * params.backoff_multiplier).round() as u64;
            state.current_interval_ms = grown.min(params.max_interval_ms).max(params.base_interval_ms);
            state.stable_count = 0;
        }
    } else {
        state.current_interval_ms = params.base_interval_ms;
        state.stable_count = 0;
    }
    state.last_fingerprint = Some(fingerprint.to_string());

    (Some(state.current_interval_ms), state)
}

/// Spread `interval_ms` uniformly over ±`factor`
pub fn apply_jitter<R: Rng + ?Sized>(interval_ms: u64, factor: f64, rng: &mut R) -> u64 {
    if !(factor.is_finite() && factor > 0.0) || interval_ms == 0 {
        return interval_ms;
    }
    let spread = interval_ms as f64 * factor;
    let offset = rng.gen_range(-spread..=spread);
    (interval_ms as f64 + offset).round().max(0.0) as u64
}

/// Stateful wrapper owning one watcher's [`PollingState`]
#[derive(Debug, Clone)]
pub struct AdaptivePollingPolicy {
    params: PollingParams,
    state: PollingState,
    enabled: bool,
}

impl Default for AdaptivePollingPolicy {
    fn default() -> Self {
        Self::new(PollingParams::default())
    }
}

impl AdaptivePollingPolicy {
    pub fn new(params: PollingParams) -> Self {
        let normalized = params.normalized();
        if normalized != params {
            tracing::warn!(?params, ?normalized, "polling params out of range, adjusted");
        }
        let params = normalized;
        Self {
            state: PollingState::new(&params),
            params,
            enabled: true,
        }
    }

    pub fn params(&self) -> &PollingParams {
        &self.params
    }

    pub fn state(&self) -> &PollingState {
        &self.state
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Forget all backoff. Call whenever the watched entity changes identity.
    pub fn reset(&mut self) {
        self.state = PollingState::new(&self.params);
    }

    /// Record an observation and decide when to look again
    pub fn observe(&mut self, status: Option<SessionStatus>, fingerprint: &str) -> PollDecision {
        self.observe_with(status, fingerprint, &mut rand::thread_rng())
    }

    pub fn observe_with<R: Rng + ?Sized>(
        &mut self,
        status: Option<SessionStatus>,
        fingerprint: &str,
        rng: &mut R,
    ) -> PollDecision {
        let (interval, state) =
            next_interval(&self.params, self.enabled, status, fingerprint, &self.state);
        self.state = state;

        match interval {
            None => PollDecision::Stop,
            Some(ms) => PollDecision::After(Duration::from_millis(apply_jitter(
                ms,
                self.params.jitter_factor,
                rng,
            ))),
        }
    }
}
