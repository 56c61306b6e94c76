//! Remote tracker polling: wire parsing for the `location/getcurrent`
//! endpoint, the level-triggered staleness gate, and the fetch/retry state
//! machine the reducer drives.
//!
//! The machine here is pure. Timers and HTTP live in the reducer as
//! capability calls; every armed attempt or retry wait carries a
//! generation, and completions whose generation no longer matches are
//! ignored, so late responses and fired deadlines cannot corrupt state.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::geo::{CoordinateError, ValidatedCoordinate};
use crate::{FETCH_MAX_ATTEMPTS, FETCH_RETRY_DELAY_MS};

/// Path of the current-location endpoint, relative to the API base.
pub const CURRENT_LOCATION_PATH: &str = "location/getcurrent";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrackerError {
    #[error("Tracker response is not a valid reading: {0}")]
    MalformedBody(String),
    #[error("Tracker response coordinate is invalid: {0}")]
    InvalidCoordinate(#[from] CoordinateError),
}

/// Opaque identity of one tracker reading (`id` on the wire). The core
/// only ever compares these for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadingId(String);

impl ReadingId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReadingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One accepted position of the tracked device. `captured_at` is the
/// backend's own timestamp string, carried through for display only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReading {
    pub coordinate: ValidatedCoordinate,
    pub source_id: Option<ReadingId>,
    pub captured_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireReading {
    #[serde(deserialize_with = "lenient_f64")]
    latitude: f64,
    #[serde(deserialize_with = "lenient_f64")]
    longitude: f64,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "dateTimeTrack")]
    date_time_track: Option<String>,
}

/// The backend serializes coordinates sometimes as JSON numbers and
/// sometimes as numeric strings. Accept both.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(f64),
        Text(String),
    }

    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => Ok(n),
        NumberOrText::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("not a numeric string: {s:?}"))),
    }
}

/// Parses a `location/getcurrent` body into a validated reading.
pub fn parse_reading(body: &[u8]) -> Result<LocationReading, TrackerError> {
    let wire: WireReading = serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "tracker body did not parse");
        TrackerError::MalformedBody(e.to_string())
    })?;

    let coordinate = ValidatedCoordinate::new(wire.latitude, wire.longitude)?;

    Ok(LocationReading {
        coordinate,
        source_id: wire.id.map(ReadingId::new),
        captured_at: wire.date_time_track,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    #[default]
    Fresh,
    Unchanged,
}

/// Duplicate-reading detector. Level-triggered: a repeated id reports
/// `Unchanged` on the transition and keeps reporting it until the id
/// changes, at which point the signal clears on its own. A reading with
/// no id disables the check entirely and forgets the remembered id, so a
/// backend that stops sending ids can never raise a false stale signal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StalenessGate {
    last_id: Option<ReadingId>,
}

impl StalenessGate {
    pub fn observe(&mut self, id: Option<&ReadingId>) -> Freshness {
        match id {
            Some(id) if self.last_id.as_ref() == Some(id) => Freshness::Unchanged,
            Some(id) => {
                self.last_id = Some(id.clone());
                Freshness::Fresh
            }
            None => {
                self.last_id = None;
                Freshness::Fresh
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_id = None;
    }
}

/// Bounded-retry policy for a network operation: how many attempts a
/// cycle may make and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
        }
    }

    /// One attempt, no retry wait. The route and places calls use this
    /// shape: a failure surfaces immediately instead of retrying.
    #[must_use]
    pub const fn single_attempt() -> Self {
        Self::new(1, 0)
    }

    /// The wait before the attempt after `attempt`, or `None` when the
    /// budget is spent.
    #[must_use]
    pub const fn next_delay(&self, attempt: u32) -> Option<u64> {
        if attempt < self.max_attempts {
            Some(self.delay_ms)
        } else {
            None
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(FETCH_MAX_ATTEMPTS, FETCH_RETRY_DELAY_MS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FetchPhase {
    #[default]
    Idle,
    InFlight {
        attempt: u32,
    },
    AwaitingRetry {
        next_attempt: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Issue the request tagged with this generation.
    Fetch { generation: u64, attempt: u32 },
    /// A cycle is still running; this tick is dropped, not queued.
    SkipInFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Arm a retry timer for `delay_ms`, tagged with `generation`.
    Retry {
        generation: u64,
        attempt: u32,
        delay_ms: u64,
    },
    /// The attempt budget is spent; surface and wait for the next tick.
    GaveUp { attempts: u32 },
    /// The completion belonged to a superseded attempt.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryFetch {
    pub generation: u64,
    pub attempt: u32,
}

/// Fetch-cycle state machine for the remote tracker.
///
/// A cycle makes attempts according to its [`RetryPolicy`] with a fixed
/// wait between them. Ticks never overlap: a tick that arrives mid-cycle
/// is skipped and counted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Poller {
    policy: RetryPolicy,
    generation: u64,
    phase: FetchPhase,
    gate: StalenessGate,
    freshness: Freshness,
    skipped_ticks: u64,
}

impl Poller {
    #[must_use]
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    fn arm(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn begin_tick(&mut self) -> TickDecision {
        if self.phase == FetchPhase::Idle {
            let generation = self.arm();
            self.phase = FetchPhase::InFlight { attempt: 1 };
            TickDecision::Fetch {
                generation,
                attempt: 1,
            }
        } else {
            self.skipped_ticks += 1;
            TickDecision::SkipInFlight
        }
    }

    /// A 2xx response parsed into a reading. Returns the freshness of the
    /// reading, or `None` if the response belonged to a superseded
    /// attempt and must be dropped.
    pub fn on_success(&mut self, generation: u64, reading: &LocationReading) -> Option<Freshness> {
        let FetchPhase::InFlight { .. } = self.phase else {
            return None;
        };
        if generation != self.generation {
            return None;
        }

        self.phase = FetchPhase::Idle;
        let freshness = self.gate.observe(reading.source_id.as_ref());
        self.freshness = freshness;
        Some(freshness)
    }

    /// A transport failure, non-2xx status, malformed body, or fired
    /// deadline for the given generation.
    pub fn on_failure(&mut self, generation: u64) -> FailureOutcome {
        let FetchPhase::InFlight { attempt } = self.phase else {
            return FailureOutcome::Ignored;
        };
        if generation != self.generation {
            return FailureOutcome::Ignored;
        }

        let Some(delay_ms) = self.policy.next_delay(attempt) else {
            self.phase = FetchPhase::Idle;
            return FailureOutcome::GaveUp { attempts: attempt };
        };

        let next_attempt = attempt + 1;
        let generation = self.arm();
        self.phase = FetchPhase::AwaitingRetry { next_attempt };
        FailureOutcome::Retry {
            generation,
            attempt: next_attempt,
            delay_ms,
        }
    }

    /// The retry timer fired. Returns the attempt to issue, or `None` if
    /// the wait was superseded (teardown, or a newer cycle started).
    pub fn begin_retry(&mut self, generation: u64) -> Option<RetryFetch> {
        let FetchPhase::AwaitingRetry { next_attempt } = self.phase else {
            return None;
        };
        if generation != self.generation {
            return None;
        }

        let generation = self.arm();
        self.phase = FetchPhase::InFlight {
            attempt: next_attempt,
        };
        Some(RetryFetch {
            generation,
            attempt: next_attempt,
        })
    }

    /// Invalidates whatever is in flight. Completions armed before this
    /// call will no longer match and get dropped.
    pub fn abort(&mut self) {
        self.phase = FetchPhase::Idle;
        self.arm();
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.phase != FetchPhase::Idle
    }

    /// Whether `generation` tags the request that is in flight right now.
    /// Deadlines and completions from superseded attempts do not match.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        matches!(self.phase, FetchPhase::InFlight { .. }) && generation == self.generation
    }

    #[must_use]
    pub const fn freshness(&self) -> Freshness {
        self.freshness
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Unchanged
    }

    #[must_use]
    pub const fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks
    }

    pub fn reset_gate(&mut self) {
        self.gate.reset();
        self.freshness = Freshness::Fresh;
    }
}
