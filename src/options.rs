//! Configuration for session pools.

use std::time::Duration;

use rand::Rng;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// An immutable configuration snapshot for a session pool.
///
/// Construct with [`SessionPoolOptions::builder`]; unset fields take the
/// documented defaults.
///
/// ```rust
/// use std::time::Duration;
/// use sessionpool::SessionPoolOptions;
///
/// let options = SessionPoolOptions::builder()
///     .min_sessions(25)
///     .acquire_timeout(Duration::from_secs(10))
///     .build();
/// ```
#[derive(Clone, Debug, TypedBuilder)]
pub struct SessionPoolOptions {
    /// The number of sessions (idle plus in-flight creations) the pool keeps
    /// warm. Defaults to 10.
    #[builder(default = 10)]
    pub min_sessions: u32,

    /// The hard cap on sessions the pool manages in aggregate: checked-out,
    /// in-flight and idle. Defaults to 100.
    #[builder(default = 100)]
    pub max_sessions: u32,

    /// The maximum number of session-creation RPCs in flight at once.
    /// Defaults to 10.
    #[builder(default = 10)]
    pub max_concurrent_creates: u32,

    /// The fraction of the warm floor kept as read/write sessions with a
    /// pre-begun transaction, in `0.0..=1.0`. Defaults to 0.2.
    #[builder(default = 0.2)]
    pub write_fraction: f64,

    /// How long an idle session may go unexercised before the pool issues a
    /// keepalive probe for it. Defaults to 15 minutes.
    #[builder(default = Duration::from_secs(15 * 60))]
    pub refresh_delay: Duration,

    /// The age at which the pool discards a session locally. Defaults to 100
    /// minutes.
    #[builder(default = Duration::from_secs(100 * 60))]
    pub eviction_delay: Duration,

    /// Randomization applied to each session's refresh deadline. Defaults to
    /// none.
    #[builder(default)]
    pub refresh_jitter: Jitter,

    /// Randomization applied to each session's eviction deadline. Defaults to
    /// none.
    #[builder(default)]
    pub eviction_jitter: Jitter,

    /// The cadence at which a [`PoolRegistry`](crate::PoolRegistry) runs
    /// maintenance on its pools. Zero disables the background ticker, leaving
    /// maintenance to explicit [`maintain`](crate::SessionPool::maintain)
    /// calls. Defaults to 15 seconds.
    #[builder(default = Duration::from_secs(15))]
    pub maintenance_loop_delay: Duration,

    /// How long [`acquire`](crate::SessionPool::acquire) waits for a session
    /// before failing with `ResourceExhausted`. Defaults to 60 seconds.
    #[builder(default = Duration::from_secs(60))]
    pub acquire_timeout: Duration,

    /// What `acquire` does when the pool is at `max_sessions` with nothing
    /// idle. Defaults to [`WaitBehavior::Block`].
    #[builder(default)]
    pub wait_behavior: WaitBehavior,

    /// Seed for the randomness source behind the jitter policies. `None`
    /// seeds from the operating system; tests pin a seed for reproducible
    /// deadlines.
    #[builder(default)]
    pub jitter_seed: Option<u64>,
}

impl SessionPoolOptions {
    /// The number of read/write sessions the warm floor targets.
    pub(crate) fn write_session_target(&self) -> u32 {
        (f64::from(self.min_sessions) * self.write_fraction).ceil() as u32
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::invalid_argument("max_sessions must be at least 1"));
        }
        if self.min_sessions > self.max_sessions {
            return Err(Error::invalid_argument(format!(
                "min_sessions ({}) cannot exceed max_sessions ({})",
                self.min_sessions, self.max_sessions
            )));
        }
        if self.max_concurrent_creates == 0 {
            return Err(Error::invalid_argument(
                "max_concurrent_creates must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.write_fraction) {
            return Err(Error::invalid_argument(format!(
                "write_fraction must be within 0.0..=1.0, got {}",
                self.write_fraction
            )));
        }
        Ok(())
    }
}

impl Default for SessionPoolOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Behavior of `acquire` when the pool is at capacity with nothing idle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitBehavior {
    /// Wait for a session to be released, subject to the acquire timeout.
    #[default]
    Block,

    /// Fail immediately with `ResourceExhausted`.
    Fail,
}

/// A randomization policy applied to session deadlines so that sessions
/// created together do not all fall due in the same instant.
///
/// The policy shortens a base delay by a random amount, never lengthens it,
/// so jittered deadlines remain safe with respect to server-side limits.
#[derive(Clone, Copy, Debug, Default)]
pub struct Jitter {
    fraction: f64,
}

impl Jitter {
    /// No randomization; deadlines are exact. This is the default.
    pub fn none() -> Self {
        Self { fraction: 0.0 }
    }

    /// Shorten each delay by up to `fraction` of its length, drawn uniformly.
    ///
    /// # Panics
    ///
    /// Panics if `fraction` is outside `0.0..=1.0`.
    pub fn up_to_fraction(fraction: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&fraction),
            "jitter fraction must be within 0.0..=1.0"
        );
        Self { fraction }
    }

    pub(crate) fn apply(&self, base: Duration, rng: &mut impl Rng) -> Duration {
        if self.fraction <= 0.0 {
            return base;
        }
        let cut = base.mul_f64(self.fraction * rng.random::<f64>());
        base - cut
    }
}
