//! connection pools.
//!
//! [`Pool`] serves blocking callers from worker threads; [`AsyncPool`] serves
//! tasks on the tokio runtime. both share the same sizing, reconnection and
//! reset policies: a bounded set of connections, a FIFO waiting queue,
//! background maintenance with a delay scheduler, backoff-and-jitter
//! reconnection, and transactional reset on return.

mod async_;
mod sched;
mod sync;

pub use self::{
    async_::{AsyncPool, AsyncPoolBuilder, AsyncPoolConnection},
    sync::{Pool, PoolBuilder, PoolConnection},
};

use core::time::Duration;

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use rand::Rng;

/// sizing and timing knobs shared by both pool flavours.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub(crate) conninfo: String,
    pub(crate) min_size: usize,
    pub(crate) max_size: usize,
    /// how long a client waits for a connection before `PoolTimeout`.
    pub(crate) timeout: Duration,
    /// cap on the waiting queue; 0 means unbounded.
    pub(crate) max_waiting: usize,
    /// a connection older than this (jittered by -5%..0) is not returned to
    /// the pool.
    pub(crate) max_lifetime: Duration,
    /// shrink check period, and the idle window the rolling minimum covers.
    pub(crate) max_idle: Duration,
    /// how long reconnection keeps retrying before giving up.
    pub(crate) reconnect_timeout: Duration,
    pub(crate) num_workers: usize,
}

impl PoolConfig {
    pub(crate) fn new(conninfo: String) -> Self {
        Self {
            conninfo,
            min_size: 4,
            max_size: 4,
            timeout: Duration::from_secs(30),
            max_waiting: 0,
            max_lifetime: Duration::from_secs(60 * 60),
            max_idle: Duration::from_secs(10 * 60),
            reconnect_timeout: Duration::from_secs(5 * 60),
            num_workers: 3,
        }
    }

    pub(crate) fn check(&self) -> Result<(), crate::errors::Error> {
        if self.max_size < self.min_size {
            return Err(crate::errors::ProgrammingError::new(
                "max_size must be greater or equal than min_size",
            )
            .into());
        }
        if self.min_size == 0 && self.max_size == 0 {
            return Err(
                crate::errors::ProgrammingError::new("if min_size is 0 max_size must be greater than 0").into(),
            );
        }
        if self.num_workers < 1 {
            return Err(crate::errors::ProgrammingError::new("num_workers must be at least 1").into());
        }
        Ok(())
    }
}

/// add a random percentage between `min_pc` and `max_pc` to a duration.
pub(crate) fn jitter(value: Duration, min_pc: f64, max_pc: f64) -> Duration {
    let factor = 1.0 + min_pc + (max_pc - min_pc) * rand::thread_rng().gen::<f64>();
    value.mul_f64(factor.max(0.0))
}

/// the state of one reconnection attempt: current delay and the moment the
/// pool gives up on the connection slot.
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    reconnect_timeout: Duration,
    pub(crate) delay: Duration,
    give_up_at: Option<Instant>,
}

impl Attempt {
    const INITIAL_DELAY: Duration = Duration::from_secs(1);
    const DELAY_JITTER: f64 = 0.1;
    const DELAY_BACKOFF: f64 = 2.0;

    pub(crate) fn new(reconnect_timeout: Duration) -> Self {
        Self {
            reconnect_timeout,
            delay: Duration::ZERO,
            give_up_at: None,
        }
    }

    /// compute how long to wait before the next attempt.
    pub(crate) fn update_delay(&mut self, now: Instant) {
        match self.give_up_at {
            None => {
                self.give_up_at = Some(now + self.reconnect_timeout);
                self.delay = jitter(Self::INITIAL_DELAY, -Self::DELAY_JITTER, Self::DELAY_JITTER);
            }
            Some(give_up_at) => {
                self.delay = self.delay.mul_f64(Self::DELAY_BACKOFF);
                // never schedule the retry past the give-up time
                if now + self.delay > give_up_at {
                    self.delay = give_up_at.saturating_duration_since(now);
                }
            }
        }
    }

    pub(crate) fn time_to_give_up(&self, now: Instant) -> bool {
        matches!(self.give_up_at, Some(give_up_at) if now >= give_up_at)
    }
}

macro_rules! stat_counters {
    ($($(#[$doc:meta])* $name:ident => $key:literal,)*) => {
        /// monotonically increasing pool usage counters, safe to sample from
        /// any thread.
        #[derive(Debug, Default)]
        pub(crate) struct PoolStats {
            $($(#[$doc])* pub(crate) $name: AtomicU64,)*
        }

        impl PoolStats {
            fn counters(&self) -> Vec<(&'static str, u64)> {
                vec![$(($key, self.$name.load(Ordering::Relaxed)),)*]
            }

            fn reset(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

stat_counters! {
    requests_num => "requests_num",
    requests_queued => "requests_queued",
    requests_wait_ms => "requests_wait_ms",
    requests_errors => "requests_errors",
    usage_ms => "usage_ms",
    returns_bad => "returns_bad",
    connections_num => "connections_num",
    connections_ms => "connections_ms",
    connections_errors => "connections_errors",
    connections_lost => "connections_lost",
}

impl PoolStats {
    pub(crate) fn add(&self, counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// counters plus the immediate gauges of the pool.
    pub(crate) fn snapshot(&self, gauges: &[(&'static str, u64)]) -> HashMap<&'static str, u64> {
        let mut out: HashMap<&'static str, u64> = self.counters().into_iter().collect();
        out.extend(gauges.iter().copied());
        out
    }

    pub(crate) fn pop(&self, gauges: &[(&'static str, u64)]) -> HashMap<&'static str, u64> {
        let out = self.snapshot(gauges);
        self.reset();
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attempt_backoff_doubles_and_clamps() {
        let mut attempt = Attempt::new(Duration::from_secs(10));
        let t0 = Instant::now();

        attempt.update_delay(t0);
        let first = attempt.delay;
        assert!(first >= Duration::from_millis(900) && first <= Duration::from_millis(1100));

        attempt.update_delay(t0 + Duration::from_secs(1));
        assert!(attempt.delay >= first.mul_f64(1.9));

        // close to the deadline the delay clamps to it
        attempt.update_delay(t0 + Duration::from_secs(9));
        assert!(attempt.delay <= Duration::from_secs(1));
        assert!(attempt.time_to_give_up(t0 + Duration::from_secs(10)));
        assert!(!attempt.time_to_give_up(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..100 {
            let v = jitter(Duration::from_secs(100), -0.05, 0.0);
            assert!(v <= Duration::from_secs(100));
            assert!(v >= Duration::from_secs(94));
        }
    }

    #[test]
    fn config_bounds() {
        let mut cfg = PoolConfig::new(String::new());
        cfg.min_size = 4;
        cfg.max_size = 2;
        assert!(cfg.check().is_err());
        cfg.max_size = 4;
        assert!(cfg.check().is_ok());
        cfg.min_size = 0;
        cfg.max_size = 0;
        assert!(cfg.check().is_err());
    }

    #[test]
    fn stats_snapshot_and_pop() {
        let stats = PoolStats::default();
        stats.add(&stats.requests_num, 3);
        let snap = stats.snapshot(&[("pool_size", 2)]);
        assert_eq!(snap["requests_num"], 3);
        assert_eq!(snap["pool_size"], 2);
        let popped = stats.pop(&[]);
        assert_eq!(popped["requests_num"], 3);
        assert_eq!(stats.snapshot(&[])["requests_num"], 0);
    }
}
