//! Bounded readiness polling.

use crate::{CancelToken, CoreError};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on how long a cancelled token goes unnoticed.
const CANCEL_SLICE: Duration = Duration::from_millis(50);

/// Poll `probe` until it reports ready, the deadline passes, or `cancel`
/// trips.
///
/// The first probe runs immediately, then once per `interval`. Probe errors
/// end the wait. On timeout `last_state` is asked once for the final
/// observed state, which is logged and carried in the error.
pub fn poll_until<P, S>(
    name: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancelToken,
    mut probe: P,
    last_state: S,
) -> Result<(), CoreError>
where
    P: FnMut() -> Result<bool, CoreError>,
    S: FnOnce() -> String,
{
    tracing::debug!(env = %name, ?timeout, "waiting to start");
    // A timeout too large for the clock means no deadline.
    let deadline = Instant::now().checked_add(timeout);

    loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled(name.to_owned()));
        }
        if probe()? {
            tracing::debug!(env = %name, "environment is running");
            return Ok(());
        }

        let next = Instant::now().checked_add(interval);
        loop {
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                let state = last_state();
                tracing::warn!(env = %name, state = %state, "environment did not start in time");
                return Err(CoreError::Timeout {
                    name: name.to_owned(),
                    timeout,
                    last_state: state,
                });
            }
            if next.is_some_and(|n| now >= n) {
                break;
            }
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled(name.to_owned()));
            }
            let mut nap = CANCEL_SLICE;
            for bound in [next, deadline].into_iter().flatten() {
                nap = nap.min(bound.saturating_duration_since(now));
            }
            thread::sleep(nap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const FAST: Duration = Duration::from_millis(5);

    #[test]
    fn ready_on_first_probe_does_not_sleep() {
        let start = Instant::now();
        poll_until(
            "demo",
            Duration::from_secs(5),
            Duration::from_secs(5),
            &CancelToken::new(),
            || Ok(true),
            String::new,
        )
        .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn becomes_ready_after_a_few_polls() {
        let calls = Cell::new(0);
        poll_until(
            "demo",
            Duration::from_secs(5),
            FAST,
            &CancelToken::new(),
            || {
                calls.set(calls.get() + 1);
                Ok(calls.get() >= 3)
            },
            String::new,
        )
        .unwrap();
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn timeout_carries_last_state() {
        let err = poll_until(
            "demo",
            Duration::from_millis(30),
            FAST,
            &CancelToken::new(),
            || Ok(false),
            || "created".to_owned(),
        )
        .unwrap_err();
        match err {
            CoreError::Timeout {
                name, last_state, ..
            } => {
                assert_eq!(name, "demo");
                assert_eq!(last_state, "created");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn unbounded_timeout_still_polls() {
        let calls = Cell::new(0);
        poll_until(
            "demo",
            Duration::MAX,
            FAST,
            &CancelToken::new(),
            || {
                calls.set(calls.get() + 1);
                Ok(calls.get() >= 2)
            },
            String::new,
        )
        .unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn unbounded_interval_times_out() {
        let err = poll_until(
            "demo",
            Duration::from_millis(30),
            Duration::MAX,
            &CancelToken::new(),
            || Ok(false),
            || "created".to_owned(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
    }

    #[test]
    fn probe_error_ends_the_wait() {
        let err = poll_until(
            "demo",
            Duration::from_secs(5),
            FAST,
            &CancelToken::new(),
            || Err(CoreError::EnvNotFound("demo".into())),
            String::new,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::EnvNotFound(_)));
    }

    #[test]
    fn cancelled_token_stops_promptly() {
        let token = CancelToken::new();
        let trip = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trip.cancel();
        });

        let start = Instant::now();
        let err = poll_until(
            "demo",
            Duration::from_secs(30),
            Duration::from_secs(10),
            &token,
            || Ok(false),
            String::new,
        )
        .unwrap_err();
        handle.join().unwrap();

        assert!(matches!(err, CoreError::Cancelled(_)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
