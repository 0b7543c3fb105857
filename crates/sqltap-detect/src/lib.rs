// Sliding-window N+1 query pattern detector.
//
// Tracks per-template occurrence timestamps inside a time window. Once a
// template crosses the threshold, every further occurrence in the window is
// flagged as matched; a separate alert fires at most once per cooldown so
// consumers can notify without flooding.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// A detected N+1 pattern, carried on the first match per cooldown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub query: String,
    pub count: usize,
}

/// Outcome of a single [`Detector::record`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// True when the template's count is at or above the threshold within
    /// the window. Set on every event of the pattern, not only the first.
    pub matched: bool,
    /// Present only when the threshold is crossed and the cooldown for this
    /// template has elapsed.
    pub alert: Option<Alert>,
}

#[derive(Default)]
struct State {
    // Per-template occurrence timestamps inside the current window.
    occurrences: HashMap<String, Vec<SystemTime>>,
    // Per-template time of the last raised alert.
    last_alert: HashMap<String, SystemTime>,
}

/// Frequency detector shared by all connections; safe to call from any task.
pub struct Detector {
    threshold: usize,
    window: Duration,
    cooldown: Duration,
    state: Mutex<State>,
}

impl Detector {
    /// `threshold`: occurrences to trigger (e.g. 5). `window`: counting
    /// interval (e.g. 1s). `cooldown`: minimum gap between alerts for the
    /// same template (e.g. 10s).
    pub fn new(threshold: usize, window: Duration, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            cooldown,
            state: Mutex::new(State::default()),
        }
    }

    /// Register one occurrence of `query` at time `t`.
    ///
    /// An empty query is ignored and reports no match. Out-of-order
    /// timestamps are tolerated; entries older than `t - window` are
    /// evicted, the rest are treated as members of the current window.
    pub fn record(&self, query: &str, t: SystemTime) -> Outcome {
        if query.is_empty() {
            return Outcome::default();
        }

        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let times = state.occurrences.entry(query.to_string()).or_default();
        if let Some(cutoff) = t.checked_sub(self.window) {
            times.retain(|ts| *ts >= cutoff);
        }
        times.push(t);
        let count = times.len();

        if count < self.threshold {
            return Outcome::default();
        }

        let mut outcome = Outcome {
            matched: true,
            alert: None,
        };

        // Alert at most once per cooldown per template.
        let due = match state.last_alert.get(query) {
            None => true,
            Some(last) => t
                .duration_since(*last)
                .map(|elapsed| elapsed >= self.cooldown)
                .unwrap_or(false),
        };
        if due {
            state.last_alert.insert(query.to_string(), t);
            outcome.alert = Some(Alert {
                query: query.to_string(),
                count,
            });
        }

        outcome
    }
}
