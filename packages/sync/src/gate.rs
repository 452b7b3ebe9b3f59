//! Persistence debounce shared by the session and its refresh tasks.
//!
//! A server-driven refresh must not run while a local save may still be in
//! flight, and must not re-render a region the local user just changed. Both
//! checks use the same debounce window.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct GateState {
    last_persistence: Option<Instant>,
    recent_edits: HashMap<String, Instant>,
}

#[derive(Debug)]
pub struct PersistenceGate {
    window: Duration,
    state: Mutex<GateState>,
}

impl PersistenceGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(GateState::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// A local persistence action started or finished
    pub fn note_persistence(&self) {
        tracing::trace!("Starting refresh delay");
        self.state.lock().last_persistence = Some(Instant::now());
    }

    /// Regions the editor just re-rendered from a local action.
    ///
    /// Recorded only while a persistence delay is pending; returns how many
    /// paths were recorded.
    pub fn note_local_edits<I, S>(&self, paths: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Instant::now();
        let mut state = self.state.lock();
        if !Self::is_pending(&state, self.window, now) {
            return 0;
        }

        let window = self.window;
        state
            .recent_edits
            .retain(|_, at| now.saturating_duration_since(*at) < window);

        let mut recorded = 0;
        for path in paths {
            let path = path.into();
            tracing::trace!("Detected local update for {}", path);
            state.recent_edits.insert(path, now);
            recorded += 1;
        }
        recorded
    }

    pub fn pending(&self) -> bool {
        Self::is_pending(&self.state.lock(), self.window, Instant::now())
    }

    /// Time left until the window after the last persistence has passed
    pub fn remaining_wait(&self) -> Option<Duration> {
        let state = self.state.lock();
        let last = state.last_persistence?;
        let elapsed = Instant::now().saturating_duration_since(last);
        self.window.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    pub fn has_recent_edit(&self, path: &str) -> bool {
        let state = self.state.lock();
        state
            .recent_edits
            .get(path)
            .map(|at| Instant::now().saturating_duration_since(*at) < self.window)
            .unwrap_or(false)
    }

    /// Wait until no persistence delay is pending.
    ///
    /// A save noted while waiting extends the wait.
    pub async fn settle(&self) {
        while let Some(wait) = self.remaining_wait() {
            tracing::trace!("Waiting after last persistence: {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    fn is_pending(state: &GateState, window: Duration, now: Instant) -> bool {
        state
            .last_persistence
            .map(|last| now.saturating_duration_since(last) < window)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_without_persistence() {
        let gate = PersistenceGate::new(Duration::from_millis(2500));
        assert!(!gate.pending());
        assert_eq!(gate.remaining_wait(), None);

        let start = Instant::now();
        gate.settle().await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_waits_out_window() {
        let gate = PersistenceGate::new(Duration::from_millis(2500));
        gate.note_persistence();
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(gate.remaining_wait(), Some(Duration::from_millis(1500)));

        let start = Instant::now();
        gate.settle().await;
        assert_eq!(Instant::now() - start, Duration::from_millis(1500));
        assert!(!gate.pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_during_wait_extends_it() {
        let gate = Arc::new(PersistenceGate::new(Duration::from_millis(2500)));
        gate.note_persistence();

        let start = Instant::now();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.settle().await })
        };
        tokio::time::sleep(Duration::from_millis(2000)).await;
        gate.note_persistence();
        waiter.await.unwrap();

        assert_eq!(Instant::now() - start, Duration::from_millis(4500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_edits_only_recorded_while_pending() {
        let gate = PersistenceGate::new(Duration::from_millis(2500));
        assert_eq!(gate.note_local_edits(["/a"]), 0);
        assert!(!gate.has_recent_edit("/a"));

        gate.note_persistence();
        assert_eq!(gate.note_local_edits(["/a"]), 1);
        assert!(gate.has_recent_edit("/a"));

        tokio::time::advance(Duration::from_millis(2500)).await;
        assert!(!gate.has_recent_edit("/a"));
    }
}
