//! Scriptable projector for coordinator tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use chronicle_core::BoxFuture;
use chronicle_core::event::{GlobalSequence, RecordedEvent};
use chronicle_core::projection::{ProjectionError, Projector, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Script {
    applied: Vec<GlobalSequence>,
    failing: HashSet<GlobalSequence>,
    delays: HashMap<GlobalSequence, Duration>,
    attempts: HashMap<GlobalSequence, u32>,
    resets: u32,
    failing_resets: bool,
    initialized: bool,
}

/// Projector that records what it applied and fails or stalls on demand.
///
/// Clones share the same script, so a test keeps one clone to inspect and
/// steer the projector after handing another to the coordinator.
///
/// ```
/// use chronicle_testing::RecordingProjector;
/// use chronicle_core::event::GlobalSequence;
///
/// let projector = RecordingProjector::new("ticket_stats");
/// projector.fail_on(GlobalSequence::new(11));
/// assert!(projector.applied().is_empty());
/// ```
#[derive(Clone, Debug)]
pub struct RecordingProjector {
    name: String,
    script: Arc<Mutex<Script>>,
}

impl RecordingProjector {
    /// Create a projector with the given projection name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Fail every attempt to apply the event at `sequence`.
    pub fn fail_on(&self, sequence: GlobalSequence) {
        self.script.lock().unwrap().failing.insert(sequence);
    }

    /// Stop failing on `sequence`.
    pub fn heal(&self, sequence: GlobalSequence) {
        self.script.lock().unwrap().failing.remove(&sequence);
    }

    /// Sleep for `delay` before applying the event at `sequence`.
    pub fn delay_on(&self, sequence: GlobalSequence, delay: Duration) {
        self.script.lock().unwrap().delays.insert(sequence, delay);
    }

    /// Make `reset` fail (without clearing anything) until called with `false`.
    pub fn fail_resets(&self, failing: bool) {
        self.script.lock().unwrap().failing_resets = failing;
    }

    /// Global sequences applied successfully since the last reset, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<GlobalSequence> {
        self.script.lock().unwrap().applied.clone()
    }

    /// Number of apply attempts (failed or not) for `sequence`.
    #[must_use]
    pub fn attempts(&self, sequence: GlobalSequence) -> u32 {
        self.script
            .lock()
            .unwrap()
            .attempts
            .get(&sequence)
            .copied()
            .unwrap_or(0)
    }

    /// Number of resets.
    #[must_use]
    pub fn resets(&self) -> u32 {
        self.script.lock().unwrap().resets
    }

    /// Whether `initialize` has run.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.script.lock().unwrap().initialized
    }
}

impl Projector for RecordingProjector {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.script.lock().unwrap().initialized = true;
            Ok(())
        })
    }

    fn apply<'a>(&'a self, event: &'a RecordedEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sequence = event.global_sequence;
            let delay = {
                let mut script = self.script.lock().unwrap();
                *script.attempts.entry(sequence).or_insert(0) += 1;
                script.delays.get(&sequence).copied()
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut script = self.script.lock().unwrap();
            if script.failing.contains(&sequence) {
                return Err(ProjectionError::EventProcessing(format!(
                    "cannot apply {} at {sequence}",
                    event.event_type
                )));
            }
            script.applied.push(sequence);
            Ok(())
        })
    }

    fn reset(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut script = self.script.lock().unwrap();
            if script.failing_resets {
                return Err(ProjectionError::Storage("read model unavailable".to_string()));
            }
            script.applied.clear();
            script.resets += 1;
            Ok(())
        })
    }
}
