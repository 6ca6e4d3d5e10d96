use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{BackoffFactory, BackoffStep};

/// What an [`IterableBackoff`] does once its list is used up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exhaustion {
    /// Stop the chain after the last listed delay
    #[default]
    Stop,
    /// Keep yielding the last listed delay forever
    RepeatLast,
}

/// Walks a fixed list of delays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterableBackoff {
    durations: Arc<[Duration]>,
    exhaustion: Exhaustion,
}

impl IterableBackoff {
    /// Chain over `durations`, stopping after the last one
    pub fn new(durations: impl IntoIterator<Item = Duration>) -> Self {
        Self { durations: durations.into_iter().collect(), exhaustion: Exhaustion::Stop }
    }

    /// What happens once the list runs out
    pub fn with_exhaustion(mut self, exhaustion: Exhaustion) -> Self {
        self.exhaustion = exhaustion;
        self
    }

    /// Number of listed delays
    pub fn len(&self) -> usize {
        self.durations.len()
    }

    /// True when no delay is listed
    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }
}

#[derive(Debug)]
struct IterableStep {
    durations: Arc<[Duration]>,
    exhaustion: Exhaustion,
    index: usize,
}

impl<C> BackoffStep<C> for IterableStep {
    fn duration(&self) -> Duration {
        self.durations[self.index]
    }

    fn next(&self, _context: &C) -> Option<Box<dyn BackoffStep<C>>> {
        let index = if self.index + 1 < self.durations.len() {
            self.index + 1
        } else {
            match self.exhaustion {
                Exhaustion::Stop => return None,
                Exhaustion::RepeatLast => self.index,
            }
        };
        Some(Box::new(Self {
            durations: Arc::clone(&self.durations),
            exhaustion: self.exhaustion,
            index,
        }))
    }
}

impl<C> BackoffFactory<C> for IterableBackoff {
    fn next(&self, _context: &C) -> Option<Box<dyn BackoffStep<C>>> {
        if self.durations.is_empty() {
            return None;
        }
        Some(Box::new(IterableStep {
            durations: Arc::clone(&self.durations),
            exhaustion: self.exhaustion,
            index: 0,
        }))
    }
}
