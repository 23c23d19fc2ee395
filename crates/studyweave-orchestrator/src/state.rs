//! Per-chapter state machine
//!
//! ```text
//! Pending -> Phase1Running -> Phase1Failed                      (terminal)
//!                          -> Phase1Done -> Phase2Running(i/n) -> Done(complete | partial)
//! ```
//!
//! `Phase2Running` advances once per finished target. `Cancelled` is reachable
//! from every non-terminal state.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// How a chapter ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    /// Phase 1 and every Phase 2 target succeeded.
    Complete,
    /// Phase 1 succeeded, at least one target was omitted.
    Partial,
    /// Phase 1 failed; the chapter was not enhanced.
    Failed,
    Cancelled,
}

impl ChapterStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ChapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterState {
    Pending,
    Phase1Running,
    Phase1Failed,
    Phase1Done,
    Phase2Running { finished: usize, total: usize },
    Done { partial: bool },
    Cancelled,
}

impl ChapterState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Phase1Failed | Self::Done { .. } | Self::Cancelled
        )
    }

    /// Whether `self -> next` is a legal step.
    #[must_use]
    pub const fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            (s, Self::Cancelled) => !s.is_terminal(),
            (Self::Pending, Self::Phase1Running)
            | (Self::Phase1Running, Self::Phase1Failed | Self::Phase1Done) => true,
            (Self::Phase1Done, Self::Phase2Running { finished: 0, .. }) => true,
            // A chapter without targets has nothing to run in Phase 2.
            (Self::Phase1Done, Self::Done { partial: false }) => true,
            (
                Self::Phase2Running { finished, total },
                Self::Phase2Running {
                    finished: next_finished,
                    total: next_total,
                },
            ) => *total == *next_total && *next_finished == *finished + 1 && *next_finished <= *total,
            (Self::Phase2Running { finished, total }, Self::Done { .. }) => *finished == *total,
            _ => false,
        }
    }
}

impl fmt::Display for ChapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Phase1Running => f.write_str("phase1_running"),
            Self::Phase1Failed => f.write_str("phase1_failed"),
            Self::Phase1Done => f.write_str("phase1_done"),
            Self::Phase2Running { finished, total } => {
                write!(f, "phase2_running({finished}/{total})")
            }
            Self::Done { partial: false } => f.write_str("done"),
            Self::Done { partial: true } => f.write_str("done(partial)"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Tracks one chapter through its states, logging every step.
#[derive(Debug)]
pub struct ChapterTracker {
    chapter_id: String,
    state: ChapterState,
}

impl ChapterTracker {
    pub fn new(chapter_id: impl Into<String>) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            state: ChapterState::Pending,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ChapterState {
        self.state
    }

    /// Move to `next`. Illegal steps are logged and ignored.
    pub fn advance(&mut self, next: ChapterState) -> bool {
        if !self.state.can_transition_to(&next) {
            debug!(
                chapter_id = %self.chapter_id,
                from = %self.state,
                to = %next,
                "ignoring illegal chapter state transition"
            );
            return false;
        }
        debug!(chapter_id = %self.chapter_id, from = %self.state, to = %next, "chapter state");
        self.state = next;
        true
    }

    /// Record one more finished Phase 2 target.
    pub fn target_finished(&mut self) -> bool {
        match self.state {
            ChapterState::Phase2Running { finished, total } => {
                self.advance(ChapterState::Phase2Running {
                    finished: finished + 1,
                    total,
                })
            }
            _ => false,
        }
    }

    /// Final status, once the tracker reached a terminal state.
    #[must_use]
    pub const fn status(&self) -> Option<ChapterStatus> {
        match self.state {
            ChapterState::Phase1Failed => Some(ChapterStatus::Failed),
            ChapterState::Done { partial: false } => Some(ChapterStatus::Complete),
            ChapterState::Done { partial: true } => Some(ChapterStatus::Partial),
            ChapterState::Cancelled => Some(ChapterStatus::Cancelled),
            _ => None,
        }
    }
}
