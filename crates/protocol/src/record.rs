use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_ACTIVE_PROGRESS;

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    #[serde(rename = "not_started")]
    NotStarted,
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl TransferState {
    /// Returns `true` for states that hold a slot or a queue position.
    pub fn is_live(self) -> bool {
        matches!(self, TransferState::Active | TransferState::Queued)
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferState::NotStarted => "not started",
            TransferState::Queued => "queued",
            TransferState::Active => "active",
            TransferState::Paused => "paused",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Transfer metadata for one resource, keyed by its canonical URL.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub resource_key: String,
    pub state: TransferState,
    /// Fraction in `[0.0, 1.0]`; 1.0 only once completed.
    pub progress: f32,
    /// File name inside the artifact directory, set only when completed.
    pub local_artifact_name: Option<String>,
    /// Resume token file name, present only while paused.
    pub resume_token_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    /// Creates a record that has never been admitted.
    pub fn new(resource_key: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            resource_key: resource_key.into(),
            state: TransferState::NotStarted,
            progress: 0.0,
            local_artifact_name: None,
            resume_token_ref: None,
            created_at,
            expires_at: None,
        }
    }

    /// Records an intermediate progress fraction.
    ///
    /// The value is clamped below 1.0 so that only [`mark_completed`]
    /// can report a finished transfer.
    ///
    /// [`mark_completed`]: Self::mark_completed
    pub fn set_progress(&mut self, fraction: f32) {
        self.progress = if fraction.is_finite() {
            fraction.clamp(0.0, MAX_ACTIVE_PROGRESS)
        } else {
            0.0
        };
    }

    /// Marks the record as admitted and transferring.
    pub fn mark_active(&mut self, fresh: bool) {
        self.state = TransferState::Active;
        self.resume_token_ref = None;
        self.local_artifact_name = None;
        if fresh {
            self.progress = 0.0;
        }
    }

    /// Marks the record as waiting for a free slot.
    pub fn mark_queued(&mut self) {
        self.state = TransferState::Queued;
        self.resume_token_ref = None;
    }

    /// Marks the record as paused with a stored resume token.
    pub fn mark_paused(&mut self, token_ref: String) {
        self.state = TransferState::Paused;
        self.resume_token_ref = Some(token_ref);
    }

    /// Marks the record as finished with its artifact in place.
    pub fn mark_completed(&mut self, artifact_name: String, validity: chrono::TimeDelta) {
        self.state = TransferState::Completed;
        self.progress = 1.0;
        self.local_artifact_name = Some(artifact_name);
        self.resume_token_ref = None;
        self.expires_at = self.created_at.checked_add_signed(validity);
    }

    /// Marks the record as failed. `reset_progress` clears the fraction.
    pub fn mark_failed(&mut self, reset_progress: bool) {
        self.state = TransferState::Failed;
        self.resume_token_ref = None;
        if reset_progress {
            self.progress = 0.0;
        }
    }

    /// Returns the record to the idle state.
    pub fn mark_idle(&mut self, reset_progress: bool) {
        self.state = TransferState::NotStarted;
        self.resume_token_ref = None;
        if reset_progress {
            self.progress = 0.0;
        }
    }

    /// Returns `true` if the record is completed and past its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == TransferState::Completed && self.expires_at.is_some_and(|at| now >= at)
    }

    /// Checks the record-level invariants between state and optional fields.
    pub fn is_consistent(&self) -> bool {
        let completed = self.state == TransferState::Completed;
        let paused = self.state == TransferState::Paused;
        (0.0..=1.0).contains(&self.progress)
            && completed == (self.local_artifact_name.is_some() && self.progress == 1.0)
            && paused == self.resume_token_ref.is_some()
    }
}
