// Job Status & Transition Policy

use serde::{Deserialize, Serialize};

/// Processing lifecycle of an import batch
///
/// Discriminants are the persisted values and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum JobStatus {
    Uploaded = 0,
    Queued = 1,
    Processing = 2,
    Completed = 3,
    Failed = 4,
    Canceled = 5,
    Duplicate = 6,
    Superseded = 7,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Uploaded,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Canceled,
        JobStatus::Duplicate,
        JobStatus::Superseded,
    ];

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_i32() == value)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Uploaded => "Uploaded",
            JobStatus::Queued => "Queued",
            JobStatus::Processing => "Processing",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Canceled => "Canceled",
            JobStatus::Duplicate => "Duplicate",
            JobStatus::Superseded => "Superseded",
        };
        f.write_str(name)
    }
}

/// Static transition table for [`JobStatus`]
pub struct JobStatusPolicy;

impl JobStatusPolicy {
    /// Legal next states; empty for terminal states
    pub fn allowed_next(current: JobStatus) -> &'static [JobStatus] {
        use JobStatus::*;
        match current {
            Uploaded => &[Queued, Canceled, Duplicate],
            Queued => &[Processing, Canceled],
            Processing => &[Completed, Failed, Canceled, Superseded],
            Completed | Failed | Canceled | Duplicate | Superseded => &[],
        }
    }

    pub fn can_transition(current: JobStatus, next: JobStatus) -> bool {
        Self::allowed_next(current).contains(&next)
    }

    pub fn is_terminal(status: JobStatus) -> bool {
        matches!(
            status,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Canceled
                | JobStatus::Duplicate
                | JobStatus::Superseded
        )
    }
}
