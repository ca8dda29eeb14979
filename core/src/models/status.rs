use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job or step execution.
///
/// Variants are declared in severity order, so the derived `Ord` is the total
/// order used when several statuses are folded into one (`max` = most severe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Completed,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Abandoned,
    Unknown,
}

impl BatchStatus {
    pub fn is_running(self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Stopped
                | BatchStatus::Abandoned
        )
    }

    pub fn is_unsuccessful(self) -> bool {
        self == BatchStatus::Failed || self > BatchStatus::Failed
    }

    /// Moves forward along the status order, never backward.
    ///
    /// Once either side is past STARTED the more severe one wins. Below that,
    /// COMPLETED wins over STARTING/STARTED so a finished execution is not
    /// dragged back into a running state by a stale value.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        if self > BatchStatus::Started || other > BatchStatus::Started {
            return self.max(other);
        }
        if self == BatchStatus::Completed || other == BatchStatus::Completed {
            return BatchStatus::Completed;
        }
        self.max(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(BatchStatus::Completed),
            "STARTING" => Ok(BatchStatus::Starting),
            "STARTED" => Ok(BatchStatus::Started),
            "STOPPING" => Ok(BatchStatus::Stopping),
            "STOPPED" => Ok(BatchStatus::Stopped),
            "FAILED" => Ok(BatchStatus::Failed),
            "ABANDONED" => Ok(BatchStatus::Abandoned),
            "UNKNOWN" => Ok(BatchStatus::Unknown),
            other => Err(anyhow::anyhow!("Invalid BatchStatus value: {}", other)),
        }
    }
}

/// Exit code plus free-form description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitStatus {
    pub exit_code: String,
    pub exit_description: String,
}

impl ExitStatus {
    pub const UNKNOWN: &'static str = "UNKNOWN";
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const NOOP: &'static str = "NOOP";
    pub const FAILED: &'static str = "FAILED";
    pub const STOPPED: &'static str = "STOPPED";

    pub fn new(exit_code: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: String::new(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    /// Maps a terminal batch status onto its conventional exit code.
    pub fn for_status(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Completed => Self::completed(),
            BatchStatus::Failed => Self::failed(),
            BatchStatus::Stopped | BatchStatus::Stopping => Self::stopped(),
            BatchStatus::Starting | BatchStatus::Started => Self::executing(),
            BatchStatus::Abandoned | BatchStatus::Unknown => Self::unknown(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.exit_description = description.into();
        self
    }

    /// Appends to the existing description, separated by `"; "`.
    pub fn add_description(mut self, description: &str) -> Self {
        if description.is_empty() || self.exit_description.contains(description) {
            return self;
        }
        if self.exit_description.is_empty() {
            self.exit_description = description.to_string();
        } else {
            self.exit_description = format!("{}; {}", self.exit_description, description);
        }
        self
    }

    fn severity(&self) -> u8 {
        match self.exit_code.as_str() {
            Self::EXECUTING => 1,
            Self::COMPLETED => 2,
            Self::NOOP => 3,
            Self::STOPPED => 4,
            Self::FAILED => 5,
            Self::UNKNOWN => 6,
            _ => 7,
        }
    }

    /// Combines two exit statuses, keeping the more severe code.
    ///
    /// Equal severity keeps `self`'s code. Descriptions from both sides are
    /// kept.
    pub fn and(self, other: ExitStatus) -> ExitStatus {
        let description = other.exit_description.clone();
        let combined = match self.severity().cmp(&other.severity()) {
            Ordering::Less => ExitStatus {
                exit_code: other.exit_code,
                exit_description: self.exit_description,
            },
            _ => self,
        };
        combined.add_description(&description)
    }

    pub fn is_running(&self) -> bool {
        self.exit_code == Self::EXECUTING || self.exit_code == Self::UNKNOWN
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::executing()
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exit_description.is_empty() {
            f.write_str(&self.exit_code)
        } else {
            write!(f, "{} ({})", self.exit_code, self.exit_description)
        }
    }
}
