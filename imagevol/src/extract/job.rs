use std::fmt;

/// Status of one extraction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The runtime objects of one extraction attempt. Lives only while the
/// volume is materializing.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub volume_id: String,
    pub image: String,
    pub sandbox_id: Option<String>,
    pub container_id: Option<String>,
    pub status: JobStatus,
}

impl ExtractionJob {
    pub fn new(volume_id: &str, image: &str) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            image: image.to_string(),
            sandbox_id: None,
            container_id: None,
            status: JobStatus::Running,
        }
    }

    /// Record the outcome. Only the first terminal status sticks.
    pub fn finish(&mut self, succeeded: bool) {
        if self.status.is_terminal() {
            return;
        }
        self.status = if succeeded {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
    }
}
