//! Ordered undo list for the extraction pipeline.
//!
//! Each step that creates something registers how to undo it. On completion
//! the list is unwound in reverse order. Teardown of runtime objects runs on
//! every outcome; removal of host directories runs only after a failure.

use futures::future::BoxFuture;
use imagevol_shared::errors::ImagevolResult;

/// When a compensation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    Always,
    OnFailure,
}

type Undo = Box<dyn FnOnce() -> BoxFuture<'static, ImagevolResult<()>> + Send>;

struct Entry {
    name: &'static str,
    when: When,
    undo: Undo,
}

pub struct Compensations {
    volume_id: String,
    entries: Vec<Entry>,
}

impl Compensations {
    pub fn new(volume_id: &str) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn push<F>(&mut self, name: &'static str, when: When, undo: F)
    where
        F: FnOnce() -> BoxFuture<'static, ImagevolResult<()>> + Send + 'static,
    {
        self.entries.push(Entry {
            name,
            when,
            undo: Box::new(undo),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the applicable compensations, last registered first.
    ///
    /// Failures are logged and do not stop the remaining entries. Returns the
    /// number of compensations that failed.
    pub async fn unwind(self, failed: bool) -> usize {
        let mut failures = 0;
        for entry in self.entries.into_iter().rev() {
            if entry.when == When::OnFailure && !failed {
                continue;
            }
            tracing::debug!(
                volume_id = %self.volume_id,
                compensation = entry.name,
                "Running compensation"
            );
            if let Err(e) = (entry.undo)().await {
                failures += 1;
                tracing::warn!(
                    volume_id = %self.volume_id,
                    compensation = entry.name,
                    "Cleanup failed: {}",
                    e
                );
            }
        }
        failures
    }
}
