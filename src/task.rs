use crate::asset::AssetDescriptor;
use crate::error::ErrorRecord;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Abandoned,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Abandoned)
    }

    /// Pending -> InFlight -> {Succeeded | Failed -> Pending | Abandoned}.
    /// A pending task can also be abandoned when the batch is cancelled
    /// while it waits for a retry.
    pub fn can_become(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Abandoned)
                | (InFlight, Succeeded)
                | (InFlight, Failed)
                | (InFlight, Abandoned)
                | (Failed, Pending)
                | (Failed, Abandoned)
        )
    }
}

/// A descriptor plus its attempt state.
#[derive(Debug, Clone)]
pub struct FetchTask {
    index: usize,
    descriptor: AssetDescriptor,
    host: String,
    attempts: u32,
    last_error: Option<ErrorRecord>,
    status: TaskStatus,
    elapsed: Duration,
}

impl FetchTask {
    pub fn new(index: usize, descriptor: AssetDescriptor, host: String) -> Self {
        Self {
            index,
            descriptor,
            host,
            attempts: 0,
            last_error: None,
            status: TaskStatus::Pending,
            elapsed: Duration::ZERO,
        }
    }

    /// Position in the batch; lower indexes are admitted first.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn descriptor(&self) -> &AssetDescriptor {
        &self.descriptor
    }

    pub fn key(&self) -> &str {
        self.descriptor.key()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.last_error.as_ref()
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Time spent in flight, summed over attempts.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn add_elapsed(&mut self, attempt: Duration) {
        self.elapsed += attempt;
    }

    fn transition(&mut self, next: TaskStatus) {
        debug_assert!(
            self.status.can_become(next),
            "illegal transition {:?} -> {:?} for {}",
            self.status,
            next,
            self.key()
        );
        self.status = next;
    }

    pub fn start(&mut self) {
        self.transition(TaskStatus::InFlight);
        self.attempts += 1;
    }

    pub fn succeed(&mut self) {
        self.transition(TaskStatus::Succeeded);
    }

    pub fn fail(&mut self, error: ErrorRecord) {
        self.transition(TaskStatus::Failed);
        self.last_error = Some(error);
    }

    pub fn requeue(&mut self) {
        self.transition(TaskStatus::Pending);
    }

    pub fn abandon(&mut self, error: ErrorRecord) {
        self.transition(TaskStatus::Abandoned);
        self.last_error = Some(error);
    }
}
