//! Bounded per-device work queue.
//!
//! Holds the tasks waiting for a device's decision worker. When the queue
//! is full the oldest pending *automatic* decision is evicted to make room;
//! operator commands and device acknowledgements are never evicted, so a
//! queue made entirely of those may grow past its capacity.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::pipeline::error::PipelineError;
use crate::pipeline::types::{PumpAck, PumpCommand, PumpState, Reading};

/// Default number of pending tasks per device.
pub const DEFAULT_CAPACITY: usize = 32;

pub type CommandReply = oneshot::Sender<Result<PumpState, PipelineError>>;

/// One unit of work for a device's decision worker.
#[derive(Debug)]
pub enum DeviceTask {
    /// A new water level reading to evaluate against the thresholds.
    Level(Reading),
    /// An operator command, optionally awaiting the resulting state.
    Command {
        command: PumpCommand,
        reply: Option<CommandReply>,
    },
    /// A device reporting its own pump state.
    Ack(PumpAck),
}

impl DeviceTask {
    /// Only automatic decisions may be evicted under backpressure.
    pub fn is_automatic(&self) -> bool {
        matches!(self, DeviceTask::Level(_))
    }
}

/// FIFO of pending tasks with oldest-automatic eviction.
#[derive(Debug)]
pub struct DeviceQueue {
    tasks: VecDeque<DeviceTask>,
    capacity: usize,
}

impl DeviceQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            tasks: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Enqueue `task`, returning the task evicted to make room, if any.
    pub fn push(&mut self, task: DeviceTask) -> Option<DeviceTask> {
        let evicted = if self.tasks.len() >= self.capacity {
            self.tasks
                .iter()
                .position(DeviceTask::is_automatic)
                .and_then(|idx| self.tasks.remove(idx))
        } else {
            None
        };

        self.tasks.push_back(task);
        evicted
    }

    pub fn pop(&mut self) -> Option<DeviceTask> {
        self.tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DeviceQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
