//! In-memory [`CommandPublisher`] used by unit and integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::pipeline::types::{PumpCommandMessage, ThresholdMessage};
use crate::transport::{CommandPublisher, TransportError};

/// Records every published message. Can be switched into a disconnected
/// state to exercise publish failures.
#[derive(Default)]
pub struct RecordingPublisher {
    commands: Mutex<Vec<PumpCommandMessage>>,
    thresholds: Mutex<Vec<ThresholdMessage>>,
    disconnected: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<PumpCommandMessage> {
        match self.commands.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn thresholds(&self) -> Vec<ThresholdMessage> {
        match self.thresholds.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(TransportError::Disconnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CommandPublisher for RecordingPublisher {
    async fn publish_pump_command(&self, message: &PumpCommandMessage) -> Result<(), TransportError> {
        self.check_connected()?;
        if let Ok(mut guard) = self.commands.lock() {
            guard.push(message.clone());
        }
        Ok(())
    }

    async fn publish_thresholds(&self, message: &ThresholdMessage) -> Result<(), TransportError> {
        self.check_connected()?;
        if let Ok(mut guard) = self.thresholds.lock() {
            guard.push(message.clone());
        }
        Ok(())
    }
}
