//! Notification sink that writes one JSON object per line.

use std::fmt;
use std::io::{self, Write};

use async_trait::async_trait;
use parking_lot::Mutex;

use claw_routing::{DispatchError, DispatchSink, Notification};

/// Writes every notification as a JSON line.
///
/// Serialization failures reject the notification; write failures are
/// reported as unavailable so the dispatcher retries them.
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    /// Creates a sink over an arbitrary writer.
    #[must_use]
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Creates a sink writing to stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl fmt::Debug for JsonLinesSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl DispatchSink for JsonLinesSink {
    async fn dispatch(&self, notification: &Notification) -> Result<(), DispatchError> {
        let line = serde_json::to_string(notification).map_err(|e| DispatchError::Rejected(e.to_string()))?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")
            .and_then(|()| writer.flush())
            .map_err(|e| DispatchError::Unavailable(e.to_string()))
    }

    fn name(&self) -> &str {
        "json-lines"
    }
}
