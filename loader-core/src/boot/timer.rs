//! Stage timing.

use super::context::LogSink;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Times boot stages and logs each one as `"{label} | Time: {ms}ms"`.
///
/// Only [`super::BootContext`] creates one, on entering `Initializing`.
pub struct BootTimer {
    started: Instant,
    sink: Arc<dyn LogSink>,
}

impl BootTimer {
    pub(super) fn start(sink: Arc<dyn LogSink>) -> Self {
        Self {
            started: Instant::now(),
            sink,
        }
    }

    /// Run `stage` and log how long it took.
    pub fn execute<T>(&self, label: &str, stage: impl FnOnce() -> T) -> T {
        execute_timed(self.sink.as_ref(), label, stage)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Log the total time since the boot started.
    pub fn report_total(&self) {
        self.sink.write_line(&format!(
            "Total Loader Initialization Time: {}ms",
            self.elapsed().as_millis()
        ));
    }
}

/// Run `stage` and log its duration to `sink`. For work that outlives the
/// boot timer, such as delayed mod loading.
pub(crate) fn execute_timed<T>(sink: &dyn LogSink, label: &str, stage: impl FnOnce() -> T) -> T {
    let before = Instant::now();
    let result = stage();
    sink.write_line(&format!(
        "{} | Time: {}ms",
        label,
        before.elapsed().as_millis()
    ));
    result
}
