use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::alert::{AlertSink, with_clock_suffix};
use crate::events::SourceObject;

/// Default budget, just under the 40 second function timeout
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(39);

/// Sends a single timeout alert if it is still armed when its budget runs out.
///
/// The alert is diagnostic only: in-flight work is never cancelled. Dropping
/// the watchdog disarms it, so every exit path of the caller clears the timer.
pub struct Watchdog {
    cancel: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    /// Arm a watchdog for `source`. Must be called from within a tokio runtime.
    pub fn arm(budget: Duration, sink: Arc<dyn AlertSink>, source: &SourceObject) -> Self {
        let cancel = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));

        let token = cancel.clone();
        let task_fired = fired.clone();
        let location = source.to_string();

        tokio::spawn(async move {
            select! {
                biased;

                _ = token.cancelled() => {
                    trace!(source = %location, "Watchdog disarmed");
                }

                _ = tokio::time::sleep(budget) => {
                    task_fired.store(true, Ordering::SeqCst);
                    warn!(
                        source = %location,
                        budget = ?budget,
                        "Thumbnail pipeline did not finish within its time budget"
                    );
                    sink.notify(&with_clock_suffix(&location, Utc::now()));
                }
            }
        });

        Self { cancel, fired }
    }

    /// Whether the timeout alert has been sent
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Disarm and report whether the alert had already fired
    pub fn disarm(self) -> bool {
        self.cancel.cancel();
        self.fired()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
