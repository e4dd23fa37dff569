//! Progress reporting for async handlers

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::step::CancellationSignal;

/// A progress update emitted by a handler
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Percentage complete, 0..=100
    pub percent: u8,

    /// Optional message
    pub message: Option<String>,
}

struct ProgressInner {
    percent: Mutex<u8>,
    cancel: CancellationSignal,
    updates: mpsc::UnboundedSender<ProgressUpdate>,
}

/// Handle given to async handlers for progress and cancellation
///
/// Percent updates are monotonic: a lower value than previously reported
/// is ignored. Updates are forwarded to the tracker, which persists them
/// onto the task row.
///
/// # Example
///
/// ```ignore
/// async fn handle(args: Value, ctx: WorkflowContext, progress: ProgressReporter) -> StepResult {
///     for chunk in 0..10 {
///         if progress.is_cancelled() {
///             return StepResult::fail(StepError::cancelled());
///         }
///         process(chunk).await;
///         progress.set_percent((chunk + 1) * 10);
///     }
///     StepResult::continue_with(TypedValue::string("done"))
/// }
/// ```
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ProgressInner>,
}

impl ProgressReporter {
    /// Create a reporter plus the receiving end of its update stream
    pub fn new(cancel: CancellationSignal) -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(ProgressInner {
                    percent: Mutex::new(0),
                    cancel,
                    updates: tx,
                }),
            },
            rx,
        )
    }

    /// Report progress; regressions are ignored
    pub fn set_percent(&self, percent: u8) {
        let percent = percent.min(100);
        let mut current = self.inner.percent.lock();
        if percent <= *current {
            return;
        }
        *current = percent;
        let _ = self.inner.updates.send(ProgressUpdate {
            percent,
            message: None,
        });
    }

    /// Report a progress message
    pub fn set_message(&self, message: impl Into<String>) {
        let percent = *self.inner.percent.lock();
        let _ = self.inner.updates.send(ProgressUpdate {
            percent,
            message: Some(message.into()),
        });
    }

    /// Whether the owning instance requested cancellation
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Last reported percentage
    pub fn percent(&self) -> u8 {
        *self.inner.percent.lock()
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("percent", &self.percent())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monotonic_percent() {
        let (reporter, mut rx) = ProgressReporter::new(CancellationSignal::new());

        reporter.set_percent(50);
        reporter.set_percent(25); // ignored
        reporter.set_percent(75);

        assert_eq!(reporter.percent(), 75);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.percent, 50);
        assert_eq!(second.percent, 75);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_messages_carry_current_percent() {
        let (reporter, mut rx) = ProgressReporter::new(CancellationSignal::new());

        reporter.set_percent(30);
        reporter.set_message("working");

        let _ = rx.recv().await.unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.percent, 30);
        assert_eq!(update.message.as_deref(), Some("working"));
    }

    #[test]
    fn test_cancellation_visibility() {
        let cancel = CancellationSignal::new();
        let (reporter, _rx) = ProgressReporter::new(cancel.clone());

        assert!(!reporter.is_cancelled());
        cancel.cancel();
        assert!(reporter.is_cancelled());
    }
}
