//! Shared "a tool is running" flag

use crate::utils::errors::PlanexError;
use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Busy flag set while any tool call is in flight.
///
/// Calls abandoned after a timeout keep the gate busy until they actually
/// return, so a wedged tool is noticed at the next phase boundary.
#[derive(Debug, Clone, Default)]
pub struct ToolGate {
    in_flight: Arc<AtomicUsize>,
}

/// Marks the gate busy until dropped
#[derive(Debug)]
pub struct BusyGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ToolGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a tool call as started
    pub fn enter(&self) -> BusyGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        BusyGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Poll until no tool is running.
    ///
    /// Fails with a timeout error after `timeout` and with a cancellation
    /// error as soon as `abort` fires.
    pub async fn wait_idle(&self, timeout: Duration, poll: Duration, abort: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if abort.is_cancelled() {
                return Err(PlanexError::cancelled("waiting for running tool"));
            }
            if !self.is_busy() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("Tool still running after {:?}", timeout);
                return Err(PlanexError::timeout(timeout.as_millis() as u64));
            }

            tokio::select! {
                _ = abort.cancelled() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_clears_busy_flag() {
        let gate = ToolGate::new();
        assert!(!gate.is_busy());
        let first = gate.enter();
        let second = gate.enter();
        drop(first);
        assert!(gate.is_busy());
        drop(second);
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_once_tool_finishes() {
        let gate = ToolGate::new();
        let guard = gate.enter();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        gate.wait_idle(Duration::from_secs(2), Duration::from_millis(5), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_times_out() {
        let gate = ToolGate::new();
        let _guard = gate.enter();
        let result = gate
            .wait_idle(Duration::from_millis(20), Duration::from_millis(5), &CancellationToken::new())
            .await;
        assert!(result.unwrap_err().to_string().contains("20ms"));
    }

    #[tokio::test]
    async fn test_wait_idle_honours_abort() {
        let gate = ToolGate::new();
        let _guard = gate.enter();
        let abort = CancellationToken::new();
        abort.cancel();
        let result = gate.wait_idle(Duration::from_secs(5), Duration::from_millis(5), &abort).await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
