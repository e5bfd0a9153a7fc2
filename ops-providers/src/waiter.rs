use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use ops_common::OpsError;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of one poll of a long-running backend operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Poll<T> {
    Ready(T),
    /// Still running; `progress` is a percentage when the backend reports one.
    Pending { progress: Option<u8> },
    /// Terminal failure state reported by the backend.
    Failed(String),
}

impl<T> Poll<T> {
    pub fn pending() -> Self {
        Poll::Pending { progress: None }
    }
}

/// Polls a check with a fixed delay until it is ready, fails, or the attempt
/// budget (or optional deadline) runs out.
#[derive(Debug, Clone)]
pub struct Waiter {
    pub operation: String,
    pub delay: Duration,
    pub max_attempts: u32,
    pub deadline: Option<Duration>,
}

impl Waiter {
    pub fn new(operation: impl Into<String>, delay: Duration, max_attempts: u32) -> Self {
        Self {
            operation: operation.into(),
            delay,
            max_attempts: max_attempts.max(1),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn snapshot_import() -> Self {
        Self::new("snapshot import", Duration::from_secs(15), 120)
    }

    pub fn instance_terminated() -> Self {
        Self::new("instance termination", Duration::from_secs(15), 120)
    }

    pub fn static_ip() -> Self {
        Self::new("instance leaving pending", Duration::from_secs(2), 60)
    }

    pub async fn wait<T, F, Fut>(&self, check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Poll<T>>>,
    {
        self.wait_with_progress(check, |_| {}).await
    }

    /// Like [`Waiter::wait`], reporting each numeric progress value to `sink`.
    pub async fn wait_with_progress<T, F, Fut, S>(&self, mut check: F, mut sink: S) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Poll<T>>>,
        S: FnMut(u8),
    {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match check().await? {
                Poll::Ready(v) => return Ok(v),
                Poll::Failed(state) => {
                    return Err(OpsError::Failed {
                        operation: self.operation.clone(),
                        state,
                    }
                    .into())
                }
                Poll::Pending { progress } => {
                    if let Some(p) = progress {
                        sink(p.min(100));
                    }
                }
            }

            if attempts >= self.max_attempts {
                break;
            }
            if let Some(deadline) = self.deadline {
                if started.elapsed() + self.delay > deadline {
                    break;
                }
            }
            debug!(
                "[waiter] {} pending (attempt {}/{})",
                self.operation, attempts, self.max_attempts
            );
            tokio::time::sleep(self.delay).await;
        }

        Err(OpsError::Timeout {
            operation: self.operation.clone(),
            attempts,
            elapsed: started.elapsed(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn waiter() -> Waiter {
        Waiter::new("test op", Duration::from_secs(15), 5)
    }

    #[tokio::test(start_paused = true)]
    async fn pending_then_ready_sleeps_once_per_pending() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let c = calls.clone();
        let out = waiter()
            .wait(move || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    Ok(if n < 3 { Poll::pending() } else { Poll::Ready(n) })
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_times_out_within_budget() {
        let start = Instant::now();
        let err = waiter()
            .wait(|| async { Ok(Poll::<()>::pending()) })
            .await
            .unwrap_err();
        assert!(OpsError::is_timeout(&err));
        assert!(start.elapsed() <= Duration::from_secs(15 * 5));
        match OpsError::find(&err) {
            Some(OpsError::Timeout { attempts, .. }) => assert_eq!(*attempts, 5),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failure_state_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = waiter()
            .wait(move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(Poll::<()>::Failed("deleted".into()))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("deleted"));
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = waiter()
            .wait(move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<Poll<()>, _>(anyhow::anyhow!("throttled"))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.to_string(), "throttled");
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_forwarded_to_sink() {
        let steps = Arc::new(std::sync::Mutex::new(vec![Some(10u8), Some(60), None]));
        let seen = std::cell::RefCell::new(Vec::new());
        let s = steps.clone();
        let res = waiter()
            .wait_with_progress(
                move || {
                    let s = s.clone();
                    async move {
                        let mut s = s.lock().unwrap();
                        Ok(if s.is_empty() {
                            Poll::Ready("done")
                        } else {
                            Poll::Pending { progress: s.remove(0) }
                        })
                    }
                },
                |p| seen.borrow_mut().push(p),
            )
            .await
            .unwrap();
        assert_eq!(res, "done");
        assert_eq!(*seen.borrow(), vec![10, 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cuts_attempts_short() {
        let start = Instant::now();
        let w = Waiter::new("deadline", Duration::from_secs(10), 100)
            .with_deadline(Duration::from_secs(25));
        let err = w.wait(|| async { Ok(Poll::<()>::pending()) }).await.unwrap_err();
        assert!(OpsError::is_timeout(&err));
        assert!(start.elapsed() <= Duration::from_secs(25));
    }
}
