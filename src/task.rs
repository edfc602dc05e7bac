//! Delayed and periodic background tasks with explicit cancellation.
//!
//! Both the reconnection path and the polling fallback schedule work through this module so
//! there is exactly one way to start a timer and exactly one way to stop it.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use rand::Rng as _;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Handle to a scheduled task.
///
/// Cancelling is synchronous: once [`TaskHandle::cancel`] returns, the task will not start
/// another run of its body. A run that already started is left to finish. The task is also
/// cancelled when the handle is dropped.
#[derive(Debug)]
pub struct TaskHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the task body will never run again, either because it was cancelled or because it
    /// completed on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.token.is_cancelled() || self.join.is_finished()
    }

    /// Token observed by the task, for callers that want to tie other work to its lifetime.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Multiplies `base` by a factor drawn uniformly from `[1 - spread, 1 + spread]`.
///
/// `spread` is clamped to `[0, 1]`.
#[expect(
    clippy::float_arithmetic,
    reason = "Jitter is inherently a floating point scale factor"
)]
#[must_use]
pub fn jittered(base: Duration, spread: f64) -> Duration {
    let spread = spread.clamp(0.0, 1.0);
    if spread <= 0.0 {
        return base;
    }

    let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
    base.mul_f64(factor)
}

/// Runs `future` until it completes or the handle is cancelled.
pub fn spawn_until_cancelled<Fut>(future: Fut) -> TaskHandle
where
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let task_token = token.clone();

    let join = tokio::spawn(async move {
        tokio::select! {
            biased;
            () = task_token.cancelled() => {}
            () = future => {}
        }
    });

    TaskHandle { token, join }
}

/// Runs `task` once after `delay` unless cancelled first.
pub fn spawn_after<F, Fut>(delay: Duration, task: F) -> TaskHandle
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let task_token = token.clone();

    let join = tokio::spawn(async move {
        tokio::select! {
            biased;
            () = task_token.cancelled() => {}
            () = sleep(delay) => {
                if !task_token.is_cancelled() {
                    task().await;
                }
            }
        }
    });

    TaskHandle { token, join }
}

/// Runs `task` repeatedly. Each run is preceded by a wait of `period` scaled by a fresh
/// jitter factor (see [`jittered`]). The task stops itself by returning
/// [`ControlFlow::Break`].
pub fn spawn_every<F, Fut>(period: Duration, spread: f64, mut task: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ControlFlow<()>> + Send + 'static,
{
    let token = CancellationToken::new();
    let task_token = token.clone();

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = task_token.cancelled() => break,
                () = sleep(jittered(period, spread)) => {}
            }

            // Cancellation may have raced with the timer firing.
            if task_token.is_cancelled() {
                break;
            }

            if task().await.is_break() {
                task_token.cancel();
                break;
            }
        }
    });

    TaskHandle { token, join }
}
