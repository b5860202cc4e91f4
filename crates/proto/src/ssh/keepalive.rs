//! Idle heartbeat.
//!
//! Servers and middleboxes drop connections that stay silent for too long.
//! While a [`Heartbeat`] runs, an `SSH_MSG_IGNORE` carrying random filler is
//! sent every period. The first beat comes one full period after spawning.

use crate::ssh::buffer::Buffer;
use crate::ssh::message::MessageType;
use std::future::Future;
use std::time::Duration;
use tern_platform::{RandomSource, TernResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{trace, warn};

/// A background task invoking a beat callback at a fixed period.
///
/// Stops on [`Heartbeat::stop`], on drop, or after the first failed beat.
pub struct Heartbeat {
    period: Duration,
    halt: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawns the heartbeat on the current runtime.
    pub fn spawn<F, Fut>(period: Duration, mut beat: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TernResult<()>> + Send + 'static,
    {
        let (halt, mut halted) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = async { halted.wait_for(|stop| *stop).await.map(|_| ()) } => break,
                    _ = ticker.tick() => {}
                }
                if let Err(err) = beat().await {
                    warn!("Heartbeat failed, stopping: {}", err);
                    break;
                }
                trace!("Heartbeat sent");
            }
        });
        Self { period, halt, task }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Asks the task to stop. Idempotent.
    pub fn stop(&self) {
        self.halt.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds an `SSH_MSG_IGNORE` payload with `filler` random bytes.
pub fn ignore_message(random: &dyn RandomSource, filler: usize) -> Vec<u8> {
    let mut data = vec![0u8; filler];
    random.fill(&mut data);
    let mut buf = Buffer::for_message(MessageType::Ignore);
    buf.put_bytes(&data);
    buf.into_vec()
}
