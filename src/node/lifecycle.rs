/*!
 * Reload / terminate requests
 *
 * Requests are recorded on a watch channel and only observed at sleep
 * boundaries: an in-flight scan or transfer always runs to completion.
 */

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Requests {
    reloads: u64,
    terminate: bool,
}

/// Why a [`Lifecycle::sleep`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Elapsed,
    Reload,
    Terminate,
}

/// Sending half, held by signal handlers and tests
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    tx: Arc<watch::Sender<Requests>>,
}

impl LifecycleHandle {
    pub fn reload(&self) {
        self.tx.send_modify(|requests| requests.reloads += 1);
    }

    pub fn terminate(&self) {
        self.tx.send_modify(|requests| requests.terminate = true);
    }
}

/// Receiving half, owned by the control loop
#[derive(Debug)]
pub struct Lifecycle {
    rx: watch::Receiver<Requests>,
    reloads_seen: u64,
}

pub fn channel() -> (LifecycleHandle, Lifecycle) {
    let (tx, rx) = watch::channel(Requests::default());
    (
        LifecycleHandle { tx: Arc::new(tx) },
        Lifecycle {
            rx,
            reloads_seen: 0,
        },
    )
}

impl Lifecycle {
    pub fn terminate_requested(&self) -> bool {
        self.rx.borrow().terminate
    }

    /// Pending request, if any; a reload is consumed by reporting it
    fn pending(&mut self) -> Option<Wakeup> {
        let requests = *self.rx.borrow_and_update();
        if requests.terminate {
            Some(Wakeup::Terminate)
        } else if requests.reloads > self.reloads_seen {
            self.reloads_seen = requests.reloads;
            Some(Wakeup::Reload)
        } else {
            None
        }
    }

    /// Sleep for `duration` unless a request arrives first
    pub async fn sleep(&mut self, duration: Duration) -> Wakeup {
        let deadline = Instant::now() + duration;
        let mut sender_alive = true;
        loop {
            if let Some(wakeup) = self.pending() {
                return wakeup;
            }
            if !sender_alive {
                sleep_until(deadline).await;
                return Wakeup::Elapsed;
            }
            tokio::select! {
                _ = sleep_until(deadline) => return Wakeup::Elapsed,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        sender_alive = false;
                    }
                }
            }
        }
    }
}

/// Route SIGHUP to reload and SIGTERM / SIGINT to terminate
#[cfg(unix)]
pub fn install_signal_handlers(handle: LifecycleHandle) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("SIGHUP received; restarting the cycle");
                    handle.reload();
                }
                _ = term.recv() => {
                    info!("SIGTERM received; exiting after the current cycle");
                    handle.terminate();
                }
                _ = interrupt.recv() => {
                    info!("Interrupted; exiting after the current cycle");
                    handle.terminate();
                }
            }
        }
    });
    debug!("Signal handlers installed");
    Ok(())
}

#[cfg(not(unix))]
pub fn install_signal_handlers(handle: LifecycleHandle) -> std::io::Result<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted; exiting after the current cycle");
                handle.terminate();
            }
            Err(e) => tracing::warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_elapses() {
        let (_handle, mut lifecycle) = channel();
        let wakeup = lifecycle.sleep(Duration::from_millis(10)).await;
        assert_eq!(wakeup, Wakeup::Elapsed);
    }

    #[tokio::test]
    async fn test_reload_interrupts_sleep_once() {
        let (handle, mut lifecycle) = channel();
        let sender = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.reload();
        });
        assert_eq!(lifecycle.sleep(Duration::from_secs(30)).await, Wakeup::Reload);
        // consumed: the next sleep runs its course
        assert_eq!(
            lifecycle.sleep(Duration::from_millis(10)).await,
            Wakeup::Elapsed
        );
        drop(handle);
    }

    #[tokio::test]
    async fn test_terminate_is_sticky() {
        let (handle, mut lifecycle) = channel();
        handle.terminate();
        assert!(lifecycle.terminate_requested());
        assert_eq!(lifecycle.sleep(Duration::from_secs(30)).await, Wakeup::Terminate);
        assert_eq!(lifecycle.sleep(Duration::from_secs(30)).await, Wakeup::Terminate);
    }

    #[tokio::test]
    async fn test_dropped_handle_still_sleeps() {
        let (handle, mut lifecycle) = channel();
        drop(handle);
        assert_eq!(
            lifecycle.sleep(Duration::from_millis(10)).await,
            Wakeup::Elapsed
        );
    }
}
