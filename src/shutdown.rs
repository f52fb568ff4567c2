use std::time::Duration;

use tokio::sync::watch;

/// Sending half of the shutdown signal shared by the background loops.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // Receivers may all be gone already, nothing left to stop then.
        let _ = self.0.send(true);
    }
}

/// Receiving half of the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Sleeps for `duration` unless shutdown is signalled first.
    /// Returns `true` when the caller should stop.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = self.0.changed() => {
                // A dropped trigger means nobody can ever ask us to keep going.
                changed.is_err() || *self.0.borrow()
            }
        }
    }
}
