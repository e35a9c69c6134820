//! Single-shot cancelable timer with Go-style stop semantics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender};

/// Fires `f` once after the duration unless stopped first. The `armed`
/// flag arbitrates the race between `stop` and the deadline: exactly one
/// side wins.
pub struct Timer {
    armed: Arc<AtomicBool>,
    cancel: Sender<()>,
}

impl Timer {
    pub fn after<F>(duration: Duration, f: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        let armed = Arc::new(AtomicBool::new(true));
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let fired = armed.clone();
        thread::spawn(move || {
            select! {
                recv(cancel_rx) -> _ => {}
                default(duration) => {
                    if fired
                        .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        f();
                    }
                }
            }
        });
        Timer {
            armed,
            cancel: cancel_tx,
        }
    }

    /// True when the timer was still pending; false means it already fired
    /// (or is firing) and the callback ran.
    pub fn stop(&self) -> bool {
        let won = self
            .armed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        let _ = self.cancel.try_send(());
        won
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_once_after_deadline() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let _timer = Timer::after(Duration::from_millis(10), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(60));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_before_deadline_wins() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let timer = Timer::after(Duration::from_millis(200), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.stop());
        thread::sleep(Duration::from_millis(250));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // A second stop reports the timer as no longer pending.
        assert!(!timer.stop());
    }

    #[test]
    fn stop_after_fire_reports_failure() {
        let timer = Timer::after(Duration::from_millis(5), || {});
        thread::sleep(Duration::from_millis(60));
        assert!(!timer.stop());
    }
}
