//! Background thread tailing a master's changelog

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use nslog_common::Result;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// A service that can apply what a master appended since the last cycle
pub(crate) trait Follow: Send + Sync + 'static {
    fn follow_cycle(&self) -> Result<()>;
}

/// Handle of a running follower thread
///
/// The thread holds only a weak reference to its service, so dropping the
/// service ends it at the next cycle.
pub(crate) struct FollowerHandle {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl FollowerHandle {
    pub(crate) fn spawn<S: Follow>(
        name: &str,
        service: Weak<S>,
        interval: Duration,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("{name}-follower"))
            .spawn(move || {
                debug!("{} follower started", thread_name);
                loop {
                    let Some(service) = service.upgrade() else {
                        break;
                    };
                    if let Err(e) = service.follow_cycle() {
                        error!("{} follower cycle failed: {}", thread_name, e);
                    }
                    drop(service);

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("{} follower stopped", thread_name);
            })?;

        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Wake the thread and wait for it to exit
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            // the follower itself may drop the last reference to its service
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for FollowerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    struct Counting(AtomicU32);

    impl Follow for Counting {
        fn follow_cycle(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_follower_runs_and_stops_promptly() {
        let service = Arc::new(Counting(AtomicU32::new(0)));
        let follower =
            FollowerHandle::spawn("test", Arc::downgrade(&service), Duration::from_secs(60))
                .unwrap();

        // first cycle runs immediately
        let deadline = Instant::now() + Duration::from_secs(5);
        while service.0.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(service.0.load(Ordering::SeqCst), 1);

        // stopping does not wait for the 60s poll interval
        let started = Instant::now();
        follower.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_follower_ends_when_service_dropped() {
        let service = Arc::new(Counting(AtomicU32::new(0)));
        let follower =
            FollowerHandle::spawn("test", Arc::downgrade(&service), Duration::from_millis(1))
                .unwrap();
        drop(service);
        follower.stop();
    }
}
