//! Shutdown plumbing.
//!
//! Termination signals are caught on a dedicated thread and turned into a
//! [`Control::Shutdown`] message for the event loop. The loop performs the
//! teardown itself, so the connection inventory is only ever mutated on the
//! loop thread.

use crate::runtime::multiplexer::Wakeup;
use std::io;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, error, info, warn};

/// Messages delivered to the event loop alongside readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Shutdown,
}

/// Cloneable handle for asking a running event loop to shut down.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Sender<Control>,
    wakeup: Arc<dyn Wakeup>,
}

impl ShutdownHandle {
    pub(crate) fn new(tx: Sender<Control>, wakeup: Arc<dyn Wakeup>) -> Self {
        Self { tx, wakeup }
    }

    /// Queue a shutdown and wake the loop out of its wait.
    pub fn request(&self) {
        if self.tx.send(Control::Shutdown).is_err() {
            debug!("Shutdown requested after event loop stopped");
            return;
        }
        if let Err(e) = self.wakeup.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
    }
}

/// Install SIGINT/SIGTERM handlers and spawn a thread that requests shutdown
/// on the first one received.
///
/// Handlers are installed before this returns, so a signal arriving right
/// after startup is never lost to the default disposition.
pub fn spawn_signal_listener(handle: ShutdownHandle) -> io::Result<thread::JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let (mut sigterm, mut sigint) = {
        let _guard = runtime.enter();
        (
            signal(SignalKind::terminate())?,
            signal(SignalKind::interrupt())?,
        )
    };

    thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            let received = runtime.block_on(wait_for_signal(&mut sigterm, &mut sigint));
            match received {
                Some(name) => info!(signal = name, "Received signal, initiating shutdown"),
                None => {
                    error!("Signal streams closed unexpectedly");
                    return;
                }
            }
            handle.request();
        })
}

async fn wait_for_signal(sigterm: &mut Signal, sigint: &mut Signal) -> Option<&'static str> {
    tokio::select! {
        received = sigterm.recv() => received.map(|_| "SIGTERM"),
        received = sigint.recv() => received.map(|_| "SIGINT"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingWakeup(AtomicUsize);

    impl Wakeup for CountingWakeup {
        fn wake(&self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_request_sends_and_wakes() {
        let (tx, rx) = channel();
        let wakeup = Arc::new(CountingWakeup::default());
        let handle = ShutdownHandle::new(tx, wakeup.clone());

        handle.clone().request();

        assert_eq!(rx.try_recv().unwrap(), Control::Shutdown);
        assert_eq!(wakeup.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_after_loop_stopped() {
        let (tx, rx) = channel();
        let wakeup = Arc::new(CountingWakeup::default());
        let handle = ShutdownHandle::new(tx, wakeup.clone());
        drop(rx);

        handle.request();
        assert_eq!(wakeup.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sigterm_requests_shutdown() {
        let (tx, rx) = channel();
        let wakeup = Arc::new(CountingWakeup::default());
        let listener = spawn_signal_listener(ShutdownHandle::new(tx, wakeup.clone())).unwrap();

        unsafe {
            libc::raise(libc::SIGTERM);
        }

        let control = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(control, Control::Shutdown);
        listener.join().unwrap();
        assert_eq!(wakeup.0.load(Ordering::SeqCst), 1);
    }
}
