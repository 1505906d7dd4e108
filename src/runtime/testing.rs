//! Test doubles for driving the event loop without a kernel facility.

use crate::config::Config;
use crate::runtime::multiplexer::{MuxError, Multiplexer, ReadinessEvent, WatchInterest, Wakeup};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Loopback config on an ephemeral port.
pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        backlog: 128,
        reuse_address: true,
        max_connections: 0,
        max_events: 64,
        wait_timeout: Some(Duration::from_millis(5)),
        log_level: "debug".to_string(),
    }
}

#[derive(Default)]
struct FakeState {
    watched: BTreeMap<RawFd, WatchInterest>,
    unwatches: Vec<RawFd>,
    interrupts: usize,
    fail_wait: bool,
    reject_watches: usize,
    rejected: usize,
    fail_unwatch: bool,
    duplicate: bool,
    quiet: bool,
    last_timeout: Option<Option<Duration>>,
    wakes: usize,
    drops: usize,
}

/// Multiplexer that reports every watched descriptor readable on each wait.
///
/// Real sockets answer "would block" when nothing is pending, so this acts
/// like a level-triggered facility that never sleeps. Clones share state,
/// letting a test inspect the instance owned by the server.
#[derive(Clone, Default)]
pub struct FakeMultiplexer {
    state: Arc<Mutex<FakeState>>,
}

struct FakeWakeup(Arc<Mutex<FakeState>>);

impl Wakeup for FakeWakeup {
    fn wake(&self) -> io::Result<()> {
        lock(&self.0).wakes += 1;
        Ok(())
    }
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FakeMultiplexer {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        lock(&self.state)
    }

    /// Watched descriptors in ascending order.
    pub fn watched(&self) -> Vec<RawFd> {
        self.state().watched.keys().copied().collect()
    }

    pub fn interest(&self, fd: RawFd) -> Option<WatchInterest> {
        self.state().watched.get(&fd).copied()
    }

    /// How many times `fd` was unwatched while watched.
    pub fn unwatch_calls(&self, fd: RawFd) -> usize {
        self.state().unwatches.iter().filter(|&&f| f == fd).count()
    }

    /// Make the next `n` waits fail as interrupted.
    pub fn interrupt_next(&self, n: usize) {
        self.state().interrupts = n;
    }

    pub fn fail_next_wait(&self) {
        self.state().fail_wait = true;
    }

    /// Make the next `n` watches fail as invalid descriptors.
    pub fn reject_next_watch(&self, n: usize) {
        self.state().reject_watches = n;
    }

    pub fn rejected_watches(&self) -> usize {
        self.state().rejected
    }

    pub fn fail_unwatch(&self, fail: bool) {
        self.state().fail_unwatch = fail;
    }

    /// Report every descriptor twice per wait.
    pub fn duplicate_events(&self, duplicate: bool) {
        self.state().duplicate = duplicate;
    }

    /// Report no events, as an edge-triggered facility does once every
    /// edge has been delivered.
    pub fn quiet(&self, quiet: bool) {
        self.state().quiet = quiet;
    }

    /// Timeout passed to the most recent wait.
    pub fn last_timeout(&self) -> Option<Option<Duration>> {
        self.state().last_timeout
    }

    pub fn wakes(&self) -> usize {
        self.state().wakes
    }

    /// Whether any instance sharing this state has been dropped.
    pub fn is_dropped(&self) -> bool {
        self.state().drops > 0
    }
}

impl Drop for FakeMultiplexer {
    fn drop(&mut self) {
        self.state().drops += 1;
    }
}

fn invalid(fd: RawFd, errno: i32) -> MuxError {
    MuxError::from_control(fd, io::Error::from_raw_os_error(errno))
}

impl Multiplexer for FakeMultiplexer {
    fn create(_max_events: usize) -> Result<Self, MuxError> {
        Ok(Self::default())
    }

    fn watch(&mut self, fd: RawFd, interest: WatchInterest) -> Result<(), MuxError> {
        let mut state = self.state();
        if state.reject_watches > 0 {
            state.reject_watches -= 1;
            state.rejected += 1;
            return Err(invalid(fd, libc::EBADF));
        }
        if state.watched.contains_key(&fd) {
            return Err(invalid(fd, libc::EEXIST));
        }
        state.watched.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: WatchInterest) -> Result<(), MuxError> {
        match self.state().watched.get_mut(&fd) {
            Some(current) => {
                *current = interest;
                Ok(())
            }
            None => Err(invalid(fd, libc::ENOENT)),
        }
    }

    fn unwatch(&mut self, fd: RawFd) -> Result<(), MuxError> {
        let mut state = self.state();
        let was_watched = state.watched.remove(&fd).is_some();
        if was_watched {
            state.unwatches.push(fd);
        }
        if state.fail_unwatch {
            return Err(invalid(fd, libc::EBADF));
        }
        Ok(())
    }

    fn wait(
        &mut self,
        events: &mut Vec<ReadinessEvent>,
        timeout: Option<Duration>,
    ) -> Result<usize, MuxError> {
        events.clear();
        let mut state = self.state();
        state.last_timeout = Some(timeout);
        if state.interrupts > 0 {
            state.interrupts -= 1;
            return Err(MuxError::Interrupted);
        }
        if state.fail_wait {
            state.fail_wait = false;
            return Err(MuxError::Io(io::Error::from_raw_os_error(libc::EINVAL)));
        }

        if state.quiet {
            return Ok(0);
        }

        let copies = if state.duplicate { 2 } else { 1 };
        for &fd in state.watched.keys() {
            for _ in 0..copies {
                events.push(ReadinessEvent::readable(fd));
            }
        }
        Ok(events.len())
    }

    fn wakeup(&self) -> Arc<dyn Wakeup> {
        Arc::new(FakeWakeup(Arc::clone(&self.state)))
    }
}

/// Client that writes as fast as the server reads and discards the echo.
pub struct Flooder {
    stop: Arc<AtomicBool>,
    writer: thread::JoinHandle<()>,
    reader: thread::JoinHandle<()>,
}

impl Flooder {
    /// Connect to `addr` without sending anything yet.
    pub fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_write_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        stream
    }

    pub fn start(stream: TcpStream) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let mut tx = stream.try_clone().unwrap();
        let mut rx = stream;

        let writer_stop = Arc::clone(&stop);
        let writer = thread::spawn(move || {
            let chunk = [0x5au8; 16 * 1024];
            while !writer_stop.load(Ordering::Relaxed) {
                match tx.write(&chunk) {
                    Ok(_) => {}
                    Err(ref e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) => {}
                    Err(_) => break,
                }
            }
        });

        let reader_stop = Arc::clone(&stop);
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 16 * 1024];
            while !reader_stop.load(Ordering::Relaxed) {
                match rx.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(ref e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) => {}
                    Err(_) => break,
                }
            }
        });

        Self {
            stop,
            writer,
            reader,
        }
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.writer.join().unwrap();
        self.reader.join().unwrap();
    }
}
