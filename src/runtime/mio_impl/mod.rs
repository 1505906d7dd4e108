//! mio-backed multiplexer.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).

mod poller;

pub use poller::MioMultiplexer;
