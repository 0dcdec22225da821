//! Poll-driven event multiplexer.
//!
//! [`StreamMonitor`] owns a set of registered descriptors and dispatches
//! readiness, hangup, and error conditions to per-descriptor callbacks. It has
//! no domain knowledge: callbacks receive a caller-supplied context `C` plus
//! the [`Registry`], so they may register or forget descriptors (including
//! their own) while the loop is running.
//!
//! The loop terminates once no descriptors remain registered.

mod copy;

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info};

// ---------------------------------------------------------------------------
// EventSource
// ---------------------------------------------------------------------------

/// Anything with a pollable descriptor.
///
/// The monitor never closes a source; it only stops watching it.
pub trait EventSource {
    fn descriptor(&self) -> RawFd;
}

impl<T: AsRawFd> EventSource for T {
    fn descriptor(&self) -> RawFd {
        self.as_raw_fd()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("duplicate descriptor fd {0}")]
    DuplicateDescriptor(RawFd),

    #[error("missing descriptor fd {0}")]
    UnknownDescriptor(RawFd),

    #[error("invalid descriptor fd {0} (POLLNVAL)")]
    InvalidDescriptor(RawFd),

    #[error("unknown event type {events:#x} on fd {fd}")]
    UnknownEvent { fd: RawFd, events: i16 },

    #[error("failed to make fd {fd} non-blocking: {source}")]
    NonBlocking {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
}

// ---------------------------------------------------------------------------
// Callback types
// ---------------------------------------------------------------------------

/// Data or hangup callback for a registered descriptor.
pub type Callback<C> = Box<dyn FnMut(&mut C, &mut Registry<C>) -> anyhow::Result<()>>;

/// Receives any error raised by a descriptor's callbacks.
pub type ErrorHandler<C> = Box<dyn FnMut(&mut C, anyhow::Error)>;

/// Idle handler or per-iteration loop hook.
pub type Hook<C> = Box<dyn FnMut(&mut C, &mut Registry<C>) -> anyhow::Result<()>>;

struct Entry<C> {
    generation: u64,
    on_data: Option<Callback<C>>,
    on_hangup: Option<Callback<C>>,
    on_error: Option<ErrorHandler<C>>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The set of watched descriptors and their callbacks.
pub struct Registry<C> {
    entries: BTreeMap<RawFd, Entry<C>>,
    next_generation: u64,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_generation: 0,
        }
    }
}

impl<C> Registry<C> {
    /// Start watching `source`.
    ///
    /// With no data callback the source runs in drain-only mode: each
    /// readiness notification reads and discards one chunk.
    pub fn monitor<S: EventSource + ?Sized>(
        &mut self,
        source: &S,
        callback: Option<Callback<C>>,
        hangup: Option<Callback<C>>,
        on_error: Option<ErrorHandler<C>>,
    ) -> Result<RawFd, MonitorError> {
        self.monitor_fd(source.descriptor(), callback, hangup, on_error)
    }

    /// Start watching `source`, copying every chunk it yields into `sink`.
    ///
    /// The source is switched to non-blocking mode. Both ends are owned by
    /// the registration and dropped when it is forgotten.
    pub fn copy_to<R, W>(
        &mut self,
        source: R,
        sink: W,
        hangup: Option<Callback<C>>,
        on_error: Option<ErrorHandler<C>>,
    ) -> Result<RawFd, MonitorError>
    where
        R: Read + AsRawFd + 'static,
        W: Write + 'static,
    {
        let fd = source.as_raw_fd();
        if self.entries.contains_key(&fd) {
            return Err(MonitorError::DuplicateDescriptor(fd));
        }
        copy::make_nonblock(fd)?;
        let mut source = source;
        let mut sink = sink;
        let callback: Callback<C> = Box::new(move |_, _| {
            copy::copy_data(fd, &mut source, &mut sink)?;
            Ok(())
        });
        self.monitor_fd(fd, Some(callback), hangup, on_error)
    }

    fn monitor_fd(
        &mut self,
        fd: RawFd,
        callback: Option<Callback<C>>,
        hangup: Option<Callback<C>>,
        on_error: Option<ErrorHandler<C>>,
    ) -> Result<RawFd, MonitorError> {
        if self.entries.contains_key(&fd) {
            return Err(MonitorError::DuplicateDescriptor(fd));
        }
        debug!(fd, "start monitoring");
        self.next_generation += 1;
        self.entries.insert(
            fd,
            Entry {
                generation: self.next_generation,
                on_data: callback,
                on_hangup: hangup,
                on_error,
            },
        );
        self.log_monitors();
        Ok(fd)
    }

    /// Stop watching `source`.
    pub fn forget<S: EventSource + ?Sized>(&mut self, source: &S) -> Result<(), MonitorError> {
        self.forget_fd(source.descriptor())
    }

    pub fn forget_fd(&mut self, fd: RawFd) -> Result<(), MonitorError> {
        if self.entries.remove(&fd).is_none() {
            return Err(MonitorError::UnknownDescriptor(fd));
        }
        debug!(fd, "stop monitoring");
        self.log_monitors();
        Ok(())
    }

    pub fn is_monitored(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Log the watched descriptors at debug level and return how many there are.
    pub fn log_monitors(&self) -> usize {
        let fds: Vec<RawFd> = self.entries.keys().copied().collect();
        debug!(?fds, "monitoring");
        fds.len()
    }

    fn generation(&self, fd: RawFd) -> Option<u64> {
        self.entries.get(&fd).map(|e| e.generation)
    }
}

// ---------------------------------------------------------------------------
// StreamMonitor
// ---------------------------------------------------------------------------

/// Readiness event reported by one poll pass.
struct Ready {
    fd: RawFd,
    revents: i16,
    generation: u64,
}

/// Poll loop over a [`Registry`] with optional idle and per-iteration hooks.
pub struct StreamMonitor<C> {
    registry: Registry<C>,
    timeout: Option<Duration>,
    idle_handler: Option<Hook<C>>,
    loop_hook: Option<Hook<C>>,
}

impl<C> StreamMonitor<C> {
    /// Create a monitor whose blocking poll waits at most `timeout`
    /// (`None` waits indefinitely).
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            registry: Registry::default(),
            timeout,
            idle_handler: None,
            loop_hook: None,
        }
    }

    /// Run `handler` whenever a non-blocking poll finds nothing ready.
    pub fn with_idle_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut C, &mut Registry<C>) -> anyhow::Result<()> + 'static,
    {
        self.idle_handler = Some(Box::new(handler));
        self
    }

    /// Run `hook` once per loop pass, after the idle check and before blocking.
    pub fn with_loop_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut C, &mut Registry<C>) -> anyhow::Result<()> + 'static,
    {
        self.loop_hook = Some(Box::new(hook));
        self
    }

    pub fn registry(&mut self) -> &mut Registry<C> {
        &mut self.registry
    }

    /// Run the loop until every source is forgotten (`Ok(false)`) or a
    /// blocking poll times out with nothing ready (`Ok(true)`).
    ///
    /// Callback and hook errors are contained; only multiplexer misuse
    /// (an invalid descriptor, an unknown event) escapes as `Err`.
    pub fn event_loop(&mut self, ctx: &mut C) -> Result<bool, MonitorError> {
        while !self.registry.is_empty() {
            let pending = self.poll(Some(Duration::ZERO))?;
            if pending.is_empty() {
                if let Some(idle) = self.idle_handler.as_mut() {
                    if let Err(e) = idle(ctx, &mut self.registry) {
                        error!(error = %e, "exception in idle handler");
                    }
                    // The idle handler may have forgotten everything.
                    if self.registry.is_empty() {
                        return Ok(false);
                    }
                }
            }
            if let Some(hook) = self.loop_hook.as_mut() {
                if let Err(e) = hook(ctx, &mut self.registry) {
                    error!(error = %e, "exception in loop hook");
                }
            }

            self.registry.log_monitors();
            let ready = self.poll(self.timeout)?;
            if ready.is_empty() {
                return Ok(true);
            }
            for event in ready {
                self.dispatch(ctx, event)?;
            }
        }
        Ok(false)
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<Vec<Ready>, MonitorError> {
        let mut fds: Vec<libc::pollfd> = self
            .registry
            .entries
            .keys()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN | libc::POLLHUP,
                revents: 0,
            })
            .collect();
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };

        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if rc >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(MonitorError::Poll(err));
            }
        }

        Ok(fds
            .iter()
            .filter(|p| p.revents != 0)
            .filter_map(|p| {
                self.registry.generation(p.fd).map(|generation| Ready {
                    fd: p.fd,
                    revents: p.revents,
                    generation,
                })
            })
            .collect())
    }

    fn dispatch(&mut self, ctx: &mut C, event: Ready) -> Result<(), MonitorError> {
        // An earlier callback in this batch may have forgotten or replaced
        // this registration; the event belongs to the old one.
        if self.registry.generation(event.fd) != Some(event.generation) {
            debug!(fd = event.fd, "skipping stale readiness event");
            return Ok(());
        }
        let revents = event.revents;
        if revents & libc::POLLNVAL != 0 {
            Err(MonitorError::InvalidDescriptor(event.fd))
        } else if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
            self.trigger_hangup(ctx, event.fd, revents);
            Ok(())
        } else if revents & libc::POLLIN != 0 {
            self.trigger_callback(ctx, event.fd, event.generation);
            Ok(())
        } else {
            Err(MonitorError::UnknownEvent {
                fd: event.fd,
                events: revents,
            })
        }
    }

    fn trigger_hangup(&mut self, ctx: &mut C, fd: RawFd, revents: i16) {
        // Forget before invoking so the callback may re-register the fd.
        let Some(entry) = self.registry.entries.remove(&fd) else {
            return;
        };
        self.registry.log_monitors();
        debug!(fd, revents, "hangup callback");
        if let Some(mut hangup) = entry.on_hangup {
            if let Err(e) = hangup(ctx, &mut self.registry) {
                Self::error_handler(ctx, fd, e, entry.on_error);
            }
        }
    }

    fn trigger_callback(&mut self, ctx: &mut C, fd: RawFd, generation: u64) {
        let Some(entry) = self.registry.entries.get_mut(&fd) else {
            return;
        };
        let callback = entry.on_data.take();
        let on_error = entry.on_error.take();

        let (result, callback) = match callback {
            Some(mut cb) => (cb(ctx, &mut self.registry), Some(cb)),
            None => (copy::drain(fd).map(|_| ()).map_err(anyhow::Error::from), None),
        };

        let still_ours = self.registry.generation(fd) == Some(generation);
        match result {
            Ok(()) => {
                if still_ours {
                    if let Some(entry) = self.registry.entries.get_mut(&fd) {
                        entry.on_data = callback;
                        entry.on_error = on_error;
                    }
                }
            }
            Err(e) => {
                if still_ours {
                    self.registry.entries.remove(&fd);
                    self.registry.log_monitors();
                }
                Self::error_handler(ctx, fd, e, on_error);
            }
        }
    }

    fn error_handler(ctx: &mut C, fd: RawFd, e: anyhow::Error, handler: Option<ErrorHandler<C>>) {
        error!(fd, error = %e, has_handler = handler.is_some(), "error handling fd");
        if let Some(mut handler) = handler {
            handler(ctx, e);
        }
    }

    /// Log the watched descriptors at info level and return how many there are.
    pub fn report(&self) -> usize {
        let count = self.registry.len();
        info!(count, "active monitors");
        count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
