//! Reactor-owned datagram sockets.
//!
//! A socket is jointly owned by the user handle and the reactor's active
//! set; `close()` is the only operation that severs that ownership. Event
//! handlers are appended to per-event lists and dispatched with a
//! snapshot-and-merge discipline: registrations made from inside a handler
//! apply to the next occurrence, never the current one.

use std::net::SocketAddr;
use std::os::unix::io::{AsFd, AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::reactor::WeakInner;
use crate::sys::Family;

/// Readable-subscription bit in the socket's I/O state.
const READ: u16 = 1 << 0;

/// Cap on datagrams handled per readable wake, so a busy socket cannot
/// starve the rest of the event loop.
pub const MAX_READS_PER_WAKE: usize = 7;

const RECV_BUFFER_SIZE: usize = 8192;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type DatagramFn = Box<dyn FnMut(&[u8], Option<&SocketAddr>) + Send>;
type ErrorFn = Box<dyn FnMut(&Error) + Send>;
type VoidFn = Box<dyn FnMut() + Send>;

struct SocketState {
    fd: Option<OwnedFd>,
    family: Family,
    /// Whether the fd was ever added to the OS poller.
    registered: bool,
    io_state: u16,
    timeout: Duration,
    /// Armed read-deadline timer, if any.
    timer: Option<u64>,
    buffer: Box<[u8]>,
    datagram_cbs: Vec<DatagramFn>,
    error_cbs: Vec<ErrorFn>,
    timeout_cbs: Vec<VoidFn>,
    close_cbs: Vec<VoidFn>,
}

pub(crate) struct SocketShared {
    reactor: WeakInner,
    key: usize,
    state: Mutex<SocketState>,
}

impl SocketShared {
    pub(crate) fn new(reactor: WeakInner, key: usize, fd: OwnedFd, family: Family) -> Self {
        SocketShared {
            reactor,
            key,
            state: Mutex::new(SocketState {
                fd: Some(fd),
                family,
                registered: false,
                io_state: 0,
                timeout: DEFAULT_TIMEOUT,
                timer: None,
                buffer: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
                datagram_cbs: Vec::new(),
                error_cbs: Vec::new(),
                timeout_cbs: Vec::new(),
                close_cbs: Vec::new(),
            }),
        }
    }

    pub(crate) fn key(&self) -> usize {
        self.key
    }

    fn reactor(&self) -> Result<Arc<crate::reactor::Inner>> {
        self.reactor.upgrade().ok_or(Error::SocketClosed)
    }

    /// Stop reading without touching handler lists. No-op when already
    /// paused or closed.
    fn pause_locked(&self, state: &mut SocketState) {
        if state.io_state & READ == 0 {
            return;
        }
        state.io_state &= !READ;
        if let Ok(inner) = self.reactor() {
            if let (Some(fd), true) = (state.fd.as_ref(), state.registered) {
                let _ = inner.socket_unsubscribe(self.key, fd.as_fd());
            }
            if let Some(id) = state.timer.take() {
                inner.cancel_timer(id);
            }
        }
    }

    /// Dispatch the timeout handler list. Runs on the reactor thread.
    pub(crate) fn handle_timeout(&self) {
        let mut cbs = {
            let mut state = self.state.lock().unwrap();
            if state.fd.is_none() {
                return;
            }
            state.timer = None;
            self.pause_locked(&mut state);
            std::mem::take(&mut state.timeout_cbs)
        };
        for cb in cbs.iter_mut() {
            cb();
        }
        let mut state = self.state.lock().unwrap();
        if state.fd.is_none() {
            return; // closed from inside a handler
        }
        // Handlers registered during dispatch go after the snapshot.
        let newly = std::mem::take(&mut state.timeout_cbs);
        cbs.extend(newly);
        state.timeout_cbs = cbs;
    }

    /// Drain up to [`MAX_READS_PER_WAKE`] datagrams. Runs on the reactor
    /// thread whenever the OS reports the socket readable.
    pub(crate) fn handle_readable(&self) {
        for _ in 0..MAX_READS_PER_WAKE {
            let received = {
                let mut state = self.state.lock().unwrap();
                if state.io_state & READ == 0 {
                    return; // paused (or closed) since the wake fired
                }
                let inner = match self.reactor() {
                    Ok(inner) => inner,
                    Err(_) => return,
                };
                let state = &mut *state;
                let fd = match state.fd.as_ref() {
                    Some(fd) => fd,
                    None => return,
                };
                match inner.sys.recvfrom(fd.as_fd(), &mut state.buffer) {
                    Ok((n, peer)) => {
                        inner.credit_down(n);
                        Ok((state.buffer[..n].to_vec(), peer))
                    }
                    Err(err) => Err(err),
                }
            };
            match received {
                Err(Error::WouldBlock) => break,
                Err(err) => {
                    {
                        let mut state = self.state.lock().unwrap();
                        self.pause_locked(&mut state);
                    }
                    self.dispatch_error(&err);
                    return;
                }
                Ok((data, peer)) => self.dispatch_datagram(&data, peer.as_ref()),
            }
        }
        self.rearm();
    }

    /// Re-subscribe readable interest and reset the inactivity deadline
    /// after a wake was handled. The OS-side interest is one-shot.
    fn rearm(&self) {
        let inner = match self.reactor() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        let mut state = self.state.lock().unwrap();
        if state.io_state & READ == 0 {
            return;
        }
        let state = &mut *state;
        let fd = match state.fd.as_ref() {
            Some(fd) => fd,
            None => return,
        };
        if inner
            .socket_subscribe(self.key, fd.as_fd(), &mut state.registered, false)
            .is_err()
        {
            return;
        }
        if let Some(id) = state.timer.take() {
            inner.cancel_timer(id);
        }
        state.timer = Some(inner.add_socket_deadline(self.key, state.timeout));
    }

    fn dispatch_datagram(&self, data: &[u8], peer: Option<&SocketAddr>) {
        let mut cbs = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.datagram_cbs)
        };
        for cb in cbs.iter_mut() {
            cb(data, peer);
        }
        let mut state = self.state.lock().unwrap();
        if state.fd.is_none() {
            return;
        }
        let newly = std::mem::take(&mut state.datagram_cbs);
        cbs.extend(newly);
        state.datagram_cbs = cbs;
    }

    fn dispatch_error(&self, err: &Error) {
        let mut cbs = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.error_cbs)
        };
        for cb in cbs.iter_mut() {
            cb(err);
        }
        let mut state = self.state.lock().unwrap();
        if state.fd.is_none() {
            return;
        }
        let newly = std::mem::take(&mut state.error_cbs);
        cbs.extend(newly);
        state.error_cbs = cbs;
    }
}

/// A connected-or-unconnected async UDP endpoint.
///
/// Created through [`Reactor::make_datagram_socket`]; starts paused. All
/// methods are thread-safe; handlers run on the reactor thread.
///
/// [`Reactor::make_datagram_socket`]: crate::Reactor::make_datagram_socket
#[derive(Clone)]
pub struct DatagramSocket {
    shared: Arc<SocketShared>,
}

impl DatagramSocket {
    pub(crate) fn new(shared: Arc<SocketShared>) -> Self {
        DatagramSocket { shared }
    }

    /// Bind to a local address. Binding is optional; an unbound socket
    /// gets an ephemeral port on its first send.
    pub fn bind(&self, addr: &SocketAddr) -> Result<()> {
        let inner = self.shared.reactor()?;
        let state = self.shared.state.lock().unwrap();
        let fd = state.fd.as_ref().ok_or(Error::SocketClosed)?;
        if Family::of(addr) != state.family {
            return Err(Error::Value);
        }
        inner.sys.bind(fd.as_fd(), addr)
    }

    /// Set or clear the connected peer. `None` dissolves the association.
    pub fn connect(&self, addr: Option<&SocketAddr>) -> Result<()> {
        let inner = self.shared.reactor()?;
        let state = self.shared.state.lock().unwrap();
        let fd = state.fd.as_ref().ok_or(Error::SocketClosed)?;
        if let Some(addr) = addr {
            if Family::of(addr) != state.family {
                return Err(Error::Value);
            }
        }
        inner.sys.connect(fd.as_fd(), addr)
    }

    /// The socket's local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let inner = self.shared.reactor()?;
        let state = self.shared.state.lock().unwrap();
        let fd = state.fd.as_ref().ok_or(Error::SocketClosed)?;
        inner.sys.local_addr(fd.as_fd())
    }

    /// The raw descriptor, for readiness polling. Fails after `close()`.
    pub fn raw_fd(&self) -> Result<RawFd> {
        let state = self.shared.state.lock().unwrap();
        state
            .fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or(Error::SocketClosed)
    }

    /// Attempt a single non-blocking send. `dest` is required unless the
    /// socket is connected. Fails with [`Error::MessageSize`] when the
    /// datagram was truncated and [`Error::Value`] on a family mismatch.
    pub fn try_sendto(&self, data: &[u8], dest: Option<&SocketAddr>) -> Result<()> {
        let inner = self.shared.reactor()?;
        let state = self.shared.state.lock().unwrap();
        let fd = state.fd.as_ref().ok_or(Error::SocketClosed)?;
        if let Some(dest) = dest {
            if Family::of(dest) != state.family {
                return Err(Error::Value);
            }
        }
        let count = inner.sys.sendto(fd.as_fd(), data, dest)?;
        inner.credit_up(count);
        if count != data.len() {
            return Err(Error::MessageSize);
        }
        Ok(())
    }

    /// Append a handler for incoming datagrams. The handler receives the
    /// payload and the remote endpoint, when the kernel reports one.
    pub fn on_datagram(&self, cb: impl FnMut(&[u8], Option<&SocketAddr>) + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        state.datagram_cbs.push(Box::new(cb));
    }

    /// Append a handler for asynchronous I/O errors. The socket pauses
    /// itself before dispatching; call `resume()` to keep reading.
    pub fn on_error(&self, cb: impl FnMut(&Error) + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        state.error_cbs.push(Box::new(cb));
    }

    /// Append a handler for read timeouts. The socket pauses itself
    /// before dispatching; call `resume()` to keep reading.
    pub fn on_timeout(&self, cb: impl FnMut() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        state.timeout_cbs.push(Box::new(cb));
    }

    /// Append a handler invoked once by `close()`.
    pub fn on_close(&self, cb: impl FnMut() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        state.close_cbs.push(Box::new(cb));
    }

    /// Stop reading. Idempotent: the readable subscription is only
    /// touched when the state actually changes.
    pub fn pause(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.fd.is_none() {
            return Err(Error::SocketClosed);
        }
        self.shared.pause_locked(&mut state);
        Ok(())
    }

    /// Start (or keep) reading; re-arms the read deadline. Idempotent.
    pub fn resume(&self) -> Result<()> {
        let inner = self.shared.reactor()?;
        let mut state = self.shared.state.lock().unwrap();
        let state = &mut *state;
        let fd = state.fd.as_ref().ok_or(Error::SocketClosed)?;
        if state.io_state & READ != 0 {
            return Ok(());
        }
        inner.socket_subscribe(self.key(), fd.as_fd(), &mut state.registered, true)?;
        state.io_state |= READ;
        if let Some(id) = state.timer.take() {
            inner.cancel_timer(id);
        }
        state.timer = Some(inner.add_socket_deadline(self.key(), state.timeout));
        Ok(())
    }

    /// Update the read deadline used by future subscriptions. Already
    /// armed I/O keeps its previous deadline.
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.fd.is_none() {
            return Err(Error::SocketClosed);
        }
        state.timeout = timeout;
        Ok(())
    }

    /// Close the socket: release the OS handle, drop the datagram, error
    /// and timeout handler lists, invoke each close handler once, and
    /// remove the socket from the reactor. Idempotent.
    pub fn close(&self) -> Result<()> {
        let inner = self.shared.reactor.upgrade();
        let (fd, mut close_cbs, timer, registered, had_read) = {
            let mut state = self.shared.state.lock().unwrap();
            let fd = match state.fd.take() {
                Some(fd) => fd,
                None => return Ok(()),
            };
            state.datagram_cbs.clear();
            state.error_cbs.clear();
            state.timeout_cbs.clear();
            let had_read = state.io_state & READ != 0;
            state.io_state = 0;
            (
                fd,
                std::mem::take(&mut state.close_cbs),
                state.timer.take(),
                std::mem::replace(&mut state.registered, false),
                had_read,
            )
        };
        if let Some(inner) = &inner {
            if let Some(id) = timer {
                inner.cancel_timer(id);
            }
            let detach_fd = registered.then(|| fd.as_fd());
            inner.socket_detach_poller(detach_fd, had_read);
        }
        let close_result = {
            let raw = fd.into_raw_fd();
            let rc = unsafe { libc::close(raw) };
            if rc != 0 {
                Err(Error::last_os())
            } else {
                Ok(())
            }
        };
        for cb in close_cbs.iter_mut() {
            cb();
        }
        if let Some(inner) = &inner {
            inner.forget_socket(self.key());
        }
        close_result
    }

    fn key(&self) -> usize {
        self.shared.key()
    }
}

impl std::fmt::Debug for DatagramSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("DatagramSocket")
            .field("key", &self.shared.key())
            .field("open", &state.fd.is_some())
            .field("reading", &(state.io_state & READ != 0))
            .finish()
    }
}
