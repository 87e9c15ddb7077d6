//! The native protocol server
//!
//! Claims a socket name under the runtime directory, guarded by an
//! exclusive lock on a sidecar file, and multiplexes all clients on the
//! single-threaded main loop.

use std::fmt;
use std::fs::File;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::socket::{
    accept4, bind, getsockname, getsockopt, listen, socket, sockopt, AddressFamily, Backlog,
    SockFlag, SockType, UnixAddr,
};
use polling::{Event, Events, Poller};
use wavepipe_core::connection::Flush;
use wavepipe_core::error::{DaemonResult, Fault, ResultExt};

use crate::config::Config;

pub mod client;
pub mod context;
pub mod dispatch;

pub use context::Context;

use dispatch::process_messages;

/// Index into the context's client table
pub type ClientId = usize;

/// sun_path capacity including the terminating nul
const UNIX_PATH_MAX: usize = 108;
const LOCK_SUFFIX: &str = ".lock";
const LISTEN_BACKLOG: i32 = 128;
/// First fd handed over by the fd-passing activation protocol
const LISTEN_FDS_START: RawFd = 3;

const KEY_LISTENER: usize = usize::MAX - 1;

pub struct Server {
    pub ctx: Context,
    poller: Poller,
    listener: OwnedFd,
    sock_path: PathBuf,
    lock_path: PathBuf,
    /// Held for as long as we own the socket name
    _lock: Flock<File>,
    /// Socket was adopted from the activation environment; never unlink it
    activated: bool,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("sock_path", &self.sock_path)
            .field("lock_path", &self.lock_path)
            .field("activated", &self.activated)
            .finish()
    }
}

impl Server {
    /// Claims the configured socket name below `runtime_dir` and starts
    /// listening. Refuses to start when the name is too long, the lock is
    /// held elsewhere, or bind/listen fail.
    pub fn new(config: Config, runtime_dir: &Path) -> DaemonResult<Server> {
        let name = config.effective_core_name();
        let sock_path = runtime_dir.join(&name);
        if sock_path.as_os_str().len() >= UNIX_PATH_MAX {
            return Err(anyhow!(
                "socket path {sock_path:?} plus nul exceeds {UNIX_PATH_MAX} bytes"
            ))
            .fault(Fault::SocketSetup);
        }

        let lock_path = PathBuf::from(format!("{}{}", sock_path.display(), LOCK_SUFFIX));
        let lock = lock_socket(&lock_path)?;

        let (listener, activated) = match activation_fd(&sock_path) {
            Some(fd) => {
                info!("adopted activation socket for {sock_path:?}");
                (fd, true)
            }
            None => (add_socket(&sock_path)?, false),
        };

        let poller = Poller::new().fault(Fault::SocketSetup)?;
        unsafe {
            poller
                .add(listener.as_raw_fd(), Event::readable(KEY_LISTENER))
                .fault(Fault::SocketSetup)?;
        }

        info!("listening on {sock_path:?}");

        Ok(Server {
            ctx: Context::new(config),
            poller,
            listener,
            sock_path,
            lock_path,
            _lock: lock,
            activated,
        })
    }

    /// Runs the main loop forever
    pub fn run(&mut self) -> DaemonResult<()> {
        loop {
            self.handle_events(None)?;
        }
    }

    /// One main-loop iteration: deferred work, queued-frame drains, the
    /// before-poll flush hook, then poll and dispatch
    pub fn handle_events(&mut self, timeout: Option<Duration>) -> DaemonResult<()> {
        // actions queued by handlers, e.g. factory completions
        while let Some(action) = self.ctx.deferred.pop_front() {
            action(&mut self.ctx);
        }

        // drain frames that queued while a client was busy
        for id in self.ctx.live_clients() {
            let pending = self
                .ctx
                .client(id)
                .map(|c| !c.busy && c.conn.has_buffered())
                .unwrap_or(false);
            if pending {
                process_messages(&mut self.ctx, id);
            }
        }

        // before the loop blocks, try to drain every connection
        for id in self.ctx.live_clients() {
            if let Some(c) = self.ctx.client_mut(id) {
                match c.conn.flush() {
                    Ok(Flush::Drained) | Ok(Flush::Again) => {}
                    Err(e) => {
                        warn!("client {id}: could not flush: {e}");
                        self.ctx.mark_dead(id);
                    }
                }
            }
        }

        self.reap_dead();
        self.rearm()?;

        let mut events = Events::new();
        match self.poller.wait(&mut events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e).fault(Fault::SocketSetup),
        }

        for event in events.iter() {
            if event.key == KEY_LISTENER {
                self.accept_pending();
                continue;
            }
            let id = event.key;
            if event.writable {
                if let Some(c) = self.ctx.client_mut(id) {
                    match c.conn.flush() {
                        Ok(_) => {}
                        Err(e) => {
                            warn!("client {id}: could not flush: {e}");
                            self.ctx.mark_dead(id);
                        }
                    }
                }
            }
            if event.readable {
                process_messages(&mut self.ctx, id);
            }
        }

        self.reap_dead();
        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            match accept4(self.listener.as_raw_fd(), SockFlag::SOCK_CLOEXEC) {
                Ok(fd) => {
                    let stream = unsafe { UnixStream::from_raw_fd(fd) };
                    match self.ctx.add_client(stream) {
                        Ok(id) => {
                            let raw = self.ctx.client(id).unwrap().conn.as_raw_fd();
                            // interest is set per-iteration in rearm
                            if let Err(e) =
                                unsafe { self.poller.add(raw, Event::none(id)) }
                            {
                                error!("client {id}: cannot watch socket: {e}");
                                self.ctx.mark_dead(id);
                            }
                        }
                        Err(e) => error!("failed to create client: {e}"),
                    }
                }
                Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("failed to accept: {e}");
                    return;
                }
            }
        }
    }

    /// Re-arms every fd's interest; the poller is oneshot so this runs
    /// before each wait. A busy client gets no read interest, a connection
    /// with pending bytes gets write interest.
    fn rearm(&mut self) -> DaemonResult<()> {
        self.poller
            .modify(
                unsafe { BorrowedFd::borrow_raw(self.listener.as_raw_fd()) },
                Event::readable(KEY_LISTENER),
            )
            .fault(Fault::SocketSetup)?;

        for id in self.ctx.live_clients() {
            let c = self.ctx.client(id).unwrap();
            let fd = c.conn.as_raw_fd();
            let event = match (!c.busy, c.conn.need_flush()) {
                (true, true) => Event::all(id),
                (true, false) => Event::readable(id),
                (false, true) => Event::writable(id),
                (false, false) => Event::none(id),
            };
            self.poller
                .modify(unsafe { BorrowedFd::borrow_raw(fd) }, event)
                .fault(Fault::SocketSetup)?;
        }
        Ok(())
    }

    fn reap_dead(&mut self) {
        let dead = std::mem::take(&mut self.ctx.dead);
        for id in dead {
            if let Some(c) = self.ctx.client(id) {
                let fd = c.conn.as_raw_fd();
                let _ = self
                    .poller
                    .delete(unsafe { BorrowedFd::borrow_raw(fd) });
            }
            self.ctx.teardown_client(id);
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.sock_path
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // the lock file always goes; the socket only if we created it
        if !self.activated {
            if let Err(e) = std::fs::remove_file(&self.sock_path) {
                debug!("unlink {:?}: {e}", self.sock_path);
            }
        }
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            debug!("unlink {:?}: {e}", self.lock_path);
        }
    }
}

/// Asserts sole ownership of the socket name via an exclusive non-blocking
/// flock on the sidecar lock file
fn lock_socket(lock_path: &Path) -> DaemonResult<Flock<File>> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o660)
        .custom_flags(libc::O_CLOEXEC)
        .open(lock_path)
        .map_err(|e| anyhow!("unable to open lockfile {lock_path:?}: {e}"))
        .fault(Fault::SocketSetup)?;

    Flock::lock(file, FlockArg::LockExclusiveNonblock)
        .map_err(|(_, errno)| {
            anyhow!("unable to lock {lock_path:?}, maybe another daemon is running: {errno}")
        })
        .fault(Fault::SocketSetup)
}

/// Looks for an already-bound listening socket handed over through the
/// standard fd-passing activation environment
fn activation_fd(path: &Path) -> Option<OwnedFd> {
    let pid: u32 = std::env::var("LISTEN_PID").ok()?.parse().ok()?;
    if pid != std::process::id() {
        return None;
    }
    let n: RawFd = std::env::var("LISTEN_FDS").ok()?.parse().ok()?;

    for fd in LISTEN_FDS_START..LISTEN_FDS_START + n {
        let Ok(addr) = getsockname::<UnixAddr>(fd) else {
            continue;
        };
        if addr.path() != Some(path) {
            continue;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if !getsockopt(&borrowed, sockopt::AcceptConn).unwrap_or(false) {
            continue;
        }
        return Some(unsafe { OwnedFd::from_raw_fd(fd) });
    }
    None
}

/// Creates, binds and listens on the socket path
fn add_socket(path: &Path) -> DaemonResult<OwnedFd> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )
    .fault(Fault::SocketSetup)?;

    let addr = UnixAddr::new(path).fault(Fault::SocketSetup)?;
    bind(fd.as_raw_fd(), &addr)
        .map_err(|e| anyhow!("bind() to {path:?} failed: {e}"))
        .fault(Fault::SocketSetup)?;
    listen(&fd, Backlog::new(LISTEN_BACKLOG).unwrap())
        .map_err(|e| anyhow!("listen() on {path:?} failed: {e}"))
        .fault(Fault::SocketSetup)?;

    Ok(fd)
}
