//! Client-side access to a wavepipe daemon
//!
//! A [Remote] owns the connection and a small event queue. Methods go out
//! through typed helpers; events come back as raw `(id, opcode, value)`
//! triples with per-interface parsers in [events].

#[macro_use]
extern crate log;

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use polling::{Event as PollEvent, Events, Poller};
use wavepipe_core::connection::{Connection, Flush};
use wavepipe_core::error::{DaemonResult, Fault, ResultExt};
use wavepipe_core::pod::Value;
use wavepipe_core::protocol::{ev, me, InterfaceType, CORE_NAME_ENV, DEFAULT_CORE_NAME};

/// The core resource every connection starts out with
pub const CORE_ID: u32 = 0;

/// One received event frame
#[derive(Debug)]
pub struct RemoteEvent {
    pub id: u32,
    pub opcode: u32,
    pub seq: u32,
    pub value: Value,
}

/// A connection to the daemon, from the client's side
pub struct Remote {
    conn: Connection,
    queued: VecDeque<RemoteEvent>,
    next_sync: i32,
}

impl Remote {
    /// Resolves the daemon's socket the same way the server claims it
    pub fn socket_path() -> DaemonResult<PathBuf> {
        let runtime = std::env::var("XDG_RUNTIME_DIR")
            .map_err(|_| anyhow!("XDG_RUNTIME_DIR not set in the environment"))
            .fault(Fault::SocketSetup)?;
        let name =
            std::env::var(CORE_NAME_ENV).unwrap_or_else(|_| DEFAULT_CORE_NAME.to_string());
        Ok(PathBuf::from(runtime).join(name))
    }

    pub fn connect() -> DaemonResult<Remote> {
        Self::connect_path(Self::socket_path()?)
    }

    /// Connects to an explicit socket path and performs the hello exchange
    pub fn connect_path(path: impl AsRef<Path>) -> DaemonResult<Remote> {
        let conn = Connection::connect(path.as_ref())?;
        debug!("connected to {:?}", path.as_ref());
        let mut remote = Remote {
            conn,
            queued: VecDeque::new(),
            next_sync: 1,
        };
        remote.call(
            CORE_ID,
            me::core::HELLO,
            &Value::Struct(vec![Value::Int(1)]),
        )?;
        Ok(remote)
    }

    /// Sends one method frame and flushes it out, returning the assigned
    /// sequence number
    pub fn call(&mut self, id: u32, opcode: u32, value: &Value) -> DaemonResult<u32> {
        let seq = self.conn.begin(id, opcode).value(value).end();
        self.flush_blocking()?;
        Ok(seq)
    }

    fn flush_blocking(&mut self) -> DaemonResult<()> {
        loop {
            match self.conn.flush()? {
                Flush::Drained => return Ok(()),
                Flush::Again => self.wait_io(false, Some(Duration::from_secs(5)))?,
            }
        }
    }

    /// Waits for readability (or writability) of the connection
    fn wait_io(&self, readable: bool, timeout: Option<Duration>) -> DaemonResult<()> {
        let poller = Poller::new().fault(Fault::SocketSetup)?;
        let event = if readable {
            PollEvent::readable(0)
        } else {
            PollEvent::writable(0)
        };
        unsafe {
            poller
                .add(self.conn.as_raw_fd(), event)
                .fault(Fault::SocketSetup)?;
        }
        let mut events = Events::new();
        poller.wait(&mut events, timeout).fault(Fault::SocketSetup)?;
        Ok(())
    }

    /// The next event, waiting up to `timeout`. `Ok(None)` on timeout.
    pub fn next_event(&mut self, timeout: Duration) -> DaemonResult<Option<RemoteEvent>> {
        if let Some(event) = self.queued.pop_front() {
            return Ok(Some(event));
        }
        self.read_event(timeout)
    }

    /// Reads a fresh event off the socket, bypassing the queue
    fn read_event(&mut self, timeout: Duration) -> DaemonResult<Option<RemoteEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.conn.get_next()? {
                return Ok(Some(RemoteEvent {
                    id: msg.id,
                    opcode: msg.opcode,
                    seq: msg.seq,
                    value: msg.value()?,
                }));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.wait_io(true, Some(remaining))?;
        }
    }

    /// Waits for an event on a specific resource and opcode; other events
    /// queue up for later consumption
    pub fn wait_event(
        &mut self,
        id: u32,
        opcode: u32,
        timeout: Duration,
    ) -> DaemonResult<RemoteEvent> {
        if let Some(pos) = self
            .queued
            .iter()
            .position(|e| e.id == id && e.opcode == opcode)
        {
            return Ok(self.queued.remove(pos).unwrap());
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(anyhow!("timed out waiting for event {opcode} on {id}"))
                    .fault(Fault::Protocol);
            }
            match self.read_event(remaining)? {
                Some(event) if event.id == id && event.opcode == opcode => return Ok(event),
                Some(event) => self.queued.push_back(event),
                None => {}
            }
        }
    }

    /// Round-trips through the server: everything sent before this call
    /// has been processed once it returns
    pub fn sync(&mut self, timeout: Duration) -> DaemonResult<()> {
        let marker = self.next_sync;
        self.next_sync += 1;
        self.call(
            CORE_ID,
            me::core::SYNC,
            &Value::Struct(vec![Value::Int(marker)]),
        )?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = self.wait_event(CORE_ID, ev::core::DONE, remaining)?;
            if events::parse_done(&event.value) == Some(marker) {
                return Ok(());
            }
        }
    }

    pub fn get_registry(&mut self, new_id: u32) -> DaemonResult<()> {
        self.call(
            CORE_ID,
            me::core::GET_REGISTRY,
            &Value::Struct(vec![Value::Int(1), Value::Int(new_id as i32)]),
        )?;
        Ok(())
    }

    pub fn bind(
        &mut self,
        registry_id: u32,
        global: u32,
        ty: InterfaceType,
        version: u32,
        new_id: u32,
    ) -> DaemonResult<()> {
        self.call(
            registry_id,
            me::registry::BIND,
            &Value::Struct(vec![
                Value::Id(global),
                Value::Id(ty as u32),
                Value::Int(version as i32),
                Value::Int(new_id as i32),
            ]),
        )?;
        Ok(())
    }

    pub fn create_object(
        &mut self,
        factory_name: &str,
        ty: InterfaceType,
        version: u32,
        new_id: u32,
    ) -> DaemonResult<()> {
        self.call(
            CORE_ID,
            me::core::CREATE_OBJECT,
            &Value::Struct(vec![
                Value::String(factory_name.to_string()),
                Value::Id(ty as u32),
                Value::Int(version as i32),
                Value::Int(new_id as i32),
            ]),
        )?;
        Ok(())
    }

    /// Claims a received fd by its payload index
    pub fn take_fd(&mut self, index: u32) -> Option<OwnedFd> {
        self.conn.take_fd(index)
    }

    /// Hands the connection's fd to the caller and disconnects. The fd is
    /// a fresh duplicate; the caller queries its flags itself.
    pub fn steal_fd(self) -> DaemonResult<OwnedFd> {
        let fd = self.conn.dup_fd()?;
        drop(self.conn);
        Ok(fd)
    }
}

/// Parsers for the payloads of well-known events
pub mod events {
    use wavepipe_core::pod::Value;
    use wavepipe_core::protocol::{InterfaceType, Permissions};

    /// Core error event: which resource failed, the request it answers,
    /// the negated errno and a message
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ErrorEvent {
        pub id: u32,
        pub seq: i32,
        pub res: i32,
        pub message: String,
    }

    pub fn parse_error(value: &Value) -> Option<ErrorEvent> {
        match value.as_struct()? {
            [Value::Id(id), Value::Int(seq), Value::Int(res), Value::String(message)] => {
                Some(ErrorEvent {
                    id: *id,
                    seq: *seq,
                    res: *res,
                    message: message.clone(),
                })
            }
            _ => None,
        }
    }

    pub fn parse_done(value: &Value) -> Option<i32> {
        match value.as_struct()? {
            [Value::Int(seq)] => Some(*seq),
            _ => None,
        }
    }

    /// Registry global announcement
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct GlobalEvent {
        pub id: u32,
        pub permissions: Permissions,
        pub interface: InterfaceType,
        pub version: u32,
    }

    pub fn parse_global(value: &Value) -> Option<GlobalEvent> {
        match value.as_struct()? {
            [Value::Id(id), Value::Int(permissions), Value::Id(interface), Value::Int(version)] => {
                Some(GlobalEvent {
                    id: *id,
                    permissions: Permissions::from_bits_truncate(*permissions as u32),
                    interface: InterfaceType::from_raw(*interface)?,
                    version: *version as u32,
                })
            }
            _ => None,
        }
    }

    pub fn parse_global_remove(value: &Value) -> Option<u32> {
        match value.as_struct()? {
            [Value::Id(id)] => Some(*id),
            _ => None,
        }
    }

    /// Param notification from enum_params or a subscription
    #[derive(Debug, Clone, PartialEq)]
    pub struct ParamEvent {
        pub seq: i32,
        pub id: u32,
        pub index: u32,
        pub next: u32,
        pub param: Value,
    }

    pub fn parse_param(value: &Value) -> Option<ParamEvent> {
        match value.as_struct()? {
            [Value::Int(seq), Value::Id(id), Value::Int(index), Value::Int(next), param] => {
                Some(ParamEvent {
                    seq: *seq,
                    id: *id,
                    index: *index as u32,
                    next: *next as u32,
                    param: param.clone(),
                })
            }
            _ => None,
        }
    }

    /// Client info: the client's global id plus its properties
    pub fn parse_client_info(value: &Value) -> Option<(u32, Vec<(String, String)>)> {
        match value.as_struct()? {
            [Value::Id(id), Value::Struct(fields)] => {
                let mut props = Vec::new();
                for pair in fields.chunks(2) {
                    match pair {
                        [Value::String(k), Value::String(v)] => {
                            props.push((k.clone(), v.clone()))
                        }
                        _ => return None,
                    }
                }
                Some((*id, props))
            }
            _ => None,
        }
    }
}
