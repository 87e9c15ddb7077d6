//! Framed wire connection over a unix stream socket
//!
//! Every frame starts with a 16 byte little-endian header:
//!
//! ```text
//! id     [u32]   target resource id
//! opcode [u32]   method or event index within the target's interface
//! size   [u32]   payload length in bytes
//! seq    [u32]   sender sequence number
//! ```
//!
//! followed by `size` bytes of self-describing payload ([crate::pod]).
//! Multiple frames may be batched into one syscall. File descriptors travel
//! as `SCM_RIGHTS` ancillary data; both sides number their fds per
//! connection in send order, and payloads reference them by that index, so
//! batching boundaries do not matter for fd association.

use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::anyhow;
use byteorder::{ByteOrder, LittleEndian};
use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::error::{DaemonResult, Fault, ResultExt};
use crate::pod::Value;

pub const HEADER_SIZE: usize = 16;
/// Upper bound on one frame's payload, a defence against garbage headers
pub const MAX_FRAME_SIZE: usize = 1 << 20;
/// Most fds one recvmsg is prepared to accept
const MAX_FDS_PER_RECV: usize = 16;
const RECV_CHUNK: usize = 4096;

/// One whole frame as yielded by [Connection::get_next].
///
/// The data is only meaningful until the frame is dispatched; fds referenced
/// by the payload are claimed from the connection via [Connection::take_fd].
#[derive(Debug)]
pub struct Message {
    pub id: u32,
    pub opcode: u32,
    pub seq: u32,
    pub data: Vec<u8>,
}

impl Message {
    /// Demarshals the payload into its value
    pub fn value(&self) -> DaemonResult<Value> {
        Value::demarshal_exact(&self.data).fault(Fault::Protocol)
    }
}

/// Outcome of a [Connection::flush]
#[derive(Debug, PartialEq, Eq)]
pub enum Flush {
    /// All pending bytes were written
    Drained,
    /// The socket would block; keep write-readiness armed and retry
    Again,
}

#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    rbuf: Vec<u8>,
    /// Received fds by connection-wide arrival index, until claimed
    in_fds: VecDeque<(u32, OwnedFd)>,
    next_in_index: u32,
    wbuf: Vec<u8>,
    /// Fds owned by the connection until flushed
    out_fds: Vec<OwnedFd>,
    next_out_index: u32,
    send_seq: u32,
    peer_closed: bool,
}

impl Connection {
    pub fn new(stream: UnixStream) -> DaemonResult<Self> {
        stream.set_nonblocking(true).fault(Fault::Protocol)?;
        Ok(Self {
            stream,
            rbuf: Vec::new(),
            in_fds: VecDeque::new(),
            next_in_index: 0,
            wbuf: Vec::new(),
            out_fds: Vec::new(),
            next_out_index: 0,
            send_seq: 0,
            peer_closed: false,
        })
    }

    /// Connects to a stream socket at `path`
    pub fn connect(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let stream = UnixStream::connect(path).fault(Fault::SocketSetup)?;
        Self::new(stream)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Duplicates the underlying socket fd. The caller owns the returned fd
    /// and must query its flags itself; the connection stays usable.
    pub fn dup_fd(&self) -> DaemonResult<OwnedFd> {
        self.stream.try_clone().fault(Fault::Protocol).map(Into::into)
    }

    /// Yields the next whole frame, reading more bytes from the socket as
    /// needed. `Ok(None)` means no complete frame is available yet.
    /// An error is fatal for the connection.
    pub fn get_next(&mut self) -> DaemonResult<Option<Message>> {
        loop {
            if let Some(msg) = self.parse_frame()? {
                return Ok(Some(msg));
            }
            if self.peer_closed {
                return Err(anyhow!("peer closed connection")).fault(Fault::Protocol);
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    fn parse_frame(&mut self) -> DaemonResult<Option<Message>> {
        if self.rbuf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let size = LittleEndian::read_u32(&self.rbuf[8..12]) as usize;
        if size > MAX_FRAME_SIZE {
            return Err(anyhow!("frame of {size} bytes exceeds limit")).fault(Fault::Protocol);
        }
        if self.rbuf.len() < HEADER_SIZE + size {
            return Ok(None);
        }
        let id = LittleEndian::read_u32(&self.rbuf[0..4]);
        let opcode = LittleEndian::read_u32(&self.rbuf[4..8]);
        let seq = LittleEndian::read_u32(&self.rbuf[12..16]);
        let data = self.rbuf[HEADER_SIZE..HEADER_SIZE + size].to_vec();
        self.rbuf.drain(..HEADER_SIZE + size);
        Ok(Some(Message {
            id,
            opcode,
            seq,
            data,
        }))
    }

    /// Reads whatever the socket has, returns whether new bytes arrived
    fn fill(&mut self) -> DaemonResult<bool> {
        let mut progress = false;
        loop {
            let mut buf = [0u8; RECV_CHUNK];
            let mut fds: Vec<RawFd> = Vec::new();
            let n = {
                let mut iov = [IoSliceMut::new(&mut buf)];
                let mut cmsg = cmsg_space!([RawFd; MAX_FDS_PER_RECV]);
                match recvmsg::<()>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                ) {
                    Ok(msg) => {
                        for cm in msg.cmsgs().fault(Fault::Protocol)? {
                            if let ControlMessageOwned::ScmRights(received) = cm {
                                fds.extend(received);
                            }
                        }
                        msg.bytes
                    }
                    Err(Errno::EAGAIN) => return Ok(progress),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e).fault(Fault::Protocol),
                }
            };
            for fd in fds {
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                self.in_fds.push_back((self.next_in_index, owned));
                self.next_in_index += 1;
            }
            if n == 0 {
                self.peer_closed = true;
                return Ok(progress);
            }
            self.rbuf.extend_from_slice(&buf[..n]);
            progress = true;
            if n < RECV_CHUNK {
                return Ok(progress);
            }
        }
    }

    /// Claims a received fd by its payload index. Ownership moves to the
    /// caller; unclaimed fds are closed when the connection drops.
    pub fn take_fd(&mut self, index: u32) -> Option<OwnedFd> {
        let pos = self.in_fds.iter().position(|(i, _)| *i == index)?;
        self.in_fds.remove(pos).map(|(_, fd)| fd)
    }

    /// Opens a frame towards `(id, opcode)`
    pub fn begin(&mut self, id: u32, opcode: u32) -> Builder<'_> {
        let header_pos = self.wbuf.len();
        self.wbuf.extend_from_slice(&[0u8; HEADER_SIZE]);
        LittleEndian::write_u32(&mut self.wbuf[header_pos..header_pos + 4], id);
        LittleEndian::write_u32(&mut self.wbuf[header_pos + 4..header_pos + 8], opcode);
        Builder {
            conn: self,
            header_pos,
        }
    }

    /// Whether bytes are pending and the loop should arm write-readiness
    pub fn need_flush(&self) -> bool {
        !self.wbuf.is_empty()
    }

    /// Whether already-received bytes are waiting to be parsed, e.g. frames
    /// that queued while their client was busy
    pub fn has_buffered(&self) -> bool {
        !self.rbuf.is_empty()
    }

    /// Attempts a non-blocking write of all pending frames. Fds handed to
    /// [Builder::add_fd] ride on the first byte written and are released
    /// once the kernel took them.
    pub fn flush(&mut self) -> DaemonResult<Flush> {
        while !self.wbuf.is_empty() {
            let fds: Vec<RawFd> = self.out_fds.iter().map(|f| f.as_raw_fd()).collect();
            let cmsg = if fds.is_empty() {
                Vec::new()
            } else {
                vec![ControlMessage::ScmRights(&fds)]
            };
            let iov = [IoSlice::new(&self.wbuf)];
            match sendmsg::<()>(
                self.stream.as_raw_fd(),
                &iov,
                &cmsg,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Ok(n) => {
                    self.out_fds.clear();
                    self.wbuf.drain(..n);
                }
                Err(Errno::EAGAIN) => return Ok(Flush::Again),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).fault(Fault::Protocol),
            }
        }
        Ok(Flush::Drained)
    }
}

/// An open outgoing frame. [Builder::end] assigns the sequence number and
/// queues the frame for [Connection::flush].
pub struct Builder<'a> {
    conn: &'a mut Connection,
    header_pos: usize,
}

impl<'a> Builder<'a> {
    /// Marshals `value` as the frame payload
    pub fn value(self, value: &Value) -> Self {
        value.marshal(&mut self.conn.wbuf);
        self
    }

    /// Transfers `fd` to the connection, returning the index the payload
    /// should reference it by
    pub fn add_fd(&mut self, fd: OwnedFd) -> u32 {
        let index = self.conn.next_out_index;
        self.conn.next_out_index += 1;
        self.conn.out_fds.push(fd);
        index
    }

    /// Closes the frame and returns the assigned sequence number
    pub fn end(self) -> u32 {
        let seq = self.conn.send_seq;
        self.conn.send_seq = self.conn.send_seq.wrapping_add(1);
        let size = (self.conn.wbuf.len() - self.header_pos - HEADER_SIZE) as u32;
        let h = self.header_pos;
        LittleEndian::write_u32(&mut self.conn.wbuf[h + 8..h + 12], size);
        LittleEndian::write_u32(&mut self.conn.wbuf[h + 12..h + 16], seq);
        trace!(
            "queued frame seq {} ({} payload bytes)",
            seq,
            size
        );
        seq
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use nix::unistd::pipe;

    use super::*;
    use crate::pod::ObjectValue;

    fn pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        (Connection::new(a).unwrap(), Connection::new(b).unwrap())
    }

    #[test]
    fn test_frame_roundtrip() {
        let (mut tx, mut rx) = pair();

        let payload = Value::Struct(vec![Value::Int(1), Value::String("hello".into())]);
        let seq = tx.begin(3, 7).value(&payload).end();
        assert_eq!(seq, 0);
        assert!(tx.need_flush());
        assert_eq!(tx.flush().unwrap(), Flush::Drained);
        assert!(!tx.need_flush());

        let msg = rx.get_next().unwrap().unwrap();
        assert_eq!((msg.id, msg.opcode, msg.seq), (3, 7, 0));
        assert_eq!(msg.value().unwrap(), payload);
        assert!(rx.get_next().unwrap().is_none());
    }

    #[test]
    fn test_batched_frames_in_order() {
        let (mut tx, mut rx) = pair();

        for i in 0..5 {
            tx.begin(1, i).value(&Value::Int(i as i32)).end();
        }
        assert_eq!(tx.flush().unwrap(), Flush::Drained);

        for i in 0..5 {
            let msg = rx.get_next().unwrap().unwrap();
            assert_eq!(msg.opcode, i);
            assert_eq!(msg.seq, i);
            assert_eq!(msg.value().unwrap(), Value::Int(i as i32));
        }
        assert!(rx.get_next().unwrap().is_none());
    }

    #[test]
    fn test_fd_passing() {
        let (mut tx, mut rx) = pair();

        let (pipe_rx, pipe_tx) = pipe().unwrap();
        let mut b = tx.begin(2, 0);
        let index = b.add_fd(pipe_tx);
        b.value(&Value::Struct(vec![Value::Fd(index)])).end();
        tx.flush().unwrap();

        let msg = rx.get_next().unwrap().unwrap();
        let fields = msg.value().unwrap();
        let index = match fields.as_struct().unwrap() {
            [Value::Fd(i)] => *i,
            other => panic!("unexpected payload {other:?}"),
        };
        let fd = rx.take_fd(index).expect("fd must have arrived");
        assert!(rx.take_fd(index).is_none());

        let mut writer = std::fs::File::from(fd);
        writer.write_all(b"ping").unwrap();
        drop(writer);

        let mut reader = std::fs::File::from(pipe_rx);
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "ping");
    }

    #[test]
    fn test_partial_header_is_not_a_frame() {
        let (mut tx, mut rx) = pair();
        tx.begin(1, 1).value(&Value::None).end();
        // Nothing flushed yet, so the receiver has nothing
        assert!(rx.get_next().unwrap().is_none());
        tx.flush().unwrap();
        assert!(rx.get_next().unwrap().is_some());
    }

    #[test]
    fn test_peer_close_is_an_error() {
        let (tx, mut rx) = pair();
        drop(tx);
        assert!(rx.get_next().is_err());
    }

    #[test]
    fn test_filterable_object_payload() {
        let (mut tx, mut rx) = pair();
        let param = Value::Object(ObjectValue::new(4).prop(1, Value::Int(48000)));
        tx.begin(9, 1).value(&param).end();
        tx.flush().unwrap();
        let msg = rx.get_next().unwrap().unwrap();
        assert_eq!(msg.value().unwrap().object_id(), Some(4));
    }
}
