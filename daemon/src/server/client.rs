//! Per-connection client state

use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::sys::socket::{getsockopt, sockopt};
use wavepipe_core::connection::Connection;

use crate::registry::GlobalId;
use crate::resource::Resource;
use crate::server::ClientId;

/// One connected peer: its socket, credentials and resource table
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub conn: Connection,
    /// Immutable connection properties, credentials included
    pub props: Vec<(String, String)>,
    pub resources: HashMap<u32, Resource>,
    /// Highest sender sequence number observed on this connection
    pub recv_seq: u32,
    /// While set, incoming frames queue instead of dispatching
    pub busy: bool,
    /// The global representing this client
    pub global: GlobalId,
}

impl Client {
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Reads SO_PEERCRED and SO_PEERSEC off a freshly accepted socket into
/// client properties. pid/uid/gid appear as decimal strings.
pub fn peer_props(fd: BorrowedFd) -> Vec<(String, String)> {
    let mut props = vec![("protocol".to_string(), "native".to_string())];

    match getsockopt(&fd, sockopt::PeerCredentials) {
        Ok(ucred) => {
            props.push(("ucred.pid".into(), ucred.pid().to_string()));
            props.push(("ucred.uid".into(), ucred.uid().to_string()));
            props.push(("ucred.gid".into(), ucred.gid().to_string()));
        }
        Err(e) => warn!("no peercred: {e}"),
    }

    match peer_security_label(fd.as_raw_fd()) {
        Some(label) => props.push(("sec.label".into(), label)),
        None => debug!("no peersec"),
    }

    props
}

/// SO_PEERSEC has no nix wrapper; ask the kernel directly
fn peer_security_label(fd: RawFd) -> Option<String> {
    let mut buf = [0u8; 256];
    let mut len = buf.len() as libc::socklen_t;
    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERSEC,
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    };
    if res < 0 {
        return None;
    }
    let bytes = &buf[..len as usize];
    let label = bytes.split(|b| *b == 0).next()?;
    if label.is_empty() {
        return None;
    }
    String::from_utf8(label.to_vec()).ok()
}
