//! Transport link to a session worker
//!
//! The proxy only stores and hands out the link; framing lives in
//! [`crate::protocol`] and addressing in [`crate::response`].

use crate::protocol::read_message;
use crate::proxy::ServerProxy;
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;

/// A connected transport to one worker process
pub trait Link: Send + Sync + fmt::Debug {
    /// Human-readable peer description, for logs
    fn peer(&self) -> String;

    /// Write one complete frame
    fn send(&self, frame: &[u8]) -> io::Result<()>;
}

/// Link over a Unix domain socket
pub struct UnixLink {
    peer: String,
    stream: Mutex<UnixStream>,
}

impl UnixLink {
    pub fn new(stream: UnixStream, peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            stream: Mutex::new(stream),
        }
    }

    /// Create a connected pair: the link and the worker's end of it
    pub fn pair(peer: impl Into<String>) -> io::Result<(Self, UnixStream)> {
        let (daemon_end, worker_end) = UnixStream::pair()?;
        Ok((Self::new(daemon_end, peer), worker_end))
    }

    /// A second handle on the socket for a reader thread
    pub fn try_clone_stream(&self) -> io::Result<UnixStream> {
        self.stream.lock().try_clone()
    }
}

impl fmt::Debug for UnixLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixLink").field("peer", &self.peer).finish()
    }
}

impl Link for UnixLink {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock();
        stream.write_all(frame)?;
        stream.flush()
    }
}

/// Read worker messages until EOF and route them to `proxy`
///
/// Runs on the thread that owns the read side of the link. Returns the
/// number of messages routed.
pub fn route_worker_messages<R: Read>(mut reader: R, proxy: &ServerProxy) -> io::Result<usize> {
    let mut routed = 0;
    loop {
        match read_message(&mut reader) {
            Ok((message, _)) => {
                proxy.handle_worker_message(&message);
                routed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(routed),
            Err(e) => return Err(e),
        }
    }
}
