//! Response encoder addressed at the worker behind a proxy

use crate::error::{ProxyError, Result};
use crate::link::Link;
use crate::protocol::{encode_message, Message, MessageId};
use std::fmt;
use std::sync::Arc;

/// Sends control messages to one session worker
///
/// Cheap to clone; a clone taken under the proxy lock can be used after
/// the lock is released.
#[derive(Clone, Default)]
pub struct WorkerResponse {
    link: Option<Arc<dyn Link>>,
    stream_id: MessageId,
}

impl WorkerResponse {
    pub fn new(link: Option<Arc<dyn Link>>, stream_id: MessageId) -> Self {
        Self { link, stream_id }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn stream_id(&self) -> MessageId {
        self.stream_id
    }

    /// Encode and write `message` on the link
    pub fn send(&self, message: &Message) -> Result<()> {
        let link = self.link.as_ref().ok_or(ProxyError::NoLink)?;
        let frame = encode_message(message, self.stream_id).map_err(ProxyError::Transport)?;
        link.send(&frame).map_err(|e| {
            tracing::warn!(peer = %link.peer(), error = %e, "send to worker failed");
            ProxyError::Transport(e)
        })
    }
}

impl fmt::Debug for WorkerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerResponse")
            .field("link", &self.link.as_ref().map(|l| l.peer()))
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::UnixLink;
    use crate::protocol::read_message;

    #[test]
    fn test_send_without_link() {
        let response = WorkerResponse::default();
        assert!(!response.is_connected());
        assert!(matches!(
            response.send(&Message::Ping { id: 1 }),
            Err(ProxyError::NoLink)
        ));
    }

    #[test]
    fn test_send_addresses_stream() {
        let (link, mut worker) = UnixLink::pair("w").unwrap();
        let response = WorkerResponse::new(Some(Arc::new(link)), 12);
        response.send(&Message::Inflate { factor: 1200 }).unwrap();

        let (msg, id) = read_message(&mut worker).unwrap();
        assert_eq!(msg, Message::Inflate { factor: 1200 });
        assert_eq!(id, 12);
    }
}
