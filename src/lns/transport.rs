//! The boundary to the network.
//!
//! The core never touches sockets. It hands outbound messages to a
//! [`SendMessage`] implementation and expects the owner of the wire to feed
//! everything that arrives into [`LocalNameServer::handle_message`].
//!
//! [`LocalNameServer::handle_message`]: super::LocalNameServer::handle_message

use super::error::Error;
use crate::base::{Message, NodeId};
use tokio::sync::mpsc;
use tracing::trace;

//------------ SendMessage ---------------------------------------------------

/// Sends a message to a node of the name service.
///
/// Sending must not block. Delivery is not guaranteed; lost messages are
/// dealt with by retransmission.
pub trait SendMessage: Send + Sync + 'static {
    /// Queues `msg` for delivery to `dest`.
    fn send_message(&self, dest: NodeId, msg: Message) -> Result<(), Error>;
}

//------------ ChannelTransport ----------------------------------------------

/// A transport that hands outbound messages to a channel.
///
/// Whoever owns the receiving end of the channel is responsible for the
/// actual delivery. Test harnesses use it to observe and answer the
/// traffic of a local name server.
#[derive(Clone, Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<(NodeId, Message)>,
}

impl ChannelTransport {
    /// Creates a transport and the receiver of its messages.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(NodeId, Message)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SendMessage for ChannelTransport {
    fn send_message(&self, dest: NodeId, msg: Message) -> Result<(), Error> {
        trace!("sending {} to {}", msg.kind(), dest);
        self.tx.send((dest, msg)).map_err(|_| Error::SendFailed(dest))
    }
}
