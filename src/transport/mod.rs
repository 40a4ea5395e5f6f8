//! Transport abstraction for the broker's two endpoints.
//!
//! The protocol engine talks to sockets only through these traits, so it
//! runs identically over ZeroMQ ([`zmq`]) and over the in-process pair
//! ([`mem`]) used by tests and single-process embedding.
//!
//! All receives are non-blocking (`try_recv` returns `None` when nothing
//! is pending); the engines poll in their run loops.

pub mod mem;
pub mod zmq;

use crate::error::Result;

/// Broker side of the data socket: routes by peer identity.
pub trait DataEndpoint: Send {
    /// Sends one payload to the peer with the given identity.
    ///
    /// An unknown identity is not an error; the payload is dropped, the
    /// way a ROUTER socket drops unroutable messages.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the socket rejects the send.
    fn send_to(&self, peer: &str, text: &str) -> Result<()>;

    /// Receives one pending `(peer identity, payload)`, if any.
    ///
    /// # Errors
    ///
    /// Returns a transport error on socket failure; `Ok(None)` when
    /// nothing is pending.
    fn try_recv(&self) -> Result<Option<(String, String)>>;
}

/// Broker side of the hello socket: strict receive/reply alternation.
pub trait ReplyEndpoint: Send {
    /// Sends the reply to the most recently received request.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the socket rejects the send.
    fn send(&self, text: &str) -> Result<()>;

    /// Receives one pending request, if any.
    ///
    /// # Errors
    ///
    /// Returns a transport error on socket failure; `Ok(None)` when
    /// nothing is pending.
    fn try_recv(&self) -> Result<Option<String>>;
}

/// Peer side of the data socket, bound to one peer identity.
pub trait PeerEndpoint: Send {
    /// Sends one payload to the broker.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the socket rejects the send.
    fn send(&self, text: &str) -> Result<()>;

    /// Receives one pending payload addressed to this peer, if any.
    ///
    /// # Errors
    ///
    /// Returns a transport error on socket failure; `Ok(None)` when
    /// nothing is pending.
    fn try_recv(&self) -> Result<Option<String>>;
}

/// Peer side of the hello socket: one request, then poll for the reply.
pub trait RequestEndpoint: Send {
    /// Sends one request to the broker.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the socket rejects the send.
    fn send(&self, text: &str) -> Result<()>;

    /// Receives the pending reply, if it arrived.
    ///
    /// # Errors
    ///
    /// Returns a transport error on socket failure; `Ok(None)` when
    /// nothing is pending.
    fn try_recv(&self) -> Result<Option<String>>;
}
