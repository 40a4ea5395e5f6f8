//! ZeroMQ endpoint implementations.
//!
//! The broker binds a ROUTER (data) and a REP (hello) socket; each peer
//! connects a DEALER whose `ZMQ_IDENTITY` is its assigned 4-hex-digit
//! identity, plus a REQ for the one-shot hello exchange. Receives use
//! `DONTWAIT`; `EAGAIN` maps to "nothing pending".

use tracing::trace;

use crate::error::{Error, Result};
use crate::transport::{DataEndpoint, PeerEndpoint, ReplyEndpoint, RequestEndpoint};

/// Renders a `tcp://host:port` endpoint address.
#[must_use]
pub fn tcp_address(host: &str, port: u16) -> String {
    format!("tcp://{host}:{port}")
}

fn text_frame(frame: std::result::Result<String, Vec<u8>>) -> Result<String> {
    frame.map_err(|_| Error::Protocol {
        message: "non-utf8 frame".to_string(),
    })
}

/// ROUTER socket bound by the broker; routes by peer identity frame.
pub struct ZmqDataEndpoint {
    socket: zmq::Socket,
}

impl ZmqDataEndpoint {
    /// Binds the data socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Zmq`] if the socket cannot be created or bound.
    pub fn bind(context: &zmq::Context, address: &str) -> Result<Self> {
        let socket = context.socket(zmq::ROUTER)?;
        socket.bind(address)?;
        trace!(address, "data endpoint bound");
        Ok(Self { socket })
    }
}

impl DataEndpoint for ZmqDataEndpoint {
    fn send_to(&self, peer: &str, text: &str) -> Result<()> {
        // ROUTER drops messages for unknown identities silently.
        self.socket
            .send_multipart([peer.as_bytes(), text.as_bytes()], 0)?;
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<(String, String)>> {
        match self.socket.recv_multipart(zmq::DONTWAIT) {
            Ok(mut frames) if frames.len() == 2 => {
                let text = frames.pop().and_then(|f| String::from_utf8(f).ok());
                let peer = frames.pop().and_then(|f| String::from_utf8(f).ok());
                match (peer, text) {
                    (Some(peer), Some(text)) => Ok(Some((peer, text))),
                    _ => Err(Error::Protocol {
                        message: "non-utf8 frame".to_string(),
                    }),
                }
            }
            Ok(frames) => Err(Error::Protocol {
                message: format!("unexpected frame count: {}", frames.len()),
            }),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// REP socket bound by the broker for hello exchanges.
pub struct ZmqReplyEndpoint {
    socket: zmq::Socket,
}

impl ZmqReplyEndpoint {
    /// Binds the hello socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Zmq`] if the socket cannot be created or bound.
    pub fn bind(context: &zmq::Context, address: &str) -> Result<Self> {
        let socket = context.socket(zmq::REP)?;
        socket.bind(address)?;
        trace!(address, "hello endpoint bound");
        Ok(Self { socket })
    }
}

impl ReplyEndpoint for ZmqReplyEndpoint {
    fn send(&self, text: &str) -> Result<()> {
        self.socket.send(text, 0)?;
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<String>> {
        match self.socket.recv_string(zmq::DONTWAIT) {
            Ok(frame) => Ok(Some(text_frame(frame)?)),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// DEALER socket a peer connects with its assigned identity.
pub struct ZmqPeerEndpoint {
    socket: zmq::Socket,
}

impl ZmqPeerEndpoint {
    /// Connects the data socket under the given identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Zmq`] if the socket cannot be created, configured
    /// or connected.
    pub fn connect(context: &zmq::Context, address: &str, identity: &str) -> Result<Self> {
        let socket = context.socket(zmq::DEALER)?;
        socket.set_identity(identity.as_bytes())?;
        socket.connect(address)?;
        trace!(address, identity, "peer endpoint connected");
        Ok(Self { socket })
    }
}

impl PeerEndpoint for ZmqPeerEndpoint {
    fn send(&self, text: &str) -> Result<()> {
        self.socket.send(text, 0)?;
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<String>> {
        match self.socket.recv_string(zmq::DONTWAIT) {
            Ok(frame) => Ok(Some(text_frame(frame)?)),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// REQ socket a peer connects for the hello exchange.
pub struct ZmqRequestEndpoint {
    socket: zmq::Socket,
}

impl ZmqRequestEndpoint {
    /// Connects the hello socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Zmq`] if the socket cannot be created or
    /// connected.
    pub fn connect(context: &zmq::Context, address: &str) -> Result<Self> {
        let socket = context.socket(zmq::REQ)?;
        socket.connect(address)?;
        trace!(address, "request endpoint connected");
        Ok(Self { socket })
    }
}

impl RequestEndpoint for ZmqRequestEndpoint {
    fn send(&self, text: &str) -> Result<()> {
        self.socket.send(text, 0)?;
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<String>> {
        match self.socket.recv_string(zmq::DONTWAIT) {
            Ok(frame) => Ok(Some(text_frame(frame)?)),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
