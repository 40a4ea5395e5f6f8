//! In-process endpoint pairs backed by shared queues.
//!
//! Mirrors the ZeroMQ topology without sockets: one data hub plays the
//! ROUTER (any number of identified peers), one hello hub plays the
//! REP/REQ pair. Used by tests and single-process embedding.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::error::Result;
use crate::transport::{DataEndpoint, PeerEndpoint, ReplyEndpoint, RequestEndpoint};

type Queue<T> = Arc<Mutex<VecDeque<T>>>;

fn lock<T>(queue: &Mutex<T>) -> MutexGuard<'_, T> {
    queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Shared state of an in-process data "socket" fabric.
///
/// The hub hands out one broker-side [`DataEndpoint`] and any number of
/// identified peer-side [`PeerEndpoint`]s.
#[derive(Clone, Default)]
pub struct MemDataHub {
    to_broker: Queue<(String, String)>,
    to_peers: Arc<Mutex<HashMap<String, Queue<String>>>>,
}

impl MemDataHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The broker side of the fabric.
    #[must_use]
    pub fn endpoint(&self) -> MemDataEndpoint {
        MemDataEndpoint { hub: self.clone() }
    }

    /// A peer side of the fabric, reachable under `identity`.
    #[must_use]
    pub fn peer(&self, identity: &str) -> MemPeerEndpoint {
        let queue = Arc::clone(
            lock(&self.to_peers)
                .entry(identity.to_string())
                .or_default(),
        );
        MemPeerEndpoint {
            identity: identity.to_string(),
            to_broker: Arc::clone(&self.to_broker),
            inbox: queue,
        }
    }
}

/// Broker side of a [`MemDataHub`].
pub struct MemDataEndpoint {
    hub: MemDataHub,
}

impl DataEndpoint for MemDataEndpoint {
    fn send_to(&self, peer: &str, text: &str) -> Result<()> {
        match lock(&self.hub.to_peers).get(peer) {
            Some(queue) => lock(queue).push_back(text.to_string()),
            // Matches ROUTER behavior for unknown identities.
            None => trace!(peer, "dropping payload for unknown peer"),
        }
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<(String, String)>> {
        Ok(lock(&self.hub.to_broker).pop_front())
    }
}

/// Peer side of a [`MemDataHub`], bound to one identity.
pub struct MemPeerEndpoint {
    identity: String,
    to_broker: Queue<(String, String)>,
    inbox: Queue<String>,
}

impl PeerEndpoint for MemPeerEndpoint {
    fn send(&self, text: &str) -> Result<()> {
        lock(&self.to_broker).push_back((self.identity.clone(), text.to_string()));
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<String>> {
        Ok(lock(&self.inbox).pop_front())
    }
}

/// Shared state of an in-process hello "socket" pair.
///
/// Like REQ/REP, this assumes one exchange in flight at a time; tests
/// register peers sequentially.
#[derive(Clone, Default)]
pub struct MemHelloHub {
    requests: Queue<String>,
    replies: Queue<String>,
}

impl MemHelloHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The broker side of the pair.
    #[must_use]
    pub fn endpoint(&self) -> MemReplyEndpoint {
        MemReplyEndpoint { hub: self.clone() }
    }

    /// The peer side of the pair.
    #[must_use]
    pub fn requester(&self) -> MemRequestEndpoint {
        MemRequestEndpoint { hub: self.clone() }
    }
}

/// Broker side of a [`MemHelloHub`].
pub struct MemReplyEndpoint {
    hub: MemHelloHub,
}

impl ReplyEndpoint for MemReplyEndpoint {
    fn send(&self, text: &str) -> Result<()> {
        lock(&self.hub.replies).push_back(text.to_string());
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<String>> {
        Ok(lock(&self.hub.requests).pop_front())
    }
}

/// Peer side of a [`MemHelloHub`].
pub struct MemRequestEndpoint {
    hub: MemHelloHub,
}

impl RequestEndpoint for MemRequestEndpoint {
    fn send(&self, text: &str) -> Result<()> {
        lock(&self.hub.requests).push_back(text.to_string());
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<String>> {
        Ok(lock(&self.hub.replies).pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_routing_by_identity() {
        let hub = MemDataHub::new();
        let broker = hub.endpoint();
        let first = hub.peer("a100");
        let second = hub.peer("a101");

        first.send("from-first").unwrap();
        second.send("from-second").unwrap();
        assert_eq!(
            broker.try_recv().unwrap(),
            Some(("a100".to_string(), "from-first".to_string()))
        );
        assert_eq!(
            broker.try_recv().unwrap(),
            Some(("a101".to_string(), "from-second".to_string()))
        );
        assert_eq!(broker.try_recv().unwrap(), None);

        broker.send_to("a101", "for-second").unwrap();
        assert_eq!(first.try_recv().unwrap(), None);
        assert_eq!(second.try_recv().unwrap(), Some("for-second".to_string()));
    }

    #[test]
    fn test_unknown_peer_dropped() {
        let hub = MemDataHub::new();
        let broker = hub.endpoint();
        assert!(broker.send_to("nobody", "lost").is_ok());
    }

    #[test]
    fn test_hello_exchange() {
        let hub = MemHelloHub::new();
        let broker = hub.endpoint();
        let peer = hub.requester();

        assert_eq!(peer.try_recv().unwrap(), None);
        peer.send("hello?").unwrap();
        assert_eq!(broker.try_recv().unwrap(), Some("hello?".to_string()));
        broker.send("hello!").unwrap();
        assert_eq!(peer.try_recv().unwrap(), Some("hello!".to_string()));
    }
}
