//! Registry of connected device-manager peers.

use std::collections::BTreeSet;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{DeviceManagerId, DevicePrefix};

const IDENTS_PER_PREFIX: usize = 256;

/// Allocates and tracks peer identities, keyed by protocol prefix.
///
/// Each prefix has its own 8-bit ident space, so up to 256 peers of one
/// protocol family can be registered at a time. Registration hands out the
/// lowest ident currently free for the prefix, so idents released by
/// departed peers are reused before the space grows.
#[derive(Default)]
pub struct DeviceManagerTable {
    registered: Mutex<BTreeSet<DeviceManagerId>>,
}

impl DeviceManagerTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new peer of the given prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManagerTableFull`] when all 256 idents of the
    /// prefix are taken.
    pub fn register(&self, prefix: DevicePrefix) -> Result<DeviceManagerId> {
        let mut registered = self.lock();
        let taken: Vec<u8> = registered
            .iter()
            .filter(|id| id.prefix() == prefix)
            .map(|id| id.ident())
            .collect();
        if taken.len() >= IDENTS_PER_PREFIX {
            return Err(Error::ManagerTableFull(prefix));
        }

        // `taken` is sorted (BTreeSet order), so the first gap is the
        // lowest free ident.
        let mut ident = 0u8;
        for used in taken {
            if used != ident {
                break;
            }
            ident = ident.wrapping_add(1);
        }

        let id = DeviceManagerId::new(prefix, ident);
        registered.insert(id);
        info!(%id, %prefix, "registered device manager");
        Ok(id)
    }

    /// Removes a registered peer, freeing its ident for reuse.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRegistered`] if the identity is not present.
    pub fn unregister(&self, id: DeviceManagerId) -> Result<()> {
        if self.lock().remove(&id) {
            debug!(%id, "unregistered device manager");
            Ok(())
        } else {
            Err(Error::NotRegistered(id))
        }
    }

    /// Whether the identity is currently registered.
    #[must_use]
    pub fn is_registered(&self, id: DeviceManagerId) -> bool {
        self.lock().contains(&id)
    }

    /// All registered identities, ordered by raw value.
    #[must_use]
    pub fn all(&self) -> Vec<DeviceManagerId> {
        self.lock().iter().copied().collect()
    }

    /// Registered identities of one prefix, ordered by ident.
    #[must_use]
    pub fn all_with_prefix(&self, prefix: DevicePrefix) -> Vec<DeviceManagerId> {
        self.lock()
            .iter()
            .filter(|id| id.prefix() == prefix)
            .copied()
            .collect()
    }

    /// Number of registered peers across all prefixes.
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<DeviceManagerId>> {
        self.registered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
