//! Session identifier table
//!
//! Maps every octet of the /24 to its slot state. The network, host and
//! broadcast octets are reserved forever. An identifier is `Pending` between
//! the handshake that announced it and the first packet of the switched
//! device, then `Bound` to that device's session.
//!
//! All mutation goes through one `RwLock`, held for the table update only.

use protocol::SessionId;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

const SLOTS: usize = 256;

/// Identifier table errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    #[error("No free session identifiers left")]
    Exhausted,

    #[error("Session identifier {0} is reserved")]
    Reserved(SessionId),

    #[error("Session identifier {0} is bound to another session")]
    Occupied(SessionId),
}

enum Slot<S> {
    Reserved,
    Free,
    Pending,
    Bound(Arc<S>),
}

/// Process-wide identifier table, generic over the session type it binds
pub struct IdentifierTable<S> {
    slots: RwLock<Vec<Slot<S>>>,
}

impl<S> Default for IdentifierTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> IdentifierTable<S> {
    pub fn new() -> Self {
        let slots = (0..SLOTS)
            .map(|octet| {
                if SessionId(octet as u8).is_reserved() {
                    Slot::Reserved
                } else {
                    Slot::Free
                }
            })
            .collect();

        Self {
            slots: RwLock::new(slots),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Slot<S>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Slot<S>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lowest free identifier
    ///
    /// Exhaustion leaves the table untouched.
    pub fn acquire(&self) -> Result<SessionId, TableError> {
        let mut slots = self.write();
        let octet = slots
            .iter()
            .position(|slot| matches!(slot, Slot::Free))
            .ok_or(TableError::Exhausted)?;

        slots[octet] = Slot::Pending;
        Ok(SessionId(octet as u8))
    }

    /// Return an identifier to the free set
    ///
    /// Reserved identifiers are ignored.
    pub fn release(&self, id: SessionId) {
        let mut slots = self.write();
        let slot = &mut slots[usize::from(id.0)];
        if !matches!(slot, Slot::Reserved) {
            *slot = Slot::Free;
        }
    }

    /// Free `id` only while it is still `Pending`
    ///
    /// A slot adopted by a session in the meantime is left bound. Returns
    /// whether the slot was released.
    pub fn release_pending(&self, id: SessionId) -> bool {
        let mut slots = self.write();
        let slot = &mut slots[usize::from(id.0)];
        let pending = matches!(slot, Slot::Pending);
        if pending {
            *slot = Slot::Free;
        }
        pending
    }

    /// Bind `id` to `session`
    ///
    /// Adopts a free or pending slot. Binding the same session twice is a
    /// no-op; a slot held by another session is left alone.
    pub fn store(&self, id: SessionId, session: &Arc<S>) -> Result<(), TableError> {
        let mut slots = self.write();
        let slot = &mut slots[usize::from(id.0)];

        match slot {
            Slot::Reserved => return Err(TableError::Reserved(id)),
            Slot::Bound(bound) if Arc::ptr_eq(bound, session) => return Ok(()),
            Slot::Bound(_) => return Err(TableError::Occupied(id)),
            Slot::Free | Slot::Pending => {}
        }

        *slot = Slot::Bound(session.clone());
        Ok(())
    }

    /// Session bound to `id`, if any
    pub fn find(&self, id: SessionId) -> Option<Arc<S>> {
        match &self.read()[usize::from(id.0)] {
            Slot::Bound(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Free `id` only if it is still bound to `session`
    ///
    /// Returns whether the slot was released.
    pub fn release_session(&self, id: SessionId, session: &S) -> bool {
        let mut slots = self.write();
        let slot = &mut slots[usize::from(id.0)];

        let owned =
            matches!(slot, Slot::Bound(bound) if std::ptr::eq(Arc::as_ptr(bound), session));
        if owned {
            *slot = Slot::Free;
        }
        owned
    }

    /// Identifiers currently free, ascending
    pub fn free_ids(&self) -> Vec<SessionId> {
        self.read()
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Free))
            .map(|(octet, _)| SessionId(octet as u8))
            .collect()
    }

    /// Number of identifiers bound to live sessions
    pub fn bound_count(&self) -> usize {
        self.read()
            .iter()
            .filter(|slot| matches!(slot, Slot::Bound(_)))
            .count()
    }

    /// Number of identifiers announced to a device that has not bound yet
    pub fn pending_count(&self) -> usize {
        self.read()
            .iter()
            .filter(|slot| matches!(slot, Slot::Pending))
            .count()
    }

    /// Every bound identifier with its session
    pub fn bound(&self) -> Vec<(SessionId, Arc<S>)> {
        self.read()
            .iter()
            .enumerate()
            .filter_map(|(octet, slot)| match slot {
                Slot::Bound(session) => Some((SessionId(octet as u8), session.clone())),
                _ => None,
            })
            .collect()
    }
}
