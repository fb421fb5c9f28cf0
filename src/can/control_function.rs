//! Addressing: who is on the bus, and which of them are ours
//!
//! A control function is an addressable participant identified by a 64-bit [Name] and a claimed
//! 8-bit address. The registry is the unique owner of every control function; everything else
//! (transport sessions, working sets) holds a copyable [CfHandle] and re-resolves it per
//! operation, so a control function that loses its address can never dangle.

use crate::can::Name;

/// The null address, used by control functions that have not (yet) claimed an address
pub const NULL_ADDRESS: u8 = 0xFE;

/// The global (broadcast) destination address
pub const GLOBAL_ADDRESS: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFunctionKind {
    /// A local endpoint this stack claims an address for
    Internal,
    /// A remote peer we exchange destination-specific traffic with
    Partnered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFunction {
    pub name: Name,
    pub address: u8,
    pub kind: ControlFunctionKind,
}

impl ControlFunction {
    #[inline]
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.kind == ControlFunctionKind::Internal
    }
}

/// A stable, copyable reference to a registered [ControlFunction]
///
/// Handles are generation-checked: releasing a control function and reusing its slot invalidates
/// every handle that pointed at the old occupant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CfHandle {
    slot: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    occupant: Option<ControlFunction>,
}

/// The unique owner of every control function known to the stack
#[derive(Default)]
pub struct ControlFunctionRegistry {
    slots: Vec<Slot>,
}

impl ControlFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, cf: ControlFunction) -> eyre::Result<CfHandle> {
        if cf.address == NULL_ADDRESS || cf.address == GLOBAL_ADDRESS {
            eyre::bail!(
                "Address {:#04X} cannot be claimed by control function {:?}",
                cf.address,
                cf.name
            );
        }
        if self.resolve(cf.address).is_some() {
            eyre::bail!("Address {:#04X} is already claimed", cf.address);
        }

        let handle = if let Some(slot) = self
            .slots
            .iter()
            .position(|slot| slot.occupant.is_none())
        {
            self.slots[slot].occupant = Some(cf);
            CfHandle {
                slot: slot as u32,
                generation: self.slots[slot].generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                occupant: Some(cf),
            });
            CfHandle {
                slot: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        };
        tracing::debug!(
            "Registered {:?} control function at address {:#04X}",
            cf.kind,
            cf.address
        );
        Ok(handle)
    }

    /// Register a local endpoint at the given claimed address
    pub fn claim_internal(&mut self, name: Name, address: u8) -> eyre::Result<CfHandle> {
        self.insert(ControlFunction {
            name,
            address,
            kind: ControlFunctionKind::Internal,
        })
    }

    /// Register a remote peer observed (or expected) at the given address
    pub fn register_partner(&mut self, name: Name, address: u8) -> eyre::Result<CfHandle> {
        self.insert(ControlFunction {
            name,
            address,
            kind: ControlFunctionKind::Partnered,
        })
    }

    /// Look up the handle of whoever currently claims `address`
    #[must_use]
    pub fn resolve(&self, address: u8) -> Option<CfHandle> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(slot, s)| match &s.occupant {
                Some(cf) if cf.address == address => Some(CfHandle {
                    slot: slot as u32,
                    generation: s.generation,
                }),
                _ => None,
            })
    }

    /// Dereference a handle, returning None if the control function was released
    #[must_use]
    pub fn get(&self, handle: CfHandle) -> Option<&ControlFunction> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.occupant.as_ref()
    }

    /// Whether `address` belongs to one of our internal control functions
    #[must_use]
    pub fn is_internal_address(&self, address: u8) -> bool {
        self.resolve(address)
            .and_then(|handle| self.get(handle))
            .is_some_and(ControlFunction::is_internal)
    }

    /// Release a control function on address loss or explicit teardown
    ///
    /// All outstanding handles to it stop resolving.
    pub fn release(&mut self, handle: CfHandle) {
        if let Some(slot) = self.slots.get_mut(handle.slot as usize) {
            if slot.generation == handle.generation && slot.occupant.is_some() {
                let cf = slot.occupant.take();
                slot.generation = slot.generation.wrapping_add(1);
                if let Some(cf) = cf {
                    tracing::debug!(
                        "Released control function at address {:#04X}",
                        cf.address
                    );
                }
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.occupant.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_claim_and_resolve() {
        let mut registry = ControlFunctionRegistry::new();
        let internal = registry.claim_internal(Name(0x1234), 0x26).unwrap();
        let partner = registry.register_partner(Name(0x5678), 0x81).unwrap();

        assert_eq!(registry.resolve(0x26), Some(internal));
        assert_eq!(registry.resolve(0x81), Some(partner));
        assert_eq!(registry.resolve(0x10), None);

        assert!(registry.get(internal).unwrap().is_internal());
        assert!(!registry.get(partner).unwrap().is_internal());
        assert!(registry.is_internal_address(0x26));
        assert!(!registry.is_internal_address(0x81));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut registry = ControlFunctionRegistry::new();
        registry.claim_internal(Name(1), 0x26).unwrap();
        assert!(registry.register_partner(Name(2), 0x26).is_err());
    }

    #[test]
    fn test_reserved_addresses_rejected() {
        let mut registry = ControlFunctionRegistry::new();
        assert!(registry.claim_internal(Name(1), NULL_ADDRESS).is_err());
        assert!(registry.claim_internal(Name(1), GLOBAL_ADDRESS).is_err());
    }

    #[test]
    fn test_stale_handle_does_not_resolve() {
        let mut registry = ControlFunctionRegistry::new();
        let handle = registry.claim_internal(Name(1), 0x26).unwrap();
        registry.release(handle);
        assert_eq!(registry.get(handle), None);
        assert_eq!(registry.resolve(0x26), None);

        // The slot gets reused, but the stale handle still points at the dead generation
        let replacement = registry.register_partner(Name(2), 0x27).unwrap();
        assert_eq!(registry.get(handle), None);
        assert_eq!(registry.get(replacement).unwrap().address, 0x27);
    }
}
