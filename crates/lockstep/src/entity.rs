use std::fmt;

use thiserror::Error;

use crate::codec::{expect_int, CodecError, WireEncodable, WireValue};

/// Generation-stamped handle to a live entity. A slot is reused after
/// release, but with a bumped generation, so old handles stop resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId {
    pub slot: u32,
    pub generation: u32,
}

impl EntityId {
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

impl WireEncodable for EntityId {
    const TYPE_NAME: &'static str = "EntityId";
    const FIELDS: &'static [&'static str] = &["slot", "generation"];

    fn to_fields(&self) -> Vec<WireValue> {
        vec![WireValue::from(self.slot), WireValue::from(self.generation)]
    }

    fn from_fields(fields: Vec<WireValue>) -> Result<Self, CodecError> {
        let [slot, generation]: [WireValue; 2] =
            fields.try_into().map_err(|_| CodecError::TypeMismatch {
                expected: Self::TYPE_NAME,
                found: "wrong field count".to_string(),
            })?;
        Ok(Self {
            slot: narrow_u32(expect_int(&slot, Self::TYPE_NAME, "slot")?, "slot")?,
            generation: narrow_u32(
                expect_int(&generation, Self::TYPE_NAME, "generation")?,
                "generation",
            )?,
        })
    }
}

fn narrow_u32(value: i64, field: &'static str) -> Result<u32, CodecError> {
    u32::try_from(value).map_err(|_| CodecError::FieldType {
        type_name: EntityId::TYPE_NAME,
        field,
        expected: "u32",
        found: "out of range int",
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("stale handle {0}: slot is free or owned by a newer generation")]
    StaleHandle(EntityId),
    #[error("dead handle {0}: no such entity now")]
    DeadHandle(EntityId),
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    occupant: Option<T>,
}

/// Free-list allocator over dense integer slots.
#[derive(Debug)]
pub struct EntityRegistry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for EntityRegistry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<T> EntityRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, entity: T) -> EntityId {
        self.live += 1;
        if let Some(slot_index) = self.free.pop() {
            let slot = &mut self.slots[slot_index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.occupant = Some(entity);
            return EntityId::new(slot_index, slot.generation);
        }

        let slot_index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            occupant: Some(entity),
        });
        EntityId::new(slot_index, 0)
    }

    pub fn release(&mut self, id: EntityId) -> Result<T, EntityError> {
        let slot = self
            .slots
            .get_mut(id.slot as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(EntityError::StaleHandle(id))?;
        let entity = slot.occupant.take().ok_or(EntityError::StaleHandle(id))?;
        self.free.push(id.slot);
        self.live -= 1;
        Ok(entity)
    }

    pub fn resolve(&self, id: EntityId) -> Result<&T, EntityError> {
        self.slots
            .get(id.slot as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.occupant.as_ref())
            .ok_or(EntityError::DeadHandle(id))
    }

    pub fn resolve_mut(&mut self, id: EntityId) -> Result<&mut T, EntityError> {
        self.slots
            .get_mut(id.slot as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.occupant.as_mut())
            .ok_or(EntityError::DeadHandle(id))
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.resolve(id).is_ok()
    }

    /// Live handle currently occupying `slot`, if any.
    pub fn handle_at(&self, slot: u32) -> Option<EntityId> {
        self.slots
            .get(slot as usize)
            .filter(|entry| entry.occupant.is_some())
            .map(|entry| EntityId::new(slot, entry.generation))
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live entities in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.occupant
                .as_ref()
                .map(|entity| (EntityId::new(index as u32, slot.generation), entity))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode, TypeRegistry};

    #[test]
    fn allocate_grows_dense_slots() {
        let mut registry = EntityRegistry::new();
        let a = registry.allocate("a");
        let b = registry.allocate("b");
        assert_eq!(a, EntityId::new(0, 0));
        assert_eq!(b, EntityId::new(1, 0));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve(b), Ok(&"b"));
    }

    #[test]
    fn released_handle_no_longer_resolves() {
        let mut registry = EntityRegistry::new();
        let id = registry.allocate(5u32);
        assert_eq!(registry.release(id), Ok(5));
        assert_eq!(registry.resolve(id), Err(EntityError::DeadHandle(id)));
        assert!(registry.is_empty());
    }

    #[test]
    fn reused_slot_bumps_generation_and_old_handle_stays_dead() {
        let mut registry = EntityRegistry::new();
        let old = registry.allocate("first");
        registry.release(old).expect("release");
        let new = registry.allocate("second");

        assert_eq!(new.slot, old.slot);
        assert_ne!(new.generation, old.generation);
        assert_eq!(registry.resolve(old), Err(EntityError::DeadHandle(old)));
        assert_eq!(registry.resolve(new), Ok(&"second"));
    }

    #[test]
    fn release_rejects_stale_and_double_release() {
        let mut registry = EntityRegistry::new();
        let id = registry.allocate(1u8);
        registry.release(id).expect("release");
        assert_eq!(registry.release(id), Err(EntityError::StaleHandle(id)));

        let reused = registry.allocate(2u8);
        assert_eq!(registry.release(id), Err(EntityError::StaleHandle(id)));
        assert_eq!(registry.resolve(reused), Ok(&2));

        let never = EntityId::new(40, 0);
        assert_eq!(registry.release(never), Err(EntityError::StaleHandle(never)));
    }

    #[test]
    fn free_list_is_lifo_and_deterministic() {
        let mut registry = EntityRegistry::new();
        let ids = (0..4).map(|n| registry.allocate(n)).collect::<Vec<_>>();
        registry.release(ids[1]).expect("release 1");
        registry.release(ids[3]).expect("release 3");

        assert_eq!(registry.allocate(10).slot, 3);
        assert_eq!(registry.allocate(11).slot, 1);
        assert_eq!(registry.allocate(12).slot, 4);
        assert_eq!(
            registry.iter().map(|(_, value)| *value).collect::<Vec<_>>(),
            vec![0, 11, 2, 10, 12]
        );
    }

    #[test]
    fn resolve_mut_updates_occupant() {
        let mut registry = EntityRegistry::new();
        let id = registry.allocate(1i64);
        *registry.resolve_mut(id).expect("resolve") += 41;
        assert_eq!(registry.resolve(id), Ok(&42));
        assert_eq!(registry.handle_at(id.slot), Some(id));
        assert_eq!(registry.handle_at(9), None);
    }

    #[test]
    fn entity_id_travels_as_registered_object() {
        let mut types = TypeRegistry::new();
        types.register::<EntityId>().expect("register");
        let id = EntityId::new(3, 7);
        let bytes = encode(&id.to_wire(), &types).expect("encode");
        assert_eq!(bytes, b"os8:EntityId2:s4:sloti3s10:generationi7");
        let decoded = decode(&bytes, &types).expect("decode");
        assert_eq!(EntityId::from_wire(decoded).expect("entity id"), id);
    }
}
