//! Generation-checked handle arena.
//!
//! Entities handed across the boundary live in a [`HandleTable`] and are
//! referred to by a [`Token`]. Releasing a token bumps the slot's
//! generation, so a stale copy of it can never reach the entity that later
//! reuses the slot.

use cellbox_shared::errors::{CellboxError, CellboxResult};

/// Opaque reference to an entity in a [`HandleTable`].
///
/// Packs into a `u64` for callers that can only carry integers. Generations
/// start at 1, so `0` is never a valid token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token {
    index: u32,
    generation: u32,
}

impl Token {
    pub fn as_u64(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of strongly-owned entities indexed by [`Token`].
pub struct HandleTable<T> {
    kind: &'static str,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> HandleTable<T> {
    /// Create an empty table. `kind` names the entity in error messages.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> Token {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Token {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        Token {
            index,
            generation: 1,
        }
    }

    pub fn get(&self, token: Token) -> CellboxResult<&T> {
        self.slots
            .get(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or_else(|| self.stale(token))
    }

    /// Take the entity out and invalidate every copy of `token`.
    pub fn remove(&mut self, token: Token) -> CellboxResult<T> {
        let stale = self.stale(token);
        let slot = self
            .slots
            .get_mut(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .ok_or_else(|| stale.clone())?;
        let value = slot.value.take().ok_or(stale)?;

        // Skip 0 on wrap so a packed token is never zero.
        slot.generation = slot.generation.checked_add(1).unwrap_or(1);
        self.free.push(token.index);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stale(&self, token: Token) -> CellboxError {
        CellboxError::InvalidArgument(format!(
            "invalid or released {} handle {:#x}",
            self.kind,
            token.as_u64()
        ))
    }
}
