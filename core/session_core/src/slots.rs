//! Index-addressed tables with generational ids
//!
//! Sessions keep their transports and peers here. Cross-references between
//! them are ids, so removing an entry can never leave a dangling reference:
//! a stale id simply fails to resolve.

use std::fmt;
use std::marker::PhantomData;

/// Generational id into a `Slots<T>`
pub struct SlotId<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SlotId<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    #[cfg(test)]
    pub(crate) fn from_raw(index: u32, generation: u32) -> Self {
        Self::new(index, generation)
    }
}

// Manual impls so `T` does not need to be Copy/Eq/Hash itself.
impl<T> Clone for SlotId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlotId<T> {}

impl<T> PartialEq for SlotId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for SlotId<T> {}

impl<T> std::hash::Hash for SlotId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for SlotId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// A table of `T` addressed by `SlotId<T>`
pub struct Slots<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Slots<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> SlotId<T> {
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.generation = entry.generation.wrapping_add(1);
                entry.value = Some(value);
                SlotId::new(index, entry.generation)
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    value: Some(value),
                });
                SlotId::new(index, 0)
            }
        }
    }

    pub fn get(&self, id: SlotId<T>) -> Option<&T> {
        self.entries
            .get(id.index())
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.value.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId<T>) -> Option<&mut T> {
        self.entries
            .get_mut(id.index())
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.value.as_mut())
    }

    pub fn contains(&self, id: SlotId<T>) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: SlotId<T>) -> Option<T> {
        let entry = self.entries.get_mut(id.index())?;
        if entry.generation != id.generation {
            return None;
        }
        let value = entry.value.take()?;
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ids of every live entry, in index order
    pub fn ids(&self) -> Vec<SlotId<T>> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId<T>, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, e)| {
            e.value
                .as_ref()
                .map(|v| (SlotId::new(index as u32, e.generation), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotId<T>, &mut T)> {
        self.entries.iter_mut().enumerate().filter_map(|(index, e)| {
            let generation = e.generation;
            e.value
                .as_mut()
                .map(move |v| (SlotId::new(index as u32, generation), v))
        })
    }

    /// Remove every entry, returning them
    ///
    /// Generations are kept, so ids handed out before the drain stay stale.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(value) = entry.value.take() {
                self.free.push(index as u32);
                values.push(value);
            }
        }
        self.len = 0;
        values
    }
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self::new()
    }
}
