/// Links between slots and elements.
///
/// A slot either carries the generation of its live element or the index of the next free slot.
/// It is unconditionally `Copy` so the slot table can be scanned cheaply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct Slot {
    /// The id of this slot.
    ///
    /// If the given out key mismatches the `generation_id` then the element was removed already
    /// and we can return `None` on lookup.
    ///
    /// If the slot is currently unused it instead holds the index of the next slot in the
    /// slot-free-list.
    generation_id: GenerationOrFreelink,
}

/// A slotmap owning its fixed-capacity storage.
///
/// A slotmap provides a `Vec`-like interface where each entry is associated with a stable
/// index-like key. Lookup with the key will detect if an entry has been removed but does not
/// require any lifetime relation.
///
/// ## Usage
///
/// ```
/// # use uptcp::managed::SlotMap;
/// let mut map = SlotMap::with_capacity(1024);
/// let index = map.insert(42).unwrap();
/// assert_eq!(map.get(index).cloned(), Some(42));
/// ```
pub struct SlotMap<T> {
    elements: Vec<Option<T>>,
    slots: Vec<Slot>,
    generation: Generation,
    free_top: usize,
    len: usize,
}

/// An index into a slotmap.
///
/// The index remains valid until the entry is removed. If accessing the slotmap with the index
/// again after the entry was removed will fail, even if the index where the element was previously
/// stored has been reused for another element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    idx: usize,
    generation: Generation,
}

/// Generation when positive, negated index of the next free slot otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct GenerationOrFreelink(isize);

/// The generation counter.
///
/// Has strictly positive values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct Generation(isize);

impl<T> SlotMap<T> {
    /// Create a map that can hold at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity < isize::max_value() as usize);
        let slots = (0..capacity)
            .map(|idx| Slot { generation_id: GenerationOrFreelink::free(idx + 1) })
            .collect();
        let elements = (0..capacity).map(|_| None).collect();
        SlotMap {
            elements,
            slots,
            generation: Generation::default(),
            free_top: 0,
            len: 0,
        }
    }

    /// Retrieve a value by key.
    pub fn get(&self, key: Key) -> Option<&T> {
        if !self.is_live(key) {
            return None;
        }

        self.elements[key.idx].as_ref()
    }

    /// Retrieve a mutable value by key.
    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        if !self.is_live(key) {
            return None;
        }

        self.elements[key.idx].as_mut()
    }

    /// Insert a value, returning its key or `None` if the map is full.
    pub fn insert(&mut self, value: T) -> Option<Key> {
        let idx = self.free_top;
        let slot = self.slots.get_mut(idx)?;

        let next = slot.generation_id
            .free_link()
            .expect("Free link should be free");
        slot.generation_id = self.generation.into();
        let key = Key {
            idx,
            generation: self.generation,
        };

        self.elements[idx] = Some(value);
        self.free_top = next;
        self.generation.advance();
        self.len += 1;
        Some(key)
    }

    /// Remove an element.
    ///
    /// Returns `None` if the provided key did not refer to a live element.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        if !self.is_live(key) {
            return None;
        }

        let slot = &mut self.slots[key.idx];
        slot.generation_id = GenerationOrFreelink::free(self.free_top);
        self.free_top = key.idx;
        self.len -= 1;

        self.elements[key.idx].take()
    }

    /// The key of the live element at a raw index.
    pub fn key_at(&self, idx: usize) -> Option<Key> {
        let generation = self.slots.get(idx)?.generation_id.generation()?;
        Some(Key { idx, generation })
    }

    /// Iterate over all live entries.
    pub fn iter(&self) -> impl Iterator<Item=(Key, &T)> + '_ {
        self.slots.iter()
            .zip(self.elements.iter())
            .enumerate()
            .filter_map(|(idx, (slot, element))| {
                let generation = slot.generation_id.generation()?;
                Some((Key { idx, generation }, element.as_ref()?))
            })
    }

    pub fn contains(&self, key: Key) -> bool {
        self.is_live(key)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_live(&self, key: Key) -> bool {
        self.slots.get(key.idx)
            .and_then(|slot| slot.generation_id.generation())
            .map_or(false, |generation| generation == key.generation)
    }
}

impl Key {
    /// The raw slot index, stable for the lifetime of the entry.
    pub fn index(self) -> usize {
        self.idx
    }
}

impl GenerationOrFreelink {
    fn free(next: usize) -> Self {
        GenerationOrFreelink(-(next as isize))
    }

    fn free_link(self) -> Option<usize> {
        if self.0 > 0 {
            None
        } else {
            Some(self.0.checked_neg().unwrap() as usize)
        }
    }

    fn generation(self) -> Option<Generation> {
        if self.0 > 0 {
            Some(Generation(self.0))
        } else {
            None
        }
    }
}

impl Generation {
    fn advance(&mut self) {
        assert!(self.0 > 0);
        self.0 = self.0.wrapping_add(1).max(1)
    }
}

impl Default for Generation {
    fn default() -> Self {
        Generation(1)
    }
}

impl From<Generation> for GenerationOrFreelink {
    fn from(gen: Generation) -> GenerationOrFreelink {
        GenerationOrFreelink(gen.0)
    }
}
