//! An ordered key-value skip list with stable handles.
//!
//! Nodes live in a slab; a [`SkipListHandle`] names a slot plus a
//! generation, so handles to removed nodes are detected instead of
//! dereferenced. Insertion samples a node's level once from a pluggable
//! generator; [`SkipList::update_right`] moves a node to a new key while
//! preserving its level. `add_left` places a new element before any
//! existing run of equal keys, `add_right` after it.
//!
//! The deadline chronology uses the `new_front` flags to learn when the
//! earliest deadline changed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

/// Hard cap on node levels.
pub const MAX_NUM_LEVELS: usize = 24;

const NIL: u32 = u32::MAX;
const HEAD: u32 = u32::MAX;

/// Outcome of a skip-list mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    NotFound,
    Invalid,
}

/// Samples the level of a newly inserted node.
pub trait LevelGenerator {
    fn random_level(&mut self) -> usize;
}

/// Geometric level distribution with p = 1/4.
pub struct RandomLevelGenerator {
    rng: StdRng,
}

impl RandomLevelGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomLevelGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelGenerator for RandomLevelGenerator {
    fn random_level(&mut self) -> usize {
        let mut level = 0;
        while level + 1 < MAX_NUM_LEVELS && self.rng.gen_range(0..4) == 0 {
            level += 1;
        }
        level
    }
}

/// Stable reference to a node; survives unrelated mutations and reports
/// `NotFound` once its node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipListHandle {
    slot: u32,
    generation: u32,
}

struct Node<K, V> {
    key: K,
    value: V,
    level: usize,
    forward: SmallVec<[u32; 4]>,
}

struct Slot<K, V> {
    generation: u32,
    node: Option<Node<K, V>>,
}

/// Ordered key-value container supporting O(log n) insertion at either
/// side of an equal-key run, removal by handle, and in-place key update.
pub struct SkipList<K, V> {
    slots: Vec<Slot<K, V>>,
    free: Vec<u32>,
    head: [u32; MAX_NUM_LEVELS],
    list_level: usize,
    length: usize,
    generator: Box<dyn LevelGenerator + Send>,
}

impl<K: Ord, V> Default for SkipList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> SkipList<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_generator(Box::new(RandomLevelGenerator::new()))
    }

    #[must_use]
    pub fn with_generator(generator: Box<dyn LevelGenerator + Send>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: [NIL; MAX_NUM_LEVELS],
            list_level: 0,
            length: 0,
            generator,
        }
    }

    #[inline]
    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of levels in use; grows monotonically until
    /// [`SkipList::remove_all`] resets it.
    #[inline]
    #[must_use]
    pub const fn list_level(&self) -> usize {
        self.list_level
    }

    fn node(&self, slot: u32) -> &Node<K, V> {
        self.slots[slot as usize]
            .node
            .as_ref()
            .expect("slot holds no node")
    }

    fn node_mut(&mut self, slot: u32) -> &mut Node<K, V> {
        self.slots[slot as usize]
            .node
            .as_mut()
            .expect("slot holds no node")
    }

    fn next_at(&self, at: u32, level: usize) -> u32 {
        if at == HEAD {
            self.head[level]
        } else {
            self.node(at).forward[level]
        }
    }

    fn set_next_at(&mut self, at: u32, level: usize, to: u32) {
        if at == HEAD {
            self.head[level] = to;
        } else {
            self.node_mut(at).forward[level] = to;
        }
    }

    fn resolve(&self, handle: SkipListHandle) -> Option<&Node<K, V>> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn handle_of(&self, slot: u32) -> SkipListHandle {
        SkipListHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    fn allocate(&mut self, node: Node<K, V>) -> u32 {
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize].node = Some(node);
            slot
        } else {
            assert!(self.slots.len() < NIL as usize - 1, "skip list exhausted");
            self.slots.push(Slot {
                generation: 1,
                node: Some(node),
            });
            (self.slots.len() - 1) as u32
        }
    }

    /// Find the predecessor of the insertion point at each level.
    /// `to_left` stops before any run of equal keys; otherwise the walk
    /// passes through it.
    fn find_insertion_point(&self, key: &K, to_left: bool) -> [u32; MAX_NUM_LEVELS] {
        let mut update = [HEAD; MAX_NUM_LEVELS];
        let mut at = HEAD;
        for level in (0..self.list_level).rev() {
            loop {
                let next = self.next_at(at, level);
                if next == NIL {
                    break;
                }
                let next_key = &self.node(next).key;
                let advance = if to_left {
                    next_key < key
                } else {
                    next_key <= key
                };
                if !advance {
                    break;
                }
                at = next;
            }
            update[level] = at;
        }
        update
    }

    /// Find the predecessor of `target` at each level, walking through any
    /// equal-key run until the target itself is reached.
    fn find_node_predecessors(&self, target: u32) -> [u32; MAX_NUM_LEVELS] {
        let key = &self.node(target).key;
        let mut update = [HEAD; MAX_NUM_LEVELS];
        let mut at = HEAD;
        for level in (0..self.list_level).rev() {
            loop {
                let next = self.next_at(at, level);
                if next == NIL || next == target {
                    break;
                }
                let next_key = &self.node(next).key;
                if next_key <= key {
                    at = next;
                } else {
                    break;
                }
            }
            update[level] = at;
        }
        update
    }

    fn link(&mut self, slot: u32, update: &[u32; MAX_NUM_LEVELS]) -> bool {
        let level = self.node(slot).level;
        for lvl in 0..=level {
            let next = self.next_at(update[lvl], lvl);
            self.node_mut(slot).forward[lvl] = next;
            self.set_next_at(update[lvl], lvl, slot);
        }
        self.list_level = self.list_level.max(level + 1);
        update[0] == HEAD
    }

    fn unlink(&mut self, target: u32) {
        let update = self.find_node_predecessors(target);
        let level = self.node(target).level;
        for lvl in 0..=level {
            if self.next_at(update[lvl], lvl) == target {
                let next = self.node(target).forward[lvl];
                self.set_next_at(update[lvl], lvl, next);
            }
        }
    }

    fn add_impl(&mut self, key: K, value: V, to_left: bool) -> (SkipListHandle, bool) {
        let level = self.generator.random_level().min(MAX_NUM_LEVELS - 1);
        let update = self.find_insertion_point(&key, to_left);
        let slot = self.allocate(Node {
            key,
            value,
            level,
            forward: SmallVec::from_elem(NIL, level + 1),
        });
        let new_front = self.link(slot, &update);
        self.length += 1;
        (self.handle_of(slot), new_front)
    }

    /// Insert before any existing equal-keyed run. Returns the handle and
    /// whether the new node became the front of the list.
    pub fn add_left(&mut self, key: K, value: V) -> (SkipListHandle, bool) {
        self.add_impl(key, value, true)
    }

    /// Insert after any existing equal-keyed run. Returns the handle and
    /// whether the new node became the front of the list.
    pub fn add_right(&mut self, key: K, value: V) -> (SkipListHandle, bool) {
        self.add_impl(key, value, false)
    }

    /// Handle of the first (least-keyed) node.
    #[must_use]
    pub fn front(&self) -> Option<SkipListHandle> {
        (self.head[0] != NIL).then(|| self.handle_of(self.head[0]))
    }

    /// Step `handle` to its successor, or to `None` at the end.
    pub fn skip_forward(&self, handle: &mut Option<SkipListHandle>) -> Status {
        let Some(current) = *handle else {
            return Status::Invalid;
        };
        match self.resolve(current) {
            None => {
                *handle = None;
                Status::NotFound
            }
            Some(node) => {
                let next = node.forward[0];
                *handle = (next != NIL).then(|| self.handle_of(next));
                Status::Success
            }
        }
    }

    /// Borrow the key of `handle`'s node.
    #[must_use]
    pub fn key(&self, handle: SkipListHandle) -> Option<&K> {
        self.resolve(handle).map(|node| &node.key)
    }

    /// Borrow the value of `handle`'s node.
    #[must_use]
    pub fn value(&self, handle: SkipListHandle) -> Option<&V> {
        self.resolve(handle).map(|node| &node.value)
    }

    /// Move `handle`'s node to `new_key`, keeping its value and level. The
    /// node lands after any existing run of nodes equal to `new_key`. Also
    /// reports whether the node became the front of the list.
    pub fn update_right(&mut self, handle: SkipListHandle, new_key: K) -> (Status, bool) {
        if handle.slot as usize >= self.slots.len() {
            return (Status::Invalid, false);
        }
        if self.resolve(handle).is_none() {
            return (Status::NotFound, false);
        }

        let slot = handle.slot;
        self.unlink(slot);
        {
            let node = self.node_mut(slot);
            node.key = new_key;
            let level = node.level;
            node.forward.clear();
            node.forward.resize(level + 1, NIL);
        }
        // the node is unlinked; walk with its new key, add-right discipline
        let update = self.find_insertion_point(&self.node(slot).key, false);
        let new_front = self.link(slot, &update);
        (Status::Success, new_front)
    }

    /// Remove `handle`'s node.
    pub fn remove(&mut self, handle: SkipListHandle) -> Status {
        if handle.slot as usize >= self.slots.len() {
            return Status::Invalid;
        }
        if self.resolve(handle).is_none() {
            return Status::NotFound;
        }

        let slot = handle.slot;
        self.unlink(slot);
        let entry = &mut self.slots[slot as usize];
        entry.node = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);
        self.length -= 1;
        Status::Success
    }

    /// Remove `handle`'s node and return its value.
    pub fn take(&mut self, handle: SkipListHandle) -> Option<V> {
        if handle.slot as usize >= self.slots.len() || self.resolve(handle).is_none() {
            return None;
        }
        let slot = handle.slot;
        self.unlink(slot);
        let entry = &mut self.slots[slot as usize];
        let node = entry.node.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);
        self.length -= 1;
        Some(node.value)
    }

    /// Remove every node and reset the list level to zero. Returns the
    /// number of nodes removed.
    pub fn remove_all(&mut self) -> usize {
        let removed = self.length;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if entry.node.take().is_some() {
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.head = [NIL; MAX_NUM_LEVELS];
        self.list_level = 0;
        self.length = 0;
        removed
    }

    /// Validate the structural invariants. Test support.
    ///
    /// # Panics
    ///
    /// Panics if any invariant is broken.
    pub fn check_invariants(&self) {
        // level-0 walk visits exactly `length` nodes in non-decreasing order
        let mut count = 0;
        let mut at = self.head[0];
        let mut previous: Option<&K> = None;
        while at != NIL {
            let node = self.node(at);
            if let Some(prev) = previous {
                assert!(prev <= &node.key, "level 0 ordering violated");
            }
            previous = Some(&node.key);
            count += 1;
            at = node.forward[0];
        }
        assert_eq!(count, self.length, "length mismatch");

        // each higher level is a sorted sub-sequence of the level below
        for level in 1..self.list_level {
            let mut at = self.head[level];
            let mut previous: Option<&K> = None;
            while at != NIL {
                let node = self.node(at);
                assert!(node.level >= level, "node linked above its level");
                if let Some(prev) = previous {
                    assert!(prev <= &node.key, "level {level} ordering violated");
                }
                previous = Some(&node.key);
                at = node.forward[level];
            }
        }
    }
}
