//! Lock-free skiplist over a pre-sized arena.
//!
//! This is the active in-memory table of a partition. Keys are stored with
//! their timestamp suffix and ordered by [`compare_keys`]: ascending user
//! key, newest version first. Any number of readers and writers may operate
//! concurrently; all mutations go through atomic compare-exchange, there
//! are no locks on the hot path.
//!
//! Nodes reference their key, value and tower successors by 32-bit arena
//! offsets rather than pointers. The arena is released when the last
//! reference to the list (the list itself, a sealed-table entry, or an open
//! iterator) is dropped.

mod arena;
mod node;

pub use node::{MAX_HEIGHT, MAX_NODE_SIZE};

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::keys::{compare_keys, parse_ts, same_key, ValueStruct};

use arena::Arena;
use node::Node;

/// Coin bias for growing a node's tower: each extra level has probability
/// one third.
fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < MAX_HEIGHT && rng.gen_ratio(1, 3) {
        height += 1;
    }
    height
}

struct Core {
    /// Current list height, `1..=MAX_HEIGHT`. Raised by CAS.
    height: AtomicU32,
    /// Offset of the head node, which has the full tower and no key.
    head: u32,
    arena: Arena,
}

/// A reference-counted handle on the skiplist. Cloning increments the
/// count; the arena is freed when the last handle drops.
#[derive(Clone)]
pub struct Skiplist {
    core: Arc<Core>,
}

impl Skiplist {
    /// Creates an empty skiplist backed by an arena of `arena_size` bytes.
    pub fn new(arena_size: u32) -> Skiplist {
        let arena = Arena::new(arena_size);
        let head = Core::new_node(&arena, &[], &ValueStruct::default(), MAX_HEIGHT);
        Skiplist {
            core: Arc::new(Core {
                height: AtomicU32::new(1),
                head,
                arena,
            }),
        }
    }

    /// Number of handles currently holding the arena alive.
    pub fn references(&self) -> usize {
        Arc::strong_count(&self.core)
    }

    /// True when both handles refer to the same list.
    pub fn same_as(&self, other: &Skiplist) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Bytes used inside the arena.
    pub fn mem_size(&self) -> u32 {
        self.core.arena.size()
    }

    pub fn is_empty(&self) -> bool {
        self.core.find_last().is_null()
    }

    /// Inserts or replaces the value for `key` (a timestamped key).
    pub fn put(&self, key: &[u8], value: ValueStruct) {
        let core = &self.core;

        // Since overwrites are allowed we may not need a new node, or even
        // a height increase. Compute the splice first.
        let list_height = core.list_height();
        let mut prev = [0u32; MAX_HEIGHT + 1];
        let mut next = [0u32; MAX_HEIGHT + 1];
        prev[list_height] = core.head;
        for i in (0..list_height).rev() {
            let (p, n) = core.find_splice_for_level(key, prev[i + 1], i);
            prev[i] = p;
            next[i] = n;
            if p == n {
                core.set_node_value(p, &value);
                return;
            }
        }

        let height = random_height();
        let node_offset = Core::new_node(&core.arena, key, &value, height);

        // Raise the list height via CAS if this tower is the tallest yet.
        let mut list_height = core.list_height();
        while height > list_height {
            match core.height.compare_exchange(
                list_height as u32,
                height as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => list_height = current as usize,
            }
        }

        // Always link from the base level up: once the node is visible at
        // level 0, concurrent splice searches at higher levels will find it.
        for i in 0..height {
            loop {
                if prev[i] == 0 {
                    // This level was above the old list height, so no splice
                    // was computed. Those levels are sparse, search from head.
                    debug_assert!(i > 1);
                    let (p, n) = core.find_splice_for_level(key, core.head, i);
                    prev[i] = p;
                    next[i] = n;
                    // An equal key can only be discovered on the base level.
                    debug_assert_ne!(prev[i], next[i]);
                }
                let node = unsafe { &*core.arena.get_node(node_offset) };
                node.set_next_offset(i, next[i]);
                let prev_node = unsafe { &*core.arena.get_node(prev[i]) };
                if prev_node.cas_next_offset(i, next[i], node_offset) {
                    break;
                }
                // CAS lost, recompute the splice for this level.
                let (p, n) = core.find_splice_for_level(key, prev[i], i);
                prev[i] = p;
                next[i] = n;
                if p == n {
                    debug_assert!(i == 0, "equality can only happen on the base level");
                    core.set_node_value(p, &value);
                    return;
                }
            }
        }
    }

    /// Returns the value of the newest version of the user key at or below
    /// the timestamp encoded in `key`, with `version` filled in.
    pub fn get(&self, key: &[u8]) -> Option<ValueStruct> {
        let core = &self.core;
        let (node, _) = core.find_near(key, false, true);
        if node.is_null() {
            return None;
        }

        let node = unsafe { &*node };
        let found_key = core.arena.get_key(node.key_offset, node.key_size);
        if !same_key(key, found_key) {
            return None;
        }

        let (value_offset, value_size) = node.value_address();
        let mut value = core.arena.get_val(value_offset, value_size);
        value.version = parse_ts(found_key);
        Some(value)
    }

    /// Returns an iterator holding a reference on this list.
    pub fn iter(&self) -> SkiplistIterator {
        SkiplistIterator {
            list: self.clone(),
            node: std::ptr::null(),
        }
    }
}

impl Core {
    fn new_node(arena: &Arena, key: &[u8], value: &ValueStruct, height: usize) -> u32 {
        let node_offset = arena.put_node(height);
        let key_offset = arena.put_key(key);
        let value_offset = arena.put_val(value);
        let node = unsafe { &mut *arena.get_node(node_offset) };
        node.key_offset = key_offset;
        node.key_size = key.len() as u16;
        node.height = height as u16;
        node.set_value_address(value_offset, value.encoded_size());
        node_offset
    }

    fn list_height(&self) -> usize {
        self.height.load(Ordering::SeqCst) as usize
    }

    fn set_node_value(&self, node_offset: u32, value: &ValueStruct) {
        let value_offset = self.arena.put_val(value);
        let node = unsafe { &*self.arena.get_node(node_offset) };
        node.set_value_address(value_offset, value.encoded_size());
    }

    fn node_key(&self, node: &Node) -> &[u8] {
        self.arena.get_key(node.key_offset, node.key_size)
    }

    fn get_next(&self, node: *const Node, height: usize) -> *mut Node {
        if node.is_null() {
            return std::ptr::null_mut();
        }
        let offset = unsafe { (*node).next_offset(height) };
        self.arena.get_node(offset)
    }

    /// Finds `(before, after)` on `level` with `before.key < key <= after.key`,
    /// starting from `before`. Equal keys are returned as `before == after`.
    fn find_splice_for_level(&self, key: &[u8], mut before: u32, level: usize) -> (u32, u32) {
        loop {
            let before_node = unsafe { &*self.arena.get_node(before) };
            let next_offset = before_node.next_offset(level);
            let next = self.arena.get_node(next_offset);
            if next.is_null() {
                return (before, 0);
            }
            let next_key = self.node_key(unsafe { &*next });
            match compare_keys(key, next_key) {
                CmpOrdering::Equal => return (next_offset, next_offset),
                CmpOrdering::Less => return (before, next_offset),
                CmpOrdering::Greater => before = next_offset,
            }
        }
    }

    /// Finds the node nearest to `key`.
    ///
    /// With `less` it is the rightmost node sorting before `key` (or equal,
    /// with `allow_equal`); otherwise the leftmost node sorting after it.
    /// The bool reports an exact key match. Head is never returned.
    fn find_near(&self, key: &[u8], less: bool, allow_equal: bool) -> (*mut Node, bool) {
        let head = self.arena.get_node(self.head);
        let mut x: *mut Node = head;
        let mut level = self.list_height() - 1;
        loop {
            let next = self.get_next(x, level);
            if next.is_null() {
                // x.key < key < end of list.
                if level > 0 {
                    level -= 1;
                    continue;
                }
                if !less || x == head {
                    return (std::ptr::null_mut(), false);
                }
                return (x, false);
            }

            let next_key = self.node_key(unsafe { &*next });
            match compare_keys(key, next_key) {
                CmpOrdering::Greater => {
                    // x.key < next.key < key, keep moving right.
                    x = next;
                    continue;
                }
                CmpOrdering::Equal => {
                    if allow_equal {
                        return (next, true);
                    }
                    if !less {
                        // The next bigger key lives on the base level.
                        return (self.get_next(next, 0), false);
                    }
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if x == head {
                        return (std::ptr::null_mut(), false);
                    }
                    return (x, false);
                }
                CmpOrdering::Less => {
                    // x.key < key < next.key.
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if !less {
                        return (next, false);
                    }
                    if x == head {
                        return (std::ptr::null_mut(), false);
                    }
                    return (x, false);
                }
            }
        }
    }

    /// The last node of the list, or null when empty.
    fn find_last(&self) -> *mut Node {
        let head = self.arena.get_node(self.head);
        let mut node: *mut Node = head;
        let mut level = self.list_height() - 1;
        loop {
            let next = self.get_next(node, level);
            if !next.is_null() {
                node = next;
                continue;
            }
            if level == 0 {
                if node == head {
                    return std::ptr::null_mut();
                }
                return node;
            }
            level -= 1;
        }
    }
}

/// Iterator over a skiplist. Holds a reference on the list, keeping the
/// arena alive until dropped.
pub struct SkiplistIterator {
    list: Skiplist,
    node: *const Node,
}

impl SkiplistIterator {
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// The timestamped key at the current position.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        let node = unsafe { &*self.node };
        self.list.core.node_key(node)
    }

    pub fn value(&self) -> ValueStruct {
        debug_assert!(self.valid());
        let node = unsafe { &*self.node };
        let (offset, size) = node.value_address();
        self.list.core.arena.get_val(offset, size)
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = self.list.core.get_next(self.node, 0);
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let (node, _) = self.list.core.find_near(self.key(), true, false);
        self.node = node;
    }

    /// Positions at the first entry with key >= target.
    pub fn seek(&mut self, target: &[u8]) {
        let (node, _) = self.list.core.find_near(target, false, true);
        self.node = node;
    }

    /// Positions at the last entry with key <= target.
    pub fn seek_for_prev(&mut self, target: &[u8]) {
        let (node, _) = self.list.core.find_near(target, true, true);
        self.node = node;
    }

    pub fn seek_to_first(&mut self) {
        let core = &self.list.core;
        self.node = core.get_next(core.arena.get_node(core.head), 0);
    }

    pub fn seek_to_last(&mut self) {
        self.node = self.list.core.find_last();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::key_with_ts;

    fn value(v: &[u8]) -> ValueStruct {
        ValueStruct {
            value: v.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_list() {
        let list = Skiplist::new(1 << 12);
        assert!(list.is_empty());
        assert!(list.get(&key_with_ts(b"missing", 1)).is_none());
        let mut iter = list.iter();
        iter.seek_to_first();
        assert!(!iter.valid());
    }

    #[test]
    fn test_put_and_get() {
        let list = Skiplist::new(1 << 16);
        list.put(&key_with_ts(b"alpha", 1), value(b"one"));
        list.put(&key_with_ts(b"beta", 1), value(b"two"));

        let got = list.get(&key_with_ts(b"alpha", 1)).unwrap();
        assert_eq!(got.value, b"one");
        assert_eq!(got.version, 1);
        assert!(list.get(&key_with_ts(b"gamma", 1)).is_none());
    }

    #[test]
    fn test_get_returns_latest_visible_version() {
        let list = Skiplist::new(1 << 16);
        list.put(&key_with_ts(b"key", 1), value(b"v1"));
        list.put(&key_with_ts(b"key", 5), value(b"v5"));

        // A read at ts 10 sees version 5; a read at ts 3 sees version 1.
        let got = list.get(&key_with_ts(b"key", 10)).unwrap();
        assert_eq!(got.value, b"v5");
        assert_eq!(got.version, 5);

        let got = list.get(&key_with_ts(b"key", 3)).unwrap();
        assert_eq!(got.value, b"v1");
        assert_eq!(got.version, 1);
    }

    #[test]
    fn test_overwrite_same_version_updates_in_place() {
        let list = Skiplist::new(1 << 16);
        let key = key_with_ts(b"key", 7);
        list.put(&key, value(b"old"));
        list.put(&key, value(b"new"));
        assert_eq!(list.get(&key).unwrap().value, b"new");

        let mut iter = list.iter();
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn test_iterator_orders_keys_and_versions() {
        let list = Skiplist::new(1 << 16);
        list.put(&key_with_ts(b"b", 2), value(b"b2"));
        list.put(&key_with_ts(b"a", 1), value(b"a1"));
        list.put(&key_with_ts(b"a", 3), value(b"a3"));
        list.put(&key_with_ts(b"c", 1), value(b"c1"));

        let mut iter = list.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push((parse_key_owned(iter.key()), parse_ts(iter.key())));
            iter.next();
        }
        // Ascending user key, descending timestamp within a key.
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 3),
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 2),
                (b"c".to_vec(), 1),
            ]
        );
    }

    fn parse_key_owned(key: &[u8]) -> Vec<u8> {
        crate::keys::parse_key(key).to_vec()
    }

    #[test]
    fn test_iterator_seek_and_prev() {
        let list = Skiplist::new(1 << 16);
        for i in 0..10u64 {
            list.put(&key_with_ts(format!("key{i:02}").as_bytes(), 1), value(b"v"));
        }

        let mut iter = list.iter();
        iter.seek(&key_with_ts(b"key05", 1));
        assert!(iter.valid());
        assert_eq!(crate::keys::parse_key(iter.key()), b"key05");

        iter.prev();
        assert!(iter.valid());
        assert_eq!(crate::keys::parse_key(iter.key()), b"key04");

        iter.seek_for_prev(&key_with_ts(b"key99", 1));
        assert_eq!(crate::keys::parse_key(iter.key()), b"key09");

        iter.seek_to_last();
        assert_eq!(crate::keys::parse_key(iter.key()), b"key09");
    }

    #[test]
    fn test_iterator_holds_reference() {
        let list = Skiplist::new(1 << 12);
        assert_eq!(list.references(), 1);
        let iter = list.iter();
        assert_eq!(list.references(), 2);
        drop(iter);
        assert_eq!(list.references(), 1);
    }

    #[test]
    fn test_concurrent_writes_and_reads() {
        const WRITERS: usize = 8;
        const KEYS_PER_WRITER: usize = 10_000;

        let list = Skiplist::new(1 << 25);

        std::thread::scope(|scope| {
            for w in 0..WRITERS {
                let list = list.clone();
                scope.spawn(move || {
                    for i in 0..KEYS_PER_WRITER {
                        let key = key_with_ts(format!("w{w:02}k{i:05}").as_bytes(), 1);
                        list.put(&key, value(format!("v{w}-{i}").as_bytes()));
                    }
                });
            }
            for r in 0..WRITERS {
                let list = list.clone();
                scope.spawn(move || {
                    // Readers race the writers; whatever they find must be
                    // internally consistent.
                    for i in (0..KEYS_PER_WRITER).step_by(97) {
                        let key = key_with_ts(format!("w{r:02}k{i:05}").as_bytes(), 1);
                        if let Some(found) = list.get(&key) {
                            assert_eq!(found.value, format!("v{r}-{i}").into_bytes());
                        }
                    }
                });
            }
        });

        // Every written key reads back exactly once with its value.
        for w in 0..WRITERS {
            for i in 0..KEYS_PER_WRITER {
                let key = key_with_ts(format!("w{w:02}k{i:05}").as_bytes(), 1);
                let found = list.get(&key).expect("missing key after join");
                assert_eq!(found.value, format!("v{w}-{i}").into_bytes());
            }
        }

        // And the iterator visits keys in sorted order.
        let mut iter = list.iter();
        iter.seek_to_first();
        let mut count = 0usize;
        let mut last: Option<Vec<u8>> = None;
        while iter.valid() {
            let key = iter.key().to_vec();
            if let Some(prev) = &last {
                assert_eq!(compare_keys(prev, &key), CmpOrdering::Less);
            }
            last = Some(key);
            count += 1;
            iter.next();
        }
        assert_eq!(count, WRITERS * KEYS_PER_WRITER);
    }
}
