//! Hybrid array/hash tables
//!
//! A table stores positive-integer keys `1..=n` in a dense array part and
//! everything else in a hash part (open addressing with per-slot chain
//! links, the classic main-position scheme). Invariants:
//!
//! - every stored key is non-nil and not NaN
//! - assigning nil to a key removes the entry
//! - a dead hash slot keeps its key (so concurrent `next` walks stay
//!   positioned) but drops the value; rehash reclaims it
//! - `#t` is any border, discovered by doubling + binary search, never a
//!   cached count
//!
//! Rehash picks the new array size so the array is at least half occupied
//! by the live positive-integer keys, grouped by log2 buckets.

use crate::string::LuaStr;
use crate::value::{TableRef, Value};

/// Key errors surfaced to the script layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    NilKey,
    NanKey,
    /// `next` was handed a key that is not present in the table.
    InvalidNext,
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableError::NilKey => write!(f, "table index is nil"),
            TableError::NanKey => write!(f, "table index is NaN"),
            TableError::InvalidNext => write!(f, "invalid key to 'next'"),
        }
    }
}

impl std::error::Error for TableError {}

/// Weak-reference modes, decoded from `__mode` when a metatable is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WeakMode {
    pub keys: bool,
    pub values: bool,
}

impl WeakMode {
    pub fn from_mode_string(mode: &LuaStr) -> WeakMode {
        let bytes = mode.as_bytes();
        WeakMode {
            keys: bytes.contains(&b'k'),
            values: bytes.contains(&b'v'),
        }
    }

    pub fn any(self) -> bool {
        self.keys || self.values
    }
}

struct Node {
    /// `None` means the slot was never used. `Some(k)` with a nil value is
    /// a dead slot: the key is retained for iteration, the value dropped.
    key: Option<Value>,
    value: Value,
    next: Option<usize>,
}

impl Node {
    const fn vacant() -> Node {
        Node {
            key: None,
            value: Value::Nil,
            next: None,
        }
    }

    fn is_live(&self) -> bool {
        self.key.is_some() && !self.value.is_nil()
    }
}

/// The container behind `Value::Table`.
pub struct Table {
    array: Vec<Value>,
    nodes: Vec<Node>,
    /// Downward scan position for vacant nodes; reset by rehash.
    last_free: usize,
    live_nodes: usize,
    metatable: Option<TableRef>,
    weak: WeakMode,
}

fn key_hash(key: &Value) -> u32 {
    match key {
        Value::Boolean(b) => u32::from(*b) + 1,
        Value::Integer(i) => (*i as u32).wrapping_mul(2654435761),
        Value::Number(n) => {
            let bits = n.to_bits();
            ((bits ^ (bits >> 32)) as u32).wrapping_mul(2654435761)
        }
        Value::Str(s) => s.hash(),
        other => {
            let addr = other.identity().unwrap_or(0);
            ((addr >> 4) as u32).wrapping_mul(2654435761)
        }
        // Nil is rejected before hashing.
    }
}

fn next_pow2(n: usize) -> usize {
    n.next_power_of_two().max(1)
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl Table {
    pub fn new() -> Table {
        Table::with_capacity(0, 0)
    }

    /// Pre-sizes the parts; used by NEWTABLE's size hints and constructors.
    pub fn with_capacity(array: usize, hash: usize) -> Table {
        let nodes = if hash == 0 {
            Vec::new()
        } else {
            let n = next_pow2(hash);
            (0..n).map(|_| Node::vacant()).collect()
        };
        let last_free = nodes.len();
        Table {
            array: vec![Value::Nil; array],
            nodes,
            last_free,
            live_nodes: 0,
            metatable: None,
            weak: WeakMode::default(),
        }
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, metatable: Option<TableRef>) {
        self.metatable = metatable;
    }

    /// Weak modes are decoded by the caller from `__mode` (the caller owns
    /// the lock ordering between this table and its metatable).
    pub fn set_weak_mode(&mut self, weak: WeakMode) {
        self.weak = weak;
    }

    pub fn weak_mode(&self) -> WeakMode {
        self.weak
    }

    fn main_position(&self, key: &Value) -> usize {
        debug_assert!(!self.nodes.is_empty());
        key_hash(key) as usize & (self.nodes.len() - 1)
    }

    /// Finds the node holding `key`, dead or alive.
    fn find_node(&self, key: &Value) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut at = self.main_position(key);
        loop {
            let node = &self.nodes[at];
            if let Some(k) = &node.key {
                if k.raw_eq(key) {
                    return Some(at);
                }
            }
            match node.next {
                Some(next) => at = next,
                None => return None,
            }
        }
    }

    /// Raw read. The key is normalized; no metamethods are involved.
    pub fn get(&self, key: &Value) -> Value {
        let key = key.clone().normalize_key();
        if let Value::Integer(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                return self.array[i as usize - 1].clone();
            }
        }
        if key.is_nil() {
            return Value::Nil;
        }
        match self.find_node(&key) {
            Some(at) => self.nodes[at].value.clone(),
            None => Value::Nil,
        }
    }

    /// Convenience integer read used by the interpreter's loop opcodes.
    pub fn get_int(&self, i: i64) -> Value {
        if i >= 1 && i <= self.array.len() as i64 {
            return self.array[i as usize - 1].clone();
        }
        let key = if let Ok(small) = i32::try_from(i) {
            Value::Integer(small)
        } else {
            Value::Number(i as f64)
        };
        match self.find_node(&key) {
            Some(at) => self.nodes[at].value.clone(),
            None => Value::Nil,
        }
    }

    /// Raw write. Fast path: positive integers inside the array bounds go
    /// straight to their slot; appends extend the array and pull any
    /// following keys out of the hash part.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), TableError> {
        let key = key.normalize_key();
        match &key {
            Value::Nil => return Err(TableError::NilKey),
            Value::Number(n) if n.is_nan() => return Err(TableError::NanKey),
            _ => {}
        }
        if let Value::Integer(i) = key {
            let i = i as i64;
            if i >= 1 && i <= self.array.len() as i64 {
                self.array[i as usize - 1] = value;
                return Ok(());
            }
            if i == self.array.len() as i64 + 1 && !value.is_nil() {
                self.array.push(value);
                self.migrate_appended();
                return Ok(());
            }
        }
        self.hash_set(key, value)
    }

    /// After an append, successor keys may already live in the hash part;
    /// pull the contiguous run into the array so it stays dense.
    fn migrate_appended(&mut self) {
        loop {
            let next_key = Value::Integer(match i32::try_from(self.array.len() as i64 + 1) {
                Ok(i) => i,
                Err(_) => return,
            });
            match self.find_node(&next_key) {
                Some(at) if self.nodes[at].is_live() => {
                    let value = std::mem::take(&mut self.nodes[at].value);
                    self.live_nodes -= 1;
                    self.array.push(value);
                }
                _ => return,
            }
        }
    }

    fn hash_set(&mut self, key: Value, value: Value) -> Result<(), TableError> {
        if let Some(at) = self.find_node(&key) {
            let was_live = self.nodes[at].is_live();
            let now_live = !value.is_nil();
            self.nodes[at].value = value;
            match (was_live, now_live) {
                (true, false) => self.live_nodes -= 1,
                (false, true) => self.live_nodes += 1,
                _ => {}
            }
            return Ok(());
        }
        if value.is_nil() {
            // Deleting an absent key is a no-op.
            return Ok(());
        }
        self.new_key(key, value);
        Ok(())
    }

    fn free_position(&mut self) -> Option<usize> {
        while self.last_free > 0 {
            self.last_free -= 1;
            if self.nodes[self.last_free].key.is_none() {
                return Some(self.last_free);
            }
        }
        None
    }

    /// Inserts a key that is not present. May trigger a rehash.
    fn new_key(&mut self, key: Value, value: Value) {
        if self.nodes.is_empty() {
            self.rehash(Some(&key));
            // After rehash an integer key may now fit the array part.
            if let Value::Integer(i) = key {
                if i >= 1 && (i as usize) <= self.array.len() {
                    self.array[i as usize - 1] = value;
                    return;
                }
            }
            self.new_key(key, value);
            return;
        }
        let mp = self.main_position(&key);
        if self.nodes[mp].key.is_none() {
            self.nodes[mp] = Node {
                key: Some(key),
                value,
                next: None,
            };
            self.live_nodes += 1;
            return;
        }
        let Some(free) = self.free_position() else {
            self.rehash(Some(&key));
            if let Value::Integer(i) = key {
                if i >= 1 && (i as usize) <= self.array.len() {
                    self.array[i as usize - 1] = value;
                    return;
                }
            }
            self.new_key(key, value);
            return;
        };
        let colliding_key = self.nodes[mp]
            .key
            .clone()
            .expect("occupied main position has a key");
        let other_main = self.main_position(&colliding_key);
        if other_main == mp {
            // Colliding node sits in its own main position: the new node
            // takes the free slot and links into the chain after it.
            self.nodes[free] = Node {
                key: Some(key),
                value,
                next: self.nodes[mp].next,
            };
            self.nodes[mp].next = Some(free);
        } else {
            // Colliding node is a chain guest here; evict it to the free
            // slot, repoint its predecessor, and claim the main position.
            let mut prev = other_main;
            while self.nodes[prev].next != Some(mp) {
                prev = self.nodes[prev]
                    .next
                    .expect("chain guest is reachable from its main position");
            }
            self.nodes[prev].next = Some(free);
            self.nodes.swap(mp, free);
            self.nodes[mp] = Node {
                key: Some(key),
                value,
                next: None,
            };
        }
        self.live_nodes += 1;
    }

    /// True for a collectable value whose only remaining owner is this
    /// table — the refcount stand-in for unreachability that weak modes
    /// use at rehash time. Strings are effectively permanent.
    fn only_owner(value: &Value) -> bool {
        match value {
            Value::Table(t) => std::sync::Arc::strong_count(t) == 1,
            Value::Function(f) => match f {
                crate::value::Function::Lua(c) => std::sync::Arc::strong_count(c) == 1,
                crate::value::Function::Native(n) => std::sync::Arc::strong_count(n) == 1,
            },
            Value::Thread(t) => std::sync::Arc::strong_count(t) == 1,
            Value::Userdata(u) => std::sync::Arc::strong_count(u) == 1,
            _ => false,
        }
    }

    /// Rebuilds both parts. Collects live entries (dropping dead slots and,
    /// under weak modes, entries whose weak side is no longer reachable),
    /// then chooses the array size from the log2 histogram of integer keys.
    fn rehash(&mut self, extra: Option<&Value>) {
        let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(self.array.len() + self.live_nodes);
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                pairs.push((Value::Integer((i + 1) as i32), v.clone()));
            }
        }
        for node in &self.nodes {
            if node.is_live() {
                let key = node.key.clone().expect("live node has a key");
                pairs.push((key, node.value.clone()));
            }
        }
        // Release the old storage before the weak sweep so this table's
        // own clones do not inflate the refcounts it inspects.
        self.array.clear();
        self.array.shrink_to_fit();
        self.nodes.clear();
        self.nodes.shrink_to_fit();
        if self.weak.any() {
            pairs.retain(|(k, v)| {
                !(self.weak.keys && Self::only_owner(k) || self.weak.values && Self::only_owner(v))
            });
        }

        // Histogram of integer keys by log2 bucket: nums[b] counts keys in
        // (2^(b-1), 2^b]; nums[0] counts key 1.
        let mut nums = [0usize; 32];
        let mut int_keys = 0usize;
        let count_key = |k: &Value, nums: &mut [usize; 32], int_keys: &mut usize| {
            if let Value::Integer(i) = k {
                if *i >= 1 {
                    // Bucket b holds keys in (2^(b-1), 2^b]: the smallest b
                    // with i <= 2^b.
                    let bucket = 32 - ((*i as u32) - 1).leading_zeros() as usize;
                    nums[bucket.min(31)] += 1;
                    *int_keys += 1;
                }
            }
        };
        for (k, _) in &pairs {
            count_key(k, &mut nums, &mut int_keys);
        }
        if let Some(k) = extra {
            count_key(k, &mut nums, &mut int_keys);
        }

        // Largest power of two such that more than half the array cells
        // would hold a live integer key.
        let mut array_size = 0usize;
        let mut in_array = 0usize;
        let mut running = 0usize;
        let mut two_to = 1usize;
        for bucket in nums.iter().take(31) {
            running += bucket;
            if running > two_to / 2 {
                array_size = two_to;
                in_array = running;
            }
            if two_to >= int_keys {
                break;
            }
            two_to *= 2;
        }

        let hash_count = pairs.len() + usize::from(extra.is_some()) - in_array;
        self.array = vec![Value::Nil; array_size];
        self.nodes = if hash_count == 0 {
            Vec::new()
        } else {
            (0..next_pow2(hash_count)).map(|_| Node::vacant()).collect()
        };
        self.last_free = self.nodes.len();
        self.live_nodes = 0;
        for (k, v) in pairs {
            if let Value::Integer(i) = k {
                if i >= 1 && (i as usize) <= self.array.len() {
                    self.array[i as usize - 1] = v;
                    continue;
                }
            }
            self.new_key(k, v);
        }
    }

    /// A border: an index `n` with `t[n]` non-nil and `t[n+1]` nil (or 0
    /// for a table with no positive-integer keys). Discovered by search,
    /// not by a cached count, so any border is a valid answer.
    pub fn border(&self) -> i64 {
        let alen = self.array.len() as i64;
        if alen > 0 && self.array[alen as usize - 1].is_nil() {
            // Trailing nil in the array part: binary search inside it.
            let mut lo = 0i64; // t[lo] known non-nil (or lo==0)
            let mut hi = alen; // t[hi] known nil
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if self.array[mid as usize - 1].is_nil() {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            return lo;
        }
        if self.nodes.is_empty() {
            return alen;
        }
        // Doubling search above the array part, then binary search.
        let mut lo = alen.max(0);
        let mut hi = lo + 1;
        while !self.get_int(hi).is_nil() {
            lo = hi;
            if hi > i64::MAX / 2 {
                // Pathological table: fall back to a linear scan.
                let mut i = 1i64;
                while !self.get_int(i).is_nil() {
                    i += 1;
                }
                return i - 1;
            }
            hi *= 2;
        }
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if self.get_int(mid).is_nil() {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        lo
    }

    /// Stateless iteration. `next(nil)` starts the walk; feeding back the
    /// returned key visits each live pair exactly once, provided no rehash
    /// happens in between. Dead slots keep their key so a deleted entry's
    /// key remains a valid cursor.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, TableError> {
        let start = match key {
            Value::Nil => 0,
            _ => {
                let key = key.clone().normalize_key();
                if let Value::Integer(i) = key {
                    if i >= 1 && (i as usize) <= self.array.len() {
                        // Continue the array scan after index i.
                        return Ok(self.scan_from(i as usize));
                    }
                }
                match self.find_node(&key) {
                    Some(at) => return Ok(self.scan_nodes(at + 1)),
                    None => return Err(TableError::InvalidNext),
                }
            }
        };
        Ok(self.scan_from(start))
    }

    fn scan_from(&self, array_start: usize) -> Option<(Value, Value)> {
        for (i, v) in self.array.iter().enumerate().skip(array_start) {
            if !v.is_nil() {
                return Some((Value::Integer((i + 1) as i32), v.clone()));
            }
        }
        self.scan_nodes(0)
    }

    fn scan_nodes(&self, start: usize) -> Option<(Value, Value)> {
        for node in self.nodes.iter().skip(start) {
            if node.is_live() {
                let key = node.key.clone().expect("live node has a key");
                return Some((key, node.value.clone()));
            }
        }
        None
    }

    /// Live pair snapshot, in iteration order. The reachability walker and
    /// sort/concat builders use this so no lock is held while they work.
    pub fn pairs_snapshot(&self) -> Vec<(Value, Value)> {
        let mut out = Vec::with_capacity(self.array.len() + self.live_nodes);
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                out.push((Value::Integer((i + 1) as i32), v.clone()));
            }
        }
        for node in &self.nodes {
            if node.is_live() {
                let key = node.key.clone().expect("live node has a key");
                out.push((key, node.value.clone()));
            }
        }
        out
    }

    /// Number of live entries across both parts. Not the length operator.
    pub fn live_count(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count() + self.live_nodes
    }

    /// Forces a rehash. The collection entry point uses this to let weak
    /// tables shed dead entries without waiting for an organic rehash.
    pub fn compact(&mut self) {
        self.rehash(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(t: &mut Table, k: impl Into<Value>, v: impl Into<Value>) {
        t.set(k.into(), v.into()).unwrap();
    }

    #[test]
    fn array_part_round_trip() {
        let mut t = Table::new();
        for i in 1..=10 {
            set(&mut t, i, i * 100);
        }
        for i in 1..=10i32 {
            assert!(t.get(&Value::Integer(i)).raw_eq(&Value::Integer(i * 100)));
        }
        assert_eq!(t.border(), 10);
    }

    #[test]
    fn nil_assignment_removes() {
        let mut t = Table::new();
        set(&mut t, "k", 1);
        t.set(Value::from("k"), Value::Nil).unwrap();
        assert!(t.get(&Value::from("k")).is_nil());
        // Deletion is observable through iteration.
        let mut walk = t.next(&Value::Nil).unwrap();
        while let Some((k, _)) = walk {
            assert!(!k.raw_eq(&Value::from("k")));
            walk = t.next(&k).unwrap();
        }
    }

    #[test]
    fn nil_and_nan_keys_rejected() {
        let mut t = Table::new();
        assert_eq!(
            t.set(Value::Nil, Value::Integer(1)),
            Err(TableError::NilKey)
        );
        assert_eq!(
            t.set(Value::Number(f64::NAN), Value::Integer(1)),
            Err(TableError::NanKey)
        );
    }

    #[test]
    fn integral_double_keys_collapse() {
        let mut t = Table::new();
        set(&mut t, Value::Number(2.0), "two");
        assert!(t.get(&Value::Integer(2)).raw_eq(&Value::from("two")));
    }

    #[test]
    fn border_with_hole_is_some_border() {
        let mut t = Table::new();
        set(&mut t, 1, 10);
        set(&mut t, 2, 20);
        set(&mut t, 3, 30);
        t.set(Value::Integer(2), Value::Nil).unwrap();
        let n = t.border();
        assert!(n == 1 || n == 3, "got {n}");
    }

    #[test]
    fn border_empty_and_dense() {
        let t = Table::new();
        assert_eq!(t.border(), 0);
        let mut t = Table::new();
        set(&mut t, 1, 1);
        assert_eq!(t.border(), 1);
    }

    #[test]
    fn hash_part_collisions_chain() {
        let mut t = Table::new();
        for i in 0..64 {
            set(&mut t, format!("key-{i}"), i);
        }
        for i in 0..64 {
            let v = t.get(&Value::from(format!("key-{i}")));
            assert!(v.raw_eq(&Value::Integer(i)), "key-{i} -> {v:?}");
        }
    }

    #[test]
    fn iteration_visits_each_live_pair_once() {
        let mut t = Table::new();
        for i in 1..=5 {
            set(&mut t, i, i);
        }
        for i in 0..5 {
            set(&mut t, format!("s{i}"), i);
        }
        let mut seen = 0;
        let mut cursor = Value::Nil;
        while let Some((k, _)) = t.next(&cursor).unwrap() {
            seen += 1;
            cursor = k;
        }
        assert_eq!(seen, 10);
    }

    #[test]
    fn next_after_deleted_key_still_works() {
        let mut t = Table::new();
        set(&mut t, "a", 1);
        set(&mut t, "b", 2);
        set(&mut t, "c", 3);
        // Delete "b" and keep iterating from its key: the dead slot
        // retains the key as a cursor.
        t.set(Value::from("b"), Value::Nil).unwrap();
        assert!(t.next(&Value::from("b")).is_ok());
    }

    #[test]
    fn next_with_foreign_key_errors() {
        let t = Table::new();
        assert_eq!(
            t.next(&Value::from("ghost")),
            Err(TableError::InvalidNext)
        );
    }

    #[test]
    fn appends_migrate_from_hash() {
        let mut t = Table::new();
        // 2 and 3 land in the hash part while 1 is absent.
        set(&mut t, 2, 20);
        set(&mut t, 3, 30);
        set(&mut t, 1, 10);
        assert_eq!(t.border(), 3);
    }

    #[test]
    fn rehash_grows_array_for_integer_keys() {
        let mut t = Table::with_capacity(0, 1);
        for i in 1..=100 {
            set(&mut t, i, i);
        }
        assert_eq!(t.border(), 100);
        assert_eq!(t.live_count(), 100);
    }

    #[test]
    fn weak_values_dropped_at_rehash() {
        let mut t = Table::new();
        t.set_weak_mode(WeakMode {
            keys: false,
            values: true,
        });
        let dying = crate::value::new_table_value(Table::new());
        set(&mut t, "held", dying.clone());
        drop(dying);
        set(&mut t, "strong", 1);
        t.compact();
        assert!(t.get(&Value::from("held")).is_nil());
        assert!(t.get(&Value::from("strong")).raw_eq(&Value::Integer(1)));
    }
}
