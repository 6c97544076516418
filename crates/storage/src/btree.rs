//! Disk-persistable B-tree used for secondary indexes.
//!
//! A classic B-tree of minimum degree `order` (every node except the root
//! holds between `order - 1` and `2 * order - 1` keys): split on overflow on
//! the way down during inserts, borrow-or-merge on underflow during erases.
//! `dump`/`load` write the whole tree with a signature header; indexes are
//! rebuilt from these dumps on open.

use tissdb_model::buffer::{self, BufReader, BufWriter, DecodeError};

/// Types that can be B-tree keys or values.
pub trait Codec: Sized {
    fn encode(&self, out: &mut Vec<u8>);
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError>;
}

impl Codec for String {
    fn encode(&self, out: &mut Vec<u8>) {
        buffer::put_str(out, self);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        buffer::get_str(buf)
    }
}

impl Codec for i64 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.put_i64(*self);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        buf.get_i64()
    }
}

impl Codec for Vec<String> {
    fn encode(&self, out: &mut Vec<u8>) {
        out.put_u32(self.len() as u32);
        for item in self {
            buffer::put_str(out, item);
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = buf.get_u32()? as usize;
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(buffer::get_str(buf)?);
        }
        Ok(items)
    }
}

const SIGNATURE: &[u8; 5] = b"LYCBP";
pub const DEFAULT_ORDER: usize = 10;

#[derive(Debug)]
struct Node<K, V> {
    leaf: bool,
    keys: Vec<K>,
    values: Vec<V>,
    children: Vec<Box<Node<K, V>>>,
}

impl<K, V> Node<K, V> {
    fn new(leaf: bool) -> Self {
        Self {
            leaf,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct BTree<K, V> {
    root: Box<Node<K, V>>,
    order: usize,
    len: usize,
}

impl<K: Ord + Clone + Codec, V: Clone + Codec> BTree<K, V> {
    /// `order` is the minimum degree and must be at least 2.
    pub fn new(order: usize) -> Self {
        assert!(order >= 2, "B-tree order must be at least 2");
        Self {
            root: Box::new(Node::new(true)),
            order,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn order(&self) -> usize {
        self.order
    }

    fn max_keys(&self) -> usize {
        2 * self.order - 1
    }

    /// Insert `key`, replacing any existing value for it.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(slot) = Self::find_mut_in(&mut self.root, &key) {
            *slot = value;
            return;
        }
        let order = self.order;
        if self.root.keys.len() == self.max_keys() {
            let old_root = std::mem::replace(&mut self.root, Box::new(Node::new(false)));
            self.root.children.push(old_root);
            split_child_of(&mut self.root, 0, order);
        }
        let mut node = &mut self.root;
        loop {
            let idx = node.keys.partition_point(|k| *k < key);
            if node.leaf {
                node.keys.insert(idx, key);
                node.values.insert(idx, value);
                self.len += 1;
                return;
            }
            if node.children[idx].keys.len() == 2 * order - 1 {
                split_child_of(node, idx, order);
                // The separator moved up; re-pick the side to descend into.
                let idx = node.keys.partition_point(|k| *k < key);
                node = &mut node.children[idx];
            } else {
                node = &mut node.children[idx];
            }
        }
    }

    pub fn find(&self, key: &K) -> Option<&V> {
        let mut node = &self.root;
        loop {
            let idx = node.keys.partition_point(|k| k < key);
            if idx < node.keys.len() && node.keys[idx] == *key {
                return Some(&node.values[idx]);
            }
            if node.leaf {
                return None;
            }
            node = &node.children[idx];
        }
    }

    fn find_mut_in<'a>(node: &'a mut Node<K, V>, key: &K) -> Option<&'a mut V> {
        let idx = node.keys.partition_point(|k| k < key);
        if idx < node.keys.len() && node.keys[idx] == *key {
            return Some(&mut node.values[idx]);
        }
        if node.leaf {
            return None;
        }
        Self::find_mut_in(&mut node.children[idx], key)
    }

    /// Remove `key`; returns whether it was present.
    pub fn erase(&mut self, key: &K) -> bool {
        if self.find(key).is_none() {
            return false;
        }
        let order = self.order;
        erase_from(&mut self.root, key, order);
        if !self.root.leaf && self.root.keys.is_empty() {
            self.root = self.root.children.remove(0);
        }
        self.len -= 1;
        true
    }

    /// All `(key, value)` pairs with `lo <= key <= hi`, in key order.
    pub fn find_range(&self, lo: &K, hi: &K) -> Vec<(K, V)> {
        let mut out = Vec::new();
        range_from(&self.root, lo, hi, &mut out);
        out
    }

    /// In-order traversal over every entry.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for_each_from(&self.root, &mut f);
    }

    /// Serialize the whole tree.
    pub fn dump(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_slice(SIGNATURE);
        out.put_u16(self.order as u16);
        out.put_u64(self.len as u64);
        dump_node(&self.root, &mut out);
        out
    }

    /// Rebuild a tree from [`BTree::dump`] output.
    pub fn load(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = bytes;
        let sig = buf.get_slice(SIGNATURE.len())?;
        if sig != SIGNATURE {
            return Err(DecodeError::BadSignature { kind: "btree" });
        }
        let order = buf.get_u16()? as usize;
        if order < 2 {
            return Err(DecodeError::InvalidTag {
                tag: order as u8,
                kind: "btree order",
            });
        }
        let len = buf.get_u64()? as usize;
        let root = load_node(&mut buf)?;
        Ok(Self { root, order, len })
    }
}

fn split_child_of<K: Ord + Clone, V: Clone>(parent: &mut Node<K, V>, idx: usize, order: usize) {
    let child = &mut parent.children[idx];
    let mut right = Box::new(Node::new(child.leaf));

    // Keys/values past the median move to the new right sibling; the median
    // itself moves up into the parent.
    right.keys = child.keys.split_off(order);
    right.values = child.values.split_off(order);
    let sep_key = child.keys.pop().expect("split of a full node");
    let sep_value = child.values.pop().expect("split of a full node");
    if !child.leaf {
        right.children = child.children.split_off(order);
    }

    parent.keys.insert(idx, sep_key);
    parent.values.insert(idx, sep_value);
    parent.children.insert(idx + 1, right);
}

fn erase_from<K: Ord + Clone, V: Clone>(node: &mut Node<K, V>, key: &K, order: usize) {
    let idx = node.keys.partition_point(|k| k < key);

    if idx < node.keys.len() && node.keys[idx] == *key {
        if node.leaf {
            node.keys.remove(idx);
            node.values.remove(idx);
            return;
        }
        if node.children[idx].keys.len() >= order {
            let (pk, pv) = {
                let (k, v) = rightmost(&node.children[idx]);
                (k.clone(), v.clone())
            };
            node.keys[idx] = pk.clone();
            node.values[idx] = pv;
            erase_from(&mut node.children[idx], &pk, order);
        } else if node.children[idx + 1].keys.len() >= order {
            let (sk, sv) = {
                let (k, v) = leftmost(&node.children[idx + 1]);
                (k.clone(), v.clone())
            };
            node.keys[idx] = sk.clone();
            node.values[idx] = sv;
            erase_from(&mut node.children[idx + 1], &sk, order);
        } else {
            merge_children(node, idx);
            erase_from(&mut node.children[idx], key, order);
        }
        return;
    }

    if node.leaf {
        // Not present; erase() pre-checks, so this is unreachable in
        // practice but harmless.
        return;
    }

    let was_last = idx == node.keys.len();
    if node.children[idx].keys.len() < order {
        fill_child(node, idx, order);
    }
    // A merge of the last child shifts our target one slot left.
    let idx = if was_last && idx > node.keys.len() { idx - 1 } else { idx };
    erase_from(&mut node.children[idx], key, order);
}

fn rightmost<K, V>(node: &Node<K, V>) -> (&K, &V) {
    let mut node = node;
    while !node.leaf {
        node = node.children.last().expect("internal node has children");
    }
    (
        node.keys.last().expect("leaf on erase path is non-empty"),
        node.values.last().expect("leaf on erase path is non-empty"),
    )
}

fn leftmost<K, V>(node: &Node<K, V>) -> (&K, &V) {
    let mut node = node;
    while !node.leaf {
        node = &node.children[0];
    }
    (&node.keys[0], &node.values[0])
}

fn fill_child<K: Ord + Clone, V: Clone>(node: &mut Node<K, V>, idx: usize, order: usize) {
    if idx > 0 && node.children[idx - 1].keys.len() >= order {
        borrow_from_prev(node, idx);
    } else if idx < node.children.len() - 1 && node.children[idx + 1].keys.len() >= order {
        borrow_from_next(node, idx);
    } else if idx < node.children.len() - 1 {
        merge_children(node, idx);
    } else {
        merge_children(node, idx - 1);
    }
}

fn borrow_from_prev<K: Ord + Clone, V: Clone>(node: &mut Node<K, V>, idx: usize) {
    let (prev_key, prev_value, moved_child) = {
        let prev = &mut node.children[idx - 1];
        let k = prev.keys.pop().expect("borrow source is non-minimal");
        let v = prev.values.pop().expect("borrow source is non-minimal");
        let child = if prev.leaf { None } else { prev.children.pop() };
        (k, v, child)
    };

    let parent_key = std::mem::replace(&mut node.keys[idx - 1], prev_key);
    let parent_value = std::mem::replace(&mut node.values[idx - 1], prev_value);

    let child = &mut node.children[idx];
    child.keys.insert(0, parent_key);
    child.values.insert(0, parent_value);
    if let Some(grand) = moved_child {
        child.children.insert(0, grand);
    }
}

fn borrow_from_next<K: Ord + Clone, V: Clone>(node: &mut Node<K, V>, idx: usize) {
    let (next_key, next_value, moved_child) = {
        let next = &mut node.children[idx + 1];
        let k = next.keys.remove(0);
        let v = next.values.remove(0);
        let child = if next.leaf { None } else { Some(next.children.remove(0)) };
        (k, v, child)
    };

    let parent_key = std::mem::replace(&mut node.keys[idx], next_key);
    let parent_value = std::mem::replace(&mut node.values[idx], next_value);

    let child = &mut node.children[idx];
    child.keys.push(parent_key);
    child.values.push(parent_value);
    if let Some(grand) = moved_child {
        child.children.push(grand);
    }
}

/// Merge `children[idx + 1]` and the separator at `idx` into `children[idx]`.
fn merge_children<K: Ord + Clone, V: Clone>(node: &mut Node<K, V>, idx: usize) {
    let sep_key = node.keys.remove(idx);
    let sep_value = node.values.remove(idx);
    let mut right = node.children.remove(idx + 1);

    let left = &mut node.children[idx];
    left.keys.push(sep_key);
    left.values.push(sep_value);
    left.keys.append(&mut right.keys);
    left.values.append(&mut right.values);
    left.children.append(&mut right.children);
}

fn range_from<K: Ord + Clone, V: Clone>(node: &Node<K, V>, lo: &K, hi: &K, out: &mut Vec<(K, V)>) {
    let mut i = node.keys.partition_point(|k| k < lo);
    if !node.leaf {
        range_from(&node.children[i], lo, hi, out);
    }
    while i < node.keys.len() && node.keys[i] <= *hi {
        out.push((node.keys[i].clone(), node.values[i].clone()));
        if !node.leaf {
            range_from(&node.children[i + 1], lo, hi, out);
        }
        i += 1;
    }
}

fn for_each_from<K, V>(node: &Node<K, V>, f: &mut impl FnMut(&K, &V)) {
    for i in 0..node.keys.len() {
        if !node.leaf {
            for_each_from(&node.children[i], f);
        }
        f(&node.keys[i], &node.values[i]);
    }
    if !node.leaf {
        for_each_from(node.children.last().expect("internal node has children"), f);
    }
}

fn dump_node<K: Codec, V: Codec>(node: &Node<K, V>, out: &mut Vec<u8>) {
    out.put_u8(node.leaf as u8);
    out.put_u16(node.keys.len() as u16);
    for key in &node.keys {
        key.encode(out);
    }
    for value in &node.values {
        value.encode(out);
    }
    if !node.leaf {
        for child in &node.children {
            dump_node(child, out);
        }
    }
}

fn load_node<K: Codec, V: Codec>(buf: &mut &[u8]) -> Result<Box<Node<K, V>>, DecodeError> {
    let leaf = buf.get_u8()? != 0;
    let key_count = buf.get_u16()? as usize;
    let mut node = Node::new(leaf);
    node.keys.reserve(key_count);
    node.values.reserve(key_count);
    for _ in 0..key_count {
        node.keys.push(K::decode(buf)?);
    }
    for _ in 0..key_count {
        node.values.push(V::decode(buf)?);
    }
    if !leaf {
        node.children.reserve(key_count + 1);
        for _ in 0..key_count + 1 {
            node.children.push(load_node(buf)?);
        }
    }
    Ok(Box::new(node))
}
