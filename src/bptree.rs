use crate::rid::Rid;

/// Arena B+-tree keyed by column value. Nodes live in a `Vec` and every
/// link (children, parents, the leaf forward chain) is an index into it,
/// so the tree is plain owned data with no reference cycles.
///
/// Leaves keep a bucket of RIDs per key in insertion order; point queries
/// want the latest insert, range queries walk the forward-linked leaves.
/// Deletion removes keys but performs no rebalancing.
#[derive(Debug)]
pub struct BPlusTree {
    nodes: Vec<Node>,
    root: usize,
    fanout: usize,
}

#[derive(Debug)]
struct Node {
    keys: Vec<i64>,
    parent: Option<usize>,
    kind: NodeKind,
}

#[derive(Debug)]
enum NodeKind {
    Internal { children: Vec<usize> },
    Leaf { buckets: Vec<Vec<Rid>>, next: Option<usize> },
}

impl Node {
    fn new_leaf() -> Node {
        Node {
            keys: Vec::new(),
            parent: None,
            kind: NodeKind::Leaf {
                buckets: Vec::new(),
                next: None,
            },
        }
    }
}

impl BPlusTree {
    /// `fanout` is the maximum number of keys per node.
    pub fn new(fanout: usize) -> BPlusTree {
        BPlusTree {
            nodes: vec![Node::new_leaf()],
            root: 0,
            fanout: fanout.max(3),
        }
    }

    /// Leaf that does (or would) contain `key`.
    fn find_leaf(&self, key: i64) -> usize {
        let mut idx = self.root;
        loop {
            match &self.nodes[idx].kind {
                NodeKind::Leaf { .. } => return idx,
                NodeKind::Internal { children } => {
                    // Equal keys descend right, matching the split rule.
                    let slot = self.nodes[idx].keys.partition_point(|k| key >= *k);
                    idx = children[slot];
                }
            }
        }
    }

    pub fn insert(&mut self, key: i64, rid: Rid) {
        let leaf = self.find_leaf(key);

        let pos = match self.nodes[leaf].keys.binary_search(&key) {
            Ok(pos) => {
                if let NodeKind::Leaf { buckets, .. } = &mut self.nodes[leaf].kind {
                    buckets[pos].push(rid);
                }
                return;
            }
            Err(pos) => pos,
        };

        self.nodes[leaf].keys.insert(pos, key);
        if let NodeKind::Leaf { buckets, .. } = &mut self.nodes[leaf].kind {
            buckets.insert(pos, vec![rid]);
        }

        if self.nodes[leaf].keys.len() > self.fanout {
            self.split(leaf);
        }
    }

    fn split(&mut self, idx: usize) {
        let mid = self.nodes[idx].keys.len() / 2;
        let right_idx = self.nodes.len();
        let parent = self.nodes[idx].parent;

        let is_leaf = matches!(self.nodes[idx].kind, NodeKind::Leaf { .. });

        let (separator, right) = if is_leaf {
            let right_keys = self.nodes[idx].keys.split_off(mid);
            let separator = right_keys[0];

            let NodeKind::Leaf { buckets, next } = &mut self.nodes[idx].kind else {
                unreachable!()
            };
            let right_buckets = buckets.split_off(mid);
            let right_next = next.take();
            *next = Some(right_idx);

            (
                separator,
                Node {
                    keys: right_keys,
                    parent,
                    kind: NodeKind::Leaf {
                        buckets: right_buckets,
                        next: right_next,
                    },
                },
            )
        } else {
            // The separator moves up; the halves keep keys on either side.
            let separator = self.nodes[idx].keys[mid];
            let right_keys = self.nodes[idx].keys.split_off(mid + 1);
            self.nodes[idx].keys.pop();

            let NodeKind::Internal { children } = &mut self.nodes[idx].kind else {
                unreachable!()
            };
            let right_children = children.split_off(mid + 1);

            (
                separator,
                Node {
                    keys: right_keys,
                    parent,
                    kind: NodeKind::Internal {
                        children: right_children,
                    },
                },
            )
        };

        self.nodes.push(right);
        let moved: Vec<usize> = match &self.nodes[right_idx].kind {
            NodeKind::Internal { children } => children.clone(),
            NodeKind::Leaf { .. } => Vec::new(),
        };
        for child in moved {
            self.nodes[child].parent = Some(right_idx);
        }

        match parent {
            None => {
                // First split of the root: grow the tree by one level.
                let new_root = self.nodes.len();
                self.nodes.push(Node {
                    keys: vec![separator],
                    parent: None,
                    kind: NodeKind::Internal {
                        children: vec![idx, right_idx],
                    },
                });
                self.nodes[idx].parent = Some(new_root);
                self.nodes[right_idx].parent = Some(new_root);
                self.root = new_root;
            }
            Some(parent_idx) => {
                self.insert_at_parent(parent_idx, separator, right_idx);
            }
        }
    }

    fn insert_at_parent(&mut self, parent_idx: usize, separator: i64, child: usize) {
        let pos = self.nodes[parent_idx]
            .keys
            .partition_point(|k| separator >= *k);
        self.nodes[parent_idx].keys.insert(pos, separator);
        if let NodeKind::Internal { children } = &mut self.nodes[parent_idx].kind {
            children.insert(pos + 1, child);
        }
        self.nodes[child].parent = Some(parent_idx);

        if self.nodes[parent_idx].keys.len() > self.fanout {
            self.split(parent_idx);
        }
    }

    /// Bucket for a key, newest insert last.
    pub fn get(&self, key: i64) -> Option<&[Rid]> {
        let leaf = self.find_leaf(key);
        let pos = self.nodes[leaf].keys.binary_search(&key).ok()?;
        match &self.nodes[leaf].kind {
            NodeKind::Leaf { buckets, .. } => Some(&buckets[pos]),
            NodeKind::Internal { .. } => None,
        }
    }

    /// `(key, bucket)` pairs with keys in `[lo, hi]`, by leaf traversal.
    pub fn range(&self, lo: i64, hi: i64) -> Vec<(i64, &[Rid])> {
        let mut out = Vec::new();
        let mut leaf = Some(self.find_leaf(lo));

        while let Some(idx) = leaf {
            let NodeKind::Leaf { buckets, next } = &self.nodes[idx].kind else {
                break;
            };

            for (pos, key) in self.nodes[idx].keys.iter().enumerate() {
                if *key > hi {
                    return out;
                }
                if *key >= lo {
                    out.push((*key, buckets[pos].as_slice()));
                }
            }
            leaf = *next;
        }

        out
    }

    /// Remove one occurrence of `(key, rid)`. The key disappears when its
    /// bucket empties; the tree shape is left alone.
    pub fn delete(&mut self, key: i64, rid: Rid) {
        let leaf = self.find_leaf(key);
        let Ok(pos) = self.nodes[leaf].keys.binary_search(&key) else {
            return;
        };

        let NodeKind::Leaf { buckets, .. } = &mut self.nodes[leaf].kind else {
            return;
        };

        if let Some(at) = buckets[pos].iter().position(|r| *r == rid) {
            buckets[pos].remove(at);
        }
        if buckets[pos].is_empty() {
            buckets.remove(pos);
            self.nodes[leaf].keys.remove(pos);
        }
    }

    /// Every `(key, rid)` pair in key order, full buckets.
    pub fn scan_all(&self) -> Vec<(i64, Rid)> {
        let mut out = Vec::new();

        // Leftmost leaf, then the forward chain.
        let mut idx = self.root;
        while let NodeKind::Internal { children } = &self.nodes[idx].kind {
            idx = children[0];
        }

        let mut leaf = Some(idx);
        while let Some(idx) = leaf {
            let NodeKind::Leaf { buckets, next } = &self.nodes[idx].kind else {
                break;
            };
            for (pos, key) in self.nodes[idx].keys.iter().enumerate() {
                for rid in &buckets[pos] {
                    out.push((*key, *rid));
                }
            }
            leaf = *next;
        }

        out
    }

    pub fn clear(&mut self) {
        *self = BPlusTree::new(self.fanout);
    }
}
