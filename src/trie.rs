//! Byte-level trie for vocabulary prefix matching
//!
//! Fixed 256-way nodes stored in a flat `Vec`; child slots and terminal ids
//! use `i32` with `-1` as the empty sentinel to keep nodes `Copy`-free and
//! cache-friendly. The segmenter calls [`ByteTrie::matches_at`] once per
//! byte position, so matching allocates nothing and reuses a caller-owned
//! buffer.

/// One trie node: 256 child indices plus an optional terminal token id.
struct TrieNode {
    next: [i32; 256],
    token_id: i32,
}

impl TrieNode {
    fn new() -> Self {
        Self {
            next: [-1; 256],
            token_id: -1,
        }
    }
}

/// Byte trie over the vocabulary.
///
/// Every vocabulary piece is inserted byte-by-byte; a later insert of the
/// same byte string overwrites the terminal id, matching the
/// duplicates-overwrite rule of the vocabulary loader.
pub struct ByteTrie {
    nodes: Vec<TrieNode>,
}

impl Default for ByteTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteTrie {
    /// Create an empty trie with only the root node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::new()],
        }
    }

    /// Insert `token` with terminal id `token_id`, overwriting any previous
    /// terminal for the same byte string.
    pub fn insert(&mut self, token: &[u8], token_id: u32) {
        let mut node = 0usize;
        for &c in token {
            let slot = self.nodes[node].next[c as usize];
            let next = if slot < 0 {
                let idx = self.nodes.len();
                self.nodes[node].next[c as usize] = idx as i32;
                self.nodes.push(TrieNode::new());
                idx
            } else {
                slot as usize
            };
            node = next;
        }
        self.nodes[node].token_id = token_id as i32;
    }

    /// Collect every `(token_id, length_in_bytes)` whose piece is a prefix
    /// of `s[pos..]`.
    ///
    /// Results are pushed in increasing length order, which the segmenter's
    /// tie-break rule relies on. `out` is cleared first so callers can reuse
    /// one buffer across positions.
    pub fn matches_at(&self, s: &[u8], pos: usize, out: &mut Vec<(u32, usize)>) {
        out.clear();
        let mut node = 0usize;
        for (i, &c) in s.iter().enumerate().skip(pos) {
            let slot = self.nodes[node].next[c as usize];
            if slot < 0 {
                break;
            }
            node = slot as usize;
            let tid = self.nodes[node].token_id;
            if tid >= 0 {
                out.push((tid as u32, i + 1 - pos));
            }
        }
    }

    /// Number of nodes including the root. Useful for capacity diagnostics.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
