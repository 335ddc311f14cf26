//! Per-sentence target tree
//!
//! An array-based flattening of one (possibly multi-rooted) dependency
//! structure. Rebuilt on every `reload`, with heights and descendant counts
//! precomputed bottom-up and a lock bitmap that enforces the injective
//! allocation discipline of the execution engine: a node allocated to one
//! matcher is invisible to every other matcher until released.

use thiserror::Error;

use crate::corpus::{HEAD_ROOT, HEAD_UNDEFINED, SentenceRecord};

/// A sentence record violated its own contract while the tree was rebuilt.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("head {head} of token {index} is outside the sentence (length {len})")]
    InvalidHead { index: usize, head: i32, len: usize },
}

/// Rooted tree view on one sentence's dependency data.
///
/// Navigation happens through a cursor (`view_node`, `view_child`,
/// `view_parent`); readers (`height`, `descendant_count`, `edge_count`,
/// annotation accessors) refer to the node under the cursor. Cursor misuse
/// is a caller bug and panics.
pub struct TargetTree<'a> {
    children: Vec<Vec<usize>>,
    node_locks: Vec<bool>,
    slot_locks: Vec<Vec<bool>>,
    heights: Vec<u32>,
    descendant_counts: Vec<u32>,
    roots: Vec<usize>,
    heads: Vec<i32>,
    size: usize,
    data: Option<&'a dyn SentenceRecord>,
    node_ptr: Option<usize>,
}

impl<'a> Default for TargetTree<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> TargetTree<'a> {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            node_locks: Vec::new(),
            slot_locks: Vec::new(),
            heights: Vec::new(),
            descendant_counts: Vec::new(),
            roots: Vec::new(),
            heads: Vec::new(),
            size: 0,
            data: None,
            node_ptr: None,
        }
    }

    /// Rebuild all derived structure for a new sentence. Runs in time
    /// proportional to the sentence length.
    ///
    /// A head of [`HEAD_UNDEFINED`] leaves the token dangling: it joins no
    /// child list but remains present for direct candidate search. Any
    /// other head outside the sentence is a record-contract violation.
    pub fn reload(&mut self, source: &'a dyn SentenceRecord) -> Result<(), TreeError> {
        let size = source.len();

        for i in 0..size {
            let head = source.head(i);
            if head != HEAD_ROOT && head != HEAD_UNDEFINED && (head < 0 || head as usize >= size) {
                return Err(TreeError::InvalidHead { index: i, head, len: size });
            }
        }

        self.size = size;
        self.data = Some(source);
        self.node_ptr = None;
        self.roots.clear();

        self.children.resize_with(size, Vec::new);
        self.slot_locks.resize_with(size, Vec::new);
        self.heads.resize(size, HEAD_UNDEFINED);
        self.node_locks.clear();
        self.node_locks.resize(size, false);
        self.heights.clear();
        self.heights.resize(size, 0);
        self.descendant_counts.clear();
        self.descendant_counts.resize(size, 0);
        for list in self.children.iter_mut().take(size) {
            list.clear();
        }

        for i in 0..size {
            let head = source.head(i);
            if head == HEAD_ROOT {
                self.roots.push(i);
            } else if head != HEAD_UNDEFINED {
                self.children[head as usize].push(i);
            }
            self.heads[i] = head;
        }

        for i in 0..size {
            self.slot_locks[i].clear();
            self.slot_locks[i].resize(self.children[i].len(), false);
        }

        // Tokens not reachable from any root (dangling heads and their
        // subtrees) keep height and descendant count zero.
        let roots = std::mem::take(&mut self.roots);
        for &root in &roots {
            self.prepare_descendants(root);
        }
        self.roots = roots;

        Ok(())
    }

    fn prepare_descendants(&mut self, index: usize) {
        let mut count = self.children[index].len() as u32;
        let mut depth = 0;

        for k in 0..self.children[index].len() {
            let child = self.children[index][k];
            self.prepare_descendants(child);
            count += self.descendant_counts[child];
            depth = depth.max(self.heights[child]);
        }

        self.descendant_counts[index] = count;
        self.heights[index] = depth + 1;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    fn cursor(&self) -> usize {
        self.node_ptr.expect("current scope is not on a node")
    }

    fn record(&self) -> &dyn SentenceRecord {
        self.data.expect("no sentence loaded")
    }

    // Cursor navigation

    pub fn view_node(&mut self, index: usize) {
        assert!(index < self.size, "node index out of bounds: {}", index);
        self.node_ptr = Some(index);
    }

    pub fn view_child(&mut self, index: usize) {
        let node = self.cursor();
        let list = &self.children[node];
        assert!(index < list.len(), "child index out of bounds: {}", index);
        self.node_ptr = Some(list[index]);
    }

    pub fn view_parent(&mut self) {
        let node = self.cursor();
        let head = self.heads[node];
        assert!(head >= 0, "current node has no parent");
        self.node_ptr = Some(head as usize);
    }

    pub fn node_index(&self) -> usize {
        self.cursor()
    }

    // Structure readers for the node under the cursor

    pub fn edge_count(&self) -> usize {
        self.children[self.cursor()].len()
    }

    pub fn height(&self) -> u32 {
        self.heights[self.cursor()]
    }

    pub fn descendant_count(&self) -> u32 {
        self.descendant_counts[self.cursor()]
    }

    pub fn is_root(&self) -> bool {
        self.heads[self.cursor()] == HEAD_ROOT
    }

    pub fn parent_index(&self) -> i32 {
        self.heads[self.cursor()]
    }

    pub fn child_at(&self, node: usize, index: usize) -> usize {
        self.children[node][index]
    }

    pub fn child_count_of(&self, node: usize) -> usize {
        self.children[node].len()
    }

    // Locking

    pub fn lock_node(&mut self, index: usize) {
        self.node_locks[index] = true;
    }

    /// Releases the node and, with it, all of its child-slot locks. This
    /// mirrors the engine's discipline of releasing a whole subtree scope
    /// together.
    pub fn unlock_node(&mut self, index: usize) {
        self.node_locks[index] = false;
        for slot in self.slot_locks[index].iter_mut() {
            *slot = false;
        }
    }

    pub fn is_node_locked(&self, index: usize) -> bool {
        self.node_locks[index]
    }

    pub fn lock_slot(&mut self, node: usize, slot: usize) {
        self.slot_locks[node][slot] = true;
    }

    pub fn unlock_slot(&mut self, node: usize, slot: usize) {
        self.slot_locks[node][slot] = false;
    }

    pub fn is_slot_locked(&self, node: usize, slot: usize) -> bool {
        self.slot_locks[node][slot]
    }

    pub fn unlock_all(&mut self) {
        for lock in self.node_locks.iter_mut() {
            *lock = false;
        }
        for slots in self.slot_locks.iter_mut() {
            for slot in slots.iter_mut() {
                *slot = false;
            }
        }
    }

    /// Clear the cursor and every lock, keeping the loaded sentence.
    pub fn reset(&mut self) {
        self.node_ptr = None;
        self.unlock_all();
    }

    // Annotation readers for the node under the cursor

    pub fn form(&self) -> &str {
        self.record().form(self.cursor())
    }

    pub fn pos(&self) -> &str {
        self.record().pos(self.cursor())
    }

    pub fn lemma(&self) -> &str {
        self.record().lemma(self.cursor())
    }

    pub fn features(&self) -> &str {
        self.record().features(self.cursor())
    }

    pub fn relation(&self) -> &str {
        self.record().relation(self.cursor())
    }

    /// Linear distance to the head, or [`HEAD_UNDEFINED`] for roots and
    /// dangling tokens.
    pub fn distance(&self) -> i32 {
        let node = self.cursor();
        let head = self.heads[node];
        if head < 0 {
            return HEAD_UNDEFINED;
        }
        (head - node as i32).abs()
    }

    pub fn is_flag_set(&self, flag: u64) -> bool {
        self.record().flags(self.cursor()) & flag == flag
    }
}
