//! Sentence records consumed by the search engine
//!
//! The engine never parses corpus files itself; an external loader produces
//! per-sentence records exposing word-level annotations through the
//! [`SentenceRecord`] capability. [`Sentence`] is the bundled
//! implementation, with annotation strings interned through a shared
//! [`lasso::ThreadedRodeo`] since tag sets repeat heavily across a corpus.

use std::sync::Arc;

use lasso::{Spur, ThreadedRodeo};

/// Head value marking a token as a root of its sentence.
pub const HEAD_ROOT: i32 = -1;

/// Head value for a token with no edge at all: not a root, just dangling.
/// Tolerated by the engine, the token stays visible to direct candidate
/// search but joins no child list.
pub const HEAD_UNDEFINED: i32 = -2;

/// Flag bit consumed by the bundled projectivity constraint.
pub const FLAG_PROJECTIVE: u64 = 1 << 0;

/// Per-sentence dependency structure as the engine consumes it.
///
/// `head(i)` is 0-based, [`HEAD_ROOT`] for roots, [`HEAD_UNDEFINED`] for
/// dangling tokens. The `flags` bitset is opaque to the core and only
/// interpreted by constraint capabilities.
pub trait SentenceRecord {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn head(&self, index: usize) -> i32;
    fn form(&self, index: usize) -> &str;
    fn pos(&self, index: usize) -> &str;
    fn lemma(&self, index: usize) -> &str;
    fn features(&self, index: usize) -> &str;
    fn relation(&self, index: usize) -> &str;
    fn flags(&self, index: usize) -> u64;
}

/// Owned sentence record with interned annotation strings.
#[derive(Clone)]
pub struct Sentence {
    strings: Arc<ThreadedRodeo>,
    forms: Vec<Spur>,
    heads: Vec<i32>,
    pos: Vec<Spur>,
    lemmas: Vec<Spur>,
    features: Vec<Spur>,
    relations: Vec<Spur>,
    flags: Vec<u64>,
}

impl Sentence {
    /// Build a sentence from forms and 0-based heads. All other annotation
    /// layers default to empty and can be filled with the `with_*` methods.
    pub fn new(forms: &[&str], heads: &[i32]) -> Self {
        Self::with_interner(forms, heads, Arc::new(ThreadedRodeo::default()))
    }

    /// Like [`Sentence::new`] but sharing an interner across sentences.
    pub fn with_interner(forms: &[&str], heads: &[i32], strings: Arc<ThreadedRodeo>) -> Self {
        assert_eq!(forms.len(), heads.len(), "form/head layers differ in length");

        let empty = strings.get_or_intern_static("");
        let forms = forms.iter().map(|f| strings.get_or_intern(f)).collect();
        Self {
            forms,
            heads: heads.to_vec(),
            pos: vec![empty; heads.len()],
            lemmas: vec![empty; heads.len()],
            features: vec![empty; heads.len()],
            relations: vec![empty; heads.len()],
            flags: vec![0; heads.len()],
            strings,
        }
    }

    pub fn with_pos(mut self, pos: &[&str]) -> Self {
        self.pos = self.intern_layer(pos);
        self
    }

    pub fn with_lemmas(mut self, lemmas: &[&str]) -> Self {
        self.lemmas = self.intern_layer(lemmas);
        self
    }

    pub fn with_features(mut self, features: &[&str]) -> Self {
        self.features = self.intern_layer(features);
        self
    }

    pub fn with_relations(mut self, relations: &[&str]) -> Self {
        self.relations = self.intern_layer(relations);
        self
    }

    pub fn with_flags(mut self, flags: &[u64]) -> Self {
        assert_eq!(flags.len(), self.heads.len(), "flag layer differs in length");
        self.flags = flags.to_vec();
        self
    }

    fn intern_layer(&self, layer: &[&str]) -> Vec<Spur> {
        assert_eq!(layer.len(), self.heads.len(), "annotation layer differs in length");
        layer.iter().map(|s| self.strings.get_or_intern(s)).collect()
    }
}

impl std::fmt::Debug for Sentence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let forms: Vec<&str> = (0..self.len()).map(|i| self.form(i)).collect();
        f.debug_struct("Sentence")
            .field("forms", &forms)
            .field("heads", &self.heads)
            .finish()
    }
}

impl SentenceRecord for Sentence {
    fn len(&self) -> usize {
        self.heads.len()
    }

    fn head(&self, index: usize) -> i32 {
        self.heads[index]
    }

    fn form(&self, index: usize) -> &str {
        self.strings.resolve(&self.forms[index])
    }

    fn pos(&self, index: usize) -> &str {
        self.strings.resolve(&self.pos[index])
    }

    fn lemma(&self, index: usize) -> &str {
        self.strings.resolve(&self.lemmas[index])
    }

    fn features(&self, index: usize) -> &str {
        self.strings.resolve(&self.features[index])
    }

    fn relation(&self, index: usize) -> &str {
        self.strings.resolve(&self.relations[index])
    }

    fn flags(&self, index: usize) -> u64 {
        self.flags[index]
    }
}
