//! Search orchestrator
//!
//! A [`Search`] owns a compiled matcher plan and a corpus slice, drives
//! the execution engine across the sentences in order and collects the
//! 0-based indices of matching sentences. Instances are single-use:
//! `Blank -> Running -> Done` or `Cancelled`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::compiler::{CompileError, MatcherPlan, compile};
use crate::corpus::SentenceRecord;
use crate::engine::Engine;
use crate::graph::PatternGraph;
use crate::registry::ConstraintRegistry;
use crate::target::TargetTree;

/// How many hits a search reports per sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    /// One boolean answer per sentence, stop at the first match.
    #[default]
    Matches,
    /// Exhaustive: every independent match within a sentence is pursued.
    IndependentHits,
}

impl SearchMode {
    pub fn is_exhaustive(&self) -> bool {
        matches!(self, SearchMode::IndependentHits)
    }
}

/// Direction in which candidate indices are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    LeftToRight,
    RightToLeft,
}

/// Parameter set consumed by a [`Search`].
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub search_mode: SearchMode,
    pub orientation: Orientation,
    pub case_sensitive: bool,
    /// Reserved, no effect.
    pub optimize: bool,
    /// Stop after this many hits; 0 means unlimited.
    pub result_limit: usize,
    /// Sentences shorter than this are skipped.
    pub min_length: usize,
    /// Sentences longer than this are skipped; 0 means unbounded.
    pub max_length: usize,
    /// Reserved, no effect.
    pub non_projective: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            search_mode: SearchMode::Matches,
            orientation: Orientation::LeftToRight,
            case_sensitive: true,
            optimize: false,
            result_limit: 0,
            min_length: 0,
            max_length: 0,
            non_projective: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Blank,
    Running,
    Done,
    Cancelled,
}

/// Contract violations on the search lifecycle. These indicate a caller
/// bug, not a data problem, and are never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("illegal search state: {0}")]
    IllegalState(&'static str),
}

/// A sentence that could not be evaluated; the rest of the corpus scan is
/// unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceDiagnostic {
    pub index: usize,
    pub message: String,
}

struct SearchControl {
    state: Mutex<SearchState>,
    cancelled: AtomicBool,
}

impl SearchControl {
    fn begin(&self) -> Result<(), SearchError> {
        let mut state = self.state.lock().expect("search state lock");
        match *state {
            SearchState::Blank => {
                *state = SearchState::Running;
                Ok(())
            }
            _ => Err(SearchError::IllegalState("cannot reuse search instance")),
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock().expect("search state lock");
        if *state == SearchState::Running {
            *state = SearchState::Done;
        }
    }

    fn cancel(&self) -> Result<(), SearchError> {
        let mut state = self.state.lock().expect("search state lock");
        match *state {
            SearchState::Blank => Err(SearchError::IllegalState("search not started")),
            SearchState::Running => {
                self.cancelled.store(true, Ordering::SeqCst);
                *state = SearchState::Cancelled;
                Ok(())
            }
            SearchState::Cancelled => Err(SearchError::IllegalState("search already cancelled")),
            SearchState::Done => Err(SearchError::IllegalState("search not running")),
        }
    }

    fn state(&self) -> SearchState {
        *self.state.lock().expect("search state lock")
    }
}

/// Cloneable handle for cancelling a running search from another thread.
/// Cancellation is coarse-grained: it takes effect between sentences.
#[derive(Clone)]
pub struct SearchHandle {
    control: Arc<SearchControl>,
}

impl SearchHandle {
    pub fn cancel(&self) -> Result<(), SearchError> {
        self.control.cancel()
    }

    pub fn state(&self) -> SearchState {
        self.control.state()
    }
}

/// Single-use search run of one compiled pattern over one corpus.
pub struct Search<'c, S: SentenceRecord> {
    graph: PatternGraph,
    registry: &'c ConstraintRegistry,
    options: SearchOptions,
    corpus: &'c [S],
    plan: Option<MatcherPlan>,
    control: Arc<SearchControl>,
    hits: Vec<usize>,
    diagnostics: Vec<SentenceDiagnostic>,
    begin: Option<Instant>,
    end: Option<Instant>,
    progress: usize,
}

impl<'c, S: SentenceRecord> Search<'c, S> {
    pub fn new(
        graph: PatternGraph,
        registry: &'c ConstraintRegistry,
        options: SearchOptions,
        corpus: &'c [S],
    ) -> Self {
        Self {
            graph,
            registry,
            options,
            corpus,
            plan: None,
            control: Arc::new(SearchControl {
                state: Mutex::new(SearchState::Blank),
                cancelled: AtomicBool::new(false),
            }),
            hits: Vec::new(),
            diagnostics: Vec::new(),
            begin: None,
            end: None,
            progress: 0,
        }
    }

    /// Compile the pattern into a matcher plan. Must run before
    /// [`Search::execute`].
    pub fn init(&mut self) -> Result<(), CompileError> {
        self.plan = Some(compile(&self.graph, self.registry, &self.options)?);
        Ok(())
    }

    /// Handle for cancelling this search from another thread.
    pub fn handle(&self) -> SearchHandle {
        SearchHandle {
            control: self.control.clone(),
        }
    }

    pub fn cancel(&self) -> Result<(), SearchError> {
        self.control.cancel()
    }

    /// Scan the corpus. Each sentence is reloaded into the target tree and
    /// decided by the root matcher; a sentence violating the record
    /// contract is reported as a diagnostic and skipped, it never aborts
    /// the scan. The cancel flag is observed between sentences.
    pub fn execute(&mut self) -> Result<(), SearchError> {
        if self.plan.is_none() {
            return Err(SearchError::IllegalState("search not initialized"));
        }
        self.control.begin()?;
        self.begin = Some(Instant::now());

        let plan = self.plan.as_ref().expect("plan compiled in init");
        let engine = Engine::new(plan, &self.options);
        let corpus = self.corpus;
        let mut tree = TargetTree::new();

        for (index, sentence) in corpus.iter().enumerate() {
            if self.control.cancelled.load(Ordering::SeqCst) {
                break;
            }
            self.progress = index;

            let length = sentence.len();
            if length < self.options.min_length
                || (self.options.max_length > 0 && length > self.options.max_length)
            {
                continue;
            }

            if let Err(error) = tree.reload(sentence) {
                warn!(sentence = index, %error, "skipping sentence");
                self.diagnostics.push(SentenceDiagnostic {
                    index,
                    message: error.to_string(),
                });
                continue;
            }

            if engine.matches(&mut tree) {
                self.hits.push(index);
                if self.options.result_limit > 0 && self.hits.len() >= self.options.result_limit {
                    debug!(limit = self.options.result_limit, "result limit reached");
                    break;
                }
            }
        }
        self.progress = corpus.len();

        self.end = Some(Instant::now());
        self.control.finish();
        debug!(hits = self.hits.len(), sentences = corpus.len(), "search finished");
        Ok(())
    }

    /// Ordered list of 0-based sentence indices the pattern matched.
    pub fn hits(&self) -> &[usize] {
        &self.hits
    }

    pub fn diagnostics(&self) -> &[SentenceDiagnostic] {
        &self.diagnostics
    }

    pub fn state(&self) -> SearchState {
        self.control.state()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state(), SearchState::Done | SearchState::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        self.state() == SearchState::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == SearchState::Cancelled
    }

    /// Sentences examined so far.
    pub fn progress(&self) -> usize {
        self.progress
    }

    /// Wall-clock duration of the finished scan.
    pub fn duration(&self) -> Option<Duration> {
        match (self.begin, self.end) {
            (Some(begin), Some(end)) => Some(end.duration_since(begin)),
            _ => None,
        }
    }
}
