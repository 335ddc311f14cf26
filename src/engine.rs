//! Matcher execution engine
//!
//! Walks a compiled [`MatcherPlan`] against a [`TargetTree`] by
//! backtracking search. Every matcher tries the candidates of its index
//! space in orientation order, allocates (locks) a candidate, lets its
//! exclusions try to falsify it, recurses into its continuation and always
//! releases the allocation before moving on. Allocations are kept in
//! per-execution state so the plan itself stays immutable and one plan
//! could serve many sequential runs.

use tracing::trace;

use crate::compiler::{Matcher, MatcherId, MatcherKind, MatcherPlan};
use crate::graph::{NodeId, NodeType};
use crate::search::{Orientation, SearchOptions};
use crate::target::TargetTree;

/// The committed binding of pattern nodes to token indices for one
/// accepted match. Empty for plans that succeed without allocating
/// (pure-negation patterns).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchBinding {
    entries: Vec<(NodeId, usize)>,
}

impl MatchBinding {
    pub fn entries(&self) -> &[(NodeId, usize)] {
        &self.entries
    }

    pub fn token_of(&self, node: NodeId) -> Option<usize> {
        self.entries
            .iter()
            .find(|(n, _)| *n == node)
            .map(|(_, token)| *token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Executes one compiled plan against target trees.
pub struct Engine<'p> {
    plan: &'p MatcherPlan,
    exhaustive: bool,
    left_to_right: bool,
}

impl<'p> Engine<'p> {
    pub fn new(plan: &'p MatcherPlan, options: &SearchOptions) -> Self {
        Self {
            plan,
            exhaustive: options.search_mode.is_exhaustive(),
            left_to_right: options.orientation == Orientation::LeftToRight,
        }
    }

    /// Decide whether the pattern occurs in the tree.
    pub fn matches(&self, tree: &mut TargetTree) -> bool {
        self.run(tree).0
    }

    /// Like [`Engine::matches`], returning the first committed binding.
    pub fn find(&self, tree: &mut TargetTree) -> Option<MatchBinding> {
        self.run(tree).1.into_iter().next()
    }

    /// Every committed binding; more than one only in exhaustive mode.
    pub fn find_all(&self, tree: &mut TargetTree) -> Vec<MatchBinding> {
        self.run(tree).1
    }

    fn run(&self, tree: &mut TargetTree) -> (bool, Vec<MatchBinding>) {
        let mut execution = Execution {
            plan: self.plan,
            tree,
            alloc: vec![None; self.plan.len()],
            hits: Vec::new(),
            exhaustive: self.exhaustive,
            left_to_right: self.left_to_right,
        };
        let matched = execution.matches(self.plan.root());
        (matched, execution.hits)
    }
}

struct Execution<'p, 't, 'a> {
    plan: &'p MatcherPlan,
    tree: &'t mut TargetTree<'a>,
    alloc: Vec<Option<usize>>,
    hits: Vec<MatchBinding>,
    exhaustive: bool,
    left_to_right: bool,
}

impl<'p> Execution<'p, '_, '_> {
    fn matcher(&self, m: MatcherId) -> &'p Matcher {
        self.plan.matcher(m)
    }

    fn matches(&mut self, m: MatcherId) -> bool {
        match self.matcher(m).kind {
            MatcherKind::Root => self.match_root(m),
            MatcherKind::Plain => self.match_plain(m),
            MatcherKind::Transitive => self.match_transitive(m),
            MatcherKind::Disjunction => self.match_disjunction(m),
            MatcherKind::Proxy => self.match_proxy(m),
        }
    }

    /// Allocation a matcher is bound to, resolving through matchers that
    /// never allocate themselves.
    fn allocation_of(&self, m: MatcherId) -> Option<usize> {
        match self.matcher(m).kind {
            MatcherKind::Proxy => None,
            MatcherKind::Disjunction => {
                self.matcher(m).parent.and_then(|p| self.allocation_of(p))
            }
            _ => self.alloc[m],
        }
    }

    /// Candidate search over the children of the parent's allocation.
    fn match_plain(&mut self, m: MatcherId) -> bool {
        let matcher = self.matcher(m);
        let parent = matcher.parent.expect("non-root matcher has a parent");
        let parent_alloc = self
            .allocation_of(parent)
            .expect("parent is allocated during child search");

        self.tree.view_node(parent_alloc);
        let count = self.tree.edge_count();

        let mut matched = false;
        for k in 0..count {
            let slot = if self.left_to_right { k } else { count - 1 - k };
            self.tree.view_node(parent_alloc);
            self.tree.view_child(slot);

            if !self.admissible(m) {
                continue;
            }
            matched |= self.try_candidate(m, self.tree.node_index());

            if matched && (matcher.exclusion_member || !self.exhaustive) {
                break;
            }
        }

        // Return scope to the parent node.
        self.tree.view_node(parent_alloc);

        if !matched || self.exhaustive {
            if let Some(alternate) = matcher.alternate {
                matched |= self.matches(alternate);
            }
        }

        matched
    }

    /// Candidate search over the entire token range.
    fn match_root(&mut self, m: MatcherId) -> bool {
        let matcher = self.matcher(m);
        let count = self.tree.size();

        let mut matched = false;
        for k in 0..count {
            let index = if self.left_to_right { k } else { count - 1 - k };
            self.tree.view_node(index);

            if !self.admissible(m) {
                continue;
            }
            matched |= self.try_candidate(m, index);

            if matched && (matcher.exclusion_member || !self.exhaustive) {
                break;
            }
        }

        if !matched || self.exhaustive {
            if let Some(alternate) = matcher.alternate {
                matched |= self.matches(alternate);
            }
        }

        matched
    }

    /// Candidate search over the full descendant set of the parent's
    /// allocation, depth-first, with path nodes locked during descent.
    fn match_transitive(&mut self, m: MatcherId) -> bool {
        let matcher = self.matcher(m);
        let parent = matcher.parent.expect("non-root matcher has a parent");
        let parent_alloc = self
            .allocation_of(parent)
            .expect("parent is allocated during descendant search");

        let mut matched = false;
        self.transitive_search(m, parent_alloc, &mut matched);
        self.tree.view_node(parent_alloc);

        if !matched || self.exhaustive {
            if let Some(alternate) = matcher.alternate {
                matched |= self.matches(alternate);
            }
        }

        matched
    }

    fn transitive_search(&mut self, m: MatcherId, index: usize, matched: &mut bool) {
        let matcher = self.matcher(m);

        self.tree.view_node(index);
        let count = self.tree.edge_count();
        if count == 0 {
            return;
        }

        for k in 0..count {
            let slot = if self.left_to_right { k } else { count - 1 - k };
            self.tree.view_node(index);
            self.tree.view_child(slot);

            if !self.admissible(m) {
                continue;
            }
            *matched |= self.try_candidate(m, self.tree.node_index());

            if *matched && (matcher.exclusion_member || !self.exhaustive) {
                return;
            }
        }

        // Descend with the expansion node locked so deeper candidate
        // searches cannot allocate a node on the current path.
        self.tree.lock_node(index);
        for k in 0..count {
            let slot = if self.left_to_right { k } else { count - 1 - k };
            let child = self.tree.child_at(index, slot);
            self.transitive_search(m, child, matched);
            if *matched && (matcher.exclusion_member || !self.exhaustive) {
                break;
            }
        }
        self.tree.unlock_node(index);
    }

    /// Success is the OR over the option branches, tried against the same
    /// starting allocation; exclusions are inverted to realize negated
    /// disjunction semantics.
    fn match_disjunction(&mut self, m: MatcherId) -> bool {
        let matcher = self.matcher(m);

        let mut matched = self.matches_inverted_exclusions(m);
        if matched {
            matched = self.matches_next(m);
        }

        if !matcher.options.is_empty() && (!matched || self.exhaustive) {
            for &option in &matcher.options {
                matched |= self.matches(option);
                if matched && !self.exhaustive {
                    break;
                }
            }
        }

        matched
    }

    /// Never allocates; carries root-level exclusions and the chain to the
    /// unnegated part of the plan.
    fn match_proxy(&mut self, m: MatcherId) -> bool {
        let matcher = self.matcher(m);

        if !self.matches_exclusions(m) {
            match matcher.next {
                Some(next) => self.matches(next),
                None => true,
            }
        } else if let Some(alternate) = matcher.alternate {
            self.matches(alternate)
        } else {
            false
        }
    }

    /// All skip conditions for the candidate under the cursor: allocation
    /// lock, precedence legality, node type, structural thresholds and the
    /// bound constraints.
    fn admissible(&self, m: MatcherId) -> bool {
        let candidate = self.tree.node_index();
        if self.tree.is_node_locked(candidate) {
            return false;
        }
        if !self.is_legal_index(m, candidate) {
            return false;
        }
        if !self.matches_type(m) {
            return false;
        }

        let matcher = self.matcher(m);
        if self.tree.descendant_count() < matcher.descendant_count
            || self.tree.height() < matcher.height
            || self.tree.edge_count() < matcher.child_count as usize
        {
            return false;
        }

        self.matches_constraints(m)
    }

    /// Allocate the candidate, test exclusions and continuation, release
    /// the allocation again. Allocation and release are paired on the
    /// single exit path, which keeps the lock bitmap consistent for every
    /// outcome.
    fn try_candidate(&mut self, m: MatcherId, candidate: usize) -> bool {
        self.alloc[m] = Some(candidate);
        self.tree.lock_node(candidate);

        let mut matched = false;
        if !self.matches_exclusions(m) {
            matched = self.matches_next(m);
        }

        self.tree.unlock_node(candidate);
        self.alloc[m] = None;

        matched
    }

    fn matches_next(&mut self, m: MatcherId) -> bool {
        match self.matcher(m).next {
            Some(next) => self.matches(next),
            None => {
                if !self.matcher(m).exclusion_member {
                    self.commit();
                }
                true
            }
        }
    }

    /// At least one exclusion matches.
    fn matches_exclusions(&mut self, m: MatcherId) -> bool {
        let exclusions = &self.matcher(m).exclusions;
        for &exclusion in exclusions {
            if self.matches(exclusion) {
                return true;
            }
        }
        false
    }

    /// At least one exclusion member does not match.
    fn matches_inverted_exclusions(&mut self, m: MatcherId) -> bool {
        let exclusions = &self.matcher(m).exclusions;
        for &exclusion in exclusions {
            if !self.matches(exclusion) {
                return true;
            }
        }
        false
    }

    fn matches_type(&self, m: MatcherId) -> bool {
        match self.matcher(m).node_type {
            NodeType::Leaf => self.tree.edge_count() == 0,
            NodeType::Root => self.tree.is_root(),
            NodeType::Intermediate => self.tree.edge_count() > 0,
            NodeType::Parent => !self.tree.is_root() && self.tree.edge_count() > 0,
            NodeType::NonRoot => !self.tree.is_root(),
            NodeType::General | NodeType::Disjunction => true,
        }
    }

    fn matches_constraints(&self, m: MatcherId) -> bool {
        self.matcher(m)
            .constraints
            .iter()
            .all(|constraint| constraint.matches(self.tree))
    }

    /// Precedence legality of a candidate position: every cross-link whose
    /// other end is already allocated enforces strict order plus the
    /// declared distance check.
    fn is_legal_index(&self, m: MatcherId, position: usize) -> bool {
        let matcher = self.matcher(m);

        for link in &matcher.before {
            if let Some(alloc) = self.allocation_of(link.matcher) {
                if alloc >= position {
                    return false;
                }
                if let (Some(operator), Some(offset)) = (link.operator, link.offset) {
                    let distance = (position - alloc) as i64;
                    if !operator.apply(distance, offset) {
                        return false;
                    }
                }
            }
        }

        for link in &matcher.after {
            if let Some(alloc) = self.allocation_of(link.matcher) {
                if alloc <= position {
                    return false;
                }
                if let (Some(operator), Some(offset)) = (link.operator, link.offset) {
                    let distance = (alloc - position) as i64;
                    if !operator.apply(distance, offset) {
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Record the binding of the accepted path. Runs at the moment every
    /// allocation along the path is held.
    fn commit(&mut self) {
        let mut entries = Vec::new();
        for id in self.plan.matcher_ids() {
            let matcher = self.matcher(id);
            if matcher.exclusion_member {
                continue;
            }
            if let (Some(node), Some(token)) = (matcher.pattern_node, self.alloc[id]) {
                entries.push((node, token));
            }
        }
        trace!(bound = entries.len(), "committed match");
        self.hits.push(MatchBinding { entries });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::corpus::{HEAD_ROOT, Sentence, SentenceRecord};
    use crate::parser::QueryParser;
    use crate::registry::ConstraintRegistry;
    use crate::search::{SearchMode, SearchOptions};

    fn scenario_sentence() -> Sentence {
        Sentence::new(&["Dogs", "bark", "loudly"], &[1, HEAD_ROOT, 1])
            .with_pos(&["NOUN", "VERB", "ADV"])
            .with_lemmas(&["dog", "bark", "loudly"])
            .with_relations(&["nsubj", "root", "advmod"])
    }

    fn run_query(query: &str, sentence: &Sentence) -> bool {
        run_query_with(query, sentence, &SearchOptions::default())
    }

    fn run_query_with(query: &str, sentence: &Sentence, options: &SearchOptions) -> bool {
        let registry = ConstraintRegistry::standard();
        let graph = QueryParser::new(Some(&registry)).parse(query).unwrap();
        let plan = compile(&graph, &registry, options).unwrap();
        let engine = Engine::new(&plan, options);
        let mut tree = TargetTree::new();
        tree.reload(sentence).unwrap();
        engine.matches(&mut tree)
    }

    fn find_query(query: &str, sentence: &Sentence) -> Option<MatchBinding> {
        let registry = ConstraintRegistry::standard();
        let options = SearchOptions::default();
        let graph = QueryParser::new(Some(&registry)).parse(query).unwrap();
        let plan = compile(&graph, &registry, &options).unwrap();
        let engine = Engine::new(&plan, &options);
        let mut tree = TargetTree::new();
        tree.reload(sentence).unwrap();
        engine.find(&mut tree)
    }

    #[test]
    fn test_direct_constraint() {
        let sentence = scenario_sentence();
        assert!(run_query(r#"[form="bark"]"#, &sentence));
    }

    #[test]
    fn test_dominance_child() {
        let sentence = scenario_sentence();
        assert!(run_query(r#"[form="bark" [form="Dogs"]]"#, &sentence));
    }

    #[test]
    fn test_negated_child() {
        let sentence = scenario_sentence();
        assert!(run_query(r#"[form="bark" [! form="meow"]]"#, &sentence));
        // the negation must reject when the excluded child exists
        assert!(!run_query(r#"[form="bark" [! form="Dogs"]]"#, &sentence));
    }

    #[test]
    fn test_root_disjunction() {
        let sentence = scenario_sentence();
        assert!(run_query(r#"{[form="meow"] [form="bark"]}"#, &sentence));
        assert!(!run_query(r#"{[form="meow"] [form="purr"]}"#, &sentence));
    }

    #[test]
    fn test_failing_constraint() {
        let sentence = scenario_sentence();
        assert!(!run_query(r#"[form="meow"]"#, &sentence));
    }

    #[test]
    fn test_binding_covers_accepted_path() {
        let sentence = scenario_sentence();
        let binding = find_query(r#"[form="bark" [form="Dogs"] [form="loudly"]]"#, &sentence)
            .expect("pattern matches");
        assert_eq!(binding.len(), 3);

        let tokens: Vec<usize> = binding.entries().iter().map(|(_, t)| *t).collect();
        assert!(tokens.contains(&0));
        assert!(tokens.contains(&1));
        assert!(tokens.contains(&2));
    }

    #[test]
    fn test_injective_allocation() {
        // one parent with a single child cannot satisfy two child patterns
        let sentence = Sentence::new(&["a", "b"], &[1, HEAD_ROOT])
            .with_pos(&["X", "V"]);
        assert!(!run_query(r#"[pos="V" [pos="X"] [pos="X"]]"#, &sentence));

        let sentence = Sentence::new(&["a", "b", "c"], &[1, HEAD_ROOT, 1])
            .with_pos(&["X", "V", "X"]);
        assert!(run_query(r#"[pos="V" [pos="X"] [pos="X"]]"#, &sentence));

        let binding = find_query(r#"[pos="V" [pos="X"] [pos="X"]]"#, &sentence).unwrap();
        let mut tokens: Vec<usize> = binding.entries().iter().map(|(_, t)| *t).collect();
        tokens.sort_unstable();
        tokens.dedup();
        assert_eq!(tokens.len(), binding.len(), "allocation is injective");
    }

    #[test]
    fn test_negation_within_subtree() {
        // exclusion patterns are evaluated inside the candidate's subtree:
        // bark has a Dogs child, so the exclusion matches and rejects
        let sentence = scenario_sentence();
        assert!(!run_query(r#"[form="bark" [! form="Dogs"]]"#, &sentence));

        // a deeper exclusion subtree must fully match to falsify
        let sentence = Sentence::new(&["x", "y", "z"], &[1, HEAD_ROOT, 0])
            .with_pos(&["A", "V", "B"]);
        assert!(!run_query(r#"[pos="V" [! pos="A" [pos="B"]]]"#, &sentence));
        assert!(run_query(r#"[pos="V" [! pos="A" [pos="C"]]]"#, &sentence));
    }

    #[test]
    fn test_pure_negation_pattern() {
        let sentence = scenario_sentence();
        assert!(run_query(r#"[! form="meow"]"#, &sentence));
        assert!(!run_query(r#"[! form="bark"]"#, &sentence));

        // a committed match of a pure-negation plan binds nothing
        let binding = find_query(r#"[! form="meow"]"#, &sentence);
        assert!(binding.is_none() || binding.unwrap().is_empty());
    }

    #[test]
    fn test_negated_disjunction() {
        // neither cat nor cow occurs below bark
        let sentence = scenario_sentence();
        assert!(run_query(r#"[form="bark" {! [form="cat"] [form="cow"]}]"#, &sentence));
        // Dogs occurs, so the rewritten exclusion rejects
        assert!(!run_query(r#"[form="bark" {! [form="cat"] [form="Dogs"]}]"#, &sentence));
    }

    #[test]
    fn test_transitive_search() {
        // z is a grandchild of the root
        let sentence = Sentence::new(&["x", "y", "z"], &[1, HEAD_ROOT, 0])
            .with_pos(&["A", "V", "B"]);
        assert!(!run_query(r#"[pos="V" [pos="B"]]"#, &sentence));
        assert!(run_query(r#"[pos="V" [(edgeType=trans) pos="B"]]"#, &sentence));
        assert!(run_query(r#"[pos="V" [(edgeType=trans) pos="A"]]"#, &sentence));
        assert!(!run_query(r#"[pos="V" [(edgeType=trans) pos="C"]]"#, &sentence));
    }

    #[test]
    fn test_precedence() {
        // token order: "Dogs"(0) "bark"(1) "loudly"(2), both under bark
        let sentence = scenario_sentence();
        // loudly after Dogs holds
        assert!(run_query(
            r#"[form="bark" [(id=A) form="Dogs"] [(id=B, A=before) form="loudly"]]"#,
            &sentence
        ));
        // Dogs after loudly does not
        assert!(!run_query(
            r#"[form="bark" [(id=A) form="loudly"] [(id=B, A=before) form="Dogs"]]"#,
            &sentence
        ));
    }

    #[test]
    fn test_precedence_distance() {
        let sentence = scenario_sentence();
        // distance from Dogs(0) to loudly(2) is 2
        assert!(run_query(
            r#"[form="bark" [(id=A) form="Dogs"] [(id=B, A="before;dist<=2") form="loudly"]]"#,
            &sentence
        ));
        assert!(!run_query(
            r#"[form="bark" [(id=A) form="Dogs"] [(id=B, A="before;dist<=1") form="loudly"]]"#,
            &sentence
        ));
        assert!(run_query(
            r#"[form="bark" [(id=A) form="Dogs"] [(id=B, A="before;dist>=2") form="loudly"]]"#,
            &sentence
        ));
    }

    #[test]
    fn test_node_type_filters() {
        let sentence = scenario_sentence();
        assert!(run_query(r#"[(nodeType=root) form="bark"]"#, &sentence));
        assert!(!run_query(r#"[(nodeType=root) form="Dogs"]"#, &sentence));
        assert!(run_query(r#"[(nodeType=leaf) form="Dogs"]"#, &sentence));
        assert!(!run_query(r#"[(nodeType=leaf) form="bark"]"#, &sentence));
        assert!(run_query(r#"[(nodeType=non_root) form="loudly"]"#, &sentence));
    }

    #[test]
    fn test_exhaustive_mode_collects_all_bindings() {
        let sentence = Sentence::new(&["a", "b", "c"], &[1, HEAD_ROOT, 1])
            .with_pos(&["X", "V", "X"]);
        let registry = ConstraintRegistry::standard();
        let options = SearchOptions {
            search_mode: SearchMode::IndependentHits,
            ..SearchOptions::default()
        };
        let graph = QueryParser::new(Some(&registry))
            .parse(r#"[pos="V" [pos="X"]]"#)
            .unwrap();
        let plan = compile(&graph, &registry, &options).unwrap();
        let engine = Engine::new(&plan, &options);
        let mut tree = TargetTree::new();
        tree.reload(&sentence).unwrap();

        let bindings = engine.find_all(&mut tree);
        assert_eq!(bindings.len(), 2);
    }

    #[test]
    fn test_orientation_changes_first_binding() {
        let sentence = Sentence::new(&["a", "b", "c"], &[1, HEAD_ROOT, 1])
            .with_pos(&["X", "V", "X"]);
        let registry = ConstraintRegistry::standard();
        let graph = QueryParser::new(Some(&registry))
            .parse(r#"[pos="V" [pos="X"]]"#)
            .unwrap();

        let ltr = SearchOptions::default();
        let plan = compile(&graph, &registry, &ltr).unwrap();
        let mut tree = TargetTree::new();
        tree.reload(&sentence).unwrap();
        let first = Engine::new(&plan, &ltr).find(&mut tree).unwrap();

        let rtl = SearchOptions {
            orientation: Orientation::RightToLeft,
            ..SearchOptions::default()
        };
        let plan = compile(&graph, &registry, &rtl).unwrap();
        tree.reload(&sentence).unwrap();
        let second = Engine::new(&plan, &rtl).find(&mut tree).unwrap();

        let tokens = |b: &MatchBinding| {
            let mut t: Vec<usize> = b.entries().iter().map(|(_, t)| *t).collect();
            t.sort_unstable();
            t
        };
        assert_eq!(tokens(&first), vec![0, 1]);
        assert_eq!(tokens(&second), vec![1, 2]);
    }

    #[test]
    fn test_conjunction_of_roots() {
        let sentence = scenario_sentence();
        assert!(run_query(r#"[form="bark"] [form="Dogs"]"#, &sentence));
        assert!(!run_query(r#"[form="bark"] [form="meow"]"#, &sentence));
        // both root patterns need distinct allocations
        assert!(!run_query(r#"[form="bark"] [form="bark"]"#, &sentence));
    }

    #[test]
    fn test_multi_rooted_sentence() {
        let sentence = Sentence::new(&["a", "b", "c", "d"], &[HEAD_ROOT, 0, HEAD_ROOT, 2])
            .with_pos(&["V", "X", "W", "Y"]);
        assert!(run_query(r#"[pos="V" [pos="X"]]"#, &sentence));
        assert!(run_query(r#"[pos="W" [pos="Y"]]"#, &sentence));
        assert!(!run_query(r#"[pos="V" [pos="Y"]]"#, &sentence));
    }

    #[test]
    fn test_dangling_token_is_a_candidate_without_structure() {
        use crate::corpus::HEAD_UNDEFINED;
        let sentence = Sentence::new(&["a", "b", "c"], &[1, HEAD_ROOT, HEAD_UNDEFINED])
            .with_pos(&["X", "V", "Z"]);
        // the dangling token itself can be found
        assert!(run_query(r#"[pos="Z"]"#, &sentence));
        // but it hangs below nothing
        assert!(!run_query(r#"[pos="V" [pos="Z"]]"#, &sentence));
    }

    /// Brute-force reference for a fixed three-level chain pattern:
    /// a node with pos A dominating a child with pos B dominating a child
    /// with pos C, all distinct by construction.
    fn brute_force_chain(sentence: &Sentence) -> bool {
        let n = sentence.len();
        let children = |p: usize| -> Vec<usize> {
            (0..n).filter(|&i| sentence.head(i) == p as i32).collect()
        };
        for a in (0..n).filter(|&i| sentence.pos(i) == "A") {
            for &b in children(a).iter().filter(|&&i| sentence.pos(i) == "B") {
                for &c in children(b).iter().filter(|&&i| sentence.pos(i) == "C") {
                    if a != b && b != c && a != c {
                        return true;
                    }
                }
            }
        }
        false
    }

    #[test]
    fn test_structural_pruning_soundness() {
        // deterministic pseudo-random trees; pruning must never change the
        // boolean outcome relative to the brute-force reference
        let mut state: u64 = 0x2545F4914F6CDD1D;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let tags = ["A", "B", "C"];
        for _ in 0..60 {
            let len = 2 + (next() % 7) as usize;
            let mut heads = vec![HEAD_ROOT];
            for i in 1..len {
                heads.push((next() % i as u64) as i32);
            }
            let pos: Vec<&str> = (0..len).map(|_| tags[(next() % 3) as usize]).collect();
            let forms: Vec<String> = (0..len).map(|i| format!("w{}", i)).collect();
            let form_refs: Vec<&str> = forms.iter().map(|s| s.as_str()).collect();

            let sentence = Sentence::new(&form_refs, &heads).with_pos(&pos);
            let expected = brute_force_chain(&sentence);
            let actual = run_query(r#"[pos="A" [pos="B" [pos="C"]]]"#, &sentence);
            assert_eq!(actual, expected, "heads {:?} pos {:?}", heads, pos);
        }
    }
}
