//! Matcher compiler
//!
//! Lowers a [`PatternGraph`] into an executable [`MatcherPlan`]: an arena
//! of matcher records linked by continuation, alternate, exclusion and
//! precedence indices. The plan is immutable once built; all transient
//! matching state lives in the execution engine.
//!
//! Compilation walks the dominance/transitive skeleton of the graph into a
//! build tree, normalizes disjunctions, instantiates one matcher per build
//! node (negated children become exclusions of their parent), performs a
//! single depth-first continuation linearization and finally resolves
//! precedence edges into cross-links between matchers.

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use crate::constraint::{IntOp, RawConstraint, Value};
use crate::graph::{EdgeId, EdgeType, NodeId, NodeType, PatternGraph, RootOp};
use crate::registry::{BindError, CompiledConstraint, ConstraintRegistry};
use crate::search::SearchOptions;

/// Index of a matcher in a [`MatcherPlan`] arena.
pub type MatcherId = usize;

#[derive(Debug, Error)]
pub enum CompileError {
    /// The graph is structurally unusable: empty, or a disjunction nested
    /// directly inside another disjunction.
    #[error("illegal pattern: {0}")]
    IllegalPattern(String),
    /// A constraint token has no registry entry.
    #[error("unknown constraint token: {0}")]
    UnknownToken(String),
    /// A constraint could not be bound to its capability.
    #[error(transparent)]
    Constraint(#[from] BindError),
}

/// How a matcher searches its candidate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    /// Candidates are all tokens of the sentence.
    Root,
    /// Candidates are the children of the parent's allocation.
    Plain,
    /// Candidates are the full descendant set of the parent's allocation.
    Transitive,
    /// No candidate search; success is the OR over the option branches.
    Disjunction,
    /// Carrier for root-level exclusions, never allocates.
    Proxy,
}

/// Ordering cross-link between two matchers' allocations.
#[derive(Debug, Clone, Copy)]
pub struct PrecedenceLink {
    pub matcher: MatcherId,
    pub operator: Option<IntOp>,
    pub offset: Option<i64>,
}

/// One record of the compiled plan, bound to exactly one pattern node
/// (except proxies) and, for non-roots, the edge that produced it.
pub struct Matcher {
    pub kind: MatcherKind,
    pub pattern_node: Option<NodeId>,
    pub pattern_edge: Option<EdgeId>,
    pub node_type: NodeType,
    pub constraints: Vec<Box<dyn CompiledConstraint>>,
    pub parent: Option<MatcherId>,
    pub next: Option<MatcherId>,
    pub alternate: Option<MatcherId>,
    pub exclusions: Vec<MatcherId>,
    pub options: Vec<MatcherId>,
    pub before: Vec<PrecedenceLink>,
    pub after: Vec<PrecedenceLink>,
    /// Structural thresholds for early pruning: necessary conditions
    /// derived from the pattern subtree shape.
    pub height: u32,
    pub descendant_count: u32,
    pub child_count: u32,
    /// Set for every matcher inside an exclusion sub-plan; such matchers
    /// stop at the first hit and never commit a match.
    pub exclusion_member: bool,
}

impl Matcher {
    fn new(kind: MatcherKind, pattern_node: Option<NodeId>, pattern_edge: Option<EdgeId>) -> Self {
        Self {
            kind,
            pattern_node,
            pattern_edge,
            node_type: NodeType::General,
            constraints: Vec::new(),
            parent: None,
            next: None,
            alternate: None,
            exclusions: Vec::new(),
            options: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            height: 0,
            descendant_count: 0,
            child_count: 0,
            exclusion_member: false,
        }
    }
}

/// The compiled, executable form of a pattern graph.
pub struct MatcherPlan {
    matchers: Vec<Matcher>,
    root: MatcherId,
}

impl std::fmt::Debug for MatcherPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatcherPlan")
            .field("matchers", &self.matchers.len())
            .field("root", &self.root)
            .finish()
    }
}

impl MatcherPlan {
    pub fn root(&self) -> MatcherId {
        self.root
    }

    pub fn matcher(&self, id: MatcherId) -> &Matcher {
        &self.matchers[id]
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn matcher_ids(&self) -> impl Iterator<Item = MatcherId> {
        0..self.matchers.len()
    }
}

/// Compile a pattern graph against a registry into a matcher plan.
pub fn compile(
    graph: &PatternGraph,
    registry: &ConstraintRegistry,
    options: &SearchOptions,
) -> Result<MatcherPlan, CompileError> {
    let roots = graph.roots();
    if graph.is_empty() || roots.is_empty() {
        return Err(CompileError::IllegalPattern("graph is empty".to_string()));
    }

    let mut builder = PlanBuilder::new(graph, registry, options);

    let top = builder.create_tree(&roots);
    for &child in &top {
        builder.normalize(child);
    }
    for &child in &top {
        builder.create_matcher(None, child, false)?;
    }

    for edge in graph.edge_ids() {
        if graph.edge(edge).edge_type == EdgeType::Precedence {
            builder.resolve_precedence(edge)?;
        }
    }

    let is_disjunction = graph.root_op == RootOp::Disjunction;
    let negated: Vec<usize> = top
        .iter()
        .copied()
        .filter(|&b| builder.is_negated(b))
        .collect();
    let unnegated: Vec<usize> = top
        .iter()
        .copied()
        .filter(|&b| !builder.is_negated(b))
        .collect();

    let mut root = None;
    if !unnegated.is_empty() {
        root = Some(builder.link_roots(&unnegated, is_disjunction)?);
    }
    if !negated.is_empty() {
        root = Some(builder.link_proxy_roots(&negated, is_disjunction, root)?);
    }
    let root = root.expect("at least one root matcher");

    let plan = MatcherPlan {
        matchers: builder.matchers,
        root,
    };
    debug!(matchers = plan.len(), "compiled matcher plan");
    Ok(plan)
}

/// Intermediate tree the compiler builds by following dominance and
/// transitive edges (link and precedence edges are skipped). Arena-indexed
/// so normalization can move subtrees around freely.
struct BuildNode {
    node: NodeId,
    edge: Option<EdgeId>,
    /// Negation toggle applied by the negated-disjunction rewrite, on top
    /// of the node/edge negation flags.
    flipped: bool,
    children: Vec<usize>,
    /// Negated children, moved here when their matchers become exclusions.
    negated_children: Vec<usize>,
    alternate: Option<usize>,
}

struct PlanBuilder<'a> {
    graph: &'a PatternGraph,
    registry: &'a ConstraintRegistry,
    options: &'a SearchOptions,
    build: Vec<BuildNode>,
    matchers: Vec<Matcher>,
    /// Build node -> matcher.
    matcher_map: FxHashMap<usize, MatcherId>,
    /// Pattern node -> matchers bound to it, for precedence resolution.
    node_map: FxHashMap<NodeId, Vec<MatcherId>>,
    linker: Linker,
}

impl<'a> PlanBuilder<'a> {
    fn new(
        graph: &'a PatternGraph,
        registry: &'a ConstraintRegistry,
        options: &'a SearchOptions,
    ) -> Self {
        Self {
            graph,
            registry,
            options,
            build: Vec::new(),
            matchers: Vec::new(),
            matcher_map: FxHashMap::default(),
            node_map: FxHashMap::default(),
            linker: Linker::default(),
        }
    }

    // Tree construction

    fn create_tree(&mut self, roots: &[NodeId]) -> Vec<usize> {
        roots.iter().map(|&root| self.create_tree_node(root, None)).collect()
    }

    fn create_tree_node(&mut self, node: NodeId, edge: Option<EdgeId>) -> usize {
        let index = self.build.len();
        self.build.push(BuildNode {
            node,
            edge,
            flipped: false,
            children: Vec::new(),
            negated_children: Vec::new(),
            alternate: None,
        });

        for &edge_id in &self.graph.node(node).outgoing {
            let edge = self.graph.edge(edge_id);
            if !edge.edge_type.is_structural() {
                continue;
            }
            let child = self.create_tree_node(edge.target, Some(edge_id));
            self.build[index].children.push(child);
        }

        index
    }

    /// Effective negation of a build node: the node flag, the edge flag and
    /// the rewrite toggle cancel pairwise.
    fn is_negated(&self, b: usize) -> bool {
        let build = &self.build[b];
        let mut negated = build.flipped;
        if let Some(edge) = build.edge {
            if self.graph.edge(edge).negated {
                negated = !negated;
            }
        }
        if self.graph.node(build.node).negated {
            negated = !negated;
        }
        negated
    }

    fn is_disjunction(&self, b: usize) -> bool {
        self.graph.node(self.build[b].node).node_type == NodeType::Disjunction
    }

    // Normalization

    /// Rewrite rule: a disjunction child whose every use is negated is
    /// dissolved, its branches re-attached to the current node with
    /// inverted negation. A disjunction with unnegated branches keeps those
    /// branches chained as alternate siblings behind a single leader child.
    fn normalize(&mut self, b: usize) {
        // Dissolve negated disjunction children first.
        let negated_disjunctions: Vec<usize> = self.build[b]
            .children
            .iter()
            .copied()
            .filter(|&c| self.is_disjunction(c) && self.is_negated(c))
            .collect();
        if !negated_disjunctions.is_empty() {
            self.build[b]
                .children
                .retain(|c| !negated_disjunctions.contains(c));
            for dissolved in negated_disjunctions {
                let grandchildren = std::mem::take(&mut self.build[dissolved].children);
                for &grandchild in &grandchildren {
                    self.build[grandchild].flipped = !self.build[grandchild].flipped;
                }
                self.build[b].children.extend(grandchildren);
            }
        }

        for child in self.build[b].children.clone() {
            self.normalize(child);
        }

        // Chain the unnegated branches of a surviving disjunction.
        if self.is_disjunction(b) {
            let unnegated: Vec<usize> = self.build[b]
                .children
                .iter()
                .copied()
                .filter(|&c| !self.is_negated(c) && !self.is_disjunction(c))
                .collect();
            if !unnegated.is_empty() {
                for pair in unnegated.windows(2) {
                    self.build[pair[0]].alternate = Some(pair[1]);
                }
                let leader = unnegated[0];
                self.build[b].children.retain(|c| !unnegated.contains(c));
                self.build[b].children.insert(0, leader);
            }
        }
    }

    // Matcher instantiation

    fn create_matcher(
        &mut self,
        parent: Option<MatcherId>,
        b: usize,
        exclusion_member: bool,
    ) -> Result<MatcherId, CompileError> {
        let node = self.build[b].node;
        let edge = self.build[b].edge;
        let exclusion_member = exclusion_member || self.is_negated(b);

        let kind = if self.is_disjunction(b) {
            MatcherKind::Disjunction
        } else if edge.is_none() {
            MatcherKind::Root
        } else if self.graph.edge(edge.expect("non-root")).edge_type == EdgeType::Transitive {
            MatcherKind::Transitive
        } else {
            MatcherKind::Plain
        };

        let mut matcher = Matcher::new(kind, Some(node), edge);
        matcher.node_type = self.graph.node(node).node_type;
        matcher.parent = parent;
        matcher.exclusion_member = exclusion_member;

        // Merge edge constraints and node constraints; inactive and
        // undefined ones are dropped here.
        if let Some(edge) = edge {
            self.bind_constraints(&mut matcher, &self.graph.edge(edge).constraints)?;
        }
        self.bind_constraints(&mut matcher, &self.graph.node(node).constraints)?;

        let id = self.matchers.len();
        self.matchers.push(matcher);
        self.matcher_map.insert(b, id);
        self.node_map.entry(node).or_default().push(id);

        // Negated children become exclusions and leave the child list.
        let negated: Vec<usize> = self.build[b]
            .children
            .iter()
            .copied()
            .filter(|&c| self.is_negated(c) && !self.is_disjunction(c))
            .collect();
        if !negated.is_empty() {
            self.build[b].children.retain(|c| !negated.contains(c));
            let mut exclusions = Vec::with_capacity(negated.len());
            for &child in &negated {
                exclusions.push(self.create_matcher(Some(id), child, true)?);
            }
            self.matchers[id].exclusions = exclusions;
            self.build[b].negated_children = negated;
        }

        for child in self.build[b].children.clone() {
            self.create_matcher(Some(id), child, exclusion_member)?;
        }

        if let Some(alternate) = self.build[b].alternate {
            self.create_matcher(parent, alternate, exclusion_member)?;
        }

        Ok(id)
    }

    fn bind_constraints(
        &self,
        matcher: &mut Matcher,
        constraints: &[RawConstraint],
    ) -> Result<(), CompileError> {
        for raw in constraints {
            if !raw.active || raw.is_undefined() {
                continue;
            }
            let factory = self
                .registry
                .factory(&raw.token)
                .ok_or_else(|| CompileError::UnknownToken(raw.token.clone()))?;
            matcher.constraints.push(factory.bind(raw, self.options)?);
        }
        Ok(())
    }

    // Precedence resolution

    fn resolve_precedence(&mut self, edge_id: EdgeId) -> Result<(), CompileError> {
        let edge = self.graph.edge(edge_id);
        let sources = self.node_map.get(&edge.source).cloned().unwrap_or_default();
        let targets = self.node_map.get(&edge.target).cloned().unwrap_or_default();
        if sources.is_empty() || targets.is_empty() {
            return Ok(());
        }

        let mut operator = None;
        let mut offset = None;
        for constraint in &edge.constraints {
            if constraint.is_undefined() || constraint.token != "distance" {
                continue;
            }
            operator = IntOp::from_search_op(constraint.operator);
            offset = match constraint.value {
                Value::Int(i) => Some(i),
                _ => None,
            };
        }

        // The source side must be allocated before the target side: each
        // target matcher learns who comes before it, each source matcher
        // who comes after it.
        for &target in &targets {
            for &source in &sources {
                self.matchers[target].before.push(PrecedenceLink {
                    matcher: source,
                    operator,
                    offset,
                });
            }
        }
        for &source in &sources {
            for &target in &targets {
                self.matchers[source].after.push(PrecedenceLink {
                    matcher: target,
                    operator,
                    offset,
                });
            }
        }

        Ok(())
    }

    // Continuation linking

    fn link_roots(
        &mut self,
        roots: &[usize],
        is_disjunction: bool,
    ) -> Result<MatcherId, CompileError> {
        self.linker.clear();

        if is_disjunction {
            let mut last: Option<MatcherId> = None;
            for &root in roots {
                let matcher = self.matcher_map[&root];
                if let Some(last) = last {
                    self.matchers[last].alternate = Some(matcher);
                }
                last = Some(matcher);

                self.linker.clear();
                self.link_node(root)?;
            }
        } else {
            // Conjunction roots chain through the continuation buffer: the
            // tail of one root tree links to the head of the next.
            for &root in roots {
                self.link_node(root)?;
            }
        }

        Ok(self.matcher_map[&roots[0]])
    }

    fn link_proxy_roots(
        &mut self,
        negated: &[usize],
        is_disjunction: bool,
        unnegated_root: Option<MatcherId>,
    ) -> Result<MatcherId, CompileError> {
        if is_disjunction {
            // One proxy per negated root, chained as alternates.
            let mut proxies: Vec<MatcherId> = Vec::with_capacity(negated.len());
            for &b in negated {
                self.linker.clear();
                self.link_node(b)?;

                let exclusion = self.matcher_map[&b];
                let proxy = self.matchers.len();
                self.matchers.push(Matcher::new(MatcherKind::Proxy, None, None));
                self.matchers[proxy].exclusions.push(exclusion);

                if let Some(&previous) = proxies.last() {
                    self.matchers[previous].alternate = Some(proxy);
                }
                proxies.push(proxy);
            }

            if let Some(unnegated_root) = unnegated_root {
                let last = *proxies.last().expect("at least one proxy");
                self.matchers[last].alternate = Some(unnegated_root);
            }

            Ok(proxies[0])
        } else {
            // A single proxy holding every negated root as exclusion.
            let proxy = self.matchers.len();
            self.matchers.push(Matcher::new(MatcherKind::Proxy, None, None));
            self.matchers[proxy].next = unnegated_root;

            let mut exclusions = Vec::with_capacity(negated.len());
            for &b in negated {
                self.linker.clear();
                exclusions.push(self.matcher_map[&b]);
                self.link_node(b)?;
            }
            self.matchers[proxy].exclusions = exclusions;

            Ok(proxy)
        }
    }

    /// Depth-first continuation linearization. Every matcher waiting in the
    /// buffer gets the current matcher as continuation; disjunctions route
    /// through their options list and re-enter the buffer themselves so all
    /// branches share the continuation recorded before any branch started.
    fn link_node(&mut self, b: usize) -> Result<MatcherId, CompileError> {
        let matcher = self.matcher_map[&b];
        let is_disjunction = self.is_disjunction(b);

        let pending = self.linker.take_pending();
        for waiting in pending {
            self.matchers[waiting].next = Some(matcher);
        }
        if !is_disjunction {
            self.linker.add(matcher);
        }

        // Exclusion sub-plans are linked independently; their continuation
        // chains end inside the exclusion.
        if !self.build[b].negated_children.is_empty() {
            self.linker.save();
            for child in self.build[b].negated_children.clone() {
                self.linker.clear();
                self.link_node(child)?;
            }
            self.linker.load();
        }

        let children = self.build[b].children.clone();
        if is_disjunction {
            // The branch chain enters the options list through its leader
            // only; further branches hang off the leader as alternates.
            let mut options = Vec::new();
            for child in children {
                if self.is_disjunction(child) {
                    return Err(CompileError::IllegalPattern(format!(
                        "nested disjunction at node '{}'",
                        self.graph.node(self.build[child].node).id
                    )));
                }
                self.linker.save();
                options.push(self.link_node(child)?);
                self.linker.merge();
                self.linker.load();
            }
            self.matchers[matcher].options = options;
        } else {
            for child in children {
                self.link_node(child)?;
            }
        }

        // Alternates get a clean entry point; their tails join the shared
        // continuation buffer afterwards.
        if let Some(alternate) = self.build[b].alternate {
            self.linker.save();
            let alternate_matcher = self.link_node(alternate)?;
            self.matchers[matcher].alternate = Some(alternate_matcher);
            self.linker.merge();
            self.linker.load();
        }

        self.matchers[matcher].height = self.required_height(b);
        self.matchers[matcher].descendant_count = self.required_descendants(b);
        self.matchers[matcher].child_count = self.required_children(b);

        if is_disjunction {
            self.linker.add(matcher);
        }

        Ok(matcher)
    }

    // Structural thresholds. Each is a necessary condition on the target
    // node: exclusions contribute nothing (their subtree need not exist),
    // a disjunction contributes the weakest of its branches.

    fn branches(&self, b: usize) -> Vec<usize> {
        let mut branches = Vec::new();
        let mut current = self.build[b].children.first().copied();
        while let Some(branch) = current {
            branches.push(branch);
            current = self.build[branch].alternate;
        }
        branches
    }

    fn required_height(&self, b: usize) -> u32 {
        if self.is_disjunction(b) {
            return self.height_contribution(b);
        }
        self.build[b]
            .children
            .iter()
            .map(|&c| self.height_contribution(c))
            .max()
            .unwrap_or(0)
    }

    /// Extra height a child requires of its parent's candidate. A
    /// disjunction that can succeed through a failed exclusion member
    /// requires nothing.
    fn height_contribution(&self, c: usize) -> u32 {
        if self.is_disjunction(c) {
            if !self.build[c].negated_children.is_empty() {
                return 0;
            }
            return self
                .branches(c)
                .iter()
                .map(|&branch| self.height_contribution(branch))
                .min()
                .unwrap_or(0);
        }
        self.required_height(c) + 1
    }

    fn required_descendants(&self, b: usize) -> u32 {
        if self.is_disjunction(b) {
            return self.descendant_contribution(b);
        }
        self.build[b]
            .children
            .iter()
            .map(|&c| self.descendant_contribution(c))
            .sum()
    }

    fn descendant_contribution(&self, c: usize) -> u32 {
        if self.is_disjunction(c) {
            if !self.build[c].negated_children.is_empty() {
                return 0;
            }
            return self
                .branches(c)
                .iter()
                .map(|&branch| self.descendant_contribution(branch))
                .min()
                .unwrap_or(0);
        }
        self.required_descendants(c) + 1
    }

    fn required_children(&self, b: usize) -> u32 {
        if self.is_disjunction(b) {
            if !self.build[b].negated_children.is_empty() {
                return 0;
            }
            return if self.build[b].children.is_empty() { 0 } else { 1 };
        }

        self.build[b]
            .children
            .iter()
            .map(|&c| self.required_children_contribution(c))
            .sum()
    }

    fn required_children_contribution(&self, c: usize) -> u32 {
        if self.is_disjunction(c) {
            self.required_children(c)
        } else {
            1
        }
    }
}

/// Continuation buffer used during the depth-first linearization: matchers
/// waiting for their `next` pointer, with a save/merge/load stack to give
/// alternates and disjunction branches a clean entry point.
#[derive(Default)]
struct Linker {
    stack: Vec<Vec<MatcherId>>,
    buffer: Vec<MatcherId>,
}

impl Linker {
    fn add(&mut self, matcher: MatcherId) {
        self.buffer.push(matcher);
    }

    fn take_pending(&mut self) -> Vec<MatcherId> {
        std::mem::take(&mut self.buffer)
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }

    fn save(&mut self) {
        self.stack.push(std::mem::take(&mut self.buffer));
    }

    fn load(&mut self) {
        self.buffer = self.stack.pop().expect("unbalanced linker stack");
    }

    fn merge(&mut self) {
        if let Some(saved) = self.stack.last_mut() {
            saved.extend(self.buffer.iter().copied());
        }
    }
}
