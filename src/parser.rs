//! Query language parser
//!
//! Hand-written recursive-descent parser turning pattern text into a
//! [`PatternGraph`], plus the inverse serializer rendering a graph back to
//! canonical query text.
//!
//! Query grammar (informal EBNF):
//!
//! ```text
//! query       := [properties] ( disjunction | node+ )
//! disjunction := "{" ["!"] node node {node} "}"
//! node        := "[" ["!"] { "," | constraint | properties | node | disjunction } "]"
//! properties  := "(" property {"," property} ")"
//! property    := identifier "=" value
//! constraint  := identifier ["$" specifier] operator value
//! operator    := "=" | "!=" | "~" | "!~" | "#" | "!#" | "<" | "<=" | ">" | ">="
//! ```
//!
//! Recognized property keys are `id`, `nodeType`, `edgeType`,
//! `nodeNamePattern`, and `<ref>=before|after[;dist<op><n>]` which declares
//! a precedence edge towards the node with id `<ref>` (forward references
//! are legal, the declarations are resolved after the whole tree is read).

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::debug;

use crate::constraint::{RawConstraint, SearchOp, UNDEFINED_LABEL, Value};
use crate::graph::{EdgeId, EdgeType, NodeId, NodeType, PatternGraph, RootOp};
use crate::registry::{ConstraintKind, ConstraintRegistry};

/// Malformed query text. Always recoverable by the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    /// Character offset into the trimmed query text.
    pub position: usize,
    pub message: String,
}

/// A graph that cannot be rendered back to query text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("cannot serialize an empty graph")]
    EmptyGraph,
    #[error("disjunction node '{0}' has fewer than two members")]
    MalformedDisjunction(String),
}

pub const DEFAULT_NODE_NAME_PATTERN: &str = "node_%d";
pub const DEFAULT_EDGE_NAME_PATTERN: &str = "edge_%d";

const ID_PROPERTY: &str = "id";
const NODE_TYPE_PROPERTY: &str = "nodeType";
const EDGE_TYPE_PROPERTY: &str = "edgeType";
const NODE_NAME_PATTERN_PROPERTY: &str = "nodeNamePattern";
const DISTANCE_PREFIX: &str = "dist";

#[derive(Debug, Clone)]
pub struct ParserOptions {
    /// Complete abbreviated constraint tokens through the registry.
    pub expand_tokens: bool,
    /// Name pattern for unnamed nodes, `%d` is the running index.
    pub node_name_pattern: String,
    /// Name pattern for edges, `%d` is the running index.
    pub edge_name_pattern: String,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            expand_tokens: true,
            node_name_pattern: DEFAULT_NODE_NAME_PATTERN.to_string(),
            edge_name_pattern: DEFAULT_EDGE_NAME_PATTERN.to_string(),
        }
    }
}

/// Parser for the bracket query language.
///
/// When a registry is supplied, constraint tokens are validated (and
/// completed) against it and values are coerced through the matching
/// capability; without one, every constraint is kept verbatim as a node
/// constraint.
pub struct QueryParser<'r> {
    registry: Option<&'r ConstraintRegistry>,
    options: ParserOptions,
}

impl<'r> QueryParser<'r> {
    pub fn new(registry: Option<&'r ConstraintRegistry>) -> Self {
        Self::with_options(registry, ParserOptions::default())
    }

    pub fn with_options(registry: Option<&'r ConstraintRegistry>, options: ParserOptions) -> Self {
        Self { registry, options }
    }

    /// Parse query text into a pattern graph. Pure function of the input
    /// text and the registry.
    pub fn parse(&self, query: &str) -> Result<PatternGraph, ParseError> {
        let mut state = ParseState::new(query.trim(), self.registry, &self.options);
        state.parse_query()?;
        let graph = state.finish()?;
        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "parsed query"
        );
        Ok(graph)
    }

    /// Render a graph back to canonical query text, the inverse of
    /// [`QueryParser::parse`].
    pub fn to_query(&self, graph: &PatternGraph) -> Result<String, WriteError> {
        write_query(graph)
    }
}

fn is_legal_id(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn is_operator_char(c: char) -> bool {
    matches!(c, '=' | '!' | '~' | '#' | '<' | '>')
}

fn format_name(pattern: &str, index: usize) -> String {
    pattern.replace("%d", &index.to_string())
}

struct ParseState<'r, 'o> {
    chars: Vec<char>,
    index: usize,
    registry: Option<&'r ConstraintRegistry>,
    options: &'o ParserOptions,
    graph: PatternGraph,
    /// Properties collected per node, resolved after the tree is read.
    properties: FxHashMap<NodeId, Vec<(String, String)>>,
    global_properties: Vec<(String, String)>,
    /// Incoming dominance edge of every non-root node.
    frame_edges: FxHashMap<NodeId, EdgeId>,
}

impl<'r, 'o> ParseState<'r, 'o> {
    fn new(
        query: &str,
        registry: Option<&'r ConstraintRegistry>,
        options: &'o ParserOptions,
    ) -> Self {
        Self {
            chars: query.chars().collect(),
            index: 0,
            registry,
            options,
            graph: PatternGraph::new(),
            properties: FxHashMap::default(),
            global_properties: Vec::new(),
            frame_edges: FxHashMap::default(),
        }
    }

    // Scanner primitives. `current` reports NUL at end of input so that
    // lookahead never goes out of bounds; NUL matches no expected token.

    fn current(&self) -> char {
        self.chars.get(self.index).copied().unwrap_or('\0')
    }

    fn peek(&self) -> char {
        self.chars.get(self.index + 1).copied().unwrap_or('\0')
    }

    fn is_eos(&self) -> bool {
        self.index >= self.chars.len()
    }

    fn advance(&mut self) {
        self.index += 1;
    }

    fn skip_ws(&mut self) {
        while !self.is_eos() && self.current().is_whitespace() {
            self.advance();
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            position: self.index,
            message: message.into(),
        }
    }

    // Grammar productions

    fn parse_query(&mut self) -> Result<(), ParseError> {
        if self.is_eos() {
            return Ok(());
        }

        self.skip_ws();
        if self.current() == '(' {
            self.global_properties = self.parse_property_group()?;
            self.skip_ws();
        }

        let mut closed = true;
        let disjunction_start = self.index;
        if self.current() == '{' {
            self.graph.root_op = RootOp::Disjunction;
            self.advance();
            closed = false;
        }

        while !self.is_eos() {
            self.skip_ws();
            match self.current() {
                '[' => {
                    self.parse_node(None)?;
                }
                '}' if self.graph.root_op == RootOp::Disjunction => {
                    closed = true;
                    self.advance();
                    break;
                }
                '\0' => break,
                _ => {
                    return Err(self.error(format!(
                        "illegal character '{}' at query level",
                        self.current()
                    )));
                }
            }
        }

        if !closed {
            return Err(ParseError {
                position: disjunction_start,
                message: "unclosed disjunction".to_string(),
            });
        }

        self.skip_ws();
        if !self.is_eos() {
            return Err(self.error("trailing input after query"));
        }

        Ok(())
    }

    fn parse_node(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let node_start = self.index;
        debug_assert_eq!(self.current(), '[');

        let node = self.graph.add_node("");
        if let Some(parent) = parent {
            let edge = self.graph.add_edge(parent, node, EdgeType::Dominance);
            self.frame_edges.insert(node, edge);
        }

        self.advance();
        if self.current() == '!' {
            self.graph.node_mut(node).negated = true;
            self.advance();
        }

        let mut closed = false;
        while !self.is_eos() {
            self.skip_ws();
            match self.current() {
                ',' => self.advance(),
                '[' => {
                    self.parse_node(Some(node))?;
                }
                ']' => {
                    closed = true;
                    self.advance();
                    break;
                }
                '{' => {
                    self.parse_disjunction(node)?;
                }
                '(' => {
                    let props = self.parse_property_group()?;
                    self.store_properties(node, props)?;
                }
                c if is_legal_id(c) => self.parse_constraint(node)?,
                '\0' => break,
                c => return Err(self.error(format!("illegal character '{}' in node", c))),
            }
        }

        if !closed {
            return Err(ParseError {
                position: node_start,
                message: "unclosed node definition".to_string(),
            });
        }

        Ok(node)
    }

    fn parse_disjunction(&mut self, parent: NodeId) -> Result<NodeId, ParseError> {
        let disjunction_start = self.index;
        debug_assert_eq!(self.current(), '{');

        let node = self.graph.add_node("");
        self.graph.node_mut(node).node_type = NodeType::Disjunction;
        let edge = self.graph.add_edge(parent, node, EdgeType::Dominance);
        self.frame_edges.insert(node, edge);

        self.advance();
        if self.current() == '!' {
            self.graph.node_mut(node).negated = true;
            self.advance();
        }

        let mut members = 0;
        let mut closed = false;
        while !self.is_eos() {
            self.skip_ws();
            match self.current() {
                ',' => self.advance(),
                '[' => {
                    self.parse_node(Some(node))?;
                    members += 1;
                }
                '}' => {
                    closed = true;
                    self.advance();
                    break;
                }
                '\0' => break,
                c => return Err(self.error(format!("illegal character '{}' in disjunction", c))),
            }
        }

        if !closed {
            return Err(ParseError {
                position: disjunction_start,
                message: "unclosed disjunction definition".to_string(),
            });
        }
        if members < 2 {
            return Err(ParseError {
                position: disjunction_start,
                message: format!("disjunction needs 2 or more member nodes, got {}", members),
            });
        }

        Ok(node)
    }

    fn parse_property_group(&mut self) -> Result<Vec<(String, String)>, ParseError> {
        let group_start = self.index;
        debug_assert_eq!(self.current(), '(');
        self.advance();

        let mut properties: Vec<(String, String)> = Vec::new();
        let mut closed = false;
        while !self.is_eos() {
            self.skip_ws();
            match self.current() {
                ',' => self.advance(),
                ')' => {
                    closed = true;
                    self.advance();
                    break;
                }
                c if is_legal_id(c) => {
                    let key = self.parse_id()?;
                    self.skip_ws();
                    if self.current() != '=' {
                        return Err(self.error("expected '=' after property key"));
                    }
                    self.advance();
                    self.skip_ws();
                    let value = self.parse_text()?;
                    if properties.iter().any(|(k, _)| *k == key) {
                        return Err(self.error(format!("duplicate property: {}", key)));
                    }
                    properties.push((key, value));
                }
                '\0' => break,
                c => return Err(self.error(format!("illegal character '{}' in properties", c))),
            }
        }

        if !closed {
            return Err(ParseError {
                position: group_start,
                message: "unclosed property group".to_string(),
            });
        }

        Ok(properties)
    }

    fn store_properties(
        &mut self,
        node: NodeId,
        props: Vec<(String, String)>,
    ) -> Result<(), ParseError> {
        let position = self.index;
        let entry = self.properties.entry(node).or_default();
        for (key, value) in props {
            if entry.iter().any(|(k, _)| *k == key) {
                return Err(ParseError {
                    position,
                    message: format!("duplicate property: {}", key),
                });
            }
            entry.push((key, value));
        }
        Ok(())
    }

    fn parse_constraint(&mut self, node: NodeId) -> Result<(), ParseError> {
        let fragment = self.parse_id()?;
        let specifier = if self.current() == '$' {
            self.advance();
            Some(self.parse_text()?)
        } else {
            None
        };

        // Resolve the token through the registry when one is present.
        let token = match self.registry {
            Some(registry) => {
                let resolved = if self.options.expand_tokens {
                    registry.complete(&fragment)
                } else {
                    registry.is_registered(&fragment).then_some(fragment.as_str())
                };
                resolved
                    .ok_or_else(|| {
                        self.error(format!(
                            "unrecognized constraint token fragment '{}'",
                            fragment
                        ))
                    })?
                    .to_string()
            }
            None => fragment.to_lowercase(),
        };

        self.skip_ws();
        let operator = self.parse_operator()?;
        if let Some(factory) = self.registry.and_then(|r| r.factory(&token)) {
            if !factory.supported_operators().contains(&operator) {
                return Err(self.error(format!(
                    "unsupported operator '{}' for token '{}'",
                    operator.symbol(),
                    token
                )));
            }
        }

        self.skip_ws();
        let mut value = self.parse_value(operator.supports_numeric())?;
        if let Some(factory) = self.registry.and_then(|r| r.factory(&token)) {
            value = factory
                .coerce(value, specifier.as_deref())
                .map_err(|e| self.error(e.to_string()))?;
        }

        let mut constraint = RawConstraint::new(token.clone(), value, operator);
        if let Some(specifier) = specifier {
            constraint = constraint.with_specifier(specifier);
        }

        let kind = self
            .registry
            .and_then(|r| r.factory(&token))
            .map(|f| f.kind())
            .unwrap_or(ConstraintKind::Node);
        match kind {
            ConstraintKind::Node => self.graph.node_mut(node).constraints.push(constraint),
            ConstraintKind::Edge => match self.frame_edges.get(&node) {
                Some(&edge) => self.graph.edge_mut(edge).constraints.push(constraint),
                None => {
                    return Err(self.error(format!(
                        "unexpected edge constraint '{}' on a root node",
                        token
                    )));
                }
            },
        }

        Ok(())
    }

    fn parse_operator(&mut self) -> Result<SearchOp, ParseError> {
        let first = self.current();
        if !is_operator_char(first) {
            return Err(self.error("expected a comparison operator"));
        }

        let second = self.peek();
        if is_operator_char(second) {
            let symbol: String = [first, second].iter().collect();
            if let Some(op) = SearchOp::from_symbol(&symbol) {
                self.advance();
                self.advance();
                return Ok(op);
            }
        }

        match SearchOp::from_symbol(&first.to_string()) {
            Some(op) => {
                self.advance();
                Ok(op)
            }
            None => Err(self.error(format!("illegal search operator '{}'", first))),
        }
    }

    fn parse_value(&mut self, numeric_allowed: bool) -> Result<Value, ParseError> {
        let c = self.current();
        if numeric_allowed && (c == '+' || c == '-' || c.is_ascii_digit()) {
            let mut literal = String::new();
            literal.push(c);
            self.advance();
            while !self.is_eos() {
                let c = self.current();
                if c == '.' || c.is_ascii_digit() {
                    literal.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            // Not a valid number after all, keep it as plain text.
            return Ok(Value::parse_number(&literal).unwrap_or(Value::Text(literal)));
        }

        let text = self.parse_text()?;
        if text == UNDEFINED_LABEL {
            return Ok(Value::Undefined);
        }
        Ok(Value::Text(text))
    }

    fn parse_text(&mut self) -> Result<String, ParseError> {
        match self.current() {
            '"' | '\'' => self.parse_quoted_text(),
            _ => self.parse_unquoted_text(),
        }
    }

    fn parse_unquoted_text(&mut self) -> Result<String, ParseError> {
        let mut buffer = String::new();
        while !self.is_eos() && is_legal_id(self.current()) {
            buffer.push(self.current());
            self.advance();
        }
        if buffer.is_empty() {
            return Err(self.error("expected an identifier or quoted text"));
        }
        Ok(buffer)
    }

    fn parse_quoted_text(&mut self) -> Result<String, ParseError> {
        let delimiter = self.current();
        let delimiter_start = self.index;
        self.advance();

        let mut buffer = String::new();
        let mut escape = false;
        let mut closed = false;
        while !self.is_eos() {
            let c = self.current();
            if escape {
                // Only delimiters need escaping; anything else keeps its
                // backslash so regex patterns stay untouched.
                if c != delimiter {
                    buffer.push('\\');
                }
                buffer.push(c);
                escape = false;
                self.advance();
            } else if c == '\\' {
                escape = true;
                self.advance();
            } else if c == delimiter {
                closed = true;
                self.advance();
                break;
            } else {
                buffer.push(c);
                self.advance();
            }
        }

        if !closed {
            return Err(ParseError {
                position: delimiter_start,
                message: format!("unclosed delimiter '{}'", delimiter),
            });
        }

        Ok(buffer)
    }

    fn parse_id(&mut self) -> Result<String, ParseError> {
        self.parse_unquoted_text()
    }

    // Post-processing: id assignment, type overrides, order resolution.

    fn finish(mut self) -> Result<PatternGraph, ParseError> {
        let mut id_map: FxHashMap<String, NodeId> = FxHashMap::default();
        let end = self.index;

        // Explicitly assigned node ids come first.
        for node in self.graph.node_ids().collect::<Vec<_>>() {
            let Some(props) = self.properties.get_mut(&node) else {
                continue;
            };
            let Some(pos) = props.iter().position(|(k, _)| k == ID_PROPERTY) else {
                continue;
            };
            let (_, id) = props.remove(pos);
            if id.is_empty() {
                continue;
            }
            if id_map.contains_key(&id) {
                return Err(ParseError {
                    position: end,
                    message: format!("duplicate static node id: {}", id),
                });
            }
            id_map.insert(id.clone(), node);
            self.graph.node_mut(node).id = id;
        }

        // Edges get generated names.
        let mut edge_names: FxHashSet<String> = FxHashSet::default();
        for edge in self.graph.edge_ids().collect::<Vec<_>>() {
            let name = format_name(&self.options.edge_name_pattern, edge);
            if id_map.contains_key(&name) || !edge_names.insert(name.clone()) {
                return Err(ParseError {
                    position: end,
                    message: format!("duplicate edge id: {}", name),
                });
            }
            self.graph.edge_mut(edge).id = name;
        }

        // Remaining nodes get generated names; type overrides apply here.
        let mut node_index = 0;
        for node in self.graph.node_ids().collect::<Vec<_>>() {
            if self.graph.node(node).id.is_empty() {
                let pattern = self
                    .properties
                    .get(&node)
                    .and_then(|props| {
                        props
                            .iter()
                            .find(|(k, _)| k == NODE_NAME_PATTERN_PROPERTY)
                            .map(|(_, v)| v.clone())
                    })
                    .unwrap_or_else(|| self.options.node_name_pattern.clone());
                if let Some(props) = self.properties.get_mut(&node) {
                    props.retain(|(k, _)| k != NODE_NAME_PATTERN_PROPERTY);
                }

                if !pattern.contains("%d")
                    && (id_map.contains_key(pattern.as_str()) || edge_names.contains(pattern.as_str()))
                {
                    return Err(ParseError {
                        position: end,
                        message: format!("duplicate static id: {}", pattern),
                    });
                }

                let mut id = format_name(&pattern, node_index);
                while id_map.contains_key(&id) || edge_names.contains(&id) {
                    node_index += 1;
                    id = format_name(&pattern, node_index);
                }
                node_index += 1;
                id_map.insert(id.clone(), node);
                self.graph.node_mut(node).id = id;
            }

            let Some(props) = self.properties.get_mut(&node) else {
                continue;
            };
            if let Some(pos) = props.iter().position(|(k, _)| k == NODE_TYPE_PROPERTY) {
                let (_, value) = props.remove(pos);
                let node_type = NodeType::parse(&value).ok_or_else(|| ParseError {
                    position: end,
                    message: format!("unknown node type: {}", value),
                })?;
                self.graph.node_mut(node).node_type = node_type;
            }
            if let Some(pos) = props.iter().position(|(k, _)| k == EDGE_TYPE_PROPERTY) {
                let (_, value) = props.remove(pos);
                let edge_type = EdgeType::parse(&value).ok_or_else(|| ParseError {
                    position: end,
                    message: format!("unknown edge type: {}", value),
                })?;
                let edge = self.frame_edges.get(&node).copied().ok_or_else(|| ParseError {
                    position: end,
                    message: "edge type override on a root node".to_string(),
                })?;
                self.graph.edge_mut(edge).edge_type = edge_type;
            }
        }

        // Everything left is an order declaration towards another node.
        self.resolve_order_properties(&id_map, end)?;

        Ok(self.graph)
    }

    fn resolve_order_properties(
        &mut self,
        id_map: &FxHashMap<String, NodeId>,
        end: usize,
    ) -> Result<(), ParseError> {
        let mut links: FxHashSet<(NodeId, NodeId)> = FxHashSet::default();
        let mut properties: Vec<(NodeId, Vec<(String, String)>)> =
            std::mem::take(&mut self.properties).into_iter().collect();
        properties.sort_by_key(|(node, _)| *node);

        for (node, props) in properties {
            for (key, value) in props {
                let mut parts = value.split(';');
                let order = parts.next().unwrap_or("").to_lowercase();
                let before = !order.is_empty() && "before".starts_with(&order);
                let after = !order.is_empty() && "after".starts_with(&order);
                if !before && !after {
                    return Err(ParseError {
                        position: end,
                        message: format!("unknown property assignment: '{}={}'", key, value),
                    });
                }

                let target = id_map.get(&key).copied().ok_or_else(|| ParseError {
                    position: end,
                    message: format!("unknown order target reference: {}", key),
                })?;

                // The order names where the referenced node stands relative
                // to the current one: `B=after` on A puts B after A, so the
                // precedence edge (source precedes target) runs A -> B.
                let (source, sink) = if after { (node, target) } else { (target, node) };
                if !links.insert((source, sink)) {
                    return Err(ParseError {
                        position: end,
                        message: format!(
                            "duplicate link: {}_{}",
                            self.graph.node(source).id,
                            self.graph.node(sink).id
                        ),
                    });
                }

                let edge = self.graph.add_edge(source, sink, EdgeType::Precedence);
                self.graph.edge_mut(edge).id = format_name(&self.options.edge_name_pattern, edge);

                for part in parts {
                    let constraint = parse_distance_constraint(part).ok_or_else(|| ParseError {
                        position: end,
                        message: format!("malformed distance declaration: '{}'", part),
                    })?;
                    self.graph.edge_mut(edge).constraints.push(constraint);
                }
            }
        }

        Ok(())
    }
}

/// Parse a `dist<op><n>` fragment of an order declaration.
fn parse_distance_constraint(s: &str) -> Option<RawConstraint> {
    let rest = s.strip_prefix(DISTANCE_PREFIX)?;
    let digits_at = rest.find(|c: char| c.is_ascii_digit())?;
    let operator = SearchOp::from_symbol(&rest[..digits_at])?;
    let value: i64 = rest[digits_at..].parse().ok()?;
    Some(RawConstraint::new("distance", Value::Int(value), operator))
}

// Serialization back to query text

fn write_query(graph: &PatternGraph) -> Result<String, WriteError> {
    if graph.is_empty() || graph.roots().is_empty() {
        return Err(WriteError::EmptyGraph);
    }

    // Nodes targeted by a precedence edge need their id spelled out.
    let mut referenced: FxHashSet<NodeId> = FxHashSet::default();
    for edge in graph.edge_ids() {
        if graph.edge(edge).edge_type == EdgeType::Precedence {
            referenced.insert(graph.edge(edge).target);
        }
    }

    let mut buffer = String::new();
    let disjunctive = graph.root_op == RootOp::Disjunction;
    if disjunctive {
        buffer.push('{');
    }
    for (i, root) in graph.roots().into_iter().enumerate() {
        if i > 0 {
            buffer.push(' ');
        }
        write_node(graph, root, None, &referenced, &mut buffer)?;
    }
    if disjunctive {
        buffer.push('}');
    }

    Ok(buffer)
}

fn write_node(
    graph: &PatternGraph,
    node: NodeId,
    incoming: Option<EdgeId>,
    referenced: &FxHashSet<NodeId>,
    buffer: &mut String,
) -> Result<(), WriteError> {
    buffer.push('[');
    if graph.node(node).negated {
        buffer.push_str("! ");
    }

    let mut properties: Vec<(String, String)> = Vec::new();
    if referenced.contains(&node) {
        properties.push((ID_PROPERTY.to_string(), graph.node(node).id.clone()));
    }
    for &edge_id in &graph.node(node).outgoing {
        let edge = graph.edge(edge_id);
        if edge.edge_type == EdgeType::Precedence {
            properties.push((
                graph.node(edge.target).id.clone(),
                order_value("after", &edge.constraints),
            ));
        }
    }
    if graph.node(node).node_type != NodeType::General
        && graph.node(node).node_type != NodeType::Disjunction
    {
        properties.push((
            NODE_TYPE_PROPERTY.to_string(),
            graph.node(node).node_type.token().to_string(),
        ));
    }
    if let Some(incoming) = incoming {
        let edge_type = graph.edge(incoming).edge_type;
        if edge_type != EdgeType::Dominance {
            properties.push((EDGE_TYPE_PROPERTY.to_string(), edge_type.token().to_string()));
        }
    }

    if !properties.is_empty() {
        buffer.push('(');
        for (i, (key, value)) in properties.iter().enumerate() {
            if i > 0 {
                buffer.push_str(", ");
            }
            buffer.push_str(key);
            buffer.push('=');
            write_text(value, buffer);
        }
        buffer.push_str(") ");
    }

    let mut wrote_constraint = false;
    if let Some(incoming) = incoming {
        wrote_constraint = write_constraints(&graph.edge(incoming).constraints, false, buffer);
    }
    wrote_constraint |= write_constraints(&graph.node(node).constraints, wrote_constraint, buffer);
    if wrote_constraint {
        buffer.push(' ');
    }

    for &edge_id in &graph.node(node).outgoing {
        let edge = graph.edge(edge_id);
        if !edge.edge_type.is_structural() {
            continue;
        }
        if graph.node(edge.target).node_type == NodeType::Disjunction {
            write_disjunction(graph, edge.target, referenced, buffer)?;
        } else {
            write_node(graph, edge.target, Some(edge_id), referenced, buffer)?;
        }
    }

    while buffer.ends_with(' ') {
        buffer.pop();
    }
    buffer.push(']');
    Ok(())
}

fn write_disjunction(
    graph: &PatternGraph,
    node: NodeId,
    referenced: &FxHashSet<NodeId>,
    buffer: &mut String,
) -> Result<(), WriteError> {
    buffer.push('{');
    if graph.node(node).negated {
        buffer.push_str("! ");
    }

    let mut members = 0;
    for &edge_id in &graph.node(node).outgoing {
        let edge = graph.edge(edge_id);
        if !edge.edge_type.is_structural() {
            continue;
        }
        write_node(graph, edge.target, Some(edge_id), referenced, buffer)?;
        members += 1;
    }
    if members < 2 {
        return Err(WriteError::MalformedDisjunction(graph.node(node).id.clone()));
    }

    buffer.push('}');
    Ok(())
}

fn order_value(order: &str, constraints: &[RawConstraint]) -> String {
    let mut value = order.to_string();
    for constraint in constraints {
        if constraint.is_undefined() || constraint.token != "distance" {
            continue;
        }
        value.push_str(&format!(
            ";{}{}{}",
            DISTANCE_PREFIX,
            constraint.operator.symbol(),
            constraint.value
        ));
    }
    value
}

fn write_constraints(
    constraints: &[RawConstraint],
    leading_comma: bool,
    buffer: &mut String,
) -> bool {
    let mut written = 0;
    for constraint in constraints {
        if constraint.is_undefined() {
            continue;
        }
        if leading_comma || written > 0 {
            buffer.push_str(", ");
        }
        buffer.push_str(&constraint.token);
        if let Some(specifier) = &constraint.specifier {
            buffer.push('$');
            write_text(specifier, buffer);
        }
        buffer.push_str(constraint.operator.symbol());
        write_text(&constraint.value.to_string(), buffer);
        written += 1;
    }
    written > 0
}

fn write_text(s: &str, buffer: &mut String) {
    let needs_quote = s.is_empty() || s.chars().any(|c| !is_legal_id(c));
    if !needs_quote {
        buffer.push_str(s);
        return;
    }
    let delimiter = if s.contains('"') { '\'' } else { '"' };
    buffer.push(delimiter);
    for c in s.chars() {
        if c == delimiter {
            buffer.push('\\');
        }
        buffer.push(c);
    }
    buffer.push(delimiter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConstraintRegistry;

    fn parse(query: &str) -> PatternGraph {
        let registry = ConstraintRegistry::standard();
        QueryParser::new(Some(&registry)).parse(query).unwrap()
    }

    fn parse_err(query: &str) -> ParseError {
        let registry = ConstraintRegistry::standard();
        QueryParser::new(Some(&registry)).parse(query).unwrap_err()
    }

    #[test]
    fn test_single_node_constraint() {
        let g = parse(r#"[form="bark"]"#);
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.roots().len(), 1);

        let node = g.node(0);
        assert_eq!(node.id, "node_0");
        assert_eq!(node.constraints.len(), 1);
        assert_eq!(node.constraints[0].token, "form");
        assert_eq!(node.constraints[0].operator, SearchOp::Equals);
        assert_eq!(node.constraints[0].value, Value::text("bark"));
    }

    #[test]
    fn test_unquoted_value_and_whitespace() {
        let g = parse("[ form = bark , pos = VERB ]");
        assert_eq!(g.node(0).constraints.len(), 2);
        assert_eq!(g.node(0).constraints[1].token, "pos");
        assert_eq!(g.node(0).constraints[1].value, Value::text("VERB"));
    }

    #[test]
    fn test_nested_nodes() {
        let g = parse(r#"[form="bark" [form="Dogs"] [form="loudly"]]"#);
        assert_eq!(g.node_count(), 3);
        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.roots(), vec![0]);
        assert_eq!(g.node(0).outgoing.len(), 2);
        assert_eq!(g.edge(0).edge_type, EdgeType::Dominance);
    }

    #[test]
    fn test_token_completion() {
        let g = parse(r#"[fo="bark"]"#);
        assert_eq!(g.node(0).constraints[0].token, "form");

        let err = parse_err(r#"[f="bark"]"#);
        assert!(err.message.contains("unrecognized constraint token"));
    }

    #[test]
    fn test_edge_constraint_goes_to_edge() {
        let g = parse(r#"[form="bark" [relation="nsubj"]]"#);
        assert!(g.node(1).constraints.is_empty());
        assert_eq!(g.edge(0).constraints.len(), 1);
        assert_eq!(g.edge(0).constraints[0].token, "relation");
    }

    #[test]
    fn test_edge_constraint_on_root_fails() {
        let err = parse_err(r#"[relation="nsubj"]"#);
        assert!(err.message.contains("unexpected edge constraint"));
    }

    #[test]
    fn test_negation() {
        let g = parse(r#"[form="bark" [! form="meow"]]"#);
        assert!(!g.node(0).negated);
        assert!(g.node(1).negated);
    }

    #[test]
    fn test_root_disjunction() {
        let g = parse(r#"{[form="meow"] [form="bark"]}"#);
        assert_eq!(g.root_op, RootOp::Disjunction);
        assert_eq!(g.roots().len(), 2);
    }

    #[test]
    fn test_nested_disjunction_node() {
        let g = parse(r#"[pos="VERB" {[form="cat"] [form="dog"]}]"#);
        assert_eq!(g.node_count(), 4);
        let disjunction = g
            .node_ids()
            .find(|&n| g.node(n).node_type == NodeType::Disjunction)
            .unwrap();
        assert_eq!(g.node(disjunction).outgoing.len(), 2);
    }

    #[test]
    fn test_disjunction_needs_two_members() {
        let err = parse_err(r#"[pos="VERB" {[form="cat"]}]"#);
        assert!(err.message.contains("2 or more member nodes"));
    }

    #[test]
    fn test_unclosed_node() {
        let err = parse_err(r#"[form="bark""#);
        assert_eq!(err.position, 0);
        assert!(err.message.contains("unclosed node"));
    }

    #[test]
    fn test_unclosed_quote() {
        let err = parse_err(r#"[form="bark]"#);
        assert!(err.message.contains("unclosed delimiter"));
    }

    #[test]
    fn test_quoted_escapes() {
        let g = parse(r#"[form="a\"b"]"#);
        assert_eq!(g.node(0).constraints[0].value, Value::text("a\"b"));

        // escaped non-delimiters keep their backslash for regex patterns
        let g = parse(r#"[form~"ba\w+"]"#);
        assert_eq!(g.node(0).constraints[0].value, Value::text("ba\\w+"));
    }

    #[test]
    fn test_explicit_ids_and_duplicates() {
        let g = parse(r#"[(id=head) form="bark" [(id=dep) form="Dogs"]]"#);
        assert_eq!(g.node(0).id, "head");
        assert_eq!(g.node(1).id, "dep");

        let err = parse_err(r#"[(id=a) form="x" [(id=a) form="y"]]"#);
        assert!(err.message.contains("duplicate static node id"));
    }

    #[test]
    fn test_generated_ids_skip_taken_names() {
        let g = parse(r#"[(id=node_0) form="x" [form="y"]]"#);
        assert_eq!(g.node(0).id, "node_0");
        assert_eq!(g.node(1).id, "node_1");
    }

    #[test]
    fn test_node_type_override() {
        let g = parse(r#"[(nodeType=leaf) form="x"]"#);
        assert_eq!(g.node(0).node_type, NodeType::Leaf);
    }

    #[test]
    fn test_edge_type_override() {
        let g = parse(r#"[form="x" [(edgeType=trans) form="y"]]"#);
        assert_eq!(g.edge(0).edge_type, EdgeType::Transitive);
    }

    #[test]
    fn test_precedence_property() {
        // `B=before` on A puts B before A in word order, edge B -> A
        let g = parse(r#"[form="x" [(id=A, B=before) form="y"] [(id=B) form="z"]]"#);
        let precedence: Vec<EdgeId> = g
            .edge_ids()
            .filter(|&e| g.edge(e).edge_type == EdgeType::Precedence)
            .collect();
        assert_eq!(precedence.len(), 1);
        let edge = g.edge(precedence[0]);
        assert_eq!(g.node(edge.source).id, "B");
        assert_eq!(g.node(edge.target).id, "A");
    }

    #[test]
    fn test_precedence_forward_reference() {
        // `B=after` on A puts B after A, edge A -> B; B is defined later
        let g = parse(r#"[form="x" [(id=A, B=after) form="y"] [(id=B) form="z"]]"#);
        let edge = g
            .edge_ids()
            .map(|e| g.edge(e))
            .find(|e| e.edge_type == EdgeType::Precedence)
            .unwrap();
        assert_eq!(g.node(edge.source).id, "A");
        assert_eq!(g.node(edge.target).id, "B");
    }

    #[test]
    fn test_precedence_with_distance() {
        let g = parse(r#"[form="x" [(id=A, B="before;dist<=3") form="y"] [(id=B) form="z"]]"#);
        let edge = g
            .edge_ids()
            .map(|e| g.edge(e))
            .find(|e| e.edge_type == EdgeType::Precedence)
            .unwrap();
        assert_eq!(edge.constraints.len(), 1);
        assert_eq!(edge.constraints[0].token, "distance");
        assert_eq!(edge.constraints[0].operator, SearchOp::LessOrEqual);
        assert_eq!(edge.constraints[0].value, Value::Int(3));
    }

    #[test]
    fn test_unresolved_order_target() {
        let err = parse_err(r#"[form="x" [(Missing=after) form="y"]]"#);
        assert!(err.message.contains("unknown order target reference"));
    }

    #[test]
    fn test_numeric_value() {
        let g = parse(r#"[pos="VERB" [distance<=3]]"#);
        assert_eq!(g.edge(0).constraints[0].value, Value::Int(3));
    }

    #[test]
    fn test_unsupported_operator_for_token() {
        let err = parse_err(r#"[pos="VERB" [distance#3]]"#);
        assert!(err.message.contains("unsupported operator"));
    }

    #[test]
    fn test_without_registry_everything_is_a_node_constraint() {
        let parser = QueryParser::new(None);
        let g = parser
            .parse(r#"[customtoken="v" [relation="nsubj"]]"#)
            .unwrap();
        assert_eq!(g.node(0).constraints[0].token, "customtoken");
        assert_eq!(g.node(1).constraints[0].token, "relation");
        assert!(g.edge(0).constraints.is_empty());
    }

    #[test]
    fn test_empty_query_gives_empty_graph() {
        let parser = QueryParser::new(None);
        assert!(parser.parse("   ").unwrap().is_empty());
    }

    #[test]
    fn test_round_trip() {
        let registry = ConstraintRegistry::standard();
        let parser = QueryParser::new(Some(&registry));
        let query = r#"[form="bark", pos="VERB" [! form="meow"] [relation="nsubj" [lemma="a"]]]"#;

        let graph = parser.parse(query).unwrap();
        let rendered = parser.to_query(&graph).unwrap();
        let reparsed = parser.parse(&rendered).unwrap();

        assert_eq!(graph.node_count(), reparsed.node_count());
        assert_eq!(graph.edge_count(), reparsed.edge_count());
        for n in graph.node_ids() {
            assert_eq!(graph.node(n).negated, reparsed.node(n).negated);
            assert_eq!(graph.node(n).constraints, reparsed.node(n).constraints);
        }
    }

    #[test]
    fn test_round_trip_precedence_and_types() {
        let registry = ConstraintRegistry::standard();
        let parser = QueryParser::new(Some(&registry));
        let query = r#"[(nodeType=root) form="x" [(id=A, B="before;dist<=3") form="y"] [(id=B, edgeType=trans) form="z"]]"#;

        let graph = parser.parse(query).unwrap();
        let rendered = parser.to_query(&graph).unwrap();
        let reparsed = parser.parse(&rendered).unwrap();

        assert_eq!(graph.node_count(), reparsed.node_count());
        assert_eq!(graph.edge_count(), reparsed.edge_count());
        let edge = reparsed
            .edge_ids()
            .map(|e| reparsed.edge(e))
            .find(|e| e.edge_type == EdgeType::Precedence)
            .unwrap();
        assert_eq!(edge.constraints[0].value, Value::Int(3));
        assert!(
            reparsed
                .edge_ids()
                .any(|e| reparsed.edge(e).edge_type == EdgeType::Transitive)
        );
    }

    #[test]
    fn test_serialize_empty_graph_fails() {
        let parser = QueryParser::new(None);
        assert_eq!(
            parser.to_query(&PatternGraph::new()),
            Err(WriteError::EmptyGraph)
        );
    }
}
