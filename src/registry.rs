//! Constraint registry
//!
//! Maps textual constraint tokens (e.g. `form`) to pluggable capabilities
//! that know their supported operators, whether they constrain a node or an
//! edge, and how to coerce values. The registry is consulted while parsing
//! and compiling only; at execution time every constraint is already bound
//! to a [`CompiledConstraint`] instance.

use regex::{Regex, RegexBuilder};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::constraint::{RawConstraint, SearchOp, Value};
use crate::corpus::{FLAG_PROJECTIVE, HEAD_UNDEFINED};
use crate::search::SearchOptions;
use crate::target::TargetTree;

/// Whether a token constrains a node or the edge leading to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Node,
    Edge,
}

/// Registration failures. The registry is never left in a partial state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate constraint token: {0}")]
    DuplicateToken(String),
    #[error("duplicate alias: {0}")]
    DuplicateAlias(String),
    #[error("unknown constraint token: {0}")]
    UnknownToken(String),
}

/// Failure to turn a raw constraint into an executable one.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("unsupported operator '{operator}' for token '{token}'")]
    UnsupportedOperator { token: String, operator: SearchOp },
    #[error("invalid value for token '{token}': {message}")]
    InvalidValue { token: String, message: String },
}

/// An executable constraint, bound to its capability and value.
pub trait CompiledConstraint: Send + Sync {
    /// Test the target-tree node (or its incoming edge) under the cursor.
    fn matches(&self, tree: &TargetTree) -> bool;
}

/// Capability behind one constraint token.
pub trait ConstraintFactory: Send + Sync {
    fn token(&self) -> &'static str;

    fn kind(&self) -> ConstraintKind;

    fn supported_operators(&self) -> &'static [SearchOp];

    fn default_value(&self, _specifier: Option<&str>) -> Value {
        Value::Undefined
    }

    /// Coerce a parsed label into the value domain of this token.
    fn coerce(&self, value: Value, _specifier: Option<&str>) -> Result<Value, BindError> {
        Ok(value)
    }

    /// Bind a raw constraint into an executable one.
    fn bind(
        &self,
        constraint: &RawConstraint,
        options: &SearchOptions,
    ) -> Result<Box<dyn CompiledConstraint>, BindError>;

    /// Operator support check shared by all factories.
    fn check_operator(&self, operator: SearchOp) -> Result<(), BindError> {
        if self.supported_operators().contains(&operator) {
            return Ok(());
        }
        Err(BindError::UnsupportedOperator {
            token: self.token().to_string(),
            operator,
        })
    }
}

/// Explicit registry value, constructed at startup and passed by reference
/// into the parser and compiler. No ambient state.
#[derive(Default)]
pub struct ConstraintRegistry {
    factories: Vec<Box<dyn ConstraintFactory>>,
    index: FxHashMap<String, usize>,
    aliases: FxHashMap<String, String>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry of word-level capabilities the crate ships with.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for factory in [
            Box::new(StringFieldFactory::new("form", Field::Form)) as Box<dyn ConstraintFactory>,
            Box::new(StringFieldFactory::new("lemma", Field::Lemma)),
            Box::new(StringFieldFactory::new("pos", Field::Pos)),
            Box::new(StringFieldFactory::features()),
            Box::new(StringFieldFactory::relation()),
            Box::new(DistanceFactory),
            Box::new(ProjectivityFactory),
        ] {
            registry
                .register(factory)
                .expect("standard tokens are distinct");
        }
        registry
            .alias("deprel", "relation")
            .expect("relation token exists");
        registry
    }

    pub fn register(&mut self, factory: Box<dyn ConstraintFactory>) -> Result<(), RegistryError> {
        let token = factory.token().to_lowercase();
        if self.index.contains_key(&token) {
            return Err(RegistryError::DuplicateToken(token));
        }
        self.index.insert(token, self.factories.len());
        self.factories.push(factory);
        Ok(())
    }

    /// Register a case-insensitive alias for an existing token.
    pub fn alias(&mut self, alias: &str, token: &str) -> Result<(), RegistryError> {
        let alias = alias.to_lowercase();
        let token = token.to_lowercase();
        if !self.index.contains_key(&token) {
            return Err(RegistryError::UnknownToken(token));
        }
        if self.aliases.contains_key(&alias) || self.index.contains_key(&alias) {
            return Err(RegistryError::DuplicateAlias(alias));
        }
        self.aliases.insert(alias, token);
        Ok(())
    }

    pub fn is_registered(&self, token: &str) -> bool {
        self.index.contains_key(&token.to_lowercase())
    }

    pub fn factory(&self, token: &str) -> Option<&dyn ConstraintFactory> {
        let token = token.to_lowercase();
        let token = self.aliases.get(&token).unwrap_or(&token);
        self.index.get(token).map(|&i| self.factories[i].as_ref())
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|f| f.token())
    }

    /// Complete a token fragment by unambiguous prefix, case-insensitively.
    /// An exact token or alias always wins; otherwise the fragment must
    /// prefix exactly one registered token (possibly through aliases).
    pub fn complete(&self, fragment: &str) -> Option<&str> {
        if fragment.is_empty() {
            return None;
        }
        let fragment = fragment.to_lowercase();

        if let Some(&i) = self.index.get(&fragment) {
            return Some(self.factories[i].token());
        }
        if let Some(token) = self.aliases.get(&fragment) {
            return self.factory(token).map(|f| f.token());
        }

        let mut candidate: Option<&str> = None;
        let names = self
            .index
            .keys()
            .map(|t| (t.as_str(), t.as_str()))
            .chain(self.aliases.iter().map(|(a, t)| (a.as_str(), t.as_str())));
        for (name, token) in names {
            if !name.starts_with(&fragment) {
                continue;
            }
            match candidate {
                None => candidate = Some(token),
                Some(existing) if existing == token => {}
                Some(_) => return None,
            }
        }
        candidate.and_then(|token| self.factory(token)).map(|f| f.token())
    }
}

// Standard word-level capabilities

/// Annotation field a string constraint reads from the target tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Form,
    Lemma,
    Pos,
    Features,
    Relation,
}

impl Field {
    fn fetch<'t>(&self, tree: &'t TargetTree) -> &'t str {
        match self {
            Field::Form => tree.form(),
            Field::Lemma => tree.lemma(),
            Field::Pos => tree.pos(),
            Field::Features => tree.features(),
            Field::Relation => tree.relation(),
        }
    }
}

struct StringFieldFactory {
    token: &'static str,
    field: Field,
    kind: ConstraintKind,
    operators: &'static [SearchOp],
}

impl StringFieldFactory {
    fn new(token: &'static str, field: Field) -> Self {
        Self {
            token,
            field,
            kind: ConstraintKind::Node,
            operators: &SearchOp::ALL,
        }
    }

    fn features() -> Self {
        const OPS: [SearchOp; 6] = [
            SearchOp::Equals,
            SearchOp::EqualsNot,
            SearchOp::Contains,
            SearchOp::ContainsNot,
            SearchOp::Matches,
            SearchOp::MatchesNot,
        ];
        Self {
            token: "features",
            field: Field::Features,
            kind: ConstraintKind::Node,
            operators: &OPS,
        }
    }

    fn relation() -> Self {
        Self {
            token: "relation",
            field: Field::Relation,
            kind: ConstraintKind::Edge,
            operators: &SearchOp::ALL,
        }
    }
}

impl ConstraintFactory for StringFieldFactory {
    fn token(&self) -> &'static str {
        self.token
    }

    fn kind(&self) -> ConstraintKind {
        self.kind
    }

    fn supported_operators(&self) -> &'static [SearchOp] {
        self.operators
    }

    fn bind(
        &self,
        constraint: &RawConstraint,
        options: &SearchOptions,
    ) -> Result<Box<dyn CompiledConstraint>, BindError> {
        self.check_operator(constraint.operator)?;

        let value = match &constraint.value {
            Value::Text(s) => s.clone(),
            other => other.to_string(),
        };

        let regex = match constraint.operator {
            SearchOp::Matches | SearchOp::MatchesNot => Some(
                RegexBuilder::new(&value)
                    .case_insensitive(!options.case_sensitive)
                    .build()
                    .map_err(|e| BindError::InvalidValue {
                        token: self.token.to_string(),
                        message: e.to_string(),
                    })?,
            ),
            _ => None,
        };

        let case_sensitive = options.case_sensitive;
        Ok(Box::new(StringConstraint {
            field: self.field,
            value: if case_sensitive { value } else { value.to_lowercase() },
            operator: constraint.operator,
            regex,
            case_sensitive,
        }))
    }
}

struct StringConstraint {
    field: Field,
    value: String,
    operator: SearchOp,
    regex: Option<Regex>,
    case_sensitive: bool,
}

impl CompiledConstraint for StringConstraint {
    fn matches(&self, tree: &TargetTree) -> bool {
        let observed = self.field.fetch(tree);
        if self.case_sensitive {
            self.operator
                .apply_text(observed, &self.value, self.regex.as_ref())
        } else {
            let lowered = observed.to_lowercase();
            self.operator
                .apply_text(&lowered, &self.value, self.regex.as_ref())
        }
    }
}

/// Linear head distance of the candidate's incoming edge.
struct DistanceFactory;

impl ConstraintFactory for DistanceFactory {
    fn token(&self) -> &'static str {
        "distance"
    }

    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Edge
    }

    fn supported_operators(&self) -> &'static [SearchOp] {
        &SearchOp::NUMERICAL
    }

    fn coerce(&self, value: Value, _specifier: Option<&str>) -> Result<Value, BindError> {
        match value {
            Value::Int(_) | Value::Undefined => Ok(value),
            Value::Text(ref s) => match s.parse::<i64>() {
                Ok(i) => Ok(Value::Int(i)),
                Err(_) => Err(BindError::InvalidValue {
                    token: "distance".to_string(),
                    message: format!("expected an integer, got '{}'", s),
                }),
            },
            other => Err(BindError::InvalidValue {
                token: "distance".to_string(),
                message: format!("expected an integer, got '{}'", other),
            }),
        }
    }

    fn bind(
        &self,
        constraint: &RawConstraint,
        _options: &SearchOptions,
    ) -> Result<Box<dyn CompiledConstraint>, BindError> {
        self.check_operator(constraint.operator)?;
        let value = match self.coerce(constraint.value.clone(), constraint.specifier.as_deref())? {
            Value::Int(i) => i,
            other => {
                return Err(BindError::InvalidValue {
                    token: "distance".to_string(),
                    message: format!("expected an integer, got '{}'", other),
                });
            }
        };
        Ok(Box::new(DistanceConstraint {
            operator: constraint.operator,
            value,
        }))
    }
}

struct DistanceConstraint {
    operator: SearchOp,
    value: i64,
}

impl CompiledConstraint for DistanceConstraint {
    fn matches(&self, tree: &TargetTree) -> bool {
        let distance = tree.distance();
        // Roots and dangling tokens have no incoming edge to measure.
        if distance == HEAD_UNDEFINED {
            return false;
        }
        self.operator.apply_int(distance as i64, self.value)
    }
}

/// Projectivity flag of the candidate's incoming edge.
struct ProjectivityFactory;

impl ConstraintFactory for ProjectivityFactory {
    fn token(&self) -> &'static str {
        "projectivity"
    }

    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Edge
    }

    fn supported_operators(&self) -> &'static [SearchOp] {
        &SearchOp::BINARY
    }

    fn coerce(&self, value: Value, _specifier: Option<&str>) -> Result<Value, BindError> {
        match value {
            Value::Bool(_) | Value::Undefined => Ok(value),
            Value::Text(ref s) => match s.to_lowercase().parse::<bool>() {
                Ok(b) => Ok(Value::Bool(b)),
                Err(_) => Err(BindError::InvalidValue {
                    token: "projectivity".to_string(),
                    message: format!("expected true or false, got '{}'", s),
                }),
            },
            other => Err(BindError::InvalidValue {
                token: "projectivity".to_string(),
                message: format!("expected true or false, got '{}'", other),
            }),
        }
    }

    fn bind(
        &self,
        constraint: &RawConstraint,
        _options: &SearchOptions,
    ) -> Result<Box<dyn CompiledConstraint>, BindError> {
        self.check_operator(constraint.operator)?;
        let value = match self.coerce(constraint.value.clone(), constraint.specifier.as_deref())? {
            Value::Bool(b) => b,
            other => {
                return Err(BindError::InvalidValue {
                    token: "projectivity".to_string(),
                    message: format!("expected true or false, got '{}'", other),
                });
            }
        };
        Ok(Box::new(ProjectivityConstraint {
            operator: constraint.operator,
            value,
        }))
    }
}

struct ProjectivityConstraint {
    operator: SearchOp,
    value: bool,
}

impl CompiledConstraint for ProjectivityConstraint {
    fn matches(&self, tree: &TargetTree) -> bool {
        let observed = tree.is_flag_set(FLAG_PROJECTIVE);
        match self.operator {
            SearchOp::Equals => observed == self.value,
            SearchOp::EqualsNot => observed != self.value,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{HEAD_ROOT, Sentence};

    fn tree_at<'a>(sentence: &'a Sentence, index: usize) -> TargetTree<'a> {
        let mut tree = TargetTree::new();
        tree.reload(sentence).unwrap();
        tree.view_node(index);
        tree
    }

    fn bind(
        registry: &ConstraintRegistry,
        token: &str,
        value: Value,
        operator: SearchOp,
        options: &SearchOptions,
    ) -> Box<dyn CompiledConstraint> {
        registry
            .factory(token)
            .unwrap()
            .bind(&RawConstraint::new(token, value, operator), options)
            .unwrap()
    }

    #[test]
    fn test_duplicate_token_rejected() {
        let mut registry = ConstraintRegistry::standard();
        let err = registry.register(Box::new(StringFieldFactory::new("form", Field::Form)));
        assert_eq!(err, Err(RegistryError::DuplicateToken("form".to_string())));
        // the failed registration must not corrupt existing entries
        assert!(registry.factory("form").is_some());
    }

    #[test]
    fn test_prefix_completion() {
        let registry = ConstraintRegistry::standard();
        assert_eq!(registry.complete("fo"), Some("form"));
        assert_eq!(registry.complete("LEM"), Some("lemma"));
        assert_eq!(registry.complete("f"), None); // form vs features
        assert_eq!(registry.complete("xyz"), None);
        // alias prefix completes to its target token
        assert_eq!(registry.complete("dep"), Some("relation"));
        // exact token wins even when it prefixes nothing else
        assert_eq!(registry.complete("pos"), Some("pos"));
    }

    #[test]
    fn test_form_constraint() {
        let registry = ConstraintRegistry::standard();
        let sentence = Sentence::new(&["Dogs", "bark"], &[1, HEAD_ROOT]);
        let options = SearchOptions::default();

        let c = bind(&registry, "form", Value::text("bark"), SearchOp::Equals, &options);
        let mut tree = tree_at(&sentence, 1);
        assert!(c.matches(&tree));
        tree.view_node(0);
        assert!(!c.matches(&tree));
    }

    #[test]
    fn test_case_insensitive_form() {
        let registry = ConstraintRegistry::standard();
        let sentence = Sentence::new(&["Dogs"], &[HEAD_ROOT]);
        let options = SearchOptions { case_sensitive: false, ..SearchOptions::default() };

        let c = bind(&registry, "form", Value::text("dogs"), SearchOp::Equals, &options);
        let tree = tree_at(&sentence, 0);
        assert!(c.matches(&tree));
    }

    #[test]
    fn test_regex_constraint() {
        let registry = ConstraintRegistry::standard();
        let sentence = Sentence::new(&["barking"], &[HEAD_ROOT]);
        let options = SearchOptions::default();

        let c = bind(&registry, "form", Value::text("^bark"), SearchOp::Matches, &options);
        let tree = tree_at(&sentence, 0);
        assert!(c.matches(&tree));

        let c = bind(&registry, "form", Value::text("^meow"), SearchOp::MatchesNot, &options);
        assert!(c.matches(&tree));
    }

    #[test]
    fn test_invalid_regex_is_a_bind_error() {
        let registry = ConstraintRegistry::standard();
        let options = SearchOptions::default();
        let raw = RawConstraint::new("form", Value::text("("), SearchOp::Matches);
        let err = registry.factory("form").unwrap().bind(&raw, &options);
        assert!(matches!(err, Err(BindError::InvalidValue { .. })));
    }

    #[test]
    fn test_distance_constraint() {
        let registry = ConstraintRegistry::standard();
        let sentence = Sentence::new(&["a", "b", "c"], &[1, HEAD_ROOT, 0]);
        let options = SearchOptions::default();

        let c = bind(&registry, "distance", Value::text("2"), SearchOp::Equals, &options);
        let mut tree = tree_at(&sentence, 2);
        assert!(c.matches(&tree)); // head 0, position 2
        tree.view_node(0);
        assert!(!c.matches(&tree)); // distance 1
        tree.view_node(1);
        assert!(!c.matches(&tree)); // root, no incoming edge
    }

    #[test]
    fn test_unsupported_operator() {
        let registry = ConstraintRegistry::standard();
        let options = SearchOptions::default();
        let raw = RawConstraint::new("distance", Value::Int(2), SearchOp::Contains);
        let err = registry.factory("distance").unwrap().bind(&raw, &options);
        assert_eq!(
            err.err(),
            Some(BindError::UnsupportedOperator {
                token: "distance".to_string(),
                operator: SearchOp::Contains,
            })
        );
    }

    #[test]
    fn test_projectivity_constraint() {
        let registry = ConstraintRegistry::standard();
        let sentence =
            Sentence::new(&["a", "b"], &[1, HEAD_ROOT]).with_flags(&[FLAG_PROJECTIVE, 0]);
        let options = SearchOptions::default();

        let c = bind(&registry, "projectivity", Value::text("true"), SearchOp::Equals, &options);
        let mut tree = tree_at(&sentence, 0);
        assert!(c.matches(&tree));
        tree.view_node(1);
        assert!(!c.matches(&tree));
    }
}
