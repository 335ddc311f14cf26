//! Constraint operators and raw (unbound) constraints
//!
//! A raw constraint is what the parser produces: a token naming a registry
//! entry, a value, an operator and an optional specifier. Binding raw
//! constraints to executable ones happens in the compiler via the registry.

use std::fmt;

use regex::Regex;

/// Constraint value as written in a query.
///
/// `Undefined` is the explicit "no information" value; constraints whose
/// value is undefined (and that carry no specifier) are dropped before
/// matching.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Label used to write the undefined value in query text.
pub const UNDEFINED_LABEL: &str = "?";

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Parse a signed decimal literal, trying integers before floats.
    pub fn parse_number(s: &str) -> Option<Value> {
        if let Ok(i) = s.parse::<i64>() {
            return Some(Value::Int(i));
        }
        s.parse::<f64>().ok().map(Value::Float)
    }

    pub fn text(s: impl Into<String>) -> Value {
        Value::Text(s.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str(UNDEFINED_LABEL),
            Value::Text(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Comparison operator attached to a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchOp {
    Equals,
    EqualsNot,
    Matches,
    MatchesNot,
    Contains,
    ContainsNot,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

impl SearchOp {
    /// All operators, in the order they are tried when scanning query text.
    /// Two-character symbols come first so `!=` is not read as `!` + `=`.
    pub const ALL: [SearchOp; 10] = [
        SearchOp::EqualsNot,
        SearchOp::MatchesNot,
        SearchOp::ContainsNot,
        SearchOp::LessOrEqual,
        SearchOp::GreaterOrEqual,
        SearchOp::Equals,
        SearchOp::Matches,
        SearchOp::Contains,
        SearchOp::LessThan,
        SearchOp::GreaterThan,
    ];

    /// Operators applicable to numeric values.
    pub const NUMERICAL: [SearchOp; 6] = [
        SearchOp::Equals,
        SearchOp::EqualsNot,
        SearchOp::LessThan,
        SearchOp::LessOrEqual,
        SearchOp::GreaterThan,
        SearchOp::GreaterOrEqual,
    ];

    /// Operators applicable to two-valued (boolean) tokens.
    pub const BINARY: [SearchOp; 2] = [SearchOp::Equals, SearchOp::EqualsNot];

    pub fn symbol(&self) -> &'static str {
        match self {
            SearchOp::Equals => "=",
            SearchOp::EqualsNot => "!=",
            SearchOp::Matches => "~",
            SearchOp::MatchesNot => "!~",
            SearchOp::Contains => "#",
            SearchOp::ContainsNot => "!#",
            SearchOp::LessThan => "<",
            SearchOp::LessOrEqual => "<=",
            SearchOp::GreaterThan => ">",
            SearchOp::GreaterOrEqual => ">=",
        }
    }

    pub fn from_symbol(s: &str) -> Option<SearchOp> {
        SearchOp::ALL.iter().copied().find(|op| op.symbol() == s)
    }

    /// Whether values for this operator may be written as bare numbers.
    pub fn supports_numeric(&self) -> bool {
        SearchOp::NUMERICAL.contains(self)
    }

    /// Apply the operator to a text value. `regex` must be the compiled
    /// form of the constraint value when the operator is `~` or `!~`.
    pub fn apply_text(&self, value: &str, rhs: &str, regex: Option<&Regex>) -> bool {
        match self {
            SearchOp::Equals => value == rhs,
            SearchOp::EqualsNot => value != rhs,
            SearchOp::Matches => regex.is_some_and(|re| re.is_match(value)),
            SearchOp::MatchesNot => !regex.is_some_and(|re| re.is_match(value)),
            SearchOp::Contains => value.contains(rhs),
            SearchOp::ContainsNot => !value.contains(rhs),
            SearchOp::LessThan => value < rhs,
            SearchOp::LessOrEqual => value <= rhs,
            SearchOp::GreaterThan => value > rhs,
            SearchOp::GreaterOrEqual => value >= rhs,
        }
    }

    /// Apply the operator to an integer value. Substring/regex operators
    /// never hold for integers.
    pub fn apply_int(&self, value: i64, rhs: i64) -> bool {
        match self {
            SearchOp::Equals => value == rhs,
            SearchOp::EqualsNot => value != rhs,
            SearchOp::LessThan => value < rhs,
            SearchOp::LessOrEqual => value <= rhs,
            SearchOp::GreaterThan => value > rhs,
            SearchOp::GreaterOrEqual => value >= rhs,
            SearchOp::Matches | SearchOp::MatchesNot | SearchOp::Contains | SearchOp::ContainsNot => {
                false
            }
        }
    }
}

impl fmt::Display for SearchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Integer-only operator used for precedence distance checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Equals,
    EqualsNot,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

impl IntOp {
    pub fn apply(&self, value: i64, rhs: i64) -> bool {
        match self {
            IntOp::Equals => value == rhs,
            IntOp::EqualsNot => value != rhs,
            IntOp::LessThan => value < rhs,
            IntOp::LessOrEqual => value <= rhs,
            IntOp::GreaterThan => value > rhs,
            IntOp::GreaterOrEqual => value >= rhs,
        }
    }

    pub fn from_symbol(s: &str) -> Option<IntOp> {
        match s {
            "=" => Some(IntOp::Equals),
            "!=" => Some(IntOp::EqualsNot),
            "<" => Some(IntOp::LessThan),
            "<=" => Some(IntOp::LessOrEqual),
            ">" => Some(IntOp::GreaterThan),
            ">=" => Some(IntOp::GreaterOrEqual),
            _ => None,
        }
    }

    pub fn from_search_op(op: SearchOp) -> Option<IntOp> {
        IntOp::from_symbol(op.symbol())
    }
}

/// A constraint as parsed from query text, not yet bound to a capability.
#[derive(Debug, Clone, PartialEq)]
pub struct RawConstraint {
    pub token: String,
    pub value: Value,
    pub operator: SearchOp,
    pub specifier: Option<String>,
    pub active: bool,
}

impl RawConstraint {
    pub fn new(token: impl Into<String>, value: Value, operator: SearchOp) -> Self {
        Self {
            token: token.into(),
            value,
            operator,
            specifier: None,
            active: true,
        }
    }

    pub fn with_specifier(mut self, specifier: impl Into<String>) -> Self {
        self.specifier = Some(specifier.into());
        self
    }

    /// A constraint is undefined when neither value nor specifier carry
    /// information. Undefined constraints never participate in matching.
    pub fn is_undefined(&self) -> bool {
        self.value.is_undefined() && self.specifier.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_symbols_round_trip() {
        for op in SearchOp::ALL {
            assert_eq!(SearchOp::from_symbol(op.symbol()), Some(op));
        }
        assert_eq!(SearchOp::from_symbol("=~"), None);
    }

    #[test]
    fn test_apply_text() {
        assert!(SearchOp::Equals.apply_text("bark", "bark", None));
        assert!(SearchOp::EqualsNot.apply_text("bark", "meow", None));
        assert!(SearchOp::Contains.apply_text("barking", "bark", None));
        assert!(SearchOp::ContainsNot.apply_text("bark", "meow", None));

        let re = Regex::new("^ba.k$").unwrap();
        assert!(SearchOp::Matches.apply_text("bark", "^ba.k$", Some(&re)));
        assert!(!SearchOp::MatchesNot.apply_text("bark", "^ba.k$", Some(&re)));
    }

    #[test]
    fn test_apply_int() {
        assert!(SearchOp::LessOrEqual.apply_int(2, 2));
        assert!(SearchOp::GreaterThan.apply_int(3, 2));
        assert!(!SearchOp::Contains.apply_int(12, 1));
    }

    #[test]
    fn test_int_op_from_search_op() {
        assert_eq!(IntOp::from_search_op(SearchOp::LessOrEqual), Some(IntOp::LessOrEqual));
        assert_eq!(IntOp::from_search_op(SearchOp::Matches), None);
    }

    #[test]
    fn test_number_parsing() {
        assert_eq!(Value::parse_number("3"), Some(Value::Int(3)));
        assert_eq!(Value::parse_number("-2"), Some(Value::Int(-2)));
        assert_eq!(Value::parse_number("1.5"), Some(Value::Float(1.5)));
        assert_eq!(Value::parse_number("abc"), None);
    }

    #[test]
    fn test_undefined_constraint() {
        let c = RawConstraint::new("form", Value::Undefined, SearchOp::Equals);
        assert!(c.is_undefined());

        let c = c.with_specifier("Tense");
        assert!(!c.is_undefined());

        let c = RawConstraint::new("form", Value::text("bark"), SearchOp::Equals);
        assert!(!c.is_undefined());
    }
}
