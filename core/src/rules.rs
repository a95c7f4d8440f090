//! # Trip Rule Engine
//!
//! A small boolean DSL evaluated over a keyed data-point map. The sniffer
//! feeds GOOSE booleans into the map as `<gocbRef>/data<N>` paths and calls
//! `evaluate` after every frame; the first enabled rule that fires is
//! reported with its name, source expression and an epoch-microsecond
//! timestamp.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or          := and ( "||" and )*
//! and         := not ( "&&" not )*
//! not         := "!" not | comparison
//! comparison  := primary ( ("==" | "!=" | ">" | "<" | ">=" | "<=") value )?
//! primary     := identifier | "(" or ")"
//! ```
//!
//! Identifiers are paths of alphanumerics plus `_`, `/` and `.`. A lone `=`
//! is not a token. Comparison literals are typed at evaluation time against
//! the data point they compare to: booleans accept only `==`/`!=` against
//! `true|false|1|0`, integers compare numerically, floats compare with a
//! 1e-6 tolerance for equality. A comparison against a missing data point is
//! false. A bare identifier evaluates its point's truthiness.
//!
//! The engine is not internally thread-safe; the sniffer thread owns it
//! exclusively, and rules are installed before the thread starts.

use crate::iec61850::utils::epoch_micros;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Discriminated value of one data point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleValue {
    Bool(bool),
    Int(i32),
    Float(f64),
}

impl From<bool> for RuleValue {
    fn from(v: bool) -> Self {
        RuleValue::Bool(v)
    }
}

impl From<i32> for RuleValue {
    fn from(v: i32) -> Self {
        RuleValue::Int(v)
    }
}

impl From<f64> for RuleValue {
    fn from(v: f64) -> Self {
        RuleValue::Float(v)
    }
}

/// Errors surfaced by the rule engine.
///
/// # Variants
///
/// * `Parse`: The expression was rejected, with the character position.
/// * `EvalType`: A literal did not fit the data point's type at evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleError {
    Parse { position: usize, message: String },
    EvalType { message: String },
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RuleError::Parse { position, message } => {
                write!(f, "Parse error at position {}: {}", position, message)
            }
            RuleError::EvalType { message } => write!(f, "Type error: {}", message),
        }
    }
}

impl std::error::Error for RuleError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
}

#[derive(Debug, Clone)]
enum RuleNode {
    /// Truthiness of a data point: bool value, int != 0, float != 0.
    Identifier { path: String },
    Comparison {
        path: String,
        op: CompareOp,
        literal: String,
    },
    And(Box<RuleNode>, Box<RuleNode>),
    Or(Box<RuleNode>, Box<RuleNode>),
    Not(Box<RuleNode>),
}

impl RuleNode {
    fn evaluate(&self, points: &HashMap<String, RuleValue>) -> Result<bool, RuleError> {
        match self {
            RuleNode::Identifier { path } => Ok(match points.get(path) {
                Some(RuleValue::Bool(b)) => *b,
                Some(RuleValue::Int(i)) => *i != 0,
                Some(RuleValue::Float(x)) => *x != 0.0,
                None => false,
            }),
            RuleNode::Comparison { path, op, literal } => {
                let Some(value) = points.get(path) else {
                    return Ok(false);
                };
                compare(value, *op, literal, path)
            }
            // Short-circuit; the right side may reference missing points.
            RuleNode::And(left, right) => {
                Ok(left.evaluate(points)? && right.evaluate(points)?)
            }
            RuleNode::Or(left, right) => Ok(left.evaluate(points)? || right.evaluate(points)?),
            RuleNode::Not(inner) => Ok(!inner.evaluate(points)?),
        }
    }
}

fn compare(
    value: &RuleValue,
    op: CompareOp,
    literal: &str,
    path: &str,
) -> Result<bool, RuleError> {
    match value {
        RuleValue::Bool(actual) => {
            let expected = match literal {
                "true" | "1" => true,
                "false" | "0" => false,
                other => {
                    return Err(RuleError::EvalType {
                        message: format!(
                            "boolean point '{}' compared against '{}'",
                            path, other
                        ),
                    })
                }
            };
            match op {
                CompareOp::Equals => Ok(*actual == expected),
                CompareOp::NotEquals => Ok(*actual != expected),
                // Ordering operators are meaningless on booleans.
                _ => Ok(false),
            }
        }
        RuleValue::Int(actual) => {
            let expected: i32 = literal.parse().map_err(|_| RuleError::EvalType {
                message: format!("integer point '{}' compared against '{}'", path, literal),
            })?;
            Ok(match op {
                CompareOp::Equals => *actual == expected,
                CompareOp::NotEquals => *actual != expected,
                CompareOp::GreaterThan => *actual > expected,
                CompareOp::LessThan => *actual < expected,
                CompareOp::GreaterEqual => *actual >= expected,
                CompareOp::LessEqual => *actual <= expected,
            })
        }
        RuleValue::Float(actual) => {
            let expected: f64 = literal.parse().map_err(|_| RuleError::EvalType {
                message: format!("float point '{}' compared against '{}'", path, literal),
            })?;
            Ok(match op {
                CompareOp::Equals => (actual - expected).abs() < 1e-6,
                CompareOp::NotEquals => (actual - expected).abs() >= 1e-6,
                CompareOp::GreaterThan => *actual > expected,
                CompareOp::LessThan => *actual < expected,
                CompareOp::GreaterEqual => *actual >= expected,
                CompareOp::LessEqual => *actual <= expected,
            })
        }
    }
}

/// One installed rule.
#[derive(Debug, Clone)]
pub struct TripRule {
    pub name: String,
    pub expression: String,
    pub enabled: bool,
    ast: RuleNode,
}

/// Outcome of one evaluation pass.
///
/// # Fields
///
/// * `triggered`: True when an enabled rule fired.
/// * `rule_name` / `expression`: Identity of the first rule that fired.
/// * `message`: Human-readable summary, also carrying evaluation
///   diagnostics on a type error.
/// * `timestamp_us`: Epoch microseconds of the evaluation.
#[derive(Debug, Clone, Default)]
pub struct TripRuleResult {
    pub triggered: bool,
    pub rule_name: String,
    pub expression: String,
    pub message: String,
    pub timestamp_us: u64,
}

/// Parses and evaluates trip rules over the data-point map.
#[derive(Default)]
pub struct TripRuleEvaluator {
    rules: BTreeMap<String, TripRule>,
    data_points: HashMap<String, RuleValue>,
    last_error: String,
}

impl TripRuleEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `expression` and installs it under `name`, replacing any rule
    /// of the same name.
    ///
    /// # Returns
    ///
    /// * `Err(RuleError::Parse)`: The expression is rejected and nothing is
    ///   installed; `last_error` carries the same diagnostic.
    pub fn add_rule(&mut self, name: &str, expression: &str) -> Result<(), RuleError> {
        self.last_error.clear();
        let ast = Parser::new(expression).parse().map_err(|e| {
            self.last_error = e.to_string();
            e
        })?;
        self.rules.insert(
            name.to_string(),
            TripRule {
                name: name.to_string(),
                expression: expression.to_string(),
                enabled: true,
                ast,
            },
        );
        Ok(())
    }

    pub fn remove_rule(&mut self, name: &str) {
        self.rules.remove(name);
    }

    pub fn clear_rules(&mut self) {
        self.rules.clear();
    }

    pub fn set_rule_enabled(&mut self, name: &str, enabled: bool) {
        if let Some(rule) = self.rules.get_mut(name) {
            rule.enabled = enabled;
        }
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    pub fn rule_expression(&self, name: &str) -> Option<&str> {
        self.rules.get(name).map(|r| r.expression.as_str())
    }

    pub fn is_rule_enabled(&self, name: &str) -> bool {
        self.rules.get(name).map(|r| r.enabled).unwrap_or(false)
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Inserts or replaces a data point; last write wins across frames.
    pub fn update_data_point(&mut self, path: &str, value: impl Into<RuleValue>) {
        self.data_points.insert(path.to_string(), value.into());
    }

    pub fn data_point(&self, path: &str) -> Option<RuleValue> {
        self.data_points.get(path).copied()
    }

    /// Evaluates the enabled rules in name order and returns the first that
    /// fires; remaining rules are not evaluated this cycle. An evaluation
    /// type error yields a non-triggered result carrying the diagnostic.
    pub fn evaluate(&mut self) -> TripRuleResult {
        let mut result = TripRuleResult {
            timestamp_us: epoch_micros(),
            ..Default::default()
        };

        for rule in self.rules.values() {
            if !rule.enabled {
                continue;
            }
            match rule.ast.evaluate(&self.data_points) {
                Ok(true) => {
                    result.triggered = true;
                    result.rule_name = rule.name.clone();
                    result.expression = rule.expression.clone();
                    result.message = format!("Trip rule triggered: {}", rule.expression);
                    return result;
                }
                Ok(false) => {}
                Err(e) => {
                    result.message = format!("Error evaluating rule '{}': {}", rule.name, e);
                    return result;
                }
            }
        }

        result.message = "No trip rules triggered".to_string();
        result
    }
}

struct Parser<'a> {
    chars: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(expression: &'a str) -> Self {
        Parser {
            chars: expression.as_bytes(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<RuleNode, RuleError> {
        let node = self.parse_or()?;
        self.skip_whitespace();
        if self.pos < self.chars.len() {
            return Err(self.error("unexpected characters after expression"));
        }
        Ok(node)
    }

    fn error(&self, message: &str) -> RuleError {
        RuleError::Parse {
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.chars.get(self.pos + offset).copied()
    }

    fn eat(&mut self, token: &[u8]) -> bool {
        if self.chars[self.pos..].starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<RuleNode, RuleError> {
        let mut left = self.parse_and()?;
        loop {
            self.skip_whitespace();
            if !self.eat(b"||") {
                break;
            }
            let right = self.parse_and()?;
            left = RuleNode::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<RuleNode, RuleError> {
        let mut left = self.parse_not()?;
        loop {
            self.skip_whitespace();
            if !self.eat(b"&&") {
                break;
            }
            let right = self.parse_not()?;
            left = RuleNode::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<RuleNode, RuleError> {
        self.skip_whitespace();
        if self.peek(0) == Some(b'!') && self.peek(1) != Some(b'=') {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(RuleNode::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<RuleNode, RuleError> {
        let primary = self.parse_primary()?;
        // Only identifier primaries take a comparison tail.
        let RuleNode::Identifier { path } = primary else {
            return Ok(primary);
        };

        self.skip_whitespace();
        let Some(op) = self.try_comparison_operator()? else {
            return Ok(RuleNode::Identifier { path });
        };

        let literal = self.parse_value();
        if literal.is_empty() {
            return Err(self.error("expected value after comparison operator"));
        }
        Ok(RuleNode::Comparison { path, op, literal })
    }

    /// Consumes a comparison operator if one is next. `&&`, `||` and `!`
    /// belong to the boolean levels and are never consumed here; a lone `=`
    /// is a parse error.
    fn try_comparison_operator(&mut self) -> Result<Option<CompareOp>, RuleError> {
        if self.eat(b"==") {
            return Ok(Some(CompareOp::Equals));
        }
        if self.eat(b"!=") {
            return Ok(Some(CompareOp::NotEquals));
        }
        if self.eat(b">=") {
            return Ok(Some(CompareOp::GreaterEqual));
        }
        if self.eat(b"<=") {
            return Ok(Some(CompareOp::LessEqual));
        }
        if self.peek(0) == Some(b'=') {
            return Err(self.error("single '=' is not an operator, use '=='"));
        }
        if self.eat(b">") {
            return Ok(Some(CompareOp::GreaterThan));
        }
        if self.eat(b"<") {
            return Ok(Some(CompareOp::LessThan));
        }
        Ok(None)
    }

    fn parse_primary(&mut self) -> Result<RuleNode, RuleError> {
        self.skip_whitespace();
        match self.peek(0) {
            None => Err(self.error("unexpected end of expression")),
            Some(b'(') => {
                self.pos += 1;
                let node = self.parse_or()?;
                self.skip_whitespace();
                if self.peek(0) != Some(b')') {
                    return Err(self.error("missing closing parenthesis"));
                }
                self.pos += 1;
                Ok(node)
            }
            Some(_) => {
                let path = self.parse_identifier();
                if path.is_empty() {
                    return Err(self.error("expected identifier"));
                }
                Ok(RuleNode::Identifier { path })
            }
        }
    }

    fn parse_identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'/' || c == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.chars[start..self.pos]).into_owned()
    }

    fn parse_value(&mut self) -> String {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c.is_ascii_alphanumeric() || c == b'.' || c == b'-' || c == b'+' {
                self.pos += 1;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.chars[start..self.pos]).into_owned()
    }
}
