//! User-defined calculated metrics.
//!
//! Formulas combine numeric literals, row fields and the aggregate
//! functions `sum`, `avg`, `min`, `max` and `count` with `+ - * /`, unary
//! minus and parentheses:
//!
//! ```text
//! paid_orders / orders
//! (revenue - cost) / cost
//! sum(revenue) / count(orders)
//! ```
//!
//! A formula without aggregates is evaluated per row. A formula with
//! aggregates is evaluated once over the whole row set and the result is
//! written to every row. Division by zero yields 0.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use metrics_sdk::RawRow;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::{ratio, ValueKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedMetric {
    pub key: String,
    pub label: String,
    pub kind: ValueKind,
    pub formula: String,
}

impl CalculatedMetric {
    pub fn new(
        key: impl Into<String>,
        label: impl Into<String>,
        kind: ValueKind,
        formula: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            kind,
            formula: formula.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormulaError {
    #[error("invalid character {ch:?} at position {position}")]
    InvalidCharacter { ch: char, position: usize },
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("unbalanced parentheses")]
    UnbalancedParentheses,
    #[error("unexpected end of formula")]
    UnexpectedEnd,
    #[error("unexpected {0}")]
    UnexpectedToken(String),
    #[error("{0}() takes a single field name")]
    AggregateArgument(Aggregate),
    #[error("{0}() cannot be evaluated for a single row")]
    AggregateInRow(Aggregate),
    #[error("cycle between calculated metrics: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Aggregate {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sum" => Some(Aggregate::Sum),
            "avg" => Some(Aggregate::Avg),
            "min" => Some(Aggregate::Min),
            "max" => Some(Aggregate::Max),
            "count" => Some(Aggregate::Count),
            _ => None,
        }
    }

    fn over(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Aggregate::Sum => values.iter().sum(),
            Aggregate::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregate::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregate::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregate::Count => values.len() as f64,
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Aggregate::Sum => "sum",
            Aggregate::Avg => "avg",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
            Aggregate::Count => "count",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => ratio(lhs, rhs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Field(String),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Aggregate {
        function: Aggregate,
        field: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {n}"),
            Token::Ident(name) => write!(f, "identifier {name:?}"),
            Token::Op(op) => write!(f, "operator '{op}'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(ch));
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                let mut dots = 0;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        dots += 1;
                        if dots > 1 {
                            break;
                        }
                    }
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let value: f64 = raw
                    .parse()
                    .map_err(|_| FormulaError::InvalidNumber(raw.clone()))?;
                tokens.push(Token::Number(value));
            }
            _ => return Err(FormulaError::InvalidCharacter { ch, position: i }),
        }
    }
    Ok(tokens)
}

/// Recursive descent over
///
/// ```text
/// expr    := term (('+' | '-') term)*
/// term    := unary (('*' | '/') unary)*
/// unary   := '-' unary | primary
/// primary := number | field | aggregate '(' field ')' | '(' expr ')'
/// ```
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = if *op == '+' { BinaryOp::Add } else { BinaryOp::Sub };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            let op = if *op == '*' { BinaryOp::Mul } else { BinaryOp::Div };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(Expr::Negate(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            None => Err(FormulaError::UnexpectedEnd),
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Field(name));
                }
                let Some(function) = Aggregate::from_name(&name) else {
                    return Err(FormulaError::UnexpectedToken(format!(
                        "call to unknown function {name:?}"
                    )));
                };
                self.pos += 1;
                let field = match self.next() {
                    Some(Token::Ident(field)) => field,
                    _ => return Err(FormulaError::AggregateArgument(function)),
                };
                match self.next() {
                    Some(Token::RParen) => Ok(Expr::Aggregate { function, field }),
                    _ => Err(FormulaError::AggregateArgument(function)),
                }
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(FormulaError::UnbalancedParentheses),
                }
            }
            Some(Token::RParen) => Err(FormulaError::UnbalancedParentheses),
            Some(token) => Err(FormulaError::UnexpectedToken(token.to_string())),
        }
    }
}

/// A parsed formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            pos: 0,
        };
        let expr = parser.expr()?;
        match parser.next() {
            None => Ok(Self { expr }),
            Some(Token::RParen) => Err(FormulaError::UnbalancedParentheses),
            Some(token) => Err(FormulaError::UnexpectedToken(token.to_string())),
        }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Every field the formula reads, including aggregate arguments.
    pub fn references(&self) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        collect_references(&self.expr, &mut fields);
        fields
    }

    pub fn has_aggregates(&self) -> bool {
        contains_aggregate(&self.expr)
    }

    pub fn evaluate_row(&self, row: &RawRow) -> Result<f64, FormulaError> {
        let value = eval(&self.expr, &mut |node| match node {
            Leaf::Field(field) => Ok(row.number(field)),
            Leaf::Aggregate(function, _) => Err(FormulaError::AggregateInRow(function)),
        })?;
        Ok(finite_or_zero(value))
    }

    /// Evaluates aggregates over `rows`. Bare fields outside an aggregate
    /// have no single row to read from and count as 0.
    pub fn evaluate_over(&self, rows: &[RawRow]) -> f64 {
        let mut cache: HashMap<(String, u8), f64> = HashMap::new();
        let value = eval(&self.expr, &mut |node| match node {
            Leaf::Field(_) => Ok(0.0),
            Leaf::Aggregate(function, field) => {
                let value = *cache
                    .entry((field.to_string(), function as u8))
                    .or_insert_with(|| {
                        let values: Vec<f64> = rows.iter().map(|row| row.number(field)).collect();
                        function.over(&values)
                    });
                debug!(function = %function, field, value, "aggregate evaluated");
                Ok(value)
            }
        });
        value.map(finite_or_zero).unwrap_or(0.0)
    }
}

enum Leaf<'a> {
    Field(&'a str),
    Aggregate(Aggregate, &'a str),
}

fn eval<'a>(
    expr: &'a Expr,
    leaf: &mut dyn FnMut(Leaf<'a>) -> Result<f64, FormulaError>,
) -> Result<f64, FormulaError> {
    match expr {
        Expr::Number(value) => Ok(*value),
        Expr::Field(field) => leaf(Leaf::Field(field)),
        Expr::Aggregate { function, field } => leaf(Leaf::Aggregate(*function, field)),
        Expr::Negate(inner) => Ok(-eval(inner, leaf)?),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs, leaf)?;
            let rhs = eval(rhs, leaf)?;
            Ok(op.apply(lhs, rhs))
        }
    }
}

fn collect_references(expr: &Expr, fields: &mut BTreeSet<String>) {
    match expr {
        Expr::Number(_) => {}
        Expr::Field(field) | Expr::Aggregate { field, .. } => {
            fields.insert(field.clone());
        }
        Expr::Negate(inner) => collect_references(inner, fields),
        Expr::Binary { lhs, rhs, .. } => {
            collect_references(lhs, fields);
            collect_references(rhs, fields);
        }
    }
}

fn contains_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Aggregate { .. } => true,
        Expr::Number(_) | Expr::Field(_) => false,
        Expr::Negate(inner) => contains_aggregate(inner),
        Expr::Binary { lhs, rhs, .. } => contains_aggregate(lhs) || contains_aggregate(rhs),
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Orders metrics so each one comes after the calculated metrics it reads.
/// Independent metrics keep their input order. A metric reading its own key
/// sees the row's existing field, not itself.
pub fn evaluation_order(metrics: &[CalculatedMetric]) -> Result<Vec<usize>, FormulaError> {
    let index: HashMap<&str, usize> = metrics
        .iter()
        .enumerate()
        .map(|(i, m)| (m.key.as_str(), i))
        .collect();

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); metrics.len()];
    let mut in_degree = vec![0usize; metrics.len()];
    for (i, metric) in metrics.iter().enumerate() {
        // Unparseable formulas have no usable references; they evaluate to 0.
        let references = Formula::parse(&metric.formula)
            .map(|f| f.references())
            .unwrap_or_default();
        for reference in references {
            if let Some(&dep) = index.get(reference.as_str()) {
                if dep != i {
                    dependents[dep].push(i);
                    in_degree[i] += 1;
                }
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..metrics.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(metrics.len());
    while let Some(next) = ready.pop_front() {
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if order.len() != metrics.len() {
        let cyclic = metrics
            .iter()
            .enumerate()
            .filter(|(i, _)| !order.contains(i))
            .map(|(_, m)| m.key.clone())
            .collect();
        return Err(FormulaError::Cycle(cyclic));
    }
    Ok(order)
}

/// Writes every calculated metric into `rows`.
///
/// Per-row metrics run first, in dependency order, so later formulas can
/// read earlier results. Aggregate metrics then run once over the updated
/// rows. A formula that fails to parse or evaluate yields 0. Percentage
/// metrics are scaled to 0-100.
pub fn apply_calculated_metrics(
    rows: &mut [RawRow],
    metrics: &[CalculatedMetric],
) -> Result<(), FormulaError> {
    if rows.is_empty() || metrics.is_empty() {
        return Ok(());
    }
    let order = evaluation_order(metrics)?;

    let mut per_row = Vec::new();
    let mut aggregate = Vec::new();
    for i in order {
        let metric = &metrics[i];
        match Formula::parse(&metric.formula) {
            Ok(formula) if formula.has_aggregates() => aggregate.push((metric, Some(formula))),
            Ok(formula) => per_row.push((metric, Some(formula))),
            Err(err) => {
                warn!(metric = %metric.key, error = %err, "calculated metric does not parse; using 0");
                per_row.push((metric, None));
            }
        }
    }

    for row in rows.iter_mut() {
        for (metric, formula) in &per_row {
            let value = formula
                .as_ref()
                .and_then(|f| f.evaluate_row(row).ok())
                .unwrap_or(0.0);
            row.set(metric.key.clone(), scaled(metric.kind, value));
        }
    }

    for (metric, formula) in &aggregate {
        let value = formula
            .as_ref()
            .map(|f| f.evaluate_over(rows))
            .unwrap_or(0.0);
        let value = scaled(metric.kind, value);
        debug!(metric = %metric.key, value, "aggregate metric applied");
        for row in rows.iter_mut() {
            row.set(metric.key.clone(), value);
        }
    }
    Ok(())
}

fn scaled(kind: ValueKind, value: f64) -> f64 {
    match kind {
        ValueKind::Percentage => value * 100.0,
        ValueKind::Number | ValueKind::Currency => value,
    }
}
