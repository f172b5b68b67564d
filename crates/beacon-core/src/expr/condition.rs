//! Boolean condition evaluation.
//!
//! The grammar admits only literals, `${...}` tokens, the four comparison
//! operator pairs, and/or/not, and parentheses. No function calls, no
//! iteration, no mutation: evaluation cost is bounded by the expression's
//! size, not by a runtime timeout.

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::expr::resolver;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    /// Token body without the `${}` delimiters.
    Expr(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Literal(serde_json::Value),
    Expr(String),
    Not(Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Cmp(Box<Ast>, CmpOp, Box<Ast>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Evaluator for step conditions and conditional-branch selection.
#[derive(Debug, Default, Clone)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a condition against the context.
    pub fn evaluate(&self, expr: &str, ctx: &ExecutionContext) -> EngineResult<bool> {
        let ast = parse(expr)?;
        eval_bool(&ast, ctx)
    }
}

/// Parse-only syntax check, used by the pre-execution pass.
pub fn validate(expr: &str) -> EngineResult<()> {
    parse(expr).map(|_| ())
}

fn parse(expr: &str) -> EngineResult<Ast> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(EngineError::ConditionEvaluation(format!(
            "unexpected trailing input in `{}`",
            expr
        )));
    }
    Ok(ast)
}

fn tokenize(expr: &str) -> EngineResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(EngineError::ConditionEvaluation(format!(
                        "unterminated string literal in `{}`",
                        expr
                    )));
                }
                tokens.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let start = i + 2;
                let mut j = start;
                while j < chars.len() && chars[j] != '}' {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(EngineError::ConditionEvaluation(format!(
                        "unterminated `${{` token in `{}`",
                        expr
                    )));
                }
                tokens.push(Token::Expr(chars[start..j].iter().collect()));
                i = j + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e' || chars[i] == 'E')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| {
                    EngineError::ConditionEvaluation(format!("invalid number `{}`", text))
                })?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    other => {
                        return Err(EngineError::ConditionEvaluation(format!(
                            "unsupported identifier `{}`; conditions allow only literals, \
                             `${{...}}` tokens, comparisons, and and/or/not",
                            other
                        )))
                    }
                }
            }
            other => {
                return Err(EngineError::ConditionEvaluation(format!(
                    "unexpected character `{}` in condition",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> EngineResult<Ast> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> EngineResult<Ast> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> EngineResult<Ast> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Ast::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> EngineResult<Ast> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_primary()?;
            return Ok(Ast::Cmp(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> EngineResult<Ast> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(EngineError::ConditionEvaluation(
                        "missing closing parenthesis".to_string(),
                    )),
                }
            }
            Some(Token::Str(s)) => Ok(Ast::Literal(serde_json::Value::String(s))),
            Some(Token::Num(n)) => Ok(Ast::Literal(serde_json::json!(n))),
            Some(Token::Bool(b)) => Ok(Ast::Literal(serde_json::Value::Bool(b))),
            Some(Token::Null) => Ok(Ast::Literal(serde_json::Value::Null)),
            Some(Token::Expr(body)) => Ok(Ast::Expr(body)),
            other => Err(EngineError::ConditionEvaluation(format!(
                "expected a value, found {:?}",
                other
            ))),
        }
    }
}

fn eval_bool(ast: &Ast, ctx: &ExecutionContext) -> EngineResult<bool> {
    match ast {
        Ast::Not(inner) => Ok(!eval_bool(inner, ctx)?),
        Ast::And(l, r) => Ok(eval_bool(l, ctx)? && eval_bool(r, ctx)?),
        Ast::Or(l, r) => Ok(eval_bool(l, ctx)? || eval_bool(r, ctx)?),
        Ast::Cmp(l, op, r) => {
            let lv = eval_value(l, ctx)?;
            let rv = eval_value(r, ctx)?;
            compare(&lv, *op, &rv)
        }
        other => {
            let value = eval_value(other, ctx)?;
            Ok(truthy(&value))
        }
    }
}

fn eval_value(ast: &Ast, ctx: &ExecutionContext) -> EngineResult<serde_json::Value> {
    match ast {
        Ast::Literal(v) => Ok(v.clone()),
        Ast::Expr(body) => resolver::resolve_token(body, ctx),
        other => Ok(serde_json::Value::Bool(eval_bool(other, ctx)?)),
    }
}

fn compare(left: &serde_json::Value, op: CmpOp, right: &serde_json::Value) -> EngineResult<bool> {
    use serde_json::Value;

    match op {
        CmpOp::Eq => Ok(loose_eq(left, right)),
        CmpOp::Ne => Ok(!loose_eq(left, right)),
        _ => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    let a = a.as_f64().unwrap_or(f64::NAN);
                    let b = b.as_f64().unwrap_or(f64::NAN);
                    a.partial_cmp(&b)
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };

            let ordering = ordering.ok_or_else(|| {
                EngineError::ConditionEvaluation(format!(
                    "cannot order {} against {}",
                    type_name(left),
                    type_name(right)
                ))
            })?;

            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

fn loose_eq(left: &serde_json::Value, right: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (left, right) {
        // Numbers compare numerically so 80 == 80.0 holds.
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().unwrap_or(f64::NAN) == b.as_f64().unwrap_or(f64::NAN)
        }
        _ => left == right,
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
