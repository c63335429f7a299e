//! Sandboxed expressions for field transforms and collector conversions.
//!
//! Expressions are parsed once by `evalexpr` and evaluated against a fresh,
//! read-only context per call. The grammar is closed:
//! - Arithmetic: +, -, *, /, %, ^
//! - Comparison: <, >, <=, >=, ==, !=
//! - Logic: &&, ||, !
//! - Strings: literals in double quotes, concatenation with +
//! - Functions: if, abs, floor, ceil, round, min, max, fixed, pad, str
//!
//! `if(condition, then, else)` evaluates only the branch it takes, so a guard
//! such as `if(at(0) != 0, 100 / at(0), 0)` never divides by zero.
//!
//! Transforms see `value` as a float, so equality tests compare against float
//! literals (`value == 1.0`).
//!
//! Conversions additionally get `at`, `i16`, `u32be` and `u32le` bound to the
//! raw register array.

use evalexpr::{
    Context, ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError, Function,
    HashMapContext, Node, Value,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use regpoll_common::FieldValue;

use crate::transport::RegisterData;

/// Expression errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("Failed to compile '{expr}': {message}")]
    Compile { expr: String, message: String },

    #[error("Failed to evaluate '{expr}': {message}")]
    Eval { expr: String, message: String },
}

/// A compiled expression.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression {
    text: String,
    program: Program,
}

impl Expression {
    /// Parse an expression.
    pub fn compile(text: &str) -> Result<Self, ExprError> {
        let program = Program::parse(text, &mut 0).map_err(|e| ExprError::Compile {
            expr: text.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            text: text.to_string(),
            program,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Evaluate a display transform with `value` bound to the scaled number.
    pub fn eval_transform(&self, value: f64) -> Result<FieldValue, ExprError> {
        let mut context = self.context()?;
        context
            .set_value("value".to_string(), Value::Float(value))
            .map_err(|e| self.eval_error(e))?;

        self.run(&mut context)
    }

    /// Evaluate a collector conversion over a raw register array.
    ///
    /// `value` is a tuple of the raw words (integers) or bits (booleans),
    /// `count` its length.
    pub fn eval_conversion(&self, data: &RegisterData) -> Result<FieldValue, ExprError> {
        let mut context = self.context()?;

        let raw: Vec<Value> = match data {
            RegisterData::Words(words) => words.iter().map(|w| Value::Int(*w as i64)).collect(),
            RegisterData::Bits(bits) => bits.iter().map(|b| Value::Boolean(*b)).collect(),
        };
        let raw: Arc<Vec<Value>> = Arc::new(raw);
        let words: Arc<Vec<u16>> = Arc::new(match data {
            RegisterData::Words(words) => words.clone(),
            RegisterData::Bits(_) => Vec::new(),
        });

        context
            .set_value("value".to_string(), Value::Tuple(raw.as_ref().clone()))
            .map_err(|e| self.eval_error(e))?;
        context
            .set_value("count".to_string(), Value::Int(raw.len() as i64))
            .map_err(|e| self.eval_error(e))?;

        let at = {
            let raw = Arc::clone(&raw);
            Function::new(move |args| {
                let index = index_arg(args, raw.len())?;
                Ok(raw[index].clone())
            })
        };
        let i16_at = {
            let words = Arc::clone(&words);
            Function::new(move |args| {
                let index = index_arg(args, words.len())?;
                Ok(Value::Int(words[index] as i16 as i64))
            })
        };
        let u32be = {
            let words = Arc::clone(&words);
            Function::new(move |args| {
                let (high, low) = word_pair(&words, args)?;
                Ok(Value::Int((((high as u32) << 16) | low as u32) as i64))
            })
        };
        let u32le = {
            let words = Arc::clone(&words);
            Function::new(move |args| {
                let (low, high) = word_pair(&words, args)?;
                Ok(Value::Int((((high as u32) << 16) | low as u32) as i64))
            })
        };

        for (name, function) in [("at", at), ("i16", i16_at), ("u32be", u32be), ("u32le", u32le)] {
            context
                .set_function(name.to_string(), function)
                .map_err(|e| self.eval_error(e))?;
        }

        self.run(&mut context)
    }

    fn run(&self, context: &mut HashMapContext) -> Result<FieldValue, ExprError> {
        let value = self
            .program
            .eval(context)
            .map_err(|e| self.eval_error(e))?;

        match value {
            Value::Float(f) => Ok(FieldValue::Number(f)),
            Value::Int(i) => Ok(FieldValue::Number(i as f64)),
            Value::Boolean(b) => Ok(FieldValue::Bool(b)),
            Value::String(s) => Ok(FieldValue::Text(s)),
            Value::Empty => Err(ExprError::Eval {
                expr: self.text.clone(),
                message: "expression produced no value".to_string(),
            }),
            other => Ok(FieldValue::Text(display_value(&other))),
        }
    }

    fn context(&self) -> Result<HashMapContext, ExprError> {
        standard_context().map_err(|e| self.eval_error(e))
    }

    fn eval_error(&self, e: EvalexprError) -> ExprError {
        ExprError::Eval {
            expr: self.text.clone(),
            message: e.to_string(),
        }
    }
}

impl TryFrom<String> for Expression {
    type Error = ExprError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Expression::compile(&text)
    }
}

impl From<Expression> for String {
    fn from(expr: Expression) -> Self {
        expr.text
    }
}

impl std::fmt::Debug for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Expression").field(&self.text).finish()
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

/// An operator tree with its `if` calls lifted into slot variables.
#[derive(Clone)]
struct Program {
    tree: Node,
    branches: Vec<Branch>,
}

#[derive(Clone)]
struct Branch {
    slot: String,
    condition: Program,
    then: Program,
    otherwise: Program,
}

impl Program {
    fn parse(text: &str, next_slot: &mut usize) -> Result<Self, EvalexprError> {
        let mut rewritten = String::with_capacity(text.len());
        let mut branches = Vec::new();
        let mut rest = text;

        while let Some((start, open)) = find_if_call(rest) {
            let close = matching_paren(rest, open)?;
            let args = split_args(&rest[open + 1..close]);
            if args.len() != 3 {
                return Err(custom(format!(
                    "if expects 3 arguments, got {}",
                    args.len()
                )));
            }

            let slot = format!("__if_{}", *next_slot);
            *next_slot += 1;
            let condition = Program::parse(args[0], next_slot)?;
            let then = Program::parse(args[1], next_slot)?;
            let otherwise = Program::parse(args[2], next_slot)?;

            rewritten.push_str(&rest[..start]);
            rewritten.push_str(&slot);
            branches.push(Branch {
                slot,
                condition,
                then,
                otherwise,
            });
            rest = &rest[close + 1..];
        }
        rewritten.push_str(rest);

        Ok(Self {
            tree: evalexpr::build_operator_tree(&rewritten)?,
            branches,
        })
    }

    fn eval(&self, context: &mut HashMapContext) -> Result<Value, EvalexprError> {
        for branch in &self.branches {
            let value = if branch.condition.eval(context)?.as_boolean()? {
                branch.then.eval(context)?
            } else {
                branch.otherwise.eval(context)?
            };
            context.set_value(branch.slot.clone(), value)?;
        }
        self.tree.eval_with_context(&*context)
    }
}

/// Byte offsets of `text` outside string literals.
fn code_bytes(text: &str) -> impl Iterator<Item = (usize, u8)> + '_ {
    let mut in_string = false;
    let mut escaped = false;
    text.bytes().enumerate().filter(move |&(_, b)| {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            false
        } else if b == b'"' {
            in_string = true;
            false
        } else {
            true
        }
    })
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || !b.is_ascii()
}

/// Locate the first `if(` call: offset of `if` and of its opening paren.
fn find_if_call(text: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    code_bytes(text).find_map(|(i, b)| {
        if b != b'i' || bytes.get(i + 1) != Some(&b'f') {
            return None;
        }
        if i > 0 && is_ident_byte(bytes[i - 1]) {
            return None;
        }
        let mut open = i + 2;
        while bytes.get(open).is_some_and(|b| b.is_ascii_whitespace()) {
            open += 1;
        }
        (bytes.get(open) == Some(&b'(')).then_some((i, open))
    })
}

fn matching_paren(text: &str, open: usize) -> Result<usize, EvalexprError> {
    let mut depth = 0usize;
    for (i, b) in code_bytes(text).skip_while(|&(i, _)| i < open) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(custom("unbalanced parentheses in if(...)"))
}

/// Split call arguments on top-level commas.
fn split_args(inner: &str) -> Vec<&str> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut last = 0;
    for (i, b) in code_bytes(inner) {
        match b {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                args.push(&inner[last..i]);
                last = i + 1;
            }
            _ => {}
        }
    }
    args.push(&inner[last..]);
    args
}

fn custom(message: impl Into<String>) -> EvalexprError {
    EvalexprError::CustomMessage(message.into())
}

fn to_f64(value: &Value) -> Result<f64, EvalexprError> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        other => Err(custom(format!("expected a number, got {}", display_value(other)))),
    }
}

fn args_exact(args: &Value, count: usize) -> Result<Vec<Value>, EvalexprError> {
    let tuple = args.as_tuple()?;
    if tuple.len() != count {
        return Err(custom(format!(
            "expected {} arguments, got {}",
            count,
            tuple.len()
        )));
    }
    Ok(tuple)
}

fn index_arg(args: &Value, len: usize) -> Result<usize, EvalexprError> {
    let index = match args {
        Value::Int(i) => *i,
        Value::Float(f) if f.fract() == 0.0 => *f as i64,
        other => return Err(custom(format!("invalid index {}", display_value(other)))),
    };

    if index < 0 || index as usize >= len {
        return Err(custom(format!("index {} out of range (count {})", index, len)));
    }
    Ok(index as usize)
}

fn word_pair(words: &[u16], args: &Value) -> Result<(u16, u16), EvalexprError> {
    let first = index_arg(args, words.len())?;
    if first + 1 >= words.len() {
        return Err(custom(format!(
            "index {} needs two words (count {})",
            first,
            words.len()
        )));
    }
    Ok((words[first], words[first + 1]))
}

/// Format a value the way the display layer shows it.
fn display_value(value: &Value) -> String {
    match value {
        Value::Float(f) => FieldValue::Number(*f).to_string(),
        Value::Int(i) => i.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::String(s) => s.clone(),
        Value::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(display_value).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Empty => String::new(),
    }
}

fn numeric(f: fn(f64) -> f64) -> Function {
    Function::new(move |args| Ok(Value::Float(f(to_f64(args)?))))
}

fn standard_context() -> Result<HashMapContext, EvalexprError> {
    let mut context = HashMapContext::new();
    context.set_builtin_functions_disabled(true)?;

    context.set_function("abs".to_string(), numeric(f64::abs))?;
    context.set_function("floor".to_string(), numeric(f64::floor))?;
    context.set_function("ceil".to_string(), numeric(f64::ceil))?;
    context.set_function("round".to_string(), numeric(f64::round))?;

    context.set_function(
        "min".to_string(),
        Function::new(|args| {
            let tuple = args_exact(args, 2)?;
            Ok(Value::Float(to_f64(&tuple[0])?.min(to_f64(&tuple[1])?)))
        }),
    )?;

    context.set_function(
        "max".to_string(),
        Function::new(|args| {
            let tuple = args_exact(args, 2)?;
            Ok(Value::Float(to_f64(&tuple[0])?.max(to_f64(&tuple[1])?)))
        }),
    )?;

    // fixed(x, digits): fixed-point text, always `digits` decimals
    context.set_function(
        "fixed".to_string(),
        Function::new(|args| {
            let tuple = args_exact(args, 2)?;
            let value = to_f64(&tuple[0])?;
            let digits = to_f64(&tuple[1])?;
            if !(0.0..=20.0).contains(&digits) {
                return Err(custom(format!("fixed: invalid digit count {}", digits)));
            }
            Ok(Value::String(format!("{:.*}", digits as usize, value)))
        }),
    )?;

    // pad(x, width): left-pad with zeros
    context.set_function(
        "pad".to_string(),
        Function::new(|args| {
            let tuple = args_exact(args, 2)?;
            let text = display_value(&tuple[0]);
            let width = to_f64(&tuple[1])?;
            if !(0.0..=64.0).contains(&width) {
                return Err(custom(format!("pad: invalid width {}", width)));
            }
            Ok(Value::String(format!("{:0>width$}", text, width = width as usize)))
        }),
    )?;

    context.set_function(
        "str".to_string(),
        Function::new(|args| Ok(Value::String(display_value(args)))),
    )?;

    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(text: &str, value: f64) -> FieldValue {
        Expression::compile(text).unwrap().eval_transform(value).unwrap()
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        assert_eq!(transform("value * 2", 21.5), FieldValue::Number(43.0));
        assert_eq!(transform("value > 10", 11.0), FieldValue::Bool(true));
    }

    #[test]
    fn test_energy_transform() {
        let text = r#"if(value > 1000, fixed(value / 1000, 2) + " kWh", str(value) + " Wh")"#;
        assert_eq!(transform(text, 1500.0), FieldValue::from("1.50 kWh"));
        assert_eq!(transform(text, 999.0), FieldValue::from("999 Wh"));
    }

    #[test]
    fn test_time_of_day_transform() {
        let text = r#"str(floor(value / 256)) + ":" + pad(value % 256, 2)"#;
        // 0x0805 -> 8:05
        assert_eq!(transform(text, 2053.0), FieldValue::from("8:05"));
    }

    #[test]
    fn test_abs_in_branches() {
        let text = r#"if(value > 0, "Charging " + str(value) + "W", "Discharging " + str(abs(value)) + "W")"#;
        assert_eq!(transform(text, -350.0), FieldValue::from("Discharging 350W"));
        assert_eq!(transform(text, 120.0), FieldValue::from("Charging 120W"));
    }

    #[test]
    fn test_compile_error() {
        assert!(matches!(
            Expression::compile("value * (2"),
            Err(ExprError::Compile { .. })
        ));
    }

    #[test]
    fn test_unknown_variable_is_eval_error() {
        let expr = Expression::compile("missing + 1").unwrap();
        assert!(matches!(
            expr.eval_transform(1.0),
            Err(ExprError::Eval { .. })
        ));
    }

    #[test]
    fn test_assignment_is_rejected() {
        let expr = Expression::compile("value = 5").unwrap();
        assert!(expr.eval_transform(1.0).is_err());
    }

    #[test]
    fn test_conversion_accessors() {
        let data = RegisterData::Words(vec![0x0001, 0x0002, 0xFFFF]);

        let eval = |text: &str| Expression::compile(text).unwrap().eval_conversion(&data);

        assert_eq!(eval("at(0)").unwrap(), FieldValue::Number(1.0));
        assert_eq!(eval("u32be(0)").unwrap(), FieldValue::Number(65538.0));
        assert_eq!(eval("u32le(0)").unwrap(), FieldValue::Number(131073.0));
        assert_eq!(eval("i16(2)").unwrap(), FieldValue::Number(-1.0));
        assert_eq!(eval("count").unwrap(), FieldValue::Number(3.0));
        assert!(eval("at(3)").is_err());
        assert!(eval("u32be(2)").is_err());
    }

    #[test]
    fn test_conversion_over_bits() {
        let data = RegisterData::Bits(vec![true, false]);
        let expr = Expression::compile(r#"if(at(0), "ON", "OFF")"#).unwrap();
        assert_eq!(expr.eval_conversion(&data).unwrap(), FieldValue::from("ON"));
    }

    #[test]
    fn test_if_guards_untaken_branch() {
        let eval = |text: &str, words: Vec<u16>| {
            Expression::compile(text)
                .unwrap()
                .eval_conversion(&RegisterData::Words(words))
        };

        assert_eq!(
            eval("if(count > 1, at(1), at(0))", vec![7]).unwrap(),
            FieldValue::Number(7.0)
        );
        assert_eq!(
            eval("if(count > 1, at(1), at(0))", vec![7, 9]).unwrap(),
            FieldValue::Number(9.0)
        );
        assert_eq!(
            eval("if(at(0) != 0, 100 / at(0), 0)", vec![0]).unwrap(),
            FieldValue::Number(0.0)
        );
        assert_eq!(
            eval("if(at(0) != 0, 100 / at(0), 0)", vec![4]).unwrap(),
            FieldValue::Number(25.0)
        );
        // The taken branch still fails normally.
        assert!(eval("if(count > 0, at(5), 0)", vec![1]).is_err());
    }

    #[test]
    fn test_nested_if() {
        let text = r#"if(value > 100, "high", if(value > 10, "mid", "low")) + "!""#;
        assert_eq!(transform(text, 5.0), FieldValue::from("low!"));
        assert_eq!(transform(text, 50.0), FieldValue::from("mid!"));
        assert_eq!(transform(text, 500.0), FieldValue::from("high!"));
    }

    #[test]
    fn test_if_inside_string_is_text() {
        assert_eq!(
            transform(r#""if(x, y)" + str(value)"#, 1.0),
            FieldValue::from("if(x, y)1")
        );
    }

    #[test]
    fn test_if_arity_and_condition_type() {
        assert!(matches!(
            Expression::compile("if(value > 0, 1)"),
            Err(ExprError::Compile { .. })
        ));
        assert!(matches!(
            Expression::compile("if(value > 0, 1, 2"),
            Err(ExprError::Compile { .. })
        ));

        let expr = Expression::compile("if(value, 1, 2)").unwrap();
        assert!(matches!(
            expr.eval_transform(1.0),
            Err(ExprError::Eval { .. })
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let expr = Expression::compile("value + 1").unwrap();
        assert_eq!(serde_json::to_string(&expr).unwrap(), "\"value + 1\"");

        let parsed: Expression = serde_json::from_str("\"value * 3\"").unwrap();
        assert_eq!(parsed.as_str(), "value * 3");

        assert!(serde_json::from_str::<Expression>("\"(\"").is_err());
    }
}
