//! Restricted arithmetic used for value transformations.
//!
//! A schema may attach a transformation such as `3 * x**2 + 1` to a dataset.
//! Expressions are parsed into a small AST and interpreted directly; only
//! arithmetic operators, the free variable `x` and a fixed set of functions
//! are available, so nothing in a schema can reach outside the value it
//! transforms.
//!
//! ```
//! use daq_nexus::transform::Expression;
//! use serde_json::json;
//!
//! let expr = Expression::compile("3*x**2+1").unwrap();
//! assert_eq!(expr.evaluate(&json!(2)).unwrap(), json!(13.0));
//! ```

mod eval;
mod lexer;
mod parser;

pub use parser::{BinaryOp, Expr, Function, VARIABLE};

use crate::dtype::Dtype;
use crate::error::EvalError;
use crate::value::ResolvedValue;
use serde_json::Value;
use std::fmt;

/// A compiled transformation expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parse `source`, rejecting unknown identifiers and malformed input.
    pub fn compile(source: &str) -> Result<Self, EvalError> {
        let ast = parser::parse(source)?;
        Ok(Self {
            source: source.trim().to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluate with `x` bound to a number or a (nested) array of numbers.
    pub fn evaluate(&self, x: &Value) -> Result<Value, EvalError> {
        eval::eval_value(&self.ast, x)
    }

    /// Replace the value of a resolved leaf with the transformed value.
    ///
    /// The result is always floating point; description and timestamps are kept.
    pub fn apply(&self, value: ResolvedValue) -> Result<ResolvedValue, EvalError> {
        let transformed = self.evaluate(&value.raw)?;
        Ok(value.replace_raw(transformed, Some(Dtype::Float64)))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Compile and evaluate in one step.
pub fn evaluate(expression: &str, x: &Value) -> Result<Value, EvalError> {
    Expression::compile(expression)?.evaluate(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_evaluate() {
        assert_eq!(evaluate("3*x**2+1", &json!(2)).unwrap(), json!(13.0));
        assert_eq!(
            evaluate("x/0", &json!(2)).unwrap_err(),
            EvalError::DivisionByZero
        );
        assert_eq!(
            evaluate("os.system(x)", &json!(2)).unwrap_err(),
            EvalError::UnknownIdentifier("os.system".into())
        );
    }

    #[test]
    fn test_apply_keeps_metadata() {
        let expr = Expression::compile("x + 0.5").unwrap();
        let value = ResolvedValue::new(json!([1, 2]))
            .timed(crate::value::Timestamps::Descriptor(10.0));
        let out = expr.apply(value).unwrap();
        assert_eq!(out.raw, json!([1.5, 2.5]));
        assert_eq!(out.dtype, Some(Dtype::Float64));
        assert_eq!(out.shape, vec![2]);
        assert_eq!(out.timestamps, Some(crate::value::Timestamps::Descriptor(10.0)));
    }

    #[test]
    fn test_display_is_source() {
        let expr = Expression::compile("  np.sqrt(x) + 2 ").unwrap();
        assert_eq!(expr.to_string(), "np.sqrt(x) + 2");
    }
}
