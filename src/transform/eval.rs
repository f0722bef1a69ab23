//! Direct interpretation of the expression AST.

use super::parser::{BinaryOp, Expr, Function};
use crate::error::EvalError;
use serde_json::{Number, Value};

/// Evaluates `expr` for every numeric element of `x`, preserving array nesting.
pub fn eval_value(expr: &Expr, x: &Value) -> Result<Value, EvalError> {
    match x {
        Value::Number(n) => {
            let input = n
                .as_f64()
                .ok_or_else(|| EvalError::TypeMismatch(n.to_string()))?;
            let result = eval_scalar(expr, input)?;
            Number::from_f64(result)
                .map(Value::Number)
                .ok_or(EvalError::Domain)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| eval_value(expr, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Err(EvalError::TypeMismatch(describe(other))),
    }
}

pub fn eval_scalar(expr: &Expr, x: f64) -> Result<f64, EvalError> {
    let value = match expr {
        Expr::Number(value) => *value,
        Expr::Variable => x,
        Expr::Neg(inner) => -eval_scalar(inner, x)?,
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval_scalar(lhs, x)?;
            let rhs = eval_scalar(rhs, x)?;
            match op {
                BinaryOp::Add => lhs + rhs,
                BinaryOp::Sub => lhs - rhs,
                BinaryOp::Mul => lhs * rhs,
                BinaryOp::Div if rhs == 0.0 => return Err(EvalError::DivisionByZero),
                BinaryOp::Div => lhs / rhs,
                BinaryOp::Pow => lhs.powf(rhs),
            }
        }
        Expr::Call { function, args } => {
            let args = args
                .iter()
                .map(|arg| eval_scalar(arg, x))
                .collect::<Result<Vec<_>, _>>()?;
            call(*function, &args)?
        }
    };

    if value.is_finite() {
        Ok(value)
    } else {
        Err(EvalError::Domain)
    }
}

fn call(function: Function, args: &[f64]) -> Result<f64, EvalError> {
    let (a, b) = match args {
        [a] => (*a, 0.0),
        [a, b] => (*a, *b),
        _ => {
            return Err(EvalError::Syntax {
                offset: 0,
                message: format!("wrong number of arguments for {:?}", function),
            })
        }
    };

    let value = match function {
        Function::Exp => a.exp(),
        Function::Log => a.ln(),
        Function::Log10 => a.log10(),
        Function::Sqrt => a.sqrt(),
        Function::Pow => a.powf(b),
        Function::Sin => a.sin(),
        Function::Cos => a.cos(),
        Function::Tan => a.tan(),
        Function::Asin => a.asin(),
        Function::Acos => a.acos(),
        Function::Atan => a.atan(),
        Function::Abs => a.abs(),
    };
    Ok(value)
}

fn describe(value: &Value) -> String {
    let kind = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::String(_) => "text",
        Value::Object(_) => "mapping",
        Value::Number(_) | Value::Array(_) => "number",
    };
    format!("got {} {}", kind, value)
}
