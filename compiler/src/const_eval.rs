// const_eval.rs — Scalar values and arithmetic
//
// `ConstValue` is the scalar model shared by constant folding in the
// analyzer and by the reference evaluator, so that both agree on integer
// wrapping, truncating division and float precision.
//
// Preconditions: binary operands have already been converted to one type.
// Postconditions: results use the operand type (comparisons yield `Bool`).
// Failure modes: integer division or remainder by zero → `ScalarError`.
// Side effects: none.

use std::fmt;

use crate::ast::{BinOp, UnOp};
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Int(i32),
    Float(f32),
    Double(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarError {
    DivisionByZero,
    Unsupported,
}

impl fmt::Display for ScalarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarError::DivisionByZero => write!(f, "Division by zero"),
            ScalarError::Unsupported => write!(f, "unsupported operand types"),
        }
    }
}

impl std::error::Error for ScalarError {}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Int(v) => write!(f, "{}", v),
            ConstValue::Float(v) => write!(f, "{}", v),
            ConstValue::Double(v) => write!(f, "{}", v),
            ConstValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl ConstValue {
    pub fn ty(&self) -> Type {
        match self {
            ConstValue::Int(_) => Type::Int,
            ConstValue::Float(_) => Type::Float,
            ConstValue::Double(_) => Type::Double,
            ConstValue::Bool(_) => Type::Bool,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            ConstValue::Int(v) => v as f64,
            ConstValue::Float(v) => v as f64,
            ConstValue::Double(v) => v,
            ConstValue::Bool(v) => v as i32 as f64,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ConstValue::Int(v) => Some(v as i64),
            ConstValue::Bool(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match *self {
            ConstValue::Bool(b) => b,
            other => other.as_f64() != 0.0,
        }
    }

    /// Whether the value is representable in `ty` without changing it
    /// (integral for `int`, finite and in range for `float`).
    pub fn fits(&self, ty: &Type) -> bool {
        let v = self.as_f64();
        match (self, ty) {
            (ConstValue::Bool(_), Type::Bool) => true,
            (ConstValue::Bool(_), _) | (_, Type::Bool) => false,
            (_, Type::Int) => v.fract() == 0.0 && v >= i32::MIN as f64 && v <= i32::MAX as f64,
            (_, Type::Float) => v.is_finite() && v.abs() <= f32::MAX as f64,
            (_, Type::Double) => true,
            _ => false,
        }
    }

    /// Numeric conversion (explicit or implicit) to a primitive type.
    pub fn convert(&self, ty: &Type) -> Option<ConstValue> {
        let v = self.as_f64();
        Some(match ty {
            Type::Int => match *self {
                ConstValue::Int(i) => ConstValue::Int(i),
                _ => ConstValue::Int(v as i32),
            },
            Type::Float => ConstValue::Float(v as f32),
            Type::Double => match *self {
                ConstValue::Float(f) => ConstValue::Double(f as f64),
                _ => ConstValue::Double(v),
            },
            Type::Bool => ConstValue::Bool(self.is_truthy()),
            _ => return None,
        })
    }

    pub fn unary(self, op: UnOp) -> Result<ConstValue, ScalarError> {
        Ok(match (op, self) {
            (UnOp::Neg, ConstValue::Int(v)) => ConstValue::Int(v.wrapping_neg()),
            (UnOp::Neg, ConstValue::Float(v)) => ConstValue::Float(-v),
            (UnOp::Neg, ConstValue::Double(v)) => ConstValue::Double(-v),
            (UnOp::Not, ConstValue::Bool(v)) => ConstValue::Bool(!v),
            _ => return Err(ScalarError::Unsupported),
        })
    }

    pub fn binary(op: BinOp, lhs: ConstValue, rhs: ConstValue) -> Result<ConstValue, ScalarError> {
        use ConstValue::*;
        if op.is_comparison() {
            let ord = match (lhs, rhs) {
                (Int(a), Int(b)) => a.partial_cmp(&b),
                (Float(a), Float(b)) => a.partial_cmp(&b),
                (Double(a), Double(b)) => a.partial_cmp(&b),
                (Bool(a), Bool(b)) => a.partial_cmp(&b),
                _ => return Err(ScalarError::Unsupported),
            };
            let r = match (op, ord) {
                (BinOp::Eq, o) => o == Some(std::cmp::Ordering::Equal),
                (BinOp::Ne, o) => o != Some(std::cmp::Ordering::Equal),
                (_, None) => false,
                (BinOp::Lt, Some(o)) => o.is_lt(),
                (BinOp::Le, Some(o)) => o.is_le(),
                (BinOp::Gt, Some(o)) => o.is_gt(),
                (BinOp::Ge, Some(o)) => o.is_ge(),
                _ => return Err(ScalarError::Unsupported),
            };
            return Ok(Bool(r));
        }
        Ok(match (lhs, rhs) {
            (Int(a), Int(b)) => Int(match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div if b == 0 => return Err(ScalarError::DivisionByZero),
                BinOp::Div => a.wrapping_div(b),
                BinOp::Rem if b == 0 => return Err(ScalarError::DivisionByZero),
                BinOp::Rem => a.wrapping_rem(b),
                _ => return Err(ScalarError::Unsupported),
            }),
            (Float(a), Float(b)) => Float(float_op(op, a as f64, b as f64)? as f32),
            (Double(a), Double(b)) => Double(float_op(op, a, b)?),
            (Bool(a), Bool(b)) => Bool(match op {
                BinOp::And => a && b,
                BinOp::Or => a || b,
                _ => return Err(ScalarError::Unsupported),
            }),
            _ => return Err(ScalarError::Unsupported),
        })
    }
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<f64, ScalarError> {
    Ok(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Rem => a % b,
        _ => return Err(ScalarError::Unsupported),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_truncates_and_wraps() {
        assert_eq!(
            ConstValue::binary(BinOp::Div, ConstValue::Int(-7), ConstValue::Int(2)),
            Ok(ConstValue::Int(-3))
        );
        assert_eq!(
            ConstValue::binary(BinOp::Rem, ConstValue::Int(7), ConstValue::Int(5)),
            Ok(ConstValue::Int(2))
        );
        assert_eq!(
            ConstValue::binary(BinOp::Add, ConstValue::Int(i32::MAX), ConstValue::Int(1)),
            Ok(ConstValue::Int(i32::MIN))
        );
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(
            ConstValue::binary(BinOp::Div, ConstValue::Int(1), ConstValue::Int(0)),
            Err(ScalarError::DivisionByZero)
        );
        assert_eq!(ScalarError::DivisionByZero.to_string(), "Division by zero");
    }

    #[test]
    fn float_precision_is_kept() {
        let r = ConstValue::binary(BinOp::Div, ConstValue::Float(1.0), ConstValue::Float(3.0));
        assert_eq!(r, Ok(ConstValue::Float(1.0f32 / 3.0f32)));
    }

    #[test]
    fn comparisons_yield_bool() {
        assert_eq!(
            ConstValue::binary(BinOp::Lt, ConstValue::Double(1.0), ConstValue::Double(2.0)),
            Ok(ConstValue::Bool(true))
        );
    }

    #[test]
    fn fits_and_convert() {
        assert!(ConstValue::Double(2.0).fits(&Type::Int));
        assert!(!ConstValue::Double(2.5).fits(&Type::Int));
        assert!(ConstValue::Double(0.1).fits(&Type::Float));
        assert!(!ConstValue::Double(1e300).fits(&Type::Float));
        assert!(!ConstValue::Bool(true).fits(&Type::Int));
        assert_eq!(
            ConstValue::Double(2.9).convert(&Type::Int),
            Some(ConstValue::Int(2))
        );
    }
}
