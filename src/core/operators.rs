/// Evaluation of binary and unary operators over `Value`s.
///
/// Mixed numeric operands promote (bool to int, int to float); if either
/// side is a string, `+` concatenates the rendered values; lists use set
/// arithmetic. Equality across unrelated kinds is `false`.
use std::cmp::Ordering;

use crate::core::state::{Fault, RngState};
use crate::schema::instruction::{BinaryOp, UnaryOp};
use crate::schema::list::{ListTable, ListValue};
use crate::schema::value::Value;

#[derive(Debug, Clone, Copy)]
enum Num {
    I(i32),
    U(u32),
    F(f32),
}

fn num(v: &Value) -> Option<Num> {
    match v {
        Value::Bool(b) => Some(Num::I(*b as i32)),
        Value::Int(i) => Some(Num::I(*i)),
        Value::UInt(u) => Some(Num::U(*u)),
        Value::Float(f) => Some(Num::F(*f)),
        _ => None,
    }
}

fn promote(a: Num, b: Num) -> (Num, Num) {
    let to_f = |n: Num| match n {
        Num::I(i) => i as f32,
        Num::U(u) => u as f32,
        Num::F(f) => f,
    };
    let to_i = |n: Num| match n {
        Num::I(i) => i,
        Num::U(u) => i32::try_from(u).unwrap_or(i32::MAX),
        Num::F(f) => f as i32,
    };
    match (a, b) {
        (Num::F(_), _) | (_, Num::F(_)) => (Num::F(to_f(a)), Num::F(to_f(b))),
        (Num::I(_), _) | (_, Num::I(_)) => (Num::I(to_i(a)), Num::I(to_i(b))),
        _ => (a, b),
    }
}

fn invalid(op: BinaryOp, lhs: &Value, rhs: &Value) -> Fault {
    Fault::InvalidOperands {
        op: format!("{op:?}"),
        lhs: lhs.kind(),
        rhs: rhs.kind(),
    }
}

fn invalid_unary(op: UnaryOp, v: &Value) -> Fault {
    Fault::InvalidOperand {
        op: format!("{op:?}"),
        operand: v.kind(),
    }
}

pub(crate) fn binary(
    op: BinaryOp,
    lhs: Value,
    rhs: Value,
    lists: &ListTable,
    rng: &mut RngState,
) -> Result<Value, Fault> {
    match op {
        BinaryOp::And => return Ok(Value::Bool(lhs.is_truthy() && rhs.is_truthy())),
        BinaryOp::Or => return Ok(Value::Bool(lhs.is_truthy() || rhs.is_truthy())),
        BinaryOp::Equal => return Ok(Value::Bool(lhs == rhs)),
        BinaryOp::NotEqual => return Ok(Value::Bool(lhs != rhs)),
        BinaryOp::Random => {
            let (Some(min), Some(max)) = (lhs.as_int(), rhs.as_int()) else {
                return Err(invalid(op, &lhs, &rhs));
            };
            if min > max {
                return Err(Fault::InvalidRandomRange { min, max });
            }
            return Ok(Value::Int(rng.range(min, max)));
        }
        _ => {}
    }

    match (&lhs, &rhs) {
        (Value::String(_), _) | (_, Value::String(_)) => string_op(op, &lhs, &rhs, lists),
        (Value::List(a), Value::List(b)) => list_op(op, a, b, lists).ok_or_else(|| invalid(op, &lhs, &rhs)),
        (Value::List(a), other) => {
            let n = num(other)
                .and_then(|_| other.as_int())
                .ok_or_else(|| invalid(op, &lhs, &rhs))?;
            match op {
                BinaryOp::Add => Ok(Value::List(lists.shift(a, n))),
                BinaryOp::Subtract => Ok(Value::List(lists.shift(a, n.wrapping_neg()))),
                BinaryOp::ListInt => Ok(Value::List(lists.from_int(a, n))),
                _ => Err(invalid(op, &lhs, &rhs)),
            }
        }
        _ => match (num(&lhs), num(&rhs)) {
            (Some(a), Some(b)) => numeric_op(op, a, b).ok_or_else(|| invalid(op, &lhs, &rhs))?,
            _ => Err(invalid(op, &lhs, &rhs)),
        },
    }
}

fn string_op(op: BinaryOp, lhs: &Value, rhs: &Value, lists: &ListTable) -> Result<Value, Fault> {
    match (op, lhs, rhs) {
        (BinaryOp::Add, _, _) => Ok(Value::String(lhs.render(lists) + &rhs.render(lists))),
        (BinaryOp::Has, Value::String(a), Value::String(b)) => Ok(Value::Bool(a.contains(b.as_str()))),
        (BinaryOp::Hasnt, Value::String(a), Value::String(b)) => {
            Ok(Value::Bool(!a.contains(b.as_str())))
        }
        _ => Err(invalid(op, lhs, rhs)),
    }
}

fn bounds(list: &ListValue, lists: &ListTable) -> Option<(i32, i32)> {
    let min = lists.flag_value(list.min_flag()?)?;
    let max = lists.flag_value(list.max_flag()?)?;
    Some((min, max))
}

fn list_op(op: BinaryOp, a: &ListValue, b: &ListValue, lists: &ListTable) -> Option<Value> {
    let by_bounds = |f: fn((i32, i32), (i32, i32)) -> bool| {
        Value::Bool(match (bounds(a, lists), bounds(b, lists)) {
            (Some(x), Some(y)) => f(x, y),
            _ => false,
        })
    };
    let value = match op {
        BinaryOp::Add => Value::List(a.union(b)),
        BinaryOp::Subtract => Value::List(a.difference(b)),
        BinaryOp::Intersection => Value::List(a.intersection(b)),
        BinaryOp::Has => Value::Bool(a.has(b)),
        BinaryOp::Hasnt => Value::Bool(a.hasnt(b)),
        BinaryOp::Greater => by_bounds(|(a_min, _), (_, b_max)| a_min > b_max),
        BinaryOp::Less => by_bounds(|(_, a_max), (b_min, _)| a_max < b_min),
        BinaryOp::GreaterOrEqual => {
            by_bounds(|(a_min, a_max), (b_min, b_max)| a_min >= b_min && a_max >= b_max)
        }
        BinaryOp::LessOrEqual => {
            by_bounds(|(a_min, a_max), (b_min, b_max)| a_min <= b_min && a_max <= b_max)
        }
        _ => return None,
    };
    Some(value)
}

fn numeric_op(op: BinaryOp, a: Num, b: Num) -> Option<Result<Value, Fault>> {
    let (a, b) = promote(a, b);
    let result = match (a, b) {
        (Num::I(x), Num::I(y)) => match op {
            BinaryOp::Add => Ok(Value::Int(x.wrapping_add(y))),
            BinaryOp::Subtract => Ok(Value::Int(x.wrapping_sub(y))),
            BinaryOp::Multiply => Ok(Value::Int(x.wrapping_mul(y))),
            BinaryOp::Divide if y == 0 => Err(Fault::DivideByZero),
            BinaryOp::Divide => Ok(Value::Int(x.wrapping_div(y))),
            BinaryOp::Modulo if y == 0 => Err(Fault::DivideByZero),
            BinaryOp::Modulo => Ok(Value::Int(x.wrapping_rem(y))),
            BinaryOp::Min => Ok(Value::Int(x.min(y))),
            BinaryOp::Max => Ok(Value::Int(x.max(y))),
            _ => Ok(Value::Bool(compare(op, x.cmp(&y))?)),
        },
        (Num::U(x), Num::U(y)) => match op {
            BinaryOp::Add => Ok(Value::UInt(x.wrapping_add(y))),
            BinaryOp::Subtract => Ok(Value::UInt(x.wrapping_sub(y))),
            BinaryOp::Multiply => Ok(Value::UInt(x.wrapping_mul(y))),
            BinaryOp::Divide | BinaryOp::Modulo if y == 0 => Err(Fault::DivideByZero),
            BinaryOp::Divide => Ok(Value::UInt(x / y)),
            BinaryOp::Modulo => Ok(Value::UInt(x % y)),
            BinaryOp::Min => Ok(Value::UInt(x.min(y))),
            BinaryOp::Max => Ok(Value::UInt(x.max(y))),
            _ => Ok(Value::Bool(compare(op, x.cmp(&y))?)),
        },
        (Num::F(x), Num::F(y)) => match op {
            BinaryOp::Add => Ok(Value::Float(x + y)),
            BinaryOp::Subtract => Ok(Value::Float(x - y)),
            BinaryOp::Multiply => Ok(Value::Float(x * y)),
            BinaryOp::Divide | BinaryOp::Modulo if y == 0.0 => Err(Fault::DivideByZero),
            BinaryOp::Divide => Ok(Value::Float(x / y)),
            BinaryOp::Modulo => Ok(Value::Float(x % y)),
            BinaryOp::Min => Ok(Value::Float(x.min(y))),
            BinaryOp::Max => Ok(Value::Float(x.max(y))),
            _ => Ok(Value::Bool(compare(op, x.partial_cmp(&y)?)?)),
        },
        _ => return None,
    };
    Some(result)
}

fn compare(op: BinaryOp, ordering: Ordering) -> Option<bool> {
    Some(match op {
        BinaryOp::Greater => ordering == Ordering::Greater,
        BinaryOp::Less => ordering == Ordering::Less,
        BinaryOp::GreaterOrEqual => ordering != Ordering::Less,
        BinaryOp::LessOrEqual => ordering != Ordering::Greater,
        _ => return None,
    })
}

/// `ReadCountOf` and `TurnsSince` need story state and are handled by the
/// runner; passing them here is an invalid operand.
pub(crate) fn unary(
    op: UnaryOp,
    v: Value,
    lists: &ListTable,
    rng: &mut RngState,
) -> Result<Value, Fault> {
    let out = match (op, &v) {
        (UnaryOp::Not, _) => Value::Bool(!v.is_truthy()),
        (UnaryOp::Negate, Value::Bool(b)) => Value::Int(-(*b as i32)),
        (UnaryOp::Negate, Value::Int(i)) => Value::Int(i.wrapping_neg()),
        (UnaryOp::Negate, Value::UInt(u)) => {
            Value::Int(-i32::try_from(*u).unwrap_or(i32::MAX))
        }
        (UnaryOp::Negate, Value::Float(f)) => Value::Float(-f),
        (UnaryOp::ListCount, Value::List(l)) => Value::Int(l.count() as i32),
        (UnaryOp::ListMin, Value::List(l)) => Value::List(l.min()),
        (UnaryOp::ListMax, Value::List(l)) => Value::List(l.max()),
        (UnaryOp::ListAll, Value::List(l)) => Value::List(lists.all(l)),
        (UnaryOp::ListInvert, Value::List(l)) => Value::List(lists.invert(l)),
        (UnaryOp::ListValue, Value::List(l)) => Value::Int(lists.value_of(l)),
        (UnaryOp::ListRandom, Value::List(l)) => {
            let mut picked = ListValue::new();
            if !l.is_empty() {
                let n = rng.index(l.count());
                if let Some(flag) = l.iter().nth(n) {
                    picked.insert(flag);
                }
            }
            Value::List(picked)
        }
        (UnaryOp::Floor, Value::Float(f)) => Value::Float(f.floor()),
        (UnaryOp::Ceiling, Value::Float(f)) => Value::Float(f.ceil()),
        (UnaryOp::Floor | UnaryOp::Ceiling, Value::Int(_) | Value::UInt(_)) => v.clone(),
        (UnaryOp::IntCast, _) if num(&v).is_some() => Value::Int(v.as_int().unwrap_or(0)),
        (UnaryOp::FloatCast, _) if num(&v).is_some() => Value::Float(v.as_float().unwrap_or(0.0)),
        _ => return Err(invalid_unary(op, &v)),
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::list::{FlagDecl, ListOrigin};

    fn lists() -> ListTable {
        ListTable {
            origins: vec![ListOrigin {
                name: "size".to_string(),
                flags: ["small", "medium", "large"]
                    .iter()
                    .enumerate()
                    .map(|(i, n)| FlagDecl {
                        name: n.to_string(),
                        value: i as i32 + 1,
                    })
                    .collect(),
            }],
        }
    }

    fn eval(op: BinaryOp, a: Value, b: Value) -> Result<Value, Fault> {
        binary(op, a, b, &lists(), &mut RngState::new(0))
    }

    #[test]
    fn int_and_float_promote() {
        assert_eq!(
            eval(BinaryOp::Add, Value::Int(1), Value::Float(0.5)).unwrap(),
            Value::Float(1.5)
        );
        assert!(matches!(
            eval(BinaryOp::Divide, Value::Int(7), Value::Int(2)).unwrap(),
            Value::Int(3)
        ));
        assert!(matches!(
            eval(BinaryOp::Greater, Value::Int(6), Value::Int(5)).unwrap(),
            Value::Bool(true)
        ));
        assert_eq!(
            eval(BinaryOp::Modulo, Value::Int(1), Value::Int(0)),
            Err(Fault::DivideByZero)
        );
    }

    #[test]
    fn strings_concatenate_rendered_values() {
        assert_eq!(
            eval(BinaryOp::Add, Value::from("x = "), Value::Float(2.0)).unwrap(),
            Value::from("x = 2")
        );
        assert_eq!(
            eval(BinaryOp::Has, Value::from("haystack"), Value::from("st")).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn cross_kind_equality_is_false_not_an_error() {
        assert_eq!(
            eval(BinaryOp::Equal, Value::from("1"), Value::Int(1)).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            eval(BinaryOp::NotEqual, Value::None, Value::Int(0)).unwrap(),
            Value::Bool(true)
        );
        assert!(eval(BinaryOp::Subtract, Value::Bool(true), Value::from("a")).is_err());
    }

    #[test]
    fn list_arithmetic_and_comparison() {
        let t = lists();
        let small = Value::List(t.list_of(&["small"]).unwrap());
        let large = Value::List(t.list_of(&["large"]).unwrap());
        assert_eq!(
            eval(BinaryOp::Greater, large.clone(), small.clone()).unwrap(),
            Value::Bool(true)
        );
        let both = eval(BinaryOp::Add, small.clone(), large.clone()).unwrap();
        assert_eq!(
            eval(BinaryOp::Subtract, both.clone(), large).unwrap(),
            small
        );
        let shifted = eval(BinaryOp::Add, small, Value::Int(1)).unwrap();
        assert_eq!(shifted, Value::List(t.list_of(&["medium"]).unwrap()));
        assert_eq!(
            unary(UnaryOp::ListCount, both, &t, &mut RngState::new(0)).unwrap(),
            Value::Int(2)
        );
    }

    #[test]
    fn random_is_inclusive_and_checked() {
        let mut rng = RngState::new(3);
        for _ in 0..32 {
            let v = binary(BinaryOp::Random, Value::Int(1), Value::Int(2), &lists(), &mut rng)
                .unwrap();
            assert!(matches!(v, Value::Int(1 | 2)));
        }
        assert_eq!(
            eval(BinaryOp::Random, Value::Int(5), Value::Int(1)),
            Err(Fault::InvalidRandomRange { min: 5, max: 1 })
        );
    }

    #[test]
    fn casts_truncate() {
        let t = lists();
        let mut rng = RngState::new(0);
        assert_eq!(
            unary(UnaryOp::IntCast, Value::Float(-3.7), &t, &mut rng).unwrap(),
            Value::Int(-3)
        );
        assert_eq!(
            unary(UnaryOp::Floor, Value::Float(3.7), &t, &mut rng).unwrap(),
            Value::Float(3.0)
        );
        assert!(unary(UnaryOp::ListCount, Value::Int(1), &t, &mut rng).is_err());
    }

    #[test]
    fn large_unsigned_values_saturate_into_int() {
        let big = Value::UInt(3_000_000_000);
        assert_eq!(
            eval(BinaryOp::Subtract, big.clone(), Value::Int(1)).unwrap(),
            Value::Int(i32::MAX - 1)
        );
        assert_eq!(
            eval(BinaryOp::Greater, big.clone(), Value::Int(0)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            unary(UnaryOp::Negate, big, &lists(), &mut RngState::new(0)).unwrap(),
            Value::Int(-i32::MAX)
        );
    }
}
