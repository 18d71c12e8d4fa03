//! The `number` type: a single language-level type with an i64/f64 tower.
//!
//! Arithmetic stays integral while both operands are integral and the result
//! is representable; anything else falls through to floats. Division and
//! modulo by zero yield Inf/NaN per IEEE semantics, never an early error.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Number {
    Int(i64),
    Flt(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Flt(x) => x,
        }
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            Number::Int(n) => Some(n),
            Number::Flt(x) if x.fract() == 0.0 && x.abs() < i64::MAX as f64 => Some(x as i64),
            Number::Flt(_) => None,
        }
    }

    pub fn add(self, rhs: Number) -> Number {
        match (self, rhs) {
            (Number::Int(a), Number::Int(b)) => match a.checked_add(b) {
                Some(n) => Number::Int(n),
                None => Number::Flt(a as f64 + b as f64),
            },
            _ => Number::Flt(self.as_f64() + rhs.as_f64()),
        }
    }

    pub fn sub(self, rhs: Number) -> Number {
        match (self, rhs) {
            (Number::Int(a), Number::Int(b)) => match a.checked_sub(b) {
                Some(n) => Number::Int(n),
                None => Number::Flt(a as f64 - b as f64),
            },
            _ => Number::Flt(self.as_f64() - rhs.as_f64()),
        }
    }

    pub fn mul(self, rhs: Number) -> Number {
        match (self, rhs) {
            (Number::Int(a), Number::Int(b)) => match a.checked_mul(b) {
                Some(n) => Number::Int(n),
                None => Number::Flt(a as f64 * b as f64),
            },
            _ => Number::Flt(self.as_f64() * rhs.as_f64()),
        }
    }

    pub fn div(self, rhs: Number) -> Number {
        if let (Number::Int(a), Number::Int(b)) = (self, rhs) {
            if b != 0 && a % b == 0 {
                return Number::Int(a / b);
            }
        }
        Number::Flt(self.as_f64() / rhs.as_f64())
    }

    pub fn rem(self, rhs: Number) -> Number {
        if let (Number::Int(a), Number::Int(b)) = (self, rhs) {
            if b != 0 {
                return Number::Int(a % b);
            }
        }
        Number::Flt(self.as_f64() % rhs.as_f64())
    }

    pub fn pow(self, rhs: Number) -> Number {
        if let (Number::Int(a), Number::Int(b)) = (self, rhs) {
            if (0..=63).contains(&b) {
                if let Some(n) = a.checked_pow(b as u32) {
                    return Number::Int(n);
                }
            }
        }
        Number::Flt(self.as_f64().powf(rhs.as_f64()))
    }

    /// Truncating conversion used by the bitwise operators.
    pub fn as_bits(self) -> i64 {
        match self {
            Number::Int(n) => n,
            Number::Flt(x) => x as i64,
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (*self, *other) {
            (Number::Int(a), Number::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Number::Int(n) => write!(f, "{}", n),
            Number::Flt(x) => {
                if x == x.floor() && x.is_finite() && x.abs() < 1e15 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
        }
    }
}

impl From<i64> for Number {
    fn from(n: i64) -> Self {
        Number::Int(n)
    }
}

impl From<f64> for Number {
    fn from(x: f64) -> Self {
        Number::Flt(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_arithmetic_stays_exact() {
        let mut acc = Number::Int(1);
        for n in 1..=20 {
            acc = acc.mul(Number::Int(n));
        }
        assert_eq!(acc, Number::Int(2432902008176640000));
    }

    #[test]
    fn test_overflow_promotes_to_float() {
        let big = Number::Int(i64::MAX);
        match big.add(Number::Int(1)) {
            Number::Flt(x) => assert!(x > i64::MAX as f64 - 2.0),
            Number::Int(_) => panic!("expected promotion"),
        }
    }

    #[test]
    fn test_division_semantics() {
        assert_eq!(Number::Int(6).div(Number::Int(3)), Number::Int(2));
        assert_eq!(Number::Int(13).div(Number::Int(5)), Number::Flt(2.6));
        match Number::Int(1).div(Number::Int(0)) {
            Number::Flt(x) => assert!(x.is_infinite()),
            Number::Int(_) => panic!("division by zero must be Inf"),
        }
        match Number::Int(0).div(Number::Int(0)) {
            Number::Flt(x) => assert!(x.is_nan()),
            Number::Int(_) => panic!("0/0 must be NaN"),
        }
    }

    #[test]
    fn test_modulo_by_zero_is_nan() {
        match Number::Int(7).rem(Number::Int(0)) {
            Number::Flt(x) => assert!(x.is_nan()),
            Number::Int(_) => panic!("mod by zero must be NaN"),
        }
    }

    #[test]
    fn test_cross_representation_equality() {
        assert_eq!(Number::Int(2), Number::Flt(2.0));
        assert!(Number::Int(1) < Number::Flt(1.5));
        assert!(Number::Flt(0.5) < Number::Int(1));
    }

    #[test]
    fn test_pow() {
        assert_eq!(Number::Int(2).pow(Number::Int(10)), Number::Int(1024));
        assert_eq!(Number::Flt(4.0).pow(Number::Flt(0.5)), Number::Flt(2.0));
    }

    #[test]
    fn test_display() {
        assert_eq!(Number::Int(42).to_string(), "42");
        assert_eq!(Number::Flt(2.0).to_string(), "2.0");
        assert_eq!(Number::Flt(2.5).to_string(), "2.5");
    }
}
