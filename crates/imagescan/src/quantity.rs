//! Exact resource quantity arithmetic
//!
//! Kubernetes expresses CPU and memory as quantity strings ("250m", "2",
//! "128Mi", "1e3"). Node capacity math has to be exact, so quantities are
//! parsed into a `rust_decimal::Decimal` instead of a float.

use crate::error::QuantityError;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use rust_decimal::Decimal;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

/// Exact decimal resource quantity. May be negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    /// Parse a Kubernetes quantity string
    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(QuantityError::Empty);
        }

        let split = input
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '+' || c == '-'))))
            .map(|(i, _)| i)
            .unwrap_or(input.len());
        let (number, suffix) = input.split_at(split);

        let number = parse_number(number)?;
        let multiplier = suffix_multiplier(suffix)?;

        number
            .checked_mul(multiplier)
            .map(Quantity)
            .ok_or_else(|| QuantityError::Overflow(input.to_string()))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }
}

fn parse_number(number: &str) -> Result<Decimal, QuantityError> {
    let normalized = match number {
        "" | "+" | "-" => return Err(QuantityError::InvalidNumber(number.to_string())),
        n if n.starts_with('.') => format!("0{n}"),
        n if n.starts_with("+.") || n.starts_with("-.") => format!("{}0{}", &n[..1], &n[1..]),
        n => n.strip_prefix('+').unwrap_or(n).to_string(),
    };
    Decimal::from_str(&normalized).map_err(|_| QuantityError::InvalidNumber(number.to_string()))
}

fn suffix_multiplier(suffix: &str) -> Result<Decimal, QuantityError> {
    let binary = |shift: u32| Decimal::from(1u64 << shift);
    let multiplier = match suffix {
        "" => Decimal::ONE,
        "Ki" => binary(10),
        "Mi" => binary(20),
        "Gi" => binary(30),
        "Ti" => binary(40),
        "Pi" => binary(50),
        "Ei" => binary(60),
        "n" => pow10(-9)?,
        "u" => pow10(-6)?,
        "m" => pow10(-3)?,
        "k" => pow10(3)?,
        "M" => pow10(6)?,
        "G" => pow10(9)?,
        "T" => pow10(12)?,
        "P" => pow10(15)?,
        "E" => pow10(18)?,
        s if s.len() > 1 && (s.starts_with('e') || s.starts_with('E')) => {
            let exp: i32 = s[1..]
                .parse()
                .map_err(|_| QuantityError::UnknownSuffix(suffix.to_string()))?;
            pow10(exp)?
        }
        _ => return Err(QuantityError::UnknownSuffix(suffix.to_string())),
    };
    Ok(multiplier)
}

fn pow10(exp: i32) -> Result<Decimal, QuantityError> {
    if exp < 0 {
        let scale = exp.unsigned_abs();
        if scale > 28 {
            return Err(QuantityError::Overflow(format!("1e{exp}")));
        }
        return Ok(Decimal::new(1, scale));
    }

    let mut value = Decimal::ONE;
    for _ in 0..exp {
        value = value
            .checked_mul(Decimal::TEN)
            .ok_or_else(|| QuantityError::Overflow(format!("1e{exp}")))?;
    }
    Ok(value)
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}

impl TryFrom<&K8sQuantity> for Quantity {
    type Error = QuantityError;

    fn try_from(value: &K8sQuantity) -> Result<Self, Self::Error> {
        Quantity::parse(&value.0)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

// Arithmetic saturates at the decimal bounds instead of panicking.
impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(rhs.0))
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        *self = *self + rhs;
    }
}

impl SubAssign for Quantity {
    fn sub_assign(&mut self, rhs: Quantity) {
        *self = *self - rhs;
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Quantity> for Quantity {
    fn sum<I: Iterator<Item = &'a Quantity>>(iter: I) -> Quantity {
        iter.copied().sum()
    }
}
