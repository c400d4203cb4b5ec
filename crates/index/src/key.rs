//! Comparable index keys.

use mergebox_common::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// The comparable subset of [`Value`]. Ints and floats compare
/// numerically with each other; other kinds only compare within their kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexKey {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Comparability class of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyKind {
    Bool,
    Number,
    Text,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Bool => f.write_str("bool"),
            KeyKind::Number => f.write_str("number"),
            KeyKind::Text => f.write_str("string"),
        }
    }
}

impl IndexKey {
    /// Convert a scalar value. `None` for null, arrays and documents.
    pub fn from_scalar(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(IndexKey::Bool(*b)),
            Value::Int(i) => Some(IndexKey::Int(*i)),
            Value::Float(f) => Some(IndexKey::Float(*f)),
            Value::String(s) => Some(IndexKey::Text(s.clone())),
            Value::Null | Value::Array(_) | Value::Document(_) => None,
        }
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            IndexKey::Bool(_) => KeyKind::Bool,
            IndexKey::Int(_) | IndexKey::Float(_) => KeyKind::Number,
            IndexKey::Text(_) => KeyKind::Text,
        }
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use IndexKey::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => cmp_floats(*a, *b),
            (Int(a), Float(b)) => cmp_int_float(*a, *b),
            (Float(a), Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Text(a), Text(b)) => a.cmp(b),
            _ => self.kind().cmp(&other.kind()),
        }
    }
}

/// Numeric order with `-0.0 == 0.0`. NaNs sort after (or, when
/// negative, before) every number.
fn cmp_floats(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b))
}

/// Exact comparison; casting the int to f64 would round above 2^53.
fn cmp_int_float(a: i64, b: f64) -> Ordering {
    // 2^63, the first float above i64::MAX.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if b.is_nan() {
        return if b.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if b >= LIMIT {
        return Ordering::Less;
    }
    if b < -LIMIT {
        return Ordering::Greater;
    }
    let whole = b.trunc();
    // `whole` lies in [-2^63, 2^63) so the cast is exact.
    match a.cmp(&(whole as i64)) {
        Ordering::Equal => whole.partial_cmp(&b).unwrap_or(Ordering::Equal),
        unequal => unequal,
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Bool(b) => write!(f, "{}", b),
            IndexKey::Int(i) => write!(f, "{}", i),
            IndexKey::Float(x) => write!(f, "{}", x),
            IndexKey::Text(s) => write!(f, "{:?}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_compare_across_int_and_float() {
        assert!(IndexKey::Int(1) < IndexKey::Float(1.5));
        assert!(IndexKey::Float(2.5) > IndexKey::Int(2));
        assert_eq!(IndexKey::Int(3), IndexKey::Float(3.0));
    }

    #[test]
    fn test_large_ints_compare_exactly_with_floats() {
        let two_53 = 1i64 << 53;
        let f = IndexKey::Float(two_53 as f64);
        assert_eq!(IndexKey::Int(two_53), f);
        assert!(IndexKey::Int(two_53 + 1) > f);
        assert!(f < IndexKey::Int(two_53 + 1));
        assert!(IndexKey::Int(i64::MAX) < IndexKey::Float(9_223_372_036_854_775_808.0));
        assert!(IndexKey::Int(i64::MIN) == IndexKey::Float(i64::MIN as f64));
        assert!(IndexKey::Int(-3) < IndexKey::Float(-2.5));
        assert!(IndexKey::Int(-2) > IndexKey::Float(-2.5));
        assert!(IndexKey::Int(0) < IndexKey::Float(f64::INFINITY));
        assert!(IndexKey::Int(0) > IndexKey::Float(f64::NEG_INFINITY));
        assert_eq!(IndexKey::Float(-0.0), IndexKey::Float(0.0));
        assert_eq!(IndexKey::Int(0), IndexKey::Float(-0.0));
    }

    #[test]
    fn test_int_float_order_is_transitive() {
        let two_53 = 1i64 << 53;
        let mut keys = vec![
            IndexKey::Int(two_53 + 1),
            IndexKey::Float(two_53 as f64),
            IndexKey::Int(two_53),
            IndexKey::Float(two_53 as f64 + 2.0),
            IndexKey::Int(two_53 - 1),
        ];
        keys.sort();
        assert_eq!(
            keys.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec![
                (two_53 - 1).to_string(),
                (two_53 as f64).to_string(),
                two_53.to_string(),
                (two_53 + 1).to_string(),
                (two_53 as f64 + 2.0).to_string(),
            ]
        );
        for a in &keys {
            for b in &keys {
                assert_eq!(a.cmp(b), b.cmp(a).reverse());
            }
        }
    }

    #[test]
    fn test_kinds_do_not_interleave() {
        let mut keys = vec![
            IndexKey::Text("a".into()),
            IndexKey::Int(100),
            IndexKey::Bool(true),
            IndexKey::Float(-1.0),
        ];
        keys.sort();
        let kinds: Vec<KeyKind> = keys.iter().map(IndexKey::kind).collect();
        assert_eq!(
            kinds,
            vec![KeyKind::Bool, KeyKind::Number, KeyKind::Number, KeyKind::Text]
        );
    }

    #[test]
    fn test_from_scalar() {
        assert_eq!(IndexKey::from_scalar(&Value::from("x")), Some(IndexKey::Text("x".into())));
        assert_eq!(IndexKey::from_scalar(&Value::Null), None);
        assert_eq!(IndexKey::from_scalar(&Value::from(vec![1])), None);
    }
}
