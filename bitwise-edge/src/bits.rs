//! Bit-string values and the AND/OR arithmetic the workers perform.
//!
//! Operands are strings of '0'/'1' digits rather than integers. The shorter
//! operand is treated as if it were left-padded with zeros to the length of
//! the longer one, and results are canonical: no leading zeros, except the
//! single-digit `"0"` for an all-zero result.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{BitStringError, ProtocolError};

/// Longest operand (and therefore result) a job may carry.
pub const MAX_BITS: usize = 10;

/// A validated string of 1 to [`MAX_BITS`] binary digits.
///
/// Leading zeros in operands are preserved as submitted; only computed results
/// are canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BitString(String);

impl BitString {
    pub fn parse(digits: &str) -> Result<Self, BitStringError> {
        if digits.is_empty() {
            return Err(BitStringError::Empty);
        }
        if !digits.bytes().all(|b| b == b'0' || b == b'1') {
            return Err(BitStringError::InvalidDigit(digits.to_string()));
        }
        if digits.len() > MAX_BITS {
            return Err(BitStringError::TooLong(digits.to_string()));
        }
        Ok(Self(digits.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the string has no leading zero, or is exactly `"0"`.
    #[cfg(test)]
    fn is_canonical(&self) -> bool {
        self.0 == "0" || !self.0.starts_with('0')
    }

    fn bits(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl FromStr for BitString {
    type Err = BitStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BitString {
    type Error = BitStringError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BitString> for String {
    fn from(value: BitString) -> Self {
        value.0
    }
}

impl fmt::Display for BitString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two job types; each has a dedicated worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    And,
    Or,
}

impl Operator {
    pub const ALL: [Operator; 2] = [Operator::And, Operator::Or];

    pub fn apply(self, a: &BitString, b: &BitString) -> BitString {
        match self {
            Operator::And => compute_and(a, b),
            Operator::Or => compute_or(a, b),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::And => "and",
            Operator::Or => "or",
        }
    }
}

impl FromStr for Operator {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "and" => Ok(Operator::And),
            "or" => Ok(Operator::Or),
            other => Err(ProtocolError::UnknownOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitwise AND of two bit-strings, canonicalized.
///
/// Positions of the longer operand beyond the shorter one's length are ANDed
/// with an implicit zero, so only the aligned suffix can contribute a '1' and
/// the result is never longer than the shorter operand.
pub fn compute_and(a: &BitString, b: &BitString) -> BitString {
    let (long, short) = by_length(a, b);
    let offset = long.len() - short.len();

    canonical(
        long[offset..]
            .iter()
            .zip(short)
            .map(|(x, y)| *x == b'1' && *y == b'1'),
    )
}

/// Bitwise OR of two bit-strings, canonicalized.
pub fn compute_or(a: &BitString, b: &BitString) -> BitString {
    let (long, short) = by_length(a, b);
    let offset = long.len() - short.len();

    // ORing with the implicit zero padding copies the longer operand's bits.
    let leading = long[..offset].iter().map(|x| *x == b'1');
    let aligned = long[offset..]
        .iter()
        .zip(short)
        .map(|(x, y)| *x == b'1' || *y == b'1');

    canonical(leading.chain(aligned))
}

fn by_length<'a>(a: &'a BitString, b: &'a BitString) -> (&'a [u8], &'a [u8]) {
    if a.len() >= b.len() {
        (a.bits(), b.bits())
    } else {
        (b.bits(), a.bits())
    }
}

/// Renders bits most-significant first, dropping zeros before the first one.
fn canonical(bits: impl Iterator<Item = bool>) -> BitString {
    let mut out = String::with_capacity(MAX_BITS);
    for bit in bits {
        if bit {
            out.push('1');
        } else if !out.is_empty() {
            out.push('0');
        }
    }
    if out.is_empty() {
        out.push('0');
    }
    BitString(out)
}
