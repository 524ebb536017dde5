//! Arithmetic in the prime field GF(2^61 - 1).
//!
//! The modulus is a Mersenne prime, so reduction is a shift-and-add instead
//! of a division. Products of two field elements fit in a `u128`.
//!
//! Secrets are mapped into the field in 7-byte big-endian chunks: the largest
//! chunk value is 2^56 - 1, strictly below the modulus, so every chunk is a
//! field element without wrap-around.

use rand::Rng;
use std::ops::{Add, Mul, Neg, Sub};
use zeroize::Zeroize;

/// Field modulus, 2^61 - 1
pub const FIELD_PRIME: u64 = (1 << 61) - 1;

/// Secret bytes carried by one field element
pub const CHUNK_BYTES: usize = 7;

/// Serialized width of one field element
pub const ELEMENT_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Zeroize)]
pub struct FieldElement(u64);

fn reduce(x: u128) -> u64 {
    let p = FIELD_PRIME as u128;
    let folded = (x & p) + (x >> 61);
    let folded = (folded & p) + (folded >> 61);
    if folded >= p {
        (folded - p) as u64
    } else {
        folded as u64
    }
}

impl FieldElement {
    pub const ZERO: FieldElement = FieldElement(0);
    pub const ONE: FieldElement = FieldElement(1);

    /// Reduce an arbitrary integer into the field
    pub fn new(value: u64) -> Self {
        FieldElement(reduce(value as u128))
    }

    /// Accept `value` only if it is already canonical (< p)
    pub fn from_canonical(value: u64) -> Option<Self> {
        (value < FIELD_PRIME).then_some(FieldElement(value))
    }

    /// Uniform sample from [0, p)
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        FieldElement(rng.gen_range(0..FIELD_PRIME))
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn pow(self, mut exp: u64) -> Self {
        let mut base = self;
        let mut acc = FieldElement::ONE;
        while exp > 0 {
            if exp & 1 == 1 {
                acc = acc * base;
            }
            base = base * base;
            exp >>= 1;
        }
        acc
    }

    /// Multiplicative inverse via Fermat's little theorem; `None` for zero
    pub fn inverse(self) -> Option<Self> {
        if self.is_zero() {
            None
        } else {
            Some(self.pow(FIELD_PRIME - 2))
        }
    }
}

impl Add for FieldElement {
    type Output = FieldElement;

    fn add(self, rhs: FieldElement) -> FieldElement {
        FieldElement(reduce(self.0 as u128 + rhs.0 as u128))
    }
}

impl Sub for FieldElement {
    type Output = FieldElement;

    fn sub(self, rhs: FieldElement) -> FieldElement {
        FieldElement(reduce(self.0 as u128 + FIELD_PRIME as u128 - rhs.0 as u128))
    }
}

impl Mul for FieldElement {
    type Output = FieldElement;

    fn mul(self, rhs: FieldElement) -> FieldElement {
        FieldElement(reduce(self.0 as u128 * rhs.0 as u128))
    }
}

impl Neg for FieldElement {
    type Output = FieldElement;

    fn neg(self) -> FieldElement {
        FieldElement::ZERO - self
    }
}

/// Evaluate a polynomial (coefficients lowest degree first) with Horner's rule
pub fn evaluate(coefficients: &[FieldElement], x: FieldElement) -> FieldElement {
    coefficients
        .iter()
        .rev()
        .fold(FieldElement::ZERO, |acc, c| acc * x + *c)
}

/// Lagrange interpolation of the unique polynomial through `points`, evaluated at `x`.
///
/// Returns `None` when two points share an x-coordinate.
pub fn interpolate_at(points: &[(FieldElement, FieldElement)], x: FieldElement) -> Option<FieldElement> {
    let mut result = FieldElement::ZERO;
    for (i, (xi, yi)) in points.iter().enumerate() {
        let mut numerator = FieldElement::ONE;
        let mut denominator = FieldElement::ONE;
        for (j, (xj, _)) in points.iter().enumerate() {
            if i == j {
                continue;
            }
            numerator = numerator * (x - *xj);
            denominator = denominator * (*xi - *xj);
        }
        result = result + *yi * numerator * denominator.inverse()?;
    }
    Some(result)
}

/// Number of field elements needed for a secret of `len` bytes
pub fn chunk_count(len: usize) -> usize {
    len.div_ceil(CHUNK_BYTES)
}

/// Split secret bytes into big-endian field elements of up to 7 bytes each
pub fn encode_chunks(secret: &[u8]) -> Vec<FieldElement> {
    secret
        .chunks(CHUNK_BYTES)
        .map(|chunk| {
            let value = chunk.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
            FieldElement(value)
        })
        .collect()
}

/// Inverse of [`encode_chunks`].
///
/// Returns `None` if the element count does not match `secret_len` or an
/// element does not fit the byte width of its chunk.
pub fn decode_chunks(elements: &[FieldElement], secret_len: usize) -> Option<Vec<u8>> {
    if elements.len() != chunk_count(secret_len) {
        return None;
    }

    let mut out = Vec::with_capacity(secret_len);
    for (i, element) in elements.iter().enumerate() {
        let width = CHUNK_BYTES.min(secret_len - i * CHUNK_BYTES);
        if element.0 >> (8 * width) != 0 {
            return None;
        }
        let bytes = element.0.to_be_bytes();
        out.extend_from_slice(&bytes[ELEMENT_BYTES - width..]);
    }
    Some(out)
}
