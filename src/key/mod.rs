#![forbid(unsafe_code)]
//! Fixed-width unsigned key arithmetic and codecs.
//!
//! Keys are 256-bit unsigned integers stored big-endian on disk. The zero
//! key is reserved as the "empty slot" sentinel and is never stored.

use std::fmt;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::types::{EstriaError, Result};

pub const KEY_BITS: u32 = 256;
pub const KEY_BYTES: usize = 32;

const LIMBS: usize = 4;

/// A 256-bit unsigned integer. Limbs are kept most-significant first so the
/// derived lexicographic ordering is the numeric ordering.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Key {
    limbs: [u64; LIMBS],
}

impl Key {
    pub const ZERO: Key = Key { limbs: [0; LIMBS] };
    pub const MAX: Key = Key {
        limbs: [u64::MAX; LIMBS],
    };
    pub const MIN: Key = Key::ZERO;

    pub const fn from_u64(value: u64) -> Key {
        Key {
            limbs: [0, 0, 0, value],
        }
    }

    pub fn is_zero(&self) -> bool {
        self.limbs.iter().all(|&l| l == 0)
    }

    pub fn checked_add(&self, rhs: &Key) -> Result<Key> {
        let mut out = [0u64; LIMBS];
        let mut carry = false;
        for i in (0..LIMBS).rev() {
            let (sum, c1) = self.limbs[i].overflowing_add(rhs.limbs[i]);
            let (sum, c2) = sum.overflowing_add(carry as u64);
            out[i] = sum;
            carry = c1 || c2;
        }
        if carry {
            return Err(EstriaError::Overflow);
        }
        Ok(Key { limbs: out })
    }

    pub fn checked_sub(&self, rhs: &Key) -> Result<Key> {
        let (out, borrow) = self.wrapping_sub(rhs);
        if borrow {
            return Err(EstriaError::Overflow);
        }
        Ok(out)
    }

    pub fn checked_mul_u64(&self, rhs: u64) -> Result<Key> {
        let mut out = [0u64; LIMBS];
        let mut carry = 0u128;
        for i in (0..LIMBS).rev() {
            let product = self.limbs[i] as u128 * rhs as u128 + carry;
            out[i] = product as u64;
            carry = product >> 64;
        }
        if carry != 0 {
            return Err(EstriaError::Overflow);
        }
        Ok(Key { limbs: out })
    }

    /// Quotient and remainder of `self / rhs`. Division by zero is invalid.
    pub fn divmod(&self, rhs: &Key) -> Result<(Key, Key)> {
        if rhs.is_zero() {
            return Err(EstriaError::Invalid("division by zero"));
        }
        let mut quotient = Key::ZERO;
        let mut rem = Key::ZERO;
        for i in (0..KEY_BITS as usize).rev() {
            let (shifted, overflow) = rem.shl1();
            rem = shifted;
            if self.bit(i) {
                rem.limbs[LIMBS - 1] |= 1;
            }
            if overflow || rem >= *rhs {
                let (sub, _) = rem.wrapping_sub(rhs);
                rem = sub;
                quotient.set_bit(i);
            }
        }
        Ok((quotient, rem))
    }

    /// Absolute difference of two keys.
    pub fn distance(&self, other: &Key) -> Key {
        if self > other {
            self.checked_sub(other).expect("larger minus smaller")
        } else {
            other.checked_sub(self).expect("larger minus smaller")
        }
    }

    pub fn to_bytes(&self) -> [u8; KEY_BYTES] {
        let mut out = [0u8; KEY_BYTES];
        for (i, limb) in self.limbs.iter().enumerate() {
            out[i * 8..(i + 1) * 8].copy_from_slice(&limb.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Key> {
        if bytes.len() != KEY_BYTES {
            return Err(EstriaError::KeyWrongLength);
        }
        let mut limbs = [0u64; LIMBS];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *limb = u64::from_be_bytes(raw);
        }
        Ok(Key { limbs })
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(KEY_BYTES * 2);
        for byte in self.to_bytes() {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    pub fn from_hex(hex: &str) -> Result<Key> {
        if hex.len() != KEY_BYTES * 2 {
            return Err(EstriaError::KeyWrongLength);
        }
        let mut bytes = [0u8; KEY_BYTES];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let high = hex_digit(chunk[0])?;
            let low = hex_digit(chunk[1])?;
            bytes[i] = (high << 4) | low;
        }
        Key::from_bytes(&bytes)
    }

    fn bit(&self, i: usize) -> bool {
        let limb = LIMBS - 1 - i / 64;
        (self.limbs[limb] >> (i % 64)) & 1 == 1
    }

    fn set_bit(&mut self, i: usize) {
        let limb = LIMBS - 1 - i / 64;
        self.limbs[limb] |= 1 << (i % 64);
    }

    fn shl1(&self) -> (Key, bool) {
        let mut out = [0u64; LIMBS];
        let mut carry = 0u64;
        for i in (0..LIMBS).rev() {
            out[i] = (self.limbs[i] << 1) | carry;
            carry = self.limbs[i] >> 63;
        }
        (Key { limbs: out }, carry == 1)
    }

    fn wrapping_sub(&self, rhs: &Key) -> (Key, bool) {
        let mut out = [0u64; LIMBS];
        let mut borrow = false;
        for i in (0..LIMBS).rev() {
            let (diff, b1) = self.limbs[i].overflowing_sub(rhs.limbs[i]);
            let (diff, b2) = diff.overflowing_sub(borrow as u64);
            out[i] = diff;
            borrow = b1 || b2;
        }
        (Key { limbs: out }, borrow)
    }

    fn low_u64(&self) -> u64 {
        self.limbs[LIMBS - 1]
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn hex_digit(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(EstriaError::Invalid("invalid hex digit in key")),
    }
}

/// Spacing of the anchor keys across a node covering `[first, last]` with
/// `degree` children.
pub fn stride(first: &Key, last: &Key, degree: u32) -> Result<Key> {
    let span = last.checked_sub(first)?;
    let (stride, _) = span.divmod(&Key::from_u64(degree as u64))?;
    Ok(stride)
}

/// Finds the slot whose anchor `first + (i + 1) * stride` lies closest to
/// `value`, along with the absolute distance to that anchor. Slots are
/// indexed `0..=degree - 2`; on a distance tie the smaller index wins.
pub fn nearest_stride(
    first: &Key,
    stride: &Key,
    degree: u32,
    value: &Key,
) -> Result<(usize, Key)> {
    let last_slot = degree as usize - 2;
    let delta = value.checked_sub(first)?;
    let (q, r) = delta.divmod(stride)?;
    let q = if q > Key::from_u64(degree as u64) {
        degree as u64
    } else {
        q.low_u64()
    };
    if q == 0 {
        // Below the first anchor; distance up to it.
        return Ok((0, stride.checked_sub(&r)?));
    }
    if q as usize >= last_slot + 1 {
        // At or beyond the final anchor; distance back down to it.
        let anchors = stride.checked_mul_u64(last_slot as u64 + 1)?;
        return Ok((last_slot, delta.checked_sub(&anchors)?));
    }
    let down = r;
    let up = stride.checked_sub(&down)?;
    if down <= up {
        Ok((q as usize - 1, down))
    } else {
        Ok((q as usize, up))
    }
}

/// Generates `n` uniformly random keys from a deterministic seed.
pub fn random_keys(n: usize, seed: u64) -> Vec<Key> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut keys = Vec::with_capacity(n);
    for _ in 0..n {
        let mut bytes = [0u8; KEY_BYTES];
        rng.fill_bytes(&mut bytes);
        keys.push(Key::from_bytes(&bytes).expect("fixed-width buffer"));
    }
    keys
}
