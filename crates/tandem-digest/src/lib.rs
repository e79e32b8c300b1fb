// crates/tandem-digest/src/lib.rs

//! State digest engine: type-tagged canonical encoding + keccak-256 commitments.
//!
//! Every backend authenticates a step against the previous one by comparing a
//! digest of the persistent protocol variables. This crate fixes the one
//! encoding all of them must agree on:
//!
//! | kind      | bytes                                   |
//! |-----------|-----------------------------------------|
//! | `Unit`    | `0x00`                                  |
//! | `UInt`    | `0x01 ‖ u64 big-endian (8 bytes)`       |
//! | `Address` | `0x02 ‖ 32 bytes`                       |
//! | `Digest`  | `0x03 ‖ 32 bytes`                       |
//! | `Tuple`   | `0x04 ‖ arity (u16 BE) ‖ elements`      |
//!
//! A top-level shape is the plain concatenation of its slots, so the digest of
//! the empty shape is `keccak256("")` ([`empty_digest`]).
//!
//! The tag byte makes `(1, a, 5)` and `(1, a, "5")` distinct by construction;
//! values are never coerced between kinds.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(clippy::module_name_repetitions)]

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use tiny_keccak::{Hasher, Keccak};

/// Tag bytes of the canonical encoding.
pub mod tag {
    /// `Unit`
    pub const UNIT: u8 = 0x00;
    /// `UInt`
    pub const UINT: u8 = 0x01;
    /// `Address`
    pub const ADDRESS: u8 = 0x02;
    /// `Digest`
    pub const DIGEST: u8 = 0x03;
    /// `Tuple`
    pub const TUPLE: u8 = 0x04;
}

/* --------------------------------- bytes32 -------------------------------- */

macro_rules! bytes32 {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// All-zero value.
            pub const ZERO: Self = Self([0u8; 32]);

            /// Borrow the raw bytes.
            #[inline]
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Parse from a slice of exactly 32 bytes.
            #[must_use]
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; 32]>::try_from(bytes).ok().map(Self)
            }

            /// `0x`-prefixed lowercase hex.
            #[must_use]
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            /// Parse `0x`-prefixed (or bare) hex of exactly 32 bytes.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let mut out = [0u8; 32];
                hex::decode_to_slice(s.strip_prefix("0x").unwrap_or(s), &mut out)?;
                Ok(Self(out))
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(b: [u8; 32]) -> Self {
                Self(b)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                Self::from_hex(&s).map_err(de::Error::custom)
            }
        }
    };
}

bytes32! {
    /// A ledger account address (32 bytes).
    ///
    /// Ledgers with 20-byte accounts use the left-zero-padded form.
    Address
}

bytes32! {
    /// A keccak-256 output.
    Digest
}

impl Address {
    /// Address from a 20-byte account id, left-padded with zeros.
    #[must_use]
    pub fn from_short(short: [u8; 20]) -> Self {
        let mut out = [0u8; 32];
        out[12..].copy_from_slice(&short);
        Self(out)
    }

    /// Whether the top 12 bytes are zero (i.e., representable as a 20-byte account).
    #[must_use]
    pub fn is_short(&self) -> bool {
        self.0[..12].iter().all(|b| *b == 0)
    }
}

/* ------------------------------ kinds & values ----------------------------- */

/// Kind of a slot in a digest shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// The unit value.
    Unit,
    /// Unsigned 64-bit integer.
    UInt,
    /// Ledger address.
    Address,
    /// 32-byte digest.
    Digest,
    /// Fixed-arity tuple.
    Tuple(Vec<Kind>),
}

impl Kind {
    /// Scalar kinds fit in a single ledger argument / storage word.
    #[inline]
    #[must_use]
    pub const fn is_scalar(&self) -> bool {
        matches!(self, Self::UInt | Self::Address | Self::Digest)
    }

    /// Byte width of a scalar argument (`UInt` = 8, `Address`/`Digest` = 32).
    #[must_use]
    pub const fn arg_width(&self) -> Option<usize> {
        match self {
            Self::UInt => Some(8),
            Self::Address | Self::Digest => Some(32),
            Self::Unit | Self::Tuple(_) => None,
        }
    }

    /// Length of the canonical encoding of any value of this kind.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Unit => 1,
            Self::UInt => 9,
            Self::Address | Self::Digest => 33,
            Self::Tuple(ks) => 3 + ks.iter().map(Self::encoded_len).sum::<usize>(),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => f.write_str("unit"),
            Self::UInt => f.write_str("uint"),
            Self::Address => f.write_str("address"),
            Self::Digest => f.write_str("digest"),
            Self::Tuple(ks) => {
                f.write_str("(")?;
                for (i, k) in ks.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{k}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// A protocol value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "v")]
pub enum Value {
    /// The unit value.
    Unit,
    /// Unsigned 64-bit integer.
    UInt(u64),
    /// Ledger address.
    Address(Address),
    /// 32-byte digest.
    Digest(Digest),
    /// Fixed-arity tuple.
    Tuple(Vec<Value>),
}

impl Value {
    /// The kind this value inhabits.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Unit => Kind::Unit,
            Self::UInt(_) => Kind::UInt,
            Self::Address(_) => Kind::Address,
            Self::Digest(_) => Kind::Digest,
            Self::Tuple(vs) => Kind::Tuple(vs.iter().map(Self::kind).collect()),
        }
    }

    /// `Some(n)` for `UInt(n)`.
    #[inline]
    #[must_use]
    pub const fn as_uint(&self) -> Option<u64> {
        match self {
            Self::UInt(n) => Some(*n),
            _ => None,
        }
    }

    /// `Some(a)` for `Address(a)`.
    #[inline]
    #[must_use]
    pub const fn as_address(&self) -> Option<&Address> {
        match self {
            Self::Address(a) => Some(a),
            _ => None,
        }
    }

    /// `Some(d)` for `Digest(d)`.
    #[inline]
    #[must_use]
    pub const fn as_digest(&self) -> Option<&Digest> {
        match self {
            Self::Digest(d) => Some(d),
            _ => None,
        }
    }

    /// Truthiness of a `UInt` (non-zero). Other kinds are never truthy.
    #[inline]
    #[must_use]
    pub const fn is_truthy(&self) -> bool {
        matches!(self, Self::UInt(n) if *n != 0)
    }

    /// Raw argument bytes of a scalar: 8-byte BE for `UInt`, 32 bytes otherwise.
    #[must_use]
    pub fn to_arg_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::UInt(n) => Some(n.to_be_bytes().to_vec()),
            Self::Address(a) => Some(a.0.to_vec()),
            Self::Digest(d) => Some(d.0.to_vec()),
            Self::Unit | Self::Tuple(_) => None,
        }
    }

    /// Inverse of [`Value::to_arg_bytes`] for a scalar `kind`.
    #[must_use]
    pub fn from_arg_bytes(kind: &Kind, bytes: &[u8]) -> Option<Self> {
        match kind {
            Kind::UInt => <[u8; 8]>::try_from(bytes)
                .ok()
                .map(|b| Self::UInt(u64::from_be_bytes(b))),
            Kind::Address => Address::from_slice(bytes).map(Self::Address),
            Kind::Digest => Digest::from_slice(bytes).map(Self::Digest),
            Kind::Unit | Kind::Tuple(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => f.write_str("()"),
            Self::UInt(n) => write!(f, "{n}"),
            Self::Address(a) => write!(f, "{a}"),
            Self::Digest(d) => write!(f, "{d}"),
            Self::Tuple(vs) => {
                f.write_str("(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::UInt(n)
    }
}

impl From<Address> for Value {
    fn from(a: Address) -> Self {
        Self::Address(a)
    }
}

impl From<Digest> for Value {
    fn from(d: Digest) -> Self {
        Self::Digest(d)
    }
}

/* -------------------------------- encoding -------------------------------- */

/// `values` do not inhabit `shape`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeMismatch {
    /// Wrong number of slots at `path`.
    #[error("shape mismatch at {path}: expected {expected} slots, found {found}")]
    Arity {
        /// Slot path (`$` is the top level, `$.2.0` a nested slot).
        path: String,
        /// Slots in the shape.
        expected: usize,
        /// Slots in the value list.
        found: usize,
    },
    /// Wrong kind at `path`.
    #[error("shape mismatch at {path}: expected {expected}, found {found}")]
    Kind {
        /// Slot path.
        path: String,
        /// Kind in the shape.
        expected: Kind,
        /// Kind of the supplied value.
        found: Kind,
    },
    /// Tuple too wide for the u16 arity prefix.
    #[error("shape mismatch at {path}: tuple arity {arity} exceeds u16")]
    TooWide {
        /// Slot path.
        path: String,
        /// Offending arity.
        arity: usize,
    },
}

fn encode_slots(path: &str, shape: &[Kind], values: &[Value], out: &mut Vec<u8>) -> Result<(), ShapeMismatch> {
    if shape.len() != values.len() {
        return Err(ShapeMismatch::Arity {
            path: path.to_owned(),
            expected: shape.len(),
            found: values.len(),
        });
    }
    for (i, (k, v)) in shape.iter().zip(values).enumerate() {
        encode_one(&format!("{path}.{i}"), k, v, out)?;
    }
    Ok(())
}

fn encode_one(path: &str, kind: &Kind, value: &Value, out: &mut Vec<u8>) -> Result<(), ShapeMismatch> {
    match (kind, value) {
        (Kind::Unit, Value::Unit) => out.push(tag::UNIT),
        (Kind::UInt, Value::UInt(n)) => {
            out.push(tag::UINT);
            out.extend_from_slice(&n.to_be_bytes());
        }
        (Kind::Address, Value::Address(a)) => {
            out.push(tag::ADDRESS);
            out.extend_from_slice(&a.0);
        }
        (Kind::Digest, Value::Digest(d)) => {
            out.push(tag::DIGEST);
            out.extend_from_slice(&d.0);
        }
        (Kind::Tuple(ks), Value::Tuple(vs)) => {
            let arity = u16::try_from(ks.len()).map_err(|_| ShapeMismatch::TooWide {
                path: path.to_owned(),
                arity: ks.len(),
            })?;
            out.push(tag::TUPLE);
            out.extend_from_slice(&arity.to_be_bytes());
            encode_slots(path, ks, vs, out)?;
        }
        (k, v) => {
            return Err(ShapeMismatch::Kind {
                path: path.to_owned(),
                expected: k.clone(),
                found: v.kind(),
            })
        }
    }
    Ok(())
}

/// Canonical encoding of `values` under `shape`.
pub fn encode(shape: &[Kind], values: &[Value]) -> Result<Vec<u8>, ShapeMismatch> {
    let mut out = Vec::with_capacity(shape.iter().map(Kind::encoded_len).sum());
    encode_slots("$", shape, values, &mut out)?;
    Ok(out)
}

/// Raw keccak-256.
#[must_use]
pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut h = Keccak::v256();
    h.update(bytes);
    let mut out = [0u8; 32];
    h.finalize(&mut out);
    out
}

/// `keccak256(encode(shape, values))`.
pub fn digest(shape: &[Kind], values: &[Value]) -> Result<Digest, ShapeMismatch> {
    Ok(Digest(keccak256(&encode(shape, values)?)))
}

/// Digest of the empty tuple; persisted once a protocol halts.
#[must_use]
pub fn empty_digest() -> Digest {
    Digest(keccak256(&[]))
}

/// Digest of a values list whose shape is read off the values themselves.
///
/// Used by the commitment primitive, where operands are already type-checked;
/// only over-wide tuples can fail.
pub fn digest_values(values: &[Value]) -> Result<Digest, ShapeMismatch> {
    let shape: Vec<Kind> = values.iter().map(Value::kind).collect();
    digest(&shape, values)
}

/* ------------------------------ state digests ------------------------------ */

/// The pair of commitments computed for every state a step enters or leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateDigest {
    /// `digest([UInt label, vars…, UInt time])`.
    pub with_time: Digest,
    /// `digest([UInt label, vars…])`.
    pub no_time: Digest,
}

/// Digest a protocol state: `label`, its persistent variables, and entry time.
pub fn state_digest(
    label: u64,
    kinds: &[Kind],
    values: &[Value],
    time: u64,
) -> Result<StateDigest, ShapeMismatch> {
    let mut shape = Vec::with_capacity(kinds.len() + 2);
    shape.push(Kind::UInt);
    shape.extend_from_slice(kinds);

    let mut vals = Vec::with_capacity(values.len() + 2);
    vals.push(Value::UInt(label));
    vals.extend_from_slice(values);

    let no_time = digest(&shape, &vals)?;
    shape.push(Kind::UInt);
    vals.push(Value::UInt(time));
    let with_time = digest(&shape, &vals)?;
    Ok(StateDigest { with_time, no_time })
}

/// Blake3 content fingerprint (artifact identity, not a protocol commitment).
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> [u8; 32] {
    *blake3::hash(bytes).as_bytes()
}
