//! Contract ABI of a lowered protocol.
//!
//! Step `i` is the payable function
//! `m<i>(((svs…, uint256 time), (msg…)))` and, once accepted, emits event
//! `e<i>` carrying the same tuple. Every component is static, so the
//! encoding is the selector followed by one 32-byte word per component.

use serde_json::{json, Value as Json};
use tandem_core::{Protocol, Step, StepId};
use tandem_digest::{encode, keccak256, Address, Digest, Kind, ShapeMismatch, Value};

/// Calldata or log data could not be encoded or decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    /// Values do not match the step's shape.
    #[error(transparent)]
    Shape(#[from] ShapeMismatch),
    /// The kind has no ABI word encoding.
    #[error("{0} has no ABI encoding")]
    Unsupported(Kind),
    /// Data length is not what the step's shape requires.
    #[error("expected {expected} bytes, found {found}")]
    Length {
        /// Required length.
        expected: usize,
        /// Supplied length.
        found: usize,
    },
    /// A word is out of range for its kind.
    #[error("word {index} out of range for {kind}")]
    Range {
        /// Word index.
        index: usize,
        /// Expected kind.
        kind: Kind,
    },
}

/// Solidity type of a scalar kind.
#[must_use]
pub const fn abi_type(k: &Kind) -> Option<&'static str> {
    match k {
        Kind::UInt => Some("uint256"),
        Kind::Address => Some("address"),
        Kind::Digest => Some("bytes32"),
        Kind::Unit | Kind::Tuple(_) => None,
    }
}

fn tuple_sig(kinds: &[Kind], with_time: bool) -> Result<String, AbiError> {
    let mut parts = kinds
        .iter()
        .map(|k| abi_type(k).map(str::to_owned).ok_or_else(|| AbiError::Unsupported(k.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    if with_time {
        parts.push("uint256".into());
    }
    Ok(format!("({})", parts.join(",")))
}

fn params(p: &Protocol, s: &Step) -> Result<String, AbiError> {
    Ok(format!(
        "(({},{}))",
        tuple_sig(&p.state_kinds(s.from), true)?,
        tuple_sig(&p.msg_kinds(s), false)?
    ))
}

/// Function name of step `id`.
#[must_use]
pub fn function_name(id: StepId) -> String {
    format!("m{id}")
}

/// Event name of step `id`.
#[must_use]
pub fn event_name(id: StepId) -> String {
    format!("e{id}")
}

/// Canonical function signature, e.g. `m2(((address,uint256,uint256),()))`.
pub fn function_signature(p: &Protocol, s: &Step) -> Result<String, AbiError> {
    Ok(format!("{}{}", function_name(s.id), params(p, s)?))
}

/// Canonical event signature.
pub fn event_signature(p: &Protocol, s: &Step) -> Result<String, AbiError> {
    Ok(format!("{}{}", event_name(s.id), params(p, s)?))
}

/// First four bytes of the signature hash.
#[must_use]
pub fn selector(signature: &str) -> [u8; 4] {
    let h = keccak256(signature.as_bytes());
    [h[0], h[1], h[2], h[3]]
}

/// Event topic of a signature.
#[must_use]
pub fn topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

/// ABI word of a scalar value.
pub fn word(v: &Value) -> Result<[u8; 32], AbiError> {
    match v {
        Value::UInt(n) => {
            let mut w = [0u8; 32];
            w[24..].copy_from_slice(&n.to_be_bytes());
            Ok(w)
        }
        Value::Address(a) => Ok(a.0),
        Value::Digest(d) => Ok(d.0),
        Value::Unit | Value::Tuple(_) => Err(AbiError::Unsupported(v.kind())),
    }
}

fn from_word(index: usize, kind: &Kind, w: &[u8]) -> Result<Value, AbiError> {
    let range = || AbiError::Range {
        index,
        kind: kind.clone(),
    };
    match kind {
        Kind::UInt => {
            if w[..24].iter().any(|b| *b != 0) {
                return Err(range());
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&w[24..32]);
            Ok(Value::UInt(u64::from_be_bytes(b)))
        }
        Kind::Address => {
            let a = Address::from_slice(w).ok_or_else(range)?;
            if a.is_short() {
                Ok(Value::Address(a))
            } else {
                Err(range())
            }
        }
        Kind::Digest => Digest::from_slice(w).map(Value::Digest).ok_or_else(range),
        Kind::Unit | Kind::Tuple(_) => Err(AbiError::Unsupported(kind.clone())),
    }
}

/// Calldata for step `s`.
pub fn encode_call(
    p: &Protocol,
    s: &Step,
    svs: &[Value],
    prev_time: u64,
    msg: &[Value],
) -> Result<Vec<u8>, AbiError> {
    encode(&p.state_kinds(s.from), svs)?;
    encode(&p.msg_kinds(s), msg)?;
    let sig = function_signature(p, s)?;
    let mut out = Vec::with_capacity(4 + 32 * (svs.len() + msg.len() + 1));
    out.extend_from_slice(&selector(&sig));
    for v in svs {
        out.extend_from_slice(&word(v)?);
    }
    out.extend_from_slice(&word(&Value::UInt(prev_time))?);
    for v in msg {
        out.extend_from_slice(&word(v)?);
    }
    Ok(out)
}

/// Number of data words step `s` carries.
#[must_use]
pub fn data_words(p: &Protocol, s: &Step) -> usize {
    p.state_kinds(s.from).len() + 1 + p.msg_kinds(s).len()
}

/// Event payload of step `s`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    /// State variables the step was checked against.
    pub svs: Vec<Value>,
    /// Entry time of the `from` state.
    pub prev_time: u64,
    /// Message values.
    pub msg: Vec<Value>,
}

/// Decode the data of event `e<s.id>`.
pub fn decode_event(p: &Protocol, s: &Step, data: &[u8]) -> Result<EventData, AbiError> {
    let svs_kinds = p.state_kinds(s.from);
    let msg_kinds = p.msg_kinds(s);
    let expected = 32 * data_words(p, s);
    if data.len() != expected {
        return Err(AbiError::Length {
            expected,
            found: data.len(),
        });
    }
    let mut words = data.chunks_exact(32).enumerate();
    let mut take = |kind: &Kind| {
        words
            .next()
            .map_or(Err(AbiError::Length { expected, found: data.len() }), |(i, w)| {
                from_word(i, kind, w)
            })
    };
    let svs = svs_kinds.iter().map(&mut take).collect::<Result<Vec<_>, _>>()?;
    let prev_time = take(&Kind::UInt)?.as_uint().unwrap_or_default();
    let msg = msg_kinds.iter().map(&mut take).collect::<Result<Vec<_>, _>>()?;
    Ok(EventData { svs, prev_time, msg })
}

fn components(p: &Protocol, vars: &[usize], kinds: &[Kind], with_time: bool) -> Json {
    let mut out: Vec<Json> = vars
        .iter()
        .zip(kinds)
        .map(|(v, k)| {
            json!({
                "name": p.vars.get(*v).map_or_else(String::new, |d| d.name.clone()),
                "type": abi_type(k).unwrap_or("bytes32"),
            })
        })
        .collect();
    if with_time {
        out.push(json!({ "name": "time", "type": "uint256" }));
    }
    Json::Array(out)
}

fn input(p: &Protocol, s: &Step) -> Json {
    let from = p.states.get(s.from).map_or(&[][..], |st| st.vars.as_slice());
    json!({
        "name": "_a",
        "type": "tuple",
        "components": [
            {
                "name": "svs",
                "type": "tuple",
                "components": components(p, from, &p.state_kinds(s.from), true),
            },
            {
                "name": "msg",
                "type": "tuple",
                "components": components(p, &s.msg, &p.msg_kinds(s), false),
            },
        ],
    })
}

/// Solidity-style ABI JSON for every step.
#[must_use]
pub fn abi_json(p: &Protocol) -> Json {
    let mut items = Vec::with_capacity(p.steps.len() * 2);
    for s in &p.steps {
        items.push(json!({
            "type": "function",
            "name": function_name(s.id),
            "stateMutability": "payable",
            "inputs": [input(p, s)],
            "outputs": [],
        }));
        let mut ev = input(p, s);
        ev["indexed"] = Json::Bool(false);
        items.push(json!({
            "type": "event",
            "name": event_name(s.id),
            "anonymous": false,
            "inputs": [ev],
        }));
    }
    Json::Array(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_left_padded() {
        let w = word(&Value::UInt(0x0102)).unwrap();
        assert_eq!(&w[30..], &[1, 2]);
        assert!(w[..30].iter().all(|b| *b == 0));
        assert!(matches!(word(&Value::Unit), Err(AbiError::Unsupported(Kind::Unit))));
    }

    #[test]
    fn known_selector() {
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn out_of_range_words_are_refused() {
        let mut w = [0u8; 32];
        w[0] = 1;
        assert!(matches!(from_word(0, &Kind::UInt, &w), Err(AbiError::Range { index: 0, .. })));
        assert!(matches!(from_word(3, &Kind::Address, &w), Err(AbiError::Range { index: 3, .. })));
        assert_eq!(from_word(0, &Kind::Digest, &w).unwrap(), Value::Digest(Digest(w)));
    }
}
