//! Edge codec
//!
//! Edges are stored as secondary-index terms on the receiver's record, once
//! under [`RECV_INDEX`] (receiver first) and once under [`EMIT_INDEX`]
//! (emitter first). Range scans over these composite terms answer "what
//! feeds this input" and "who consumes this output".
//!
//! ```text
//! receiver|input|emitter|emitterInput|myKind>otherKind
//! receiver|input|emitter|emitterInput|tag|subkey|myKind>otherKind
//! ```
//!
//! The emit form swaps the first two pairs.

use crate::error::{Error, Result};
use crate::inputs::InputKind;
use crate::types::Connection;
use std::fmt;

/// Index holding receiver-first terms
pub const RECV_INDEX: &str = "inputs_recv";
/// Index holding emitter-first terms
pub const EMIT_INDEX: &str = "inputs_emit";

const SEP: char = '|';

/// Tag and destination sub-key of a mapping edge
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeSlot {
    pub tag: String,
    pub subkey: String,
}

/// Kinds of the receiving and emitting inputs at wiring time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KindPair {
    pub my: InputKind,
    pub other: InputKind,
}

impl KindPair {
    pub fn new(my: InputKind, other: InputKind) -> Self {
        Self { my, other }
    }

    /// Marker for a 1:1 edge copying the emitter value as is
    pub fn passthrough() -> Self {
        Self::new(InputKind::Scalar, InputKind::Scalar)
    }

    fn parse(raw: &str) -> Option<Self> {
        let (my, other) = raw.split_once('>')?;
        Some(Self::new(my.parse().ok()?, other.parse().ok()?))
    }
}

impl fmt::Display for KindPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{}", self.my, self.other)
    }
}

/// One decoded edge
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey {
    pub receiver: String,
    pub input: String,
    pub emitter: String,
    pub emitter_input: String,
    pub slot: Option<EdgeSlot>,
    pub kinds: KindPair,
}

impl EdgeKey {
    pub fn encode_recv(&self) -> String {
        self.encode(&self.receiver, &self.input, &self.emitter, &self.emitter_input)
    }

    pub fn encode_emit(&self) -> String {
        self.encode(&self.emitter, &self.emitter_input, &self.receiver, &self.input)
    }

    fn encode(&self, a: &str, a_input: &str, b: &str, b_input: &str) -> String {
        match &self.slot {
            Some(slot) => format!(
                "{a}{SEP}{a_input}{SEP}{b}{SEP}{b_input}{SEP}{}{SEP}{}{SEP}{}",
                slot.tag, slot.subkey, self.kinds
            ),
            None => format!("{a}{SEP}{a_input}{SEP}{b}{SEP}{b_input}{SEP}{}", self.kinds),
        }
    }

    pub fn decode_recv(term: &str) -> Result<Self> {
        let ([receiver, input, emitter, emitter_input], slot, kinds) = split(term)?;
        Ok(Self {
            receiver,
            input,
            emitter,
            emitter_input,
            slot,
            kinds,
        })
    }

    pub fn decode_emit(term: &str) -> Result<Self> {
        let ([emitter, emitter_input, receiver, input], slot, kinds) = split(term)?;
        Ok(Self {
            receiver,
            input,
            emitter,
            emitter_input,
            slot,
            kinds,
        })
    }

    /// Whether the edge copies the emitter value without aggregation
    pub fn is_passthrough(&self) -> bool {
        self.slot.is_none() && self.kinds == KindPair::passthrough()
    }

    /// Receiver input in slot syntax (`input:subkey|tag` for tagged edges)
    pub fn receiver_slot(&self) -> String {
        match &self.slot {
            Some(slot) => format!("{}:{}|{}", self.input, slot.subkey, slot.tag),
            None => self.input.clone(),
        }
    }

    pub fn connection(&self) -> Connection {
        Connection {
            emitter: self.emitter.clone(),
            emitter_input: self.emitter_input.clone(),
            receiver: self.receiver.clone(),
            receiver_input: self.receiver_slot(),
        }
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.connection())
    }
}

type Fields = [String; 4];

fn split(term: &str) -> Result<(Fields, Option<EdgeSlot>, KindPair)> {
    let corrupt = || Error::CorruptIndex {
        term: term.to_string(),
    };
    let parts: Vec<&str> = term.split(SEP).collect();
    let (names, slot, kinds) = match parts.as_slice() {
        [a, b, c, d, kinds] => ([*a, *b, *c, *d], None, *kinds),
        [a, b, c, d, tag, subkey, kinds] => (
            [*a, *b, *c, *d],
            Some(EdgeSlot {
                tag: (*tag).to_string(),
                subkey: (*subkey).to_string(),
            }),
            *kinds,
        ),
        _ => return Err(corrupt()),
    };
    let empty_slot = slot
        .as_ref()
        .is_some_and(|s| s.tag.is_empty() || s.subkey.is_empty());
    if empty_slot || names.iter().any(|n| n.is_empty()) {
        return Err(corrupt());
    }
    let kinds = KindPair::parse(kinds).ok_or_else(corrupt)?;
    Ok((names.map(str::to_string), slot, kinds))
}

/// Prefix of every receive term for one input of a receiver
pub fn recv_prefix(receiver: &str, input: &str) -> String {
    format!("{receiver}{SEP}{input}{SEP}")
}

/// Prefix of every emit term for an emitter, optionally narrowed to one input
pub fn emit_prefix(emitter: &str, input: Option<&str>) -> String {
    match input {
        Some(input) => format!("{emitter}{SEP}{input}{SEP}"),
        None => format!("{emitter}{SEP}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(slot: Option<(&str, &str)>) -> EdgeKey {
        EdgeKey {
            receiver: "svc".into(),
            input: "config".into(),
            emitter: "node1".into(),
            emitter_input: "ip".into(),
            slot: slot.map(|(tag, subkey)| EdgeSlot {
                tag: tag.into(),
                subkey: subkey.into(),
            }),
            kinds: KindPair::new(InputKind::Mapping, InputKind::Scalar),
        }
    }

    #[test]
    fn test_wire_forms() {
        let plain = edge(None);
        assert_eq!(plain.encode_recv(), "svc|config|node1|ip|mapping>scalar");
        assert_eq!(plain.encode_emit(), "node1|ip|svc|config|mapping>scalar");

        let tagged = edge(Some(("single", "host")));
        assert_eq!(
            tagged.encode_recv(),
            "svc|config|node1|ip|single|host|mapping>scalar"
        );
    }

    #[test]
    fn test_decode_inverts_encode() {
        for key in [edge(None), edge(Some(("tagX", "key1")))] {
            assert_eq!(EdgeKey::decode_recv(&key.encode_recv()).unwrap(), key);
            assert_eq!(EdgeKey::decode_emit(&key.encode_emit()).unwrap(), key);
        }
    }

    #[test]
    fn test_corrupt_terms() {
        for term in [
            "svc|config",
            "svc|config|node1|ip|scalar",
            "svc|config|node1|ip|int>scalar",
            "svc||node1|ip|scalar>scalar",
            "svc|config|node1|ip|t|scalar>scalar",
        ] {
            assert!(
                matches!(EdgeKey::decode_recv(term), Err(Error::CorruptIndex { .. })),
                "{term}"
            );
        }
    }

    #[test]
    fn test_prefixes_do_not_overlap() {
        let key = edge(None);
        assert!(key.encode_recv().starts_with(&recv_prefix("svc", "config")));
        assert!(!key.encode_recv().starts_with(&recv_prefix("svc", "conf")));
        assert!(key.encode_emit().starts_with(&emit_prefix("node1", Some("ip"))));
        assert!(!key.encode_emit().starts_with(&emit_prefix("node", None)));
    }

    #[test]
    fn test_receiver_slot() {
        assert_eq!(edge(Some(("tagX", "key1"))).receiver_slot(), "config:key1|tagX");
        assert!(edge(None).connection().receiver_input == "config");
        assert!(!edge(None).is_passthrough());
    }
}
