//! Recursive type coercion for semi-typed feed payloads.
//!
//! The feed delivers numeric and boolean fields inconsistently typed across
//! revisions (sometimes strings, sometimes numbers). Downstream search
//! indices need stable types, so a fixed set of dot-separated field paths is
//! coerced after decode. The paths live in three prefix tries (int, float,
//! bool), built once on first use and immutable after.
//!
//! Coercion never fails a record: unparseable values default to `0`/`false`.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Paths coerced to integers.
const WANT_INT: &[&str] = &[
    "abi_sequence",
    "account_ram_deltas.delta",
    "act.data.amount",
    "act.data.max_fee",
    "act.data.suf_amount",
    "action_ordinal",
    "auth_sequence.sequence",
    "code_sequence",
    "creator_action_ordinal",
    "data.amount",
    "data.max_fee",
    "data.quantity",
    "data.suf_amount",
    "elapsed",
    "global_sequence",
    "receipt.abi_sequence",
    "receipt.auth_sequence.sequence",
    "receipt.code_sequence",
    "receipt.global_sequence",
    "receipt.recv_sequence",
    "receipt.act.data.amount",
    "receipt.act.data.max_fee",
    "receipt.act.data.suf_amount",
    "recv_sequence",
];

/// Paths coerced to floats.
const WANT_FLOAT: &[&str] = &["receipt.act.data.quantity", "act.data.quantity"];

/// Paths coerced to booleans.
const WANT_BOOL: &[&str] = &["data.added", "data.account_metadata.is_privileged"];

#[derive(Default)]
struct Node {
    children: HashMap<&'static str, Node>,
}

/// A prefix trie over dot-separated field paths.
struct PathTrie {
    root: Node,
}

impl PathTrie {
    fn build(paths: &[&'static str]) -> Self {
        let mut root = Node::default();
        for path in paths {
            let mut node = &mut root;
            for seg in path.split('.') {
                node = node.children.entry(seg).or_default();
            }
        }
        Self { root }
    }

    /// True when every segment of `path` is on a registered branch.
    fn contains(&self, path: &[String]) -> bool {
        let mut node = &self.root;
        for seg in path {
            match node.children.get(seg.as_str()) {
                Some(next) => node = next,
                None => return false,
            }
        }
        !path.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Coercion {
    Int,
    Float,
    Bool,
}

impl Coercion {
    fn trie(self) -> &'static PathTrie {
        static INT: OnceLock<PathTrie> = OnceLock::new();
        static FLOAT: OnceLock<PathTrie> = OnceLock::new();
        static BOOL: OnceLock<PathTrie> = OnceLock::new();
        match self {
            Self::Int => INT.get_or_init(|| PathTrie::build(WANT_INT)),
            Self::Float => FLOAT.get_or_init(|| PathTrie::build(WANT_FLOAT)),
            Self::Bool => BOOL.get_or_init(|| PathTrie::build(WANT_BOOL)),
        }
    }
}

/// Walk a JSON object and coerce every registered field path in place.
pub fn fixup(target: &mut Map<String, Value>) {
    for kind in [Coercion::Int, Coercion::Bool, Coercion::Float] {
        seek(target, &mut Vec::new(), kind);
    }
}

fn seek(target: &mut Map<String, Value>, path: &mut Vec<String>, kind: Coercion) {
    for (key, value) in target.iter_mut() {
        path.push(key.clone());
        visit(value, path, kind);
        path.pop();
    }
}

fn visit(value: &mut Value, path: &mut Vec<String>, kind: Coercion) {
    let replacement = match &mut *value {
        Value::Null => None,
        Value::Object(map) => {
            seek(map, path, kind);
            None
        }
        Value::Array(rows) => {
            let byte_array = kind == Coercion::Int
                && !rows.is_empty()
                && rows.iter().all(|v| v.as_u64().is_some_and(|n| n <= 0xff));
            if byte_array && kind.trie().contains(path) {
                Some(to_int(&Value::Array(std::mem::take(rows))))
            } else {
                // arrays are transparent: each object element continues the
                // same path
                for row in rows.iter_mut() {
                    if let Value::Object(map) = row {
                        seek(map, path, kind);
                    }
                }
                None
            }
        }
        leaf => {
            if kind.trie().contains(path) {
                Some(coerce(kind, &*leaf))
            } else {
                None
            }
        }
    };
    if let Some(coerced) = replacement {
        *value = coerced;
    }
}

fn coerce(kind: Coercion, value: &Value) -> Value {
    match kind {
        Coercion::Int => to_int(value),
        Coercion::Float => to_float(value),
        Coercion::Bool => to_bool(value),
    }
}

fn to_int(value: &Value) -> Value {
    match value {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                value.clone()
            } else {
                Value::from(n.as_f64().map(|f| f.round() as i64).unwrap_or(0))
            }
        }
        Value::String(s) => {
            let digits = if s.bytes().all(|b| b.is_ascii_digit()) && !s.is_empty() {
                s.as_str()
            } else {
                first_digit_run(s)
            };
            Value::from(digits.parse::<i64>().unwrap_or(0))
        }
        // little-endian byte array
        Value::Array(bytes) => {
            let mut out: u64 = 0;
            for (i, b) in bytes.iter().take(8).enumerate() {
                out |= b.as_u64().unwrap_or(0) << (8 * i);
            }
            Value::from(out)
        }
        _ => Value::from(0),
    }
}

/// First run of consecutive ASCII digits, or empty.
fn first_digit_run(s: &str) -> &str {
    let start = match s.find(|c: char| c.is_ascii_digit()) {
        Some(i) => i,
        None => return "",
    };
    let rest = &s[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    &rest[..end]
}

fn to_float(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::from(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => {
            // asset form: "123.456789 FIO" parses up to the separator
            let amount = match s.split_once(' ') {
                Some((amount, sym))
                    if !sym.is_empty() && sym.bytes().all(|b| b.is_ascii_uppercase()) =>
                {
                    amount
                }
                _ => s.as_str(),
            };
            Value::from(amount.parse::<f64>().unwrap_or(0.0))
        }
        _ => Value::from(0.0),
    }
}

fn to_bool(value: &Value) -> Value {
    match value {
        Value::Bool(_) => value.clone(),
        Value::String(s) => Value::from(matches!(
            s.as_str(),
            "1" | "t" | "T" | "true" | "TRUE" | "True"
        )),
        _ => Value::from(false),
    }
}
