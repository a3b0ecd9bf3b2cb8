//! [`AuthSnapshot`] and the structured value type used inside `creds` and
//! `keys`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A structured, opaque value as carried inside `creds`/`keys`/`appState`.
///
/// Byte-sequence fields MUST arrive as [`Value::Bytes`] at the interface
/// boundary; [`revive_byte_like`] upgrades the common JSON
/// byte-array-object encoding (`{"data": [...]}`) into a proper
/// [`Value::Bytes`] so callers that serialized through a JSON-only pipeline
/// upstream are not rejected outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absence of a value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Numeric value (integers are represented exactly up to 2^53).
    Number(f64),
    /// UTF-8 text.
    String(String),
    /// Raw byte buffer.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// String-keyed map of values.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Walk the value tree, converting `{"data": [u8, ...]}` objects into
    /// [`Value::Bytes`]. Returns an error if such an object's `data` array
    /// contains an element outside `0..=255`, since that can't be a
    /// byte-like encoding and silently truncating it would corrupt the
    /// field.
    pub fn revive_byte_like(self) -> Result<Value, StoreError> {
        match self {
            Value::Array(items) => {
                let revived = items
                    .into_iter()
                    .map(Value::revive_byte_like)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(revived))
            }
            Value::Object(fields) => {
                if fields.len() == 1 {
                    if let Some(Value::Array(items)) = fields.get("data") {
                        let mut bytes = Vec::with_capacity(items.len());
                        let mut all_bytes = true;
                        for item in items {
                            match item {
                                Value::Number(n)
                                    if *n >= 0.0 && *n <= 255.0 && n.fract() == 0.0 =>
                                {
                                    bytes.push(*n as u8);
                                }
                                _ => {
                                    all_bytes = false;
                                    break;
                                }
                            }
                        }
                        if all_bytes {
                            return Ok(Value::Bytes(bytes));
                        }
                        return Err(StoreError::Validation(
                            "byte-like object encoding contains a non-byte element".into(),
                        ));
                    }
                }
                let revived = fields
                    .into_iter()
                    .map(|(k, v)| Ok((k, v.revive_byte_like()?)))
                    .collect::<Result<BTreeMap<_, _>, StoreError>>()?;
                Ok(Value::Object(revived))
            }
            other => Ok(other),
        }
    }
}

/// Key-type discriminant, e.g. `"identity"`, `"prekey"`, `"signed_prekey"`.
pub type KeyType = String;

/// Identifier of a single key within a key type's bundle map.
pub type KeyId = String;

/// Opaque structured payload for one key (may itself carry raw byte
/// fields, e.g. public key material).
pub type KeyBundle = Value;

/// Complete authentication state for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSnapshot {
    /// Opaque, structured credentials record.
    pub creds: Value,
    /// Sparse `keyType -> keyId -> keyBundle` mapping.
    #[serde(default)]
    pub keys: BTreeMap<KeyType, BTreeMap<KeyId, KeyBundle>>,
    /// Optional opaque application state blob.
    #[serde(default)]
    pub app_state: Option<Value>,
}

impl AuthSnapshot {
    /// An empty snapshot: null creds, no keys, no app state.
    pub fn empty() -> Self {
        Self {
            creds: Value::Null,
            keys: BTreeMap::new(),
            app_state: None,
        }
    }

    /// Merge `patch`'s keys incrementally into this snapshot, per the
    /// per-key merge rule: a present value inserts/overwrites that key; a
    /// `None` inner value deletes it. `creds` and `appState` are wholesale
    /// replacements when present in the patch.
    pub fn apply_patch(&mut self, patch: crate::model::AuthPatch) {
        if let Some(creds) = patch.creds {
            self.creds = creds;
        }
        if let Some(app_state) = patch.app_state {
            self.app_state = app_state;
        }
        for (key_type, inner) in patch.keys {
            let bucket = self.keys.entry(key_type.clone()).or_default();
            for (key_id, value) in inner {
                match value {
                    Some(bundle) => {
                        bucket.insert(key_id, bundle);
                    }
                    None => {
                        bucket.remove(&key_id);
                    }
                }
            }
            if self.keys.get(&key_type).is_some_and(|b| b.is_empty()) {
                self.keys.remove(&key_type);
            }
        }
    }
}
