//! [`AuthPatch`]: a partial [`crate::model::AuthSnapshot`] with
//! set-vs-delete-vs-unchanged semantics for the `keys` mapping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::model::snapshot::{KeyBundle, KeyId, KeyType, Value};

/// A partial update to an [`crate::model::AuthSnapshot`].
///
/// `creds` and `app_state`, when present, replace the corresponding field
/// wholesale. `keys` is merged incrementally: for each `(keyType, keyId)`
/// pair, `Some(bundle)` sets that key, `None` deletes it, and an absent
/// pair leaves the existing key untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthPatch {
    /// Replacement credentials record, if present in this patch.
    #[serde(default)]
    pub creds: Option<Value>,
    /// Per-key-type, per-key-id set/delete instructions.
    #[serde(default)]
    pub keys: BTreeMap<KeyType, BTreeMap<KeyId, Option<KeyBundle>>>,
    /// Replacement app-state blob. `Some(None)` clears it; `None` leaves
    /// it untouched.
    #[serde(default)]
    pub app_state: Option<Option<Value>>,
}

impl AuthPatch {
    /// A patch that touches nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Revive byte-like encodings across every field this patch touches,
    /// validating the §3 invariant that byte-sequence fields are raw
    /// buffers at the interface boundary.
    pub fn validated(mut self) -> StoreResult<Self> {
        if let Some(creds) = self.creds.take() {
            self.creds = Some(creds.revive_byte_like()?);
        }
        if let Some(Some(app_state)) = self.app_state.take() {
            self.app_state = Some(Some(app_state.revive_byte_like()?));
        }
        let mut revived_keys = BTreeMap::new();
        for (key_type, inner) in self.keys {
            let mut revived_inner = BTreeMap::new();
            for (key_id, bundle) in inner {
                let bundle = bundle.map(Value::revive_byte_like).transpose()?;
                revived_inner.insert(key_id, bundle);
            }
            revived_keys.insert(key_type, revived_inner);
        }
        self.keys = revived_keys;
        Ok(self)
    }
}

/// Validate and revive every buffer-shaped field in `patch`, returning the
/// normalized patch or a [`crate::error::StoreError::Validation`].
pub fn validate_patch_buffers(patch: AuthPatch) -> StoreResult<AuthPatch> {
    patch.validated()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revives_byte_like_object_in_creds() {
        let mut obj = BTreeMap::new();
        obj.insert(
            "data".to_string(),
            Value::Array(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(255.0)]),
        );
        let patch = AuthPatch {
            creds: Some(Value::Object(obj)),
            ..AuthPatch::empty()
        };
        let validated = validate_patch_buffers(patch).unwrap();
        assert_eq!(validated.creds, Some(Value::Bytes(vec![1, 2, 255])));
    }

    #[test]
    fn rejects_out_of_range_byte_like_object() {
        let mut obj = BTreeMap::new();
        obj.insert("data".to_string(), Value::Array(vec![Value::Number(300.0)]));
        let patch = AuthPatch {
            creds: Some(Value::Object(obj)),
            ..AuthPatch::empty()
        };
        assert!(validate_patch_buffers(patch).is_err());
    }

    #[test]
    fn leaves_plain_values_untouched() {
        let patch = AuthPatch {
            creds: Some(Value::String("hello".into())),
            ..AuthPatch::empty()
        };
        let validated = validate_patch_buffers(patch).unwrap();
        assert_eq!(validated.creds, Some(Value::String("hello".into())));
    }
}
