//! Status patching: JSON merge patches (RFC 7386) of the status
//! sub-resource, sent only when something changed.

use serde_json::{Map, Value, json};
use tracing::{debug, trace};

use crate::error::Result;
use crate::model::{Resource, ResourceSpec};
use crate::store::Store;

/// Merge patch turning `original` into `modified`, or `None` when equal.
/// Arrays are replaced as a whole.
pub fn merge_patch_diff(original: &Value, modified: &Value) -> Option<Value> {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => {
            let mut patch = Map::new();
            for key in orig.keys() {
                if !modi.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, new) in modi {
                match orig.get(key) {
                    Some(old) => {
                        if let Some(diff) = merge_patch_diff(old, new) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), new.clone());
                    }
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        _ if original == modified => None,
        // A null written through a merge patch means "delete"; an explicit
        // null value can't be expressed, which is fine for status fields.
        _ => Some(modified.clone()),
    }
}

/// Apply a merge patch in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(
                    map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

/// Merge patch covering only `status`, shaped `{"status": {...}}`.
pub fn status_patch<S: ResourceSpec>(
    original: &Resource<S>,
    modified: &Resource<S>,
) -> Result<Option<Value>> {
    let before = serde_json::to_value(&original.status)?;
    let after = serde_json::to_value(&modified.status)?;
    Ok(merge_patch_diff(&before, &after).map(|diff| json!({ "status": diff })))
}

#[derive(Debug)]
pub enum PatchOutcome<S> {
    /// Status did not change; nothing was sent.
    Unchanged,
    Patched(Resource<S>),
    /// The resource disappeared in the meantime.
    Gone,
}

/// Persist the status changes made during an invocation.
///
/// `original` is the snapshot read at the start of the invocation. A
/// conflict is returned to the caller untouched: the invocation has to be
/// retried from a fresh read.
pub async fn patch_status<S: ResourceSpec>(
    store: &dyn Store<S>,
    original: &Resource<S>,
    modified: &Resource<S>,
) -> Result<PatchOutcome<S>> {
    if original.status == modified.status {
        trace!(key = %original.key(), "status unchanged; skip patch");
        return Ok(PatchOutcome::Unchanged);
    }
    match store.patch_status(original, modified).await {
        Ok(stored) => {
            debug!(
                key = %original.key(),
                status = ?stored.status.status,
                "status patched"
            );
            Ok(PatchOutcome::Patched(stored))
        }
        Err(e) if e.is_not_found() => {
            debug!(key = %original.key(), "resource gone before status patch");
            Ok(PatchOutcome::Gone)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::Widget;
    use crate::status::Status;

    #[test]
    fn diff_of_equal_values_is_none() {
        let v = json!({"a": 1, "b": {"c": [1, 2]}});
        assert_eq!(merge_patch_diff(&v, &v), None);
    }

    #[test]
    fn diff_only_carries_changes() {
        let before = json!({"a": 1, "b": {"c": 1, "d": 2}, "gone": true});
        let after = json!({"a": 1, "b": {"c": 5, "d": 2}, "new": "x"});
        let patch = merge_patch_diff(&before, &after).unwrap();
        assert_eq!(patch, json!({"b": {"c": 5}, "gone": null, "new": "x"}));

        let mut target = before.clone();
        apply_merge_patch(&mut target, &patch);
        assert_eq!(target, after);
    }

    #[test]
    fn arrays_are_replaced() {
        let before = json!({"list": [1, 2, 3]});
        let after = json!({"list": [1, 3]});
        let patch = merge_patch_diff(&before, &after).unwrap();
        assert_eq!(patch, json!({"list": [1, 3]}));
    }

    #[test]
    fn status_patch_ignores_spec() {
        let original = Resource::new("ns", "w", Widget { size: 1 });
        let mut modified = original.clone();
        modified.spec.size = 2;
        assert_eq!(status_patch(&original, &modified).unwrap(), None);

        modified.status.status = Status::Success;
        let patch = status_patch(&original, &modified).unwrap().unwrap();
        assert_eq!(patch, json!({"status": {"status": "Success"}}));
    }
}
