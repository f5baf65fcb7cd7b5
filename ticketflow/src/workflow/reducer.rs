//! Deterministic merge of parallel branch results.
//!
//! Each branch result is compared with the fork state in mapping form:
//!
//! - A key a branch added or changed is written to the merged state. When
//!   several branches change the same key, the later-declared branch wins.
//! - A key a branch removed is removed, unless a later branch changed it.
//! - Keys no branch touched keep their fork value.
//! - `validation_history` and `audit_trail` are append-only: every branch's
//!   new entries are appended in declared branch order, and audit entries
//!   are renumbered.

use serde_json::Value;

use crate::errors::FlowResult;
use crate::state::{keys, CodeGenerationState, StateMap};

const APPEND_ONLY: &[&str] = &[keys::VALIDATION_HISTORY, keys::AUDIT_TRAIL];

fn entries(map: &StateMap, key: &str) -> Vec<Value> {
    map.get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Merges `branches` (in declared order) onto `fork`.
pub fn merge_branches(
    fork: &CodeGenerationState,
    branches: &[CodeGenerationState],
) -> FlowResult<CodeGenerationState> {
    let base = fork.to_mapping()?;
    let mut merged = base.clone();
    let mut appended: Vec<(&str, Vec<Value>)> =
        APPEND_ONLY.iter().map(|key| (*key, entries(&base, key))).collect();

    for branch in branches {
        let map = branch.to_mapping()?;

        for (key, value) in &map {
            if APPEND_ONLY.contains(&key.as_str()) {
                continue;
            }
            if base.get(key) != Some(value) {
                merged.insert(key.clone(), value.clone());
            }
        }
        for key in base.keys() {
            if !map.contains_key(key) && !APPEND_ONLY.contains(&key.as_str()) {
                merged.remove(key);
            }
        }

        for (key, list) in &mut appended {
            let fork_len = base.get(*key).and_then(Value::as_array).map_or(0, Vec::len);
            list.extend(entries(&map, *key).into_iter().skip(fork_len));
        }
    }

    for (key, mut list) in appended {
        if key == keys::AUDIT_TRAIL {
            for (sequence, entry) in list.iter_mut().enumerate() {
                if let Value::Object(fields) = entry {
                    fields.insert("sequence".to_string(), Value::from(sequence));
                }
            }
        }
        merged.insert(key.to_string(), Value::Array(list));
    }

    CodeGenerationState::from_mapping(&merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ValidationResult;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fork() -> CodeGenerationState {
        CodeGenerationState::new("https://github.com/acme/widgets/issues/9")
            .with_ticket_content("Widgets")
            .with_code("export const v = 1;", None, None)
    }

    #[test]
    fn test_disjoint_changes_union() {
        let base = fork();
        let a = base.with_annotation("branch_a", json!(true));
        let b = base.with_dependencies(vec!["papaparse".into()]);

        let merged = merge_branches(&base, &[a, b]).unwrap();
        assert!(merged.is_flagged("branch_a"));
        assert_eq!(merged.available_dependencies(), ["papaparse".to_string()]);
        assert_eq!(merged.ticket_content(), "Widgets");
    }

    #[test]
    fn test_later_branch_wins_on_collision() {
        let base = fork();
        let a = base.with_annotation("marker", json!("a"));
        let b = base.with_annotation("marker", json!("b"));

        assert_eq!(
            merge_branches(&base, &[a.clone(), b.clone()]).unwrap().annotation("marker"),
            Some(&json!("b"))
        );
        assert_eq!(
            merge_branches(&base, &[b, a]).unwrap().annotation("marker"),
            Some(&json!("a"))
        );
    }

    #[test]
    fn test_unchanged_branch_does_not_undo_changes() {
        let base = fork();
        let changed = base.with_ticket_content("Rewritten");
        let merged = merge_branches(&base, &[changed, base.clone()]).unwrap();
        assert_eq!(merged.ticket_content(), "Rewritten");
    }

    #[test]
    fn test_removal_propagates() {
        let base = fork();
        let cleared = base.cleared(&[keys::GENERATED_CODE]);
        let merged = merge_branches(&base, &[base.with_annotation("x", json!(1)), cleared]).unwrap();
        assert_eq!(merged.generated_code(), None);
        assert_eq!(merged.annotation("x"), Some(&json!(1)));
    }

    #[test]
    fn test_append_only_lists_are_concatenated() {
        let base = fork().with_validation(ValidationResult::passed(90));
        let a = base.with_validation(ValidationResult::failed(40, vec!["a".into()]));
        let b = base.with_validation(ValidationResult::passed(80));

        let merged = merge_branches(&base, &[a, b]).unwrap();
        let scores: Vec<u8> = merged.validation_history().iter().map(|v| v.score).collect();
        assert_eq!(scores, vec![90, 40, 80]);

        let trail = merged.get_audit_trail();
        let sequences: Vec<usize> = trail.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..trail.len()).collect::<Vec<_>>());
        assert_eq!(trail.len(), base.get_audit_trail().len() + 2);
    }
}
