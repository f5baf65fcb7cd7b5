//! Well-known keys of the mapping form of the state.

/// The work item identifier.
pub const URL: &str = "url";
/// Alternate spelling of [`URL`] accepted on input; preferred when both are present.
pub const ISSUE_URL: &str = "issue_url";
/// Raw ticket text.
pub const TICKET_CONTENT: &str = "ticket_content";
/// Structured ticket details.
pub const REFINED_TICKET: &str = "refined_ticket";
/// Generated implementation.
pub const GENERATED_CODE: &str = "generated_code";
/// Generated tests.
pub const GENERATED_TESTS: &str = "generated_tests";
/// Primary method of the generated implementation.
pub const METHOD_NAME: &str = "method_name";
/// Command or hook identifier the tests must reference.
pub const COMMAND_ID: &str = "command_id";
/// Latest validation result.
pub const VALIDATION_RESULTS: &str = "validation_results";
/// Every validation result, oldest first.
pub const VALIDATION_HISTORY: &str = "validation_history";
/// Structured stage result.
pub const RESULT: &str = "result";
/// Free-form feedback.
pub const FEEDBACK: &str = "feedback";
/// Source files relevant to the ticket.
pub const RELEVANT_CODE_FILES: &str = "relevant_code_files";
/// Test files relevant to the ticket.
pub const RELEVANT_TEST_FILES: &str = "relevant_test_files";
/// Packages available to the implementation.
pub const AVAILABLE_DEPENDENCIES: &str = "available_dependencies";
/// Test failure messages.
pub const TEST_ERRORS: &str = "test_errors";
/// Append-only audit trail.
pub const AUDIT_TRAIL: &str = "audit_trail";

/// Category of the stage that failed.
pub const FAILED_STAGE: &str = "failed_stage";
/// Free-form context describing the failure.
pub const ERROR_CONTEXT: &str = "error_context";
/// `{type, message}` record of the triggering error.
pub const ORIGINAL_ERROR: &str = "original_error";

/// Set when a recovery strategy succeeded.
pub const RECOVERY_APPLIED: &str = "recovery_applied";
/// Set when every recovery strategy failed.
pub const RECOVERY_FAILED: &str = "recovery_failed";
/// `{strategy, attempts, success, error?}` of the last recovery.
pub const RECOVERY_DETAILS: &str = "recovery_details";
/// Set by state reconstruction.
pub const STATE_RECOVERED: &str = "state_recovered";
/// Kind name of the error that triggered state reconstruction.
pub const ORIGINAL_ERROR_TYPE: &str = "original_error_type";
/// When state reconstruction happened.
pub const RECOVERY_TIMESTAMP: &str = "recovery_timestamp";
/// Features disabled for the rest of the run.
pub const DEGRADED_FEATURES: &str = "degraded_features";
/// Features skipped for the rest of the run.
pub const SKIPPED_FEATURES: &str = "skipped_features";
/// Set when a placeholder artifact was injected.
pub const SUBSTITUTED: &str = "substituted";
/// Set when a fallback artifact was produced.
pub const FALLBACK_APPLIED: &str = "fallback_applied";

/// Keys owned by typed fields of the state, plus the [`ISSUE_URL`] alias.
///
/// Annotations never use these keys, otherwise the mapping form would carry
/// two values for one key.
pub const TYPED_FIELDS: &[&str] = &[
    URL,
    ISSUE_URL,
    TICKET_CONTENT,
    REFINED_TICKET,
    "code_spec",
    "test_spec",
    GENERATED_CODE,
    GENERATED_TESTS,
    METHOD_NAME,
    COMMAND_ID,
    VALIDATION_RESULTS,
    VALIDATION_HISTORY,
    RESULT,
    RELEVANT_CODE_FILES,
    RELEVANT_TEST_FILES,
    AVAILABLE_DEPENDENCIES,
    FEEDBACK,
    "existing_tests_passed",
    "existing_tests_failed",
    TEST_ERRORS,
    "test_log_path",
    "recovery_confidence",
    "recovery_explanation",
    AUDIT_TRAIL,
];

/// Whether `key` belongs to a typed field rather than an annotation.
pub fn is_typed_field(key: &str) -> bool {
    TYPED_FIELDS.contains(&key)
}
