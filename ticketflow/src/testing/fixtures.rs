//! Sample inputs and states.

use serde_json::Value;

use crate::state::{CodeGenerationState, StateMap, TicketDetails};

/// A well-formed issue URL.
#[must_use]
pub fn sample_issue_url() -> &'static str {
    "https://github.com/acme/widgets/issues/42"
}

/// A state for [`sample_issue_url`] with ticket content and details.
#[must_use]
pub fn sample_state() -> CodeGenerationState {
    CodeGenerationState::new(sample_issue_url())
        .with_ticket_content("Add a stamp command that inserts the current date.")
        .with_ticket_details(
            TicketDetails::new("Stamp command", "Insert the current date at the cursor.")
                .with_requirements(vec!["Register a stamp command".to_string()])
                .with_acceptance_criteria(vec!["The date is inserted".to_string()]),
        )
}

/// A workflow input naming [`sample_issue_url`].
#[must_use]
pub fn sample_input() -> StateMap {
    input_for(sample_issue_url())
}

/// A workflow input naming `url`.
#[must_use]
pub fn input_for(url: &str) -> StateMap {
    let mut input = StateMap::new();
    input.insert("url".to_string(), Value::from(url));
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_IDENTIFIER_PATTERN;
    use crate::workflow::InputContract;

    #[test]
    fn test_sample_input_satisfies_default_contract() {
        let contract = InputContract::new(DEFAULT_IDENTIFIER_PATTERN).unwrap();
        assert!(contract.validate(&sample_input()).is_ok());
        assert_eq!(sample_state().issue_url(), sample_issue_url());
    }
}
