//! System prompt for repair episodes.
//!
//! The prompt steers the decision function; the controller only appends the
//! tool list so the prompt never drifts from the tools actually offered.

use crate::tools::ToolSpec;

/// Default instructions given to the decision function.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are resolving failing unit tests in an application with a database-backed persistence layer. You have access to a workspace through the tools listed below.

Follow these instructions:

1. Begin by reading the relevant files from the workspace.
2. Run the tests with the test tool to identify the failing tests.
3. Read the error output to identify the root cause of the failures.
4. Use the diff tool to compare your changes with the original files.
5. Update the relevant files and/or tests to fix the failing tests.
6. Run the tests again with the test tool to confirm they pass.
7. If the tests fail, return to step 3 and try again.

You must observe the following rules:

- Do not interact directly with the database; use the test tool only.
- Make the smallest change required to fix the failing tests.
- Write changes directly to the original files.
- Confirm the tests pass with the test tool, not by running the test command yourself.
- Draft a review comment with the comment tool explaining the fix.
- Finish only once the tests pass. Your answer is verified by running the tests again.";

/// Builds the full system prompt: the base instructions followed by the
/// tool list.
pub fn assemble(base: Option<&str>, tools: &[ToolSpec]) -> String {
    let mut prompt = base.unwrap_or(DEFAULT_SYSTEM_PROMPT).trim_end().to_string();
    if tools.is_empty() {
        return prompt;
    }

    prompt.push_str("\n\nAvailable tools:\n");
    for tool in tools {
        prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
    }

    tracing::debug!(tools = tools.len(), bytes = prompt.len(), "assembled system prompt");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolName;

    #[test]
    fn assemble_lists_every_tool() {
        let tools: Vec<_> = ToolName::ALL.iter().map(ToolName::spec).collect();
        let prompt = assemble(None, &tools);

        assert!(prompt.starts_with("You are resolving failing unit tests"));
        for tool in &tools {
            assert!(prompt.contains(&format!("- {}: ", tool.name)));
        }
    }

    #[test]
    fn assemble_uses_override() {
        let prompt = assemble(Some("Fix the build.\n\n"), &[]);
        assert_eq!(prompt, "Fix the build.");
    }
}
