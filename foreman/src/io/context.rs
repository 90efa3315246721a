//! Pass-context rendering for the generation collaborator.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

const PASS_TEMPLATE: &str = include_str!("prompts/pass.md");

/// Everything the next generation round should know.
#[derive(Debug, Clone, Default)]
pub struct ContextInputs {
    pub story_title: String,
    pub story_body: String,
    pub labels: Vec<String>,
    pub memory: String,
    /// Failure summary from the previous pass, if any.
    pub failure: Option<String>,
    /// The most recently answered question and its answer, if any.
    pub question: Option<String>,
    pub answer: Option<String>,
    pub pass_number: u32,
    pub max_passes: u32,
}

/// Render the pass context, keeping large sections within `budget_bytes`.
///
/// Memory and failure output get a quarter of the budget each; both keep
/// their tail, which is where the most recent information lives.
pub fn render_pass_context(inputs: &ContextInputs, budget_bytes: usize) -> Result<String> {
    let section_budget = budget_bytes / 4;
    let memory = truncate_tail(&inputs.memory, section_budget);
    let failure = inputs
        .failure
        .as_deref()
        .map(|f| truncate_tail(f, section_budget));

    let mut env = Environment::new();
    env.add_template("pass", PASS_TEMPLATE)
        .context("pass template should be valid")?;
    let template = env.get_template("pass")?;
    let rendered = template.render(context! {
        memory => (!memory.trim().is_empty()).then_some(memory.trim()),
        story_title => inputs.story_title,
        story_body => inputs.story_body.trim(),
        labels => (!inputs.labels.is_empty()).then_some(&inputs.labels),
        failure => failure.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        question => inputs.question.as_deref().map(str::trim),
        answer => inputs.answer.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        pass_number => inputs.pass_number,
        max_passes => inputs.max_passes,
    })?;
    debug!(bytes = rendered.len(), "rendered pass context");
    Ok(rendered)
}

fn truncate_tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... truncated ...]\n{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> ContextInputs {
        ContextInputs {
            story_title: "Add order totals".to_string(),
            story_body: "Totals should include tax.".to_string(),
            labels: vec!["feature".to_string()],
            memory: "Project uses a Rust workspace.".to_string(),
            failure: None,
            question: None,
            answer: None,
            pass_number: 1,
            max_passes: 5,
        }
    }

    #[test]
    fn renders_story_and_memory() {
        let rendered = render_pass_context(&inputs(), 40_000).expect("render");
        assert!(rendered.contains("Add order totals"));
        assert!(rendered.contains("include tax"));
        assert!(rendered.contains("Rust workspace"));
        assert!(rendered.contains("Pass 1 of 5"));
    }

    #[test]
    fn includes_failure_on_retry_pass() {
        let mut input = inputs();
        input.pass_number = 2;
        input.failure = Some("FAILED tests/totals.rs: expected 12, got 10".to_string());

        let rendered = render_pass_context(&input, 40_000).expect("render");
        assert!(rendered.contains("Previous failure"));
        assert!(rendered.contains("expected 12, got 10"));
    }

    #[test]
    fn includes_answered_question() {
        let mut input = inputs();
        input.question = Some("Which rounding mode?".to_string());
        input.answer = Some("Round half up.".to_string());

        let rendered = render_pass_context(&input, 40_000).expect("render");
        assert!(rendered.contains("Which rounding mode?"));
        assert!(rendered.contains("Round half up."));
    }

    #[test]
    fn omits_empty_sections() {
        let mut input = inputs();
        input.memory = String::new();
        let rendered = render_pass_context(&input, 40_000).expect("render");
        assert!(!rendered.contains("Project memory"));
        assert!(!rendered.contains("Previous failure"));
        assert!(!rendered.contains("Answered question"));
    }

    #[test]
    fn truncates_oversized_memory_keeping_tail() {
        let mut input = inputs();
        input.memory = format!("{}\nnewest fact", "old stuff\n".repeat(5000));

        let rendered = render_pass_context(&input, 4_000).expect("render");
        assert!(rendered.contains("newest fact"));
        assert!(rendered.contains("[... truncated ...]"));
        assert!(rendered.len() < 10_000);
    }
}
