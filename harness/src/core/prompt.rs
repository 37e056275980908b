//! Prompt assembly for the evaluation invocation.

/// Append the operator's extra prompt (if any) to the base prompt.
pub fn evaluation_prompt(base: &str, extra: &str) -> String {
    let extra = extra.trim();
    if extra.is_empty() {
        base.to_string()
    } else {
        format!("{base} {extra}")
    }
}
