//! Friendly error enrichment: extra human text attached to fatal errors.
//!
//! This is a text-producing collaborator, not a control-flow concern:
//! undefined names get did-you-mean suggestions ranked by edit distance,
//! and syntax errors get a caret rendering of the offending position.

use crate::lang::{ErrorKind, RunError, SyntaxError, BUILTIN_NAMES};

/// Maximum edit distance for a name suggestion.
const MAX_DISTANCE: u32 = 2;

/// Best did-you-mean candidate for a missing name.
pub fn suggest_name<'a>(
    missing: &str,
    candidates: impl IntoIterator<Item = &'a str>,
) -> Option<String> {
    let mut best: Option<(u32, &str)> = None;
    for candidate in candidates {
        if candidate == missing {
            continue;
        }
        let distance =
            triple_accel::levenshtein(missing.as_bytes(), candidate.as_bytes());
        if distance > MAX_DISTANCE {
            continue;
        }
        if best.map_or(true, |(best_distance, _)| distance < best_distance) {
            best = Some((distance, candidate));
        }
    }
    best.map(|(_, name)| name.to_string())
}

/// Optional longer explanation for a runtime error. Known names are the
/// session's bindings; builtins are always candidates.
pub fn explain_error(err: &RunError, known_names: &[String]) -> Option<String> {
    match err.kind {
        ErrorKind::Name => {
            let missing = err.subject.as_deref()?;
            let candidates = known_names
                .iter()
                .map(String::as_str)
                .chain(BUILTIN_NAMES.iter().copied());
            let suggestion = suggest_name(missing, candidates)?;
            Some(format!("Did you mean `{}`?", suggestion))
        }
        ErrorKind::Recursion => Some(
            "Your function calls itself over and over without ever stopping. \
Check that it has a case which returns without calling itself again."
                .to_string(),
        ),
        ErrorKind::Fuel => Some(
            "Your program looks like it runs forever. \
Check the conditions of your loops."
                .to_string(),
        ),
        _ => None,
    }
}

/// Render a syntax error with the offending line and a caret under the
/// position.
pub fn format_syntax_error(source: &str, err: &SyntaxError) -> String {
    let mut out = format!("SyntaxError: {} (line {})\n", err.message, err.line);
    if let Some(line) = source.split('\n').nth(err.line.saturating_sub(1) as usize) {
        if !line.trim().is_empty() {
            out.push_str(&format!("    {}\n", line));
            let caret_offset = (err.col.saturating_sub(1) as usize).min(line.len());
            out.push_str(&format!("    {}^\n", " ".repeat(caret_offset)));
        }
    }
    out
}
