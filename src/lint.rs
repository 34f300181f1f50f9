//! Lint collaborator: advisory messages about a syntactically valid
//! submission, appended to failure feedback as their own section. Lint
//! concerns are never upgraded to a hard failure.

use std::collections::{HashMap, HashSet};

use crate::lang::ast::{Expr, NodeRef, Stmt, Target};
use crate::lang::{ast, Program};

pub trait Linter {
    fn lint(&self, program: &Program) -> Vec<String>;
}

/// Built-in rules: unused variables, redefinition before use, repeated
/// dictionary keys.
#[derive(Default)]
pub struct DefaultLinter;

impl Linter for DefaultLinter {
    fn lint(&self, program: &Program) -> Vec<String> {
        let mut messages = Vec::new();
        let nodes = ast::walk(&program.body);

        let stores = collect_stores(&nodes);
        let loads = collect_loads(&nodes);

        let mut reported: HashSet<&str> = HashSet::new();
        for (name, _line) in &stores {
            if name.starts_with('_') || loads.contains_key(name.as_str()) {
                continue;
            }
            if reported.insert(name) {
                messages.push(format!(
                    "**Unused variable `{0}`**\n\n\
You defined a variable `{0}` but never used it. Did you forget to use it? \
Maybe you used the wrong variable in its place? \
If you don't need it, just remove it entirely.",
                    name
                ));
            }
        }

        for window in redefinitions(&stores, &loads) {
            messages.push(format!(
                "**Redefined `{0}` without using it**\n\n\
You defined `{0}` on line `{1}`, but before ever using it you redefined it, \
overwriting the original definition.",
                window.0, window.1
            ));
        }

        for key in repeated_map_keys(&nodes) {
            messages.push(format!(
                "**Dictionary key `{0}` repeated with different values**\n\n\
A dictionary cannot have multiple entries for the same key. \
Check your code again and change the repeated key to something unique.",
                key
            ));
        }

        messages
    }
}

/// Assignments and function definitions, in source order.
fn collect_stores(nodes: &[NodeRef]) -> Vec<(String, u32)> {
    let mut stores = Vec::new();
    for node in nodes {
        if let NodeRef::Stmt(stmt) = node {
            match stmt {
                Stmt::Assign {
                    target: Target::Name(name),
                    span,
                    ..
                } => stores.push((name.clone(), span.line)),
                Stmt::FuncDef(def) => stores.push((def.name.clone(), def.span.line)),
                _ => {}
            }
        }
    }
    stores
}

/// Every line on which each name is read.
fn collect_loads(nodes: &[NodeRef]) -> HashMap<String, Vec<u32>> {
    let mut loads: HashMap<String, Vec<u32>> = HashMap::new();
    for node in nodes {
        match node {
            NodeRef::Expr(Expr::Name { id, span }) => {
                loads.entry(id.clone()).or_default().push(span.line);
            }
            // Augmented assignment reads its target before writing it.
            NodeRef::Stmt(Stmt::AugAssign {
                target: Target::Name(name),
                span,
                ..
            }) => {
                loads.entry(name.clone()).or_default().push(span.line);
            }
            _ => {}
        }
    }
    loads
}

/// Pairs of (name, first-definition line) where the name was reassigned
/// with no intervening read.
fn redefinitions(
    stores: &[(String, u32)],
    loads: &HashMap<String, Vec<u32>>,
) -> Vec<(String, u32)> {
    let mut result = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for (i, (name, line)) in stores.iter().enumerate() {
        if !seen.insert(name) {
            continue;
        }
        for (next_name, next_line) in &stores[i + 1..] {
            if next_name != name {
                continue;
            }
            let read_between = loads
                .get(name.as_str())
                .map(|lines| lines.iter().any(|l| *l > *line && *l <= *next_line))
                .unwrap_or(false);
            if !read_between {
                result.push((name.clone(), *line));
            }
            break;
        }
    }
    result
}

/// Literal keys appearing more than once in one dictionary display.
fn repeated_map_keys(nodes: &[NodeRef]) -> Vec<String> {
    let mut repeated = Vec::new();
    for node in nodes {
        if let NodeRef::Expr(Expr::Map { items, .. }) = node {
            for (i, (key, _)) in items.iter().enumerate() {
                let Some(repr) = literal_key_repr(key) else {
                    continue;
                };
                let duplicated = items[i + 1..]
                    .iter()
                    .any(|(other, _)| literal_key_repr(other).as_deref() == Some(&repr));
                if duplicated && !repeated.contains(&repr) {
                    repeated.push(repr);
                }
            }
        }
    }
    repeated
}

fn literal_key_repr(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Int { value, .. } => Some(value.to_string()),
        Expr::Str { value, .. } => Some(format!("'{}'", value)),
        Expr::Bool { value, .. } => Some(if *value { "True" } else { "False" }.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse_program;

    fn lint(source: &str) -> Vec<String> {
        DefaultLinter.lint(&parse_program(source).unwrap())
    }

    #[test]
    fn test_unused_variable() {
        let messages = lint("x = 1\ny = 2\nprint(x)");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Unused variable `y`"));
    }

    #[test]
    fn test_no_messages_for_clean_code() {
        assert!(lint("x = 1\nprint(x)").is_empty());
    }

    #[test]
    fn test_aug_assign_counts_as_use() {
        assert!(lint("x = 1\nx += 1\nprint(x)").is_empty());
    }

    #[test]
    fn test_redefined_without_use() {
        let messages = lint("x = 1\nx = 2\nprint(x)");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Redefined `x`"));
        assert!(messages[0].contains("line `1`"));
    }

    #[test]
    fn test_redefinition_after_use_is_fine() {
        assert!(lint("x = 1\nprint(x)\nx = 2\nprint(x)").is_empty());
    }

    #[test]
    fn test_repeated_dict_key() {
        let messages = lint("d = {'a': 1, 'a': 2}\nprint(d)");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Dictionary key `'a'` repeated"));
    }

    #[test]
    fn test_unused_function_reported() {
        let messages = lint("def helper():\n    return 1\nprint(2)");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Unused variable `helper`"));
    }
}
