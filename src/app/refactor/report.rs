//! Text rendering of refactor plans for the terminal.

use super::mapping::{AmbiguousPath, ResourceMapping};
use super::movement::ResourceLocation;
use super::{EnvironmentPlan, RefactorPlan};
use std::fmt::Write as _;

const AMBIGUITY_HINT: &str = "If you want to take advantage of automatic resource refactoring, avoid \
renaming or moving multiple identical resources at the same time. Otherwise, provide a mapping \
file with --mapping-file to resolve them explicitly.";

/// Render the whole plan, one section per environment.
pub fn render_plan(plan: &RefactorPlan) -> String {
    let mut out = String::new();
    for environment in &plan.environments {
        out.push_str(&render_environment(environment));
        out.push('\n');
    }
    for error in &plan.errors {
        let _ = writeln!(
            out,
            "Could not plan refactor for {} ({}): {}",
            error.environment, error.kind, error.message
        );
    }
    if plan.environments.is_empty() && plan.errors.is_empty() {
        out.push_str("Nothing to refactor.\n");
    }
    out
}

pub fn render_environment(plan: &EnvironmentPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Environment {}", plan.environment);
    out.push('\n');

    if plan.mappings.is_empty() && plan.ambiguous.is_empty() {
        out.push_str("Nothing to refactor.\n");
        return out;
    }

    if !plan.mappings.is_empty() {
        out.push_str("The following resources were moved or renamed:\n\n");
        out.push_str(&render_mappings(&plan.mappings));
    }

    if !plan.ambiguous.is_empty() {
        if !plan.mappings.is_empty() {
            out.push('\n');
        }
        out.push_str("Detected ambiguities:\n\n");
        out.push_str(&render_ambiguous(&plan.ambiguous));
        out.push('\n');
        out.push_str(AMBIGUITY_HINT);
        out.push('\n');
    }
    out
}

/// Resource type, old path and new path of each mapping.
pub fn render_mappings(mappings: &[ResourceMapping]) -> String {
    let rows: Vec<Vec<String>> = mappings
        .iter()
        .map(|m| {
            let typed = m.to_typed();
            vec![typed.resource_type, typed.source_path, typed.destination_path]
        })
        .collect();
    render_table(&["Resource Type", "Old Construct Path", "New Construct Path"], &rows)
}

/// One row per ambiguous group: its removed and added paths.
pub fn render_ambiguous(ambiguous: &[AmbiguousPath]) -> String {
    let rows: Vec<Vec<String>> = ambiguous
        .iter()
        .map(|a| vec![paths(&a.sources), paths(&a.destinations)])
        .collect();
    render_table(&["Removed", "Added"], &rows)
}

fn paths(locations: &[ResourceLocation]) -> String {
    locations
        .iter()
        .map(ResourceLocation::to_path)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Box-drawn table. Cells may contain newlines.
fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            let widest = cell.lines().map(|l| l.chars().count()).max().unwrap_or(0);
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(widest);
            }
        }
    }

    let rule = |left: &str, mid: &str, right: &str| {
        let segments: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
        format!("{}{}{}\n", left, segments.join(mid), right)
    };
    let line = |cells: &[&str]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!(" {}{} ", cell, " ".repeat(width - cell.chars().count())))
            .collect();
        format!("│{}│\n", padded.join("│"))
    };

    let mut out = rule("┌", "┬", "┐");
    out.push_str(&line(headers));
    for row in rows {
        out.push_str(&rule("├", "┼", "┤"));
        let height = row.iter().map(|c| c.lines().count().max(1)).max().unwrap_or(1);
        for n in 0..height {
            let cells: Vec<&str> = row.iter().map(|c| c.lines().nth(n).unwrap_or("")).collect();
            out.push_str(&line(&cells));
        }
    }
    out.push_str(&rule("└", "┴", "┘"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::refactor::environment::{Environment, StackRef};

    fn loc(stack: &str, id: &str, path: Option<&str>) -> ResourceLocation {
        let mut location = ResourceLocation::new(
            StackRef {
                stack_name: stack.into(),
                environment: Environment::new("1", "us-east-1"),
            },
            id,
        );
        location.construct_path = path.map(str::to_string);
        location.resource_type = "AWS::S3::Bucket".into();
        location
    }

    #[test]
    fn test_render_mappings_table() {
        let table = render_mappings(&[ResourceMapping::new(
            loc("Foo", "Bucket", Some("Foo/Bucket/Resource")),
            loc("Bar", "Bucket", None),
        )]);
        insta::assert_snapshot!(table.trim_end(), @r"
        ┌─────────────────┬─────────────────────┬────────────────────┐
        │ Resource Type   │ Old Construct Path  │ New Construct Path │
        ├─────────────────┼─────────────────────┼────────────────────┤
        │ AWS::S3::Bucket │ Foo/Bucket/Resource │ Bar.Bucket         │
        └─────────────────┴─────────────────────┴────────────────────┘
        ");
    }

    #[test]
    fn test_render_ambiguous_lists_every_location() {
        let table = render_ambiguous(&[AmbiguousPath {
            sources: vec![loc("Src", "Bucket1", None), loc("Src", "Bucket2", None)],
            destinations: vec![loc("Dst", "Bucket3", None), loc("Dst", "Bucket4", None)],
        }]);
        for expected in ["Src.Bucket1", "Src.Bucket2", "Dst.Bucket3", "Dst.Bucket4"] {
            assert!(table.contains(expected), "missing {} in\n{}", expected, table);
        }
    }

    #[test]
    fn test_empty_plan_says_nothing_to_refactor() {
        assert_eq!(render_plan(&RefactorPlan::default()), "Nothing to refactor.\n");
    }
}
