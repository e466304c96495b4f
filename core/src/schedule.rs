//! Dependency resolution: missing-reference checks, cycle detection, and
//! phase layering.
//!
//! Rules are keyed by name in ordered maps, so every pass here is
//! deterministic for a given configuration.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::error::SxnErr;

/// Every dependency must name another loaded rule.
pub(crate) fn check_dependencies(graph: &BTreeMap<String, BTreeSet<String>>) -> Result<()> {
    for (rule, dependencies) in graph {
        for dependency in dependencies {
            if !graph.contains_key(dependency) {
                return Err(SxnErr::MissingDependency {
                    rule: rule.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first coloring; a back-edge to a gray node is a cycle, reported
/// against a rule that sits on it.
pub(crate) fn detect_cycles(graph: &BTreeMap<String, BTreeSet<String>>) -> Result<()> {
    let mut colors: BTreeMap<&str, Color> =
        graph.keys().map(|name| (name.as_str(), Color::White)).collect();

    fn visit<'a>(
        node: &'a str,
        graph: &'a BTreeMap<String, BTreeSet<String>>,
        colors: &mut BTreeMap<&'a str, Color>,
    ) -> Result<()> {
        colors.insert(node, Color::Gray);
        if let Some(dependencies) = graph.get(node) {
            for dependency in dependencies {
                match colors.get(dependency.as_str()) {
                    Some(Color::Gray) => {
                        return Err(SxnErr::CircularDependency {
                            rule: dependency.clone(),
                        });
                    }
                    Some(Color::White) => visit(dependency, graph, colors)?,
                    _ => {}
                }
            }
        }
        colors.insert(node, Color::Black);
        Ok(())
    }

    let names: Vec<&str> = graph.keys().map(String::as_str).collect();
    for name in names {
        if colors.get(name) == Some(&Color::White) {
            visit(name, graph, &mut colors)?;
        }
    }
    Ok(())
}

/// Kahn-style layering: phase *k* holds every rule whose dependencies are
/// all satisfied by phases `< k`. Call after [`check_dependencies`] and
/// [`detect_cycles`].
pub(crate) fn phases(graph: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<Vec<String>>> {
    let mut completed: BTreeSet<String> = BTreeSet::new();
    let mut remaining: BTreeSet<String> = graph.keys().cloned().collect();
    let mut schedule = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|name| {
                graph
                    .get(*name)
                    .is_some_and(|deps| deps.iter().all(|d| completed.contains(d)))
            })
            .cloned()
            .collect();

        if ready.is_empty() {
            // Unreachable after cycle detection; fail loudly rather than
            // loop forever.
            let stuck = remaining.iter().next().cloned().unwrap_or_default();
            return Err(SxnErr::CircularDependency { rule: stuck });
        }

        for name in &ready {
            remaining.remove(name);
            completed.insert(name.clone());
        }
        schedule.push(ready);
    }

    Ok(schedule)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn missing_dependency_is_reported() {
        let g = graph(&[("a", &["ghost"])]);
        let err = check_dependencies(&g).unwrap_err();
        match err {
            SxnErr::MissingDependency { rule, dependency } => {
                assert_eq!(rule, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn two_node_cycle_is_detected() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let err = detect_cycles(&g).unwrap_err();
        match err {
            SxnErr::CircularDependency { rule } => assert!(rule == "a" || rule == "b"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn self_cycle_is_detected() {
        let g = graph(&[("a", &["a"])]);
        assert!(detect_cycles(&g).is_err());
    }

    #[test]
    fn diamond_resolves_into_three_phases() {
        let g = graph(&[
            ("top", &[]),
            ("left", &["top"]),
            ("right", &["top"]),
            ("bottom", &["left", "right"]),
        ]);
        detect_cycles(&g).unwrap();
        let schedule = phases(&g).unwrap();
        assert_eq!(
            schedule,
            vec![
                vec!["top".to_string()],
                vec!["left".to_string(), "right".to_string()],
                vec!["bottom".to_string()],
            ]
        );
    }

    #[test]
    fn independent_rules_share_one_phase() {
        let g = graph(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let schedule = phases(&g).unwrap();
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule[0].len(), 3);
    }

    #[test]
    fn every_dependency_lands_in_an_earlier_phase() {
        let g = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &["a", "c"]),
        ]);
        let schedule = phases(&g).unwrap();

        let phase_of = |name: &str| {
            schedule
                .iter()
                .position(|phase| phase.iter().any(|n| n == name))
                .unwrap()
        };
        for (rule, deps) in &g {
            for dep in deps {
                assert!(phase_of(dep) < phase_of(rule));
            }
        }
    }
}
