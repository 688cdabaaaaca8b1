//! Built-in scenarios, compiled into the harness binary.

use crate::scenario::{Scenario, ScenarioError};

const BUILTIN: &[(&str, &str)] = &[
    (
        "clean_lifecycle.json",
        include_str!("../scenarios/clean_lifecycle.json"),
    ),
    ("double_free.json", include_str!("../scenarios/double_free.json")),
    ("overflow.json", include_str!("../scenarios/overflow.json")),
    ("underflow.json", include_str!("../scenarios/underflow.json")),
    ("leaks.json", include_str!("../scenarios/leaks.json")),
    (
        "write_after_release.json",
        include_str!("../scenarios/write_after_release.json"),
    ),
    (
        "purged_double_free.json",
        include_str!("../scenarios/purged_double_free.json"),
    ),
    ("foreign_free.json", include_str!("../scenarios/foreign_free.json")),
    ("compact.json", include_str!("../scenarios/compact.json")),
    ("passthrough.json", include_str!("../scenarios/passthrough.json")),
];

/// Parse every built-in scenario.
pub fn builtin_scenarios() -> Result<Vec<Scenario>, ScenarioError> {
    BUILTIN
        .iter()
        .map(|(path, text)| {
            Scenario::from_json(text).map_err(|source| ScenarioError::Parse {
                path: (*path).to_string(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_parse_with_unique_names() {
        let scenarios = builtin_scenarios().unwrap();
        assert_eq!(scenarios.len(), BUILTIN.len());
        let mut names: Vec<&str> = scenarios.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), BUILTIN.len());
        for (scenario, (path, _)) in scenarios.iter().zip(BUILTIN) {
            assert_eq!(format!("{}.json", scenario.name), *path);
        }
    }
}
