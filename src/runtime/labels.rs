//! Labels stamped on every container the system owns.
//!
//! Containers are discovered purely by label filter; there is no local
//! mirror of engine state. The label set mirrors the compose convention so
//! containers stay interoperable with other tooling.

use std::collections::BTreeMap;

use crate::engine::LabelFilter;

pub const PROJECT: &str = "io.docker.compose.project";
pub const SERVICE: &str = "io.docker.compose.service";
pub const CONFIG_HASH: &str = "io.docker.compose.config-hash";
pub const NUMBER: &str = "io.docker.compose.number";
pub const VERSION: &str = "io.docker.compose.version";
pub const ONEOFF: &str = "io.docker.compose.oneoff";

/// The version string written to [`VERSION`] on every owned container.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Filter matching every container of one service in one project.
pub fn service_filter(project: &str, service: &str) -> LabelFilter {
    LabelFilter::new()
        .label(PROJECT, project)
        .label(SERVICE, service)
}

/// Filter matching every container of a project.
pub fn project_filter(project: &str) -> LabelFilter {
    LabelFilter::new().label(PROJECT, project)
}

/// The full label set for a container about to be created.
pub fn owned_labels(
    project: &str,
    service: &str,
    config_hash: &str,
    number: u32,
    one_off: bool,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(PROJECT.to_string(), project.to_string());
    labels.insert(SERVICE.to_string(), service.to_string());
    labels.insert(CONFIG_HASH.to_string(), config_hash.to_string());
    labels.insert(NUMBER.to_string(), number.to_string());
    labels.insert(VERSION.to_string(), TOOL_VERSION.to_string());
    labels.insert(
        ONEOFF.to_string(),
        if one_off { "True" } else { "False" }.to_string(),
    );
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_labels_complete_set() {
        let labels = owned_labels("proj", "web", "abc123", 2, false);
        assert_eq!(labels[PROJECT], "proj");
        assert_eq!(labels[SERVICE], "web");
        assert_eq!(labels[CONFIG_HASH], "abc123");
        assert_eq!(labels[NUMBER], "2");
        assert_eq!(labels[ONEOFF], "False");
        assert_eq!(labels[VERSION], TOOL_VERSION);
    }

    #[test]
    fn oneoff_spelling_is_capitalised() {
        let labels = owned_labels("proj", "web", "abc", 1, true);
        assert_eq!(labels[ONEOFF], "True");
    }

    #[test]
    fn service_filter_matches_owned_labels() {
        let labels = owned_labels("proj", "web", "abc", 1, false);
        assert!(service_filter("proj", "web").matches(&labels));
        assert!(!service_filter("proj", "db").matches(&labels));
        assert!(project_filter("proj").matches(&labels));
    }
}
