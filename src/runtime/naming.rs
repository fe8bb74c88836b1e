//! Container naming and ordinal allocation.
//!
//! Containers are named `<project>_<service>_<ordinal>` (one-offs insert a
//! `run` segment), unless the manifest pins an explicit `container_name`.
//! The ordinal is the smallest positive integer not currently used by the
//! service's containers; the claim is verified against the engine at
//! create time, retrying with the next ordinal on a name collision.

use std::collections::BTreeSet;

/// Allocates names for new containers of one service.
#[derive(Debug, Clone)]
pub enum ContainerNamer {
    /// Ordinal naming over the currently used numbers.
    Ordinal {
        project: String,
        service: String,
        one_off: bool,
        used: BTreeSet<u32>,
    },
    /// A pinned `container_name`; only ever yields that single name.
    Fixed { name: String },
}

impl ContainerNamer {
    pub fn ordinal(project: &str, service: &str, one_off: bool, used: impl IntoIterator<Item = u32>) -> Self {
        ContainerNamer::Ordinal {
            project: project.to_string(),
            service: service.to_string(),
            one_off,
            used: used.into_iter().collect(),
        }
    }

    pub fn fixed(name: &str) -> Self {
        ContainerNamer::Fixed {
            name: name.to_string(),
        }
    }

    /// Claim the next free name. For ordinal naming the returned number is
    /// marked used immediately, so successive calls (or a retry after an
    /// engine-side collision) move on to the next ordinal.
    pub fn next(&mut self) -> (String, u32) {
        match self {
            ContainerNamer::Fixed { name } => (name.clone(), 1),
            ContainerNamer::Ordinal {
                project,
                service,
                one_off,
                used,
            } => {
                let mut number = 1u32;
                while used.contains(&number) {
                    number += 1;
                }
                used.insert(number);
                let name = if *one_off {
                    format!("{project}_{service}_run_{number}")
                } else {
                    format!("{project}_{service}_{number}")
                };
                (name, number)
            }
        }
    }
}

/// Parse the ordinal out of a `number` label.
pub fn parse_number_label(value: Option<&str>) -> Option<u32> {
    value.and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_smallest_unused() {
        let mut namer = ContainerNamer::ordinal("proj", "web", false, [1, 3]);
        assert_eq!(namer.next(), ("proj_web_2".to_string(), 2));
        assert_eq!(namer.next(), ("proj_web_4".to_string(), 4));
    }

    #[test]
    fn starts_at_one_when_empty() {
        let mut namer = ContainerNamer::ordinal("proj", "web", false, []);
        assert_eq!(namer.next(), ("proj_web_1".to_string(), 1));
        assert_eq!(namer.next(), ("proj_web_2".to_string(), 2));
    }

    #[test]
    fn one_off_names_have_run_segment() {
        let mut namer = ContainerNamer::ordinal("proj", "web", true, []);
        assert_eq!(namer.next(), ("proj_web_run_1".to_string(), 1));
    }

    #[test]
    fn fixed_name_is_stable() {
        let mut namer = ContainerNamer::fixed("my-db");
        assert_eq!(namer.next(), ("my-db".to_string(), 1));
        assert_eq!(namer.next(), ("my-db".to_string(), 1));
    }

    #[test]
    fn number_label_parsing() {
        assert_eq!(parse_number_label(Some("3")), Some(3));
        assert_eq!(parse_number_label(Some("nope")), None);
        assert_eq!(parse_number_label(None), None);
    }
}
