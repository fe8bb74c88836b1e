//! Flexible YAML shapes used by the manifest format.
//!
//! Compose manifests allow several fields to be written either as a scalar
//! or as a structured value: `command` is a shell line or an argv list,
//! `environment` is a mapping or a list of `K=V` entries, `ulimits` values
//! are a bare integer or a `{soft, hard}` pair. Each shape here normalises
//! those spellings into one canonical representation at deserialization
//! time so the rest of the crate only deals in typed values.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// A YAML scalar that the manifest permits to be string, integer or bool.
/// Normalised to its string form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Str(s) => s,
        }
    }
}

/// An argv, written either as one shell line or as an explicit list.
///
/// An explicitly empty list is meaningful for `entrypoint`: it clears the
/// image's default entrypoint, which is different from the field being
/// absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandLine(pub Vec<String>);

impl CommandLine {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(parts: Vec<String>) -> Self {
        CommandLine(parts)
    }
}

impl<'de> Deserialize<'de> for CommandLine {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Line(String),
            Parts(Vec<String>),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Line(line) => split_command(&line)
                .map(CommandLine)
                .map_err(de::Error::custom),
            Repr::Parts(parts) => Ok(CommandLine(parts)),
        }
    }
}

impl Serialize for CommandLine {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Split a shell line into words, honouring single and double quotes and
/// backslash escapes outside single quotes.
pub fn split_command(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }
    let mut quote = Quote::None;

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\' | '$')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => return Err("trailing backslash in command".to_string()),
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some(next) => {
                        current.push(next);
                        in_word = true;
                    }
                    None => return Err("trailing backslash in command".to_string()),
                },
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote != Quote::None {
        return Err(format!("unbalanced quote in command: {line:?}"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Environment entries: a mapping of name to value, or a list of `K=V`
/// strings. A list entry without `=` declares the variable with no value;
/// its value is inherited from the caller's environment at create time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Environment(pub BTreeMap<String, Option<String>>);

impl Environment {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, key: String, value: Option<String>) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Option<String>> {
        self.0.get(key)
    }

    /// Entries later in `other` override entries in `self`.
    pub fn extend_from(&mut self, other: &Environment) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Map(BTreeMap<String, Option<Scalar>>),
            List(Vec<String>),
        }
        let entries = match Repr::deserialize(deserializer)? {
            Repr::Map(map) => map
                .into_iter()
                .map(|(k, v)| (k, v.map(Scalar::into_string)))
                .collect(),
            Repr::List(list) => {
                let mut map = BTreeMap::new();
                for entry in list {
                    match entry.split_once('=') {
                        Some((k, v)) => map.insert(k.to_string(), Some(v.to_string())),
                        None => map.insert(entry, None),
                    };
                }
                map
            }
        };
        Ok(Environment(entries))
    }
}

/// A string mapping written either as a mapping or as a `k=v` list
/// (labels, logging options, build args).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct KeyValueMap(pub BTreeMap<String, String>);

impl KeyValueMap {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend_from(&mut self, other: &KeyValueMap) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl<'de> Deserialize<'de> for KeyValueMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Map(BTreeMap<String, Scalar>),
            List(Vec<String>),
        }
        let entries = match Repr::deserialize(deserializer)? {
            Repr::Map(map) => map
                .into_iter()
                .map(|(k, v)| (k, v.into_string()))
                .collect(),
            Repr::List(list) => list
                .into_iter()
                .map(|entry| match entry.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (entry, String::new()),
                })
                .collect(),
        };
        Ok(KeyValueMap(entries))
    }
}

/// One string or a list of strings, normalised to a list (dns, env_file,
/// tmpfs).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StringOrList(pub Vec<String>);

impl StringOrList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for StringOrList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::One(s) => StringOrList(vec![s]),
            Repr::Many(v) => StringOrList(v),
        })
    }
}

/// A single ulimit: a bare integer sets soft = hard, a mapping sets both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ulimit {
    pub soft: i64,
    pub hard: i64,
}

impl<'de> Deserialize<'de> for Ulimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Single(i64),
            Pair { soft: i64, hard: i64 },
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Single(n) => Ulimit { soft: n, hard: n },
            Repr::Pair { soft, hard } => Ulimit { soft, hard },
        })
    }
}

/// Ulimits keyed by resource name (`nofile`, `nproc`, ...).
pub type Ulimits = BTreeMap<String, Ulimit>;

/// Restart policy: `no`, `always`, `unless-stopped` or `on-failure[:N]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    Always,
    UnlessStopped,
    OnFailure { max_retries: Option<u32> },
}

impl RestartPolicy {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "no" | "" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure { max_retries: None }),
            other => match other.strip_prefix("on-failure:") {
                Some(n) => n
                    .parse::<u32>()
                    .map(|max| RestartPolicy::OnFailure {
                        max_retries: Some(max),
                    })
                    .map_err(|_| format!("invalid on-failure retry count: {n:?}")),
                None => Err(format!("invalid restart policy: {other:?}")),
            },
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
            RestartPolicy::OnFailure { max_retries: None } => write!(f, "on-failure"),
            RestartPolicy::OnFailure {
                max_retries: Some(n),
            } => write!(f, "on-failure:{n}"),
        }
    }
}

impl<'de> Deserialize<'de> for RestartPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RestartPolicy::parse(&s).map_err(de::Error::custom)
    }
}

impl Serialize for RestartPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_from_list() {
        let cmd: CommandLine = serde_yaml::from_str("[echo, hello]").unwrap();
        assert_eq!(cmd.0, vec!["echo", "hello"]);
    }

    #[test]
    fn command_from_shell_line() {
        let cmd: CommandLine = serde_yaml::from_str(r#"sh -c 'echo "a b"'"#).unwrap();
        assert_eq!(cmd.0, vec!["sh", "-c", r#"echo "a b""#]);
    }

    #[test]
    fn command_empty_list_stays_empty() {
        let cmd: CommandLine = serde_yaml::from_str("[]").unwrap();
        assert!(cmd.is_empty());
    }

    #[test]
    fn split_command_handles_double_quotes() {
        assert_eq!(
            split_command(r#"echo "hello world" plain"#).unwrap(),
            vec!["echo", "hello world", "plain"]
        );
    }

    #[test]
    fn split_command_rejects_unbalanced_quote() {
        assert!(split_command("echo 'oops").is_err());
    }

    #[test]
    fn environment_from_map_with_scalars() {
        let env: Environment = serde_yaml::from_str("{PORT: 8080, DEBUG: true, NAME: web}").unwrap();
        assert_eq!(env.get("PORT"), Some(&Some("8080".to_string())));
        assert_eq!(env.get("DEBUG"), Some(&Some("true".to_string())));
        assert_eq!(env.get("NAME"), Some(&Some("web".to_string())));
    }

    #[test]
    fn environment_from_list() {
        let env: Environment = serde_yaml::from_str("[A=1, B]").unwrap();
        assert_eq!(env.get("A"), Some(&Some("1".to_string())));
        assert_eq!(env.get("B"), Some(&None));
    }

    #[test]
    fn key_value_map_both_spellings_agree() {
        let from_map: KeyValueMap = serde_yaml::from_str("{tier: backend}").unwrap();
        let from_list: KeyValueMap = serde_yaml::from_str("[tier=backend]").unwrap();
        assert_eq!(from_map, from_list);
    }

    #[test]
    fn ulimit_scalar_sets_both() {
        let u: Ulimit = serde_yaml::from_str("1024").unwrap();
        assert_eq!(u, Ulimit { soft: 1024, hard: 1024 });
    }

    #[test]
    fn ulimit_pair() {
        let u: Ulimit = serde_yaml::from_str("{soft: 512, hard: 1024}").unwrap();
        assert_eq!(u.soft, 512);
        assert_eq!(u.hard, 1024);
    }

    #[test]
    fn restart_policy_forms() {
        assert_eq!(RestartPolicy::parse("no").unwrap(), RestartPolicy::No);
        assert_eq!(
            RestartPolicy::parse("always").unwrap(),
            RestartPolicy::Always
        );
        assert_eq!(
            RestartPolicy::parse("on-failure:5").unwrap(),
            RestartPolicy::OnFailure {
                max_retries: Some(5)
            }
        );
        assert!(RestartPolicy::parse("sometimes").is_err());
    }

    #[test]
    fn restart_policy_round_trips_display() {
        for s in ["no", "always", "unless-stopped", "on-failure", "on-failure:3"] {
            assert_eq!(RestartPolicy::parse(s).unwrap().to_string(), s);
        }
    }
}
