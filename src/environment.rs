//! Environment registry entries and the declarative manifest they are built
//! from

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::process::Child;

/// Declarative manifest describing an environment's package set.
///
/// Submitted by the user as YAML with at least a `name` and a
/// `dependencies` list. The hub appends its mandatory payload-server
/// dependencies before the manifest reaches the build tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentDefinition {
    pub name: String,

    #[serde(default)]
    pub channels: Vec<String>,

    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl EnvironmentDefinition {
    /// Parse a manifest from its YAML text
    pub fn parse(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Append dependencies that are not already listed
    pub fn append_dependencies(&mut self, extra: &[String]) {
        for dep in extra {
            if !self.dependencies.contains(dep) {
                self.dependencies.push(dep.clone());
            }
        }
    }
}

/// One entry in the hub's registry: identity plus observed state.
#[derive(Debug)]
pub struct Environment {
    /// Unique registry key, also the on-disk directory name
    pub name: String,
    /// Routing token; immutable once assigned, never reused
    pub id: String,
    /// Filesystem location of the built environment
    pub path: PathBuf,
    /// Manifest, present while building or freshly created
    pub definition: Option<EnvironmentDefinition>,
    /// Elapsed build seconds while a build is in flight, `None` otherwise.
    /// Progress display only, never used for control flow.
    pub create_time: Option<u64>,
    /// Port bound by the running payload server
    pub port: Option<u16>,
    /// Handle to the running server subprocess
    pub process: Option<Child>,
}

impl Environment {
    /// A freshly requested environment about to be built
    pub fn building(name: String, id: String, path: PathBuf, definition: EnvironmentDefinition) -> Self {
        Self {
            name,
            id,
            path,
            definition: Some(definition),
            create_time: Some(0),
            port: None,
            process: None,
        }
    }

    /// An environment recovered from disk at boot, nothing running
    pub fn idle(name: String, id: String, path: PathBuf) -> Self {
        Self {
            name,
            id,
            path,
            definition: None,
            create_time: None,
            port: None,
            process: None,
        }
    }

    pub fn state(&self) -> EnvState {
        if self.create_time.is_some() {
            EnvState::Building
        } else if self.process.is_some() {
            EnvState::Running
        } else {
            EnvState::Idle
        }
    }
}

/// Lifecycle state of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvState {
    /// Build in progress
    Building,
    /// Built, no server running
    Idle,
    /// Payload server running
    Running,
}

/// Serializable snapshot of an environment, for status display
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentStatus {
    pub name: String,
    pub id: String,
    pub state: EnvState,
    pub port: Option<u16>,
    /// OS pid of the tracked server process, while running
    pub pid: Option<u32>,
    /// Seconds the in-flight build has been running, if any
    pub create_secs: Option<u64>,
}

impl From<&Environment> for EnvironmentStatus {
    fn from(env: &Environment) -> Self {
        Self {
            name: env.name.clone(),
            id: env.id.clone(),
            state: env.state(),
            port: env.port,
            pid: env.process.as_ref().and_then(|child| child.id()),
            create_secs: env.create_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let yaml = r#"
name: science
channels:
  - conda-forge
dependencies:
  - numpy
  - pandas
"#;
        let def = EnvironmentDefinition::parse(yaml).unwrap();
        assert_eq!(def.name, "science");
        assert_eq!(def.channels, vec!["conda-forge"]);
        assert_eq!(def.dependencies, vec!["numpy", "pandas"]);
    }

    #[test]
    fn test_parse_manifest_minimal() {
        let def = EnvironmentDefinition::parse("name: bare\n").unwrap();
        assert_eq!(def.name, "bare");
        assert!(def.dependencies.is_empty());
    }

    #[test]
    fn test_parse_manifest_invalid() {
        assert!(EnvironmentDefinition::parse("dependencies:\n  - numpy\n").is_err());
        assert!(EnvironmentDefinition::parse(": not yaml :").is_err());
    }

    #[test]
    fn test_append_dependencies_dedupes() {
        let mut def = EnvironmentDefinition::parse("name: x\ndependencies: [numpy]\n").unwrap();
        def.append_dependencies(&["payload-server".to_string(), "numpy".to_string()]);
        assert_eq!(def.dependencies, vec!["numpy", "payload-server"]);
    }

    #[test]
    fn test_state_transitions() {
        let def = EnvironmentDefinition::parse("name: x\n").unwrap();
        let mut env = Environment::building(
            "x".to_string(),
            "abc".to_string(),
            PathBuf::from("environments/x"),
            def,
        );
        assert_eq!(env.state(), EnvState::Building);
        assert_eq!(env.create_time, Some(0));

        env.create_time = None;
        assert_eq!(env.state(), EnvState::Idle);

        env.port = Some(4000);
        // Port alone does not make it running; the process handle does
        assert_eq!(env.state(), EnvState::Idle);
    }

    #[test]
    fn test_status_serializes_to_json() {
        let env = Environment::idle(
            "science".to_string(),
            "abc123".to_string(),
            PathBuf::from("environments/science"),
        );
        let status = EnvironmentStatus::from(&env);
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"name\":\"science\""));
        assert!(json.contains("\"state\":\"idle\""));
        assert!(json.contains("\"port\":null"));
    }
}
