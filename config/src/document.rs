//! Nested key/value config documents handed to worker processes.
//!
//! Documents are YAML mappings produced upstream (one for the coordinator,
//! one per participant). The orchestrator validates the keys it relies on
//! once, then only touches path-valued leaves and endpoint bindings.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::Role;

/// Address bound by workers running behind a service endpoint.
pub const BIND_ALL: &str = "0.0.0.0";

/// A worker configuration document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDocument {
    root: Mapping,
}

/// One non-mapping value of a document together with its location.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    /// Dotted key, e.g. `data.info.npz_file`.
    pub key: String,
    pub value: Value,
    path: Vec<Value>,
}

impl Leaf {
    /// Last segment of the dotted key.
    #[must_use]
    pub fn last_segment(&self) -> &str {
        self.key.rsplit('.').next().unwrap_or(&self.key)
    }
}

/// Keys the orchestrator reads from a validated document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSummary {
    /// Address the worker binds or is reachable at.
    pub address: String,
    pub port: Option<u16>,
    /// `hyperparams.global.num_parties`, coordinator only.
    pub num_parties: Option<usize>,
    /// `hyperparams.global.rounds`, coordinator only.
    pub rounds: Option<usize>,
    /// Remote metrics file written by a participant, if it records metrics.
    pub metrics_output: Option<String>,
}

impl ConfigDocument {
    #[must_use]
    pub fn new(root: Mapping) -> Self {
        Self { root }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, DocumentError> {
        let value: Value =
            serde_yaml::from_str(content).map_err(|e| DocumentError::Parse(e.to_string()))?;
        match value {
            Value::Mapping(root) => Ok(Self { root }),
            Value::Null => Ok(Self::default()),
            _ => Err(DocumentError::NotAMapping),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DocumentError::Io(path.to_path_buf(), e))?;
        Self::from_yaml_str(&content)
    }

    /// Write the document as YAML, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DocumentError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DocumentError::Io(parent.to_path_buf(), e))?;
        }
        std::fs::write(path, self.to_yaml_string()?)
            .map_err(|e| DocumentError::Io(path.to_path_buf(), e))
    }

    pub fn to_yaml_string(&self) -> Result<String, DocumentError> {
        serde_yaml::to_string(&self.root).map_err(|e| DocumentError::Serialize(e.to_string()))
    }

    #[must_use]
    pub fn as_mapping(&self) -> &Mapping {
        &self.root
    }

    /// All non-mapping values in document order, keyed by dotted path.
    #[must_use]
    pub fn leaves(&self) -> Vec<Leaf> {
        let mut out = Vec::new();
        collect_leaves(&self.root, &mut Vec::new(), &mut out);
        out
    }

    /// String-valued leaves only.
    #[must_use]
    pub fn string_leaves(&self) -> Vec<(String, String)> {
        self.leaves()
            .into_iter()
            .filter_map(|leaf| match leaf.value {
                Value::String(s) => Some((leaf.key, s)),
                _ => None,
            })
            .collect()
    }

    /// Replace the value of a leaf previously returned by [`Self::leaves`].
    pub fn set_leaf(&mut self, leaf: &Leaf, value: impl Into<Value>) {
        set_path(&mut self.root, &leaf.path, value.into());
    }

    #[must_use]
    pub fn get(&self, dotted: &str) -> Option<&Value> {
        let mut segments = dotted.split('.');
        let mut current = self.root.get(segments.next()?)?;
        for segment in segments {
            current = current.as_mapping()?.get(segment)?;
        }
        Some(current)
    }

    #[must_use]
    pub fn get_str(&self, dotted: &str) -> Option<&str> {
        self.get(dotted)?.as_str()
    }

    /// Set a value by dotted key, creating intermediate mappings.
    pub fn set(&mut self, dotted: &str, value: impl Into<Value>) {
        let path: Vec<Value> = dotted.split('.').map(|s| Value::String(s.to_string())).collect();
        set_path(&mut self.root, &path, value.into());
    }

    /// Remove a value by dotted key.
    pub fn remove(&mut self, dotted: &str) -> Option<Value> {
        let mut segments: Vec<&str> = dotted.split('.').collect();
        let last = segments.pop()?;
        let mut current = &mut self.root;
        for segment in segments {
            current = current.get_mut(segment)?.as_mapping_mut()?;
        }
        current.remove(last)
    }

    /// Check the keys the orchestrator depends on for `role`.
    pub fn validate(&self, role: Role) -> Result<DocumentSummary, DocumentError> {
        let missing = |key: &str| DocumentError::MissingKey {
            role: role.to_string(),
            key: key.to_string(),
        };

        let address = self
            .get("connection.info.ip")
            .or_else(|| self.get("connection.info.url"))
            .and_then(scalar_string)
            .ok_or_else(|| missing("connection.info.ip"))?;
        let port = self
            .get("connection.info.port")
            .map(|v| parse_number(v, "connection.info.port"))
            .transpose()?
            .map(|p| {
                u16::try_from(p).map_err(|_| DocumentError::InvalidValue {
                    key: "connection.info.port".to_string(),
                    reason: format!("{p} is not a valid port"),
                })
            })
            .transpose()?;

        let (num_parties, rounds) = if role.is_coordinator() {
            let num_parties = self
                .get("hyperparams.global.num_parties")
                .ok_or_else(|| missing("hyperparams.global.num_parties"))
                .and_then(|v| parse_number(v, "hyperparams.global.num_parties"))?;
            let rounds = self
                .get("hyperparams.global.rounds")
                .ok_or_else(|| missing("hyperparams.global.rounds"))
                .and_then(|v| parse_number(v, "hyperparams.global.rounds"))?;
            (Some(num_parties), Some(rounds))
        } else {
            for section in ["data", "model"] {
                if !self.get(section).is_some_and(Value::is_mapping) {
                    return Err(missing(section));
                }
            }
            (None, None)
        };

        Ok(DocumentSummary {
            address,
            port,
            num_parties,
            rounds,
            metrics_output: self.metrics_output(),
        })
    }

    /// `metrics_recorder.output_file` joined with its `output_type` extension.
    #[must_use]
    pub fn metrics_output(&self) -> Option<String> {
        let file = self.get_str("metrics_recorder.output_file")?;
        match self.get_str("metrics_recorder.output_type") {
            Some(ext) => Some(format!("{file}.{ext}")),
            None => Some(file.to_string()),
        }
    }

    /// Make the worker listen on every interface, optionally on a fixed port.
    pub fn bind_all_interfaces(&mut self, port: Option<u16>) {
        self.set("connection.info.ip", BIND_ALL);
        if let Some(port) = port {
            self.set("connection.info.port", u64::from(port));
        }
    }

    /// Point a participant at the coordinator's externally reachable URL
    /// and advertise its own URL instead of an address/port pair.
    pub fn point_at_coordinator(&mut self, coordinator_url: &str, own_url: Option<&str>) {
        self.remove("aggregator.ip");
        self.remove("aggregator.port");
        self.set("aggregator.url", coordinator_url);
        if let Some(url) = own_url {
            self.set("connection.info.url", url);
        }
    }
}

fn collect_leaves(mapping: &Mapping, prefix: &mut Vec<Value>, out: &mut Vec<Leaf>) {
    for (key, value) in mapping {
        prefix.push(key.clone());
        match value {
            Value::Mapping(inner) => collect_leaves(inner, prefix, out),
            _ => out.push(Leaf {
                key: prefix
                    .iter()
                    .map(key_to_string)
                    .collect::<Vec<_>>()
                    .join("."),
                value: value.clone(),
                path: prefix.clone(),
            }),
        }
        prefix.pop();
    }
}

fn set_path(mapping: &mut Mapping, path: &[Value], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = mapping;
    for key in parents {
        let entry = current
            .entry(key.clone())
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if !entry.is_mapping() {
            *entry = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.clone(), value);
}

fn key_to_string(key: &Value) -> String {
    scalar_string(key).unwrap_or_else(|| format!("{key:?}"))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_number(value: &Value, key: &str) -> Result<usize, DocumentError> {
    let invalid = || DocumentError::InvalidValue {
        key: key.to_string(),
        reason: format!("expected a non-negative integer, got {value:?}"),
    };
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(invalid),
        Value::String(s) => s.trim().parse().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

/// Errors raised while reading, writing, or validating a document.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("failed to read/write document {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to parse document: {0}")]
    Parse(String),
    #[error("failed to serialize document: {0}")]
    Serialize(String),
    #[error("document root must be a mapping")]
    NotAMapping,
    #[error("{role} document is missing required key '{key}'")]
    MissingKey { role: String, key: String },
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGG: &str = r"
connection:
  name: FlaskConnection
  info:
    ip: 10.0.0.1
    port: 5000
hyperparams:
  global:
    num_parties: 2
    rounds: 3
";

    const PARTY: &str = r"
aggregator:
  ip: 10.0.0.1
  port: 5000
connection:
  info:
    ip: 10.0.0.2
    port: '8085'
data:
  info:
    npz_file: /gen/data/party0.npz
model:
  spec:
    model_definition: /gen/model/compiled_keras.h5
metrics_recorder:
  output_file: /stage/metrics_party0
  output_type: json
";

    #[test]
    fn test_validate_coordinator() {
        let doc = ConfigDocument::from_yaml_str(AGG).unwrap();
        let summary = doc.validate(Role::Coordinator).unwrap();
        assert_eq!(summary.address, "10.0.0.1");
        assert_eq!(summary.port, Some(5000));
        assert_eq!(summary.num_parties, Some(2));
        assert_eq!(summary.rounds, Some(3));
    }

    #[test]
    fn test_validate_participant_reads_string_port_and_metrics() {
        let doc = ConfigDocument::from_yaml_str(PARTY).unwrap();
        let summary = doc.validate(Role::Participant(0)).unwrap();
        assert_eq!(summary.port, Some(8085));
        assert_eq!(summary.num_parties, None);
        assert_eq!(
            summary.metrics_output.as_deref(),
            Some("/stage/metrics_party0.json")
        );
    }

    #[test]
    fn test_validate_missing_keys() {
        let doc = ConfigDocument::from_yaml_str(PARTY).unwrap();
        let err = doc.validate(Role::Coordinator).unwrap_err();
        assert!(matches!(err, DocumentError::MissingKey { ref key, .. } if key == "hyperparams.global.num_parties"));

        let mut doc = ConfigDocument::from_yaml_str(PARTY).unwrap();
        doc.remove("model");
        let err = doc.validate(Role::Participant(1)).unwrap_err();
        assert!(matches!(err, DocumentError::MissingKey { ref key, .. } if key == "model"));
    }

    #[test]
    fn test_leaves_and_set_leaf() {
        let mut doc = ConfigDocument::from_yaml_str(PARTY).unwrap();
        let leaf = doc
            .leaves()
            .into_iter()
            .find(|l| l.key == "data.info.npz_file")
            .unwrap();
        assert_eq!(leaf.last_segment(), "npz_file");
        doc.set_leaf(&leaf, "/remote/party0.npz");
        assert_eq!(doc.get_str("data.info.npz_file"), Some("/remote/party0.npz"));
    }

    #[test]
    fn test_set_creates_intermediate_mappings() {
        let mut doc = ConfigDocument::default();
        doc.set("a.b.c", "x");
        assert_eq!(doc.get_str("a.b.c"), Some("x"));
        assert_eq!(doc.remove("a.b.c"), Some(Value::String("x".into())));
        assert!(doc.get("a.b.c").is_none());
    }

    #[test]
    fn test_endpoint_binding() {
        let mut doc = ConfigDocument::from_yaml_str(PARTY).unwrap();
        doc.bind_all_interfaces(Some(5000));
        doc.point_at_coordinator("https://agg.example", Some("https://party0.example"));
        assert_eq!(doc.get_str("connection.info.ip"), Some(BIND_ALL));
        assert_eq!(doc.get_str("aggregator.url"), Some("https://agg.example"));
        assert!(doc.get("aggregator.ip").is_none());
        assert!(doc.get("aggregator.port").is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config_agg.yml");
        let doc = ConfigDocument::from_yaml_str(AGG).unwrap();
        doc.save(&path).unwrap();
        assert_eq!(ConfigDocument::load(&path).unwrap(), doc);
    }

    #[test]
    fn test_non_mapping_rejected() {
        assert!(matches!(
            ConfigDocument::from_yaml_str("- a\n- b\n"),
            Err(DocumentError::NotAMapping)
        ));
    }
}
