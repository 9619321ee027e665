//! Artifact staging.
//!
//! Rewrites path-valued leaves of worker documents so they point into the
//! target's staging directory, copies the referenced files into the local
//! trial directory (once per trial, however many roles share them), and
//! builds the per-role manifest of files to push.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use fedrun_config::{ConfigDocument, DocumentError, Role};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Dataset references are recognised by a marker substring and resolved
/// against a base directory when relative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRoot {
    #[serde(default = "default_dataset_marker")]
    pub marker: String,
    pub base: PathBuf,
}

fn default_dataset_marker() -> String {
    "examples/datasets".to_string()
}

/// One role's document and where it will live on its target.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub role: Role,
    pub document: ConfigDocument,
    /// Staging directory on the target.
    pub staging_dir: String,
}

/// Files each role needs on its target, keyed by role tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, Vec<PathBuf>>,
}

impl Manifest {
    #[must_use]
    pub fn files(&self, role: Role) -> &[PathBuf] {
        self.entries.get(&role.tag()).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stages the documents of one trial.
pub struct Stager {
    generated_dir: PathBuf,
    dataset_roots: Vec<DatasetRoot>,
    local_dir: PathBuf,
    /// Source path -> staged copy in `local_dir`.
    copied: HashMap<PathBuf, PathBuf>,
}

impl Stager {
    #[must_use]
    pub fn new(generated_dir: impl Into<PathBuf>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            generated_dir: generated_dir.into(),
            dataset_roots: Vec::new(),
            local_dir: local_dir.into(),
            copied: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_dataset_roots(mut self, roots: Vec<DatasetRoot>) -> Self {
        self.dataset_roots = roots;
        self
    }

    /// Local source of a staged reference, or `None` for any other value.
    #[must_use]
    pub fn resolve(&self, value: &str) -> Option<PathBuf> {
        let path = Path::new(value);
        if !self.generated_dir.as_os_str().is_empty() && path.starts_with(&self.generated_dir) {
            return Some(path.to_path_buf());
        }
        let root = self
            .dataset_roots
            .iter()
            .find(|root| value.contains(&root.marker))?;
        Some(if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.base.join(path)
        })
    }

    /// Stage every document, persist the rewritten documents into the local
    /// trial directory, and return the manifest.
    ///
    /// Every referenced input is checked before anything is copied, so a
    /// missing artifact leaves no partial trial directory behind.
    pub fn stage(&mut self, requests: &mut [StageRequest]) -> Result<Manifest, StageError> {
        for request in requests.iter() {
            self.check_inputs(request)?;
        }
        std::fs::create_dir_all(&self.local_dir)
            .map_err(|e| StageError::Io(self.local_dir.clone(), e))?;

        let mut manifest = Manifest::default();
        for request in requests.iter_mut() {
            let mut files = self.rewrite(request)?;
            let config_path = self.local_dir.join(request.role.config_file_name());
            request.document.save(&config_path)?;
            files.insert(0, config_path);
            tracing::debug!("Staged {} files for {}", files.len(), request.role);
            manifest.entries.insert(request.role.tag(), files);
        }
        Ok(manifest)
    }

    fn check_inputs(&self, request: &StageRequest) -> Result<(), StageError> {
        for leaf in request.document.leaves() {
            if is_output_key(leaf.last_segment()) {
                continue;
            }
            let Some(value) = leaf.value.as_str() else {
                continue;
            };
            if let Some(source) = self.resolve(value)
                && !source.exists()
            {
                return Err(StageError::MissingArtifact {
                    role: request.role.to_string(),
                    key: leaf.key.clone(),
                    path: source,
                });
            }
        }
        Ok(())
    }

    /// Rewrite one document in place, returning the staged inputs it needs.
    fn rewrite(&mut self, request: &mut StageRequest) -> Result<Vec<PathBuf>, StageError> {
        let staging = request.staging_dir.trim_end_matches('/').to_string();
        let mut files = Vec::new();
        for leaf in request.document.leaves() {
            let Some(value) = leaf.value.as_str() else {
                continue;
            };
            let Some(source) = self.resolve(value) else {
                continue;
            };
            let Some(name) = source.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if !is_output_key(leaf.last_segment()) {
                let staged = self.copy_once(&source, &name)?;
                if !files.contains(&staged) {
                    files.push(staged);
                }
            }
            request
                .document
                .set_leaf(&leaf, format!("{staging}/{name}"));
        }
        Ok(files)
    }

    fn copy_once(&mut self, source: &Path, name: &str) -> Result<PathBuf, StageError> {
        if let Some(staged) = self.copied.get(source) {
            return Ok(staged.clone());
        }
        let dest = self.local_dir.join(name);
        if let Some((first, _)) = self.copied.iter().find(|(_, staged)| **staged == dest) {
            return Err(StageError::NameCollision {
                name: name.to_string(),
                first: first.clone(),
                second: source.to_path_buf(),
            });
        }
        copy_path(source, &dest).map_err(|e| StageError::Io(source.to_path_buf(), e))?;
        self.copied.insert(source.to_path_buf(), dest.clone());
        Ok(dest)
    }

    /// Number of distinct artifacts copied so far.
    #[must_use]
    pub fn copied_count(&self) -> usize {
        self.copied.len()
    }
}

/// Keys naming files the worker writes rather than reads.
fn is_output_key(segment: &str) -> bool {
    segment.contains("output")
}

/// Copy a file, or a directory tree, to `dest`.
pub(crate) fn copy_path(source: &Path, dest: &Path) -> std::io::Result<()> {
    if !source.is_dir() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, dest)?;
        return Ok(());
    }
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{role} references missing artifact {} (key '{key}')", path.display())]
    MissingArtifact {
        role: String,
        key: String,
        path: PathBuf,
    },
    #[error("{} and {} would both be staged as '{name}'", first.display(), second.display())]
    NameCollision {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("failed to stage {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

#[cfg(test)]
mod tests {
    use tempfile::{TempDir, tempdir};

    use super::*;

    struct Fixture {
        _dir: TempDir,
        generated: PathBuf,
        local: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let generated = dir.path().join("generated");
        std::fs::create_dir_all(generated.join("data")).unwrap();
        std::fs::create_dir_all(generated.join("model/weights")).unwrap();
        std::fs::write(generated.join("data/party0.npz"), b"p0").unwrap();
        std::fs::write(generated.join("data/party1.npz"), b"p1").unwrap();
        std::fs::write(generated.join("model/weights/w.bin"), b"w").unwrap();
        let local = dir.path().join("trial1");
        Fixture {
            _dir: dir,
            generated,
            local,
        }
    }

    fn party_doc(generated: &Path, index: usize) -> ConfigDocument {
        let g = generated.display();
        ConfigDocument::from_yaml_str(&format!(
            r"
connection:
  info:
    ip: 10.0.0.{index}
data:
  info:
    npz_file: {g}/data/party{index}.npz
model:
  spec:
    model_definition: {g}/model/weights
metrics_recorder:
  output_file: {g}/metrics_party{index}
  output_type: json
"
        ))
        .unwrap()
    }

    fn request(role: Role, document: ConfigDocument) -> StageRequest {
        StageRequest {
            role,
            document,
            staging_dir: format!("/remote/{}", role.tag()),
        }
    }

    #[test]
    fn test_no_generated_prefix_remains() {
        let f = fixture();
        let mut stager = Stager::new(&f.generated, &f.local);
        let mut requests = vec![
            request(Role::Participant(0), party_doc(&f.generated, 0)),
            request(Role::Participant(1), party_doc(&f.generated, 1)),
        ];
        stager.stage(&mut requests).unwrap();

        let prefix = f.generated.display().to_string();
        for request in &requests {
            for (key, value) in request.document.string_leaves() {
                assert!(!value.contains(&prefix), "{key} still points at {value}");
            }
        }
        assert_eq!(
            requests[1].document.get_str("data.info.npz_file"),
            Some("/remote/party1/party1.npz")
        );
    }

    #[test]
    fn test_shared_artifact_copied_once() {
        let f = fixture();
        let mut stager = Stager::new(&f.generated, &f.local);
        let mut requests = vec![
            request(Role::Participant(0), party_doc(&f.generated, 0)),
            request(Role::Participant(1), party_doc(&f.generated, 1)),
        ];
        let manifest = stager.stage(&mut requests).unwrap();

        // Two datasets plus one shared model directory.
        assert_eq!(stager.copied_count(), 3);
        assert!(f.local.join("weights/w.bin").exists());
        let shared = f.local.join("weights");
        assert!(manifest.files(Role::Participant(0)).contains(&shared));
        assert!(manifest.files(Role::Participant(1)).contains(&shared));
    }

    #[test]
    fn test_output_keys_rewritten_but_not_shipped() {
        let f = fixture();
        let mut stager = Stager::new(&f.generated, &f.local);
        let mut requests = vec![request(Role::Participant(0), party_doc(&f.generated, 0))];
        let manifest = stager.stage(&mut requests).unwrap();

        assert_eq!(
            requests[0].document.get_str("metrics_recorder.output_file"),
            Some("/remote/party0/metrics_party0")
        );
        let files = manifest.files(Role::Participant(0));
        assert_eq!(files[0], f.local.join("config_party0.yml"));
        assert!(files.iter().all(|p| !p.ends_with("metrics_party0")));
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn test_missing_artifact_aborts_before_copying() {
        let f = fixture();
        std::fs::remove_file(f.generated.join("data/party1.npz")).unwrap();
        let mut stager = Stager::new(&f.generated, &f.local);
        let mut requests = vec![
            request(Role::Participant(0), party_doc(&f.generated, 0)),
            request(Role::Participant(1), party_doc(&f.generated, 1)),
        ];
        let err = stager.stage(&mut requests).unwrap_err();
        assert!(
            matches!(err, StageError::MissingArtifact { ref key, .. } if key == "data.info.npz_file")
        );
        assert!(!f.local.exists());
    }

    #[test]
    fn test_dataset_root_resolution() {
        let f = fixture();
        let base = f.generated.parent().unwrap().to_path_buf();
        std::fs::create_dir_all(base.join("examples/datasets")).unwrap();
        std::fs::write(base.join("examples/datasets/mnist.npz"), b"m").unwrap();

        let mut doc = party_doc(&f.generated, 0);
        doc.set("data.info.npz_file", "examples/datasets/mnist.npz");
        let mut stager = Stager::new(&f.generated, &f.local).with_dataset_roots(vec![DatasetRoot {
            marker: default_dataset_marker(),
            base,
        }]);
        let mut requests = vec![request(Role::Participant(0), doc)];
        stager.stage(&mut requests).unwrap();

        assert_eq!(
            requests[0].document.get_str("data.info.npz_file"),
            Some("/remote/party0/mnist.npz")
        );
        assert!(f.local.join("mnist.npz").exists());
    }

    #[test]
    fn test_name_collision() {
        let f = fixture();
        std::fs::create_dir_all(f.generated.join("other")).unwrap();
        std::fs::write(f.generated.join("other/party0.npz"), b"x").unwrap();
        let mut first = party_doc(&f.generated, 0);
        let mut second = party_doc(&f.generated, 1);
        first.remove("model");
        second.remove("model");
        second.set(
            "data.info.npz_file",
            f.generated.join("other/party0.npz").display().to_string(),
        );
        let mut stager = Stager::new(&f.generated, &f.local);
        let mut requests = vec![
            request(Role::Participant(0), first),
            request(Role::Participant(1), second),
        ];
        assert!(matches!(
            stager.stage(&mut requests),
            Err(StageError::NameCollision { .. })
        ));
    }
}
