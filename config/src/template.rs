//! `${name}` substitution for template worker documents.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::{ConfigDocument, DocumentError};

/// A worker document template with `${name}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTemplate {
    source: String,
}

/// Values substituted into a template.
pub type TemplateVars = BTreeMap<String, String>;

impl ConfigTemplate {
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| TemplateError::Io(path.to_path_buf(), e))?;
        Ok(Self { source })
    }

    /// Names of all placeholders, sorted.
    #[must_use]
    pub fn variables(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let mut rest = self.source.as_str();
        while let Some(start) = rest.find("${") {
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                break;
            };
            names.insert(after[..end].to_string());
            rest = &after[end + 1..];
        }
        names
    }

    /// Substitute placeholders. In strict mode an unknown placeholder is an
    /// error, otherwise it is left untouched.
    pub fn render_str(&self, vars: &TemplateVars, strict: bool) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        let mut rest = self.source.as_str();
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(TemplateError::Unterminated(start));
            };
            let name = &after[..end];
            match vars.get(name) {
                Some(value) => out.push_str(value),
                None if strict => return Err(TemplateError::UnknownVariable(name.to_string())),
                None => {
                    out.push_str("${");
                    out.push_str(name);
                    out.push('}');
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    pub fn render(&self, vars: &TemplateVars, strict: bool) -> Result<ConfigDocument, TemplateError> {
        let rendered = self.render_str(vars, strict)?;
        Ok(ConfigDocument::from_yaml_str(&rendered)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read template {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("unknown template variable '{0}'")]
    UnknownVariable(String),
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
    #[error(transparent)]
    Document(#[from] DocumentError),
}
