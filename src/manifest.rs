//! Model manifest: entrypoint path and declared ports.
//!
//! The manifest's JSON schema and loader are an external collaborator (see
//! spec §1 Non-goals) — only the shape needed by the rest of the core is
//! modeled here. Filesystem resolution follows spec §6: `model_path` may
//! name an entrypoint file, a `manifest.json` file, or a directory
//! containing one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The closed set of port types a manifest can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    Stream,
    Multistream,
    Document,
    Grid,
    StreamCollection,
    DocumentCollection,
    GridCollection,
}

impl PortType {
    pub fn is_collection(self) -> bool {
        matches!(
            self,
            PortType::StreamCollection | PortType::DocumentCollection | PortType::GridCollection
        )
    }

    /// The element type of a collection port (panics if called on a
    /// non-collection type — callers must check [`is_collection`] first).
    pub fn element_type(self) -> PortType {
        match self {
            PortType::StreamCollection => PortType::Stream,
            PortType::DocumentCollection => PortType::Document,
            PortType::GridCollection => PortType::Grid,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// A single port declaration within a model's manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub port_type: PortType,
    pub direction: Direction,
    #[serde(default)]
    pub required: bool,
}

/// A single model described by the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDecl {
    pub id: String,
    pub ports: Vec<PortDecl>,
}

/// The manifest: an entrypoint path (relative to the manifest's directory)
/// and the models it exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub entrypoint: String,
    pub models: Vec<ModelDecl>,
}

impl Manifest {
    pub fn find_model(&self, model_id: &str) -> Option<&ModelDecl> {
        self.models.iter().find(|m| m.id == model_id)
    }

    /// Ports declared as required but absent from the supplied binding
    /// names. Used by the HTTP facade to emit the missing-required-port
    /// warning (spec §4.7, §8 scenario 2) without failing the job.
    pub fn missing_required_ports<'a>(
        &'a self,
        model_id: &str,
        supplied: &std::collections::HashSet<String>,
    ) -> Vec<&'a str> {
        self.find_model(model_id)
            .map(|model| {
                model
                    .ports
                    .iter()
                    .filter(|p| p.required && !supplied.contains(&p.name))
                    .map(|p| p.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("model path does not exist: {0}")]
    NotFound(PathBuf),
    #[error("failed to read manifest at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The resolved manifest plus the absolute, on-disk entrypoint path.
pub struct LoadedManifest {
    pub manifest: Manifest,
    pub entrypoint_path: PathBuf,
}

/// Resolve `model_path` to a `manifest.json` location, following spec §6:
/// - a directory: expect `manifest.json` inside it;
/// - a file not named `manifest.json`: expect a sibling `manifest.json`;
/// - a file named `manifest.json`: use it directly.
pub fn resolve_manifest_path(model_path: &Path) -> Result<PathBuf, ManifestError> {
    if !model_path.exists() {
        return Err(ManifestError::NotFound(model_path.to_path_buf()));
    }

    if model_path.is_dir() {
        return Ok(model_path.join("manifest.json"));
    }

    if model_path.file_name().and_then(|n| n.to_str()) == Some("manifest.json") {
        return Ok(model_path.to_path_buf());
    }

    Ok(model_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("manifest.json"))
}

/// Load the manifest for the given `model_path` and resolve its entrypoint
/// to an absolute path relative to the manifest's directory.
pub fn load_manifest(model_path: &Path) -> Result<LoadedManifest, ManifestError> {
    let manifest_path = resolve_manifest_path(model_path)?;

    let contents =
        std::fs::read_to_string(&manifest_path).map_err(|source| ManifestError::Io {
            path: manifest_path.clone(),
            source,
        })?;
    let manifest: Manifest =
        serde_json::from_str(&contents).map_err(|source| ManifestError::Parse {
            path: manifest_path.clone(),
            source,
        })?;

    let manifest_dir = manifest_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let entrypoint_path = manifest_dir.join(&manifest.entrypoint);

    Ok(LoadedManifest {
        manifest,
        entrypoint_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn sample_manifest_json() -> &'static str {
        r#"{
            "entrypoint": "model.py",
            "models": [
                { "id": "echo", "ports": [
                    { "name": "in", "type": "document", "direction": "input", "required": true },
                    { "name": "out", "type": "document", "direction": "output", "required": true }
                ] }
            ]
        }"#
    }

    #[test]
    fn resolves_directory_to_manifest_json() {
        let dir = tempdir().unwrap();
        let resolved = resolve_manifest_path(dir.path()).unwrap();
        assert_eq!(resolved, dir.path().join("manifest.json"));
    }

    #[test]
    fn resolves_sibling_manifest_for_non_manifest_file() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("model.py");
        fs::write(&entry, "# model").unwrap();
        let resolved = resolve_manifest_path(&entry).unwrap();
        assert_eq!(resolved, dir.path().join("manifest.json"));
    }

    #[test]
    fn resolves_manifest_json_directly() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("manifest.json");
        fs::write(&entry, sample_manifest_json()).unwrap();
        let resolved = resolve_manifest_path(&entry).unwrap();
        assert_eq!(resolved, entry);
    }

    #[test]
    fn missing_path_errors() {
        let err = resolve_manifest_path(Path::new("/nonexistent/path/xyz"));
        assert!(matches!(err, Err(ManifestError::NotFound(_))));
    }

    #[test]
    fn loads_manifest_and_resolves_entrypoint_relative_to_dir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("manifest.json"), sample_manifest_json()).unwrap();
        fs::write(dir.path().join("model.py"), "# model").unwrap();

        let loaded = load_manifest(dir.path()).unwrap();
        assert_eq!(loaded.entrypoint_path, dir.path().join("model.py"));
        assert_eq!(loaded.manifest.models.len(), 1);
        assert_eq!(loaded.manifest.models[0].id, "echo");
    }

    #[test]
    fn missing_required_ports_lists_only_missing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("manifest.json"), sample_manifest_json()).unwrap();
        fs::write(dir.path().join("model.py"), "# model").unwrap();
        let loaded = load_manifest(dir.path()).unwrap();

        let mut supplied = std::collections::HashSet::new();
        supplied.insert("in".to_string());

        let missing = loaded.manifest.missing_required_ports("echo", &supplied);
        assert_eq!(missing, vec!["out"]);
    }
}
