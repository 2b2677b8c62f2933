//! Export of views, functions, procedures and triggers as SQL files.
//!
//! Definitions are written verbatim in source syntax; nothing is translated.
//! Each artifact gets one file under `<export_dir>/<kind>/`, plus a
//! `manifest.json` index. Files are write-once: a rerun leaves identical
//! files alone and reports differing ones as conflicts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::core::schema::ArtifactDescriptor;
use crate::error::{MigrateError, Result};

/// Longest file stem before it is shortened with a hash suffix.
const MAX_STEM_LEN: usize = 180;

const MANIFEST_FILE: &str = "manifest.json";

/// What happened to one artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ArtifactOutcome {
    Written,
    /// Identical file already present.
    Unchanged,
    /// A different file already exists at the path; it was left untouched.
    Conflict,
    Failed { error: String },
}

/// Manifest entry for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub kind: String,
    pub schema: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Path relative to the export directory.
    pub path: String,
    /// SHA-256 of the rendered file.
    pub sha256: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub outcome: ArtifactOutcome,
}

/// Result of an export run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReport {
    pub export_dir: PathBuf,
    pub entries: Vec<ArtifactEntry>,
    /// Set when the manifest could not be written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_error: Option<String>,
}

impl ArtifactReport {
    pub fn written(&self) -> usize {
        self.count(|o| *o == ArtifactOutcome::Written)
    }

    pub fn conflicts(&self) -> usize {
        self.count(|o| *o == ArtifactOutcome::Conflict)
    }

    pub fn failures(&self) -> usize {
        self.count(|o| matches!(o, ArtifactOutcome::Failed { .. }))
    }

    /// No failures and no conflicts.
    pub fn is_clean(&self) -> bool {
        self.conflicts() == 0 && self.failures() == 0 && self.manifest_error.is_none()
    }

    fn count(&self, pred: impl Fn(&ArtifactOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }
}

/// Replace anything outside `[A-Za-z0-9_.,()-]` with `_`.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '.' | ',' | '(' | ')' | '-' => c,
            _ => '_',
        })
        .collect()
}

fn sha256_hex(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Relative path of an artifact: `<kind>/<schema>.<name>[signature].sql`.
///
/// A stem that sanitizing altered carries a hash of the raw stem, so two
/// objects never share a file.
pub fn artifact_path(artifact: &ArtifactDescriptor) -> PathBuf {
    let raw = format!(
        "{}.{}{}",
        artifact.schema,
        artifact.name,
        artifact.signature.as_deref().unwrap_or_default()
    );
    let mut stem = sanitize(&raw);
    if stem != raw {
        stem = format!("{}_{}", stem, &sha256_hex(&raw)[..8]);
    }
    if stem.chars().count() > MAX_STEM_LEN {
        let hash = sha256_hex(&stem);
        let short: String = stem.chars().take(MAX_STEM_LEN - 9).collect();
        stem = format!("{}_{}", short, &hash[..8]);
    }
    Path::new(artifact.kind.as_str()).join(format!("{}.sql", stem))
}

/// File content: metadata header, then the definition.
pub fn render(artifact: &ArtifactDescriptor) -> String {
    let mut out = String::new();
    out.push_str(&format!("-- kind: {}\n", artifact.kind));
    out.push_str(&format!("-- name: {}\n", artifact.qualified_name()));
    if let Some(sig) = &artifact.signature {
        out.push_str(&format!("-- signature: {}\n", sig));
    }
    if !artifact.depends_on.is_empty() {
        out.push_str(&format!("-- depends on: {}\n", artifact.depends_on.join(", ")));
    }
    out.push_str("-- exported verbatim from PostgreSQL; manual translation required\n\n");
    out.push_str(artifact.definition.trim_end());
    out.push('\n');
    out
}

/// Writes artifact files under one export directory.
pub struct ArtifactExporter {
    export_dir: PathBuf,
}

impl ArtifactExporter {
    pub fn new(export_dir: impl Into<PathBuf>) -> Self {
        Self {
            export_dir: export_dir.into(),
        }
    }

    /// Export every artifact. Per-artifact failures are reported, never
    /// returned as errors.
    pub async fn export(&self, artifacts: &[ArtifactDescriptor]) -> ArtifactReport {
        let mut report = ArtifactReport {
            export_dir: self.export_dir.clone(),
            ..Default::default()
        };

        for artifact in artifacts {
            let relative = artifact_path(artifact);
            let content = render(artifact);
            let outcome = match self.write_once(&relative, &content).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let e = MigrateError::Artifact {
                        name: artifact.qualified_name(),
                        message: e.to_string(),
                    };
                    warn!("{}", e);
                    ArtifactOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            if outcome == ArtifactOutcome::Conflict {
                warn!(
                    "{} {}: {} exists with different content, left untouched",
                    artifact.kind,
                    artifact.qualified_name(),
                    relative.display()
                );
            }
            debug!("{} {}: {:?}", artifact.kind, artifact.qualified_name(), outcome);

            report.entries.push(ArtifactEntry {
                kind: artifact.kind.to_string(),
                schema: artifact.schema.clone(),
                name: artifact.name.clone(),
                signature: artifact.signature.clone(),
                path: relative.to_string_lossy().replace('\\', "/"),
                sha256: sha256_hex(&content),
                depends_on: artifact.depends_on.clone(),
                outcome,
            });
        }

        if let Err(e) = self.write_manifest(&report.entries).await {
            warn!("Failed to write artifact manifest: {}", e);
            report.manifest_error = Some(e.to_string());
        }

        info!(
            "Artifacts: {} written, {} unchanged, {} conflicts, {} failed",
            report.written(),
            report.count(|o| *o == ArtifactOutcome::Unchanged),
            report.conflicts(),
            report.failures()
        );
        report
    }

    async fn write_once(&self, relative: &Path, content: &str) -> Result<ArtifactOutcome> {
        let path = self.export_dir.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match tokio::fs::read_to_string(&path).await {
            Ok(existing) if existing == content => return Ok(ArtifactOutcome::Unchanged),
            Ok(_) => return Ok(ArtifactOutcome::Conflict),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tokio::fs::write(&path, content).await?;
        Ok(ArtifactOutcome::Written)
    }

    async fn write_manifest(&self, entries: &[ArtifactEntry]) -> Result<()> {
        tokio::fs::create_dir_all(&self.export_dir).await?;
        let content = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(self.export_dir.join(MANIFEST_FILE), content).await?;
        Ok(())
    }
}
