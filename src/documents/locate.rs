//! Locating an insured's source certificates.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::DocumentError;

/// At most this many matches are taken from the source per request.
pub const MAX_SOURCE_MATCHES: usize = 2;

/// Filename marker for supplementary certificates.
const SUPPLEMENTARY_MARKER: &str = "additional";

/// Whether a certificate gets holder fields filled or is only signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    Main,
    Supplementary,
}

impl CertificateKind {
    pub fn classify(file_name: &str) -> Self {
        if file_name.to_lowercase().contains(SUPPLEMENTARY_MARKER) {
            Self::Supplementary
        } else {
            Self::Main
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedCertificate {
    pub name: String,
    pub kind: CertificateKind,
}

/// The external store holding blank, per-insured certificates.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// File names containing `insured` (case-insensitive), in listing order.
    async fn search(&self, insured: &str) -> Result<Vec<String>, DocumentError>;

    async fn fetch(&self, name: &str) -> Result<Vec<u8>, DocumentError>;
}

/// A local directory of certificates.
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DocumentSource for DirectorySource {
    async fn search(&self, insured: &str) -> Result<Vec<String>, DocumentError> {
        let needle = insured.to_lowercase();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| DocumentError::Source(format!("{}: {e}", self.dir.display())))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.to_lowercase().contains(&needle) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn fetch(&self, name: &str) -> Result<Vec<u8>, DocumentError> {
        if name.contains('/') || name.contains('\\') || name == ".." {
            return Err(DocumentError::Source(format!("invalid file name '{name}'")));
        }
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DocumentError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Search the source for an insured's certificates.
///
/// The match list is capped before non-PDF names are dropped, so a stray
/// non-PDF match still uses up one of the slots.
pub async fn locate(
    source: &dyn DocumentSource,
    insured: &str,
) -> Result<Vec<LocatedCertificate>, DocumentError> {
    let insured = insured.trim();
    if insured.is_empty() {
        return Ok(Vec::new());
    }

    let matches = source.search(insured).await?;
    if matches.len() > MAX_SOURCE_MATCHES {
        tracing::info!(
            insured,
            found = matches.len(),
            "More certificates matched than allowed; keeping the first {MAX_SOURCE_MATCHES}"
        );
    }

    Ok(matches
        .into_iter()
        .take(MAX_SOURCE_MATCHES)
        .filter(|name| {
            let is_pdf = name.to_lowercase().ends_with(".pdf");
            if !is_pdf {
                tracing::debug!(name, "Skipping non-PDF source file");
            }
            is_pdf
        })
        .map(|name| LocatedCertificate {
            kind: CertificateKind::classify(&name),
            name,
        })
        .collect())
}
