//! Certificate generation: locate, stage, fill, sign, flatten, promote.
//!
//! Work happens on `<prefix>/staging/<name>`. Only a fully signed and
//! flattened document is written to `<prefix>/<name>`, so a crash or a
//! failed step never replaces a previously good artifact with a partial one.

use std::sync::Arc;

use chrono::NaiveDate;

use crate::config::DocumentConfig;
use crate::documents::flatten::{Rasterizer, rebuild_from_pages};
use crate::documents::form::{CertificateHolder, fill_holder_fields};
use crate::documents::locate::{CertificateKind, DocumentSource, LocatedCertificate, locate};
use crate::documents::signature::stamp_signature;
use crate::documents::storage::ObjectStore;
use crate::error::DocumentError;

/// Outcome of one generation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedCertificates {
    /// Every located certificate, main first. Names, not keys.
    pub files: Vec<String>,
    /// The subset that was signed, flattened and promoted.
    pub promoted: Vec<String>,
}

pub struct CertificateGenerator {
    source: Arc<dyn DocumentSource>,
    store: Arc<dyn ObjectStore>,
    rasterizer: Arc<dyn Rasterizer>,
    prefix: String,
    signature_key: String,
    scale: f32,
}

impl CertificateGenerator {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        store: Arc<dyn ObjectStore>,
        rasterizer: Arc<dyn Rasterizer>,
        config: &DocumentConfig,
    ) -> Self {
        Self {
            source,
            store,
            rasterizer,
            prefix: config.prefix.trim_end_matches('/').to_string(),
            signature_key: config.signature_key.clone(),
            scale: config.flatten_scale,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Final storage key for a certificate file.
    pub fn artifact_key(&self, name: &str) -> String {
        format!("{}/{name}", self.prefix)
    }

    fn staging_key(&self, name: &str) -> String {
        format!("{}/staging/{name}", self.prefix)
    }

    /// Produce signed, flattened certificates for `insured` made out to
    /// `holder`.
    ///
    /// Only the source search failing is an error. Per-file failures are
    /// logged and leave that file unpromoted.
    pub async fn generate(
        &self,
        insured: &str,
        holder: &CertificateHolder,
        today: NaiveDate,
    ) -> Result<GeneratedCertificates, DocumentError> {
        let mut located = locate(self.source.as_ref(), insured).await?;
        if located.is_empty() {
            tracing::warn!(insured, "No source certificates found");
            return Ok(GeneratedCertificates::default());
        }
        located.sort_by_key(|c| c.kind == CertificateKind::Supplementary);

        let mut staged: Vec<&LocatedCertificate> = Vec::new();
        for cert in &located {
            match self.stage(&cert.name).await {
                Ok(()) => staged.push(cert),
                Err(e) => tracing::warn!(file = %cert.name, error = %e, "Failed to stage certificate"),
            }
        }

        let signature = self.load_signature().await;

        let mut promoted = Vec::new();
        for cert in staged {
            if cert.kind == CertificateKind::Main
                && let Err(e) = self.fill(&cert.name, holder, today).await
            {
                tracing::error!(file = %cert.name, error = %e, "Failed to fill holder fields; continuing to sign");
            }
            match self.sign_and_flatten(&cert.name, signature.as_deref()).await {
                Ok(()) => {
                    tracing::info!(file = %cert.name, kind = ?cert.kind, "Certificate generated");
                    promoted.push(cert.name.clone());
                }
                Err(e) => {
                    tracing::error!(file = %cert.name, error = %e, "Failed to sign and flatten certificate");
                }
            }
        }

        Ok(GeneratedCertificates {
            files: located.into_iter().map(|c| c.name).collect(),
            promoted,
        })
    }

    async fn stage(&self, name: &str) -> Result<(), DocumentError> {
        let bytes = self.source.fetch(name).await?;
        self.store.put(&self.staging_key(name), bytes).await
    }

    async fn fill(
        &self,
        name: &str,
        holder: &CertificateHolder,
        today: NaiveDate,
    ) -> Result<(), DocumentError> {
        let key = self.staging_key(name);
        let pdf = self.store.get(&key).await?;
        let filled = fill_holder_fields(&pdf, holder, today)?;
        self.store.put(&key, filled).await
    }

    async fn load_signature(&self) -> Option<Vec<u8>> {
        match self.store.get(&self.signature_key).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(key = %self.signature_key, error = %e, "Signature image unavailable; flattening without it");
                None
            }
        }
    }

    async fn sign_and_flatten(&self, name: &str, signature: Option<&[u8]>) -> Result<(), DocumentError> {
        let staging = self.staging_key(name);
        let mut pdf = self.store.get(&staging).await?;

        if let Some(png) = signature {
            match stamp_signature(&pdf, png) {
                Ok(signed) => pdf = signed,
                Err(e) => tracing::warn!(file = %name, error = %e, "Could not stamp signature; flattening unsigned"),
            }
        }

        let pages = self.rasterizer.rasterize(&pdf, self.scale).await?;
        let flat = rebuild_from_pages(&pages, self.scale)?;

        self.store.put(&self.artifact_key(name), flat).await?;
        if let Err(e) = self.store.delete(&staging).await {
            tracing::debug!(key = %staging, error = %e, "Failed to clear staging copy");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::documents::fixtures;
    use crate::documents::form::read_form_fields;
    use crate::documents::storage::MemoryObjectStore;

    struct MapSource(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl DocumentSource for MapSource {
        async fn search(&self, insured: &str) -> Result<Vec<String>, DocumentError> {
            let needle = insured.to_lowercase();
            let mut names: Vec<String> = self
                .0
                .keys()
                .filter(|n| n.to_lowercase().contains(&needle))
                .cloned()
                .collect();
            names.sort();
            Ok(names)
        }

        async fn fetch(&self, name: &str) -> Result<Vec<u8>, DocumentError> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| DocumentError::NotFound(name.to_string()))
        }
    }

    /// Records what it was asked to render and returns one page per call.
    #[derive(Default)]
    struct RecordingRasterizer {
        seen: Mutex<Vec<Vec<u8>>>,
        fail_when_contains: Option<&'static [u8]>,
    }

    #[async_trait]
    impl Rasterizer for RecordingRasterizer {
        async fn rasterize(&self, pdf: &[u8], _scale: f32) -> Result<Vec<Vec<u8>>, DocumentError> {
            if let Some(marker) = self.fail_when_contains
                && pdf.windows(marker.len()).any(|w| w == marker)
            {
                return Err(DocumentError::Rasterize("boom".into()));
            }
            self.seen.lock().unwrap().push(pdf.to_vec());
            Ok(vec![fixtures::png(20, 20)])
        }
    }

    fn config() -> DocumentConfig {
        DocumentConfig {
            source_dir: PathBuf::from("/unused"),
            storage_dir: PathBuf::from("/unused"),
            prefix: "certificates".into(),
            signature_key: "certificates/signature.png".into(),
            pdftoppm: PathBuf::from("pdftoppm"),
            flatten_scale: 2.0,
        }
    }

    fn holder() -> CertificateHolder {
        CertificateHolder {
            name: "Acme Logistics".into(),
            address_line_1: "123 Main St".into(),
            address_line_2: "Springfield, IL 60001".into(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 7).unwrap()
    }

    fn generator(
        files: &[(&str, Vec<u8>)],
        store: Arc<MemoryObjectStore>,
        rasterizer: Arc<RecordingRasterizer>,
    ) -> CertificateGenerator {
        let source = MapSource(
            files
                .iter()
                .map(|(n, b)| (n.to_string(), b.clone()))
                .collect(),
        );
        CertificateGenerator::new(Arc::new(source), store, rasterizer, &config())
    }

    #[tokio::test]
    async fn main_and_supplementary_are_promoted() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("certificates/signature.png", fixtures::png(200, 100))
            .await
            .unwrap();
        let rasterizer = Arc::new(RecordingRasterizer::default());
        let generator_ = generator(
            &[
                ("RAPID TRUCKING INC additional.pdf", fixtures::form_pdf(612, 792, &[])),
                ("RAPID TRUCKING INC.pdf", fixtures::form_pdf(612, 792, &[])),
            ],
            store.clone(),
            rasterizer.clone(),
        );

        let out = generator_
            .generate("Rapid Trucking", &holder(), today())
            .await
            .unwrap();

        assert_eq!(
            out.files,
            vec!["RAPID TRUCKING INC.pdf", "RAPID TRUCKING INC additional.pdf"]
        );
        assert_eq!(out.promoted, out.files);
        assert_eq!(
            store.keys().await,
            vec![
                "certificates/RAPID TRUCKING INC additional.pdf",
                "certificates/RAPID TRUCKING INC.pdf",
                "certificates/signature.png",
            ]
        );

        // The main file reached the rasterizer filled; the supplementary did not.
        let seen = rasterizer.seen.lock().unwrap();
        let main_fields = read_form_fields(&seen[0]).unwrap();
        assert_eq!(main_fields["CertificateHolder_FullName_A"], "Acme Logistics");
        assert_eq!(main_fields["Form_CompletionDate_A"], "03/07/2024");
        let supp_fields = read_form_fields(&seen[1]).unwrap();
        assert_eq!(supp_fields["CertificateHolder_FullName_A"], "");
    }

    #[tokio::test]
    async fn missing_signature_still_flattens() {
        let store = Arc::new(MemoryObjectStore::new());
        let rasterizer = Arc::new(RecordingRasterizer::default());
        let generator_ = generator(
            &[("Acme Carrier.pdf", fixtures::form_pdf(612, 792, &[]))],
            store.clone(),
            rasterizer,
        );

        let out = generator_.generate("acme", &holder(), today()).await.unwrap();
        assert_eq!(out.promoted, vec!["Acme Carrier.pdf"]);
        assert!(store.exists("certificates/Acme Carrier.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn fill_failure_still_signs_and_flattens() {
        let store = Arc::new(MemoryObjectStore::new());
        let rasterizer = Arc::new(RecordingRasterizer::default());
        // A PDF with pages but no AcroForm cannot be filled.
        let no_form = rebuild_from_pages(&[fixtures::png(10, 10)], 1.0).unwrap();
        let generator_ = generator(&[("Acme.pdf", no_form)], store.clone(), rasterizer.clone());

        let out = generator_.generate("acme", &holder(), today()).await.unwrap();
        assert_eq!(out.promoted, vec!["Acme.pdf"]);
        assert_eq!(rasterizer.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flatten_failure_keeps_previous_artifact() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("certificates/Acme.pdf", b"previous good".to_vec())
            .await
            .unwrap();
        let rasterizer = Arc::new(RecordingRasterizer {
            fail_when_contains: Some(&b"%PDF"[..]),
            ..Default::default()
        });
        let generator_ = generator(
            &[("Acme.pdf", fixtures::form_pdf(612, 792, &[]))],
            store.clone(),
            rasterizer,
        );

        let out = generator_.generate("acme", &holder(), today()).await.unwrap();
        assert_eq!(out.files, vec!["Acme.pdf"]);
        assert!(out.promoted.is_empty());
        assert_eq!(
            store.get("certificates/Acme.pdf").await.unwrap(),
            b"previous good"
        );
        // The filled but unflattened copy stays in staging only.
        assert!(store.exists("certificates/staging/Acme.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn one_bad_file_does_not_block_the_other() {
        let store = Arc::new(MemoryObjectStore::new());
        let rasterizer = Arc::new(RecordingRasterizer {
            fail_when_contains: Some(&b"not a pdf"[..]),
            ..Default::default()
        });
        let generator_ = generator(
            &[
                ("Acme.pdf", fixtures::form_pdf(612, 792, &[])),
                ("Acme additional.pdf", b"not a pdf at all".to_vec()),
            ],
            store.clone(),
            rasterizer,
        );

        let out = generator_.generate("acme", &holder(), today()).await.unwrap();
        assert_eq!(out.files, vec!["Acme.pdf", "Acme additional.pdf"]);
        assert_eq!(out.promoted, vec!["Acme.pdf"]);
        assert!(store.exists("certificates/Acme.pdf").await.unwrap());
        assert!(!store.exists("certificates/Acme additional.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn nothing_found_is_empty_result() {
        let store = Arc::new(MemoryObjectStore::new());
        let generator_ = generator(&[], store, Arc::new(RecordingRasterizer::default()));
        let out = generator_.generate("nobody", &holder(), today()).await.unwrap();
        assert!(out.files.is_empty());
        assert!(out.promoted.is_empty());
    }
}
