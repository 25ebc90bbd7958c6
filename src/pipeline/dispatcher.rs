//! Generate-and-deliver for an approved request.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tracing::{error, info};

use crate::documents::{CertificateGenerator, CertificateHolder};
use crate::error::PipelineError;
use crate::pipeline::approval::CoiFulfillment;
use crate::pipeline::delivery::{CoiMailer, DeliveryJob, DeliveryReceipt};
use crate::pipeline::flow::FlowLog;
use crate::pipeline::types::GenerateRequest;

pub struct CoiDispatcher {
    generator: Arc<CertificateGenerator>,
    mailer: CoiMailer,
    flow: FlowLog,
}

impl CoiDispatcher {
    pub fn new(generator: Arc<CertificateGenerator>, mailer: CoiMailer, flow: FlowLog) -> Self {
        Self {
            generator,
            mailer,
            flow,
        }
    }

    /// One generator run, then one delivery attempt with the certificates
    /// promoted by that run. An artifact left from an earlier request is
    /// never attached.
    pub async fn run(&self, request: &GenerateRequest) -> Result<DeliveryReceipt, PipelineError> {
        let thread_id = request.thread_id.as_str();
        let holder = CertificateHolder {
            name: request.holder_name.clone(),
            address_line_1: request.holder_addr_1.clone(),
            address_line_2: request.holder_addr_2.clone(),
        };

        let generated = match self
            .generator
            .generate(&request.insured_name, &holder, Local::now().date_naive())
            .await
        {
            Ok(generated) => generated,
            Err(e) => {
                error!(thread_id, insured = %request.insured_name, error = %e, "Certificate generation failed");
                self.flow.error(thread_id, "generator", "generate", &e.to_string()).await;
                return Err(e.into());
            }
        };
        info!(
            thread_id,
            files = generated.files.len(),
            promoted = generated.promoted.len(),
            "Certificates generated"
        );
        self.flow
            .ok(
                thread_id,
                "generator",
                "generate",
                serde_json::json!({ "files": generated.files, "promoted": generated.promoted }),
            )
            .await;

        let job = DeliveryJob {
            thread_id: request.thread_id.clone(),
            subject: request.subject_text.clone(),
            send_to_email: request.send_to_email.clone(),
            to_emails: request.to_emails.clone(),
            cc_emails: request.cc_emails.clone(),
            last_message_id: request.last_message_id.clone(),
            attachment_keys: generated
                .promoted
                .iter()
                .map(|name| self.generator.artifact_key(name))
                .collect(),
        };

        match self.mailer.deliver(&job).await {
            Ok(receipt) => {
                self.flow
                    .ok(
                        thread_id,
                        "delivery",
                        "send",
                        serde_json::json!({
                            "id": receipt.id,
                            "to": receipt.to,
                            "cc": receipt.cc,
                            "attachments": receipt.attached,
                        }),
                    )
                    .await;
                Ok(receipt)
            }
            Err(e) => {
                error!(thread_id, error = %e, "Certificate delivery failed");
                self.flow.error(thread_id, "delivery", "send", &e.to_string()).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CoiFulfillment for CoiDispatcher {
    async fn fulfill(&self, request: GenerateRequest) -> Result<(), PipelineError> {
        self.run(&request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::{DeliveryMode, DocumentConfig};
    use crate::documents::{
        DocumentSource, MemoryObjectStore, ObjectStore, Rasterizer, fixtures, read_form_fields,
    };
    use crate::error::DocumentError;
    use crate::pipeline::delivery::testing::RecordingSender;
    use crate::store::{Database, FlowStatus, LibSqlBackend};

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

    /// Renders one small white page regardless of input.
    struct BlankRasterizer;

    #[async_trait]
    impl Rasterizer for BlankRasterizer {
        async fn rasterize(&self, _pdf: &[u8], _scale: f32) -> Result<Vec<Vec<u8>>, DocumentError> {
            Ok(vec![fixtures::png(20, 20)])
        }
    }

    fn config() -> DocumentConfig {
        DocumentConfig {
            source_dir: "unused".into(),
            storage_dir: "unused".into(),
            prefix: "certificates".into(),
            signature_key: "certificates/signature.png".into(),
            pdftoppm: "pdftoppm".into(),
            flatten_scale: 1.0,
        }
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            insured_name: "RAPID TRUCKING".into(),
            holder_name: "Acme Logistics".into(),
            holder_addr_1: "123 Main St".into(),
            holder_addr_2: "Springfield, IL 60001".into(),
            send_to_email: "certs@acme.example".into(),
            to_emails: vec!["agency@agency.example".into()],
            cc_emails: vec![],
            last_message_id: "<m1@acme.example>".into(),
            thread_id: "T1".into(),
            subject_text: "URGENT need COI".into(),
            body_text: String::new(),
        }
    }

    /// Every rasterization fails, so nothing is ever promoted.
    struct BrokenRasterizer;

    #[async_trait]
    impl Rasterizer for BrokenRasterizer {
        async fn rasterize(&self, _pdf: &[u8], _scale: f32) -> Result<Vec<Vec<u8>>, DocumentError> {
            Err(DocumentError::Rasterize("pdftoppm exited with status 1".into()))
        }
    }

    async fn dispatcher(
        files: &[&str],
        sender: Arc<RecordingSender>,
    ) -> (CoiDispatcher, Arc<MemoryObjectStore>, Arc<dyn Database>) {
        dispatcher_with(files, sender, Arc::new(BlankRasterizer)).await
    }

    async fn dispatcher_with(
        files: &[&str],
        sender: Arc<RecordingSender>,
        rasterizer: Arc<dyn Rasterizer>,
    ) -> (CoiDispatcher, Arc<MemoryObjectStore>, Arc<dyn Database>) {
        let source = MapSource(
            files
                .iter()
                .map(|n| (n.to_string(), fixtures::form_pdf(612, 792, &[])))
                .collect(),
        );
        let store = Arc::new(MemoryObjectStore::new());
        let generator = Arc::new(CertificateGenerator::new(
            Arc::new(source),
            store.clone(),
            rasterizer,
            &config(),
        ));
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.run_migrations().await.unwrap();
        let mailer = CoiMailer::new(sender, store.clone(), "agency@agency.example", DeliveryMode::Send);
        (
            CoiDispatcher::new(generator, mailer, FlowLog::new(Arc::clone(&db))),
            store,
            db,
        )
    }

    #[tokio::test]
    async fn generates_and_sends_all_located_files() {
        let sender = Arc::new(RecordingSender::default());
        let (dispatcher, store, db) = dispatcher(
            &["RAPID TRUCKING COI.pdf", "RAPID TRUCKING additional insured.pdf"],
            sender.clone(),
        )
        .await;

        let receipt = dispatcher.run(&request()).await.unwrap();
        assert_eq!(
            receipt.attached,
            vec!["RAPID TRUCKING COI.pdf", "RAPID TRUCKING additional insured.pdf"]
        );
        assert_eq!(receipt.to, vec!["certs@acme.example"]);
        assert!(receipt.cc.is_empty());
        assert_eq!(sender.sent_count(), 1);

        let final_pdf = store.get("certificates/RAPID TRUCKING COI.pdf").await.unwrap();
        assert!(read_form_fields(&final_pdf).unwrap().is_empty());

        let services = db.list_flow_services("T1").await.unwrap();
        assert_eq!(services, vec!["generator", "delivery"]);
    }

    #[tokio::test]
    async fn nothing_located_is_a_delivery_failure() {
        let sender = Arc::new(RecordingSender::default());
        let (dispatcher, _store, db) = dispatcher(&["OTHER CARRIER COI.pdf"], sender.clone()).await;

        assert!(matches!(
            dispatcher.run(&request()).await,
            Err(PipelineError::Delivery(_))
        ));
        assert_eq!(sender.sent_count(), 0);
        let events = db.list_flow_events("T1").await.unwrap();
        assert_eq!(events.last().unwrap().status, FlowStatus::Error);
    }

    #[tokio::test]
    async fn send_failure_surfaces_after_generation() {
        let sender = Arc::new(RecordingSender::failing());
        let (dispatcher, store, _db) = dispatcher(&["RAPID TRUCKING COI.pdf"], sender).await;

        assert!(dispatcher.fulfill(request()).await.is_err());
        assert!(store.exists("certificates/RAPID TRUCKING COI.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn earlier_artifact_is_not_mailed_when_generation_fails() {
        let sender = Arc::new(RecordingSender::default());
        let (dispatcher, store, db) = dispatcher_with(
            &["RAPID TRUCKING COI.pdf"],
            sender.clone(),
            Arc::new(BrokenRasterizer),
        )
        .await;
        store
            .put("certificates/RAPID TRUCKING COI.pdf", b"certificate for a previous holder".to_vec())
            .await
            .unwrap();

        let mut req = request();
        req.holder_name = "New Holder".into();
        assert!(matches!(
            dispatcher.run(&req).await,
            Err(PipelineError::Delivery(_))
        ));
        assert_eq!(sender.sent_count(), 0);
        assert_eq!(
            store.get("certificates/RAPID TRUCKING COI.pdf").await.unwrap(),
            b"certificate for a previous holder".to_vec()
        );
        let events = db.list_flow_events("T1").await.unwrap();
        assert_eq!(events.last().unwrap().status, FlowStatus::Error);
    }
}
