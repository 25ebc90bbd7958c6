//! Action entry point shared by the ingest handler and the `/coi` route.

use std::sync::Arc;

use tracing::info;

use crate::error::PipelineError;
use crate::pipeline::approval::{ApprovalGate, OpenOutcome};
use crate::pipeline::classifier::CoiClassifier;
use crate::pipeline::dispatcher::CoiDispatcher;
use crate::pipeline::flow::FlowLog;
use crate::pipeline::types::{AnalyzeRequest, ApprovalRequest, CoiAction, CoiAnalysis};

pub struct CoiService {
    classifier: CoiClassifier,
    gate: Arc<ApprovalGate>,
    dispatcher: Arc<CoiDispatcher>,
    flow: FlowLog,
}

impl CoiService {
    pub fn new(
        classifier: CoiClassifier,
        gate: Arc<ApprovalGate>,
        dispatcher: Arc<CoiDispatcher>,
        flow: FlowLog,
    ) -> Self {
        Self {
            classifier,
            gate,
            dispatcher,
            flow,
        }
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub async fn handle(&self, action: CoiAction) -> Result<(), PipelineError> {
        match action {
            CoiAction::AnalyzeForCoiRequest(request) => self.analyze(&request).await.map(|_| ()),
            CoiAction::GenerateCoi(request) => self.dispatcher.run(&request).await.map(|_| ()),
        }
    }

    /// Classify a message and, on a positive verdict, open its approval.
    pub async fn analyze(&self, request: &AnalyzeRequest) -> Result<CoiAnalysis, PipelineError> {
        let thread_id = request.thread_id.as_str();
        let analysis = match self.classifier.analyze(request).await {
            Ok(analysis) => analysis,
            Err(e) => {
                self.flow.error(thread_id, "classifier", "analyze", &e.to_string()).await;
                return Err(e);
            }
        };

        let fields = match &analysis {
            CoiAnalysis::Request(fields) => fields,
            CoiAnalysis::NotRequest => {
                self.flow
                    .ok(thread_id, "classifier", "analyze", serde_json::json!({ "is_request": false }))
                    .await;
                return Ok(analysis);
            }
            CoiAnalysis::Unparsed => {
                self.flow
                    .ok(
                        thread_id,
                        "classifier",
                        "analyze",
                        serde_json::json!({ "is_request": true, "extracted": false }),
                    )
                    .await;
                return Ok(analysis);
            }
        };
        self.flow
            .ok(
                thread_id,
                "classifier",
                "analyze",
                serde_json::json!({ "is_request": true, "fields": fields }),
            )
            .await;

        let outcome = self
            .gate
            .open(ApprovalRequest {
                thread_id: request.thread_id.clone(),
                subject: request.subject.clone(),
                chat_id: self.gate.default_chat_id().to_string(),
                fields: fields.clone(),
                to_emails: request.to_emails.clone(),
                cc_emails: request.cc_emails.clone(),
                last_message_id: request.last_message_id.clone(),
            })
            .await?;
        if outcome == OpenOutcome::AlreadyResolved {
            info!(thread_id, "Thread already resolved, approval not reopened");
        }
        Ok(analysis)
    }
}
