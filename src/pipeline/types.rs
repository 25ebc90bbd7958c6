//! JSON bodies exchanged between pipeline stages.
//!
//! Field names match the wire format of the action and notification
//! endpoints, so these types double as request bodies for `/coi` and
//! `/telegram`.

use serde::{Deserialize, Serialize};

/// Newest message of a thread, handed to the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub thread_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub to_emails: Vec<String>,
    #[serde(default)]
    pub cc_emails: Vec<String>,
    #[serde(default)]
    pub from_email: String,
    #[serde(default)]
    pub last_message_id: String,
}

/// Structured fields pulled out of a COI request email.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFields {
    #[serde(default)]
    pub insured_inferred: bool,
    #[serde(default)]
    pub insured_name: String,
    #[serde(default)]
    pub holder_inferred: bool,
    #[serde(default)]
    pub holder_name: String,
    #[serde(default)]
    pub holder_addr_1: String,
    #[serde(default)]
    pub holder_addr_2: String,
    #[serde(default)]
    pub send_to_email: String,
}

impl ExtractedFields {
    /// Both names present, so a certificate can be generated without a human
    /// filling gaps.
    pub fn is_complete(&self) -> bool {
        self.insured_inferred && self.holder_inferred
    }
}

/// Classifier verdict for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoiAnalysis {
    /// Not a COI request, or the verdict could not be parsed.
    NotRequest,
    /// A COI request whose extraction reply could not be used. Nothing is
    /// opened for approval; the raw reply is in the classifier error log.
    Unparsed,
    /// A COI request; `fields` may be incomplete.
    Request(ExtractedFields),
}

impl CoiAnalysis {
    pub fn is_request(&self) -> bool {
        matches!(self, CoiAnalysis::Request(_))
    }
}

/// Notification payload that opens an approval for a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub thread_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(flatten)]
    pub fields: ExtractedFields,
    #[serde(default)]
    pub to_emails: Vec<String>,
    #[serde(default)]
    pub cc_emails: Vec<String>,
    #[serde(default)]
    pub last_message_id: String,
}

/// Everything needed to generate and deliver a certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub insured_name: String,
    #[serde(default)]
    pub holder_name: String,
    #[serde(default)]
    pub holder_addr_1: String,
    #[serde(default)]
    pub holder_addr_2: String,
    #[serde(default)]
    pub send_to_email: String,
    #[serde(default)]
    pub to_emails: Vec<String>,
    #[serde(default)]
    pub cc_emails: Vec<String>,
    #[serde(default)]
    pub last_message_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub subject_text: String,
    #[serde(default)]
    pub body_text: String,
}

/// Body of the `/coi` action endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CoiAction {
    AnalyzeForCoiRequest(AnalyzeRequest),
    GenerateCoi(GenerateRequest),
}
