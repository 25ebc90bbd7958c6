//! Two-stage COI classifier: a yes/no triage call, then structured field
//! extraction for positives.
//!
//! Unusable model replies never raise. They are captured in the classifier
//! error collection and read as "no signal" (triage) or
//! [`CoiAnalysis::Unparsed`] (extraction).

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::llm::{CompletionRequest, LlmProvider, extract_json_object};
use crate::pipeline::types::{AnalyzeRequest, CoiAnalysis, ExtractedFields};
use crate::store::{ClassifierErrorRecord, Database};

/// Deterministic-ish: both calls are yes/no or copy-out tasks.
const CLASSIFIER_TEMPERATURE: f64 = 0.0;

const CLASSIFY_SYSTEM: &str = "You are a commercial trucking insurance email monitoring bot.";
const EXTRACT_SYSTEM: &str = "You are a commercial trucking insurance COI handling bot.";

pub struct CoiClassifier {
    llm: Arc<dyn LlmProvider>,
    db: Arc<dyn Database>,
}

impl CoiClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, db: Arc<dyn Database>) -> Self {
        Self { llm, db }
    }

    /// Classify, then extract if positive.
    pub async fn analyze(&self, request: &AnalyzeRequest) -> Result<CoiAnalysis, PipelineError> {
        if !self.classify(&request.subject, &request.body_text, &request.from_email).await? {
            info!(thread_id = %request.thread_id, "Not a COI request");
            return Ok(CoiAnalysis::NotRequest);
        }

        let Some(fields) = self
            .extract(
                &request.subject,
                &request.body_text,
                &request.to_emails,
                &request.cc_emails,
            )
            .await?
        else {
            warn!(thread_id = %request.thread_id, "COI request detected but extraction unusable");
            return Ok(CoiAnalysis::Unparsed);
        };

        info!(
            thread_id = %request.thread_id,
            insured_inferred = fields.insured_inferred,
            holder_inferred = fields.holder_inferred,
            "COI request detected"
        );
        Ok(CoiAnalysis::Request(fields))
    }

    /// `Ok(false)` both for a negative verdict and for an unparsable reply.
    pub async fn classify(
        &self,
        subject: &str,
        body: &str,
        from: &str,
    ) -> Result<bool, PipelineError> {
        let prompt = classify_prompt(subject, body, from);
        let reply = self.complete(CLASSIFY_SYSTEM, prompt).await?;

        match parse_classification(&reply) {
            Some(verdict) => {
                debug!(verdict, "Classifier verdict");
                Ok(verdict)
            }
            None => {
                warn!(subject, "Unparsable classifier reply, treating as no signal");
                self.record_error("classify", subject, body, &reply).await;
                Ok(false)
            }
        }
    }

    /// `Ok(None)` when the reply is unparsable or misses a required key.
    pub async fn extract(
        &self,
        subject: &str,
        body: &str,
        to: &[String],
        cc: &[String],
    ) -> Result<Option<ExtractedFields>, PipelineError> {
        let prompt = extract_prompt(subject, body, to, cc);
        let reply = self.complete(EXTRACT_SYSTEM, prompt).await?;

        let fields = parse_extraction(&reply);
        if fields.is_none() {
            warn!(subject, "Unparsable extraction reply, nothing inferred");
            self.record_error("extract", subject, body, &reply).await;
        }
        Ok(fields)
    }

    async fn complete(&self, system: &str, prompt: String) -> Result<String, PipelineError> {
        let request =
            CompletionRequest::new(system, prompt).with_temperature(CLASSIFIER_TEMPERATURE);
        let response = self.llm.complete(request).await?;
        Ok(response.content)
    }

    async fn record_error(&self, stage: &str, subject: &str, content: &str, reply: &str) {
        let now = Utc::now();
        let record = ClassifierErrorRecord {
            id: error_record_id(now, subject),
            stage: stage.to_string(),
            subject: subject.to_string(),
            content: content.to_string(),
            llm_response: reply.to_string(),
            created_at: now,
        };
        if let Err(e) = self.db.record_classifier_error(&record).await {
            warn!(stage, error = %e, "Failed to store classifier error record");
        }
    }
}

/// `<YYYY_MM_DD_HH_MM_SS_micros>_<subject with spaces replaced>`.
pub fn error_record_id(at: chrono::DateTime<Utc>, subject: &str) -> String {
    format!(
        "{}_{}",
        at.format("%Y_%m_%d_%H_%M_%S_%6f"),
        subject.replace(' ', "_")
    )
}

fn classify_prompt(subject: &str, body: &str, from: &str) -> String {
    format!(
        r#"Your task is to analyze whether the email asks for a certificate of insurance (is a COI request) or not.
When they ask for a COI, they also specify the certificate holder name and address, but sometimes they just write a company name,
not mentioning that it's the COI holder.
Typically, but not always, brokers and clients send a request with texts such as:
  - please send insurance
  - coi needed
  - urgent, load on hold
  - ins cert request
  - proof of insurance needed

Respond with ONLY a valid JSON object in this exact format:
{{"is_likely_coi_request": true/false}}

Be conservative - only return true if there are clear indicators of a COI request.

From: {from}
Subject: {subject}
Content: {body}
"#
    )
}

fn extract_prompt(subject: &str, body: &str, to: &[String], cc: &[String]) -> String {
    format!(
        r#"You are given a raw Certificate of Insurance (COI) request email subject and body.
Analyze the email, then infer and extract the following information:
    1. Whether the insured client/company name for which the client or the broker asks for a COI is mentioned in the email.
    2. The insured client/company name for which the client or the broker asks for a COI.
    3. Whether the certificate holder information is mentioned, which consists of:
        a. The name of their company
        b. Address line 1 (just the street address)
        c. Address line 2 with the format: <city>, <state 2 letter code> <zip code>
    4. The main email address that the COI needs to be sent to. If none is mentioned, leave it blank.

Respond with ONLY a valid JSON object in the exact format:
{{
    "insured_inferred": true/false,
    "insured_name": string,
    "holder_inferred": true/false,
    "holder_name": string,
    "holder_addr_1": string,
    "holder_addr_2": string,
    "send_to_email": string
}}

Example:
{{
    "insured_inferred": true,
    "insured_name": "RAPID TRUCKING INC",
    "holder_inferred": true,
    "holder_name": "Highway App, Inc.",
    "holder_addr_1": "5931 Greenville Ave, Unit #5620",
    "holder_addr_2": "Dallas, TX 75206",
    "send_to_email": "insurance@certs.highway.com"
}}

Set holder_inferred false if you can't infer it from the email.
Here is the email you need to analyze:

To emails: {to}
CC emails: {cc}
Subject: {subject}
Content: {body}
"#,
        to = to.join(", "),
        cc = cc.join(", "),
    )
}

#[derive(Deserialize)]
struct ClassifyReply {
    is_likely_coi_request: bool,
}

/// The two flags are required; the strings default to empty.
#[derive(Deserialize)]
struct ExtractReply {
    insured_inferred: bool,
    holder_inferred: bool,
    #[serde(default)]
    insured_name: Option<String>,
    #[serde(default)]
    holder_name: Option<String>,
    #[serde(default)]
    holder_addr_1: Option<String>,
    #[serde(default)]
    holder_addr_2: Option<String>,
    #[serde(default)]
    send_to_email: Option<String>,
}

pub fn parse_classification(reply: &str) -> Option<bool> {
    let json = extract_json_object(reply)?;
    serde_json::from_str::<ClassifyReply>(json)
        .ok()
        .map(|r| r.is_likely_coi_request)
}

/// A flag claiming a name was inferred is dropped when the name is blank.
pub fn parse_extraction(reply: &str) -> Option<ExtractedFields> {
    let json = extract_json_object(reply)?;
    let raw: ExtractReply = serde_json::from_str(json).ok()?;

    let clean = |s: Option<String>| s.map(|s| s.trim().to_string()).unwrap_or_default();
    let insured_name = clean(raw.insured_name);
    let holder_name = clean(raw.holder_name);

    Some(ExtractedFields {
        insured_inferred: raw.insured_inferred && !insured_name.is_empty(),
        holder_inferred: raw.holder_inferred && !holder_name.is_empty(),
        insured_name,
        holder_name,
        holder_addr_1: clean(raw.holder_addr_1),
        holder_addr_2: clean(raw.holder_addr_2),
        send_to_email: clean(raw.send_to_email),
    })
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedLlm;
    use super::*;
    use crate::store::LibSqlBackend;

    const FULL_EXTRACTION: &str = r#"{
        "insured_inferred": true,
        "insured_name": "RAPID TRUCKING INC",
        "holder_inferred": true,
        "holder_name": "Acme Logistics",
        "holder_addr_1": "123 Main St",
        "holder_addr_2": "Springfield, IL 60001",
        "send_to_email": "certs@acme.example"
    }"#;

    async fn db() -> Arc<dyn Database> {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.run_migrations().await.unwrap();
        db
    }

    fn request() -> AnalyzeRequest {
        AnalyzeRequest {
            thread_id: "T1".into(),
            subject: "URGENT need COI".into(),
            body_text: "Holder: Acme Logistics, 123 Main St, Springfield, IL 60001".into(),
            to_emails: vec!["agent@broker.example".into()],
            cc_emails: vec!["ops@broker.example".into()],
            from_email: "dispatch@acme.example".into(),
            last_message_id: "<m1@acme.example>".into(),
        }
    }

    #[test]
    fn classification_parsing() {
        assert_eq!(parse_classification(r#"{"is_likely_coi_request": true}"#), Some(true));
        assert_eq!(
            parse_classification("```json\n{\"is_likely_coi_request\": false}\n```"),
            Some(false)
        );
        assert_eq!(parse_classification(r#"{"is_coi": true}"#), None);
        assert_eq!(parse_classification(r#"{"is_likely_coi_request": "yes"}"#), None);
        assert_eq!(parse_classification("sure thing"), None);
    }

    #[test]
    fn extraction_requires_both_flags() {
        assert!(parse_extraction(r#"{"insured_inferred": true, "insured_name": "X"}"#).is_none());
        let fields = parse_extraction(FULL_EXTRACTION).unwrap();
        assert!(fields.is_complete());
        assert_eq!(fields.holder_addr_2, "Springfield, IL 60001");
    }

    #[test]
    fn extraction_does_not_trust_flag_with_blank_name() {
        let fields = parse_extraction(
            r#"{"insured_inferred": true, "insured_name": "  ", "holder_inferred": true, "holder_name": "Acme"}"#,
        )
        .unwrap();
        assert!(!fields.insured_inferred);
        assert!(fields.holder_inferred);
        assert_eq!(fields.send_to_email, "");
    }

    #[test]
    fn error_id_format() {
        let at = chrono::DateTime::parse_from_rfc3339("2025-03-04T05:06:07.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            error_record_id(at, "need coi asap"),
            "2025_03_04_05_06_07_123456_need_coi_asap"
        );
    }

    #[tokio::test]
    async fn positive_request_is_extracted() {
        let llm = Arc::new(ScriptedLlm::new(&[
            r#"{"is_likely_coi_request": true}"#,
            FULL_EXTRACTION,
        ]));
        let classifier = CoiClassifier::new(llm.clone(), db().await);

        let analysis = classifier.analyze(&request()).await.unwrap();
        match analysis {
            CoiAnalysis::Request(fields) => {
                assert_eq!(fields.insured_name, "RAPID TRUCKING INC");
                assert_eq!(fields.holder_name, "Acme Logistics");
            }
            other => panic!("unexpected {other:?}"),
        }

        let requests = llm.requests.lock().unwrap();
        assert_eq!(requests[0].system, CLASSIFY_SYSTEM);
        assert!(requests[0].prompt.contains("Subject: URGENT need COI"));
        assert_eq!(requests[1].system, EXTRACT_SYSTEM);
        assert!(requests[1].prompt.contains("To emails: agent@broker.example"));
        assert!(requests[1].prompt.contains("CC emails: ops@broker.example"));
    }

    #[tokio::test]
    async fn negative_verdict_skips_extraction() {
        let llm = Arc::new(ScriptedLlm::new(&[r#"{"is_likely_coi_request": false}"#]));
        let classifier = CoiClassifier::new(llm.clone(), db().await);
        assert_eq!(classifier.analyze(&request()).await.unwrap(), CoiAnalysis::NotRequest);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_verdict_is_recorded_as_no_signal() {
        let db = db().await;
        let llm = Arc::new(ScriptedLlm::new(&["I think so!"]));
        let classifier = CoiClassifier::new(llm, Arc::clone(&db));

        assert_eq!(classifier.analyze(&request()).await.unwrap(), CoiAnalysis::NotRequest);

        let errors = db.list_classifier_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage, "classify");
        assert_eq!(errors[0].llm_response, "I think so!");
        assert!(errors[0].id.ends_with("_URGENT_need_COI"));
    }

    #[tokio::test]
    async fn malformed_extraction_is_unparsed() {
        for reply in ["{}", "not json at all"] {
            let db = db().await;
            let llm = Arc::new(ScriptedLlm::new(&[r#"{"is_likely_coi_request": true}"#, reply]));
            let classifier = CoiClassifier::new(llm, Arc::clone(&db));

            let analysis = classifier.analyze(&request()).await.unwrap();
            assert_eq!(analysis, CoiAnalysis::Unparsed, "{reply}");
            assert!(!analysis.is_request());
            let errors = db.list_classifier_errors(10).await.unwrap();
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].stage, "extract");
            assert_eq!(errors[0].llm_response, reply);
        }
    }

    #[tokio::test]
    async fn parsed_extraction_with_missing_names_stays_a_request() {
        let db = db().await;
        let llm = Arc::new(ScriptedLlm::new(&[
            r#"{"is_likely_coi_request": true}"#,
            r#"{"insured_inferred": false, "insured_name": "", "holder_inferred": false}"#,
        ]));
        let classifier = CoiClassifier::new(llm, Arc::clone(&db));

        let analysis = classifier.analyze(&request()).await.unwrap();
        assert_eq!(analysis, CoiAnalysis::Request(ExtractedFields::default()));
        assert!(db.list_classifier_errors(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_propagates() {
        let llm = Arc::new(ScriptedLlm::failing("connection reset"));
        let classifier = CoiClassifier::new(llm, db().await);
        assert!(matches!(
            classifier.analyze(&request()).await,
            Err(PipelineError::Llm(_))
        ));
    }
}
