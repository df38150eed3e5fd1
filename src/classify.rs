use crate::config;
use crate::llm::{LlmClient, LlmError, LlmMessage};
use crate::metrics;
use crate::models::{EmailClassification, EmailRecord};
use crate::pacing::Pacer;
use crate::retry::{Retryable, RetryPolicy, with_retry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Inputs are clipped to this many characters before they reach the model.
pub const MAX_FIELD_CHARS: usize = 2000;

const SYSTEM_PROMPT: &str = r#"Analyze the email you are given and classify its intent.

**Order Request Indicators**:
- Specific product references (SKU, model numbers)
- Quantity specifications ("2 units", "all available")
- Purchase verbs ("buy", "order", "ship")
- Payment/shipping details

**Product Inquiry Indicators**:
- Question words ("how", "what", "does")
- Feature requests ("color options", "dimensions")
- Comparison requests ("vs X product")
- General information

**Examples**:
Order: "Please send 3 units of LTH-0978 to my NJ warehouse"
Inquiry: "What material is used in the winter collection jackets?"

Respond ONLY with either:
- "order request"
- "product inquiry"
"#;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("model request failed: {0}")]
    Request(String),
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
}

impl Retryable for ClassifyError {
    fn is_transient(&self) -> bool {
        matches!(self, ClassifyError::Request(_))
    }
}

/// Label collaborator: free-text label out, normalization happens on our side.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, subject: &str, message: &str) -> Result<String, ClassifyError>;
}

pub struct LlmClassifier {
    llm: Arc<LlmClient>,
}

impl LlmClassifier {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, subject: &str, message: &str) -> Result<String, ClassifyError> {
        let email = format!(
            "Subject: {}\nContent: {}",
            clean_text(subject),
            clean_text(message)
        );
        self.llm
            .chat(&[LlmMessage::system(SYSTEM_PROMPT), LlmMessage::user(email)])
            .await
            .map_err(|err| match err {
                LlmError::Http(detail) => ClassifyError::Request(detail),
                other => ClassifyError::Unavailable(other.to_string()),
            })
    }
}

/// Trim and clip a field before model submission.
pub fn clean_text(text: &str) -> String {
    text.trim().chars().take(MAX_FIELD_CHARS).collect()
}

/// Deterministic digest of an email's content, used as the cache key so
/// textually identical duplicates reuse the prior label.
pub fn fingerprint(subject: &str, message: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    subject.hash(&mut hasher);
    message.hash(&mut hasher);
    hasher.finish()
}

/// Absorb phrasing variance from the collaborator: anything that mentions
/// "order" is an order request, everything else an inquiry.
fn normalize_label(raw: &str) -> String {
    if raw.to_lowercase().contains("order") {
        config::LABEL_ORDER.clone()
    } else {
        config::LABEL_INQUIRY.clone()
    }
}

/// Duplicate-suppressing front of the classifier collaborator. Owns the
/// in-process fingerprint → label cache for the lifetime of the instance.
pub struct EmailClassifier {
    classifier: Arc<dyn Classifier>,
    retry: RetryPolicy,
    pacer: Pacer,
    cache: HashMap<u64, String>,
}

impl EmailClassifier {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self::with_policies(
            classifier,
            config::model_inference_policy(),
            config::batch_pacer(),
        )
    }

    pub fn with_policies(classifier: Arc<dyn Classifier>, retry: RetryPolicy, pacer: Pacer) -> Self {
        Self {
            classifier,
            retry,
            pacer,
            cache: HashMap::new(),
        }
    }

    /// Classify one email, serving textual duplicates from the cache. The
    /// collaborator is invoked at most once per distinct (subject, message).
    pub async fn classify_single(&mut self, email: &EmailRecord) -> Result<String, ClassifyError> {
        let key = fingerprint(&email.subject, &email.message);
        if let Some(label) = self.cache.get(&key) {
            metrics::cache_hit("classification");
            return Ok(label.clone());
        }

        let classifier = Arc::clone(&self.classifier);
        let raw = with_retry(self.retry, &email.id, || {
            classifier.classify(&email.subject, &email.message)
        })
        .await?;

        let label = normalize_label(&raw);
        self.cache.insert(key, label.clone());
        Ok(label)
    }

    /// Classify a batch with pacing pauses between chunks. A single failure
    /// records the unclassified sentinel plus the error text and the batch
    /// moves on.
    pub async fn classify_batch(
        &mut self,
        emails: &[EmailRecord],
        batch_size: Option<usize>,
    ) -> Vec<EmailClassification> {
        if emails.is_empty() {
            return Vec::new();
        }

        let chunk_size = batch_size.unwrap_or_else(|| self.pacer.chunk_size()).max(1);
        let mut results = Vec::with_capacity(emails.len());

        for chunk in emails.chunks(chunk_size) {
            for email in chunk {
                match self.classify_single(email).await {
                    Ok(category) => results.push(EmailClassification {
                        email_id: email.id.clone(),
                        category,
                        error: None,
                    }),
                    Err(err) => {
                        warn!(
                            target = "mailroom.classify",
                            email_id = %email.id,
                            error = %err,
                            "classification_failed"
                        );
                        results.push(EmailClassification {
                            email_id: email.id.clone(),
                            category: config::LABEL_UNCLASSIFIED.clone(),
                            error: Some(err.to_string()),
                        });
                    }
                }
            }
            self.pacer.pause().await;
        }

        results
    }
}
