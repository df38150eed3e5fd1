use crate::llm::{LlmClient, LlmError, LlmMessage};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct CompanyInfo {
    pub name: String,
    pub contact_email: String,
    pub phone: String,
    pub policy_url: String,
}

impl CompanyInfo {
    pub fn from_env() -> Self {
        Self {
            name: std::env::var("COMPANY_NAME").unwrap_or_else(|_| "Mailroom".into()),
            contact_email: std::env::var("COMPANY_EMAIL")
                .unwrap_or_else(|_| "support@example.com".into()),
            phone: std::env::var("COMPANY_PHONE").unwrap_or_else(|_| "+1 555 0100".into()),
            policy_url: std::env::var("COMPANY_POLICY_URL")
                .unwrap_or_else(|_| "https://example.com/policies".into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProductInfo {
    #[allow(dead_code)]
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ConfirmationLine {
    pub name: String,
    pub qty: i64,
    pub price: f64,
}

#[derive(Debug, Clone)]
pub struct OrderConfirmation {
    pub order_id: String,
    pub lines: Vec<ConfirmationLine>,
    pub delivery_date: String,
    pub total: f64,
}

#[derive(Debug, Clone)]
pub struct UnavailableItem {
    pub product_id: String,
    pub name: String,
    pub requested_qty: i64,
}

#[derive(Debug, Error)]
pub enum RespondError {
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),
}

const ORDER_CONFIRM_TEMPLATE: &str = "Thank you for your order! We're processing the following items:

{order_details}

Expected delivery: {delivery_date}
Total amount: {total_amount}
{company_info}";

const OUT_OF_STOCK_TEMPLATE: &str = "We're sorry, some items aren't available:

{unavailable_items}

Alternatives we recommend:
{alternatives}
{company_info}";

const RETURN_REQUEST_TEMPLATE: &str = "We've received your return request for:
{items}

Next steps:
1. Package items securely
2. Attach return label
3. Ship within {days} days
{company_info}";

const SHIPPING_DELAY_TEMPLATE: &str = "Important update about order {order_id}:

Due to {reason}, your delivery is delayed by {delay}.

New estimated arrival: {new_date}
{company_info}";

fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut output = template.to_string();
    for (key, value) in vars {
        output = output.replace(&format!("{{{key}}}"), value);
    }
    output
}

/// Drafts customer-facing replies. Dynamic drafts go through the model
/// collaborator and fall back to the rendered template when it is unreachable;
/// stock notices are template-only.
pub struct ResponseGenerator {
    llm: Arc<LlmClient>,
    company: CompanyInfo,
}

impl ResponseGenerator {
    pub fn new(llm: Arc<LlmClient>, company: CompanyInfo) -> Self {
        Self { llm, company }
    }

    fn footer(&self) -> String {
        format!(
            "\n\n{} Customer Service\nEmail: {} | Phone: {}\nView our policies: {}",
            self.company.name, self.company.contact_email, self.company.phone,
            self.company.policy_url
        )
    }

    pub async fn order_confirmation(&self, order: &OrderConfirmation) -> String {
        let details = order
            .lines
            .iter()
            .map(|line| format!("- {} x {} (${:.2})", line.qty, line.name, line.price))
            .collect::<Vec<_>>()
            .join("\n");
        let footer = self.footer();
        let rendered = render(
            ORDER_CONFIRM_TEMPLATE,
            &[
                ("order_details", details.as_str()),
                ("delivery_date", order.delivery_date.as_str()),
                ("total_amount", &format!("${:.2}", order.total)),
                ("company_info", footer.as_str()),
            ],
        );

        let prompt = format!(
            "Rewrite this order confirmation email so it reads warmly and professionally. \
             Keep every item, quantity, price and date exactly as given.\n\n{rendered}"
        );
        match self.llm.chat(&[LlmMessage::user(prompt)]).await {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    target = "mailroom.respond",
                    order_id = %order.order_id,
                    error = %err,
                    "confirmation_draft_fallback"
                );
                rendered
            }
        }
    }

    pub fn stock_notice(
        &self,
        unavailable: &[UnavailableItem],
        alternatives: &[ProductInfo],
    ) -> String {
        let items = unavailable
            .iter()
            .map(|item| format!("- {} (Requested: {})", item.name, item.requested_qty))
            .collect::<Vec<_>>()
            .join("\n");
        let alternatives = if alternatives.is_empty() {
            "None available at this time".to_string()
        } else {
            alternatives
                .iter()
                .map(|product| {
                    let preview: String = product.description.chars().take(100).collect();
                    format!("- {}: {preview}...", product.name)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        let footer = self.footer();
        render(
            OUT_OF_STOCK_TEMPLATE,
            &[
                ("unavailable_items", items.as_str()),
                ("alternatives", alternatives.as_str()),
                ("company_info", footer.as_str()),
            ],
        )
    }

    pub async fn inquiry_reply(
        &self,
        question: &str,
        product: &ProductInfo,
        knowledge: Option<&str>,
    ) -> Result<String, LlmError> {
        let prompt = format!(
            "You're a customer service agent for {company}.\n\
             Answer this question about {product}:\n\
             Question: {question}\n\
             Product details: {details}\n\
             Additional context: {context}\n\n\
             Respond in 2-3 paragraphs with:\n\
             1. Direct answer to question\n\
             2. Key product benefits\n\
             3. Call-to-action\n\n\
             Tone: Professional but friendly",
            company = self.company.name,
            product = product.name,
            question = question,
            details = product.description,
            context = knowledge.unwrap_or("No additional context"),
        );
        let mut reply = self.llm.chat(&[LlmMessage::user(prompt)]).await?;
        reply.push_str(&self.footer());
        Ok(reply)
    }

    /// Scenario-keyed notices for flows without a dedicated builder.
    #[allow(dead_code)]
    pub fn custom_notice(
        &self,
        scenario: &str,
        vars: &HashMap<String, String>,
    ) -> Result<String, RespondError> {
        let template = match scenario {
            "return_request" => RETURN_REQUEST_TEMPLATE,
            "shipping_delay" => SHIPPING_DELAY_TEMPLATE,
            other => return Err(RespondError::UnknownScenario(other.to_string())),
        };
        let footer = self.footer();
        let mut pairs: Vec<(&str, &str)> = vars
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        pairs.push(("company_info", footer.as_str()));
        Ok(render(template, &pairs))
    }
}
