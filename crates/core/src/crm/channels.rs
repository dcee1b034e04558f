//! Side-effect channels fanned out by the dispatcher.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::{ContactSyncConfig, MessagingConfig};
use crate::error::ChannelError;
use crate::store::{insert_first_accepted, RecordStore, TASK_COLLECTION};
use crate::types::{new_id, AutomationEvent, Lead};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateMessage {
    pub to: String,
    pub template: String,
    pub language: String,
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactUpsert {
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub tags: Vec<String>,
    pub list_id: Option<String>,
}

#[async_trait]
pub trait MessagingProvider: Send + Sync {
    async fn send_template(&self, message: &TemplateMessage) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait ContactSyncProvider: Send + Sync {
    async fn upsert_contact(&self, contact: &ContactUpsert) -> Result<(), ChannelError>;
}

pub struct HttpMessagingClient {
    client: reqwest::Client,
    config: MessagingConfig,
}

impl HttpMessagingClient {
    pub fn new(client: reqwest::Client, config: MessagingConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl MessagingProvider for HttpMessagingClient {
    async fn send_template(&self, message: &TemplateMessage) -> Result<(), ChannelError> {
        let body = json!({
            "to": message.to,
            "type": "template",
            "template": {
                "name": message.template,
                "language": { "code": message.language },
                "parameters": message.variables,
            },
        });
        let request = self
            .client
            .post(format!("{}/messages", self.config.api_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.config.api_token))
            .json(&body);
        send(request).await
    }
}

pub struct HttpContactSyncClient {
    client: reqwest::Client,
    config: ContactSyncConfig,
}

impl HttpContactSyncClient {
    pub fn new(client: reqwest::Client, config: ContactSyncConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ContactSyncProvider for HttpContactSyncClient {
    async fn upsert_contact(&self, contact: &ContactUpsert) -> Result<(), ChannelError> {
        let list_ids: Vec<&str> = contact
            .list_id
            .as_deref()
            .or(self.config.list_id.as_deref())
            .into_iter()
            .collect();
        let body = json!({
            "email": contact.email,
            "attributes": {
                "FIRSTNAME": contact.name,
                "SMS": contact.phone,
                "TAGS": contact.tags.join(","),
            },
            "listIds": list_ids,
            "updateEnabled": true,
        });
        let request = self
            .client
            .post(format!("{}/contacts", self.config.api_url.trim_end_matches('/')))
            .header("api-key", &self.config.api_key)
            .json(&body);
        send(request).await
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<(), ChannelError> {
    let response = request
        .send()
        .await
        .map_err(|err| ChannelError::Transport(err.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChannelError::Rejected {
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    })
}

/// Messaging template for an event, keyed on the lead stage for stage changes.
pub fn template_for(event: AutomationEvent, stage: Option<&str>) -> Option<&'static str> {
    match event {
        AutomationEvent::LeadCreated => Some("lead_welcome"),
        AutomationEvent::LeadStageChanged => match stage? {
            "qualified" => Some("lead_qualified"),
            "proposal" => Some("lead_proposal_ready"),
            "negotiation" => Some("lead_negotiation_checkin"),
            _ => None,
        },
        AutomationEvent::QuoteSent => Some("quote_sent"),
        AutomationEvent::BookingWon => Some("booking_confirmed"),
        AutomationEvent::PaymentLinkCreated => Some("payment_link"),
    }
}

pub fn template_message(template: &str, phone: &str, lead: &Lead, payload: &Value) -> TemplateMessage {
    let mut variables = vec![lead.name.clone()];
    for key in ["quote_url", "payment_url", "booking_reference"] {
        if let Some(value) = payload.get(key).and_then(Value::as_str) {
            variables.push(value.to_string());
        }
    }
    TemplateMessage {
        to: phone.to_string(),
        template: template.to_string(),
        language: "en".to_string(),
        variables,
    }
}

pub fn contact_tags(event: AutomationEvent, stage: Option<&str>) -> Vec<String> {
    let mut tags = vec!["lead".to_string()];
    if let Some(stage) = stage.filter(|s| !s.is_empty()) {
        tags.push(format!("stage:{stage}"));
    }
    tags.push(format!("event:{}", event.as_str().replace('.', "_")));
    tags
}

/// Follow-up delay and title for events that schedule a task.
pub fn follow_up_plan(event: AutomationEvent) -> Option<(chrono::Duration, &'static str)> {
    match event {
        AutomationEvent::LeadCreated => Some((chrono::Duration::minutes(15), "Call new lead")),
        AutomationEvent::QuoteSent => Some((chrono::Duration::hours(24), "Follow up on quote")),
        AutomationEvent::PaymentLinkCreated => {
            Some((chrono::Duration::hours(6), "Check payment link status"))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FollowUpTask {
    pub lead_id: String,
    pub booking_id: Option<String>,
    pub title: String,
    pub due_at: DateTime<Utc>,
    pub dedup_key: String,
}

/// Writes a follow-up task through the task-shape ladder.
pub async fn write_follow_up_task(
    store: &dyn RecordStore,
    task: &FollowUpTask,
    now: DateTime<Utc>,
) -> Result<usize, ChannelError> {
    let id = new_id("task");
    let full = object(json!({
        "id": id,
        "lead_id": task.lead_id,
        "booking_id": task.booking_id,
        "title": task.title,
        "due_at": task.due_at.to_rfc3339(),
        "source": "crm_automation",
        "dedup_key": task.dedup_key,
        "status": "open",
        "created_at": now.to_rfc3339(),
    }));
    let without_dedup = object(json!({
        "id": id,
        "lead_id": task.lead_id,
        "booking_id": task.booking_id,
        "title": task.title,
        "due_at": task.due_at.to_rfc3339(),
        "status": "open",
        "created_at": now.to_rfc3339(),
    }));
    let minimal = object(json!({
        "lead_id": task.lead_id,
        "title": task.title,
        "due_at": task.due_at.to_rfc3339(),
    }));
    let shape = insert_first_accepted(store, TASK_COLLECTION, &[full, without_dedup, minimal])
        .await?;
    Ok(shape)
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Bounds a provider call; elapsed time counts as a provider failure.
pub async fn with_timeout<F>(timeout: Duration, call: F) -> Result<(), ChannelError>
where
    F: std::future::Future<Output = Result<(), ChannelError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::Timeout(timeout.as_secs())),
    }
}
