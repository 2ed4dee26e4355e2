//! SMS listing, export, conversation grouping and bulk import

use super::{json_body, ApiError, HandlerResult};
use crate::http::{Request, Response};
use crate::providers::{SmsMessage, SmsProvider};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_PAGE: usize = 100;

pub struct SmsHandler {
    sms: Arc<dyn SmsProvider>,
}

#[derive(Deserialize)]
struct ImportBody {
    messages: Vec<SmsMessage>,
}

impl SmsHandler {
    pub fn new(sms: Arc<dyn SmsProvider>) -> Self {
        Self { sms }
    }

    pub fn handle(&self, action: &str, request: &Request) -> HandlerResult {
        match action {
            "list" => {
                let limit: usize = request
                    .query_param("limit")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_PAGE);
                let offset: usize = request
                    .query_param("offset")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);

                let messages = self.sms.list(limit, offset)?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "limit": limit,
                    "offset": offset,
                    "count": messages.len(),
                    "messages": messages,
                })))
            }
            "export" => {
                let messages = self.sms.all()?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "count": messages.len(),
                    "messages": messages,
                })))
            }
            "count" => {
                let count = self.sms.count()?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "count": count,
                })))
            }
            "conversations" => {
                let messages = self.sms.all()?;
                let mut threads: BTreeMap<i64, (String, usize, u64, String)> = BTreeMap::new();
                for message in messages {
                    let entry = threads
                        .entry(message.thread_id)
                        .or_insert_with(|| (message.address.clone(), 0, 0, String::new()));
                    entry.1 += 1;
                    if message.date >= entry.2 {
                        entry.2 = message.date;
                        entry.3 = message.body.chars().take(80).collect();
                    }
                }

                let conversations: Vec<_> = threads
                    .into_iter()
                    .map(|(thread_id, (address, count, last_date, snippet))| {
                        serde_json::json!({
                            "thread_id": thread_id,
                            "address": address,
                            "count": count,
                            "last_date": last_date,
                            "snippet": snippet,
                        })
                    })
                    .collect();

                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "count": conversations.len(),
                    "conversations": conversations,
                })))
            }
            "import" => {
                if request.method != "POST" {
                    return Err(ApiError::BadRequest("import requires POST".to_string()));
                }
                let body: ImportBody = json_body(request)?;
                if body.messages.is_empty() {
                    return Err(ApiError::BadRequest("no messages in body".to_string()));
                }

                let mut imported = 0usize;
                let mut failed = Vec::new();
                for (index, message) in body.messages.into_iter().enumerate() {
                    let address = message.address.clone();
                    match self.sms.insert(message) {
                        Ok(()) => imported += 1,
                        Err(e) => {
                            debug!("SMS import entry {} failed: {}", index, e);
                            failed.push(serde_json::json!({
                                "index": index,
                                "address": address,
                                "error": e.to_string(),
                            }));
                        }
                    }
                }

                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "imported": imported,
                    "failed": failed,
                })))
            }
            _ => Err(ApiError::NotFound(format!("unknown sms action '{}'", action))),
        }
    }
}
