//! Contact book access and VCF 3.0 import/export

use super::{ApiError, HandlerResult};
use crate::http::{Request, Response};
use crate::providers::{Contact, ContactsProvider, LabeledValue};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

pub struct ContactsHandler {
    contacts: Arc<dyn ContactsProvider>,
}

#[derive(Deserialize)]
struct ImportBody {
    vcf: String,
}

impl ContactsHandler {
    pub fn new(contacts: Arc<dyn ContactsProvider>) -> Self {
        Self { contacts }
    }

    pub fn handle(&self, action: &str, request: &Request) -> HandlerResult {
        match action {
            "list" => {
                let contacts = self.contacts.list()?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "count": contacts.len(),
                    "contacts": contacts,
                })))
            }
            "count" => {
                let contacts = self.contacts.list()?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "count": contacts.len(),
                })))
            }
            "export-vcf" | "export" => {
                let contacts = self.contacts.list()?;
                let vcf = to_vcf(&contacts);
                Ok(Response::bytes(200, "text/x-vcard", vcf.into_bytes()).with_header(
                    "Content-Disposition",
                    "attachment; filename=\"contacts.vcf\"",
                ))
            }
            "import-vcf" | "import" => {
                if request.method != "POST" {
                    return Err(ApiError::BadRequest("import requires POST".to_string()));
                }
                let vcf_text = self.import_text(request)?;
                let parsed = parse_vcf(&vcf_text);
                if parsed.is_empty() {
                    return Err(ApiError::BadRequest("no vCard blocks in body".to_string()));
                }

                let mut imported = 0usize;
                let mut failed = Vec::new();
                for (index, contact) in parsed.into_iter().enumerate() {
                    let name = contact.name.clone();
                    match self.contacts.insert(contact) {
                        Ok(()) => imported += 1,
                        Err(e) => {
                            debug!("Contact import entry {} failed: {}", index, e);
                            failed.push(serde_json::json!({
                                "index": index,
                                "name": name,
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
            _ => Err(ApiError::NotFound(format!(
                "unknown contacts action '{}'",
                action
            ))),
        }
    }

    /// Accept either `{"vcf": "..."}` or a raw vCard body
    fn import_text(&self, request: &Request) -> Result<String, ApiError> {
        if request.body.is_empty() {
            return Err(ApiError::BadRequest("missing request body".to_string()));
        }
        if let Ok(body) = request.json::<ImportBody>() {
            return Ok(body.vcf);
        }
        Ok(String::from_utf8_lossy(&request.body).into_owned())
    }
}

fn escape_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace('\n', "\\n")
}

fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') | Some('N') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Serialize contacts as VCF 3.0
pub fn to_vcf(contacts: &[Contact]) -> String {
    let mut out = String::new();
    for contact in contacts {
        out.push_str("BEGIN:VCARD\r\nVERSION:3.0\r\n");
        out.push_str(&format!("FN:{}\r\n", escape_value(&contact.name)));

        // N is surname;given;;; best effort from the display name
        let mut parts = contact.name.splitn(2, ' ');
        let given = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        out.push_str(&format!(
            "N:{};{};;;\r\n",
            escape_value(rest),
            escape_value(given)
        ));

        if let Some(org) = &contact.organization {
            out.push_str(&format!("ORG:{}\r\n", escape_value(org)));
        }
        for phone in &contact.phones {
            out.push_str(&format!(
                "TEL;TYPE={}:{}\r\n",
                phone.label.to_uppercase(),
                escape_value(&phone.value)
            ));
        }
        for email in &contact.emails {
            out.push_str(&format!(
                "EMAIL;TYPE={}:{}\r\n",
                email.label.to_uppercase(),
                escape_value(&email.value)
            ));
        }
        out.push_str("END:VCARD\r\n");
    }
    out
}

/// Parse vCard blocks, tolerating unknown properties.
///
/// Handles FN, N, TEL, EMAIL and ORG with optional TYPE parameters and
/// folded continuation lines.
pub fn parse_vcf(text: &str) -> Vec<Contact> {
    // Unfold: a line starting with space or tab continues the previous one
    let mut lines: Vec<String> = Vec::new();
    for raw in text.lines() {
        if (raw.starts_with(' ') || raw.starts_with('\t')) && !lines.is_empty() {
            if let Some(last) = lines.last_mut() {
                last.push_str(raw.trim_start());
            }
        } else {
            lines.push(raw.trim_end().to_string());
        }
    }

    let mut contacts = Vec::new();
    let mut current: Option<Contact> = None;
    let mut fallback_name = String::new();

    for line in lines {
        let upper = line.to_uppercase();
        if upper == "BEGIN:VCARD" {
            current = Some(Contact::default());
            fallback_name.clear();
            continue;
        }
        if upper == "END:VCARD" {
            if let Some(mut contact) = current.take() {
                if contact.name.is_empty() {
                    contact.name = fallback_name.clone();
                }
                if !contact.name.is_empty()
                    || !contact.phones.is_empty()
                    || !contact.emails.is_empty()
                {
                    contacts.push(contact);
                }
            }
            continue;
        }

        let contact = match current.as_mut() {
            Some(c) => c,
            None => continue,
        };

        let (prop, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let mut prop_parts = prop.split(';');
        let name = prop_parts.next().unwrap_or("").to_uppercase();
        let label = prop_parts
            .filter_map(|p| p.strip_prefix("TYPE=").or_else(|| p.strip_prefix("type=")))
            .next()
            .unwrap_or("other")
            .to_lowercase();

        match name.as_str() {
            "FN" => contact.name = unescape_value(value),
            "N" => {
                // surname;given;... kept as fallback if no FN
                let fields: Vec<&str> = value.split(';').collect();
                let given = fields.get(1).copied().unwrap_or("");
                let surname = fields.first().copied().unwrap_or("");
                fallback_name = format!("{} {}", given, surname).trim().to_string();
            }
            "TEL" => contact.phones.push(LabeledValue {
                label,
                value: unescape_value(value),
            }),
            "EMAIL" => contact.emails.push(LabeledValue {
                label,
                value: unescape_value(value),
            }),
            "ORG" => contact.organization = Some(unescape_value(value)),
            _ => {}
        }
    }

    contacts
}
