//! Citation extraction from tool results.
//!
//! Tools that return an explicit `citations` array of `{title?, url}` objects
//! are taken at their word. Anything else gets a best-effort scan of known
//! field names. Malformed or missing fields are skipped, never reported.

use serde_json::{Map, Value};

use super::types::ToolCitation;

/// Field names that commonly hold sources, in scan order.
const SOURCE_FIELDS: &[&str] = &[
    "sources",
    "links",
    "references",
    "urls",
    "source",
    "link",
    "url",
];

/// Field names that hold a URL inside a source object.
const URL_FIELDS: &[&str] = &["url", "link", "href", "uri"];

/// Field names that hold a title inside a source object.
const TITLE_FIELDS: &[&str] = &["title", "name"];

/// Extract citations from every payload, in order. Duplicates are kept.
pub fn extract_citations(results: &[Value]) -> Vec<ToolCitation> {
    let mut citations = Vec::new();
    for result in results {
        for payload in expand_payload(result) {
            scan_payload(&payload, &mut citations);
        }
    }
    citations
}

/// Render citations as a numbered Markdown block.
pub fn render_sources(citations: &[ToolCitation]) -> String {
    let lines: Vec<String> = citations
        .iter()
        .enumerate()
        .map(|(i, c)| match &c.title {
            Some(title) => format!("{}. [{}]({})", i + 1, title, c.url),
            None => format!("{}. {}", i + 1, c.url),
        })
        .collect();

    format!("\n\n**Sources:**\n{}", lines.join("\n"))
}

/// The payload itself plus any JSON embedded in `{content: [{type: "text", text}]}` items.
fn expand_payload(result: &Value) -> Vec<Value> {
    let mut payloads = vec![result.clone()];

    let Some(items) = result.get("content").and_then(Value::as_array) else {
        return payloads;
    };

    for item in items {
        if item.get("type").and_then(Value::as_str) != Some("text") {
            continue;
        }
        let Some(text) = item.get("text").and_then(Value::as_str) else {
            continue;
        };
        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
            if parsed.is_object() {
                payloads.push(parsed);
            }
        }
    }

    payloads
}

fn scan_payload(payload: &Value, out: &mut Vec<ToolCitation>) {
    let Some(obj) = payload.as_object() else {
        return;
    };

    let explicit = explicit_citations(obj);
    if !explicit.is_empty() {
        out.extend(explicit);
        return;
    }

    scan_source_fields(obj, out, true);

    for (key, value) in obj {
        let lower = key.to_lowercase();
        if SOURCE_FIELDS.contains(&lower.as_str()) {
            continue;
        }
        if !(lower.contains("url") || lower.contains("link")) {
            continue;
        }
        if let Some(s) = value.as_str().filter(|s| s.contains("http")) {
            out.push(ToolCitation::new(None, s));
        }
    }
}

fn explicit_citations(obj: &Map<String, Value>) -> Vec<ToolCitation> {
    obj.get("citations")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(citation_from_object).collect())
        .unwrap_or_default()
}

fn scan_source_fields(obj: &Map<String, Value>, out: &mut Vec<ToolCitation>, descend: bool) {
    for field in SOURCE_FIELDS {
        let Some(value) = obj.get(*field) else {
            continue;
        };

        match value {
            Value::Array(items) => {
                for item in items {
                    scan_item(item, out, descend);
                }
            }
            Value::Object(_) => scan_item(value, out, descend),
            Value::String(s) if s.contains("http") => out.push(ToolCitation::new(None, s.as_str())),
            _ => {}
        }
    }
}

fn scan_item(item: &Value, out: &mut Vec<ToolCitation>, descend: bool) {
    match item {
        Value::String(s) if s.contains("http") => out.push(ToolCitation::new(None, s.as_str())),
        Value::Object(inner) => {
            if let Some(citation) = citation_from_object(item) {
                out.push(citation);
            } else if descend {
                scan_source_fields(inner, out, false);
            }
        }
        _ => {}
    }
}

fn citation_from_object(item: &Value) -> Option<ToolCitation> {
    let obj = item.as_object()?;

    let url = URL_FIELDS
        .iter()
        .filter_map(|f| obj.get(*f).and_then(Value::as_str))
        .find(|u| u.contains("http"))?;

    let title = TITLE_FIELDS
        .iter()
        .filter_map(|f| obj.get(*f).and_then(Value::as_str))
        .next()
        .map(str::to_string);

    Some(ToolCitation::new(title, url))
}
