//! Helpers for the JSON documents exchanged with the source and target APIs.
//!
//! Items are passed through as ordered key/value maps. The pipeline only ever
//! removes fields, projects reference sub-properties, and overlays natural-key
//! values; it never interprets the rest of the payload.

use apipub_common::{PublisherError, Result};
use chrono::{DateTime, NaiveDateTime, NaiveTime};
use serde_json::{Map, Value};

/// A single resource item as an ordered JSON object.
pub type Document = Map<String, Value>;

/// Fields the target API assigns itself and rejects on write.
pub const SERVER_ASSIGNED_FIELDS: [&str; 3] = ["id", "_etag", "_lastModifiedDate"];

const REFERENCE_SUFFIX: &str = "Reference";
const DESCRIPTORS_SUFFIX: &str = "Descriptors";

/// Convert a parsed JSON value into a document, rejecting non-objects.
pub fn into_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(PublisherError::invalid_document(format!(
            "expected a JSON object, found {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The item's `id`, or an empty string when absent.
pub fn item_id(doc: &Document) -> String {
    match doc.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    }
}

/// Remove every named top-level field.
pub fn strip_fields(doc: &mut Document, fields: &[&str]) {
    for field in fields {
        doc.shift_remove(*field);
    }
}

/// Remove the `link` object from every `...Reference` property.
pub fn strip_reference_links(doc: &mut Document) {
    for (name, value) in doc.iter_mut() {
        if !name.ends_with(REFERENCE_SUFFIX) {
            continue;
        }
        if let Value::Object(reference) = value {
            reference.shift_remove("link");
        }
    }
}

/// Overlay natural-key values onto a fetched item.
///
/// A key lands on a top-level scalar of the same name, and on the same-named
/// sub-property of every `...Reference` object. Keys matching nothing are
/// ignored. Returns the number of properties written.
pub fn apply_key_values(doc: &mut Document, key_values: &Document) -> usize {
    let mut applied = 0;

    for (key, new_value) in key_values {
        if let Some(existing) = doc.get_mut(key) {
            if !existing.is_object() && !existing.is_array() {
                *existing = new_value.clone();
                applied += 1;
            }
        }

        for (name, value) in doc.iter_mut() {
            if !name.ends_with(REFERENCE_SUFFIX) {
                continue;
            }
            if let Value::Object(reference) = value {
                if let Some(existing) = reference.get_mut(key) {
                    *existing = new_value.clone();
                    applied += 1;
                }
            }
        }
    }

    applied
}

/// Build `field=value&...` for a natural-key lookup.
///
/// Values are URL-encoded. Date-times at midnight collapse to `yyyy-MM-dd`;
/// other non-string values use their JSON text without quotes.
pub fn key_values_query(key_values: &Document) -> String {
    key_values
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(&format_key_value(value))
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn format_key_value(value: &Value) -> String {
    match value {
        Value::String(text) => as_date_only(text).unwrap_or_else(|| text.clone()),
        other => other.to_string().trim_matches('"').to_string(),
    }
}

fn as_date_only(text: &str) -> Option<String> {
    let date_time = DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.naive_local())
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;

    (date_time.time() == NaiveTime::MIN).then(|| date_time.date().format("%Y-%m-%d").to_string())
}

/// Whether the resource is a descriptor (controlled vocabulary) collection.
pub fn is_descriptor(resource_url: &str) -> bool {
    last_segment(resource_url).ends_with(DESCRIPTORS_SUFFIX)
}

/// The surrogate id field of a descriptor resource,
/// e.g. `/ed-fi/gradeLevelDescriptors` -> `gradeLevelDescriptorId`.
pub fn descriptor_id_field(resource_url: &str) -> Option<String> {
    let segment = last_segment(resource_url);
    segment
        .strip_suffix('s')
        .filter(|_| segment.ends_with(DESCRIPTORS_SUFFIX))
        .map(|singular| format!("{}Id", singular))
}

/// Last path segment, ignoring query strings and `#` node suffixes.
pub fn last_segment(resource_url: &str) -> &str {
    let path = resource_url
        .split(['?', '#'])
        .next()
        .unwrap_or(resource_url)
        .trim_end_matches('/');
    path.rsplit('/').next().unwrap_or(path)
}

/// Property name of a reference, e.g. `StudentSchoolAssociation` -> `studentSchoolAssociationReference`.
pub fn reference_property_name(referenced_resource: &str) -> String {
    let mut chars = referenced_resource.chars();
    match chars.next() {
        Some(first) => format!(
            "{}{}{}",
            first.to_lowercase(),
            chars.as_str(),
            REFERENCE_SUFFIX
        ),
        None => REFERENCE_SUFFIX.to_lowercase(),
    }
}

/// The `link.href` embedded in a reference property, if present.
pub fn reference_link_href<'a>(doc: &'a Document, reference_property: &str) -> Option<&'a str> {
    doc.get(reference_property)?
        .get("link")?
        .get("href")?
        .as_str()
}
