//! Decodes a serialized context document into [`ContextData`].
//!
//! Decoding is tolerant: legacy camelCase keys are tried before snake_case
//! ones, missing or malformed sections default to empty while the others
//! are kept, and an unparseable timestamp becomes the current time. Input
//! that is not a JSON object yields an empty [`ContextData`] instead of an
//! error.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use crate::context_data::{ContextData, FALLBACK_ASSISTANT_ROLE};
use crate::document::{ContextDocument, DocumentFile, DocumentMessage};
use crate::error::{ContextError, Result};
use crate::models::{ChatMessage, FileContext, Role};

/// Never fails; malformed input degrades to [`ContextData::empty`].
pub fn parse(serialized: &str) -> ContextData {
    try_parse(serialized).unwrap_or_else(|e| {
        warn!(error = %e, "discarding malformed context document");
        ContextData::empty()
    })
}

pub fn try_parse(serialized: &str) -> Result<ContextData> {
    let value: serde_json::Value =
        serde_json::from_str(serialized).map_err(|e| ContextError::Parse(e.to_string()))?;
    Ok(from_document(ContextDocument::from_value(&value)?))
}

pub fn from_document(document: ContextDocument) -> ContextData {
    let (assistant_role, context_date) = match document.assistant_role {
        Some(section) => (
            section.description.unwrap_or_else(|| FALLBACK_ASSISTANT_ROLE.to_string()),
            section.context_date.as_deref().and_then(parse_timestamp).unwrap_or_else(Utc::now),
        ),
        None => (FALLBACK_ASSISTANT_ROLE.to_string(), Utc::now()),
    };

    let mut files: Vec<FileContext> = document
        .file_context
        .map(|s| s.files)
        .unwrap_or_default()
        .into_iter()
        .map(file_from_document)
        .collect();
    // Stable, so equal indices keep their serialized order.
    files.sort_by_key(|f| f.order_index);

    let message_history = document
        .message_history
        .map(|s| s.messages)
        .unwrap_or_default()
        .into_iter()
        .filter_map(message_from_document)
        .collect();

    ContextData { message_history, files, assistant_role, context_date }
}

// Documents only carry included files.
fn file_from_document(file: DocumentFile) -> FileContext {
    FileContext {
        display_name: file.display_name,
        original_name: file.original_name,
        content: file.content,
        use_summary: file.use_summary,
        order_index: file.order_index,
        excluded: false,
    }
}

fn message_from_document(message: DocumentMessage) -> Option<ChatMessage> {
    let role = match message.role.parse::<Role>() {
        Ok(role) => role,
        Err(e) => {
            warn!(error = %e, "skipping context message");
            return None;
        }
    };
    let timestamp = parse_timestamp(&message.timestamp).unwrap_or_else(Utc::now);
    Some(ChatMessage::with_timestamp(role, message.content, timestamp))
}

/// RFC 3339, or a naive date-time read as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SCHEMA_VERSION;
    use chrono::TimeZone;

    #[test]
    fn parses_snake_case_document() {
        let built_at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let files = vec![FileContext {
            display_name: "notes".into(),
            original_name: "notes.txt".into(),
            content: "hello".into(),
            order_index: 0,
            ..Default::default()
        }];
        let messages = vec![
            ChatMessage::with_timestamp(Role::User, "hi", built_at),
            ChatMessage::with_timestamp(Role::Assistant, "hello", built_at),
        ];
        let json = ContextDocument::compose("be brief", built_at, &files, &messages).to_json().unwrap();

        let data = try_parse(&json).unwrap();
        assert_eq!(data.assistant_role, "be brief");
        assert_eq!(data.context_date, built_at);
        assert_eq!(data.files, files);
        assert_eq!(data.message_history, messages);
    }

    #[test]
    fn parses_legacy_camel_case_document() {
        let json = r#"{
            "assistantRole": { "description": "legacy", "contextDate": "2024-06-01T08:30:00+02:00" },
            "fileContext": { "totalFiles": 1, "files": [
                { "displayName": "a", "originalName": "a.md", "useSummary": true, "orderIndex": 3, "content": "x" }
            ] },
            "messageHistory": { "messages": [ { "role": "user", "content": "q", "timestamp": "2024-06-01T06:00:00Z" } ] }
        }"#;
        let data = try_parse(json).unwrap();
        assert_eq!(data.assistant_role, "legacy");
        assert_eq!(data.context_date, Utc.with_ymd_and_hms(2024, 6, 1, 6, 30, 0).unwrap());
        assert_eq!(data.files[0].display_name, "a");
        assert_eq!(data.files[0].original_name, "a.md");
        assert!(data.files[0].use_summary);
        assert_eq!(data.files[0].order_index, 3);
        assert_eq!(data.message_history[0].content(), "q");
    }

    #[test]
    fn missing_sections_default() {
        let data = try_parse("{}").unwrap();
        assert!(data.files.is_empty());
        assert!(data.message_history.is_empty());
        assert_eq!(data.assistant_role, FALLBACK_ASSISTANT_ROLE);
    }

    #[test]
    fn missing_version_reads_as_legacy() {
        let doc: ContextDocument = serde_json::from_str("{}").unwrap();
        assert_eq!(doc.schema_version, 1);
        let doc: ContextDocument = serde_json::from_str(r#"{"schemaVersion": 2}"#).unwrap();
        assert_eq!(doc.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn files_resorted_by_order_index() {
        let json = r#"{ "file_context": { "files": [
            { "display_name": "c", "order_index": 2 },
            { "display_name": "a", "order_index": 0 },
            { "display_name": "b", "order_index": 1 }
        ] } }"#;
        let names: Vec<_> = parse(json).files.into_iter().map(|f| f.display_name).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn bad_dates_become_now() {
        let before = Utc::now();
        let json = r#"{ "assistant_role": { "context_date": "yesterday-ish" },
            "message_history": { "messages": [ { "role": "user", "content": "x", "timestamp": "" } ] } }"#;
        let data = parse(json);
        assert!(data.context_date >= before);
        assert!(data.message_history[0].timestamp() >= before);
    }

    #[test]
    fn naive_timestamps_read_as_utc() {
        assert_eq!(
            parse_timestamp("2024-01-02 03:04:05"),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
        );
    }

    #[test]
    fn unknown_roles_are_skipped() {
        let json = r#"{ "message_history": { "messages": [
            { "role": "tool", "content": "x" },
            { "role": "assistant", "content": "y" }
        ] } }"#;
        let data = parse(json);
        assert_eq!(data.message_count(), 1);
        assert_eq!(data.message_history[0].role(), Role::Assistant);
    }

    #[test]
    fn malformed_document_degrades_to_empty() {
        for bad in ["", "not json", "[1,2,3]", "null"] {
            assert!(try_parse(bad).is_err(), "expected error for {bad:?}");
            let data = parse(bad);
            assert!(data.is_empty());
            assert_eq!(data.assistant_role, FALLBACK_ASSISTANT_ROLE);
        }
    }

    #[test]
    fn camel_case_key_wins_when_both_spellings_present() {
        let json = r#"{
            "assistantRole": { "description": "camel" },
            "assistant_role": { "description": "snake" },
            "message_history": { "messages": [ { "role": "user", "content": "keep me" } ] }
        }"#;
        let data = try_parse(json).unwrap();
        assert_eq!(data.assistant_role, "camel");
        assert_eq!(data.message_count(), 1);
        assert_eq!(data.message_history[0].content(), "keep me");
    }

    #[test]
    fn duplicate_field_spellings_inside_a_file_resolve_in_order() {
        let json = r#"{ "fileContext": { "files": [
            { "displayName": "camel", "display_name": "snake", "order_index": 4 }
        ] } }"#;
        let data = parse(json);
        assert_eq!(data.files[0].display_name, "camel");
        assert_eq!(data.files[0].order_index, 4);
    }

    #[test]
    fn null_file_list_keeps_messages() {
        let json = r#"{ "file_context": { "files": null },
            "message_history": { "messages": [ { "role": "user", "content": "still here" } ] } }"#;
        let data = try_parse(json).unwrap();
        assert!(data.files.is_empty());
        assert_eq!(data.message_count(), 1);
    }

    #[test]
    fn null_or_mistyped_message_list_keeps_files() {
        for messages in ["null", r#""nope""#, "{}"] {
            let json = format!(
                r#"{{ "file_context": {{ "files": [ {{ "display_name": "a", "content": "x" }} ] }},
                    "message_history": {{ "messages": {messages} }} }}"#
            );
            let data = try_parse(&json).unwrap();
            assert!(data.message_history.is_empty(), "messages = {messages}");
            assert_eq!(data.file_count(), 1, "messages = {messages}");
        }
    }

    #[test]
    fn mistyped_file_list_and_entries_degrade_per_item() {
        let data = parse(r#"{ "file_context": { "files": "nope" } }"#);
        assert!(data.files.is_empty());

        let data = parse(r#"{ "file_context": { "files": [ 7, { "display_name": "ok" } ] } }"#);
        let names: Vec<_> = data.files.iter().map(|f| f.display_name.as_str()).collect();
        assert_eq!(names, ["ok"]);
    }
}
