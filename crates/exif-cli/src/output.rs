use exif_runtime::{MetadataRecord, BINARY_PLACEHOLDER};
use serde_json::Value;
use std::fmt::Write;

/// Render one record as aligned `Tag : value` rows, sorted by tag.
///
/// Binary placeholders are skipped. With `header` set the block is framed
/// by a `======== <path>` line and a trailing blank line.
pub fn render_text(path: &str, record: &MetadataRecord, header: bool) -> String {
    let mut out = String::new();
    if header {
        let _ = writeln!(out, "======== {path}");
    }

    let mut rows: Vec<_> = record.iter().collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));
    for (tag, value) in rows {
        if value.as_str() == Some(BINARY_PLACEHOLDER) {
            continue;
        }
        let _ = writeln!(out, "{tag:<32} : {}", display_value(value));
    }

    if header {
        out.push('\n');
    }
    out
}

/// Render all records as one pretty-printed JSON array.
pub fn render_json(records: &[MetadataRecord]) -> serde_json::Result<String> {
    let mut out = serde_json::to_string_pretty(records)?;
    out.push('\n');
    Ok(out)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> MetadataRecord {
        match value {
            Value::Object(map) => MetadataRecord::from(map),
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn text_rows_are_sorted_aligned_and_skip_binary() {
        let record = record(json!({
            "MIMEType": "image/jpeg",
            "FileType": "JPEG",
            "ImageWidth": 8,
            "ThumbnailImage": "[binary data]",
        }));

        let text = render_text("photo.jpg", &record, false);
        let expected = format!(
            "{:<32} : JPEG\n{:<32} : 8\n{:<32} : image/jpeg\n",
            "FileType", "ImageWidth", "MIMEType"
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn header_frames_block() {
        let record = record(json!({"FileType": "PNG"}));
        let text = render_text("a.png", &record, true);
        assert!(text.starts_with("======== a.png\n"));
        assert!(text.ends_with(" : PNG\n\n"));
    }

    #[test]
    fn json_output_is_an_indented_array() {
        let records = vec![record(json!({"FileType": "JPEG", "SourceFile": "a.jpg"}))];
        let text = render_json(&records).unwrap();
        assert_eq!(
            text,
            "[\n  {\n    \"FileType\": \"JPEG\",\n    \"SourceFile\": \"a.jpg\"\n  }\n]\n"
        );
    }

    #[test]
    fn non_string_values_print_as_json() {
        assert_eq!(display_value(&json!("x")), "x");
        assert_eq!(display_value(&json!(1.5)), "1.5");
        assert_eq!(display_value(&json!(true)), "true");
        assert_eq!(display_value(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
