//! Product rows and JSONL helpers

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use eyre::{Context, Result, eyre};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// One product row: an arbitrary JSON object
pub type Product = Map<String, Value>;

/// Load products from a `.jsonl` file
///
/// Lines that are not JSON objects are skipped with a warning. When `limit`
/// is set, reading stops after that many lines (skipped lines included).
pub fn load_products(path: &Path, limit: Option<usize>) -> Result<Vec<Product>> {
    debug!(?path, ?limit, "load_products: called");
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return Err(eyre!("Expected a .jsonl file, got {}", path.display()));
    }

    let file = File::open(path).context(format!("Failed to open products file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut products = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        if limit.is_some_and(|limit| line_no >= limit) {
            break;
        }
        let line = line.context("Failed to read products file")?;
        match serde_json::from_str::<Value>(line.trim()) {
            Ok(Value::Object(product)) => products.push(product),
            Ok(other) => warn!(line = line_no + 1, kind = %json_kind(&other), "load_products: not an object, skipping"),
            Err(e) => warn!(line = line_no + 1, error = %e, "load_products: skipping malformed line"),
        }
    }

    info!("Loaded {} products from {}", products.len(), path.display());
    Ok(products)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Write one JSON value per line, replacing any existing file
pub fn save_jsonl<T: Serialize>(entries: &[T], path: &Path) -> Result<usize> {
    debug!(?path, count = entries.len(), "save_jsonl: called");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context(format!("Failed to create {}", parent.display()))?;
    }
    let file = File::create(path).context(format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for entry in entries {
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    info!("Saved {} lines to {}", entries.len(), path.display());
    Ok(entries.len())
}

/// Text of a product field
///
/// Strings are used as-is, arrays of strings are joined with a space, and
/// numbers and booleans are stringified. Missing, null and empty values give `None`.
pub fn field_text(product: &Product, key: &str) -> Option<String> {
    let text = match product.get(key)? {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

/// Id value of a product, usable as correlation metadata
pub fn product_id(product: &Product, id_key: &str) -> Option<Value> {
    match product.get(id_key) {
        None | Some(Value::Null) => None,
        Some(id) => Some(id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write as _;

    fn product(value: Value) -> Product {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_load_products_rejects_other_extensions() {
        let file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        let err = load_products(file.path(), None).unwrap_err();
        assert!(err.to_string().contains(".jsonl"));
    }

    #[test]
    fn test_load_products_skips_bad_lines_and_honours_limit() {
        let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
        writeln!(file, r#"{{"item_id": "A1", "title": "Mug"}}"#).unwrap();
        writeln!(file, "{{broken").unwrap();
        writeln!(file, "[1, 2]").unwrap();
        writeln!(file, r#"{{"item_id": "A2", "title": "Cup"}}"#).unwrap();
        writeln!(file, r#"{{"item_id": "A3", "title": "Jar"}}"#).unwrap();

        let all = load_products(file.path(), None).unwrap();
        assert_eq!(all.len(), 3);

        let limited = load_products(file.path(), Some(4)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[1]["item_id"], json!("A2"));
    }

    #[test]
    fn test_save_jsonl_writes_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/requests.jsonl");

        let written = save_jsonl(&[json!({"a": 1}), json!({"b": 2})], &path).unwrap();
        assert_eq!(written, 2);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"a\":1}\n{\"b\":2}\n");
    }

    #[test]
    fn test_field_text_shapes() {
        let p = product(json!({
            "title": "  Travel Mug ",
            "description": ["Keeps coffee hot.", "", "Leak proof."],
            "price": 12.5,
            "empty": "",
            "nothing": null,
        }));
        assert_eq!(field_text(&p, "title").as_deref(), Some("Travel Mug"));
        assert_eq!(field_text(&p, "description").as_deref(), Some("Keeps coffee hot. Leak proof."));
        assert_eq!(field_text(&p, "price").as_deref(), Some("12.5"));
        assert_eq!(field_text(&p, "empty"), None);
        assert_eq!(field_text(&p, "nothing"), None);
        assert_eq!(field_text(&p, "missing"), None);
    }

    #[test]
    fn test_product_id() {
        let p = product(json!({"item_id": "B07", "n": null}));
        assert_eq!(product_id(&p, "item_id"), Some(json!("B07")));
        assert_eq!(product_id(&p, "n"), None);
        assert_eq!(product_id(&p, "id"), None);
    }
}
