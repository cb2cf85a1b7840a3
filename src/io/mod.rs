//! JSON document I/O: BOM-tolerant reads, atomic writes, permission
//! restriction.
//!
//! Invariants:
//!   - Reads strip a UTF-8 BOM and JSONC `//` comments before parsing.
//!   - Writes are clean UTF-8 without BOM, pretty-printed, trailing newline.
//!   - Writes are atomic: tempfile in the destination directory → flush →
//!     fsync → rename. Readers observe either the old content or the new,
//!     never a torn file.
//!   - `secure` restricts the file to owner-only (POSIX: 0o600, Windows:
//!     ACL) after the rename.

mod permissions;

pub use permissions::restrict_permissions;

use std::fs;
use std::io::Write;
use std::path::Path;

use regex_lite::Regex;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use crate::errors::{Result, SetupError};

/// A JSON document: the top-level object of a config or auth file.
pub type JsonObject = Map<String, Value>;

/// Runtime type name of a JSON value, for schema error messages.
pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Strip single-line `//` comments from JSONC text.
///
/// OpenCode config files are JSON with Comments. Strings are matched first
/// so a `//` inside a string literal survives.
fn strip_jsonc_comments(text: &str) -> String {
    let re = Regex::new(r#""(?:[^"\\]|\\.)*"|//[^\n]*"#).unwrap();
    re.replace_all(text, |caps: &regex_lite::Captures<'_>| {
        let matched = &caps[0];
        if matched.starts_with('"') {
            matched.to_string()
        } else {
            String::new()
        }
    })
    .into_owned()
}

/// Read a JSON file and return its top-level object.
///
/// A missing file is not an error: the first run starts from an empty
/// document.
///
/// # Errors
///
/// [`SetupError::InvalidJson`] if the file cannot be read or does not parse;
/// [`SetupError::InvalidSchema`] if the root is valid JSON but not an object.
pub fn read_json_object(path: &Path) -> Result<JsonObject> {
    if !path.exists() {
        return Ok(Map::new());
    }

    let raw = fs::read_to_string(path).map_err(|err| SetupError::InvalidJson {
        path: path.display().to_string(),
        detail: err.to_string(),
    })?;
    let text = strip_jsonc_comments(raw.strip_prefix('\u{feff}').unwrap_or(&raw));

    let parsed: Value = serde_json::from_str(&text).map_err(|err| SetupError::InvalidJson {
        path: path.display().to_string(),
        detail: err.to_string(),
    })?;

    match parsed {
        Value::Object(map) => Ok(map),
        other => Err(SetupError::InvalidSchema {
            path: path.display().to_string(),
            detail: format!("Expected a JSON object, got {}", json_type_name(&other)),
        }),
    }
}

/// Atomically write `data` as pretty-printed JSON to `path`.
///
/// Serialization happens fully in memory first, so a failing document never
/// touches disk. The bytes are staged in a fresh temp file in the same
/// directory as `path` (the rename must be same-filesystem to be atomic),
/// fsynced, then renamed onto the destination. A temp file left by any
/// pre-rename failure is removed on drop; cleanup failures never mask the
/// original error.
///
/// With `secure`, permissions are restricted to owner-only immediately after
/// the rename. A restriction failure propagates but does not unwind the
/// write: the content is already durably persisted.
pub fn atomic_write_json(path: &Path, data: &JsonObject, secure: bool) -> Result<()> {
    let mut content =
        serde_json::to_string_pretty(data).map_err(|err| SetupError::Io {
            path: path.display().to_string(),
            source: std::io::Error::other(err),
        })?;
    content.push('\n');

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|err| SetupError::Io {
                path: parent.display().to_string(),
                source: err,
            })?;
            parent
        }
        _ => Path::new("."),
    };

    let io_err = |err: std::io::Error| SetupError::Io {
        path: path.display().to_string(),
        source: err,
    };

    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    tmp.write_all(content.as_bytes()).map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|err| SetupError::Io {
        path: path.display().to_string(),
        source: err.error,
    })?;

    if secure {
        restrict_permissions(path, true)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn object(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn read_missing_file_returns_empty_object() {
        let dir = TempDir::new().unwrap();
        let doc = read_json_object(&dir.path().join("nope.json")).unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("opencode.json");
        let doc = object(json!({
            "disabled_providers": ["azure"],
            "provider": {"p": {"whitelist": ["gpt-4o"], "nested": {"n": 1}}},
            "theme": "dark",
        }));

        atomic_write_json(&path, &doc, false).unwrap();
        assert_eq!(read_json_object(&path).unwrap(), doc);
    }

    #[test]
    fn written_file_is_pretty_with_trailing_newline_and_no_bom() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        atomic_write_json(&path, &object(json!({"a": 1})), false).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_ne!(&bytes[..3], [0xEF, 0xBB, 0xBF]);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains("\n  \"a\": 1\n"));
    }

    #[test]
    fn read_tolerates_utf8_bom() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bom.json");
        std::fs::write(&path, b"\xEF\xBB\xBF{\"key\": \"value\"}").unwrap();

        let doc = read_json_object(&path).unwrap();
        assert_eq!(doc.get("key"), Some(&json!("value")));
    }

    #[test]
    fn read_strips_jsonc_comments_outside_strings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jsonc.json");
        std::fs::write(
            &path,
            "{\n  // a comment\n  \"url\": \"https://example.com//path\" // trailing\n}\n",
        )
        .unwrap();

        let doc = read_json_object(&path).unwrap();
        assert_eq!(doc.get("url"), Some(&json!("https://example.com//path")));
    }

    #[test]
    fn invalid_json_names_the_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = read_json_object(&path).unwrap_err();
        match &err {
            SetupError::InvalidJson { path: p, .. } => assert!(p.contains("broken.json")),
            other => panic!("expected InvalidJson, got {other:?}"),
        }
    }

    #[test]
    fn non_object_root_is_a_schema_error_naming_the_type() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("list.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        let err = read_json_object(&path).unwrap_err();
        match &err {
            SetupError::InvalidSchema { detail, .. } => assert!(detail.contains("array")),
            other => panic!("expected InvalidSchema, got {other:?}"),
        }

        std::fs::write(&path, "42").unwrap();
        let err = read_json_object(&path).unwrap_err();
        assert!(err.to_string().contains("number"));
    }

    #[test]
    fn failed_write_leaves_destination_intact_and_no_temp_files() {
        let dir = TempDir::new().unwrap();
        // The destination is a directory, so the final rename fails after
        // the temp file was created and flushed.
        let path = dir.path().join("occupied");
        std::fs::create_dir(&path).unwrap();

        let err = atomic_write_json(&path, &object(json!({"a": 1})), false).unwrap_err();
        assert!(matches!(err, SetupError::Io { .. }));
        assert!(path.is_dir());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name != "occupied")
            .collect();
        assert!(leftovers.is_empty(), "leftover temp files: {leftovers:?}");
    }

    #[test]
    fn overwrite_replaces_whole_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write_json(&path, &object(json!({"old": "long long long value"})), false).unwrap();
        atomic_write_json(&path, &object(json!({"new": 1})), false).unwrap();

        let doc = read_json_object(&path).unwrap();
        assert!(doc.contains_key("new"));
        assert!(!doc.contains_key("old"));
    }

    #[cfg(unix)]
    #[test]
    fn secure_write_restricts_to_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.json");
        atomic_write_json(&path, &object(json!({"p": {"type": "api", "key": "k"}})), true)
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn write_creates_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("c.json");
        atomic_write_json(&path, &object(json!({"ok": true})), false).unwrap();
        assert!(path.exists());
    }
}
