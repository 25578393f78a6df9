use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

/// Reads and deserializes a JSON file.
///
/// # Arguments
/// * `path` - Path to the JSON file
///
/// # Example
/// ```no_run
/// use utils::read_json_file;
///
/// let accounts: serde_json::Value = read_json_file("recordings/accounts.json").unwrap();
/// println!("{accounts}");
/// ```
pub fn read_json_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();

    let mut file = File::open(path).with_context(|| format!("Cannot open {:?}", path))?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    serde_json::from_str(&contents).with_context(|| format!("{:?} is not valid JSON", path))
}

/// Like `read_json_file`, but a missing file is `Ok(None)` instead of an error.
pub fn read_optional_json_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<Option<T>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    read_json_file(path).map(Some)
}

/// Serializes `value` to `path`, creating parent directories as needed.
pub fn write_json_file<T: Serialize, P: AsRef<Path>>(path: P, value: &T, pretty: bool) -> Result<PathBuf> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create directory {:?}", parent))?;
    }

    let formatted = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };

    let mut file = File::create(path).with_context(|| format!("Cannot create file at {:?}", path))?;
    file.write_all(formatted.as_bytes())?;

    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");

        let written = write_json_file(&path, &json!({"transactions": []}), true).unwrap();
        assert_eq!(written, path);

        let value: Value = read_json_file(&path).unwrap();
        assert_eq!(value, json!({"transactions": []}));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<Value> = read_optional_json_file(dir.path().join("absent.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_json_file::<Value, _>(&path).unwrap_err();
        assert!(err.to_string().contains("is not valid JSON"));
    }
}
