//! Minimal `.env` parser: KEY=VALUE lines into a map. Application order and
//! precedence live in the crate root.

use std::collections::HashMap;
use std::path::Path;

fn dotenv_path(override_dir: Option<&Path>) -> Option<std::path::PathBuf> {
    let dir = override_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;
    let path = dir.join(".env");
    (path.is_file()).then_some(path)
}

/// KEY=VALUE per line; `#` comment lines skipped; values optionally single-
/// or double-quoted (double quotes support `\"`); no multiline values.
fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value[1..value.len() - 1].replace("\\\"", "\"")
        } else if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
            value[1..value.len() - 1].to_string()
        } else {
            value.to_string()
        };
        out.insert(key.to_string(), value);
    }
    out
}

/// Loads `.env` from `override_dir` or the current directory. A missing file
/// is an empty map, not an error.
pub fn load_env_map(override_dir: Option<&Path>) -> std::io::Result<HashMap<String, String>> {
    let Some(path) = dotenv_path(override_dir) else {
        return Ok(HashMap::new());
    };
    Ok(parse_dotenv(&std::fs::read_to_string(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_quoted_and_escaped_values() {
        let m = parse_dotenv("A=1\nB=\"two words\"\nC='single'\nD=\"say \\\"hi\\\"\"\n");
        assert_eq!(m.get("A").map(String::as_str), Some("1"));
        assert_eq!(m.get("B").map(String::as_str), Some("two words"));
        assert_eq!(m.get("C").map(String::as_str), Some("single"));
        assert_eq!(m.get("D").map(String::as_str), Some("say \"hi\""));
    }

    #[test]
    fn comments_blank_lines_and_garbage_are_skipped() {
        let m = parse_dotenv("# c\n\nNOEQUALS\n=val\nK=ok\n");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("K").map(String::as_str), Some("ok"));
    }

    #[test]
    fn empty_values_are_kept() {
        let m = parse_dotenv("K=\nQ=\"\"\n");
        assert_eq!(m.get("K").map(String::as_str), Some(""));
        assert_eq!(m.get("Q").map(String::as_str), Some(""));
    }

    #[test]
    fn missing_file_is_an_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_env_map(Some(dir.path())).unwrap().is_empty());
    }

    #[test]
    fn file_is_read_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "X=1\n").unwrap();
        let m = load_env_map(Some(dir.path())).unwrap();
        assert_eq!(m.get("X").map(String::as_str), Some("1"));
    }
}
