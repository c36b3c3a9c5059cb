//! Changeset bundles: the serialized CREATE/MODIFY/DELETE proposal format.
//!
//! A bundle is text sections, each introduced by a `change: <OP> <path>`
//! header followed by a fenced content block (DELETE takes no content).
//! Parsing is a pure function over the text; section order defines
//! application order; any malformed section rejects the whole bundle.
//! `serialize ∘ parse` is the identity up to whitespace normalization.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum BundleError {
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },
    #[error("empty bundle")]
    Empty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Create,
    Modify,
    Delete,
}

impl ChangeOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(Self::Create),
            "MODIFY" => Some(Self::Modify),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Modify => "MODIFY",
            Self::Delete => "DELETE",
        }
    }
}

/// One operation against the VFS.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub op: ChangeOp,
    pub path: String,
    pub content: String,
}

/// An ordered bundle of changes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesetBundle {
    pub changes: Vec<Change>,
}

const FENCE: &str = "```";

/// Parses a bundle. Pure; rejects the whole text on the first bad section.
pub fn parse(text: &str) -> Result<ChangesetBundle, BundleError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut changes = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i].trim();
        if line.is_empty() {
            i += 1;
            continue;
        }
        let Some(header) = line.strip_prefix("change:") else {
            return Err(BundleError::Malformed {
                line: i + 1,
                message: format!("expected 'change: <OP> <path>', got '{line}'"),
            });
        };
        let mut parts = header.trim().splitn(2, ' ');
        let op = parts
            .next()
            .and_then(ChangeOp::parse)
            .ok_or(BundleError::Malformed {
                line: i + 1,
                message: "operation must be CREATE, MODIFY, or DELETE".to_string(),
            })?;
        let path = parts
            .next()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(BundleError::Malformed {
                line: i + 1,
                message: "missing path".to_string(),
            })?
            .to_string();
        i += 1;

        if op == ChangeOp::Delete {
            changes.push(Change {
                op,
                path,
                content: String::new(),
            });
            continue;
        }

        // Content fence.
        while i < lines.len() && lines[i].trim().is_empty() {
            i += 1;
        }
        if i >= lines.len() || lines[i].trim() != FENCE {
            return Err(BundleError::Malformed {
                line: i + 1,
                message: format!("{} requires a fenced content block", op.as_str()),
            });
        }
        i += 1;
        let start = i;
        while i < lines.len() && lines[i].trim() != FENCE {
            i += 1;
        }
        if i >= lines.len() {
            return Err(BundleError::Malformed {
                line: start,
                message: "unterminated content fence".to_string(),
            });
        }
        changes.push(Change {
            op,
            path,
            content: lines[start..i].join("\n"),
        });
        i += 1; // closing fence
    }

    if changes.is_empty() {
        return Err(BundleError::Empty);
    }
    Ok(ChangesetBundle { changes })
}

/// The canonical text form.
pub fn serialize(bundle: &ChangesetBundle) -> String {
    let mut out = String::new();
    for change in &bundle.changes {
        out.push_str(&format!("change: {} {}\n", change.op.as_str(), change.path));
        if change.op != ChangeOp::Delete {
            out.push_str(FENCE);
            out.push('\n');
            out.push_str(&change.content);
            if !change.content.is_empty() {
                out.push('\n');
            }
            out.push_str(FENCE);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLE: &str = "\
change: CREATE /notes/a.md
```
HELLO
```

change: MODIFY /config/app.json
```
{\"debug\": true}
```

change: DELETE /tmp/scratch
";

    #[test]
    fn parses_sections_in_order() {
        let bundle = parse(BUNDLE).unwrap();
        assert_eq!(bundle.changes.len(), 3);
        assert_eq!(bundle.changes[0].op, ChangeOp::Create);
        assert_eq!(bundle.changes[0].path, "/notes/a.md");
        assert_eq!(bundle.changes[0].content, "HELLO");
        assert_eq!(bundle.changes[2].op, ChangeOp::Delete);
        assert_eq!(bundle.changes[2].content, "");
    }

    #[test]
    fn parse_serialize_round_trips() {
        let bundle = parse(BUNDLE).unwrap();
        let text = serialize(&bundle);
        assert_eq!(parse(&text).unwrap(), bundle);
    }

    #[test]
    fn bad_section_rejects_the_whole_bundle() {
        let text = "change: CREATE /a\n```\nok\n```\nchange: FROB /b\n```\nx\n```\n";
        assert!(matches!(parse(text), Err(BundleError::Malformed { .. })));
    }

    #[test]
    fn missing_fence_is_rejected() {
        assert!(matches!(
            parse("change: CREATE /a\nno fence here"),
            Err(BundleError::Malformed { .. })
        ));
    }

    #[test]
    fn unterminated_fence_is_rejected() {
        assert!(matches!(
            parse("change: CREATE /a\n```\nbody"),
            Err(BundleError::Malformed { .. })
        ));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(parse("\n\n"), Err(BundleError::Empty));
    }

    #[test]
    fn multiline_content_survives() {
        let text = "change: CREATE /a\n```\nline one\n\nline three\n```\n";
        let bundle = parse(text).unwrap();
        assert_eq!(bundle.changes[0].content, "line one\n\nline three");
    }
}
