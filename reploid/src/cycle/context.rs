//! Context curation: retrieval over the artifact store and the knowledge
//! graph, assembled into the turn's prompt artifact.

use std::sync::Arc;

use crate::gateway::ChatMessage;
use crate::knowledge::{KnowledgeBase, TriplePattern};
use crate::vfs::{Vfs, VfsError, WriteOptions};

/// How many artifact paths and facts the scratchpad lists.
const MAX_LISTED_PATHS: usize = 50;
const MAX_LISTED_FACTS: usize = 20;

pub const SYSTEM_PROMPT: &str = "\
You are an autonomous software agent operating on a virtual file system. \
Work toward the goal using the available tools. When you are ready to \
propose changes, reply with a changeset bundle: one `change: <OP> <path>` \
header per operation (CREATE, MODIFY, or DELETE) followed by the new \
content in a ``` fence (DELETE takes none). Propose nothing outside the \
bundle.";

/// The curated context for one turn.
pub struct CuratedContext {
    /// VFS path of the persisted context artifact.
    pub artifact_path: String,
    /// Messages seeding the LLM transcript.
    pub messages: Vec<ChatMessage>,
}

/// Assembles the system prompt and working scratchpad, persists it as the
/// turn's context artifact, and returns the seed messages.
pub fn curate(
    vfs: &Arc<Vfs>,
    knowledge: &Arc<KnowledgeBase>,
    session_id: &str,
    turn_index: usize,
    goal: &str,
) -> Result<CuratedContext, VfsError> {
    let mut scratchpad = format!("# Goal\n\n{goal}\n\n## Artifacts\n\n");
    let paths = vfs.list("/")?;
    for path in paths.iter().take(MAX_LISTED_PATHS) {
        // The runtime's own bookkeeping is noise to the model.
        if path.starts_with("/.") {
            continue;
        }
        scratchpad.push_str(&format!("- {path}\n"));
    }
    if paths.len() > MAX_LISTED_PATHS {
        scratchpad.push_str(&format!("- … {} more\n", paths.len() - MAX_LISTED_PATHS));
    }

    let facts = knowledge.query(&TriplePattern::parse("?s", "?p", "?o"));
    if !facts.is_empty() {
        scratchpad.push_str("\n## Known facts\n\n");
        for bindings in facts.iter().take(MAX_LISTED_FACTS) {
            scratchpad.push_str(&format!(
                "- {} {} {}\n",
                bindings["s"], bindings["p"], bindings["o"]
            ));
        }
    }

    let artifact_path = format!("/sessions/{session_id}/turn-{turn_index}-context.md");
    vfs.write(&artifact_path, &scratchpad, WriteOptions::default())?;

    Ok(CuratedContext {
        artifact_path,
        messages: vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(scratchpad),
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::knowledge::TripleMeta;

    #[test]
    fn curation_persists_the_scratchpad_and_seeds_messages() {
        let bus = Arc::new(EventBus::new());
        let vfs = Arc::new(Vfs::in_memory(Arc::clone(&bus)));
        let knowledge = Arc::new(KnowledgeBase::new(Arc::clone(&vfs), bus));
        vfs.write("/readme.md", "hi", WriteOptions::default()).unwrap();
        vfs.write("/.state/state.json", "{}", WriteOptions::default())
            .unwrap();
        knowledge.add_triple("app", "written_in", "rust", TripleMeta::default());

        let context = curate(&vfs, &knowledge, "sess-1", 0, "do the thing").unwrap();
        let stored = vfs.read(&context.artifact_path).unwrap().content;
        assert!(stored.contains("do the thing"));
        assert!(stored.contains("/readme.md"));
        assert!(!stored.contains("/.state"), "dot-paths stay out of context");
        assert!(stored.contains("app written_in rust"));
        assert_eq!(context.messages.len(), 2);
    }
}
