//! Centralised prompt texts and tool-call JSON schemas.
//!
//! Every LLM prompt and structured-output schema lives here so they can be
//! audited, tuned, and versioned in one place.  The rest of the codebase
//! imports from `crate::prompts`.

use std::collections::HashSet;

// ---------------------------------------------------------------------------
// pipeline/extract.rs — fact extraction
// ---------------------------------------------------------------------------

/// The extractor contract is deliberately rigid: a bare JSON array of
/// `{"key","value"}` objects, no prose, no fences. The parser clips the
/// response to `[first '[' ..= last ']']` and rejects anything that still
/// fails strict parsing, so a chunk yields zero facts rather than garbage.
pub fn extract_system_prompt(categories: &HashSet<String>) -> String {
    let mut cats: Vec<&str> = categories.iter().map(String::as_str).collect();
    cats.sort_unstable();
    format!(
        r#"You are a fact extraction engine for a personal memory store. Given a conversation between a user and a coding assistant, extract durable facts as key/value pairs.

Output EXACTLY a JSON array and nothing else — no prose, no markdown fences, no explanations:
[{{"key": "user.name", "value": "Alice"}}, {{"key": "project.language", "value": "Rust"}}]

Key grammar: <category>.<segment>(.<segment>)* — lowercase, dot-separated, at least two segments.
Allowed categories: {}.

EXTRACT (durable, re-usable knowledge):
- Identity and preferences: who the user is, what they like, how they work
- Project facts: languages, frameworks, architecture decisions and their reasons
- Environment facts: OS, editors, paths, services the user relies on
- Corrections: things the user said were wrong and what is right instead
- Events with lasting relevance: migrations, renames, moves

SKIP (not memory):
- Transient states: "tests are passing", "server is up"
- Step-by-step operational chatter, debug output, log lines
- Anything the assistant said that the user did not confirm

Rules:
- Zero facts is a valid answer: output []
- value is a plain string in the language of the conversation; NEVER translate
- one fact per key; if the conversation updates a fact, output only the latest value
- keys must use only the allowed categories"#,
        cats.join(", ")
    )
}

// ---------------------------------------------------------------------------
// pipeline/dedup.rs — semantic dedup decision
// ---------------------------------------------------------------------------

pub const DEDUP_SYSTEM: &str = "You decide whether an incoming fact duplicates an existing one in a memory store.\n\
    You are given a CANDIDATE fact and a list of EXISTING facts with similarity scores.\n\
    \n\
    Choose exactly one action:\n\
    - skip: the candidate adds nothing — an existing fact already says this\n\
    - merge: the candidate is a newer or better phrasing of ONE existing fact; name that fact's key as target\n\
    - create: the candidate is genuinely new information\n\
    \n\
    Prefer merge over create when the candidate and an existing fact describe the same property\n\
    of the same subject, even under different key spellings.";

pub fn dedup_decision_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "action": {
                "type": "string",
                "enum": ["skip", "merge", "create"],
                "description": "What to do with the candidate fact"
            },
            "target": {
                "type": "string",
                "description": "Key of the existing fact to merge into (required for merge)"
            },
            "reason": {
                "type": "string",
                "description": "One short sentence"
            }
        },
        "required": ["action"]
    })
}
