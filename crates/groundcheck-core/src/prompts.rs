//! Prompt assembly for the primary answer generation.

use crate::domain::{Allowlist, AnswerMode, Preferences, ScoredChunk};

const BASE_INSTRUCTIONS: &str = "You answer questions using only the evidence provided below. \
Cite evidence inline with the token shown next to it, exactly as written: [Claim: id], \
[Quote: id] or [Source: url]. Never invent identifiers. If the evidence does not answer the \
question, say so.";

const STRICT_INSTRUCTIONS: &str = "Every sentence that states a fact, a number, a date or a \
name must carry at least one citation.";

/// Render selected evidence, citable chunks prefixed with their token.
pub fn evidence_context(selected: &[ScoredChunk]) -> String {
    let mut out = String::new();
    for scored in selected {
        let chunk = &scored.chunk;
        match chunk.citation() {
            Some(token) => out.push_str(&format!("{token} {}\n", chunk.content)),
            None => out.push_str(&format!("({}) {}\n", chunk.kind, chunk.content)),
        }
    }
    out
}

fn mode_instructions(mode: AnswerMode) -> &'static str {
    match mode {
        AnswerMode::Quick => "Answer in two or three sentences.",
        AnswerMode::Standard => "Answer in a few focused paragraphs.",
        AnswerMode::Deep => {
            "Give a thorough answer that covers every relevant piece of evidence and notes \
             where the evidence disagrees."
        }
    }
}

/// System prompt for one request.
pub fn system_prompt(
    selected: &[ScoredChunk],
    allowlist: &Allowlist,
    mode: AnswerMode,
    preferences: &Preferences,
    strict: bool,
) -> String {
    let mut prompt = String::from(BASE_INSTRUCTIONS);
    prompt.push(' ');
    prompt.push_str(mode_instructions(mode));
    if strict {
        prompt.push(' ');
        prompt.push_str(STRICT_INSTRUCTIONS);
    }

    if let Some(tone) = &preferences.tone {
        prompt.push_str(&format!("\n\nTone: {tone}."));
    }
    if let Some(profile) = &preferences.profile {
        prompt.push_str(&format!("\nReader profile: {profile}"));
    }
    if !preferences.focus_areas.is_empty() {
        prompt.push_str(&format!(
            "\nEmphasize: {}.",
            preferences.focus_areas.join(", ")
        ));
    }
    if !preferences.style_examples.is_empty() {
        prompt.push_str("\nMatch the style of these earlier answers:");
        for example in preferences.style_examples.iter().take(3) {
            prompt.push_str("\n> ");
            prompt.push_str(example);
        }
    }

    prompt.push_str("\n\nEvidence:\n");
    if selected.is_empty() {
        prompt.push_str("(no evidence was found)\n");
    } else {
        prompt.push_str(&evidence_context(selected));
    }

    if allowlist.is_empty() {
        prompt.push_str("\nNone of this evidence is citable; do not use citation tokens.");
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChunkKind, EvidenceChunk};

    fn scored(chunk: EvidenceChunk) -> ScoredChunk {
        ScoredChunk {
            chunk,
            score: 0.9,
            reasoning: String::new(),
        }
    }

    #[test]
    fn test_evidence_context_shows_citation_tokens() {
        let selected = vec![
            scored(EvidenceChunk::new(ChunkKind::Claim, "Paris is the capital.").with_id("c1")),
            scored(EvidenceChunk::new(ChunkKind::Concept, "Capital city")),
        ];
        let ctx = evidence_context(&selected);
        assert!(ctx.contains("[Claim: c1] Paris is the capital."));
        assert!(ctx.contains("(concept) Capital city"));
    }

    #[test]
    fn test_system_prompt_includes_preferences_and_strictness() {
        let prefs = Preferences {
            tone: Some("friendly".into()),
            focus_areas: vec!["history".into()],
            ..Preferences::default()
        };
        let prompt = system_prompt(&[], &Allowlist::default(), AnswerMode::Quick, &prefs, true);
        assert!(prompt.contains("Tone: friendly."));
        assert!(prompt.contains("Emphasize: history."));
        assert!(prompt.contains(STRICT_INSTRUCTIONS));
        assert!(prompt.contains("(no evidence was found)"));
    }
}
