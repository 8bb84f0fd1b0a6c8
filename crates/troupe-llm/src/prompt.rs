//! Prompt assembly seam.
//!
//! The scheduler treats assembly as a black box: it hands over the speaker,
//! the visible history window, and the cast, and gets back an ordered
//! message list plus stop sequences. Deterministic for identical input.

use troupe_store::{Message, Role, SpaceMembership};

use crate::client::{MessageRole, PromptMessage};

/// Everything the assembler may look at.
pub struct PromptInput<'a> {
    pub speaker: &'a SpaceMembership,
    /// Prompt-visible history window, oldest first. `hidden` rows were
    /// already filtered out by the store.
    pub history: &'a [Message],
    /// Full cast of the space, for name resolution and stop sequences.
    pub participants: &'a [SpaceMembership],
    /// Space-level card handling mode, passed through opaquely.
    pub card_handling: &'a str,
}

/// Output shape consumed by the executor.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub messages: Vec<PromptMessage>,
    pub stop_sequences: Vec<String>,
    pub warnings: Vec<String>,
}

pub trait PromptAssembler: Send + Sync {
    fn assemble(&self, input: &PromptInput<'_>) -> AssembledPrompt;
}

/// Default assembler: persona header plus a name-prefixed transcript.
///
/// Group generations are steered by prefixing each history turn with its
/// author's display name and priming the reply with `Speaker:`. Every other
/// participant's `Name:` prefix becomes a stop sequence so the model cannot
/// speak for the rest of the cast.
pub struct TranscriptAssembler;

impl PromptAssembler for TranscriptAssembler {
    fn assemble(&self, input: &PromptInput<'_>) -> AssembledPrompt {
        let mut warnings = Vec::new();
        let speaker = input.speaker;

        let mut system = format!(
            "You are {name}, one participant in a group roleplay. \
             Reply with {name}'s next message only. Stay in character.",
            name = speaker.display_name
        );
        match &speaker.persona {
            Some(persona) if !persona.is_empty() => {
                system.push_str("\n\n");
                system.push_str(persona);
            }
            _ => warnings.push(format!("{} has no persona card", speaker.display_name)),
        }

        let mut messages = vec![PromptMessage {
            role: MessageRole::System,
            content: system,
            name: None,
        }];

        for msg in input.history {
            let author = msg
                .author_membership_id
                .as_deref()
                .and_then(|id| input.participants.iter().find(|p| p.id == id));
            let author_name = author
                .map(|a| a.display_name.as_str())
                .unwrap_or(match msg.role {
                    Role::System => "narrator",
                    _ => "user",
                });

            let is_speaker = author.is_some_and(|a| a.id == speaker.id);
            messages.push(PromptMessage {
                role: if is_speaker {
                    MessageRole::Assistant
                } else {
                    MessageRole::User
                },
                content: if is_speaker {
                    msg.content.clone()
                } else {
                    format!("{author_name}: {}", msg.content)
                },
                name: Some(sanitize_name(author_name)),
            });
        }

        let stop_sequences = input
            .participants
            .iter()
            .filter(|p| p.id != speaker.id)
            .map(|p| format!("\n{}:", p.display_name))
            .collect();

        AssembledPrompt {
            messages,
            stop_sequences,
            warnings,
        }
    }
}

/// The OpenAI `name` field only allows `[a-zA-Z0-9_-]`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
