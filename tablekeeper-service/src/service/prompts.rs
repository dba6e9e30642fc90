//! System prompt building and message formatting for LLM interactions.

use crate::context::{CanonContext, ContextMessage};
use crate::db::MessageRole;
use crate::llm::{ApiMessage, Role};
use crate::session::Session;

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("../../prompts/system.txt");

const SUMMARY_SYSTEM_PROMPT: &str = "You condense tabletop roleplaying transcripts. \
Write a compact summary of the events, decisions, open threads and important \
non-player characters so the session can continue without the full transcript. \
Use plain prose and keep names exact.";

/// Build system prompt from template
pub(crate) fn build_system_prompt(session: &Session, canon: &CanonContext) -> String {
    let role_name = if session.is_gm { "Game Master" } else { "Player" };
    let canon_text = if canon.messages.is_empty() {
        "No canon has been published yet.".to_string()
    } else {
        canon
            .messages
            .iter()
            .enumerate()
            .map(|(i, entry)| format!("[{}] {}", i + 1, entry.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    SYSTEM_PROMPT_TEMPLATE
        .replace("{world_id}", &session.world_id)
        .replace("{user_name}", session.display_name())
        .replace("{role_name}", role_name)
        .replace("{canon}", &canon_text)
}

/// Convert stored history to wire messages.
///
/// Summaries become user messages under `summary_heading`. Leading
/// assistant messages are dropped since a request must open with the user.
pub(crate) fn to_api_messages(history: &[ContextMessage], summary_heading: &str) -> Vec<ApiMessage> {
    history
        .iter()
        .skip_while(|m| m.role == MessageRole::Assistant)
        .map(|m| match m.role {
            MessageRole::User => ApiMessage::user(&m.content),
            MessageRole::Assistant => ApiMessage::assistant(&m.content),
            MessageRole::Summary => ApiMessage::user(format!("[{summary_heading}]\n{}", m.content)),
        })
        .collect()
}

/// System prompt and transcript for a summarization request
pub(crate) fn build_summary_prompt(
    old_messages: &[ContextMessage],
    previous_summary: Option<&str>,
) -> (String, String) {
    let mut transcript = String::new();
    if let Some(summary) = previous_summary {
        transcript.push_str("Earlier summary:\n");
        transcript.push_str(summary);
        transcript.push_str("\n\nTranscript since then:\n");
    }
    for message in old_messages {
        let speaker = match message.role {
            MessageRole::User => "Players",
            MessageRole::Assistant => "Narrator",
            MessageRole::Summary => "Summary",
        };
        transcript.push_str(&format!("{speaker}: {}\n\n", message.content.trim()));
    }

    (SUMMARY_SYSTEM_PROMPT.to_string(), transcript.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MessageContent;
    use crate::session::tests::fake_connection;
    use chrono::Utc;

    fn session(is_gm: bool) -> Session {
        let (conn, _rx) = fake_connection();
        Session {
            world_id: "world-1".to_string(),
            connection: conn.handle().clone(),
            display_name: Some("Dana".to_string()),
            user_id: "u1".to_string(),
            user_name: "dana".to_string(),
            is_gm,
            connected_at: Utc::now(),
        }
    }

    #[test]
    fn test_system_prompt_fills_placeholders() {
        let canon = CanonContext {
            messages: vec!["The bridge is out.".to_string()],
            total_tokens: 5,
        };
        let prompt = build_system_prompt(&session(true), &canon);

        assert!(prompt.contains("World: world-1"));
        assert!(prompt.contains("Speaking with: Dana (Game Master)"));
        assert!(prompt.contains("[1] The bridge is out."));
        assert!(!prompt.contains('{'));
    }

    #[test]
    fn test_system_prompt_without_canon() {
        let prompt = build_system_prompt(&session(false), &CanonContext::default());
        assert!(prompt.contains("(Player)"));
        assert!(prompt.contains("No canon has been published yet."));
    }

    #[test]
    fn test_api_messages_drop_leading_assistant_and_render_summary() {
        let history = vec![
            ContextMessage {
                role: MessageRole::Assistant,
                content: "orphaned reply".to_string(),
            },
            ContextMessage {
                role: MessageRole::Summary,
                content: "The party reached the keep.".to_string(),
            },
            ContextMessage {
                role: MessageRole::Assistant,
                content: "The gate creaks.".to_string(),
            },
        ];

        let messages = to_api_messages(&history, "Summary of earlier conversation");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(
            messages[0].content,
            MessageContent::Text(
                "[Summary of earlier conversation]\nThe party reached the keep.".to_string()
            )
        );
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[test]
    fn test_summary_prompt_includes_previous_summary() {
        let old = vec![ContextMessage {
            role: MessageRole::User,
            content: "We open the door.".to_string(),
        }];
        let (_system, transcript) = build_summary_prompt(&old, Some("They arrived."));
        assert!(transcript.starts_with("Earlier summary:\nThey arrived."));
        assert!(transcript.ends_with("Players: We open the door."));
    }
}
