use serde::Deserialize;

/// Stop sequences applied to every request on top of caller-supplied ones.
/// They keep the model from writing the next turn of the transcript itself.
pub const DEFAULT_STOP_SEQUENCES: [&str; 3] = ["</s>", "Human:", "Assistant:"];

/// One prior turn of conversation supplied by the caller.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ContextTurn {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

fn default_role() -> String {
    "user".to_string()
}

/// Render the conversation as a `Human:`/`Assistant:` transcript that ends
/// with an open assistant turn. Turns with other roles are skipped.
pub fn format_prompt(message: &str, context: &[ContextTurn]) -> String {
    let mut prompt = String::new();
    for turn in context {
        let speaker = match turn.role.as_str() {
            "user" => "Human",
            "assistant" => "Assistant",
            _ => continue,
        };
        prompt.push_str(speaker);
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push('\n');
    }
    prompt.push_str("Human: ");
    prompt.push_str(message);
    prompt.push_str("\nAssistant:");
    prompt
}

/// Defaults followed by caller-supplied stop sequences, without duplicates.
pub fn stop_sequences(extra: &[String]) -> Vec<String> {
    let mut stops: Vec<String> = DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect();
    for s in extra {
        if !s.is_empty() && !stops.contains(s) {
            stops.push(s.clone());
        }
    }
    stops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: &str, content: &str) -> ContextTurn {
        ContextTurn {
            role: role.into(),
            content: content.into(),
        }
    }

    #[test]
    fn message_only() {
        assert_eq!(format_prompt("hi", &[]), "Human: hi\nAssistant:");
    }

    #[test]
    fn context_turns_precede_message() {
        let context = vec![turn("user", "write fizzbuzz"), turn("assistant", "done")];
        assert_eq!(
            format_prompt("now in rust", &context),
            "Human: write fizzbuzz\nAssistant: done\nHuman: now in rust\nAssistant:"
        );
    }

    #[test]
    fn unknown_roles_are_skipped() {
        let context = vec![turn("system", "be terse"), turn("user", "q")];
        assert_eq!(format_prompt("m", &context), "Human: q\nHuman: m\nAssistant:");
    }

    #[test]
    fn missing_role_defaults_to_user() {
        let parsed: ContextTurn = serde_json::from_str(r#"{"content":"x"}"#).unwrap();
        assert_eq!(parsed.role, "user");
    }

    #[test]
    fn stop_sequences_merge_without_duplicates() {
        let stops = stop_sequences(&["Human:".into(), "```".into(), String::new()]);
        assert_eq!(stops, vec!["</s>", "Human:", "Assistant:", "```"]);
    }
}
