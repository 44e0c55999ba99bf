//! Conversion of persisted history rows into store messages, plus the
//! reconciliation lookup run after a client-side failure.

use sokhan_llm::HistoryRow;

use crate::ids::MessageId;
use crate::message::{Attachment, Message, MessagePatch, Sender};

fn parse_sender(raw: &str) -> Option<Sender> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "user" => Some(Sender::User),
        "ai" | "assistant" | "bot" => Some(Sender::Ai),
        _ => None,
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// Maps one row; rows with an unknown sender or blank id are skipped.
pub fn message_from_row(row: &HistoryRow) -> Option<Message> {
    let Some(sender) = parse_sender(&row.sender) else {
        tracing::warn!(row_id = %row.id, sender = %row.sender, "skipping history row with unknown sender");
        return None;
    };
    let Ok(id) = MessageId::parse(&row.id) else {
        tracing::warn!(sender = %row.sender, "skipping history row without an id");
        return None;
    };

    let reasoning_text = non_empty(row.reason.as_deref());
    let attachment = non_empty(row.file_url.as_deref()).map(|file_url| Attachment {
        file_url,
        file_type: row.file_type.clone(),
        file_name: row.file_name.clone(),
        file_size: row.file_size,
    });

    Some(Message {
        is_reasoning_complete: reasoning_text.is_some(),
        reasoning_text,
        attachment,
        ..Message::new(id, sender, row.text.clone())
    })
}

/// Last row, provided the user turn before it asked `prompt`.
fn answer_to<'a>(rows: &'a [HistoryRow], prompt: &str) -> Option<&'a HistoryRow> {
    let (last, earlier) = rows.split_last()?;
    let asked = earlier
        .iter()
        .rev()
        .find(|row| parse_sender(&row.sender) == Some(Sender::User))?;
    (asked.text.trim() == prompt.trim()).then_some(last)
}

/// Maps a whole history page in order.
pub fn hydrate(rows: &[HistoryRow]) -> Vec<Message> {
    rows.iter().filter_map(message_from_row).collect()
}

/// Finds the authoritative answer for a message the client saw fail.
///
/// Prefers the row with the same id. Otherwise the final row is taken only
/// when it is a non-empty AI answer to `prompt`, the user turn the failed
/// message was answering; an answer to an earlier turn never matches.
pub fn reconcile_patch(
    rows: &[HistoryRow],
    message_id: &MessageId,
    prompt: Option<&str>,
) -> Option<MessagePatch> {
    let row = match rows.iter().find(|row| row.id.trim() == message_id.as_str()) {
        Some(row) => row,
        None => answer_to(rows, prompt?)?,
    };
    let answer = message_from_row(row)
        .filter(|message| message.sender == Sender::Ai && !message.text.trim().is_empty())?;

    Some(MessagePatch {
        text: Some(answer.text),
        reasoning_text: answer.reasoning_text.map(Some),
        is_streaming: Some(false),
        is_reasoning_complete: Some(answer.is_reasoning_complete),
        error: Some(None),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(id: &str, sender: &str, text: &str) -> HistoryRow {
        HistoryRow {
            id: id.to_string(),
            sender: sender.to_string(),
            text: text.to_string(),
            reason: None,
            file_url: None,
            file_type: None,
            file_name: None,
            file_size: None,
        }
    }

    #[test]
    fn hydration_maps_reasoning_and_attachments() {
        let mut answer = row("2", "assistant", "answer");
        answer.reason = Some("thinking".to_string());
        let mut prompt = row("1", "user", "question");
        prompt.file_url = Some("https://files/x.pdf".to_string());
        prompt.file_name = Some("x.pdf".to_string());

        let messages = hydrate(&[prompt, answer, row("3", "system", "ignored")]);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(
            messages[0].attachment.as_ref().map(|file| file.file_name.clone()),
            Some(Some("x.pdf".to_string()))
        );
        assert_eq!(messages[1].reasoning_text.as_deref(), Some("thinking"));
        assert!(messages[1].is_reasoning_complete);
        assert!(!messages[1].is_streaming);
    }

    #[test]
    fn blank_reason_is_not_reasoning() {
        let mut answer = row("2", "ai", "answer");
        answer.reason = Some("  ".to_string());

        let message = message_from_row(&answer).expect("mapped");
        assert_eq!(message.reasoning_text, None);
        assert!(!message.is_reasoning_complete);
    }

    #[test]
    fn reconciliation_prefers_matching_id_then_answer_to_prompt() {
        let local = MessageId::new_local();
        let rows = vec![row("1", "user", "q"), row("2", "bot", "final")];

        let patch = reconcile_patch(&rows, &local, Some("q")).expect("patch");
        assert_eq!(patch.text.as_deref(), Some("final"));
        assert_eq!(patch.error, Some(None));

        let server_id = MessageId::parse("2").expect("valid id");
        let rows = vec![row("2", "ai", "same id"), row("3", "user", "later")];
        let patch = reconcile_patch(&rows, &server_id, None).expect("patch");
        assert_eq!(patch.text.as_deref(), Some("same id"));
    }

    #[test]
    fn answer_to_an_earlier_turn_is_not_taken() {
        let local = MessageId::new_local();
        let rows = vec![row("1", "user", "q1"), row("2", "ai", "a1")];

        assert_eq!(reconcile_patch(&rows, &local, Some("q2")), None);
        assert_eq!(reconcile_patch(&rows, &local, None), None);

        let answered = vec![
            row("1", "user", "q1"),
            row("2", "ai", "a1"),
            row("3", "user", "q2"),
            row("4", "ai", "a2"),
        ];
        let patch = reconcile_patch(&answered, &local, Some("q2")).expect("patch");
        assert_eq!(patch.text.as_deref(), Some("a2"));
    }

    #[test]
    fn reconciliation_ignores_unanswered_or_empty_history() {
        let local = MessageId::new_local();
        assert_eq!(reconcile_patch(&[], &local, Some("q")), None);
        assert_eq!(reconcile_patch(&[row("1", "user", "q")], &local, Some("q")), None);
        assert_eq!(
            reconcile_patch(
                &[row("1", "user", "q"), row("2", "ai", " ")],
                &local,
                Some("q")
            ),
            None
        );
    }
}
