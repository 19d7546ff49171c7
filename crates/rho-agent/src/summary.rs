//! Session file-change summary

use tracing::info;

use crate::error::Result;
use crate::events::Event;
use crate::snapshot::{FileDiff, Snapshot};
use crate::store::ConversationStore;
use crate::types::{Message, Part, SessionSummary};

/// Snapshot handles bracketing the session's work: the first step start and
/// the last step finish of its assistant turns
fn bounds(store: &ConversationStore, session_id: &str) -> (Option<String>, Option<String>) {
    let (mut from, mut to) = (None, None);
    for entry in store.history(session_id) {
        if !matches!(entry.message, Message::Assistant(_)) {
            continue;
        }
        for part in entry.parts {
            match part {
                Part::StepStart(step) if from.is_none() => from = step.snapshot,
                Part::StepFinish(step) if step.snapshot.is_some() => to = step.snapshot,
                _ => {}
            }
        }
    }
    (from, to)
}

/// Diff the session's working tree changes, record the totals on the
/// session and publish `session.diff`
pub async fn summarize(
    store: &ConversationStore,
    snapshot: &dyn Snapshot,
    session_id: &str,
) -> Result<Vec<FileDiff>> {
    let diffs = match bounds(store, session_id) {
        (Some(from), Some(to)) => snapshot.diff(&from, &to).await,
        _ => vec![],
    };
    let summary = SessionSummary {
        additions: diffs.iter().map(|d| d.additions).sum(),
        deletions: diffs.iter().map(|d| d.deletions).sum(),
        files: diffs.len() as u32,
    };
    store.set_summary(session_id, summary)?;
    store.bus().publish(Event::SessionDiff {
        session_id: session_id.to_string(),
        diff: diffs.clone(),
    });
    info!(session = session_id, files = diffs.len(), "session summarized");
    Ok(diffs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::events::EventKind;
    use crate::snapshot::MemorySnapshot;
    use crate::types::NewSession;
    use rho_ai::{FinishReason, Usage};

    #[tokio::test]
    async fn test_summarize_spans_first_start_to_last_finish() {
        let store = ConversationStore::new(Bus::default());
        let snapshot = MemorySnapshot::new();
        let session = store.create_session(NewSession::new("p", "/")).unwrap();
        snapshot.write_file("a.rs", "one\n");

        for content in ["one\ntwo\n", "one\ntwo\nthree\n"] {
            let message = store.create_message(Message::assistant(&session.id)).unwrap();
            let start = snapshot.track().await;
            store
                .create_part(Part::step_start(&session.id, message.id(), start))
                .unwrap();
            snapshot.write_file("a.rs", content);
            let end = snapshot.track().await;
            store
                .create_part(Part::step_finish(
                    &session.id,
                    message.id(),
                    end,
                    FinishReason::Stop,
                    Usage::default(),
                ))
                .unwrap();
        }
        let mut diffs = store.bus().subscribe_kind(EventKind::SessionDiff);

        let result = summarize(&store, &snapshot, &session.id).await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].additions, 2);
        let summary = store.get_session(&session.id).unwrap().summary.unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.additions, 2);
        assert_eq!(diffs.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_summarize_without_snapshots() {
        let store = ConversationStore::new(Bus::default());
        let session = store.create_session(NewSession::new("p", "/")).unwrap();
        let result = summarize(&store, &MemorySnapshot::new(), &session.id)
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(
            store.get_session(&session.id).unwrap().summary,
            Some(SessionSummary::default())
        );
    }
}
