// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Error Queue with Autoremediation (C12)
//!
//! `enqueue` is the single write path into a `(type, pkey)` FIFO: a
//! fresh failure always appends, but when the autoremediation mode is
//! `conservative`/`maximum` and the tail entry's operation can be
//! merged with the incoming one, the tail is coalesced instead of
//! growing the queue. Coalescing never reaches across a tail entry with
//! `is_partially_processed=true` and `attempts>0` — a handler that has
//! already mutated its target once for that entry may no longer be safe
//! to silently replace, so the new event is appended behind it instead
//! (DESIGN.md Open Question 3).

use crate::infra::config::AutoremediationMode;
use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::{ChangeEvent, Operation};
use cdc_relay_domain::ports::cache::{ErrorQueueStore, QueuedEvent};
use chrono::NaiveDateTime;

/// Append or coalesce one failed/blocked event into its `(type, pkey)`
/// queue. `is_error_retry` distinguishes a retry task's renewed failure
/// (the existing head is updated in place) from a fresh failure off the
/// bus (appended or coalesced against the tail).
pub async fn enqueue(
    store: &dyn ErrorQueueStore,
    mode: AutoremediationMode,
    event: &ChangeEvent,
    is_error_retry: bool,
    is_partially_processed: bool,
    blocked_reason: Option<String>,
    now: NaiveDateTime,
) -> Result<(), RelayError> {
    let incoming = QueuedEvent {
        event: event.clone(),
        enqueued_at: now,
        attempts: u32::from(is_error_retry),
        is_partially_processed,
        blocked_reason,
    };

    let mut queue = store.queue_snapshot(&event.type_name, &event.pkey).await?;

    if is_error_retry {
        if let Some(head) = queue.first_mut() {
            head.attempts += 1;
            head.is_partially_processed = is_partially_processed;
            head.blocked_reason = incoming.blocked_reason;
            store.replace_queue(&event.type_name, &event.pkey, queue).await?;
            return Ok(());
        }
    }

    match queue.pop() {
        Some(tail) => match coalesce(mode, tail, incoming) {
            Coalesced::Merged(merged) => queue.push(merged),
            Coalesced::Annihilated => {}
            Coalesced::NotMergeable(tail, incoming) => {
                queue.push(tail);
                queue.push(incoming);
            }
        },
        None => queue.push(incoming),
    }

    store.replace_queue(&event.type_name, &event.pkey, queue).await
}

enum Coalesced {
    Merged(QueuedEvent),
    /// The pair annihilates: e.g. an object added then removed before
    /// either ever reached the target.
    Annihilated,
    NotMergeable(QueuedEvent, QueuedEvent),
}

/// Merge table (C12). `tail` is the queue's current last entry,
/// `incoming` the event that just failed or was blocked.
fn coalesce(mode: AutoremediationMode, tail: QueuedEvent, incoming: QueuedEvent) -> Coalesced {
    if mode == AutoremediationMode::Disabled || (tail.is_partially_processed && tail.attempts > 0) {
        return Coalesced::NotMergeable(tail, incoming);
    }

    use Operation::*;
    match (tail.event.op, incoming.event.op) {
        (Added, Modified) => Coalesced::Merged(merged(tail, incoming, Added)),
        (Modified, Modified) => Coalesced::Merged(merged(tail, incoming, Modified)),
        (Added, Removed) if mode == AutoremediationMode::Maximum => Coalesced::Annihilated,
        (Removed, Added) if mode == AutoremediationMode::Maximum => Coalesced::Merged(merged(tail, incoming, Modified)),
        (Modified, Removed) if mode == AutoremediationMode::Maximum => Coalesced::Merged(merged(tail, incoming, Removed)),
        _ => Coalesced::NotMergeable(tail, incoming),
    }
}

fn merged(tail: QueuedEvent, incoming: QueuedEvent, op: Operation) -> QueuedEvent {
    let mut event = incoming.event;
    event.op = op;
    QueuedEvent {
        event,
        enqueued_at: tail.enqueued_at,
        attempts: tail.attempts,
        is_partially_processed: tail.is_partially_processed || incoming.is_partially_processed,
        blocked_reason: incoming.blocked_reason.or(tail.blocked_reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::test_support::InMemoryErrorQueue;
    use cdc_relay_domain::events::StepCounter;
    use cdc_relay_domain::schema::SchemaRevision;
    use cdc_relay_domain::value::{PrimaryKeyValue, RemotePkeyValue, TypedValue};

    fn event(op: Operation) -> ChangeEvent {
        ChangeEvent {
            op,
            type_name: "user".into(),
            pkey: PrimaryKeyValue::Simple(TypedValue::Text("u1".into())),
            remote_pkey: RemotePkeyValue::new("r1"),
            step: StepCounter::initial(),
            schema_rev: SchemaRevision::initial(),
            attrs: Default::default(),
            fkeys: Default::default(),
        }
    }

    #[tokio::test]
    async fn disabled_mode_always_appends() {
        let store = InMemoryErrorQueue::default();
        let now = chrono::NaiveDateTime::default();
        enqueue(&store, AutoremediationMode::Disabled, &event(Operation::Added), false, false, None, now)
            .await
            .unwrap();
        enqueue(&store, AutoremediationMode::Disabled, &event(Operation::Modified), false, false, None, now)
            .await
            .unwrap();
        let snapshot = store
            .queue_snapshot("user", &PrimaryKeyValue::Simple(TypedValue::Text("u1".into())))
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn conservative_mode_coalesces_added_then_modified_into_added() {
        let store = InMemoryErrorQueue::default();
        let now = chrono::NaiveDateTime::default();
        enqueue(&store, AutoremediationMode::Conservative, &event(Operation::Added), false, false, None, now)
            .await
            .unwrap();
        enqueue(&store, AutoremediationMode::Conservative, &event(Operation::Modified), false, false, None, now)
            .await
            .unwrap();
        let snapshot = store
            .queue_snapshot("user", &PrimaryKeyValue::Simple(TypedValue::Text("u1".into())))
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].event.op, Operation::Added);
    }

    #[tokio::test]
    async fn maximum_mode_annihilates_added_then_removed() {
        let store = InMemoryErrorQueue::default();
        let now = chrono::NaiveDateTime::default();
        enqueue(&store, AutoremediationMode::Maximum, &event(Operation::Added), false, false, None, now)
            .await
            .unwrap();
        enqueue(&store, AutoremediationMode::Maximum, &event(Operation::Removed), false, false, None, now)
            .await
            .unwrap();
        let snapshot = store
            .queue_snapshot("user", &PrimaryKeyValue::Simple(TypedValue::Text("u1".into())))
            .await
            .unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn partially_processed_tail_with_attempts_blocks_coalesce() {
        let store = InMemoryErrorQueue::default();
        let now = chrono::NaiveDateTime::default();
        enqueue(&store, AutoremediationMode::Maximum, &event(Operation::Added), true, true, None, now)
            .await
            .unwrap();
        // First call above hits the is_error_retry path with an empty
        // queue, so it appends rather than updating a head in place.
        enqueue(&store, AutoremediationMode::Maximum, &event(Operation::Removed), false, false, None, now)
            .await
            .unwrap();
        let snapshot = store
            .queue_snapshot("user", &PrimaryKeyValue::Simple(TypedValue::Text("u1".into())))
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 2);
    }
}
