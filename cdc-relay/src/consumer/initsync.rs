// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Initsync Orchestration (C15)
//!
//! A fresh consumer must not start applying events from wherever the
//! bus's retention happens to begin — it needs the most recent
//! `initsync_begin`/`initsync_end` bracket, which the producer emits
//! once per full resync of every source. [`locate_window`] scans for
//! that bracket under a dedicated `"{consumer_group}::initsync_scan"`
//! group so the scan's own offset advancement never disturbs the real
//! consumer group's position, then [`replay_window`] re-polls the same
//! offsets under the real `consumer_group` so every event in between is
//! delivered to the caller exactly as it would be in steady state.

use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::{ChangeEvent, Operation};
use cdc_relay_domain::ports::bus::MessageBusConsumer;

/// The offsets bracketing one initsync window, inclusive of both
/// markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitsyncWindow {
    pub begin_offset: u64,
    pub end_offset: u64,
}

fn scan_group_name(consumer_group: &str) -> String {
    format!("{consumer_group}::initsync_scan")
}

/// Scan from the bus's oldest retained offset for the most recent
/// complete `initsync_begin`/`initsync_end` pair. Returns `None` if the
/// bus holds no complete bracket yet (a brand-new deployment whose
/// producer hasn't finished its first cycle).
///
/// "Most recent" matters because a long-lived bus may retain more than
/// one historical initsync bracket; replaying the oldest one would
/// needlessly reapply since-superseded state.
pub async fn locate_window(bus: &dyn MessageBusConsumer, consumer_group: &str) -> Result<Option<InitsyncWindow>, RelayError> {
    let scan_group = scan_group_name(consumer_group);
    let (oldest, newest) = bus.offset_bounds().await?;

    let mut pending_begin: Option<u64> = None;
    let mut found: Option<InitsyncWindow> = None;
    let mut offset = oldest;
    loop {
        let Some((polled_offset, event)) = bus.poll(&scan_group).await? else {
            break;
        };
        bus.commit(&scan_group, polled_offset).await?;

        match event.op {
            Operation::InitsyncBegin => pending_begin = Some(polled_offset),
            Operation::InitsyncEnd => {
                if let Some(begin_offset) = pending_begin.take() {
                    found = Some(InitsyncWindow {
                        begin_offset,
                        end_offset: polled_offset,
                    });
                }
            }
            _ => {}
        }

        if polled_offset >= newest {
            break;
        }
        offset = polled_offset + 1;
    }
    let _ = offset;

    Ok(found)
}

/// Deliver every event in `window` (inclusive) to `on_event`, advancing
/// `consumer_group`'s real committed offset as it goes — this is the
/// one-time bootstrap a fresh consumer runs before joining the steady
/// apply loop.
pub async fn replay_window<F>(
    bus: &dyn MessageBusConsumer,
    consumer_group: &str,
    window: InitsyncWindow,
    mut on_event: F,
) -> Result<usize, RelayError>
where
    F: FnMut(ChangeEvent) -> Result<(), RelayError>,
{
    let mut replayed = 0;
    loop {
        let Some((offset, event)) = bus.poll(consumer_group).await? else {
            break;
        };
        if offset > window.end_offset {
            break;
        }
        if offset >= window.begin_offset {
            on_event(event)?;
            replayed += 1;
        }
        bus.commit(consumer_group, offset).await?;
        if offset >= window.end_offset {
            break;
        }
    }
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::test_support::InMemoryBus;
    use cdc_relay_domain::events::StepCounter;
    use cdc_relay_domain::schema::SchemaRevision;
    use cdc_relay_domain::value::{PrimaryKeyValue, RemotePkeyValue, TypedValue};
    use std::collections::BTreeMap;

    fn object_event(step: u64) -> ChangeEvent {
        ChangeEvent {
            op: Operation::Added,
            type_name: "user".into(),
            pkey: PrimaryKeyValue::Simple(TypedValue::Text(format!("u{step}"))),
            remote_pkey: RemotePkeyValue::new(format!("r{step}")),
            step: StepCounter(step),
            schema_rev: SchemaRevision::initial(),
            attrs: BTreeMap::new(),
            fkeys: BTreeMap::new(),
        }
    }

    fn marker(op: Operation, step: u64) -> ChangeEvent {
        ChangeEvent::marker(op, SchemaRevision::initial(), StepCounter(step))
    }

    #[tokio::test]
    async fn locates_the_single_bracket() {
        let bus = InMemoryBus::default();
        bus.push(object_event(0));
        bus.push(marker(Operation::InitsyncBegin, 1));
        bus.push(object_event(2));
        bus.push(object_event(3));
        bus.push(marker(Operation::InitsyncEnd, 4));
        bus.push(object_event(5));

        let window = locate_window(&bus, "default").await.unwrap().unwrap();
        assert_eq!(window, InitsyncWindow { begin_offset: 1, end_offset: 4 });
    }

    #[tokio::test]
    async fn prefers_the_most_recent_complete_bracket() {
        let bus = InMemoryBus::default();
        bus.push(marker(Operation::InitsyncBegin, 0));
        bus.push(object_event(1));
        bus.push(marker(Operation::InitsyncEnd, 2));
        bus.push(marker(Operation::InitsyncBegin, 3));
        bus.push(object_event(4));
        bus.push(marker(Operation::InitsyncEnd, 5));

        let window = locate_window(&bus, "default").await.unwrap().unwrap();
        assert_eq!(window, InitsyncWindow { begin_offset: 3, end_offset: 5 });
    }

    #[tokio::test]
    async fn returns_none_without_a_complete_bracket() {
        let bus = InMemoryBus::default();
        bus.push(object_event(0));
        bus.push(marker(Operation::InitsyncBegin, 1));
        bus.push(object_event(2));

        assert!(locate_window(&bus, "default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_group_does_not_disturb_the_real_consumer_group_offset() {
        let bus = InMemoryBus::default();
        bus.push(marker(Operation::InitsyncBegin, 0));
        bus.push(object_event(1));
        bus.push(marker(Operation::InitsyncEnd, 2));

        locate_window(&bus, "default").await.unwrap();

        let (offset, _) = bus.poll("default").await.unwrap().unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn replay_window_delivers_only_the_bracketed_events_and_commits_through_it() {
        let bus = InMemoryBus::default();
        bus.push(marker(Operation::InitsyncBegin, 0));
        bus.push(object_event(1));
        bus.push(object_event(2));
        bus.push(marker(Operation::InitsyncEnd, 3));
        bus.push(object_event(4));

        let window = InitsyncWindow { begin_offset: 0, end_offset: 3 };
        let mut delivered = Vec::new();
        let replayed = replay_window(&bus, "default", window, |event| {
            delivered.push(event);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(replayed, 4);
        assert_eq!(delivered.len(), 4);

        let (next_offset, _) = bus.poll("default").await.unwrap().unwrap();
        assert_eq!(next_offset, 4);
    }
}
