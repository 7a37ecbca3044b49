//! Log-backed consumers used by the `coparent watch` command.
//!
//! Each consumer mirrors one UI surface (thread badges, the total badge,
//! the tab title, the navigation listener) and keeps only its own local copy
//! of what the hub pushed.

use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};

use shared::models::{UnreadState, UnreadThreadSummary};
use tracing::info;
use uuid::Uuid;

use crate::{hub::RealtimeHub, registry::Disposer};

/// Badges stop counting past this value.
pub const BADGE_CAP: u64 = 99;

/// Title shown when nothing is unread.
pub const APP_TITLE: &str = "Coparent";

/// Text of an unread badge, `None` when the badge is hidden.
#[must_use]
pub fn badge_label(unread: u64) -> Option<String> {
    match unread {
        0 => None,
        count if count > BADGE_CAP => Some(format!("{BADGE_CAP}+")),
        count => Some(count.to_string()),
    }
}

/// Tab title with the total unread count prefixed.
#[must_use]
pub fn favicon_title(total: u64) -> String {
    badge_label(total).map_or_else(|| APP_TITLE.to_string(), |label| format!("({label}) {APP_TITLE}"))
}

/// Threads whose badge text differs between `previous` and `current`.
#[must_use]
pub fn changed_badges(
    previous: &BTreeMap<Uuid, u64>,
    current: &[UnreadThreadSummary],
) -> Vec<(Uuid, Option<String>)> {
    let current: BTreeMap<Uuid, u64> = current
        .iter()
        .map(|summary| (summary.thread_id, summary.unread))
        .collect();
    let mut changed: Vec<(Uuid, Option<String>)> = current
        .iter()
        .filter(|(thread, count)| {
            badge_label(previous.get(*thread).copied().unwrap_or(0)) != badge_label(**count)
        })
        .map(|(thread, count)| (*thread, badge_label(*count)))
        .collect();
    changed.extend(
        previous
            .keys()
            .filter(|thread| !current.contains_key(*thread))
            .map(|thread| (*thread, None)),
    );
    changed.sort_by_key(|(thread, _)| *thread);
    changed
}

/// Registers every log consumer on `hub`. Dispose the returned handles to detach them.
pub fn attach_log_consumers(hub: &RealtimeHub) -> Vec<Disposer> {
    let badges = Mutex::new(BTreeMap::<Uuid, u64>::new());
    let thread_badges = hub.register_unread_counts_callback(move |state: &UnreadState| {
        let mut previous = badges.lock().unwrap_or_else(PoisonError::into_inner);
        let summaries = state.summaries();
        for (thread_id, label) in changed_badges(&previous, &summaries) {
            info!(
                consumer = "thread_badges",
                thread_id = %thread_id,
                badge = label.as_deref().unwrap_or(""),
                "thread badge updated"
            );
        }
        *previous = summaries
            .into_iter()
            .map(|summary| (summary.thread_id, summary.unread))
            .collect();
    });

    let total_badge = hub.register_unread_counts_callback(|state| {
        info!(
            consumer = "unread_badge",
            total = state.total,
            badge = badge_label(state.total).as_deref().unwrap_or(""),
            "unread badge updated"
        );
    });

    let title = Mutex::new(String::new());
    let favicon = hub.register_unread_counts_callback(move |state| {
        let next = favicon_title(state.total);
        let mut current = title.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != next {
            info!(consumer = "favicon", title = %next, "document title updated");
            *current = next;
        }
    });

    let messages = hub.register_message_callback(|message| {
        info!(
            consumer = "message_view",
            thread_id = %message.thread_id,
            message_id = %message.id,
            sender_id = %message.sender_id,
            "message received"
        );
    });

    let receipts = hub.register_read_receipt_callback(|receipt| {
        info!(
            consumer = "message_view",
            message_id = %receipt.message_id,
            user_id = %receipt.user_id,
            read = receipt.is_read(),
            "read receipt updated"
        );
    });

    let calendar = hub.register_calendar_event_callback(|event| {
        info!(
            consumer = "calendar",
            event_id = %event.id,
            title = %event.title,
            starts_at = %event.starts_at,
            "calendar event changed"
        );
    });

    let navigation = hub.register_navigation_callback(|path| {
        info!(consumer = "navigation", path = %path, "navigation requested");
    });

    vec![
        thread_badges,
        total_badge,
        favicon,
        messages,
        receipts,
        calendar,
        navigation,
    ]
}
