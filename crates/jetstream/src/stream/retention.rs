//! Retention rules applied to a stream's message index
//!
//! Every function mutates the index and returns the removed sequences so the
//! caller can mirror the removals into the persistence backend.

use chrono::{DateTime, Utc};

use crate::stream::config::{DiscardPolicy, RetentionPolicy, StreamConfig};
use crate::stream::store::MessageStore;

/// Drop messages older than the stream's max age
pub(crate) fn expire(
    store: &mut MessageStore,
    config: &StreamConfig,
    now: DateTime<Utc>,
) -> Vec<u64> {
    let Some(max_age) = config.max_age else {
        return Vec::new();
    };
    let Ok(max_age) = chrono::Duration::from_std(max_age) else {
        return Vec::new();
    };
    let Some(cutoff) = now.checked_sub_signed(max_age) else {
        return Vec::new();
    };

    let expired: Vec<u64> = store
        .range_from(0)
        .take_while(|message| message.timestamp <= cutoff)
        .map(|message| message.sequence)
        .collect();

    remove_all(store, expired)
}

/// Apply message, byte and per-subject limits after an append
///
/// Message and byte limits only truncate under [`DiscardPolicy::Old`]; with
/// `New` the append itself was rejected. The per-subject limit always drops
/// the oldest message of the subject.
pub(crate) fn enforce_limits(
    store: &mut MessageStore,
    config: &StreamConfig,
    subject: Option<&str>,
) -> Vec<u64> {
    let mut removed = Vec::new();

    if let Some(max) = config.max_messages_per_subject {
        let subjects: Vec<String> = match subject {
            Some(subject) => vec![subject.to_string()],
            None => store
                .last_per_subject(">")
                .into_iter()
                .map(|message| message.subject.clone())
                .collect(),
        };
        for subject in subjects {
            let sequences = store.subject_sequences(&subject);
            let excess = sequences.len().saturating_sub(usize::try_from(max).unwrap_or(usize::MAX));
            removed.extend(remove_all(store, sequences.into_iter().take(excess)));
        }
    }

    if config.discard == DiscardPolicy::Old {
        while config.max_messages.is_some_and(|max| store.len() > max)
            || config.max_bytes.is_some_and(|max| store.bytes() > max)
        {
            let Some(first) = store.first().map(|message| message.sequence) else {
                break;
            };
            store.remove(first);
            removed.push(first);
        }
    }

    removed
}

/// Release messages whose delivery obligations were settled
///
/// `candidates` are sequences that were just acknowledged, terminated or
/// appended. Work-queue streams drop acknowledged messages outright; interest
/// streams drop a candidate once `still_needed` reports no consumer requires
/// it. Limits streams never release on acknowledgement.
pub(crate) fn release<F>(
    store: &mut MessageStore,
    policy: RetentionPolicy,
    candidates: &[u64],
    still_needed: F,
) -> Vec<u64>
where
    F: Fn(u64, &str) -> bool,
{
    match policy {
        RetentionPolicy::Limits => Vec::new(),
        RetentionPolicy::WorkQueue => remove_all(store, candidates.iter().copied()),
        RetentionPolicy::Interest => {
            let releasable: Vec<u64> = candidates
                .iter()
                .copied()
                .filter(|sequence| {
                    store
                        .get(*sequence)
                        .is_some_and(|message| !still_needed(*sequence, &message.subject))
                })
                .collect();
            remove_all(store, releasable)
        }
    }
}

/// Re-evaluate every stored message of an interest stream
pub(crate) fn release_unclaimed<F>(store: &mut MessageStore, still_needed: F) -> Vec<u64>
where
    F: Fn(u64, &str) -> bool,
{
    let unclaimed: Vec<u64> = store
        .range_from(0)
        .filter(|message| !still_needed(message.sequence, &message.subject))
        .map(|message| message.sequence)
        .collect();

    remove_all(store, unclaimed)
}

fn remove_all(store: &mut MessageStore, sequences: impl IntoIterator<Item = u64>) -> Vec<u64> {
    sequences
        .into_iter()
        .filter(|sequence| store.remove(*sequence).is_some())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::message::Message;
    use crate::stream::config::PublishOptions;

    fn fill(store: &mut MessageStore, config: &StreamConfig, subjects: &[&str], at: DateTime<Utc>) {
        for subject in subjects {
            let message = store
                .prepare(
                    config,
                    Message::new(*subject, "0123456789"),
                    &PublishOptions::default(),
                    1024,
                    at,
                )
                .unwrap();
            store.commit(message);
        }
    }

    #[test]
    fn test_max_messages_keeps_newest() {
        let config = StreamConfig::new("L").with_subjects(["l.>"]).with_max_messages(3);
        let mut store = MessageStore::new();
        fill(&mut store, &config, &["l.a"; 5], Utc::now());

        let removed = enforce_limits(&mut store, &config, None);

        assert_eq!(removed, vec![1, 2]);
        assert_eq!(store.len(), 3);
        assert_eq!(store.first_seq(), 3);
        assert_eq!(store.last_seq(), 5);
    }

    #[test]
    fn test_max_bytes_truncates_from_front() {
        let mut config = StreamConfig::new("L").with_subjects(["l.>"]);
        let mut store = MessageStore::new();
        fill(&mut store, &config, &["l.a"; 4], Utc::now());
        let per_message = store.bytes() / 4;
        config.max_bytes = Some(per_message * 2 + 1);

        enforce_limits(&mut store, &config, None);

        assert_eq!(store.len(), 2);
        assert!(store.bytes() <= per_message * 2 + 1);
    }

    #[test]
    fn test_per_subject_limit() {
        let config = StreamConfig::new("L")
            .with_subjects(["l.>"])
            .with_max_messages_per_subject(1);
        let mut store = MessageStore::new();
        fill(&mut store, &config, &["l.a", "l.b", "l.a"], Utc::now());

        let removed = enforce_limits(&mut store, &config, Some("l.a"));

        assert_eq!(removed, vec![1]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.last_for_subject("l.a").unwrap().sequence, 3);
    }

    #[test]
    fn test_expire_removes_old_messages() {
        let config = StreamConfig::new("L")
            .with_subjects(["l.>"])
            .with_max_age(Duration::from_secs(1));
        let mut store = MessageStore::new();
        let start = Utc::now();
        fill(&mut store, &config, &["l.a", "l.b"], start);
        fill(&mut store, &config, &["l.c"], start + chrono::Duration::seconds(2));

        let removed = expire(&mut store, &config, start + chrono::Duration::milliseconds(2500));

        assert_eq!(removed, vec![1, 2]);
        assert_eq!(store.first_seq(), 3);
    }

    #[test]
    fn test_release_by_policy() {
        let config = StreamConfig::new("L").with_subjects(["l.>"]);
        let mut store = MessageStore::new();
        fill(&mut store, &config, &["l.a", "l.b", "l.c"], Utc::now());

        assert!(release(&mut store, RetentionPolicy::Limits, &[1], |_, _| false).is_empty());

        let released = release(&mut store, RetentionPolicy::Interest, &[1, 2], |_, subject| {
            subject == "l.b"
        });
        assert_eq!(released, vec![1]);

        let released = release(&mut store, RetentionPolicy::WorkQueue, &[2], |_, _| true);
        assert_eq!(released, vec![2]);
        assert_eq!(store.len(), 1);
    }
}
