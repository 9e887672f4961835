//! In-memory message index of a stream
//!
//! Holds every stored message keyed by sequence, the byte and per-subject
//! counters, and the first/last sequence bounds. File-backed streams keep the
//! same index in memory and write through to the log backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::error::{Error, ErrorKind, JetStreamResult};
use crate::jetstream_error;
use crate::message::{Message, StoredMessage, message_size};
use crate::stream::config::{DiscardPolicy, PublishOptions, PurgeRequest, StreamConfig, StreamState};
use crate::subject::{subject_matches_pattern, validate_subject};

/// Ordered message index with counters
#[derive(Debug)]
pub(crate) struct MessageStore {
    messages: BTreeMap<u64, StoredMessage>,
    subjects: HashMap<String, BTreeSet<u64>>,
    first_seq: u64,
    last_seq: u64,
    bytes: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub(crate) fn new() -> Self {
        Self {
            messages: BTreeMap::new(),
            subjects: HashMap::new(),
            first_seq: 1,
            last_seq: 0,
            bytes: 0,
            last_timestamp: None,
        }
    }

    /// Rebuild an index from recovered messages
    ///
    /// `watermark` is the highest sequence ever assigned, which may exceed
    /// every recovered message when the newest ones were removed.
    pub(crate) fn restore(
        messages: impl IntoIterator<Item = StoredMessage>,
        watermark: u64,
    ) -> Self {
        let mut store = Self::new();
        for message in messages {
            store.commit(message);
        }
        store.last_seq = store.last_seq.max(watermark);
        store.first_seq = store
            .messages
            .keys()
            .next()
            .copied()
            .unwrap_or(store.last_seq + 1);
        store
    }

    pub(crate) fn first_seq(&self) -> u64 {
        self.first_seq
    }

    pub(crate) fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub(crate) fn len(&self) -> u64 {
        self.messages.len() as u64
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn get(&self, sequence: u64) -> Option<&StoredMessage> {
        self.messages.get(&sequence)
    }

    pub(crate) fn first(&self) -> Option<&StoredMessage> {
        self.messages.values().next()
    }

    /// Messages from `sequence` onwards in sequence order
    pub(crate) fn range_from(&self, sequence: u64) -> impl Iterator<Item = &StoredMessage> {
        self.messages.range(sequence..).map(|(_, message)| message)
    }

    pub(crate) fn last_for_subject(&self, subject: &str) -> Option<&StoredMessage> {
        self.subjects
            .get(subject)
            .and_then(|sequences| sequences.last())
            .and_then(|sequence| self.messages.get(sequence))
    }

    /// Sequences stored for a subject, oldest first
    pub(crate) fn subject_sequences(&self, subject: &str) -> Vec<u64> {
        self.subjects
            .get(subject)
            .map(|sequences| sequences.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Sequences of every message whose subject matches the filter, ascending
    pub(crate) fn matching_sequences(&self, filter: &str) -> BTreeSet<u64> {
        self.subjects
            .iter()
            .filter(|(subject, _)| subject_matches_pattern(subject, filter))
            .flat_map(|(_, sequences)| sequences.iter().copied())
            .collect()
    }

    /// Latest message of every subject matching the filter, in sequence order
    pub(crate) fn last_per_subject(&self, filter: &str) -> Vec<&StoredMessage> {
        let mut latest: Vec<&StoredMessage> = self
            .subjects
            .iter()
            .filter(|(subject, _)| subject_matches_pattern(subject, filter))
            .filter_map(|(_, sequences)| sequences.last())
            .filter_map(|sequence| self.messages.get(sequence))
            .collect();
        latest.sort_by_key(|message| message.sequence);
        latest
    }

    /// Validate a message against the stream and build its stored form
    ///
    /// Nothing is mutated; the sequence is only consumed by [`Self::commit`].
    pub(crate) fn prepare(
        &self,
        config: &StreamConfig,
        message: Message,
        options: &PublishOptions,
        max_payload: usize,
        now: DateTime<Utc>,
    ) -> JetStreamResult<StoredMessage> {
        validate_subject(&message.subject)?;

        if !config
            .bound_subjects()
            .iter()
            .any(|pattern| subject_matches_pattern(&message.subject, pattern))
        {
            return Err(jetstream_error!(
                ErrorKind::SubjectNotBound,
                "subject '{}' is not bound by stream '{}'",
                message.subject,
                config.name
            ));
        }

        if message.payload.len() > max_payload {
            return Err(jetstream_error!(
                ErrorKind::MessageTooLarge,
                "payload of {} bytes exceeds maximum of {}",
                message.payload.len(),
                max_payload
            ));
        }

        let size = message_size(&message.subject, &message.headers, &message.payload);
        if let Some(max) = config.max_message_size {
            if size > max {
                return Err(jetstream_error!(
                    ErrorKind::MessageTooLarge,
                    "message of {size} bytes exceeds stream maximum of {max}"
                ));
            }
        }

        if let Some(expected) = options.expected_last_sequence {
            if expected != self.last_seq {
                return Err(jetstream_error!(
                    ErrorKind::WrongLastSequence,
                    "expected last sequence {expected}, stream is at {}",
                    self.last_seq
                ));
            }
        }

        if let Some(expected) = options.expected_last_subject_sequence {
            let current = self
                .last_for_subject(&message.subject)
                .map_or(0, |last| last.sequence);
            if expected != current {
                return Err(jetstream_error!(
                    ErrorKind::WrongLastSequence,
                    "expected last sequence {expected} for '{}', found {current}",
                    message.subject
                ));
            }
        }

        if config.discard == DiscardPolicy::New {
            if let Some(max) = config.max_messages {
                if self.len() >= max {
                    return Err(jetstream_error!(
                        ErrorKind::MaximumMessagesExceeded,
                        "stream '{}' holds {max} messages",
                        config.name
                    ));
                }
            }
            if let Some(max) = config.max_bytes {
                if self.bytes + size > max {
                    return Err(jetstream_error!(
                        ErrorKind::MaximumBytesExceeded,
                        "stream '{}' would exceed {max} bytes",
                        config.name
                    ));
                }
            }
        }

        Ok(StoredMessage {
            sequence: self.last_seq + 1,
            subject: message.subject,
            payload: message.payload,
            headers: message.headers,
            timestamp: now,
        })
    }

    /// Insert a prepared message; its sequence becomes the last sequence
    pub(crate) fn commit(&mut self, message: StoredMessage) {
        let sequence = message.sequence;
        if self.messages.is_empty() && sequence > self.last_seq {
            self.first_seq = sequence;
        }

        self.bytes += message.size();
        self.subjects
            .entry(message.subject.clone())
            .or_default()
            .insert(sequence);
        self.last_seq = self.last_seq.max(sequence);
        self.last_timestamp = Some(message.timestamp);
        self.messages.insert(sequence, message);
    }

    /// Remove one message; the first sequence moves only when it was the first
    pub(crate) fn remove(&mut self, sequence: u64) -> Option<StoredMessage> {
        let message = self.messages.remove(&sequence)?;
        self.bytes = self.bytes.saturating_sub(message.size());

        let subject_emptied = match self.subjects.get_mut(&message.subject) {
            Some(sequences) => {
                sequences.remove(&sequence);
                sequences.is_empty()
            }
            None => false,
        };
        if subject_emptied {
            self.subjects.remove(&message.subject);
        }

        if sequence == self.first_seq {
            self.first_seq = self
                .messages
                .keys()
                .next()
                .copied()
                .unwrap_or(self.last_seq + 1);
        }

        Some(message)
    }

    /// Remove messages selected by a purge request, returning their sequences
    pub(crate) fn purge(&mut self, request: &PurgeRequest) -> JetStreamResult<Vec<u64>> {
        if request.keep.is_some() && request.sequence.is_some() {
            return Err(Error::invalid_config(
                "purge accepts either keep or sequence, not both",
            ));
        }

        let candidates: Vec<u64> = match &request.filter {
            Some(filter) => self.matching_sequences(filter).into_iter().collect(),
            None => self.messages.keys().copied().collect(),
        };

        let selected: Vec<u64> = match (request.keep, request.sequence) {
            (Some(keep), _) => {
                let keep = usize::try_from(keep).unwrap_or(usize::MAX);
                let cut = candidates.len().saturating_sub(keep);
                candidates[..cut].to_vec()
            }
            (None, Some(below)) => candidates.into_iter().filter(|s| *s < below).collect(),
            (None, None) => candidates,
        };

        Ok(selected
            .into_iter()
            .filter(|sequence| self.remove(*sequence).is_some())
            .collect())
    }

    /// Counters, with per-subject counts only when a filter is given
    pub(crate) fn state(&self, subjects_filter: Option<&str>) -> StreamState {
        let messages = self.len();
        let num_deleted = if messages == 0 {
            0
        } else {
            (self.last_seq - self.first_seq + 1).saturating_sub(messages)
        };

        let subjects = subjects_filter.map(|filter| {
            self.subjects
                .iter()
                .filter(|(subject, _)| subject_matches_pattern(subject, filter))
                .map(|(subject, sequences)| (subject.clone(), sequences.len() as u64))
                .collect()
        });

        StreamState {
            messages,
            bytes: self.bytes,
            first_sequence: self.first_seq,
            first_timestamp: self.first().map(|message| message.timestamp),
            last_sequence: self.last_seq,
            last_timestamp: self.last_timestamp,
            num_subjects: self.subjects.len() as u64,
            num_deleted,
            consumer_count: 0,
            subjects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamConfig {
        StreamConfig::new("TEST").with_subjects(["test.>"])
    }

    fn append(store: &mut MessageStore, subject: &str, payload: &'static str) -> u64 {
        let message = store
            .prepare(
                &config(),
                Message::new(subject, payload),
                &PublishOptions::default(),
                1024,
                Utc::now(),
            )
            .unwrap();
        let sequence = message.sequence;
        store.commit(message);
        sequence
    }

    #[test]
    fn test_sequences_are_monotonic() {
        let mut store = MessageStore::new();
        assert_eq!((store.first_seq(), store.last_seq()), (1, 0));

        assert_eq!(append(&mut store, "test.a", "1"), 1);
        assert_eq!(append(&mut store, "test.b", "2"), 2);
        store.remove(2);
        assert_eq!(append(&mut store, "test.a", "3"), 3);
        assert_eq!(store.last_seq(), 3);
    }

    #[test]
    fn test_unbound_subject_consumes_no_sequence() {
        let mut store = MessageStore::new();
        append(&mut store, "test.a", "1");

        let result = store.prepare(
            &config(),
            Message::new("other.a", "x"),
            &PublishOptions::default(),
            1024,
            Utc::now(),
        );
        assert_eq!(result.unwrap_err().kind(), ErrorKind::SubjectNotBound);
        assert_eq!(append(&mut store, "test.a", "2"), 2);
    }

    #[test]
    fn test_remove_advances_first_only_from_front() {
        let mut store = MessageStore::new();
        for payload in ["1", "2", "3", "4"] {
            append(&mut store, "test.a", payload);
        }

        store.remove(2);
        assert_eq!(store.first_seq(), 1);
        assert_eq!(store.state(None).num_deleted, 1);

        store.remove(1);
        assert_eq!(store.first_seq(), 3);
        assert_eq!(store.state(None).num_deleted, 0);

        store.remove(3);
        store.remove(4);
        assert_eq!(store.first_seq(), 5);
        assert_eq!(store.last_seq(), 4);
        assert_eq!(store.bytes(), 0);
    }

    #[test]
    fn test_state_subject_counts_only_with_filter() {
        let mut store = MessageStore::new();
        append(&mut store, "test.a", "1");
        append(&mut store, "test.a", "2");
        append(&mut store, "test.b", "3");

        let state = store.state(None);
        assert_eq!(state.num_subjects, 2);
        assert!(state.subjects.is_none());

        let subjects = store.state(Some("test.a")).subjects.unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects["test.a"], 2);
    }

    #[test]
    fn test_expected_last_subject_sequence() {
        let mut store = MessageStore::new();
        append(&mut store, "test.a", "1");
        append(&mut store, "test.b", "2");

        let options = PublishOptions {
            expected_last_subject_sequence: Some(1),
            ..PublishOptions::default()
        };
        assert!(
            store
                .prepare(&config(), Message::new("test.a", "x"), &options, 1024, Utc::now())
                .is_ok()
        );

        let stale = PublishOptions {
            expected_last_subject_sequence: Some(0),
            ..PublishOptions::default()
        };
        let err = store
            .prepare(&config(), Message::new("test.a", "x"), &stale, 1024, Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongLastSequence);
    }

    #[test]
    fn test_purge_keep_and_filter() {
        let mut store = MessageStore::new();
        for subject in ["test.a", "test.b", "test.a", "test.a"] {
            append(&mut store, subject, "x");
        }

        let purged = store.purge(&PurgeRequest::filtered("test.a").keep(1)).unwrap();
        assert_eq!(purged, vec![1, 3]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.first_seq(), 2);

        let purged = store.purge(&PurgeRequest::all()).unwrap();
        assert_eq!(purged, vec![2, 4]);
        assert_eq!(store.first_seq(), 5);
    }

    #[test]
    fn test_restore_rebuilds_counters() {
        let mut original = MessageStore::new();
        for subject in ["test.a", "test.b", "test.a"] {
            append(&mut original, subject, "x");
        }
        original.remove(1);

        let messages: Vec<StoredMessage> = original.range_from(0).cloned().collect();
        let restored = MessageStore::restore(messages, 0);

        assert_eq!(restored.state(None), original.state(None));
        assert_eq!(restored.last_for_subject("test.a").unwrap().sequence, 3);
    }

    #[test]
    fn test_restore_honours_watermark() {
        let restored = MessageStore::restore(Vec::new(), 7);
        assert_eq!(restored.last_seq(), 7);
        assert_eq!(restored.first_seq(), 8);
        assert_eq!(restored.len(), 0);
    }
}
