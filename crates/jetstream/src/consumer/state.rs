//! Delivery cursor and acknowledgement tracking of one consumer
//!
//! All methods are synchronous and run under the consumer's mutex while the
//! caller holds the stream's store lock, so a cursor never observes a
//! half-applied append or removal.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::consumer::config::{AckPolicy, ConsumerConfig, DeliverPolicy, SequenceInfo};
use crate::consumer::message::AckKind;
use crate::message::StoredMessage;
use crate::stream::store::MessageStore;
use crate::subject::subject_matches_pattern;

/// Upper bound for a deadline when a wait would overflow the clock
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Instant `wait` after `now`, clamped to [`FAR_FUTURE`]
pub(crate) fn deadline_after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait.min(FAR_FUTURE)).unwrap_or(now)
}

/// An unacknowledged delivery
#[derive(Debug, Clone)]
pub(crate) struct PendingEntry {
    pub consumer_sequence: u64,
    pub deliveries: u64,
    pub deadline: Instant,
}

/// A message handed to a pull request
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub message: StoredMessage,
    pub consumer_sequence: u64,
    pub deliveries: u64,
}

/// Result of collecting deliveries for a pull request
#[derive(Debug, Default)]
pub(crate) struct Collected {
    pub deliveries: Vec<Delivery>,
    /// Sequences that reached a terminal state without an explicit ack
    pub settled: Vec<u64>,
    /// Size of a message that alone exceeds the request's max bytes
    pub oversized: Option<u64>,
}

/// Messages at or below `cutoff` are only delivered when listed
#[derive(Debug, Clone)]
struct LastPerSubject {
    cutoff: u64,
    sequences: BTreeSet<u64>,
}

#[derive(Debug)]
pub(crate) struct ConsumerState {
    config: ConsumerConfig,
    start_seq: u64,
    last_per_subject: Option<LastPerSubject>,
    next_seq: u64,
    delivered: SequenceInfo,
    ack_floor: SequenceInfo,
    pending: BTreeMap<u64, PendingEntry>,
    /// Acknowledged sequences above the ack floor
    acked: BTreeSet<u64>,
    terminated: u64,
    waiting: usize,
    last_active: Instant,
}

impl ConsumerState {
    /// Fix the start position against the current store
    pub(crate) fn new(config: ConsumerConfig, store: &MessageStore, now: Instant) -> Self {
        let filter = config.filter_subject.clone();
        let matches = |message: &&StoredMessage| {
            filter
                .as_deref()
                .is_none_or(|filter| subject_matches_pattern(&message.subject, filter))
        };

        let mut last_per_subject = None;
        let start_seq = match config.deliver_policy {
            DeliverPolicy::All => store.first_seq(),
            DeliverPolicy::New => store.last_seq() + 1,
            DeliverPolicy::Last => store
                .range_from(0)
                .filter(matches)
                .last()
                .map_or(store.last_seq() + 1, |message| message.sequence),
            DeliverPolicy::ByStartSequence { start_sequence } => start_sequence.max(1),
            DeliverPolicy::LastPerSubject => {
                let sequences = store
                    .last_per_subject(filter.as_deref().unwrap_or(">"))
                    .into_iter()
                    .map(|message| message.sequence)
                    .collect();
                last_per_subject = Some(LastPerSubject {
                    cutoff: store.last_seq(),
                    sequences,
                });
                store.first_seq()
            }
        };

        let before_start = SequenceInfo {
            consumer_sequence: 0,
            stream_sequence: start_seq.saturating_sub(1),
        };

        Self {
            config,
            start_seq,
            last_per_subject,
            next_seq: start_seq,
            delivered: before_start,
            ack_floor: before_start,
            pending: BTreeMap::new(),
            acked: BTreeSet::new(),
            terminated: 0,
            waiting: 0,
            last_active: now,
        }
    }

    pub(crate) fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub(crate) fn set_config(&mut self, config: ConsumerConfig) {
        self.config = config;
    }

    fn matches_filter(&self, subject: &str) -> bool {
        self.config
            .filter_subject
            .as_deref()
            .is_none_or(|filter| subject_matches_pattern(subject, filter))
    }

    /// Whether this consumer would deliver the message at all
    fn is_eligible(&self, sequence: u64, subject: &str) -> bool {
        if sequence < self.start_seq || !self.matches_filter(subject) {
            return false;
        }
        match &self.last_per_subject {
            Some(lps) if sequence <= lps.cutoff => lps.sequences.contains(&sequence),
            _ => true,
        }
    }

    fn is_acked(&self, sequence: u64) -> bool {
        sequence <= self.ack_floor.stream_sequence || self.acked.contains(&sequence)
    }

    /// Whether the message still has to be delivered to or acknowledged by
    /// this consumer
    pub(crate) fn needs_ack(&self, sequence: u64, subject: &str) -> bool {
        if !self.is_eligible(sequence, subject) {
            return false;
        }
        if sequence >= self.next_seq {
            return true;
        }
        !self.is_acked(sequence)
    }

    fn mark_acked(&mut self, sequence: u64) {
        self.acked.insert(sequence);
        self.advance_floor();
    }

    fn advance_floor(&mut self) {
        self.ack_floor = match self.pending.first_key_value() {
            Some((sequence, entry)) => SequenceInfo {
                consumer_sequence: entry.consumer_sequence.saturating_sub(1),
                stream_sequence: sequence.saturating_sub(1),
            },
            None => self.delivered,
        };
        let floor = self.ack_floor.stream_sequence;
        self.acked = self.acked.split_off(&(floor + 1));
    }

    /// Forget pending entries whose messages were removed by the stream
    fn drop_removed(&mut self, store: &MessageStore) {
        let before = self.pending.len();
        self.pending
            .retain(|sequence, _| store.get(*sequence).is_some());
        if self.pending.len() != before {
            self.advance_floor();
        }
    }

    /// Earliest redelivery deadline among pending entries
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|entry| entry.deadline).min()
    }

    /// Hand out redeliveries first, then new messages, within the limits
    pub(crate) fn collect(
        &mut self,
        store: &MessageStore,
        batch: usize,
        max_bytes: Option<usize>,
        now: Instant,
    ) -> Collected {
        self.drop_removed(store);
        self.last_active = now;

        let ack_wait = self.config.ack_wait_or_default();
        let mut collected = Collected::default();
        let mut bytes = 0u64;
        let fits = |bytes: u64, size: u64| max_bytes.is_none_or(|max| bytes + size <= max as u64);

        let due: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(sequence, _)| *sequence)
            .collect();

        for sequence in due {
            if collected.deliveries.len() >= batch {
                break;
            }
            let Some(message) = store.get(sequence) else {
                continue;
            };
            let Some(entry) = self.pending.get_mut(&sequence) else {
                continue;
            };

            if self
                .config
                .max_deliver
                .is_some_and(|max| entry.deliveries >= max)
            {
                self.pending.remove(&sequence);
                self.acked.insert(sequence);
                self.terminated += 1;
                collected.settled.push(sequence);
                continue;
            }

            let size = message.size();
            if !fits(bytes, size) {
                if collected.deliveries.is_empty() {
                    collected.oversized = Some(size);
                }
                break;
            }

            entry.deliveries += 1;
            entry.deadline = deadline_after(now, ack_wait);
            bytes += size;
            collected.deliveries.push(Delivery {
                message: message.clone(),
                consumer_sequence: entry.consumer_sequence,
                deliveries: entry.deliveries,
            });
        }

        if collected.oversized.is_none() {
            self.collect_new(store, batch, max_bytes, now, ack_wait, &mut bytes, &mut collected);
        }

        if !collected.settled.is_empty() {
            self.advance_floor();
        }
        collected
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_new(
        &mut self,
        store: &MessageStore,
        batch: usize,
        max_bytes: Option<usize>,
        now: Instant,
        ack_wait: Duration,
        bytes: &mut u64,
        collected: &mut Collected,
    ) {
        let ack_none = self.config.ack_policy == AckPolicy::None;
        let max_ack_pending = self.config.max_ack_pending.unwrap_or(u64::MAX);
        let mut candidates = store.range_from(self.next_seq);

        loop {
            if collected.deliveries.len() >= batch {
                break;
            }
            if !ack_none && self.pending.len() as u64 >= max_ack_pending {
                break;
            }

            let Some(message) = candidates
                .by_ref()
                .find(|message| self.is_eligible(message.sequence, &message.subject))
            else {
                self.next_seq = self.next_seq.max(store.last_seq() + 1);
                break;
            };

            let size = message.size();
            if max_bytes.is_some_and(|max| *bytes + size > max as u64) {
                if collected.deliveries.is_empty() {
                    collected.oversized = Some(size);
                }
                break;
            }

            let sequence = message.sequence;
            self.next_seq = sequence + 1;
            self.delivered = SequenceInfo {
                consumer_sequence: self.delivered.consumer_sequence + 1,
                stream_sequence: sequence,
            };
            *bytes += size;

            if ack_none {
                self.acked.insert(sequence);
                collected.settled.push(sequence);
            } else {
                self.pending.insert(
                    sequence,
                    PendingEntry {
                        consumer_sequence: self.delivered.consumer_sequence,
                        deliveries: 1,
                        deadline: deadline_after(now, ack_wait),
                    },
                );
            }

            collected.deliveries.push(Delivery {
                message: message.clone(),
                consumer_sequence: self.delivered.consumer_sequence,
                deliveries: 1,
            });
        }
    }

    /// Apply an acknowledgement, returning the sequences it settled
    ///
    /// Unknown or already settled sequences are ignored.
    pub(crate) fn apply_ack(&mut self, sequence: u64, kind: AckKind, now: Instant) -> Vec<u64> {
        self.last_active = now;

        let settled = match kind {
            AckKind::Ack | AckKind::AckAndConfirm => match self.config.ack_policy {
                AckPolicy::None => Vec::new(),
                AckPolicy::Explicit => self
                    .pending
                    .remove(&sequence)
                    .map(|_| vec![sequence])
                    .unwrap_or_default(),
                AckPolicy::All => {
                    let settled: Vec<u64> =
                        self.pending.range(..=sequence).map(|(s, _)| *s).collect();
                    for settled_sequence in &settled {
                        self.pending.remove(settled_sequence);
                    }
                    settled
                }
            },
            AckKind::Nak(delay) => {
                if let Some(entry) = self.pending.get_mut(&sequence) {
                    entry.deadline = deadline_after(now, delay.unwrap_or_default());
                }
                Vec::new()
            }
            AckKind::InProgress => {
                let ack_wait = self.config.ack_wait_or_default();
                if let Some(entry) = self.pending.get_mut(&sequence) {
                    entry.deadline = deadline_after(now, ack_wait);
                }
                Vec::new()
            }
            AckKind::Terminate => {
                if self.pending.remove(&sequence).is_some() {
                    self.terminated += 1;
                    vec![sequence]
                } else {
                    Vec::new()
                }
            }
        };

        for settled_sequence in &settled {
            self.acked.insert(*settled_sequence);
        }
        if !settled.is_empty() {
            self.advance_floor();
        }
        settled
    }

    /// Reserve a waiting-pull slot
    pub(crate) fn try_add_waiting(&mut self, now: Instant) -> bool {
        self.last_active = now;
        if self.waiting >= self.config.max_waiting.unwrap_or(usize::MAX) {
            return false;
        }
        self.waiting += 1;
        true
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_active = now;
    }

    pub(crate) fn remove_waiting(&mut self, now: Instant) {
        self.waiting = self.waiting.saturating_sub(1);
        self.last_active = now;
    }

    /// Whether an inactivity threshold elapsed with no pull waiting
    pub(crate) fn is_inactive(&self, now: Instant) -> bool {
        self.waiting == 0
            && self
                .config
                .inactive_threshold
                .is_some_and(|threshold| now.duration_since(self.last_active) >= threshold)
    }

    pub(crate) fn delivered(&self) -> SequenceInfo {
        self.delivered
    }

    pub(crate) fn ack_floor(&self) -> SequenceInfo {
        self.ack_floor
    }

    pub(crate) fn num_ack_pending(&self) -> u64 {
        self.pending.len() as u64
    }

    pub(crate) fn num_redelivered(&self) -> u64 {
        self.pending
            .values()
            .filter(|entry| entry.deliveries > 1)
            .count() as u64
    }

    pub(crate) fn num_terminated(&self) -> u64 {
        self.terminated
    }

    pub(crate) fn num_waiting(&self) -> usize {
        self.waiting
    }

    /// Matching messages not yet delivered
    pub(crate) fn num_pending(&self, store: &MessageStore) -> u64 {
        store
            .range_from(self.next_seq)
            .filter(|message| self.is_eligible(message.sequence, &message.subject))
            .count() as u64
    }
}
