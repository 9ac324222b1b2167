//! Conversation merge and ordering.
//!
//! A [`Conversation`] is the ordered message list for one direct pair or
//! room. It takes input from three places that race each other:
//!
//! - history batches from REST (`merge_history`)
//! - live pushes from the hub (`apply_pushed`)
//! - local sends (`push_optimistic`, then `mark_sent` / `mark_failed`)
//!
//! Whatever order those arrive in, the list stays sorted ascending by
//! timestamp. Entries with equal timestamps keep their arrival order.
//!
//! # Echo matching
//!
//! The hub pushes our own sends back to us. A pushed (or fetched) message
//! upgrades an optimistic entry in place when sender and content are equal
//! and its timestamp is within the echo tolerance of the moment we sent.
//! The oldest matching optimistic entry wins. The send time is kept apart
//! from the display timestamp, which may have been clamped forward.
//!
//! # Late identity
//!
//! Direct pushes carry no server id, so the same message can be learned
//! twice: once pushed, once from a later history fetch. A fetched message
//! whose id is new gives that id to an id-less entry with the same sender,
//! content and nearby timestamp instead of being inserted. A push that
//! arrives after its history copy is absorbed the same way.
//!
//! ```text
//!   push_optimistic ──▶ OptimisticLocal/Pending ──mark_sent──▶ OptimisticLocal/Confirmed
//!                               │                                      │
//!                          mark_failed                               echo
//!                               ▼                                      ▼
//!                      OptimisticLocal/Failed ──echo──▶ ServerConfirmed/Confirmed
//!                               │
//!                             retry ──▶ OptimisticLocal/Pending (moved to the end)
//! ```

use std::collections::HashMap;
use std::time::Duration;

use huddle_types::{
    ChatMessage, ConversationKey, DeliveryOrigin, DeliveryState, LocalId, MessageId,
    MessageTarget, UserId,
};
use tracing::{debug, trace, warn};

use crate::constants::ECHO_TOLERANCE;

/// Result of feeding one message into a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new entry now sits at `index`.
    Inserted { index: usize },
    /// An optimistic entry was upgraded by its server copy.
    Confirmed { local_id: LocalId, index: usize },
    /// An entry already in the list learned its server id, or absorbed a
    /// push of a message it already held.
    Identified { index: usize },
    /// Nothing changed (see reason).
    Skipped { reason: SkipReason },
}

/// Why a message was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A message with this server id is already in the list.
    DuplicateId(MessageId),
    /// The message belongs to another conversation.
    NotOurs { key: String },
}

/// Summary of a history merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryMerge {
    pub added: usize,
    pub confirmed: usize,
    pub identified: usize,
    pub skipped: usize,
}

/// Errors touching a locally composed entry.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LocalEntryError {
    #[error("no local entry {0}")]
    Unknown(LocalId),
    #[error("entry {0} was already confirmed by the server")]
    AlreadyConfirmed(LocalId),
    #[error("entry {0} has not failed")]
    NotFailed(LocalId),
}

/// Ordered, de-duplicated messages of one conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    key: ConversationKey,
    /// Sorted by timestamp; ties in arrival order.
    messages: Vec<ChatMessage>,
    /// Wall-clock send time of optimistic entries, for echo matching.
    sent_at: HashMap<LocalId, u64>,
    /// Bumped on every mutation.
    version: u64,
    echo_tolerance: Duration,
}

impl Conversation {
    pub fn new(key: ConversationKey) -> Self {
        Self::with_echo_tolerance(key, ECHO_TOLERANCE)
    }

    pub fn with_echo_tolerance(key: ConversationKey, echo_tolerance: Duration) -> Self {
        Self {
            key,
            messages: Vec::new(),
            sent_at: HashMap::new(),
            version: 0,
            echo_tolerance,
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Version counter for change detection.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, local_id: &LocalId) -> Option<&ChatMessage> {
        self.position_of(local_id).map(|i| &self.messages[i])
    }

    /// Timestamp of the newest entry, 0 when empty.
    pub fn last_timestamp(&self) -> u64 {
        self.messages.last().map(|m| m.timestamp).unwrap_or(0)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Merge a batch of fetched history.
    ///
    /// Each message goes through the same identity and echo checks as a
    /// push, so refetching a window that overlaps the list is harmless.
    pub fn merge_history(&mut self, batch: Vec<ChatMessage>) -> HistoryMerge {
        let mut summary = HistoryMerge::default();
        let mut fresh = Vec::new();

        for msg in batch {
            if let Some(reason) = self.reject_reason(&msg) {
                trace!("history entry skipped: {:?}", reason);
                summary.skipped += 1;
                continue;
            }
            let repeated = msg
                .id
                .as_ref()
                .is_some_and(|id| fresh.iter().any(|m: &ChatMessage| m.id.as_ref() == Some(id)));
            if repeated {
                summary.skipped += 1;
                continue;
            }
            if self.confirm_echo(&msg).is_some() {
                summary.confirmed += 1;
                continue;
            }
            if self.identify(&msg).is_some() {
                summary.identified += 1;
                continue;
            }
            fresh.push(msg);
        }

        summary.added = fresh.len();
        if summary.added > 0 {
            self.messages.extend(fresh);
            // Stable: existing entries stay ahead of equal-timestamp newcomers
            self.messages.sort_by_key(|m| m.timestamp);
        }
        if summary.added > 0 || summary.confirmed > 0 || summary.identified > 0 {
            self.version += 1;
        }
        debug!(
            "{}: history merged (+{} added, {} confirmed, {} identified, {} skipped, {} total)",
            self.key,
            summary.added,
            summary.confirmed,
            summary.identified,
            summary.skipped,
            self.messages.len()
        );
        summary
    }

    /// Apply a message pushed by the hub.
    pub fn apply_pushed(&mut self, msg: ChatMessage) -> MergeOutcome {
        if let Some(reason) = self.reject_reason(&msg) {
            debug!("{}: push skipped: {:?}", self.key, reason);
            return MergeOutcome::Skipped { reason };
        }
        if let Some((local_id, index)) = self.confirm_echo(&msg) {
            self.version += 1;
            return MergeOutcome::Confirmed { local_id, index };
        }
        if let Some(index) = self.absorb_push(&msg) {
            self.version += 1;
            return MergeOutcome::Identified { index };
        }
        let index = self.insert_sorted(msg);
        self.version += 1;
        trace!("{}: push inserted at {}", self.key, index);
        MergeOutcome::Inserted { index }
    }

    // ========================================================================
    // Local sends
    // ========================================================================

    /// Append a locally composed message before the network knows about it.
    ///
    /// The timestamp is `now_ms`, raised to the newest entry's timestamp if
    /// the local clock is behind, so the entry lands at the end.
    pub fn push_optimistic(
        &mut self,
        sender: UserId,
        target: MessageTarget,
        content: impl Into<String>,
        now_ms: u64,
    ) -> LocalId {
        let timestamp = now_ms.max(self.last_timestamp());
        let msg = ChatMessage::optimistic(sender, target, content, timestamp);
        let local_id = msg.local_id.unwrap_or_default();
        self.messages.push(msg);
        self.sent_at.insert(local_id, now_ms);
        self.version += 1;
        trace!("{}: optimistic {} queued", self.key, local_id.short());
        local_id
    }

    /// The network accepted the send.
    pub fn mark_sent(&mut self, local_id: &LocalId) -> Result<(), LocalEntryError> {
        let index = self
            .position_of(local_id)
            .ok_or(LocalEntryError::Unknown(*local_id))?;
        let entry = &mut self.messages[index];
        // An echo may have beaten the send reply; that entry is already final.
        if entry.state != DeliveryState::Confirmed {
            entry.state = DeliveryState::Confirmed;
            self.version += 1;
        }
        Ok(())
    }

    /// The send failed. The entry stays in the list, flagged.
    pub fn mark_failed(&mut self, local_id: &LocalId) -> Result<(), LocalEntryError> {
        let index = self
            .position_of(local_id)
            .ok_or(LocalEntryError::Unknown(*local_id))?;
        let entry = &mut self.messages[index];
        if entry.origin == DeliveryOrigin::ServerConfirmed {
            return Err(LocalEntryError::AlreadyConfirmed(*local_id));
        }
        warn!("{}: send {} failed", self.key, local_id.short());
        entry.state = DeliveryState::Failed;
        self.version += 1;
        Ok(())
    }

    /// Put a failed entry back to pending and hand back a copy to resend.
    ///
    /// The entry is sent again at `now_ms`, so it moves to the end of the
    /// list with a fresh timestamp, clamped like [`push_optimistic`](Self::push_optimistic).
    pub fn retry(
        &mut self,
        local_id: &LocalId,
        now_ms: u64,
    ) -> Result<ChatMessage, LocalEntryError> {
        let index = self
            .position_of(local_id)
            .ok_or(LocalEntryError::Unknown(*local_id))?;
        if self.messages[index].state != DeliveryState::Failed {
            return Err(LocalEntryError::NotFailed(*local_id));
        }
        let mut entry = self.messages.remove(index);
        entry.state = DeliveryState::Pending;
        entry.timestamp = now_ms.max(self.last_timestamp());
        self.sent_at.insert(*local_id, now_ms);
        let copy = entry.clone();
        self.messages.push(entry);
        self.version += 1;
        trace!("{}: retrying {}", self.key, local_id.short());
        Ok(copy)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn position_of(&self, local_id: &LocalId) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.local_id.as_ref() == Some(local_id))
    }

    fn reject_reason(&self, msg: &ChatMessage) -> Option<SkipReason> {
        if !self.key.contains(msg) {
            return Some(SkipReason::NotOurs {
                key: ConversationKey::of(msg).to_string(),
            });
        }
        let id = msg.id.as_ref()?;
        self.messages
            .iter()
            .any(|m| m.id.as_ref() == Some(id))
            .then(|| SkipReason::DuplicateId(id.clone()))
    }

    fn tolerance_ms(&self) -> u64 {
        self.echo_tolerance.as_millis() as u64
    }

    /// Upgrade the oldest optimistic entry `msg` echoes, if any.
    ///
    /// Returns the upgraded entry's local id and its new index.
    fn confirm_echo(&mut self, msg: &ChatMessage) -> Option<(LocalId, usize)> {
        let tolerance = self.tolerance_ms();
        let candidate = self.messages.iter().position(|m| {
            let sent = m
                .local_id
                .and_then(|l| self.sent_at.get(&l).copied())
                .unwrap_or(m.timestamp);
            m.origin == DeliveryOrigin::OptimisticLocal
                && same_message(m, msg)
                && sent.abs_diff(msg.timestamp) <= tolerance
        })?;

        let mut entry = self.messages.remove(candidate);
        entry.id = msg.id.clone().or(entry.id);
        entry.timestamp = msg.timestamp;
        entry.origin = DeliveryOrigin::ServerConfirmed;
        entry.state = DeliveryState::Confirmed;
        let local_id = entry.local_id.unwrap_or_default();
        self.sent_at.remove(&local_id);
        let index = self.insert_sorted(entry);
        debug!(
            "{}: echo confirmed {} at {}",
            self.key,
            local_id.short(),
            index
        );
        Some((local_id, index))
    }

    /// Give `msg`'s server id to an id-less entry holding the same message.
    ///
    /// Candidates are pushes and echo-confirmed sends; optimistic entries
    /// go through [`confirm_echo`](Self::confirm_echo) instead.
    fn identify(&mut self, msg: &ChatMessage) -> Option<usize> {
        let id = msg.id.as_ref()?;
        let tolerance = self.tolerance_ms();
        // Closest in time, so repeated texts pair up with their own copies
        let (candidate, _) = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.id.is_none()
                    && m.origin != DeliveryOrigin::OptimisticLocal
                    && same_message(m, msg)
            })
            .map(|(i, m)| (i, m.timestamp.abs_diff(msg.timestamp)))
            .filter(|(_, diff)| *diff <= tolerance)
            .min_by_key(|(_, diff)| *diff)?;

        let mut entry = self.messages.remove(candidate);
        entry.id = Some(id.clone());
        entry.timestamp = msg.timestamp;
        let index = self.insert_sorted(entry);
        debug!("{}: entry at {} identified as {}", self.key, index, id);
        Some(index)
    }

    /// Absorb an id-less push whose history copy is already listed.
    ///
    /// Each fetched entry absorbs at most one push; it is then marked
    /// [`DeliveryOrigin::PushedLive`] so a second identical push still
    /// shows up as its own message.
    fn absorb_push(&mut self, msg: &ChatMessage) -> Option<usize> {
        if msg.id.is_some() || msg.origin != DeliveryOrigin::PushedLive {
            return None;
        }
        let tolerance = self.tolerance_ms();
        let index = self.messages.iter().position(|m| {
            m.id.is_some()
                && m.local_id.is_none()
                && m.origin == DeliveryOrigin::ServerConfirmed
                && same_message(m, msg)
                && m.timestamp.abs_diff(msg.timestamp) <= tolerance
        })?;
        self.messages[index].origin = DeliveryOrigin::PushedLive;
        trace!("{}: push absorbed by entry at {}", self.key, index);
        Some(index)
    }

    /// Insert after every entry with a timestamp `<=` the new one.
    fn insert_sorted(&mut self, msg: ChatMessage) -> usize {
        let index = self
            .messages
            .partition_point(|m| m.timestamp <= msg.timestamp);
        self.messages.insert(index, msg);
        index
    }
}

fn same_message(a: &ChatMessage, b: &ChatMessage) -> bool {
    a.sender_id == b.sender_id && a.target == b.target && a.content == b.content
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_types::RoomId;

    fn alice() -> UserId {
        UserId::new("1")
    }

    fn bob() -> UserId {
        UserId::new("2")
    }

    fn dm() -> Conversation {
        Conversation::new(ConversationKey::direct(alice(), bob()))
    }

    fn from_alice(id: &str, content: &str, ts: u64) -> ChatMessage {
        ChatMessage::from_history(
            Some(MessageId::new(id)),
            alice(),
            MessageTarget::Direct(bob()),
            content,
            ts,
        )
    }

    fn from_bob(id: &str, content: &str, ts: u64) -> ChatMessage {
        ChatMessage::from_history(
            Some(MessageId::new(id)),
            bob(),
            MessageTarget::Direct(alice()),
            content,
            ts,
        )
    }

    fn pushed_from_alice(content: &str, ts: u64) -> ChatMessage {
        ChatMessage::pushed(None, alice(), MessageTarget::Direct(bob()), content, ts)
    }

    fn timestamps(conv: &Conversation) -> Vec<u64> {
        conv.messages().iter().map(|m| m.timestamp).collect()
    }

    fn assert_sorted(conv: &Conversation) {
        let ts = timestamps(conv);
        assert!(ts.windows(2).all(|w| w[0] <= w[1]), "unsorted: {ts:?}");
    }

    #[test]
    fn test_history_two_directions_sorted() {
        let mut conv = dm();
        conv.merge_history(vec![from_alice("a1", "x", 100), from_alice("a2", "y", 300)]);
        conv.merge_history(vec![from_bob("b1", "z", 200), from_bob("b2", "w", 50)]);
        assert_eq!(timestamps(&conv), vec![50, 100, 200, 300]);
    }

    #[test]
    fn test_history_dedupes_by_id() {
        let mut conv = dm();
        let first = conv.merge_history(vec![from_alice("a1", "x", 100), from_alice("a1", "x", 100)]);
        assert_eq!(first.added, 1);
        assert_eq!(first.skipped, 1);

        let second = conv.merge_history(vec![from_alice("a1", "x", 100), from_bob("b1", "y", 150)]);
        assert_eq!(second.added, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn test_any_interleaving_stays_sorted() {
        // Deterministic shuffles of history and pushes
        let history = vec![
            from_alice("1", "a", 10),
            from_bob("2", "b", 40),
            from_alice("3", "c", 20),
            from_bob("4", "d", 40),
            from_alice("5", "e", 5),
        ];
        let pushes = vec![
            ChatMessage::pushed(Some(MessageId::new("6")), bob(), MessageTarget::Direct(alice()), "f", 30),
            ChatMessage::pushed(Some(MessageId::new("7")), alice(), MessageTarget::Direct(bob()), "g", 1),
            ChatMessage::pushed(Some(MessageId::new("8")), bob(), MessageTarget::Direct(alice()), "h", 40),
        ];

        for split in 0..=pushes.len() {
            for chunk in 1..=history.len() {
                let mut conv = dm();
                for p in &pushes[..split] {
                    conv.apply_pushed(p.clone());
                }
                for batch in history.chunks(chunk) {
                    conv.merge_history(batch.to_vec());
                    assert_sorted(&conv);
                }
                for p in &pushes[split..] {
                    conv.apply_pushed(p.clone());
                    assert_sorted(&conv);
                }
                assert_eq!(conv.len(), history.len() + pushes.len());
            }
        }
    }

    #[test]
    fn test_push_ties_go_after_existing() {
        let mut conv = dm();
        conv.merge_history(vec![from_alice("a1", "first", 100)]);
        let outcome = conv.apply_pushed(ChatMessage::pushed(
            None,
            bob(),
            MessageTarget::Direct(alice()),
            "second",
            100,
        ));
        assert_eq!(outcome, MergeOutcome::Inserted { index: 1 });
        assert_eq!(conv.messages()[1].content, "second");
    }

    #[test]
    fn test_push_appended_after_history() {
        let mut conv = dm();
        conv.merge_history(vec![from_bob("b1", "old", 100), from_alice("a1", "older", 50)]);
        let v = conv.version();
        let outcome = conv.apply_pushed(pushed_from_alice("hello", 200));
        assert_eq!(outcome, MergeOutcome::Inserted { index: 2 });
        assert_eq!(conv.messages().last().map(|m| m.content.as_str()), Some("hello"));
        assert!(conv.version() > v);
    }

    #[test]
    fn test_duplicate_push_skipped() {
        let mut conv = dm();
        conv.merge_history(vec![from_alice("a1", "x", 100)]);
        let outcome = conv.apply_pushed(ChatMessage::pushed(
            Some(MessageId::new("a1")),
            alice(),
            MessageTarget::Direct(bob()),
            "x",
            100,
        ));
        assert_eq!(
            outcome,
            MergeOutcome::Skipped {
                reason: SkipReason::DuplicateId(MessageId::new("a1"))
            }
        );
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_foreign_conversation_skipped() {
        let mut conv = dm();
        let stranger = ChatMessage::pushed(
            None,
            UserId::new("9"),
            MessageTarget::Direct(alice()),
            "psst",
            10,
        );
        assert!(matches!(
            conv.apply_pushed(stranger),
            MergeOutcome::Skipped {
                reason: SkipReason::NotOurs { .. }
            }
        ));

        let room_msg =
            ChatMessage::pushed(None, alice(), MessageTarget::Room(RoomId::new("r")), "x", 10);
        assert!(matches!(
            conv.apply_pushed(room_msg),
            MergeOutcome::Skipped { .. }
        ));
        assert!(conv.is_empty());
        assert_eq!(conv.version(), 0);
    }

    #[test]
    fn test_echo_upgrades_optimistic_in_place() {
        let t = 1_000_000;
        let mut conv = dm();
        let local = conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "hi", t);
        conv.mark_sent(&local).unwrap();

        let outcome = conv.apply_pushed(pushed_from_alice("hi", t + 50));
        assert_eq!(outcome, MergeOutcome::Confirmed { local_id: local, index: 0 });
        assert_eq!(conv.len(), 1);

        let msg = &conv.messages()[0];
        assert_eq!(msg.origin, DeliveryOrigin::ServerConfirmed);
        assert_eq!(msg.state, DeliveryState::Confirmed);
        assert_eq!(msg.timestamp, t + 50);
        assert_eq!(msg.local_id, Some(local));
    }

    #[test]
    fn test_echo_adopts_server_id() {
        let mut conv = dm();
        let local = conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "hi", 500);
        let echo = ChatMessage::pushed(
            Some(MessageId::new("77")),
            alice(),
            MessageTarget::Direct(bob()),
            "hi",
            520,
        );
        conv.apply_pushed(echo);
        assert_eq!(conv.get(&local).unwrap().id, Some(MessageId::new("77")));

        // The same server copy arriving again via history is a no-op
        let merge = conv.merge_history(vec![from_alice("77", "hi", 520)]);
        assert_eq!(merge.skipped, 1);
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_echo_outside_tolerance_is_new_message() {
        let mut conv = dm();
        conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "hi", 1_000);
        let outcome = conv.apply_pushed(pushed_from_alice("hi", 1_000 + 60_000));
        assert!(matches!(outcome, MergeOutcome::Inserted { .. }));
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn test_echo_requires_same_sender_and_content() {
        let mut conv = dm();
        conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "hi", 1_000);
        conv.apply_pushed(ChatMessage::pushed(
            None,
            bob(),
            MessageTarget::Direct(alice()),
            "hi",
            1_010,
        ));
        conv.apply_pushed(pushed_from_alice("hi!", 1_020));
        assert_eq!(conv.len(), 3);
        assert_eq!(
            conv.messages()
                .iter()
                .filter(|m| m.origin == DeliveryOrigin::OptimisticLocal)
                .count(),
            1
        );
    }

    #[test]
    fn test_oldest_optimistic_confirmed_first() {
        let mut conv = dm();
        let first = conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "ok", 1_000);
        let second = conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "ok", 1_100);

        let outcome = conv.apply_pushed(pushed_from_alice("ok", 1_150));
        assert!(matches!(outcome, MergeOutcome::Confirmed { local_id, .. } if local_id == first));
        assert_eq!(
            conv.get(&second).map(|m| m.origin),
            Some(DeliveryOrigin::OptimisticLocal)
        );

        let outcome = conv.apply_pushed(pushed_from_alice("ok", 1_160));
        assert!(matches!(outcome, MergeOutcome::Confirmed { local_id, .. } if local_id == second));
        assert_eq!(conv.len(), 2);
        assert_sorted(&conv);
    }

    #[test]
    fn test_history_can_confirm_optimistic() {
        let mut conv = dm();
        let local = conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "hey", 2_000);
        let merge = conv.merge_history(vec![from_alice("5", "hey", 2_030), from_bob("6", "yo", 1_000)]);
        assert_eq!(merge.confirmed, 1);
        assert_eq!(merge.added, 1);
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[1].local_id, Some(local));
        assert_eq!(conv.messages()[1].origin, DeliveryOrigin::ServerConfirmed);
    }

    #[test]
    fn test_optimistic_clamped_to_last_timestamp() {
        let mut conv = dm();
        conv.merge_history(vec![from_bob("b1", "from the future", 10_000)]);
        let local = conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "me", 5_000);
        let msg = conv.get(&local).unwrap();
        assert_eq!(msg.timestamp, 10_000);
        assert_eq!(conv.messages().last().and_then(|m| m.local_id), Some(local));
        assert_eq!(msg.state, DeliveryState::Pending);
    }

    #[test]
    fn test_failed_send_stays_visible_and_retries() {
        let mut conv = dm();
        let local = conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "lost", 100);
        conv.mark_failed(&local).unwrap();
        assert_eq!(conv.len(), 1);
        assert!(conv.get(&local).unwrap().is_failed());

        let resend = conv.retry(&local, 200).unwrap();
        assert_eq!(resend.content, "lost");
        assert_eq!(conv.get(&local).unwrap().state, DeliveryState::Pending);

        assert_eq!(conv.retry(&local, 300), Err(LocalEntryError::NotFailed(local)));
    }

    #[test]
    fn test_late_echo_rescues_failed_entry() {
        let mut conv = dm();
        let local = conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "maybe", 100);
        conv.mark_failed(&local).unwrap();
        conv.apply_pushed(pushed_from_alice("maybe", 120));
        let msg = conv.get(&local).unwrap();
        assert_eq!(msg.state, DeliveryState::Confirmed);
        assert_eq!(conv.mark_failed(&local), Err(LocalEntryError::AlreadyConfirmed(local)));
    }

    #[test]
    fn test_retry_restamps_and_moves_to_end() {
        let mut conv = dm();
        let local = conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "late", 1_000);
        conv.mark_failed(&local).unwrap();
        conv.apply_pushed(ChatMessage::pushed(
            None,
            bob(),
            MessageTarget::Direct(alice()),
            "meanwhile",
            5_000,
        ));

        let resend = conv.retry(&local, 31_000).unwrap();
        assert_eq!(resend.timestamp, 31_000);
        assert_eq!(conv.messages().last().and_then(|m| m.local_id), Some(local));
        conv.mark_sent(&local).unwrap();

        let outcome = conv.apply_pushed(pushed_from_alice("late", 31_040));
        assert!(matches!(outcome, MergeOutcome::Confirmed { local_id, .. } if local_id == local));
        assert_eq!(conv.len(), 2);
        assert_sorted(&conv);
    }

    #[test]
    fn test_echo_matches_send_time_not_clamped_timestamp() {
        let mut conv = dm();
        // Peer's clock runs a minute ahead of ours
        conv.merge_history(vec![from_bob("b1", "early bird", 70_000)]);
        let local = conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "hi", 10_000);
        assert_eq!(conv.get(&local).unwrap().timestamp, 70_000);

        let outcome = conv.apply_pushed(pushed_from_alice("hi", 10_030));
        assert!(matches!(outcome, MergeOutcome::Confirmed { local_id, .. } if local_id == local));
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.get(&local).unwrap().timestamp, 10_030);
        assert_sorted(&conv);
    }

    #[test]
    fn test_history_copy_identifies_pushed_entry() {
        let mut conv = dm();
        conv.apply_pushed(pushed_from_alice("hello", 1_000));

        let merge = conv.merge_history(vec![from_alice("42", "hello", 1_000)]);
        assert_eq!(merge.identified, 1);
        assert_eq!(merge.added, 0);
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages()[0].id, Some(MessageId::new("42")));

        // Later fetches see the id and skip
        let again = conv.merge_history(vec![from_alice("42", "hello", 1_000)]);
        assert_eq!(again.skipped, 1);
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_history_copy_identifies_echo_confirmed_entry() {
        let mut conv = dm();
        let local = conv.push_optimistic(alice(), MessageTarget::Direct(bob()), "hi", 1_000);
        conv.mark_sent(&local).unwrap();
        conv.apply_pushed(pushed_from_alice("hi", 1_050));

        let merge = conv.merge_history(vec![from_alice("7", "hi", 1_050)]);
        assert_eq!(merge.identified, 1);
        assert_eq!(conv.len(), 1);
        let msg = conv.get(&local).unwrap();
        assert_eq!(msg.id, Some(MessageId::new("7")));
        assert_eq!(msg.origin, DeliveryOrigin::ServerConfirmed);
    }

    #[test]
    fn test_identical_messages_each_keep_their_own_id() {
        let mut conv = dm();
        conv.apply_pushed(pushed_from_alice("ok", 1_000));
        conv.apply_pushed(pushed_from_alice("ok", 1_200));

        conv.merge_history(vec![from_alice("1", "ok", 1_000), from_alice("2", "ok", 1_200)]);
        let ids: Vec<_> = conv.messages().iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![Some(MessageId::new("1")), Some(MessageId::new("2"))]);
    }

    #[test]
    fn test_push_after_history_copy_is_absorbed() {
        let mut conv = dm();
        conv.merge_history(vec![from_alice("42", "hello", 1_000)]);

        let outcome = conv.apply_pushed(pushed_from_alice("hello", 1_000));
        assert_eq!(outcome, MergeOutcome::Identified { index: 0 });
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages()[0].origin, DeliveryOrigin::PushedLive);

        // A second send of the same text is a new message
        let outcome = conv.apply_pushed(pushed_from_alice("hello", 1_500));
        assert_eq!(outcome, MergeOutcome::Inserted { index: 1 });
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn test_unknown_local_id() {
        let mut conv = dm();
        let ghost = LocalId::new();
        assert_eq!(conv.mark_sent(&ghost), Err(LocalEntryError::Unknown(ghost)));
        assert_eq!(conv.mark_failed(&ghost), Err(LocalEntryError::Unknown(ghost)));
    }

    #[test]
    fn test_room_conversation_accepts_any_sender() {
        let room = RoomId::new("lobby");
        let mut conv = Conversation::new(ConversationKey::room(room.clone()));
        for (i, who) in ["1", "2", "3"].iter().enumerate() {
            conv.apply_pushed(ChatMessage::pushed(
                None,
                UserId::new(*who),
                MessageTarget::Room(room.clone()),
                "x",
                100 - i as u64,
            ));
        }
        assert_eq!(timestamps(&conv), vec![98, 99, 100]);
    }
}
