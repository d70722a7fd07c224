use crate::bitset::AtomicBitSet;
use crate::muscles::Quality;
use crate::protocol::ParticipantId;
use crate::quantize::Vec3;
use crate::repack::QualityFrames;
use crate::transport::Peer;
use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct PoseState {
    pub position: Vec3,
    pub frames: QualityFrames,
    pub updated_at_ms: u64,
}

pub struct Participant<P: Peer> {
    id: ParticipantId,
    peer: RwLock<Arc<P>>,
    pose: RwLock<PoseState>,
    /// Bit `j` set: this participant has not yet been sent `j`'s latest pose.
    dirty: AtomicBitSet,
    /// Peer id → timestamp (ms) of the last frame sent to this participant.
    last_sent: Mutex<AHashMap<ParticipantId, u64>>,
}

impl<P: Peer> Participant<P> {
    pub fn new(id: ParticipantId, peer: Arc<P>) -> Self {
        Self {
            id,
            peer: RwLock::new(peer),
            pose: RwLock::new(PoseState::default()),
            dirty: AtomicBitSet::new(),
            last_sent: Mutex::new(AHashMap::new()),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn peer(&self) -> Arc<P> {
        Arc::clone(&*self.peer.read())
    }

    pub fn is_served_by(&self, peer: &Arc<P>) -> bool {
        Arc::ptr_eq(&*self.peer.read(), peer)
    }

    /// Moves this id onto a new connection. The new client has seen nothing,
    /// so every peer is pending again and the send history is dropped.
    pub fn rebind(&self, peer: Arc<P>) {
        *self.peer.write() = peer;
        self.last_sent.lock().clear();
        self.dirty.set_all(true);
    }

    pub fn position(&self) -> Vec3 {
        self.pose.read().position
    }

    /// The frame to send for `quality`, and the quality tag it is encoded at.
    pub fn frame(&self, quality: Quality) -> (Quality, Bytes) {
        self.pose.read().frames.serve(quality)
    }

    pub fn pose(&self) -> PoseState {
        self.pose.read().clone()
    }

    pub fn update(&self, position: Vec3, frames: QualityFrames, now_ms: u64) {
        let mut pose = self.pose.write();
        pose.position = position;
        pose.frames = frames;
        pose.updated_at_ms = now_ms;
    }

    pub fn needs(&self, peer: ParticipantId) -> bool {
        self.dirty.get(peer as usize)
    }

    pub fn mark_dirty(&self, peer: ParticipantId) {
        self.dirty.set(peer as usize, true);
    }

    /// Claims the pending update from `peer`, if any.
    pub fn take_dirty(&self, peer: ParticipantId) -> bool {
        self.dirty.test_and_clear(peer as usize)
    }

    pub fn dirty_bits(&self) -> &AtomicBitSet {
        &self.dirty
    }

    pub fn last_sent(&self, peer: ParticipantId) -> Option<u64> {
        self.last_sent.lock().get(&peer).copied()
    }

    /// True when nothing was sent yet or at least `interval_ms` has passed.
    pub fn interval_elapsed(&self, peer: ParticipantId, now_ms: u64, interval_ms: u8) -> bool {
        match self.last_sent(peer) {
            Some(at) => now_ms.saturating_sub(at) >= interval_ms as u64,
            None => true,
        }
    }

    pub fn record_sent(&self, peer: ParticipantId, now_ms: u64) {
        self.last_sent.lock().insert(peer, now_ms);
    }

    /// Drops every reference to a departed peer.
    pub fn forget(&self, peer: ParticipantId) {
        self.dirty.set(peer as usize, false);
        self.last_sent.lock().remove(&peer);
    }

    pub fn tracked_peers(&self) -> usize {
        self.last_sent.lock().len()
    }
}

/// Active participants keyed by id.
pub struct ParticipantRegistry<P: Peer> {
    participants: RwLock<AHashMap<ParticipantId, Arc<Participant<P>>>>,
}

impl<P: Peer> ParticipantRegistry<P> {
    pub fn new() -> Self {
        Self {
            participants: RwLock::new(AHashMap::new()),
        }
    }

    pub fn get(&self, id: ParticipantId) -> Option<Arc<Participant<P>>> {
        self.participants.read().get(&id).cloned()
    }

    /// Returns the participant, creating it on first sight. A newcomer needs
    /// everyone's pose, and everyone needs the newcomer's. An id arriving on a
    /// different connection than the one on record is rebound to it.
    pub fn get_or_join(&self, id: ParticipantId, peer: &Arc<P>) -> Arc<Participant<P>> {
        if let Some(existing) = self.get(id) {
            return Self::refresh(existing, peer);
        }

        let mut participants = self.participants.write();
        if let Some(existing) = participants.get(&id) {
            return Self::refresh(Arc::clone(existing), peer);
        }

        let participant = Arc::new(Participant::new(id, Arc::clone(peer)));
        let highest = participants.keys().copied().max().unwrap_or(0).max(id);
        participant.dirty.fill_to(highest as usize + 1);

        for other in participants.values() {
            other.mark_dirty(id);
        }
        participants.insert(id, Arc::clone(&participant));

        info!(participant = id, active = participants.len(), "participant joined");
        participant
    }

    fn refresh(participant: Arc<Participant<P>>, peer: &Arc<P>) -> Arc<Participant<P>> {
        if !participant.is_served_by(peer) {
            participant.rebind(Arc::clone(peer));
            info!(participant = participant.id(), "participant moved to a new connection");
        }
        participant
    }

    /// Sets `sender`'s bit in every other participant.
    pub fn mark_updated(&self, sender: ParticipantId) {
        let participants = self.participants.read();
        for (id, participant) in participants.iter() {
            if *id != sender {
                participant.mark_dirty(sender);
            }
        }
    }

    pub fn remove(&self, id: ParticipantId) -> Option<Arc<Participant<P>>> {
        let mut participants = self.participants.write();
        let removed = participants.remove(&id)?;
        for other in participants.values() {
            other.forget(id);
        }

        info!(participant = id, active = participants.len(), "participant left");
        Some(removed)
    }

    /// Copies the active set into `out`, replacing its contents.
    pub fn snapshot_into(&self, out: &mut Vec<Arc<Participant<P>>>) {
        out.clear();
        out.extend(self.participants.read().values().cloned());
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.participants.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.participants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.read().is_empty()
    }
}

impl<P: Peer> Default for ParticipantRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
