//! Reference-counted capture buffers shared by all clients of one device.
//!
//! Buffers live in an arena addressed by index. An unused buffer sits on
//! the free list; a published buffer sits in the in-flight queue and in the
//! pending queue of every attached client whose service mask matches its
//! content. Its reference count is the number of pending queues holding it.
//! When that count reaches zero the buffer goes back to the free list.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, warn};
use vbi_proxy_protocol::{ServiceSet, SlicedFrame};

/// Identifier of a client session, unique for the broker's lifetime.
pub type ClientId = u64;

type BufferId = usize;

struct Slot {
    frame: SlicedFrame,
    refs: usize,
    seq: u64,
}

struct Attachment {
    services: ServiceSet,
    want_raw: bool,
    /// Published buffers this client has not consumed yet, oldest first.
    pending: VecDeque<BufferId>,
    dropped: u64,
}

/// A buffer taken off the free list, to be filled outside the pool lock.
pub struct FreeBuffer {
    id: BufferId,
    pub frame: SlicedFrame,
}

/// Counters reported when clients detach and devices close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub published: u64,
    /// Frames nobody wanted, freed on publish.
    pub discarded: u64,
    /// Frames taken back from slow clients.
    pub forced: u64,
}

/// Result of a forced release.
#[derive(Debug, Default)]
pub struct ForceFree {
    /// Sequence number of the sacrificed frame.
    pub seq: u64,
    /// Clients that lost the frame.
    pub victims: Vec<ClientId>,
}

pub struct BufferPool {
    slots: Vec<Slot>,
    free: Vec<BufferId>,
    queue: VecDeque<BufferId>,
    clients: BTreeMap<ClientId, Attachment>,
    max_lines: usize,
    next_seq: u64,
    stats: PoolStats,
}

impl BufferPool {
    pub fn new(buffer_count: usize, max_lines: usize) -> Self {
        let count = buffer_count.max(1);
        let slots = (0..count)
            .map(|_| Slot {
                frame: SlicedFrame::with_capacity(max_lines),
                refs: 0,
                seq: 0,
            })
            .collect();
        Self {
            slots,
            free: (0..count).rev().collect(),
            queue: VecDeque::with_capacity(count),
            clients: BTreeMap::new(),
            max_lines,
            next_seq: 1,
            stats: PoolStats::default(),
        }
    }

    /// Attach a client. It only sees frames published from now on.
    pub fn attach(&mut self, client: ClientId, services: ServiceSet, want_raw: bool) {
        self.clients.entry(client).or_insert(Attachment {
            services,
            want_raw,
            pending: VecDeque::new(),
            dropped: 0,
        });
    }

    /// Change the mask used for future publishes. Queued frames stay queued.
    pub fn update_services(&mut self, client: ClientId, services: ServiceSet) {
        if let Some(att) = self.clients.get_mut(&client) {
            att.services = services;
        }
    }

    /// Detach a client, releasing every frame it still references.
    ///
    /// Returns the number of frames it had dropped, or `None` if it was not
    /// attached. Calling this twice is harmless.
    pub fn detach(&mut self, client: ClientId) -> Option<u64> {
        let att = self.clients.remove(&client)?;
        for id in att.pending {
            self.unref(id);
        }
        Some(att.dropped)
    }

    pub fn is_attached(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    /// Pop a free buffer, growing its storage to the current line count.
    pub fn acquire_free(&mut self) -> Option<FreeBuffer> {
        let id = self.free.pop()?;
        let mut frame = std::mem::take(&mut self.slots[id].frame);
        frame.clear();
        if frame.lines.capacity() < self.max_lines {
            frame.lines.reserve(self.max_lines - frame.lines.len());
        }
        Some(FreeBuffer { id, frame })
    }

    /// Like [`acquire_free`](Self::acquire_free), but sacrifices the oldest
    /// in-flight frame when the free list is empty.
    pub fn acquire_or_force(&mut self) -> (Option<FreeBuffer>, Option<ForceFree>) {
        if self.free.is_empty() {
            let forced = self.force_free();
            (self.acquire_free(), forced)
        } else {
            (self.acquire_free(), None)
        }
    }

    /// Return a buffer that was not filled.
    pub fn recycle(&mut self, buf: FreeBuffer) {
        self.slots[buf.id].frame = buf.frame;
        self.slots[buf.id].refs = 0;
        self.free.push(buf.id);
    }

    /// Append a filled buffer to the in-flight queue.
    ///
    /// Every attached client whose mask intersects the frame's services
    /// takes one reference. A frame nobody wants is freed on the spot.
    /// Returns the frame's sequence number.
    pub fn publish(&mut self, buf: FreeBuffer) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.stats.published += 1;

        let id = buf.id;
        let content = buf.frame.services();
        let mut refs = 0;
        for att in self.clients.values_mut() {
            if att.services.intersects(content) {
                att.pending.push_back(id);
                refs += 1;
            }
        }

        let slot = &mut self.slots[id];
        slot.frame = buf.frame;
        slot.seq = seq;
        slot.refs = refs;

        if refs == 0 {
            self.stats.discarded += 1;
            self.free.push(id);
        } else {
            self.queue.push_back(id);
        }
        seq
    }

    /// Copy out the oldest frame pending for `client`, filtered to its
    /// mask, and release the client's reference to it.
    pub fn consume(&mut self, client: ClientId) -> Option<SlicedFrame> {
        let att = self.clients.get_mut(&client)?;
        let id = att.pending.pop_front()?;
        let frame = self.slots[id].frame.filtered(att.services, att.want_raw);
        self.unref(id);
        Some(frame)
    }

    /// Release the oldest frame pending for `client` without reading it.
    pub fn release(&mut self, client: ClientId) -> bool {
        let id = match self.clients.get_mut(&client).and_then(|a| a.pending.pop_front()) {
            Some(id) => id,
            None => return false,
        };
        self.unref(id);
        true
    }

    /// Forcibly free the oldest in-flight frame.
    ///
    /// Every client still holding it loses it; clients that already
    /// consumed it are unaffected.
    pub fn force_free(&mut self) -> Option<ForceFree> {
        let id = self.queue.pop_front()?;
        let seq = self.slots[id].seq;
        let mut victims = Vec::new();
        for (client, att) in self.clients.iter_mut() {
            // FIFO delivery: if the client holds the oldest frame, it is at the front.
            if att.pending.front() == Some(&id) {
                att.pending.pop_front();
                att.dropped += 1;
                victims.push(*client);
            }
        }
        debug_assert_eq!(victims.len(), self.slots[id].refs);
        self.slots[id].refs = 0;
        self.free.push(id);
        self.stats.forced += 1;
        warn!(
            "Buffer pool exhausted: dropped frame #{} for {} slow client(s)",
            seq,
            victims.len()
        );
        Some(ForceFree { seq, victims })
    }

    /// Discard every in-flight frame. Used around channel changes and
    /// parameter renegotiation.
    pub fn flush(&mut self) {
        for att in self.clients.values_mut() {
            att.pending.clear();
        }
        let flushed = self.queue.len();
        while let Some(id) = self.queue.pop_front() {
            self.slots[id].refs = 0;
            self.free.push(id);
        }
        if flushed > 0 {
            debug!("Flushed {} in-flight frame(s)", flushed);
        }
    }

    /// Set the line capacity future buffers must have.
    pub fn set_max_lines(&mut self, max_lines: usize) {
        self.max_lines = max_lines;
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    fn unref(&mut self, id: BufferId) {
        let slot = &mut self.slots[id];
        debug_assert!(slot.refs > 0, "buffer released more often than referenced");
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            // Clients with disjoint masks finish out of order, so the
            // buffer is not always the head.
            if let Some(pos) = self.queue.iter().position(|&q| q == id) {
                self.queue.remove(pos);
            }
            self.free.push(id);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_for(&self, client: ClientId) -> usize {
        self.clients.get(&client).map_or(0, |a| a.pending.len())
    }

    pub fn dropped_for(&self, client: ClientId) -> u64 {
        self.clients.get(&client).map_or(0, |a| a.dropped)
    }

    /// Reference counts of the in-flight frames, oldest first.
    pub fn in_flight_refs(&self) -> Vec<usize> {
        self.queue.iter().map(|&id| self.slots[id].refs).collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}
