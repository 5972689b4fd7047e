use log::debug;
use parking_lot::Mutex;

use crate::common::{FrameId, Timestamp};

/// Access history of a tracked frame.
///
/// A frame starts cold and is promoted to hot once it has been accessed
/// `k` times. Hot frames never go back to cold; eviction forgets the frame
/// entirely instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessState {
    Cold {
        accesses: usize,
        last_access: Timestamp,
    },
    Hot {
        last_access: Timestamp,
    },
}

impl AccessState {
    fn last_access(&self) -> Timestamp {
        match *self {
            AccessState::Cold { last_access, .. } | AccessState::Hot { last_access } => {
                last_access
            }
        }
    }

    /// Eviction priority; smaller is evicted first. Cold frames go before
    /// hot ones, then least recently used, then lowest frame index.
    fn victim_rank(&self, frame_id: FrameId) -> (u8, Timestamp, u32) {
        let tier = match self {
            AccessState::Cold { .. } => 0,
            AccessState::Hot { .. } => 1,
        };
        (tier, self.last_access(), frame_id.as_u32())
    }

    fn touched(self, now: Timestamp, k: usize) -> Self {
        match self {
            AccessState::Cold { accesses, .. } => {
                let accesses = accesses.saturating_add(1);
                if accesses >= k {
                    AccessState::Hot { last_access: now }
                } else {
                    AccessState::Cold {
                        accesses,
                        last_access: now,
                    }
                }
            }
            AccessState::Hot { .. } => AccessState::Hot { last_access: now },
        }
    }
}

#[derive(Debug)]
struct FrameSlot {
    state: AccessState,
    /// Whether this frame is currently evictable
    is_evictable: bool,
}

#[derive(Debug)]
struct ReplacerState {
    /// One entry per frame; None for frames the replacer is not tracking
    slots: Vec<Option<FrameSlot>>,
    /// Current timestamp (monotonically increasing)
    clock: Timestamp,
    /// Number of evictable frames
    num_evictable: usize,
}

/// LRU-K style replacement policy.
///
/// Frames accessed fewer than `k` times are cold and are evicted first, least
/// recently used first, which keeps one-off scans from flushing the working
/// set. Among hot frames the least recently used is evicted. Ties go to the
/// lowest frame index.
pub struct LruKReplacer {
    /// K value for the LRU-K algorithm
    k: usize,
    /// Maximum number of frames the replacer can track
    max_frames: usize,
    state: Mutex<ReplacerState>,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer with the given k value and maximum frame count.
    pub fn new(k: usize, max_frames: usize) -> Self {
        let mut slots = Vec::with_capacity(max_frames);
        slots.resize_with(max_frames, || None);

        Self {
            k: k.max(1),
            max_frames,
            state: Mutex::new(ReplacerState {
                slots,
                clock: 0,
                num_evictable: 0,
            }),
        }
    }

    /// Picks and forgets the evictable frame with the lowest rank.
    /// Returns None if there are no evictable frames.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();

        if state.num_evictable == 0 {
            return None;
        }

        let victim = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(slot) if slot.is_evictable => {
                    let frame_id = FrameId::new(i as u32);
                    Some((slot.state.victim_rank(frame_id), frame_id))
                }
                _ => None,
            })
            .min()
            .map(|(_, frame_id)| frame_id)?;

        state.slots[victim.as_usize()] = None;
        state.num_evictable -= 1;
        debug!("replacer chose {} as victim", victim);

        Some(victim)
    }

    /// Records that the given frame was accessed at the current timestamp.
    /// This method should be called after a page is pinned in the BufferPoolManager.
    pub fn record_access(&self, frame_id: FrameId) {
        if frame_id.as_usize() >= self.max_frames {
            return;
        }

        let mut state = self.state.lock();
        state.clock += 1;
        let now = state.clock;

        let slot = &mut state.slots[frame_id.as_usize()];
        match slot {
            Some(slot) => slot.state = slot.state.touched(now, self.k),
            None => {
                let fresh = AccessState::Cold {
                    accesses: 0,
                    last_access: now,
                };
                *slot = Some(FrameSlot {
                    state: fresh.touched(now, self.k),
                    is_evictable: false,
                });
            }
        }
    }

    /// Sets whether a frame is evictable.
    /// When a frame's pin count drops to 0, it should be marked as evictable.
    pub fn set_evictable(&self, frame_id: FrameId, is_evictable: bool) {
        if frame_id.as_usize() >= self.max_frames {
            return;
        }

        let mut state = self.state.lock();
        let ReplacerState {
            slots,
            clock,
            num_evictable,
        } = &mut *state;

        match &mut slots[frame_id.as_usize()] {
            Some(slot) => {
                if slot.is_evictable != is_evictable {
                    if is_evictable {
                        *num_evictable += 1;
                    } else {
                        *num_evictable -= 1;
                    }
                    slot.is_evictable = is_evictable;
                }
            }
            slot @ None if is_evictable => {
                // Never accessed; treat it as the coldest possible frame.
                *slot = Some(FrameSlot {
                    state: AccessState::Cold {
                        accesses: 0,
                        last_access: *clock,
                    },
                    is_evictable: true,
                });
                *num_evictable += 1;
            }
            None => {}
        }
    }

    /// Removes a frame from the replacer entirely.
    /// This should be called when a page is deleted from the BufferPoolManager.
    pub fn remove(&self, frame_id: FrameId) {
        if frame_id.as_usize() >= self.max_frames {
            return;
        }

        let mut state = self.state.lock();
        if let Some(slot) = state.slots[frame_id.as_usize()].take() {
            if slot.is_evictable {
                state.num_evictable -= 1;
            }
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.state.lock().num_evictable
    }

    /// Returns the k value of this replacer.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Returns whether the frame has reached k accesses.
    pub fn is_hot(&self, frame_id: FrameId) -> bool {
        matches!(
            self.state.lock().slots.get(frame_id.as_usize()),
            Some(Some(FrameSlot {
                state: AccessState::Hot { .. },
                ..
            }))
        )
    }
}
