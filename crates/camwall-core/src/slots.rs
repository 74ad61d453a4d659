//! Fixed-capacity slot table for producer sessions.
//!
//! Each slot holds at most one producer, keyed by IP address. A producer
//! that reconnects from an address already holding a slot takes that slot
//! over and the previous session is told to stop. All state lives behind
//! one table-wide lock; callers never get references into a slot, only
//! owned snapshots.
//!
//! Ownership is tracked with [`SlotLease`]s. A lease carries a generation
//! number, so a session that was evicted cannot publish into, or release,
//! the slot its replacement now holds.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};

use crate::errors::SlotError;
use crate::image::ImageDescriptor;

/// Slot index; also the left-to-right screen position of the slot.
pub type SlotId = usize;

/// Proof of slot ownership handed out by [`SlotTable::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLease {
    slot_id: SlotId,
    generation: u64,
}

impl SlotLease {
    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Resolves when the table takes the slot away from the lease holder.
#[derive(Debug)]
pub struct EvictionSignal {
    rx: Option<oneshot::Receiver<()>>,
}

impl EvictionSignal {
    /// Wait until evicted.
    ///
    /// Also resolves if the table drops the sender, which only happens when
    /// the lease is no longer current.
    pub async fn evicted(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            let _ = rx.await;
            self.rx = None;
        }
    }

    /// Non-blocking check.
    pub fn is_evicted(&mut self) -> bool {
        match self.rx.as_mut().map(|rx| rx.try_recv()) {
            Some(Err(oneshot::error::TryRecvError::Empty)) => false,
            _ => {
                self.rx = None;
                true
            }
        }
    }
}

/// Result of a successful [`SlotTable::acquire`].
#[derive(Debug)]
pub struct Admission {
    pub lease: SlotLease,
    pub eviction: EvictionSignal,
    /// A previous session from the same address was evicted to make room
    pub replaced: bool,
}

/// A decoded frame as published by a session.
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    /// Table-wide publication counter, strictly increasing
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Packed 3-byte pixels, `width * height * 3` bytes
    pub rgb: Arc<Vec<u8>>,
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub slot_id: SlotId,
    pub occupant: Option<OccupantSnapshot>,
}

impl SlotSnapshot {
    pub fn is_occupied(&self) -> bool {
        self.occupant.is_some()
    }
}

/// Point-in-time view of a slot's producer.
#[derive(Debug, Clone)]
pub struct OccupantSnapshot {
    pub address: IpAddr,
    pub generation: u64,
    pub connected_for: Duration,
    pub descriptor: Option<ImageDescriptor>,
    pub frames: u64,
    pub last_frame_age: Option<Duration>,
    pub frame: Option<PublishedFrame>,
}

struct Occupant {
    address: IpAddr,
    generation: u64,
    connected_at: Instant,
    evict_tx: Option<oneshot::Sender<()>>,
    descriptor: Option<ImageDescriptor>,
    frame: Option<PublishedFrame>,
    frames: u64,
    last_frame_at: Option<Instant>,
}

impl Occupant {
    fn signal_eviction(&mut self) {
        if let Some(tx) = self.evict_tx.take() {
            // The session may already be gone; nothing to do then.
            let _ = tx.send(());
        }
    }

    fn snapshot(&self, now: Instant) -> OccupantSnapshot {
        OccupantSnapshot {
            address: self.address,
            generation: self.generation,
            connected_for: now.saturating_duration_since(self.connected_at),
            descriptor: self.descriptor,
            frames: self.frames,
            last_frame_age: self.last_frame_at.map(|t| now.saturating_duration_since(t)),
            frame: self.frame.clone(),
        }
    }
}

struct TableState {
    slots: Vec<Option<Occupant>>,
    next_generation: u64,
    next_sequence: u64,
}

impl TableState {
    fn occupant_mut(&mut self, lease: &SlotLease) -> Result<&mut Occupant, SlotError> {
        self.slots
            .get_mut(lease.slot_id)
            .and_then(Option::as_mut)
            .filter(|o| o.generation == lease.generation)
            .ok_or(SlotError::LeaseExpired(lease.slot_id))
    }
}

/// Fixed-capacity registry of producer sessions.
pub struct SlotTable {
    state: Mutex<TableState>,
    changes: watch::Sender<u64>,
}

impl SlotTable {
    /// Create a table with `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(TableState {
                slots: (0..capacity).map(|_| None).collect(),
                next_generation: 1,
                next_sequence: 1,
            }),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Claim a slot for a producer at `address`.
    ///
    /// A slot already held by `address` is taken over (its session is
    /// signalled to stop); otherwise the lowest free slot is used.
    pub fn acquire(&self, address: IpAddr) -> Result<Admission, SlotError> {
        let admission = {
            let mut state = self.lock();

            let existing = state
                .slots
                .iter()
                .position(|s| s.as_ref().is_some_and(|o| o.address == address));
            let (slot_id, replaced) = match existing {
                Some(slot_id) => (slot_id, true),
                None => {
                    let free = state.slots.iter().position(Option::is_none);
                    let capacity = state.slots.len();
                    (free.ok_or(SlotError::Busy { capacity })?, false)
                }
            };

            if let Some(mut previous) = state.slots[slot_id].take() {
                previous.signal_eviction();
            }

            let generation = state.next_generation;
            state.next_generation += 1;

            let (evict_tx, rx) = oneshot::channel();
            state.slots[slot_id] = Some(Occupant {
                address,
                generation,
                connected_at: Instant::now(),
                evict_tx: Some(evict_tx),
                descriptor: None,
                frame: None,
                frames: 0,
                last_frame_at: None,
            });

            Admission {
                lease: SlotLease { slot_id, generation },
                eviction: EvictionSignal { rx: Some(rx) },
                replaced,
            }
        };

        self.notify();
        Ok(admission)
    }

    /// Free the slot held by `lease`, dropping its descriptor and frame.
    ///
    /// Returns `false` (and changes nothing) if the lease is no longer current.
    pub fn release(&self, lease: &SlotLease) -> bool {
        let released = {
            let mut state = self.lock();
            match state.slots.get_mut(lease.slot_id) {
                Some(slot) if slot.as_ref().is_some_and(|o| o.generation == lease.generation) => {
                    *slot = None;
                    true
                }
                _ => false,
            }
        };

        if released {
            self.notify();
        }
        released
    }

    /// Forcibly end the session in `slot_id` and free the slot.
    pub fn evict(&self, slot_id: SlotId) -> Result<IpAddr, SlotError> {
        let address = {
            let mut state = self.lock();
            let slot = state.slots.get_mut(slot_id).ok_or(SlotError::UnknownSlot(slot_id))?;
            let mut occupant = slot.take().ok_or(SlotError::SlotFree(slot_id))?;
            occupant.signal_eviction();
            occupant.address
        };

        self.notify();
        Ok(address)
    }

    /// Evict every occupied slot, returning how many sessions were signalled.
    pub fn evict_all(&self) -> usize {
        let evicted = {
            let mut state = self.lock();
            let mut count = 0;
            for slot in state.slots.iter_mut() {
                if let Some(mut occupant) = slot.take() {
                    occupant.signal_eviction();
                    count += 1;
                }
            }
            count
        };

        if evicted > 0 {
            self.notify();
        }
        evicted
    }

    /// Record the geometry the lease holder declared.
    pub fn set_descriptor(&self, lease: &SlotLease, descriptor: ImageDescriptor) -> Result<(), SlotError> {
        self.lock().occupant_mut(lease)?.descriptor = Some(descriptor);
        self.notify();
        Ok(())
    }

    /// Publish a decoded frame, returning the buffer it replaces.
    ///
    /// The returned buffer can be reused for the next frame once no reader
    /// holds it any more (see [`Arc::try_unwrap`]).
    pub fn publish(
        &self,
        lease: &SlotLease,
        rgb: Arc<Vec<u8>>,
        width: u32,
        height: u32,
    ) -> Result<Option<Arc<Vec<u8>>>, SlotError> {
        let previous = {
            let mut state = self.lock();
            let sequence = state.next_sequence;
            let occupant = state.occupant_mut(lease)?;
            let previous = occupant.frame.replace(PublishedFrame {
                sequence,
                width,
                height,
                rgb,
            });
            occupant.frames += 1;
            occupant.last_frame_at = Some(Instant::now());
            state.next_sequence += 1;
            previous
        };

        self.notify();
        Ok(previous.map(|frame| frame.rgb))
    }

    /// Copy out the state of every slot, free ones included.
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        let now = Instant::now();
        self.lock()
            .slots
            .iter()
            .enumerate()
            .map(|(slot_id, slot)| SlotSnapshot {
                slot_id,
                occupant: slot.as_ref().map(|o| o.snapshot(now)),
            })
            .collect()
    }

    pub fn occupied(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_full(&self) -> bool {
        self.lock().slots.iter().all(Option::is_some)
    }

    /// Subscribe to table changes: occupancy, descriptors and published frames.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
