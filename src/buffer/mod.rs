//! # Local Buffer Module
//!
//! Flash-backed ring of sample slots that holds data until the uplink
//! acknowledges it.
//!
//! This module handles:
//! - Appending samples, one committed record per flash block
//! - FIFO eviction among Pending slots when the ring is full
//! - Draining Pending samples into size-bounded batches (slots become InFlight)
//! - Acknowledging (tombstoning) or releasing in-flight batches
//! - Rebuilding the Pending set from flash on boot
//!
//! Slot lifecycle: Free → Pending → InFlight → Free (acknowledged), with
//! InFlight → Pending on release. InFlight slots are never evicted.

use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use crate::error::{BufferError, StorageError};
use crate::sample::{Batch, BatchId, Sample, SequenceNumber};
use crate::storage::{read_record, tombstone, write_record, FlashDevice, RecordState};
use crate::telemetry::protocol::{sample_wire_len, MIN_FRAME_LEN};

/// Occupancy of one ring slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Pending(SequenceNumber),
    InFlight(SequenceNumber, BatchId),
}

/// Result of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored in a free slot
    Stored(usize),
    /// The ring was full; the oldest Pending sample was overwritten
    Full { slot: usize, evicted: SequenceNumber },
}

/// What boot-time recovery found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferRecovery {
    pub recovered: usize,
    /// A committed record failed its checks; the whole ring was erased
    pub corrupted: bool,
    pub highest_seq: Option<SequenceNumber>,
}

/// Counters, never reset while running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub appended: u64,
    pub evicted: u64,
    pub dropped_full: u64,
    pub acknowledged: u64,
    pub released: u64,
    /// Pending records that could not be read back at drain time
    pub unreadable: u64,
}

pub struct LocalBuffer {
    flash: Box<dyn FlashDevice>,
    slots: Vec<SlotState>,
    pending: BTreeMap<SequenceNumber, usize>,
    in_flight: BTreeMap<SequenceNumber, (usize, BatchId)>,
    /// Next slot to try; appends walk the ring so wear spreads evenly
    cursor: usize,
    max_batch_samples: usize,
    next_batch_id: BatchId,
    stats: BufferStats,
}

impl std::fmt::Debug for LocalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBuffer")
            .field("capacity", &self.slots.len())
            .field("pending", &self.pending.len())
            .field("in_flight", &self.in_flight.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl LocalBuffer {
    /// Open the ring on `flash` and rebuild the Pending set
    ///
    /// Uncommitted and tombstoned blocks become free. A committed block that
    /// fails its CRC or does not decode to a consistent sample is treated as
    /// corruption: every block is erased and the buffer starts empty.
    ///
    /// # Arguments
    ///
    /// * `flash` - Device dedicated to the buffer; one slot per block
    /// * `max_batch_samples` - Upper bound on samples per drained batch
    ///
    /// # Errors
    ///
    /// Returns the flash error if the device cannot be read or erased
    pub fn open(
        mut flash: Box<dyn FlashDevice>,
        max_batch_samples: usize,
    ) -> Result<(Self, BufferRecovery), StorageError> {
        let capacity = flash.block_count();
        let mut slots = vec![SlotState::Free; capacity];
        let mut pending = BTreeMap::new();
        let mut corrupted = false;

        for block in 0..capacity {
            match read_record::<Sample>(flash.as_mut(), block) {
                Ok(RecordState::Committed(sample)) if sample.is_consistent() => {
                    if pending.contains_key(&sample.seq()) {
                        warn!("Duplicate sequence {} in block {}, retiring it", sample.seq(), block);
                        tombstone(flash.as_mut(), block)?;
                        continue;
                    }
                    slots[block] = SlotState::Pending(sample.seq());
                    pending.insert(sample.seq(), block);
                }
                Ok(RecordState::Committed(_)) => {
                    error!("Inconsistent sample record in block {}", block);
                    corrupted = true;
                    break;
                }
                Ok(_) => {}
                Err(StorageError::Corruption { block, reason }) => {
                    error!("Buffer corruption in block {}: {}", block, reason);
                    corrupted = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if corrupted {
            warn!("Erasing all {} buffer slots after corruption", capacity);
            for block in 0..capacity {
                flash.erase(block)?;
            }
            slots.fill(SlotState::Free);
            pending.clear();
        }

        let highest_seq = pending.keys().next_back().copied();
        let cursor = highest_seq
            .and_then(|seq| pending.get(&seq))
            .map_or(0, |slot| (slot + 1) % capacity.max(1));

        let recovery = BufferRecovery {
            recovered: pending.len(),
            corrupted,
            highest_seq,
        };
        info!(
            "Buffer opened: {} slots, {} pending recovered{}",
            capacity,
            recovery.recovered,
            if corrupted { " (reset after corruption)" } else { "" }
        );

        Ok((
            Self {
                flash,
                slots,
                pending,
                in_flight: BTreeMap::new(),
                cursor,
                max_batch_samples: max_batch_samples.max(1),
                next_batch_id: 1,
                stats: BufferStats::default(),
            },
            recovery,
        ))
    }

    /// Persist a sample
    ///
    /// # Returns
    ///
    /// * `Stored(slot)` - written to a free slot
    /// * `Full { slot, evicted }` - the lowest-sequence Pending sample was
    ///   overwritten
    ///
    /// # Errors
    ///
    /// * `BufferError::Full` - every slot is InFlight; the sample is dropped
    ///   and counted
    /// * `BufferError::Storage` - the flash write failed; the sample is lost,
    ///   and so is the evicted one if the ring was full
    pub fn append(&mut self, sample: &Sample) -> Result<AppendOutcome, BufferError> {
        let (slot, evicted) = match self.find_free_slot() {
            Some(slot) => (slot, None),
            None => match self.pending.pop_first() {
                Some((seq, slot)) => (slot, Some(seq)),
                None => {
                    self.stats.dropped_full += 1;
                    warn!("Buffer full of in-flight slots, dropping sample {}", sample.seq());
                    return Err(BufferError::Full { seq: sample.seq() });
                }
            },
        };

        if let Some(seq) = evicted {
            self.stats.evicted += 1;
            debug!("Evicting sample {} from slot {}", seq, slot);
        }

        self.slots[slot] = SlotState::Free;
        if let Err(source) = write_record(self.flash.as_mut(), slot, sample) {
            error!("Failed to write sample {} to slot {}: {}", sample.seq(), slot, source);
            return Err(BufferError::Storage { source, evicted });
        }

        self.slots[slot] = SlotState::Pending(sample.seq());
        self.pending.insert(sample.seq(), slot);
        self.cursor = (slot + 1) % self.slots.len();
        self.stats.appended += 1;

        Ok(match evicted {
            Some(evicted) => AppendOutcome::Full { slot, evicted },
            None => AppendOutcome::Stored(slot),
        })
    }

    /// Move the oldest Pending samples into a new in-flight batch
    ///
    /// Samples are taken in sequence order while the encoded frame stays
    /// within `max_bytes` and the batch within the sample limit.
    ///
    /// # Returns
    ///
    /// * `Ok(None)` - nothing Pending (or not even one sample fits)
    /// * `Ok(Some(batch))` - slots in the batch are now InFlight
    ///
    /// # Errors
    ///
    /// Returns the flash error if a record cannot be read at all
    pub fn drain(&mut self, max_bytes: usize) -> Result<Option<Batch>, BufferError> {
        let mut samples: Vec<(usize, Sample)> = Vec::new();
        let mut frame_len = MIN_FRAME_LEN;
        let mut unreadable = Vec::new();

        for (&seq, &slot) in &self.pending {
            if samples.len() >= self.max_batch_samples {
                break;
            }

            let sample = match read_record::<Sample>(self.flash.as_mut(), slot) {
                Ok(RecordState::Committed(sample)) if sample.seq() == seq => sample,
                Ok(_) | Err(StorageError::Corruption { .. }) => {
                    unreadable.push(seq);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let (first_seq, base_ms) = samples
                .first()
                .map_or((sample.seq(), sample.timestamp_ms()), |(_, s)| (s.seq(), s.timestamp_ms()));
            let len = sample_wire_len(&sample, first_seq, base_ms);
            if frame_len + len > max_bytes {
                break;
            }

            frame_len += len;
            samples.push((slot, sample));
        }

        for seq in unreadable {
            if let Some(slot) = self.pending.remove(&seq) {
                warn!("Pending sample {} in slot {} unreadable, discarding", seq, slot);
                self.slots[slot] = SlotState::Free;
                self.stats.unreadable += 1;
            }
        }

        if samples.is_empty() {
            return Ok(None);
        }

        let batch_id = self.allocate_batch_id();
        for (slot, sample) in &samples {
            self.pending.remove(&sample.seq());
            self.in_flight.insert(sample.seq(), (*slot, batch_id));
            self.slots[*slot] = SlotState::InFlight(sample.seq(), batch_id);
        }

        let batch = Batch::new(batch_id, samples.into_iter().map(|(_, s)| s).collect());
        debug!("Drained batch {} ({} samples, {} bytes)", batch_id, batch.len(), frame_len);
        Ok(Some(batch))
    }

    /// Permanently remove the slots of a delivered batch
    ///
    /// # Returns
    ///
    /// Number of slots retired; samples not in flight under this batch are
    /// ignored
    pub fn acknowledge(&mut self, batch: &Batch) -> usize {
        let mut retired = 0;

        for sample in batch.samples() {
            let Some(&(slot, batch_id)) = self.in_flight.get(&sample.seq()) else {
                continue;
            };
            if batch_id != batch.id() {
                continue;
            }

            self.in_flight.remove(&sample.seq());
            self.slots[slot] = SlotState::Free;
            if let Err(e) = tombstone(self.flash.as_mut(), slot) {
                // Still committed on flash: resent after a reboot, deduped by sequence
                warn!("Failed to tombstone slot {}: {}", slot, e);
            }
            retired += 1;
        }

        self.stats.acknowledged += retired as u64;
        debug!("Acknowledged batch {} ({} slots)", batch.id(), retired);
        retired
    }

    /// Return the slots of a failed or aborted batch to Pending
    pub fn release(&mut self, batch: &Batch) -> usize {
        let mut restored = 0;

        for sample in batch.samples() {
            let Some(&(slot, batch_id)) = self.in_flight.get(&sample.seq()) else {
                continue;
            };
            if batch_id != batch.id() {
                continue;
            }

            self.in_flight.remove(&sample.seq());
            self.pending.insert(sample.seq(), slot);
            self.slots[slot] = SlotState::Pending(sample.seq());
            restored += 1;
        }

        self.stats.released += restored as u64;
        debug!("Released batch {} ({} slots back to pending)", batch.id(), restored);
        restored
    }

    /// Hand out a batch id, also used for batches built outside the buffer
    pub fn allocate_batch_id(&mut self) -> BatchId {
        let id = self.next_batch_id;
        self.next_batch_id = self.next_batch_id.wrapping_add(1).max(1);
        id
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Pending sequence numbers, oldest first
    pub fn pending_seqs(&self) -> Vec<SequenceNumber> {
        self.pending.keys().copied().collect()
    }

    /// Oldest and newest Pending sequence numbers
    pub fn pending_range(&self) -> Option<(SequenceNumber, SequenceNumber)> {
        let (&first, _) = self.pending.first_key_value()?;
        let (&last, _) = self.pending.last_key_value()?;
        Some((first, last))
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).copied()
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    fn find_free_slot(&self) -> Option<usize> {
        let capacity = self.slots.len();
        (0..capacity)
            .map(|i| (self.cursor + i) % capacity)
            .find(|&slot| self.slots[slot] == SlotState::Free)
    }
}
