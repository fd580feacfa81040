//! # Device State
//!
//! The explicit, passed-in device state: sequence counter, last known
//! position and battery. Only the sequence high-water mark and the storage
//! reset count survive a reboot, and both go through [`StateStore`].

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CollarError, Result, StorageError};
use crate::sample::{Battery, Position, SequenceNumber};
use crate::storage::{read_record, write_record, FlashDevice, RecordState};

/// Fields that survive a power cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Every sequence number at or below this may already have been issued
    pub sequence_hwm: SequenceNumber,
    /// Times the sample buffer was wiped after corruption
    pub reset_count: u32,
}

/// Single persistence interface for [`PersistedState`]
pub trait StateStore: Send {
    fn load(&mut self) -> std::result::Result<Option<PersistedState>, StorageError>;

    fn store(&mut self, state: &PersistedState) -> std::result::Result<(), StorageError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    generation: u64,
    state: PersistedState,
}

/// [`StateStore`] on two flash blocks written alternately
///
/// Each write goes to the block not holding the newest record and carries a
/// generation one higher, so a torn write always leaves the previous record
/// readable.
pub struct FlashStateStore<F: FlashDevice> {
    flash: F,
    generation: u64,
    /// Block holding the newest record
    current: Option<usize>,
}

impl<F: FlashDevice> FlashStateStore<F> {
    /// # Errors
    ///
    /// Returns `OutOfBounds` if the device has fewer than two blocks
    pub fn new(flash: F) -> std::result::Result<Self, StorageError> {
        if flash.block_count() < 2 {
            return Err(StorageError::OutOfBounds {
                block: 1,
                offset: 0,
                len: flash.block_size(),
            });
        }
        Ok(Self {
            flash,
            generation: 0,
            current: None,
        })
    }
}

impl<F: FlashDevice> StateStore for FlashStateStore<F> {
    fn load(&mut self) -> std::result::Result<Option<PersistedState>, StorageError> {
        let mut newest: Option<(usize, StateRecord)> = None;

        for block in 0..2 {
            match read_record::<StateRecord>(&mut self.flash, block) {
                Ok(RecordState::Committed(record)) => {
                    if newest.as_ref().map_or(true, |(_, n)| record.generation > n.generation) {
                        newest = Some((block, record));
                    }
                }
                Ok(_) => {}
                Err(StorageError::Corruption { block, reason }) => {
                    warn!("Ignoring corrupted state block {}: {}", block, reason);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(newest.map(|(block, record)| {
            self.current = Some(block);
            self.generation = record.generation;
            record.state
        }))
    }

    fn store(&mut self, state: &PersistedState) -> std::result::Result<(), StorageError> {
        let target = match self.current {
            Some(0) => 1,
            _ => 0,
        };
        let record = StateRecord {
            generation: self.generation + 1,
            state: *state,
        };

        write_record(&mut self.flash, target, &record)?;

        self.generation = record.generation;
        self.current = Some(target);
        Ok(())
    }
}

/// Runtime device state
pub struct DeviceState<S: StateStore> {
    store: S,
    persisted: PersistedState,
    /// Next sequence number to hand out; `None` once the space is used up
    next_seq: Option<SequenceNumber>,
    reservation: u32,
    last_position: Option<(u64, Position)>,
    last_battery: Option<Battery>,
}

impl<S: StateStore> DeviceState<S> {
    /// Load persisted state and resume numbering above the stored high-water
    /// mark
    ///
    /// # Arguments
    ///
    /// * `store` - Persistence backend
    /// * `reservation` - Sequence numbers reserved per high-water-mark write
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read
    pub fn boot(mut store: S, reservation: u32) -> Result<Self> {
        let persisted = match store.load()? {
            Some(state) => {
                info!(
                    "Loaded device state: sequence hwm {}, reset count {}",
                    state.sequence_hwm, state.reset_count
                );
                state
            }
            None => {
                info!("No persisted device state, starting fresh");
                PersistedState::default()
            }
        };

        Ok(Self {
            store,
            persisted,
            next_seq: persisted.sequence_hwm.checked_add(1),
            reservation: reservation.max(1),
            last_position: None,
            last_battery: None,
        })
    }

    /// Issue the next sequence number
    ///
    /// Persists a new high-water mark whenever the current reservation runs
    /// out. The number is only handed out once that write succeeded.
    ///
    /// # Errors
    ///
    /// * `SequenceExhausted` - no sequence numbers left
    /// * `Storage` - the high-water mark could not be persisted; the
    ///   number is not consumed
    pub fn next_sequence(&mut self) -> Result<SequenceNumber> {
        let seq = self.next_seq.ok_or(CollarError::SequenceExhausted)?;

        if seq > self.persisted.sequence_hwm {
            let hwm = seq.saturating_add(self.reservation - 1);
            let updated = PersistedState {
                sequence_hwm: hwm,
                ..self.persisted
            };
            self.store.store(&updated)?;
            self.persisted = updated;
            debug!("Reserved sequence numbers up to {}", hwm);
        }

        self.next_seq = seq.checked_add(1);
        Ok(seq)
    }

    /// Make sure future numbers are above `seq` (found in the buffer on boot)
    pub fn observe_sequence(&mut self, seq: SequenceNumber) {
        if let Some(next) = self.next_seq {
            if seq >= next {
                warn!("Buffered sequence {} above persisted high-water mark, skipping ahead", seq);
                self.next_seq = seq.checked_add(1);
            }
        }
    }

    /// Count a buffer wipe after storage corruption
    pub fn record_storage_reset(&mut self) -> Result<u32> {
        let updated = PersistedState {
            reset_count: self.persisted.reset_count.saturating_add(1),
            ..self.persisted
        };
        self.store.store(&updated)?;
        self.persisted = updated;
        Ok(updated.reset_count)
    }

    pub fn persisted(&self) -> PersistedState {
        self.persisted
    }

    pub fn reset_count(&self) -> u32 {
        self.persisted.reset_count
    }

    pub fn set_last_position(&mut self, timestamp_ms: u64, position: Position) {
        self.last_position = Some((timestamp_ms, position));
    }

    /// Last fix and the time it was taken
    pub fn last_position(&self) -> Option<(u64, Position)> {
        self.last_position
    }

    pub fn set_last_battery(&mut self, battery: Battery) {
        self.last_battery = Some(battery);
    }

    pub fn last_battery(&self) -> Option<Battery> {
        self.last_battery
    }
}
