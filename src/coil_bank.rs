/// Coil bank for server-side coil storage
///
/// Holds two parallel views of every coil: the raw value, which follows every
/// write, and the latched level, which turns on the first time the coil is
/// seen on and stays on until `reset_levels`. Both views live behind one lock
/// so a reset can never interleave with a half-applied multi-coil write.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::warn;

use crate::error::{ModbusError, ModbusResult};
use crate::projection::{NullProjection, VariableProjection, VariableUpdate};

#[derive(Debug, Default)]
struct CoilState {
    raw: Vec<bool>,
    level: Vec<bool>,
}

impl CoilState {
    fn zeroed(size: usize) -> Self {
        Self {
            raw: vec![false; size],
            level: vec![false; size],
        }
    }

    /// Apply one write and queue its projection updates
    fn apply(&mut self, index: usize, value: bool, updates: &mut Vec<VariableUpdate>) -> bool {
        if index >= self.raw.len() {
            return false;
        }
        self.raw[index] = value;
        updates.push(VariableUpdate::coil(index, value));
        if value {
            self.level[index] = true;
            updates.push(VariableUpdate::level(index, true));
        }
        true
    }
}

/// Outcome of a multi-coil write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Coils written
    pub applied: usize,
    /// Indices that fell outside the bank
    pub rejected: usize,
}

/// Copy of the bank contents at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoilSnapshot {
    pub raw: Vec<bool>,
    pub level: Vec<bool>,
}

/// Coil bank statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoilBankStats {
    pub size: usize,
    pub raw_set: usize,
    pub levels_latched: usize,
}

/// Coil bank with raw and latched level views
///
/// Indices are 0-based. Every successful mutation is mirrored to the
/// configured [`VariableProjection`] after the lock has been released.
pub struct CoilBank {
    state: RwLock<CoilState>,
    projection: Arc<dyn VariableProjection>,
}

impl CoilBank {
    /// Create a zero-filled bank that projects nowhere
    pub fn new(size: usize) -> Self {
        Self::with_projection(size, Arc::new(NullProjection))
    }

    /// Create a zero-filled bank mirroring changes into `projection`
    pub fn with_projection(size: usize, projection: Arc<dyn VariableProjection>) -> Self {
        Self {
            state: RwLock::new(CoilState::zeroed(size)),
            projection,
        }
    }

    fn read_state(&self) -> ModbusResult<RwLockReadGuard<'_, CoilState>> {
        self.state
            .read()
            .map_err(|_| ModbusError::internal("Failed to lock coils"))
    }

    fn write_state(&self) -> ModbusResult<RwLockWriteGuard<'_, CoilState>> {
        self.state
            .write()
            .map_err(|_| ModbusError::internal("Failed to lock coils"))
    }

    /// Number of coils in the bank
    pub fn size(&self) -> usize {
        self.read_state().map(|state| state.raw.len()).unwrap_or(0)
    }

    /// Write a single coil; `true` also latches the level
    pub fn write(&self, index: usize, value: bool) -> ModbusResult<()> {
        let mut updates = Vec::with_capacity(2);
        {
            let mut state = self.write_state()?;
            if !state.apply(index, value, &mut updates) {
                return Err(ModbusError::coil_out_of_range(index, state.raw.len()));
            }
        }
        self.projection.publish(&updates);
        Ok(())
    }

    /// Write consecutive coils starting at `address` under one lock
    ///
    /// Out-of-range indices are skipped and counted; they do not abort the
    /// rest of the batch.
    pub fn write_many(&self, address: usize, values: &[bool]) -> ModbusResult<WriteSummary> {
        let mut summary = WriteSummary::default();
        let mut updates = Vec::with_capacity(values.len() * 2);
        let size;
        {
            let mut state = self.write_state()?;
            size = state.raw.len();
            for (offset, &value) in values.iter().enumerate() {
                if state.apply(address + offset, value, &mut updates) {
                    summary.applied += 1;
                } else {
                    summary.rejected += 1;
                }
            }
        }

        if summary.rejected > 0 {
            warn!(
                "Ignored {} coil writes outside bank of {} (start {})",
                summary.rejected, size, address
            );
        }
        self.projection.publish(&updates);
        Ok(summary)
    }

    /// Current raw value of a coil
    pub fn read_raw(&self, index: usize) -> ModbusResult<bool> {
        let state = self.read_state()?;
        state
            .raw
            .get(index)
            .copied()
            .ok_or_else(|| ModbusError::coil_out_of_range(index, state.raw.len()))
    }

    /// Latched level of a coil
    pub fn read_level(&self, index: usize) -> ModbusResult<bool> {
        let state = self.read_state()?;
        state
            .level
            .get(index)
            .copied()
            .ok_or_else(|| ModbusError::coil_out_of_range(index, state.level.len()))
    }

    /// Clear every latched level and every raw value
    pub fn reset_levels(&self) -> ModbusResult<()> {
        let size = {
            let mut state = self.write_state()?;
            state.raw.iter_mut().for_each(|v| *v = false);
            state.level.iter_mut().for_each(|v| *v = false);
            state.raw.len()
        };
        self.projection.publish(&Self::cleared_updates(size));
        Ok(())
    }

    /// Replace the bank with a zero-filled one of `new_size` coils
    pub fn resize(&self, new_size: usize) -> ModbusResult<()> {
        {
            let mut state = self.write_state()?;
            *state = CoilState::zeroed(new_size);
        }
        self.projection.publish(&Self::cleared_updates(new_size));
        Ok(())
    }

    /// Copy both views
    pub fn snapshot(&self) -> ModbusResult<CoilSnapshot> {
        let state = self.read_state()?;
        Ok(CoilSnapshot {
            raw: state.raw.clone(),
            level: state.level.clone(),
        })
    }

    /// Push the full current state to the projection
    pub fn publish_all(&self) -> ModbusResult<()> {
        let snapshot = self.snapshot()?;
        let updates: Vec<VariableUpdate> = snapshot
            .raw
            .iter()
            .zip(snapshot.level.iter())
            .enumerate()
            .flat_map(|(i, (&raw, &level))| {
                [VariableUpdate::coil(i, raw), VariableUpdate::level(i, level)]
            })
            .collect();
        self.projection.publish(&updates);
        Ok(())
    }

    /// Get coil bank statistics
    pub fn stats(&self) -> ModbusResult<CoilBankStats> {
        let state = self.read_state()?;
        Ok(CoilBankStats {
            size: state.raw.len(),
            raw_set: state.raw.iter().filter(|v| **v).count(),
            levels_latched: state.level.iter().filter(|v| **v).count(),
        })
    }

    fn cleared_updates(size: usize) -> Vec<VariableUpdate> {
        (0..size)
            .flat_map(|i| [VariableUpdate::coil(i, false), VariableUpdate::level(i, false)])
            .collect()
    }
}

impl fmt::Debug for CoilBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoilBank").field("size", &self.size()).finish()
    }
}
