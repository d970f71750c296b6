use std::fmt;
use std::fmt::Display;

use crate::backend::execution_unit::FuId;
use crate::instructions::instructions::{Classified, RegisterType, WordType};

/// A single reservation station (one slot of the issue queue).
///
/// A slot is either empty, in which case none of the other fields carry
/// meaning, or fully populated by the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RS {
    pub occupied: bool,
    pub operation: Classified,
    pub dest: RegisterType,
    pub src1: RegisterType,
    pub src2: RegisterType,
    pub src1_ready: bool,
    pub src2_ready: bool,
    pub src1_value: WordType,
    pub src2_value: WordType,
    pub imm: WordType,
    pub fu: FuId,
}

impl RS {
    pub(crate) fn new() -> Self {
        Self {
            occupied: false,
            operation: Classified::Unclassified,
            dest: 0,
            src1: 0,
            src2: 0,
            src1_ready: false,
            src2_ready: false,
            src1_value: 0,
            src2_value: 0,
            imm: 0,
            fu: FuId::ALU0,
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_ready(&self) -> bool {
        self.occupied && self.src1_ready && self.src2_ready
    }
}

impl Display for RS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.occupied {
            return write!(f, "RS <free>");
        }

        write!(f, "RS {} x{} <- x{}{} x{}{} imm={:#x} on {}",
               self.operation,
               self.dest,
               self.src1,
               if self.src1_ready { "*" } else { "" },
               self.src2,
               if self.src2_ready { "*" } else { "" },
               self.imm,
               self.fu)
    }
}

/// Fixed-capacity array of reservation stations.
///
/// Slots are addressed by a stable `u16` index, reused in place and never
/// compacted; the index is a tie-break, not an age.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RSTable {
    pub(crate) capacity: u16,
    array: Vec<RS>,
}

impl RSTable {
    pub fn new(capacity: u16) -> Self {
        RSTable {
            capacity,
            array: vec![RS::new(); capacity as usize],
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn get(&self, rs_index: u16) -> &RS {
        &self.array[rs_index as usize]
    }

    pub(crate) fn get_mut(&mut self, rs_index: u16) -> &mut RS {
        &mut self.array[rs_index as usize]
    }

    /// The lowest-indexed free slot, if any.
    pub fn first_free(&self) -> Option<u16> {
        self.array.iter().position(|rs| !rs.occupied).map(|index| index as u16)
    }

    pub fn has_free(&self) -> bool {
        self.first_free().is_some()
    }

    pub fn occupied_count(&self) -> u16 {
        self.array.iter().filter(|rs| rs.occupied).count() as u16
    }

    /// Occupied slots in ascending index order.
    pub fn occupied(&self) -> impl Iterator<Item = (u16, &RS)> + '_ {
        self.array.iter()
            .enumerate()
            .filter(|(_, rs)| rs.occupied)
            .map(|(index, rs)| (index as u16, rs))
    }

    pub(crate) fn deallocate(&mut self, rs_index: u16) {
        let rs = &mut self.array[rs_index as usize];
        debug_assert!(rs.occupied, "RSTable: deallocating free slot {}", rs_index);
        rs.reset();
    }

    pub(crate) fn flush(&mut self) {
        for rs in &mut self.array {
            rs.reset();
        }
    }
}
