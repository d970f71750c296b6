use crate::instructions::instructions::{ARCH_REG_CNT, RegisterType, WordType};

/// The ROB-side view of the architectural registers, sampled once per tick.
///
/// A set bit in the ready bitmap means the register already holds a
/// resolved value; `values` holds that value. The issue queue never writes
/// to this structure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RobView {
    ready: u128,
    values: Vec<WordType>,
}

impl RobView {
    /// A view in which no register is resolved.
    pub fn new() -> Self {
        Self {
            ready: 0,
            values: vec![0; ARCH_REG_CNT as usize],
        }
    }

    /// A view in which every register is resolved with value 0.
    pub fn all_ready() -> Self {
        Self {
            ready: u128::MAX,
            values: vec![0; ARCH_REG_CNT as usize],
        }
    }

    pub fn from_bitmap(ready: u128) -> Self {
        Self {
            ready,
            values: vec![0; ARCH_REG_CNT as usize],
        }
    }

    pub fn bitmap(&self) -> u128 {
        self.ready
    }

    pub fn is_ready(&self, reg: RegisterType) -> bool {
        debug_assert!(reg < ARCH_REG_CNT, "register x{} out of range", reg);
        self.ready & (1u128 << reg) != 0
    }

    pub fn get_value(&self, reg: RegisterType) -> WordType {
        self.values[reg as usize]
    }

    /// Marks the register as resolved with the given value.
    pub fn resolve(&mut self, reg: RegisterType, value: WordType) {
        self.ready |= 1u128 << reg;
        self.values[reg as usize] = value;
    }

    /// Marks the register as awaiting a value (an in-flight producer exists).
    pub fn invalidate(&mut self, reg: RegisterType) {
        self.ready &= !(1u128 << reg);
    }
}

impl Default for RobView {
    fn default() -> Self {
        Self::new()
    }
}
