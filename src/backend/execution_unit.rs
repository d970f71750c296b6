use std::fmt;

use log::{debug, trace};

use crate::backend::issue_queue::IssueChannel;
use crate::cpu::{CPUConfig, SimError};
use crate::instructions::instructions::{Opcode, RegisterType, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

/// Identifies one of the functional units fed by the issue queue.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub enum FuId {
    ALU0,
    ALU1,
    MEM,
}

// The number of functional units.
pub const FU_CNT: usize = 3;

pub const ALL_UNITS: [FuId; FU_CNT] = [FuId::ALU0, FuId::ALU1, FuId::MEM];

// The units that accept ALU-class operations. The round-robin cursor only
// ever walks this set.
pub const ALU_UNITS: [FuId; 2] = [FuId::ALU0, FuId::ALU1];

impl FuId {
    pub fn index(&self) -> usize {
        match self {
            FuId::ALU0 => 0,
            FuId::ALU1 => 1,
            FuId::MEM => 2,
        }
    }

    pub fn is_alu(&self) -> bool {
        ALU_UNITS.contains(self)
    }
}

impl fmt::Display for FuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FuId::ALU0 => write!(f, "ALU0"),
            FuId::ALU1 => write!(f, "ALU1"),
            FuId::MEM => write!(f, "MEM"),
        }
    }
}

/// One bit per functional unit, set when that unit can accept an operation
/// this tick.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct FuReadyBitmap(u8);

impl FuReadyBitmap {
    pub fn none() -> Self {
        FuReadyBitmap(0)
    }

    pub fn all() -> Self {
        FuReadyBitmap((1 << FU_CNT) - 1)
    }

    pub fn from_units(units: &[FuId]) -> Self {
        let mut bitmap = Self::none();
        for unit in units {
            bitmap.set(*unit);
        }
        bitmap
    }

    pub fn set(&mut self, unit: FuId) {
        self.0 |= 1 << unit.index();
    }

    pub fn clear(&mut self, unit: FuId) {
        self.0 &= !(1 << unit.index());
    }

    pub fn is_ready(&self, unit: FuId) -> bool {
        self.0 & (1 << unit.index()) != 0
    }
}

/// Round-robin cursor over the ALU-class units.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AluRoundRobin {
    position: usize,
}

impl AluRoundRobin {
    pub fn current(&self) -> FuId {
        ALU_UNITS[self.position]
    }

    pub fn advanced(&self) -> AluRoundRobin {
        AluRoundRobin { position: (self.position + 1) % ALU_UNITS.len() }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum EUState {
    IDLE,
    EXECUTING,
}

/// A result leaving a functional unit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Completion {
    pub fu: FuId,
    // None for stores and for operations without a recognized opcode
    pub dest: Option<RegisterType>,
    pub value: WordType,
}

/// A single, non-pipelined execution unit.
pub(crate) struct EU {
    pub(crate) index: FuId,
    pub(crate) cycles_remaining: u8,
    pub(crate) state: EUState,
    pub(crate) channel: Option<IssueChannel>,
    trace: bool,
}

impl EU {
    fn reset(&mut self) {
        self.channel = None;
        self.cycles_remaining = 0;
        self.state = EUState::IDLE;
    }

    fn cycle(&mut self, memory_subsystem: &mut MemorySubsystem) -> Result<Option<Completion>, SimError> {
        debug_assert!(self.state == EUState::EXECUTING);
        debug_assert!(self.cycles_remaining > 0);

        self.cycles_remaining -= 1;
        if self.cycles_remaining > 0 {
            // the execution unit isn't finished with its work
            return Ok(None);
        }

        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => unreachable!("EU {} executing without an instruction", self.index),
        };
        self.reset();

        if self.trace {
            debug!("{} executing {}", self.index, channel);
        }

        let s1 = channel.src1_value;
        let s2 = channel.src2_value;
        let imm = channel.imm;

        let value = match channel.operation.opcode() {
            None => {
                trace!("{} retires unclassified operation as no-op", self.index);
                return Ok(Some(Completion { fu: self.index, dest: None, value: 0 }));
            }
            Some(Opcode::ADD) => s1.wrapping_add(s2),
            Some(Opcode::XOR) => s1 ^ s2,
            Some(Opcode::ADDI) => s1.wrapping_add(imm),
            Some(Opcode::ORI) => s1 | imm,
            Some(Opcode::SRAI) => ((s1 as i32) >> (imm & 0x1f)) as WordType,
            Some(Opcode::LUI) => imm,
            Some(Opcode::LB) => memory_subsystem.load_byte(s1.wrapping_add(imm))? as i8 as i32 as WordType,
            Some(Opcode::LW) => memory_subsystem.load_word(s1.wrapping_add(imm))?,
            Some(Opcode::SB) => {
                memory_subsystem.store_byte(s1.wrapping_add(imm), s2 as u8)?;
                return Ok(Some(Completion { fu: self.index, dest: None, value: s2 }));
            }
            Some(Opcode::SW) => {
                memory_subsystem.store_word(s1.wrapping_add(imm), s2)?;
                return Ok(Some(Completion { fu: self.index, dest: None, value: s2 }));
            }
        };

        Ok(Some(Completion { fu: self.index, dest: Some(channel.dest), value }))
    }
}

/// The table containing all execution units of the core.
pub(crate) struct EUTable {
    array: Vec<EU>,
    alu_latency: u8,
    mem_latency: u8,
}

impl EUTable {
    pub(crate) fn new(cpu_config: &CPUConfig) -> EUTable {
        let array = ALL_UNITS.iter()
            .map(|unit| EU {
                index: *unit,
                cycles_remaining: 0,
                state: EUState::IDLE,
                channel: None,
                trace: cpu_config.trace.execute,
            })
            .collect();

        EUTable {
            array,
            alu_latency: cpu_config.alu_latency,
            mem_latency: cpu_config.mem_latency,
        }
    }

    pub(crate) fn flush(&mut self) {
        for eu in &mut self.array {
            eu.reset();
        }
    }

    /// The units that are idle at the start of this tick.
    pub(crate) fn fu_ready(&self) -> FuReadyBitmap {
        let mut bitmap = FuReadyBitmap::none();
        for eu in &self.array {
            if eu.state == EUState::IDLE {
                bitmap.set(eu.index);
            }
        }
        bitmap
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.array.iter().all(|eu| eu.state == EUState::IDLE)
    }

    pub(crate) fn dispatch(&mut self, channel: IssueChannel) {
        let latency = if channel.fu == FuId::MEM { self.mem_latency } else { self.alu_latency };
        let eu = &mut self.array[channel.fu.index()];
        debug_assert!(eu.state == EUState::IDLE, "EU {} is not idle", eu.index);
        debug_assert!(eu.channel.is_none());

        eu.state = EUState::EXECUTING;
        eu.cycles_remaining = latency.max(1);
        eu.channel = Some(channel);
    }

    /// Advances every busy unit by one cycle; returns the completions in
    /// unit order.
    pub(crate) fn cycle(&mut self, memory_subsystem: &mut MemorySubsystem) -> Result<Vec<Completion>, SimError> {
        let mut completions = Vec::with_capacity(FU_CNT);
        for eu in &mut self.array {
            if eu.state == EUState::IDLE {
                continue;
            }

            if let Some(completion) = eu.cycle(memory_subsystem)? {
                completions.push(completion);
            }
        }
        Ok(completions)
    }
}
