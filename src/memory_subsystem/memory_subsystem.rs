use crate::cpu::{CPUConfig, SimError};
use crate::instructions::instructions::WordType;

/// Byte-addressed little-endian data memory used by the memory unit.
pub(crate) struct MemorySubsystem {
    pub(crate) memory: Vec<u8>,
}

impl MemorySubsystem {
    pub fn new(cpu_config: &CPUConfig) -> MemorySubsystem {
        MemorySubsystem {
            memory: vec![0; cpu_config.memory_size as usize],
        }
    }

    pub(crate) fn init(&mut self, words: &[(WordType, WordType)]) -> Result<(), SimError> {
        self.memory.fill(0);

        for &(addr, value) in words {
            self.store_word(addr, value)?;
        }
        Ok(())
    }

    fn range(&self, addr: WordType, len: usize) -> Result<std::ops::Range<usize>, SimError> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.memory.len() => Ok(start..end),
            _ => Err(SimError::MemoryOutOfBounds { addr, size: self.memory.len() }),
        }
    }

    pub(crate) fn load_byte(&self, addr: WordType) -> Result<u8, SimError> {
        let range = self.range(addr, 1)?;
        Ok(self.memory[range.start])
    }

    pub(crate) fn load_word(&self, addr: WordType) -> Result<WordType, SimError> {
        let range = self.range(addr, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.memory[range]);
        Ok(WordType::from_le_bytes(bytes))
    }

    pub(crate) fn store_byte(&mut self, addr: WordType, value: u8) -> Result<(), SimError> {
        let range = self.range(addr, 1)?;
        self.memory[range.start] = value;
        Ok(())
    }

    pub(crate) fn store_word(&mut self, addr: WordType, value: WordType) -> Result<(), SimError> {
        let range = self.range(addr, 4)?;
        self.memory[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}
