use std::collections::BTreeMap;
use std::fs;
use std::io;

use serde::Deserialize;
use thiserror::Error;

use crate::instructions::instructions::{classify, Classified, encoding, get_opcode, get_register, Instr, RegisterType, WordType};

/// A program of decoded instructions with the initial machine state.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub registers: Vec<(RegisterType, WordType)>,
    pub memory: Vec<(WordType, WordType)>,
    pub program: Vec<Instr>,
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{0}")]
    IOError(String),
    #[error("{0}")]
    ParseError(String),
    #[error("{}", .0.join("\n"))]
    AnalysisError(Vec<String>),
    #[error("{0}")]
    NotFoundError(String),
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct ScenarioFile {
    #[serde(default)]
    registers: BTreeMap<String, i64>,
    #[serde(default)]
    memory: BTreeMap<i64, i64>,
    #[serde(default)]
    program: Vec<InstrEntry>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct InstrEntry {
    op: Option<String>,
    opcode: Option<u8>,
    funct3: Option<u8>,
    funct7: Option<u8>,
    rd: Option<String>,
    rs1: Option<String>,
    rs2: Option<String>,
    #[serde(default)]
    imm: i64,
}

pub fn load(path: &str) -> Result<Scenario, LoadError> {
    let src = match fs::read_to_string(path) {
        Ok(src) => src,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(LoadError::NotFoundError(format!("Scenario file '{}' not found", path)));
        }
        Err(err) => {
            return Err(LoadError::IOError(format!("Failed to read '{}': {}", path, err)));
        }
    };

    load_from_string(&src)
}

pub fn load_from_string(src: &str) -> Result<Scenario, LoadError> {
    let file: ScenarioFile = serde_yaml::from_str(src)
        .map_err(|err| LoadError::ParseError(format!("Malformed scenario: {}", err)))?;

    let mut loader = Loader { errors: Vec::new() };
    let scenario = loader.analyze(file);

    if !loader.errors.is_empty() {
        return Err(LoadError::AnalysisError(loader.errors));
    }

    if scenario.program.is_empty() {
        return Err(LoadError::NotFoundError("No program found in scenario".to_string()));
    }

    Ok(scenario)
}

struct Loader {
    errors: Vec<String>,
}

impl Loader {
    fn analyze(&mut self, file: ScenarioFile) -> Scenario {
        let mut registers = Vec::with_capacity(file.registers.len());
        for (name, value) in &file.registers {
            let context = format!("Register '{}'", name);
            match get_register(name) {
                None => self.errors.push(format!("{}: not a valid register name", context)),
                Some(0) if *value != 0 => self.errors.push(format!("{}: x0 is hardwired to zero", context)),
                Some(reg) => {
                    if let Some(value) = self.word(&context, *value) {
                        registers.push((reg, value));
                    }
                }
            }
        }

        let mut memory = Vec::with_capacity(file.memory.len());
        for (&addr, &value) in &file.memory {
            let context = format!("Memory address {}", addr);
            if addr < 0 || addr > WordType::MAX as i64 {
                self.errors.push(format!("{}: address out of range", context));
                continue;
            }
            if let Some(value) = self.word(&context, value) {
                memory.push((addr as WordType, value));
            }
        }

        let program = file.program.iter()
            .enumerate()
            .filter_map(|(pos, entry)| self.instr(pos, entry))
            .collect();

        Scenario { registers, memory, program }
    }

    fn instr(&mut self, pos: usize, entry: &InstrEntry) -> Option<Instr> {
        let context = format!("Instruction #{}", pos);
        let error_cnt = self.errors.len();

        let raw = entry.opcode.is_some() || entry.funct3.is_some() || entry.funct7.is_some();
        let classified = match (&entry.op, raw) {
            (Some(_), true) => {
                self.errors.push(format!("{}: 'op' can't be combined with raw opcode fields", context));
                None
            }
            (None, false) => {
                self.errors.push(format!("{}: needs either 'op' or 'opcode'", context));
                None
            }
            (Some(op), false) => match get_opcode(op) {
                None => {
                    self.errors.push(format!("{}: unknown operation '{}'", context, op));
                    None
                }
                Some(opcode) => {
                    let (opcode, funct3, funct7) = encoding(opcode);
                    Some(classify(opcode, funct3, funct7))
                }
            },
            (None, true) => self.raw_fields(&context, entry),
        };

        let dest = self.register(&context, "rd", &entry.rd);
        let src1 = self.register(&context, "rs1", &entry.rs1);
        let src2 = self.register(&context, "rs2", &entry.rs2);
        let imm = self.word(&context, entry.imm);

        if self.errors.len() > error_cnt {
            return None;
        }

        Some(Instr {
            classified: classified?,
            dest: dest?,
            src1: src1?,
            src2: src2?,
            imm: imm?,
            pos,
        })
    }

    fn raw_fields(&mut self, context: &str, entry: &InstrEntry) -> Option<Classified> {
        let opcode = match entry.opcode {
            None => {
                self.errors.push(format!("{}: raw fields need an 'opcode'", context));
                return None;
            }
            Some(opcode) => opcode,
        };
        let funct3 = entry.funct3.unwrap_or(0);
        let funct7 = entry.funct7.unwrap_or(0);

        if opcode > 0x7f || funct3 > 0x7 || funct7 > 0x7f {
            self.errors.push(format!("{}: field out of range (opcode={:#x}, funct3={:#x}, funct7={:#x})",
                                     context, opcode, funct3, funct7));
            return None;
        }

        Some(classify(opcode, funct3, funct7))
    }

    // An absent register field is x0.
    fn register(&mut self, context: &str, field: &str, name: &Option<String>) -> Option<RegisterType> {
        match name {
            None => Some(0),
            Some(name) => {
                let reg = get_register(name);
                if reg.is_none() {
                    self.errors.push(format!("{}: illegal register '{}' for '{}'", context, name, field));
                }
                reg
            }
        }
    }

    // Accepts both the signed and the unsigned reading of a 32-bit word.
    fn word(&mut self, context: &str, value: i64) -> Option<WordType> {
        if value < i32::MIN as i64 || value > WordType::MAX as i64 {
            self.errors.push(format!("{}: value {} does not fit in 32 bits", context, value));
            return None;
        }
        Some(value as WordType)
    }
}
