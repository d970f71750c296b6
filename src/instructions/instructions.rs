use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

pub type RegisterType = u16;
pub type WordType = u32;

// The number of architectural registers visible to the issue queue.
pub const ARCH_REG_CNT: u16 = 128;

// RV32I major opcodes understood by the classifier.
pub const OPCODE_LOAD: u8 = 0x03;
pub const OPCODE_OP_IMM: u8 = 0x13;
pub const OPCODE_STORE: u8 = 0x23;
pub const OPCODE_OP: u8 = 0x33;
pub const OPCODE_LUI: u8 = 0x37;

const FUNCT7_SRA: u8 = 0x20;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    ADD,
    ADDI,
    LUI,
    ORI,
    XOR,
    SRAI,
    LB,
    LW,
    SB,
    SW,
}

impl Opcode {
    pub fn is_load(&self) -> bool {
        matches!(self, Opcode::LB | Opcode::LW)
    }

    pub fn is_store(&self) -> bool {
        matches!(self, Opcode::SB | Opcode::SW)
    }

    /// Loads and stores go to the memory unit; everything else is ALU-class.
    pub fn is_memory(&self) -> bool {
        self.is_load() || self.is_store()
    }

    pub fn writes_dest(&self) -> bool {
        !self.is_store()
    }
}

/// Outcome of classifying the decoder fields of an instruction.
///
/// An unknown combination is not a failure of the classifier; it is a value
/// the allocator has to make an explicit decision about.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Classified {
    Recognized(Opcode),
    Unclassified,
}

impl Classified {
    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Classified::Recognized(opcode) => Some(*opcode),
            Classified::Unclassified => None,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Classified::Recognized(opcode) if opcode.is_memory())
    }
}

impl fmt::Display for Classified {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classified::Recognized(opcode) => write!(f, "{}", mnemonic(*opcode)),
            Classified::Unclassified => write!(f, "???"),
        }
    }
}

pub fn classify(opcode: u8, funct3: u8, funct7: u8) -> Classified {
    let recognized = match (opcode, funct3) {
        (OPCODE_OP, 0) if funct7 == 0 => Opcode::ADD,
        (OPCODE_OP, 4) if funct7 == 0 => Opcode::XOR,
        (OPCODE_OP_IMM, 0) => Opcode::ADDI,
        (OPCODE_OP_IMM, 6) => Opcode::ORI,
        (OPCODE_OP_IMM, 5) if funct7 == FUNCT7_SRA => Opcode::SRAI,
        (OPCODE_LUI, _) => Opcode::LUI,
        (OPCODE_LOAD, 0) => Opcode::LB,
        (OPCODE_LOAD, 2) => Opcode::LW,
        (OPCODE_STORE, 0) => Opcode::SB,
        (OPCODE_STORE, 2) => Opcode::SW,
        _ => return Classified::Unclassified,
    };
    Classified::Recognized(recognized)
}

/// The canonical (opcode, funct3, funct7) fields of an opcode.
pub fn encoding(opcode: Opcode) -> (u8, u8, u8) {
    match opcode {
        Opcode::ADD => (OPCODE_OP, 0, 0),
        Opcode::XOR => (OPCODE_OP, 4, 0),
        Opcode::ADDI => (OPCODE_OP_IMM, 0, 0),
        Opcode::ORI => (OPCODE_OP_IMM, 6, 0),
        Opcode::SRAI => (OPCODE_OP_IMM, 5, FUNCT7_SRA),
        Opcode::LUI => (OPCODE_LUI, 0, 0),
        Opcode::LB => (OPCODE_LOAD, 0, 0),
        Opcode::LW => (OPCODE_LOAD, 2, 0),
        Opcode::SB => (OPCODE_STORE, 0, 0),
        Opcode::SW => (OPCODE_STORE, 2, 0),
    }
}

pub fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::ADD => "ADD",
        Opcode::ADDI => "ADDI",
        Opcode::LUI => "LUI",
        Opcode::ORI => "ORI",
        Opcode::XOR => "XOR",
        Opcode::SRAI => "SRAI",
        Opcode::LB => "LB",
        Opcode::LW => "LW",
        Opcode::SB => "SB",
        Opcode::SW => "SW",
    }
}

pub fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();

    match string.as_str() {
        "ADD" => Some(Opcode::ADD),
        "ADDI" => Some(Opcode::ADDI),
        "LUI" => Some(Opcode::LUI),
        "ORI" => Some(Opcode::ORI),
        "XOR" => Some(Opcode::XOR),
        "SRAI" => Some(Opcode::SRAI),
        "LB" => Some(Opcode::LB),
        "LW" => Some(Opcode::LW),
        "SB" => Some(Opcode::SB),
        "SW" => Some(Opcode::SW),
        _ => None,
    }
}

fn register_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?i)x(\d+)$").expect("register regex is valid"))
}

/// Parses an architectural register name such as `x12`.
pub fn get_register(name: &str) -> Option<RegisterType> {
    let captures = register_regex().captures(name.trim())?;
    let reg: RegisterType = captures[1].parse().ok()?;

    if reg >= ARCH_REG_CNT {
        return None;
    }
    Some(reg)
}

/// A decoded instruction as it sits in the program, before operand values
/// are read from the register file.
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub classified: Classified,
    pub dest: RegisterType,
    pub src1: RegisterType,
    pub src2: RegisterType,
    pub imm: WordType,
    // position in the program; used for tracing only
    pub pos: usize,
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.classified)?;

        match self.classified.opcode() {
            Some(Opcode::ADD) | Some(Opcode::XOR) =>
                write!(f, "x{},x{},x{}", self.dest, self.src1, self.src2)?,
            Some(Opcode::ADDI) | Some(Opcode::ORI) | Some(Opcode::SRAI) =>
                write!(f, "x{},x{},{}", self.dest, self.src1, self.imm as i32)?,
            Some(Opcode::LUI) => write!(f, "x{},{:#x}", self.dest, self.imm)?,
            Some(Opcode::LB) | Some(Opcode::LW) =>
                write!(f, "x{},{}(x{})", self.dest, self.imm as i32, self.src1)?,
            Some(Opcode::SB) | Some(Opcode::SW) =>
                write!(f, "x{},{}(x{})", self.src2, self.imm as i32, self.src1)?,
            None => write!(f, "x{},x{},x{}", self.dest, self.src1, self.src2)?,
        }

        write!(f, " ; #{}", self.pos)
    }
}

/// The instruction bundle presented to the allocator: tags plus the operand
/// values read from the register file when the instruction was presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstr {
    pub classified: Classified,
    pub dest: RegisterType,
    pub src1: RegisterType,
    pub src1_value: WordType,
    pub src2: RegisterType,
    pub src2_value: WordType,
    pub imm: WordType,
}

impl DecodedInstr {
    pub fn new(classified: Classified, dest: RegisterType, src1: RegisterType, src2: RegisterType) -> Self {
        Self {
            classified,
            dest,
            src1,
            src1_value: 0,
            src2,
            src2_value: 0,
            imm: 0,
        }
    }

    pub fn with_values(mut self, src1_value: WordType, src2_value: WordType) -> Self {
        self.src1_value = src1_value;
        self.src2_value = src2_value;
        self
    }

    pub fn with_imm(mut self, imm: WordType) -> Self {
        self.imm = imm;
        self
    }
}
