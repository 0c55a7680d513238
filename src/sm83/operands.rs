use crate::memory::TargetAddress;

/// 8 bit registers
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Reg8 {
    A,
    B,
    C,
    D,
    E,
    H,
    L,
}

/// 16 bit register pairs as used by loads and arithmetic
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Reg16 {
    BC,
    DE,
    HL,
    SP,
}

impl Reg16 {
    pub(super) fn from_index(index: u8) -> Self {
        match index & 0x3 {
            0 => Reg16::BC,
            1 => Reg16::DE,
            2 => Reg16::HL,
            _ => Reg16::SP,
        }
    }
}

/// Register pairs that can be pushed to or popped from the stack
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StackPair {
    BC,
    DE,
    HL,
    AF,
}

impl StackPair {
    pub(super) fn from_index(index: u8) -> Self {
        match index & 0x3 {
            0 => StackPair::BC,
            1 => StackPair::DE,
            2 => StackPair::HL,
            _ => StackPair::AF,
        }
    }
}

/// Branch conditions
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Condition {
    NotZero,
    Zero,
    NotCarry,
    Carry,
}

impl Condition {
    pub(super) fn from_index(index: u8) -> Self {
        match index & 0x3 {
            0 => Condition::NotZero,
            1 => Condition::Zero,
            2 => Condition::NotCarry,
            _ => Condition::Carry,
        }
    }
}

/// Source or destination of an 8 bit operation
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Operand8 {
    Register(Reg8),
    Immediate(u8),
    /// (HL)
    IndirectHl,
    /// (BC) or (DE)
    Indirect(Reg16),
    /// (HL+)
    IndirectHlIncrement,
    /// (HL-)
    IndirectHlDecrement,
    /// (nn)
    Absolute(TargetAddress),
    /// (0xFF00 + n)
    HighAbsolute(u8),
    /// (0xFF00 + C)
    HighC,
}

impl Operand8 {
    /// Decodes the 3 bit register field used all over the opcode map
    pub(super) fn from_index(index: u8) -> Self {
        match index & 0x7 {
            0 => Operand8::Register(Reg8::B),
            1 => Operand8::Register(Reg8::C),
            2 => Operand8::Register(Reg8::D),
            3 => Operand8::Register(Reg8::E),
            4 => Operand8::Register(Reg8::H),
            5 => Operand8::Register(Reg8::L),
            6 => Operand8::IndirectHl,
            _ => Operand8::Register(Reg8::A),
        }
    }

    pub fn is_memory(&self) -> bool {
        !matches!(self, Operand8::Register(_) | Operand8::Immediate(_))
    }

    /// Clock cycles spent fetching the operand, on top of the opcode fetch
    pub fn access_cycles(&self) -> u32 {
        match self {
            Operand8::Register(_) => 0,
            Operand8::Immediate(_) => 4,
            Operand8::IndirectHl
            | Operand8::Indirect(_)
            | Operand8::IndirectHlIncrement
            | Operand8::IndirectHlDecrement
            | Operand8::HighC => 4,
            Operand8::HighAbsolute(_) => 8,
            Operand8::Absolute(_) => 12,
        }
    }
}

/// Accumulator ALU operations
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbc,
    And,
    Xor,
    Or,
    Cp,
}

impl AluOp {
    pub(super) fn from_index(index: u8) -> Self {
        match index & 0x7 {
            0 => AluOp::Add,
            1 => AluOp::Adc,
            2 => AluOp::Sub,
            3 => AluOp::Sbc,
            4 => AluOp::And,
            5 => AluOp::Xor,
            6 => AluOp::Or,
            _ => AluOp::Cp,
        }
    }
}

/// Rotates and shifts of the CB table (and RLCA, RRCA, RLA, RRA on the accumulator)
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ShiftOp {
    Rlc,
    Rrc,
    Rl,
    Rr,
    Sla,
    Sra,
    Swap,
    Srl,
}

impl ShiftOp {
    pub(super) fn from_index(index: u8) -> Self {
        match index & 0x7 {
            0 => ShiftOp::Rlc,
            1 => ShiftOp::Rrc,
            2 => ShiftOp::Rl,
            3 => ShiftOp::Rr,
            4 => ShiftOp::Sla,
            5 => ShiftOp::Sra,
            6 => ShiftOp::Swap,
            _ => ShiftOp::Srl,
        }
    }
}
