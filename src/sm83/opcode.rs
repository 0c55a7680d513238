use super::operands::{AluOp, Condition, Operand8, Reg16, Reg8, ShiftOp, StackPair};
use crate::memory::TargetAddress;

/// A decoded SM83 operation with its operands
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Operation {
    Nop,
    Stop,
    Halt,
    Di,
    Ei,
    Daa,
    Cpl,
    Scf,
    Ccf,
    /// LD dst, src
    Load(Operand8, Operand8),
    /// LD rr, nn
    LoadImmediate16(Reg16, u16),
    /// LD (nn), SP
    StoreStackPointer(TargetAddress),
    /// LD SP, HL
    LoadStackPointerFromHl,
    /// LD HL, SP+e
    LoadHlFromStackOffset(i8),
    /// ADD SP, e
    AddStackPointer(i8),
    Alu(AluOp, Operand8),
    Increment(Operand8),
    Decrement(Operand8),
    Increment16(Reg16),
    Decrement16(Reg16),
    /// ADD HL, rr
    AddHl(Reg16),
    /// RLCA, RRCA, RLA and RRA
    RotateAccumulator(ShiftOp),
    Shift(ShiftOp, Operand8),
    Bit(u8, Operand8),
    Reset(u8, Operand8),
    Set(u8, Operand8),
    Jump(Option<Condition>, TargetAddress),
    JumpHl,
    JumpRelative(Option<Condition>, i8),
    Call(Option<Condition>, TargetAddress),
    Return(Option<Condition>),
    ReturnInterrupt,
    Restart(u8),
    Push(StackPair),
    Pop(StackPair),
}

/// Opcode that switches to the second opcode table
pub const PREFIX: u8 = 0xCB;

/// Number of operand bytes following the opcode, or None if the opcode does not exist.
pub fn operand_size(opcode: u8) -> Option<usize> {
    match opcode {
        0xD3 | 0xDB | 0xDD | 0xE3 | 0xE4 | 0xEB | 0xEC | 0xED | 0xF4 | 0xFC | 0xFD => None,
        // LD rr,nn / LD (nn),SP / JP / CALL / LD (nn),A / LD A,(nn)
        0x01 | 0x11 | 0x21 | 0x31 | 0x08 => Some(2),
        0xC2 | 0xC3 | 0xCA | 0xD2 | 0xDA => Some(2),
        0xC4 | 0xCC | 0xCD | 0xD4 | 0xDC => Some(2),
        0xEA | 0xFA => Some(2),
        // LD r,n
        0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => Some(1),
        // JR / STOP
        0x18 | 0x20 | 0x28 | 0x30 | 0x38 | 0x10 => Some(1),
        // ALU A,n
        0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => Some(1),
        // LDH / ADD SP,e / LD HL,SP+e
        0xE0 | 0xF0 | 0xE8 | 0xF8 => Some(1),
        _ => Some(0),
    }
}

/// Decodes an unprefixed opcode. `operand` holds the little endian immediate, if any.
/// Must only be called for opcodes accepted by `operand_size` other than `PREFIX`.
pub fn decode(opcode: u8, operand: u16) -> Operation {
    let x = opcode >> 6;
    let y = (opcode >> 3) & 0x7;
    let z = opcode & 0x7;
    let p = y >> 1;
    let q = y & 1;
    let imm8 = operand as u8;
    let rel8 = operand as u8 as i8;

    match (x, z) {
        (0, 0) => match y {
            0 => Operation::Nop,
            1 => Operation::StoreStackPointer(operand),
            2 => Operation::Stop,
            3 => Operation::JumpRelative(None, rel8),
            _ => Operation::JumpRelative(Some(Condition::from_index(y - 4)), rel8),
        },
        (0, 1) if q == 0 => Operation::LoadImmediate16(Reg16::from_index(p), operand),
        (0, 1) => Operation::AddHl(Reg16::from_index(p)),
        (0, 2) => {
            let memory = match p {
                0 => Operand8::Indirect(Reg16::BC),
                1 => Operand8::Indirect(Reg16::DE),
                2 => Operand8::IndirectHlIncrement,
                _ => Operand8::IndirectHlDecrement,
            };
            let accumulator = Operand8::Register(Reg8::A);
            if q == 0 {
                Operation::Load(memory, accumulator)
            } else {
                Operation::Load(accumulator, memory)
            }
        }
        (0, 3) if q == 0 => Operation::Increment16(Reg16::from_index(p)),
        (0, 3) => Operation::Decrement16(Reg16::from_index(p)),
        (0, 4) => Operation::Increment(Operand8::from_index(y)),
        (0, 5) => Operation::Decrement(Operand8::from_index(y)),
        (0, 6) => Operation::Load(Operand8::from_index(y), Operand8::Immediate(imm8)),
        (0, _) => match y {
            0 => Operation::RotateAccumulator(ShiftOp::Rlc),
            1 => Operation::RotateAccumulator(ShiftOp::Rrc),
            2 => Operation::RotateAccumulator(ShiftOp::Rl),
            3 => Operation::RotateAccumulator(ShiftOp::Rr),
            4 => Operation::Daa,
            5 => Operation::Cpl,
            6 => Operation::Scf,
            _ => Operation::Ccf,
        },
        (1, 6) if y == 6 => Operation::Halt,
        (1, _) => Operation::Load(Operand8::from_index(y), Operand8::from_index(z)),
        (2, _) => Operation::Alu(AluOp::from_index(y), Operand8::from_index(z)),
        (_, 0) => match y {
            0..=3 => Operation::Return(Some(Condition::from_index(y))),
            4 => Operation::Load(Operand8::HighAbsolute(imm8), Operand8::Register(Reg8::A)),
            5 => Operation::AddStackPointer(rel8),
            6 => Operation::Load(Operand8::Register(Reg8::A), Operand8::HighAbsolute(imm8)),
            _ => Operation::LoadHlFromStackOffset(rel8),
        },
        (_, 1) if q == 0 => Operation::Pop(StackPair::from_index(p)),
        (_, 1) => match p {
            0 => Operation::Return(None),
            1 => Operation::ReturnInterrupt,
            2 => Operation::JumpHl,
            _ => Operation::LoadStackPointerFromHl,
        },
        (_, 2) => match y {
            0..=3 => Operation::Jump(Some(Condition::from_index(y)), operand),
            4 => Operation::Load(Operand8::HighC, Operand8::Register(Reg8::A)),
            5 => Operation::Load(Operand8::Absolute(operand), Operand8::Register(Reg8::A)),
            6 => Operation::Load(Operand8::Register(Reg8::A), Operand8::HighC),
            _ => Operation::Load(Operand8::Register(Reg8::A), Operand8::Absolute(operand)),
        },
        (_, 3) => match y {
            0 => Operation::Jump(None, operand),
            6 => Operation::Di,
            _ => Operation::Ei,
        },
        (_, 4) => Operation::Call(Some(Condition::from_index(y)), operand),
        (_, 5) if q == 0 => Operation::Push(StackPair::from_index(p)),
        (_, 5) => Operation::Call(None, operand),
        (_, 6) => Operation::Alu(AluOp::from_index(y), Operand8::Immediate(imm8)),
        (_, _) => Operation::Restart(y * 8),
    }
}

/// Decodes the opcode following the `PREFIX` byte
pub fn decode_prefixed(opcode: u8) -> Operation {
    let y = (opcode >> 3) & 0x7;
    let target = Operand8::from_index(opcode);
    match opcode >> 6 {
        0 => Operation::Shift(ShiftOp::from_index(y), target),
        1 => Operation::Bit(y, target),
        2 => Operation::Reset(y, target),
        _ => Operation::Set(y, target),
    }
}

/// Clock cycles of an instruction. Conditional branches take `branch_taken` extra cycles when
/// the condition holds.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Cycles {
    pub base: u32,
    pub branch_taken: u32,
}

impl Cycles {
    const fn fixed(base: u32) -> Self {
        Self {
            base,
            branch_taken: 0,
        }
    }

    const fn conditional(base: u32, branch_taken: u32) -> Self {
        Self { base, branch_taken }
    }
}

impl Operation {
    pub fn cycles(&self) -> Cycles {
        match self {
            Operation::Nop
            | Operation::Stop
            | Operation::Halt
            | Operation::Di
            | Operation::Ei
            | Operation::Daa
            | Operation::Cpl
            | Operation::Scf
            | Operation::Ccf
            | Operation::RotateAccumulator(_)
            | Operation::JumpHl => Cycles::fixed(4),
            Operation::Load(dst, src) => {
                Cycles::fixed(4 + dst.access_cycles() + src.access_cycles())
            }
            Operation::LoadImmediate16(..) => Cycles::fixed(12),
            Operation::StoreStackPointer(_) => Cycles::fixed(20),
            Operation::LoadStackPointerFromHl => Cycles::fixed(8),
            Operation::LoadHlFromStackOffset(_) => Cycles::fixed(12),
            Operation::AddStackPointer(_) => Cycles::fixed(16),
            Operation::Alu(_, src) => Cycles::fixed(4 + src.access_cycles()),
            Operation::Increment(target) | Operation::Decrement(target) => {
                Cycles::fixed(4 + 2 * target.access_cycles())
            }
            Operation::Increment16(_) | Operation::Decrement16(_) | Operation::AddHl(_) => {
                Cycles::fixed(8)
            }
            Operation::Shift(_, target)
            | Operation::Reset(_, target)
            | Operation::Set(_, target) => Cycles::fixed(8 + 2 * target.access_cycles()),
            Operation::Bit(_, target) => Cycles::fixed(8 + target.access_cycles()),
            Operation::Jump(None, _) => Cycles::fixed(16),
            Operation::Jump(Some(_), _) => Cycles::conditional(12, 4),
            Operation::JumpRelative(None, _) => Cycles::fixed(12),
            Operation::JumpRelative(Some(_), _) => Cycles::conditional(8, 4),
            Operation::Call(None, _) => Cycles::fixed(24),
            Operation::Call(Some(_), _) => Cycles::conditional(12, 12),
            Operation::Return(None) | Operation::ReturnInterrupt => Cycles::fixed(16),
            Operation::Return(Some(_)) => Cycles::conditional(8, 12),
            Operation::Restart(_) | Operation::Push(_) => Cycles::fixed(16),
            Operation::Pop(_) => Cycles::fixed(12),
        }
    }

    /// Whether execution can never fall through to the next instruction
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Operation::Stop
                | Operation::Halt
                | Operation::Jump(None, _)
                | Operation::JumpHl
                | Operation::JumpRelative(None, _)
                | Operation::Call(None, _)
                | Operation::Return(None)
                | Operation::ReturnInterrupt
                | Operation::Restart(_)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn illegal_opcodes_have_no_size() {
        for opcode in [0xD3, 0xDB, 0xDD, 0xE3, 0xE4, 0xEB, 0xEC, 0xED, 0xF4, 0xFC, 0xFD] {
            assert_eq!(operand_size(opcode), None, "opcode {:#04x}", opcode);
        }
        assert_eq!(operand_size(0x00), Some(0));
        assert_eq!(operand_size(0xCB), Some(0));
    }

    #[test]
    fn decodes_loads() {
        assert_eq!(
            decode(0x78, 0),
            Operation::Load(Operand8::Register(Reg8::A), Operand8::Register(Reg8::B))
        );
        assert_eq!(
            decode(0x36, 0x42),
            Operation::Load(Operand8::IndirectHl, Operand8::Immediate(0x42))
        );
        assert_eq!(
            decode(0x22, 0),
            Operation::Load(Operand8::IndirectHlIncrement, Operand8::Register(Reg8::A))
        );
        assert_eq!(
            decode(0xF0, 0x44),
            Operation::Load(Operand8::Register(Reg8::A), Operand8::HighAbsolute(0x44))
        );
        assert_eq!(
            decode(0xEA, 0xC000),
            Operation::Load(Operand8::Absolute(0xC000), Operand8::Register(Reg8::A))
        );
        assert_eq!(decode(0x31, 0xFFFE), Operation::LoadImmediate16(Reg16::SP, 0xFFFE));
        assert_eq!(decode(0x76, 0), Operation::Halt);
    }

    #[test]
    fn decodes_control_flow() {
        assert_eq!(
            decode(0x38, 0xFE),
            Operation::JumpRelative(Some(Condition::Carry), -2)
        );
        assert_eq!(decode(0xC3, 0x0150), Operation::Jump(None, 0x0150));
        assert_eq!(
            decode(0xC4, 0x1234),
            Operation::Call(Some(Condition::NotZero), 0x1234)
        );
        assert_eq!(decode(0xD8, 0), Operation::Return(Some(Condition::Carry)));
        assert_eq!(decode(0xD9, 0), Operation::ReturnInterrupt);
        assert_eq!(decode(0xE9, 0), Operation::JumpHl);
        assert_eq!(decode(0xFF, 0), Operation::Restart(0x38));
        assert_eq!(decode(0xF5, 0), Operation::Push(StackPair::AF));
        assert_eq!(decode(0xC1, 0), Operation::Pop(StackPair::BC));
        assert_eq!(decode(0xF8, 0xFB), Operation::LoadHlFromStackOffset(-5));
    }

    #[test]
    fn decodes_prefixed_operations() {
        assert_eq!(
            decode_prefixed(0x37),
            Operation::Shift(ShiftOp::Swap, Operand8::Register(Reg8::A))
        );
        assert_eq!(decode_prefixed(0x7E), Operation::Bit(7, Operand8::IndirectHl));
        assert_eq!(
            decode_prefixed(0x80),
            Operation::Reset(0, Operand8::Register(Reg8::B))
        );
        assert_eq!(
            decode_prefixed(0xFD),
            Operation::Set(7, Operand8::Register(Reg8::L))
        );
    }

    #[test]
    fn instruction_timings() {
        assert_eq!(decode(0x00, 0).cycles(), Cycles::fixed(4));
        assert_eq!(decode(0xE0, 0x80).cycles(), Cycles::fixed(12));
        assert_eq!(decode(0xFA, 0xC000).cycles(), Cycles::fixed(16));
        assert_eq!(decode(0x34, 0).cycles(), Cycles::fixed(12));
        assert_eq!(decode(0x20, 0).cycles(), Cycles::conditional(8, 4));
        assert_eq!(decode(0xC4, 0).cycles(), Cycles::conditional(12, 12));
        assert_eq!(decode(0xC0, 0).cycles(), Cycles::conditional(8, 12));
        assert_eq!(decode_prefixed(0x46).cycles(), Cycles::fixed(12));
        assert_eq!(decode_prefixed(0x06).cycles(), Cycles::fixed(16));
        assert_eq!(decode_prefixed(0x11).cycles(), Cycles::fixed(8));
    }
}
