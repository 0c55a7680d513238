/// This module provides functions to dynamically assemble x86-64 machine code.

/// Represents the encoded bytes of a single x86-64 machine instruction
#[derive(Debug, PartialEq, Eq)]
pub struct OpCode(Vec<u8>);

impl OpCode {
    /// Obtains the encoded bytes of the opcode
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the encoded instruction in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

pub trait OperandType {}

/// Immediate argument for a machine code instruction. Encoders truncate it to the width the
/// instruction needs.
#[derive(Clone, Copy, Debug)]
pub struct Immediate(i64);

impl Immediate {
    /// Constructs a new immediate from the given value
    pub fn new(val: i64) -> Self {
        Self(val)
    }

    fn fits_i8(&self) -> bool {
        i8::try_from(self.0).is_ok()
    }

    fn fits_i32(&self) -> bool {
        i32::try_from(self.0).is_ok()
    }

    fn encode(&self, width: usize) -> Vec<u8> {
        self.0.to_le_bytes()[..width].to_vec()
    }
}

/// x86-64 general purpose registers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Register {
    fn number(self) -> u8 {
        self as u8
    }

    fn low_bits(self) -> u8 {
        self.number() & 0x7
    }

    fn is_extended(self) -> bool {
        self.number() >= 8
    }

    /// spl, bpl, sil and dil are only addressable with a REX prefix
    fn needs_rex_as_byte(self) -> bool {
        (4..8).contains(&self.number())
    }
}

/// Operand size of the instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpSize {
    Byte,
    Word,
    Dword,
    Qword,
}

impl OpSize {
    fn immediate_width(self) -> usize {
        match self {
            OpSize::Byte => 1,
            OpSize::Word => 2,
            OpSize::Dword | OpSize::Qword => 4,
        }
    }
}

/// Memory operand in the form `[base + index + displacement]`
#[derive(Clone, Copy, Debug)]
pub struct Memory {
    base: Register,
    index: Option<Register>,
    displacement: i32,
}

impl Memory {
    /// Addresses the memory pointed to by the base register
    pub fn base(base: Register) -> Self {
        Self {
            base,
            index: None,
            displacement: 0,
        }
    }

    /// Adds an index register to the address calculation
    pub fn with_index(mut self, index: Register) -> Self {
        assert!(index != Register::Rsp, "rsp cannot be used as an index register");
        self.index = Some(index);
        self
    }

    /// Adds a constant displacement to the address calculation
    pub fn with_displacement(mut self, displacement: i32) -> Self {
        self.displacement = displacement;
        self
    }
}

/// Condition codes, as encoded in the lower nibble of `jcc`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    Overflow = 0x0,
    NotOverflow = 0x1,
    Below = 0x2,
    AboveOrEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowOrEqual = 0x6,
    Above = 0x7,
    Sign = 0x8,
    NotSign = 0x9,
}

impl Condition {
    /// Returns the condition that holds exactly when this one doesn't
    pub fn invert(self) -> Self {
        match self {
            Condition::Overflow => Condition::NotOverflow,
            Condition::NotOverflow => Condition::Overflow,
            Condition::Below => Condition::AboveOrEqual,
            Condition::AboveOrEqual => Condition::Below,
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::BelowOrEqual => Condition::Above,
            Condition::Above => Condition::BelowOrEqual,
            Condition::Sign => Condition::NotSign,
            Condition::NotSign => Condition::Sign,
        }
    }
}

pub struct UnknownOperand {}
pub struct ImmediateOperand {}
pub struct RegisterOperand {}
pub struct MemoryOperand {}

impl OperandType for UnknownOperand {}
impl OperandType for ImmediateOperand {}
impl OperandType for RegisterOperand {}
impl OperandType for MemoryOperand {}

enum RegField {
    Register(Register),
    Extension(u8),
}

impl RegField {
    fn bits(&self) -> u8 {
        match self {
            RegField::Register(reg) => reg.low_bits(),
            RegField::Extension(ext) => *ext,
        }
    }
}

enum Rm {
    Register(Register),
    Memory(Memory),
}

/// Encodes an instruction that uses a ModRM byte, taking care of the operand size prefix, the
/// REX prefix and the SIB byte when the memory operand requires it.
fn encode_modrm(
    size: OpSize,
    byte_registers: bool,
    opcode: &[u8],
    reg: RegField,
    rm: Rm,
    immediate: &[u8],
) -> OpCode {
    let mut bytes = vec![];
    if size == OpSize::Word {
        bytes.push(0x66);
    }

    let mut rex = 0x40u8;
    let mut force_rex = false;
    if size == OpSize::Qword {
        rex |= 0x8;
    }
    if let RegField::Register(reg) = &reg {
        if reg.is_extended() {
            rex |= 0x4;
        }
        force_rex |= byte_registers && reg.needs_rex_as_byte();
    }
    match &rm {
        Rm::Register(reg) => {
            if reg.is_extended() {
                rex |= 0x1;
            }
            force_rex |= byte_registers && reg.needs_rex_as_byte();
        }
        Rm::Memory(mem) => {
            if mem.base.is_extended() {
                rex |= 0x1;
            }
            if mem.index.map(Register::is_extended).unwrap_or(false) {
                rex |= 0x2;
            }
        }
    }
    if rex != 0x40 || force_rex {
        bytes.push(rex);
    }

    bytes.extend_from_slice(opcode);

    let reg_bits = reg.bits() << 3;
    match rm {
        Rm::Register(reg) => bytes.push(0xC0 | reg_bits | reg.low_bits()),
        Rm::Memory(mem) => {
            // rbp and r13 as base with no displacement mean rip-relative addressing
            let needs_displacement = mem.displacement != 0 || mem.base.low_bits() == 5;
            let (mode, displacement) = if !needs_displacement {
                (0x00, vec![])
            } else if let Ok(disp) = i8::try_from(mem.displacement) {
                (0x40, vec![disp as u8])
            } else {
                (0x80, mem.displacement.to_le_bytes().to_vec())
            };

            if mem.index.is_some() || mem.base.low_bits() == 4 {
                let index_bits = mem.index.map(Register::low_bits).unwrap_or(4);
                bytes.push(mode | reg_bits | 0x4);
                bytes.push((index_bits << 3) | mem.base.low_bits());
            } else {
                bytes.push(mode | reg_bits | mem.base.low_bits());
            }
            bytes.extend_from_slice(&displacement);
        }
    }

    bytes.extend_from_slice(immediate);
    OpCode(bytes)
}

/// Encodes instructions that carry the register in the low bits of the opcode (push/pop/mov imm)
fn encode_short_form(size: OpSize, base: u8, reg: Register, immediate: &[u8]) -> OpCode {
    let mut bytes = vec![];
    if size == OpSize::Word {
        bytes.push(0x66);
    }
    let mut rex = 0x40u8;
    if size == OpSize::Qword {
        rex |= 0x8;
    }
    if reg.is_extended() {
        rex |= 0x1;
    }
    if rex != 0x40 || (size == OpSize::Byte && reg.needs_rex_as_byte()) {
        bytes.push(rex);
    }
    bytes.push(base + reg.low_bits());
    bytes.extend_from_slice(immediate);
    OpCode(bytes)
}

mod nop {
    use super::*;

    /// x86-64 `nop` instruction
    /// ```
    ///     use gb_jit::x86_asm::Nop;
    ///     let opcode = Nop::new().generate();
    /// ```
    pub struct Nop();

    impl Nop {
        pub fn new() -> Self {
            Self()
        }

        pub fn generate(self) -> OpCode {
            OpCode(vec![0x90])
        }
    }
}

pub use nop::Nop;

mod ret {
    use super::*;

    /// x86-64 `ret` instruction. Returns to the address on top of the host stack.
    pub struct Ret();

    impl Ret {
        pub fn new() -> Self {
            Self()
        }

        pub fn generate(self) -> OpCode {
            OpCode(vec![0xC3])
        }
    }
}

pub use ret::Ret;

mod stack {
    use super::*;

    /// `push r64`
    pub struct Push(Register);

    impl Push {
        pub fn new(reg: Register) -> Self {
            Self(reg)
        }

        pub fn generate(self) -> OpCode {
            encode_short_form(OpSize::Dword, 0x50, self.0, &[])
        }
    }

    /// `pop r64`
    pub struct Pop(Register);

    impl Pop {
        pub fn new(reg: Register) -> Self {
            Self(reg)
        }

        pub fn generate(self) -> OpCode {
            encode_short_form(OpSize::Dword, 0x58, self.0, &[])
        }
    }

    /// `pushfq`, pushes the host flags register
    pub struct Pushf();

    impl Pushf {
        pub fn new() -> Self {
            Self()
        }

        pub fn generate(self) -> OpCode {
            OpCode(vec![0x9C])
        }
    }

    /// `popfq`, replaces the host flags register with the value on top of the stack
    pub struct Popf();

    impl Popf {
        pub fn new() -> Self {
            Self()
        }

        pub fn generate(self) -> OpCode {
            OpCode(vec![0x9D])
        }
    }
}

pub use stack::{Pop, Popf, Push, Pushf};

mod mov {
    use super::*;
    use std::marker::PhantomData;

    /// x86-64 `mov` between registers or from an immediate. Defaults to a 64 bit operation.
    /// ```
    ///     use gb_jit::x86_asm::{Mov, Register, OpSize, Immediate};
    ///     let opcode = Mov::new(Register::Rax).with_register(Register::Rbx).generate();
    ///     let opcode = Mov::new(Register::R13)
    ///         .with_immediate(Immediate::new(0x12))
    ///         .with_op_size(OpSize::Dword)
    ///         .generate();
    /// ```
    pub struct Mov<T: OperandType> {
        dest_reg: Register,
        source_reg: Option<Register>,
        immediate: Option<Immediate>,
        size: OpSize,
        _pd: PhantomData<T>,
    }

    impl<T: OperandType> Mov<T> {
        pub fn with_op_size(mut self, size: OpSize) -> Self {
            self.size = size;
            self
        }
    }

    impl Mov<UnknownOperand> {
        pub fn new(dest_reg: Register) -> Self {
            Self {
                dest_reg,
                source_reg: None,
                immediate: None,
                size: OpSize::Qword,
                _pd: PhantomData {},
            }
        }

        pub fn with_register(self, reg: Register) -> Mov<RegisterOperand> {
            Mov::<RegisterOperand> {
                dest_reg: self.dest_reg,
                source_reg: Some(reg),
                immediate: None,
                size: self.size,
                _pd: PhantomData {},
            }
        }

        pub fn with_immediate(self, imm: Immediate) -> Mov<ImmediateOperand> {
            Mov::<ImmediateOperand> {
                dest_reg: self.dest_reg,
                source_reg: None,
                immediate: Some(imm),
                size: self.size,
                _pd: PhantomData {},
            }
        }
    }

    impl Mov<RegisterOperand> {
        pub fn generate(self) -> OpCode {
            let source_reg = self.source_reg.expect("Mov should contain a source register");
            let opcode = if self.size == OpSize::Byte { 0x88 } else { 0x89 };
            encode_modrm(
                self.size,
                self.size == OpSize::Byte,
                &[opcode],
                RegField::Register(source_reg),
                Rm::Register(self.dest_reg),
                &[],
            )
        }
    }

    impl Mov<ImmediateOperand> {
        pub fn generate(self) -> OpCode {
            let imm = self.immediate.expect("Mov should contain an immediate value");
            match self.size {
                OpSize::Byte => encode_short_form(self.size, 0xB0, self.dest_reg, &imm.encode(1)),
                OpSize::Word => encode_short_form(self.size, 0xB8, self.dest_reg, &imm.encode(2)),
                OpSize::Dword => encode_short_form(self.size, 0xB8, self.dest_reg, &imm.encode(4)),
                OpSize::Qword if imm.fits_i32() => encode_modrm(
                    self.size,
                    false,
                    &[0xC7],
                    RegField::Extension(0),
                    Rm::Register(self.dest_reg),
                    &imm.encode(4),
                ),
                OpSize::Qword => encode_short_form(self.size, 0xB8, self.dest_reg, &imm.encode(8)),
            }
        }
    }
}

pub use mov::Mov;

mod memory_access {
    use super::*;

    /// Loads a register from memory: `mov reg, [mem]`. Defaults to 64 bit.
    /// ```
    ///     use gb_jit::x86_asm::{Load, Memory, Register};
    ///     let opcode = Load::new(Register::Rax, Memory::base(Register::Rdi).with_displacement(8))
    ///         .generate();
    /// ```
    pub struct Load {
        dest_reg: Register,
        memory: Memory,
        size: OpSize,
    }

    impl Load {
        pub fn new(dest_reg: Register, memory: Memory) -> Self {
            Self {
                dest_reg,
                memory,
                size: OpSize::Qword,
            }
        }

        pub fn with_op_size(mut self, size: OpSize) -> Self {
            self.size = size;
            self
        }

        pub fn generate(self) -> OpCode {
            let opcode = if self.size == OpSize::Byte { 0x8A } else { 0x8B };
            encode_modrm(
                self.size,
                self.size == OpSize::Byte,
                &[opcode],
                RegField::Register(self.dest_reg),
                Rm::Memory(self.memory),
                &[],
            )
        }
    }

    /// Stores a register into memory: `mov [mem], reg`. Defaults to 64 bit.
    pub struct Store {
        source_reg: Register,
        memory: Memory,
        size: OpSize,
    }

    impl Store {
        pub fn new(memory: Memory, source_reg: Register) -> Self {
            Self {
                source_reg,
                memory,
                size: OpSize::Qword,
            }
        }

        pub fn with_op_size(mut self, size: OpSize) -> Self {
            self.size = size;
            self
        }

        pub fn generate(self) -> OpCode {
            let opcode = if self.size == OpSize::Byte { 0x88 } else { 0x89 };
            encode_modrm(
                self.size,
                self.size == OpSize::Byte,
                &[opcode],
                RegField::Register(self.source_reg),
                Rm::Memory(self.memory),
                &[],
            )
        }
    }

    /// Computes an effective address without touching memory or flags. Defaults to 64 bit.
    pub struct Lea {
        dest_reg: Register,
        memory: Memory,
        size: OpSize,
    }

    impl Lea {
        pub fn new(dest_reg: Register, memory: Memory) -> Self {
            Self {
                dest_reg,
                memory,
                size: OpSize::Qword,
            }
        }

        pub fn with_op_size(mut self, size: OpSize) -> Self {
            self.size = size;
            self
        }

        pub fn generate(self) -> OpCode {
            assert!(
                matches!(self.size, OpSize::Dword | OpSize::Qword),
                "lea is only encoded for 32 and 64 bit destinations"
            );
            encode_modrm(
                self.size,
                false,
                &[0x8D],
                RegField::Register(self.dest_reg),
                Rm::Memory(self.memory),
                &[],
            )
        }
    }
}

pub use memory_access::{Lea, Load, Store};

mod movzx {
    use super::*;
    use std::marker::PhantomData;

    /// Zero extending move into a 32 bit register (which clears the upper 32 bits as well).
    /// The source is a byte unless `from_word` is selected.
    /// ```
    ///     use gb_jit::x86_asm::{Movzx, Memory, Register};
    ///     let opcode = Movzx::new(Register::Rax)
    ///         .with_memory(Memory::base(Register::Rdi).with_index(Register::Rsi))
    ///         .generate();
    /// ```
    pub struct Movzx<T: OperandType> {
        dest_reg: Register,
        source: Option<Rm>,
        word: bool,
        _pd: PhantomData<T>,
    }

    impl<T: OperandType> Movzx<T> {
        /// Selects a 16 bit source operand
        pub fn from_word(mut self) -> Self {
            self.word = true;
            self
        }

        pub fn generate(self) -> OpCode {
            let source = self.source.expect("Movzx should contain a source operand");
            let opcode = if self.word { 0xB7 } else { 0xB6 };
            encode_modrm(
                OpSize::Dword,
                !self.word,
                &[0x0F, opcode],
                RegField::Register(self.dest_reg),
                source,
                &[],
            )
        }
    }

    impl Movzx<UnknownOperand> {
        pub fn new(dest_reg: Register) -> Self {
            Self {
                dest_reg,
                source: None,
                word: false,
                _pd: PhantomData {},
            }
        }

        pub fn with_register(self, reg: Register) -> Movzx<RegisterOperand> {
            Movzx::<RegisterOperand> {
                dest_reg: self.dest_reg,
                source: Some(Rm::Register(reg)),
                word: self.word,
                _pd: PhantomData {},
            }
        }

        pub fn with_memory(self, memory: Memory) -> Movzx<MemoryOperand> {
            Movzx::<MemoryOperand> {
                dest_reg: self.dest_reg,
                source: Some(Rm::Memory(memory)),
                word: self.word,
                _pd: PhantomData {},
            }
        }
    }
}

pub use movzx::Movzx;

pub mod arithmetic {
    use super::*;
    use std::marker::PhantomData;

    /// The `/digit` used by the x86 ALU group
    #[repr(u8)]
    pub enum Operation {
        Add = 0,
        Or = 1,
        Adc = 2,
        Sbb = 3,
        And = 4,
        Sub = 5,
        Xor = 6,
        Cmp = 7,
    }

    /// x86-64 two operand ALU instructions: `op dst, src` with a register or immediate source.
    pub struct AluOp<const OP: u8, T: OperandType> {
        dest_reg: Register,
        source_reg: Option<Register>,
        immediate: Option<Immediate>,
        size: OpSize,
        _pd: PhantomData<T>,
    }

    impl<const OP: u8, T: OperandType> AluOp<OP, T> {
        /// Selects the operand size. Defaults to 64 bit.
        pub fn with_op_size(mut self, size: OpSize) -> Self {
            self.size = size;
            self
        }
    }

    impl<const OP: u8> AluOp<OP, UnknownOperand> {
        pub fn new(dest_reg: Register) -> Self {
            Self {
                dest_reg,
                source_reg: None,
                immediate: None,
                size: OpSize::Qword,
                _pd: PhantomData {},
            }
        }

        pub fn with_register(self, reg: Register) -> AluOp<OP, RegisterOperand> {
            AluOp::<OP, RegisterOperand> {
                dest_reg: self.dest_reg,
                source_reg: Some(reg),
                immediate: None,
                size: self.size,
                _pd: PhantomData {},
            }
        }

        pub fn with_immediate(self, imm: Immediate) -> AluOp<OP, ImmediateOperand> {
            AluOp::<OP, ImmediateOperand> {
                dest_reg: self.dest_reg,
                source_reg: None,
                immediate: Some(imm),
                size: self.size,
                _pd: PhantomData {},
            }
        }
    }

    impl<const OP: u8> AluOp<OP, RegisterOperand> {
        pub fn generate(self) -> OpCode {
            let source_reg = self.source_reg.expect("AluOp should contain a source register");
            let opcode = (OP << 3) | if self.size == OpSize::Byte { 0x00 } else { 0x01 };
            encode_modrm(
                self.size,
                self.size == OpSize::Byte,
                &[opcode],
                RegField::Register(source_reg),
                Rm::Register(self.dest_reg),
                &[],
            )
        }
    }

    impl<const OP: u8> AluOp<OP, ImmediateOperand> {
        pub fn generate(self) -> OpCode {
            let imm = self.immediate.expect("AluOp should contain an immediate value");
            let (opcode, immediate) = match self.size {
                OpSize::Byte => (0x80, imm.encode(1)),
                _ if imm.fits_i8() => (0x83, imm.encode(1)),
                size => (0x81, imm.encode(size.immediate_width())),
            };
            encode_modrm(
                self.size,
                self.size == OpSize::Byte,
                &[opcode],
                RegField::Extension(OP),
                Rm::Register(self.dest_reg),
                &immediate,
            )
        }
    }

    /// `add`
    /// ```
    ///     use gb_jit::x86_asm::{Add, Register, OpSize};
    ///     let opcode = Add::new(Register::R13)
    ///         .with_register(Register::Rcx)
    ///         .with_op_size(OpSize::Byte)
    ///         .generate();
    /// ```
    pub type Add = AluOp<{ Operation::Add as u8 }, UnknownOperand>;
    /// `or`
    pub type Or = AluOp<{ Operation::Or as u8 }, UnknownOperand>;
    /// `adc`, add with the host carry flag
    pub type Adc = AluOp<{ Operation::Adc as u8 }, UnknownOperand>;
    /// `sbb`, subtract with the host carry flag as borrow
    pub type Sbb = AluOp<{ Operation::Sbb as u8 }, UnknownOperand>;
    /// `and`
    pub type And = AluOp<{ Operation::And as u8 }, UnknownOperand>;
    /// `sub`
    pub type Sub = AluOp<{ Operation::Sub as u8 }, UnknownOperand>;
    /// `xor`
    pub type Xor = AluOp<{ Operation::Xor as u8 }, UnknownOperand>;
    /// `cmp`, a `sub` that only updates the flags
    pub type Cmp = AluOp<{ Operation::Cmp as u8 }, UnknownOperand>;
}

pub use arithmetic::{Adc, Add, And, Cmp, Or, Sbb, Sub, Xor};

mod test_op {
    use super::*;
    use std::marker::PhantomData;

    /// `test`, a bitwise and that only updates the flags
    pub struct Test<T: OperandType> {
        dest_reg: Register,
        source_reg: Option<Register>,
        immediate: Option<Immediate>,
        size: OpSize,
        _pd: PhantomData<T>,
    }

    impl<T: OperandType> Test<T> {
        pub fn with_op_size(mut self, size: OpSize) -> Self {
            self.size = size;
            self
        }
    }

    impl Test<UnknownOperand> {
        pub fn new(dest_reg: Register) -> Self {
            Self {
                dest_reg,
                source_reg: None,
                immediate: None,
                size: OpSize::Qword,
                _pd: PhantomData {},
            }
        }

        pub fn with_register(self, reg: Register) -> Test<RegisterOperand> {
            Test::<RegisterOperand> {
                dest_reg: self.dest_reg,
                source_reg: Some(reg),
                immediate: None,
                size: self.size,
                _pd: PhantomData {},
            }
        }

        pub fn with_immediate(self, imm: Immediate) -> Test<ImmediateOperand> {
            Test::<ImmediateOperand> {
                dest_reg: self.dest_reg,
                source_reg: None,
                immediate: Some(imm),
                size: self.size,
                _pd: PhantomData {},
            }
        }
    }

    impl Test<RegisterOperand> {
        pub fn generate(self) -> OpCode {
            let source_reg = self.source_reg.expect("Test should contain a source register");
            let opcode = if self.size == OpSize::Byte { 0x84 } else { 0x85 };
            encode_modrm(
                self.size,
                self.size == OpSize::Byte,
                &[opcode],
                RegField::Register(source_reg),
                Rm::Register(self.dest_reg),
                &[],
            )
        }
    }

    impl Test<ImmediateOperand> {
        pub fn generate(self) -> OpCode {
            let imm = self.immediate.expect("Test should contain an immediate value");
            let opcode = if self.size == OpSize::Byte { 0xF6 } else { 0xF7 };
            encode_modrm(
                self.size,
                self.size == OpSize::Byte,
                &[opcode],
                RegField::Extension(0),
                Rm::Register(self.dest_reg),
                &imm.encode(self.size.immediate_width()),
            )
        }
    }
}

pub use test_op::Test;

pub mod shift {
    use super::*;

    /// The `/digit` used by the x86 shift group
    #[repr(u8)]
    pub enum Operation {
        Rol = 0,
        Ror = 1,
        Rcl = 2,
        Rcr = 3,
        Shl = 4,
        Shr = 5,
        Sar = 7,
    }

    /// Shifts and rotates of a register by a constant amount
    pub struct ShiftOp<const OP: u8> {
        dest_reg: Register,
        amount: u8,
        size: OpSize,
    }

    impl<const OP: u8> ShiftOp<OP> {
        pub fn new(dest_reg: Register, amount: u8) -> Self {
            assert!(amount > 0, "Shifting by 0 leaves the flags untouched");
            Self {
                dest_reg,
                amount,
                size: OpSize::Qword,
            }
        }

        pub fn with_op_size(mut self, size: OpSize) -> Self {
            self.size = size;
            self
        }

        pub fn generate(self) -> OpCode {
            let byte = self.size == OpSize::Byte;
            let (opcode, immediate) = match (self.amount, byte) {
                (1, true) => (0xD0, vec![]),
                (1, false) => (0xD1, vec![]),
                (amount, true) => (0xC0, vec![amount]),
                (amount, false) => (0xC1, vec![amount]),
            };
            encode_modrm(
                self.size,
                byte,
                &[opcode],
                RegField::Extension(OP),
                Rm::Register(self.dest_reg),
                &immediate,
            )
        }
    }

    /// ```
    ///     use gb_jit::x86_asm::{Ror, Register, OpSize};
    ///     let opcode = Ror::new(Register::Rbx, 8).with_op_size(OpSize::Word).generate();
    /// ```
    pub type Rol = ShiftOp<{ Operation::Rol as u8 }>;
    pub type Ror = ShiftOp<{ Operation::Ror as u8 }>;
    /// Rotate left through the host carry flag
    pub type Rcl = ShiftOp<{ Operation::Rcl as u8 }>;
    /// Rotate right through the host carry flag
    pub type Rcr = ShiftOp<{ Operation::Rcr as u8 }>;
    pub type Shl = ShiftOp<{ Operation::Shl as u8 }>;
    pub type Shr = ShiftOp<{ Operation::Shr as u8 }>;
    pub type Sar = ShiftOp<{ Operation::Sar as u8 }>;
}

pub use shift::{Rcl, Rcr, Rol, Ror, Sar, Shl, Shr};

mod bit_test {
    use super::*;

    /// `bt r32, imm8`: copies the selected bit of the register into the host carry flag
    pub struct Bt {
        reg: Register,
        bit: u8,
    }

    impl Bt {
        pub fn new(reg: Register, bit: u8) -> Self {
            assert!(bit < 32);
            Self { reg, bit }
        }

        pub fn generate(self) -> OpCode {
            encode_modrm(
                OpSize::Dword,
                false,
                &[0x0F, 0xBA],
                RegField::Extension(4),
                Rm::Register(self.reg),
                &[self.bit],
            )
        }
    }
}

pub use bit_test::Bt;

mod branch {
    use super::*;

    /// Width of the relative displacement of a branch
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum DisplacementWidth {
        Rel8,
        Rel32,
    }

    impl DisplacementWidth {
        pub fn bytes(self) -> usize {
            match self {
                DisplacementWidth::Rel8 => 1,
                DisplacementWidth::Rel32 => 4,
            }
        }
    }

    /// `jmp` and `jcc` with a displacement relative to the end of the instruction. The
    /// displacement is always the last field of the encoding, which is what allows patching it
    /// once the target is known.
    /// ```
    ///     use gb_jit::x86_asm::{Branch, Condition};
    ///     let opcode = Branch::new()
    ///         .with_condition(Condition::NotEqual)
    ///         .short()
    ///         .with_displacement(-2)
    ///         .generate();
    /// ```
    pub struct Branch {
        condition: Option<Condition>,
        width: DisplacementWidth,
        displacement: i32,
    }

    impl Branch {
        pub fn new() -> Self {
            Self {
                condition: None,
                width: DisplacementWidth::Rel32,
                displacement: 0,
            }
        }

        /// Only branch if the condition holds
        pub fn with_condition(mut self, condition: Condition) -> Self {
            self.condition = Some(condition);
            self
        }

        /// Uses an 8 bit displacement
        pub fn short(mut self) -> Self {
            self.width = DisplacementWidth::Rel8;
            self
        }

        pub fn with_displacement(mut self, displacement: i32) -> Self {
            self.displacement = displacement;
            self
        }

        pub fn displacement_width(&self) -> DisplacementWidth {
            self.width
        }

        pub fn generate(self) -> OpCode {
            let mut bytes = match (self.condition, self.width) {
                (None, DisplacementWidth::Rel8) => vec![0xEB],
                (None, DisplacementWidth::Rel32) => vec![0xE9],
                (Some(cond), DisplacementWidth::Rel8) => vec![0x70 | cond as u8],
                (Some(cond), DisplacementWidth::Rel32) => vec![0x0F, 0x80 | cond as u8],
            };
            match self.width {
                DisplacementWidth::Rel8 => {
                    let disp = i8::try_from(self.displacement)
                        .expect("Displacement out of range for a short branch");
                    bytes.push(disp as u8);
                }
                DisplacementWidth::Rel32 => {
                    bytes.extend_from_slice(&self.displacement.to_le_bytes())
                }
            }
            OpCode(bytes)
        }
    }

    /// Indirect `call`, through a register or a memory slot holding the target address
    pub struct Call {
        target: Option<Rm>,
    }

    impl Call {
        pub fn new() -> Self {
            Self { target: None }
        }

        pub fn with_register(mut self, reg: Register) -> Self {
            self.target = Some(Rm::Register(reg));
            self
        }

        pub fn with_memory(mut self, memory: Memory) -> Self {
            self.target = Some(Rm::Memory(memory));
            self
        }

        pub fn generate(self) -> OpCode {
            let target = self.target.expect("Call should contain a target");
            encode_modrm(
                OpSize::Dword,
                false,
                &[0xFF],
                RegField::Extension(2),
                target,
                &[],
            )
        }
    }
}

pub use branch::{Branch, Call, DisplacementWidth};
