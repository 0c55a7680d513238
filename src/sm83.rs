pub mod opcode;
pub mod operands;

use opcode::{Cycles, Operation};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// The byte is not a valid SM83 opcode
    UnknownOpCode(u8),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Instruction {
    pub operation: Operation,
    /// Encoded length in bytes, including the prefix
    pub size: u8,
}

impl Instruction {
    pub fn cycles(&self) -> Cycles {
        self.operation.cycles()
    }
}

#[derive(Clone, Copy)]
enum State {
    DecodeOpCode,
    DecodePrefixed,
    DecodeOperand {
        opcode: u8,
        remaining: usize,
        value: u16,
        shift: u32,
    },
}

/// Byte-fed SM83 decoder. Returns an instruction once its last byte has been fed.
pub struct InstrDecoder {
    state: State,
}

impl InstrDecoder {
    pub fn new() -> Self {
        Self {
            state: State::DecodeOpCode,
        }
    }

    /// True while the decoder is in the middle of an instruction
    pub fn is_pending(&self) -> bool {
        !matches!(self.state, State::DecodeOpCode)
    }

    pub fn feed(&mut self, byte: u8) -> Result<Option<Instruction>, Error> {
        match self.state {
            State::DecodeOpCode if byte == opcode::PREFIX => {
                self.state = State::DecodePrefixed;
                Ok(None)
            }
            State::DecodeOpCode => match opcode::operand_size(byte) {
                None => Err(Error::UnknownOpCode(byte)),
                Some(0) => Ok(Some(Instruction {
                    operation: opcode::decode(byte, 0),
                    size: 1,
                })),
                Some(remaining) => {
                    self.state = State::DecodeOperand {
                        opcode: byte,
                        remaining,
                        value: 0,
                        shift: 0,
                    };
                    Ok(None)
                }
            },
            State::DecodePrefixed => {
                self.state = State::DecodeOpCode;
                Ok(Some(Instruction {
                    operation: opcode::decode_prefixed(byte),
                    size: 2,
                }))
            }
            State::DecodeOperand {
                opcode,
                remaining,
                value,
                shift,
            } => {
                let value = value | ((byte as u16) << shift);
                if remaining == 1 {
                    self.state = State::DecodeOpCode;
                    let size = 1 + opcode::operand_size(opcode).unwrap_or(0) as u8;
                    Ok(Some(Instruction {
                        operation: opcode::decode(opcode, value),
                        size,
                    }))
                } else {
                    self.state = State::DecodeOperand {
                        opcode,
                        remaining: remaining - 1,
                        value,
                        shift: shift + 8,
                    };
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::sm83::opcode::Operation;
    use crate::sm83::operands::{Condition, Operand8, Reg8, ShiftOp};
    use crate::sm83::{Error, InstrDecoder, Instruction};

    #[test]
    fn decode_call_absolute_instruction() {
        let mut decoder = InstrDecoder::new();
        assert_eq!(decoder.feed(0xCD).unwrap(), None);
        assert_eq!(decoder.feed(0xaf).unwrap(), None);
        assert!(decoder.is_pending());
        assert_eq!(
            decoder.feed(0x5d).unwrap(),
            Some(Instruction {
                operation: Operation::Call(None, 0x5daf),
                size: 3
            })
        );
        assert!(!decoder.is_pending());
    }

    #[test]
    fn decode_nop_instruction() {
        let mut decoder = InstrDecoder::new();
        assert_eq!(
            decoder.feed(0x00).unwrap(),
            Some(Instruction {
                operation: Operation::Nop,
                size: 1
            })
        );
    }

    #[test]
    fn decode_jr_relative_instruction() {
        let mut decoder = InstrDecoder::new();
        assert_eq!(decoder.feed(0x20).unwrap(), None);
        assert_eq!(
            decoder.feed(0x05).unwrap(),
            Some(Instruction {
                operation: Operation::JumpRelative(Some(Condition::NotZero), 5),
                size: 2
            })
        );
    }

    #[test]
    fn decode_prefixed_instruction() {
        let mut decoder = InstrDecoder::new();
        assert_eq!(decoder.feed(0xCB).unwrap(), None);
        assert_eq!(
            decoder.feed(0x11).unwrap(),
            Some(Instruction {
                operation: Operation::Shift(ShiftOp::Rl, Operand8::Register(Reg8::C)),
                size: 2
            })
        );
    }

    #[test]
    fn decode_unknown_opcode() {
        let mut decoder = InstrDecoder::new();
        assert_eq!(decoder.feed(0xDD), Err(Error::UnknownOpCode(0xDD)));
    }
}
