//! Synthesis of the guest Z and C flags from the host flags.
//!
//! ShadowFlags keeps guest Z and C in host flag layout, so merging is a couple of masks and
//! reloading the host flags is a `push; popfq`. Emission happens in two phases: `emit_capture`
//! right after the flag-defining host instruction, and `emit_commit` once the result has been
//! written back.

use crate::block::OpCodeStream;
use crate::registers::{FLAGS_CAPTURE, FLAGS_SCRATCH, SHADOW_FLAGS};
use crate::x86_asm::{
    And, Bt, Immediate, Mov, OpSize, Or, Pop, Popf, Push, Pushf, Register, Shl, Shr, Test, Xor,
};

pub const HOST_ZERO: u32 = 0x40;
pub const HOST_CARRY: u32 = 0x01;
pub const GUEST_ZERO: u32 = 0x80;
pub const GUEST_CARRY: u32 = 0x10;

/// How the guest flags are derived from the captured host flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagRule {
    /// Z and C both from the result
    ZeroAndCarry,
    /// Z from the result, C preserved
    ZeroKeepCarry,
    /// C from the result, Z preserved
    CarryKeepZero,
    /// C from the result, Z cleared
    CarryClearZero,
}

/// Whether the host flags currently mirror ShadowFlags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFlags {
    Synced,
    Clobbered,
}

fn and_immediate(stream: &mut OpCodeStream, reg: Register, mask: u32) {
    stream.push_opcode(
        And::new(reg)
            .with_immediate(Immediate::new(mask as i64))
            .with_op_size(OpSize::Dword)
            .generate(),
    );
}

/// Copies the host flags into the capture register
pub fn emit_capture(stream: &mut OpCodeStream) {
    stream.push_opcode(Pushf::new().generate());
    stream.push_opcode(Pop::new(FLAGS_CAPTURE).generate());
}

/// Merges the captured flags into ShadowFlags and reloads the host flags from it
pub fn emit_commit(stream: &mut OpCodeStream, rule: FlagRule) {
    let (fresh, kept) = match rule {
        FlagRule::ZeroAndCarry => (HOST_ZERO | HOST_CARRY, None),
        FlagRule::ZeroKeepCarry => (HOST_ZERO, Some(HOST_CARRY)),
        FlagRule::CarryKeepZero => (HOST_CARRY, Some(HOST_ZERO)),
        FlagRule::CarryClearZero => (HOST_CARRY, None),
    };

    and_immediate(stream, FLAGS_CAPTURE, fresh);
    match kept {
        Some(kept) => {
            and_immediate(stream, SHADOW_FLAGS, kept);
            stream.push_opcode(
                Or::new(SHADOW_FLAGS)
                    .with_register(FLAGS_CAPTURE)
                    .with_op_size(OpSize::Dword)
                    .generate(),
            );
        }
        None => {
            stream.push_opcode(
                Mov::new(SHADOW_FLAGS)
                    .with_register(FLAGS_CAPTURE)
                    .with_op_size(OpSize::Dword)
                    .generate(),
            );
        }
    }
    emit_sync(stream);
}

/// Capture + commit, for results that need no write-back in between
pub fn emit_update(stream: &mut OpCodeStream, rule: FlagRule) {
    emit_capture(stream);
    emit_commit(stream, rule);
}

/// Replaces the zero bit of the capture with a zero test of `result`. Rotates only define the
/// host carry.
pub fn emit_capture_zero_of(stream: &mut OpCodeStream, result: Register) {
    stream.push_opcode(
        Test::new(result)
            .with_register(result)
            .with_op_size(OpSize::Byte)
            .generate(),
    );
    stream.push_opcode(Pushf::new().generate());
    stream.push_opcode(Pop::new(FLAGS_SCRATCH).generate());
    and_immediate(stream, FLAGS_SCRATCH, HOST_ZERO);
    and_immediate(stream, FLAGS_CAPTURE, HOST_CARRY);
    stream.push_opcode(
        Or::new(FLAGS_CAPTURE)
            .with_register(FLAGS_SCRATCH)
            .with_op_size(OpSize::Dword)
            .generate(),
    );
}

/// Reloads the host flags from ShadowFlags
pub fn emit_sync(stream: &mut OpCodeStream) {
    stream.push_opcode(Push::new(SHADOW_FLAGS).generate());
    stream.push_opcode(Popf::new().generate());
}

/// Moves the guest carry into the host carry, for ADC, SBC and rotates through carry
pub fn emit_load_carry(stream: &mut OpCodeStream) {
    stream.push_opcode(Bt::new(SHADOW_FLAGS, 0).generate());
}

/// SCF
pub fn emit_set_carry(stream: &mut OpCodeStream) {
    stream.push_opcode(
        Or::new(SHADOW_FLAGS)
            .with_immediate(Immediate::new(HOST_CARRY as i64))
            .with_op_size(OpSize::Dword)
            .generate(),
    );
    emit_sync(stream);
}

/// CCF
pub fn emit_complement_carry(stream: &mut OpCodeStream) {
    stream.push_opcode(
        Xor::new(SHADOW_FLAGS)
            .with_immediate(Immediate::new(HOST_CARRY as i64))
            .with_op_size(OpSize::Dword)
            .generate(),
    );
    emit_sync(stream);
}

/// Clears both guest flags
pub fn emit_clear(stream: &mut OpCodeStream) {
    stream.push_opcode(
        Xor::new(SHADOW_FLAGS)
            .with_register(SHADOW_FLAGS)
            .with_op_size(OpSize::Dword)
            .generate(),
    );
    emit_sync(stream);
}

/// Converts a guest F value in `src` into ShadowFlags. Clobbers `src` and `scratch`.
pub fn emit_guest_to_shadow(stream: &mut OpCodeStream, src: Register, scratch: Register) {
    stream.push_opcode(
        Mov::new(scratch)
            .with_register(src)
            .with_op_size(OpSize::Dword)
            .generate(),
    );
    // Z: 0x80 -> 0x40
    stream.push_opcode(Shr::new(scratch, 1).with_op_size(OpSize::Dword).generate());
    and_immediate(stream, scratch, HOST_ZERO);
    // C: 0x10 -> 0x01
    stream.push_opcode(Shr::new(src, 4).with_op_size(OpSize::Dword).generate());
    and_immediate(stream, src, HOST_CARRY);
    stream.push_opcode(
        Or::new(src)
            .with_register(scratch)
            .with_op_size(OpSize::Dword)
            .generate(),
    );
    stream.push_opcode(
        Mov::new(SHADOW_FLAGS)
            .with_register(src)
            .with_op_size(OpSize::Dword)
            .generate(),
    );
}

/// Converts ShadowFlags into a guest F value in `dst`. Clobbers `scratch`.
pub fn emit_shadow_to_guest(stream: &mut OpCodeStream, dst: Register, scratch: Register) {
    stream.push_opcode(
        Mov::new(dst)
            .with_register(SHADOW_FLAGS)
            .with_op_size(OpSize::Dword)
            .generate(),
    );
    and_immediate(stream, dst, HOST_ZERO);
    stream.push_opcode(Shl::new(dst, 1).with_op_size(OpSize::Dword).generate());
    stream.push_opcode(
        Mov::new(scratch)
            .with_register(SHADOW_FLAGS)
            .with_op_size(OpSize::Dword)
            .generate(),
    );
    and_immediate(stream, scratch, HOST_CARRY);
    stream.push_opcode(Shl::new(scratch, 4).with_op_size(OpSize::Dword).generate());
    stream.push_opcode(
        Or::new(dst)
            .with_register(scratch)
            .with_op_size(OpSize::Dword)
            .generate(),
    );
}
