pub mod block;
pub mod compiled_block;
pub mod config;
pub mod dynamic_compiler;
pub mod flags;
pub mod interop;
pub mod memory;
pub mod memory_access;
pub mod registers;
pub mod sm83;
pub mod stack;
pub mod virtual_machine;
pub mod x86_asm;

#[cfg(test)]
mod testing;
