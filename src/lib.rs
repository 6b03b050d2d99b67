pub mod alu;
pub mod block;
pub mod board;
pub mod cache;
pub mod control;
pub mod cpu;
pub mod decoder;
pub mod descriptor;
pub mod disasm;
pub mod exception;
pub mod exec;
pub mod instructions;
pub mod interrupt;
pub mod io;
pub mod memory;
pub mod mmu;
pub mod operand;
pub mod regs;
pub mod segment;
pub mod string;
pub mod system;
pub mod tss;

pub mod isa {
    pub mod i386; // one-byte opcode map
    pub mod i386_0f;
    pub mod modrm;
    pub mod x87;
}

pub use board::Board;
pub use cpu::{Cpu, CpuConfig, CpuType, Trap};
pub use exception::{CpuException, Vector};
pub use exec::IntExecutor;
pub use interrupt::EventKind;
pub use isa::i386::I386Decoder;
pub use memory::{Bus, Ram};
