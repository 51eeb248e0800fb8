//! zln VM: a register-based virtual machine for zlang bytecode images.

pub mod callstack;
pub mod emit;
pub mod error;
pub mod heap;
pub mod memory;
pub mod opcode;
pub mod program;
pub mod register;
pub mod types;
pub mod vm;

pub use error::{TraceFrame, VmError};
pub use memory::{Addr, MemoryLayout};
pub use opcode::{Instruction, OpCode};
pub use program::{execute_program, LoadedProgram, ProgramHeader};
pub use register::Register;
pub use types::Type;
pub use vm::{execute, BuiltInFunction, DebugStep, RuntimeConfig};
