mod instruction;
mod processor;
mod register;

pub use instruction::{Instruction, Opcode, TrapVector, TrapVectorError};
pub use processor::{Processor, ProcessorError, Step};
pub use register::{CondFlag, Register, RegisterFile, NUM_GENERAL};
