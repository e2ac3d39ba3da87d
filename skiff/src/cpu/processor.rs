use core::fmt;

use tracing::warn;

use crate::device::Console;
use crate::mem::{MemoryError, MemoryStore, Segment};
use crate::os::{Kernel, KernelError};

use super::instruction::{Instruction, Opcode, TrapVector, TrapVectorError};
use super::register::{Register, RegisterFile};

/// Provides terminal error conditions for the processor.
///
/// Protection faults never appear here — they are consumed inside
/// [`Processor::step`], which reports them and moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorError {
    Trap(TrapVectorError),
    Kernel(KernelError),
    Memory(MemoryError),
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trap(e) => write!(f, "{e}"),
            Self::Kernel(e) => write!(f, "{e}"),
            Self::Memory(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProcessorError {}

impl From<TrapVectorError> for ProcessorError {
    fn from(value: TrapVectorError) -> Self {
        Self::Trap(value)
    }
}

impl From<KernelError> for ProcessorError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<MemoryError> for ProcessorError {
    fn from(value: MemoryError) -> Self {
        Self::Memory(value)
    }
}

/// Outcome of a single fetch-decode-execute step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Halted,
}

/// The machine: register file, memory store, kernel, and console, driven
/// one instruction at a time. All program-visible memory traffic runs
/// through the segmentation check against the active process's windows.
pub struct Processor<C: Console> {
    store: MemoryStore,
    regs: RegisterFile,
    kernel: Kernel,
    console: C,
}

impl<C: Console> Processor<C> {
    pub fn new(console: C) -> Result<Self, ProcessorError> {
        let mut store = MemoryStore::new();
        let kernel = Kernel::new();
        kernel.init(&mut store)?;
        Ok(Self {
            store,
            regs: RegisterFile::default(),
            kernel,
            console,
        })
    }

    /// Creates a process from its code and heap images.
    pub fn create_process(&mut self, code: &[u16], heap: &[u16]) -> Result<u16, KernelError> {
        self.kernel.create_process(&mut self.store, code, heap)
    }

    /// Hands the instruction stream to `pid`.
    pub fn switch_to(&mut self, pid: u16) -> Result<(), KernelError> {
        self.kernel.switch_to(pid, &mut self.regs)
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    /// Executes instructions until no runnable process remains.
    pub fn run(&mut self) -> Result<(), ProcessorError> {
        while self.step()? != Step::Halted {}
        Ok(())
    }

    /// One fetch-decode-execute cycle. A protection fault abandons the
    /// instruction with a diagnostic; the already-incremented program
    /// counter carries execution on to the next one.
    pub fn step(&mut self) -> Result<Step, ProcessorError> {
        let pc = self.regs.get(Register::ProgramCounter);
        self.regs.set(Register::ProgramCounter, pc.wrapping_add(1));
        match self.exec(pc) {
            Err(ProcessorError::Memory(e)) => {
                warn!("{}", e);
                Ok(Step::Continue)
            }
            other => other,
        }
    }

    fn exec(&mut self, pc: u16) -> Result<Step, ProcessorError> {
        let inst = Instruction::from(self.mem_read(pc)?);

        match inst.opcode() {
            Opcode::Br => {
                if self.regs.get(Register::Condition) & inst.condition_mask() != 0 {
                    let target = self.pc_relative(inst.offset9());
                    self.regs.set(Register::ProgramCounter, target);
                }
            }
            Opcode::Add => {
                let value = self.regs.get(inst.sr1()).wrapping_add(self.operand(inst));
                self.regs.set(inst.dr(), value);
                self.regs.update_condition(inst.dr());
            }
            Opcode::And => {
                let value = self.regs.get(inst.sr1()) & self.operand(inst);
                self.regs.set(inst.dr(), value);
                self.regs.update_condition(inst.dr());
            }
            Opcode::Not => {
                let value = !self.regs.get(inst.sr1());
                self.regs.set(inst.dr(), value);
                self.regs.update_condition(inst.dr());
            }
            Opcode::Ld => {
                let value = self.mem_read(self.pc_relative(inst.offset9()))?;
                self.regs.set(inst.dr(), value);
                self.regs.update_condition(inst.dr());
            }
            Opcode::Ldi => {
                let ptr = self.mem_read(self.pc_relative(inst.offset9()))?;
                let value = self.mem_read(ptr)?;
                self.regs.set(inst.dr(), value);
                self.regs.update_condition(inst.dr());
            }
            Opcode::Ldr => {
                let addr = self.regs.get(inst.sr1()).wrapping_add(inst.offset6());
                let value = self.mem_read(addr)?;
                self.regs.set(inst.dr(), value);
                self.regs.update_condition(inst.dr());
            }
            Opcode::Lea => {
                let value = self.pc_relative(inst.offset9());
                self.regs.set(inst.dr(), value);
                self.regs.update_condition(inst.dr());
            }
            Opcode::St => {
                self.mem_write(self.pc_relative(inst.offset9()), self.regs.get(inst.dr()))?;
            }
            Opcode::Sti => {
                let ptr = self.mem_read(self.pc_relative(inst.offset9()))?;
                self.mem_write(ptr, self.regs.get(inst.dr()))?;
            }
            Opcode::Str => {
                let addr = self.regs.get(inst.sr1()).wrapping_add(inst.offset6());
                self.mem_write(addr, self.regs.get(inst.dr()))?;
            }
            Opcode::Jmp => {
                self.regs
                    .set(Register::ProgramCounter, self.regs.get(inst.base()));
            }
            Opcode::Jsr => {
                let return_to = self.regs.get(Register::ProgramCounter);
                self.regs.set(Register::General(7), return_to);
                let target = if inst.long_flag() {
                    self.pc_relative(inst.offset11())
                } else {
                    self.regs.get(inst.base())
                };
                self.regs.set(Register::ProgramCounter, target);
            }
            // Reserved encodings.
            Opcode::Rti | Opcode::Res => {}
            Opcode::Trap => return self.trap(inst.trap_vector()),
        }

        Ok(Step::Continue)
    }

    fn trap(&mut self, vector: u8) -> Result<Step, ProcessorError> {
        match TrapVector::try_from(vector)? {
            TrapVector::Getc => {
                let ch = self.console.get_char().map(u16::from).unwrap_or(0);
                self.regs.set(Register::General(0), ch);
            }
            TrapVector::Out => {
                let ch = self.regs.get(Register::General(0)) as u8;
                self.console.put_char(ch);
            }
            TrapVector::Puts => {
                let mut addr = self.regs.get(Register::General(0));
                loop {
                    let word = self.mem_read(addr)?;
                    if word == 0 {
                        break;
                    }
                    self.console.put_char(word as u8);
                    addr = addr.wrapping_add(1);
                }
            }
            TrapVector::In => {
                let ch = self.console.get_char().unwrap_or(0);
                self.console.put_char(ch);
                self.regs.set(Register::General(0), u16::from(ch));
            }
            TrapVector::Putsp => {
                let mut addr = self.regs.get(Register::General(0));
                loop {
                    let word = self.mem_read(addr)?;
                    if word == 0 {
                        break;
                    }
                    self.console.put_char(word as u8);
                    let high = (word >> 8) as u8;
                    if high != 0 {
                        self.console.put_char(high);
                    }
                    addr = addr.wrapping_add(1);
                }
            }
            TrapVector::Halt => {
                let next = self.kernel.sys_halt(&mut self.store, &mut self.regs)?;
                return Ok(match next {
                    Some(_) => Step::Continue,
                    None => Step::Halted,
                });
            }
            TrapVector::InU16 => {
                let value = self.console.get_word().unwrap_or(0);
                self.regs.set(Register::General(0), value);
            }
            TrapVector::OutU16 => {
                self.console.put_word(self.regs.get(Register::General(0)));
            }
            TrapVector::Yield => {
                self.kernel.sys_yield(&mut self.regs)?;
            }
            TrapVector::Break => {
                self.kernel.sys_break(&mut self.store, &mut self.regs)?;
            }
        }

        Ok(Step::Continue)
    }

    /// Second ALU operand: imm5 or the sr2 register.
    fn operand(&self, inst: Instruction) -> u16 {
        if inst.imm_flag() {
            inst.imm5()
        } else {
            self.regs.get(inst.sr2())
        }
    }

    fn pc_relative(&self, offset: u16) -> u16 {
        self.regs
            .get(Register::ProgramCounter)
            .wrapping_add(offset)
    }

    /// Reads a program-visible word through the segmentation unit.
    fn mem_read(&self, addr: u16) -> Result<u16, ProcessorError> {
        let (segment, offset) = Segment::decode(addr)?;
        let index = self.regs.window(segment).resolve(segment, offset)?;
        Ok(self.store.get(index)?)
    }

    /// Writes a program-visible word through the segmentation unit.
    fn mem_write(&mut self, addr: u16, value: u16) -> Result<(), ProcessorError> {
        let (segment, offset) = Segment::decode(addr)?;
        let index = self.regs.window(segment).resolve(segment, offset)?;
        Ok(self.store.set(index, value)?)
    }
}
