pub mod alloc;
pub mod process;

use core::fmt;

use tracing::{info, warn};

use crate::cpu::{Register, RegisterFile};
use crate::mem::{MemoryError, MemoryStore, Segment, SegmentWindow};

use self::alloc::{AllocError, Allocator};
use self::process::{
    ProcessError, ProcessRecord, ProcessState, ProcessTable, CODE_SIZE, HEAP_INIT_SIZE,
};

/// Virtual address of the first code word; every process begins here.
pub const PC_START: u16 = Segment::Code.origin();

/// Provides error conditions for kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Process(ProcessError),
    Alloc(AllocError),
    Memory(MemoryError),
    OversizedImage { words: usize, limit: u16 },
    NoCurrentProcess,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(e) => write!(f, "{e}"),
            Self::Alloc(e) => write!(f, "{e}"),
            Self::Memory(e) => write!(f, "{e}"),
            Self::OversizedImage { words, limit } => {
                write!(f, "image of {words} words exceeds the segment size {limit}")
            }
            Self::NoCurrentProcess => write!(f, "no process is currently running"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<ProcessError> for KernelError {
    fn from(value: ProcessError) -> Self {
        Self::Process(value)
    }
}

impl From<AllocError> for KernelError {
    fn from(value: AllocError) -> Self {
        Self::Alloc(value)
    }
}

impl From<MemoryError> for KernelError {
    fn from(value: MemoryError) -> Self {
        Self::Memory(value)
    }
}

/// Owns every piece of operating-system state: the process table, the
/// arena allocator, and the identity of the running process. The CPU loop
/// reaches it only through process creation, `switch_to`, and the three
/// system calls.
pub struct Kernel {
    table: ProcessTable,
    allocator: Allocator,
    current: Option<u16>,
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            table: ProcessTable::new(),
            allocator: Allocator::new(),
            current: None,
        }
    }

    /// One-time OS initialization: lays down the arena free list.
    pub fn init(&self, store: &mut MemoryStore) -> Result<(), KernelError> {
        self.allocator.init(store)?;
        Ok(())
    }

    /// The running process, if any.
    pub fn current(&self) -> Option<u16> {
        self.current
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Creates a process: allocates its code and heap segments, loads the
    /// two images, and populates a record. The process does not run until
    /// it is switched in.
    pub fn create_process(
        &mut self,
        store: &mut MemoryStore,
        code_image: &[u16],
        heap_image: &[u16],
    ) -> Result<u16, KernelError> {
        if self.table.is_full() {
            return Err(ProcessError::TableFull.into());
        }
        if code_image.len() > CODE_SIZE as usize {
            return Err(KernelError::OversizedImage {
                words: code_image.len(),
                limit: CODE_SIZE,
            });
        }
        if heap_image.len() > HEAP_INIT_SIZE as usize {
            return Err(KernelError::OversizedImage {
                words: heap_image.len(),
                limit: HEAP_INIT_SIZE,
            });
        }

        let code_base = self.allocator.allocate(store, CODE_SIZE)?;
        let heap_base = match self.allocator.allocate(store, HEAP_INIT_SIZE) {
            Ok(base) => base,
            Err(e) => {
                // Release the code segment so a failed creation leaves the
                // arena as it was.
                self.allocator.free(store, code_base)?;
                return Err(e.into());
            }
        };

        store.load(code_base as usize, code_image)?;
        store.load(heap_base as usize, heap_image)?;

        let pid = self.table.push(ProcessRecord {
            pid: 0,
            pc: PC_START,
            code: SegmentWindow::new(code_base, CODE_SIZE),
            heap: SegmentWindow::new(heap_base, HEAP_INIT_SIZE),
            state: ProcessState::Ready,
        })?;
        Ok(pid)
    }

    /// Loads `pid`'s saved context into the live registers and makes it
    /// the running process. This is the only way control is handed to a
    /// different process's instruction stream.
    pub fn switch_to(&mut self, pid: u16, regs: &mut RegisterFile) -> Result<(), KernelError> {
        if let Some(previous) = self.current {
            let record = self.table.get_mut(previous)?;
            if record.state == ProcessState::Running {
                record.state = ProcessState::Ready;
            }
        }

        let record = self.table.get_mut(pid)?;
        record.state = ProcessState::Running;
        regs.set(Register::ProgramCounter, record.pc);
        regs.set_window(Segment::Code, record.code);
        regs.set_window(Segment::Heap, record.heap);
        self.current = Some(pid);
        Ok(())
    }

    /// Cooperative yield: saves the live context and switches to the next
    /// runnable process. A no-op when no other process is runnable.
    pub fn sys_yield(&mut self, regs: &mut RegisterFile) -> Result<(), KernelError> {
        let current = self.require_current()?;
        if let Some(next) = self.table.next_runnable(current) {
            self.save_current(regs)?;
            info!("switching from process {} to {}", current, next);
            self.switch_to(next, regs)?;
        }
        Ok(())
    }

    /// Terminates the running process: its segments go back to the
    /// allocator, its record is retired, and the next runnable process is
    /// switched in. Returns `None` when no runnable process remains and
    /// the machine should stop.
    pub fn sys_halt(
        &mut self,
        store: &mut MemoryStore,
        regs: &mut RegisterFile,
    ) -> Result<Option<u16>, KernelError> {
        let current = self.require_current()?;
        let (code_base, heap_base) = {
            let record = self.table.get(current)?;
            (record.code.base, record.heap.base)
        };

        if let Err(e) = self.allocator.free(store, heap_base) {
            warn!("halt: releasing the heap of process {}: {}", current, e);
        }
        if let Err(e) = self.allocator.free(store, code_base) {
            warn!("halt: releasing the code of process {}: {}", current, e);
        }
        self.table.get_mut(current)?.state = ProcessState::Terminated;

        match self.table.next_runnable(current) {
            Some(next) => {
                info!("process {} halted; switching to {}", current, next);
                self.switch_to(next, regs)?;
                Ok(Some(next))
            }
            None => {
                info!("process {} halted; no runnable process remains", current);
                self.current = None;
                Ok(None)
            }
        }
    }

    /// Resizes the running process's heap to the bound requested in R0.
    /// A rejected resize is reported and leaves the heap unchanged;
    /// execution continues either way.
    pub fn sys_break(
        &mut self,
        store: &mut MemoryStore,
        regs: &mut RegisterFile,
    ) -> Result<(), KernelError> {
        let current = self.require_current()?;
        let new_bound = regs.get(Register::General(0));
        let heap = regs.window(Segment::Heap);

        match self
            .allocator
            .resize(store, heap.base, heap.bound, new_bound)
        {
            Ok(()) => {
                regs.set_window(Segment::Heap, SegmentWindow::new(heap.base, new_bound));
                self.table.get_mut(current)?.heap.bound = new_bound;
                Ok(())
            }
            Err(e) => {
                warn!("cannot resize the heap of process {}: {}", current, e);
                Ok(())
            }
        }
    }

    /// Copies the live context into the running process's record.
    fn save_current(&mut self, regs: &RegisterFile) -> Result<(), KernelError> {
        let current = self.require_current()?;
        let record = self.table.get_mut(current)?;
        record.pc = regs.get(Register::ProgramCounter);
        record.code = regs.window(Segment::Code);
        record.heap = regs.window(Segment::Heap);
        Ok(())
    }

    fn require_current(&self) -> Result<u16, KernelError> {
        self.current.ok_or(KernelError::NoCurrentProcess)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CondFlag;

    fn kernel() -> (Kernel, MemoryStore) {
        let kernel = Kernel::new();
        let mut store = MemoryStore::new();
        kernel.init(&mut store).unwrap();
        (kernel, store)
    }

    /// Test that created processes receive disjoint segments
    #[test]
    fn test_create_disjoint_segments() {
        let (mut kernel, mut store) = kernel();
        let p0 = kernel.create_process(&mut store, &[], &[]).unwrap();
        let p1 = kernel.create_process(&mut store, &[], &[]).unwrap();

        let mut windows: Vec<SegmentWindow> = Vec::new();
        for pid in [p0, p1] {
            let record = kernel.table().get(pid).unwrap();
            windows.push(record.code);
            windows.push(record.heap);
        }
        for (i, a) in windows.iter().enumerate() {
            for b in windows.iter().skip(i + 1) {
                let a_end = a.base as u32 + a.bound as u32;
                let b_end = b.base as u32 + b.bound as u32;
                assert!(a_end <= b.base as u32 || b_end <= a.base as u32);
            }
        }
    }

    /// Test that images land at the segment bases
    #[test]
    fn test_create_loads_images() {
        let (mut kernel, mut store) = kernel();
        let pid = kernel
            .create_process(&mut store, &[0xAB, 0xCD], &[0x11])
            .unwrap();

        let record = *kernel.table().get(pid).unwrap();
        assert_eq!(store.get(record.code.base as usize), Ok(0xAB));
        assert_eq!(store.get(record.code.base as usize + 1), Ok(0xCD));
        assert_eq!(store.get(record.heap.base as usize), Ok(0x11));
    }

    /// Test that a failed heap allocation rolls the code segment back
    #[test]
    fn test_create_rolls_back_on_exhaustion() {
        let (mut kernel, mut store) = kernel();
        // Leave room for one code segment but not the heap behind it.
        for _ in 0..6 {
            kernel.create_process(&mut store, &[], &[]).unwrap();
        }
        kernel.allocator().allocate(&mut store, 5000).unwrap();
        let free_before = kernel.allocator().free_words(&store).unwrap();

        let result = kernel.create_process(&mut store, &[], &[]);
        assert!(matches!(
            result,
            Err(KernelError::Alloc(AllocError::OutOfMemory(_)))
        ));
        assert_eq!(kernel.allocator().free_words(&store).unwrap(), free_before);
        assert_eq!(kernel.table().len(), 6);
    }

    /// Test that a yield with a single runnable process changes nothing
    #[test]
    fn test_yield_single_process_noop() {
        let (mut kernel, mut store) = kernel();
        let pid = kernel.create_process(&mut store, &[], &[]).unwrap();

        let mut regs = RegisterFile::default();
        kernel.switch_to(pid, &mut regs).unwrap();
        regs.set(Register::ProgramCounter, 0x3042);
        regs.set(Register::General(3), 7);
        regs.set_condition(CondFlag::Negative);

        kernel.sys_yield(&mut regs).unwrap();
        assert_eq!(kernel.current(), Some(pid));
        assert_eq!(regs.get(Register::ProgramCounter), 0x3042);
        assert_eq!(regs.get(Register::General(3)), 7);
        assert_eq!(regs.condition(), CondFlag::Negative);
    }

    /// Test round-robin yielding across three processes
    #[test]
    fn test_yield_round_robin() {
        let (mut kernel, mut store) = kernel();
        for _ in 0..3 {
            kernel.create_process(&mut store, &[], &[]).unwrap();
        }

        let mut regs = RegisterFile::default();
        kernel.switch_to(0, &mut regs).unwrap();
        regs.set(Register::ProgramCounter, 0x3010);

        kernel.sys_yield(&mut regs).unwrap();
        assert_eq!(kernel.current(), Some(1));
        assert_eq!(regs.get(Register::ProgramCounter), PC_START);
        assert_eq!(kernel.table().get(0).unwrap().pc, 0x3010);

        kernel.sys_yield(&mut regs).unwrap();
        assert_eq!(kernel.current(), Some(2));
        kernel.sys_yield(&mut regs).unwrap();
        assert_eq!(kernel.current(), Some(0));
        assert_eq!(regs.get(Register::ProgramCounter), 0x3010);
    }

    /// Test that halting frees both segments and switches away
    #[test]
    fn test_halt_frees_and_switches() {
        let (mut kernel, mut store) = kernel();
        kernel.create_process(&mut store, &[], &[]).unwrap();
        kernel.create_process(&mut store, &[], &[]).unwrap();
        let free_before = kernel.allocator().free_words(&store).unwrap();

        let mut regs = RegisterFile::default();
        kernel.switch_to(0, &mut regs).unwrap();

        let next = kernel.sys_halt(&mut store, &mut regs).unwrap();
        assert_eq!(next, Some(1));
        assert_eq!(kernel.current(), Some(1));
        assert_eq!(
            kernel.table().get(0).unwrap().state,
            ProcessState::Terminated
        );
        // Both payloads come back, plus one header recovered when the two
        // adjacent chunks coalesce.
        assert_eq!(
            kernel.allocator().free_words(&store).unwrap(),
            free_before + CODE_SIZE as u32 + HEAP_INIT_SIZE as u32 + 2
        );
    }

    /// Test that the last halt stops the machine
    #[test]
    fn test_last_halt_stops() {
        let (mut kernel, mut store) = kernel();
        kernel.create_process(&mut store, &[], &[]).unwrap();

        let mut regs = RegisterFile::default();
        kernel.switch_to(0, &mut regs).unwrap();

        assert_eq!(kernel.sys_halt(&mut store, &mut regs).unwrap(), None);
        assert_eq!(kernel.current(), None);
    }

    /// Test that a successful break updates both the live register and
    /// the record
    #[test]
    fn test_break_shrinks_heap() {
        let (mut kernel, mut store) = kernel();
        let pid = kernel.create_process(&mut store, &[], &[]).unwrap();

        let mut regs = RegisterFile::default();
        kernel.switch_to(pid, &mut regs).unwrap();
        regs.set(Register::General(0), 100);

        kernel.sys_break(&mut store, &mut regs).unwrap();
        assert_eq!(regs.window(Segment::Heap).bound, 100);
        assert_eq!(kernel.table().get(pid).unwrap().heap.bound, 100);
    }

    /// Test that a rejected break leaves the heap untouched
    #[test]
    fn test_break_rejection_keeps_heap() {
        let (mut kernel, mut store) = kernel();
        let pid = kernel.create_process(&mut store, &[], &[]).unwrap();

        let mut regs = RegisterFile::default();
        kernel.switch_to(pid, &mut regs).unwrap();
        // Growth is obstructed: the region past the heap holds the live
        // code segment.
        regs.set(Register::General(0), HEAP_INIT_SIZE + 100);

        kernel.sys_break(&mut store, &mut regs).unwrap();
        assert_eq!(regs.window(Segment::Heap).bound, HEAP_INIT_SIZE);
        assert_eq!(
            kernel.table().get(pid).unwrap().heap.bound,
            HEAP_INIT_SIZE
        );
    }
}
