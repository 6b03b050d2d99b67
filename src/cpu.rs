use std::rc::Rc;

use anyhow::Error;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::block::CodeBlock;
use crate::cache::CodeCache;
use crate::decoder::Decoder;
use crate::descriptor::DescriptorRing;
use crate::exception::{should_double_fault, CpuException, Vector};
use crate::exec::Executor;
use crate::interrupt::EventKind;
use crate::io::Platform;
use crate::memory::Bus;
use crate::mmu::Mmu;
use crate::regs::{Flags, Registers, SegReg, EDX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuType {
    I386,
    I486,
}

impl CpuType {
    /// Component and revision id found in EDX after reset.
    pub fn signature(self) -> u32 {
        match self {
            CpuType::I386 => 0x0308,
            CpuType::I486 => 0x0402,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub cpu_type: CpuType,
    pub has_fpu: bool,
    /// Reset the processor on a triple fault instead of stopping with
    /// [`Trap::Shutdown`].
    pub reset_on_triple_fault: bool,
    pub cache_blocks: bool,
    pub max_block_instructions: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            cpu_type: CpuType::I386,
            has_fpu: false,
            reset_on_triple_fault: true,
            cache_blocks: true,
            max_block_instructions: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cpu {
    pub regs: Registers,
    pub cfg: CpuConfig,
    pub halted: bool,
    /// Retired instructions plus idle halt steps.
    pub cycles: u64,
    #[serde(skip)]
    pub(crate) mmu: Mmu,
    #[serde(skip)]
    pub(crate) cache: CodeCache,
    #[serde(skip)]
    pub(crate) descriptors: DescriptorRing,
    /// Set by STI and SS loads: the next interrupt sample is skipped.
    #[serde(skip)]
    pub(crate) interrupt_shadow: bool,
    #[serde(skip)]
    pub(crate) executing: Option<Rc<CodeBlock>>,
    /// A write hit the running block; its remaining instructions are stale.
    #[serde(skip)]
    pub(crate) block_abort: bool,
    /// A task switch committed during the current control transfer, so a later
    /// fault belongs to the new task and must not be rolled back.
    #[serde(skip)]
    pub(crate) task_switched: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum Trap {
    #[error("{0}")]
    Exception(#[from] CpuException),
    #[error("Bus error at {addr:#010x}: {source}")]
    Bus {
        addr: u32,
        #[source]
        source: Error,
    },
    #[error("Unimplemented instruction {mnemonic} at {cs:04x}:{eip:08x}")]
    Unimplemented {
        mnemonic: &'static str,
        cs: u16,
        eip: u32,
    },
    #[error("Internal decoder fault: {0}")]
    Internal(&'static str),
    #[error("Triple fault, processor shut down")]
    Shutdown,
}

impl Cpu {
    pub fn new(cfg: CpuConfig) -> Self {
        let mut cpu = Self {
            regs: Registers::new(),
            cfg,
            halted: false,
            cycles: 0,
            mmu: Mmu::new(),
            cache: CodeCache::default(),
            descriptors: DescriptorRing::default(),
            interrupt_shadow: false,
            executing: None,
            block_abort: false,
            task_switched: false,
        };
        cpu.reset();
        cpu
    }

    /// Power-on/RESET state: CS:IP = F000:FFF0 with CS base FFFF0000.
    pub fn reset(&mut self) {
        self.regs = Registers::new();
        self.regs.gpr[EDX] = self.cfg.cpu_type.signature();
        self.halted = false;
        self.interrupt_shadow = false;
        self.block_abort = true;
        self.mmu.flush();
        self.cache.clear();
    }

    /// Starts execution at a real-mode CS:IP instead of the reset vector.
    pub fn set_entry(&mut self, cs: u16, ip: u16) {
        self.regs.seg_mut(SegReg::Cs).load_real_mode(cs);
        self.regs.eip = ip as u32;
    }

    /// Runs one block (or one idle tick while halted).
    pub fn step<P: Platform, D: Decoder, X: Executor>(
        &mut self,
        sys: &mut P,
        dec: &D,
        exec: &X,
    ) -> Result<(), Trap> {
        self.sample_interrupts(sys)?;
        if self.halted {
            self.cycles += 1;
            sys.update_clock(1);
            return Ok(());
        }
        let block = self
            .fetch_block(sys, dec)
            .map_err(|t| self.diagnose(t, None))?;
        let retired = self
            .run_block(sys, exec, &block)
            .map_err(|t| self.diagnose(t, Some(&block)))?;
        self.cycles += retired;
        sys.update_clock(retired);
        Ok(())
    }

    fn sample_interrupts<P: Platform>(&mut self, sys: &mut P) -> Result<(), Trap> {
        if std::mem::take(&mut self.interrupt_shadow) {
            return Ok(());
        }
        if !self.regs.eflags.contains(Flags::IF) || !sys.is_pending() {
            return Ok(());
        }
        let vector = sys.get_interrupt();
        self.halted = false;
        self.deliver_interrupt(sys, vector, EventKind::External)
    }

    fn fetch_block<P: Platform, D: Decoder>(
        &mut self,
        sys: &mut P,
        dec: &D,
    ) -> Result<Rc<CodeBlock>, Trap> {
        let eip = self.regs.eip;
        let cs = *self.regs.seg(SegReg::Cs);
        let stack32 = self.regs.seg(SegReg::Ss).is_size32();
        if self.cfg.cache_blocks {
            let linear = cs.base().wrapping_add(eip);
            match self.get_physical_address(sys, linear, false, true) {
                Ok(phys) => {
                    let hit = self.cache.lookup(
                        phys,
                        cs.selector(),
                        cs.limit(),
                        eip,
                        cs.is_size32(),
                        stack32,
                    );
                    if let Some(block) = hit {
                        if self.is_tail_mapped(sys, &block)? {
                            return Ok(block);
                        }
                        debug!(eip, "tail page remapped, decoding again");
                    }
                }
                // The decoder raises it again at the faulting byte.
                Err(Trap::Exception(_)) => {}
                Err(t) => return Err(t),
            }
        }

        let generation = self.cache.generation();
        let block = Rc::new(dec.decode_block(self, sys)?);
        trace!(
            cs = block.cs_selector,
            eip = block.start_eip,
            phys = ?block.phys_begin(),
            len = block.instructions.len(),
            cacheable = block.cacheable,
            "decoded block"
        );
        if self.cfg.cache_blocks && block.cacheable && generation == self.cache.generation() {
            self.cache.insert(Rc::clone(&block));
        }
        Ok(block)
    }

    /// A block whose first instruction straddles into the next page may only
    /// run while that page still maps to the frame it was decoded from.
    fn is_tail_mapped<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        block: &CodeBlock,
    ) -> Result<bool, Trap> {
        let (Some(tail), Some(linear)) = (block.tail, block.tail_linear) else {
            return Ok(true);
        };
        match self.get_physical_address(bus, linear, false, true) {
            Ok(phys) => Ok(phys >> 12 == tail.first >> 12),
            Err(Trap::Exception(_)) => Ok(false),
            Err(t) => Err(t),
        }
    }

    fn run_block<P: Platform, X: Executor>(
        &mut self,
        sys: &mut P,
        exec: &X,
        block: &Rc<CodeBlock>,
    ) -> Result<u64, Trap> {
        self.executing = Some(Rc::clone(block));
        self.block_abort = false;
        let mut retired = 0;
        let mut result = Ok(());
        for instr in &block.instructions {
            self.regs.eip = instr.end;
            self.task_switched = false;
            match exec.exec(self, sys, instr) {
                Ok(()) => retired += 1,
                Err(Trap::Exception(e)) => {
                    // After a task switch the fault belongs to the new task.
                    if !self.task_switched {
                        self.regs.eip = instr.start;
                    }
                    result = self.deliver_exception(sys, e);
                    break;
                }
                Err(t) => {
                    self.regs.eip = instr.start;
                    result = Err(t);
                    break;
                }
            }
            if self.block_abort || self.halted {
                break;
            }
        }
        self.executing = None;
        result.map(|()| retired)
    }

    fn diagnose(&self, trap: Trap, block: Option<&CodeBlock>) -> Trap {
        if let Trap::Internal(what) = &trap {
            error!("{what}\n{}", crate::disasm::dump_state(self, block));
        }
        trap
    }

    /// Delivers a guest exception. Nested faults compose into #DF per the
    /// contributory/page-fault rules; a fault while delivering #DF is a triple
    /// fault.
    pub fn deliver_exception<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        e: CpuException,
    ) -> Result<(), Trap> {
        self.deliver(bus, e.vector.number(), e.error_code, EventKind::Exception, Some(e))
    }

    /// Delivers an external interrupt at the current EIP.
    pub fn deliver_interrupt<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        vector: u8,
        kind: EventKind,
    ) -> Result<(), Trap> {
        self.deliver(bus, vector, None, kind, None)
    }

    /// INT n, INT3, INTO and INT1. A fault while entering the handler is
    /// returned so the caller reports it at the interrupting instruction.
    pub(crate) fn software_interrupt<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        vector: u8,
        kind: EventKind,
    ) -> Result<(), Trap> {
        trace!(vector, ?kind, "software interrupt");
        self.with_rollback(bus, |cpu, bus| {
            cpu.dispatch_interrupt(bus, vector, None, kind)
        })
    }

    fn deliver<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        mut vector: u8,
        mut error_code: Option<u16>,
        mut kind: EventKind,
        mut exception: Option<CpuException>,
    ) -> Result<(), Trap> {
        self.halted = false;
        for _ in 0..8 {
            if let Some(e) = exception {
                debug!(
                    cs = self.regs.seg(SegReg::Cs).selector(),
                    eip = self.regs.eip,
                    "delivering {e}"
                );
                if let (Vector::PageFault, Some(addr)) = (e.vector, e.fault_address) {
                    self.regs.cr2 = addr;
                }
            }
            let attempt = self.with_rollback(bus, |cpu, bus| {
                cpu.dispatch_interrupt(bus, vector, error_code, kind)
            });
            let second = match attempt {
                Ok(()) => return Ok(()),
                Err(Trap::Exception(second)) => second,
                Err(t) => return Err(t),
            };
            let first = exception.map(|e| e.vector);
            if first == Some(Vector::DoubleFault) {
                return self.triple_fault();
            }
            let next = match first {
                Some(first) if should_double_fault(first, second.vector) => {
                    warn!(
                        "{} while delivering {}, raising #DF",
                        second.vector.mnemonic(),
                        first.mnemonic()
                    );
                    CpuException::double_fault()
                }
                _ => second,
            };
            vector = next.vector.number();
            error_code = next.error_code;
            kind = EventKind::Exception;
            exception = Some(next);
        }
        self.triple_fault()
    }

    fn triple_fault(&mut self) -> Result<(), Trap> {
        warn!(
            cs = self.regs.seg(SegReg::Cs).selector(),
            eip = self.regs.eip,
            "triple fault"
        );
        if self.cfg.reset_on_triple_fault {
            warn!("resetting processor");
            self.reset();
            Ok(())
        } else {
            Err(Trap::Shutdown)
        }
    }

    /// Runs a control transfer so that a guest fault leaves the architectural
    /// state (ESP in particular) exactly as it was before the transfer began.
    pub(crate) fn with_rollback<B, F>(&mut self, bus: &mut B, f: F) -> Result<(), Trap>
    where
        B: Bus + ?Sized,
        F: FnOnce(&mut Self, &mut B) -> Result<(), Trap>,
    {
        let saved = self.regs.clone();
        let outer = std::mem::replace(&mut self.task_switched, false);
        let r = f(self, bus);
        if matches!(r, Err(Trap::Exception(_))) && !self.task_switched {
            self.regs = saved;
        }
        self.task_switched |= outer;
        r
    }

    /// Called for every guest write that reached physical memory.
    pub(crate) fn note_physical_write(&mut self, phys: u32, len: u32) {
        if self.cache.invalidate(phys, len) {
            debug!(phys, len, "code write, page invalidated");
        }
        if let Some(block) = &self.executing {
            if block.overlaps(phys, len) {
                self.block_abort = true;
            }
        }
    }

    /// Drops cached translations after CR3 or CR0.PG changes. Decoded blocks
    /// are keyed physically and stay valid.
    pub(crate) fn flush_translations(&mut self) {
        self.mmu.flush();
    }

    pub fn cache_stats(&self) -> (usize, usize) {
        self.cache.stats()
    }
}
