//! Two-level 386 paging with a small direct-mapped TLB.

use crate::cpu::Trap;
use crate::exception::CpuException;
use crate::memory::{bus_err, Bus};

const TLB_ENTRIES: usize = 64;

const PTE_PRESENT: u32 = 1 << 0;
const PTE_WRITE: u32 = 1 << 1;
const PTE_USER: u32 = 1 << 2;
const PTE_ACCESSED: u32 = 1 << 5;
const PTE_DIRTY: u32 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// Paging-relevant slice of the control registers for one access.
#[derive(Debug, Clone, Copy)]
pub struct PagingContext {
    pub enabled: bool,
    pub cr3: u32,
    /// CPL 3 access (supervisor for descriptor-table and TSS accesses).
    pub user: bool,
    /// CR0.WP: supervisor writes honour read-only pages (486).
    pub write_protect: bool,
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    page: u32,
    frame: u32,
    writable: bool,
    user: bool,
    dirty: bool,
}

#[derive(Debug, Clone)]
pub struct Mmu {
    tlb: [Option<TlbEntry>; TLB_ENTRIES],
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            tlb: [None; TLB_ENTRIES],
        }
    }

    /// Drops every cached translation (CR3 load, paging toggled).
    pub fn flush(&mut self) {
        self.tlb = [None; TLB_ENTRIES];
    }

    /// INVLPG.
    pub fn invalidate(&mut self, linear: u32) {
        let page = linear >> 12;
        let slot = &mut self.tlb[page as usize % TLB_ENTRIES];
        if slot.map_or(false, |e| e.page == page) {
            *slot = None;
        }
    }

    pub fn translate<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        ctx: PagingContext,
        linear: u32,
        access: Access,
    ) -> Result<u32, Trap> {
        if !ctx.enabled {
            return Ok(linear);
        }
        let page = linear >> 12;
        let slot = page as usize % TLB_ENTRIES;
        if let Some(e) = self.tlb[slot] {
            if e.page == page
                && check_permissions(ctx, access, e.user, e.writable)
                && (access != Access::Write || e.dirty)
            {
                return Ok(e.frame | (linear & 0xFFF));
            }
        }
        let e = self.walk(bus, ctx, linear, access)?;
        self.tlb[slot] = Some(e);
        Ok(e.frame | (linear & 0xFFF))
    }

    fn walk<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        ctx: PagingContext,
        linear: u32,
        access: Access,
    ) -> Result<TlbEntry, Trap> {
        let is_write = access == Access::Write;
        let fault_code = |present: bool| -> u16 {
            present as u16 | (is_write as u16) << 1 | (ctx.user as u16) << 2
        };

        let pde_addr = (ctx.cr3 & !0xFFF) | ((linear >> 22) << 2);
        let pde = bus.read_u32(pde_addr).map_err(bus_err(pde_addr))?;
        if pde & PTE_PRESENT == 0 {
            return Err(CpuException::page_fault(linear, fault_code(false)).into());
        }
        let pte_addr = (pde & !0xFFF) | (((linear >> 12) & 0x3FF) << 2);
        let pte = bus.read_u32(pte_addr).map_err(bus_err(pte_addr))?;
        if pte & PTE_PRESENT == 0 {
            return Err(CpuException::page_fault(linear, fault_code(false)).into());
        }

        let user = pde & pte & PTE_USER != 0;
        let writable = pde & pte & PTE_WRITE != 0;
        if !check_permissions(ctx, access, user, writable) {
            return Err(CpuException::page_fault(linear, fault_code(true)).into());
        }

        if pde & PTE_ACCESSED == 0 {
            bus.write_u32(pde_addr, pde | PTE_ACCESSED)
                .map_err(bus_err(pde_addr))?;
        }
        let mut new_pte = pte | PTE_ACCESSED;
        if is_write {
            new_pte |= PTE_DIRTY;
        }
        if new_pte != pte {
            bus.write_u32(pte_addr, new_pte).map_err(bus_err(pte_addr))?;
        }

        Ok(TlbEntry {
            page: linear >> 12,
            frame: pte & !0xFFF,
            writable,
            user,
            dirty: new_pte & PTE_DIRTY != 0,
        })
    }
}

fn check_permissions(ctx: PagingContext, access: Access, user: bool, writable: bool) -> bool {
    if ctx.user {
        user && (access != Access::Write || writable)
    } else {
        access != Access::Write || writable || !ctx.write_protect
    }
}
