//! Physically keyed cache of decoded blocks.
//!
//! Blocks are grouped per 4 KiB physical page. Each page keeps a bitmap of the
//! bytes occupied by decoded code; a guest write that lands on one of those
//! bytes marks the whole page invalid, and the page's blocks are dropped the
//! next time it is looked up. Writes to data sharing a page with code leave
//! the cached blocks alone.

use std::collections::HashMap;
use std::rc::Rc;

use bitvec::prelude::*;

use crate::block::{CodeBlock, PhysRange};

type CodeMap = BitArr!(for 4096, in u64, Lsb0);

#[derive(Debug, Clone)]
struct PageEntry {
    valid: bool,
    blocks: HashMap<u16, Rc<CodeBlock>>,
    code: CodeMap,
    /// Pages whose blocks straddle into this one.
    owners: Vec<u32>,
}

impl PageEntry {
    fn new() -> Self {
        Self {
            valid: true,
            blocks: HashMap::new(),
            code: BitArray::ZERO,
            owners: Vec::new(),
        }
    }

    fn revalidate(&mut self) {
        if !self.valid {
            self.blocks.clear();
            self.code.fill(false);
            self.owners.clear();
            self.valid = true;
        }
    }

    fn mark(&mut self, r: PhysRange) {
        let lo = (r.first & 0xFFF) as usize;
        let hi = (r.last & 0xFFF) as usize;
        self.code[lo..=hi].fill(true);
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodeCache {
    pages: HashMap<u32, PageEntry>,
    generation: u64,
}

impl CodeCache {
    pub fn lookup(
        &mut self,
        phys: u32,
        cs_selector: u16,
        cs_limit: u32,
        eip: u32,
        code32: bool,
        stack32: bool,
    ) -> Option<Rc<CodeBlock>> {
        let entry = self.pages.get_mut(&(phys >> 12))?;
        entry.revalidate();
        let block = entry.blocks.get(&((phys & 0xFFF) as u16))?;
        block
            .is_matching(phys, cs_selector, cs_limit, eip, code32, stack32)
            .then(|| Rc::clone(block))
    }

    pub fn insert(&mut self, block: Rc<CodeBlock>) {
        let Some(head) = block.phys else {
            return;
        };
        let page = head.first >> 12;
        if let Some(tail) = block.tail {
            let entry = self
                .pages
                .entry(tail.first >> 12)
                .or_insert_with(PageEntry::new);
            entry.revalidate();
            entry.mark(tail);
            if !entry.owners.contains(&page) {
                entry.owners.push(page);
            }
        }
        let entry = self.pages.entry(page).or_insert_with(PageEntry::new);
        entry.revalidate();
        entry.mark(head);
        entry.blocks.insert((head.first & 0xFFF) as u16, block);
    }

    /// Handles a guest write of `len` bytes at `phys`. Returns whether any
    /// decoded code was hit.
    pub fn invalidate(&mut self, phys: u32, len: u32) -> bool {
        let last = phys.saturating_add(len.max(1) - 1);
        let mut hit = Vec::new();
        for page in (phys >> 12)..=(last >> 12) {
            let Some(entry) = self.pages.get_mut(&page) else {
                continue;
            };
            if !entry.valid {
                continue;
            }
            let lo = if page == phys >> 12 { (phys & 0xFFF) as usize } else { 0 };
            let hi = if page == last >> 12 { (last & 0xFFF) as usize } else { 0xFFF };
            if entry.code[lo..=hi].any() {
                entry.valid = false;
                hit.push(page);
                hit.extend(entry.owners.iter().copied());
            }
        }
        for page in &hit {
            if let Some(entry) = self.pages.get_mut(page) {
                entry.valid = false;
            }
        }
        if !hit.is_empty() {
            self.generation += 1;
        }
        !hit.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.generation += 1;
    }

    /// Bumped by every invalidation; a block decoded across a bump is stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// (pages, cached blocks)
    pub fn stats(&self) -> (usize, usize) {
        let blocks = self
            .pages
            .values()
            .filter(|p| p.valid)
            .map(|p| p.blocks.len())
            .sum();
        (self.pages.len(), blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(first: u32, last: u32) -> Rc<CodeBlock> {
        Rc::new(CodeBlock {
            instructions: Vec::new(),
            cs_selector: 0,
            cs_limit: 0xFFFF,
            start_eip: first,
            phys: Some(PhysRange { first, last }),
            tail: None,
            tail_linear: None,
            code32: false,
            stack32: false,
            cacheable: true,
        })
    }

    #[test]
    fn data_write_in_code_page_keeps_blocks() {
        let mut c = CodeCache::default();
        c.insert(block(0x1010, 0x1020));
        assert!(!c.invalidate(0x1021, 2));
        assert!(c.lookup(0x1010, 0, 0xFFFF, 0x1010, false, false).is_some());
    }

    #[test]
    fn code_write_drops_whole_page() {
        let mut c = CodeCache::default();
        c.insert(block(0x1010, 0x1020));
        c.insert(block(0x1800, 0x1810));
        assert!(c.invalidate(0x1020, 1));
        assert!(c.lookup(0x1800, 0, 0xFFFF, 0x1800, false, false).is_none());
        assert!(c.lookup(0x1010, 0, 0xFFFF, 0x1010, false, false).is_none());
    }

    #[test]
    fn straddling_block_is_dropped_through_its_tail() {
        let mut c = CodeCache::default();
        let b = CodeBlock {
            tail: Some(PhysRange { first: 0x5000, last: 0x5002 }),
            ..(*block(0x1FFC, 0x1FFF)).clone()
        };
        c.insert(Rc::new(b));
        assert!(c.invalidate(0x5001, 1));
        assert!(c.lookup(0x1FFC, 0, 0xFFFF, 0x1FFC, false, false).is_none());
    }

    #[test]
    fn mismatched_mode_misses() {
        let mut c = CodeCache::default();
        c.insert(block(0x3000, 0x3004));
        assert!(c.lookup(0x3000, 0, 0xFFFF, 0x3000, true, false).is_none());
        assert!(c.lookup(0x3000, 8, 0xFFFF, 0x3000, false, false).is_none());
        assert!(c.lookup(0x3000, 0, 0x0FFF, 0x3000, false, false).is_none());
        assert!(c.lookup(0x3000, 0, 0xFFFF, 0x3000, false, false).is_some());
    }
}
