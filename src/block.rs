use crate::instructions::Instruction;

/// Inclusive physical byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub first: u32,
    pub last: u32,
}

impl PhysRange {
    pub fn at(addr: u32) -> Self {
        Self {
            first: addr,
            last: addr,
        }
    }

    pub fn extend(&mut self, addr: u32) {
        self.first = self.first.min(addr);
        self.last = self.last.max(addr);
    }

    pub fn overlaps(&self, addr: u32, len: u32) -> bool {
        let last = addr.saturating_add(len.max(1) - 1);
        addr <= self.last && last >= self.first
    }
}

/// One decoded run of straight-line code.
#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub instructions: Vec<Instruction>,
    pub cs_selector: u16,
    /// CS limit at decode time; a shrunken limit must refetch.
    pub cs_limit: u32,
    pub start_eip: u32,
    /// Bytes fetched from the block's own page; `None` when the very first
    /// fetch faulted.
    pub phys: Option<PhysRange>,
    /// Bytes of a first instruction that straddles into the following page.
    pub tail: Option<PhysRange>,
    /// Linear page the `tail` bytes were fetched through.
    pub tail_linear: Option<u32>,
    pub code32: bool,
    pub stack32: bool,
    pub cacheable: bool,
}

impl CodeBlock {
    pub fn phys_begin(&self) -> Option<u32> {
        self.phys.map(|r| r.first)
    }

    /// Whether this block may run for the given fetch state. Any difference in
    /// selector, limit, offset, code/stack size or physical location means the
    /// same bytes could decode or fault differently.
    pub fn is_matching(
        &self,
        phys: u32,
        cs_selector: u16,
        cs_limit: u32,
        eip: u32,
        code32: bool,
        stack32: bool,
    ) -> bool {
        self.phys_begin() == Some(phys)
            && self.cs_selector == cs_selector
            && self.cs_limit == cs_limit
            && self.start_eip == eip
            && self.code32 == code32
            && self.stack32 == stack32
    }

    pub fn overlaps(&self, addr: u32, len: u32) -> bool {
        self.ranges().any(|r| r.overlaps(addr, len))
    }

    pub fn ranges(&self) -> impl Iterator<Item = PhysRange> + '_ {
        self.phys.iter().chain(self.tail.iter()).copied()
    }

    /// EIP just past the last instruction.
    pub fn end_eip(&self) -> u32 {
        self.instructions
            .last()
            .map_or(self.start_eip, |i| i.end)
    }
}
