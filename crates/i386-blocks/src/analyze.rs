use std::collections::{BTreeMap, VecDeque};

use anyhow::Result;
use serde::Serialize;

use i386_rs::block::CodeBlock;
use i386_rs::decoder::Decoder;
use i386_rs::disasm::fmt_instruction;
use i386_rs::instructions::{Instruction, Op};
use i386_rs::operand::Operand;
use i386_rs::{Board, Cpu, CpuConfig, I386Decoder};

use crate::model::Image;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Fallthrough,
    Branch,
    CondBranch,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: u32,
    pub to: u32,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockOut {
    pub start: u32,
    pub end: u32,
    pub insns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub entries: Vec<u32>,
    pub blocks: Vec<BlockOut>,
    pub edges: Vec<Edge>,
}

/// Decodes real-mode blocks out of an image by pointing a scratch CPU at
/// each linear address.
pub struct Walker {
    cpu: Cpu,
    board: Board,
    dec: I386Decoder,
}

impl Walker {
    pub fn new(img: &Image, cfg: CpuConfig) -> Result<Self> {
        let size = (img.top() as usize).max(1 << 20).next_power_of_two();
        let mut board = Board::new(size);
        for s in &img.segments {
            board.load(s.base, &s.bytes)?;
        }
        Ok(Self {
            cpu: Cpu::new(cfg),
            board,
            dec: I386Decoder::new(),
        })
    }

    /// The block starting at `linear`, and the CS base it was decoded under.
    pub fn block_at(&mut self, linear: u32) -> Option<(CodeBlock, u32)> {
        let cs = (linear >> 4).min(0xFFFF) as u16;
        let base = (cs as u32) << 4;
        self.cpu.set_entry(cs, (linear - base) as u16);
        let block = self.dec.decode_block(&mut self.cpu, &mut self.board).ok()?;
        Some((block, base))
    }
}

fn near_target(i: &Instruction, base: u32) -> Option<u32> {
    match i.src {
        Operand::Imm(rel) => Some(base + (i.end.wrapping_add(rel) & 0xFFFF)),
        _ => None,
    }
}

/// Successors of a block, judged by its last instruction.
pub fn successors(block: &CodeBlock, base: u32) -> Vec<(u32, EdgeKind)> {
    let Some(last) = block.instructions.last() else {
        return Vec::new();
    };
    let next = base + (last.end & 0xFFFF);
    let mut out = Vec::new();
    match last.op {
        Op::Jmp => out.extend(near_target(last, base).map(|t| (t, EdgeKind::Branch))),
        Op::Jcc(_) | Op::Jcxz | Op::Loop | Op::Loope | Op::Loopne => {
            out.extend(near_target(last, base).map(|t| (t, EdgeKind::CondBranch)));
            out.push((next, EdgeKind::Fallthrough));
        }
        Op::Call => {
            out.extend(near_target(last, base).map(|t| (t, EdgeKind::Call)));
            out.push((next, EdgeKind::Fallthrough));
        }
        Op::JmpFar | Op::CallFar => {
            if let Operand::Far { selector, offset } = last.src {
                let kind = if last.op == Op::JmpFar { EdgeKind::Branch } else { EdgeKind::Call };
                out.push((((selector as u32) << 4) + (offset & 0xFFFF), kind));
            }
            if last.op == Op::CallFar {
                out.push((next, EdgeKind::Fallthrough));
            }
        }
        Op::Int | Op::Int3 | Op::Into => out.push((next, EdgeKind::Fallthrough)),
        Op::Ret | Op::RetFar | Op::Iret | Op::Hlt | Op::Raise(_) => {}
        _ => out.push((next, EdgeKind::Fallthrough)),
    }
    out
}

/// Breadth-first walk from the entries, up to `max_blocks` blocks.
pub fn analyze(img: &Image, cfg: CpuConfig, entries: &[u32], max_blocks: usize) -> Result<Report> {
    let mut walker = Walker::new(img, cfg)?;
    let mut blocks: BTreeMap<u32, BlockOut> = BTreeMap::new();
    let mut edges = Vec::new();
    let mut queue: VecDeque<u32> = entries.iter().copied().filter(|&e| img.is_mapped(e)).collect();
    while let Some(start) = queue.pop_front() {
        if blocks.len() >= max_blocks {
            break;
        }
        if blocks.contains_key(&start) {
            continue;
        }
        let Some((block, base)) = walker.block_at(start) else {
            continue;
        };
        let end = base + (block.end_eip() & 0xFFFF);
        for (to, kind) in successors(&block, base) {
            edges.push(Edge { from: start, to, kind });
            if img.is_mapped(to) && !blocks.contains_key(&to) {
                queue.push_back(to);
            }
        }
        let insns = block
            .instructions
            .iter()
            .map(|i| format!("{:#07x}: {}", base + i.start, fmt_instruction(i)))
            .collect();
        blocks.insert(start, BlockOut { start, end, insns });
    }
    Ok(Report {
        entries: entries.to_vec(),
        blocks: blocks.into_values().collect(),
        edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Segment;
    use pretty_assertions::assert_eq;

    fn image(base: u32, bytes: &[u8]) -> Image {
        Image {
            segments: vec![Segment {
                name: "s".into(),
                base,
                bytes: bytes.to_vec(),
            }],
        }
    }

    #[test]
    fn conditional_branch_splits_blocks() {
        // 7C00: cmp al,5 ; jz +2 ; inc ax ; hlt ; hlt
        let img = image(0x7C00, &[0x3C, 0x05, 0x74, 0x02, 0x40, 0xF4, 0xF4]);
        let report = analyze(&img, CpuConfig::default(), &[0x7C00], 16).unwrap();
        let starts: Vec<u32> = report.blocks.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0x7C00, 0x7C04, 0x7C06]);
        assert!(report.edges.contains(&Edge {
            from: 0x7C00,
            to: 0x7C06,
            kind: EdgeKind::CondBranch
        }));
        assert_eq!(report.blocks[0].insns.len(), 2);
    }

    #[test]
    fn far_jump_follows_real_mode_target() {
        // jmp far 0000:7C10
        let mut bytes = vec![0xEA, 0x10, 0x7C, 0x00, 0x00];
        bytes.resize(0x10, 0x90);
        bytes.push(0xF4);
        let img = image(0x7C00, &bytes);
        let report = analyze(&img, CpuConfig::default(), &[0x7C00], 16).unwrap();
        assert_eq!(
            report.edges[0],
            Edge {
                from: 0x7C00,
                to: 0x7C10,
                kind: EdgeKind::Branch
            }
        );
        assert_eq!(report.blocks.len(), 2);
    }
}
