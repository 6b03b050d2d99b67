//! A minimal machine around the CPU: flat RAM with the BIOS alias at the top
//! of the address space, latching I/O ports and a queue of pending
//! interrupt vectors standing in for the PIC.

use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::io::{InterruptSource, IoPorts, Scheduler};
use crate::memory::{Bus, Ram};
use crate::regs::OpSize;

/// Physical addresses at and above this alias the top of the first megabyte,
/// so the reset vector at FFFFFFF0 lands in the BIOS image at F000:FFF0.
const HIGH_ALIAS: u32 = 0xFFF0_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortWrite {
    pub port: u16,
    pub size: u8,
    pub value: u32,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Board {
    pub ram: Ram,
    ports: HashMap<u16, u32>,
    /// Every OUT in program order.
    pub writes: Vec<PortWrite>,
    pending: VecDeque<u8>,
    pub cycles: u64,
    pub frequency: u64,
}

impl Board {
    pub fn new(ram_size: usize) -> Self {
        Self {
            ram: Ram::new(ram_size),
            ports: HashMap::new(),
            writes: Vec::new(),
            pending: VecDeque::new(),
            cycles: 0,
            frequency: 0,
        }
    }

    /// Copies an image into physical memory.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        self.ram.load(map(addr), bytes)
    }

    /// Presets the value an IN from `port` returns.
    pub fn set_port(&mut self, port: u16, value: u32) {
        self.ports.insert(port, value);
    }

    /// Queues an external interrupt request.
    pub fn raise_irq(&mut self, vector: u8) {
        self.pending.push_back(vector);
    }
}

fn map(addr: u32) -> u32 {
    if addr >= HIGH_ALIAS {
        addr & 0x000F_FFFF
    } else {
        addr
    }
}

impl Bus for Board {
    fn read_u8(&mut self, addr: u32) -> Result<u8> {
        self.ram.read_u8(map(addr))
    }
    fn read_u16(&mut self, addr: u32) -> Result<u16> {
        self.ram.read_u16(map(addr))
    }
    fn read_u32(&mut self, addr: u32) -> Result<u32> {
        self.ram.read_u32(map(addr))
    }
    fn write_u8(&mut self, addr: u32, val: u8) -> Result<()> {
        self.ram.write_u8(map(addr), val)
    }
    fn write_u16(&mut self, addr: u32, val: u16) -> Result<()> {
        self.ram.write_u16(map(addr), val)
    }
    fn write_u32(&mut self, addr: u32, val: u32) -> Result<()> {
        self.ram.write_u32(map(addr), val)
    }
}

impl IoPorts for Board {
    fn port_read(&mut self, port: u16, size: OpSize) -> u32 {
        let v = self.ports.get(&port).copied().unwrap_or(u32::MAX) & size.mask();
        trace!(port, value = v, "port read");
        v
    }

    fn port_write(&mut self, port: u16, size: OpSize, value: u32) {
        trace!(port, value, "port write");
        self.ports.insert(port, value);
        self.writes.push(PortWrite {
            port,
            size: size.bytes() as u8,
            value,
        });
    }
}

impl InterruptSource for Board {
    fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn get_interrupt(&mut self) -> u8 {
        // Spurious IRQ7 when acknowledged with nothing pending.
        self.pending.pop_front().unwrap_or(0x0F)
    }
}

impl Scheduler for Board {
    fn update_clock(&mut self, cycles: u64) {
        self.cycles += cycles;
    }

    fn set_base_frequency(&mut self, hz: u64) {
        self.frequency = hz;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reset_vector_aliases_into_bios() {
        let mut b = Board::new(1 << 20);
        b.load(0xF_FFF0, &[0xEA, 0x5B, 0xE0]).unwrap();
        assert_eq!(b.read_u8(0xFFFF_FFF0).unwrap(), 0xEA);
        assert_eq!(b.read_u16(0xFFFF_FFF1).unwrap(), 0xE05B);
    }

    #[test]
    fn ports_latch_and_log() {
        let mut b = Board::new(4096);
        assert_eq!(b.port_read(0x60, OpSize::Byte), 0xFF);
        b.port_write(0x80, OpSize::Byte, 0x42);
        assert_eq!(b.port_read(0x80, OpSize::Byte), 0x42);
        assert_eq!(
            b.writes,
            vec![PortWrite {
                port: 0x80,
                size: 1,
                value: 0x42
            }]
        );
    }

    #[test]
    fn interrupts_are_fifo() {
        let mut b = Board::new(4096);
        b.raise_irq(0x20);
        b.raise_irq(0x21);
        assert!(b.is_pending());
        assert_eq!(b.get_interrupt(), 0x20);
        assert_eq!(b.get_interrupt(), 0x21);
        assert!(!b.is_pending());
    }
}
