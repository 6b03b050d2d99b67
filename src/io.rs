//! Collaborators the core talks to besides memory: I/O ports, the interrupt
//! controller and the scheduler.

use crate::memory::Bus;
use crate::regs::OpSize;

pub trait IoPorts {
    fn port_read(&mut self, port: u16, size: OpSize) -> u32;
    fn port_write(&mut self, port: u16, size: OpSize, value: u32);
}

/// The programmable interrupt controller as seen from the CPU.
pub trait InterruptSource {
    fn is_pending(&self) -> bool;
    /// Acknowledges the highest priority request and returns its vector.
    fn get_interrupt(&mut self) -> u8;
}

pub trait Scheduler {
    fn update_clock(&mut self, cycles: u64);
    fn set_base_frequency(&mut self, hz: u64);
}

/// Everything a running CPU needs from the machine around it.
pub trait Platform: Bus + IoPorts + InterruptSource + Scheduler {}

impl<T: Bus + IoPorts + InterruptSource + Scheduler> Platform for T {}
