//! Guest-visible processor exceptions.
//!
//! A [`CpuException`] is the architectural fault raised by a failed protection
//! check, an invalid encoding, or a paging violation. It always ends up in the
//! guest's IDT/IVT through [`crate::interrupt`]; it never reaches the host user.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Vector {
    DivideError = 0,
    Debug = 1,
    Nmi = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRange = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    CoprocessorOverrun = 9,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
    FpuError = 16,
    AlignmentCheck = 17,
}

impl Vector {
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Vector::DivideError => "#DE",
            Vector::Debug => "#DB",
            Vector::Nmi => "NMI",
            Vector::Breakpoint => "#BP",
            Vector::Overflow => "#OF",
            Vector::BoundRange => "#BR",
            Vector::InvalidOpcode => "#UD",
            Vector::DeviceNotAvailable => "#NM",
            Vector::DoubleFault => "#DF",
            Vector::CoprocessorOverrun => "#MF9",
            Vector::InvalidTss => "#TS",
            Vector::SegmentNotPresent => "#NP",
            Vector::StackFault => "#SS",
            Vector::GeneralProtection => "#GP",
            Vector::PageFault => "#PF",
            Vector::FpuError => "#MF",
            Vector::AlignmentCheck => "#AC",
        }
    }

    fn class(self) -> ExceptionClass {
        match self {
            Vector::PageFault => ExceptionClass::PageFault,
            Vector::DoubleFault => ExceptionClass::DoubleFault,
            Vector::DivideError
            | Vector::InvalidTss
            | Vector::SegmentNotPresent
            | Vector::StackFault
            | Vector::GeneralProtection => ExceptionClass::Contributory,
            _ => ExceptionClass::Benign,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

/// A fault raised while delivering `first` escalates to #DF when both belong to
/// the contributory/page-fault classes.
pub fn should_double_fault(first: Vector, second: Vector) -> bool {
    use ExceptionClass as C;
    matches!(
        (first.class(), second.class()),
        (C::Contributory, C::Contributory) | (C::PageFault, C::Contributory | C::PageFault)
    )
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[error("{} (error code {:x?})", .vector.mnemonic(), .error_code)]
pub struct CpuException {
    pub vector: Vector,
    pub error_code: Option<u16>,
    /// Linear address loaded into CR2 when a page fault is delivered.
    pub fault_address: Option<u32>,
    /// Raised while delivering an event external to the program (EXT bit).
    pub external: bool,
}

impl CpuException {
    pub const fn new(vector: Vector, error_code: Option<u16>) -> Self {
        Self {
            vector,
            error_code,
            fault_address: None,
            external: false,
        }
    }

    pub const fn gp(code: u16) -> Self {
        Self::new(Vector::GeneralProtection, Some(code))
    }

    pub const fn gp0() -> Self {
        Self::gp(0)
    }

    pub const fn np(code: u16) -> Self {
        Self::new(Vector::SegmentNotPresent, Some(code))
    }

    pub const fn ss(code: u16) -> Self {
        Self::new(Vector::StackFault, Some(code))
    }

    pub const fn ts(code: u16) -> Self {
        Self::new(Vector::InvalidTss, Some(code))
    }

    pub const fn ud() -> Self {
        Self::new(Vector::InvalidOpcode, None)
    }

    pub const fn nm() -> Self {
        Self::new(Vector::DeviceNotAvailable, None)
    }

    pub const fn de() -> Self {
        Self::new(Vector::DivideError, None)
    }

    pub const fn br() -> Self {
        Self::new(Vector::BoundRange, None)
    }

    /// Fault carrying a selector error code (index | TI | EXT).
    pub const fn for_selector(vector: Vector, selector: u16, external: bool) -> Self {
        Self::new(vector, Some((selector & 0xFFFC) | external as u16))
    }

    pub const fn double_fault() -> Self {
        Self::new(Vector::DoubleFault, Some(0))
    }

    pub const fn page_fault(linear: u32, code: u16) -> Self {
        Self {
            vector: Vector::PageFault,
            error_code: Some(code),
            fault_address: Some(linear),
            external: false,
        }
    }

    /// Marks the fault as raised during delivery of an external event, which
    /// sets the EXT bit of any selector error code built afterwards.
    pub fn with_external(mut self, external: bool) -> Self {
        if external {
            self.external = true;
            if let Some(code) = self.error_code.as_mut() {
                *code |= 1;
            }
        }
        self
    }
}

/// Error code for a selector-related fault: index | TI | EXT.
pub fn selector_error_code(selector: u16, external: bool) -> u16 {
    (selector & 0xFFFC) | external as u16
}

/// Error code for a fault on an IDT entry: index | IDT bit | EXT.
pub fn idt_error_code(vector: u8, external: bool) -> u16 {
    ((vector as u16) << 3) | 0b10 | external as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contributory_pairs_escalate() {
        assert!(should_double_fault(Vector::GeneralProtection, Vector::SegmentNotPresent));
        assert!(should_double_fault(Vector::PageFault, Vector::PageFault));
        assert!(should_double_fault(Vector::PageFault, Vector::GeneralProtection));
        assert!(!should_double_fault(Vector::GeneralProtection, Vector::PageFault));
        assert!(!should_double_fault(Vector::InvalidOpcode, Vector::GeneralProtection));
    }

    #[test]
    fn error_code_formats() {
        assert_eq!(selector_error_code(0x002B, false), 0x0028);
        assert_eq!(selector_error_code(0x002F, true), 0x002D);
        assert_eq!(idt_error_code(0x21, false), 0x010A);
        assert_eq!(idt_error_code(0x21, true), 0x010B);
    }
}
