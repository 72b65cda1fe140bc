//! Fault-resumable calls and user-memory copies
//!
//! A task may run a function with a mask of CPU faults it is prepared to
//! survive. If one of those faults hits while the function runs, the fault
//! handler does not kill the task: execution resumes right after the call,
//! which returns the bit of the fault that occurred. A return value of 0
//! means the function completed.
//!
//! On hardware the function faults by touching bad memory. In the hosted
//! model a function reports a fault by returning `Err(CpuFault)`; from that
//! point the handling is the same.
//!
//! The user copy routines are built on top: the user range is validated
//! first, then the copy runs under a page-fault/protection mask and a fault
//! becomes a [`CopyError`].

use bitflags::bitflags;

use crate::scheduler::Kernel;

/// Maximum size for a single copy operation
pub const COPYIO_MAX_SIZE: usize = 64 * 1024;

/// Lowest user address
pub const USER_SPACE_START: usize = 0;

/// Highest user address
#[cfg(target_pointer_width = "64")]
pub const USER_SPACE_END: usize = 0x0000_7FFF_FFFF_FFFF;
#[cfg(not(target_pointer_width = "64"))]
pub const USER_SPACE_END: usize = 0xBFFF_FFFF;

// ============================================================================
// CPU Faults
// ============================================================================

/// A CPU fault number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuFault(pub u8);

impl CpuFault {
    pub const DIVISION_BY_ZERO: CpuFault = CpuFault(0);
    pub const DEBUG: CpuFault = CpuFault(1);
    pub const BREAKPOINT: CpuFault = CpuFault(3);
    pub const INVALID_OPCODE: CpuFault = CpuFault(6);
    pub const DOUBLE_FAULT: CpuFault = CpuFault(8);
    pub const GENERAL_PROTECTION: CpuFault = CpuFault(13);
    pub const PAGE_FAULT: CpuFault = CpuFault(14);
    pub const ALIGN_FAULT: CpuFault = CpuFault(17);

    /// The fault's bit in a [`FaultMask`] and in the value returned by a
    /// resumed call
    pub const fn bit(self) -> u32 {
        1 << (self.0 & 31)
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "division by zero",
            1 => "debug",
            3 => "breakpoint",
            6 => "invalid opcode",
            8 => "double fault",
            13 => "general protection",
            14 => "page fault",
            17 => "alignment fault",
            _ => "fault",
        }
    }
}

impl core::fmt::Display for CpuFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{} ({})", self.0, self.name())
    }
}

bitflags! {
    /// Set of CPU faults a task expects and can recover from
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FaultMask: u32 {
        const DIVISION_BY_ZERO = CpuFault::DIVISION_BY_ZERO.bit();
        const INVALID_OPCODE = CpuFault::INVALID_OPCODE.bit();
        const GENERAL_PROTECTION = CpuFault::GENERAL_PROTECTION.bit();
        const PAGE_FAULT = CpuFault::PAGE_FAULT.bit();
        const ALIGN_FAULT = CpuFault::ALIGN_FAULT.bit();

        // every other fault number is a valid bit too
        const _ = !0;
    }
}

impl FaultMask {
    /// Faults a user-memory access can raise
    pub const USER_ACCESS: FaultMask = FaultMask::PAGE_FAULT.union(FaultMask::GENERAL_PROTECTION);

    pub fn covers(self, fault: CpuFault) -> bool {
        self.bits() & fault.bit() != 0
    }
}

impl From<CpuFault> for FaultMask {
    fn from(fault: CpuFault) -> Self {
        FaultMask::from_bits_retain(fault.bit())
    }
}

/// What the fault handler decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Resume after the enclosing fault-resumable call with this value
    Resume(u32),
    /// Nobody expects this fault
    Fatal,
}

impl Kernel {
    /// Run `func` treating the faults in `mask` as recoverable.
    ///
    /// Returns 0 if `func` completed, otherwise the bit of the fault that
    /// interrupted it. The caller's mask and preemption count are restored
    /// on both paths, so calls nest. A fault outside `mask` is fatal.
    pub fn fault_resumable_call<F>(&mut self, mask: FaultMask, func: F) -> u32
    where
        F: FnOnce(&mut Kernel) -> Result<(), CpuFault>,
    {
        let tid = self.current;
        let saved_preempt = self.preempt_count();
        let saved_mask = {
            let task = self.tasks.expect_mut(tid);
            core::mem::replace(&mut task.fault_resume_mask, mask)
        };

        let result = func(self);
        assert_eq!(self.current, tid, "fault_resumable_call: {} switched away", tid);

        let ret = match result {
            Ok(()) => 0,
            Err(fault) => match self.handle_cpu_fault(fault) {
                FaultAction::Resume(bits) => {
                    // the faulting code may have left preemption disabled
                    self.set_preempt_count(saved_preempt);
                    bits
                }
                FaultAction::Fatal => panic!("unhandled fault {} in {}", fault, tid),
            },
        };

        self.tasks.expect_mut(tid).fault_resume_mask = saved_mask;
        ret
    }

    /// Fault entry: resumable if the current task's innermost mask covers
    /// the fault
    pub fn handle_cpu_fault(&mut self, fault: CpuFault) -> FaultAction {
        let tid = self.current;
        let resumable = self.tasks.expect(tid).fault_resume_mask.covers(fault);
        self.platform.enter_fault_handler(tid, fault, resumable);

        if resumable {
            log::trace!("fault: {} in {} resumed", fault, tid);
            FaultAction::Resume(fault.bit())
        } else {
            FaultAction::Fatal
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Copy operation result
pub type CopyResult = Result<usize, CopyError>;

/// Errors that can occur during copy operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CopyError {
    /// Bad user address (null, kernel space or wrapping)
    BadAddress = -1,
    /// Page fault during copy (unmapped page)
    PageFault = -2,
    /// Protection violation (write to read-only page)
    Protection = -3,
    /// Size too large
    TooLarge = -4,
}

impl CopyError {
    /// errno-style return value
    pub fn to_errno(self) -> i32 {
        self as i32
    }

    fn from_fault_bits(bits: u32) -> Self {
        if bits & CpuFault::GENERAL_PROTECTION.bit() != 0 {
            CopyError::Protection
        } else {
            CopyError::PageFault
        }
    }
}

// ============================================================================
// Address Validation
// ============================================================================

/// Check if an address is in user space
#[inline]
pub fn is_user_address(addr: usize) -> bool {
    (USER_SPACE_START..=USER_SPACE_END).contains(&addr)
}

/// Check if an address range is entirely in user space
#[inline]
pub fn is_user_range(addr: usize, size: usize) -> bool {
    if size == 0 {
        return true;
    }
    match addr.checked_add(size - 1) {
        Some(end) => is_user_address(addr) && is_user_address(end),
        None => false,
    }
}

/// Validate a user buffer before touching it
pub fn validate_user_range(addr: usize, size: usize) -> Result<(), CopyError> {
    if addr == 0 || !is_user_range(addr, size) {
        return Err(CopyError::BadAddress);
    }
    if size > COPYIO_MAX_SIZE {
        return Err(CopyError::TooLarge);
    }
    Ok(())
}

// ============================================================================
// User Memory Access
// ============================================================================

/// Raw access to the current user address space. Accesses fault the way
/// the CPU would; a partially completed access is not rolled back.
pub trait UserMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), CpuFault>;
    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), CpuFault>;
}

impl Kernel {
    /// Copy `dst.len()` bytes from user address `user_src`
    pub fn copy_from_user(&mut self, mem: &dyn UserMemory, user_src: usize, dst: &mut [u8]) -> CopyResult {
        validate_user_range(user_src, dst.len())?;
        let len = dst.len();

        match self.fault_resumable_call(FaultMask::USER_ACCESS, |_| mem.read(user_src, dst)) {
            0 => Ok(len),
            bits => Err(CopyError::from_fault_bits(bits)),
        }
    }

    /// Copy `src` to user address `user_dst`
    pub fn copy_to_user(&mut self, mem: &mut dyn UserMemory, user_dst: usize, src: &[u8]) -> CopyResult {
        validate_user_range(user_dst, src.len())?;

        match self.fault_resumable_call(FaultMask::USER_ACCESS, |_| mem.write(user_dst, src)) {
            0 => Ok(src.len()),
            bits => Err(CopyError::from_fault_bits(bits)),
        }
    }

    /// Copy a NUL-terminated string into `dst`, terminator included.
    /// Returns the string length; `TooLarge` if `dst` fills up first.
    pub fn copy_str_from_user(&mut self, mem: &dyn UserMemory, user_src: usize, dst: &mut [u8]) -> CopyResult {
        validate_user_range(user_src, 1)?;

        let mut outcome = Err(CopyError::TooLarge);
        let bits = self.fault_resumable_call(FaultMask::USER_ACCESS, |_| {
            for (i, slot) in dst.iter_mut().enumerate() {
                let addr = user_src + i;
                if !is_user_address(addr) {
                    outcome = Err(CopyError::BadAddress);
                    return Ok(());
                }
                let mut byte = [0u8];
                mem.read(addr, &mut byte)?;
                *slot = byte[0];
                if byte[0] == 0 {
                    outcome = Ok(i);
                    return Ok(());
                }
            }
            Ok(())
        });

        match bits {
            0 => outcome,
            bits => Err(CopyError::from_fault_bits(bits)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::{hosted_kernel, HostedUserMemory};
    use crate::config::KernelConfig;
    use crate::types::PAGE_SIZE;

    fn kernel() -> Kernel {
        hosted_kernel(KernelConfig::new()).unwrap().0
    }

    #[test]
    fn test_is_user_range() {
        assert!(is_user_address(0x1000));
        assert!(is_user_address(USER_SPACE_END));
        assert!(!is_user_address(usize::MAX));
        assert!(is_user_range(0x1000, 0x100));
        assert!(is_user_range(0, 0));
        assert!(!is_user_range(usize::MAX - 10, 100));
    }

    #[test]
    fn test_validate_user_range() {
        assert_eq!(validate_user_range(0, 10), Err(CopyError::BadAddress));
        assert_eq!(validate_user_range(0x1000, COPYIO_MAX_SIZE + 1), Err(CopyError::TooLarge));
        assert_eq!(validate_user_range(USER_SPACE_END, 2), Err(CopyError::BadAddress));
        assert!(validate_user_range(0x1000, 16).is_ok());
        assert_eq!(CopyError::PageFault.to_errno(), -2);
    }

    #[test]
    fn test_fault_mask_bits() {
        assert_eq!(FaultMask::from(CpuFault::PAGE_FAULT), FaultMask::PAGE_FAULT);
        assert!(FaultMask::all().covers(CpuFault(30)));
        assert!(!FaultMask::empty().covers(CpuFault::PAGE_FAULT));
        assert!(FaultMask::USER_ACCESS.covers(CpuFault::GENERAL_PROTECTION));
        assert_eq!(CpuFault::PAGE_FAULT.bit(), 1 << 14);
    }

    #[test]
    fn test_call_without_fault_returns_zero() {
        let mut k = kernel();
        let mut ran = false;
        let r = k.fault_resumable_call(FaultMask::all(), |_| {
            ran = true;
            Ok(())
        });
        assert_eq!(r, 0);
        assert!(ran);
        assert_eq!(k.task(k.current()).unwrap().fault_resume_mask(), FaultMask::empty());
    }

    #[test]
    fn test_fault_restores_preemption() {
        let mut k = kernel();
        let r = k.fault_resumable_call(FaultMask::DIVISION_BY_ZERO, |k| {
            k.disable_preemption();
            Err(CpuFault::DIVISION_BY_ZERO)
        });
        assert_eq!(r, CpuFault::DIVISION_BY_ZERO.bit());
        assert!(k.is_preemption_enabled());
    }

    #[test]
    fn test_nested_calls_restore_mask() {
        let mut k = kernel();
        let r = k.fault_resumable_call(FaultMask::all(), |k| {
            let inner = k.fault_resumable_call(FaultMask::PAGE_FAULT, |_| Err(CpuFault::PAGE_FAULT));
            assert_eq!(inner, CpuFault::PAGE_FAULT.bit());
            let tid = k.current();
            assert_eq!(k.task(tid).unwrap().fault_resume_mask(), FaultMask::all());
            // the outer mask covers this one
            Err(CpuFault::GENERAL_PROTECTION)
        });
        assert_eq!(r, CpuFault::GENERAL_PROTECTION.bit());
    }

    #[test]
    #[should_panic(expected = "unhandled fault")]
    fn test_unexpected_fault_is_fatal() {
        let mut k = kernel();
        let _ = k.fault_resumable_call(FaultMask::DIVISION_BY_ZERO, |_| Err(CpuFault::PAGE_FAULT));
    }

    #[test]
    fn test_copy_roundtrip_and_faults() {
        let mut k = kernel();
        let mut mem = HostedUserMemory::new();
        mem.map(0x40_0000, 1, true);

        assert_eq!(k.copy_to_user(&mut mem, 0x40_0010, b"hello\0"), Ok(6));
        let mut buf = [0u8; 5];
        assert_eq!(k.copy_from_user(&mem, 0x40_0010, &mut buf), Ok(5));
        assert_eq!(&buf, b"hello");

        let mut name = [0u8; 16];
        assert_eq!(k.copy_str_from_user(&mem, 0x40_0010, &mut name), Ok(5));
        let mut short = [0u8; 3];
        assert_eq!(k.copy_str_from_user(&mem, 0x40_0010, &mut short), Err(CopyError::TooLarge));

        // crosses into an unmapped page
        let mut big = [0u8; 32];
        let end = 0x40_0000 + PAGE_SIZE - 16;
        assert_eq!(k.copy_from_user(&mem, end, &mut big), Err(CopyError::PageFault));
        assert_eq!(k.copy_from_user(&mem, 0, &mut big), Err(CopyError::BadAddress));

        mem.map(0x50_0000, 1, false);
        assert_eq!(k.copy_to_user(&mut mem, 0x50_0000, b"x"), Err(CopyError::Protection));
        assert!(k.is_preemption_enabled());
    }
}
