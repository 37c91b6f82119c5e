//! Raw bindings for the Linux `mmap` and `munmap` system calls.
//!
//! This crate talks to the kernel directly through the system call
//! instruction, so it works in programs that link neither a C library nor the
//! Rust standard library. Only Linux on `x86_64` and `aarch64` is supported; on
//! any other target the calls panic with `unimplemented!`.
//!
//! Failures are reported as [`Errno`] values decoded from the raw return
//! register.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::{error::Error, fmt, ptr::NonNull};

use bitflags::bitflags;

pub mod raw;

/// Size of a virtual memory page in bytes.
pub const PAGE_SIZE: usize = 4096;
const PAGE_SHIFT: usize = 12;
const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

/// Largest error number the kernel encodes in a system call return value.
const MAX_ERRNO: usize = 4095;

/// An error number returned by a failed system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(i32);

impl Errno {
    /// Operation not permitted.
    pub const EPERM: Self = Self(1);

    /// Bad file descriptor.
    pub const EBADF: Self = Self(9);

    /// Resource temporarily unavailable.
    pub const EAGAIN: Self = Self(11);

    /// Out of memory.
    pub const ENOMEM: Self = Self(12);

    /// Permission denied.
    pub const EACCES: Self = Self(13);

    /// File exists.
    pub const EEXIST: Self = Self(17);

    /// No such device.
    pub const ENODEV: Self = Self(19);

    /// Invalid argument.
    pub const EINVAL: Self = Self(22);

    /// Too many open files in system.
    pub const ENFILE: Self = Self(23);

    /// Value too large for defined data type.
    pub const EOVERFLOW: Self = Self(75);

    /// Creates an `Errno` from a positive error number.
    #[must_use]
    pub const fn from_raw(code: i32) -> Self {
        Self(code)
    }

    /// Returns the positive error number.
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Decodes a raw system call return value.
    ///
    /// Values in the range `-4095..=-1` (viewed as signed) are errors; anything
    /// else is a successful result and is returned unchanged.
    pub fn from_ret(ret: usize) -> Result<usize, Self> {
        let errno = ret.wrapping_neg();
        if (1..=MAX_ERRNO).contains(&errno) {
            #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            return Err(Self(errno as i32));
        }
        Ok(ret)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::EPERM => write!(f, "operation not permitted"),
            Self::EBADF => write!(f, "bad file descriptor"),
            Self::EAGAIN => write!(f, "resource temporarily unavailable"),
            Self::ENOMEM => write!(f, "out of memory"),
            Self::EACCES => write!(f, "permission denied"),
            Self::EEXIST => write!(f, "file exists"),
            Self::ENODEV => write!(f, "no such device"),
            Self::EINVAL => write!(f, "invalid argument"),
            Self::ENFILE => write!(f, "too many open files in system"),
            Self::EOVERFLOW => write!(f, "value too large for defined data type"),
            Self(code) => write!(f, "unknown error ({code})"),
        }
    }
}

impl Error for Errno {}

bitflags! {
    /// Memory protection of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: usize {
        /// Pages may be read.
        const READ = 1 << 0;

        /// Pages may be written.
        const WRITE = 1 << 1;

        /// Pages may be executed.
        const EXEC = 1 << 2;

        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl Protection {
    /// Pages may not be accessed.
    pub const NONE: Self = Self::empty();
}

bitflags! {
    /// Flags controlling how a mapping is shared and backed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: usize {
        /// Updates are visible to other processes mapping the same region.
        const SHARED = 0x01;

        /// Copy-on-write mapping private to this process.
        const PRIVATE = 0x02;

        /// Place the mapping at exactly the given address.
        const FIXED = 0x10;

        /// The mapping is not backed by any file and is zero-filled.
        const ANONYMOUS = 0x20;
    }
}

/// Maps `len` bytes of memory.
///
/// `len` is rounded up to a whole number of pages by the kernel.
///
/// # Safety
///
/// With [`MapFlags::FIXED`] this replaces any existing mapping at `addr`,
/// which invalidates every reference into it. The caller must also pass a
/// valid file descriptor unless [`MapFlags::ANONYMOUS`] is set.
pub unsafe fn mmap(
    addr: *mut u8,
    len: usize,
    prot: Protection,
    flags: MapFlags,
    fd: i32,
    offset: usize,
) -> Result<NonNull<u8>, Errno> {
    let ret = unsafe {
        raw::syscall6(
            raw::SYS_MMAP,
            addr.expose_provenance(),
            len,
            prot.bits(),
            flags.bits(),
            (fd as isize).cast_unsigned(),
            offset,
        )
    };
    let addr = Errno::from_ret(ret)?;
    NonNull::new(core::ptr::with_exposed_provenance_mut(addr)).ok_or(Errno::ENOMEM)
}

/// Removes the mappings for the `len` bytes starting at `addr`.
///
/// # Safety
///
/// No live reference may point into the unmapped range, and the range must
/// not belong to memory owned by someone else.
pub unsafe fn munmap(addr: *mut u8, len: usize) -> Result<(), Errno> {
    let ret = unsafe {
        raw::syscall6(raw::SYS_MUNMAP, addr.expose_provenance(), len, 0, 0, 0, 0)
    };
    Errno::from_ret(ret).map(|_| ())
}

/// Maps `len` bytes of fresh, private, anonymous memory with the given
/// protection.
///
/// The memory is zero-filled by the kernel and never overlaps an existing
/// mapping.
pub fn map_anonymous(len: usize, prot: Protection) -> Result<NonNull<u8>, Errno> {
    unsafe {
        mmap(
            core::ptr::null_mut(),
            len,
            prot,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            -1,
            0,
        )
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_from_ret() {
        assert_eq!(Errno::from_ret(0x7f00_0000_0000), Ok(0x7f00_0000_0000));
        assert_eq!(Errno::from_ret(0), Ok(0));
        assert_eq!(Errno::from_ret(12_usize.wrapping_neg()), Err(Errno::ENOMEM));
        assert_eq!(Errno::from_ret(1_usize.wrapping_neg()), Err(Errno::EPERM));
        assert_eq!(
            Errno::from_ret(4095_usize.wrapping_neg()),
            Err(Errno::from_raw(4095))
        );
        assert_eq!(
            Errno::from_ret(4096_usize.wrapping_neg()),
            Ok(4096_usize.wrapping_neg())
        );
    }

    #[test]
    fn test_errno_display() {
        assert_eq!(Errno::ENOMEM.to_string(), "out of memory");
        assert_eq!(Errno::EINVAL.to_string(), "invalid argument");
        assert_eq!(Errno::from_raw(200).to_string(), "unknown error (200)");
    }

    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn test_map_write_unmap() {
        let len = PAGE_SIZE * 2;
        let ptr = map_anonymous(len, Protection::RW).unwrap();
        assert_eq!(ptr.addr().get() % PAGE_SIZE, 0);
        unsafe {
            let bytes = core::slice::from_raw_parts_mut(ptr.as_ptr(), len);
            assert!(bytes.iter().all(|&b| b == 0));
            bytes.fill(0xa5);
            assert_eq!(bytes[len - 1], 0xa5);
            munmap(ptr.as_ptr(), len).unwrap();
        }
    }

    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn test_map_errors() {
        assert_eq!(map_anonymous(0, Protection::RW), Err(Errno::EINVAL));

        let ptr = map_anonymous(PAGE_SIZE, Protection::RW).unwrap();
        unsafe {
            let unaligned = ptr.as_ptr().add(1);
            assert_eq!(munmap(unaligned, PAGE_SIZE), Err(Errno::EINVAL));
            munmap(ptr.as_ptr(), PAGE_SIZE).unwrap();
        }
    }
}
