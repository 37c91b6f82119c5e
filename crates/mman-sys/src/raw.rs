//! System call numbers and the six-argument system call trampoline.

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        pub const SYS_MMAP: usize = 9;
        pub const SYS_MUNMAP: usize = 11;
    } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        pub const SYS_MMAP: usize = 222;
        pub const SYS_MUNMAP: usize = 215;
    } else {
        pub const SYS_MMAP: usize = usize::MAX;
        pub const SYS_MUNMAP: usize = usize::MAX;
    }
}

/// Invokes system call `number` with six arguments and returns the raw
/// result register.
///
/// # Safety
///
/// This function is unsafe because it performs a raw system call, which may
/// have side effects or cause undefined behavior if used incorrectly.
#[inline]
#[cfg_attr(
    not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )),
    expect(unused_variables)
)]
#[must_use]
pub unsafe fn syscall6(
    number: usize,
    arg0: usize,
    arg1: usize,
    arg2: usize,
    arg3: usize,
    arg4: usize,
    arg5: usize,
) -> usize {
    match () {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        () => {
            let ret;

            unsafe {
                core::arch::asm!(
                    "syscall",
                    inlateout("rax") number => ret,
                    in("rdi") arg0,
                    in("rsi") arg1,
                    in("rdx") arg2,
                    in("r10") arg3,
                    in("r8") arg4,
                    in("r9") arg5,
                    lateout("rcx") _,
                    lateout("r11") _,
                    options(nostack),
                );
            }

            ret
        }
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        () => {
            let ret;

            unsafe {
                core::arch::asm!(
                    "svc 0",
                    in("x8") number,
                    inlateout("x0") arg0 => ret,
                    in("x1") arg1,
                    in("x2") arg2,
                    in("x3") arg3,
                    in("x4") arg4,
                    in("x5") arg5,
                    options(nostack),
                );
            }

            ret
        }
        #[cfg(not(all(
            target_os = "linux",
            any(target_arch = "x86_64", target_arch = "aarch64")
        )))]
        () => unimplemented!("unsupported target"),
    }
}
