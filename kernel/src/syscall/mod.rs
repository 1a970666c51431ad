//! C15: syscall surface.
//!
//! A fixed numbered dispatch table over `kernel_api_types::SysCallNumber`,
//! mirroring the numbered-vector style of the IDT (`interrupt::idt`)
//! rather than a big `match`. Entries with no handler installed dispatch to
//! `-ENOSYS`, same as an unpopulated IDT vector falls through to a default.
//!
//! Two transports carry these numbers outside the kernel (§6): uhyve's
//! reserved port I/O (`transport::uhyve`) and the side-by-side proxy's TCP
//! control channel. Only the uhyve transport is implemented here — the
//! proxy transport needs a live TCP stack this kernel doesn't have yet
//! (virtio-net exists, LwIP does not, per §1 Non-goals), so its handlers
//! are left as the same `-ENOSYS` the dispatch table already falls back to.

pub mod handlers;
pub mod transport;

use kernel_api_types::{KernelError, SYSCALL_COUNT, SysCallNumber};

/// The six general-purpose argument registers a syscall handler sees,
/// named for their ABI role rather than a specific register.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
}

pub type SyscallFn = fn(&SyscallArgs) -> i64;

const fn table() -> [Option<SyscallFn>; SYSCALL_COUNT] {
    let mut t: [Option<SyscallFn>; SYSCALL_COUNT] = [None; SYSCALL_COUNT];
    t[SysCallNumber::Exit as usize] = Some(handlers::sys_exit);
    t[SysCallNumber::Read as usize] = Some(handlers::sys_read);
    t[SysCallNumber::Write as usize] = Some(handlers::sys_write);
    t[SysCallNumber::Open as usize] = Some(handlers::sys_open);
    t[SysCallNumber::Close as usize] = Some(handlers::sys_close);
    t[SysCallNumber::Sbrk as usize] = Some(handlers::sys_sbrk);
    t[SysCallNumber::Fork as usize] = Some(handlers::sys_unsupported);
    t[SysCallNumber::Wait as usize] = Some(handlers::sys_unsupported);
    t[SysCallNumber::Execve as usize] = Some(handlers::sys_unsupported);
    t[SysCallNumber::Times as usize] = Some(handlers::sys_times);
    t[SysCallNumber::Stat as usize] = Some(handlers::sys_unsupported);
    t[SysCallNumber::Dup as usize] = Some(handlers::sys_unsupported);
    t[SysCallNumber::MSleep as usize] = Some(handlers::sys_msleep);
    t[SysCallNumber::Yield as usize] = Some(handlers::sys_yield);
    t[SysCallNumber::SemInit as usize] = Some(handlers::sys_sem_init);
    t[SysCallNumber::SemDestroy as usize] = Some(handlers::sys_sem_destroy);
    t[SysCallNumber::SemWait as usize] = Some(handlers::sys_sem_wait);
    t[SysCallNumber::SemPost as usize] = Some(handlers::sys_sem_post);
    t[SysCallNumber::SemTimedwait as usize] = Some(handlers::sys_sem_timedwait);
    t[SysCallNumber::GetPrio as usize] = Some(handlers::sys_getprio);
    t[SysCallNumber::SetPrio as usize] = Some(handlers::sys_setprio);
    t[SysCallNumber::Clone as usize] = Some(handlers::sys_unsupported);
    t[SysCallNumber::SemCancelableWait as usize] = Some(handlers::sys_sem_wait);
    t[SysCallNumber::GetTicks as usize] = Some(handlers::sys_get_ticks);
    t[SysCallNumber::Kill as usize] = Some(handlers::sys_kill);
    t[SysCallNumber::Signal as usize] = Some(handlers::sys_signal);
    t
}

static TABLE: [Option<SyscallFn>; SYSCALL_COUNT] = table();

/// Looks up and invokes the handler for `nr`. Unknown numbers or
/// unpopulated table slots both return `-ENOSYS`.
pub fn dispatch(nr: u64, args: &SyscallArgs) -> i64 {
    let Some(number) = SysCallNumber::from_u64(nr) else {
        return KernelError::ENoSys.errno();
    };
    match TABLE[number as usize] {
        Some(f) => f(args),
        None => KernelError::ENoSys.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_number_is_enosys() {
        let args = SyscallArgs::default();
        assert_eq!(dispatch(9999, &args), KernelError::ENoSys.errno());
    }

    #[test]
    fn get_ticks_is_populated() {
        assert!(TABLE[SysCallNumber::GetTicks as usize].is_some());
    }

    #[test]
    fn fork_execve_clone_are_unsupported_not_missing() {
        // These dispatch to a real handler that returns ENOSYS, rather than
        // an empty table slot — distinguishing "rejected by policy" from
        // "not wired up yet" even though both surface the same errno.
        assert!(TABLE[SysCallNumber::Fork as usize].is_some());
        assert!(TABLE[SysCallNumber::Execve as usize].is_some());
        assert!(TABLE[SysCallNumber::Clone as usize].is_some());
    }
}
