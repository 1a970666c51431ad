#![no_std]

//! Types shared between the kernel's syscall ABI and anything calling into it
//! (the libc shim is external; this crate is the narrow contract between them).

/// The fixed numbered syscall table. Entries with no handler installed
/// dispatch to `-ENOSYS`.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SysCallNumber {
    Exit = 0,
    Read = 1,
    Write = 2,
    Open = 3,
    Close = 4,
    Sbrk = 5,
    Fork = 6,
    Wait = 7,
    Execve = 8,
    Times = 9,
    Stat = 10,
    Dup = 11,
    MSleep = 12,
    Yield = 13,
    SemInit = 14,
    SemDestroy = 15,
    SemWait = 16,
    SemPost = 17,
    SemTimedwait = 18,
    GetPrio = 19,
    SetPrio = 20,
    Clone = 21,
    SemCancelableWait = 22,
    GetTicks = 23,
    Kill = 24,
    Signal = 25,
}

pub const SYSCALL_COUNT: usize = 32;

impl SysCallNumber {
    pub const fn from_u64(n: u64) -> Option<Self> {
        Some(match n {
            0 => Self::Exit,
            1 => Self::Read,
            2 => Self::Write,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Sbrk,
            6 => Self::Fork,
            7 => Self::Wait,
            8 => Self::Execve,
            9 => Self::Times,
            10 => Self::Stat,
            11 => Self::Dup,
            12 => Self::MSleep,
            13 => Self::Yield,
            14 => Self::SemInit,
            15 => Self::SemDestroy,
            16 => Self::SemWait,
            17 => Self::SemPost,
            18 => Self::SemTimedwait,
            19 => Self::GetPrio,
            20 => Self::SetPrio,
            21 => Self::Clone,
            22 => Self::SemCancelableWait,
            23 => Self::GetTicks,
            24 => Self::Kill,
            25 => Self::Signal,
            _ => return None,
        })
    }
}

/// Negative-integer error taxonomy shared by the syscall ABI, the uhyve port-I/O
/// protocol and the proxy TCP protocol (all three multiplex the same numbers).
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    EInval = -22,
    ENoMem = -12,
    ENoSpc = -28,
    EOverflow = -75,
    ENoEnt = -2,
    ENoDev = -19,
    EAccess = -13,
    EPerm = -1,
    ETime = -62,
    ENoSys = -38,
}

impl KernelError {
    pub const fn errno(self) -> i64 {
        self as i32 as i64
    }
}

/// uhyve reserved hypervisor port numbers (§6).
pub mod uhyve_ports {
    pub const WRITE: u16 = 0x499;
    pub const OPEN: u16 = 0x500;
    pub const CLOSE: u16 = 0x501;
    pub const READ: u16 = 0x502;
    pub const EXIT: u16 = 0x503;
    pub const LSEEK: u16 = 0x504;
    pub const NETINFO: u16 = 0x505;
    pub const NETWRITE: u16 = 0x506;
    pub const NETREAD: u16 = 0x507;
    pub const NETSTAT: u16 = 0x508;
}

/// Proxy TCP control-channel constants (§6).
pub const PROXY_MAGIC: i32 = 0x7E317;
pub const PROXY_CONTROL_PORT: u16 = 0x494E;
