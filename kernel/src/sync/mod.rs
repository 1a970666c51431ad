//! Atomic primitives and ticket-based spinlocks (C1, C2).

pub mod atomic;
pub mod ticket_lock;

pub use atomic::{full_barrier, read_barrier, write_barrier};
pub use ticket_lock::{IrqSaveTicketLock, TicketLock};
