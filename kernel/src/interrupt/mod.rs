use num_enum::IntoPrimitive;

pub mod idt;
pub mod nmi_handler_state;
pub(crate) mod handlers;

pub use handlers::{handle_panic_from_other_cpu, load_context_and_iretq};

#[derive(Debug, IntoPrimitive)]
#[repr(u8)]
pub enum InterruptVector {
    LocalApicSpurious = 0x20,
    LocalApicTimer,
    LocalApicError,
    /// C12: dedicated IPI vector a `kill()` sender uses to wake the target
    /// core's signal-ring drain.
    Signal,
    /// C14: virtio-net device interrupt (used RX/TX descriptors ready).
    VirtioNet,
}