//! C14: virtio-net split-ring virtqueue driver.
//!
//! The ring bookkeeping (`VirtQueue`) is adapted from the virtio 1.1 split
//! queue implementation in the example pack (`levitate-virtio::queue`,
//! originally built for a virtio-GPU device) — same descriptor/avail/used
//! layout, free-list allocation, and `pop_used` bookkeeping, generalized
//! here to drive a virtio-net device's RX/TX pair instead of a single GPU
//! command queue. The notify register layout (`QUEUE_NOTIFY` at MMIO
//! offset 0x050) follows the same pack's `levitate-virtio::transport`.
//! LwIP itself is out of scope (§1 Non-goals): RX delivery ends at a
//! pluggable frame-received callback rather than handing pbufs to a stack
//! we don't have.

use bitflags::bitflags;
use core::sync::atomic::{Ordering, fence};
use spin::Once;
use x86_64::structures::idt::InterruptStackFrame;

use crate::memory::cpu_local_data::{get_local, try_get_local};
use crate::sync::ticket_lock::IrqSaveTicketLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtQueueError {
    QueueFull,
    InvalidDescriptor,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u16 {
        const NEXT = 1;
        const WRITE = 2;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct UsedRingEntry {
    id: u32,
    len: u32,
}

/// A split virtqueue: descriptor table, available ring, used ring, and the
/// free-descriptor list threaded through unused descriptors' `next` field.
pub struct VirtQueue<const SIZE: usize> {
    descriptors: [Descriptor; SIZE],
    avail_idx: u16,
    avail_ring: [u16; SIZE],
    used_idx: u16,
    used_ring: [UsedRingEntry; SIZE],
    free_head: u16,
    num_free: u16,
    last_used_idx: u16,
}

impl<const SIZE: usize> VirtQueue<SIZE> {
    pub const fn new() -> Self {
        Self {
            descriptors: [Descriptor { addr: 0, len: 0, flags: 0, next: 0 }; SIZE],
            avail_idx: 0,
            avail_ring: [0; SIZE],
            used_idx: 0,
            used_ring: [UsedRingEntry { id: 0, len: 0 }; SIZE],
            free_head: 0,
            num_free: SIZE as u16,
            last_used_idx: 0,
        }
    }

    /// Threads the free list through every descriptor slot. Must run before
    /// any `add_buffer` call.
    pub fn init(&mut self) {
        for i in 0..(SIZE - 1) {
            self.descriptors[i].next = (i + 1) as u16;
        }
        self.descriptors[SIZE - 1].next = 0;
        self.free_head = 0;
        self.num_free = SIZE as u16;
    }

    /// Publishes a single write-only (device-fills) buffer — the RX arming
    /// shape. Returns the descriptor index, which is stable across
    /// immediate re-arm (the freed descriptor becomes `free_head` again).
    pub fn add_write_buffer(&mut self, buf: &mut [u8]) -> Result<u16, VirtQueueError> {
        if self.num_free == 0 {
            return Err(VirtQueueError::QueueFull);
        }
        let head = self.free_head;
        let desc = &mut self.descriptors[head as usize];
        desc.addr = buf.as_mut_ptr() as u64;
        desc.len = buf.len() as u32;
        desc.flags = DescriptorFlags::WRITE.bits();
        self.free_head = desc.next;
        self.num_free -= 1;
        self.publish(head);
        Ok(head)
    }

    /// Publishes a single read-only (device-consumes) buffer — the TX shape.
    pub fn add_read_buffer(&mut self, buf: &[u8]) -> Result<u16, VirtQueueError> {
        if self.num_free == 0 {
            return Err(VirtQueueError::QueueFull);
        }
        let head = self.free_head;
        let desc = &mut self.descriptors[head as usize];
        desc.addr = buf.as_ptr() as u64;
        desc.len = buf.len() as u32;
        desc.flags = 0;
        self.free_head = desc.next;
        self.num_free -= 1;
        self.publish(head);
        Ok(head)
    }

    fn publish(&mut self, head: u16) {
        let slot = (self.avail_idx as usize) % SIZE;
        self.avail_ring[slot] = head;
        // Barrier (i): payload writes above must land before the index bump
        // below is visible to the device.
        fence(Ordering::SeqCst);
        self.avail_idx = self.avail_idx.wrapping_add(1);
    }

    fn has_used(&self) -> bool {
        fence(Ordering::SeqCst);
        self.last_used_idx != self.used_idx
    }

    /// Pops one used entry, returning `(descriptor id, bytes the device
    /// wrote)`. Returns the descriptor to the free list before returning.
    pub fn pop_used(&mut self) -> Option<(u16, u32)> {
        if !self.has_used() {
            return None;
        }
        let slot = (self.last_used_idx as usize) % SIZE;
        let entry = self.used_ring[slot];
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        let id = entry.id as u16;
        self.descriptors[id as usize].next = self.free_head;
        self.free_head = id;
        self.num_free += 1;

        Some((id, entry.len))
    }

    #[cfg(test)]
    fn test_push_used(&mut self, id: u16, len: u32) {
        let slot = (self.used_idx as usize) % SIZE;
        self.used_ring[slot] = UsedRingEntry { id: id as u32, len };
        self.used_idx = self.used_idx.wrapping_add(1);
    }
}

impl<const SIZE: usize> Default for VirtQueue<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

pub const VIRTIO_NET_HDR_LEN: usize = 12;
pub const MAX_FRAME_LEN: usize = 1792;
pub const QUEUE_SIZE: usize = 256;

/// Packet larger than a single buffer, or an attempt to arm an RX buffer
/// while the queue is already full of outstanding descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrIf;

pub struct VirtioNet {
    rx: VirtQueue<QUEUE_SIZE>,
    tx: VirtQueue<QUEUE_SIZE>,
    rx_buffers: alloc::boxed::Box<[[u8; MAX_FRAME_LEN]; QUEUE_SIZE]>,
    tx_buffers: alloc::boxed::Box<[[u8; MAX_FRAME_LEN]; QUEUE_SIZE]>,
    recv_count: u64,
    recv_dropped: u64,
    on_frame: Option<fn(&[u8])>,
    /// MMIO `QUEUE_NOTIFY` register (offset 0x050 in the virtio-mmio layout)
    /// for whichever transport this device was bound to. `send` writes the
    /// queue index here after the barrier-separated avail-ring bump.
    notify_reg: Option<*mut u32>,
}

// Safety: `notify_reg` points at device MMIO space, not at anything
// thread-local; the device itself is only ever reached through `DEVICE`'s
// lock.
unsafe impl Send for VirtioNet {}

impl VirtioNet {
    pub fn new() -> Self {
        let mut dev = Self {
            rx: VirtQueue::new(),
            tx: VirtQueue::new(),
            rx_buffers: alloc::boxed::Box::new([[0u8; MAX_FRAME_LEN]; QUEUE_SIZE]),
            tx_buffers: alloc::boxed::Box::new([[0u8; MAX_FRAME_LEN]; QUEUE_SIZE]),
            recv_count: 0,
            recv_dropped: 0,
            on_frame: None,
            notify_reg: None,
        };
        dev.rx.init();
        dev.tx.init();
        dev
    }

    pub fn set_frame_callback(&mut self, cb: fn(&[u8])) {
        self.on_frame = Some(cb);
    }

    /// Binds the device to a transport's `QUEUE_NOTIFY` MMIO register.
    ///
    /// # Safety
    /// `reg` must be a valid, mapped pointer to that transport's notify
    /// register for the lifetime of this device.
    pub unsafe fn bind_notify_register(&mut self, reg: *mut u32) {
        self.notify_reg = Some(reg);
    }

    /// Arms every RX descriptor with a fresh write-only buffer. Called once
    /// at device bring-up.
    pub fn arm_rx_all(&mut self) {
        for i in 0..QUEUE_SIZE {
            let _ = self.rx.add_write_buffer(&mut self.rx_buffers[i]);
        }
    }

    /// Drains every currently-used RX descriptor: for each, hands the
    /// payload (skipping the 12-byte virtio-net header) to the frame
    /// callback, then republishes the same buffer. Returns the number of
    /// frames drained this call.
    pub fn drain_rx(&mut self) -> usize {
        let mut drained = 0;
        while let Some((id, len)) = self.rx.pop_used() {
            self.recv_count += 1;
            drained += 1;
            let len = len as usize;
            if len > VIRTIO_NET_HDR_LEN && len <= MAX_FRAME_LEN {
                if let Some(cb) = self.on_frame {
                    cb(&self.rx_buffers[id as usize][VIRTIO_NET_HDR_LEN..len]);
                }
            } else {
                self.recv_dropped += 1;
            }
            // Re-arm the same buffer: `pop_used` just returned `id` to the
            // free list, so this allocation is guaranteed to reclaim it.
            let _ = self.rx.add_write_buffer(&mut self.rx_buffers[id as usize]);
        }
        drained
    }

    /// Transmits `payload` (a full Ethernet frame, header excluded — the
    /// 12-byte virtio-net header is zeroed ahead of it). Writes queue index 1
    /// to the bound `QUEUE_NOTIFY` register after the barrier-separated
    /// avail-ring bump, matching the device-notification discipline. A
    /// device with no notify register bound (e.g. under test) simply skips
    /// the MMIO write.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), ErrIf> {
        if payload.len() > MAX_FRAME_LEN - VIRTIO_NET_HDR_LEN {
            return Err(ErrIf);
        }
        // Reclaim descriptors the device has finished with before looking
        // for a free one.
        while self.tx.pop_used().is_some() {}

        let total_len = VIRTIO_NET_HDR_LEN + payload.len();
        let buf_idx = self.next_tx_slot().ok_or(ErrIf)?;
        let buf = &mut self.tx_buffers[buf_idx as usize];
        buf[..VIRTIO_NET_HDR_LEN].fill(0);
        buf[VIRTIO_NET_HDR_LEN..total_len].copy_from_slice(payload);

        self.tx.add_read_buffer(&buf[..total_len]).map_err(|_| ErrIf)?;
        // Barrier (ii): the avail-ring bump inside `add_read_buffer` must be
        // visible before the notify write below.
        fence(Ordering::SeqCst);
        if let Some(reg) = self.notify_reg {
            unsafe { reg.write_volatile(1) };
        }
        Ok(())
    }

    fn next_tx_slot(&self) -> Option<u16> {
        if self.tx.num_free > 0 { Some(self.tx.free_head) } else { None }
    }

    pub fn recv_count(&self) -> u64 {
        self.recv_count
    }

    pub fn recv_dropped(&self) -> u64 {
        self.recv_dropped
    }
}

impl Default for VirtioNet {
    fn default() -> Self {
        Self::new()
    }
}

/// The single virtio-net device this kernel drives, behind the same
/// irq-save ticket lock discipline as everything else shared with an
/// interrupt handler.
pub static DEVICE: Once<IrqSaveTicketLock<VirtioNet>> = Once::new();

fn core_id() -> i32 {
    try_get_local().map_or(-1, |c| c.kernel_id as i32)
}

/// Allocates the device and arms its RX ring. Called once during boot,
/// after the owning core's IDT and local APIC are up.
pub fn init(on_frame: Option<fn(&[u8])>) {
    DEVICE.call_once(|| {
        let mut dev = VirtioNet::new();
        if let Some(cb) = on_frame {
            dev.set_frame_callback(cb);
        }
        dev.arm_rx_all();
        IrqSaveTicketLock::new(dev)
    });
}

/// `InterruptVector::VirtioNet` handler: drains RX, reclaims finished TX
/// descriptors, EOIs. Unlike the timer/signal trampolines, the device
/// never needs to touch a task's saved registers, so a plain
/// `x86-interrupt` handler is enough — no naked save/restore dance.
pub extern "x86-interrupt" fn virtio_net_interrupt_handler(_frame: InterruptStackFrame) {
    let cpu = get_local();
    if let Some(lock) = DEVICE.get() {
        let mut dev = lock.lock(core_id());
        dev.drain_rx();
        while dev.tx.pop_used().is_some() {}
    }
    unsafe {
        let local_apic = &mut *cpu.local_apic.get().unwrap().get();
        local_apic.end_of_interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_drains_all_armed_then_more_after_rearm() {
        let mut q: VirtQueue<256> = VirtQueue::new();
        q.init();
        let mut bufs = alloc::boxed::Box::new([[0u8; MAX_FRAME_LEN]; 256]);
        for i in 0..256 {
            q.add_write_buffer(&mut bufs[i]).unwrap();
        }

        for i in 0..300u16 {
            q.test_push_used((i % 256), 64);
        }

        let mut drained_first = 0;
        while let Some((id, _)) = q.pop_used() {
            drained_first += 1;
            q.add_write_buffer(&mut bufs[id as usize]).unwrap();
        }
        assert_eq!(drained_first, 256);

        for i in 256..300u16 {
            q.test_push_used(i % 256, 64);
        }
        let mut drained_second = 0;
        while let Some((id, _)) = q.pop_used() {
            drained_second += 1;
            q.add_write_buffer(&mut bufs[id as usize]).unwrap();
        }
        assert_eq!(drained_second, 44);
    }

    #[test]
    fn add_write_buffer_fails_when_full() {
        let mut q: VirtQueue<4> = VirtQueue::new();
        q.init();
        let mut bufs = [[0u8; 8]; 4];
        for b in bufs.iter_mut() {
            q.add_write_buffer(b).unwrap();
        }
        let mut extra = [0u8; 8];
        assert_eq!(q.add_write_buffer(&mut extra), Err(VirtQueueError::QueueFull));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut dev = VirtioNet::new();
        dev.arm_rx_all();
        let huge = alloc::vec![0u8; MAX_FRAME_LEN];
        assert_eq!(dev.send(&huge), Err(ErrIf));
    }
}
