//! uhyve port-I/O transport (§6).
//!
//! Each reserved port corresponds to one file-backed syscall. The guest
//! writes the physical address of a packed request struct to the port; the
//! host fills the struct's `ret`/`*_out` field synchronously before the
//! `outl` returns. Port access style (`x86::io::outl`) follows the
//! raw-port drivers elsewhere in this kernel (`ioapic`, `virtio`) rather
//! than the `x86_64::instructions::port` wrapper used for stack-typed
//! ports — uhyve's ABI is untyped 32-bit physical addresses.

use kernel_api_types::uhyve_ports;

#[repr(C)]
struct WriteRequest {
    fd: i32,
    data: u64,
    len: usize,
    ret: i64,
}

#[repr(C)]
struct ReadRequest {
    fd: i32,
    data: u64,
    len: usize,
    ret: i64,
}

#[repr(C)]
struct OpenRequest {
    name: u64,
    flags: i32,
    mode: i32,
    ret: i32,
}

#[repr(C)]
struct CloseRequest {
    fd: i32,
    ret: i32,
}

#[repr(C)]
struct LseekRequest {
    fd: i32,
    offset: i64,
    whence: i32,
    ret: i64,
}

fn hypercall(port: u16, addr: u64) {
    unsafe { x86::io::outl(port, addr as u32) };
}

pub fn write(fd: i32, data: *const u8, len: usize) -> i64 {
    let mut req = WriteRequest { fd, data: data as u64, len, ret: 0 };
    hypercall(uhyve_ports::WRITE, &mut req as *mut _ as u64);
    req.ret
}

pub fn read(fd: i32, data: *mut u8, len: usize) -> i64 {
    let mut req = ReadRequest { fd, data: data as u64, len, ret: 0 };
    hypercall(uhyve_ports::READ, &mut req as *mut _ as u64);
    req.ret
}

pub fn open(name: *const u8, flags: i32, mode: i32) -> i32 {
    let mut req = OpenRequest { name: name as u64, flags, mode, ret: 0 };
    hypercall(uhyve_ports::OPEN, &mut req as *mut _ as u64);
    req.ret
}

pub fn close(fd: i32) -> i32 {
    let mut req = CloseRequest { fd, ret: 0 };
    hypercall(uhyve_ports::CLOSE, &mut req as *mut _ as u64);
    req.ret
}

pub fn lseek(fd: i32, offset: i64, whence: i32) -> i64 {
    let mut req = LseekRequest { fd, offset, whence, ret: 0 };
    hypercall(uhyve_ports::LSEEK, &mut req as *mut _ as u64);
    req.ret
}

pub fn exit(status: i32) -> ! {
    #[repr(C)]
    struct ExitRequest {
        status: i32,
    }
    let mut req = ExitRequest { status };
    hypercall(uhyve_ports::EXIT, &mut req as *mut _ as u64);
    crate::hlt_loop()
}
