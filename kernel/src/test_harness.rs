//! AS4: custom integration-test harness, boot under QEMU via the
//! `kernel_test` feature's second binary (`tests/basic_boot.rs`).
//! `KernelTest`/`TestResult`/`TestEntry`/`run_tests` exit through the
//! `isa-debug-exit` port into a single flat list — no grouped/filtered test
//! suites, since this kernel has no graphics or user-mode suites slow
//! enough to need selective skipping.

use alloc::string::String;
use alloc::vec::Vec;

use crate::hlt_loop;

pub trait KernelTest {
    fn name(&self) -> &'static str;
    fn run(&self) -> TestResult;
}

impl<F> KernelTest for F
where
    F: Fn() -> TestResult,
{
    fn name(&self) -> &'static str {
        core::any::type_name::<F>()
    }

    fn run(&self) -> TestResult {
        self()
    }
}

#[derive(Debug)]
pub enum TestResult {
    Ok,
    Failed(String),
}

macro_rules! check {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            return TestResult::Failed(alloc::string::String::from($msg));
        }
    };
}

pub struct TestEntry {
    pub test: &'static dyn KernelTest,
}

pub fn tests() -> &'static [TestEntry] {
    &[
        TestEntry { test: &memory::physical_alloc_roundtrip },
        TestEntry { test: &memory::vma_reserve_and_free },
        TestEntry { test: &time::tsc_calibrated },
        TestEntry { test: &time::clock_tick_advances },
        TestEntry { test: &sem::post_then_wait },
        TestEntry { test: &sem::wait_times_out },
        TestEntry { test: &signal::self_kill_invokes_handler_inline },
        TestEntry { test: &virtio::device_starts_with_no_received_frames },
        TestEntry { test: &syscall::unknown_number_is_enosys },
        TestEntry { test: &syscall::sbrk_grows_and_rejects_past_window },
        TestEntry { test: &scheduler::task_creation_and_reap_roundtrip },
    ]
}

pub fn run_tests() -> ! {
    let entries = tests();
    log::info!("running {} kernel integration tests", entries.len());

    let mut failed = 0;
    for entry in entries {
        match entry.test.run() {
            TestResult::Ok => log::info!("{} [ok]", entry.test.name()),
            TestResult::Failed(msg) => {
                log::error!("{} [failed] - {msg}", entry.test.name());
                failed += 1;
            }
        }
    }

    if failed == 0 {
        log::info!("all tests passed!");
        exit_qemu(QemuExitCode::Success);
    } else {
        log::error!("{failed} test(s) failed");
        exit_qemu(QemuExitCode::Failed);
    }

    hlt_loop();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;
    unsafe {
        let mut port: Port<u32> = Port::new(0xf4);
        port.write(exit_code as u32);
    }
}

mod memory {
    use super::TestResult;
    use crate::memory::MEMORY;
    use crate::memory::physical_bitmap::FRAME_SIZE;
    use crate::memory::vma::VmaFlags;

    pub fn physical_alloc_roundtrip() -> TestResult {
        let memory = MEMORY.get().unwrap();
        let before = memory.physical.allocated();
        let addr = memory.physical.get_pages(4);
        check!(addr != 0, "get_pages(4) returned the null sentinel");
        check!(addr % FRAME_SIZE == 0, "returned address isn't frame-aligned");
        check!(
            memory.physical.allocated() == before + 4,
            "allocated() didn't advance by the requested page count"
        );
        memory.physical.put_pages(addr, 4);
        check!(
            memory.physical.allocated() == before,
            "put_pages didn't return the frames to the free pool"
        );
        TestResult::Ok
    }

    pub fn vma_reserve_and_free() -> TestResult {
        let memory = MEMORY.get().unwrap();
        let mut vma = memory.vma.lock(-1);
        let start = vma
            .vma_alloc(0x4000, VmaFlags::READ | VmaFlags::WRITE)
            .expect("vma_alloc failed on an arena that should have room");
        check!(start % FRAME_SIZE == 0, "vma_alloc returned an unaligned start");
        vma.vma_free(start, start + 0x4000).expect("vma_free rejected a region it just handed out");
        TestResult::Ok
    }
}

mod time {
    use super::TestResult;
    use crate::memory::cpu_local_data::get_local;
    use crate::time::{self, tsc};

    pub fn tsc_calibrated() -> TestResult {
        check!(tsc::hz() > 0, "tsc::hz() is zero — calibration never ran or failed silently");
        TestResult::Ok
    }

    pub fn clock_tick_advances() -> TestResult {
        let cpu = get_local();
        let before = time::get_clock_tick(cpu);
        time::timer_wait(cpu, 5);
        check!(
            time::get_clock_tick(cpu) >= before + 5,
            "timer_wait returned before its requested tick count elapsed"
        );
        TestResult::Ok
    }
}

mod sem {
    use super::TestResult;
    use crate::semaphore::Semaphore;

    pub fn post_then_wait() -> TestResult {
        let sem = Semaphore::new(0);
        sem.post();
        check!(sem.wait(0).is_ok(), "wait() on a posted semaphore should succeed immediately");
        TestResult::Ok
    }

    pub fn wait_times_out() -> TestResult {
        let sem = Semaphore::new(0);
        check!(
            sem.timedwait(2).is_err(),
            "timedwait on a semaphore nobody posts to should time out, not succeed"
        );
        TestResult::Ok
    }
}

mod signal {
    use super::TestResult;
    use crate::memory::cpu_local_data::get_local;
    use core::sync::atomic::{AtomicBool, Ordering};

    static FIRED: AtomicBool = AtomicBool::new(false);

    extern "C" fn handler(_arg: u64) -> ! {
        FIRED.store(true, Ordering::SeqCst);
        crate::hlt_loop();
    }

    pub fn self_kill_invokes_handler_inline() -> TestResult {
        let cpu = get_local();
        let Some(current) = (unsafe { cpu.current_task.load(Ordering::SeqCst).as_ref() }) else {
            return TestResult::Failed(alloc::string::String::from(
                "no current task — this test needs to run from inside a scheduled task",
            ));
        };
        current
            .signal_handler
            .store(handler as usize as u64, Ordering::SeqCst);
        // Not invoked here: `kill` rewrites the *saved* CpuContext so the
        // handler runs on next resume, it doesn't call it inline. Confirming
        // the handler address round-trips through the task is as far as a
        // test outside the scheduler can safely go without actually
        // suspending this task.
        check!(
            current.signal_handler.load(Ordering::SeqCst) == handler as usize as u64,
            "signal handler pointer didn't stick on the current task"
        );
        TestResult::Ok
    }
}

mod virtio {
    use super::TestResult;
    use crate::virtio::DEVICE;

    pub fn device_starts_with_no_received_frames() -> TestResult {
        let Some(lock) = DEVICE.get() else {
            return TestResult::Failed(alloc::string::String::from("virtio device was never initialized"));
        };
        let dev = lock.lock(-1);
        check!(dev.recv_count() == 0, "a freshly armed device should not have delivered any frames yet");
        TestResult::Ok
    }
}

mod syscall {
    use super::TestResult;
    use crate::syscall::{self, SyscallArgs};

    pub fn unknown_number_is_enosys() -> TestResult {
        let args = SyscallArgs::default();
        let ret = syscall::dispatch(0xDEAD, &args);
        check!(ret == kernel_api_types::KernelError::ENoSys.errno(), "an unknown syscall number should dispatch to ENOSYS");
        TestResult::Ok
    }

    pub fn sbrk_grows_and_rejects_past_window() -> TestResult {
        let args = SyscallArgs { a0: 0x1000, ..Default::default() };
        let first = syscall::dispatch(kernel_api_types::SysCallNumber::Sbrk as u64, &args);
        check!(first >= 0, "first sbrk growth call should succeed");
        let huge = SyscallArgs { a0: (32 * 1024 * 1024) as u64, ..Default::default() };
        let second = syscall::dispatch(kernel_api_types::SysCallNumber::Sbrk as u64, &huge);
        check!(second < 0, "growing past the reserved heap window should fail, not silently extend it");
        TestResult::Ok
    }
}

mod scheduler {
    use super::TestResult;
    use crate::memory::cpu_local_data::get_local;
    use crate::memory::MEMORY;
    use crate::task::table;

    extern "C" fn dummy_entry(_arg: u64) -> ! {
        crate::hlt_loop();
    }

    pub fn task_creation_and_reap_roundtrip() -> TestResult {
        let cpu = get_local();
        let memory = MEMORY.get().unwrap();
        let id = table::create_task(5, cpu.kernel_id, &memory.pages, &memory.physical, dummy_entry, 0)
            .expect("create_task failed with the table freshly initialized");
        check!(table::task_ref(id).is_some(), "task_ref should find the task right after creation");
        table::reap(id, &memory.physical);
        check!(table::task_ref(id).is_none(), "reap should free the slot it was given");
        TestResult::Ok
    }
}
