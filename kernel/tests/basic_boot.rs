//! AS4: `kernel_test`-gated integration-test binary. Runs the same C16 boot
//! sequence as `src/main.rs` up through C12, then spawns a test-runner task
//! in place of *initd* so `test_harness::run_tests` executes with a real
//! `current_task` (several tests — signal handler installation, voluntary
//! yield — need one to exist).

#![no_std]
#![no_main]

extern crate alloc;
extern crate kernel;

use core::sync::atomic::Ordering;

use kernel::interrupt;
use kernel::limine_requests::{BASE_REVISION, MEMORY_MAP_REQUEST, RSDP_REQUEST};
use kernel::memory::cpu_local_data::get_local;
use kernel::memory::guarded_stack::{GuardedStack, NORMAL_STACK_SIZE, StackId, StackType};
use kernel::sync::ticket_lock::IrqSaveTicketLock;
use kernel::task::ready_queue::ReadyQueues;
use kernel::{acpi, apic, boot_config, gdt, hlt_loop, signal, task, test_harness, time, virtio};

#[path = "../src/logger.rs"]
mod logger;

extern "C" fn idle_task(_arg: u64) -> ! {
    hlt_loop();
}

extern "C" fn test_runner(_arg: u64) -> ! {
    test_harness::run_tests();
}

fn spawn_test_runner() -> ! {
    let cpu = get_local();
    let memory = kernel::memory::MEMORY.get().expect("memory not initialized");

    let queues_lock = cpu
        .ready_queues
        .call_once(|| IrqSaveTicketLock::new(ReadyQueues::new()));

    let idle_id = task::table::create_task(0, cpu.kernel_id, &memory.pages, &memory.physical, idle_task, 0)
        .expect("failed to create idle task");
    let runner_id = task::table::create_task(1, cpu.kernel_id, &memory.pages, &memory.physical, test_runner, 0)
        .expect("failed to create test-runner task");

    let runner_context = {
        let mut queues = queues_lock.lock(cpu.kernel_id as i32);
        queues.idle_task = Some(idle_id);
        queues.enqueue(runner_id, 1);
        task::table::task_ref(runner_id)
            .expect("test-runner task vanished immediately after creation")
            .context_ptr()
    };

    cpu.current_task.store(
        task::table::task_ref(runner_id).unwrap() as *const _ as *mut _,
        Ordering::SeqCst,
    );

    unsafe { interrupt::load_context_and_iretq(runner_context) };
}

#[cfg(feature = "kernel_test")]
#[unsafe(no_mangle)]
unsafe extern "C" fn kernel_main() -> ! {
    assert!(BASE_REVISION.is_supported());

    let config = boot_config::parse();
    logger::init(&config).unwrap();
    log::info!("kernel_test boot: bringing up core subsystems under test.");

    unsafe { kernel::memory::cpu_local_data::init_bsp() };
    interrupt::nmi_handler_state::init();

    // Must run before `gdt::init()`: its IST exception stack goes through
    // `GuardedStack`, which needs `MEMORY` up.
    let memory_map = MEMORY_MAP_REQUEST.get_response().unwrap();
    unsafe { kernel::memory::init_bsp(memory_map) };

    gdt::init();
    interrupt::idt::init();

    time::tsc::calibrate(&config);
    time::lapic_timer::init();

    task::table::init();

    signal::init();
    virtio::init(None);

    let stack = GuardedStack::new_kernel(
        NORMAL_STACK_SIZE,
        StackId {
            kind: StackType::Normal,
            cpu_id: get_local().kernel_id,
        },
    );
    unsafe { stack.switch(run_on_new_stack) };
}

extern "sysv64" fn run_on_new_stack() -> ! {
    let rsdp = RSDP_REQUEST.get_response().unwrap();
    let acpi_tables = acpi::parse(rsdp);
    apic::init_bsp(&acpi_tables);
    apic::init_local_apic();

    spawn_test_runner();
}

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("[failed]\n{info}");
    test_harness::exit_qemu(test_harness::QemuExitCode::Failed);
    hlt_loop();
}
