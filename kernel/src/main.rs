#![no_std]
#![no_main]

extern crate alloc;
extern crate kernel;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use kernel::interrupt;
use kernel::limine_requests::{BASE_REVISION, MEMORY_MAP_REQUEST, MP_REQUEST, RSDP_REQUEST};
use kernel::memory::cpu_local_data::get_local;
use kernel::memory::guarded_stack::{GuardedStack, NORMAL_STACK_SIZE, StackId, StackType};
use kernel::sync::ticket_lock::IrqSaveTicketLock;
use kernel::task::ready_queue::ReadyQueues;
use kernel::{acpi, apic, boot_config, gdt, hlt_loop, signal, task, time, virtio};

mod logger;

extern "C" fn idle_task(_arg: u64) -> ! {
    hlt_loop();
}

/// Stand-in for the one application a HermitCore image is statically linked
/// with — the application itself, and the libc shim it reaches syscalls
/// through, are out of scope here. This just keeps the scheduler and timer
/// busy so the core doesn't idle immediately after boot.
extern "C" fn initd(_arg: u64) -> ! {
    log::info!("initd: kernel core ready");
    loop {
        time::timer_wait(get_local(), 1000);
        task::switch::yield_now();
    }
}

/// Builds the idle and initd PCBs, wires the idle task into the BSP's ready
/// queues as the schedule-from-interrupt fallback, enqueues initd at the
/// head of its priority level, and jumps straight into it without waiting
/// for a timer tick.
fn spawn_initial_tasks() -> ! {
    let cpu = get_local();
    let memory = kernel::memory::MEMORY.get().expect("memory not initialized");

    let queues_lock = cpu
        .ready_queues
        .call_once(|| IrqSaveTicketLock::new(ReadyQueues::new()));

    let idle_id = task::table::create_task(0, cpu.kernel_id, &memory.pages, &memory.physical, idle_task, 0)
        .expect("failed to create idle task");
    let initd_id = task::table::create_task(1, cpu.kernel_id, &memory.pages, &memory.physical, initd, 0)
        .expect("failed to create initd task");

    let initd_context = {
        let mut queues = queues_lock.lock(cpu.kernel_id as i32);
        queues.idle_task = Some(idle_id);
        queues.enqueue(initd_id, 1);
        task::table::task_ref(initd_id)
            .expect("initd vanished immediately after creation")
            .context_ptr()
    };

    cpu.current_task.store(
        task::table::task_ref(initd_id).unwrap() as *const _ as *mut _,
        Ordering::SeqCst,
    );

    unsafe { interrupt::load_context_and_iretq(initd_context) };
}

#[unsafe(no_mangle)]
unsafe extern "C" fn kernel_main() -> ! {
    assert!(BASE_REVISION.is_supported());

    let config = boot_config::parse();
    logger::init(&config).unwrap();
    log::info!("Welcome to HermitCore!");

    unsafe { kernel::memory::cpu_local_data::init_bsp() };
    log::info!("BSP core-local state initialized.");

    interrupt::nmi_handler_state::init();

    // Must run before `gdt::init()`: the IST exception stack it allocates
    // goes through `GuardedStack`, which needs `MEMORY` up.
    let memory_map = MEMORY_MAP_REQUEST.get_response().unwrap();
    unsafe { kernel::memory::init_bsp(memory_map) };
    log::info!("BSP memory initialized.");

    gdt::init();
    log::info!("BSP GDT initialized.");
    interrupt::idt::init();
    log::info!("BSP IDT initialized.");

    time::tsc::calibrate(&config);
    time::lapic_timer::init();
    log::info!("TSC calibrated against the PIT.");

    task::table::init();

    signal::init();
    virtio::init(None);
    log::info!("virtio-net device initialized.");

    let stack = GuardedStack::new_kernel(
        NORMAL_STACK_SIZE,
        StackId {
            kind: StackType::Normal,
            cpu_id: get_local().kernel_id,
        },
    );
    unsafe { stack.switch(init_bsp) };
}

static APS_READY: AtomicU32 = AtomicU32::new(0);

/// BSP - Bootstrap Processor. Runs on the freshly allocated kernel stack: the
/// boot stack Limine hands `kernel_main` is small and has no guard page.
extern "sysv64" fn init_bsp() -> ! {
    let rsdp = RSDP_REQUEST.get_response().unwrap();
    let acpi_tables = acpi::parse(rsdp);
    apic::init_bsp(&acpi_tables);
    log::info!("BSP APIC initialized.");
    apic::init_local_apic();
    log::info!("Local APIC initialized.");

    let mp_response = MP_REQUEST.get_response().unwrap();
    let total_cpus = mp_response.cpus().len();
    for cpu in mp_response.cpus() {
        cpu.goto_address.write(ap_entry);
    }

    while (APS_READY.load(Ordering::SeqCst) as usize) < total_cpus.saturating_sub(1) {
        core::hint::spin_loop();
    }
    log::info!("all application processors reported in.");

    spawn_initial_tasks();
}

/// AP - Application Processor.
unsafe extern "C" fn ap_entry(cpu: &limine::mp::Cpu) -> ! {
    unsafe { kernel::memory::init_ap() };
    unsafe { kernel::memory::cpu_local_data::init_ap(cpu) };

    let stack = GuardedStack::new_kernel(
        NORMAL_STACK_SIZE,
        StackId {
            kind: StackType::Normal,
            cpu_id: get_local().kernel_id,
        },
    );
    unsafe { stack.switch(init_ap) };
}

extern "sysv64" fn init_ap() -> ! {
    gdt::init();
    interrupt::idt::init();
    apic::init_local_apic();
    log::info!("AP {} initialized.", get_local().kernel_id);

    APS_READY.fetch_add(1, Ordering::SeqCst);

    hlt_loop();
}

static DID_PANIC: AtomicBool = AtomicBool::new(false);

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    if !DID_PANIC.swap(true, Ordering::Relaxed) {
        log::error!("{info}");
    }
    interrupt::handle_panic_from_other_cpu()
}
