//! AS1: serial-only logging. `\n` is translated to `\r\n` so a plain
//! terminal attached to the UART renders lines correctly; the `[cpu_id]`
//! prefix disambiguates interleaved output from multiple cores.

use core::fmt::Write;

use log::Log;
use uart_16550::SerialPort;

use kernel::boot_config::BootConfig;

struct KernelLogger {
    serial_port: spin::Mutex<SerialPort>,
}

static LOGGER: spin::Once<KernelLogger> = spin::Once::new();

impl Log for KernelLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let level = record.level();
        let cpu_id =
            kernel::memory::cpu_local_data::try_get_local().map_or(0, |data| data.kernel_id);
        let width = match kernel::memory::cpu_local_data::cpus_count() {
            0 | 1 => 1,
            n => (n - 1).ilog(16) as usize + 1,
        };
        let mut writer = WriterWithCr {
            writer: &mut *self.serial_port.lock(),
        };
        let _ = write!(
            writer,
            "{level:5} [{cpu_id:0width$X}] {}\n",
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Installs the logger against `config.uart_port`. Must run exactly once,
/// early in BSP boot.
pub fn init(config: &BootConfig) -> Result<(), log::SetLoggerError> {
    let logger = LOGGER.call_once(|| {
        let mut serial_port = unsafe { SerialPort::new(config.uart_port) };
        serial_port.init();
        KernelLogger {
            serial_port: spin::Mutex::new(serial_port),
        }
    });
    log::set_max_level(config.log_level);
    log::set_logger(logger)
}

struct WriterWithCr<T> {
    writer: T,
}

impl<T: Write> Write for WriterWithCr<T> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for c in s.chars() {
            if c == '\n' {
                self.writer.write_str("\r\n")?;
            } else {
                self.writer.write_char(c)?;
            }
        }
        Ok(())
    }
}
