//! AS2: kernel command-line parsing.
//!
//! Tokenizes the Limine executable-cmdline string into a `BootConfig`.
//! Unknown tokens are logged and ignored rather than treated as fatal: the
//! command line is operator input, not kernel-internal configuration.

use log::LevelFilter;

use crate::limine_requests::EXECUTABLE_CMDLINE_REQUEST;

/// Default uart I/O port (standard COM1) when no `uart=io:` token is given.
const DEFAULT_UART_PORT: u16 = 0x3F8;

#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    pub cpu_freq_override_mhz: Option<u32>,
    pub uart_port: u16,
    pub log_level: LevelFilter,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            cpu_freq_override_mhz: None,
            uart_port: DEFAULT_UART_PORT,
            log_level: LevelFilter::Info,
        }
    }
}

/// Reads and parses the Limine executable cmdline. Returns the default
/// configuration if Limine didn't provide one (e.g. running under a loader
/// that doesn't support the request).
pub fn parse() -> BootConfig {
    let Some(cmdline) = EXECUTABLE_CMDLINE_REQUEST
        .get_response()
        .and_then(|r| r.cmdline().to_str().ok())
    else {
        return BootConfig::default();
    };
    parse_str(cmdline)
}

fn parse_str(cmdline: &str) -> BootConfig {
    let mut config = BootConfig::default();
    let mut tokens = cmdline.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        if token == "-freq" {
            match tokens.next().and_then(|v| v.parse::<u32>().ok()) {
                Some(mhz) => config.cpu_freq_override_mhz = Some(mhz),
                None => log::warn!("boot_config: `-freq` missing a numeric MHz argument"),
            }
        } else if let Some(hex) = token.strip_prefix("uart=io:") {
            match u16::from_str_radix(hex.trim_start_matches("0x"), 16) {
                Ok(port) => config.uart_port = port,
                Err(_) => log::warn!("boot_config: unparseable uart port `{hex}`"),
            }
        } else if let Some(level) = token.strip_prefix("log=") {
            match level.parse::<LevelFilter>() {
                Ok(filter) => config.log_level = filter,
                Err(_) => log::warn!("boot_config: unrecognized log level `{level}`"),
            }
        } else {
            log::warn!("boot_config: ignoring unknown token `{token}`");
        }
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_freq_override() {
        let config = parse_str("-freq 2400");
        assert_eq!(config.cpu_freq_override_mhz, Some(2400));
    }

    #[test]
    fn parses_uart_port() {
        let config = parse_str("uart=io:2f8");
        assert_eq!(config.uart_port, 0x2F8);
    }

    #[test]
    fn unknown_tokens_do_not_panic() {
        let config = parse_str("-freq 1800 bogus=1 uart=io:3f8");
        assert_eq!(config.cpu_freq_override_mhz, Some(1800));
        assert_eq!(config.uart_port, 0x3F8);
    }

    #[test]
    fn empty_cmdline_is_default() {
        let config = parse_str("");
        assert_eq!(config.cpu_freq_override_mhz, None);
        assert_eq!(config.uart_port, DEFAULT_UART_PORT);
        assert_eq!(config.log_level, LevelFilter::Info);
    }

    #[test]
    fn parses_log_level() {
        let config = parse_str("log=debug");
        assert_eq!(config.log_level, LevelFilter::Debug);
    }

    #[test]
    fn bogus_log_level_keeps_default() {
        let config = parse_str("log=verbose");
        assert_eq!(config.log_level, LevelFilter::Info);
    }
}
