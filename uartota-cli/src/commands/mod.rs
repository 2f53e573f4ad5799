//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod emulate;
pub(crate) mod info;
pub(crate) mod transfer;

use {
    anyhow::{Context, Result},
    uartota::{NativePort, OtaSender, SenderConfig, SerialConfig},
};

/// Serial endpoint resolved from arguments and config.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) port: String,
    pub(crate) baud: u32,
}

impl Target {
    /// Open the serial port.
    pub(crate) fn open(&self) -> Result<NativePort> {
        NativePort::open(&SerialConfig::new(&self.port, self.baud))
            .with_context(|| format!("Failed to open {}", self.port))
    }

    /// Open the serial port and wrap it in a sender.
    pub(crate) fn sender(&self, config: SenderConfig) -> Result<OtaSender<NativePort>> {
        Ok(OtaSender::with_config(self.open()?, config))
    }
}
