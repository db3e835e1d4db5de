//! Device side of the link: what the firmware runs.

pub mod commands;
pub mod dispatcher;

pub use commands::{Command, CommandFn, CommandResult, CommandTable};
pub use dispatcher::{
    DEFAULT_RX_BUFFER, DeviceHandler, DeviceTransfer, Dispatcher, DispatcherOptions,
};
