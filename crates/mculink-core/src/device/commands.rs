//! Fixed-signature command table for the device side.

/// Command entry point: handler state plus the argument bytes.
pub type CommandFn<H> = fn(&mut H, &[u8]);

/// One registered command.
pub struct Command<H> {
    pub major: u8,
    pub minor: u8,
    /// Exact payload length the command takes.
    pub arg_len: usize,
    pub run: CommandFn<H>,
}

/// Outcome of looking up and running a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Executed,
    /// No command registered for the key pair.
    Unknown,
    /// Registered, but the payload length did not match.
    BadLength { expected: usize, actual: usize },
}

/// Maps `(major, minor)` to a command with a fixed argument length.
pub struct CommandTable<H> {
    commands: Vec<Command<H>>,
}

impl<H> CommandTable<H> {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Add a command. A later registration for the same keys replaces the
    /// earlier one.
    pub fn register(mut self, major: u8, minor: u8, arg_len: usize, run: CommandFn<H>) -> Self {
        self.commands
            .retain(|c| !(c.major == major && c.minor == minor));
        self.commands.push(Command {
            major,
            minor,
            arg_len,
            run,
        });
        self
    }

    pub fn lookup(&self, major: u8, minor: u8) -> Option<&Command<H>> {
        self.commands
            .iter()
            .find(|c| c.major == major && c.minor == minor)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run the command for `(major, minor)` if the payload length matches.
    pub fn dispatch(&self, handler: &mut H, major: u8, minor: u8, payload: &[u8]) -> CommandResult {
        let Some(cmd) = self.lookup(major, minor) else {
            return CommandResult::Unknown;
        };
        if payload.len() != cmd.arg_len {
            return CommandResult::BadLength {
                expected: cmd.arg_len,
                actual: payload.len(),
            };
        }
        (cmd.run)(handler, payload);
        CommandResult::Executed
    }
}

impl<H> Default for CommandTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Pins {
        level: Option<(u8, u8)>,
        toggles: u32,
    }

    fn set_pin(p: &mut Pins, args: &[u8]) {
        p.level = Some((args[0], args[1]));
    }

    fn toggle(p: &mut Pins, _args: &[u8]) {
        p.toggles += 1;
    }

    #[test]
    fn test_dispatch_checks_length() {
        let table = CommandTable::new()
            .register(0x01, 0x01, 2, set_pin)
            .register(0x01, 0x02, 0, toggle);
        let mut pins = Pins::default();

        assert_eq!(table.dispatch(&mut pins, 0x01, 0x01, &[3, 1]), CommandResult::Executed);
        assert_eq!(pins.level, Some((3, 1)));

        assert_eq!(
            table.dispatch(&mut pins, 0x01, 0x01, &[3]),
            CommandResult::BadLength {
                expected: 2,
                actual: 1
            }
        );
        assert_eq!(table.dispatch(&mut pins, 0x01, 0x02, &[]), CommandResult::Executed);
        assert_eq!(pins.toggles, 1);
        assert_eq!(table.dispatch(&mut pins, 0x09, 0x01, &[]), CommandResult::Unknown);
    }

    #[test]
    fn test_register_replaces() {
        let table: CommandTable<Pins> = CommandTable::new()
            .register(0x01, 0x01, 2, set_pin)
            .register(0x01, 0x01, 0, toggle);
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(0x01, 0x01).map(|c| c.arg_len), Some(0));
    }
}
