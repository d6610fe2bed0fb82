use crate::client::output::CliOutput;

pub struct GlobalSettings {
    printer: CliOutput,
}

impl GlobalSettings {
    pub fn new(printer: CliOutput) -> Self {
        GlobalSettings { printer }
    }

    pub fn printer(&self) -> &CliOutput {
        &self.printer
    }
}
