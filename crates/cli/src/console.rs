//! Console operator: answers prompts from command line flags, else from stdin

use ilrecover_binary_parser::SliceInfo;
use ilrecover_core::{Address, Error, Result};
use ilrecover_il2cpp::{parse_hex_address, Operator, Prompt};
use std::io::{BufRead, Write};

/// Answers supplied up front on the command line
#[derive(Debug, Clone, Default)]
pub struct Presets {
    /// One-based, as listed in the slice prompt
    pub slice: Option<usize>,
    pub dump_base: Option<Address>,
    pub code_registration: Option<Address>,
    pub metadata_registration: Option<Address>,
}

pub struct ConsoleOperator<R, W> {
    presets: Presets,
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    pub fn new(presets: Presets, input: R, output: W) -> Self {
        Self { presets, input, output }
    }

    fn ask(&mut self, prompt: &Prompt) -> Result<String> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(Error::invalid_input(format!("No answer to \"{}\"", prompt.to_string().trim())));
        }
        Ok(line)
    }
}

/// One-based slice digit to a zero-based index
fn slice_index(choice: usize) -> Result<usize> {
    choice
        .checked_sub(1)
        .ok_or_else(|| Error::invalid_input("Slices are numbered from 1"))
}

impl<R: BufRead, W: Write> Operator for ConsoleOperator<R, W> {
    fn select_slice(&mut self, slices: &[SliceInfo]) -> Result<usize> {
        if let Some(choice) = self.presets.slice.take() {
            return slice_index(choice);
        }

        let line = self.ask(&Prompt::SelectSlice(slices.to_vec()))?;
        let digit = line
            .trim()
            .chars()
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or_else(|| Error::invalid_input(format!("'{}' is not a digit", line.trim())))?;
        slice_index(digit as usize)
    }

    fn read_address(&mut self, prompt: &Prompt) -> Result<Address> {
        let preset = match prompt {
            Prompt::DumpAddress => self.presets.dump_base.take(),
            Prompt::CodeRegistration => self.presets.code_registration.take(),
            Prompt::MetadataRegistration => self.presets.metadata_registration.take(),
            Prompt::SelectSlice(_) => None,
        };
        match preset {
            Some(address) => Ok(address),
            None => parse_hex_address(&self.ask(prompt)?),
        }
    }
}
