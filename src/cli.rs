//! CLI utilities for docwire.
//!
//! The utilities present in this module can be used to build an interactive shell on top
//! of a [`Database`](crate::Database).
use std::io::{BufRead, Write};

use crate::{Command, CommandError};

/// Prompt user for a valid command. End of input is treated as `.exit`.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }
    Command::try_from(s.as_str())
}
