// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for command-line programs

use std::process::exit;

/// Represents a fatal error in a command-line program
#[derive(Debug)]
pub enum CmdError {
    /// incorrect command-line arguments
    Usage(String),
    /// all other errors
    Failure(anyhow::Error),
}

/// Exits the current process on a fatal error
pub fn fatal(cmd_error: CmdError) -> ! {
    let arg0_passed = std::env::args().next();
    let arg0 = arg0_passed
        .as_deref()
        .and_then(|a| std::path::Path::new(a).file_name())
        .and_then(|a| a.to_str())
        .unwrap_or("rack-sim");
    let (exit_code, message) = match cmd_error {
        CmdError::Usage(m) => (2, m),
        CmdError::Failure(e) => (1, format!("{e:?}")),
    };
    eprintln!("{}: {}", arg0, message);
    exit(exit_code);
}
