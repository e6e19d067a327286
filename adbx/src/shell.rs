//! Shell command lines: validation, quoting, and exit-code recovery.
//!
//! The `shell:` service takes a single command string. Arguments must be
//! separated by spaces; an argument containing a space must be wrapped in
//! double quotes, and arguments cannot contain double quotes at all.

use adbx_proto::{Error, Result};

/// Validates `cmd` and `args` and joins them into a `shell:` command line.
pub(crate) fn prepare_command_line(cmd: &str, args: &[&str]) -> Result<String> {
    if cmd.trim().is_empty() {
        return Err(Error::Parse("shell command cannot be empty".into()));
    }
    let mut line = String::from(cmd);
    for (i, arg) in args.iter().enumerate() {
        if arg.contains('"') {
            return Err(Error::Parse(format!(
                "shell argument {i} contains a double quote: {arg:?}"
            )));
        }
        line.push(' ');
        if arg.contains(is_shell_whitespace) {
            line.push('"');
            line.push_str(arg);
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    Ok(line)
}

fn is_shell_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\x0b')
}

/// Splits the sentinel appended by `; echo :$?` off a shell payload.
///
/// Returns the output and the exit code. When no parseable sentinel is
/// present (a command that prints a trailing `:` of its own can defeat
/// this), the whole payload is returned with code -1.
pub(crate) fn split_exit_code(payload: Vec<u8>) -> (Vec<u8>, i32) {
    let Some(colon) = payload.iter().rposition(|&b| b == b':') else {
        return (payload, -1);
    };
    let digits = String::from_utf8_lossy(&payload[colon + 1..]).into_owned();
    match digits.trim().parse::<i32>() {
        Ok(code) => {
            let mut output = payload;
            output.truncate(colon);
            (output, code)
        }
        Err(_) => (payload, -1),
    }
}

/// Undoes the device shell's `\n` → `\r\n` rewrite.
///
/// For text consumers only; binary output must be taken verbatim.
#[must_use]
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}
