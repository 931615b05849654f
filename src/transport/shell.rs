//! Shell quoting and command output shared by the transports

use std::path::Path;

use super::TransportError;

/// Quote a value for safe interpolation into a POSIX shell command line.
///
/// Values with a NUL byte cannot be passed through a shell at all.
pub fn quote(value: &str) -> Result<String, TransportError> {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| TransportError::Unquotable(value.to_string()))
}

/// Quote a path for a POSIX shell command line
pub fn quote_path(path: &Path) -> Result<String, TransportError> {
    quote(&path.to_string_lossy())
}

/// Captured result of a shell command run through a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status (-1 when the process was killed by a signal)
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub(crate) fn from_output(output: std::process::Output) -> Self {
        Self {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &str) -> Vec<String> {
        shlex::split(line).unwrap()
    }

    #[test]
    fn test_quote_plain_word_unchanged() {
        assert_eq!(quote("aiida.in").unwrap(), "aiida.in");
        assert_eq!(quote("/scratch/ab/cd/ef-01").unwrap(), "/scratch/ab/cd/ef-01");
    }

    #[test]
    fn test_quote_spaces_and_metacharacters() {
        for value in ["two words", "$(rm -rf /)", "a;b|c", "it's", "say \"hi\""] {
            let quoted = quote(value).unwrap();
            assert_ne!(quoted, value);
            assert_eq!(words(&format!("cat {}", quoted)), vec!["cat".to_string(), value.to_string()]);
        }
    }

    #[test]
    fn test_quote_empty_is_one_word() {
        assert_eq!(words(&format!("x {} y", quote("").unwrap())).len(), 3);
    }

    #[test]
    fn test_nul_byte_rejected() {
        let err = quote("a\0b").unwrap_err();
        assert!(matches!(err, TransportError::Unquotable(_)));
        assert!(!err.is_transient());
    }
}
