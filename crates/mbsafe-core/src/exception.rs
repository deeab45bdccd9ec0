//! Message-carrying failure with an optional chained cause
//!
//! An [`Exception`] records where it was raised (`file`/`line`, filled in by
//! the [`exception!`](crate::exception!) macro), an optional numeric error code
//! and an optional cause. Setting a cause stores a deep copy; the error code is
//! inherited from the cause chain when not set locally.
//!
//! ```ignore
//! use mbsafe_core::exception;
//!
//! let io = exception!("Connection reset by peer").with_error_code(104);
//! let ex = exception!("Cannot read coils").with_cause(&io);
//! assert_eq!(ex.error_code(), Some(104));
//! eprintln!("{}", ex.stack_trace());
//! ```

use std::error::Error;
use std::fmt;

use crate::error::ModbusError;

#[derive(Clone, PartialEq, Eq)]
pub struct Exception {
    message: String,
    file: &'static str,
    line: u32,
    cause: Option<Box<Exception>>,
    error_code: Option<u64>,
}

impl Exception {
    /// Prefer the `exception!` macro, which fills in the origin location.
    pub fn new(message: impl Into<String>, file: &'static str, line: u32) -> Self {
        Self {
            message: message.into(),
            file,
            line,
            cause: None,
            error_code: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn location(&self) -> (&'static str, u32) {
        (self.file, self.line)
    }

    /// Store a deep copy of `cause`.
    pub fn set_cause(&mut self, cause: &Exception) {
        self.cause = Some(Box::new(cause.clone()));
    }

    pub fn with_cause(mut self, cause: &Exception) -> Self {
        self.set_cause(cause);
        self
    }

    pub fn cause(&self) -> Option<&Exception> {
        self.cause.as_deref()
    }

    /// `None` clears the local code, re-exposing the cause's code.
    pub fn set_error_code(&mut self, code: Option<u64>) {
        self.error_code = code;
    }

    pub fn with_error_code(mut self, code: u64) -> Self {
        self.error_code = Some(code);
        self
    }

    /// Local code, else the first code found along the cause chain.
    pub fn error_code(&self) -> Option<u64> {
        let mut current = Some(self);
        while let Some(ex) = current {
            if ex.error_code.is_some() {
                return ex.error_code;
            }
            current = ex.cause.as_deref();
        }
        None
    }

    /// One `<message>\n  at <file>:<line>` frame per link, joined by `Caused by:`.
    pub fn stack_trace(&self) -> String {
        let mut out = String::new();
        let mut current = Some(self);
        while let Some(ex) = current {
            if !out.is_empty() {
                out.push_str("\nCaused by: ");
            }
            out.push_str(&format!("{}\n  at {}:{}", ex.message, ex.file, ex.line));
            current = ex.cause.as_deref();
        }
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Exception");
        d.field("message", &self.message);
        d.field("location", &format_args!("{}:{}", self.file, self.line));
        if let Some(code) = self.error_code {
            d.field("error_code", &code);
        }
        if let Some(cause) = &self.cause {
            d.field("cause", &cause.message);
        }
        d.finish()
    }
}

impl Error for Exception {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn Error + 'static))
    }
}

impl From<ModbusError> for Exception {
    fn from(err: ModbusError) -> Self {
        let ex = Exception::new(err.to_string(), file!(), line!());
        match err.code() {
            Some(code) => ex.with_error_code(code.raw() as u64),
            None => ex,
        }
    }
}

/// Construct an [`Exception`] at the current source location.
///
/// ```ignore
/// exception!("Unable to open slave")
/// exception!("Cannot read {} bits at {}", nb, addr)
/// ```
#[macro_export]
macro_rules! exception {
    ($msg:literal $(,)?) => {
        $crate::exception::Exception::new(format!($msg), file!(), line!())
    };
    ($fmt:literal, $($arg:tt)+) => {
        $crate::exception::Exception::new(format!($fmt, $($arg)+), file!(), line!())
    };
    ($msg:expr) => {
        $crate::exception::Exception::new($msg, file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::ErrorCode;

    #[test]
    fn test_macro_records_location() {
        let ex = exception!("boom {}", 1);
        assert_eq!(ex.message(), "boom 1");
        assert!(ex.location().0.ends_with("exception.rs"));
        assert!(ex.location().1 > 0);
    }

    #[test]
    fn test_cause_is_deep_copy() {
        let mut root = exception!("root").with_error_code(7);
        let top = exception!("top").with_cause(&root);
        // mutating the original must not affect the stored copy
        root.set_error_code(Some(9));
        assert_eq!(top.cause().map(|c| c.error_code()), Some(Some(7)));
    }

    #[test]
    fn test_error_code_inherited_transitively() {
        let root = exception!("root").with_error_code(104);
        let mid = exception!("mid").with_cause(&root);
        let top = exception!("top").with_cause(&mid);
        assert_eq!(top.error_code(), Some(104));

        let top = top.with_error_code(1);
        assert_eq!(top.error_code(), Some(1));

        let bare = exception!("bare");
        assert_eq!(bare.error_code(), None);
    }

    #[test]
    fn test_stack_trace_format() {
        let root = Exception::new("root", "a.rs", 10);
        let top = Exception::new("top", "b.rs", 20).with_cause(&root);
        assert_eq!(top.stack_trace(), "top\n  at b.rs:20\nCaused by: root\n  at a.rs:10");
    }

    #[test]
    fn test_from_modbus_error() {
        let ex: Exception = ModbusError::Engine(ErrorCode::ConnectionReset).into();
        assert_eq!(ex.error_code(), Some(104));
        let ex: Exception = ModbusError::Cancelled.into();
        assert_eq!(ex.error_code(), None);
        assert_eq!(ex.message(), "wait cancelled");
    }

    #[test]
    fn test_source_chain() {
        let root = exception!("root");
        let top = exception!("top").with_cause(&root);
        assert_eq!(top.source().map(|s| s.to_string()), Some("root".to_string()));
    }
}
