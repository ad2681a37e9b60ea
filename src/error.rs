use std::fmt;

/// A 0-based position in the source text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    /// 0-based line number
    pub line: usize,
    /// 0-based column (byte offset within the line)
    pub column: usize,
    /// 0-based absolute byte offset from the start of input
    pub offset: usize,
}

impl Position {
    /// Resolve a byte offset against source text.
    pub fn of(source: &str, offset: usize) -> Position {
        let offset = offset.min(source.len());
        let mut line = 0;
        let mut column = 0;
        for b in source.as_bytes()[..offset].iter() {
            if *b == b'\n' {
                line += 1;
                column = 0;
            } else {
                column += 1;
            }
        }
        Position {
            line,
            column,
            offset,
        }
    }
}

/// The failure categories the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lexical or syntactic failure in the template or expression parser.
    ParseError,
    /// Identifier with no binding in any scope.
    NameNotFound,
    /// Operator or conversion not defined for the operand variants.
    TypeMismatch,
    /// Semantic error during evaluation (loop-variable misuse, bad
    /// assignment target, argument-count mismatch, control flow outside
    /// its construct).
    InvalidOperation,
    /// Loader failure, include depth exceeded, or include cycle.
    IncludeError,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "parse-error",
            ErrorKind::NameNotFound => "name-not-found",
            ErrorKind::TypeMismatch => "type-mismatch",
            ErrorKind::InvalidOperation => "invalid-operation",
            ErrorKind::IncludeError => "include-error",
        }
    }
}

/// An engine error carrying a source location `(file, byte_offset)`.
#[derive(Debug, Clone, PartialEq)]
pub struct WeftError {
    pub kind: ErrorKind,
    pub message: String,
    /// Name of the template file the offset refers to, when known.
    pub file: Option<String>,
    /// 0-based byte offset into that file's source.
    pub offset: usize,
}

impl WeftError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, offset: usize) -> Self {
        WeftError {
            kind,
            message: message.into(),
            file: None,
            offset,
        }
    }

    pub fn parse(message: impl Into<String>, offset: usize) -> Self {
        WeftError::new(ErrorKind::ParseError, message, offset)
    }

    pub fn name_not_found(message: impl Into<String>, offset: usize) -> Self {
        WeftError::new(ErrorKind::NameNotFound, message, offset)
    }

    pub fn type_mismatch(message: impl Into<String>, offset: usize) -> Self {
        WeftError::new(ErrorKind::TypeMismatch, message, offset)
    }

    pub fn invalid_operation(message: impl Into<String>, offset: usize) -> Self {
        WeftError::new(ErrorKind::InvalidOperation, message, offset)
    }

    pub fn include(message: impl Into<String>, offset: usize) -> Self {
        WeftError::new(ErrorKind::IncludeError, message, offset)
    }

    /// Rebase the offset by the position of an embedded region, e.g. an
    /// expression inside a template line.
    pub fn rebase(mut self, base: usize) -> Self {
        self.offset += base;
        self
    }

    /// Attach a source location if none is set yet. Host-registered
    /// callables raise errors without a location; the call site fills it
    /// in.
    pub fn or_at(mut self, offset: usize) -> Self {
        if self.offset == 0 {
            self.offset = offset;
        }
        self
    }

    /// Attach the file name if none is set yet. Errors crossing an include
    /// boundary keep the inner file so the diagnostic points at the point
    /// of failure.
    pub fn in_file(mut self, file: &str) -> Self {
        if self.file.is_none() {
            self.file = Some(file.to_string());
        }
        self
    }
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(
                f,
                "{}:{}: {} ({})",
                file,
                self.offset,
                self.message,
                self.kind.code()
            ),
            None => write!(f, "{}: {} ({})", self.offset, self.message, self.kind.code()),
        }
    }
}

impl std::error::Error for WeftError {}
