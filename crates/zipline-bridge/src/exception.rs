use std::fmt;

pub const API_MISMATCH_EXCEPTION: &str = "ZiplineApiMismatchException";
pub const CLOSED_EXCEPTION: &str = "ZiplineClosedException";
pub const CANCELLATION_EXCEPTION: &str = "CancellationException";
const GENERIC_EXCEPTION: &str = "ZiplineException";

/// An exception thrown on one side of the bridge and rethrown on the other.
///
/// On the wire this is plain text: `kind: message` followed by one `\tat frame`
/// line per stack frame. Decoding never fails; text that doesn't follow the
/// layout is kept whole as the message of a generic exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZiplineException {
    pub kind: String,
    pub message: String,
    pub stack: Vec<String>,
}

impl ZiplineException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: Vec::new(),
        }
    }

    /// Attach a stack frame description (outermost last).
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.stack.push(frame.into());
        self
    }

    pub fn to_text(&self) -> String {
        let mut text = format!("{}: {}", self.kind, self.message);
        for frame in &self.stack {
            text.push_str("\n\tat ");
            text.push_str(frame);
        }
        text
    }

    pub fn from_text(text: &str) -> Self {
        let (head, frames) = match text.find("\n\tat ") {
            Some(index) => (&text[..index], &text[index..]),
            None => (text, ""),
        };

        let stack = frames
            .split("\n\tat ")
            .filter(|frame| !frame.is_empty())
            .map(str::to_string)
            .collect();

        match head.split_once(": ") {
            Some((kind, message)) if is_kind_name(kind) => Self {
                kind: kind.to_string(),
                message: message.to_string(),
                stack,
            },
            _ => Self {
                kind: GENERIC_EXCEPTION.to_string(),
                message: text.to_string(),
                stack: Vec::new(),
            },
        }
    }
}

/// Exception kinds are type names: no whitespace, not empty.
fn is_kind_name(kind: &str) -> bool {
    !kind.is_empty() && !kind.chars().any(char::is_whitespace)
}

impl fmt::Display for ZiplineException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ZiplineException {}
