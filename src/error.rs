pub use anyhow::Result;

use ariadne::{Cache, Config, Label, Report, ReportKind, Source};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::{Add, Range};

/// A character range within the original query text.
#[derive(Clone, PartialEq, Eq, Copy, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A compilation error with a stack of context notes.
///
/// Each pass appends its own note as the error propagates toward the
/// request boundary, so the final message reads innermost-first: the
/// offending expression, then the contexts it was found in.
#[derive(Debug, Clone)]
pub struct Error {
    pub reason: Reason,
    pub notes: Vec<Note>,
    pub span: Option<Span>,
    pub help: Option<String>,
}

/// A context frame attached to an error on its way out of a pass.
#[derive(Debug, Clone)]
pub struct Note {
    pub text: String,
    pub span: Option<Span>,
}

#[derive(Debug, Clone)]
pub enum Reason {
    Simple(String),
    Expected {
        expected: String,
        found: String,
    },
    NotFound {
        name: String,
        namespace: String,
    },
}

impl Error {
    pub fn new(reason: Reason) -> Self {
        Error {
            reason,
            notes: Vec::new(),
            span: None,
            help: None,
        }
    }

    pub fn simple<S: Into<String>>(message: S) -> Self {
        Error::new(Reason::Simple(message.into()))
    }

    pub fn not_found<S: Into<String>>(name: S, namespace: S) -> Self {
        Error::new(Reason::NotFound {
            name: name.into(),
            namespace: namespace.into(),
        })
    }

    pub fn with_help<S: Into<String>>(mut self, help: S) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_span(mut self, span: Option<Span>) -> Self {
        if self.span.is_none() {
            self.span = span;
        }
        self
    }

    pub fn with_note<S: Into<String>>(mut self, text: S, span: Option<Span>) -> Self {
        self.notes.push(Note {
            text: text.into(),
            span,
        });
        self
    }
}

/// Attaches a source mark to any [Error] leaving the given scope.
///
/// The closure-based equivalent of a scoped translation guard: wrap a
/// per-node pass invocation and the node's span is added to errors
/// escaping the closure.
pub fn guard<T>(span: Option<Span>, body: impl FnOnce() -> Result<T>) -> Result<T> {
    body().map_err(|e| mark_error(e, span))
}

/// Like [guard], but also names the surrounding context.
pub fn guard_with<T>(
    note: &str,
    span: Option<Span>,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    body().map_err(|e| match e.downcast::<Error>() {
        Ok(error) => anyhow::Error::new(error.with_note(note, span).with_span(span)),
        Err(other) => other,
    })
}

fn mark_error(e: anyhow::Error, span: Option<Span>) -> anyhow::Error {
    match e.downcast::<Error>() {
        Ok(error) => anyhow::Error::new(error.with_span(span)),
        Err(other) => other,
    }
}

// Needed for anyhow
impl StdError for Error {}

// Needed for StdError
impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason.message())?;
        for note in &self.notes {
            write!(f, "\nwhile {}", note.text)?;
        }
        Ok(())
    }
}

impl Reason {
    pub fn message(&self) -> String {
        match self {
            Reason::Simple(text) => text.clone(),
            Reason::Expected { expected, found } => {
                format!("expected {expected}, but found {found}")
            }
            Reason::NotFound { name, namespace } => {
                format!("{namespace} `{name}` not found")
            }
        }
    }
}

/// Location within the source text; line and column numbers are 0-based.
#[derive(Debug, Clone, Serialize)]
pub struct SourceLocation {
    pub start: (usize, usize),
    pub end: (usize, usize),
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    /// Plain text of the error
    pub reason: String,
    /// A list of suggestions of how to fix the error
    pub hint: Option<String>,
    /// Character offset of error origin within a source file
    pub span: Option<Span>,

    /// Annotated code, containing cause and hints.
    pub display: Option<String>,
    /// Line and column number of error origin within a source file
    pub location: Option<SourceLocation>,
}

impl Display for ErrorMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // https://github.com/zesterer/ariadne/issues/52
        if let Some(display) = &self.display {
            let message_without_trailing_spaces = display
                .split('\n')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join("\n");
            f.write_str(&message_without_trailing_spaces)?;
        } else {
            f.write_str(&self.reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessages {
    pub inner: Vec<ErrorMessage>,
}

impl From<ErrorMessage> for ErrorMessages {
    fn from(e: ErrorMessage) -> Self {
        ErrorMessages { inner: vec![e] }
    }
}

impl Display for ErrorMessages {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for e in &self.inner {
            Display::fmt(&e, f)?;
        }
        Ok(())
    }
}

pub fn downcast(error: anyhow::Error) -> ErrorMessages {
    let mut span = None;
    let mut hint = None;

    let error = match error.downcast::<ErrorMessages>() {
        Ok(messages) => return messages,
        Err(error) => error,
    };

    let reason = match error.downcast::<Error>() {
        Ok(error) => {
            span = error.span;
            hint = error.help.clone();
            let mut text = error.reason.message();
            for note in &error.notes {
                text.push_str("\nwhile ");
                text.push_str(&note.text);
            }
            text
        }
        // default to basic Display
        Err(error) => format!("{:#?}", error),
    };

    ErrorMessage {
        reason,
        hint,
        span,
        display: None,
        location: None,
    }
    .into()
}

impl StdError for ErrorMessages {}

impl ErrorMessages {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap()
    }

    /// Computes message location and builds the pretty display.
    pub fn composed(mut self, source_id: &str, source: &str, color: bool) -> Self {
        for e in &mut self.inner {
            let source = Source::from(source);
            let cache = (source_id, source);

            e.location = e.compose_location(&cache.1);
            e.display = e.compose_display(source_id, cache, color);
        }
        self
    }
}

impl ErrorMessage {
    fn compose_display<'a, C>(&self, source_id: &'a str, cache: C, color: bool) -> Option<String>
    where
        C: Cache<&'a str>,
    {
        let config = Config::default().with_color(color);

        let span = Range::from(self.span?);

        let mut report = Report::build(ReportKind::Error, source_id, span.start)
            .with_config(config)
            .with_message("")
            .with_label(Label::new((source_id, span)).with_message(&self.reason));

        if let Some(hint) = &self.hint {
            report.set_help(hint);
        }

        let mut out = Vec::new();
        report.finish().write(cache, &mut out).ok()?;
        String::from_utf8(out).ok()
    }

    fn compose_location(&self, source: &Source) -> Option<SourceLocation> {
        let span = self.span?;

        let start = source.get_offset_line(span.start)?;
        let end = source.get_offset_line(span.end)?;
        Some(SourceLocation {
            start: (start.1, start.2),
            end: (end.1, end.2),
        })
    }
}

impl From<Span> for Range<usize> {
    fn from(a: Span) -> Self {
        a.start..a.end
    }
}

impl Add<Span> for Span {
    type Output = Span;

    fn add(self, rhs: Span) -> Span {
        Span {
            start: self.start.min(rhs.start),
            end: self.end.max(rhs.end),
        }
    }
}

pub trait WithErrorInfo {
    fn with_help<S: Into<String>>(self, help: S) -> Self;

    fn with_span(self, span: Option<Span>) -> Self;
}

impl<T> WithErrorInfo for Result<T, Error> {
    fn with_help<S: Into<String>>(self, help: S) -> Self {
        self.map_err(|e| e.with_help(help))
    }

    fn with_span(self, span: Option<Span>) -> Self {
        self.map_err(|e| e.with_span(span))
    }
}

impl Debug for Span {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "span-chars-{}-{}", self.start, self.end)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_message_includes_notes() {
        let error = Error::simple("found an empty or constant kernel")
            .with_note("compiling a quotient", None);
        assert_eq!(
            error.to_string(),
            "found an empty or constant kernel\nwhile compiling a quotient"
        );
    }

    #[test]
    fn guard_attaches_the_innermost_span() {
        let span = Some(Span { start: 3, end: 9 });
        let outer = Some(Span { start: 0, end: 20 });
        let result: Result<()> = guard(outer, || {
            guard(span, || Err(Error::simple("unknown conversion").into()))
        });
        let error = result.unwrap_err().downcast::<Error>().unwrap();
        assert_eq!(error.span, span);
    }

    #[test]
    fn downcast_renders_not_found() {
        let error: anyhow::Error = Error::not_found("shcool", "table").into();
        let messages = downcast(error);
        assert_eq!(messages.inner[0].reason, "table `shcool` not found");
    }
}
