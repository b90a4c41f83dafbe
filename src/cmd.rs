//! The Summon protocol: recognizing command applications.
//!
//! The outermost application of a query may name a command: `fetch` (or
//! `retrieve`) runs the query, `sql` returns the generated statement,
//! and the format names wrap a sub-command in an output format.  An
//! unrecognized application falls through to the default command — an
//! implicit fetch.  Formatter execution itself lives outside the core;
//! commands only carry the format name.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::syntax::{Syntax, SyntaxKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Command {
    /// Produces no output.
    Skip,
    /// Runs the query and returns the product.
    Fetch { syntax: Syntax },
    /// Renders the feed in the given format.
    Format { feed: Box<Command>, format: Format },
    /// Returns the SQL of the feed instead of running it.
    Sql { feed: Box<Command> },
    /// An implicit fetch.
    Default { syntax: Syntax },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Format {
    Text,
    Html,
    Raw,
    Json,
    Csv,
    Tsv,
    Xml,
}

impl Command {
    /// The query to compile, regardless of the command wrapping.
    pub fn feed_syntax(&self) -> Option<&Syntax> {
        match self {
            Command::Skip => None,
            Command::Fetch { syntax } | Command::Default { syntax } => Some(syntax),
            Command::Format { feed, .. } | Command::Sql { feed } => feed.feed_syntax(),
        }
    }
}

/// Maps the outermost syntax application to a command.
pub fn recognize(syntax: &Syntax) -> Result<Command> {
    if let SyntaxKind::Apply { name, arguments } = &syntax.kind {
        let single = || -> Result<&Syntax> {
            if arguments.len() != 1 {
                return Err(Error::simple("expected 1 argument").into());
            }
            Ok(&arguments[0])
        };
        let format = match name.as_str() {
            "fetch" | "retrieve" => {
                return Ok(Command::Fetch {
                    syntax: single()?.clone(),
                })
            }
            "sql" => {
                let feed = recognize(single()?)?;
                return Ok(Command::Sql {
                    feed: Box::new(feed),
                });
            }
            "txt" => Some(Format::Text),
            "html" => Some(Format::Html),
            "raw" => Some(Format::Raw),
            "json" => Some(Format::Json),
            "csv" => Some(Format::Csv),
            "tsv" => Some(Format::Tsv),
            "xml" => Some(Format::Xml),
            _ => None,
        };
        if let Some(format) = format {
            let feed = recognize(single()?)?;
            return Ok(Command::Format {
                feed: Box::new(feed),
                format,
            });
        }
    }
    Ok(Command::Default {
        syntax: syntax.clone(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::syntax::{apply, ident};

    #[test]
    fn summon_recognizes_command_names() {
        let query = ident("school").collect();
        let command = recognize(&apply("fetch", vec![query.clone()])).unwrap();
        assert!(matches!(command, Command::Fetch { .. }));

        let command = recognize(&apply("json", vec![apply("sql", vec![query.clone()])])).unwrap();
        let Command::Format { feed, format } = command else {
            panic!("expected a format command");
        };
        assert_eq!(format, Format::Json);
        assert!(matches!(*feed, Command::Sql { .. }));

        // An unrecognized application is an implicit fetch.
        let command = recognize(&query).unwrap();
        assert!(matches!(command, Command::Default { .. }));
        assert_eq!(command.feed_syntax(), Some(&query));
    }

    #[test]
    fn format_commands_demand_one_argument() {
        assert!(recognize(&apply("csv", vec![])).is_err());
    }
}
