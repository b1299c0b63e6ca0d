//! Error reports with a source excerpt, for terminals and editor panes.

use crate::error::Error;
use ariadne::{Config, IndexType, Label, Report, ReportKind, Source};

/// Render `error` against the source it came from. Errors without a span
/// become a single `error: ...` line.
pub fn render(error: &Error, filename: &str, source: &str) -> String {
    let Some(span) = error.span() else {
        return format!("error: {error}\n");
    };
    // Spans past the end (e.g. "unexpected end of input") still need a label.
    let start = span.start.min(source.len());
    let range = start..span.end.clamp(start, source.len());
    let mut report_bytes = Vec::new();
    let written = Report::build(ReportKind::Error, (filename, range.clone()))
        .with_config(
            Config::default()
                .with_color(false)
                .with_index_type(IndexType::Byte),
        )
        .with_message(error.to_string())
        .with_label(Label::new((filename, range)).with_message(error.message()))
        .finish()
        .write((filename, Source::from(source)), &mut report_bytes);
    match written {
        Ok(()) => String::from_utf8_lossy(&report_bytes).into_owned(),
        Err(_) => format!("error: {error} at {span}\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn report_names_file_and_message() {
        let source = "(+ 1 2";
        let error = parse(source).unwrap_err();
        let report = render(&error, "scratch.lisp", source);
        assert!(report.contains("scratch.lisp"));
        assert!(report.contains("forgot to close something"));
    }

    #[test]
    fn unlocated_errors_are_one_line() {
        let error = Error::internal("bad ticket");
        assert_eq!(
            render(&error, "x", ""),
            "error: internal consistency error: bad ticket\n"
        );
    }
}
