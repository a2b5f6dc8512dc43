use crate::span::{Site, SpanMap};

/// A compiler diagnostic (error or warning).
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub site: Site,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Diagnostic {
    pub fn error(message: String, site: Site) -> Self {
        Self {
            severity: Severity::Error,
            message,
            site,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn warning(message: String, site: Site) -> Self {
        Self {
            severity: Severity::Warning,
            message,
            site,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    fn report<'a>(
        &self,
        filename: &'a str,
        spans: &SpanMap,
    ) -> ariadne::Report<'a, (&'a str, std::ops::Range<usize>)> {
        use ariadne::{Color, Label, Report, ReportKind};

        let kind = match self.severity {
            Severity::Error => ReportKind::Error,
            Severity::Warning => ReportKind::Warning,
        };

        let color = match self.severity {
            Severity::Error => Color::Red,
            Severity::Warning => Color::Yellow,
        };

        let span = spans.lookup(&self.site);
        let mut report = Report::build(kind, filename, span.start as usize)
            .with_message(&self.message)
            .with_label(
                Label::new((filename, span.range()))
                    .with_message(format!("{}", self.site))
                    .with_color(color),
            );

        for note in &self.notes {
            report = report.with_note(note);
        }

        if let Some(help) = &self.help {
            report = report.with_help(help);
        }

        report.finish()
    }

    /// Render the diagnostic to stderr against a kernel listing.
    pub fn render(&self, filename: &str, listing: &str, spans: &SpanMap) {
        use ariadne::Source;

        if let Err(e) = self
            .report(filename, spans)
            .eprint((filename, Source::from(listing)))
        {
            tracing::warn!("failed to render diagnostic: {}", e);
        }
    }

    /// Render into a string (no colors are stripped; used by tests and logs).
    pub fn render_to_string(&self, filename: &str, listing: &str, spans: &SpanMap) -> String {
        use ariadne::Source;

        let mut out = Vec::new();
        if self
            .report(filename, spans)
            .write((filename, Source::from(listing)), &mut out)
            .is_err()
        {
            return self.message.clone();
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Render a list of diagnostics.
pub fn render_diagnostics(
    diagnostics: &[Diagnostic],
    filename: &str,
    listing: &str,
    spans: &SpanMap,
) {
    for diag in diagnostics {
        diag.render(filename, listing, spans);
    }
}

/// Render a diagnostic that has no listing to point into (config, I/O).
pub fn render_plain(diag: &Diagnostic) {
    let label = match diag.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };
    eprintln!("{}: {}", label, diag.message);
    for note in &diag.notes {
        eprintln!("  note: {}", note);
    }
    if let Some(help) = &diag.help {
        eprintln!("  help: {}", help);
    }
}
