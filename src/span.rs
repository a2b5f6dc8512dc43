use std::collections::BTreeMap;
use std::fmt;

use crate::ir::OpId;

/// A byte range in a kernel listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn range(self) -> std::ops::Range<usize> {
        self.start as usize..self.end as usize
    }
}

/// What a diagnostic points at. Resolved to a `Span` once a listing exists.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Site {
    /// No particular location (configuration, I/O).
    Nowhere,
    /// The kernel header line.
    Kernel,
    /// A tile declaration, by name.
    Tile(String),
    /// An operation line.
    Op(OpId),
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Site::Nowhere => f.write_str("<none>"),
            Site::Kernel => f.write_str("kernel"),
            Site::Tile(name) => write!(f, "tile '{}'", name),
            Site::Op(id) => write!(f, "op {}", id),
        }
    }
}

/// Site → span table produced alongside a listing.
#[derive(Clone, Debug, Default)]
pub struct SpanMap {
    spans: BTreeMap<Site, Span>,
}

impl SpanMap {
    pub fn insert(&mut self, site: Site, span: Span) {
        self.spans.insert(site, span);
    }

    /// Span of `site`, falling back to the kernel header, then to offset 0.
    pub fn lookup(&self, site: &Site) -> Span {
        self.spans
            .get(site)
            .or_else(|| self.spans.get(&Site::Kernel))
            .copied()
            .unwrap_or_else(Span::dummy)
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}
