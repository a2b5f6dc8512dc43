//! Text listing of a kernel.
//!
//! The listing is what diagnostics point into: every tile declaration and
//! every op gets its own line, and the span of that line is recorded under
//! the matching `Site`.

use std::fmt::Write;

use super::{Access, Affine, Expr, Kernel, Op, OpKind, Region, Tile};
use crate::span::{Site, Span, SpanMap};

pub struct Listing {
    pub text: String,
    pub spans: SpanMap,
}

struct Printer<'k> {
    kernel: &'k Kernel,
    text: String,
    spans: SpanMap,
}

pub fn listing(kernel: &Kernel) -> Listing {
    let mut p = Printer {
        kernel,
        text: String::new(),
        spans: SpanMap::default(),
    };
    let mut header = format!(
        "kernel {} grid={:?} threads={:?}",
        kernel.name, kernel.grid, kernel.threads
    );
    if let Some(r) = kernel.rasterization.filter(|r| r.enable) {
        let _ = write!(header, " raster=panel({})", r.panel_size);
    }
    p.line(0, Site::Kernel, &header);
    for tile in &kernel.tiles {
        let text = describe_tile(tile);
        p.line(1, Site::Tile(tile.name.clone()), &text);
    }
    p.body(&kernel.body, 1);
    Listing {
        text: p.text,
        spans: p.spans,
    }
}

fn describe_tile(tile: &Tile) -> String {
    let dims: Vec<String> = tile.shape.iter().map(|d| d.to_string()).collect();
    let layout = match (&tile.layout, &tile.declared) {
        (Some(l), _) => l.describe(),
        (None, Some(d)) => format!("declared {}", d.describe()),
        (None, None) => "?".to_string(),
    };
    format!(
        "tile {}: {} {}[{}] {}",
        tile.name,
        tile.scope.name(),
        tile.dtype,
        dims.join(", "),
        layout
    )
}

impl Printer<'_> {
    fn line(&mut self, depth: usize, site: Site, text: &str) {
        let indent = "  ".repeat(depth);
        let start = (self.text.len() + indent.len()) as u32;
        self.text.push_str(&indent);
        self.text.push_str(text);
        let end = self.text.len() as u32;
        self.text.push('\n');
        if site != Site::Nowhere {
            self.spans.insert(site, Span::new(start, end));
        }
    }

    fn body(&mut self, body: &[Op], depth: usize) {
        for op in body {
            let mut text = format!("{} {}", op.id, self.describe_op(&op.kind));
            if let Some(s) = &op.strategy {
                let _ = write!(text, "  ; {}", s.describe());
            }
            self.line(depth, Site::Op(op.id), &text);
            if let OpKind::Pipelined { body, schedule, .. } = &op.kind {
                self.body(body, depth + 1);
                if let Some(s) = schedule {
                    for line in s.describe() {
                        self.line(depth + 1, Site::Nowhere, &format!("| {}", line));
                    }
                }
            }
        }
    }

    fn name(&self, tile: super::TileId) -> &str {
        self.kernel
            .get_tile(tile)
            .map(|t| t.name.as_str())
            .unwrap_or("<unknown>")
    }

    fn region(&self, r: &Region) -> String {
        let offsets: Vec<String> = r.offsets.iter().map(Affine::to_string).collect();
        let extents: Vec<String> = r.extents.iter().map(|e| e.to_string()).collect();
        format!(
            "{}[{} +: {}]",
            self.name(r.tile),
            offsets.join(", "),
            extents.join("x")
        )
    }

    fn access(&self, a: &Access) -> String {
        let ix: Vec<String> = a.indices.iter().map(Affine::to_string).collect();
        format!("{}[{}]", self.name(a.tile), ix.join(", "))
    }

    fn expr(&self, e: &Expr) -> String {
        match e {
            Expr::Load(a) => self.access(a),
            Expr::Const(c) => c.to_string(),
            Expr::Unary(op, x) => format!("{}({})", lower(op), self.expr(x)),
            Expr::Binary(op, l, r) => {
                format!("{}({}, {})", lower(op), self.expr(l), self.expr(r))
            }
            Expr::Cast(t, x) => format!("cast<{}>({})", t, self.expr(x)),
        }
    }

    fn describe_op(&self, kind: &OpKind) -> String {
        match kind {
            OpKind::Alloc { tile } => format!("alloc {}", self.name(*tile)),
            OpKind::Copy {
                src,
                dst,
                coalesced_width,
            } => {
                let mut s = format!("copy {} -> {}", self.region(src), self.region(dst));
                if let Some(w) = coalesced_width {
                    let _ = write!(s, " coalesced={}", w);
                }
                s
            }
            OpKind::Fill { tile, value } => format!("fill {} = {}", self.name(*tile), value),
            OpKind::Parallel {
                vars,
                extents,
                body,
            } => {
                let space: Vec<String> = vars
                    .iter()
                    .zip(extents)
                    .map(|(v, e)| format!("{} < {}", v, e))
                    .collect();
                let stmts: Vec<String> = body
                    .iter()
                    .map(|a| format!("{} = {}", self.access(&a.dst), self.expr(&a.value)))
                    .collect();
                format!("parallel ({}) {{ {} }}", space.join(", "), stmts.join("; "))
            }
            OpKind::Gemm {
                a,
                b,
                c,
                transpose_a,
                transpose_b,
                clear_accum,
            } => {
                let mut s = format!(
                    "gemm {}{}, {}{} -> {}",
                    self.name(*a),
                    if *transpose_a { "^T" } else { "" },
                    self.name(*b),
                    if *transpose_b { "^T" } else { "" },
                    self.name(*c)
                );
                if *clear_accum {
                    s.push_str(" clear");
                }
                s
            }
            OpKind::Reduce {
                src,
                dst,
                axis,
                kind,
                clear,
            } => format!(
                "reduce.{} {} -> {} axis={}{}",
                lower(kind),
                self.name(*src),
                self.name(*dst),
                axis,
                if *clear { " clear" } else { "" }
            ),
            OpKind::Pipelined {
                var,
                trip_count,
                stages,
                ..
            } => format!("pipelined {} in 0..{} stages={}", var, trip_count, stages),
            OpKind::Relayout { src, dst } => {
                format!("relayout {} -> {}", self.name(*src), self.name(*dst))
            }
        }
    }
}

fn lower(v: &impl std::fmt::Debug) -> String {
    format!("{:?}", v).to_lowercase()
}
