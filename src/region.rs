//! Planar region algebra.
//!
//! A [`Region`] is a set of non-overlapping, axis-aligned rectangles stored in
//! y-x banded order: rectangles are grouped into horizontal bands that share
//! the same `y1`/`y2`, and sorted by `x1` inside each band. Every operation
//! returns a normalized region, so two regions covering the same pixels always
//! compare equal.
//!
//! Coordinates are half-open: a rectangle covers `x1 <= x < x2` and
//! `y1 <= y < y2`.
//!
//! # Examples
//!
//! ```
//! use gosub_compositor::region::{Rect, Region};
//!
//! let screen = Region::from_rect(Rect::new(0, 0, 100, 100));
//! let window = Region::from_rect(Rect::new(10, 10, 20, 20));
//!
//! let uncovered = screen.subtract(&window);
//! assert_eq!(uncovered.area(), 100 * 100 - 20 * 20);
//! assert!(uncovered.intersect(&window).is_empty());
//! ```

/// Axis-aligned rectangle given by its two corners.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    /// Creates a rectangle from its origin and size.
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x1: x,
            y1: y,
            x2: x + width,
            y2: y + height,
        }
    }

    pub const fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub const fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub const fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub const fn is_empty(&self) -> bool {
        self.x1 >= self.x2 || self.y1 >= self.y2
    }

    /// Returns the overlapping part of two rectangles, if any.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let r = Rect {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        (!r.is_empty()).then_some(r)
    }

    pub const fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }

    /// Grows the rectangle by `dx` on the left and right and `dy` on the top
    /// and bottom. Negative values shrink it.
    pub const fn expand(&self, dx: i32, dy: i32) -> Rect {
        Rect {
            x1: self.x1 - dx,
            y1: self.y1 - dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    Union,
    Intersect,
    Subtract,
}

impl Op {
    fn keep(self, in_a: bool, in_b: bool) -> bool {
        match self {
            Op::Union => in_a || in_b,
            Op::Intersect => in_a && in_b,
            Op::Subtract => in_a && !in_b,
        }
    }
}

type Span = (i32, i32);

/// Normalized set of rectangles.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.rects
                    .iter()
                    .map(|r| (r.x1, r.y1, r.width(), r.height())),
            )
            .finish()
    }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Region::from_rect(rect)
    }
}

impl Region {
    pub fn new() -> Self {
        Self { rects: Vec::new() }
    }

    pub fn from_rect(rect: Rect) -> Self {
        if rect.is_empty() {
            return Self::new();
        }
        Self { rects: vec![rect] }
    }

    /// Builds a region from arbitrary (possibly overlapping) rectangles.
    pub fn from_rects<I: IntoIterator<Item = Rect>>(rects: I) -> Self {
        let raw: Vec<Rect> = rects.into_iter().filter(|r| !r.is_empty()).collect();
        Self {
            rects: combine(&raw, &[], Op::Union),
        }
    }

    /// The rectangles making up this region, in banded order.
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Bounding box of the region. Empty regions report a zero rectangle.
    pub fn extents(&self) -> Rect {
        let Some(first) = self.rects.first() else {
            return Rect::default();
        };
        self.rects.iter().fold(*first, |acc, r| Rect {
            x1: acc.x1.min(r.x1),
            y1: acc.y1.min(r.y1),
            x2: acc.x2.max(r.x2),
            y2: acc.y2.max(r.y2),
        })
    }

    /// Number of pixels covered.
    pub fn area(&self) -> i64 {
        self.rects
            .iter()
            .map(|r| r.width() as i64 * r.height() as i64)
            .sum()
    }

    pub fn union(&self, other: &Region) -> Region {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        Region {
            rects: combine(&self.rects, &other.rects, Op::Union),
        }
    }

    pub fn union_rect(&self, rect: Rect) -> Region {
        self.union(&Region::from_rect(rect))
    }

    pub fn intersect(&self, other: &Region) -> Region {
        if self.is_empty() || other.is_empty() {
            return Region::new();
        }
        Region {
            rects: combine(&self.rects, &other.rects, Op::Intersect),
        }
    }

    pub fn intersect_rect(&self, rect: Rect) -> Region {
        self.intersect(&Region::from_rect(rect))
    }

    pub fn subtract(&self, other: &Region) -> Region {
        if self.is_empty() || other.is_empty() {
            return self.clone();
        }
        Region {
            rects: combine(&self.rects, &other.rects, Op::Subtract),
        }
    }

    /// Moves the region in place.
    pub fn translate(&mut self, dx: i32, dy: i32) {
        for r in &mut self.rects {
            *r = r.translate(dx, dy);
        }
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Region {
        let mut out = self.clone();
        out.translate(dx, dy);
        out
    }

    /// Grows every rectangle of the region by `dx`/`dy` on each side and
    /// merges the result. Negative values shrink each rectangle.
    pub fn resize(&self, dx: i32, dy: i32) -> Region {
        Region::from_rects(self.rects.iter().map(|r| r.expand(dx, dy)))
    }

    /// Returns `true` when every pixel of `other` is also in `self`.
    pub fn contains_region(&self, other: &Region) -> bool {
        other.subtract(self).is_empty()
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rects
            .iter()
            .any(|r| x >= r.x1 && x < r.x2 && y >= r.y1 && y < r.y2)
    }
}

/// Spans of `rects` that cover the band `[y1, y2)`, sorted and merged.
///
/// Band edges are always taken from the input rectangles, so a rectangle
/// either covers a band entirely or not at all.
fn spans_in_band(rects: &[Rect], y1: i32, y2: i32) -> Vec<Span> {
    let mut spans: Vec<Span> = rects
        .iter()
        .filter(|r| r.y1 <= y1 && r.y2 >= y2)
        .map(|r| (r.x1, r.x2))
        .collect();
    spans.sort_unstable();

    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for (x1, x2) in spans {
        match merged.last_mut() {
            Some(last) if x1 <= last.1 => last.1 = last.1.max(x2),
            _ => merged.push((x1, x2)),
        }
    }
    merged
}

fn covered(spans: &[Span], x1: i32, x2: i32) -> bool {
    spans.iter().any(|&(s1, s2)| s1 <= x1 && s2 >= x2)
}

fn combine_spans(a: &[Span], b: &[Span], op: Op) -> Vec<Span> {
    let mut xs: Vec<i32> = a.iter().chain(b).flat_map(|&(x1, x2)| [x1, x2]).collect();
    xs.sort_unstable();
    xs.dedup();

    let mut out: Vec<Span> = Vec::new();
    for w in xs.windows(2) {
        let (x1, x2) = (w[0], w[1]);
        if !op.keep(covered(a, x1, x2), covered(b, x1, x2)) {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.1 == x1 => last.1 = x2,
            _ => out.push((x1, x2)),
        }
    }
    out
}

fn combine(a: &[Rect], b: &[Rect], op: Op) -> Vec<Rect> {
    let mut ys: Vec<i32> = a.iter().chain(b).flat_map(|r| [r.y1, r.y2]).collect();
    ys.sort_unstable();
    ys.dedup();

    let mut out: Vec<Rect> = Vec::new();
    // Previous emitted band: its spans, the index of its first rect, and its bottom edge.
    let mut prev: Option<(Vec<Span>, usize, i32)> = None;

    for w in ys.windows(2) {
        let (y1, y2) = (w[0], w[1]);
        let spans = combine_spans(&spans_in_band(a, y1, y2), &spans_in_band(b, y1, y2), op);
        if spans.is_empty() {
            prev = None;
            continue;
        }

        // Coalesce with the band right above when the spans are identical.
        if let Some((prev_spans, start, prev_y2)) = prev.as_mut() {
            if *prev_y2 == y1 && *prev_spans == spans {
                for r in &mut out[*start..] {
                    r.y2 = y2;
                }
                *prev_y2 = y2;
                continue;
            }
        }

        let start = out.len();
        out.extend(
            spans
                .iter()
                .map(|&(x1, x2)| Rect::from_corners(x1, y1, x2, y2)),
        );
        prev = Some((spans, start, y2));
    }
    out
}
