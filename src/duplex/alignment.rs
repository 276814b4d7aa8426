//! Edit-distance alignment of a template against a reverse-complemented complement.
//!
//! Reads run to tens of kilobases, so the alignment is anchored: exact k-mer
//! matches are chained with LCSk++ and only the stretches between consecutive
//! anchors go through dynamic programming. Scoring inside a stretch is unit cost
//! (match 0, mismatch -1, gap open 0, gap extend -1). Memory is bounded by the
//! largest stretch rather than the product of the read lengths.

use bio::alignment::pairwise::Aligner;
use bio::alignment::sparse;
use bio::alignment::{Alignment, AlignmentOperation};
use std::iter::repeat_n;

/// Anchor length for the sparse chaining step.
pub const ANCHOR_KMER: usize = 15;

/// Largest stretch (template x complement cells) aligned by dynamic programming.
/// Bigger stretches are walked along the diagonal instead.
pub const MAX_GAP_CELLS: usize = 1 << 22;

/// One column of the alignment, from the template's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOp {
    Match,
    Mismatch,
    /// Base present in the template only.
    TemplateOnly,
    /// Base present in the complement only.
    ComplementOnly,
}

impl EditOp {
    pub fn consumes_template(self) -> bool {
        self != EditOp::ComplementOnly
    }

    pub fn consumes_complement(self) -> bool {
        self != EditOp::TemplateOnly
    }
}

fn unit_cost(a: u8, b: u8) -> i32 {
    if a == b { 0 } else { -1 }
}

/// Aligns the unanchored stretches between chained k-mers.
struct GapAligner {
    aligner: Aligner<fn(u8, u8) -> i32>,
}

impl GapAligner {
    fn new() -> Self {
        Self {
            aligner: Aligner::new(0, -1, unit_cost as fn(u8, u8) -> i32),
        }
    }

    fn align(&mut self, template: &[u8], complement: &[u8], ops: &mut Vec<EditOp>) {
        if template.is_empty() || complement.is_empty() {
            ops.extend(repeat_n(EditOp::TemplateOnly, template.len()));
            ops.extend(repeat_n(EditOp::ComplementOnly, complement.len()));
        } else if (template.len() + 1).saturating_mul(complement.len() + 1) <= MAX_GAP_CELLS {
            let alignment = self.aligner.global(template, complement);
            push_alignment_ops(&alignment, ops);
        } else {
            // Upper bound on the stretch's edit distance
            let shared = template.len().min(complement.len());
            ops.extend(template[..shared].iter().zip(&complement[..shared]).map(|(a, b)| {
                if a == b { EditOp::Match } else { EditOp::Mismatch }
            }));
            ops.extend(repeat_n(EditOp::TemplateOnly, template.len() - shared));
            ops.extend(repeat_n(EditOp::ComplementOnly, complement.len() - shared));
        }
    }
}

fn push_alignment_ops(alignment: &Alignment, ops: &mut Vec<EditOp>) {
    ops.extend(alignment.operations.iter().filter_map(|op| match op {
        AlignmentOperation::Match => Some(EditOp::Match),
        AlignmentOperation::Subst => Some(EditOp::Mismatch),
        // Ins consumes x only, Del consumes y only
        AlignmentOperation::Ins => Some(EditOp::TemplateOnly),
        AlignmentOperation::Del => Some(EditOp::ComplementOnly),
        AlignmentOperation::Xclip(_) | AlignmentOperation::Yclip(_) => None,
    }));
}

/// Interior part of an alignment bounded by runs of exact matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimmedWindow {
    /// First alignment column inside the window.
    pub start: usize,
    /// One past the last alignment column inside the window.
    pub end: usize,
    /// Template bases consumed before `start`.
    pub template_start: usize,
    /// Complement bases consumed before `start`.
    pub complement_start: usize,
}

impl TrimmedWindow {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Global alignment as an edit script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairAlignment {
    pub ops: Vec<EditOp>,
    pub edit_distance: usize,
}

impl PairAlignment {
    /// Aligns `template` (x) end to end against `complement_rc` (y).
    ///
    /// `edit_distance` counts every non-match column of the resulting script.
    pub fn global(template: &[u8], complement_rc: &[u8]) -> Self {
        let matches = sparse::find_kmer_matches(template, complement_rc, ANCHOR_KMER);
        let chain = sparse::lcskpp(&matches, ANCHOR_KMER).path;

        let mut gaps = GapAligner::new();
        let mut ops = Vec::with_capacity(template.len().max(complement_rc.len()));
        let (mut tx, mut cy) = (0, 0);
        for (x, y) in chain.into_iter().map(|i| matches[i]) {
            let (x, y) = (x as usize, y as usize);
            if x >= tx && y >= cy {
                gaps.align(&template[tx..x], &complement_rc[cy..y], &mut ops);
                ops.extend(repeat_n(EditOp::Match, ANCHOR_KMER));
                tx = x + ANCHOR_KMER;
                cy = y + ANCHOR_KMER;
            } else if x + cy == y + tx && x + ANCHOR_KMER > tx {
                // Overlaps the previous anchor on the same diagonal
                let extend = x + ANCHOR_KMER - tx;
                ops.extend(repeat_n(EditOp::Match, extend));
                tx += extend;
                cy += extend;
            }
        }
        gaps.align(&template[tx..], &complement_rc[cy..], &mut ops);

        Self::from_ops(ops)
    }

    /// Builds an alignment from an existing edit script.
    pub fn from_ops(ops: Vec<EditOp>) -> Self {
        let edit_distance = ops.iter().filter(|op| **op != EditOp::Match).count();
        Self { ops, edit_distance }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Edit distance over the full alignment length.
    pub fn error_rate(&self) -> f32 {
        if self.ops.is_empty() {
            return 1.0;
        }
        self.edit_distance as f32 / self.ops.len() as f32
    }

    /// Finds the window from the first run of `run` matches to the last one.
    ///
    /// Both runs are included in the window. Returns `None` when the alignment
    /// has no such run.
    pub fn trimmed_window(&self, run: usize) -> Option<TrimmedWindow> {
        let run = run.max(1);

        let mut consecutive = 0;
        let mut template_cursor = 0;
        let mut complement_cursor = 0;
        let mut front = None;
        for (i, op) in self.ops.iter().enumerate() {
            consecutive = if *op == EditOp::Match { consecutive + 1 } else { 0 };
            if op.consumes_template() {
                template_cursor += 1;
            }
            if op.consumes_complement() {
                complement_cursor += 1;
            }
            if consecutive == run {
                front = Some(TrimmedWindow {
                    start: i + 1 - run,
                    end: self.ops.len(),
                    template_start: template_cursor - run,
                    complement_start: complement_cursor - run,
                });
                break;
            }
        }
        let mut window = front?;

        consecutive = 0;
        for (i, op) in self.ops.iter().enumerate().rev() {
            consecutive = if *op == EditOp::Match { consecutive + 1 } else { 0 };
            if consecutive == run {
                window.end = i + run;
                break;
            }
        }
        Some(window)
    }
}
