//! Duplex split detection.
//!
//! A single "read" sometimes spans two molecules (typically a template and its
//! complement) that the pore captured back to back. The splitter looks for the
//! telltale signs of such a junction: a burst of open-pore current, an adapter
//! sequence, or a region whose downstream bases are the reverse complement of
//! its upstream bases. Each junction found becomes a spacer, and the read is cut
//! into subreads around the spacers.

use crate::defaults;
use crate::duplex::sequence::{move_cum_sums, moves_to_map, reverse_complement};
use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::stats::NamedStats;
use crate::pipeline::types::{Message, PosRange, Read};
use bio::pattern_matching::myers::Myers;
use bio::pattern_matching::myers::long::Myers as LongMyers;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Longest adapter the bit-parallel matcher accepts.
pub const MAX_ADAPTER_LEN: usize = 64;

/// Thresholds used by the split finders.
///
/// Signal positions are in samples, sequence positions in bases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplexSplitSettings {
    pub enabled: bool,
    /// Only look for pore signal confirmed by an adapter.
    pub simplex_mode: bool,
    /// pA above which a sample counts as open pore.
    pub pore_thr: f32,
    pub pore_cl_dist: usize,
    pub relaxed_pore_thr: f32,
    /// Template bases checked to the left of a candidate spacer.
    pub end_flank: usize,
    /// Bases dropped from the end of the left flank.
    pub end_trim: usize,
    /// Complement bases checked to the right of a candidate spacer.
    pub start_flank: usize,
    pub flank_edist: usize,
    pub relaxed_flank_edist: usize,
    pub adapter_edist: u8,
    pub relaxed_adapter_edist: u8,
    pub pore_adapter_range: usize,
    /// Adapter hits this close to the read start are the read's own adapter.
    pub expect_adapter_prefix: usize,
    /// Samples at the read start ignored by pore detection.
    pub expect_pore_prefix: usize,
    pub middle_adapter_search_span: usize,
    pub middle_adapter_search_frac: f32,
    pub adapter: String,
}

impl Default for DuplexSplitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            simplex_mode: false,
            pore_thr: 160.0,
            pore_cl_dist: 4000,
            relaxed_pore_thr: 150.0,
            end_flank: 1200,
            end_trim: 200,
            start_flank: 1700,
            flank_edist: 150,
            relaxed_flank_edist: 250,
            adapter_edist: 4,
            relaxed_adapter_edist: 6,
            pore_adapter_range: 100,
            expect_adapter_prefix: 200,
            expect_pore_prefix: 5000,
            middle_adapter_search_span: 1000,
            middle_adapter_search_frac: 0.2,
            adapter: defaults::DUPLEX_ADAPTER.to_string(),
        }
    }
}

/// Strategies for locating spacers, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitFinder {
    /// Open-pore signal with an adapter right after it.
    PoreAdapter,
    /// Open-pore signal between reverse-complementary flanks.
    PoreFlank,
    /// Weaker pore signal with both a weaker adapter and weaker flank match.
    PoreAll,
    /// Adapter hit past the read's own adapter, between matching flanks.
    AdapterFlank,
    /// Adapter near the middle of a read whose ends are reverse complements.
    AdapterMiddle,
}

impl SplitFinder {
    pub const ALL: [SplitFinder; 5] = [
        SplitFinder::PoreAdapter,
        SplitFinder::PoreFlank,
        SplitFinder::PoreAll,
        SplitFinder::AdapterFlank,
        SplitFinder::AdapterMiddle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SplitFinder::PoreAdapter => "PORE_ADAPTER",
            SplitFinder::PoreFlank => "PORE_FLANK",
            SplitFinder::PoreAll => "PORE_ALL",
            SplitFinder::AdapterFlank => "ADAPTER_FLANK",
            SplitFinder::AdapterMiddle => "ADAPTER_MIDDLE",
        }
    }
}

/// Clusters above-threshold samples; clusters closer than `cluster_dist` merge.
///
/// Samples before `ignore_prefix` are skipped. Ranges are half-open.
pub fn detect_pore_signal(
    pa_signal: &[f32],
    threshold: f32,
    cluster_dist: usize,
    ignore_prefix: usize,
) -> Vec<PosRange> {
    let mut clusters = Vec::new();
    let mut current: Option<PosRange> = None;
    for (i, &sample) in pa_signal.iter().enumerate().skip(ignore_prefix) {
        if sample <= threshold {
            continue;
        }
        match current.as_mut() {
            Some(cluster) if i <= cluster.end + cluster_dist => cluster.end = i + 1,
            _ => {
                if let Some(done) = current.take() {
                    clusters.push(done);
                }
                current = Some(PosRange::new(i, i + 1));
            }
        }
    }
    clusters.extend(current);
    clusters
}

/// Joins consecutive ranges separated by at most `dist`. Input must be sorted.
pub fn merge_ranges(ranges: &[PosRange], dist: usize) -> Vec<PosRange> {
    let mut merged: Vec<PosRange> = Vec::with_capacity(ranges.len());
    for &range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end + dist => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

/// Best approximate occurrence of `adapter` in `seq[range]`.
///
/// Ties on edit distance go to the leftmost end position.
pub fn find_best_adapter_match(
    adapter: &[u8],
    seq: &[u8],
    max_edist: u8,
    range: PosRange,
) -> Option<PosRange> {
    let end = range.end.min(seq.len());
    if range.start >= end || adapter.is_empty() || adapter.len() > MAX_ADAPTER_LEN {
        return None;
    }
    let mut myers = Myers::<u64>::new(adapter);
    myers
        .find_all(&seq[range.start..end], max_edist)
        .min_by_key(|&(start, stop, dist)| (dist, stop, start))
        .map(|(start, stop, _)| PosRange::new(range.start + start, range.start + stop))
}

/// True if the reverse complement of `seq[complement]` contains `seq[template]`
/// within `max_edist` edits.
pub fn check_rc_match(seq: &[u8], template: PosRange, complement: PosRange, max_edist: usize) -> bool {
    let (Some(template_seq), Some(complement_seq)) = (
        seq.get(template.start..template.end),
        seq.get(complement.start..complement.end),
    ) else {
        return false;
    };
    if template_seq.is_empty() || complement_seq.is_empty() {
        return false;
    }
    let Ok(complement_seq) = std::str::from_utf8(complement_seq) else {
        return false;
    };
    let rc = reverse_complement(complement_seq);

    // Block-based Myers: template aligned end to end, free ends in the complement.
    let myers = LongMyers::<u64>::new(template_seq);
    myers.distance(rc.as_bytes()) <= max_edist
}

/// Read with the derived data every finder needs.
struct SplitCandidate<'a> {
    read: &'a Read,
    pa_signal: Vec<f32>,
    move_sums: Vec<usize>,
}

impl<'a> SplitCandidate<'a> {
    fn new(read: &'a Read, pa_signal: Vec<f32>) -> Self {
        Self {
            read,
            pa_signal,
            move_sums: move_cum_sums(&read.moves),
        }
    }
}

/// Signal in picoamps: `scale * raw + shift`.
fn pa_signal(read: &Read) -> candle_core::Result<Vec<f32>> {
    Ok(read
        .signal_f32()?
        .into_iter()
        .map(|sample| read.scale * sample + read.shift)
        .collect())
}

/// Deterministic id for the subread of `parent_id` starting at `start_sample`.
pub fn derive_read_id(parent_id: &str, start_sample: usize) -> String {
    let namespace = Uuid::parse_str(parent_id)
        .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, parent_id.as_bytes()));
    Uuid::new_v5(&namespace, start_sample.to_string().as_bytes()).to_string()
}

/// Finds spacers in reads and cuts them into subreads.
#[derive(Debug, Clone)]
pub struct DuplexSplitter {
    settings: DuplexSplitSettings,
    finders: Vec<SplitFinder>,
}

impl DuplexSplitter {
    pub fn new(settings: DuplexSplitSettings) -> Self {
        let finders = if settings.simplex_mode {
            vec![SplitFinder::PoreAdapter]
        } else {
            SplitFinder::ALL.to_vec()
        };
        Self { settings, finders }
    }

    pub fn settings(&self) -> &DuplexSplitSettings {
        &self.settings
    }

    pub fn finders(&self) -> &[SplitFinder] {
        &self.finders
    }

    /// Pore-signal clusters mapped to base coordinates.
    fn possible_pore_regions(&self, candidate: &SplitCandidate<'_>, pore_thr: f32) -> Vec<PosRange> {
        let stride = candidate.read.model_stride.max(1);
        let sums = &candidate.move_sums;
        detect_pore_signal(
            &candidate.pa_signal,
            pore_thr,
            self.settings.pore_cl_dist,
            self.settings.expect_pore_prefix,
        )
        .into_iter()
        .filter_map(|region| {
            let move_start = region.start / stride;
            let move_end = region.end / stride;
            // Past the last move, or before the first base was called
            if move_start >= sums.len() || move_end >= sums.len() || sums[move_start] == 0 {
                return None;
            }
            Some(PosRange::new(sums[move_start] - 1, sums[move_end]))
        })
        .collect()
    }

    fn check_nearby_adapter(&self, seq: &[u8], region: PosRange, max_edist: u8) -> bool {
        let search = PosRange::new(
            region.start,
            (region.end + self.settings.pore_adapter_range).min(seq.len()),
        );
        find_best_adapter_match(self.settings.adapter.as_bytes(), seq, max_edist, search).is_some()
    }

    fn check_flank_match(&self, seq: &[u8], spacer: PosRange, max_edist: usize) -> bool {
        let s = &self.settings;
        if spacer.start < s.end_flank || spacer.end + s.start_flank > seq.len() {
            return false;
        }
        check_rc_match(
            seq,
            PosRange::new(spacer.start - s.end_flank, spacer.start - s.end_trim.min(s.end_flank)),
            PosRange::new(spacer.start, spacer.end + s.start_flank),
            max_edist,
        )
    }

    fn identify_extra_middle_split(&self, seq: &[u8]) -> Option<PosRange> {
        let s = &self.settings;
        let len = seq.len();
        let frac_span = (s.middle_adapter_search_frac * len as f32).round() as usize;
        let span = s.middle_adapter_search_span.max(frac_span);
        if span == 0 || len < span {
            return None;
        }
        let ends_match = check_rc_match(
            seq,
            PosRange::new(len - span, len - span / 2),
            PosRange::new(0, span / 2),
            s.relaxed_flank_edist,
        );
        if !ends_match {
            return None;
        }
        let center = PosRange::new(len / 2 - span / 2, len / 2 + span / 2);
        let adapter =
            find_best_adapter_match(s.adapter.as_bytes(), seq, s.relaxed_adapter_edist, center)?;
        let adapter_start = adapter.start;
        if adapter_start == 0
            || !self.check_flank_match(
                seq,
                PosRange::new(adapter_start, adapter_start),
                s.relaxed_flank_edist,
            )
        {
            return None;
        }
        Some(PosRange::new(adapter_start - 1, adapter_start))
    }

    fn find_spacers(&self, finder: SplitFinder, candidate: &SplitCandidate<'_>) -> Vec<PosRange> {
        let s = &self.settings;
        let seq = candidate.read.seq.as_bytes();
        let flank_merge_dist = s.end_flank + s.start_flank;
        match finder {
            SplitFinder::PoreAdapter => self
                .possible_pore_regions(candidate, s.pore_thr)
                .into_iter()
                .filter(|&r| self.check_nearby_adapter(seq, r, s.adapter_edist))
                .collect(),
            SplitFinder::PoreFlank => {
                let confirmed: Vec<_> = self
                    .possible_pore_regions(candidate, s.pore_thr)
                    .into_iter()
                    .filter(|&r| self.check_flank_match(seq, r, s.flank_edist))
                    .collect();
                merge_ranges(&confirmed, flank_merge_dist)
            }
            SplitFinder::PoreAll => {
                let confirmed: Vec<_> = self
                    .possible_pore_regions(candidate, s.relaxed_pore_thr)
                    .into_iter()
                    .filter(|&r| {
                        self.check_nearby_adapter(seq, r, s.relaxed_adapter_edist)
                            && self.check_flank_match(seq, r, s.relaxed_flank_edist)
                    })
                    .collect();
                merge_ranges(&confirmed, flank_merge_dist)
            }
            SplitFinder::AdapterFlank => {
                let search = PosRange::new(s.expect_adapter_prefix, seq.len());
                find_best_adapter_match(s.adapter.as_bytes(), seq, s.adapter_edist, search)
                    .into_iter()
                    .filter(|r| {
                        let before = r.start - r.start.min(s.pore_adapter_range);
                        self.check_flank_match(seq, PosRange::new(before, r.start), s.flank_edist)
                    })
                    .collect()
            }
            SplitFinder::AdapterMiddle => self
                .identify_extra_middle_split(seq)
                .into_iter()
                .collect(),
        }
    }

    /// Cuts `read` around `spacers`, which must be sorted and in base coordinates.
    fn subreads(&self, read: &Read, spacers: &[PosRange]) -> candle_core::Result<Vec<Read>> {
        let stride = read.model_stride.max(1);
        let raw_len = read.num_samples();
        let seq_len = read.seq.len();
        let map = moves_to_map(&read.moves, stride, raw_len);
        let signal_at = |base: usize| map.get(base).map(|&s| s.min(raw_len));

        let mut subreads = Vec::with_capacity(spacers.len() + 1);
        let mut start_pos = 0;
        let mut signal_start = map[0].min(raw_len);
        for spacer in spacers {
            let (Some(spacer_signal_start), Some(spacer_signal_end)) =
                (signal_at(spacer.start), signal_at(spacer.end))
            else {
                continue;
            };
            if start_pos < spacer.start && signal_start / stride < spacer_signal_start / stride {
                subreads.push(subread(
                    read,
                    PosRange::new(start_pos, spacer.start),
                    PosRange::new(signal_start, spacer_signal_start),
                )?);
            }
            start_pos = spacer.end;
            signal_start = spacer_signal_end;
        }
        if start_pos < seq_len && signal_start / stride < raw_len / stride {
            subreads.push(subread(
                read,
                PosRange::new(start_pos, seq_len),
                PosRange::new(signal_start, raw_len),
            )?);
        }
        Ok(subreads)
    }

    /// Splits a read into subreads. A read with no spacers comes back unchanged.
    pub fn split(&self, read: Read) -> Vec<Read> {
        let mut pieces = Vec::new();
        self.split_from(read, 0, &mut pieces);

        let was_split = pieces.len() > 1 || pieces.iter().any(|r| r.parent_read_id.is_some());
        if was_split {
            let count = pieces.len();
            for (i, piece) in pieces.iter_mut().enumerate() {
                piece.subread_id = i;
                piece.split_count = count;
            }
        }
        pieces
    }

    /// Tries finders from `first` on; a piece split by one finder is passed to
    /// the finders after it.
    fn split_from(&self, read: Read, first: usize, out: &mut Vec<Read>) {
        if !self.settings.enabled || read.seq.is_empty() || read.moves.is_empty() {
            out.push(read);
            return;
        }
        let pa = match pa_signal(&read) {
            Ok(pa) => pa,
            Err(e) => {
                log::warn!("{}: cannot read signal for splitting: {e}", read.read_id);
                out.push(read);
                return;
            }
        };
        let candidate = SplitCandidate::new(&read, pa);

        for (index, &finder) in self.finders.iter().enumerate().skip(first) {
            let spacers = self.find_spacers(finder, &candidate);
            log::trace!(
                "{}: {} found {} spacer(s)",
                read.read_id,
                finder.name(),
                spacers.len()
            );
            if spacers.is_empty() {
                continue;
            }
            match self.subreads(&read, &spacers) {
                Ok(subreads) if !subreads.is_empty() => {
                    for subread in subreads {
                        self.split_from(subread, index + 1, out);
                    }
                    return;
                }
                Ok(_) => {}
                Err(e) => log::warn!("{}: failed to cut subreads: {e}", read.read_id),
            }
        }
        out.push(read);
    }

    /// Which finder, if any, produces spacers for `read`.
    pub fn first_matching_finder(&self, read: &Read) -> Option<SplitFinder> {
        if read.seq.is_empty() || read.moves.is_empty() {
            return None;
        }
        let candidate = SplitCandidate::new(read, pa_signal(read).ok()?);
        self.finders
            .iter()
            .copied()
            .find(|&f| !self.find_spacers(f, &candidate).is_empty())
    }
}

fn subread(parent: &Read, seq_range: PosRange, signal_range: PosRange) -> candle_core::Result<Read> {
    let stride = parent.model_stride.max(1);
    let raw = parent
        .raw_data
        .narrow(0, signal_range.start, signal_range.len())?;

    let move_start = (signal_range.start / stride).min(parent.moves.len());
    let move_end = (signal_range.end / stride).clamp(move_start, parent.moves.len());
    let seq = parent.seq.get(seq_range.start..seq_range.end).unwrap_or("");
    let qstring = parent
        .qstring
        .get(seq_range.start..seq_range.end)
        .unwrap_or("");
    let offset_ms = signal_range.start as u64 * 1000 / u64::from(parent.sample_rate.max(1));

    let mut read = Read::new(derive_read_id(&parent.read_id, signal_range.start), raw)
        .with_basecall(seq, qstring, parent.moves[move_start..move_end].to_vec(), stride)
        .with_pore(
            parent.channel,
            parent.mux,
            parent.run_id.clone(),
            parent.flowcell_id.clone(),
            parent.client_id,
        )
        .with_scaling(parent.scale, parent.shift)
        .with_sample_rate(parent.sample_rate)
        .with_start_time(parent.start_time_ms + offset_ms);
    read.read_tag = parent.read_tag;
    read.parent_read_id = Some(
        parent
            .parent_read_id
            .clone()
            .unwrap_or_else(|| parent.read_id.clone()),
    );
    Ok(read)
}

/// Node stage running a [`DuplexSplitter`] on every read.
pub struct DuplexSplitStation {
    splitter: DuplexSplitter,
    reads_seen: AtomicU64,
    reads_split: AtomicU64,
    subreads_emitted: AtomicU64,
}

impl DuplexSplitStation {
    pub fn new(settings: DuplexSplitSettings) -> Self {
        Self {
            splitter: DuplexSplitter::new(settings),
            reads_seen: AtomicU64::new(0),
            reads_split: AtomicU64::new(0),
            subreads_emitted: AtomicU64::new(0),
        }
    }

    pub fn splitter(&self) -> &DuplexSplitter {
        &self.splitter
    }
}

impl Station for DuplexSplitStation {
    fn name(&self) -> &'static str {
        "DuplexSplit"
    }

    fn process(&self, message: Message) -> Result<Vec<Message>, StationError> {
        let read = match message {
            Message::Read(read) => read,
            other => return Ok(vec![other]),
        };
        self.reads_seen.fetch_add(1, Ordering::Relaxed);

        let pieces = self.splitter.split(*read);
        if pieces.len() > 1 || pieces.iter().any(|r| r.parent_read_id.is_some()) {
            self.reads_split.fetch_add(1, Ordering::Relaxed);
            self.subreads_emitted
                .fetch_add(pieces.len() as u64, Ordering::Relaxed);
        }
        Ok(pieces.into_iter().map(Message::from).collect())
    }

    fn stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "reads_seen".to_string(),
            self.reads_seen.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "splits".to_string(),
            self.reads_split.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "subreads".to_string(),
            self.subreads_emitted.load(Ordering::Relaxed) as f64,
        );
        stats
    }
}
