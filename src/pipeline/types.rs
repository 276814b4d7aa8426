//! Data types flowing between pipeline nodes.

use candle_core::{DType, Tensor};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Half-open `[start, end)` interval in signal or base coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PosRange {
    pub start: usize,
    pub end: usize,
}

impl PosRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Identity of one physical pore occupancy.
///
/// Fields: channel, mux, run id, flow cell id, client id. Duplex partners found
/// without a pairing list must share this key.
pub type UniquePoreIdentifierKey = (i32, i32, String, String, i32);

/// Modified-base states carried by [`Read::base_mod_probs`].
///
/// `alphabet` lists, for each canonical base in `ACGT` order, the canonical
/// base followed by its modification codes (e.g. `"ACmhGT"`). Each sequence
/// position owns `alphabet.len()` consecutive probability bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseModInfo {
    pub alphabet: String,
    pub long_names: String,
    pub context: String,
}

impl BaseModInfo {
    /// Number of probability bytes per sequence position.
    pub fn num_states(&self) -> usize {
        self.alphabet.len()
    }

    /// Index of the canonical state for `base` within the alphabet.
    pub fn canonical_state(&self, base: u8) -> Option<usize> {
        self.alphabet.bytes().position(|b| b == base.to_ascii_uppercase())
    }
}

/// One nanopore read: raw signal plus everything known about it so far.
#[derive(Debug)]
pub struct Read {
    pub read_id: String,
    pub read_tag: u32,
    /// 1-D signal for simplex reads, `[13, n]` for stereo-encoded reads.
    pub raw_data: Tensor,
    pub seq: String,
    pub qstring: String,
    /// One entry per `model_stride` samples; 1 marks the start of a base.
    pub moves: Vec<u8>,
    pub model_stride: usize,
    /// pA = scale * raw + shift
    pub scale: f32,
    pub shift: f32,
    pub sample_rate: u32,
    pub start_time_ms: u64,
    pub channel: i32,
    pub mux: i32,
    pub run_id: String,
    pub flowcell_id: String,
    pub client_id: i32,
    pub base_mod_probs: Option<Vec<u8>>,
    pub base_mod_info: Option<Arc<BaseModInfo>>,
    pub is_duplex: bool,
    pub num_duplex_candidate_pairs: AtomicUsize,
    pub parent_read_id: Option<String>,
    pub subread_id: usize,
    pub split_count: usize,
}

impl Read {
    /// Creates a read with no basecall attached.
    pub fn new(read_id: impl Into<String>, raw_data: Tensor) -> Self {
        Self {
            read_id: read_id.into(),
            read_tag: 0,
            raw_data,
            seq: String::new(),
            qstring: String::new(),
            moves: Vec::new(),
            model_stride: 1,
            scale: 1.0,
            shift: 0.0,
            sample_rate: 4000,
            start_time_ms: 0,
            channel: 0,
            mux: 0,
            run_id: String::new(),
            flowcell_id: String::new(),
            client_id: 0,
            base_mod_probs: None,
            base_mod_info: None,
            is_duplex: false,
            num_duplex_candidate_pairs: AtomicUsize::new(0),
            parent_read_id: None,
            subread_id: 0,
            split_count: 1,
        }
    }

    /// Attaches basecaller output.
    pub fn with_basecall(
        mut self,
        seq: impl Into<String>,
        qstring: impl Into<String>,
        moves: Vec<u8>,
        model_stride: usize,
    ) -> Self {
        self.seq = seq.into();
        self.qstring = qstring.into();
        self.moves = moves;
        self.model_stride = model_stride.max(1);
        self
    }

    /// Sets the pore occupancy this read was sequenced in.
    pub fn with_pore(
        mut self,
        channel: i32,
        mux: i32,
        run_id: impl Into<String>,
        flowcell_id: impl Into<String>,
        client_id: i32,
    ) -> Self {
        self.channel = channel;
        self.mux = mux;
        self.run_id = run_id.into();
        self.flowcell_id = flowcell_id.into();
        self.client_id = client_id;
        self
    }

    pub fn with_start_time(mut self, start_time_ms: u64) -> Self {
        self.start_time_ms = start_time_ms;
        self
    }

    pub fn with_scaling(mut self, scale: f32, shift: f32) -> Self {
        self.scale = scale;
        self.shift = shift;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Number of samples along the time axis.
    pub fn num_samples(&self) -> usize {
        self.raw_data.dims().last().copied().unwrap_or(0)
    }

    /// Acquisition end time derived from the sample count.
    pub fn end_time_ms(&self) -> u64 {
        let rate = u64::from(self.sample_rate.max(1));
        self.start_time_ms + (self.num_samples() as u64 * 1000) / rate
    }

    pub fn pore_key(&self) -> UniquePoreIdentifierKey {
        (
            self.channel,
            self.mux,
            self.run_id.clone(),
            self.flowcell_id.clone(),
            self.client_id,
        )
    }

    /// Copies a 1-D signal to host memory as `f32`.
    pub fn signal_f32(&self) -> candle_core::Result<Vec<f32>> {
        self.raw_data.to_dtype(DType::F32)?.to_vec1::<f32>()
    }

    pub fn candidate_pairs(&self) -> usize {
        self.num_duplex_candidate_pairs.load(Ordering::SeqCst)
    }
}

impl Clone for Read {
    fn clone(&self) -> Self {
        Self {
            read_id: self.read_id.clone(),
            read_tag: self.read_tag,
            raw_data: self.raw_data.clone(),
            seq: self.seq.clone(),
            qstring: self.qstring.clone(),
            moves: self.moves.clone(),
            model_stride: self.model_stride,
            scale: self.scale,
            shift: self.shift,
            sample_rate: self.sample_rate,
            start_time_ms: self.start_time_ms,
            channel: self.channel,
            mux: self.mux,
            run_id: self.run_id.clone(),
            flowcell_id: self.flowcell_id.clone(),
            client_id: self.client_id,
            base_mod_probs: self.base_mod_probs.clone(),
            base_mod_info: self.base_mod_info.clone(),
            is_duplex: self.is_duplex,
            num_duplex_candidate_pairs: AtomicUsize::new(self.candidate_pairs()),
            parent_read_id: self.parent_read_id.clone(),
            subread_id: self.subread_id,
            split_count: self.split_count,
        }
    }
}

/// A template read and its candidate complement.
#[derive(Debug, Clone)]
pub struct ReadPair {
    pub template: Arc<Read>,
    pub complement: Arc<Read>,
}

/// Announces that a counted candidate pair failed stereo encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CandidatePairRejectedMessage;

/// An unmapped SAM record produced by the record formatter.
#[derive(Debug, Clone, PartialEq)]
pub struct SamRecord {
    pub qname: String,
    pub flag: u16,
    pub seq: String,
    pub qual: String,
    pub tags: Vec<String>,
}

impl SamRecord {
    /// Renders the record as one tab-separated SAM line.
    pub fn to_line(&self) -> String {
        let seq = if self.seq.is_empty() { "*" } else { &self.seq };
        let qual = if self.qual.is_empty() { "*" } else { &self.qual };
        let mut line = format!(
            "{}\t{}\t*\t0\t0\t*\t*\t0\t0\t{}\t{}",
            self.qname, self.flag, seq, qual
        );
        for tag in &self.tags {
            line.push('\t');
            line.push_str(tag);
        }
        line
    }
}

/// Everything a node queue can carry.
#[derive(Debug)]
pub enum Message {
    Read(Box<Read>),
    ReadPair(ReadPair),
    CandidatePairRejected(CandidatePairRejectedMessage),
    Record(SamRecord),
}

impl Message {
    /// Variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Read(_) => "read",
            Message::ReadPair(_) => "read_pair",
            Message::CandidatePairRejected(_) => "candidate_pair_rejected",
            Message::Record(_) => "record",
        }
    }
}

impl From<Read> for Message {
    fn from(read: Read) -> Self {
        Message::Read(Box::new(read))
    }
}

impl From<Box<Read>> for Message {
    fn from(read: Box<Read>) -> Self {
        Message::Read(read)
    }
}

impl From<ReadPair> for Message {
    fn from(pair: ReadPair) -> Self {
        Message::ReadPair(pair)
    }
}

impl From<SamRecord> for Message {
    fn from(record: SamRecord) -> Self {
        Message::Record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn signal(len: usize) -> Tensor {
        Tensor::zeros(len, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_pos_range_len() {
        assert_eq!(PosRange::new(3, 10).len(), 7);
        assert_eq!(PosRange::new(10, 3).len(), 0);
        assert!(PosRange::new(5, 5).is_empty());
    }

    #[test]
    fn test_read_defaults() {
        let read = Read::new("r1", signal(100));
        assert_eq!(read.num_samples(), 100);
        assert_eq!(read.model_stride, 1);
        assert_eq!(read.split_count, 1);
        assert_eq!(read.candidate_pairs(), 0);
        assert!(!read.is_duplex);
    }

    #[test]
    fn test_end_time_uses_sample_rate() {
        let read = Read::new("r1", signal(8000))
            .with_sample_rate(4000)
            .with_start_time(1000);
        assert_eq!(read.end_time_ms(), 3000);
    }

    #[test]
    fn test_num_samples_of_stereo_tensor() {
        let stereo = Tensor::zeros((13, 42), DType::F32, &Device::Cpu).unwrap();
        let read = Read::new("a;b", stereo);
        assert_eq!(read.num_samples(), 42);
    }

    #[test]
    fn test_clone_snapshots_pair_counter() {
        let read = Read::new("r1", signal(4));
        read.num_duplex_candidate_pairs.fetch_add(2, Ordering::SeqCst);
        let copy = read.clone();
        read.num_duplex_candidate_pairs.fetch_add(1, Ordering::SeqCst);
        assert_eq!(copy.candidate_pairs(), 2);
        assert_eq!(copy.num_samples(), 4);
    }

    #[test]
    fn test_pore_key() {
        let read = Read::new("r1", signal(1)).with_pore(12, 3, "run", "FAX123", 7);
        assert_eq!(
            read.pore_key(),
            (12, 3, "run".to_string(), "FAX123".to_string(), 7)
        );
    }

    #[test]
    fn test_base_mod_info_states() {
        let info = BaseModInfo {
            alphabet: "ACmGT".to_string(),
            long_names: "5mC".to_string(),
            context: "_CG_".to_string(),
        };
        assert_eq!(info.num_states(), 5);
        assert_eq!(info.canonical_state(b'C'), Some(1));
        assert_eq!(info.canonical_state(b'g'), Some(3));
        assert_eq!(info.canonical_state(b'N'), None);
    }

    #[test]
    fn test_sam_line_placeholders() {
        let record = SamRecord {
            qname: "r1".to_string(),
            flag: 4,
            seq: String::new(),
            qual: String::new(),
            tags: vec!["qs:i:12".to_string()],
        };
        assert_eq!(record.to_line(), "r1\t4\t*\t0\t0\t*\t*\t0\t0\t*\t*\tqs:i:12");
    }

    #[test]
    fn test_message_kind() {
        let message: Message = Read::new("r1", signal(1)).into();
        assert_eq!(message.kind(), "read");
        let rejected = Message::CandidatePairRejected(CandidatePairRejectedMessage);
        assert_eq!(rejected.kind(), "candidate_pair_rejected");
    }
}
