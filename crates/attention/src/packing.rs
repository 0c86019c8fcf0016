//! Padding/packing descriptors consumed by the fused backend.
//!
//! A packed row holds several documents back to back. The descriptor splits
//! every row into segments that exactly partition `[0, seq_len)`:
//!
//! * a maximal run of real tokens sharing one sequence id (ids are ignored
//!   when sequence-id masking is off), and
//! * one singleton segment per padding token (attention mask `0` or id `-1`).
//!
//! Attention is permitted only inside a real segment. The dense reference
//! path derives its sequence-id mask from [`segment_labels`], the same rule,
//! so both backends forbid exactly the same pairs.
//!
//! Without sequence-id masking a row holds a single document: its real tokens
//! form one segment from the first to the last real token, and padding
//! between them (a right-padded prompt followed by decode steps) is recorded
//! as holes that neither attend nor are attended to.

use candle_core::{DType, Tensor};

use crate::core::{AttentionError, Backend};

/// Sentinel id marking padding inside a sequence-id tensor.
pub const PADDING_SEQUENCE_ID: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub len: usize,
    pub padding: bool,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn contains(&self, pos: usize) -> bool {
        (self.start..self.end()).contains(&pos)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackingDescriptor {
    seq_len: usize,
    rows: Vec<Vec<Segment>>,
    /// Sorted padded positions lying inside a real segment, per row.
    holes: Vec<Vec<usize>>,
}

impl PackingDescriptor {
    /// Every row is one real segment: no padding, no packing.
    pub fn unpacked(batch: usize, seq_len: usize) -> Self {
        let segment = Segment {
            start: 0,
            len: seq_len,
            padding: false,
        };
        Self {
            seq_len,
            rows: vec![vec![segment]; batch],
            holes: vec![Vec::new(); batch],
        }
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn batch(&self) -> usize {
        self.rows.len()
    }

    pub fn segments(&self, row: usize) -> &[Segment] {
        self.rows.get(row).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Padded positions inside the real segments of `row`.
    pub fn holes(&self, row: usize) -> &[usize] {
        self.holes.get(row).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_hole(&self, row: usize, pos: usize) -> bool {
        self.holes(row).binary_search(&pos).is_ok()
    }

    /// Real tokens per real segment, in batch order.
    fn real_lengths(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows.iter().enumerate().flat_map(move |(row, segments)| {
            segments.iter().filter(|s| !s.padding).map(move |s| {
                let holes = self.holes(row).iter().filter(|&&pos| s.contains(pos)).count();
                s.len - holes
            })
        })
    }

    /// Cumulative real-token offsets of the real segments over the flattened
    /// batch.
    pub fn cu_seqlens(&self) -> Vec<u32> {
        let mut offsets = vec![0u32];
        let mut total = 0u32;
        for len in self.real_lengths() {
            total += len as u32;
            offsets.push(total);
        }
        offsets
    }

    /// Most real tokens in one segment.
    pub fn max_seqlen(&self) -> usize {
        self.real_lengths().max().unwrap_or(0)
    }

    /// Whether the pair `(query, key)` of `row` may never attend, before
    /// causal or window masking. A padding position only matches itself.
    pub fn forbids(&self, row: usize, query: usize, key: usize) -> bool {
        if self.is_hole(row, query) || self.is_hole(row, key) {
            return true;
        }
        match self.segments(row).iter().find(|s| s.contains(query)) {
            Some(segment) => !segment.contains(key),
            None => true,
        }
    }
}

/// Splits one row into segments. `ids` and `real` must have length `seq_len`
/// when present.
pub fn row_segments(ids: Option<&[i64]>, real: Option<&[bool]>, seq_len: usize) -> Vec<Segment> {
    let is_padding = |pos: usize| {
        real.map(|r| !r[pos]).unwrap_or(false)
            || ids.map(|i| i[pos] == PADDING_SEQUENCE_ID).unwrap_or(false)
    };
    let mut segments: Vec<Segment> = Vec::new();
    for pos in 0..seq_len {
        let padding = is_padding(pos);
        let extends = match segments.last() {
            Some(last) if !padding && !last.padding => {
                ids.map(|i| i[pos] == i[last.start]).unwrap_or(true)
            }
            _ => false,
        };
        match segments.last_mut() {
            Some(last) if extends => last.len += 1,
            _ => segments.push(Segment {
                start: pos,
                len: 1,
                padding,
            }),
        }
    }
    segments
}

/// Splits a row without sequence ids: leading and trailing padding become
/// singleton segments and everything from the first to the last real token is
/// one segment. Returns the segments and the padded positions inside it.
pub fn document_segments(real: &[bool]) -> (Vec<Segment>, Vec<usize>) {
    let padding = |pos: usize| Segment {
        start: pos,
        len: 1,
        padding: true,
    };
    let (Some(first), Some(last)) = (
        real.iter().position(|&r| r),
        real.iter().rposition(|&r| r),
    ) else {
        return ((0..real.len()).map(padding).collect(), Vec::new());
    };
    let mut segments: Vec<Segment> = (0..first).map(padding).collect();
    segments.push(Segment {
        start: first,
        len: last + 1 - first,
        padding: false,
    });
    segments.extend((last + 1..real.len()).map(padding));
    let holes = (first..=last).filter(|&pos| !real[pos]).collect();
    (segments, holes)
}

/// Per-position segment index, the label the dense sequence-id mask compares.
pub fn segment_labels(segments: &[Segment], seq_len: usize) -> Vec<u32> {
    let mut labels = vec![0u32; seq_len];
    for (label, segment) in segments.iter().enumerate() {
        for slot in labels[segment.start..segment.end()].iter_mut() {
            *slot = label as u32;
        }
    }
    labels
}

fn host_rows_i64(tensor: &Tensor, name: &str, seq_len: usize) -> Result<Vec<Vec<i64>>, AttentionError> {
    let (_, len) = tensor
        .dims2()
        .map_err(|_| AttentionError::shape(format!("{name} must be [batch, seq_len]")))?;
    if len != seq_len {
        return Err(AttentionError::shape(format!(
            "{name} length {len} does not match sequence length {seq_len}"
        )));
    }
    Ok(tensor.to_dtype(DType::I64)?.to_vec2::<i64>()?)
}

fn host_real_rows(mask: &Tensor, seq_len: usize) -> Result<Vec<Vec<bool>>, AttentionError> {
    Ok(host_rows_i64(mask, "attention_mask", seq_len)?
        .into_iter()
        .map(|row| row.into_iter().map(|v| v != 0).collect())
        .collect())
}

/// Segments for every row of a `[batch, seq_len]` batch.
pub(crate) fn batch_segments(
    sequence_id: Option<&Tensor>,
    attention_mask: Option<&Tensor>,
    seq_len: usize,
) -> Result<Vec<Vec<Segment>>, AttentionError> {
    let ids = sequence_id
        .map(|t| host_rows_i64(t, "sequence_id", seq_len))
        .transpose()?;
    let real = attention_mask
        .map(|mask| host_real_rows(mask, seq_len))
        .transpose()?;

    let batch = match (&ids, &real) {
        (Some(ids), Some(real)) if ids.len() != real.len() => {
            return Err(AttentionError::shape(format!(
                "sequence_id batch {} does not match attention_mask batch {}",
                ids.len(),
                real.len()
            )))
        }
        (Some(ids), _) => ids.len(),
        (None, Some(real)) => real.len(),
        (None, None) => 0,
    };

    Ok((0..batch)
        .map(|b| {
            row_segments(
                ids.as_ref().map(|rows| rows[b].as_slice()),
                real.as_ref().map(|rows| rows[b].as_slice()),
                seq_len,
            )
        })
        .collect())
}

/// Builds the descriptor the fused backend consumes.
///
/// Returns `None` for the reference backend, and for a fused backend when
/// neither a sequence-id tensor nor an attention mask is available (callers
/// then use [`PackingDescriptor::unpacked`]). Without sequence-id masking
/// every row is one document and interior padding becomes holes.
pub fn build_packing_descriptor(
    sequence_id: Option<&Tensor>,
    seq_len: usize,
    use_sequence_id: bool,
    backend: &Backend,
    attention_mask: Option<&Tensor>,
) -> Result<Option<PackingDescriptor>, AttentionError> {
    if !backend.is_fused() {
        return Ok(None);
    }
    let sequence_id = if use_sequence_id { sequence_id } else { None };
    if sequence_id.is_none() && attention_mask.is_none() {
        return Ok(None);
    }

    let descriptor = match (sequence_id, attention_mask) {
        (None, Some(mask)) => {
            let (rows, holes) = host_real_rows(mask, seq_len)?
                .iter()
                .map(|real| document_segments(real))
                .unzip();
            PackingDescriptor {
                seq_len,
                rows,
                holes,
            }
        }
        _ => {
            let rows = batch_segments(sequence_id, attention_mask, seq_len)?;
            let holes = vec![Vec::new(); rows.len()];
            PackingDescriptor {
                seq_len,
                rows,
                holes,
            }
        }
    };
    log::debug!(
        "packing descriptor: batch={} segments={} max_seqlen={}",
        descriptor.batch(),
        descriptor.cu_seqlens().len() - 1,
        descriptor.max_seqlen()
    );
    Ok(Some(descriptor))
}
