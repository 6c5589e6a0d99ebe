//! Deflate block parser
//!
//! `do_block` consumes exactly one block (stored, fixed-Huffman or
//! dynamic-Huffman) from the bit stream and drives the decoded symbols
//! into a sink. It is monomorphized over both the sink and a validation
//! mode tag, so the same parser serves normal decoding, speculative
//! block-boundary probing and test diagnostics.

use crate::bitstream::{InputStream, MAX_ENSURE};
use crate::huffman::{
    static_tables, Decoder, HUFFDEC_END_OF_BLOCK_LENGTH, HUFFDEC_EXTRA_LENGTH_BITS_MASK,
    HUFFDEC_EXTRA_OFFSET_BITS_SHIFT, HUFFDEC_LENGTH_BASE_SHIFT, HUFFDEC_LENGTH_MASK,
    HUFFDEC_LITERAL, HUFFDEC_OFFSET_BASE_MASK, HUFFDEC_RESULT_SHIFT, HUFFDEC_SUBTABLE_POINTER,
    LITLEN_TABLEBITS, MAX_CODEWORD_LEN, MAX_PRE_CODEWORD_LEN, NUM_PRECODE_SYMS, OFFSET_TABLEBITS,
    PRECODE_LENS_PERMUTATION,
};
use crate::window::Sink;

/// Outcome of parsing one block. The first four variants are normal
/// control flow; the rest are parse failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockResult {
    Success,
    LastBlock,
    CaughtUpDownstream,
    FlushFail,
    InvalidBlockType,
    InvalidDynamicHT,
    InvalidStoredBlock,
    InvalidLiteral,
    InvalidMatch,
    InvalidParse,
    NotEnoughInput,
    TooMuchInput,
}

impl BlockResult {
    /// True for outcomes that mean the parse itself went wrong.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            BlockResult::Success
                | BlockResult::LastBlock
                | BlockResult::CaughtUpDownstream
                | BlockResult::FlushFail
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockResult::Success => "success",
            BlockResult::LastBlock => "last block",
            BlockResult::CaughtUpDownstream => "caught up downstream",
            BlockResult::FlushFail => "flush failed",
            BlockResult::InvalidBlockType => "invalid block type",
            BlockResult::InvalidDynamicHT => "invalid dynamic Huffman table",
            BlockResult::InvalidStoredBlock => "invalid stored block",
            BlockResult::InvalidLiteral => "non-text literal",
            BlockResult::InvalidMatch => "match offset out of range",
            BlockResult::InvalidParse => "inconsistent end of block",
            BlockResult::NotEnoughInput => "unexpected end of input",
            BlockResult::TooMuchInput => "trailing data after final block",
        }
    }
}

/// Validation mode tag. `fail_if` reports whether a violated predicate
/// should abort the parse; the tag names which way the branch is expected
/// to go so probing code reads the same as trusted decoding.
pub trait Mode: Copy + Default {
    fn fail_if(cond: bool) -> bool;
}

/// Trusted decoding: violations are errors, but are not expected.
#[derive(Clone, Copy, Default)]
pub struct ShouldSucceed;

impl Mode for ShouldSucceed {
    #[inline]
    fn fail_if(cond: bool) -> bool {
        cond
    }
}

/// Speculative probing: the first violation abandons the candidate.
#[derive(Clone, Copy, Default)]
pub struct ShouldFail;

impl Mode for ShouldFail {
    #[inline]
    fn fail_if(cond: bool) -> bool {
        cond
    }
}

/// Diagnostics only: violations assert.
#[derive(Clone, Copy, Default)]
pub struct MustSucceed;

impl Mode for MustSucceed {
    #[inline]
    fn fail_if(cond: bool) -> bool {
        debug_assert!(!cond, "block parse invariant violated");
        cond
    }
}

/// Read the dynamic-Huffman table definition and rebuild the decoder's
/// precode, offset and literal/length tables from it.
fn prepare_dynamic<M: Mode>(d: &mut Decoder, stream: &mut InputStream) -> bool {
    let num_litlen_syms = stream.pop_bits(5) as usize + 257;
    let num_offset_syms = stream.pop_bits(5) as usize + 1;
    let num_explicit_precode_lens = stream.pop_bits(4) as usize + 4;

    stream.ensure_bits(NUM_PRECODE_SYMS as u32 * 3);
    for i in 0..num_explicit_precode_lens {
        d.precode_lens[PRECODE_LENS_PERMUTATION[i] as usize] = stream.pop_bits(3) as u8;
    }
    for i in num_explicit_precode_lens..NUM_PRECODE_SYMS {
        d.precode_lens[PRECODE_LENS_PERMUTATION[i] as usize] = 0;
    }

    if M::fail_if(!d.build_precode_table()) {
        return false;
    }

    // Expand the run-length coded literal/length and offset lengths. The
    // lens buffer is oversized, so repeat runs may overshoot the requested
    // count without bounds checks.
    let mut i = 0;
    while i < num_litlen_syms + num_offset_syms {
        stream.ensure_bits(MAX_PRE_CODEWORD_LEN + 7);
        let entry = d.precode_table[stream.bits(MAX_PRE_CODEWORD_LEN) as usize];
        stream.remove_bits(entry & HUFFDEC_LENGTH_MASK);
        let presym = (entry >> HUFFDEC_RESULT_SHIFT) as usize;

        if presym < 16 {
            d.lens[i] = presym as u8;
            i += 1;
        } else if presym == 16 {
            // Repeat the previous length 3..6 times.
            if M::fail_if(i == 0) {
                return false;
            }
            let rep_val = d.lens[i - 1];
            let rep_count = 3 + stream.pop_bits(2) as usize;
            d.lens[i..i + 6].fill(rep_val);
            i += rep_count;
        } else if presym == 17 {
            // Repeat zero 3..10 times.
            let rep_count = 3 + stream.pop_bits(3) as usize;
            d.lens[i..i + 10].fill(0);
            i += rep_count;
        } else {
            // Repeat zero 11..138 times.
            let rep_count = 11 + stream.pop_bits(7) as usize;
            d.lens[i..i + rep_count].fill(0);
            i += rep_count;
        }
    }

    if M::fail_if(!d.build_offset_table(num_litlen_syms, num_offset_syms)) {
        return false;
    }
    if M::fail_if(!d.build_litlen_table(num_litlen_syms)) {
        return false;
    }
    true
}

/// Copy a stored block through the sink.
fn do_stored<S: Sink, M: Mode>(stream: &mut InputStream, out: &mut S) -> bool {
    stream.align_input();

    if stream.available() < 4 {
        return false;
    }
    let len = stream.pop_u16();
    let nlen = stream.pop_u16();

    if M::fail_if(len != !nlen) {
        return false;
    }
    if len as usize > stream.available() {
        return false;
    }
    if M::fail_if(!out.copy(stream, len as usize)) {
        return false;
    }
    true
}

/// Parse one deflate block, pushing its output into `out`.
pub fn do_block<S: Sink, M: Mode>(
    d: &mut Decoder,
    stream: &mut InputStream,
    out: &mut S,
) -> BlockResult {
    if !stream.ensure_bits(1 + 2 + 5 + 5 + 4) {
        return BlockResult::NotEnoughInput;
    }

    let success = if stream.pop_bits(1) != 0 {
        BlockResult::LastBlock
    } else {
        BlockResult::Success
    };

    let (litlen_table, offset_table): (&[u32], &[u32]) = match stream.pop_bits(2) {
        0b10 => {
            if !prepare_dynamic::<M>(d, stream) {
                return BlockResult::InvalidDynamicHT;
            }
            (&d.litlen_table, &d.offset_table)
        }
        0b00 => {
            if !do_stored::<S, M>(stream, out) {
                return BlockResult::InvalidStoredBlock;
            }
            return if M::fail_if(!out.end_block(stream)) {
                BlockResult::InvalidParse
            } else {
                success
            };
        }
        0b01 => {
            let t = static_tables();
            (&t.litlen_table, &t.offset_table)
        }
        _ => return BlockResult::InvalidBlockType,
    };

    // The main decode loop. Refill results are deliberately ignored here:
    // a truncated stream reads zero bits, which either decodes to a bogus
    // symbol (caught by the sink or the table) or runs the stream into an
    // overrun that the caller observes.
    loop {
        if !stream.ensure_bits(MAX_CODEWORD_LEN) && stream.available_bits() == 0 {
            return BlockResult::NotEnoughInput;
        }
        let mut entry = litlen_table[stream.bits(LITLEN_TABLEBITS) as usize];
        if entry & HUFFDEC_SUBTABLE_POINTER != 0 {
            // Litlen sub-table required (uncommon case).
            stream.remove_bits(LITLEN_TABLEBITS);
            let start = (entry >> HUFFDEC_RESULT_SHIFT) & 0xFFFF;
            entry = litlen_table[(start + stream.bits(entry & HUFFDEC_LENGTH_MASK)) as usize];
        }
        stream.remove_bits(entry & HUFFDEC_LENGTH_MASK);

        if entry & HUFFDEC_LITERAL != 0 {
            if out.available() == 0 && M::fail_if(out.flush() == 0) {
                return BlockResult::FlushFail;
            }
            if M::fail_if(!out.push((entry >> HUFFDEC_RESULT_SHIFT) as u8)) {
                return BlockResult::InvalidLiteral;
            }
            continue;
        }

        // Match or end-of-block.
        let payload = entry >> HUFFDEC_RESULT_SHIFT;
        stream.ensure_bits(MAX_ENSURE);
        let length = (payload >> HUFFDEC_LENGTH_BASE_SHIFT)
            + stream.pop_bits(payload & HUFFDEC_EXTRA_LENGTH_BITS_MASK);

        if length == HUFFDEC_END_OF_BLOCK_LENGTH {
            return if M::fail_if(!out.end_block(stream)) {
                BlockResult::InvalidParse
            } else {
                success
            };
        }
        if length as usize > out.available() {
            if M::fail_if(out.flush() == 0) {
                return BlockResult::FlushFail;
            }
            debug_assert!(length as usize <= out.available());
        }

        let mut entry = offset_table[stream.bits(OFFSET_TABLEBITS) as usize];
        if entry & HUFFDEC_SUBTABLE_POINTER != 0 {
            // Offset sub-table required (uncommon case).
            stream.remove_bits(OFFSET_TABLEBITS);
            let start = (entry >> HUFFDEC_RESULT_SHIFT) & 0xFFFF;
            entry = offset_table[(start + stream.bits(entry & HUFFDEC_LENGTH_MASK)) as usize];
        }
        stream.remove_bits(entry & HUFFDEC_LENGTH_MASK);
        let payload = entry >> HUFFDEC_RESULT_SHIFT;
        let offset = (payload & HUFFDEC_OFFSET_BASE_MASK)
            + stream.pop_bits(payload >> HUFFDEC_EXTRA_OFFSET_BITS_SHIFT);

        if M::fail_if(!out.copy_match(length, offset)) {
            return BlockResult::InvalidMatch;
        }
    }
}
