//! Parallel decompression coordinator
//!
//! The compressed span is cut into sections (one round of all workers)
//! and each section into one chunk per worker. Worker 0 decodes with a
//! real context; workers 1..N first locate a block boundary near their
//! assigned offset, then decode speculatively with placeholder symbols
//! standing in for the unknown upstream bytes. Contexts travel down a
//! ring of synchronizers: worker i of a section feeds worker i+1, and the
//! last worker of a section feeds worker 0 of the next one.
//!
//! Worker errors are routed through a channel instead of aborting the
//! process; if nothing has been written yet the driver falls back to a
//! plain sequential decode.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::unbounded;

use crate::bitstream::InputStream;
use crate::block::{do_block, BlockResult, ShouldFail, ShouldSucceed};
use crate::error::{PgzError, PgzResult};
use crate::huffman::Decoder;
use crate::multiplex::{resolve_wide, BackrefMultiplexer};
use crate::sync::{AbortFlag, OrderedWriter, Synchronizer};
use crate::window::{
    DeflateWindow, DummySink, Sink, CONTEXT_SIZE, FIRST_BACKREF_SYMBOL, NARROW_BUDGET,
    WIDE_BUDGET,
};

/// Give up syncing after scanning this many bit positions (1 MiB of
/// compressed data).
pub const MAX_BITS_SKIP: u64 = 8 << 20;

/// A sync candidate must decode at least this many bytes to be taken
/// seriously.
pub const MIN_BLOCK_SIZE: usize = 8 << 10;

/// Successor blocks decoded to confirm a sync candidate.
const SYNC_VALIDATE_BLOCKS: usize = 8;

/// Thread count is capped so every worker gets a meaningful chunk.
const MIN_BYTES_PER_THREAD: usize = 2 << 20;

/// A section is one round of all workers over consecutive chunks; bounding
/// it caps the peak working set per worker.
const SECTION_BYTES_PER_THREAD: usize = 32 << 20;

/// The first worker runs with a resolved context and no sync phase, so it
/// gets a larger chunk.
const FIRST_CHUNK_BONUS: usize = 4 << 20;

#[derive(Debug, Default, Clone, Copy)]
pub struct DecodeStats {
    pub bytes_out: u64,
    pub newlines: u64,
    /// Bit position just past the final block, when one was seen.
    pub consumed_bits: u64,
}

fn block_error(res: BlockResult) -> PgzError {
    match res {
        BlockResult::FlushFail => PgzError::WindowOverflow,
        other => PgzError::corrupt(other.as_str()),
    }
}

/// Where resolved chunk bytes go: the ordered stream writer, or newline
/// counters when `-l` skips output serialization entirely.
enum ChunkSink<'w, W: Write> {
    Stream(&'w OrderedWriter<W>),
    Lines {
        lines: &'w AtomicU64,
        bytes: &'w AtomicU64,
    },
}

impl<W: Write> ChunkSink<'_, W> {
    fn emit(&self, seq: u64, parts: &[&[u8]]) -> PgzResult<()> {
        match self {
            ChunkSink::Stream(writer) => {
                writer.write(seq, parts)?;
            }
            ChunkSink::Lines { lines, bytes } => {
                let mut n = 0u64;
                let mut total = 0u64;
                for part in parts {
                    n += memchr::memchr_iter(b'\n', part).count() as u64;
                    total += part.len() as u64;
                }
                lines.fetch_add(n, Ordering::Relaxed);
                bytes.fetch_add(total, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

struct WorkerEnv<'a, 'w, W: Write> {
    deflate: &'a [u8],
    syncs: &'w [Synchronizer],
    abort: &'w AbortFlag,
    out: ChunkSink<'w, W>,
    /// Set by whichever worker decodes the final block.
    final_pos: &'w AtomicU64,
    threads: usize,
    n_sections: usize,
    section_size: usize,
    first_chunk: usize,
    rest_chunk: usize,
}

impl<W: Write> WorkerEnv<'_, '_, W> {
    fn seq(&self, section: usize, chunk: usize) -> u64 {
        (section * self.threads + chunk) as u64
    }
}

/// Find a decodable block boundary at or after `start_bits`.
///
/// Bit positions are probed one by one: positions that would read a final
/// block are skipped outright, the rest must parse as a whole block under
/// `ShouldFail` with a plausible amount of output, and survivors are
/// confirmed by decoding several successor blocks in trusted mode. A
/// final block during confirmation must coincide with the end of input.
pub(crate) fn sync_probe(
    d: &mut Decoder,
    stream: &mut InputStream<'_>,
    start_bits: u64,
    abort: &AbortFlag,
) -> PgzResult<u64> {
    let mut dummy = DummySink::new();
    let end_bits = 8 * stream.len() as u64;
    let max_pos = (start_bits + MAX_BITS_SKIP).min(end_bits);

    let mut pos = start_bits;
    while pos < max_pos {
        if abort.is_set() {
            return Err(PgzError::thread("aborted"));
        }
        if !stream.set_position_bits(pos) {
            break;
        }
        if !stream.ensure_bits(1) {
            break;
        }
        if stream.bits(1) != 0 {
            // A final block here would leave nothing for the workers
            // downstream; mid-stream candidates must be non-final.
            pos += 1;
            continue;
        }

        dummy.clear();
        let res = do_block::<_, ShouldFail>(d, stream, &mut dummy);
        if !res.is_error()
            && dummy.produced() >= MIN_BLOCK_SIZE
            && validate_successors(d, stream)
        {
            return Ok(pos);
        }
        pos += 1;
    }
    Err(PgzError::SyncFailed(MAX_BITS_SKIP))
}

/// Decode up to a few blocks after a candidate in trusted mode. The
/// candidate is real only if every successor parses and a final block is
/// seen exactly when the input runs out.
fn validate_successors(d: &mut Decoder, stream: &mut InputStream<'_>) -> bool {
    let mut dummy = DummySink::new();
    for _ in 0..SYNC_VALIDATE_BLOCKS {
        match do_block::<_, ShouldSucceed>(d, stream, &mut dummy) {
            BlockResult::Success => {}
            BlockResult::LastBlock => return stream.available_bits() < 8,
            _ => return false,
        }
    }
    true
}

/// Decode blocks until the downstream stop position is crossed or the
/// final block is seen.
fn decode_loop<S: Sink>(
    d: &mut Decoder,
    stream: &mut InputStream<'_>,
    sink: &mut S,
    down: &Synchronizer,
    abort: &AbortFlag,
) -> PgzResult<BlockResult> {
    loop {
        if abort.is_set() {
            return Ok(BlockResult::CaughtUpDownstream);
        }
        if stream.position_bits() >= down.stop_pos() {
            down.clear_stop();
            return Ok(BlockResult::CaughtUpDownstream);
        }
        match do_block::<_, ShouldSucceed>(d, stream, sink) {
            BlockResult::Success => {}
            BlockResult::LastBlock => return Ok(BlockResult::LastBlock),
            other => return Err(block_error(other)),
        }
    }
}

/// Worker 0: always decodes with a resolved context, so its output needs
/// no placeholder resolution. Section 0 starts with an empty context;
/// later sections inherit the previous section's final context from the
/// last worker.
fn first_worker<W: Write>(env: &WorkerEnv<'_, '_, W>) -> PgzResult<()> {
    let mut decoder = Box::new(Decoder::new());
    let mut window = DeflateWindow::<u8>::new(NARROW_BUDGET);
    let mut stream = InputStream::new(env.deflate);
    let up = &env.syncs[0];
    let down = &env.syncs[1];

    for section in 0..env.n_sections {
        let start_bits = if section == 0 {
            window.clear();
            0
        } else {
            let (ctx, bitpos) = match up.get_context(env.abort) {
                Some(handoff) => handoff,
                None => return Ok(()),
            };
            window.clear();
            window.seed_context(&ctx);
            bitpos
        };
        if !stream.set_position_bits(start_bits) {
            return Err(PgzError::corrupt("resume position past end of input"));
        }

        let exit = decode_loop(&mut decoder, &mut stream, &mut window, down, env.abort)?;
        if !window.final_flush() {
            return Err(PgzError::WindowOverflow);
        }
        let ctx = window.current_context().to_vec();
        let out = window.take_output();

        if !down.put_context(ctx, stream.position_bits(), env.abort) {
            return Ok(());
        }
        env.out.emit(env.seq(section, 0), &[&out])?;

        // On the final block just record where it ended. Even then the
        // section loop keeps going: later sections exist only when the
        // stream was shorter than the file span, and running them drives
        // the pipeline into a clean error instead of stranding the other
        // workers on their hand-offs.
        if exit == BlockResult::LastBlock {
            env.final_pos.store(stream.position_bits(), Ordering::Relaxed);
        }
    }
    Ok(())
}

/// Workers 1..N: sync, decode speculatively, resolve against the upstream
/// context, hand off, emit.
fn random_access_worker<W: Write>(env: &WorkerEnv<'_, '_, W>, index: usize) -> PgzResult<()> {
    let mut decoder = Box::new(Decoder::new());
    let mut wide = DeflateWindow::<u16>::new(WIDE_BUDGET);
    let mut narrow = DeflateWindow::<u8>::new(NARROW_BUDGET);
    let mut mux = BackrefMultiplexer::new();
    let mut stream = InputStream::new(env.deflate);
    let up = &env.syncs[index];
    let down = &env.syncs[(index + 1) % env.threads];
    let is_last = index == env.threads - 1;

    for section in 0..env.n_sections {
        let section_off = section * env.section_size;
        let start_byte = section_off + env.first_chunk + (index - 1) * env.rest_chunk;
        if is_last {
            // The last chunk is bounded by the section end rather than a
            // downstream sync position.
            let end = if section + 1 == env.n_sections {
                env.deflate.len()
            } else {
                section_off + env.section_size
            };
            down.set_stop(8 * end as u64);
        }

        // Phase 1: locate our first block boundary and bound the upstream
        // worker with it.
        let sync_pos = sync_probe(&mut decoder, &mut stream, 8 * start_byte as u64, env.abort)?;
        up.set_stop(sync_pos);

        // Phase 2: speculative decode. Start in the 16-bit window; once
        // the live placeholder set narrows enough, compact it and finish
        // the chunk in the plain 8-bit window.
        wide.clear();
        wide.seed_placeholder_context();
        if !stream.set_position_bits(sync_pos) {
            return Err(PgzError::corrupt("sync position past end of input"));
        }
        let mut multiplexed = false;
        let mut block_count = 0u64;
        let mut compact_ctx = vec![0u8; CONTEXT_SIZE];
        let mut exit = loop {
            if env.abort.is_set() {
                return Ok(());
            }
            if stream.position_bits() >= down.stop_pos() {
                down.clear_stop();
                break BlockResult::CaughtUpDownstream;
            }
            match do_block::<_, ShouldSucceed>(&mut decoder, &mut stream, &mut wide) {
                BlockResult::Success => {}
                BlockResult::LastBlock => break BlockResult::LastBlock,
                other => return Err(block_error(other)),
            }
            block_count += 1;
            if block_count >= 8
                && block_count % 2 == 1
                && mux.compress(wide.current_context(), &mut compact_ctx)
            {
                narrow.clear();
                narrow.seed_context(&compact_ctx);
                multiplexed = true;
                break BlockResult::Success;
            }
        };
        if !wide.final_flush() {
            return Err(PgzError::WindowOverflow);
        }
        let wide_out = wide.take_output();

        let mut narrow_out = Vec::new();
        if multiplexed {
            exit = decode_loop(&mut decoder, &mut stream, &mut narrow, down, env.abort)?;
            if !narrow.final_flush() {
                return Err(PgzError::WindowOverflow);
            }
            narrow_out = narrow.take_output();
        }

        // Phase 3: the upstream context arrives; resolve placeholders.
        let (up_ctx, up_stop) = match up.get_context(env.abort) {
            Some(handoff) => handoff,
            None => return Ok(()),
        };
        if up_stop != sync_pos {
            // The upstream worker sailed past our sync point: the
            // candidate boundary was not on its parse chain.
            return Err(PgzError::corrupt("context hand-off position mismatch"));
        }

        let resolved_wide: Vec<u8> =
            wide_out.iter().map(|&sym| resolve_wide(sym, &up_ctx)).collect();
        let (resolved_narrow, ctx): (Vec<u8>, Vec<u8>) = if multiplexed {
            let table = mux.resolve_table(&up_ctx);
            (
                narrow_out.iter().map(|&c| table[c as usize]).collect(),
                narrow
                    .current_context()
                    .iter()
                    .map(|&c| table[c as usize])
                    .collect(),
            )
        } else {
            // The placeholder set never narrowed below the budget (or the
            // chunk was tiny): resolve the 16-bit context directly.
            (
                Vec::new(),
                wide.current_context()
                    .iter()
                    .map(|&sym| resolve_wide(sym, &up_ctx))
                    .collect(),
            )
        };

        // Phase 4: hand the resolved context downstream first, then emit.
        if !down.put_context(ctx, stream.position_bits(), env.abort) {
            return Ok(());
        }
        env.out
            .emit(env.seq(section, index), &[&resolved_wide, &resolved_narrow])?;

        if exit == BlockResult::LastBlock {
            env.final_pos.store(stream.position_bits(), Ordering::Relaxed);
        }
    }
    Ok(())
}

/// Cap the worker count so each one owns at least a couple of megabytes.
fn effective_threads(len: usize, requested: usize) -> usize {
    requested.clamp(1, 1 + len / MIN_BYTES_PER_THREAD)
}

/// Decompress a raw deflate span, choosing between the parallel engine
/// and a sequential decode, with a sequential fallback when the parallel
/// attempt fails before writing anything.
pub fn decompress<W: Write + Send>(
    deflate: &[u8],
    writer: &mut W,
    requested_threads: usize,
    count_lines: bool,
) -> PgzResult<DecodeStats> {
    let threads = effective_threads(deflate.len(), requested_threads);
    if threads <= 1 {
        return decompress_sequential(deflate, writer, count_lines, None);
    }
    match decompress_parallel(deflate, writer, threads, count_lines) {
        Ok(stats) => Ok(stats),
        Err((err, written)) if written == 0 => {
            eprintln!("pgzcat: parallel decode failed ({}), retrying sequentially", err);
            decompress_sequential(deflate, writer, count_lines, None)
        }
        Err((err, _)) => Err(err),
    }
}

pub fn decompress_parallel<W: Write + Send>(
    deflate: &[u8],
    writer: &mut W,
    threads: usize,
    count_lines: bool,
) -> Result<DecodeStats, (PgzError, u64)> {
    debug_assert!(threads >= 2);

    let max_section = threads * SECTION_BYTES_PER_THREAD;
    let n_sections = deflate.len().div_ceil(max_section);
    let section_size = deflate.len() / n_sections;
    let chunk = section_size / threads;
    let first_chunk = chunk + FIRST_CHUNK_BONUS.min(chunk / 2);
    let rest_chunk = (threads * chunk - first_chunk) / (threads - 1);

    let syncs: Vec<Synchronizer> = (0..threads).map(|_| Synchronizer::new()).collect();
    let abort = AbortFlag::new();
    let ordered = OrderedWriter::new(&mut *writer);
    let lines = AtomicU64::new(0);
    let line_bytes = AtomicU64::new(0);
    let final_pos = AtomicU64::new(0);
    let (err_tx, err_rx) = unbounded::<PgzError>();

    std::thread::scope(|scope| {
        for index in 0..threads {
            let env = WorkerEnv {
                deflate,
                syncs: &syncs,
                abort: &abort,
                out: if count_lines {
                    ChunkSink::Lines {
                        lines: &lines,
                        bytes: &line_bytes,
                    }
                } else {
                    ChunkSink::Stream(&ordered)
                },
                final_pos: &final_pos,
                threads,
                n_sections,
                section_size,
                first_chunk,
                rest_chunk,
            };
            let err_tx = err_tx.clone();
            let abort = &abort;
            let ordered = &ordered;
            scope.spawn(move || {
                let result = if index == 0 {
                    first_worker(&env)
                } else {
                    random_access_worker(&env, index)
                };
                if let Err(e) = result {
                    if !abort.is_set() {
                        let _ = err_tx.send(e);
                    }
                    abort.set();
                    ordered.poison();
                }
            });
        }
    });
    drop(err_tx);

    let written = ordered.written();
    if let Ok(err) = err_rx.try_recv() {
        return Err((err, written));
    }
    if let Err(e) = ordered.finish() {
        return Err((PgzError::Io(e), written));
    }
    Ok(DecodeStats {
        bytes_out: if count_lines {
            line_bytes.load(Ordering::Relaxed)
        } else {
            written
        },
        newlines: lines.load(Ordering::Relaxed),
        consumed_bits: final_pos.load(Ordering::Relaxed),
    })
}

/// Single-threaded decode of a whole deflate stream, draining the window
/// into the writer as it goes. `until` implements the debugging bound:
/// stop twenty blocks after the given compressed byte offset.
pub fn decompress_sequential<W: Write>(
    deflate: &[u8],
    writer: &mut W,
    count_lines: bool,
    until: Option<u64>,
) -> PgzResult<DecodeStats> {
    let mut decoder = Box::new(Decoder::new());
    let mut stream = InputStream::new(deflate);
    let mut window = DeflateWindow::<u8>::new(usize::MAX);
    let mut stats = DecodeStats::default();
    let mut blocks_past_until = 0u64;

    loop {
        let res = do_block::<_, ShouldSucceed>(&mut decoder, &mut stream, &mut window);
        let out = window.take_output();
        drain(&out, writer, count_lines, &mut stats)?;
        match res {
            BlockResult::Success => {
                if let Some(limit) = until {
                    if stream.position_bits() >= 8 * limit {
                        blocks_past_until += 1;
                        if blocks_past_until > 20 {
                            break;
                        }
                    }
                }
            }
            BlockResult::LastBlock => {
                stats.consumed_bits = stream.position_bits();
                break;
            }
            other => return Err(block_error(other)),
        }
    }
    let _ = window.final_flush();
    let out = window.take_output();
    drain(&out, writer, count_lines, &mut stats)?;
    writer.flush()?;
    Ok(stats)
}

/// Sync at a byte offset and decode the rest of the stream without any
/// upstream context; placeholder bytes that never resolve print as '?'.
pub fn decompress_from_offset<W: Write>(
    deflate: &[u8],
    skip_bytes: u64,
    writer: &mut W,
    count_lines: bool,
) -> PgzResult<DecodeStats> {
    let abort = AbortFlag::new();
    let mut decoder = Box::new(Decoder::new());
    let mut stream = InputStream::new(deflate);
    let sync_pos = sync_probe(&mut decoder, &mut stream, 8 * skip_bytes, &abort)?;
    if !stream.set_position_bits(sync_pos) {
        return Err(PgzError::corrupt("sync position past end of input"));
    }

    let mut window = DeflateWindow::<u16>::new(usize::MAX);
    window.seed_placeholder_context();
    let mut stats = DecodeStats::default();
    let mut resolved = Vec::new();

    loop {
        let res = do_block::<_, ShouldSucceed>(&mut decoder, &mut stream, &mut window);
        let out = window.take_output();
        resolved.clear();
        resolved.extend(
            out.iter()
                .map(|&sym| if sym < FIRST_BACKREF_SYMBOL { sym as u8 } else { b'?' }),
        );
        drain(&resolved, writer, count_lines, &mut stats)?;
        match res {
            BlockResult::Success => {}
            BlockResult::LastBlock => break,
            other => return Err(block_error(other)),
        }
    }
    let _ = window.final_flush();
    let out = window.take_output();
    resolved.clear();
    resolved.extend(
        out.iter()
            .map(|&sym| if sym < FIRST_BACKREF_SYMBOL { sym as u8 } else { b'?' }),
    );
    drain(&resolved, writer, count_lines, &mut stats)?;
    writer.flush()?;
    Ok(stats)
}

fn drain<W: Write>(
    bytes: &[u8],
    writer: &mut W,
    count_lines: bool,
    stats: &mut DecodeStats,
) -> PgzResult<()> {
    stats.bytes_out += bytes.len() as u64;
    if count_lines {
        stats.newlines += memchr::memchr_iter(b'\n', bytes).count() as u64;
    } else {
        writer.write_all(bytes)?;
    }
    Ok(())
}
