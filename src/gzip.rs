//! gzip container handling and the per-file driver
//!
//! The parallel core works on the raw deflate span; this module peels the
//! RFC 1952 wrapper off a memory-mapped file, routes the payload to the
//! engine, and owns the command-line file semantics (suffix handling,
//! output naming, keep/force, stats).
//!
//! The trailer's CRC32 and ISIZE are read but not verified; corruption of
//! a stream that still parses as valid deflate goes undetected, which is a
//! documented trade-off of the parallel design.

use std::fs::File;
use std::io::{self, stdin, stdout, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use memmap2::{Advice, Mmap};

use crate::block::BlockResult;
use crate::cli::PgzArgs;
use crate::error::{PgzError, PgzResult};
use crate::utils::format_size;
use crate::worker::{self, DecodeStats};

const GZIP_ID1: u8 = 0x1f;
const GZIP_ID2: u8 = 0x8b;
const GZIP_CM_DEFLATE: u8 = 8;

const FLG_FHCRC: u8 = 1 << 1;
const FLG_FEXTRA: u8 = 1 << 2;
const FLG_FNAME: u8 = 1 << 3;
const FLG_FCOMMENT: u8 = 1 << 4;
const FLG_RESERVED: u8 = 0xE0;

const FOOTER_SIZE: usize = 8;
const MIN_OVERHEAD: usize = 10 + FOOTER_SIZE;

/// Output buffer size for file and stdout writers.
const STREAM_BUFFER_SIZE: usize = 256 * 1024;

/// One gzip member with the wrapper stripped.
pub struct GzipMember<'a> {
    pub deflate: &'a [u8],
    /// Trailer fields, informational only.
    pub crc32: u32,
    pub isize_hint: u32,
}

/// Parse the gzip header and trailer around the deflate payload.
pub fn parse_member(data: &[u8]) -> PgzResult<GzipMember<'_>> {
    if data.len() < MIN_OVERHEAD {
        return Err(PgzError::BadGzipHeader("file too short".into()));
    }
    if data[0] != GZIP_ID1 || data[1] != GZIP_ID2 {
        return Err(PgzError::BadGzipHeader("bad magic bytes".into()));
    }
    if data[2] != GZIP_CM_DEFLATE {
        return Err(PgzError::BadGzipHeader(format!(
            "unknown compression method {}",
            data[2]
        )));
    }
    let flg = data[3];
    if flg & FLG_RESERVED != 0 {
        return Err(PgzError::UnsupportedFlag(format!(
            "reserved flag bits {:#04x}",
            flg & FLG_RESERVED
        )));
    }

    // MTIME, XFL and OS are skipped.
    let mut offset = 10;

    if flg & FLG_FEXTRA != 0 {
        if data.len() < offset + 2 {
            return Err(PgzError::BadGzipHeader("truncated extra field".into()));
        }
        let xlen = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2 + xlen;
    }
    if flg & FLG_FNAME != 0 {
        match memchr::memchr(0, &data[offset.min(data.len())..]) {
            Some(nul) => offset += nul + 1,
            None => return Err(PgzError::BadGzipHeader("unterminated file name".into())),
        }
    }
    if flg & FLG_FCOMMENT != 0 {
        match memchr::memchr(0, &data[offset.min(data.len())..]) {
            Some(nul) => offset += nul + 1,
            None => return Err(PgzError::BadGzipHeader("unterminated comment".into())),
        }
    }
    if flg & FLG_FHCRC != 0 {
        offset += 2;
    }

    if data.len() < offset + FOOTER_SIZE {
        return Err(PgzError::BadGzipHeader("header overlaps trailer".into()));
    }

    let footer = &data[data.len() - FOOTER_SIZE..];
    Ok(GzipMember {
        deflate: &data[offset..data.len() - FOOTER_SIZE],
        crc32: u32::from_le_bytes(footer[..4].try_into().unwrap()),
        isize_hint: u32::from_le_bytes(footer[4..].try_into().unwrap()),
    })
}

/// Counts bytes so the caller can tell whether a failed decode already
/// emitted output (in which case no fallback may run).
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        CountingWriter { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Run the engine over one buffer of gzip data. When the engine rejects
/// the input before writing anything (binary payload, concatenated
/// members), retry once through flate2's any-input decoder.
fn decompress_buffer<W: Write + Send>(
    raw: &[u8],
    writer: &mut W,
    args: &PgzArgs,
) -> PgzResult<DecodeStats> {
    let member = parse_member(raw)?;

    if let Some(skip) = args.skip {
        return worker::decompress_from_offset(member.deflate, skip, writer, args.line_count);
    }
    if args.until.is_some() {
        return worker::decompress_sequential(member.deflate, writer, args.line_count, args.until);
    }

    if args.verbose && !args.quiet {
        eprintln!(
            "pgzcat: trailer crc32 {:08x}, isize {} (not verified)",
            member.crc32, member.isize_hint
        );
    }

    let mut counting = CountingWriter::new(&mut *writer);
    match worker::decompress(member.deflate, &mut counting, args.threads, args.line_count) {
        Ok(stats) => {
            // Only the first member is decoded on the fast path; anything
            // left past the final block is reported, not consumed.
            let trailing = (8 * member.deflate.len() as u64).saturating_sub(stats.consumed_bits);
            if stats.consumed_bits > 0 && trailing >= 64 && !args.quiet {
                eprintln!(
                    "pgzcat: warning: {}: {} trailing bytes ignored",
                    BlockResult::TooMuchInput.as_str(),
                    trailing / 8
                );
            }
            Ok(stats)
        }
        Err(err) if counting.written == 0 => {
            if !args.quiet {
                eprintln!("pgzcat: engine rejected input ({}), using slow path", err);
            }
            decompress_fallback(raw, writer, args.line_count)
        }
        Err(err) => Err(err),
    }
}

/// Sequential any-input path: handles non-text payloads and concatenated
/// members, at a fraction of the speed.
fn decompress_fallback<W: Write>(
    raw: &[u8],
    writer: &mut W,
    count_lines: bool,
) -> PgzResult<DecodeStats> {
    let mut decoder = flate2::read::MultiGzDecoder::new(raw);
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    let mut stats = DecodeStats::default();
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        stats.bytes_out += n as u64;
        if count_lines {
            stats.newlines += memchr::memchr_iter(b'\n', &buf[..n]).count() as u64;
        } else {
            writer.write_all(&buf[..n])?;
        }
    }
    writer.flush()?;
    Ok(stats)
}

fn output_path(input: &Path, suffix: &str) -> PathBuf {
    let name = input.file_name().and_then(|n| n.to_str()).unwrap_or("");
    match name.strip_suffix(suffix) {
        Some(stem) if !stem.is_empty() => input.with_file_name(stem),
        _ => input.with_extension("out"),
    }
}

/// Decompress one named file. Returns the per-file exit code: 0 success,
/// 2 for a skipped file.
pub fn decompress_file(filename: &str, args: &PgzArgs) -> PgzResult<i32> {
    if filename == "-" {
        return decompress_stdin(args);
    }

    let input_path = Path::new(filename);
    if !input_path.exists() {
        return Err(PgzError::FileNotFound(filename.to_string()));
    }
    if input_path.is_dir() {
        return Err(PgzError::invalid_argument(format!(
            "{} is a directory",
            filename
        )));
    }

    let to_stdout = args.stdout || args.skip.is_some();
    let has_suffix = filename.ends_with(&args.suffix);
    if !has_suffix && !to_stdout && !args.line_count && !args.force {
        if !args.quiet {
            eprintln!("pgzcat: {}: unknown suffix -- ignored", filename);
        }
        return Ok(2);
    }

    let file = File::open(input_path)?;
    let compressed_size = file.metadata()?.len();
    let mmap = unsafe { Mmap::map(&file)? };
    // The workers walk the map mostly front to back.
    #[cfg(unix)]
    let _ = mmap.advise(Advice::Sequential);

    let stats = if args.line_count {
        let stats = decompress_buffer(&mmap, &mut io::sink(), args)?;
        println!("{:>10} {}", stats.newlines, filename);
        return Ok(0);
    } else if to_stdout {
        let out = stdout();
        let mut writer = BufWriter::with_capacity(STREAM_BUFFER_SIZE, out);
        decompress_buffer(&mmap, &mut writer, args)?
    } else {
        let out_path = output_path(input_path, &args.suffix);
        if out_path.exists() && !args.force {
            if !args.quiet {
                eprintln!(
                    "pgzcat: {} already exists -- skipping (use -f to overwrite)",
                    out_path.display()
                );
            }
            return Ok(2);
        }
        let out_file = File::create(&out_path)?;
        let mut writer = BufWriter::with_capacity(STREAM_BUFFER_SIZE, out_file);
        match decompress_buffer(&mmap, &mut writer, args) {
            Ok(stats) => stats,
            Err(e) => {
                drop(writer);
                let _ = std::fs::remove_file(&out_path);
                return Err(e);
            }
        }
    };

    if args.verbose && !args.quiet {
        eprintln!(
            "pgzcat: {}: {} -> {}",
            filename,
            format_size(compressed_size),
            format_size(stats.bytes_out)
        );
    }

    drop(mmap);
    if !args.keep && !to_stdout && args.skip.is_none() {
        std::fs::remove_file(input_path)?;
    }
    Ok(0)
}

/// Buffer stdin fully (the engine needs random access), then decompress
/// to stdout.
pub fn decompress_stdin(args: &PgzArgs) -> PgzResult<i32> {
    use std::io::IsTerminal;
    if stdin().is_terminal() && !args.force {
        return Err(PgzError::invalid_argument(
            "compressed data not read from a terminal (use -f to force)",
        ));
    }
    let mut data = Vec::new();
    BufReader::with_capacity(STREAM_BUFFER_SIZE, stdin().lock()).read_to_end(&mut data)?;
    if data.is_empty() {
        return Ok(0);
    }

    if args.line_count {
        let stats = decompress_buffer(&data, &mut io::sink(), args)?;
        println!("{:>10}", stats.newlines);
        return Ok(0);
    }

    let out = stdout();
    let mut writer = BufWriter::with_capacity(STREAM_BUFFER_SIZE, out);
    decompress_buffer(&data, &mut writer, args)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;

    fn gzip_of(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn parses_plain_header() {
        let raw = gzip_of(b"some text\n");
        let member = parse_member(&raw).unwrap();
        assert_eq!(member.isize_hint, 10);
        assert!(!member.deflate.is_empty());
    }

    #[test]
    fn parses_fname_header() {
        // Hand-built header with FNAME set.
        let mut raw = vec![
            0x1f, 0x8b, 0x08, 0x08, 0, 0, 0, 0, 0, 3, // header, FLG=FNAME
        ];
        raw.extend_from_slice(b"data.txt\0");
        raw.extend_from_slice(&[0x03, 0x00]); // empty final fixed block
        raw.extend_from_slice(&[0; 8]); // trailer
        let member = parse_member(&raw).unwrap();
        assert_eq!(member.deflate, &[0x03, 0x00]);
    }

    #[test]
    fn rejects_bad_magic() {
        let raw = b"PK\x03\x04not a gzip file at all".to_vec();
        assert!(matches!(
            parse_member(&raw),
            Err(PgzError::BadGzipHeader(_))
        ));
    }

    #[test]
    fn rejects_reserved_flags() {
        let mut raw = gzip_of(b"x");
        raw[3] |= 0x80;
        assert!(matches!(
            parse_member(&raw),
            Err(PgzError::UnsupportedFlag(_))
        ));
    }

    #[test]
    fn rejects_truncated_file() {
        assert!(parse_member(&[0x1f, 0x8b, 0x08]).is_err());
    }

    #[test]
    fn buffer_round_trip() {
        let text = b"line one\nline two\nline three\n".repeat(1000);
        let raw = gzip_of(&text);
        let mut out = Vec::new();
        let args = PgzArgs::default();
        let stats = decompress_buffer(&raw, &mut out, &args).unwrap();
        assert_eq!(out, text);
        assert_eq!(stats.bytes_out, text.len() as u64);
    }

    #[test]
    fn binary_payload_uses_fallback() {
        let payload: Vec<u8> = (0u32..50_000).map(|i| (i * 31 % 251) as u8).collect();
        let raw = gzip_of(&payload);
        let mut out = Vec::new();
        let args = PgzArgs {
            quiet: true,
            ..PgzArgs::default()
        };
        let stats = decompress_buffer(&raw, &mut out, &args).unwrap();
        assert_eq!(out, payload);
        assert_eq!(stats.bytes_out, payload.len() as u64);
    }

    #[test]
    fn multi_member_decodes_first_and_reports_rest() {
        let mut raw = gzip_of(b"first member\n");
        raw.extend_from_slice(&gzip_of(b"second member\n"));
        let mut out = Vec::new();
        let args = PgzArgs {
            quiet: true,
            ..PgzArgs::default()
        };
        let stats = decompress_buffer(&raw, &mut out, &args).unwrap();
        assert_eq!(out, b"first member\n");
        // The unread second member shows up as trailing input.
        assert!(stats.consumed_bits > 0);
        assert!(stats.consumed_bits / 8 < raw.len() as u64 / 2);
    }

    #[test]
    fn output_path_strips_suffix() {
        assert_eq!(
            output_path(Path::new("/tmp/data.txt.gz"), ".gz"),
            PathBuf::from("/tmp/data.txt")
        );
        assert_eq!(
            output_path(Path::new("x.gz"), ".gz"),
            PathBuf::from("x")
        );
    }
}
