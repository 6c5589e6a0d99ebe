//! pgzcat - parallel gzip decompression for ASCII text
//!
//! Splits a gzip member's deflate stream into chunks, decodes them
//! concurrently on worker threads with symbolic back-references, and
//! stitches the outputs back together in stream order.

use std::process;

mod bitstream;
mod block;
mod cli;
mod error;
mod gzip;
mod huffman;
mod multiplex;
mod sync;
mod utils;
mod window;
mod worker;

#[cfg(test)]
mod golden_tests;
#[cfg(test)]
mod test_utils;

use cli::PgzArgs;

const VERSION: &str = concat!("pgzcat ", env!("CARGO_PKG_VERSION"));

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("pgzcat: {}", e);
            process::exit(1);
        }
    }
}

fn run() -> error::PgzResult<i32> {
    let args = PgzArgs::parse()?;

    if args.version {
        println!("{}", VERSION);
        return Ok(0);
    }
    if args.help {
        cli::print_usage();
        return Ok(0);
    }

    let mut hard_error = false;
    let mut warned = false;

    if args.files.is_empty() {
        return gzip::decompress_stdin(&args);
    }

    for file in &args.files {
        match gzip::decompress_file(file, &args) {
            Ok(0) => {}
            Ok(_) => warned = true,
            Err(e) => {
                eprintln!("pgzcat: {}: {}", file, e);
                hard_error = true;
            }
        }
    }

    Ok(if hard_error {
        1
    } else if warned {
        2
    } else {
        0
    })
}
