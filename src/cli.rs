use std::env;

use crate::error::{PgzError, PgzResult};

#[derive(Debug, Clone)]
pub struct PgzArgs {
    pub files: Vec<String>,
    pub threads: usize,
    pub line_count: bool,
    pub stdout: bool,
    pub keep: bool,
    pub force: bool,
    pub quiet: bool,
    pub verbose: bool,
    pub skip: Option<u64>,
    pub until: Option<u64>,
    pub suffix: String,
    pub help: bool,
    pub version: bool,
}

impl Default for PgzArgs {
    fn default() -> Self {
        PgzArgs {
            files: Vec::new(),
            threads: 1,
            line_count: false,
            stdout: false,
            keep: false,
            force: false,
            quiet: false,
            verbose: false,
            skip: None,
            until: None,
            suffix: ".gz".to_string(),
            help: false,
            version: false,
        }
    }
}

impl PgzArgs {
    pub fn parse() -> PgzResult<Self> {
        let mut argv: Vec<String> = env::args().collect();
        argv.remove(0);
        Self::parse_from(argv)
    }

    pub fn parse_from(argv: Vec<String>) -> PgzResult<Self> {
        let mut args = PgzArgs::default();
        let mut in_options = true;
        let mut iter = argv.into_iter();

        while let Some(arg) = iter.next() {
            if !in_options || !arg.starts_with('-') || arg == "-" {
                args.files.push(arg);
                continue;
            }
            if arg == "--" {
                in_options = false;
                continue;
            }
            if let Some(long) = arg.strip_prefix("--") {
                match long {
                    "help" => args.help = true,
                    "version" => args.version = true,
                    _ => {
                        return Err(PgzError::invalid_argument(format!(
                            "unknown option --{}",
                            long
                        )))
                    }
                }
                continue;
            }

            // Short options may be combined; the value-taking ones consume
            // the rest of the argument or the next one.
            let mut chars = arg[1..].chars();
            while let Some(c) = chars.next() {
                match c {
                    'l' => args.line_count = true,
                    'c' => args.stdout = true,
                    'k' => args.keep = true,
                    'f' => args.force = true,
                    'q' => args.quiet = true,
                    'v' => args.verbose = true,
                    'h' => args.help = true,
                    'V' => args.version = true,
                    't' | 's' | 'u' | 'S' => {
                        let rest: String = chars.collect();
                        let value = if rest.is_empty() {
                            iter.next().ok_or_else(|| {
                                PgzError::invalid_argument(format!("-{} requires a value", c))
                            })?
                        } else {
                            rest
                        };
                        match c {
                            't' => {
                                let n: usize = value.parse().map_err(|_| {
                                    PgzError::invalid_argument(format!(
                                        "invalid thread count: {}",
                                        value
                                    ))
                                })?;
                                args.threads = if n == 0 { num_cpus::get() } else { n };
                            }
                            's' => args.skip = Some(parse_bytes(&value)?),
                            'u' => args.until = Some(parse_bytes(&value)?),
                            'S' => args.suffix = value,
                            _ => unreachable!(),
                        }
                        break;
                    }
                    other => {
                        return Err(PgzError::invalid_argument(format!(
                            "unknown option -{}",
                            other
                        )))
                    }
                }
            }
        }

        if args.skip.is_some() && args.until.is_some() {
            return Err(PgzError::invalid_argument("-s and -u are mutually exclusive"));
        }
        Ok(args)
    }
}

fn parse_bytes(value: &str) -> PgzResult<u64> {
    value
        .parse()
        .map_err(|_| PgzError::invalid_argument(format!("invalid byte count: {}", value)))
}

pub fn print_usage() {
    println!(
        "Usage: pgzcat [OPTION]... [FILE]...\n\
         Decompress gzipped ASCII text FILEs in parallel.\n\
         With no FILE, or when FILE is -, read standard input.\n\
         \n\
         Options:\n\
         \x20 -t N      use N worker threads (0 = all cores, default 1)\n\
         \x20 -l        print the decompressed line count instead of output\n\
         \x20 -c        write to standard output, keep input files\n\
         \x20 -k        keep input files\n\
         \x20 -f        force overwrite of output files, ignore suffix\n\
         \x20 -q        suppress warnings\n\
         \x20 -v        verbose output\n\
         \x20 -s BYTES  skip BYTES of compressed input, sync, decompress the rest\n\
         \x20 -u BYTES  stop twenty blocks after compressed offset BYTES\n\
         \x20 -S SUF    expected file suffix (default .gz)\n\
         \x20 -h        print this help\n\
         \x20 -V        print version"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> PgzResult<PgzArgs> {
        PgzArgs::parse_from(args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn defaults() {
        let args = parse(&["file.gz"]).unwrap();
        assert_eq!(args.files, vec!["file.gz"]);
        assert_eq!(args.threads, 1);
        assert_eq!(args.suffix, ".gz");
        assert!(!args.stdout);
    }

    #[test]
    fn combined_flags_and_values() {
        let args = parse(&["-ckt", "4", "-S.gzip", "a.gz", "b.gz"]).unwrap();
        assert!(args.stdout);
        assert!(args.keep);
        assert_eq!(args.threads, 4);
        assert_eq!(args.suffix, ".gzip");
        assert_eq!(args.files.len(), 2);
    }

    #[test]
    fn attached_value() {
        let args = parse(&["-t8"]).unwrap();
        assert_eq!(args.threads, 8);
    }

    #[test]
    fn zero_threads_means_all_cores() {
        let args = parse(&["-t0"]).unwrap();
        assert!(args.threads >= 1);
    }

    #[test]
    fn dash_is_stdin() {
        let args = parse(&["-"]).unwrap();
        assert_eq!(args.files, vec!["-"]);
    }

    #[test]
    fn double_dash_stops_options() {
        let args = parse(&["--", "-t"]).unwrap();
        assert_eq!(args.files, vec!["-t"]);
    }

    #[test]
    fn skip_and_until_conflict() {
        assert!(parse(&["-s", "100", "-u", "200"]).is_err());
    }

    #[test]
    fn unknown_option_rejected() {
        assert!(parse(&["-x"]).is_err());
        assert!(parse(&["--wat"]).is_err());
    }
}
