//! Command-line front end for an estria store.
//!
//! `load` reads `HEXKEY:HEXVALUE` lines from standard input and stages one
//! put per line; closing the store on end-of-input runs the final flush.

use std::env;
use std::io::{self, BufRead, Write};
use std::process;

use estria::{Config, Db, EstriaError, KEY_BYTES};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const HEX_KEY_LEN: usize = KEY_BYTES * 2;

fn print_usage() {
    eprintln!("estria {VERSION}");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    estria <command> <key-file> <value-file> [args]");
    eprintln!();
    eprintln!("COMMANDS:");
    eprintln!("    load                 Read HEXKEY:HEXVALUE lines from stdin");
    eprintln!("    get <hexkey>         Print one value as hex");
    eprintln!("    dump                 Print every record as HEXKEY:HEXVALUE");
    eprintln!("    stats                Print engine statistics as JSON");
    eprintln!("    verify               Check tree invariants");
    eprintln!("    help                 Show this message");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    cat pairs.txt | estria load store.keys store.values");
    eprintln!("    estria get store.keys store.values $(head -c32 /dev/urandom | xxd -p -c64)");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");
    if matches!(command, "help" | "--help" | "-h") {
        print_usage();
        return;
    }
    if command == "version" {
        println!("estria {VERSION}");
        return;
    }
    if args.len() < 4 {
        print_usage();
        process::exit(2);
    }

    let result = match command {
        "load" => run_load(&args[2], &args[3]),
        "get" => match args.get(4) {
            Some(hexkey) => run_get(&args[2], &args[3], hexkey),
            None => {
                print_usage();
                process::exit(2);
            }
        },
        "dump" => run_dump(&args[2], &args[3]),
        "stats" => run_stats(&args[2], &args[3]),
        "verify" => run_verify(&args[2], &args[3]),
        other => {
            eprintln!("unknown command: {other}");
            print_usage();
            process::exit(2);
        }
    };

    if let Err(error) = result {
        eprintln!("estria: {error}");
        process::exit(1);
    }
}

fn open(key_file: &str, value_file: &str) -> Result<Db, EstriaError> {
    Db::open_with_config(key_file, value_file, Config::default())
}

fn run_load(key_file: &str, value_file: &str) -> Result<(), EstriaError> {
    let db = Db::open_with_config(key_file, value_file, Config::bulk_load())?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        if !line.is_ascii() || line.as_bytes().get(HEX_KEY_LEN) != Some(&b':') {
            return Err(EstriaError::Invalid(
                "line must be 64 hex key chars, a colon, then the hex value",
            ));
        }
        let key = decode_hex(&line[..HEX_KEY_LEN])?;
        let value = decode_hex(&line[HEX_KEY_LEN + 1..])?;
        db.put(&key, &value)?;
        writeln!(out, "{}", &line[..HEX_KEY_LEN])?;
    }
    db.close()
}

fn run_get(key_file: &str, value_file: &str, hexkey: &str) -> Result<(), EstriaError> {
    let db = open(key_file, value_file)?;
    let key = decode_hex(hexkey)?;
    let value = db.get(&key)?;
    println!("{}", encode_hex(&value));
    db.close()
}

fn run_dump(key_file: &str, value_file: &str) -> Result<(), EstriaError> {
    let db = open(key_file, value_file)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    db.each(|key, value| {
        writeln!(out, "{}:{}", encode_hex(key), encode_hex(value))?;
        Ok(())
    })?;
    db.close()
}

fn run_stats(key_file: &str, value_file: &str) -> Result<(), EstriaError> {
    let db = open(key_file, value_file)?;
    let stats = db.stats();
    let json = serde_json::to_string_pretty(&stats)
        .map_err(|_| EstriaError::Invalid("stats serialization failed"))?;
    println!("{json}");
    db.close()
}

fn run_verify(key_file: &str, value_file: &str) -> Result<(), EstriaError> {
    let db = open(key_file, value_file)?;
    db.check_sane()?;
    println!("ok: {} keys indexed", db.indexed_keys()?);
    db.close()
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, EstriaError> {
    if hex.len() % 2 != 0 {
        return Err(EstriaError::Invalid("hex input has odd length"));
    }
    let bytes = hex.as_bytes();
    let mut out = Vec::with_capacity(hex.len() / 2);
    for pair in bytes.chunks(2) {
        let high = hex_digit(pair[0])?;
        let low = hex_digit(pair[1])?;
        out.push((high << 4) | low);
    }
    Ok(out)
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_digit(c: u8) -> Result<u8, EstriaError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(EstriaError::Invalid("invalid hex digit")),
    }
}
