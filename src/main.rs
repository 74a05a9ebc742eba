use std::fs;
use std::io::{self, prelude::*};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use bytesize::ByteSize;

use runsort::{NaturalOrder, Sorter, Storage, StorageOptions};

const RECORD_BYTES: usize = std::mem::size_of::<u64>();

fn main() {
    let args = build_arg_parser();

    init_logger(args.get_one::<String>("log_level").expect("value has a default"));

    let memory = parse_size(args.get_one::<String>("memory").expect("value is required"));
    let block_bytes = parse_size(args.get_one::<String>("block_size").expect("value has a default"));
    if block_bytes == 0 || block_bytes % RECORD_BYTES != 0 {
        log::error!("block size must be a positive multiple of {} bytes", RECORD_BYTES);
        process::exit(1);
    }

    let input = args.get_one::<String>("input").expect("value is required");
    let input_file = match fs::File::open(input) {
        Ok(file) => file,
        Err(err) => {
            log::error!("input file opening error: {}", err);
            process::exit(1);
        }
    };
    if let Ok(meta) = input_file.metadata() {
        if meta.len() % RECORD_BYTES as u64 != 0 {
            log::warn!(
                "input size is not a whole number of {}-byte records, the tail is ignored",
                RECORD_BYTES
            );
        }
    }

    let output = args.get_one::<String>("output").expect("value is required");
    let mut output_stream = match fs::File::create(output) {
        Ok(file) => io::BufWriter::new(file),
        Err(err) => {
            log::error!("output file creation error: {}", err);
            process::exit(1);
        }
    };

    let storage: Arc<Storage<u64>> = match Storage::new(StorageOptions {
        dir: args.get_one::<String>("tmp_dir").map(PathBuf::from),
        num_disks: *args.get_one::<usize>("disks").expect("value has a default"),
        block_elems: block_bytes / RECORD_BYTES,
    }) {
        Ok(storage) => storage,
        Err(err) => {
            log::error!("storage initialization error: {}", err);
            process::exit(1);
        }
    };

    let mut sorter = match Sorter::new(NaturalOrder::<u64>::new(), storage, memory) {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let mut reader = io::BufReader::new(input_file);
    let mut record = [0u8; RECORD_BYTES];
    loop {
        match reader.read_exact(&mut record) {
            Ok(()) => {
                if let Err(err) = sorter.push(u64::from_le_bytes(record)) {
                    log::error!("data sorting error: {}", err);
                    process::exit(1);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                log::error!("input reading error: {}", err);
                process::exit(1);
            }
        }
    }

    log::info!("sorting {} records", sorter.size());
    if let Err(err) = sorter.sort() {
        log::error!("data sorting error: {}", err);
        process::exit(1);
    }

    while !sorter.empty() {
        let value = *sorter.current();
        if let Err(err) = output_stream.write_all(&value.to_le_bytes()) {
            log::error!("data saving error: {}", err);
            process::exit(1);
        }
        if let Err(err) = sorter.advance() {
            log::error!("sorted stream error: {}", err);
            process::exit(1);
        }
    }

    if let Err(err) = output_stream.flush() {
        log::error!("data flushing error: {}", err);
        process::exit(1);
    }
}

fn parse_size(value: &str) -> usize {
    value
        .parse::<ByteSize>()
        .expect("value is pre-validated")
        .as_u64() as usize
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::Command::new("runsort")
        .author("Dmitry P. <dapper1291@gmail.com>")
        .about("external sorter for files of little-endian u64 records")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true),
        )
        .arg(
            clap::Arg::new("memory")
                .short('m')
                .long("memory")
                .help("memory budget per sorting phase")
                .required(true)
                .value_parser(validate_size),
        )
        .arg(
            clap::Arg::new("block_size")
                .short('b')
                .long("block-size")
                .help("size of the blocks on backing storage")
                .default_value("2MiB")
                .value_parser(validate_size),
        )
        .arg(
            clap::Arg::new("disks")
                .long("disks")
                .help("number of backing files to stripe blocks over")
                .default_value("1")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data"),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .default_value("info")
                .value_parser(["off", "error", "warn", "info", "debug", "trace"]),
        )
        .get_matches()
}

fn validate_size(value: &str) -> Result<String, String> {
    match value.parse::<ByteSize>() {
        Ok(_) => Ok(value.to_owned()),
        Err(err) => Err(format!("size format incorrect: {}", err)),
    }
}

fn init_logger(log_level: &str) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "info" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
