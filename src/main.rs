use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use numsort::{
    ChunkFormat, ExternalSorter, ExternalSorterBuilder, LimitedBufferBuilder, MalformedPolicy, RmpFormat, SortError,
    TextFormat, DEFAULT_CHUNK_BUDGET,
};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let chunk_format: Format = arg_parser.value_of_t_or_exit("chunk_format");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let chunk_budget = match arg_parser.value_of("chunk_size") {
        Some(chunk_size) => chunk_size.parse::<ByteSize>().expect("value is pre-validated").as_u64(),
        None => DEFAULT_CHUNK_BUDGET,
    };
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let fan_in: Option<usize> = arg_parser
        .is_present("fan_in")
        .then(|| arg_parser.value_of_t_or_exit("fan_in"));
    let malformed_policy = if arg_parser.is_present("skip_malformed") {
        MalformedPolicy::Skip
    } else {
        MalformedPolicy::Fail
    };

    let input = path::Path::new(arg_parser.value_of("input").expect("value is required"));
    let output = path::Path::new(arg_parser.value_of("output").expect("value is required"));

    let mut sorter_builder: ExternalSorterBuilder<LimitedBufferBuilder, TextFormat> = ExternalSorterBuilder::new()
        .with_buffer(LimitedBufferBuilder::with_memory_budget(chunk_budget))
        .with_malformed_policy(malformed_policy);

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    if let Some(fan_in) = fan_in {
        sorter_builder = sorter_builder.with_merge_fan_in(fan_in);
    }

    let result = match chunk_format {
        Format::Text => run(sorter_builder, input, output),
        Format::Msgpack => run(sorter_builder.with_chunk_format::<RmpFormat>(), input, output),
    };

    if let Err(err) = result {
        log::error!("data sorting error: {}", err);
        process::exit(1);
    }
}

fn run<F: ChunkFormat>(
    sorter_builder: ExternalSorterBuilder<LimitedBufferBuilder, F>,
    input: &path::Path,
    output: &path::Path,
) -> Result<(), SortError> {
    let sorter: ExternalSorter<LimitedBufferBuilder, F> = sorter_builder.build()?;
    let stats = sorter.sort_file(input, output)?;

    log::info!(
        "sorting done: {} records, {} chunks, split {:.2?}, merge {:.2?}",
        stats.records_written,
        stats.chunks_created,
        stats.chunking_time,
        stats.merge_time
    );
    if stats.records_skipped > 0 {
        log::warn!("{} malformed lines skipped", stats.records_skipped);
    }

    return Ok(());
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Format {
    Text,
    Msgpack,
}

impl Format {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Format::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Format as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("numsort")
        .about("external sorter for newline-delimited non-negative integers")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("chunk_size")
                .short('c')
                .long("chunk-size")
                .help("memory budget of a single chunk [default: 100MiB]")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Chunk size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("fan_in")
                .short('f')
                .long("fan-in")
                .help("maximum number of chunks merged at once")
                .takes_value(true)
                .validator(|v| match v.parse::<usize>() {
                    Ok(fan_in) if fan_in >= 2 => Ok(()),
                    _ => Err(String::from("Fan-in must be an integer not less than 2")),
                }),
        )
        .arg(
            clap::Arg::new("chunk_format")
                .long("chunk-format")
                .help("chunk files encoding")
                .takes_value(true)
                .default_value("text")
                .possible_values(Format::possible_values()),
        )
        .arg(
            clap::Arg::new("skip_malformed")
                .long("skip-malformed")
                .help("skip lines that are not non-negative integers instead of failing"),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
