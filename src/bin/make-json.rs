//! Converts a `[1, 2, H, W]` flow tensor into a JSON grid of `[dx, dy]` pixel offsets.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use flowjson::{ConvertOptions, Converter, JsonStyle, Rounding};

#[derive(Parser, Debug)]
#[command(name = "make-json")]
#[command(about = "Convert a [1,2,H,W] flow tensor into a JSON grid of [dx, dy] offsets")]
struct Args {
    /// Path to the flow tensor (.pth/.pt/.ot, .npy or .npz), shape [1,2,H,W]
    #[arg(long = "flow_path")]
    flow_path: PathBuf,

    /// Output JSON path (default: flow path with a .json extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Tie-break rule: half-even or half-away
    #[arg(long, default_value = "half-even")]
    rounding: Rounding,

    /// Indent the JSON output
    #[arg(long)]
    pretty: bool,

    /// Fail unless the flow is exactly H x W
    #[arg(long = "expect_size", num_args = 2, value_names = ["H", "W"])]
    expect_size: Option<Vec<usize>>,

    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args) -> flowjson::Result<PathBuf> {
    let options = ConvertOptions {
        rounding: args.rounding,
        style: if args.pretty {
            JsonStyle::Pretty
        } else {
            JsonStyle::Compact
        },
        expected_size: args.expect_size.map(|hw| (hw[0], hw[1])),
        output: args.output,
    };

    Converter::new(options).convert_file(&args.flow_path)
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(output) => println!("{}", output.display()),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}
