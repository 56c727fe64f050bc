use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "omxenc")]
#[command(
    about = "Dual-session test harness for OpenMAX-style encoder components",
    long_about = None,
    // -h is the picture height, as in the encoder's own test tools.
    disable_help_flag = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,

    /// Raw input frames of session 0 (`plink:<file>` streams them through the remote frame source)
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Encoded output of session 0
    #[arg(short = 'o', long, default_value = "stream.bin")]
    pub output: PathBuf,

    /// Output compression format of session 0
    #[arg(short = 'O', long, value_enum, default_value_t = OutputFormat::Avc)]
    pub output_format: OutputFormat,

    /// First frame to encode
    #[arg(short = 'a', long, default_value_t = 0)]
    pub first_frame: u64,

    /// Last frame to encode
    #[arg(short = 'b', long, default_value_t = 100)]
    pub last_frame: u64,

    /// Picture width in pixels
    #[arg(short = 'w', long, default_value_t = 176)]
    pub width: u32,

    /// Picture height in pixels
    #[arg(short = 'h', long, default_value_t = 144)]
    pub height: u32,

    /// Input row pitch in pixels (defaults to the width)
    #[arg(long)]
    pub stride: Option<u32>,

    /// Input color format: 0 = YUV 4:2:0 planar, 1 = YUV 4:2:0 semiplanar
    #[arg(short = 'l', long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub input_format: u8,

    /// Input frame rate (frames per second)
    #[arg(short = 'j', long, default_value_t = 30)]
    pub input_rate: u32,

    /// Output frame rate (frames per second)
    #[arg(short = 'f', long, default_value_t = 30)]
    pub output_rate: u32,

    /// Pace submissions in real time at rate-numer/rate-denom frames per second
    #[arg(long, requires = "rate_denom")]
    pub rate_numer: Option<u32>,

    #[arg(long, requires = "rate_numer")]
    pub rate_denom: Option<u32>,

    /// Buffers per port (overrides config)
    #[arg(short = 'c', long)]
    pub buffer_count: Option<u32>,

    /// Minimum buffer size in bytes
    #[arg(short = 's', long)]
    pub buffer_size: Option<usize>,

    /// Target bitrate in bits per second
    #[arg(short = 'B', long)]
    pub bitrate: Option<u32>,

    /// Coding profile, hex as the component encodes it (AVC defaults to 8, High)
    #[arg(short = 'p', long, value_parser = parse_hex)]
    pub profile: Option<u32>,

    /// Coding level, e.g. 51 for AVC 5.1 or 93 for HEVC 3.1 (AVC defaults to 51)
    #[arg(short = 'L', long)]
    pub level: Option<u32>,

    /// P frames between I frames
    #[arg(short = 'n', long, alias = "npframes")]
    pub p_frames: Option<u32>,

    /// Reference frames
    #[arg(short = 'F', long, alias = "nrefframes")]
    pub ref_frames: Option<u32>,

    /// CABAC entropy coding (AVC)
    #[arg(short = 'K', long)]
    pub cabac: bool,

    /// Turn the deblocking filter off
    #[arg(long)]
    pub no_deblocking: bool,

    /// Initial I frame QP; quality factor 1-100 for JPEG
    #[arg(short = 'q', long)]
    pub qp: Option<u32>,

    /// Coded picture buffer size in bits (AVC)
    #[arg(long)]
    pub cpb_size: Option<u32>,

    /// Speed/compression trade-off preset (AVC)
    #[arg(long)]
    pub preset: Option<u32>,

    /// QP offset of intra frames (AVC)
    #[arg(short = 'A', long, allow_hyphen_values = true)]
    pub intra_qp_delta: Option<i32>,

    #[arg(long)]
    pub qp_min_i: Option<u32>,

    #[arg(long)]
    pub qp_max_i: Option<u32>,

    #[arg(long)]
    pub qp_min_pb: Option<u32>,

    #[arg(long)]
    pub qp_max_pb: Option<u32>,

    /// Submit input in slices of this many rows
    #[arg(long)]
    pub slice_height: Option<u32>,

    /// Overlay (OSD) frames, repeated from the top when exhausted
    #[arg(long)]
    pub osd: Option<PathBuf>,

    #[arg(long, default_value_t = 16)]
    pub osd_width: u32,

    #[arg(long, default_value_t = 16)]
    pub osd_height: u32,

    #[arg(long, value_enum, default_value_t = OsdFormat::Argb)]
    pub osd_format: OsdFormat,

    /// Reuse buffer contents instead of reading once every buffer holds a frame
    #[arg(long)]
    pub cache_mode: bool,

    /// Raw input frames of session 1; session 1 only runs when given
    #[arg(long)]
    pub input2: Option<PathBuf>,

    #[arg(long, default_value = "stream2.bin")]
    pub output2: PathBuf,

    /// Output compression format of session 1 (defaults to session 0's)
    #[arg(long, value_enum)]
    pub output_format2: Option<OutputFormat>,

    #[arg(long)]
    pub first_frame2: Option<u64>,

    #[arg(long)]
    pub last_frame2: Option<u64>,

    #[arg(long, value_parser = parse_hex)]
    pub profile2: Option<u32>,

    #[arg(long)]
    pub qp2: Option<u32>,

    #[arg(long)]
    pub bitrate2: Option<u32>,

    /// Component to instantiate (overrides config)
    #[arg(long)]
    pub component: Option<String>,

    /// Simulated processing delay per input buffer, in microseconds
    #[arg(long, default_value_t = 0)]
    pub sim_latency_us: u64,

    /// Random extra delay per input buffer, up to this many microseconds
    #[arg(long, default_value_t = 0)]
    pub sim_jitter_us: u64,

    /// Nice value applied to session threads
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i32,

    /// Print session reports as JSON
    #[arg(long)]
    pub json: bool,

    /// Log level: error, warn, info, debug, trace (overrides config)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Avc,
    Hevc,
    Jpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OsdFormat {
    Argb,
    Yuv420,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show config status and location, or create default config if missing
    InitConfig,
}

fn parse_hex(value: &str) -> Result<u32, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("'{}' is not a hex number: {}", value, e))
}

pub fn parse() -> Cli {
    Cli::parse()
}
