//! Helpers shared by the process-driven engines.

mod ffmpeg_parser;
mod output_record_reader;

pub use ffmpeg_parser::{
    FfmpegProgress, is_ready_banner, parse_bitrate_label, parse_progress, parse_size, parse_time,
    parse_time_field,
};
pub use output_record_reader::OutputRecordReader;
