//! Per-link configuration (spec.md §6, "Configuration (core-relevant
//! fields)"), loaded from TOML with an environment-variable path override,
//! grounded on the teacher's `config.rs`.

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/readout/readout.toml";
const ENV_CONFIG_PATH: &str = "READOUT_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub latency_buffer: LatencyBufferFileConfig,
    #[serde(default)]
    pub request_handler: RequestHandlerConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub emulator: EmulatorConfig,
}

impl Config {
    /// Loads configuration from file. The path can be overridden with the
    /// `READOUT_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        match fs::read_to_string(PathBuf::from(path)) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "default_source_id")]
    pub source_id: u32,
    #[serde(default = "default_det_id")]
    pub det_id: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            source_id: default_source_id(),
            det_id: default_det_id(),
        }
    }
}

fn default_source_id() -> u32 {
    0
}
fn default_det_id() -> u16 {
    0
}

#[derive(Debug, Deserialize, Clone)]
pub struct LatencyBufferFileConfig {
    #[serde(default = "default_latency_buffer_size")]
    pub latency_buffer_size: usize,
    #[serde(default)]
    pub numa_aware: bool,
    #[serde(default)]
    pub numa_node: u8,
    #[serde(default)]
    pub intrinsic_allocator: bool,
    #[serde(default)]
    pub alignment_size: usize,
    #[serde(default)]
    pub preallocation: bool,
}

impl Default for LatencyBufferFileConfig {
    fn default() -> Self {
        Self {
            latency_buffer_size: default_latency_buffer_size(),
            numa_aware: false,
            numa_node: 0,
            intrinsic_allocator: false,
            alignment_size: 0,
            preallocation: false,
        }
    }
}

fn default_latency_buffer_size() -> usize {
    8192
}

#[derive(Debug, Deserialize, Clone)]
pub struct RequestHandlerConfig {
    #[serde(default = "default_pop_limit_pct")]
    pub pop_limit_pct: f32,
    #[serde(default = "default_pop_size_pct")]
    pub pop_size_pct: f32,
    #[serde(default = "default_num_threads")]
    pub num_request_handling_threads: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u32,
    #[serde(default = "default_true")]
    pub warn_on_timeout: bool,
    #[serde(default = "default_true")]
    pub warn_about_empty_buffer: bool,
    #[serde(default = "default_source_queue_timeout_ms")]
    pub source_queue_timeout_ms: u32,
    #[serde(default = "default_source_queue_sleep_us")]
    pub source_queue_sleep_us: u32,
    #[serde(default)]
    pub send_partial_fragment_if_available: bool,
    #[serde(default)]
    pub post_processing_delay_ticks: u64,
}

impl Default for RequestHandlerConfig {
    fn default() -> Self {
        Self {
            pop_limit_pct: default_pop_limit_pct(),
            pop_size_pct: default_pop_size_pct(),
            num_request_handling_threads: default_num_threads(),
            request_timeout_ms: default_request_timeout_ms(),
            warn_on_timeout: true,
            warn_about_empty_buffer: true,
            source_queue_timeout_ms: default_source_queue_timeout_ms(),
            source_queue_sleep_us: default_source_queue_sleep_us(),
            send_partial_fragment_if_available: false,
            post_processing_delay_ticks: 0,
        }
    }
}

fn default_pop_limit_pct() -> f32 {
    0.8
}
fn default_pop_size_pct() -> f32 {
    0.5
}
fn default_num_threads() -> usize {
    2
}
fn default_request_timeout_ms() -> u32 {
    1000
}
fn default_source_queue_timeout_ms() -> u32 {
    100
}
fn default_source_queue_sleep_us() -> u32 {
    50
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Zstd,
    Lzma,
    Zlib,
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordingConfig {
    #[serde(default)]
    pub enable_raw_recording: bool,
    #[serde(default = "default_output_file")]
    pub output_file: PathBuf,
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
    #[serde(default)]
    pub compression_algorithm: CompressionAlgorithm,
    #[serde(default)]
    pub use_o_direct: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enable_raw_recording: false,
            output_file: default_output_file(),
            stream_buffer_size: default_stream_buffer_size(),
            compression_algorithm: CompressionAlgorithm::default(),
            use_o_direct: false,
        }
    }
}

fn default_output_file() -> PathBuf {
    PathBuf::from("/tmp/readout.out")
}
fn default_stream_buffer_size() -> usize {
    8192
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum SetT0 {
    None,
    Now,
    Value(u64),
}

impl Default for SetT0 {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmulatorConfig {
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
    #[serde(default)]
    pub input_file_size_limit: usize,
    #[serde(default = "default_rate_khz")]
    pub rate_khz: f64,
    #[serde(default = "default_frames_per_tick")]
    pub frames_per_tick: u16,
    #[serde(default)]
    pub dropout_rate: f64,
    #[serde(default)]
    pub frame_error_rate_hz: f64,
    #[serde(default = "default_random_population_size")]
    pub random_population_size: usize,
    #[serde(default)]
    pub set_t0: SetT0,
    #[serde(default)]
    pub generate_periodic_adc_pattern: bool,
    #[serde(default = "default_tp_rate_multiplier")]
    pub tp_rate_per_channel_multiplier: u32,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
            input_file_size_limit: 0,
            rate_khz: default_rate_khz(),
            frames_per_tick: default_frames_per_tick(),
            dropout_rate: 0.0,
            frame_error_rate_hz: 0.0,
            random_population_size: default_random_population_size(),
            set_t0: SetT0::default(),
            generate_periodic_adc_pattern: false,
            tp_rate_per_channel_multiplier: default_tp_rate_multiplier(),
        }
    }
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/tmp/readout-source.dat")
}
fn default_rate_khz() -> f64 {
    166.0
}
fn default_frames_per_tick() -> u16 {
    1
}
fn default_random_population_size() -> usize {
    10_000
}
fn default_tp_rate_multiplier() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"
[link]
source_id = 7
det_id = 2
[latency_buffer]
latency_buffer_size = 4096
[request_handler]
pop_limit_pct = 0.9
pop_size_pct = 0.4
num_request_handling_threads = 4
request_timeout_ms = 500
[recording]
enable_raw_recording = true
compression_algorithm = "zstd"
[emulator]
rate_khz = 200.0
frames_per_tick = 2
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.link.source_id, 7);
        assert_eq!(cfg.latency_buffer.latency_buffer_size, 4096);
        assert_eq!(cfg.request_handler.num_request_handling_threads, 4);
        assert!(cfg.request_handler.warn_on_timeout);
        assert!(cfg.recording.enable_raw_recording);
        assert_eq!(cfg.recording.compression_algorithm, CompressionAlgorithm::Zstd);
        assert_eq!(cfg.emulator.frames_per_tick, 2);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/path/readout.toml");
        let cfg = Config::load();
        assert_eq!(cfg.link.source_id, 0);
        std::env::remove_var(ENV_CONFIG_PATH);
    }
}
