//! Buffered file writer/reader with pluggable compression (spec.md §4.5.5,
//! §6 "File formats"). Grounded on
//! `readoutlibs/utils/BufferedFileWriter.hpp` / `BufferedFileReader.hpp`;
//! `flate2`/`zstd`/`xz2` stand in for the original's zlib/zstd/lzma
//! bindings.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use crate::config::CompressionAlgorithm;
use crate::issues::{ComponentId, ReadoutIssue};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

enum Encoder {
    Plain(BufWriter<File>),
    Zstd(zstd::Encoder<'static, BufWriter<File>>),
    Zlib(flate2::write::ZlibEncoder<BufWriter<File>>),
    Xz(xz2::write::XzEncoder<BufWriter<File>>),
}

/// A buffered, optionally compressed file writer. Opens at `conf`,
/// flushes on recording completion, closes at `scrap` (spec.md §5,
/// "Resource lifecycles").
pub struct BufferedWriter {
    encoder: Option<Encoder>,
}

impl BufferedWriter {
    pub fn open(
        component: ComponentId,
        path: &Path,
        stream_buffer_size: usize,
        algorithm: CompressionAlgorithm,
        use_o_direct: bool,
    ) -> Result<Self, ReadoutIssue> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(target_os = "linux")]
        if use_o_direct {
            options.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        if use_o_direct {
            log::warn!("component[{component}] O_DIRECT requested but unsupported on this platform; ignoring");
        }

        let file = options.open(path).map_err(|e| ReadoutIssue::ConfigurationError {
            component,
            reason: format!("cannot open recording output {}: {e}", path.display()),
        })?;
        let buffered = BufWriter::with_capacity(stream_buffer_size, file);

        let encoder = match algorithm {
            CompressionAlgorithm::None => Encoder::Plain(buffered),
            CompressionAlgorithm::Zstd => {
                Encoder::Zstd(zstd::Encoder::new(buffered, 0).map_err(|e| ReadoutIssue::ConfigurationError {
                    component,
                    reason: format!("zstd encoder init failed: {e}"),
                })?)
            }
            CompressionAlgorithm::Lzma => Encoder::Xz(xz2::write::XzEncoder::new(buffered, 6)),
            CompressionAlgorithm::Zlib => Encoder::Zlib(flate2::write::ZlibEncoder::new(buffered, flate2::Compression::default())),
        };

        Ok(Self { encoder: Some(encoder) })
    }

    pub fn is_open(&self) -> bool {
        self.encoder.is_some()
    }

    /// Appends `bytes`, returning `false` (never panicking) on I/O failure
    /// so the caller can raise `CANNOT_WRITE_TO_FILE` and continue.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        let Some(encoder) = self.encoder.as_mut() else {
            return false;
        };
        let result: io::Result<()> = match encoder {
            Encoder::Plain(w) => w.write_all(bytes),
            Encoder::Zstd(w) => w.write_all(bytes),
            Encoder::Zlib(w) => w.write_all(bytes),
            Encoder::Xz(w) => w.write_all(bytes),
        };
        result.is_ok()
    }

    pub fn flush(&mut self) {
        if let Some(encoder) = self.encoder.as_mut() {
            let _ = match encoder {
                Encoder::Plain(w) => w.flush(),
                Encoder::Zstd(w) => w.flush(),
                Encoder::Zlib(w) => w.flush(),
                Encoder::Xz(w) => w.flush(),
            };
        }
    }

    pub fn close(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            match encoder {
                Encoder::Plain(mut w) => {
                    let _ = w.flush();
                }
                Encoder::Zstd(w) => {
                    let _ = w.finish();
                }
                Encoder::Zlib(w) => {
                    let _ = w.finish();
                }
                Encoder::Xz(w) => {
                    let _ = w.finish();
                }
            }
        }
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        self.close();
    }
}

enum Decoder {
    Plain(File),
    Zstd(zstd::Decoder<'static, io::BufReader<File>>),
    Zlib(flate2::read::ZlibDecoder<File>),
    Xz(xz2::read::XzDecoder<File>),
}

/// The reading half of [`BufferedWriter`]'s format, used by tests to
/// verify the round-trip property (spec.md §8, property 10) and available
/// to offline analysis tooling reading recorded output.
pub struct BufferedReader {
    decoder: Decoder,
}

impl BufferedReader {
    pub fn open(path: &Path, algorithm: CompressionAlgorithm) -> io::Result<Self> {
        let file = File::open(path)?;
        let decoder = match algorithm {
            CompressionAlgorithm::None => Decoder::Plain(file),
            CompressionAlgorithm::Zstd => Decoder::Zstd(zstd::Decoder::new(file)?),
            CompressionAlgorithm::Lzma => Decoder::Xz(xz2::read::XzDecoder::new(file)),
            CompressionAlgorithm::Zlib => Decoder::Zlib(flate2::read::ZlibDecoder::new(file)),
        };
        Ok(Self { decoder })
    }

    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        match &mut self.decoder {
            Decoder::Plain(r) => r.read_to_end(out),
            Decoder::Zstd(r) => r.read_to_end(out),
            Decoder::Zlib(r) => r.read_to_end(out),
            Decoder::Xz(r) => r.read_to_end(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn round_trip(algorithm: CompressionAlgorithm) {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        let payload: Vec<u8> = (0..10_000u32).flat_map(|v| v.to_le_bytes()).collect();

        let mut writer = BufferedWriter::open(1, &path, 4096, algorithm, false).unwrap();
        assert!(writer.write(&payload));
        writer.close();

        let mut reader = BufferedReader::open(&path, algorithm).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn round_trip_none() {
        round_trip(CompressionAlgorithm::None);
    }

    #[test]
    fn round_trip_zlib() {
        round_trip(CompressionAlgorithm::Zlib);
    }

    #[test]
    fn round_trip_lzma() {
        round_trip(CompressionAlgorithm::Lzma);
    }

    #[test]
    fn round_trip_zstd() {
        round_trip(CompressionAlgorithm::Zstd);
    }

    #[test]
    fn write_after_close_fails() {
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = BufferedWriter::open(1, tmp.path(), 4096, CompressionAlgorithm::None, false).unwrap();
        writer.close();
        assert!(!writer.write(b"data"));
    }
}
