//! Gzip and checksum helpers shared by the archive and export stages.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Wraps `writer` in a gzip encoder at `level` (clamped to 1-9).
pub fn gzip_writer<W: Write>(writer: W, level: u32) -> GzEncoder<W> {
    GzEncoder::new(writer, Compression::new(level.clamp(1, 9)))
}

/// Wraps `reader` in a gzip decoder.
pub fn gzip_reader<R: Read>(reader: R) -> GzDecoder<R> {
    GzDecoder::new(reader)
}

/// Hex SHA256 of an in-memory buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Streams `reader` to the end, returning its length and hex SHA256.
pub fn digest_reader<R: Read>(reader: &mut R) -> io::Result<(u64, String)> {
    let mut writer = ChecksumWriter::new(io::sink());
    io::copy(reader, &mut writer)?;
    let checksum = writer.checksum();
    Ok((writer.finish()?, checksum))
}

/// Calculates the SHA256 checksum of a file.
pub fn calculate_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    digest_reader(&mut file).map(|(_, checksum)| checksum)
}

/// Writer that calculates a SHA256 checksum while writing.
pub struct ChecksumWriter<W: Write> {
    writer: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    /// Flushes and returns the number of bytes written.
    pub fn finish(mut self) -> io::Result<u64> {
        self.writer.flush()?;
        Ok(self.bytes_written)
    }

    /// Flushes and returns the inner writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }

    pub fn checksum(&self) -> String {
        format!("{:x}", self.hasher.clone().finalize())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
