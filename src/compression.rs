//! Compression codecs for output files.
//!
//! A codec wraps the temp file a [`crate::cache::FileCache`] writes
//! through. Opening against an existing target carries the prior
//! content over: gzip appends a new member (concatenated members are a
//! valid stream), zip re-packs the single entry, uncompressed files
//! are byte-copied.

use std::fs::File;
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

use crate::registry::Registry;
use crate::Result;

/// A finishable row stream over the staged output file.
pub trait RowSink: Write + Send {
    /// Completes the compression member/archive and flushes the file.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// One compression scheme, selected by short name.
pub trait CompressionCodec: Send + Sync {
    /// Extension appended to the row-format extension (`""`, `.gz`,
    /// `.zip`).
    fn extension(&self) -> &'static str;

    /// Opens a row sink over `sink`, first carrying over the raw bytes
    /// of the existing target when appending. `entry` is the inner
    /// file name for archive formats.
    fn writer(
        &self,
        sink: File,
        existing: Option<Box<dyn Read + Send>>,
        entry: &str,
    ) -> Result<Box<dyn RowSink>>;

    /// Opens a decompressed reader over a target's content.
    fn reader(&self, source: Box<dyn Read + Send>, entry: &str) -> Result<Box<dyn Read + Send>>;
}

/// Registry with `none`, `gzip` and `zip` pre-registered.
pub fn codec_registry() -> Registry<dyn CompressionCodec> {
    let mut registry = Registry::new("compression");
    registry.register("none", Arc::new(IdentityCodec) as Arc<dyn CompressionCodec>);
    registry.register("gzip", Arc::new(GzipCodec) as Arc<dyn CompressionCodec>);
    registry.register("zip", Arc::new(ZipCodec) as Arc<dyn CompressionCodec>);
    registry
}

/// No compression; rows go straight to the file.
pub struct IdentityCodec;

impl RowSink for BufWriter<File> {
    fn finish(self: Box<Self>) -> Result<()> {
        let mut file = self.into_inner().map_err(|e| e.into_error())?;
        file.flush()?;
        Ok(())
    }
}

impl CompressionCodec for IdentityCodec {
    fn extension(&self) -> &'static str {
        ""
    }

    fn writer(
        &self,
        mut sink: File,
        existing: Option<Box<dyn Read + Send>>,
        _entry: &str,
    ) -> Result<Box<dyn RowSink>> {
        if let Some(mut existing) = existing {
            io::copy(&mut existing, &mut sink)?;
        }
        Ok(Box::new(BufWriter::new(sink)))
    }

    fn reader(&self, source: Box<dyn Read + Send>, _entry: &str) -> Result<Box<dyn Read + Send>> {
        Ok(source)
    }
}

/// Gzip compression. Appends write a fresh member after the existing
/// compressed bytes; reads decode all members.
pub struct GzipCodec;

impl RowSink for GzEncoder<File> {
    fn finish(self: Box<Self>) -> Result<()> {
        let mut file = (*self).finish()?;
        file.flush()?;
        Ok(())
    }
}

impl CompressionCodec for GzipCodec {
    fn extension(&self) -> &'static str {
        ".gz"
    }

    fn writer(
        &self,
        mut sink: File,
        existing: Option<Box<dyn Read + Send>>,
        _entry: &str,
    ) -> Result<Box<dyn RowSink>> {
        if let Some(mut existing) = existing {
            io::copy(&mut existing, &mut sink)?;
        }
        Ok(Box::new(GzEncoder::new(sink, flate2::Compression::default())))
    }

    fn reader(&self, source: Box<dyn Read + Send>, _entry: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(MultiGzDecoder::new(source)))
    }
}

/// Zip archive with a single entry. Appends re-pack the entry with the
/// prior decompressed content followed by the new rows.
pub struct ZipCodec;

struct ZipRowSink {
    writer: zip::ZipWriter<File>,
}

impl Write for ZipRowSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl RowSink for ZipRowSink {
    fn finish(mut self: Box<Self>) -> Result<()> {
        let mut file = self.writer.finish()?;
        file.flush()?;
        Ok(())
    }
}

fn read_entry(source: Box<dyn Read + Send>, entry: &str) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    let mut source = source;
    source.read_to_end(&mut raw)?;
    let mut archive = zip::ZipArchive::new(Cursor::new(raw))?;
    let mut content = Vec::new();
    if archive.file_names().any(|name| name == entry) {
        archive.by_name(entry)?.read_to_end(&mut content)?;
    } else if archive.len() > 0 {
        archive.by_index(0)?.read_to_end(&mut content)?;
    }
    Ok(content)
}

impl CompressionCodec for ZipCodec {
    fn extension(&self) -> &'static str {
        ".zip"
    }

    fn writer(
        &self,
        sink: File,
        existing: Option<Box<dyn Read + Send>>,
        entry: &str,
    ) -> Result<Box<dyn RowSink>> {
        let prior = match existing {
            Some(source) => read_entry(source, entry)?,
            None => Vec::new(),
        };
        let mut writer = zip::ZipWriter::new(sink);
        writer.start_file(entry, zip::write::FileOptions::default())?;
        writer.write_all(&prior)?;
        Ok(Box::new(ZipRowSink { writer }))
    }

    fn reader(&self, source: Box<dyn Read + Send>, entry: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(read_entry(source, entry)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write_cycle(
        codec: &dyn CompressionCodec,
        path: &Path,
        existing: Option<Vec<u8>>,
        lines: &[&str],
        entry: &str,
    ) {
        let staged = path.with_extension("staged");
        let sink = File::create(&staged).unwrap();
        let existing_reader =
            existing.map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>);
        let mut writer = codec.writer(sink, existing_reader, entry).unwrap();
        for line in lines {
            writeln!(writer, "{line}").unwrap();
        }
        writer.finish().unwrap();
        fs::rename(&staged, path).unwrap();
    }

    fn read_all(codec: &dyn CompressionCodec, path: &Path, entry: &str) -> String {
        let source = Box::new(File::open(path).unwrap()) as Box<dyn Read + Send>;
        let mut reader = codec.reader(source, entry).unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn gzip_two_cycles_concatenate_into_valid_stream() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bin.csv.gz");
        let codec = GzipCodec;

        write_cycle(&codec, &target, None, &["a", "first"], "bin.csv");
        let raw = fs::read(&target).unwrap();
        write_cycle(&codec, &target, Some(raw), &["second"], "bin.csv");

        assert_eq!(read_all(&codec, &target, "bin.csv"), "a\nfirst\nsecond\n");
    }

    #[test]
    fn zip_append_repacks_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bin.csv.zip");
        let codec = ZipCodec;

        write_cycle(&codec, &target, None, &["a", "first"], "bin.csv");
        let raw = fs::read(&target).unwrap();
        write_cycle(&codec, &target, Some(raw), &["second"], "bin.csv");

        assert_eq!(read_all(&codec, &target, "bin.csv"), "a\nfirst\nsecond\n");

        let mut archive = zip::ZipArchive::new(File::open(&target).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.by_index(0).unwrap().name(), "bin.csv");
    }

    #[test]
    fn identity_round_trip_with_carry_over() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bin.csv");
        let codec = IdentityCodec;

        write_cycle(&codec, &target, None, &["a", "first"], "bin.csv");
        let raw = fs::read(&target).unwrap();
        write_cycle(&codec, &target, Some(raw), &["second"], "bin.csv");

        assert_eq!(read_all(&codec, &target, "bin.csv"), "a\nfirst\nsecond\n");
    }

    #[test]
    fn registry_extensions() {
        let registry = codec_registry();
        assert_eq!(registry.get("none").unwrap().extension(), "");
        assert_eq!(registry.get("gzip").unwrap().extension(), ".gz");
        assert_eq!(registry.get("zip").unwrap().extension(), ".zip");
        assert!(registry.get("lz4").is_err());
    }
}
