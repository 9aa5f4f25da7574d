//! Container and stream decoding
//!
//! Everything here is blocking I/O; callers run it on the blocking pool.
//! Split parts are byte-splits of one container and are read back to back.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::catalog::ContainerFormat;

const BUFFER_SIZE: usize = 1 << 20;

/// Open `parts` as one continuous stream, in the given order
pub fn open_concatenated(parts: &[PathBuf]) -> io::Result<Box<dyn Read + Send>> {
    let mut reader: Box<dyn Read + Send> = Box::new(io::empty());
    for part in parts {
        let file = File::open(part)?;
        reader = Box::new(reader.chain(BufReader::with_capacity(BUFFER_SIZE, file)));
    }
    Ok(reader)
}

/// Decode `parts` into `dest_dir`
///
/// Archives unpack into a scratch directory inside `dest_dir` and their
/// top-level entries are moved into place only after the whole archive
/// unpacked. Streams are written to `dest_dir/output_name` through a
/// `.partial` file that is renamed only once the stream decoded cleanly.
/// Either way an interrupted decode never leaves a plausible output behind.
/// Returns the number of bytes produced.
pub fn decode_into(
    parts: &[PathBuf],
    format: ContainerFormat,
    dest_dir: &Path,
    output_name: &str,
) -> io::Result<u64> {
    fs::create_dir_all(dest_dir)?;
    let reader = open_concatenated(parts)?;

    match format {
        ContainerFormat::Tar => unpack(reader, dest_dir),
        ContainerFormat::TarGz => unpack(GzDecoder::new(reader), dest_dir),
        ContainerFormat::Zstd => write_stream(ZstdDecoder::new(reader)?, dest_dir, output_name),
        ContainerFormat::Gzip => write_stream(GzDecoder::new(reader), dest_dir, output_name),
        ContainerFormat::Plain => write_stream(reader, dest_dir, output_name),
        ContainerFormat::Block => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "block streams are decoded by the external decompressor",
        )),
    }
}

fn unpack<R: Read>(reader: R, dest_dir: &Path) -> io::Result<u64> {
    // Dropped (and removed) on every early return
    let scratch = tempfile::Builder::new()
        .prefix(".unpacking-")
        .tempdir_in(dest_dir)?;

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(scratch.path())?;
    let produced = dir_size(scratch.path())?;

    for entry in fs::read_dir(scratch.path())? {
        let entry = entry?;
        let target = dest_dir.join(entry.file_name());
        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target)?,
            Ok(_) => fs::remove_file(&target)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::rename(entry.path(), &target)?;
    }
    Ok(produced)
}

fn write_stream<R: Read>(mut reader: R, dest_dir: &Path, output_name: &str) -> io::Result<u64> {
    let target = dest_dir.join(output_name);
    let partial = dest_dir.join(format!("{output_name}.partial"));

    let written = {
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, File::create(&partial)?);
        let written = io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        written
    };
    fs::rename(&partial, &target)?;
    Ok(written)
}

/// Total size of the regular files under `path`
pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}
