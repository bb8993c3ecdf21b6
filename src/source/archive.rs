// src/source/archive.rs

//! Unpacking downloaded archives into snapshot directories
//!
//! The format is sniffed from the leading bytes; file names from release
//! pages are too unreliable to trust (GitHub zipballs have no extension).

use crate::error::FetchError;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use tar::Archive;
use tracing::debug;
use walkdir::WalkDir;
use xz2::read::XzDecoder;

/// Archive container formats Packman can unpack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarXz,
    TarZst,
    Tar,
}

impl ArchiveFormat {
    /// Identify an archive by its magic bytes
    pub fn detect(path: &Path) -> Result<Self, FetchError> {
        let mut header = [0u8; 512];
        let mut file = File::open(path).map_err(|e| archive_err(path, e))?;
        let read = read_up_to(&mut file, &mut header).map_err(|e| archive_err(path, e))?;
        let header = &header[..read];

        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            Ok(ArchiveFormat::Zip)
        } else if header.starts_with(&[0x1f, 0x8b]) {
            Ok(ArchiveFormat::TarGz)
        } else if header.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Ok(ArchiveFormat::TarXz)
        } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Ok(ArchiveFormat::TarZst)
        } else if header.len() >= 262 && &header[257..262] == b"ustar" {
            Ok(ArchiveFormat::Tar)
        } else {
            Err(FetchError::Archive(format!(
                "{}: unrecognized archive format",
                path.display()
            )))
        }
    }
}

/// Unpack `archive` into `dest`, creating it if needed
///
/// Entries that would land outside `dest` are skipped by both the zip and tar
/// readers.
pub fn unpack(archive: &Path, dest: &Path) -> Result<(), FetchError> {
    fs::create_dir_all(dest).map_err(|e| archive_err(dest, e))?;

    let format = ArchiveFormat::detect(archive)?;
    debug!("Unpacking {} ({:?}) into {}", archive.display(), format, dest.display());

    let file = File::open(archive).map_err(|e| archive_err(archive, e))?;
    match format {
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|e| FetchError::Archive(format!("{}: {}", archive.display(), e)))?;
            zip.extract(dest)
                .map_err(|e| FetchError::Archive(format!("{}: {}", archive.display(), e)))
        }
        ArchiveFormat::TarGz => unpack_tar(GzDecoder::new(file), archive, dest),
        ArchiveFormat::TarXz => unpack_tar(XzDecoder::new(file), archive, dest),
        ArchiveFormat::TarZst => {
            let decoder = zstd::stream::read::Decoder::new(file).map_err(|e| archive_err(archive, e))?;
            unpack_tar(decoder, archive, dest)
        }
        ArchiveFormat::Tar => unpack_tar(file, archive, dest),
    }
}

/// Copy a directory tree into `dest` (used for `file://` directory sources)
pub fn copy_tree(source: &Path, dest: &Path) -> Result<(), FetchError> {
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| FetchError::Archive(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| FetchError::Archive(e.to_string()))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| archive_err(&target, e))?;
        } else if entry.path().is_file() {
            fs::copy(entry.path(), &target).map_err(|e| archive_err(&target, e))?;
        }
    }
    Ok(())
}

fn unpack_tar<R: Read>(reader: R, archive: &Path, dest: &Path) -> Result<(), FetchError> {
    Archive::new(reader)
        .unpack(dest)
        .map_err(|e| FetchError::Archive(format!("{}: {}", archive.display(), e)))
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn archive_err(path: &Path, e: io::Error) -> FetchError {
    FetchError::Archive(format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn tar_bytes() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"hello";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "Mod/GameData/readme.txt", &data[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_unpack_tar_gz() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("download");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes()).unwrap();
        fs::write(&archive, encoder.finish().unwrap()).unwrap();

        assert_eq!(ArchiveFormat::detect(&archive).unwrap(), ArchiveFormat::TarGz);
        let dest = temp.path().join("out");
        unpack(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("Mod/GameData/readme.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_unpack_tar_zst() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("download.tar.zst");
        fs::write(&archive, zstd::encode_all(&tar_bytes()[..], 3).unwrap()).unwrap();

        let dest = temp.path().join("out");
        unpack(&archive, &dest).unwrap();
        assert!(dest.join("Mod/GameData/readme.txt").is_file());
    }

    #[test]
    fn test_unpack_zip() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("mod.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default();
            zip.add_directory("Mod/", options).unwrap();
            zip.start_file("Mod/part.cfg", options).unwrap();
            zip.write_all(b"PART {}").unwrap();
            zip.finish().unwrap();
        }

        let dest = temp.path().join("out");
        unpack(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("Mod/part.cfg")).unwrap(), b"PART {}");
    }

    #[test]
    fn test_unrecognized_format() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("notes.txt");
        fs::write(&archive, b"just text").unwrap();

        assert!(matches!(
            unpack(&archive, &temp.path().join("out")),
            Err(FetchError::Archive(_))
        ));
    }

    #[test]
    fn test_copy_tree() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        fs::create_dir_all(source.join("a/b")).unwrap();
        fs::write(source.join("a/b/c.txt"), b"c").unwrap();

        let dest = temp.path().join("dest");
        copy_tree(&source, &dest).unwrap();
        assert_eq!(fs::read(dest.join("a/b/c.txt")).unwrap(), b"c");
    }
}
