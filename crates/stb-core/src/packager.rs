//! Conditional single-entry archiving of staged files.
//!
//! Raw database files compress well and Telegram caps document size, so files
//! whose suffix is in the compressible set are wrapped in a one-entry archive
//! that replaces the staged file. Everything else passes through untouched.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use flate2::{write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use tracing::debug;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::{
    errors::Error,
    staging::{ScopedFile, StagedFile},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn suffix(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::TarGz => ".tar.gz",
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar.gz" | "tgz" | "targz" => Ok(ArchiveFormat::TarGz),
            other => Err(Error::Config(format!(
                "unknown ARCHIVE_FORMAT {other:?} (expected zip or tar.gz)"
            ))),
        }
    }
}

/// The single local representation of a manifest item that gets delivered.
#[derive(Debug)]
pub struct PackagedArtifact {
    file: ScopedFile,
    archived: bool,
    size: u64,
    sha256: String,
}

impl PackagedArtifact {
    pub fn local_path(&self) -> &Path {
        self.file.path()
    }

    pub fn file_name(&self) -> String {
        self.local_path()
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// True when the staged file was replaced by an archive.
    pub(crate) fn archived(&self) -> bool {
        self.archived
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Delete the artifact now (normal end of an item).
    pub fn discard(self) -> io::Result<()> {
        self.file.remove()
    }
}

#[derive(Clone, Debug)]
pub struct ArtifactPackager {
    compress_suffixes: Vec<String>,
    format: ArchiveFormat,
}

impl ArtifactPackager {
    /// `compress_suffixes` are matched case-insensitively and include the dot (`.db`).
    pub fn new(compress_suffixes: Vec<String>, format: ArchiveFormat) -> Self {
        Self {
            compress_suffixes: compress_suffixes
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            format,
        }
    }

    /// Suffix of `name` that triggers archiving, if any.
    fn matching_suffix(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.compress_suffixes
            .iter()
            .filter(|s| lower.ends_with(s.as_str()) && lower.len() > s.len())
            .max_by_key(|s| s.len())
            .map(|s| s.as_str())
    }

    /// Apply the packaging policy, consuming the staged file.
    ///
    /// On success exactly one file is live: either the staged file itself
    /// (pass-through) or the new archive (the staged file is deleted). On
    /// failure both the partial archive and the staged file are removed.
    pub fn package(&self, staged: StagedFile) -> Result<PackagedArtifact> {
        let remote_path = staged.origin_remote_path().to_string();
        let staged = staged.into_file();
        let src = staged.path().to_path_buf();
        let name = src
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Packaging(format!("staged path has no file name: {}", src.display())))?;

        let Some(suffix) = self.matching_suffix(&name) else {
            let (size, sha256) = digest_file(&src)
                .map_err(|e| Error::Packaging(format!("read {}: {e}", src.display())))?;
            return Ok(PackagedArtifact {
                file: staged,
                archived: false,
                size,
                sha256,
            });
        };

        let dest = archive_path(&src, &name, suffix, self.format);
        if dest == src {
            return Err(Error::Packaging(format!(
                "archive for {} would overwrite its source",
                src.display()
            )));
        }
        let archive = ScopedFile::new(&dest);
        let written = match self.format {
            ArchiveFormat::Zip => write_zip(&src, &name, &dest),
            ArchiveFormat::TarGz => write_tar_gz(&src, &name, &dest),
        };
        written.map_err(|e| Error::Packaging(format!("archive {}: {e}", dest.display())))?;

        // The archive supersedes the staged copy.
        staged
            .remove()
            .map_err(|e| Error::Packaging(format!("remove {}: {e}", src.display())))?;

        let (size, sha256) = digest_file(&dest)
            .map_err(|e| Error::Packaging(format!("read {}: {e}", dest.display())))?;
        debug!(remote_path = %remote_path, archive = %dest.display(), bytes = size, "archived");
        Ok(PackagedArtifact {
            file: archive,
            archived: true,
            size,
            sha256,
        })
    }
}

fn archive_path(src: &Path, name: &str, suffix: &str, format: ArchiveFormat) -> PathBuf {
    let stem = &name[..name.len() - suffix.len()];
    src.with_file_name(format!("{stem}{}", format.suffix()))
}

fn write_zip(src: &Path, entry_name: &str, dest: &Path) -> io::Result<()> {
    let mut input = BufReader::new(File::open(src)?);
    let size = input.get_ref().metadata()?.len();

    let mut zw = ZipWriter::new(BufWriter::new(File::create(dest)?));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644)
        .large_file(size >= u32::MAX as u64);
    zw.start_file(entry_name, options).map_err(zip_err)?;
    io::copy(&mut input, &mut zw)?;

    let mut out = zw.finish().map_err(zip_err)?;
    out.flush()?;
    out.get_ref().sync_all()
}

fn write_tar_gz(src: &Path, entry_name: &str, dest: &Path) -> io::Result<()> {
    let enc = GzEncoder::new(BufWriter::new(File::create(dest)?), Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder.append_path_with_name(src, entry_name)?;

    let mut out = builder.into_inner()?.finish()?;
    out.flush()?;
    out.get_ref().sync_all()
}

fn zip_err(e: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn digest_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((size, format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::tests::tmp;
    use std::{fs, io::Read};
    use zip::ZipArchive;

    fn packager(format: ArchiveFormat) -> ArtifactPackager {
        ArtifactPackager::new(vec![".db".to_string()], format)
    }

    fn stage(dir: &Path, name: &str, bytes: &[u8]) -> StagedFile {
        let staged = StagedFile::claim(dir, &format!("/data/{name}")).unwrap();
        fs::write(staged.local_path(), bytes).unwrap();
        staged
    }

    fn payload() -> Vec<u8> {
        (0..64 * 1024u32).flat_map(|i| (i % 251).to_le_bytes()).collect()
    }

    #[test]
    fn db_file_becomes_single_entry_zip() {
        let dir = tmp("stb-pkg-zip");
        let data = payload();
        let staged = stage(&dir, "a.db", &data);
        let original = staged.local_path().to_path_buf();

        let artifact = packager(ArchiveFormat::Zip).package(staged).unwrap();
        assert!(artifact.archived());
        assert_eq!(artifact.file_name(), "a.zip");
        assert!(!original.exists(), "staged file must be replaced, not kept");

        let mut zip = ZipArchive::new(File::open(artifact.local_path()).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        let mut entry = zip.by_index(0).unwrap();
        assert_eq!(entry.name(), "a.db");
        assert_eq!(entry.compression(), CompressionMethod::Deflated);
        let mut out = Vec::new();
        entry.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        drop(entry);

        let path = artifact.local_path().to_path_buf();
        artifact.discard().unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn repackaging_same_input_yields_identical_entry() {
        let dir = tmp("stb-pkg-twice");
        let data = payload();
        let p = packager(ArchiveFormat::Zip);

        let mut entries = Vec::new();
        for _ in 0..2 {
            let artifact = p.package(stage(&dir, "b.DB", &data)).unwrap();
            let mut zip = ZipArchive::new(File::open(artifact.local_path()).unwrap()).unwrap();
            let mut entry = zip.by_index(0).unwrap();
            let mut out = Vec::new();
            entry.read_to_end(&mut out).unwrap();
            entries.push((entry.name().to_string(), out));
        }
        assert_eq!(entries[0], entries[1]);
        assert_eq!(entries[0].0, "b.DB");
        assert_eq!(entries[0].1, data);
    }

    #[test]
    fn tar_gz_holds_one_entry() {
        let dir = tmp("stb-pkg-tgz");
        let data = payload();
        let artifact = packager(ArchiveFormat::TarGz)
            .package(stage(&dir, "c.db", &data))
            .unwrap();
        assert_eq!(artifact.file_name(), "c.tar.gz");

        let gz = flate2::read::GzDecoder::new(File::open(artifact.local_path()).unwrap());
        let mut archive = tar::Archive::new(gz);
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut out = Vec::new();
            entry.read_to_end(&mut out).unwrap();
            seen.push((name, out));
        }
        assert_eq!(seen, vec![("c.db".to_string(), data)]);
    }

    #[test]
    fn other_suffixes_pass_through_unchanged() {
        let dir = tmp("stb-pkg-pass");
        let data = b"CREATE TABLE t (id int);\n".to_vec();
        let staged = stage(&dir, "dump.sql", &data);
        let original = staged.local_path().to_path_buf();

        let artifact = packager(ArchiveFormat::Zip).package(staged).unwrap();
        assert!(!artifact.archived());
        assert_eq!(artifact.local_path(), original.as_path());
        assert_eq!(fs::read(artifact.local_path()).unwrap(), data);
        assert_eq!(artifact.size(), data.len() as u64);
        assert_eq!(artifact.sha256().len(), 64);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[test]
    fn bare_suffix_name_is_not_archived() {
        let p = packager(ArchiveFormat::Zip);
        assert!(p.matching_suffix(".db").is_none());
        assert_eq!(p.matching_suffix("x.DB"), Some(".db"));
        assert!(p.matching_suffix("x.dbx").is_none());
    }

    #[test]
    fn archive_never_overwrites_its_source() {
        let dir = tmp("stb-pkg-same");
        let staged = stage(&dir, "logs.zip", b"PK-not-really");
        let original = staged.local_path().to_path_buf();

        let err = ArtifactPackager::new(vec![".zip".to_string()], ArchiveFormat::Zip)
            .package(staged)
            .unwrap_err();
        assert!(
            matches!(&err, Error::Packaging(msg) if msg.contains("overwrite")),
            "got {err:?}"
        );
        assert!(!original.exists());
    }

    #[test]
    fn archive_failure_cleans_up_everything() {
        let dir = tmp("stb-pkg-fail");
        // A directory squatting on the archive path makes File::create fail.
        fs::create_dir_all(dir.join("d.zip")).unwrap();
        let staged = stage(&dir, "d.db", b"data");
        let original = staged.local_path().to_path_buf();

        let err = packager(ArchiveFormat::Zip).package(staged).unwrap_err();
        assert!(matches!(err, Error::Packaging(_)));
        assert!(!original.exists());

        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["d.zip".to_string()]);
        assert!(dir.join("d.zip").is_dir());
    }

    #[test]
    fn archive_format_parses() {
        assert_eq!("ZIP".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Zip);
        assert_eq!("tgz".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);
        assert!("7z".parse::<ArchiveFormat>().is_err());
    }
}
