//! Archive codecs for the supported attachment kinds.
//!
//! Extraction is defensive against hostile archives:
//! - path traversal (`../`, absolute paths, Windows drive prefixes)
//! - symlink/hardlink/device entries
//! - resource exhaustion (file count, per-file and total bytes)
//!
//! Building walks a staging directory and writes every file and directory into
//! a single archive of the same kind, skipping the archive being written.

use std::{
    fmt,
    fs::{self, File},
    io::{Read, Seek, Write},
    path::{Component, Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tar::Archive;
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{errors::Error, Result};

/// Closed set of archive kinds the bot knows how to unpack and repack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    pub const ALL: [ArchiveKind; 3] = [ArchiveKind::Zip, ArchiveKind::Tar, ArchiveKind::TarGz];

    /// Map a declared file type (Slack `filetype`) to a kind.
    pub fn from_file_type(file_type: &str) -> Option<Self> {
        match file_type.trim().to_lowercase().as_str() {
            "zip" => Some(ArchiveKind::Zip),
            "tar" => Some(ArchiveKind::Tar),
            "gzip" | "tgz" | "tar.gz" => Some(ArchiveKind::TarGz),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::Tar => "tar",
            ArchiveKind::TarGz => "tar.gz",
        }
    }

    /// File suffix including the leading dot.
    pub fn suffix(self) -> &'static str {
        match self {
            ArchiveKind::Zip => ".zip",
            ArchiveKind::Tar => ".tar",
            ArchiveKind::TarGz => ".tar.gz",
        }
    }

    /// Conventional name of the repackaged result, also used as upload display name.
    pub fn result_file_name(self) -> String {
        format!("result{}", self.suffix())
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ExtractLimits {
    /// Maximum number of regular files extracted.
    pub max_files: usize,
    /// Maximum total bytes extracted across all regular files.
    pub max_total_bytes: u64,
    /// Maximum bytes extracted per file.
    pub max_file_bytes: u64,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_files: 5_000,
            max_total_bytes: 512 * 1024 * 1024, // 512MB
            max_file_bytes: 64 * 1024 * 1024,   // 64MB per file
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExtractReport {
    pub extracted_files: Vec<PathBuf>, // relative paths
    pub total_bytes: u64,
}

#[derive(Clone, Debug, Default)]
pub struct BuildReport {
    pub files: usize,
    pub dirs: usize,
}

/// Unpack `archive_path` into `dest_dir`, creating it if needed.
pub fn safe_extract(
    kind: ArchiveKind,
    archive_path: &Path,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport> {
    fs::create_dir_all(dest_dir)?;

    let f = File::open(archive_path)?;
    match kind {
        ArchiveKind::Zip => safe_extract_zip(f, dest_dir, limits),
        ArchiveKind::Tar => safe_extract_tar(f, dest_dir, limits),
        ArchiveKind::TarGz => safe_extract_tar(GzDecoder::new(f), dest_dir, limits),
    }
}

/// Tracks limits across the entries of one archive.
struct Budget {
    limits: ExtractLimits,
    report: ExtractReport,
}

impl Budget {
    fn new(limits: ExtractLimits) -> Self {
        Self {
            limits,
            report: ExtractReport::default(),
        }
    }

    fn admit(&self, rel: &Path, declared: u64) -> Result<()> {
        if self.report.extracted_files.len() + 1 > self.limits.max_files {
            return Err(Error::Security(format!(
                "archive exceeds max_files limit ({})",
                self.limits.max_files
            )));
        }
        if declared > self.limits.max_file_bytes {
            return Err(Error::Security(format!(
                "archive file too large: {declared} bytes (max {}) for {}",
                self.limits.max_file_bytes,
                rel.display()
            )));
        }
        if self.report.total_bytes.saturating_add(declared) > self.limits.max_total_bytes {
            return Err(Error::Security(format!(
                "archive exceeds max_total_bytes limit ({})",
                self.limits.max_total_bytes
            )));
        }
        Ok(())
    }

    /// Copy an entry to `out_path`, enforcing limits on the real byte count.
    fn copy_entry(&mut self, entry: impl Read, rel: PathBuf, out_path: &Path) -> Result<()> {
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(out_path)?;
        // Declared sizes can lie; cap the read itself.
        let mut limited = entry.take(self.limits.max_file_bytes + 1);
        let copied = std::io::copy(&mut limited, &mut out)?;
        if copied > self.limits.max_file_bytes {
            return Err(Error::Security(format!(
                "archive entry exceeds max_file_bytes while extracting: {}",
                rel.display()
            )));
        }
        let total = self.report.total_bytes + copied;
        if total > self.limits.max_total_bytes {
            return Err(Error::Security(format!(
                "archive exceeds max_total_bytes limit ({})",
                self.limits.max_total_bytes
            )));
        }

        self.report.total_bytes = total;
        self.report.extracted_files.push(rel);
        Ok(())
    }
}

fn safe_extract_zip(f: File, dest_dir: &Path, limits: ExtractLimits) -> Result<ExtractReport> {
    let mut zip = ZipArchive::new(f)?;
    let mut budget = Budget::new(limits);

    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        let name = entry.name().replace('\\', "/");
        if name.is_empty() {
            continue;
        }

        // Zip symlinks are encoded via unix mode bits.
        if let Some(mode) = entry.unix_mode() {
            if mode & 0o170000 == 0o120000 {
                return Err(Error::Security(format!(
                    "archive contains symlink entry: {name}"
                )));
            }
        }

        let rel = sanitize_rel_path(Path::new(&name))?;
        let out_path = dest_dir.join(&rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        budget.admit(&rel, entry.size())?;
        budget.copy_entry(entry, rel, &out_path)?;
    }

    Ok(budget.report)
}

fn safe_extract_tar<R: Read>(
    r: R,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport> {
    let mut archive = Archive::new(r);
    let mut budget = Budget::new(limits);

    for entry in archive.entries()? {
        let entry = entry?;
        let entry_type = entry.header().entry_type();

        if entry_type == tar::EntryType::XGlobalHeader {
            continue;
        }

        // Anything but plain files and directories is refused.
        if !entry_type.is_file() && !entry_type.is_dir() {
            let p = entry
                .path()
                .ok()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            return Err(Error::Security(format!(
                "archive contains non-file/non-dir entry: {p}"
            )));
        }

        let rel = sanitize_rel_path(&entry.path()?)?;
        let out_path = dest_dir.join(&rel);

        if entry_type.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        budget.admit(&rel, entry.header().size().unwrap_or(0))?;
        budget.copy_entry(entry, rel, &out_path)?;
    }

    Ok(budget.report)
}

fn sanitize_rel_path(p: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(os) => out.push(os),
            Component::ParentDir => {
                return Err(Error::Security(format!(
                    "archive contains path traversal: {}",
                    p.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Security(format!(
                    "archive contains absolute path: {}",
                    p.display()
                )));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(Error::Security("archive contains empty path".to_string()));
    }

    Ok(out)
}

// ============== Building ==============

struct SourceEntry {
    rel: PathBuf,
    abs: PathBuf,
    is_dir: bool,
}

impl SourceEntry {
    /// Archive member name: `/`-separated regardless of platform.
    fn name(&self) -> String {
        self.rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Package everything under `src_dir` into `out_path`.
///
/// `out_path` may live inside `src_dir`; it is never packaged into itself.
pub fn build_archive(kind: ArchiveKind, src_dir: &Path, out_path: &Path) -> Result<BuildReport> {
    let md = fs::metadata(src_dir).map_err(|e| Error::InvalidPath {
        path: src_dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !md.is_dir() {
        return Err(Error::InvalidPath {
            path: src_dir.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let entries = collect_entries(src_dir, out_path)?;
    if entries.is_empty() {
        return Err(Error::EmptyArchive(src_dir.to_path_buf()));
    }

    let report = BuildReport {
        files: entries.iter().filter(|e| !e.is_dir).count(),
        dirs: entries.iter().filter(|e| e.is_dir).count(),
    };

    let out = File::create(out_path)?;
    match kind {
        ArchiveKind::Zip => {
            write_zip(out, &entries)?;
        }
        ArchiveKind::Tar => {
            write_tar(out, &entries)?.sync_all()?;
        }
        ArchiveKind::TarGz => {
            let gz = write_tar(GzEncoder::new(out, Compression::default()), &entries)?;
            gz.finish()?.sync_all()?;
        }
    }

    Ok(report)
}

fn collect_entries(src_dir: &Path, exclude: &Path) -> Result<Vec<SourceEntry>> {
    let mut out = Vec::new();
    let mut stack = vec![src_dir.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for ent in fs::read_dir(&dir)? {
            let ent = ent?;
            let abs = ent.path();
            if abs == exclude {
                continue;
            }

            let ft = ent.file_type()?;
            if ft.is_symlink() {
                return Err(Error::Security(format!(
                    "refusing to package symlink: {}",
                    abs.display()
                )));
            }

            let rel = abs
                .strip_prefix(src_dir)
                .map_err(|_| Error::InvalidPath {
                    path: abs.clone(),
                    reason: "outside of source directory".to_string(),
                })?
                .to_path_buf();

            if ft.is_dir() {
                stack.push(abs.clone());
                out.push(SourceEntry {
                    rel,
                    abs,
                    is_dir: true,
                });
            } else if ft.is_file() {
                out.push(SourceEntry {
                    rel,
                    abs,
                    is_dir: false,
                });
            }
        }
    }

    out.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(out)
}

fn write_zip<W: Write + Seek>(w: W, entries: &[SourceEntry]) -> Result<W> {
    let mut zw = ZipWriter::new(w);

    for e in entries {
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(unix_mode(&e.abs, e.is_dir));
        if e.is_dir {
            zw.add_directory(e.name(), options)?;
            continue;
        }
        zw.start_file(e.name(), options)?;
        let mut src = File::open(&e.abs)?;
        std::io::copy(&mut src, &mut zw)?;
    }

    Ok(zw.finish()?)
}

fn write_tar<W: Write>(w: W, entries: &[SourceEntry]) -> Result<W> {
    let mut builder = tar::Builder::new(w);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for e in entries {
        if e.is_dir {
            builder.append_dir(&e.rel, &e.abs)?;
        } else {
            builder.append_path_with_name(&e.abs, &e.rel)?;
        }
    }

    Ok(builder.into_inner()?)
}

#[cfg(unix)]
fn unix_mode(path: &Path, is_dir: bool) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|md| md.permissions().mode() & 0o777)
        .unwrap_or(if is_dir { 0o755 } else { 0o644 })
}

#[cfg(not(unix))]
fn unix_mode(_path: &Path, is_dir: bool) -> u32 {
    if is_dir {
        0o755
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_zip_fixture(path: &Path, files: &[(&str, &[u8])]) {
        let f = File::create(path).unwrap();
        let mut zw = ZipWriter::new(f);
        for (name, data) in files {
            zw.start_file(*name, FileOptions::default()).unwrap();
            zw.write_all(data).unwrap();
        }
        zw.finish().unwrap();
    }

    fn read_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        for e in collect_entries(root, Path::new("")).unwrap() {
            if !e.is_dir {
                out.push((e.name(), fs::read(&e.abs).unwrap()));
            }
        }
        out
    }

    #[test]
    fn file_types_map_to_kinds() {
        assert_eq!(ArchiveKind::from_file_type("zip"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_file_type("ZIP"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_file_type("gzip"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_file_type("tar"), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::from_file_type("pdf"), None);
        assert_eq!(ArchiveKind::Zip.result_file_name(), "result.zip");
        assert_eq!(ArchiveKind::TarGz.result_file_name(), "result.tar.gz");
    }

    #[test]
    fn zip_blocks_path_traversal() {
        let base = TempDir::new().unwrap();
        let zip_path = base.path().join("a.zip");
        let out_dir = base.path().join("stage").join("out");
        write_zip_fixture(&zip_path, &[("../../etc/passwd", b"root:x:0:0")]);

        let err = safe_extract(ArchiveKind::Zip, &zip_path, &out_dir, ExtractLimits::default())
            .unwrap_err();
        assert!(matches!(err, Error::Security(_)));
        assert!(!base.path().join("etc").exists());
        assert!(fs::read_dir(&out_dir).unwrap().next().is_none());
    }

    #[test]
    fn zip_blocks_absolute_path() {
        let base = TempDir::new().unwrap();
        let zip_path = base.path().join("a.zip");
        write_zip_fixture(&zip_path, &[("/etc/evil", b"x")]);

        let err = safe_extract(
            ArchiveKind::Zip,
            &zip_path,
            &base.path().join("out"),
            ExtractLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn zip_blocks_symlink_entries() {
        let base = TempDir::new().unwrap();
        let zip_path = base.path().join("a.zip");
        let f = File::create(&zip_path).unwrap();
        let mut zw = ZipWriter::new(f);
        zw.add_symlink("link", "/etc/passwd", FileOptions::default())
            .unwrap();
        zw.finish().unwrap();

        let err = safe_extract(
            ArchiveKind::Zip,
            &zip_path,
            &base.path().join("out"),
            ExtractLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn malformed_zip_is_a_zip_error() {
        let base = TempDir::new().unwrap();
        let zip_path = base.path().join("a.zip");
        fs::write(&zip_path, b"definitely not a zip").unwrap();

        let err = safe_extract(
            ArchiveKind::Zip,
            &zip_path,
            &base.path().join("out"),
            ExtractLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Zip(_)));
    }

    #[test]
    fn tar_blocks_path_traversal() {
        let base = TempDir::new().unwrap();
        let tar_path = base.path().join("a.tar");
        fs::write(&tar_path, raw_tar_bytes("../evil.txt", b"x")).unwrap();

        let err = safe_extract(
            ArchiveKind::Tar,
            &tar_path,
            &base.path().join("out"),
            ExtractLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Security(_)));
        assert!(!base.path().join("evil.txt").exists());
    }

    #[test]
    fn tar_gz_blocks_path_traversal() {
        let base = TempDir::new().unwrap();
        let tgz_path = base.path().join("a.tar.gz");
        let f = File::create(&tgz_path).unwrap();
        let mut enc = GzEncoder::new(f, Compression::default());
        enc.write_all(&raw_tar_bytes("../evil.txt", b"x")).unwrap();
        enc.finish().unwrap();

        let err = safe_extract(
            ArchiveKind::TarGz,
            &tgz_path,
            &base.path().join("out"),
            ExtractLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn enforces_per_file_size_limit() {
        let base = TempDir::new().unwrap();
        let zip_path = base.path().join("a.zip");
        write_zip_fixture(&zip_path, &[("big.txt", b"hello")]);

        let limits = ExtractLimits {
            max_files: 10,
            max_total_bytes: 100,
            max_file_bytes: 4,
        };
        let out = base.path().join("out");
        let err = safe_extract(ArchiveKind::Zip, &zip_path, &out, limits).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn enforces_total_size_and_count_limits() {
        let base = TempDir::new().unwrap();
        let zip_path = base.path().join("a.zip");
        write_zip_fixture(&zip_path, &[("a.txt", b"hello"), ("b.txt", b"world")]);

        let total = ExtractLimits {
            max_files: 10,
            max_total_bytes: 9,
            max_file_bytes: 10,
        };
        let err =
            safe_extract(ArchiveKind::Zip, &zip_path, &base.path().join("t"), total).unwrap_err();
        assert!(matches!(err, Error::Security(_)));

        let count = ExtractLimits {
            max_files: 1,
            max_total_bytes: 100,
            max_file_bytes: 10,
        };
        let err =
            safe_extract(ArchiveKind::Zip, &zip_path, &base.path().join("c"), count).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn zip_extract_then_build_preserves_paths_and_contents() {
        let base = TempDir::new().unwrap();
        let zip_path = base.path().join("in.zip");
        write_zip_fixture(&zip_path, &[("a.txt", b"alpha"), ("b/c.txt", b"gamma")]);

        let stage = base.path().join("stage");
        let report =
            safe_extract(ArchiveKind::Zip, &zip_path, &stage, ExtractLimits::default()).unwrap();
        assert_eq!(report.extracted_files.len(), 2);
        assert_eq!(report.total_bytes, 10);

        let out = stage.join("result.zip");
        let built = build_archive(ArchiveKind::Zip, &stage, &out).unwrap();
        assert_eq!(built.files, 2);
        assert_eq!(built.dirs, 1);

        let again = base.path().join("again");
        safe_extract(ArchiveKind::Zip, &out, &again, ExtractLimits::default()).unwrap();
        assert_eq!(
            read_tree(&again),
            vec![
                ("a.txt".to_string(), b"alpha".to_vec()),
                ("b/c.txt".to_string(), b"gamma".to_vec()),
            ]
        );
    }

    #[test]
    fn tar_gz_build_then_extract_preserves_paths_and_contents() {
        let base = TempDir::new().unwrap();
        let src = base.path().join("src");
        fs::create_dir_all(src.join("b")).unwrap();
        fs::write(src.join("a.txt"), b"alpha").unwrap();
        fs::write(src.join("b").join("c.txt"), b"gamma").unwrap();

        let out = base.path().join("result.tar.gz");
        build_archive(ArchiveKind::TarGz, &src, &out).unwrap();

        let again = base.path().join("again");
        let report =
            safe_extract(ArchiveKind::TarGz, &out, &again, ExtractLimits::default()).unwrap();
        assert_eq!(report.extracted_files.len(), 2);
        assert_eq!(
            read_tree(&again),
            vec![
                ("a.txt".to_string(), b"alpha".to_vec()),
                ("b/c.txt".to_string(), b"gamma".to_vec()),
            ]
        );
    }

    #[test]
    fn build_skips_output_inside_source() {
        let base = TempDir::new().unwrap();
        fs::write(base.path().join("index.html"), b"<html/>").unwrap();
        let out = base.path().join("result.zip");
        // Stale result from an earlier attempt must not be packaged.
        fs::write(&out, b"stale").unwrap();

        let report = build_archive(ArchiveKind::Zip, base.path(), &out).unwrap();
        assert_eq!(report.files, 1);

        let mut zip = ZipArchive::new(File::open(&out).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        assert_eq!(zip.by_index(0).unwrap().name(), "index.html");
    }

    #[test]
    fn build_rejects_empty_and_missing_dirs() {
        let base = TempDir::new().unwrap();
        let empty = base.path().join("empty");
        fs::create_dir_all(&empty).unwrap();

        let err = build_archive(ArchiveKind::Zip, &empty, &empty.join("result.zip")).unwrap_err();
        assert!(matches!(err, Error::EmptyArchive(_)));

        let missing = base.path().join("missing");
        let err =
            build_archive(ArchiveKind::Zip, &missing, &base.path().join("r.zip")).unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));
    }

    // tar::Builder refuses `..` paths, so hostile fixtures are assembled by hand.
    fn raw_tar_bytes(name: &str, data: &[u8]) -> Vec<u8> {
        let mut header = [0u8; 512];

        let name_bytes = name.as_bytes();
        let n = name_bytes.len().min(100);
        header[0..n].copy_from_slice(&name_bytes[0..n]);

        octal_field(&mut header[100..108], 0o644);
        octal_field(&mut header[108..116], 0);
        octal_field(&mut header[116..124], 0);
        octal_field(&mut header[124..136], data.len() as u64);
        octal_field(&mut header[136..148], 0);
        header[148..156].fill(b' ');
        header[156] = b'0';
        header[257..263].copy_from_slice(b"ustar\0");
        header[263..265].copy_from_slice(b"00");

        let sum: u32 = header.iter().map(|b| *b as u32).sum();
        let cksum = format!("{sum:06o}\0 ");
        header[148..156].copy_from_slice(cksum.as_bytes());

        let mut out = header.to_vec();
        out.extend_from_slice(data);
        let pad = (512 - (data.len() % 512)) % 512;
        out.resize(out.len() + pad + 1024, 0);
        out
    }

    fn octal_field(dst: &mut [u8], val: u64) {
        let width = dst.len() - 1;
        let s = format!("{val:0width$o}\0");
        dst.copy_from_slice(s.as_bytes());
    }
}
