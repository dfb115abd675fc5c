//! Zip bundling of a token's attachments.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::SendError;

/// Write `files` into a new zip at `destination`, flat, in order.
///
/// Entries with the same file name get a numeric suffix.
pub fn zip_files(files: &[PathBuf], destination: &Path) -> Result<(), SendError> {
    let fail = |e: &dyn std::fmt::Display| SendError::Archive(format!("{}: {e}", destination.display()));
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|e| fail(&e))?;
    }
    let file = File::create(destination).map_err(|e| fail(&e))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut used = HashSet::new();
    for path in files {
        let data = std::fs::read(path).map_err(|_| SendError::MissingAttachment { path: path.clone() })?;
        let name = entry_name(path, &mut used);
        writer.start_file(name.as_str(), options).map_err(|e| fail(&e))?;
        writer.write_all(&data).map_err(|e| fail(&e))?;
    }
    writer.finish().map_err(|e| fail(&e))?;
    tracing::debug!(archive = %destination.display(), files = files.len(), "Attachments archived");
    Ok(())
}

fn entry_name(path: &Path, used: &mut HashSet<String>) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".into());
    if used.insert(name.clone()) {
        return name;
    }
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();
    let mut n = 1;
    loop {
        let candidate = format!("{stem}-{n}{ext}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use zip::ZipArchive;

    #[test]
    fn archive_contains_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("sub").join("a.pdf");
        std::fs::create_dir_all(b.parent().unwrap()).unwrap();
        std::fs::write(&a, b"first").unwrap();
        std::fs::write(&b, b"second").unwrap();
        let dest = dir.path().join("out").join("bundle.zip");
        zip_files(&[a, b], &dest).unwrap();

        let mut archive = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut second = String::new();
        archive.by_name("a-1.pdf").unwrap().read_to_string(&mut second).unwrap();
        assert_eq!(second, "second");
    }

    #[test]
    fn missing_file_is_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let err = zip_files(&[dir.path().join("nope.txt")], &dir.path().join("x.zip")).unwrap_err();
        assert!(matches!(err, SendError::MissingAttachment { .. }));
    }
}
