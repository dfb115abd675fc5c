//! Files a job leaves behind besides its extracted documents: the
//! liveness marker, the stats report, the source backup and quarantined
//! copies.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use uuid::Uuid;

use crate::context::BurstingContext;
use crate::error::BurstError;
use crate::variables;

// ═══════════════════════════════════════════════════════════
// Job marker
// ═══════════════════════════════════════════════════════════

/// `<temp>/<uuid>.job`, present while the job runs.
///
/// External supervisors read its absence as "job ended". Removed on drop,
/// so every exit path clears it.
#[derive(Debug)]
pub struct JobMarker {
    path: PathBuf,
}

impl JobMarker {
    pub fn create(temp_dir: &Path, source: &Path) -> Result<Self, BurstError> {
        std::fs::create_dir_all(temp_dir).map_err(|e| BurstError::resource(temp_dir, e))?;
        let path = temp_dir.join(format!("{}.job", Uuid::new_v4()));
        let body = format!(
            "source={}\npid={}\nstarted={}\n",
            source.display(),
            std::process::id(),
            Local::now().to_rfc3339()
        );
        std::fs::write(&path, body).map_err(|e| BurstError::resource(&path, e))?;
        tracing::debug!(path = %path.display(), "Job marker created");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobMarker {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove job marker");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════════════════════

/// `1h 2m 3s`, `2m 5s`, `850ms`.
pub fn human_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs == 0 {
        return format!("{}ms", elapsed.as_millis());
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m {s}s"),
        _ => format!("{h}h {m}m {s}s"),
    }
}

/// Human-readable job summary. Counters must already be published.
pub fn stats_report(ctx: &BurstingContext, elapsed: Duration) -> String {
    let vars = &ctx.variables;
    let value = |name: &str| vars.get(name).unwrap_or("0").to_string();
    let c = ctx.counters;

    let mut out = String::new();
    let _ = writeln!(out, "Input Document = '{}'", ctx.source_path.display());
    let _ = writeln!(out, "Execution Time = {}", human_duration(elapsed));
    let _ = writeln!(out);
    if ctx.num_pages > 0 {
        let _ = writeln!(out, "Number Of Pages = {}", value(variables::NUM_PAGES));
    }
    let _ = writeln!(out, "Number Of Tokens Read = {}", value(variables::NUM_TOKENS));
    let _ = writeln!(out, "Number Of Documents Extracted = {}", value(variables::NUM_FILES_EXTRACTED));
    let _ = writeln!(out, "Number Of Messages Sent = {}", value(variables::NUM_MESSAGES_SENT));
    let _ = writeln!(out, "Number Of Documents Distributed = {}", value(variables::NUM_FILES_DISTRIBUTED));
    if c.skipped > 0 {
        let _ = writeln!(
            out,
            "Number Of Documents Skipped = {}",
            value(variables::NUM_FILES_SKIPPED_DISTRIBUTION)
        );
    }
    if c.quarantined > 0 {
        let _ = writeln!(out, "Number Of Documents Quarantined = {}", value(variables::NUM_FILES_QUARANTINED));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Output Folder = '{}'", ctx.output_folder.display());
    if c.quarantined > 0 {
        let _ = writeln!(out, "Quarantine Folder = '{}'", ctx.quarantine_folder.display());
    }
    let _ = writeln!(out);
    let flags = ctx.settings.send_files;
    let _ = writeln!(out, "sendfiles.email = {}", flags.email);
    let _ = writeln!(out, "sendfiles.upload = {}", flags.upload);
    let _ = writeln!(out, "sendfiles.web = {}", flags.web);
    let _ = writeln!(out, "sendfiles.sms = {}", flags.sms);
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "failjobifanydistributionfails = {}",
        ctx.settings.fail_job_if_any_distribution_fails
    );
    out
}

/// Publish the counters and write the stats file into the logs-archives
/// folder.
pub fn write_stats(ctx: &mut BurstingContext, elapsed: Duration) -> Result<PathBuf, BurstError> {
    ctx.publish_counters();
    let report = stats_report(ctx, elapsed);
    let name = ctx.resolve(&ctx.settings.stats_file_name);
    let folder = ctx.logs_archives_folder.clone();
    std::fs::create_dir_all(&folder).map_err(|e| BurstError::resource(&folder, e))?;
    let path = folder.join(name.trim());
    std::fs::write(&path, &report).map_err(|e| BurstError::resource(&path, e))?;
    tracing::info!(
        path = %path.display(),
        extracted = ctx.counters.extracted,
        distributed = ctx.counters.distributed,
        skipped = ctx.counters.skipped,
        quarantined = ctx.counters.quarantined,
        "Job stats written"
    );
    Ok(path)
}

// ═══════════════════════════════════════════════════════════
// Backup and quarantine
// ═══════════════════════════════════════════════════════════

fn copy_into(folder: &Path, file: &Path) -> Result<PathBuf, BurstError> {
    std::fs::create_dir_all(folder).map_err(|e| BurstError::resource(folder, e))?;
    let name = file
        .file_name()
        .ok_or_else(|| BurstError::resource(file, "path has no file name"))?;
    let target = folder.join(name);
    std::fs::copy(file, &target).map_err(|e| BurstError::resource(file, e))?;
    Ok(target)
}

/// Copy the source document into the backup folder once per job.
/// Nothing is kept when the job deletes its files.
pub fn backup_source(ctx: &BurstingContext) -> Result<Option<PathBuf>, BurstError> {
    if ctx.settings.delete_files {
        return Ok(None);
    }
    if let Some(name) = ctx.source_path.file_name() {
        let existing = ctx.backup_folder.join(name);
        if existing.exists() {
            return Ok(Some(existing));
        }
    }
    let target = copy_into(&ctx.backup_folder, &ctx.source_path)?;
    tracing::debug!(path = %target.display(), "Input document backed up");
    Ok(Some(target))
}

/// Copy the current token's extracted document into the quarantine folder.
/// Returns `None` when no document was extracted.
pub fn quarantine_document(ctx: &BurstingContext) -> Result<Option<PathBuf>, BurstError> {
    let Some(extracted) = ctx.extracted_file_path.as_ref().filter(|p| p.is_file()) else {
        return Ok(None);
    };
    let target = copy_into(&ctx.quarantine_folder, extracted)?;
    tracing::warn!(token = %ctx.token, path = %target.display(), "Document quarantined");
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn ctx(dir: &Path) -> BurstingContext {
        let source = dir.join("Invoices.pdf");
        std::fs::write(&source, b"%PDF-1.4").unwrap();
        let mut ctx = BurstingContext::new(source, Settings::default(), dir.join("temp"));
        ctx.backup_folder = dir.join("backup");
        ctx.quarantine_folder = dir.join("quarantine");
        ctx.logs_archives_folder = dir.join("logs");
        ctx.output_folder = dir.join("out");
        ctx
    }

    #[test]
    fn marker_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let marker = JobMarker::create(&dir.path().join("temp"), Path::new("a.pdf")).unwrap();
        let path = marker.path().to_path_buf();
        assert!(std::fs::read_to_string(&path).unwrap().contains("source=a.pdf"));
        drop(marker);
        assert!(!path.exists());
    }

    #[test]
    fn durations_read_naturally() {
        assert_eq!(human_duration(Duration::from_millis(850)), "850ms");
        assert_eq!(human_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(human_duration(Duration::from_secs(3723)), "1h 2m 3s");
    }

    #[test]
    fn stats_file_named_from_counters() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path());
        ctx.num_pages = 3;
        ctx.tokens = vec!["a".into(), "b".into(), "c".into()];
        ctx.counters.extracted = 3;
        ctx.counters.distributed = 2;
        ctx.counters.quarantined = 1;
        let path = write_stats(&mut ctx, Duration::from_secs(1)).unwrap();
        assert_eq!(path, dir.path().join("logs").join("_stats-3pages-3extracted-2distributed.log"));
        let report = std::fs::read_to_string(path).unwrap();
        assert!(report.contains("Number Of Documents Quarantined = 1"));
        assert!(!report.contains("Skipped"));
    }

    #[test]
    fn backup_copies_source_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let target = backup_source(&ctx).unwrap().unwrap();
        assert!(target.exists());
        assert_eq!(backup_source(&ctx).unwrap(), Some(target));
    }

    #[test]
    fn backup_skipped_when_deleting_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path());
        ctx.settings.delete_files = true;
        assert!(backup_source(&ctx).unwrap().is_none());
        assert!(!dir.path().join("backup").exists());
    }

    #[test]
    fn quarantine_needs_an_extracted_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path());
        assert!(quarantine_document(&ctx).unwrap().is_none());
        let doc = dir.path().join("out").join("alpha.pdf");
        std::fs::create_dir_all(doc.parent().unwrap()).unwrap();
        std::fs::write(&doc, b"%PDF").unwrap();
        ctx.extracted_file_path = Some(doc);
        let copy = quarantine_document(&ctx).unwrap().unwrap();
        assert_eq!(copy, dir.path().join("quarantine").join("alpha.pdf"));
    }
}
