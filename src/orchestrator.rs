//! Bursting job lifecycle.
//!
//! ```text
//! Init → ParseMetadata → per token { Extract → Distribute | Skip | Quarantine } → Stats → Done
//! ```
//!
//! Any stage may end the job with a [`BurstError`]. Closing the source,
//! the backup, the end hook, the stats file and the job marker are handled
//! on every exit path.
//!
//! Collaborators (settings loader, lifecycle hook, license gate, channels)
//! are injected so the whole lifecycle runs against mocks in tests.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Local;

use crate::artifacts::{self, JobMarker};
use crate::burst::{open_burster, run_hook, Burster, ParsedMetadata};
use crate::context::{BurstingContext, Counters};
use crate::distribution::{prepare_attachments, Distributor, SendError};
use crate::error::BurstError;
use crate::hooks::{HookStage, LifecycleHook, NoopHook};
use crate::license::{LicenseGate, Unlimited};
use crate::progress::{JobProgress, ProgressStore};
use crate::settings::{JsonSettingsLoader, Settings, SettingsLoader};
use crate::variables;

const JOB_TYPE: &str = "burst";

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Quality-assurance flags of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestOptions {
    /// Process every token without transmitting.
    pub test_all: bool,
    /// Comma-separated tokens to process without transmitting.
    pub test_tokens: String,
    /// Process a random sample of this many tokens without transmitting.
    pub random_tokens: usize,
}

impl TestOptions {
    pub fn is_qa(&self) -> bool {
        self.test_all || !self.test_tokens.trim().is_empty() || self.random_tokens > 0
    }
}

/// Summary of a finished job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    /// Every token discovered in the source, in discovery order.
    pub tokens: Vec<String>,
    pub num_pages: usize,
    pub counters: Counters,
    /// Extracted documents, in processing order.
    pub documents: Vec<PathBuf>,
    pub stats_file: Option<PathBuf>,
}

/// A checkpoint being resumed and the file it came from.
struct Resume {
    progress: JobProgress,
    path: PathBuf,
}

enum Flow {
    Completed,
    /// The source names another configuration; rerun under it.
    Restart(String),
}

// ═══════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════

pub struct BurstEngine {
    temp_dir: PathBuf,
    loader: Box<dyn SettingsLoader>,
    hook: Box<dyn LifecycleHook>,
    license: Box<dyn LicenseGate>,
    distributor: Distributor,
}

impl BurstEngine {
    /// Engine with JSON settings, no hooks, no license ceiling and every
    /// built-in channel.
    pub fn new(temp_dir: PathBuf) -> Self {
        Self {
            temp_dir,
            loader: Box::new(JsonSettingsLoader),
            hook: Box::new(NoopHook),
            license: Box::new(Unlimited),
            distributor: Distributor::standard(),
        }
    }

    pub fn with_loader(mut self, loader: impl SettingsLoader + 'static) -> Self {
        self.loader = Box::new(loader);
        self
    }

    pub fn with_hook(mut self, hook: impl LifecycleHook + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    pub fn with_license(mut self, license: impl LicenseGate + 'static) -> Self {
        self.license = Box::new(license);
        self
    }

    pub fn with_distributor(mut self, distributor: Distributor) -> Self {
        self.distributor = distributor;
        self
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Checkpoint location for a source document.
    pub fn progress_store(&self, source: &Path) -> ProgressStore {
        ProgressStore::for_source(&self.temp_dir, source)
    }

    /// Burst `source` under `settings`.
    pub fn burst(
        &self,
        source: &Path,
        settings: Settings,
        options: &TestOptions,
    ) -> Result<JobOutcome, BurstError> {
        self.run(source, settings, options, None)
    }

    /// Continue an interrupted job from its checkpoint file.
    ///
    /// Settings come from the checkpoint's configuration path and the
    /// original test flags are reapplied. The checkpoint is deleted once
    /// it has been validated against the source.
    pub fn resume(&self, checkpoint: &Path) -> Result<JobOutcome, BurstError> {
        let progress = ProgressStore::new(checkpoint.to_path_buf())
            .load()?
            .ok_or_else(|| {
                BurstError::Input(format!("no checkpoint found at '{}'", checkpoint.display()))
            })?;
        let settings = if progress.config_path.trim().is_empty() {
            Settings::default()
        } else {
            self.loader.load(Path::new(&progress.config_path))?
        };
        let options = TestOptions {
            test_all: progress.test_all,
            test_tokens: progress.test_tokens.clone(),
            random_tokens: progress.random_test_count,
        };
        let source = PathBuf::from(&progress.source_path);
        tracing::info!(
            source = %source.display(),
            remaining = progress.remaining_tokens.len(),
            "Resuming job"
        );
        let resume = Resume {
            progress,
            path: checkpoint.to_path_buf(),
        };
        self.run(&source, settings, &options, Some(&resume))
    }

    /// Run a job, restarting once when the source names its own
    /// configuration.
    fn run(
        &self,
        source: &Path,
        settings: Settings,
        options: &TestOptions,
        resume: Option<&Resume>,
    ) -> Result<JobOutcome, BurstError> {
        match self.run_once(source, settings, options, resume, true)? {
            (Flow::Completed, outcome) => Ok(outcome),
            (Flow::Restart(config), _) => {
                let settings = self.loader.load(Path::new(&config))?;
                tracing::info!(config = %config, "Restarting job under the document's configuration");
                let (_, outcome) = self.run_once(source, settings, options, resume, false)?;
                Ok(outcome)
            }
        }
    }

    fn run_once(
        &self,
        source: &Path,
        settings: Settings,
        options: &TestOptions,
        resume: Option<&Resume>,
        allow_restart: bool,
    ) -> Result<(Flow, JobOutcome), BurstError> {
        let started = Instant::now();
        let _marker = JobMarker::create(&self.temp_dir, source)?;

        let mut ctx = BurstingContext::new(source.to_path_buf(), settings, self.temp_dir.clone());
        ctx.is_qa_mode = options.is_qa();
        if ctx.is_qa_mode {
            ctx.settings.fail_job_if_any_distribution_fails = false;
        }
        resolve_job_folders(&mut ctx);
        tracing::info!(
            source = %source.display(),
            config = %ctx.config_path,
            qa = ctx.is_qa_mode,
            "Bursting started"
        );

        run_hook(self.hook.as_ref(), HookStage::StartBursting, &mut ctx)?;
        let mut burster = open_burster(source, &ctx.settings, &self.temp_dir)?;
        ctx.variables
            .set(variables::OUTPUT_TYPE_EXTENSION, burster.output_extension());

        let mut outcome = JobOutcome::default();
        let result = self.process(&mut ctx, burster.as_mut(), options, resume, allow_restart, &mut outcome);
        burster.close();

        if let Ok(Flow::Restart(_)) = result {
            return result.map(|flow| (flow, outcome));
        }
        outcome.stats_file = self.finish(&mut ctx, started);
        outcome.counters = ctx.counters;
        outcome.num_pages = ctx.num_pages;
        match &result {
            Ok(_) => tracing::info!(
                source = %source.display(),
                extracted = ctx.counters.extracted,
                distributed = ctx.counters.distributed,
                skipped = ctx.counters.skipped,
                quarantined = ctx.counters.quarantined,
                elapsed = %artifacts::human_duration(started.elapsed()),
                "Bursting finished"
            ),
            Err(e) => tracing::error!(source = %source.display(), error = %e, "Bursting failed"),
        }
        result.map(|flow| (flow, outcome))
    }

    fn process(
        &self,
        ctx: &mut BurstingContext,
        burster: &mut dyn Burster,
        options: &TestOptions,
        resume: Option<&Resume>,
        allow_restart: bool,
        outcome: &mut JobOutcome,
    ) -> Result<Flow, BurstError> {
        let meta = burster.parse(ctx, self.hook.as_ref())?;
        if let Some(config) = meta.custom_config.clone() {
            if allow_restart {
                return Ok(Flow::Restart(config));
            }
            tracing::warn!(config = %config, "Configuration named by the document was already applied once");
        }

        ctx.tokens = meta.tokens.clone();
        ctx.num_pages = meta.num_pages;
        outcome.tokens = meta.tokens.clone();
        tracing::info!(tokens = meta.tokens.len(), pages = meta.num_pages, "Metadata parsed");

        let selected = match resume {
            Some(resume) => {
                resume.progress.validate_for(&ctx.source_path, &meta.tokens)?;
                meta.tokens
                    .iter()
                    .filter(|t| resume.progress.is_remaining(t))
                    .cloned()
                    .collect()
            }
            None => select_tokens(&meta.tokens, options)?,
        };
        self.license.check_limit(selected.len())?;
        if let Some(resume) = resume {
            ctx.counters = resume.progress.counters;
            ProgressStore::new(resume.path.clone()).clear();
        }

        let checkpointing = !ctx.settings.is_second_pass();
        let store = self.progress_store(&ctx.source_path);

        for (position, token) in selected.iter().enumerate() {
            let snapshot = ctx.settings.clone();
            let counters_before = ctx.counters;
            let index = meta.tokens.iter().position(|t| t == token).unwrap_or(position);

            if let Err(error) = self.process_token(ctx, burster, &meta, token, index, outcome) {
                ctx.last_error = Some(error.to_string());
                if let Err(e) = run_hook(self.hook.as_ref(), HookStage::DistributionErrorHandling, ctx) {
                    tracing::warn!(token = %token, error = %e, "Error handling hook failed");
                }
                if snapshot.fail_job_if_any_distribution_fails {
                    ctx.settings = snapshot;
                    if checkpointing {
                        let progress = checkpoint(ctx, options, &selected, position, counters_before);
                        store.save(&progress)?;
                        tracing::warn!(
                            token = %token,
                            remaining = progress.remaining_tokens.len(),
                            checkpoint = %store.path().display(),
                            "Job stopped, progress saved"
                        );
                    }
                    return Err(error);
                }
                self.quarantine(ctx, &error)?;
            }

            ctx.settings = snapshot;
            if checkpointing {
                store.save(&checkpoint(ctx, options, &selected, position + 1, ctx.counters))?;
            }
        }

        ctx.token.clear();
        if checkpointing {
            store.clear();
        }
        Ok(Flow::Completed)
    }

    /// Extract one token's document and hand it to the channels.
    fn process_token(
        &self,
        ctx: &mut BurstingContext,
        burster: &mut dyn Burster,
        meta: &ParsedMetadata,
        token: &str,
        index: usize,
        outcome: &mut JobOutcome,
    ) -> Result<(), BurstError> {
        let hook = self.hook.as_ref();
        ctx.reset_token_state();
        ctx.token = token.to_string();
        ctx.variables.set(variables::BURST_INDEX, (index + 1).to_string());
        resolve_token_folders(ctx);

        run_hook(hook, HookStage::StartExtractDocument, ctx)?;
        let file_name = ctx.resolve_path(&ctx.settings.burst_file_name);
        let destination = ctx.output_folder.join(file_name.trim());
        burster.extract(token, meta.fragments_for(token), &destination)?;

        ctx.counters.extracted += 1;
        ctx.extracted_file_path = Some(destination.clone());
        ctx.variables
            .set(variables::EXTRACTED_FILE_PATH, destination.to_string_lossy());
        outcome.documents.push(destination.clone());
        tracing::info!(token, path = %destination.display(), "Document extracted");

        ctx.skip_current_file_distribution = ctx.variables.skip_requested(token);
        run_hook(hook, HookStage::EndExtractDocument, ctx)?;

        if ctx.settings.split_2nd_time && !ctx.settings.is_second_pass() {
            self.split_second_time(ctx, &destination)?;
        }

        if ctx.skip_current_file_distribution || !self.distributor.any_enabled(&ctx.settings) {
            ctx.counters.skipped += 1;
            tracing::info!(
                token,
                requested = ctx.skip_current_file_distribution,
                "Distribution skipped"
            );
            return Ok(());
        }

        let delay = ctx.settings.delay_each_distribution_by;
        if delay > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(delay));
        }
        prepare_attachments(ctx).map_err(|e| distribution_error(token, e))?;
        let sent = self
            .distributor
            .distribute(ctx, !ctx.is_qa_mode)
            .map_err(|e| distribution_error(token, e))?;
        ctx.counters.distributed += 1;
        ctx.counters.messages_sent += sent;
        tracing::info!(token, messages = sent, qa = ctx.is_qa_mode, "Document distributed");

        if let Err(e) = run_hook(hook, HookStage::DistributedBy, ctx) {
            tracing::warn!(token, error = %e, "Distributed-by hook failed");
        }
        if ctx.settings.delete_files {
            delete_outputs(ctx);
        }
        Ok(())
    }

    /// Burst the token's document again with the second delimiter pair.
    /// The nested run writes into a folder named after the document.
    fn split_second_time(&self, ctx: &mut BurstingContext, document: &Path) -> Result<(), BurstError> {
        let folder = document.with_extension("");
        let nested = ctx.settings.for_second_pass(&folder);
        let (_, outcome) = self
            .run_once(document, nested, &TestOptions::default(), None, false)
            .map_err(|e| BurstError::extraction(&ctx.token, format!("second split failed: {e}")))?;
        let joined = outcome
            .documents
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",");
        ctx.variables
            .set(variables::EXTRACTED_FILE_PATHS_AFTER_SPLITTING_2ND_TIME, joined);
        tracing::info!(token = %ctx.token, documents = outcome.documents.len(), "Document split a second time");
        ctx.extracted_file_paths_after_splitting_2nd_time = outcome.documents;
        Ok(())
    }

    /// Count the failed token as quarantined and keep a copy of its
    /// document when quarantining is on.
    fn quarantine(&self, ctx: &mut BurstingContext, error: &BurstError) -> Result<(), BurstError> {
        tracing::warn!(token = %ctx.token, error = %error, "Token failed, continuing");
        if ctx.extracted_file_path.is_none() {
            // Never extracted; it still counts as one document of the job.
            ctx.counters.extracted += 1;
        }
        ctx.counters.quarantined += 1;
        if ctx.settings.quarantine_files && artifacts::quarantine_document(ctx)?.is_some() {
            if let Err(e) = run_hook(self.hook.as_ref(), HookStage::QuarantineDocument, ctx) {
                tracing::warn!(token = %ctx.token, error = %e, "Quarantine hook failed");
            }
        }
        Ok(())
    }

    /// End-of-job steps. Failures here are logged; they never replace the
    /// job's own result.
    fn finish(&self, ctx: &mut BurstingContext, started: Instant) -> Option<PathBuf> {
        let second_pass = ctx.settings.is_second_pass();
        if !second_pass {
            if let Err(e) = artifacts::backup_source(ctx) {
                tracing::warn!(error = %e, "Backup failed");
            }
        }
        ctx.publish_counters();
        if let Err(e) = run_hook(self.hook.as_ref(), HookStage::EndBursting, ctx) {
            tracing::warn!(error = %e, "End hook failed");
        }
        if second_pass {
            return None;
        }
        match artifacts::write_stats(ctx, started.elapsed()) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "Stats file not written");
                None
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════

fn distribution_error(token: &str, source: SendError) -> BurstError {
    BurstError::Distribution {
        token: token.to_string(),
        source,
    }
}

fn resolve_folder(ctx: &mut BurstingContext, template: &str, variable: &str) -> PathBuf {
    let resolved = ctx.resolve_path(template);
    ctx.variables.set(variable, resolved.clone());
    PathBuf::from(resolved.trim())
}

/// Job-wide folders. Output and quarantine folders are resolved again for
/// every token.
fn resolve_job_folders(ctx: &mut BurstingContext) {
    let settings = ctx.settings.clone();
    ctx.output_folder = resolve_folder(ctx, &settings.output_folder, variables::OUTPUT_FOLDER);
    ctx.backup_folder = resolve_folder(ctx, &settings.backup_folder, variables::BACKUP_FOLDER);
    ctx.quarantine_folder = resolve_folder(ctx, &settings.quarantine_folder, variables::QUARANTINE_FOLDER);
    ctx.logs_archives_folder = PathBuf::from(ctx.resolve(&settings.logs_archives_folder).trim());
}

fn resolve_token_folders(ctx: &mut BurstingContext) {
    let output = ctx.settings.output_folder.clone();
    let quarantine = ctx.settings.quarantine_folder.clone();
    ctx.output_folder = resolve_folder(ctx, &output, variables::OUTPUT_FOLDER);
    ctx.quarantine_folder = resolve_folder(ctx, &quarantine, variables::QUARANTINE_FOLDER);
}

/// Tokens a run processes: all of them, an explicit subset or a random
/// sample. Selections keep discovery order.
fn select_tokens(tokens: &[String], options: &TestOptions) -> Result<Vec<String>, BurstError> {
    if !options.test_tokens.trim().is_empty() {
        let requested: Vec<&str> = options
            .test_tokens
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if let Some(unknown) = requested.iter().find(|t| !tokens.iter().any(|k| k == *t)) {
            return Err(BurstError::Configuration(format!(
                "test token '{unknown}' was not found in the input document"
            )));
        }
        return Ok(tokens
            .iter()
            .filter(|t| requested.contains(&t.as_str()))
            .cloned()
            .collect());
    }
    if options.random_tokens > 0 && options.random_tokens < tokens.len() {
        let mut picked =
            rand::seq::index::sample(&mut rand::thread_rng(), tokens.len(), options.random_tokens)
                .into_vec();
        picked.sort_unstable();
        return Ok(picked.into_iter().map(|i| tokens[i].clone()).collect());
    }
    Ok(tokens.to_vec())
}

/// Checkpoint listing `selected[next..]` as the work still to do.
fn checkpoint(
    ctx: &BurstingContext,
    options: &TestOptions,
    selected: &[String],
    next: usize,
    counters: Counters,
) -> JobProgress {
    let remaining: Vec<String> = selected.get(next..).unwrap_or(&[]).to_vec();
    let last = next.checked_sub(1).and_then(|i| selected.get(i)).cloned();
    let index_of_last = last
        .as_ref()
        .and_then(|t| ctx.tokens.iter().position(|k| k == t));
    JobProgress {
        job_type: JOB_TYPE.into(),
        source_path: ctx.source_path.to_string_lossy().into_owned(),
        config_path: ctx.config_path.clone(),
        number_of_remaining_tokens: remaining.len(),
        remaining_tokens: remaining,
        test_all: options.test_all,
        test_tokens: options.test_tokens.clone(),
        random_test_count: options.random_tokens,
        counters,
        current_date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        last_token_processed: last,
        last_token_in_document: ctx.tokens.last().cloned(),
        tokens_count: ctx.tokens.len(),
        pages_count: ctx.num_pages,
        index_of_last_token_processed: index_of_last,
    }
}

/// Remove the token's delivered files.
fn delete_outputs(ctx: &BurstingContext) {
    let files = ctx.extracted_file_path.iter().chain(ctx.archive_file_path.iter());
    for path in files {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Delivered file deleted"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to delete delivered file"),
        }
    }
}
