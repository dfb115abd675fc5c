//! Delivery of extracted documents.
//!
//! Each channel implements [`Sender`]. The [`Distributor`] runs every
//! channel enabled in the current token's settings, wrapping each one in
//! the retry policy. A send either transmits (`execute == true`) or, in
//! quality-assurance runs, only resolves and validates the message.

pub mod archive;
pub mod mail;
pub mod sms;
pub mod upload;
pub mod web;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::context::BurstingContext;
use crate::settings::{RetryPolicy, Settings};

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum SendError {
    /// Network or process failure; worth another attempt.
    #[error("{channel} transport failure: {reason}")]
    Transport { channel: Channel, reason: String },

    /// The message itself is unacceptable; retrying cannot help.
    #[error("{channel} message rejected: {reason}")]
    Validation { channel: Channel, reason: String },

    #[error("attachment not found: {}", path.display())]
    MissingAttachment { path: PathBuf },

    #[error("cannot build attachment archive: {0}")]
    Archive(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn transport(channel: Channel, reason: impl fmt::Display) -> Self {
        Self::Transport {
            channel,
            reason: reason.to_string(),
        }
    }

    pub fn validation(channel: Channel, reason: impl fmt::Display) -> Self {
        Self::Validation {
            channel,
            reason: reason.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Channels
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Email,
    Upload,
    Web,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Upload => "upload",
            Self::Web => "web upload",
            Self::Sms => "sms",
        }
    }

    /// Whether `settings` turn this channel on.
    pub fn enabled(&self, settings: &Settings) -> bool {
        let flags = settings.send_files;
        match self {
            Self::Email => flags.email,
            Self::Upload => flags.upload,
            Self::Web => flags.web,
            Self::Sms => flags.sms,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery channel.
pub trait Sender: Send + Sync {
    fn channel(&self) -> Channel;

    /// Deliver the current token's document. Returns the number of
    /// messages transmitted; zero when `execute` is false.
    fn send(&self, ctx: &BurstingContext, execute: bool) -> Result<usize, SendError>;
}

/// Files a channel should deliver: the archive when one was built,
/// otherwise the resolved attachment list.
pub fn delivered_files(ctx: &BurstingContext) -> Vec<PathBuf> {
    match &ctx.archive_file_path {
        Some(archive) => vec![archive.clone()],
        None => ctx.attachments.clone(),
    }
}

/// Resolve the attachment list for the current token and build the
/// archive when archiving is on. A missing file is never retried.
pub fn prepare_attachments(ctx: &mut BurstingContext) -> Result<(), SendError> {
    let mut files = Vec::new();
    for attachment in ctx.settings.ordered_attachments() {
        if attachment
            .path
            .contains(crate::variables::EXTRACTED_FILE_PATHS_AFTER_SPLITTING_2ND_TIME)
        {
            // One entry per second-pass output that still exists.
            files.extend(
                ctx.extracted_file_paths_after_splitting_2nd_time
                    .iter()
                    .filter(|p| p.is_file())
                    .cloned(),
            );
            continue;
        }
        let resolved = ctx.resolve(&attachment.path);
        if resolved.trim().is_empty() {
            continue;
        }
        let path = PathBuf::from(resolved.trim());
        if !path.is_file() {
            return Err(SendError::MissingAttachment { path });
        }
        files.push(path);
    }
    ctx.attachments = files;
    ctx.archive_file_path = None;

    if ctx.settings.archive_attachments && !ctx.attachments.is_empty() {
        let name = ctx.resolve_path(&ctx.settings.archive_file_name);
        let folder = ctx
            .extracted_file_path
            .as_ref()
            .and_then(|p| p.parent().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| ctx.output_folder.clone());
        let destination = folder.join(name.trim());
        archive::zip_files(&ctx.attachments, &destination)?;
        ctx.archive_file_path = Some(destination);
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Retry
// ═══════════════════════════════════════════════════════════

/// Delay before retry number `retry` (1-based): the initial delay doubled
/// per retry, capped at `max_delay`.
pub fn backoff_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
    let secs = policy.delay.saturating_mul(factor).min(policy.max_delay.max(policy.delay));
    Duration::from_secs(secs)
}

/// Run one channel under the retry policy.
pub fn send_with_retry(
    sender: &dyn Sender,
    ctx: &BurstingContext,
    policy: &RetryPolicy,
    execute: bool,
) -> Result<usize, SendError> {
    let mut retry = 0;
    loop {
        match sender.send(ctx, execute) {
            Ok(sent) => return Ok(sent),
            Err(e) if e.is_retryable() && retry < policy.max_retries => {
                retry += 1;
                let delay = backoff_delay(policy, retry);
                tracing::warn!(
                    token = %ctx.token,
                    channel = %sender.channel(),
                    attempt = retry,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Distribution failed, retrying"
                );
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Distributor
// ═══════════════════════════════════════════════════════════

/// The set of available channels.
pub struct Distributor {
    senders: Vec<Box<dyn Sender>>,
}

impl Distributor {
    pub fn new(senders: Vec<Box<dyn Sender>>) -> Self {
        Self { senders }
    }

    /// All built-in channels. Which ones run is decided per token.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(mail::MailSender),
            Box::new(upload::UploadSender),
            Box::new(web::WebUploadSender),
            Box::new(sms::SmsSender),
        ])
    }

    /// Whether any channel is enabled in `settings`.
    pub fn any_enabled(&self, settings: &Settings) -> bool {
        self.senders.iter().any(|s| s.channel().enabled(settings))
    }

    /// Run every enabled channel in order; the first exhausted failure
    /// stops the token. Returns the messages transmitted.
    pub fn distribute(&self, ctx: &BurstingContext, execute: bool) -> Result<usize, SendError> {
        let policy = ctx.settings.retry_policy;
        let mut sent = 0;
        for sender in self.senders.iter().filter(|s| s.channel().enabled(&ctx.settings)) {
            sent += send_with_retry(sender.as_ref(), ctx, &policy, execute)?;
            tracing::debug!(token = %ctx.token, channel = %sender.channel(), execute, "Channel done");
        }
        Ok(sent)
    }
}

/// Split a templated recipient list on commas and semicolons.
pub fn split_recipients(list: &str) -> Vec<String> {
    list.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
