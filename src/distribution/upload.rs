//! Upload through templated external commands (ftp, sftp, file share,
//! cloud CLIs). Each non-blank command runs once per token through the
//! platform shell; a non-zero exit is a transport failure.
//!
//! Values substituted into a command are quoted for the shell, so tokens
//! and paths read from the document stay single arguments. Templates
//! should not wrap variables in their own quotes.

use std::process::Command;

use super::{Channel, SendError, Sender};
use crate::context::BurstingContext;

pub struct UploadSender;

impl UploadSender {
    /// Resolved command lines for the current token.
    pub fn resolved_commands(&self, ctx: &BurstingContext) -> Result<Vec<(&'static str, String)>, SendError> {
        let commands: Vec<(&'static str, String)> = ctx
            .settings
            .upload
            .commands()
            .into_iter()
            .map(|(kind, template)| {
                let command = ctx.variables.resolve_with(template, &ctx.token, quote);
                (kind, command.trim().to_string())
            })
            .filter(|(_, cmd)| !cmd.is_empty())
            .collect();
        if commands.is_empty() {
            return Err(SendError::validation(
                Channel::Upload,
                format!("no upload command configured for token '{}'", ctx.token),
            ));
        }
        Ok(commands)
    }
}

impl Sender for UploadSender {
    fn channel(&self) -> Channel {
        Channel::Upload
    }

    fn send(&self, ctx: &BurstingContext, execute: bool) -> Result<usize, SendError> {
        let commands = self.resolved_commands(ctx)?;
        if !execute {
            tracing::info!(token = %ctx.token, commands = commands.len(), "Upload validated, not run");
            return Ok(0);
        }
        for (kind, command) in &commands {
            let output = shell(command)
                .output()
                .map_err(|e| SendError::transport(Channel::Upload, format!("{kind}: {e}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(SendError::transport(
                    Channel::Upload,
                    format!("{kind} command exited with {}: {}", output.status, stderr.trim()),
                ));
            }
            tracing::info!(token = %ctx.token, kind, "Upload command completed");
        }
        Ok(commands.len())
    }
}

#[cfg(unix)]
fn quote(value: String) -> String {
    // A shell word cannot carry NUL.
    let value = value.replace('\0', "");
    shlex::try_quote(&value).map(std::borrow::Cow::into_owned).unwrap_or_default()
}

#[cfg(windows)]
fn quote(value: String) -> String {
    const SPECIAL: &[char] = &[' ', '\t', '&', '|', '<', '>', '^', '(', ')', '%', '!', ','];
    let value = value.replace('"', "");
    if value.contains(SPECIAL) {
        format!("\"{value}\"")
    } else {
        value
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
