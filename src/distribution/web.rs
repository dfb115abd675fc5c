//! Web upload: a multipart POST of the token's files.

use std::time::Duration;

use reqwest::blocking::multipart::Form;
use reqwest::StatusCode;

use super::{delivered_files, Channel, SendError, Sender};
use crate::context::BurstingContext;

pub struct WebUploadSender;

/// 408, 429 and 5xx are worth retrying; other failures are final.
pub(crate) fn classify_status(channel: Channel, status: StatusCode, body: &str) -> SendError {
    let reason = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        SendError::transport(channel, reason)
    } else {
        SendError::validation(channel, reason)
    }
}

pub(crate) fn client(channel: Channel, timeout_secs: u64) -> Result<reqwest::blocking::Client, SendError> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| SendError::transport(channel, e))
}

impl Sender for WebUploadSender {
    fn channel(&self) -> Channel {
        Channel::Web
    }

    fn send(&self, ctx: &BurstingContext, execute: bool) -> Result<usize, SendError> {
        let web = &ctx.settings.web_upload;
        let url = ctx.resolve(&web.url).trim().to_string();
        if url.is_empty() {
            return Err(SendError::validation(Channel::Web, "no upload URL configured"));
        }
        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| SendError::validation(Channel::Web, format!("invalid URL '{url}': {e}")))?;

        let files = delivered_files(ctx);
        if let Some(missing) = files.iter().find(|f| !f.is_file()) {
            return Err(SendError::MissingAttachment { path: missing.clone() });
        }
        if !execute {
            tracing::info!(token = %ctx.token, url = %parsed, files = files.len(), "Web upload validated, not sent");
            return Ok(0);
        }

        let mut form = Form::new();
        for (name, value) in &web.fields {
            form = form.text(name.clone(), ctx.resolve(value));
        }
        for path in &files {
            form = form
                .file(web.file_field.clone(), path)
                .map_err(|_| SendError::MissingAttachment { path: path.clone() })?;
        }

        let mut request = client(Channel::Web, web.timeout_secs)?.post(parsed).multipart(form);
        if !web.auth_token.trim().is_empty() {
            request = request.bearer_auth(ctx.resolve(&web.auth_token));
        }
        let response = request
            .send()
            .map_err(|e| SendError::transport(Channel::Web, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(classify_status(Channel::Web, status, &body));
        }
        tracing::info!(token = %ctx.token, status = status.as_u16(), "Web upload completed");
        Ok(1)
    }
}
