//! SMTP delivery through lettre.

use std::path::Path;
use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use super::{delivered_files, split_recipients, Channel, SendError, Sender};
use crate::context::BurstingContext;
use crate::settings::EmailServer;

const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct MailSender;

impl MailSender {
    /// Resolve every templated field and assemble the message.
    pub fn build_message(&self, ctx: &BurstingContext) -> Result<Message, SendError> {
        let server = &ctx.settings.email_server;
        let email = &ctx.settings.email;

        let from = mailbox(&server.from, Some(&server.name))?;
        let to = split_recipients(&ctx.resolve(&email.to));
        if to.is_empty() {
            return Err(SendError::validation(
                Channel::Email,
                format!("no recipient for token '{}'", ctx.token),
            ));
        }

        let mut builder = Message::builder()
            .from(from)
            .subject(ctx.resolve(&email.subject));
        for address in &to {
            builder = builder.to(mailbox(address, None)?);
        }
        for address in split_recipients(&ctx.resolve(&email.cc)) {
            builder = builder.cc(mailbox(&address, None)?);
        }
        for address in split_recipients(&ctx.resolve(&email.bcc)) {
            builder = builder.bcc(mailbox(&address, None)?);
        }

        let text = ctx.resolve(&email.text);
        let html = ctx.resolve(&email.html);
        let body = if ctx.settings.html_email && !html.trim().is_empty() {
            MultiPart::alternative_plain_html(text, html)
        } else {
            MultiPart::mixed().singlepart(SinglePart::plain(text))
        };

        let mut content = MultiPart::mixed().multipart(body);
        for path in delivered_files(ctx) {
            content = content.singlepart(attachment(&path)?);
        }
        builder
            .multipart(content)
            .map_err(|e| SendError::validation(Channel::Email, e))
    }
}

impl Sender for MailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn send(&self, ctx: &BurstingContext, execute: bool) -> Result<usize, SendError> {
        let message = self.build_message(ctx)?;
        if !execute {
            tracing::info!(token = %ctx.token, "Email validated, not sent");
            return Ok(0);
        }
        let transport = transport(&ctx.settings.email_server)?;
        transport.send(&message).map_err(|e| {
            if e.is_permanent() {
                SendError::validation(Channel::Email, e)
            } else {
                SendError::transport(Channel::Email, e)
            }
        })?;
        tracing::info!(token = %ctx.token, "Email sent");
        Ok(1)
    }
}

fn mailbox(address: &str, name: Option<&str>) -> Result<Mailbox, SendError> {
    let invalid = |e: lettre::address::AddressError| {
        SendError::validation(Channel::Email, format!("invalid address '{address}': {e}"))
    };
    let name = name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);
    Ok(Mailbox::new(name, address.trim().parse().map_err(invalid)?))
}

fn attachment(path: &Path) -> Result<SinglePart, SendError> {
    let data = std::fs::read(path).map_err(|_| SendError::MissingAttachment { path: path.to_path_buf() })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".into());
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let content_type = ContentType::parse(mime.essence_str())
        .map_err(|e| SendError::validation(Channel::Email, format!("content type of '{name}': {e}")))?;
    Ok(Attachment::new(name).body(data, content_type))
}

fn transport(server: &EmailServer) -> Result<SmtpTransport, SendError> {
    let host = server.host.trim();
    let builder = if server.use_ssl {
        SmtpTransport::relay(host).map_err(|e| SendError::validation(Channel::Email, e))?
    } else if server.use_tls {
        SmtpTransport::starttls_relay(host).map_err(|e| SendError::validation(Channel::Email, e))?
    } else {
        SmtpTransport::builder_dangerous(host)
    };
    let mut builder = builder.port(server.port).timeout(Some(SMTP_TIMEOUT));
    if !server.user_id.trim().is_empty() {
        builder = builder.credentials(Credentials::new(
            server.user_id.clone(),
            server.user_password.clone(),
        ));
    }
    Ok(builder.build())
}
