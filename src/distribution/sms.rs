//! SMS through an HTTP gateway accepting a form POST with basic auth.

use super::web::{classify_status, client};
use super::{Channel, SendError, Sender};
use crate::context::BurstingContext;

pub struct SmsSender;

/// Resolved SMS fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    pub from: String,
    pub to: String,
    pub body: String,
}

impl SmsSender {
    pub fn build_message(&self, ctx: &BurstingContext) -> Result<SmsMessage, SendError> {
        let sms = &ctx.settings.sms;
        let message = SmsMessage {
            from: ctx.resolve(&sms.from_number).trim().to_string(),
            to: ctx.resolve(&sms.to_number).trim().to_string(),
            body: ctx.resolve(&sms.text),
        };
        if message.to.is_empty() {
            return Err(SendError::validation(
                Channel::Sms,
                format!("no destination number for token '{}'", ctx.token),
            ));
        }
        if !is_phone_number(&message.to) {
            return Err(SendError::validation(
                Channel::Sms,
                format!("'{}' is not a phone number", message.to),
            ));
        }
        if message.body.trim().is_empty() {
            return Err(SendError::validation(Channel::Sms, "message text is empty"));
        }
        Ok(message)
    }
}

impl Sender for SmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn send(&self, ctx: &BurstingContext, execute: bool) -> Result<usize, SendError> {
        let sms = &ctx.settings.sms;
        let message = self.build_message(ctx)?;
        let url = sms.gateway_url.trim();
        if url.is_empty() {
            return Err(SendError::validation(Channel::Sms, "no SMS gateway configured"));
        }
        if !execute {
            tracing::info!(token = %ctx.token, to = %message.to, "SMS validated, not sent");
            return Ok(0);
        }
        let form = [
            ("From", message.from.as_str()),
            ("To", message.to.as_str()),
            ("Body", message.body.as_str()),
        ];
        let response = client(Channel::Sms, sms.timeout_secs)?
            .post(url)
            .basic_auth(&sms.account_sid, Some(&sms.auth_token))
            .form(&form)
            .send()
            .map_err(|e| SendError::transport(Channel::Sms, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(classify_status(Channel::Sms, status, &body));
        }
        tracing::info!(token = %ctx.token, to = %message.to, "SMS sent");
        Ok(1)
    }
}

fn is_phone_number(value: &str) -> bool {
    let digits = value.strip_prefix('+').unwrap_or(value);
    let digits: String = digits.chars().filter(|c| !matches!(c, ' ' | '-' | '(' | ')')).collect();
    (4..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}
