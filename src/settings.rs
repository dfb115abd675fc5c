//! Typed job settings.
//!
//! The engine reads settings only through this struct. Files are JSON; every
//! key is optional and falls back to the defaults below, so a settings file
//! only has to name what it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BurstError;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Retry policy applied to every distribution attempt. Values in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Initial delay before the first retry.
    pub delay: u64,
    /// Upper bound for the doubled delay.
    pub max_delay: u64,
    /// Retries after the first attempt. Zero means a single attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: 3,
            max_delay: 30,
            max_retries: 3,
        }
    }
}

/// Which channels a job distributes through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendFiles {
    pub email: bool,
    pub upload: bool,
    pub web: bool,
    pub sms: bool,
}

impl SendFiles {
    pub fn any(&self) -> bool {
        self.email || self.upload || self.web || self.sms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attachment {
    /// Templated path; `${extracted_file_path}` refers to the burst output.
    pub path: String,
    pub order: u32,
}

impl Default for Attachment {
    fn default() -> Self {
        Self {
            path: "${extracted_file_path}".into(),
            order: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailServer {
    pub host: String,
    pub port: u16,
    pub user_id: String,
    pub user_password: String,
    pub use_ssl: bool,
    pub use_tls: bool,
    pub from: String,
    pub name: String,
}

impl Default for EmailServer {
    fn default() -> Self {
        Self {
            host: "Email Server Host".into(),
            port: 25,
            user_id: "From Email User ID".into(),
            user_password: "From Email Password".into(),
            use_ssl: false,
            use_tls: false,
            from: "from@emailaddress.com".into(),
            name: "From Name".into(),
        }
    }
}

/// Templated mail message fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailMessage {
    pub to: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl Default for EmailMessage {
    fn default() -> Self {
        Self {
            to: "${burst_token}".into(),
            cc: String::new(),
            bcc: String::new(),
            subject: String::new(),
            text: String::new(),
            html: String::new(),
        }
    }
}

/// Templated command lines run once per distributed document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub ftp_command: String,
    pub file_share_command: String,
    pub ftps_command: String,
    pub sftp_command: String,
    pub http_command: String,
    pub cloud_command: String,
}

impl UploadSettings {
    /// Non-blank commands in a fixed order.
    pub fn commands(&self) -> Vec<(&'static str, &str)> {
        [
            ("ftp", self.ftp_command.as_str()),
            ("file_share", self.file_share_command.as_str()),
            ("ftps", self.ftps_command.as_str()),
            ("sftp", self.sftp_command.as_str()),
            ("http", self.http_command.as_str()),
            ("cloud", self.cloud_command.as_str()),
        ]
        .into_iter()
        .filter(|(_, cmd)| !cmd.trim().is_empty())
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebUploadSettings {
    /// Templated endpoint URL.
    pub url: String,
    /// Multipart field carrying each file.
    pub file_field: String,
    /// Optional bearer token.
    pub auth_token: String,
    /// Extra templated form fields.
    pub fields: Vec<(String, String)>,
    pub timeout_secs: u64,
}

impl Default for WebUploadSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            file_field: "file".into(),
            auth_token: String::new(),
            fields: Vec::new(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsSettings {
    /// Gateway endpoint accepting a form POST.
    pub gateway_url: String,
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub to_number: String,
    pub text: String,
    pub timeout_secs: u64,
}

impl Default for SmsSettings {
    fn default() -> Self {
        Self {
            gateway_url: String::new(),
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            to_number: String::new(),
            text: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Options for delimited-text sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelimitedSettings {
    /// Field separator for `.txt` sources; `.csv` and `.tsv` imply theirs.
    pub separator: char,
    pub quote: char,
    /// Whether the first (non-skipped) line is a header row.
    pub header: bool,
    /// Leading lines to ignore before the header.
    pub skip_lines: usize,
    /// `notused`, `firstcolumn`, `lastcolumn`, a 0-based index or a header name.
    pub id_column: String,
}

impl Default for DelimitedSettings {
    fn default() -> Self {
        Self {
            separator: ',',
            quote: '"',
            header: true,
            skip_lines: 0,
            id_column: "notused".into(),
        }
    }
}

/// Complete job configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path this configuration was loaded from. Not serialized.
    #[serde(skip)]
    pub config_path: String,

    pub burst_file_name: String,
    pub output_folder: String,
    pub backup_folder: String,
    pub quarantine_folder: String,
    pub logs_archives_folder: String,
    pub stats_file_name: String,

    pub quarantine_files: bool,
    pub delete_files: bool,
    pub send_files: SendFiles,

    pub number_of_user_variables: usize,
    /// Seconds to wait before each distribution.
    pub delay_each_distribution_by: f64,
    pub reuse_tokens_when_not_found: bool,
    pub fail_job_if_any_distribution_fails: bool,
    pub retry_policy: RetryPolicy,

    pub start_burst_token_delimiter: String,
    pub end_burst_token_delimiter: String,
    pub split_2nd_time: bool,
    pub start_burst_token_delimiter_2nd: String,
    pub end_burst_token_delimiter_2nd: String,

    pub attachments: Vec<Attachment>,
    pub archive_attachments: bool,
    pub archive_file_name: String,

    pub email_server: EmailServer,
    pub email: EmailMessage,
    pub html_email: bool,
    pub upload: UploadSettings,
    pub web_upload: WebUploadSettings,
    pub sms: SmsSettings,

    pub delimited: DelimitedSettings,
}

const TIMESTAMPED: &str = "${input_document_name}/${now?string[\"yyyy.MM.dd_HH.mm.ss.SSS\"]}";

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: String::new(),
            burst_file_name: "${burst_token}.${output_type_extension}".into(),
            output_folder: format!("output/{TIMESTAMPED}"),
            backup_folder: format!("backup/{TIMESTAMPED}"),
            quarantine_folder: format!("quarantine/{TIMESTAMPED}"),
            logs_archives_folder: format!("logs/archives/{TIMESTAMPED}"),
            stats_file_name: "_stats-${stats_info}.log".into(),
            quarantine_files: true,
            delete_files: false,
            send_files: SendFiles::default(),
            number_of_user_variables: 20,
            delay_each_distribution_by: 0.0,
            reuse_tokens_when_not_found: false,
            fail_job_if_any_distribution_fails: true,
            retry_policy: RetryPolicy::default(),
            start_burst_token_delimiter: "{".into(),
            end_burst_token_delimiter: "}".into(),
            split_2nd_time: false,
            start_burst_token_delimiter_2nd: "[".into(),
            end_burst_token_delimiter_2nd: "]".into(),
            attachments: vec![Attachment::default()],
            archive_attachments: false,
            archive_file_name: "reports-${burst_token}.zip".into(),
            email_server: EmailServer::default(),
            email: EmailMessage::default(),
            html_email: true,
            upload: UploadSettings::default(),
            web_upload: WebUploadSettings::default(),
            sms: SmsSettings::default(),
            delimited: DelimitedSettings::default(),
        }
    }
}

impl Settings {
    /// Attachments sorted by their `order` field; ties keep file order.
    pub fn ordered_attachments(&self) -> Vec<Attachment> {
        let mut attachments = self.attachments.clone();
        attachments.sort_by_key(|a| a.order);
        attachments
    }

    /// True for the nested run of a second-pass burst.
    pub fn is_second_pass(&self) -> bool {
        self.config_path.contains(crate::config::SPLIT_2ND_TIME)
    }

    /// Settings for the nested second-pass burst of one extracted document.
    ///
    /// The nested run uses the second delimiter pair, writes next to the
    /// extracted document and carries the sentinel segment in its
    /// configuration path so it never recurses again.
    pub fn for_second_pass(&self, output_folder: &Path) -> Self {
        let mut nested = self.clone();
        nested.config_path = Path::new(&self.config_path)
            .join(crate::config::SPLIT_2ND_TIME)
            .to_string_lossy()
            .into_owned();
        nested.start_burst_token_delimiter = self.start_burst_token_delimiter_2nd.clone();
        nested.end_burst_token_delimiter = self.end_burst_token_delimiter_2nd.clone();
        nested.output_folder = output_folder.to_string_lossy().into_owned();
        nested.send_files = SendFiles::default();
        nested.delete_files = false;
        nested.fail_job_if_any_distribution_fails = true;
        nested
    }
}

// ═══════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════

/// Supplies settings for a configuration path.
///
/// Used at job start and again when a source document names its own
/// configuration file.
pub trait SettingsLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Settings, BurstError>;
}

/// Reads JSON settings files from disk.
pub struct JsonSettingsLoader;

impl SettingsLoader for JsonSettingsLoader {
    fn load(&self, path: &Path) -> Result<Settings, BurstError> {
        load_settings(path)
    }
}

/// Load settings from a JSON file. Missing keys take default values.
pub fn load_settings(path: &Path) -> Result<Settings, BurstError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BurstError::Configuration(format!(
            "cannot read settings file '{}': {e}",
            path.display()
        ))
    })?;
    let mut settings: Settings = serde_json::from_str(&raw).map_err(|e| {
        BurstError::Configuration(format!(
            "invalid settings file '{}': {e}",
            path.display()
        ))
    })?;
    settings.config_path = path.to_string_lossy().into_owned();
    tracing::debug!(path = %path.display(), "Settings loaded");
    Ok(settings)
}

/// Write settings as pretty JSON.
pub fn save_settings(settings: &Settings, path: &Path) -> Result<(), BurstError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| BurstError::resource(parent, e))?;
        }
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json).map_err(|e| BurstError::resource(path, e))
}
