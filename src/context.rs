//! Mutable state threaded through one bursting job.
//!
//! A context belongs to exactly one job. Stages receive it by `&mut` in
//! sequence; nothing in here is shared across jobs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::settings::Settings;
use crate::variables::{self, Variables};

/// Per-job counters. At job end
/// `extracted == distributed + skipped + quarantined`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub extracted: usize,
    pub distributed: usize,
    pub skipped: usize,
    pub quarantined: usize,
    pub messages_sent: usize,
}

impl Counters {
    /// Whether every extracted document has been accounted for.
    pub fn balanced(&self) -> bool {
        self.extracted == self.distributed + self.skipped + self.quarantined
    }
}

#[derive(Debug)]
pub struct BurstingContext {
    pub settings: Settings,
    pub variables: Variables,

    pub source_path: PathBuf,
    pub config_path: String,

    /// Current token; empty outside the per-token loop.
    pub token: String,
    /// Tokens in discovery order, frozen after parsing.
    pub tokens: Vec<String>,
    pub num_pages: usize,

    pub output_folder: PathBuf,
    pub backup_folder: PathBuf,
    pub quarantine_folder: PathBuf,
    pub logs_archives_folder: PathBuf,
    pub temp_folder: PathBuf,

    pub extracted_file_path: Option<PathBuf>,
    /// Outputs of the nested second-pass burst for the current token.
    pub extracted_file_paths_after_splitting_2nd_time: Vec<PathBuf>,
    /// Resolved attachment paths for the current token.
    pub attachments: Vec<PathBuf>,
    pub archive_file_path: Option<PathBuf>,

    /// Set by the `skip` variable or a hook to bypass distribution.
    pub skip_current_file_distribution: bool,
    /// Quality-assurance run: channels validate but do not transmit.
    pub is_qa_mode: bool,

    /// Text of the page being parsed, visible to page hooks.
    pub current_page_index: usize,
    pub current_page_text: String,
    pub current_page_tokens: Vec<String>,

    pub counters: Counters,
    pub last_error: Option<String>,
}

impl BurstingContext {
    pub fn new(source_path: PathBuf, settings: Settings, temp_folder: PathBuf) -> Self {
        let variables = Variables::new(&source_path, settings.number_of_user_variables);
        Self {
            config_path: settings.config_path.clone(),
            settings,
            variables,
            source_path,
            token: String::new(),
            tokens: Vec::new(),
            num_pages: 0,
            output_folder: PathBuf::new(),
            backup_folder: PathBuf::new(),
            quarantine_folder: PathBuf::new(),
            logs_archives_folder: PathBuf::new(),
            temp_folder,
            extracted_file_path: None,
            extracted_file_paths_after_splitting_2nd_time: Vec::new(),
            attachments: Vec::new(),
            archive_file_path: None,
            skip_current_file_distribution: false,
            is_qa_mode: false,
            current_page_index: 0,
            current_page_text: String::new(),
            current_page_tokens: Vec::new(),
            counters: Counters::default(),
            last_error: None,
        }
    }

    /// Resolve a template against the current token.
    pub fn resolve(&self, template: &str) -> String {
        self.variables.resolve(template, &self.token)
    }

    /// Resolve a template naming a file or folder. Substituted values cannot
    /// add path components; the template's own text can.
    pub fn resolve_path(&self, template: &str) -> String {
        self.variables.resolve_with(template, &self.token, path_safe)
    }

    /// Mirror the counters into the stats variables.
    pub fn publish_counters(&mut self) {
        let c = self.counters;
        let vars = &mut self.variables;
        vars.set(variables::NUM_PAGES, self.num_pages.to_string());
        vars.set(variables::NUM_TOKENS, self.tokens.len().to_string());
        vars.set(variables::NUM_FILES_EXTRACTED, c.extracted.to_string());
        vars.set(variables::NUM_FILES_DISTRIBUTED, c.distributed.to_string());
        vars.set(variables::NUM_FILES_SKIPPED_DISTRIBUTION, c.skipped.to_string());
        vars.set(variables::NUM_FILES_QUARANTINED, c.quarantined.to_string());
        vars.set(variables::NUM_MESSAGES_SENT, c.messages_sent.to_string());
        let info = vars.resolve(variables::STATS_INFO_TEMPLATE, "");
        vars.set(variables::STATS_INFO, info);
    }

    /// Clear per-token state before moving to the next token.
    pub fn reset_token_state(&mut self) {
        self.extracted_file_path = None;
        self.extracted_file_paths_after_splitting_2nd_time.clear();
        self.attachments.clear();
        self.archive_file_path = None;
        self.skip_current_file_distribution = false;
        self.last_error = None;
    }
}

fn path_safe(value: String) -> String {
    let value = value.replace(['/', '\\'], "_");
    if !value.is_empty() && value.trim_matches('.').is_empty() {
        return "_".repeat(value.len());
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> BurstingContext {
        BurstingContext::new(
            PathBuf::from("/in/Invoices.pdf"),
            Settings::default(),
            PathBuf::from("/tmp"),
        )
    }

    #[test]
    fn counters_balance() {
        let c = Counters { extracted: 4, distributed: 2, skipped: 1, quarantined: 1, messages_sent: 2 };
        assert!(c.balanced());
        let c = Counters { extracted: 4, distributed: 2, ..Default::default() };
        assert!(!c.balanced());
    }

    #[test]
    fn resolve_uses_current_token() {
        let mut ctx = ctx();
        ctx.token = "alpha".into();
        assert_eq!(ctx.resolve("${burst_token}-${input_document_name}"), "alpha-Invoices");
    }

    #[test]
    fn path_values_stay_inside_their_folder() {
        let mut ctx = ctx();
        ctx.token = "../../etc/passwd".into();
        assert_eq!(ctx.resolve_path("out/${burst_token}.pdf"), "out/.._.._etc_passwd.pdf");
        ctx.token = "..".into();
        assert_eq!(ctx.resolve_path("out/${burst_token}/x"), "out/__/x");
        ctx.token = "a\\b".into();
        assert_eq!(ctx.resolve_path("${burst_token}"), "a_b");
    }

    #[test]
    fn publish_counters_fills_stats_info() {
        let mut ctx = ctx();
        ctx.num_pages = 3;
        ctx.tokens = vec!["a".into(), "b".into(), "c".into()];
        ctx.counters.extracted = 3;
        ctx.counters.distributed = 2;
        ctx.publish_counters();
        assert_eq!(ctx.variables.get(variables::STATS_INFO), Some("3pages-3extracted-2distributed"));
        assert_eq!(ctx.variables.get(variables::NUM_TOKENS), Some("3"));
    }

    #[test]
    fn reset_clears_token_state() {
        let mut ctx = ctx();
        ctx.skip_current_file_distribution = true;
        ctx.attachments.push(PathBuf::from("x"));
        ctx.extracted_file_path = Some(PathBuf::from("y"));
        ctx.reset_token_state();
        assert!(!ctx.skip_current_file_distribution);
        assert!(ctx.attachments.is_empty());
        assert!(ctx.extracted_file_path.is_none());
    }
}
