//! Built-in and per-token variables, and the template resolver.
//!
//! Two interchangeable template syntaxes are understood:
//! - `${name}` and `${now?string['yyyy.MM.dd']}` (double quotes also accepted)
//! - `$name$` and `$now; format="yyyy.MM.dd"$`
//!
//! Resolution reads only the token passed in and the values held by
//! [`Variables`]; the job timestamp is captured once at construction.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Local};
use regex::{Captures, Regex};

// ═══════════════════════════════════════════════════════════
// Names
// ═══════════════════════════════════════════════════════════

pub const BURST_TOKEN: &str = "burst_token";
pub const BURST_INDEX: &str = "burst_index";
pub const INPUT_DOCUMENT_NAME: &str = "input_document_name";
pub const INPUT_DOCUMENT_EXTENSION: &str = "input_document_extension";
pub const OUTPUT_TYPE_EXTENSION: &str = "output_type_extension";
pub const OUTPUT_FOLDER: &str = "output_folder";
pub const BACKUP_FOLDER: &str = "backup_folder";
pub const QUARANTINE_FOLDER: &str = "quarantine_folder";
pub const EXTRACTED_FILE_PATH: &str = "extracted_file_path";
pub const EXTRACTED_FILE_PATHS_AFTER_SPLITTING_2ND_TIME: &str =
    "extracted_file_paths_after_splitting_2nd_time";
pub const SKIP: &str = "skip";
pub const ROW_INDEX: &str = "row_index";
pub const ROW_NUMBER: &str = "row_number";

pub const NOW: &str = "now";
pub const NOW_DEFAULT_DATE: &str = "now_default_date";
pub const NOW_SHORT_DATE: &str = "now_short_date";
pub const NOW_MEDIUM_DATE: &str = "now_medium_date";
pub const NOW_LONG_DATE: &str = "now_long_date";
pub const NOW_FULL_DATE: &str = "now_full_date";
pub const NOW_DEFAULT_TIME: &str = "now_default_time";
pub const NOW_SHORT_TIME: &str = "now_short_time";
pub const NOW_QUARTER: &str = "now_quarter";

pub const NUM_PAGES: &str = "num_pages";
pub const NUM_TOKENS: &str = "num_tokens";
pub const NUM_FILES_EXTRACTED: &str = "num_files_extracted";
pub const NUM_FILES_DISTRIBUTED: &str = "num_files_distributed";
pub const NUM_FILES_SKIPPED_DISTRIBUTION: &str = "num_files_skipped_distribution";
pub const NUM_FILES_QUARANTINED: &str = "num_files_quarantined";
pub const NUM_MESSAGES_SENT: &str = "num_messages_sent";
pub const STATS_INFO: &str = "stats_info";

/// Template used to build `stats_info`.
pub const STATS_INFO_TEMPLATE: &str =
    "${num_pages}pages-${num_files_extracted}extracted-${num_files_distributed}distributed";

/// Positional user variable name (`var0`, `var1`, ...).
pub fn user_var_name(index: usize) -> String {
    format!("var{index}")
}

static TEMPLATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\$\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?:\?string\[\s*(?:'([^']*)'|"([^"]*)")\s*\])?\s*\}|\$([A-Za-z_][A-Za-z0-9_]*)(?:\s*;\s*format\s*=\s*"([^"]*)")?\$"#,
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════

/// Job-wide values plus per-token user variables.
#[derive(Debug, Clone)]
pub struct Variables {
    job: BTreeMap<String, String>,
    user: HashMap<String, BTreeMap<String, String>>,
    max_user_variables: usize,
    now: DateTime<Local>,
}

impl Variables {
    /// Seed the job-wide values for one input document.
    pub fn new(input_path: &Path, max_user_variables: usize) -> Self {
        let mut vars = Self {
            job: BTreeMap::new(),
            user: HashMap::new(),
            max_user_variables,
            now: Local::now(),
        };
        let name = input_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = input_path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        vars.set(INPUT_DOCUMENT_NAME, name);
        vars.set(INPUT_DOCUMENT_EXTENSION, extension);
        vars
    }

    /// Pin the job timestamp.
    pub fn with_now(mut self, now: DateTime<Local>) -> Self {
        self.now = now;
        self
    }

    pub fn now(&self) -> DateTime<Local> {
        self.now
    }

    pub fn max_user_variables(&self) -> usize {
        self.max_user_variables
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.job.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.job.get(name).map(String::as_str)
    }

    /// Capture a per-token value.
    ///
    /// Blank values never replace a captured one. Positional names beyond
    /// the configured slot count are dropped. Returns whether it was stored.
    pub fn set_user_variable(&mut self, token: &str, name: &str, value: &str) -> bool {
        if let Some(index) = name.strip_prefix("var").and_then(|n| n.parse::<usize>().ok()) {
            if index >= self.max_user_variables {
                return false;
            }
        }
        if value.trim().is_empty() {
            return false;
        }
        self.user
            .entry(token.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
        true
    }

    pub fn user_variables(&self, token: &str) -> Option<&BTreeMap<String, String>> {
        self.user.get(token)
    }

    pub fn user_variable(&self, token: &str, name: &str) -> Option<&str> {
        self.user
            .get(token)
            .and_then(|vars| vars.get(name))
            .map(String::as_str)
    }

    /// The `skip` user variable parsed as a boolean.
    pub fn skip_requested(&self, token: &str) -> bool {
        self.user_variable(token, SKIP)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Resolve both template syntaxes against `token`.
    pub fn resolve(&self, template: &str, token: &str) -> String {
        self.resolve_with(template, token, |value| value)
    }

    /// Resolve, passing every substituted value through `escape`. Literal
    /// template text is left as written.
    pub fn resolve_with(&self, template: &str, token: &str, escape: impl Fn(String) -> String) -> String {
        TEMPLATE_PATTERN
            .replace_all(template, |caps: &Captures| {
                let (name, format) = match caps.get(1) {
                    Some(name) => (name.as_str(), caps.get(2).or_else(|| caps.get(3))),
                    None => (caps.get(4).map_or("", |m| m.as_str()), caps.get(5)),
                };
                escape(self.lookup(name, token, format.map(|m| m.as_str())))
            })
            .into_owned()
    }

    fn lookup(&self, name: &str, token: &str, format: Option<&str>) -> String {
        if let Some(value) = self.date_value(name, format) {
            return value;
        }
        if name == BURST_TOKEN {
            return token.to_string();
        }
        if let Some(value) = self.user_variable(token, name) {
            return value.to_string();
        }
        if let Some(value) = self.get(name) {
            return value.to_string();
        }
        tracing::debug!(variable = name, token, "Unknown template variable");
        String::new()
    }

    fn date_value(&self, name: &str, format: Option<&str>) -> Option<String> {
        let now = self.now;
        let value = match name {
            NOW => match format {
                Some(pattern) => now.format(&java_date_pattern(pattern)).to_string(),
                None => now.format("%Y.%m.%d %H:%M:%S").to_string(),
            },
            NOW_DEFAULT_DATE | NOW_MEDIUM_DATE => now.format("%b %-d, %Y").to_string(),
            NOW_SHORT_DATE => now.format("%-m/%-d/%y").to_string(),
            NOW_LONG_DATE => now.format("%B %-d, %Y").to_string(),
            NOW_FULL_DATE => now.format("%A, %B %-d, %Y").to_string(),
            NOW_DEFAULT_TIME => now.format("%-I:%M:%S %p").to_string(),
            NOW_SHORT_TIME => now.format("%-I:%M %p").to_string(),
            NOW_QUARTER => ((now.month() - 1) / 3 + 1).to_string(),
            _ => return None,
        };
        Some(value)
    }
}

// ═══════════════════════════════════════════════════════════
// Date patterns
// ═══════════════════════════════════════════════════════════

/// Translate a `yyyy.MM.dd HH:mm:ss.SSS` style pattern into a chrono
/// format string. Text inside single quotes is literal.
pub fn java_date_pattern(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            // '' is a literal quote
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            i += 1;
            while i < chars.len() && chars[i] != '\'' {
                push_literal(&mut out, chars[i]);
                i += 1;
            }
            i += 1;
            continue;
        }
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let spec = match (c, run) {
            ('y', 2) => Some("%y"),
            ('y', _) => Some("%Y"),
            ('M', 1) => Some("%-m"),
            ('M', 2) => Some("%m"),
            ('M', 3) => Some("%b"),
            ('M', _) => Some("%B"),
            ('d', 1) => Some("%-d"),
            ('d', _) => Some("%d"),
            ('D', _) => Some("%j"),
            ('H', 1) => Some("%-H"),
            ('H', _) => Some("%H"),
            ('h', 1) => Some("%-I"),
            ('h', _) => Some("%I"),
            ('m', 1) => Some("%-M"),
            ('m', _) => Some("%M"),
            ('s', 1) => Some("%-S"),
            ('s', _) => Some("%S"),
            ('S', _) => Some("%3f"),
            ('E', 1..=3) => Some("%a"),
            ('E', _) => Some("%A"),
            ('a', _) => Some("%p"),
            ('z', _) => Some("%Z"),
            ('Z', _) => Some("%z"),
            _ => None,
        };
        match spec {
            Some(s) => out.push_str(s),
            None => {
                for _ in 0..run {
                    push_literal(&mut out, c);
                }
            }
        }
        i += run;
    }
    out
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}
