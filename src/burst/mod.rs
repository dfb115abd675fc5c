//! Per-format bursters.
//!
//! Each source format discovers burst tokens in a single pass
//! ([`Burster::parse`]) and rebuilds a standalone document for one token
//! ([`Burster::extract`]). The source is opened once per job and never
//! modified.
//!
//! ```text
//! .pdf          → PdfBurster
//! .xlsx / .xlsm → SpreadsheetBurster
//! .csv .tsv .txt → DelimitedBurster
//! ```

pub mod delimited;
pub mod pdf;
pub mod spreadsheet;

use std::collections::HashMap;
use std::path::Path;

use crate::context::BurstingContext;
use crate::error::BurstError;
use crate::hooks::{HookStage, LifecycleHook};
use crate::settings::Settings;
use crate::variables::{self, Variables};

pub use delimited::DelimitedBurster;
pub use pdf::PdfBurster;
pub use spreadsheet::SpreadsheetBurster;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// One piece of the source document that belongs to a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fragment {
    /// 1-based page number.
    Page(u32),
    /// 0-based row index within the source rows.
    Row(u32),
    /// 0-based sheet position within the workbook.
    Sheet(usize),
}

/// Result of the metadata pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMetadata {
    /// Tokens in discovery order, each listed once.
    pub tokens: Vec<String>,
    /// Fragments per token, in discovery order.
    pub fragments: HashMap<String, Vec<Fragment>>,
    /// Pages for page-based sources, data rows otherwise.
    pub num_pages: usize,
    /// Configuration path named inside the source, when present.
    pub custom_config: Option<String>,
}

impl ParsedMetadata {
    /// Record a fragment. First occurrence fixes the token's position;
    /// repeated fragments for the same token are not duplicated.
    pub fn add(&mut self, token: &str, fragment: Fragment) {
        match self.fragments.get_mut(token) {
            Some(list) => {
                if !list.contains(&fragment) {
                    list.push(fragment);
                }
            }
            None => {
                self.tokens.push(token.to_string());
                self.fragments.insert(token.to_string(), vec![fragment]);
            }
        }
    }

    pub fn fragments_for(&self, token: &str) -> &[Fragment] {
        self.fragments.get(token).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Metadata parser plus extractor for one source format.
pub trait Burster: Send {
    /// Extension of the documents this burster writes.
    fn output_extension(&self) -> &str;

    /// Discover tokens and their fragments, capturing user variables into
    /// `ctx.variables`. Page-based formats run the page hooks.
    fn parse(
        &mut self,
        ctx: &mut BurstingContext,
        hook: &dyn LifecycleHook,
    ) -> Result<ParsedMetadata, BurstError>;

    /// Write a standalone document holding `fragments` to `destination`.
    fn extract(
        &mut self,
        token: &str,
        fragments: &[Fragment],
        destination: &Path,
    ) -> Result<(), BurstError>;

    /// Release per-job resources. Called on every exit path.
    fn close(&mut self) {}
}

// ═══════════════════════════════════════════════════════════
// Factory
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Pdf,
    Spreadsheet,
    Delimited,
}

/// Pick the format from the file extension.
pub fn detect_format(path: &Path) -> Result<SourceFormat, BurstError> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => Ok(SourceFormat::Pdf),
        "xlsx" | "xlsm" => Ok(SourceFormat::Spreadsheet),
        "csv" | "tsv" | "txt" => Ok(SourceFormat::Delimited),
        "xls" => Err(BurstError::Input(format!(
            "legacy .xls workbooks are not supported, save '{}' as .xlsx",
            path.display()
        ))),
        _ => Err(BurstError::Input(format!(
            "unsupported input document type '{}'",
            path.display()
        ))),
    }
}

/// Open the source once and return the burster for its format.
pub fn open_burster(
    path: &Path,
    settings: &Settings,
    temp_dir: &Path,
) -> Result<Box<dyn Burster>, BurstError> {
    let format = detect_format(path)?;
    let bytes = std::fs::read(path).map_err(|e| {
        BurstError::Input(format!("cannot read input document '{}': {e}", path.display()))
    })?;
    tracing::debug!(path = %path.display(), ?format, size = bytes.len(), "Input document opened");
    let burster: Box<dyn Burster> = match format {
        SourceFormat::Pdf => Box::new(PdfBurster::open(path, bytes)?),
        SourceFormat::Spreadsheet => Box::new(SpreadsheetBurster::open(path, bytes, temp_dir)?),
        SourceFormat::Delimited => Box::new(DelimitedBurster::open(path, bytes, &settings.delimited)?),
    };
    Ok(burster)
}

// ═══════════════════════════════════════════════════════════
// Text helpers
// ═══════════════════════════════════════════════════════════

/// All substrings enclosed by `start`/`end`, left to right, non-nested.
pub fn substrings_between<'a>(text: &'a str, start: &str, end: &str) -> Vec<&'a str> {
    let mut found = Vec::new();
    if start.is_empty() || end.is_empty() {
        return found;
    }
    let mut rest = text;
    while let Some(open) = rest.find(start) {
        let after = &rest[open + start.len()..];
        match after.find(end) {
            Some(close) => {
                found.push(&after[..close]);
                rest = &after[close + end.len()..];
            }
            None => break,
        }
    }
    found
}

/// First substring enclosed by `start`/`end`.
pub fn substring_between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    substrings_between(text, start, end).into_iter().next()
}

/// Trim and drop control characters.
pub fn clean_token(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_control()).collect::<String>().trim().to_string()
}

/// Run a hook, surfacing its failure as a job error.
pub fn run_hook(
    hook: &dyn LifecycleHook,
    stage: HookStage,
    ctx: &mut BurstingContext,
) -> Result<(), BurstError> {
    hook.run(stage, ctx).map_err(|e| BurstError::Hook {
        stage: stage.to_string(),
        reason: e.to_string(),
    })
}

const SKIP_MARKERS: [(&str, &str); 2] = [("<s>", "</s>"), ("<skip>", "</skip>")];

/// Capture `<0>..</0>` style user variables and the skip marker for `token`.
pub fn capture_user_variables(vars: &mut Variables, token: &str, text: &str) {
    for index in 0..vars.max_user_variables() {
        let open = format!("<{index}>");
        let close = format!("</{index}>");
        if let Some(value) = substring_between(text, &open, &close) {
            vars.set_user_variable(token, &variables::user_var_name(index), value.trim());
        }
    }
    if let Some(value) = SKIP_MARKERS
        .iter()
        .find_map(|(open, close)| substring_between(text, open, close))
    {
        vars.set_user_variable(token, variables::SKIP, value.trim());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_first_occurrence_order() {
        let mut meta = ParsedMetadata::default();
        meta.add("b", Fragment::Page(1));
        meta.add("a", Fragment::Page(2));
        meta.add("b", Fragment::Page(3));
        meta.add("b", Fragment::Page(3));
        assert_eq!(meta.tokens, vec!["b", "a"]);
        assert_eq!(meta.fragments_for("b"), &[Fragment::Page(1), Fragment::Page(3)]);
        assert!(meta.fragments_for("zzz").is_empty());
    }

    #[test]
    fn detect_format_by_extension() {
        assert_eq!(detect_format(Path::new("a/b.PDF")).unwrap(), SourceFormat::Pdf);
        assert_eq!(detect_format(Path::new("b.xlsx")).unwrap(), SourceFormat::Spreadsheet);
        assert_eq!(detect_format(Path::new("b.tsv")).unwrap(), SourceFormat::Delimited);
        assert!(matches!(detect_format(Path::new("b.xls")), Err(BurstError::Input(_))));
        assert!(matches!(detect_format(Path::new("b.docx")), Err(BurstError::Input(_))));
    }

    #[test]
    fn missing_source_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_burster(&dir.path().join("none.pdf"), &Settings::default(), dir.path())
            .err()
            .unwrap();
        assert!(matches!(err, BurstError::Input(_)));
        assert!(err.to_string().contains("none.pdf"));
    }

    #[test]
    fn substrings_between_finds_all() {
        let text = "x {alpha} y {beta}{ gamma } {unterminated";
        assert_eq!(substrings_between(text, "{", "}"), vec!["alpha", "beta", " gamma "]);
        assert_eq!(substring_between("<c>cfg.json</c>", "<c>", "</c>"), Some("cfg.json"));
        assert!(substrings_between("abc", "", "}").is_empty());
    }

    #[test]
    fn clean_token_strips_controls() {
        assert_eq!(clean_token("  al\u{0007}pha\r\n "), "alpha");
    }
}
