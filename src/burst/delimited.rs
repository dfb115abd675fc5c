//! Delimited-text bursting for `.csv`, `.tsv` and `.txt` exports.
//!
//! Each data row belongs to the token found in the configured id column
//! (or to its own row index). Every field is exposed to templates as a
//! positional user variable and, when a header exists, under its header
//! name as well.

use std::path::{Path, PathBuf};

use super::{run_hook, Burster, Fragment, ParsedMetadata};
use crate::context::BurstingContext;
use crate::error::BurstError;
use crate::hooks::{HookStage, LifecycleHook};
use crate::settings::DelimitedSettings;
use crate::variables;

/// How the token column is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdColumn {
    /// The 0-based row index is the token.
    NotUsed,
    First,
    Last,
    Index(usize),
    /// Header name, matched case-insensitively.
    Name(String),
}

impl IdColumn {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match value.to_lowercase().as_str() {
            "" | "notused" => Self::NotUsed,
            "firstcolumn" => Self::First,
            "lastcolumn" => Self::Last,
            _ => match value.parse::<usize>() {
                Ok(index) => Self::Index(index),
                Err(_) => Self::Name(value.to_string()),
            },
        }
    }
}

pub struct DelimitedBurster {
    path: PathBuf,
    extension: String,
    delimiter: u8,
    quote: u8,
    id_column: IdColumn,
    header: Option<Vec<String>>,
    rows: Vec<Vec<String>>,
}

impl DelimitedBurster {
    pub fn open(path: &Path, bytes: Vec<u8>, settings: &DelimitedSettings) -> Result<Self, BurstError> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "txt".into());
        let delimiter = match extension.as_str() {
            "csv" => b',',
            "tsv" => b'\t',
            _ => ascii_byte(settings.separator, "separator")?,
        };
        let quote = ascii_byte(settings.quote, "quote")?;

        let body = skip_lines(&bytes, settings.skip_lines);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .quote(quote)
            .has_headers(false)
            .flexible(true)
            .from_reader(body);
        let mut records = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| {
                BurstError::Input(format!("cannot read '{}': {e}", path.display()))
            })?;
            records.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        let header = if settings.header && !records.is_empty() {
            Some(records.remove(0))
        } else {
            None
        };
        tracing::debug!(
            path = %path.display(),
            rows = records.len(),
            header = header.is_some(),
            "Delimited source read"
        );
        Ok(Self {
            path: path.to_path_buf(),
            extension,
            delimiter,
            quote,
            id_column: IdColumn::parse(&settings.id_column),
            header,
            rows: records,
        })
    }

    fn column_for(&self, id: &IdColumn) -> Result<Option<usize>, BurstError> {
        match id {
            IdColumn::Name(name) => {
                let header = self.header.as_ref().ok_or_else(|| {
                    BurstError::Configuration(format!(
                        "id column '{name}' needs a header row in '{}'",
                        self.path.display()
                    ))
                })?;
                header
                    .iter()
                    .position(|h| h.trim().eq_ignore_ascii_case(name))
                    .map(Some)
                    .ok_or_else(|| {
                        BurstError::Configuration(format!(
                            "id column '{name}' not found in the header of '{}'",
                            self.path.display()
                        ))
                    })
            }
            IdColumn::Index(index) => Ok(Some(*index)),
            _ => Ok(None),
        }
    }

    fn token_of(&self, id: &IdColumn, column: Option<usize>, index: usize, row: &[String]) -> String {
        let field = match id {
            IdColumn::NotUsed => return index.to_string(),
            IdColumn::First => row.first(),
            IdColumn::Last => row.last(),
            IdColumn::Index(_) | IdColumn::Name(_) => column.and_then(|c| row.get(c)),
        };
        field.map(|f| f.trim().to_string()).unwrap_or_default()
    }
}

impl Burster for DelimitedBurster {
    fn output_extension(&self) -> &str {
        &self.extension
    }

    fn parse(
        &mut self,
        ctx: &mut BurstingContext,
        hook: &dyn LifecycleHook,
    ) -> Result<ParsedMetadata, BurstError> {
        let id = self.id_column.clone();
        let column = self.column_for(&id)?;
        let mut meta = ParsedMetadata {
            num_pages: self.rows.len(),
            ..Default::default()
        };

        for (index, row) in self.rows.iter().enumerate() {
            ctx.current_page_index = index + 1;
            ctx.current_page_text = row.join(" ");
            ctx.current_page_tokens.clear();
            run_hook(hook, HookStage::StartParsePage, ctx)?;

            let token = self.token_of(&id, column, index, row);
            if token.is_empty() {
                tracing::debug!(row = index, "Row has no token, skipped");
                run_hook(hook, HookStage::EndParsePage, ctx)?;
                continue;
            }
            meta.add(&token, Fragment::Row(index as u32));

            let vars = &mut ctx.variables;
            for (i, value) in row.iter().enumerate() {
                vars.set_user_variable(&token, &variables::user_var_name(i), value);
                if let Some(name) = self.header.as_ref().and_then(|h| h.get(i)) {
                    let name = name.trim();
                    if !name.is_empty() {
                        vars.set_user_variable(&token, name, value);
                    }
                }
            }
            vars.set_user_variable(&token, variables::ROW_INDEX, &index.to_string());
            vars.set_user_variable(&token, variables::ROW_NUMBER, &(index + 1).to_string());

            ctx.current_page_tokens = vec![token];
            run_hook(hook, HookStage::EndParsePage, ctx)?;
        }

        ctx.current_page_text.clear();
        ctx.current_page_tokens.clear();
        Ok(meta)
    }

    fn extract(
        &mut self,
        token: &str,
        fragments: &[Fragment],
        destination: &Path,
    ) -> Result<(), BurstError> {
        let rows: Vec<&Vec<String>> = fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::Row(r) => self.rows.get(*r as usize),
                _ => None,
            })
            .collect();
        if rows.is_empty() {
            return Err(BurstError::extraction(token, "no rows belong to this token"));
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BurstError::resource(parent, e))?;
        }
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .quote(self.quote)
            .flexible(true)
            .from_path(destination)
            .map_err(|e| BurstError::resource(destination, e))?;
        if let Some(header) = &self.header {
            writer
                .write_record(header)
                .map_err(|e| BurstError::resource(destination, e))?;
        }
        for row in &rows {
            writer
                .write_record(row.iter())
                .map_err(|e| BurstError::resource(destination, e))?;
        }
        writer.flush().map_err(|e| BurstError::resource(destination, e))?;
        tracing::debug!(token, rows = rows.len(), path = %destination.display(), "Rows extracted");
        Ok(())
    }
}

fn ascii_byte(c: char, what: &str) -> Result<u8, BurstError> {
    u8::try_from(c)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| BurstError::Configuration(format!("delimited {what} '{c}' must be a single ASCII character")))
}

fn skip_lines(bytes: &[u8], lines: usize) -> &[u8] {
    let mut rest = bytes;
    for _ in 0..lines {
        match rest.iter().position(|b| *b == b'\n') {
            Some(pos) => rest = &rest[pos + 1..],
            None => return &[],
        }
    }
    rest
}
