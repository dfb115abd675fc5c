//! Spreadsheet bursting for `.xlsx` / `.xlsm` workbooks.
//!
//! A sheet literally named `burst` configures the job:
//!
//! ```text
//!      A            B                C                 D            E               F
//! 1  burstMethod  burstSheetIndex  burstColumnIndex  burstTokens  userVariables   configFile
//! 2  distinct-…   0                -1                alpha        <0>Alice</0>    cfg/x.json
//! 3                                                  beta         <s>true</s>
//! ```
//!
//! Without it every sheet is a token (`distinct-sheets`). The column
//! methods copy matching rows into a per-job template workbook built once
//! from the source with formulas frozen to their cached values.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tempfile::TempPath;

use super::{capture_user_variables, clean_token, run_hook, Burster, Fragment, ParsedMetadata};
use crate::context::BurstingContext;
use crate::error::BurstError;
use crate::hooks::{HookStage, LifecycleHook};
use crate::ooxml::workbook::{
    cell_value, format_range, insert_ordered, parse_range, CellRef, SheetInfo, REL_COMMENTS,
    REL_VML_DRAWING,
};
use crate::ooxml::{Element, Workbook};

pub const METADATA_SHEET: &str = "burst";
pub const KEEP_ROW: &str = "keep-row";

const TOKENS_HEADER: &str = "burstTokens";
const USER_VARIABLES_HEADER: &str = "userVariables";

static VML_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<v:shape\b.*?</v:shape>").unwrap());
static VML_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<x:Row>\s*(\d+)\s*</x:Row>").unwrap());
static VML_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<x:Anchor>([^<]*)</x:Anchor>").unwrap());

// ═══════════════════════════════════════════════════════════
// Metadata sheet
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstMethod {
    DistinctSheets,
    DistinctColumnValues,
    DistinctColumnValuesCopy,
}

impl BurstMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DistinctSheets => "distinct-sheets",
            Self::DistinctColumnValues => "distinct-column-values",
            Self::DistinctColumnValuesCopy => "distinct-column-values-copy",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BurstError> {
        match value.trim() {
            "" => Err(BurstError::Configuration(format!(
                "mandatory 'burstMethod' is missing in the '{METADATA_SHEET}' sheet (cell A2)"
            ))),
            "distinct-sheets" => Ok(Self::DistinctSheets),
            "distinct-column-values" => Ok(Self::DistinctColumnValues),
            "distinct-column-values-copy" => Ok(Self::DistinctColumnValuesCopy),
            other => Err(BurstError::Configuration(format!(
                "burstMethod '{other}' is misspelled, expected one of distinct-sheets, \
                 distinct-column-values, distinct-column-values-copy"
            ))),
        }
    }
}

/// Settings read from the `burst` sheet.
#[derive(Debug, Clone, PartialEq)]
struct BurstSheet {
    method: BurstMethod,
    sheet_index: usize,
    /// `None` means the last column of the target sheet.
    column_index: Option<u32>,
    /// Explicit token list with the variable text on the same row.
    tokens: Vec<(String, String)>,
    custom_config: Option<String>,
}

impl BurstSheet {
    fn read(rows: &[SourceRow]) -> Result<Self, BurstError> {
        let second = rows.iter().find(|r| r.index == 1);
        let cell = |col: u32| second.map(|r| r.value(col).trim().to_string()).unwrap_or_default();

        let method = BurstMethod::parse(&cell(0))?;
        let mut sheet_index = 0;
        let mut column_index = None;
        if method != BurstMethod::DistinctSheets {
            sheet_index = mandatory_number(&cell(1), "burstSheetIndex", "B2")?.max(0) as usize;
            let column = mandatory_number(&cell(2), "burstColumnIndex", "C2")?;
            column_index = u32::try_from(column).ok();
        }

        let mut tokens: Vec<(String, String)> = Vec::new();
        for row in rows {
            let token = clean_token(row.value(3));
            if token.is_empty() || token.ends_with(TOKENS_HEADER) {
                continue;
            }
            if tokens.iter().any(|(t, _)| *t == token) {
                continue;
            }
            let vars = row.value(4).trim();
            let vars = if vars == USER_VARIABLES_HEADER { "" } else { vars };
            tokens.push((token, vars.to_string()));
        }

        let config = cell(5);
        Ok(Self {
            method,
            sheet_index,
            column_index,
            tokens,
            custom_config: (!config.is_empty()).then_some(config),
        })
    }
}

fn mandatory_number(value: &str, name: &str, cell: &str) -> Result<i64, BurstError> {
    if value.is_empty() {
        return Err(BurstError::Configuration(format!(
            "mandatory '{name}' is missing in the '{METADATA_SHEET}' sheet (cell {cell})"
        )));
    }
    value
        .parse::<f64>()
        .map(|n| n.trunc() as i64)
        .map_err(|_| BurstError::Configuration(format!("'{name}' must be a number, found '{value}'")))
}

// ═══════════════════════════════════════════════════════════
// Source rows
// ═══════════════════════════════════════════════════════════

/// Display values of one row, by zero-based column.
#[derive(Debug, Clone)]
struct SourceRow {
    index: u32,
    cells: Vec<(u32, String)>,
}

impl SourceRow {
    fn value(&self, col: u32) -> &str {
        self.cells
            .iter()
            .find(|(c, _)| *c == col)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    fn last_col(&self) -> Option<u32> {
        self.cells.iter().map(|(c, _)| *c).max()
    }

    fn text(&self) -> String {
        self.cells.iter().map(|(_, v)| v.as_str()).collect::<Vec<_>>().join("\t")
    }
}

/// Zero-based row index from `r`, or the next one after `previous`.
fn row_index(row: &Element, previous: Option<u32>) -> u32 {
    row.attr("r")
        .and_then(|r| r.parse::<u32>().ok())
        .filter(|r| *r > 0)
        .map(|r| r - 1)
        .unwrap_or_else(|| previous.map_or(0, |p| p + 1))
}

fn read_rows(worksheet: &Element, shared: &[String]) -> Vec<SourceRow> {
    let Some(data) = worksheet.child("sheetData") else {
        return Vec::new();
    };
    let mut rows = Vec::new();
    let mut previous = None;
    for row in data.children_named("row") {
        let index = row_index(row, previous);
        previous = Some(index);
        let mut cells = Vec::new();
        let mut last_col: Option<u32> = None;
        for cell in row.children_named("c") {
            let col = cell
                .attr("r")
                .and_then(CellRef::parse)
                .map(|r| r.col)
                .unwrap_or_else(|| last_col.map_or(0, |c| c + 1));
            last_col = Some(col);
            let value = cell_value(cell, shared);
            if !value.is_empty() {
                cells.push((col, value));
            }
        }
        rows.push(SourceRow { index, cells });
    }
    rows
}

// ═══════════════════════════════════════════════════════════
// Burster
// ═══════════════════════════════════════════════════════════

/// Target sheet of a column method.
#[derive(Debug, Clone)]
struct RowTarget {
    sheet: SheetInfo,
    /// Position once the metadata sheet is gone.
    position: usize,
}

/// Frozen copy of the target sheet plus the per-job template file.
struct Prepared {
    template: TempPath,
    part: String,
    worksheet: Element,
    cell_xfs: Vec<Element>,
    comments: Option<(String, Element)>,
    vml: Option<(String, String)>,
}

pub struct SpreadsheetBurster {
    path: PathBuf,
    extension: String,
    source: Workbook,
    temp_dir: PathBuf,
    target: Option<RowTarget>,
    prepared: Option<Prepared>,
}

impl SpreadsheetBurster {
    pub fn open(path: &Path, bytes: Vec<u8>, temp_dir: &Path) -> Result<Self, BurstError> {
        let source = Workbook::from_bytes(&bytes).map_err(|e| {
            BurstError::Input(format!("cannot open workbook '{}': {e}", path.display()))
        })?;
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "xlsx".into());
        Ok(Self {
            path: path.to_path_buf(),
            extension,
            source,
            temp_dir: temp_dir.to_path_buf(),
            target: None,
            prepared: None,
        })
    }

    fn sheet_rows(&self, sheet: &SheetInfo, shared: &[String]) -> Result<Vec<SourceRow>, BurstError> {
        let doc = self.source.package().xml(&sheet.part)?;
        Ok(read_rows(&doc.root, shared))
    }

    fn parse_sheets(
        &self,
        sheets: &[SheetInfo],
        ctx: &mut BurstingContext,
        hook: &dyn LifecycleHook,
    ) -> Result<ParsedMetadata, BurstError> {
        let mut meta = ParsedMetadata::default();
        for (position, sheet) in sheets.iter().enumerate() {
            if sheet.name == METADATA_SHEET {
                continue;
            }
            ctx.current_page_index = position + 1;
            ctx.current_page_text = sheet.name.clone();
            ctx.current_page_tokens = vec![sheet.name.clone()];
            run_hook(hook, HookStage::StartParsePage, ctx)?;
            meta.add(&sheet.name, Fragment::Sheet(position));
            run_hook(hook, HookStage::EndParsePage, ctx)?;
        }
        meta.num_pages = meta.tokens.len();
        Ok(meta)
    }

    fn parse_rows(
        &mut self,
        config: &BurstSheet,
        sheets: &[SheetInfo],
        shared: &[String],
        ctx: &mut BurstingContext,
        hook: &dyn LifecycleHook,
    ) -> Result<ParsedMetadata, BurstError> {
        let sheet = sheets.get(config.sheet_index).ok_or_else(|| {
            BurstError::Configuration(format!(
                "burstSheetIndex {} is out of range, '{}' has {} sheets",
                config.sheet_index,
                self.path.display(),
                sheets.len()
            ))
        })?;
        if sheet.name == METADATA_SHEET {
            return Err(BurstError::Configuration(format!(
                "burstSheetIndex {} points at the '{METADATA_SHEET}' sheet itself",
                config.sheet_index
            )));
        }
        let position = sheets[..config.sheet_index]
            .iter()
            .filter(|s| s.name != METADATA_SHEET)
            .count();
        self.target = Some(RowTarget {
            sheet: sheet.clone(),
            position,
        });

        let rows = self.sheet_rows(sheet, shared)?;
        let mut meta = ParsedMetadata {
            num_pages: rows.len(),
            ..Default::default()
        };
        let Some(first) = rows.first() else {
            return Ok(meta);
        };
        let first_last = first.last_col().unwrap_or(0);
        let column = config.column_index.map_or(first_last, |c| c.min(first_last));
        let derive_tokens = config.tokens.is_empty();

        // Burst column value per row; header and blank rows are kept rows.
        let mut keyed: Vec<(u32, String)> = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            ctx.current_page_index = row.index as usize + 1;
            ctx.current_page_text = row.text();
            run_hook(hook, HookStage::StartParsePage, ctx)?;

            let raw = row.value(column).trim();
            let key = if raw.is_empty() || (derive_tokens && i == 0) {
                KEEP_ROW.to_string()
            } else {
                raw.to_string()
            };
            ctx.current_page_tokens = if key == KEEP_ROW { Vec::new() } else { vec![key.clone()] };
            run_hook(hook, HookStage::EndParsePage, ctx)?;
            keyed.push((row.index, key));
        }

        let tokens: Vec<String> = if derive_tokens {
            let mut seen = HashSet::new();
            keyed
                .iter()
                .map(|(_, k)| k)
                .filter(|k| *k != KEEP_ROW && seen.insert(k.as_str()))
                .cloned()
                .collect()
        } else {
            config.tokens.iter().map(|(t, _)| t.clone()).collect()
        };

        for token in &tokens {
            for (index, key) in &keyed {
                if key == KEEP_ROW || key == token {
                    meta.add(token, Fragment::Row(*index));
                }
            }
        }
        for (token, text) in &config.tokens {
            capture_user_variables(&mut ctx.variables, token, text);
        }
        tracing::debug!(
            sheet = %sheet.name,
            column,
            rows = rows.len(),
            tokens = meta.tokens.len(),
            "Burst column scanned"
        );
        Ok(meta)
    }

    /// Freeze formulas and write the empty template, once per job.
    fn prepare(&mut self) -> Result<&Prepared, BurstError> {
        if self.prepared.is_none() {
            let target = self.target.clone().ok_or_else(|| {
                BurstError::Input("rows requested before the workbook was parsed".into())
            })?;
            self.prepared = Some(self.build_template(&target)?);
        }
        self.prepared
            .as_ref()
            .ok_or_else(|| BurstError::Input("template unavailable".into()))
    }

    fn build_template(&self, target: &RowTarget) -> Result<Prepared, BurstError> {
        let part = target.sheet.part.clone();
        let mut frozen = self.source.clone();
        let frozen_cells = frozen.freeze_formulas()?;

        let worksheet = frozen.package().xml(&part)?.root;
        let cell_xfs = match frozen.styles_part()? {
            Some(styles) if frozen.package().has_part(&styles) => frozen
                .package()
                .xml(&styles)?
                .root
                .child("cellXfs")
                .map(|xfs| xfs.children_named("xf").cloned().collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let comments = match frozen.related_part(&part, REL_COMMENTS)? {
            Some(p) if frozen.package().has_part(&p) => {
                let root = frozen.package().xml(&p)?.root;
                Some((p, root))
            }
            _ => None,
        };
        let vml = match frozen.related_part(&part, REL_VML_DRAWING)? {
            Some(p) => frozen
                .package()
                .part(&p)
                .map(|data| (p.clone(), String::from_utf8_lossy(data).into_owned())),
            None => None,
        };

        let mut template = frozen;
        let mut sheet = template.package().xml(&part)?;
        if let Some(data) = sheet.root.child_mut("sheetData") {
            data.children.clear();
        }
        sheet.root.remove_children_named("mergeCells");
        sheet.root.remove_children_named("hyperlinks");
        template.package_mut().set_xml(&part, &sheet);

        if let Some((comments_part, _)) = &comments {
            let mut doc = template.package().xml(comments_part)?;
            if let Some(list) = doc.root.child_mut("commentList") {
                list.children.clear();
            }
            template.package_mut().set_xml(comments_part, &doc);
        }
        if let Some((vml_part, text)) = &vml {
            let stripped = VML_SHAPE.replace_all(text, |caps: &Captures| {
                if is_note_shape(&caps[0]) {
                    String::new()
                } else {
                    caps[0].to_string()
                }
            });
            template
                .package_mut()
                .set_part(vml_part, stripped.into_owned().into_bytes());
        }

        template.retain_sheets(|s| s.name != METADATA_SHEET)?;
        template.set_active_sheet(target.position)?;

        std::fs::create_dir_all(&self.temp_dir)
            .map_err(|e| BurstError::resource(&self.temp_dir, e))?;
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workbook".into());
        let file = tempfile::Builder::new()
            .prefix(&format!("{stem}_"))
            .suffix(&format!(".{}", self.extension))
            .tempfile_in(&self.temp_dir)
            .map_err(|e| BurstError::resource(&self.temp_dir, e))?;
        let template_path = file.into_temp_path();
        template.save(&template_path)?;
        tracing::info!(
            template = %template_path.display(),
            sheet = %target.sheet.name,
            frozen_cells,
            "Row-copy template created"
        );

        Ok(Prepared {
            template: template_path,
            part,
            worksheet,
            cell_xfs,
            comments,
            vml,
        })
    }

    fn extract_sheet(&self, token: &str, positions: &[usize], destination: &Path) -> Result<(), BurstError> {
        let sheets = self.source.sheets()?;
        let keep: HashSet<&str> = positions
            .iter()
            .filter_map(|p| sheets.get(*p))
            .map(|s| s.name.as_str())
            .collect();
        if keep.is_empty() {
            return Err(BurstError::extraction(token, "no sheet belongs to this token"));
        }
        let mut workbook = self.source.clone();
        workbook.retain_sheets(|s| keep.contains(s.name.as_str()))?;
        workbook.save(destination)?;
        Ok(())
    }

    fn extract_rows(&mut self, token: &str, rows: &[u32], destination: &Path) -> Result<(), BurstError> {
        let prepared = self.prepare()?;
        let mut workbook = Workbook::open(&prepared.template)
            .map_err(|e| BurstError::extraction(token, format!("template unreadable: {e}")))?;
        copy_rows(&mut workbook, prepared, rows)?;
        workbook.save(destination)?;
        Ok(())
    }
}

impl Burster for SpreadsheetBurster {
    fn output_extension(&self) -> &str {
        &self.extension
    }

    fn parse(
        &mut self,
        ctx: &mut BurstingContext,
        hook: &dyn LifecycleHook,
    ) -> Result<ParsedMetadata, BurstError> {
        let sheets = self.source.sheets()?;
        let shared = self.source.shared_strings()?;

        let Some(meta_sheet) = sheets.iter().find(|s| s.name == METADATA_SHEET) else {
            tracing::debug!(sheets = sheets.len(), "No '{}' sheet, bursting by sheet", METADATA_SHEET);
            let meta = self.parse_sheets(&sheets, ctx, hook)?;
            clear_page_state(ctx);
            return Ok(meta);
        };

        let config = BurstSheet::read(&self.sheet_rows(meta_sheet, &shared)?)?;
        if let Some(custom) = &config.custom_config {
            if *custom != ctx.config_path && !ctx.settings.is_second_pass() {
                tracing::info!(config = %custom, "Workbook names its own configuration");
                return Ok(ParsedMetadata {
                    custom_config: Some(custom.clone()),
                    ..Default::default()
                });
            }
        }
        tracing::info!(method = config.method.as_str(), "Workbook burst method");

        let meta = match config.method {
            BurstMethod::DistinctSheets => {
                let meta = self.parse_sheets(&sheets, ctx, hook)?;
                for (token, text) in &config.tokens {
                    capture_user_variables(&mut ctx.variables, token, text);
                }
                meta
            }
            BurstMethod::DistinctColumnValues | BurstMethod::DistinctColumnValuesCopy => {
                self.parse_rows(&config, &sheets, &shared, ctx, hook)?
            }
        };
        clear_page_state(ctx);
        Ok(meta)
    }

    fn extract(
        &mut self,
        token: &str,
        fragments: &[Fragment],
        destination: &Path,
    ) -> Result<(), BurstError> {
        let mut sheets = Vec::new();
        let mut rows = Vec::new();
        for fragment in fragments {
            match fragment {
                Fragment::Sheet(p) => sheets.push(*p),
                Fragment::Row(r) => rows.push(*r),
                Fragment::Page(_) => {}
            }
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BurstError::resource(parent, e))?;
        }
        if !sheets.is_empty() {
            self.extract_sheet(token, &sheets, destination)?;
        } else if !rows.is_empty() {
            self.extract_rows(token, &rows, destination)?;
        } else {
            return Err(BurstError::extraction(token, "no rows or sheets belong to this token"));
        }
        tracing::debug!(
            token,
            sheets = sheets.len(),
            rows = rows.len(),
            path = %destination.display(),
            "Workbook extracted"
        );
        Ok(())
    }

    fn close(&mut self) {
        if let Some(prepared) = self.prepared.take() {
            let path = prepared.template.to_path_buf();
            if let Err(e) = prepared.template.close() {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete template workbook");
            }
        }
    }
}

fn clear_page_state(ctx: &mut BurstingContext) {
    ctx.current_page_text.clear();
    ctx.current_page_tokens.clear();
}

fn is_note_shape(shape: &str) -> bool {
    shape.contains(r#"ObjectType="Note""#)
}

// ═══════════════════════════════════════════════════════════
// Row copy
// ═══════════════════════════════════════════════════════════

/// Maps source cell formats to the first identical format in the
/// destination, appending one when none matches.
struct StyleCache<'a> {
    source: &'a [Element],
    destination: Vec<Element>,
    mapped: HashMap<u32, u32>,
    appended: bool,
}

impl<'a> StyleCache<'a> {
    fn new(source: &'a [Element], destination: Vec<Element>) -> Self {
        Self {
            source,
            destination,
            mapped: HashMap::new(),
            appended: false,
        }
    }

    fn map(&mut self, index: u32) -> u32 {
        if let Some(mapped) = self.mapped.get(&index) {
            return *mapped;
        }
        let mapped = match self.source.get(index as usize) {
            Some(xf) => match self.destination.iter().position(|d| d == xf) {
                Some(existing) => existing as u32,
                None => {
                    self.destination.push(xf.clone());
                    self.appended = true;
                    (self.destination.len() - 1) as u32
                }
            },
            None => index,
        };
        self.mapped.insert(index, mapped);
        mapped
    }

    fn remap_attr(&mut self, element: &mut Element) {
        if let Some(style) = element.attr("s").and_then(|s| s.parse::<u32>().ok()) {
            let mapped = self.map(style);
            element.set_attr("s", &mapped.to_string());
        }
    }
}

fn destination_cell_xfs(workbook: &Workbook) -> Result<(Option<String>, Vec<Element>), BurstError> {
    let Some(part) = workbook.styles_part()? else {
        return Ok((None, Vec::new()));
    };
    if !workbook.package().has_part(&part) {
        return Ok((None, Vec::new()));
    }
    let styles = workbook.package().xml(&part)?;
    let xfs = styles
        .root
        .child("cellXfs")
        .map(|x| x.children_named("xf").cloned().collect())
        .unwrap_or_default();
    Ok((Some(part), xfs))
}

/// Copy `rows` (source indices, in order) into the template's target
/// sheet at rows `0..rows.len()`.
fn copy_rows(workbook: &mut Workbook, prepared: &Prepared, rows: &[u32]) -> Result<(), BurstError> {
    let new_index: HashMap<u32, u32> = rows
        .iter()
        .enumerate()
        .map(|(i, r)| (*r, i as u32))
        .collect();

    let mut source_rows: HashMap<u32, &Element> = HashMap::new();
    if let Some(data) = prepared.worksheet.child("sheetData") {
        let mut previous = None;
        for row in data.children_named("row") {
            let index = row_index(row, previous);
            previous = Some(index);
            source_rows.insert(index, row);
        }
    }

    let (styles_part, destination_xfs) = destination_cell_xfs(workbook)?;
    let mut styles = StyleCache::new(&prepared.cell_xfs, destination_xfs);

    let mut sheet = workbook.package().xml(&prepared.part)?;
    let mut copied = Vec::with_capacity(rows.len());
    let mut max_col: Option<u32> = None;
    for (target, source) in rows.iter().enumerate() {
        let Some(row) = source_rows.get(source) else { continue };
        let target = target as u32;
        let mut row = (*row).clone();
        row.set_attr("r", &(target + 1).to_string());
        styles.remap_attr(&mut row);
        let mut last_col: Option<u32> = None;
        for cell in row.elements_mut().filter(|c| c.local_name() == "c") {
            let col = cell
                .attr("r")
                .and_then(CellRef::parse)
                .map(|r| r.col)
                .unwrap_or_else(|| last_col.map_or(0, |c| c + 1));
            last_col = Some(col);
            max_col = Some(max_col.map_or(col, |m| m.max(col)));
            cell.set_attr("r", &CellRef::new(col, target).to_string());
            styles.remap_attr(cell);
        }
        copied.push(row);
    }
    let copied_rows = copied.len();
    if let Some(data) = sheet.root.child_mut("sheetData") {
        for row in copied {
            data.push(row);
        }
    }

    let shift = |reference: &str| -> Option<String> {
        let (first, last) = parse_range(reference)?;
        let row = *new_index.get(&first.row)?;
        let span = last.row.saturating_sub(first.row);
        Some(format_range(
            CellRef::new(first.col, row),
            CellRef::new(last.col, row + span),
        ))
    };

    if let Some(merges) = prepared.worksheet.child("mergeCells") {
        let mut out = Element::new("mergeCells");
        for merge in merges.children_named("mergeCell") {
            if let Some(reference) = merge.attr("ref").and_then(shift) {
                out.push(merge.clone().with_attr("ref", &reference));
            }
        }
        let count = out.elements().count();
        if count > 0 {
            out.set_attr("count", &count.to_string());
            insert_ordered(&mut sheet.root, out);
        }
    }

    if let Some(links) = prepared.worksheet.child("hyperlinks") {
        let mut out = Element::new("hyperlinks");
        for link in links.children_named("hyperlink") {
            if let Some(reference) = link.attr("ref").and_then(shift) {
                out.push(link.clone().with_attr("ref", &reference));
            }
        }
        if out.elements().next().is_some() {
            insert_ordered(&mut sheet.root, out);
        }
    }

    let dimension = match max_col {
        Some(col) if copied_rows > 0 => format_range(
            CellRef::new(0, 0),
            CellRef::new(col, rows.len().saturating_sub(1) as u32),
        ),
        _ => "A1".to_string(),
    };
    match sheet.root.child_mut("dimension") {
        Some(dim) => dim.set_attr("ref", &dimension),
        None => insert_ordered(&mut sheet.root, Element::new("dimension").with_attr("ref", &dimension)),
    }
    select_first_cell(&mut sheet.root);
    workbook.package_mut().set_xml(&prepared.part, &sheet);

    if let Some((part, source)) = &prepared.comments {
        if workbook.package().has_part(part) {
            let mut doc = workbook.package().xml(part)?;
            if let Some(list) = doc.root.child_mut("commentList") {
                if let Some(source_list) = source.child("commentList") {
                    for comment in source_list.children_named("comment") {
                        if let Some(reference) = comment.attr("ref").and_then(shift) {
                            list.push(comment.clone().with_attr("ref", &reference));
                        }
                    }
                }
            }
            workbook.package_mut().set_xml(part, &doc);
        }
    }

    if let Some((part, source)) = &prepared.vml {
        if let Some(template) = workbook.package().part(part) {
            let template = String::from_utf8_lossy(template).into_owned();
            let shapes: String = VML_SHAPE
                .find_iter(source)
                .map(|m| m.as_str())
                .filter(|shape| is_note_shape(shape))
                .filter_map(|shape| remap_vml_shape(shape, &new_index))
                .collect();
            let merged = match template.rfind("</xml>") {
                Some(end) => format!("{}{}{}", &template[..end], shapes, &template[end..]),
                None => format!("{template}{shapes}"),
            };
            workbook.package_mut().set_part(part, merged.into_bytes());
        }
    }

    if styles.appended {
        if let Some(part) = styles_part {
            let mut doc = workbook.package().xml(&part)?;
            if let Some(xfs) = doc.root.child_mut("cellXfs") {
                xfs.remove_children_named("xf");
                let count = styles.destination.len();
                for xf in styles.destination {
                    xfs.push(xf);
                }
                xfs.set_attr("count", &count.to_string());
            }
            workbook.package_mut().set_xml(&part, &doc);
        }
    }
    Ok(())
}

/// Note anchors list `col, dx, row, dy, col, dx, row, dy`; both rows
/// move with the cell.
fn remap_vml_shape(shape: &str, new_index: &HashMap<u32, u32>) -> Option<String> {
    let row: u32 = VML_ROW.captures(shape)?.get(1)?.as_str().parse().ok()?;
    let target = *new_index.get(&row)?;
    let delta = target as i64 - row as i64;
    let shape = VML_ROW.replace(shape, format!("<x:Row>{target}</x:Row>").as_str());
    let shape = VML_ANCHOR.replace(&shape, |caps: &Captures| {
        let moved: Vec<String> = caps[1]
            .split(',')
            .enumerate()
            .map(|(i, v)| {
                let v = v.trim();
                match (i, v.parse::<i64>()) {
                    (2 | 6, Ok(n)) => (n + delta).max(0).to_string(),
                    _ => v.to_string(),
                }
            })
            .collect();
        format!("<x:Anchor>{}</x:Anchor>", moved.join(", "))
    });
    Some(shape.into_owned())
}

fn select_first_cell(worksheet: &mut Element) {
    let Some(views) = worksheet.child_mut("sheetViews") else {
        return;
    };
    for view in views.elements_mut().filter(|v| v.local_name() == "sheetView") {
        let mut selected = false;
        for selection in view.elements_mut().filter(|s| s.local_name() == "selection") {
            selection.set_attr("activeCell", "A1");
            selection.set_attr("sqref", "A1");
            selected = true;
        }
        if !selected {
            view.push(
                Element::new("selection")
                    .with_attr("activeCell", "A1")
                    .with_attr("sqref", "A1"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookError, NoopHook};
    use crate::ooxml::workbook::tests::{build_xlsx, Cell, SheetSpec};
    use crate::settings::Settings;

    fn burst_sheet<'a>(method: &'a str, sheet: &'a str, column: &'a str, tokens: &[(&'a str, &'a str)]) -> SheetSpec<'a> {
        let mut rows = vec![
            vec![
                Cell::Str("burstMethod"),
                Cell::Str("burstSheetIndex"),
                Cell::Str("burstColumnIndex"),
                Cell::Str("burstTokens"),
                Cell::Str("userVariables"),
            ],
            vec![Cell::Str(method), Cell::Str(sheet), Cell::Str(column)],
        ];
        for (i, (token, vars)) in tokens.iter().enumerate() {
            if rows.len() <= i + 1 {
                rows.push(Vec::new());
            }
            let row = &mut rows[i + 1];
            while row.len() < 3 {
                row.push(Cell::Blank);
            }
            row.push(Cell::Str(token));
            row.push(Cell::Str(vars));
        }
        SheetSpec::new(METADATA_SHEET, rows)
    }

    fn sales_sheet<'a>() -> SheetSpec<'a> {
        let mut sheet = SheetSpec::new(
            "Sales",
            vec![
                vec![Cell::Styled("Item", 1), Cell::Styled("Amount", 1), Cell::Styled("Region", 2)],
                vec![Cell::Str("Pens"), Cell::Num(10.0), Cell::Str("north")],
                vec![Cell::Str("Ink"), Cell::Formula("B2*2", "20"), Cell::Str("south")],
                vec![Cell::Str("Total"), Cell::Num(30.0), Cell::Str(KEEP_ROW)],
                vec![Cell::Str("Paper"), Cell::Num(5.0), Cell::Str("north")],
            ],
        );
        sheet.merges.push("A5:B6");
        sheet.comments.push(("A5", "restocked"));
        sheet.hyperlinks.push(("A3", "https://example.com/ink"));
        sheet
    }

    fn open(dir: &Path, sheets: &[SheetSpec]) -> SpreadsheetBurster {
        SpreadsheetBurster::open(Path::new("/in/Sales.xlsx"), build_xlsx(sheets), dir).unwrap()
    }

    fn ctx() -> BurstingContext {
        BurstingContext::new(PathBuf::from("/in/Sales.xlsx"), Settings::default(), PathBuf::from("/tmp"))
    }

    fn output_rows(path: &Path, sheet: usize) -> (Workbook, Vec<Vec<String>>) {
        let wb = Workbook::open(path).unwrap();
        let info = wb.sheets().unwrap()[sheet].clone();
        let shared = wb.shared_strings().unwrap();
        let doc = wb.package().xml(&info.part).unwrap();
        let rows = read_rows(&doc.root, &shared)
            .into_iter()
            .map(|r| r.cells.into_iter().map(|(_, v)| v).collect())
            .collect();
        (wb, rows)
    }

    #[test]
    fn method_names_validated() {
        assert_eq!(BurstMethod::parse("distinct-sheets").unwrap(), BurstMethod::DistinctSheets);
        let missing = BurstMethod::parse(" ").unwrap_err();
        assert!(missing.to_string().contains("burstMethod"));
        let wrong = BurstMethod::parse("distinct-colum-values").unwrap_err();
        assert!(matches!(wrong, BurstError::Configuration(_)));
        assert!(wrong.to_string().contains("misspelled"));
    }

    #[test]
    fn no_metadata_sheet_bursts_by_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[
                SheetSpec::new("North", vec![vec![Cell::Str("n")]]),
                SheetSpec::new("South", vec![vec![Cell::Str("s")]]),
            ],
        );
        let meta = burster.parse(&mut ctx(), &NoopHook).unwrap();
        assert_eq!(meta.tokens, vec!["North", "South"]);

        let dest = dir.path().join("South.xlsx");
        burster.extract("South", meta.fragments_for("South"), &dest).unwrap();
        let (wb, rows) = output_rows(&dest, 0);
        assert_eq!(wb.sheets().unwrap().len(), 1);
        assert_eq!(wb.sheets().unwrap()[0].name, "South");
        assert_eq!(rows, vec![vec!["s".to_string()]]);
    }

    #[test]
    fn distinct_sheets_method_skips_metadata_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[
                burst_sheet("distinct-sheets", "", "", &[]),
                SheetSpec::new("North", vec![vec![Cell::Str("n")]]),
            ],
        );
        let meta = burster.parse(&mut ctx(), &NoopHook).unwrap();
        assert_eq!(meta.tokens, vec!["North"]);
        assert_eq!(meta.fragments_for("North"), &[Fragment::Sheet(1)]);
    }

    #[test]
    fn missing_sheet_index_is_named() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[burst_sheet("distinct-column-values", "", "-1", &[]), sales_sheet()],
        );
        let err = burster.parse(&mut ctx(), &NoopHook).unwrap_err();
        assert!(matches!(err, BurstError::Configuration(_)));
        assert!(err.to_string().contains("burstSheetIndex"));
    }

    #[test]
    fn misspelled_method_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(dir.path(), &[burst_sheet("by-column", "1", "-1", &[]), sales_sheet()]);
        let err = burster.parse(&mut ctx(), &NoopHook).unwrap_err();
        assert!(err.to_string().contains("misspelled"));
    }

    #[test]
    fn last_column_values_become_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[burst_sheet("distinct-column-values", "1", "-1", &[]), sales_sheet()],
        );
        let meta = burster.parse(&mut ctx(), &NoopHook).unwrap();
        assert_eq!(meta.tokens, vec!["north", "south"]);
        assert_eq!(
            meta.fragments_for("north"),
            &[Fragment::Row(0), Fragment::Row(1), Fragment::Row(3), Fragment::Row(4)]
        );
        assert_eq!(
            meta.fragments_for("south"),
            &[Fragment::Row(0), Fragment::Row(2), Fragment::Row(3)]
        );
        assert_eq!(meta.num_pages, 5);
    }

    #[test]
    fn explicit_tokens_and_user_variables() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[
                burst_sheet(
                    "distinct-column-values",
                    "1",
                    "2",
                    &[("south", "<0>Sam</0>"), ("north", "<0>Nina</0><s>true</s>")],
                ),
                sales_sheet(),
            ],
        );
        let mut ctx = ctx();
        let meta = burster.parse(&mut ctx, &NoopHook).unwrap();
        assert_eq!(meta.tokens, vec!["south", "north"]);
        assert_eq!(ctx.variables.user_variable("south", "var0"), Some("Sam"));
        assert!(ctx.variables.skip_requested("north"));
        assert!(!ctx.variables.skip_requested("south"));
        // Explicit lists treat the header row like any other row.
        assert_eq!(meta.fragments_for("south"), &[Fragment::Row(2), Fragment::Row(3)]);
    }

    #[test]
    fn custom_config_cell_stops_parse() {
        let dir = tempfile::tempdir().unwrap();
        let mut sheet = burst_sheet("distinct-column-values", "1", "-1", &[]);
        sheet.rows[1].extend([Cell::Blank, Cell::Blank, Cell::Str("cfg/sales.json")]);
        let mut burster = open(dir.path(), &[sheet, sales_sheet()]);
        let meta = burster.parse(&mut ctx(), &NoopHook).unwrap();
        assert_eq!(meta.custom_config.as_deref(), Some("cfg/sales.json"));
        assert!(meta.tokens.is_empty());
    }

    #[test]
    fn custom_config_cell_ignored_in_second_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut sheet = burst_sheet("distinct-column-values", "1", "-1", &[]);
        sheet.rows[1].extend([Cell::Blank, Cell::Blank, Cell::Str("cfg/sales.json")]);
        let mut burster = open(dir.path(), &[sheet, sales_sheet()]);
        let mut ctx = ctx();
        ctx.settings = ctx.settings.for_second_pass(dir.path());
        let meta = burster.parse(&mut ctx, &NoopHook).unwrap();
        assert!(meta.custom_config.is_none());
        assert!(!meta.tokens.is_empty());
    }

    #[test]
    fn row_copy_keeps_matching_and_keep_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[burst_sheet("distinct-column-values", "1", "-1", &[]), sales_sheet()],
        );
        let meta = burster.parse(&mut ctx(), &NoopHook).unwrap();
        let dest = dir.path().join("out").join("north.xlsx");
        burster.extract("north", meta.fragments_for("north"), &dest).unwrap();

        let (wb, rows) = output_rows(&dest, 0);
        let names: Vec<_> = wb.sheets().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Sales"]);
        assert_eq!(
            rows,
            vec![
                vec!["Item", "Amount", "Region"],
                vec!["Pens", "10", "north"],
                vec!["Total", "30", KEEP_ROW],
                vec!["Paper", "5", "north"],
            ]
        );
    }

    #[test]
    fn row_copy_freezes_formulas() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[burst_sheet("distinct-column-values", "1", "-1", &[]), sales_sheet()],
        );
        let meta = burster.parse(&mut ctx(), &NoopHook).unwrap();
        let dest = dir.path().join("south.xlsx");
        burster.extract("south", meta.fragments_for("south"), &dest).unwrap();
        let (wb, rows) = output_rows(&dest, 0);
        assert_eq!(rows[1], vec!["Ink", "20", "south"]);
        let part = &wb.sheets().unwrap()[0].part;
        let xml = String::from_utf8(wb.package().part(part).unwrap().to_vec()).unwrap();
        assert!(!xml.contains("<f>"));
        assert!(xml.contains(r#"activeCell="A1""#));
        assert!(xml.contains(r#"<hyperlink ref="A2""#));
    }

    #[test]
    fn row_copy_moves_merges_comments_and_styles() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[burst_sheet("distinct-column-values", "1", "-1", &[]), sales_sheet()],
        );
        let meta = burster.parse(&mut ctx(), &NoopHook).unwrap();
        let dest = dir.path().join("north.xlsx");
        burster.extract("north", meta.fragments_for("north"), &dest).unwrap();

        let wb = Workbook::open(&dest).unwrap();
        let part = wb.sheets().unwrap()[0].part.clone();
        let sheet = wb.package().xml(&part).unwrap();
        let merge = sheet.root.child("mergeCells").unwrap().child("mergeCell").unwrap();
        // Source row 5 lands on row 4; the two-row span is preserved.
        assert_eq!(merge.attr("ref"), Some("A4:B5"));

        let header = sheet.root.child("sheetData").unwrap().child("row").unwrap();
        let styles: Vec<_> = header.children_named("c").filter_map(|c| c.attr("s")).collect();
        // xf 2 duplicates xf 1 and folds onto it.
        assert_eq!(styles, vec!["1", "1", "1"]);

        let comments = wb.package().xml("xl/comments2.xml").unwrap();
        let refs: Vec<_> = comments
            .root
            .child("commentList")
            .unwrap()
            .children_named("comment")
            .filter_map(|c| c.attr("ref"))
            .collect();
        assert_eq!(refs, vec!["A4"]);
        let vml = String::from_utf8(wb.package().part("xl/drawings/vmlDrawing2.vml").unwrap().to_vec()).unwrap();
        assert!(vml.contains("<x:Row>3</x:Row>"));
        assert!(vml.contains("1, 15, 3, 2, 3, 15, 6, 16"));
    }

    #[test]
    fn comments_outside_copied_rows_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[burst_sheet("distinct-column-values", "1", "-1", &[]), sales_sheet()],
        );
        let meta = burster.parse(&mut ctx(), &NoopHook).unwrap();
        let dest = dir.path().join("south.xlsx");
        burster.extract("south", meta.fragments_for("south"), &dest).unwrap();
        let wb = Workbook::open(&dest).unwrap();
        let comments = wb.package().xml("xl/comments2.xml").unwrap();
        assert_eq!(comments.root.child("commentList").unwrap().elements().count(), 0);
        let vml = String::from_utf8(wb.package().part("xl/drawings/vmlDrawing2.vml").unwrap().to_vec()).unwrap();
        assert!(!vml.contains("<v:shape"));
    }

    #[test]
    fn template_is_built_once_and_removed_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[burst_sheet("distinct-column-values", "1", "-1", &[]), sales_sheet()],
        );
        let meta = burster.parse(&mut ctx(), &NoopHook).unwrap();
        for token in &meta.tokens {
            let dest = dir.path().join("out").join(format!("{token}.xlsx"));
            burster.extract(token, meta.fragments_for(token), &dest).unwrap();
        }
        let template = burster.prepared.as_ref().unwrap().template.to_path_buf();
        assert!(template.exists());
        assert!(template.file_name().unwrap().to_string_lossy().starts_with("Sales_"));
        burster.close();
        assert!(!template.exists());
    }

    #[test]
    fn empty_target_sheet_yields_no_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[
                burst_sheet("distinct-column-values", "1", "-1", &[]),
                SheetSpec::new("Sales", Vec::new()),
            ],
        );
        let meta = burster.parse(&mut ctx(), &NoopHook).unwrap();
        assert!(meta.tokens.is_empty());
    }

    #[test]
    fn row_hooks_see_burst_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut burster = open(
            dir.path(),
            &[burst_sheet("distinct-column-values", "1", "-1", &[]), sales_sheet()],
        );
        let seen = std::sync::Mutex::new(Vec::new());
        let hook = |stage: HookStage, ctx: &mut BurstingContext| {
            if stage == HookStage::EndParsePage {
                seen.lock().unwrap().push(ctx.current_page_tokens.clone());
            }
            Ok::<(), HookError>(())
        };
        burster.parse(&mut ctx(), &hook).unwrap();
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 5);
        assert!(seen[0].is_empty());
        assert_eq!(seen[1], vec!["north".to_string()]);
    }

    #[test]
    fn vml_anchor_rows_shift() {
        let shape = r#"<v:shape><x:ClientData ObjectType="Note"><x:Anchor>1, 15, 9, 2, 3, 15, 12, 16</x:Anchor><x:Row>9</x:Row></x:ClientData></v:shape>"#;
        let map = HashMap::from([(9, 1)]);
        let moved = remap_vml_shape(shape, &map).unwrap();
        assert!(moved.contains("<x:Row>1</x:Row>"));
        assert!(moved.contains("1, 15, 1, 2, 3, 15, 4, 16"));
        assert!(remap_vml_shape(shape, &HashMap::new()).is_none());
    }

    #[test]
    fn garbage_workbook_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SpreadsheetBurster::open(Path::new("x.xlsx"), b"nope".to_vec(), dir.path())
            .err()
            .unwrap();
        assert!(matches!(err, BurstError::Input(_)));
    }
}
