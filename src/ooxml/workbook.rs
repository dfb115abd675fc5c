//! Workbook structure on top of a [`Package`].
//!
//! Sheets are listed by `xl/workbook.xml` and located through the workbook
//! relationships. Relationship targets are relative to the directory of the
//! part that owns them; the owner of `dir/_rels/name.rels` is `dir/name`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use super::package::Package;
use super::xml::{Element, Node};
use super::OoxmlError;

const ROOT_RELS: &str = "_rels/.rels";
const DEFAULT_WORKBOOK: &str = "xl/workbook.xml";
const REL_OFFICE_DOCUMENT: &str = "/officeDocument";
const REL_SHARED_STRINGS: &str = "/sharedStrings";
const REL_STYLES: &str = "/styles";
const REL_CALC_CHAIN: &str = "/calcChain";
pub const REL_COMMENTS: &str = "/comments";
pub const REL_VML_DRAWING: &str = "/vmlDrawing";

/// Child order of `<worksheet>`; new elements are inserted at their rank.
const WORKSHEET_ORDER: [&str; 30] = [
    "sheetPr",
    "dimension",
    "sheetViews",
    "sheetFormatPr",
    "cols",
    "sheetData",
    "sheetCalcPr",
    "sheetProtection",
    "protectedRanges",
    "scenarios",
    "autoFilter",
    "sortState",
    "dataConsolidate",
    "customSheetViews",
    "mergeCells",
    "phoneticPr",
    "conditionalFormatting",
    "dataValidations",
    "hyperlinks",
    "printOptions",
    "pageMargins",
    "pageSetup",
    "headerFooter",
    "rowBreaks",
    "colBreaks",
    "customProperties",
    "cellWatches",
    "ignoredErrors",
    "drawing",
    "legacyDrawing",
];

// ═══════════════════════════════════════════════════════════
// Cell references
// ═══════════════════════════════════════════════════════════

/// Zero-based cell coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellRef {
    pub col: u32,
    pub row: u32,
}

impl CellRef {
    pub fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }

    /// Parse `B7` or `$B$7`.
    pub fn parse(reference: &str) -> Option<Self> {
        let cleaned: String = reference.chars().filter(|c| *c != '$').collect();
        let split = cleaned.find(|c: char| c.is_ascii_digit())?;
        let (letters, digits) = cleaned.split_at(split);
        let col = column_index(letters)?;
        let row: u32 = digits.parse().ok()?;
        if row == 0 {
            return None;
        }
        Some(Self { col, row: row - 1 })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_letters(self.col), self.row + 1)
    }
}

/// `0` → `A`, `26` → `AA`.
pub fn column_letters(col: u32) -> String {
    let mut n = col + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        letters.push((b'A' + rem) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

pub fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let mut n: u32 = 0;
    for c in letters.chars() {
        n = n.checked_mul(26)?.checked_add(c.to_ascii_uppercase() as u32 - 'A' as u32 + 1)?;
    }
    Some(n - 1)
}

/// Parse `A1:C3` or a single cell into its corners.
pub fn parse_range(range: &str) -> Option<(CellRef, CellRef)> {
    match range.split_once(':') {
        Some((a, b)) => Some((CellRef::parse(a)?, CellRef::parse(b)?)),
        None => {
            let cell = CellRef::parse(range)?;
            Some((cell, cell))
        }
    }
}

pub fn format_range(first: CellRef, last: CellRef) -> String {
    if first == last {
        first.to_string()
    } else {
        format!("{first}:{last}")
    }
}

/// Display value of a `<c>` element.
pub fn cell_value(cell: &Element, shared: &[String]) -> String {
    let raw = || cell.child("v").map(Element::text).unwrap_or_default();
    match cell.attr("t") {
        Some("s") => raw()
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|i| shared.get(i).cloned())
            .unwrap_or_default(),
        Some("inlineStr") => cell.child("is").map(Element::text).unwrap_or_default(),
        Some(_) => raw(),
        None => {
            let v = raw();
            match v.trim().parse::<f64>() {
                Ok(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", n as i64),
                _ => v,
            }
        }
    }
}

/// Insert a `<worksheet>` child at its schema position.
pub fn insert_ordered(worksheet: &mut Element, element: Element) {
    let rank = |name: &str| WORKSHEET_ORDER.iter().position(|n| *n == name);
    let Some(new_rank) = rank(element.local_name()) else {
        worksheet.push(element);
        return;
    };
    let at = worksheet.children.iter().position(|node| match node {
        Node::Element(e) => rank(e.local_name()).map_or(true, |r| r > new_rank),
        Node::Text(_) => false,
    });
    match at {
        Some(index) => worksheet.children.insert(index, Node::Element(element)),
        None => worksheet.push(element),
    }
}

// ═══════════════════════════════════════════════════════════
// Relationships
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    /// Resolved package part, or the raw target when external.
    pub target: String,
    pub external: bool,
}

/// `xl/worksheets/sheet1.xml` → `xl/worksheets/_rels/sheet1.xml.rels`.
pub fn rels_part_for(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/_rels/{name}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

/// Inverse of [`rels_part_for`].
fn owner_of_rels(rels_part: &str) -> Option<String> {
    let name = rels_part.strip_suffix(".rels")?;
    let (dir, file) = name.rsplit_once("_rels/")?;
    Some(format!("{dir}{file}"))
}

/// Resolve a relationship target against the owning part.
pub fn resolve_target(owner: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut segments: Vec<&str> = match owner.rsplit_once('/') {
        Some((dir, _)) => dir.split('/').collect(),
        None => Vec::new(),
    };
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

fn rel_id(element: &Element) -> Option<&str> {
    element
        .attrs
        .iter()
        .find(|(k, _)| k.ends_with(":id"))
        .map(|(_, v)| v.as_str())
}

// ═══════════════════════════════════════════════════════════
// Workbook
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct SheetInfo {
    pub name: String,
    pub rel_id: String,
    /// Worksheet part inside the package.
    pub part: String,
}

#[derive(Debug, Clone)]
pub struct Workbook {
    package: Package,
    workbook_part: String,
}

impl Workbook {
    pub fn from_package(package: Package) -> Result<Self, OoxmlError> {
        let workbook_part = Self::locate_workbook(&package)?;
        if !package.has_part(&workbook_part) {
            return Err(OoxmlError::MissingPart(workbook_part));
        }
        Ok(Self { package, workbook_part })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OoxmlError> {
        Self::from_package(Package::from_bytes(bytes)?)
    }

    pub fn open(path: &Path) -> Result<Self, OoxmlError> {
        Self::from_package(Package::open(path)?)
    }

    fn locate_workbook(package: &Package) -> Result<String, OoxmlError> {
        if !package.has_part(ROOT_RELS) {
            return Ok(DEFAULT_WORKBOOK.to_string());
        }
        let rels = package.xml(ROOT_RELS)?;
        let target = rels
            .root
            .children_named("Relationship")
            .find(|r| r.attr("Type").is_some_and(|t| t.ends_with(REL_OFFICE_DOCUMENT)))
            .and_then(|r| r.attr("Target"))
            .map(|t| resolve_target("", t))
            .unwrap_or_else(|| DEFAULT_WORKBOOK.to_string());
        Ok(target)
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn package_mut(&mut self) -> &mut Package {
        &mut self.package
    }

    pub fn save(&self, path: &Path) -> Result<(), OoxmlError> {
        self.package.save(path)
    }

    /// Relationships owned by `part`; none when it has no rels part.
    pub fn relationships(&self, part: &str) -> Result<Vec<Relationship>, OoxmlError> {
        let rels_part = rels_part_for(part);
        if !self.package.has_part(&rels_part) {
            return Ok(Vec::new());
        }
        let rels = self.package.xml(&rels_part)?;
        Ok(rels
            .root
            .children_named("Relationship")
            .map(|r| {
                let external = r.attr("TargetMode") == Some("External");
                let target = r.attr("Target").unwrap_or_default();
                Relationship {
                    id: r.attr("Id").unwrap_or_default().to_string(),
                    rel_type: r.attr("Type").unwrap_or_default().to_string(),
                    target: if external {
                        target.to_string()
                    } else {
                        resolve_target(part, target)
                    },
                    external,
                }
            })
            .collect())
    }

    /// First internal relationship of `part` whose type ends with `suffix`.
    pub fn related_part(&self, part: &str, suffix: &str) -> Result<Option<String>, OoxmlError> {
        Ok(self
            .relationships(part)?
            .into_iter()
            .find(|r| !r.external && r.rel_type.ends_with(suffix))
            .map(|r| r.target))
    }

    pub fn sheets(&self) -> Result<Vec<SheetInfo>, OoxmlError> {
        let workbook = self.package.xml(&self.workbook_part)?;
        let rels = self.relationships(&self.workbook_part)?;
        let sheets = workbook
            .root
            .child("sheets")
            .ok_or_else(|| OoxmlError::Invalid("workbook has no <sheets>".into()))?;
        sheets
            .children_named("sheet")
            .map(|s| {
                let name = s.attr("name").unwrap_or_default().to_string();
                let rel_id = rel_id(s).unwrap_or_default().to_string();
                let part = rels
                    .iter()
                    .find(|r| r.id == rel_id)
                    .map(|r| r.target.clone())
                    .ok_or_else(|| {
                        OoxmlError::Invalid(format!("sheet '{name}' has no relationship '{rel_id}'"))
                    })?;
                Ok(SheetInfo { name, rel_id, part })
            })
            .collect()
    }

    pub fn shared_strings(&self) -> Result<Vec<String>, OoxmlError> {
        let Some(part) = self.related_part(&self.workbook_part, REL_SHARED_STRINGS)? else {
            return Ok(Vec::new());
        };
        if !self.package.has_part(&part) {
            return Ok(Vec::new());
        }
        let sst = self.package.xml(&part)?;
        Ok(sst.root.children_named("si").map(shared_string_text).collect())
    }

    pub fn styles_part(&self) -> Result<Option<String>, OoxmlError> {
        self.related_part(&self.workbook_part, REL_STYLES)
    }

    // ── Structural edits ─────────────────────────────────────

    /// Strip formulas everywhere, keeping their cached results as values.
    ///
    /// Formula string results become inline strings, and the calculation
    /// chain is dropped so nothing recomputes against missing rows.
    pub fn freeze_formulas(&mut self) -> Result<usize, OoxmlError> {
        let mut frozen = 0;
        for sheet in self.sheets()? {
            let mut doc = self.package.xml(&sheet.part)?;
            let mut changed = 0;
            if let Some(data) = doc.root.child_mut("sheetData") {
                for row in data.elements_mut().filter(|r| r.local_name() == "row") {
                    for cell in row.elements_mut().filter(|c| c.local_name() == "c") {
                        if cell.child("f").is_none() {
                            continue;
                        }
                        cell.remove_children_named("f");
                        if cell.attr("t") == Some("str") {
                            let text = cell.child("v").map(Element::text).unwrap_or_default();
                            cell.remove_children_named("v");
                            cell.set_attr("t", "inlineStr");
                            let mut t = Element::new("t").with_attr("xml:space", "preserve");
                            t.set_text(&text);
                            let mut is = Element::new("is");
                            is.push(t);
                            cell.push(is);
                        }
                        changed += 1;
                    }
                }
            }
            if changed > 0 {
                self.package.set_xml(&sheet.part, &doc);
                frozen += changed;
            }
        }
        self.remove_calc_chain()?;
        Ok(frozen)
    }

    pub fn remove_calc_chain(&mut self) -> Result<(), OoxmlError> {
        let rels_part = rels_part_for(&self.workbook_part);
        if !self.package.has_part(&rels_part) {
            return Ok(());
        }
        let Some(part) = self.related_part(&self.workbook_part, REL_CALC_CHAIN)? else {
            return Ok(());
        };
        let mut rels = self.package.xml(&rels_part)?;
        rels.root.retain_elements(|r| !r.attr("Type").is_some_and(|t| t.ends_with(REL_CALC_CHAIN)));
        self.package.set_xml(&rels_part, &rels);
        self.package.remove_part(&part);
        self.package.prune_content_types()
    }

    /// Remove every sheet for which `keep` is false, with the parts only
    /// they referenced, their sheet-local defined names and global names
    /// that point at them.
    pub fn retain_sheets(&mut self, keep: impl Fn(&SheetInfo) -> bool) -> Result<(), OoxmlError> {
        let sheets = self.sheets()?;
        let removed: Vec<(usize, SheetInfo)> = sheets
            .iter()
            .cloned()
            .enumerate()
            .filter(|(_, s)| !keep(s))
            .collect();
        if removed.is_empty() {
            return Ok(());
        }
        if removed.len() == sheets.len() {
            return Err(OoxmlError::Invalid("a workbook must keep at least one sheet".into()));
        }

        let removed_ids: BTreeSet<&str> = removed.iter().map(|(_, s)| s.rel_id.as_str()).collect();
        let removed_names: Vec<&str> = removed.iter().map(|(_, s)| s.name.as_str()).collect();
        let mut new_position: HashMap<usize, usize> = HashMap::new();
        let mut next = 0;
        for (pos, sheet) in sheets.iter().enumerate() {
            if !removed_ids.contains(sheet.rel_id.as_str()) {
                new_position.insert(pos, next);
                next += 1;
            }
        }

        let mut workbook = self.package.xml(&self.workbook_part)?;
        if let Some(list) = workbook.root.child_mut("sheets") {
            list.retain_elements(|s| !rel_id(s).is_some_and(|id| removed_ids.contains(id)));
        }
        if let Some(names) = workbook.root.child_mut("definedNames") {
            names.retain_elements(|n| match n.attr("localSheetId").and_then(|v| v.parse::<usize>().ok()) {
                Some(local) => new_position.contains_key(&local),
                None => !removed_names.iter().any(|name| references_sheet(&n.text(), name)),
            });
            for name in names.elements_mut() {
                let local = name.attr("localSheetId").and_then(|v| v.parse::<usize>().ok());
                if let Some(pos) = local.and_then(|l| new_position.get(&l)) {
                    name.set_attr("localSheetId", &pos.to_string());
                }
            }
            if names.elements().next().is_none() {
                workbook.root.remove_children_named("definedNames");
            }
        }
        self.package.set_xml(&self.workbook_part, &workbook);

        let wb_rels_part = rels_part_for(&self.workbook_part);
        let mut wb_rels = self.package.xml(&wb_rels_part)?;
        wb_rels
            .root
            .retain_elements(|r| !r.attr("Id").is_some_and(|id| removed_ids.contains(id)));
        self.package.set_xml(&wb_rels_part, &wb_rels);

        let candidates: Vec<String> = removed.into_iter().map(|(_, s)| s.part).collect();
        self.remove_unreferenced(candidates)?;
        self.remove_calc_chain()?;
        self.package.prune_content_types()?;
        self.set_active_sheet(0)
    }

    /// Remove each candidate part no remaining relationship points at,
    /// then follow its own relationships.
    fn remove_unreferenced(&mut self, mut candidates: Vec<String>) -> Result<(), OoxmlError> {
        while let Some(part) = candidates.pop() {
            if !self.package.has_part(&part) || self.is_referenced(&part)? {
                continue;
            }
            for rel in self.relationships(&part)? {
                if !rel.external {
                    candidates.push(rel.target);
                }
            }
            self.package.remove_part(&part);
            self.package.remove_part(&rels_part_for(&part));
        }
        Ok(())
    }

    fn is_referenced(&self, part: &str) -> Result<bool, OoxmlError> {
        let rels_parts: Vec<String> = self
            .package
            .part_names()
            .filter(|n| n.ends_with(".rels"))
            .map(str::to_string)
            .collect();
        for rels_part in rels_parts {
            let Some(owner) = owner_of_rels(&rels_part) else { continue };
            if owner == part || (!owner.is_empty() && !self.package.has_part(&owner)) {
                continue;
            }
            if self
                .relationships(&owner)?
                .iter()
                .any(|r| !r.external && r.target == part)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Make the sheet at `position` the active and only selected tab.
    pub fn set_active_sheet(&mut self, position: usize) -> Result<(), OoxmlError> {
        let mut workbook = self.package.xml(&self.workbook_part)?;
        if let Some(views) = workbook.root.child_mut("bookViews") {
            for view in views.elements_mut() {
                view.set_attr("activeTab", &position.to_string());
                view.remove_attr("firstSheet");
            }
        }
        self.package.set_xml(&self.workbook_part, &workbook);

        for (pos, sheet) in self.sheets()?.iter().enumerate() {
            let mut doc = self.package.xml(&sheet.part)?;
            let Some(views) = doc.root.child_mut("sheetViews") else { continue };
            for view in views.elements_mut() {
                if pos == position {
                    view.set_attr("tabSelected", "1");
                } else {
                    view.remove_attr("tabSelected");
                }
            }
            self.package.set_xml(&sheet.part, &doc);
        }
        Ok(())
    }
}

fn shared_string_text(si: &Element) -> String {
    // Rich text runs carry phonetic hints in <rPh>; those are not cell text.
    let mut out = String::new();
    for node in &si.children {
        if let Node::Element(e) = node {
            match e.local_name() {
                "t" => out.push_str(&e.text()),
                "r" => out.push_str(&e.child("t").map(Element::text).unwrap_or_default()),
                _ => {}
            }
        }
    }
    out
}

fn references_sheet(formula: &str, sheet: &str) -> bool {
    formula.contains(&format!("{sheet}!")) || formula.contains(&format!("'{}'!", sheet.replace('\'', "''")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ooxml::package::CONTENT_TYPES;
    use crate::ooxml::xml::XmlDocument;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Cell content for [`build_xlsx`].
    #[derive(Clone)]
    pub(crate) enum Cell<'a> {
        Str(&'a str),
        Num(f64),
        /// Formula with a cached string result.
        Formula(&'a str, &'a str),
        Styled(&'a str, u32),
        Blank,
    }

    pub(crate) struct SheetSpec<'a> {
        pub name: &'a str,
        pub rows: Vec<Vec<Cell<'a>>>,
        pub merges: Vec<&'a str>,
        pub comments: Vec<(&'a str, &'a str)>,
        pub hyperlinks: Vec<(&'a str, &'a str)>,
    }

    impl<'a> SheetSpec<'a> {
        pub(crate) fn new(name: &'a str, rows: Vec<Vec<Cell<'a>>>) -> Self {
            Self { name, rows, merges: Vec::new(), comments: Vec::new(), hyperlinks: Vec::new() }
        }
    }

    fn cell_xml(reference: &str, cell: &Cell) -> String {
        match cell {
            Cell::Str(s) => {
                let s = quick_xml::escape::escape(*s);
                format!(r#"<c r="{reference}" t="inlineStr"><is><t>{s}</t></is></c>"#)
            }
            Cell::Num(n) => format!(r#"<c r="{reference}"><v>{n}</v></c>"#),
            Cell::Formula(f, v) => format!(r#"<c r="{reference}" t="str"><f>{f}</f><v>{v}</v></c>"#),
            Cell::Styled(s, style) => {
                let s = quick_xml::escape::escape(*s);
                format!(r#"<c r="{reference}" s="{style}" t="inlineStr"><is><t>{s}</t></is></c>"#)
            }
            Cell::Blank => String::new(),
        }
    }

    const STYLES: &str = r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="2"><font><sz val="11"/></font><font><b/><sz val="11"/></font></fonts><fills count="1"><fill><patternFill patternType="none"/></fill></fills><borders count="1"><border/></borders><cellXfs count="3"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/><xf numFmtId="0" fontId="1" fillId="0" borderId="0" applyFont="1"/><xf numFmtId="0" fontId="1" fillId="0" borderId="0" applyFont="1"/></cellXfs></styleSheet>"#;

    /// Build an xlsx package in memory.
    pub(crate) fn build_xlsx(sheets: &[SheetSpec]) -> Vec<u8> {
        let mut parts: Vec<(String, String)> = Vec::new();
        let mut overrides = String::new();
        let mut wb_sheets = String::new();
        let mut wb_rels = String::new();

        for (i, sheet) in sheets.iter().enumerate() {
            let n = i + 1;
            wb_sheets.push_str(&format!(r#"<sheet name="{}" sheetId="{n}" r:id="rId{n}"/>"#, sheet.name));
            wb_rels.push_str(&format!(
                r#"<Relationship Id="rId{n}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{n}.xml"/>"#
            ));
            overrides.push_str(&format!(
                r#"<Override PartName="/xl/worksheets/sheet{n}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#
            ));

            let mut data = String::new();
            for (r, row) in sheet.rows.iter().enumerate() {
                data.push_str(&format!(r#"<row r="{}">"#, r + 1));
                for (c, cell) in row.iter().enumerate() {
                    data.push_str(&cell_xml(&CellRef::new(c as u32, r as u32).to_string(), cell));
                }
                data.push_str("</row>");
            }
            let mut tail = String::new();
            if !sheet.merges.is_empty() {
                tail.push_str(&format!(r#"<mergeCells count="{}">"#, sheet.merges.len()));
                for m in &sheet.merges {
                    tail.push_str(&format!(r#"<mergeCell ref="{m}"/>"#));
                }
                tail.push_str("</mergeCells>");
            }
            let mut sheet_rels = String::new();
            if !sheet.hyperlinks.is_empty() {
                tail.push_str("<hyperlinks>");
                for (k, (reference, url)) in sheet.hyperlinks.iter().enumerate() {
                    tail.push_str(&format!(r#"<hyperlink ref="{reference}" r:id="rIdH{k}"/>"#));
                    sheet_rels.push_str(&format!(
                        r#"<Relationship Id="rIdH{k}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink" Target="{url}" TargetMode="External"/>"#
                    ));
                }
                tail.push_str("</hyperlinks>");
            }
            if !sheet.comments.is_empty() {
                tail.push_str(r#"<legacyDrawing r:id="rIdV"/>"#);
                sheet_rels.push_str(&format!(
                    r#"<Relationship Id="rIdC" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/comments" Target="../comments{n}.xml"/><Relationship Id="rIdV" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/vmlDrawing" Target="../drawings/vmlDrawing{n}.vml"/>"#
                ));
                let mut comments = String::from(
                    r#"<comments xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><authors><author>qa</author></authors><commentList>"#,
                );
                let mut vml = String::from(
                    r#"<xml xmlns:v="urn:schemas-microsoft-com:vml" xmlns:o="urn:schemas-microsoft-com:office:office" xmlns:x="urn:schemas-microsoft-com:office:excel"><o:shapelayout v:ext="edit"><o:idmap v:ext="edit" data="1"/></o:shapelayout>"#,
                );
                for (k, (reference, text)) in sheet.comments.iter().enumerate() {
                    let cell = CellRef::parse(reference).unwrap();
                    comments.push_str(&format!(
                        r#"<comment ref="{reference}" authorId="0"><text><t>{text}</t></text></comment>"#
                    ));
                    vml.push_str(&format!(
                        r##"<v:shape id="_x0000_s{}" type="#_x0000_t202"><x:ClientData ObjectType="Note"><x:Anchor>1, 15, {}, 2, 3, 15, {}, 16</x:Anchor><x:Row>{}</x:Row><x:Column>{}</x:Column></x:ClientData></v:shape>"##,
                        1025 + k,
                        cell.row,
                        cell.row + 3,
                        cell.row,
                        cell.col
                    ));
                }
                comments.push_str("</commentList></comments>");
                vml.push_str("</xml>");
                parts.push((format!("xl/comments{n}.xml"), comments));
                parts.push((format!("xl/drawings/vmlDrawing{n}.vml"), vml));
                overrides.push_str(&format!(
                    r#"<Override PartName="/xl/comments{n}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.comments+xml"/>"#
                ));
            }
            if !sheet_rels.is_empty() {
                parts.push((
                    format!("xl/worksheets/_rels/sheet{n}.xml.rels"),
                    format!(r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{sheet_rels}</Relationships>"#),
                ));
            }
            parts.push((
                format!("xl/worksheets/sheet{n}.xml"),
                format!(
                    r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><dimension ref="A1"/><sheetViews><sheetView workbookViewId="0"><selection activeCell="C3" sqref="C3"/></sheetView></sheetViews><sheetData>{data}</sheetData>{tail}</worksheet>"#
                ),
            ));
        }

        wb_rels.push_str(r#"<Relationship Id="rIdS" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>"#);
        parts.push(("xl/styles.xml".into(), STYLES.into()));
        parts.push((
            "xl/workbook.xml".into(),
            format!(
                r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><bookViews><workbookView activeTab="0"/></bookViews><sheets>{wb_sheets}</sheets></workbook>"#
            ),
        ));
        parts.push((
            "xl/_rels/workbook.xml.rels".into(),
            format!(r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{wb_rels}</Relationships>"#),
        ));
        parts.push((
            "_rels/.rels".into(),
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#.into(),
        ));

        let types = format!(
            r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Default Extension="vml" ContentType="application/vnd.openxmlformats-officedocument.vmlDrawing"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>{overrides}</Types>"#
        );

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file(CONTENT_TYPES, options).unwrap();
        writer.write_all(types.as_bytes()).unwrap();
        for (name, body) in parts {
            writer.start_file(name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn three_sheets() -> Workbook {
        Workbook::from_bytes(&build_xlsx(&[
            SheetSpec::new("North", vec![vec![Cell::Str("n")]]),
            SheetSpec::new("South", vec![vec![Cell::Str("s")]]),
            SheetSpec::new("East", vec![vec![Cell::Str("e")]]),
        ]))
        .unwrap()
    }

    #[test]
    fn cell_ref_parse_and_display() {
        assert_eq!(CellRef::parse("A1"), Some(CellRef::new(0, 0)));
        assert_eq!(CellRef::parse("$AB$12"), Some(CellRef::new(27, 11)));
        assert_eq!(CellRef::new(25, 0).to_string(), "Z1");
        assert_eq!(CellRef::new(26, 9).to_string(), "AA10");
        assert_eq!(CellRef::parse("A0"), None);
        assert_eq!(CellRef::parse("12"), None);
    }

    #[test]
    fn range_parse() {
        let (a, b) = parse_range("B2:D4").unwrap();
        assert_eq!((a, b), (CellRef::new(1, 1), CellRef::new(3, 3)));
        assert_eq!(format_range(a, a), "B2");
    }

    #[test]
    fn target_resolution() {
        assert_eq!(resolve_target("xl/worksheets/sheet1.xml", "../comments1.xml"), "xl/comments1.xml");
        assert_eq!(resolve_target("xl/workbook.xml", "worksheets/sheet1.xml"), "xl/worksheets/sheet1.xml");
        assert_eq!(resolve_target("xl/workbook.xml", "/xl/styles.xml"), "xl/styles.xml");
        assert_eq!(resolve_target("", "xl/workbook.xml"), "xl/workbook.xml");
        assert_eq!(owner_of_rels("xl/worksheets/_rels/sheet1.xml.rels").as_deref(), Some("xl/worksheets/sheet1.xml"));
        assert_eq!(owner_of_rels("_rels/.rels").as_deref(), Some(""));
    }

    #[test]
    fn sheets_listed_in_order() {
        let wb = three_sheets();
        let names: Vec<_> = wb.sheets().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["North", "South", "East"]);
    }

    #[test]
    fn cell_values_by_type() {
        let shared = vec!["zero".to_string(), "one".to_string()];
        let doc = XmlDocument::parse(
            br#"<r><c t="s"><v>1</v></c><c><v>42.0</v></c><c><v>2.5</v></c><c t="inlineStr"><is><t>x</t></is></c><c t="b"><v>1</v></c></r>"#,
            "t",
        )
        .unwrap();
        let values: Vec<_> = doc.root.elements().map(|c| cell_value(c, &shared)).collect();
        assert_eq!(values, vec!["one", "42", "2.5", "x", "1"]);
    }

    #[test]
    fn retain_sheets_removes_parts_and_renumbers() {
        let mut wb = three_sheets();
        wb.retain_sheets(|s| s.name == "South").unwrap();
        let sheets = wb.sheets().unwrap();
        assert_eq!(sheets.len(), 1);
        assert_eq!(sheets[0].name, "South");
        assert!(!wb.package().has_part("xl/worksheets/sheet1.xml"));
        assert!(!wb.package().has_part("xl/worksheets/sheet3.xml"));
        assert!(wb.package().has_part("xl/styles.xml"));
        let types = wb.package().xml(CONTENT_TYPES).unwrap();
        assert!(!String::from_utf8(types.to_bytes()).unwrap().contains("sheet1.xml"));
        let book = wb.package().xml("xl/workbook.xml").unwrap();
        let view = book.root.child("bookViews").unwrap().child("workbookView").unwrap();
        assert_eq!(view.attr("activeTab"), Some("0"));
    }

    #[test]
    fn retain_sheets_fixes_defined_names() {
        let mut wb = three_sheets();
        let mut book = wb.package().xml("xl/workbook.xml").unwrap();
        let mut names = Element::new("definedNames");
        let mut local = Element::new("definedName").with_attr("name", "_xlnm.Print_Area").with_attr("localSheetId", "2");
        local.set_text("East!$A$1:$B$2");
        let mut gone = Element::new("definedName").with_attr("name", "NorthData");
        gone.set_text("North!$A$1");
        names.push(local);
        names.push(gone);
        book.root.push(names);
        wb.package_mut().set_xml("xl/workbook.xml", &book);

        wb.retain_sheets(|s| s.name != "North").unwrap();
        let book = wb.package().xml("xl/workbook.xml").unwrap();
        let names: Vec<_> = book.root.child("definedNames").unwrap().elements().cloned().collect();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].attr("localSheetId"), Some("1"));
    }

    #[test]
    fn retain_sheets_drops_comment_parts_of_removed_sheet() {
        let mut north = SheetSpec::new("North", vec![vec![Cell::Str("n")]]);
        north.comments.push(("A1", "note"));
        let mut wb = Workbook::from_bytes(&build_xlsx(&[
            north,
            SheetSpec::new("South", vec![vec![Cell::Str("s")]]),
        ]))
        .unwrap();
        assert!(wb.package().has_part("xl/comments1.xml"));
        wb.retain_sheets(|s| s.name == "South").unwrap();
        assert!(!wb.package().has_part("xl/comments1.xml"));
        assert!(!wb.package().has_part("xl/drawings/vmlDrawing1.vml"));
        assert!(!wb.package().has_part("xl/worksheets/_rels/sheet1.xml.rels"));
    }

    #[test]
    fn retain_sheets_refuses_to_empty_workbook() {
        let mut wb = three_sheets();
        assert!(wb.retain_sheets(|_| false).is_err());
    }

    #[test]
    fn freeze_formulas_keeps_cached_values() {
        let mut wb = Workbook::from_bytes(&build_xlsx(&[SheetSpec::new(
            "Data",
            vec![vec![Cell::Formula("UPPER(B1)", "cached"), Cell::Num(3.0)]],
        )]))
        .unwrap();
        assert_eq!(wb.freeze_formulas().unwrap(), 1);
        let sheet = wb.package().xml("xl/worksheets/sheet1.xml").unwrap();
        let cell = sheet.root.child("sheetData").unwrap().child("row").unwrap().child("c").unwrap();
        assert!(cell.child("f").is_none());
        assert_eq!(cell_value(cell, &[]), "cached");
    }

    #[test]
    fn insert_ordered_respects_schema_order() {
        let mut ws = Element::new("worksheet");
        ws.push(Element::new("sheetData"));
        ws.push(Element::new("pageMargins"));
        insert_ordered(&mut ws, Element::new("hyperlinks"));
        insert_ordered(&mut ws, Element::new("mergeCells"));
        insert_ordered(&mut ws, Element::new("dimension"));
        let names: Vec<_> = ws.elements().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["dimension", "sheetData", "mergeCells", "hyperlinks", "pageMargins"]);
    }
}
