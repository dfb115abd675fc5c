//! Office Open XML spreadsheet packages.
//!
//! An `.xlsx` file is a zip of XML parts. [`package::Package`] holds the
//! parts in memory, [`xml`] is a small mutable DOM over quick-xml, and
//! [`workbook`] knows how sheets, relationships and cells hang together.

pub mod package;
pub mod workbook;
pub mod xml;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OoxmlError {
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error in {part}: {reason}")]
    Xml { part: String, reason: String },

    #[error("Missing package part: {0}")]
    MissingPart(String),

    #[error("Invalid workbook: {0}")]
    Invalid(String),
}

pub use package::Package;
pub use workbook::{CellRef, SheetInfo, Workbook};
pub use xml::{Element, Node, XmlDocument};
