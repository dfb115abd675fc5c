//! In-memory zip package.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::xml::XmlDocument;
use super::OoxmlError;

pub const CONTENT_TYPES: &str = "[Content_Types].xml";

/// Upper bound on the buffer reserved up front for one part. The size in
/// the zip header is not trusted beyond it.
const MAX_PREALLOC: usize = 16 * 1024 * 1024;

fn initial_capacity(declared: u64) -> usize {
    usize::try_from(declared).map_or(MAX_PREALLOC, |n| n.min(MAX_PREALLOC))
}

/// All parts of a package keyed by their zip entry name.
#[derive(Debug, Clone, Default)]
pub struct Package {
    parts: BTreeMap<String, Vec<u8>>,
}

impl Package {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OoxmlError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut parts = BTreeMap::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let mut data = Vec::with_capacity(initial_capacity(entry.size()));
            entry.read_to_end(&mut data)?;
            parts.insert(entry.name().to_string(), data);
        }
        if !parts.contains_key(CONTENT_TYPES) {
            return Err(OoxmlError::MissingPart(CONTENT_TYPES.to_string()));
        }
        Ok(Self { parts })
    }

    pub fn open(path: &Path) -> Result<Self, OoxmlError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.parts.contains_key(name)
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts.get(name).map(Vec::as_slice)
    }

    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.parts.keys().map(String::as_str)
    }

    pub fn set_part(&mut self, name: &str, data: Vec<u8>) {
        self.parts.insert(name.to_string(), data);
    }

    pub fn remove_part(&mut self, name: &str) -> bool {
        self.parts.remove(name).is_some()
    }

    pub fn xml(&self, name: &str) -> Result<XmlDocument, OoxmlError> {
        let data = self
            .part(name)
            .ok_or_else(|| OoxmlError::MissingPart(name.to_string()))?;
        XmlDocument::parse(data, name)
    }

    pub fn set_xml(&mut self, name: &str, doc: &XmlDocument) {
        self.set_part(name, doc.to_bytes());
    }

    /// Drop content-type overrides for parts that no longer exist.
    pub fn prune_content_types(&mut self) -> Result<(), OoxmlError> {
        let mut types = self.xml(CONTENT_TYPES)?;
        let before = types.root.children.len();
        let parts = &self.parts;
        types.root.retain_elements(|e| {
            if e.local_name() != "Override" {
                return true;
            }
            match e.attr("PartName") {
                Some(name) => parts.contains_key(name.trim_start_matches('/')),
                None => false,
            }
        });
        if types.root.children.len() != before {
            self.set_xml(CONTENT_TYPES, &types);
        }
        Ok(())
    }

    /// Serialize with `[Content_Types].xml` as the first entry.
    pub fn to_bytes(&self) -> Result<Vec<u8>, OoxmlError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        if let Some(types) = self.parts.get(CONTENT_TYPES) {
            writer.start_file(CONTENT_TYPES, options)?;
            writer.write_all(types)?;
        }
        for (name, data) in self.parts.iter().filter(|(n, _)| n.as_str() != CONTENT_TYPES) {
            writer.start_file(name.as_str(), options)?;
            writer.write_all(data)?;
        }
        Ok(writer.finish()?.into_inner())
    }

    pub fn save(&self, path: &Path) -> Result<(), OoxmlError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }
}
