//! PDF bursting: tokens from page text, outputs by page pruning.
//!
//! Text comes from pdf-extract; page surgery uses lopdf. Extraction works on
//! a clone of the parsed document, deletes every page the token does not
//! own and prunes unreachable objects. Kept pages retain their own
//! dictionaries, so crop box, media box, rotation and resources (inherited
//! or direct) survive unchanged.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use lopdf::{Dictionary, Document, Object};

use super::{
    capture_user_variables, clean_token, run_hook, substring_between, substrings_between, Burster,
    Fragment, ParsedMetadata,
};
use crate::config;
use crate::context::BurstingContext;
use crate::error::BurstError;
use crate::hooks::{HookStage, LifecycleHook};

const CONFIG_MARKERS: [(&str, &str); 2] = [("<c>", "</c>"), ("<config>", "</config>")];

pub struct PdfBurster {
    path: PathBuf,
    bytes: Vec<u8>,
    document: Document,
}

impl PdfBurster {
    pub fn open(path: &Path, bytes: Vec<u8>) -> Result<Self, BurstError> {
        let document = Document::load_mem(&bytes).map_err(|e| {
            BurstError::Input(format!("cannot parse PDF '{}': {e}", path.display()))
        })?;
        if document.is_encrypted() {
            return Err(BurstError::Input(format!(
                "encrypted PDF '{}' cannot be burst",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            bytes,
            document,
        })
    }

    fn page_texts(&self) -> Result<Vec<String>, BurstError> {
        if self.document.get_pages().is_empty() {
            return Ok(Vec::new());
        }
        pdf_extract::extract_text_from_mem_by_pages(&self.bytes).map_err(|e| {
            BurstError::Input(format!(
                "cannot read text of '{}': {e}",
                self.path.display()
            ))
        })
    }
}

impl Burster for PdfBurster {
    fn output_extension(&self) -> &str {
        "pdf"
    }

    fn parse(
        &mut self,
        ctx: &mut BurstingContext,
        hook: &dyn LifecycleHook,
    ) -> Result<ParsedMetadata, BurstError> {
        let texts = self.page_texts()?;
        let start = ctx.settings.start_burst_token_delimiter.clone();
        let end = ctx.settings.end_burst_token_delimiter.clone();
        let reuse = ctx.settings.reuse_tokens_when_not_found;

        let mut meta = ParsedMetadata {
            num_pages: texts.len(),
            ..Default::default()
        };
        let mut last_tokens: Vec<String> = Vec::new();

        for (index, text) in texts.into_iter().enumerate() {
            let page = index as u32 + 1;
            ctx.current_page_index = page as usize;
            ctx.current_page_text = text;
            ctx.current_page_tokens.clear();
            run_hook(hook, HookStage::StartParsePage, ctx)?;

            // A second-pass run keeps the configuration it was given.
            if page == 1 && !ctx.settings.is_second_pass() {
                if let Some(custom) = custom_config_marker(&ctx.current_page_text) {
                    if custom != ctx.config_path {
                        tracing::info!(config = %custom, "Input document names its own configuration");
                        meta.custom_config = Some(custom);
                        return Ok(meta);
                    }
                }
            }

            let mut tokens = page_tokens(&ctx.current_page_text, &start, &end);
            if tokens.is_empty() {
                if reuse && !last_tokens.is_empty() {
                    tokens = last_tokens.clone();
                }
            } else {
                last_tokens = tokens.clone();
            }

            for token in &tokens {
                meta.add(token, Fragment::Page(page));
                capture_user_variables(&mut ctx.variables, token, &ctx.current_page_text);
            }
            tracing::debug!(page, tokens = ?tokens, "Page parsed");

            ctx.current_page_tokens = tokens;
            run_hook(hook, HookStage::EndParsePage, ctx)?;
        }

        if meta.tokens.is_empty() && meta.num_pages > 0 {
            tracing::info!(
                pages = meta.num_pages,
                "No burst tokens found, bursting one document per page"
            );
            for page in 1..=meta.num_pages as u32 {
                meta.add(&page.to_string(), Fragment::Page(page));
            }
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
        let keep: BTreeSet<u32> = fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::Page(p) => Some(*p),
                _ => None,
            })
            .collect();
        if keep.is_empty() {
            return Err(BurstError::extraction(token, "no pages belong to this token"));
        }

        let mut doc = self.document.clone();
        let pages = doc.get_pages();
        if let Some(missing) = keep.iter().find(|p| !pages.contains_key(p)) {
            return Err(BurstError::extraction(
                token,
                format!("page {missing} does not exist in '{}'", self.path.display()),
            ));
        }
        let drop: Vec<u32> = pages.keys().copied().filter(|p| !keep.contains(p)).collect();
        doc.delete_pages(&drop);
        doc.prune_objects();
        stamp_metadata(&mut doc, token);

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BurstError::resource(parent, e))?;
        }
        doc.save(destination)
            .map_err(|e| BurstError::resource(destination, e))?;
        tracing::debug!(token, pages = keep.len(), path = %destination.display(), "PDF extracted");
        Ok(())
    }
}

/// Tokens on one page, cleaned, in order of appearance, without repeats.
pub fn page_tokens(text: &str, start: &str, end: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for raw in substrings_between(text, start, end) {
        let token = clean_token(raw);
        if !token.is_empty() && !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

fn custom_config_marker(text: &str) -> Option<String> {
    CONFIG_MARKERS
        .iter()
        .filter_map(|(open, close)| substring_between(text, open, close))
        .map(clean_token)
        .find(|path| !path.is_empty())
}

/// Creator/Producer carry the product identity, Keywords the token.
fn stamp_metadata(doc: &mut Document, token: &str) {
    let identity = config::product_identity();
    let existing = doc.trailer.get(b"Info").and_then(Object::as_reference).ok();
    let info_id = match existing {
        Some(id) if doc.get_object(id).is_ok() => id,
        _ => {
            let id = doc.add_object(Dictionary::new());
            doc.trailer.set("Info", id);
            id
        }
    };
    if let Ok(info) = doc.get_object_mut(info_id).and_then(Object::as_dict_mut) {
        info.set("Creator", Object::string_literal(identity.clone()));
        info.set("Producer", Object::string_literal(identity));
        info.set("Keywords", Object::string_literal(token));
    }
}
