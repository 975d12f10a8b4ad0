use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use log::{debug, warn};
use mail_builder::headers::raw::Raw;
use mail_builder::MessageBuilder;
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use sha2::{Digest, Sha256};

use crate::config::AttachmentConfig;
use crate::stats::Statistics;

/// Headers carried over to the rewritten message.
const COPY_HEADERS: [&str; 6] = ["Subject", "From", "To", "Cc", "Date", "Message-ID"];

/// Transient description of one qualifying attachment.
#[derive(Debug)]
struct AttachmentRecord {
    filename: String,
    extension: String,
    size: u64,
    /// `YYYY_MM` grouping derived from the message's sent date.
    bucket: String,
}

/// Replaces qualifying attachments with reference links to external
/// storage. Anything that goes wrong degrades to keeping the message
/// exactly as it was fetched.
pub struct AttachmentExtractor {
    config: AttachmentConfig,
    simulation: bool,
}

impl AttachmentExtractor {
    pub fn new(config: AttachmentConfig, simulation: bool) -> Self {
        AttachmentExtractor { config, simulation }
    }

    /// Returns the outgoing message body. Messages without qualifying
    /// attachments pass through byte-identical.
    pub fn process(
        &self,
        raw: &[u8],
        internal_date: DateTime<FixedOffset>,
        stats: &mut Statistics,
    ) -> Vec<u8> {
        if !self.config.enabled {
            return raw.to_vec();
        }
        match self.rewrite(raw, internal_date, stats) {
            Ok(Some(rewritten)) => rewritten,
            Ok(None) => raw.to_vec(),
            Err(err) => {
                warn!("attachment extraction failed ({:#}), keeping message as-is", err);
                raw.to_vec()
            }
        }
    }

    fn rewrite(
        &self,
        raw: &[u8],
        internal_date: DateTime<FixedOffset>,
        stats: &mut Statistics,
    ) -> Result<Option<Vec<u8>>> {
        let parsed = parse_mail(raw).context("unparseable MIME structure")?;
        if parsed.subparts.is_empty() {
            return Ok(None);
        }

        let mut leaves = Vec::new();
        collect_leaves(&parsed, &mut leaves);

        let bucket = month_bucket(&parsed, internal_date);
        let mut bodies: Vec<&ParsedMail> = Vec::new();
        // (content type, filename, decoded content)
        let mut kept: Vec<(String, String, Vec<u8>)> = Vec::new();
        let mut qualifying: Vec<(AttachmentRecord, String, Vec<u8>)> = Vec::new();
        for part in leaves {
            let filename = match part_filename(part).map(|name| sanitize_filename(&name)) {
                Some(name) if !name.is_empty() => name,
                _ => {
                    bodies.push(part);
                    continue;
                }
            };
            let extension = extension_of(&filename);
            stats.record("attachment_types", &extension);
            let content = part
                .get_body_raw()
                .with_context(|| format!("undecodable attachment {}", filename))?;
            if self.qualifies(&extension, content.len() as u64) {
                let record = AttachmentRecord {
                    filename,
                    extension,
                    size: content.len() as u64,
                    bucket: bucket.clone(),
                };
                qualifying.push((record, part.ctype.mimetype.clone(), content));
            } else {
                kept.push((part.ctype.mimetype.clone(), filename, content));
            }
        }
        if qualifying.is_empty() {
            return Ok(None);
        }

        let mut links = Vec::new();
        for (record, ctype, content) in qualifying {
            match self.store(&record, &content) {
                Ok(link) => {
                    debug!(
                        "attachment {} ({} bytes, {}) extracted to {}",
                        record.filename, record.size, record.extension, link
                    );
                    stats.record("attachments", "extracted");
                    links.push(link);
                }
                Err(err) => {
                    warn!(
                        "could not extract attachment {} ({:#}), keeping it inline",
                        record.filename, err
                    );
                    stats.record("attachments", "kept_after_error");
                    kept.push((ctype, record.filename, content));
                }
            }
        }
        if links.is_empty() {
            return Ok(None);
        }

        let mut builder = MessageBuilder::new();
        for name in COPY_HEADERS {
            if let Some(value) = parsed.headers.get_first_value(name) {
                builder = builder.header(name, Raw::new(value));
            }
        }
        let selected = bodies
            .iter()
            .find(|p| p.ctype.mimetype.eq_ignore_ascii_case("text/plain"))
            .or_else(|| bodies.first())
            .copied();
        let links_block = format!(
            "[Attachments extracted and stored separately:]\n{}",
            links.join("\n")
        );
        match selected {
            Some(part) if part.ctype.mimetype.eq_ignore_ascii_case("text/html") => {
                builder = builder
                    .html_body(part.get_body().unwrap_or_default())
                    .text_body(links_block);
            }
            Some(part) => {
                let mut text = part.get_body().unwrap_or_default();
                text.push_str("\n\n");
                text.push_str(&links_block);
                builder = builder.text_body(text);
            }
            None => {
                builder = builder.text_body(links_block);
            }
        }
        for (ctype, filename, content) in kept {
            builder = builder.attachment(ctype, filename, content);
        }
        let rewritten = builder
            .write_to_vec()
            .context("could not serialize rewritten message")?;
        Ok(Some(rewritten))
    }

    fn qualifies(&self, extension: &str, size: u64) -> bool {
        !extension.is_empty()
            && self
                .config
                .extension_whitelist
                .iter()
                .any(|e| e == extension)
            && size > self.config.min_size
            && size < self.config.max_size
    }

    /// Writes the attachment under `<storage_path>/<bucket>/` and returns
    /// the reference link. Identical content reuses an existing file;
    /// different content under the same name gets a hash suffix so nothing
    /// is silently overwritten.
    fn store(&self, record: &AttachmentRecord, content: &[u8]) -> Result<String> {
        let dir = self.config.storage_path.join(&record.bucket);
        let mut name = record.filename.clone();
        if !self.simulation {
            fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
            let target = dir.join(&name);
            let collides = match fs::read(&target) {
                Ok(existing) => existing != content,
                Err(_) => false,
            };
            if collides {
                name = hashed_name(&name, content);
            }
            let target = dir.join(&name);
            if !target.exists() {
                fs::write(&target, content)
                    .with_context(|| format!("cannot write {}", target.display()))?;
            }
        }
        Ok(format!("{}{}/{}", self.config.storage_url, record.bucket, name))
    }
}

fn collect_leaves<'a>(part: &'a ParsedMail<'a>, out: &mut Vec<&'a ParsedMail<'a>>) {
    if part.subparts.is_empty() {
        out.push(part);
    } else {
        for sub in &part.subparts {
            collect_leaves(sub, out);
        }
    }
}

fn part_filename(part: &ParsedMail) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Strips query junk and characters that are not allowed in filenames on
/// common filesystems.
fn sanitize_filename(filename: &str) -> String {
    let name = filename.split('?').next().unwrap_or(filename);
    let name = name.trim_start_matches("file://");
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(OsStr::to_str)
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// `YYYY_MM` from the Date header, falling back to the internal date when
/// the header is missing or unparseable.
fn month_bucket(parsed: &ParsedMail, internal_date: DateTime<FixedOffset>) -> String {
    parsed
        .headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok())
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
        .map(|dt| dt.format("%Y_%m").to_string())
        .unwrap_or_else(|| internal_date.format("%Y_%m").to_string())
}

fn hashed_name(filename: &str, content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let tag: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    match filename.rsplit_once('.') {
        Some((stem, ext)) => format!("{}-{}.{}", stem, tag, ext),
        None => format!("{}-{}", filename, tag),
    }
}
