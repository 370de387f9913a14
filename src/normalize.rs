//! Record normalizer: builds the comparison string of a ticket and its
//! content fingerprint.
//!
//! The comparison string has a fixed field order so that an unchanged ticket
//! always produces the same fingerprint:
//!
//! `SYSTEM: <system> | SERVICE: <service> | SUBAREA: <subarea> | TITLE: <title>. DESCRIPTION: <description>`

use rayon::prelude::*;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::model::{NormalizedText, Ticket};

const MISSING: &str = "N/A";

const DEFAULT_DISCLAIMERS: &[&str] = &[
    r"(?i)confidentiality notice:.*",
    r"(?i)this (e-?mail|message)( and any attachments)? (is|are|may be) (confidential|intended (solely|only)).*",
    r"(?i)if you (have )?received this (e-?mail|message) (by|in) error.*",
    r"(?i)please consider the environment before printing.*",
];

/// Compiled cleaning rules. Build once per run; cleaning is pure.
#[derive(Debug, Clone)]
pub struct Normalizer {
    block_tags: Regex,
    line_breaks: Regex,
    tags: Regex,
    numeric_entity: Regex,
    reply_header: Regex,
    mail_field: Regex,
    address: Regex,
    signoff: Regex,
    boilerplate: Vec<Regex>,
    whitespace: Regex,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&[]).expect("built-in normalizer patterns are valid")
    }
}

impl Normalizer {
    /// Built-in rules plus `extra` boilerplate patterns removed from free text.
    pub fn new(extra: &[String]) -> Result<Self, regex::Error> {
        let boilerplate = DEFAULT_DISCLAIMERS
            .iter()
            .map(|p| Regex::new(p))
            .chain(extra.iter().map(|p| Regex::new(p)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            block_tags: Regex::new(r"(?is)<(script|style)\b.*?</(script|style)\s*>")?,
            line_breaks: Regex::new(r"(?i)<\s*(br|/p|/div|/li|/tr)\s*/?\s*>")?,
            tags: Regex::new(r"(?s)<[^>]*>")?,
            numeric_entity: Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);")?,
            reply_header: Regex::new(r"(?i)^(on .+ wrote:|-+ ?original message ?-+)$")?,
            mail_field: Regex::new(r"(?i)^(from|sent|to|cc|date|subject):\s*(.*)$")?,
            address: Regex::new(r"[^\s@<>]+@[^\s@<>]+\.[A-Za-z]{2,}")?,
            signoff: Regex::new(r"^(--\s*|sent from my .+)$")?,
            boilerplate,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    pub fn normalize(&self, ticket: &Ticket) -> NormalizedText {
        let title = self.clean_free_text(&ticket.title);
        let description = self.clean_free_text(&ticket.description);
        let empty = title.is_empty() && description.is_empty();

        let text = format!(
            "SYSTEM: {} | SERVICE: {} | SUBAREA: {} | TITLE: {}. DESCRIPTION: {}",
            self.clean_field(&ticket.system),
            self.clean_field(&ticket.service),
            ticket
                .subarea
                .as_deref()
                .map(|s| self.clean_field(s))
                .unwrap_or_else(|| MISSING.to_string()),
            or_missing(title),
            or_missing(description),
        );
        let fingerprint = fingerprint(&text);
        NormalizedText {
            ticket_id: ticket.id.clone(),
            text,
            fingerprint,
            empty,
        }
    }

    /// Normalize a batch in parallel; output order follows input order.
    pub fn normalize_batch(&self, tickets: &[Ticket]) -> Vec<NormalizedText> {
        tickets.par_iter().map(|t| self.normalize(t)).collect()
    }

    /// Strip markup, quoted replies, signatures and disclaimers, then
    /// collapse whitespace.
    pub fn clean_free_text(&self, raw: &str) -> String {
        let text = self.block_tags.replace_all(raw, " ");
        let text = self.line_breaks.replace_all(&text, "\n");
        let text = self.tags.replace_all(&text, " ");
        let text = self.decode_entities(&text);

        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        let mut kept: Vec<&str> = Vec::new();
        for (i, &line) in lines.iter().enumerate() {
            if self.signoff.is_match(&line.to_lowercase()) || self.starts_quoted_mail(&lines, i) {
                // everything below a signature or reply header is quoted history
                break;
            }
            if line.starts_with('>') {
                continue;
            }
            kept.push(line);
        }

        let mut text = kept.join("\n");
        for pattern in &self.boilerplate {
            text = pattern.replace_all(&text, " ").into_owned();
        }
        self.collapse(&text)
    }

    /// A `From:` or `Sent:` line only opens a quoted mail when it looks like a
    /// header: it carries an address, or the next line is another header field.
    fn starts_quoted_mail(&self, lines: &[&str], i: usize) -> bool {
        let line = lines[i];
        if self.reply_header.is_match(line) {
            return true;
        }
        let Some(caps) = self.mail_field.captures(line) else {
            return false;
        };
        if !matches!(caps[1].to_lowercase().as_str(), "from" | "sent") {
            return false;
        }
        self.address.is_match(&caps[2])
            || lines[i + 1..]
                .iter()
                .find(|l| !l.is_empty())
                .is_some_and(|next| self.mail_field.is_match(next))
    }

    fn clean_field(&self, raw: &str) -> String {
        let text = self.tags.replace_all(raw, " ");
        or_missing(self.collapse(&self.decode_entities(&text)))
    }

    fn collapse(&self, text: &str) -> String {
        self.whitespace.replace_all(text, " ").trim().to_string()
    }

    fn decode_entities(&self, text: &str) -> String {
        let text = self.numeric_entity.replace_all(text, |caps: &regex::Captures| {
            let code = &caps[1];
            let value = match code.strip_prefix('x') {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => code.parse::<u32>().ok(),
            };
            value
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default()
        });
        text.replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&amp;", "&")
    }
}

fn or_missing(s: String) -> String {
    if s.is_empty() {
        MISSING.to_string()
    } else {
        s
    }
}

/// Hex SHA-256 of the cleaned text. Stable across runs and processes.
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
