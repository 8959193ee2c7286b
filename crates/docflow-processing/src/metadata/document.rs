//! PDF and DOCX metadata.
//!
//! PDF fields come from a scan of the raw file: the page tree `/Count` and the
//! strings of the document information dictionary. Streams are not inflated,
//! so files that keep their info dictionary inside a compressed object stream
//! report only the page count.

use chrono::{FixedOffset, NaiveDate, SecondsFormat, TimeZone, Utc};
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use serde::Serialize;
use std::io::{Cursor, Read};

use crate::error::MetadataError;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PdfMetadata {
    pub kind: &'static str,
    pub format: &'static str,
    pub pages: Option<u32>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub modification_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocxMetadata {
    pub kind: &'static str,
    pub format: &'static str,
    pub pages: Option<u64>,
    pub words: Option<u64>,
    pub characters: Option<u64>,
    pub paragraphs: Option<u64>,
    pub lines: Option<u64>,
    pub creator: Option<String>,
    pub last_modified_by: Option<String>,
    pub created_at: Option<String>,
    pub modified_at: Option<String>,
}

pub fn extract_pdf(data: &[u8]) -> Result<PdfMetadata, MetadataError> {
    let header_window = &data[..data.len().min(1024)];
    if !header_window.windows(5).any(|w| w == b"%PDF-") {
        return Err(MetadataError::content("Not a PDF file: missing %PDF- header"));
    }

    Ok(PdfMetadata {
        kind: "document",
        format: "pdf",
        pages: page_count(data),
        title: info_string(data, "Title"),
        author: info_string(data, "Author"),
        subject: info_string(data, "Subject"),
        creator: info_string(data, "Creator"),
        producer: info_string(data, "Producer"),
        creation_date: info_string(data, "CreationDate").and_then(|d| parse_pdf_date(&d)),
        modification_date: info_string(data, "ModDate").and_then(|d| parse_pdf_date(&d)),
    })
}

/// Largest `/Count` of the file (the root of the page tree), falling back to
/// counting `/Type /Page` objects.
fn page_count(data: &[u8]) -> Option<u32> {
    let count = BytesRegex::new(r"(?-u)/Count\s+(\d+)").ok()?;
    let largest = count
        .captures_iter(data)
        .filter_map(|c| std::str::from_utf8(&c[1]).ok()?.parse::<u32>().ok())
        .max();
    if let Some(pages) = largest.filter(|p| *p > 0) {
        return Some(pages);
    }

    let page = BytesRegex::new(r"(?-u)/Type\s*/Page(?:[^s\w]|$)").ok()?;
    let pages = page.find_iter(data).count() as u32;
    (pages > 0).then_some(pages)
}

/// Value of `/{key}` in the last information dictionary of the file.
/// Later dictionaries win since incremental updates append them.
fn info_string(data: &[u8], key: &str) -> Option<String> {
    let pattern = BytesRegex::new(&format!(r"(?-u)/{}\s*([(<])", regex::escape(key))).ok()?;
    let found = pattern.captures_iter(data).last()?;
    let open = found.get(1)?;
    let rest = &data[open.end()..];

    let raw = if open.as_bytes() == b"(" {
        parse_literal(rest)?
    } else {
        parse_hex(rest)?
    };
    let text = decode_text(&raw);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Body of a literal string, `rest` starting right after the opening paren.
fn parse_literal(rest: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut depth = 1usize;
    let mut i = 0;

    while i < rest.len() {
        let b = rest[i];
        match b {
            b'\\' => {
                i += 1;
                let escaped = *rest.get(i)?;
                match escaped {
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0C),
                    b'0'..=b'7' => {
                        let mut value: u32 = 0;
                        let mut digits = 0;
                        while digits < 3 {
                            match rest.get(i) {
                                Some(d @ b'0'..=b'7') => {
                                    value = value * 8 + u32::from(d - b'0');
                                    i += 1;
                                    digits += 1;
                                }
                                _ => break,
                            }
                        }
                        out.push((value & 0xFF) as u8);
                        continue;
                    }
                    // Line continuation
                    b'\r' => {
                        if rest.get(i + 1) == Some(&b'\n') {
                            i += 1;
                        }
                    }
                    b'\n' => {}
                    other => out.push(other),
                }
            }
            b'(' => {
                depth += 1;
                out.push(b);
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(out);
                }
                out.push(b);
            }
            _ => out.push(b),
        }
        i += 1;
    }
    None
}

/// Body of a hex string, `rest` starting right after `<`.
fn parse_hex(rest: &[u8]) -> Option<Vec<u8>> {
    let end = rest.iter().position(|b| *b == b'>')?;
    let mut digits: Vec<u8> = rest[..end]
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|b| (*b as char).to_digit(16).map(|d| d as u8))
        .collect::<Option<Vec<u8>>>()?;
    if digits.len() % 2 == 1 {
        digits.push(0);
    }
    Some(digits.chunks(2).map(|pair| pair[0] << 4 | pair[1]).collect())
}

/// PDF text strings are UTF-16BE with a BOM, UTF-8 with a BOM, or
/// PDFDocEncoding (treated as Latin-1).
fn decode_text(raw: &[u8]) -> String {
    if let Some(utf16) = raw.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    if let Some(utf8) = raw.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(utf8).into_owned();
    }
    raw.iter().map(|b| char::from(*b)).collect()
}

/// `D:YYYYMMDDHHmmSSOHH'mm'` to RFC 3339 in UTC. Missing trailing parts
/// default to their minimum; a missing offset means UTC.
fn parse_pdf_date(value: &str) -> Option<String> {
    let value = value.trim();
    let value = value.strip_prefix("D:").unwrap_or(value);
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return None;
    }

    let field = |start: usize, len: usize, default: u32| -> Option<u32> {
        match digits.get(start..start + len) {
            Some(part) => part.parse().ok(),
            None => Some(default),
        }
    };
    let year = digits.get(0..4)?.parse::<i32>().ok()?;
    let naive = NaiveDate::from_ymd_opt(year, field(4, 2, 1)?, field(6, 2, 1)?)?
        .and_hms_opt(field(8, 2, 0)?, field(10, 2, 0)?, field(12, 2, 0)?)?;

    let zone = &value[digits.len()..];
    let offset_secs = match zone.chars().next() {
        Some(sign @ ('+' | '-')) => {
            let parts: Vec<i32> = zone[1..]
                .split('\'')
                .filter(|p| !p.is_empty())
                .filter_map(|p| p.parse().ok())
                .collect();
            let secs = parts.first().copied().unwrap_or(0) * 3600
                + parts.get(1).copied().unwrap_or(0) * 60;
            if sign == '-' {
                -secs
            } else {
                secs
            }
        }
        _ => 0,
    };

    let offset = FixedOffset::east_opt(offset_secs)?;
    let local = offset.from_local_datetime(&naive).single()?;
    Some(
        local
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

pub fn extract_docx(data: &[u8]) -> Result<DocxMetadata, MetadataError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| MetadataError::content(format!("Invalid DOCX archive: {}", e)))?;
    let app = read_entry(&mut archive, "docProps/app.xml")?;
    let core = read_entry(&mut archive, "docProps/core.xml")?;
    let app = app.as_deref();
    let core = core.as_deref();

    Ok(DocxMetadata {
        kind: "document",
        format: "docx",
        pages: xml_number(app, "Pages"),
        words: xml_number(app, "Words"),
        characters: xml_number(app, "Characters"),
        paragraphs: xml_number(app, "Paragraphs"),
        lines: xml_number(app, "Lines"),
        creator: xml_text(core, "dc:creator"),
        last_modified_by: xml_text(core, "cp:lastModifiedBy"),
        created_at: xml_text(core, "dcterms:created"),
        modified_at: xml_text(core, "dcterms:modified"),
    })
}

fn read_entry(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, MetadataError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(MetadataError::content(format!("Failed to read {}: {}", name, e))),
    };
    let mut xml = String::new();
    file.read_to_string(&mut xml)
        .map_err(|e| MetadataError::content(format!("Failed to read {}: {}", name, e)))?;
    Ok(Some(xml))
}

fn xml_number(xml: Option<&str>, tag: &str) -> Option<u64> {
    let tag = regex::escape(tag);
    let pattern = Regex::new(&format!(r"<{tag}>(\d+)</{tag}>")).ok()?;
    pattern.captures(xml?)?[1].parse().ok()
}

fn xml_text(xml: Option<&str>, tag: &str) -> Option<String> {
    let tag = regex::escape(tag);
    let pattern = Regex::new(&format!(r"<{tag}[^>]*>([\s\S]*?)</{tag}>")).ok()?;
    let text = pattern.captures(xml?)?[1].trim().to_string();
    Some(text)
}
