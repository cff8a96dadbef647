use crate::models::{SourceFormat, TargetFormat};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

/// Base name used when the upload's own name has nothing usable left
const FALLBACK_BASE_NAME: &str = "converted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Rejects absent and zero-length uploads
pub fn validate_content(content: Option<&[u8]>) -> Result<&[u8], ValidationError> {
    match content {
        Some(data) if !data.is_empty() => Ok(data),
        _ => Err(ValidationError {
            code: "EMPTY_FILE",
            message: "No file was uploaded.".to_string(),
        }),
    }
}

/// Rejects uploads larger than `max_size` bytes
pub fn validate_file_size(size: usize, max_size: usize) -> Result<(), ValidationError> {
    if size > max_size {
        return Err(ValidationError {
            code: "FILE_TOO_LARGE",
            message: format!(
                "File size {} bytes exceeds maximum allowed {} bytes ({} MB)",
                size,
                max_size,
                max_size / 1024 / 1024
            ),
        });
    }
    Ok(())
}

/// Only `ods` and `xlsx` are accepted, in any letter case
pub fn validate_target_format(format: Option<&str>) -> Result<TargetFormat, ValidationError> {
    format
        .and_then(TargetFormat::parse)
        .ok_or_else(|| ValidationError {
            code: "INVALID_FORMAT",
            message: "Invalid format: expected 'ods' or 'xlsx'.".to_string(),
        })
}

/// Source type comes from the uploaded filename's extension
pub fn validate_source_extension(filename: &str) -> Result<SourceFormat, ValidationError> {
    split_extension(last_component(filename))
        .1
        .and_then(SourceFormat::from_extension)
        .ok_or_else(|| ValidationError {
            code: "UNSUPPORTED_EXTENSION",
            message: "Unsupported file type: expected .xlsx, .xls or .ods.".to_string(),
        })
}

/// Full validation of an upload: content, then format, then extension
pub fn validate_upload<'a>(
    content: Option<&'a [u8]>,
    filename: &str,
    format: Option<&str>,
) -> Result<(&'a [u8], SourceFormat, TargetFormat), ValidationError> {
    let data = validate_content(content)?;
    let target = validate_target_format(format)?;
    let source = validate_source_extension(filename)?;
    Ok((data, source, target))
}

/// Client-side paths are dropped; both separators are honoured since browsers
/// on Windows may still send them
fn last_component(filename: &str) -> &str {
    filename.rsplit(['/', '\\']).next().unwrap_or(filename)
}

/// Split at the last dot. A leading dot counts too, so `.xlsx` has an empty
/// stem and the extension `xlsx`; a trailing dot gives no extension.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() => (stem, Some(ext)),
        Some((stem, _)) => (stem, None),
        None => (name, None),
    }
}

/// Stem of the uploaded filename, made safe for headers and filesystems
pub fn output_base_name(filename: &str) -> String {
    let (stem, _) = split_extension(last_component(filename));

    let sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_control()
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = sanitized.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return FALLBACK_BASE_NAME.to_string();
    }

    // Limit length safely for UTF-8
    if trimmed.len() > 200 {
        let mut end = 200;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        trimmed[..end].to_string()
    } else {
        trimmed.to_string()
    }
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 encoded name
pub fn content_disposition(filename: &str) -> String {
    let ascii_filename = filename
        .chars()
        .filter(|c| c.is_ascii() && !c.is_control() && *c != '"' && *c != '\\' && *c != ';')
        .collect::<String>();
    let fallback_filename = if ascii_filename.trim().is_empty() {
        "converted"
    } else {
        &ascii_filename
    };

    let encoded_filename = utf8_percent_encode(filename, NON_ALPHANUMERIC).to_string();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback_filename, encoded_filename
    )
}
