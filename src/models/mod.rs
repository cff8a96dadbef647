use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

pub const XLSX_MIME_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const ODS_MIME_TYPE: &str = "application/vnd.oasis.opendocument.spreadsheet";

/// Output formats the converter is asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Ods,
    Xlsx,
}

impl TargetFormat {
    /// Case-insensitive, otherwise an exact match
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "ods" => Some(Self::Ods),
            "xlsx" => Some(Self::Xlsx),
            _ => None,
        }
    }

    /// Value passed to `--convert-to` and used as the output extension
    pub fn extension(self) -> &'static str {
        match self {
            Self::Ods => "ods",
            Self::Xlsx => "xlsx",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Ods => ODS_MIME_TYPE,
            Self::Xlsx => XLSX_MIME_TYPE,
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Spreadsheet formats accepted as uploads, keyed by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Xlsx,
    Xls,
    Ods,
}

impl SourceFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_lowercase().as_str() {
            "xlsx" => Some(Self::Xlsx),
            "xls" => Some(Self::Xls),
            "ods" => Some(Self::Ods),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Xlsx => "xlsx",
            Self::Xls => "xls",
            Self::Ods => "ods",
        }
    }
}

/// How an upload is turned into the requested format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    /// One converter run straight to the target format
    Direct(TargetFormat),
    /// XLSX -> ODS -> XLSX, used to normalise ("clean") a workbook
    RoundTrip,
}

impl Pipeline {
    pub fn select(source: SourceFormat, target: TargetFormat) -> Self {
        match (source, target) {
            (SourceFormat::Xlsx, TargetFormat::Xlsx) => Self::RoundTrip,
            (_, target) => Self::Direct(target),
        }
    }

    pub fn target(self) -> TargetFormat {
        match self {
            Self::Direct(target) => target,
            Self::RoundTrip => TargetFormat::Xlsx,
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(target) => write!(f, "direct->{}", target),
            Self::RoundTrip => f.write_str("round-trip"),
        }
    }
}

/// An upload as received from the client, before validation
#[derive(Debug, Clone, Default)]
pub struct ConversionRequest {
    pub content: Option<Bytes>,
    pub filename: String,
    pub format: Option<String>,
}

/// A finished conversion ready to be sent back
#[derive(Debug, Clone)]
pub struct ConvertedFile {
    pub data: Vec<u8>,
    pub filename: String,
    pub content_type: &'static str,
}
