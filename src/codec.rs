use crate::types::{CaseId, CASE_ID_LEN};

/// Maps between a case identifier and the filename of one artifact kind.
///
/// Identifiers are recovered with exact-width parsing so cases keep matching
/// across stages.
pub trait IdentifierCodec: Send + Sync {
    /// Recover the case id from a filename, or `None` if the file is not this kind of artifact
    fn decode(&self, file_name: &str) -> Option<CaseId>;

    /// Canonical filename for the case
    fn encode(&self, id: &CaseId) -> String;
}

/// Identifier at a fixed character offset, e.g. downloaded PDFs whose name
/// carries a three character prefix before the process number.
#[derive(Debug, Clone)]
pub struct FixedWidthCodec {
    prefix: String,
    extension: String,
}

impl FixedWidthCodec {
    /// `prefix` is written on encode; its length is the offset used on decode
    pub fn new(prefix: &str, extension: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            extension: extension.to_ascii_lowercase(),
        }
    }

    /// Process PDFs: `PRC<id>.pdf`, extension matched case-insensitively
    pub fn pdf() -> Self {
        Self::new("PRC", ".pdf")
    }

    fn offset(&self) -> usize {
        self.prefix.chars().count()
    }
}

impl IdentifierCodec for FixedWidthCodec {
    fn decode(&self, file_name: &str) -> Option<CaseId> {
        if !file_name.to_ascii_lowercase().ends_with(&self.extension) {
            return None;
        }
        let id: String = file_name
            .chars()
            .skip(self.offset())
            .take(CASE_ID_LEN)
            .collect();
        CaseId::parse(&id).ok()
    }

    fn encode(&self, id: &CaseId) -> String {
        format!("{}{}{}", self.prefix, id, self.extension)
    }
}

/// Identifier is everything before the first delimiter, and the name ends
/// with a fixed suffix: `<id>.txt`, `<id>_final_report.md`, `<id>_error.txt`.
#[derive(Debug, Clone)]
pub struct DelimitedCodec {
    delimiter: char,
    suffix: String,
}

impl DelimitedCodec {
    pub fn new(delimiter: char, suffix: &str) -> Self {
        Self {
            delimiter,
            suffix: suffix.to_string(),
        }
    }

    /// OCR text: `<id>.txt`
    pub fn ocr_text() -> Self {
        Self::new('.', ".txt")
    }

    /// Generated report: `<id>_final_report.md`
    pub fn report() -> Self {
        Self::new('_', "_final_report.md")
    }

    /// Error sidecar written next to a Pending artifact: `<id>_error.txt`
    pub fn error_sidecar() -> Self {
        Self::new('_', "_error.txt")
    }

    /// Marker left for a download that never produced a PDF: `<id>_pending.txt`
    pub fn download_marker() -> Self {
        Self::new('_', "_pending.txt")
    }
}

impl IdentifierCodec for DelimitedCodec {
    fn decode(&self, file_name: &str) -> Option<CaseId> {
        if !file_name.ends_with(&self.suffix) {
            return None;
        }
        let (head, _) = file_name.split_once(self.delimiter)?;
        let id = CaseId::parse(head).ok()?;
        // The remainder must be exactly the suffix, so `<id>_error.txt` never
        // decodes as OCR text `<id>.txt`.
        (self.encode(&id) == file_name).then_some(id)
    }

    fn encode(&self, id: &CaseId) -> String {
        format!("{}{}", id, self.suffix)
    }
}
