//! Document type validation.
//!
//! XML documents are treated as CCD. Anything else must carry an HL7 `MSH`
//! segment whose message type field names a supported message type.

use super::StageHandler;
use crate::core::{ErrorKind, StageResult, WorkItem};
use crate::errors::{FhirflowError, StoreError};
use crate::stores::DocumentStore;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// HL7 message types accepted by the converter.
pub const SUPPORTED_HL7_TYPES: [&str; 9] =
    ["ADT", "VXU", "ORM", "ORU", "PPR", "SIU", "MDM", "ACK", "OML"];

/// Index of the message type field in an `MSH` segment split on `|`.
const MSH_MESSAGE_TYPE_FIELD: usize = 8;

const COMPRESSED_EXTENSIONS: [&str; 2] = [".zip", ".gz"];

/// Detected document type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentType {
    /// Consolidated clinical document (XML).
    Ccd,
    /// HL7 v2 message.
    Hl7,
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ccd => write!(f, "CCD"),
            Self::Hl7 => write!(f, "HL7"),
        }
    }
}

fn xml_root() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // Prolog, comments and doctype may precede the root element.
    RE.get_or_init(|| {
        Regex::new(
            r"(?s)^\s*(?:<\?xml[^>]*\?>\s*)?(?:<!--.*?-->\s*|<!DOCTYPE[^>]*>\s*)*<([A-Za-z_][\w:.-]*)(?:\s[^>]*?)?(/?)>",
        )
        .ok()
    })
    .as_ref()
}

fn is_xml(text: &str) -> bool {
    let text = text.trim_start_matches('\u{feff}');
    let Some(caps) = xml_root().and_then(|re| re.captures(text)) else {
        return false;
    };
    let self_closing = caps.get(2).is_some_and(|m| !m.as_str().is_empty());
    let name = caps.get(1).map_or("", |m| m.as_str());
    self_closing || text.trim_end().ends_with(&format!("</{name}>"))
}

fn hl7_message_type(text: &str) -> Option<&str> {
    text.lines()
        .find(|line| line.starts_with("MSH"))
        .and_then(|line| line.split('|').nth(MSH_MESSAGE_TYPE_FIELD))
}

/// Detects the type of a document, or `None` if it is unsupported.
#[must_use]
pub fn detect_document_type(content: &[u8]) -> Option<DocumentType> {
    let text = String::from_utf8_lossy(content);
    if is_xml(&text) {
        return Some(DocumentType::Ccd);
    }

    let message_type = hl7_message_type(&text)?;
    let matches = SUPPORTED_HL7_TYPES
        .iter()
        .filter(|t| message_type.contains(*t))
        .count();
    (matches == 1).then_some(DocumentType::Hl7)
}

/// Returns true if the reference names a compressed upload.
#[must_use]
pub fn is_compressed(reference: &str) -> bool {
    let lower = reference.to_ascii_lowercase();
    COMPRESSED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// The `Validate` stage.
#[derive(Clone)]
pub struct ValidateStage {
    documents: Arc<dyn DocumentStore>,
}

impl fmt::Debug for ValidateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidateStage").finish_non_exhaustive()
    }
}

impl ValidateStage {
    /// Creates the stage; `documents` serves items without inline content.
    #[must_use]
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }
}

/// Loads the bytes of an item, inline content first.
pub(crate) async fn load_content(
    documents: &dyn DocumentStore,
    item: &WorkItem,
) -> Result<Result<Vec<u8>, StageResult>, FhirflowError> {
    if let Some(content) = &item.content {
        return Ok(Ok(content.clone()));
    }
    match documents.fetch(&item.reference).await {
        Ok(content) => Ok(Ok(content)),
        Err(StoreError::DocumentNotFound(reference)) => Ok(Err(StageResult::failed(
            ErrorKind::InvalidFile,
            format!("document {reference} not found"),
        ))),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl StageHandler for ValidateStage {
    fn name(&self) -> &str {
        "validate"
    }

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, FhirflowError> {
        if is_compressed(&item.reference) {
            return Ok(StageResult::failed(
                ErrorKind::CompressedFileNotSupported,
                format!("{} is compressed; upload the extracted file", item.reference),
            ));
        }

        let content = match load_content(self.documents.as_ref(), item).await? {
            Ok(content) => content,
            Err(failed) => return Ok(failed),
        };

        let Some(doc_type) = detect_document_type(&content) else {
            return Ok(StageResult::failed(
                ErrorKind::UnsupportedFileType,
                format!("{} is neither a CCD nor a supported HL7 message", item.reference),
            ));
        };

        tracing::debug!(item_id = %item.id, doc_type = %doc_type, "Document validated");

        let mut payload = item.payload.clone();
        if !payload.is_object() {
            payload = serde_json::json!({});
        }
        payload["Object"]["key"] = serde_json::Value::String(item.reference.clone());
        payload["Object"]["Type"] = serde_json::Value::String(doc_type.to_string());

        Ok(StageResult::success_with_status(
            payload,
            crate::stores::audit_status::VALID,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ItemSource;
    use crate::stores::InMemoryDocumentStore;

    const CCD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!-- sample -->
<ClinicalDocument xmlns="urn:hl7-org:v3">
  <title>Summary</title>
</ClinicalDocument>
"#;

    const ADT: &str = "MSH|^~\\&|EPIC|HOSP|||20200101120000||ADT^A01|123|P|2.3\rPID|1||42\n";

    fn item(reference: &str, content: Option<&str>) -> WorkItem {
        let mut item = WorkItem::new(
            ItemSource {
                record_id: "m1".to_string(),
                receipt_handle: None,
                delivery_id: "b1".to_string(),
            },
            reference,
        );
        item.content = content.map(|c| c.as_bytes().to_vec());
        item
    }

    fn stage() -> ValidateStage {
        ValidateStage::new(Arc::new(
            InMemoryDocumentStore::new().with_document("store/doc.xml", "<a><b/></a>"),
        ))
    }

    #[test]
    fn test_detect_ccd() {
        assert_eq!(detect_document_type(CCD.as_bytes()), Some(DocumentType::Ccd));
        assert_eq!(detect_document_type(b"<root/>"), Some(DocumentType::Ccd));
        assert_eq!(
            detect_document_type(b"<root version=\"1\"/>"),
            Some(DocumentType::Ccd)
        );
    }

    #[test]
    fn test_detect_hl7() {
        assert_eq!(detect_document_type(ADT.as_bytes()), Some(DocumentType::Hl7));
        let lines = "MSH|^~\\&|A|B|C|D|20200101||ORU^R01|1|P|2.5\nOBX|1\n";
        assert_eq!(detect_document_type(lines.as_bytes()), Some(DocumentType::Hl7));
    }

    #[test]
    fn test_detect_unsupported() {
        assert_eq!(detect_document_type(b"hello world"), None);
        assert_eq!(detect_document_type(b"<open>never closed"), None);
        assert_eq!(
            detect_document_type(b"MSH|^~\\&|A|B|C|D|20200101||DFT^P03|1|P|2.5"),
            None
        );
        assert_eq!(detect_document_type(b"MSH|short"), None);
    }

    #[test]
    fn test_compressed_references() {
        assert!(is_compressed("in/batch.ZIP"));
        assert!(is_compressed("in/doc.xml.gz"));
        assert!(!is_compressed("in/doc.xml"));
    }

    #[tokio::test]
    async fn test_stage_marks_type_in_payload() {
        let result = stage().handle(&item("in/a.xml", Some(CCD))).await.unwrap();
        match result {
            StageResult::Success { payload, status, .. } => {
                assert_eq!(status.as_deref(), Some("VALID"));
                assert_eq!(payload["Object"]["Type"], "CCD");
                assert_eq!(payload["Object"]["key"], "in/a.xml");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stage_fetches_from_store() {
        let result = stage().handle(&item("store/doc.xml", None)).await.unwrap();
        assert!(result.is_success());

        let missing = stage().handle(&item("store/missing.xml", None)).await.unwrap();
        assert_eq!(missing.error().unwrap().kind, ErrorKind::InvalidFile);
    }

    #[tokio::test]
    async fn test_stage_rejects_compressed_and_unsupported() {
        let zipped = stage().handle(&item("in/a.zip", Some(CCD))).await.unwrap();
        assert_eq!(
            zipped.error().unwrap().kind,
            ErrorKind::CompressedFileNotSupported
        );

        let text = stage().handle(&item("in/a.txt", Some("plain"))).await.unwrap();
        assert_eq!(text.error().unwrap().kind, ErrorKind::UnsupportedFileType);
    }
}
