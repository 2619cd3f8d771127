//! Minimal HL7 v2 surface
//!
//! The engine does not validate HL7 beyond locating segment boundaries and
//! the `MSH-9` / `MSH-10` fields it needs for routing and acknowledgement.
//! Field access follows the ER7 numbering convention: for `MSH` the field
//! separator itself is `MSH-1`, so `MSH-9` is the ninth field counting the
//! separator, not the ninth `|`-delimited token.

use uuid::Uuid;

use crate::error::{EngineError, Result};

const FIELD_SEP: char = '|';
const COMPONENT_SEP: char = '^';

/// Acknowledgement code carried in `MSA-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Application accept.
    Aa,
    /// Commit accept: frame persisted, processing deferred.
    Ca,
    /// Application error.
    Ae,
    /// Application reject.
    Ar,
}

impl AckCode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aa => "AA",
            Self::Ca => "CA",
            Self::Ae => "AE",
            Self::Ar => "AR",
        }
    }

    /// Parses an `MSA-1` value. Accepts the commit-variant first letters
    /// (`CA`/`CE`/`CR`) used by enhanced acknowledgement mode.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "AA" => Some(Self::Aa),
            "CA" => Some(Self::Ca),
            "AE" | "CE" => Some(Self::Ae),
            "AR" | "CR" => Some(Self::Ar),
            _ => None,
        }
    }

    /// True for `AA`/`CA`.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Aa | Self::Ca)
    }
}

/// One parsed segment: its three-letter id and raw field strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hl7Segment {
    pub id: String,
    fields: Vec<String>,
}

impl Hl7Segment {
    /// Field by ER7 number. For `MSH`, field 1 is the separator and field 2
    /// the encoding characters.
    #[must_use]
    pub fn field(&self, number: usize) -> Option<&str> {
        if number == 0 {
            return None;
        }
        if self.id == "MSH" {
            match number {
                1 => Some("|"),
                n => self.fields.get(n - 1).map(String::as_str),
            }
        } else {
            self.fields.get(number).map(String::as_str)
        }
    }
}

/// Location of one field or component, e.g. `MSH-9.1` or `OBX(2)-5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub segment: String,
    /// 1-based segment occurrence.
    pub occurrence: usize,
    pub field: usize,
    pub component: Option<usize>,
}

impl FieldPath {
    /// Parses `SEG-n`, `SEG-n.m` and `SEG(occ)-n[.m]`.
    pub fn parse(path: &str) -> Result<Self> {
        let (seg_part, field_part) = path
            .split_once('-')
            .ok_or_else(|| EngineError::validation(format!("field path without '-': {path}")))?;

        let (segment, occurrence) = match seg_part.split_once('(') {
            Some((seg, rest)) => {
                let occ_str = rest.strip_suffix(')').ok_or_else(|| {
                    EngineError::validation(format!("unterminated occurrence in: {path}"))
                })?;
                let occ: usize = occ_str.trim().parse().map_err(|_| {
                    EngineError::validation(format!("bad occurrence '{occ_str}' in: {path}"))
                })?;
                if occ == 0 {
                    return Err(EngineError::validation(format!(
                        "occurrence is 1-based in: {path}"
                    )));
                }
                (seg.trim().to_string(), occ)
            }
            None => (seg_part.trim().to_string(), 1),
        };

        if segment.is_empty() {
            return Err(EngineError::validation(format!("empty segment in: {path}")));
        }

        let (field_str, component) = match field_part.split_once('.') {
            Some((f, c)) => {
                let comp: usize = c.trim().parse().map_err(|_| {
                    EngineError::validation(format!("bad component '{c}' in: {path}"))
                })?;
                (f, Some(comp))
            }
            None => (field_part, None),
        };

        let field: usize = field_str.trim().parse().map_err(|_| {
            EngineError::validation(format!("bad field number '{field_str}' in: {path}"))
        })?;
        if field == 0 || component == Some(0) {
            return Err(EngineError::validation(format!(
                "field and component are 1-based in: {path}"
            )));
        }

        Ok(Self {
            segment: segment.to_uppercase(),
            occurrence,
            field,
            component,
        })
    }
}

/// A lazily parsed view over raw HL7 bytes.
#[derive(Debug, Clone)]
pub struct Hl7Message {
    segments: Vec<Hl7Segment>,
}

impl Hl7Message {
    /// Splits raw ER7 bytes into segments. Fails only when no `MSH` segment
    /// leads the message.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(raw);
        let segments: Vec<Hl7Segment> = text
            .split(['\r', '\n'])
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let fields: Vec<String> =
                    line.split(FIELD_SEP).map(ToString::to_string).collect();
                let id = fields.first().cloned().unwrap_or_default();
                Hl7Segment { id, fields }
            })
            .collect();

        match segments.first() {
            Some(first) if first.id == "MSH" => Ok(Self { segments }),
            Some(first) => Err(EngineError::validation(format!(
                "message does not start with MSH (got {})",
                first.id
            ))),
            None => Err(EngineError::validation("empty HL7 message")),
        }
    }

    /// First segment with the given id.
    #[must_use]
    pub fn segment(&self, id: &str) -> Option<&Hl7Segment> {
        self.segments.iter().find(|s| s.id == id)
    }

    /// Nth (1-based) segment with the given id.
    #[must_use]
    pub fn segment_occurrence(&self, id: &str, occurrence: usize) -> Option<&Hl7Segment> {
        self.segments.iter().filter(|s| s.id == id).nth(occurrence.saturating_sub(1))
    }

    /// Resolves a field path to its string value. Missing segments, fields
    /// and components resolve to `None`, not errors: routing conditions
    /// compare against absent fields all the time.
    #[must_use]
    pub fn value_at(&self, path: &FieldPath) -> Option<&str> {
        let segment = self.segment_occurrence(&path.segment, path.occurrence)?;
        let field = segment.field(path.field)?;
        match path.component {
            None => Some(field),
            Some(component) => field.split(COMPONENT_SEP).nth(component - 1),
        }
    }

    /// Convenience accessor: `value("MSH-9.1")`.
    #[must_use]
    pub fn value(&self, path: &str) -> Option<&str> {
        let parsed = FieldPath::parse(path).ok()?;
        self.value_at(&parsed)
    }

    /// `MSH-9` joined with `^`, e.g. `ADT^A01`.
    #[must_use]
    pub fn message_type(&self) -> Option<String> {
        self.value("MSH-9").map(ToString::to_string)
    }

    /// `MSH-10`.
    #[must_use]
    pub fn control_id(&self) -> Option<&str> {
        self.value("MSH-10")
    }

    /// Schema name derived from the message type: `ADT^A01` -> `ADT_A01`.
    #[must_use]
    pub fn schema_name(&self) -> Option<String> {
        let msg_type = self.value("MSH-9.1")?;
        match self.value("MSH-9.2") {
            Some(trigger) if !trigger.is_empty() => Some(format!("{msg_type}_{trigger}")),
            _ => Some(msg_type.to_string()),
        }
    }

    /// Builds an ACK body for this message.
    ///
    /// The `MSH` of the ACK mirrors the request's sending/receiving
    /// application and facility (swapped), carries a fresh control id, and is
    /// followed by an `MSA` echoing the request's `MSH-10`.
    #[must_use]
    pub fn build_ack(&self, code: AckCode, text: Option<&str>) -> Vec<u8> {
        let field = |n: usize| self.value_at(&FieldPath {
            segment: "MSH".to_string(),
            occurrence: 1,
            field: n,
            component: None,
        })
        .unwrap_or("");

        let sending_app = field(3);
        let sending_fac = field(4);
        let receiving_app = field(5);
        let receiving_fac = field(6);
        let processing_id = if field(11).is_empty() { "P" } else { field(11) };
        let version = if field(12).is_empty() { "2.4" } else { field(12) };
        let control_id = self.control_id().unwrap_or("");

        let trigger = self.value("MSH-9.2").unwrap_or("");
        let ack_type = if trigger.is_empty() {
            "ACK".to_string()
        } else {
            format!("ACK^{trigger}")
        };

        let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let ack_control_id = new_control_id();

        let msa_text = text.map(|t| format!("|{t}")).unwrap_or_default();

        format!(
            "MSH|^~\\&|{receiving_app}|{receiving_fac}|{sending_app}|{sending_fac}|{timestamp}||{ack_type}|{ack_control_id}|{processing_id}|{version}\rMSA|{code}|{control_id}{msa_text}",
            code = code.as_str(),
        )
        .into_bytes()
    }

    /// Reads the ACK code out of an acknowledgement message (`MSA-1`).
    #[must_use]
    pub fn ack_code(&self) -> Option<AckCode> {
        self.value("MSA-1").and_then(AckCode::parse)
    }

    /// The control id an ACK refers to (`MSA-2`).
    #[must_use]
    pub fn acked_control_id(&self) -> Option<&str> {
        self.value("MSA-2")
    }
}

/// HL7 control ids are capped at 20 characters.
fn new_control_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(20);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADT: &[u8] =
        b"MSH|^~\\&|SendApp|SendFac|RecvApp|RecvFac|20260101000000||ADT^A01|MSG00001|P|2.4\rEVN|A01|20260101000000\rPID|1||12345^^^MRN||Doe^John||19800101|M\rOBX|1|TX|NOTE||first\rOBX|2|TX|NOTE||second";

    #[test_log::test]
    fn msh_field_numbering() {
        let msg = Hl7Message::parse(ADT).unwrap();
        assert_eq!(msg.value("MSH-1"), Some("|"));
        assert_eq!(msg.value("MSH-2"), Some("^~\\&"));
        assert_eq!(msg.value("MSH-3"), Some("SendApp"));
        assert_eq!(msg.value("MSH-9"), Some("ADT^A01"));
        assert_eq!(msg.value("MSH-9.1"), Some("ADT"));
        assert_eq!(msg.value("MSH-9.2"), Some("A01"));
        assert_eq!(msg.control_id(), Some("MSG00001"));
    }

    #[test_log::test]
    fn non_msh_field_numbering() {
        let msg = Hl7Message::parse(ADT).unwrap();
        assert_eq!(msg.value("PID-3.1"), Some("12345"));
        assert_eq!(msg.value("PID-5.2"), Some("John"));
        assert_eq!(msg.value("PID-8"), Some("M"));
    }

    #[test_log::test]
    fn segment_occurrences() {
        let msg = Hl7Message::parse(ADT).unwrap();
        assert_eq!(msg.value("OBX-5"), Some("first"));
        assert_eq!(msg.value("OBX(2)-5"), Some("second"));
        assert_eq!(msg.value("OBX(3)-5"), None);
    }

    #[test_log::test]
    fn missing_fields_resolve_to_none() {
        let msg = Hl7Message::parse(ADT).unwrap();
        assert_eq!(msg.value("ZZZ-1"), None);
        assert_eq!(msg.value("PID-40"), None);
        assert_eq!(msg.value("PID-5.9"), None);
    }

    #[test_log::test]
    fn schema_name_from_message_type() {
        let msg = Hl7Message::parse(ADT).unwrap();
        assert_eq!(msg.schema_name().as_deref(), Some("ADT_A01"));
        assert_eq!(msg.message_type().as_deref(), Some("ADT^A01"));
    }

    #[test_log::test]
    fn rejects_messages_without_msh() {
        assert!(Hl7Message::parse(b"PID|1||123").is_err());
        assert!(Hl7Message::parse(b"").is_err());
    }

    #[test_log::test]
    fn ack_mirrors_applications_and_echoes_control_id() {
        let msg = Hl7Message::parse(ADT).unwrap();
        let ack_raw = msg.build_ack(AckCode::Aa, None);
        let ack = Hl7Message::parse(&ack_raw).unwrap();

        assert_eq!(ack.value("MSH-3"), Some("RecvApp"));
        assert_eq!(ack.value("MSH-4"), Some("RecvFac"));
        assert_eq!(ack.value("MSH-5"), Some("SendApp"));
        assert_eq!(ack.value("MSH-6"), Some("SendFac"));
        assert_eq!(ack.value("MSH-9"), Some("ACK^A01"));
        assert_eq!(ack.value("MSH-12"), Some("2.4"));
        assert_eq!(ack.ack_code(), Some(AckCode::Aa));
        assert_eq!(ack.acked_control_id(), Some("MSG00001"));
        assert_ne!(ack.control_id(), Some("MSG00001"));
    }

    #[test_log::test]
    fn nack_carries_error_text() {
        let msg = Hl7Message::parse(ADT).unwrap();
        let ack_raw = msg.build_ack(AckCode::Ae, Some("boom"));
        let ack = Hl7Message::parse(&ack_raw).unwrap();
        assert_eq!(ack.ack_code(), Some(AckCode::Ae));
        assert_eq!(ack.value("MSA-3"), Some("boom"));
    }

    #[test_log::test]
    fn field_path_parsing() {
        let p = FieldPath::parse("MSH-9.1").unwrap();
        assert_eq!(p.segment, "MSH");
        assert_eq!(p.field, 9);
        assert_eq!(p.component, Some(1));
        assert_eq!(p.occurrence, 1);

        let p = FieldPath::parse("OBX(2)-5").unwrap();
        assert_eq!(p.occurrence, 2);
        assert_eq!(p.component, None);

        assert!(FieldPath::parse("MSH9").is_err());
        assert!(FieldPath::parse("MSH-0").is_err());
        assert!(FieldPath::parse("OBX(0)-5").is_err());
    }

    #[test_log::test]
    fn ack_code_parsing() {
        assert_eq!(AckCode::parse("AA"), Some(AckCode::Aa));
        assert_eq!(AckCode::parse("CE"), Some(AckCode::Ae));
        assert_eq!(AckCode::parse("xx"), None);
        assert!(AckCode::Ca.is_positive());
        assert!(!AckCode::Ar.is_positive());
    }
}
