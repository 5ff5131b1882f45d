//! Codec for the EMV-style TLV payload used by QRIS.
//!
//! A payload is a flat sequence of records: two ASCII digits for the tag, two
//! ASCII digits for the value length, then the value itself. The checksum
//! record (tag 63) covers everything before it, including its own tag and
//! length header.

use thiserror::Error;

/// Point-of-initiation tag. "11" means static, "12" means dynamic.
const TAG_POI_METHOD: &str = "01";
/// Transaction amount.
const TAG_AMOUNT: &str = "54";
/// Country code. The amount record is inserted right before this one when the
/// static source does not carry one.
const TAG_COUNTRY_CODE: &str = "58";
/// CRC checksum, always the last record.
const TAG_CRC: &str = "63";

const POI_DYNAMIC: &str = "12";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QrisError {
    #[error("payload is not valid TLV at offset {0}")]
    Malformed(usize),
    #[error("record {tag} value exceeds the two-digit length field")]
    ValueTooLong { tag: String },
    #[error("payload has no trailing checksum record")]
    MissingChecksum,
    #[error("checksum mismatch: computed {computed}, found {found}")]
    ChecksumMismatch { computed: String, found: String },
    #[error("amount must be a positive integer")]
    InvalidAmount,
}

/// A single TLV record. The value of composite records (e.g. tag 26) is kept
/// opaque; nothing in the gateway needs to descend into them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: String,
    pub value: String,
}

impl Tlv {
    pub fn new(tag: &str, value: impl Into<String>) -> Self {
        Self {
            tag: tag.to_string(),
            value: value.into(),
        }
    }
}

/// Parse a payload into ordered records, preserving the original order so
/// that `render(parse(s)) == s`.
pub fn parse(payload: &str) -> Result<Vec<Tlv>, QrisError> {
    let mut records = Vec::new();
    let mut rest = payload;
    let mut offset = 0;

    while !rest.is_empty() {
        let header = rest.get(..4).ok_or(QrisError::Malformed(offset))?;
        let (tag, len) = header.split_at(2);
        if !tag.bytes().all(|b| b.is_ascii_digit()) {
            return Err(QrisError::Malformed(offset));
        }
        let len: usize = len
            .parse()
            .map_err(|_| QrisError::Malformed(offset))?;
        let value = rest
            .get(4..4 + len)
            .ok_or(QrisError::Malformed(offset))?;

        records.push(Tlv::new(tag, value));

        rest = &rest[4 + len..];
        offset += 4 + len;
    }

    Ok(records)
}

/// Render records back into the wire form.
pub fn render(records: &[Tlv]) -> Result<String, QrisError> {
    let mut out = String::new();
    for record in records {
        if record.value.len() > 99 {
            return Err(QrisError::ValueTooLong {
                tag: record.tag.clone(),
            });
        }
        out.push_str(&record.tag);
        out.push_str(&format!("{:02}", record.value.len()));
        out.push_str(&record.value);
    }
    Ok(out)
}

/// Derive a dynamic payload from a static source: set the amount (tag 54),
/// flip the point-of-initiation method to dynamic and recompute the checksum.
pub fn inject_amount(static_payload: &str, amount: i64) -> Result<String, QrisError> {
    if amount <= 0 {
        return Err(QrisError::InvalidAmount);
    }

    let mut records = parse(static_payload)?;
    records.retain(|r| r.tag != TAG_CRC);

    match records.iter().position(|r| r.tag == TAG_POI_METHOD) {
        Some(at) => records[at].value = POI_DYNAMIC.to_string(),
        None => {
            // Canonical ordering puts tag 01 right after the format
            // indicator (tag 00).
            let at = if records.first().map(|r| r.tag.as_str()) == Some("00") {
                1
            } else {
                0
            };
            records.insert(at, Tlv::new(TAG_POI_METHOD, POI_DYNAMIC));
        }
    }

    // Whole currency units, no separators, no decimals.
    let amount = amount.to_string();
    match records.iter().position(|r| r.tag == TAG_AMOUNT) {
        Some(at) => records[at].value = amount,
        None => {
            let at = records
                .iter()
                .position(|r| r.tag == TAG_COUNTRY_CODE)
                .unwrap_or(records.len());
            records.insert(at, Tlv::new(TAG_AMOUNT, amount));
        }
    }

    append_checksum(&render(&records)?)
}

/// Append the tag 63 checksum record to a payload that does not carry one.
/// The CRC covers the payload including the `6304` header itself.
pub fn append_checksum(body: &str) -> Result<String, QrisError> {
    parse(body)?;

    let mut payload = String::with_capacity(body.len() + 8);
    payload.push_str(body);
    payload.push_str(TAG_CRC);
    payload.push_str("04");
    let crc = crc16_x25(payload.as_bytes());
    payload.push_str(&format!("{crc:04X}"));

    Ok(payload)
}

/// Check that a payload is well-formed TLV and that its trailing checksum
/// matches. Used on the operator-supplied static source before any amount is
/// injected into it.
pub fn validate(payload: &str) -> Result<(), QrisError> {
    parse(payload)?;

    if payload.len() < 8 {
        return Err(QrisError::MissingChecksum);
    }
    let (body, found) = payload.split_at(payload.len() - 4);
    if !body.ends_with("6304") {
        return Err(QrisError::MissingChecksum);
    }

    let computed = format!("{:04X}", crc16_x25(body.as_bytes()));
    if !computed.eq_ignore_ascii_case(found) {
        return Err(QrisError::ChecksumMismatch {
            computed,
            found: found.to_string(),
        });
    }

    Ok(())
}

/// CRC-16/X.25: polynomial 0x1021, init 0xFFFF, input and output reflected,
/// final XOR 0xFFFF. The reflected form uses the reversed polynomial 0x8408.
fn crc16_x25(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc ^ 0xFFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A plausible static payload assembled from records; the checksum comes
    /// from `append_checksum`, which `check_value` anchors against the
    /// published X.25 test vector.
    fn static_payload() -> String {
        let records = vec![
            Tlv::new("00", "01"),
            Tlv::new("01", "11"),
            Tlv::new("26", "0014ID.CO.QRIS.WWW021512345678901234"),
            Tlv::new("52", "5411"),
            Tlv::new("53", "360"),
            Tlv::new("58", "ID"),
            Tlv::new("59", "WARUNG BU SITI"),
            Tlv::new("60", "JAKARTA"),
        ];
        append_checksum(&render(&records).unwrap()).unwrap()
    }

    #[test]
    fn check_value() {
        // Published check value for CRC-16/X.25.
        assert_eq!(crc16_x25(b"123456789"), 0x906E);
    }

    #[test]
    fn parse_render_round_trip() {
        let payload = static_payload();
        let records = parse(&payload).unwrap();
        assert_eq!(render(&records).unwrap(), payload);
    }

    #[test]
    fn parse_rejects_truncated_value() {
        assert_eq!(parse("000400"), Err(QrisError::Malformed(0)));
    }

    #[test]
    fn parse_rejects_non_numeric_tag() {
        assert_eq!(parse("XX0201"), Err(QrisError::Malformed(0)));
    }

    #[test]
    fn validate_accepts_well_formed_source() {
        validate(&static_payload()).unwrap();
    }

    #[test]
    fn validate_rejects_corrupted_payload() {
        let mut payload = static_payload();
        // Flip one character of the merchant name.
        payload = payload.replace("WARUNG", "GNURAW");
        assert!(matches!(
            validate(&payload),
            Err(QrisError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_checksum() {
        assert_eq!(validate("000201"), Err(QrisError::MissingChecksum));
    }

    #[test]
    fn inject_produces_valid_dynamic_payload() {
        let dynamic = inject_amount(&static_payload(), 10001).unwrap();
        validate(&dynamic).unwrap();

        let records = parse(&dynamic).unwrap();
        let poi = records.iter().find(|r| r.tag == "01").unwrap();
        assert_eq!(poi.value, "12");
        let amount = records.iter().find(|r| r.tag == "54").unwrap();
        assert_eq!(amount.value, "10001");

        // Tag 54 sits right before the country code, tag 63 is last.
        let tags: Vec<&str> = records.iter().map(|r| r.tag.as_str()).collect();
        let pos_54 = tags.iter().position(|t| *t == "54").unwrap();
        let pos_58 = tags.iter().position(|t| *t == "58").unwrap();
        assert_eq!(pos_54 + 1, pos_58);
        assert_eq!(tags.last(), Some(&"63"));
    }

    #[test]
    fn inject_replaces_existing_amount() {
        let first = inject_amount(&static_payload(), 15000).unwrap();
        let second = inject_amount(&first, 20001).unwrap();
        validate(&second).unwrap();

        let records = parse(&second).unwrap();
        let amounts: Vec<_> = records.iter().filter(|r| r.tag == "54").collect();
        assert_eq!(amounts.len(), 1);
        assert_eq!(amounts[0].value, "20001");
    }

    #[test]
    fn inject_is_deterministic() {
        let a = inject_amount(&static_payload(), 123456).unwrap();
        let b = inject_amount(&static_payload(), 123456).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn inject_rejects_non_positive_amounts() {
        assert_eq!(
            inject_amount(&static_payload(), 0),
            Err(QrisError::InvalidAmount)
        );
        assert_eq!(
            inject_amount(&static_payload(), -5),
            Err(QrisError::InvalidAmount)
        );
    }
}
