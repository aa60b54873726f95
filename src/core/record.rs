//! Text line codec for angle records.
//!
//! Each record occupies exactly one line:
//!
//! ```text
//! <timestamp_ns> <angle> <calibrated> <crc32>\n
//! ```
//!
//! The newline is the completion marker. The trailing CRC-32 covers the
//! first three fields so a complete but garbled line is rejected as well.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::core::{Error, Result};

pub const RECORD_TERMINATOR: u8 = b'\n';

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleRecord {
    pub timestamp_ns: u64,
    pub angle: f64,
    pub calibrated: bool,
}

impl AngleRecord {
    pub fn new(timestamp_ns: u64, angle: f64, calibrated: bool) -> Self {
        Self {
            timestamp_ns,
            angle,
            calibrated,
        }
    }

    /// Serializes the record as one terminated line.
    pub fn encode_line(&self) -> String {
        let body = self.body();
        let crc = crc32fast::hash(body.as_bytes());
        format!("{body} {crc:08x}\n")
    }

    /// Parses one line, with or without its terminator.
    pub fn decode_line(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let (body, crc) = line
            .rsplit_once(' ')
            .ok_or(Error::Corrupt("record missing checksum"))?;
        let expected =
            u32::from_str_radix(crc, 16).map_err(|_| Error::Corrupt("record checksum invalid"))?;
        if crc.len() != 8 || crc32fast::hash(body.as_bytes()) != expected {
            return Err(Error::Corrupt("record checksum mismatch"));
        }

        let mut fields = body.split(' ');
        let timestamp_ns = fields
            .next()
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or(Error::Corrupt("record timestamp invalid"))?;
        let angle = fields
            .next()
            .and_then(|f| f.parse::<f64>().ok())
            .filter(|a| a.is_finite())
            .ok_or(Error::Corrupt("record angle invalid"))?;
        let calibrated = match fields.next() {
            Some("0") => false,
            Some("1") => true,
            _ => return Err(Error::Corrupt("record flag invalid")),
        };
        if fields.next().is_some() {
            return Err(Error::Corrupt("record has trailing fields"));
        }
        Ok(Self::new(timestamp_ns, angle, calibrated))
    }

    /// RFC 3339 rendering of the timestamp, falling back to raw nanoseconds.
    pub fn utc_string(&self) -> String {
        OffsetDateTime::from_unix_timestamp_nanos(self.timestamp_ns as i128)
            .ok()
            .and_then(|ts| ts.format(&Rfc3339).ok())
            .unwrap_or_else(|| format!("{}ns", self.timestamp_ns))
    }

    fn body(&self) -> String {
        let flag = if self.calibrated { 1 } else { 0 };
        format!("{} {:?} {}", self.timestamp_ns, self.angle, flag)
    }
}

impl fmt::Display for AngleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "time={} angle={:.3} calibrated={}",
            self.utc_string(),
            self.angle,
            self.calibrated
        )
    }
}

/// Result of scanning a byte buffer for complete records.
#[derive(Debug, Default)]
pub struct Scan {
    pub records: Vec<AngleRecord>,
    /// Bytes consumed, always ending on a record terminator.
    pub consumed: usize,
    /// Complete lines rejected by the codec.
    pub skipped: usize,
}

/// Decodes every terminated line in `buf`. An unterminated tail is left
/// unconsumed because the writer may still be producing it.
pub fn scan_complete(buf: &[u8]) -> Scan {
    let mut scan = Scan::default();
    let mut start = 0;
    while let Some(pos) = buf[start..].iter().position(|&b| b == RECORD_TERMINATOR) {
        let end = start + pos;
        let decoded = std::str::from_utf8(&buf[start..end])
            .map_err(|_| Error::Corrupt("record not utf-8"))
            .and_then(AngleRecord::decode_line);
        match decoded {
            Ok(record) => scan.records.push(record),
            // Blank lines are not counted.
            Err(err) if end > start => {
                log::warn!("skipping malformed record at byte {start}: {err}");
                scan.skipped += 1;
            }
            Err(_) => {}
        }
        start = end + 1;
    }
    scan.consumed = start;
    scan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_line_decodes_to_same_record() {
        let record = AngleRecord::new(1_700_000_000_123_456_789, 12.5, false);
        let line = record.encode_line();
        assert!(line.ends_with('\n'));
        assert!(line.starts_with("1700000000123456789 12.5 0 "));
        assert_eq!(AngleRecord::decode_line(&line).expect("decode"), record);
    }

    #[test]
    fn angle_survives_bit_exact() {
        let record = AngleRecord::new(3, 0.1 + 0.2, true);
        let decoded = AngleRecord::decode_line(&record.encode_line()).expect("decode");
        assert_eq!(decoded.angle.to_bits(), record.angle.to_bits());
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let line = AngleRecord::new(1, 10.0, false).encode_line();
        let tampered = line.replacen("10.0", "11.0", 1);
        assert!(matches!(
            AngleRecord::decode_line(&tampered),
            Err(Error::Corrupt("record checksum mismatch"))
        ));
    }

    #[test]
    fn scan_leaves_unterminated_tail() {
        let mut buf = AngleRecord::new(1, 10.0, false).encode_line().into_bytes();
        let second = AngleRecord::new(2, 12.5, false).encode_line();
        buf.extend_from_slice(&second.as_bytes()[..second.len() - 4]);

        let scan = scan_complete(&buf);
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.records[0].timestamp_ns, 1);
        assert_eq!(scan.consumed, buf.len() - (second.len() - 4));
        assert_eq!(scan.skipped, 0);
    }

    #[test]
    fn scan_skips_garbled_lines() {
        let mut buf = b"garbage line\n".to_vec();
        buf.extend_from_slice(AngleRecord::new(5, -1.25, true).encode_line().as_bytes());
        let scan = scan_complete(&buf);
        assert_eq!(scan.records, vec![AngleRecord::new(5, -1.25, true)]);
        assert_eq!(scan.skipped, 1);
        assert_eq!(scan.consumed, buf.len());
    }
}
