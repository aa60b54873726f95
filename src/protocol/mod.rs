//! Line protocol between the query server and its clients.
//!
//! Requests are single text lines. Responses are single JSON lines tagged by
//! `status`. A connection may carry any number of request/response pairs.
//!
//! | Request          | Response                                   |
//! |------------------|--------------------------------------------|
//! | `e#zenith?`      | `ok` with the latest record, or `no_data`  |
//! | `e#recent? <n>`  | `recent` with up to n records, oldest first |
//! | `e#status?`      | `server` counters                          |
//! | anything else    | `error`                                    |

use serde::{Deserialize, Serialize};

use crate::core::{AngleRecord, Error, Result};

pub const DEFAULT_PORT: u16 = 9876;
pub const CMD_LATEST: &str = "e#zenith?";
pub const CMD_RECENT: &str = "e#recent?";
pub const CMD_STATUS: &str = "e#status?";
pub const MAX_REQUEST_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Latest,
    Recent(usize),
    Status,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        let request = match (parts.next(), parts.next()) {
            (Some(CMD_LATEST), None) => Request::Latest,
            (Some(CMD_STATUS), None) => Request::Status,
            (Some(CMD_RECENT), Some(count)) => count
                .parse::<usize>()
                .map(Request::Recent)
                .map_err(|_| Error::Protocol(format!("invalid count {:?}", preview(count))))?,
            _ => return Err(Error::Protocol(format!("unknown request {:?}", preview(line)))),
        };
        if parts.next().is_some() {
            return Err(Error::Protocol(format!(
                "unexpected arguments in {:?}",
                preview(line)
            )));
        }
        Ok(request)
    }

    /// Argument-free commands that can be recognized without a terminator,
    /// for peers that send a bare command and then wait.
    pub fn parse_bare(buf: &[u8]) -> Option<Self> {
        match std::str::from_utf8(buf).ok()?.trim() {
            CMD_LATEST => Some(Request::Latest),
            CMD_STATUS => Some(Request::Status),
            _ => None,
        }
    }

    pub fn encode_line(&self) -> String {
        match self {
            Request::Latest => format!("{CMD_LATEST}\n"),
            Request::Recent(count) => format!("{CMD_RECENT} {count}\n"),
            Request::Status => format!("{CMD_STATUS}\n"),
        }
    }
}

/// Request text quoted back in error messages, cut to a short prefix.
fn preview(text: &str) -> &str {
    const PREVIEW_LEN: usize = 32;
    match text.char_indices().nth(PREVIEW_LEN) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Records read from the current log file, including the replayed ones.
    /// Starts over when the file is truncated or replaced.
    pub observed: u64,
    /// Committed byte offset of the tail in the log file.
    pub offset: u64,
    pub tail_failures: u64,
    pub resets: u64,
    pub skipped: u64,
    pub latest_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { record: AngleRecord },
    NoData,
    Recent { records: Vec<AngleRecord> },
    Server(ServerStatus),
    Error { message: String },
}

impl Response {
    pub fn encode_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|err| Error::Protocol(format!("encode response: {err}")))?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end())
            .map_err(|err| Error::Protocol(format!("decode response: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_requests() {
        assert_eq!(Request::parse("e#zenith?\n").expect("latest"), Request::Latest);
        assert_eq!(Request::parse("e#recent? 5").expect("recent"), Request::Recent(5));
        assert_eq!(Request::parse(" e#status? ").expect("status"), Request::Status);
        assert!(Request::parse("e#recent?").is_err());
        assert!(Request::parse("e#recent? x").is_err());
        assert!(Request::parse("e#zenith? now").is_err());
        assert!(Request::parse("hello").is_err());
    }

    #[test]
    fn error_message_quotes_only_a_prefix() {
        let long = "a".repeat(10_000);
        let err = Request::parse(&long).expect_err("unknown request");
        assert!(err.to_string().len() < 100, "message: {err}");
    }

    #[test]
    fn bare_commands_only_without_arguments() {
        assert_eq!(Request::parse_bare(b"e#zenith?"), Some(Request::Latest));
        assert_eq!(Request::parse_bare(b"e#recent? 3"), None);
        assert_eq!(Request::parse_bare(b"e#zeni"), None);
    }

    #[test]
    fn response_wire_shape() {
        let ok = Response::Ok {
            record: AngleRecord::new(2, 12.5, false),
        };
        assert_eq!(
            ok.encode_line().expect("encode"),
            "{\"status\":\"ok\",\"record\":{\"timestamp_ns\":2,\"angle\":12.5,\"calibrated\":false}}\n"
        );
        assert_eq!(
            Response::NoData.encode_line().expect("encode"),
            "{\"status\":\"no_data\"}\n"
        );
        let decoded = Response::decode_line("{\"status\":\"no_data\"}\n").expect("decode");
        assert_eq!(decoded, Response::NoData);
    }
}
