//! Frame codec for the CR command protocol.
//!
//! Commands are short ASCII strings (`RC Model`, `SM ExposureX 10`, `M`)
//! terminated by a newline. Responses are a single newline-terminated line of
//! comma-separated fields: a status token (`OK` or `ERR`), then zero or more
//! argument fields. Many firmware revisions echo the command verb back as one
//! of the leading arguments; the decoder uses that echo, when present, to
//! classify which command a frame answers. String arguments may be wrapped in
//! double quotes, which are stripped.
//!
//! ```text
//! -> RC Firmware\n
//! <- OK,1,"v2.1.3"\n        status OK, arguments ["1", "v2.1.3"]
//! -> SM Speed 9\n
//! <- ERR,3\n                status ERR, detail "3"
//! ```

use crate::error::{Error, Result};

/// Field separator inside a response line.
pub const FIELD_SEPARATOR: char = ',';

/// Terminator for both commands and responses.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Status token of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// The instrument accepted the command.
    Ok,
    /// The instrument rejected the command.
    Error,
    /// The status token was not recognized.
    Unknown,
}

impl ResponseCode {
    fn from_token(token: &str) -> Self {
        match token.trim() {
            "OK" => ResponseCode::Ok,
            "ERR" => ResponseCode::Error,
            _ => ResponseCode::Unknown,
        }
    }
}

/// Which kind of command a response answers.
///
/// Derived from the echoed command verb when the instrument includes one,
/// otherwise assumed from the command that was just written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// `RC` queries: fixed identity fields.
    Identity,
    /// `RS` queries: mutable settings.
    Read,
    /// `SM` writes.
    Set,
    /// `M` triggers and `RM` result retrievals.
    Measurement,
    /// Error frames carry no useful echo.
    Error,
}

impl ResponseType {
    /// Classify a command string by its leading verb. Returns `None` for
    /// text that does not look like a command.
    pub fn for_command(command: &str) -> Option<Self> {
        match command.trim().split_whitespace().next() {
            Some("RC") => Some(ResponseType::Identity),
            Some("RS") => Some(ResponseType::Read),
            Some("SM") => Some(ResponseType::Set),
            Some("RM") | Some("M") => Some(ResponseType::Measurement),
            _ => None,
        }
    }
}

/// A decoded response frame.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Status token of the frame.
    pub code: ResponseCode,
    /// Classification of which command kind this frame answers.
    pub response_type: ResponseType,
    /// Argument fields after the status token, quotes stripped.
    pub arguments: Vec<String>,
    /// The frame exactly as received, for diagnostics.
    pub raw: Vec<u8>,
}

impl CommandResponse {
    /// The value field of a single-value response.
    ///
    /// Instruments that echo the command verb put the value last, so the
    /// last argument is the value regardless of how many leading echo or
    /// code fields the firmware emits.
    pub fn value(&self, command: &str) -> Result<String> {
        self.arguments
            .last()
            .filter(|s| !s.is_empty())
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("'{command}' returned no value")))
    }
}

/// Encode a command string into its wire form.
pub fn encode_command(command: &str) -> Vec<u8> {
    let mut frame = command.as_bytes().to_vec();
    frame.push(LINE_TERMINATOR);
    frame
}

/// Decode one received line into a [`CommandResponse`].
///
/// `expected` is the classification of the command that was just written; it
/// is used only when the frame carries no recognizable echo. A status token
/// that is neither `OK` nor `ERR` means the frame is not a response at all
/// and is rejected as a protocol error.
pub fn decode_response(raw: &[u8], expected: ResponseType) -> Result<CommandResponse> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::Protocol("response is not valid UTF-8".to_string()))?;
    let line = text.trim_end_matches(['\r', '\n']).trim();
    if line.is_empty() {
        return Err(Error::Protocol("empty response frame".to_string()));
    }

    let mut fields = line.split(FIELD_SEPARATOR);
    let status = fields.next().unwrap_or_default();
    let code = ResponseCode::from_token(status);
    if code == ResponseCode::Unknown {
        return Err(Error::Protocol(format!(
            "malformed response: unrecognized status token '{status}'"
        )));
    }

    let arguments: Vec<String> = fields
        .map(|field| strip_quotes(field.trim()).to_string())
        .collect();

    let response_type = if code == ResponseCode::Error {
        ResponseType::Error
    } else {
        arguments
            .iter()
            .find_map(|arg| ResponseType::for_command(arg))
            .unwrap_or(expected)
    };

    Ok(CommandResponse {
        code,
        response_type,
        arguments,
        raw: raw.to_vec(),
    })
}

fn strip_quotes(field: &str) -> &str {
    if field.len() >= 2 && field.starts_with('"') && field.ends_with('"') {
        &field[1..field.len() - 1]
    } else {
        field
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_appends_terminator() {
        assert_eq!(encode_command("RC Model"), b"RC Model\n");
        assert_eq!(encode_command("M"), b"M\n");
    }

    #[test]
    fn decode_ok_frame_with_quoted_value() {
        let response = decode_response(b"OK,1,\"v2.1.3\"\n", ResponseType::Identity)
            .expect("frame should decode");
        assert_eq!(response.code, ResponseCode::Ok);
        assert_eq!(response.response_type, ResponseType::Identity);
        assert_eq!(response.arguments, vec!["1", "v2.1.3"]);
        assert_eq!(response.value("RC Firmware").expect("has value"), "v2.1.3");
    }

    #[test]
    fn decode_err_frame_keeps_detail() {
        let response =
            decode_response(b"ERR,3\n", ResponseType::Set).expect("frame should decode");
        assert_eq!(response.code, ResponseCode::Error);
        assert_eq!(response.response_type, ResponseType::Error);
        assert_eq!(response.arguments, vec!["3"]);
    }

    #[test]
    fn decode_rejects_unknown_status_token() {
        let err = decode_response(b"WAT,1\n", ResponseType::Read)
            .expect_err("unknown status must not decode");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn decode_rejects_non_utf8_bytes() {
        let err = decode_response(&[0xff, 0xfe, b'\n'], ResponseType::Read)
            .expect_err("invalid UTF-8 must not decode");
        match err {
            Error::Protocol(message) => assert!(message.contains("UTF-8")),
            other => panic!("expected Protocol, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_empty_line() {
        let err = decode_response(b"\r\n", ResponseType::Read)
            .expect_err("empty line must not decode");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn echo_overrides_expected_classification() {
        // A stale identity frame read while expecting a measurement keeps
        // its own classification, which lets the channel detect the desync.
        let response = decode_response(b"OK,0,RC Model,CR-300\n", ResponseType::Measurement)
            .expect("frame should decode");
        assert_eq!(response.response_type, ResponseType::Identity);
    }

    #[test]
    fn frames_without_echo_use_expected_classification() {
        let response =
            decode_response(b"OK,25\n", ResponseType::Read).expect("frame should decode");
        assert_eq!(response.response_type, ResponseType::Read);
    }

    #[test]
    fn command_verbs_classify() {
        assert_eq!(
            ResponseType::for_command("RC InstrumentType"),
            Some(ResponseType::Identity)
        );
        assert_eq!(ResponseType::for_command("RS Speed"), Some(ResponseType::Read));
        assert_eq!(
            ResponseType::for_command("SM ExposureX 10"),
            Some(ResponseType::Set)
        );
        assert_eq!(ResponseType::for_command("M"), Some(ResponseType::Measurement));
        assert_eq!(
            ResponseType::for_command("RM Spectrum"),
            Some(ResponseType::Measurement)
        );
        assert_eq!(ResponseType::for_command("CR-300"), None);
        assert_eq!(ResponseType::for_command("27.2ms"), None);
    }

    #[test]
    fn value_is_last_argument() {
        let response = decode_response(b"OK,0,RC ID,A00612\n", ResponseType::Identity)
            .expect("frame should decode");
        assert_eq!(response.value("RC ID").expect("has value"), "A00612");
    }

    #[test]
    fn value_missing_is_protocol_error() {
        let response = decode_response(b"OK\n", ResponseType::Identity).expect("decodes");
        let err = response.value("RC ID").expect_err("no value present");
        assert!(matches!(err, Error::Protocol(_)));
    }
}
