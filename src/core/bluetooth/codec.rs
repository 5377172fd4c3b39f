//! Robot wire protocol
//! Encodes movement commands into the robot's ASCII command line and decodes
//! the text frames the robot pushes back over the same characteristic.

use std::fmt;

use thiserror::Error;

/// Leading byte of every movement line
const MOVE_PREFIX: char = 'M';
/// Field separator of the wire line
const FIELD_SEPARATOR: char = ';';
/// Leading character of an acknowledgement frame
const ACK_PREFIX: char = 'F';

/// Errors produced while decoding robot-bound or robot-originated data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("notification payload is not valid UTF-8: {0}")]
    InvalidEncoding(#[from] std::str::Utf8Error),
    #[error("malformed command line: {0:?}")]
    MalformedLine(String),
}

/// A single movement order for the robot.
///
/// The direction flags are independent; `forward` together with `backward`
/// (or `left` with `right`) is representable and sent as-is, leaving its
/// meaning to the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Command {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
    pub distance_cm: u32,
    pub speed: u8,
}

impl Command {
    /// Encodes the command into its wire line
    pub fn encode(&self) -> WireMessage {
        let mut line = String::with_capacity(16);
        line.push(MOVE_PREFIX);
        // Fixed T, R, B, L order regardless of how the flags were derived
        for (set, flag) in [
            (self.forward, 'T'),
            (self.right, 'R'),
            (self.backward, 'B'),
            (self.left, 'L'),
        ] {
            if set {
                line.push(flag);
            }
        }
        line.push(FIELD_SEPARATOR);
        line.push_str(&self.distance_cm.to_string());
        line.push(FIELD_SEPARATOR);
        line.push_str(&self.speed.to_string());
        line.push(FIELD_SEPARATOR);
        line.push('\n');
        WireMessage(line)
    }
}

/// An encoded `M<flags>;<distance>;<speed>;\n` line
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireMessage(String);

impl WireMessage {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_bytes()
    }

    /// Parses a wire line back into the command it encodes.
    ///
    /// The trailing newline is optional so lines echoed back by the robot's
    /// UART bridge, which may be split or trimmed, still parse.
    pub fn parse(line: &str) -> Result<Command, DecodeError> {
        let malformed = || DecodeError::MalformedLine(line.to_string());

        let body = line.strip_suffix('\n').unwrap_or(line);
        let body = body.strip_prefix(MOVE_PREFIX).ok_or_else(malformed)?;
        let mut fields = body.split(FIELD_SEPARATOR);
        let flags = fields.next().ok_or_else(malformed)?;
        let distance = fields.next().ok_or_else(malformed)?;
        let speed = fields.next().ok_or_else(malformed)?;
        if fields.next() != Some("") || fields.next().is_some() {
            return Err(malformed());
        }
        // Unsigned decimal only; `str::parse` would also take a leading '+'
        if ![distance, speed]
            .iter()
            .all(|field| !field.is_empty() && field.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(malformed());
        }

        let mut command = Command {
            distance_cm: distance.parse().map_err(|_| malformed())?,
            speed: speed.parse().map_err(|_| malformed())?,
            ..Command::default()
        };
        for flag in flags.chars() {
            let slot = match flag {
                'T' => &mut command.forward,
                'R' => &mut command.right,
                'B' => &mut command.backward,
                'L' => &mut command.left,
                _ => return Err(malformed()),
            };
            if *slot {
                return Err(malformed());
            }
            *slot = true;
        }
        Ok(command)
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.trim_end())
    }
}

/// A text frame pushed by the robot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryFrame {
    /// The robot finished the last command (`F...`)
    Acknowledgement(String),
    /// Anything else, shown to the operator verbatim
    StatusMessage(String),
}

impl TelemetryFrame {
    /// Decodes a raw notification payload
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(bytes)?;
        if text.starts_with(ACK_PREFIX) {
            Ok(Self::Acknowledgement(text.to_string()))
        } else {
            Ok(Self::StatusMessage(text.to_string()))
        }
    }

    pub fn is_acknowledgement(&self) -> bool {
        matches!(self, Self::Acknowledgement(_))
    }

    /// Text for the operator, `None` for acknowledgements which are not displayed
    pub fn display_text(&self) -> Option<&str> {
        match self {
            Self::Acknowledgement(_) => None,
            Self::StatusMessage(text) => Some(text),
        }
    }
}

/// Encodes a command into its wire line
pub fn encode(command: &Command) -> WireMessage {
    command.encode()
}

/// Decodes a notification payload into a telemetry frame
pub fn decode(bytes: &[u8]) -> Result<TelemetryFrame, DecodeError> {
    TelemetryFrame::decode(bytes)
}
