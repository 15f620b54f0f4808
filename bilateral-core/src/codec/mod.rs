//! Typed messages exchanged between the two devices.
//!
//! Frames are ASCII text `COMMAND[:f1|f2|...]` terminated by `0x04`.
//! [`framing`] splits the byte stream, [`lexer`] turns a body into a
//! [`RawFrame`](lexer::RawFrame), and this module maps raw frames to and from
//! [`Message`]. Timestamps travel as decimal microsecond counters of the
//! sender's clock.

use core::fmt::{self, Write as _};
use core::time::Duration;

use heapless::{String, Vec};

use crate::clock::{Ping, Pong};
use crate::dispatcher::{BuzzCommand, ControlStamp};
use crate::pattern::Finger;
use crate::therapy::config::{
    BURST_MS_RANGE, FREQUENCY_HZ_RANGE, MAX_PARAM_WORD, ParamKey, ParamUpdate, ParamValue,
};
use crate::time::Instant;

pub mod framing;
pub mod lexer;

use framing::{EOT, MAX_FRAME_LEN};
use lexer::{Field, GrammarError, MAX_FIELDS, TokenKind};

/// Parameter pairs carried by one `PARAM_UPDATE`.
pub const MAX_PARAM_UPDATES: usize = MAX_FIELDS / 2;

/// Encoded frame including its terminator.
pub type WireFrame = Vec<u8, { MAX_FRAME_LEN + 1 }>;

/// Every message of the device-to-device protocol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// Secondary finished its clock burst and can accept commands.
    Ready,
    StartSession(ControlStamp),
    StopSession(ControlStamp),
    PauseSession,
    ResumeSession,
    Ping(Ping),
    Pong(Pong),
    Buzz(BuzzCommand),
    Deactivate(ControlStamp),
    ParamUpdate(Vec<ParamUpdate, MAX_PARAM_UPDATES>),
    Seed(u32),
    SeedAck,
    GetBattery,
    BatteryResponse { millivolts: u16 },
}

impl Message {
    /// Command word as it appears on the wire.
    #[must_use]
    pub const fn command(&self) -> &'static str {
        match self {
            Message::Ready => "READY",
            Message::StartSession(_) => "START_SESSION",
            Message::StopSession(_) => "STOP_SESSION",
            Message::PauseSession => "PAUSE_SESSION",
            Message::ResumeSession => "RESUME_SESSION",
            Message::Ping(_) => "PING",
            Message::Pong(_) => "PONG",
            Message::Buzz(_) => "BUZZ",
            Message::Deactivate(_) => "DEACTIVATE",
            Message::ParamUpdate(_) => "PARAM_UPDATE",
            Message::Seed(_) => "SEED",
            Message::SeedAck => "SEED_ACK",
            Message::GetBattery => "GET_BATTERY",
            Message::BatteryResponse { .. } => "BAT_RESPONSE",
        }
    }

    /// Keepalive traffic watched by the connection supervisor.
    #[must_use]
    pub const fn is_keepalive(&self) -> bool {
        matches!(self, Message::Ping(_) | Message::Pong(_))
    }
}

/// Writes the frame body, without terminator.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())?;
        match self {
            Message::Ready
            | Message::PauseSession
            | Message::ResumeSession
            | Message::SeedAck
            | Message::GetBattery => Ok(()),
            Message::StartSession(stamp) | Message::StopSession(stamp) | Message::Deactivate(stamp) => {
                write!(f, ":{}|{}", stamp.sequence, stamp.timestamp.as_micros())
            }
            Message::Ping(ping) => write!(f, ":{}|{}", ping.sequence, ping.sent_at.as_micros()),
            Message::Pong(pong) => write!(
                f,
                ":{}|0|{}|{}",
                pong.sequence,
                pong.received_at.as_micros(),
                pong.replied_at.as_micros()
            ),
            Message::Buzz(buzz) => write!(
                f,
                ":{}|{}|{}|{}|{}|{}|{}",
                buzz.sequence,
                buzz.issued_at.as_micros(),
                buzz.finger.as_index(),
                buzz.amplitude,
                buzz.duration.as_millis(),
                buzz.frequency_hz,
                buzz.activate_at.as_micros()
            ),
            Message::ParamUpdate(updates) => {
                let mut separator = ':';
                for update in updates {
                    write!(f, "{separator}{}|", update.key)?;
                    separator = '|';
                    match &update.value {
                        ParamValue::Hundredths(value) => write_hundredths(f, *value)?,
                        ParamValue::Word(word) => f.write_str(word)?,
                    }
                }
                Ok(())
            }
            Message::Seed(seed) => write!(f, ":{seed}"),
            Message::BatteryResponse { millivolts } => {
                write!(f, ":{}.{:02}", millivolts / 1_000, (millivolts % 1_000) / 10)
            }
        }
    }
}

fn write_hundredths(f: &mut fmt::Formatter<'_>, value: u32) -> fmt::Result {
    let whole = value / 100;
    let fraction = value % 100;
    if fraction == 0 {
        write!(f, "{whole}")
    } else if fraction % 10 == 0 {
        write!(f, "{whole}.{}", fraction / 10)
    } else {
        write!(f, "{whole}.{fraction:02}")
    }
}

/// Failures while encoding a message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EncodeError {
    /// Body does not fit in [`MAX_FRAME_LEN`] bytes.
    FrameTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::FrameTooLong => write!(f, "encoded frame exceeds {MAX_FRAME_LEN} bytes"),
        }
    }
}

/// Encodes `message` followed by the terminator.
pub fn encode(message: &Message) -> Result<WireFrame, EncodeError> {
    let mut body: String<MAX_FRAME_LEN> = String::new();
    write!(body, "{message}").map_err(|_| EncodeError::FrameTooLong)?;

    let mut frame = WireFrame::new();
    frame
        .extend_from_slice(body.as_bytes())
        .map_err(|_| EncodeError::FrameTooLong)?;
    frame.push(EOT).map_err(|_| EncodeError::FrameTooLong)?;
    Ok(frame)
}

/// Host convenience returning an owned buffer.
#[cfg(feature = "alloc")]
pub fn encode_to_vec(message: &Message) -> Result<alloc::vec::Vec<u8>, EncodeError> {
    encode(message).map(|frame| frame.as_slice().to_vec())
}

/// Protocol errors. The offending frame is discarded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// Body is not valid UTF-8.
    Utf8,
    Grammar(GrammarError),
    UnknownCommand,
    FieldCount { expected: usize, found: usize },
    /// `PARAM_UPDATE` fields must come in key/value pairs.
    UnpairedParameter,
    InvalidNumber { index: usize },
    OutOfRange { index: usize },
    UnknownParameter { index: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Utf8 => f.write_str("frame is not valid UTF-8"),
            DecodeError::Grammar(err) => write!(f, "malformed frame: {err}"),
            DecodeError::UnknownCommand => f.write_str("unknown command"),
            DecodeError::FieldCount { expected, found } => {
                write!(f, "expected {expected} fields, found {found}")
            }
            DecodeError::UnpairedParameter => f.write_str("parameter without a value"),
            DecodeError::InvalidNumber { index } => write!(f, "field {index} is not a number"),
            DecodeError::OutOfRange { index } => write!(f, "field {index} out of range"),
            DecodeError::UnknownParameter { index } => {
                write!(f, "field {index} names an unknown parameter")
            }
        }
    }
}

impl From<GrammarError> for DecodeError {
    fn from(err: GrammarError) -> Self {
        DecodeError::Grammar(err)
    }
}

/// Decodes one frame body (terminator already stripped).
pub fn decode(body: &[u8]) -> Result<Message, DecodeError> {
    let text = core::str::from_utf8(body).map_err(|_| DecodeError::Utf8)?;
    let raw = lexer::parse_frame(text.trim())?;
    let fields = Fields(raw.fields.as_slice());

    let message = match raw.command {
        "READY" => fields.bare(Message::Ready)?,
        "PAUSE_SESSION" => fields.bare(Message::PauseSession)?,
        "RESUME_SESSION" => fields.bare(Message::ResumeSession)?,
        "SEED_ACK" => fields.bare(Message::SeedAck)?,
        "GET_BATTERY" => fields.bare(Message::GetBattery)?,
        "START_SESSION" => Message::StartSession(fields.stamp()?),
        "STOP_SESSION" => Message::StopSession(fields.stamp()?),
        "DEACTIVATE" => Message::Deactivate(fields.stamp()?),
        "PING" => {
            fields.exactly(2)?;
            Message::Ping(Ping {
                sequence: fields.u32_at(0)?,
                sent_at: fields.instant_at(1)?,
            })
        }
        "PONG" => {
            fields.exactly(4)?;
            fields.u64_at(1)?;
            Message::Pong(Pong {
                sequence: fields.u32_at(0)?,
                received_at: fields.instant_at(2)?,
                replied_at: fields.instant_at(3)?,
            })
        }
        "BUZZ" => Message::Buzz(fields.buzz()?),
        "PARAM_UPDATE" => Message::ParamUpdate(fields.param_updates()?),
        "SEED" => {
            fields.exactly(1)?;
            Message::Seed(fields.u32_at(0)?)
        }
        "BAT_RESPONSE" => {
            fields.exactly(1)?;
            let hundredths = fields.hundredths_at(0)?;
            let millivolts = u16::try_from(u64::from(hundredths) * 10)
                .map_err(|_| DecodeError::OutOfRange { index: 0 })?;
            Message::BatteryResponse { millivolts }
        }
        _ => return Err(DecodeError::UnknownCommand),
    };

    Ok(message)
}

struct Fields<'a>(&'a [Field<'a>]);

impl<'a> Fields<'a> {
    fn exactly(&self, expected: usize) -> Result<(), DecodeError> {
        if self.0.len() == expected {
            Ok(())
        } else {
            Err(DecodeError::FieldCount {
                expected,
                found: self.0.len(),
            })
        }
    }

    fn bare(&self, message: Message) -> Result<Message, DecodeError> {
        self.exactly(0)?;
        Ok(message)
    }

    fn get(&self, index: usize) -> Result<&Field<'a>, DecodeError> {
        self.0.get(index).ok_or(DecodeError::FieldCount {
            expected: index + 1,
            found: self.0.len(),
        })
    }

    fn u64_at(&self, index: usize) -> Result<u64, DecodeError> {
        let field = self.get(index)?;
        if field.kind != TokenKind::Integer {
            return Err(DecodeError::InvalidNumber { index });
        }
        field
            .text
            .parse()
            .map_err(|_| DecodeError::InvalidNumber { index })
    }

    fn u32_at(&self, index: usize) -> Result<u32, DecodeError> {
        narrow(self.u64_at(index)?, index)
    }

    fn instant_at(&self, index: usize) -> Result<Instant, DecodeError> {
        self.u64_at(index).map(Instant::from_micros)
    }

    fn hundredths_at(&self, index: usize) -> Result<u32, DecodeError> {
        let field = self.get(index)?;
        parse_hundredths(field).ok_or(DecodeError::InvalidNumber { index })
    }

    fn stamp(&self) -> Result<ControlStamp, DecodeError> {
        self.exactly(2)?;
        Ok(ControlStamp {
            sequence: self.u32_at(0)?,
            timestamp: self.instant_at(1)?,
        })
    }

    fn buzz(&self) -> Result<BuzzCommand, DecodeError> {
        self.exactly(7)?;

        let finger = usize::try_from(self.u64_at(2)?)
            .ok()
            .and_then(Finger::from_index)
            .ok_or(DecodeError::OutOfRange { index: 2 })?;
        let amplitude: u8 = narrow(self.u64_at(3)?, 3)?;
        if amplitude > 100 {
            return Err(DecodeError::OutOfRange { index: 3 });
        }
        // Bounded like PARAM_UPDATE so a single command cannot hold a motor on.
        let duration_ms = self.u32_at(4)?;
        if !BURST_MS_RANGE.contains(&duration_ms) {
            return Err(DecodeError::OutOfRange { index: 4 });
        }
        let frequency_hz = self.u32_at(5)?;
        if !FREQUENCY_HZ_RANGE.contains(&frequency_hz) {
            return Err(DecodeError::OutOfRange { index: 5 });
        }

        Ok(BuzzCommand {
            sequence: self.u32_at(0)?,
            issued_at: self.instant_at(1)?,
            finger,
            amplitude,
            duration: Duration::from_millis(duration_ms.into()),
            frequency_hz: narrow(frequency_hz.into(), 5)?,
            activate_at: self.instant_at(6)?,
        })
    }

    fn param_updates(&self) -> Result<Vec<ParamUpdate, MAX_PARAM_UPDATES>, DecodeError> {
        if self.0.is_empty() {
            return Err(DecodeError::FieldCount {
                expected: 2,
                found: 0,
            });
        }
        if self.0.len() % 2 != 0 {
            return Err(DecodeError::UnpairedParameter);
        }

        let mut updates = Vec::new();
        for (pair, chunk) in self.0.chunks_exact(2).enumerate() {
            let key_index = pair * 2;
            let value_index = key_index + 1;
            let key = match chunk[0].kind {
                TokenKind::Word => ParamKey::from_name(chunk[0].text),
                _ => None,
            }
            .ok_or(DecodeError::UnknownParameter { index: key_index })?;

            let value = match chunk[1].kind {
                TokenKind::Word => {
                    let mut word: String<MAX_PARAM_WORD> = String::new();
                    word.push_str(chunk[1].text)
                        .map_err(|()| DecodeError::OutOfRange { index: value_index })?;
                    ParamValue::Word(word)
                }
                _ => ParamValue::Hundredths(
                    parse_hundredths(&chunk[1]).ok_or(DecodeError::InvalidNumber {
                        index: value_index,
                    })?,
                ),
            };

            updates
                .push(ParamUpdate { key, value })
                .map_err(|_| DecodeError::FieldCount {
                    expected: MAX_FIELDS,
                    found: self.0.len(),
                })?;
        }
        Ok(updates)
    }
}

fn narrow<T: TryFrom<u64>>(value: u64, index: usize) -> Result<T, DecodeError> {
    T::try_from(value).map_err(|_| DecodeError::OutOfRange { index })
}

/// `12`, `12.5` or `12.50` as 1250. At most two fraction digits.
fn parse_hundredths(field: &Field<'_>) -> Option<u32> {
    match field.kind {
        TokenKind::Integer => field.text.parse::<u32>().ok()?.checked_mul(100),
        TokenKind::Decimal => {
            let (whole, fraction) = field.text.split_once('.')?;
            let scale = match fraction.len() {
                1 => 10,
                2 => 1,
                _ => return None,
            };
            let whole = whole.parse::<u32>().ok()?.checked_mul(100)?;
            whole.checked_add(fraction.parse::<u32>().ok()? * scale)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(frame: &WireFrame) -> &[u8] {
        let (last, body) = frame.split_last().expect("terminated frame");
        assert_eq!(*last, EOT);
        body
    }

    #[test]
    fn buzz_survives_the_wire() {
        let buzz = BuzzCommand {
            sequence: 42,
            issued_at: Instant::from_micros(1_234_567),
            finger: Finger::Ring,
            amplitude: 85,
            duration: Duration::from_millis(100),
            frequency_hz: 250,
            activate_at: Instant::from_micros(1_264_567),
        };

        let frame = encode(&Message::Buzz(buzz)).expect("encodes");
        assert_eq!(
            body(&frame),
            b"BUZZ:42|1234567|2|85|100|250|1264567".as_slice()
        );
        assert_eq!(decode(body(&frame)), Ok(Message::Buzz(buzz)));
    }

    #[test]
    fn pong_carries_placeholder_field() {
        let message = decode(b"PONG:7|0|1500|1600").expect("decodes");
        assert_eq!(
            message,
            Message::Pong(Pong {
                sequence: 7,
                received_at: Instant::from_micros(1_500),
                replied_at: Instant::from_micros(1_600),
            })
        );
        assert!(message.is_keepalive());
    }

    #[test]
    fn control_messages_decode() {
        assert_eq!(decode(b"READY"), Ok(Message::Ready));
        assert_eq!(decode(b"PAUSE_SESSION\r\n"), Ok(Message::PauseSession));
        assert_eq!(decode(b"SEED:918273"), Ok(Message::Seed(918_273)));
        assert_eq!(
            decode(b"STOP_SESSION:12|99000"),
            Ok(Message::StopSession(ControlStamp {
                sequence: 12,
                timestamp: Instant::from_micros(99_000),
            }))
        );
    }

    #[test]
    fn battery_voltage_uses_two_decimals() {
        let frame = encode(&Message::BatteryResponse { millivolts: 3_720 }).expect("encodes");
        assert_eq!(body(&frame), b"BAT_RESPONSE:3.72".as_slice());
        assert_eq!(
            decode(b"BAT_RESPONSE:3.4"),
            Ok(Message::BatteryResponse { millivolts: 3_400 })
        );
    }

    #[test]
    fn parameter_updates_mix_numbers_and_words() {
        let Message::ParamUpdate(updates) =
            decode(b"PARAM_UPDATE:jitter|23.5|PATTERN|rndp|ON|150").expect("decodes")
        else {
            panic!("expected parameter update");
        };

        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0], ParamUpdate::number(ParamKey::Jitter, 2_350));
        assert_eq!(updates[1].key, ParamKey::Pattern);
        assert!(matches!(&updates[1].value, ParamValue::Word(word) if word == "rndp"));
        assert_eq!(updates[2], ParamUpdate::whole(ParamKey::On, 150));

        let frame = encode(&Message::ParamUpdate(updates)).expect("encodes");
        assert_eq!(
            body(&frame),
            b"PARAM_UPDATE:JITTER|23.5|PATTERN|rndp|ON|150".as_slice()
        );
    }

    #[test]
    fn buzz_duration_and_frequency_are_bounded() {
        let field = |duration: u32, frequency: u32| {
            let mut body: String<64> = String::new();
            write!(body, "BUZZ:1|0|0|50|{duration}|{frequency}|0").expect("fits");
            decode(body.as_bytes())
        };

        assert!(field(10, 50).is_ok());
        assert!(field(1_000, 300).is_ok());
        assert_eq!(field(9, 250), Err(DecodeError::OutOfRange { index: 4 }));
        assert_eq!(field(1_001, 250), Err(DecodeError::OutOfRange { index: 4 }));
        assert_eq!(field(100, 49), Err(DecodeError::OutOfRange { index: 5 }));
        assert_eq!(field(100, 301), Err(DecodeError::OutOfRange { index: 5 }));
        assert_eq!(
            field(4_000_000_000, 250),
            Err(DecodeError::OutOfRange { index: 4 })
        );
    }

    #[test]
    fn protocol_errors_are_reported() {
        assert_eq!(decode(b"WIGGLE"), Err(DecodeError::UnknownCommand));
        assert_eq!(
            decode(b"PING:1"),
            Err(DecodeError::FieldCount {
                expected: 2,
                found: 1
            })
        );
        assert_eq!(
            decode(b"BUZZ:1|0|4|50|100|250|900"),
            Err(DecodeError::OutOfRange { index: 2 })
        );
        assert_eq!(
            decode(b"BUZZ:1|0|1|150|100|250|900"),
            Err(DecodeError::OutOfRange { index: 3 })
        );
        assert_eq!(
            decode(b"BUZZ:1|0|0|50|4000000000|250|0"),
            Err(DecodeError::OutOfRange { index: 4 })
        );
        assert_eq!(
            decode(b"PING:1|abc"),
            Err(DecodeError::InvalidNumber { index: 1 })
        );
        assert_eq!(
            decode(b"PARAM_UPDATE:ON|100|OFF"),
            Err(DecodeError::UnpairedParameter)
        );
        assert_eq!(
            decode(b"PARAM_UPDATE:FINGERS|4"),
            Err(DecodeError::UnknownParameter { index: 0 })
        );
        assert_eq!(decode(&[0xff, 0xfe]), Err(DecodeError::Utf8));
        assert!(matches!(decode(b"PING:1|$"), Err(DecodeError::Grammar(_))));
    }
}
