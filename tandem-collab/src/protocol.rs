//! Wire protocol for session synchronization.
//!
//! Wire format (bincode-encoded [`Frame`]):
//! ```text
//! ┌─────┬──────────┬─────────┬─────────┬─────┐
//! │ tag │ n fields │ field 0 │ field 1 │ ... │
//! │ u8  │ varint   │         │         │     │
//! └─────┴──────────┴─────────┴─────────┴─────┘
//! ```
//!
//! | Tag | Message   | Fields                                              |
//! |-----|-----------|-----------------------------------------------------|
//! | 1   | INFO      | session share, username, client kind                |
//! | 2   | TEXT      | INSERT: kind, char, pid / DELETE: kind, pid, char   |
//! | 3   | AVAILABLE | is first, assigned site, session share              |
//! | 4   | INITIAL   | buffer name, buffer ref, pids, lines                |
//! | 5   | REQUEST   | none                                                |
//!
//! Every frame goes through [`validate`] before it is sent and after it is
//! received; [`Message::from_frame`] is the only way to obtain a decoded message.

use serde::{Deserialize, Serialize};
use tandem_core::{Pid, SiteId, Snapshot};

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client introduction, first frame on a connection
    Info = 1,
    /// Insert or delete of a single character
    Text = 2,
    /// Relay reply to INFO carrying the assigned site
    Available = 3,
    /// Host snapshot for a joining guest
    Initial = 4,
    /// Guest asks the host for a snapshot
    Request = 5,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Info),
            2 => Some(Self::Text),
            3 => Some(Self::Available),
            4 => Some(Self::Initial),
            5 => Some(Self::Request),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Operation tags inside a TEXT frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationKind {
    Insert = 1,
    Delete = 2,
}

impl OperationKind {
    fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(Self::Insert),
            2 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One untyped frame field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    Bool(bool),
    Int(u64),
    Str(String),
    Pid(Vec<u64>),
    PidList(Vec<Vec<u64>>),
    StrList(Vec<String>),
}

/// Shape of a [`Field`], used by the frame schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Str,
    Pid,
    PidList,
    StrList,
}

impl Field {
    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Bool(_) => FieldKind::Bool,
            Field::Int(_) => FieldKind::Int,
            Field::Str(_) => FieldKind::Str,
            Field::Pid(_) => FieldKind::Pid,
            Field::PidList(_) => FieldKind::PidList,
            Field::StrList(_) => FieldKind::StrList,
        }
    }
}

const INFO_SCHEMA: &[FieldKind] = &[FieldKind::Bool, FieldKind::Str, FieldKind::Str];
const INSERT_SCHEMA: &[FieldKind] = &[FieldKind::Int, FieldKind::Str, FieldKind::Pid];
const DELETE_SCHEMA: &[FieldKind] = &[FieldKind::Int, FieldKind::Pid, FieldKind::Str];
const AVAILABLE_SCHEMA: &[FieldKind] = &[FieldKind::Bool, FieldKind::Int, FieldKind::Bool];
const INITIAL_SCHEMA: &[FieldKind] = &[
    FieldKind::Str,
    FieldKind::Str,
    FieldKind::PidList,
    FieldKind::StrList,
];

/// A frame as it travels: integer tag followed by tag-specific fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub tag: u8,
    pub fields: Vec<Field>,
}

/// Check a frame's tag and field shapes against its schema.
///
/// Returns the frame's message type.
pub fn validate(frame: &Frame) -> Result<MessageType, ProtocolError> {
    let message = MessageType::from_tag(frame.tag).ok_or(ProtocolError::UnknownTag(frame.tag))?;

    let schema = match message {
        MessageType::Info => INFO_SCHEMA,
        MessageType::Available => AVAILABLE_SCHEMA,
        MessageType::Initial => INITIAL_SCHEMA,
        MessageType::Request => &[],
        MessageType::Text => match frame.fields.first() {
            Some(Field::Int(tag)) => match OperationKind::from_tag(*tag) {
                Some(OperationKind::Insert) => INSERT_SCHEMA,
                Some(OperationKind::Delete) => DELETE_SCHEMA,
                None => return Err(ProtocolError::UnknownOperation(*tag)),
            },
            // Fall through to the arity/type checks against the insert shape.
            _ => INSERT_SCHEMA,
        },
    };

    if frame.fields.len() != schema.len() {
        return Err(ProtocolError::Arity {
            message,
            expected: schema.len(),
            found: frame.fields.len(),
        });
    }
    for (index, (field, expected)) in frame.fields.iter().zip(schema).enumerate() {
        if field.kind() != *expected {
            return Err(ProtocolError::FieldType {
                message,
                index,
                expected: *expected,
                found: field.kind(),
            });
        }
    }
    Ok(message)
}

/// Client introduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub session_share: bool,
    pub username: String,
    pub client_kind: String,
}

/// A single-character edit keyed by position identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Insert { ch: char, pid: Pid },
    /// `ch` is carried for diagnostics only.
    Delete { pid: Pid, ch: char },
}

impl Operation {
    pub fn pid(&self) -> &Pid {
        match self {
            Operation::Insert { pid, .. } | Operation::Delete { pid, .. } => pid,
        }
    }
}

/// Relay reply to [`Info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Available {
    pub is_first: bool,
    pub site: SiteId,
    pub session_share: bool,
}

/// Host snapshot sent in reply to a REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initial {
    pub buffer_name: String,
    pub buffer_ref: String,
    pub snapshot: Snapshot,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Info(Info),
    Text(Operation),
    Available(Available),
    Initial(Initial),
    Request,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Info(_) => MessageType::Info,
            Message::Text(_) => MessageType::Text,
            Message::Available(_) => MessageType::Available,
            Message::Initial(_) => MessageType::Initial,
            Message::Request => MessageType::Request,
        }
    }

    /// Flatten into the positional wire shape.
    pub fn to_frame(&self) -> Frame {
        let fields = match self {
            Message::Info(info) => vec![
                Field::Bool(info.session_share),
                Field::Str(info.username.clone()),
                Field::Str(info.client_kind.clone()),
            ],
            Message::Text(Operation::Insert { ch, pid }) => vec![
                Field::Int(OperationKind::Insert as u64),
                Field::Str(ch.to_string()),
                Field::Pid(pid.to_wire()),
            ],
            Message::Text(Operation::Delete { pid, ch }) => vec![
                Field::Int(OperationKind::Delete as u64),
                Field::Pid(pid.to_wire()),
                Field::Str(ch.to_string()),
            ],
            Message::Available(available) => vec![
                Field::Bool(available.is_first),
                Field::Int(u64::from(available.site.0)),
                Field::Bool(available.session_share),
            ],
            Message::Initial(initial) => vec![
                Field::Str(initial.buffer_name.clone()),
                Field::Str(initial.buffer_ref.clone()),
                Field::PidList(initial.snapshot.pids.iter().map(Pid::to_wire).collect()),
                Field::StrList(initial.snapshot.lines.clone()),
            ],
            Message::Request => Vec::new(),
        };
        Frame {
            tag: self.message_type().tag(),
            fields,
        }
    }

    /// Validate a frame and build the typed message it carries.
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let message = validate(&frame)?;
        let mut fields = frame.fields.into_iter();
        let mut reader = FieldReader {
            message,
            index: 0,
            fields: &mut fields,
        };

        let decoded = match message {
            MessageType::Info => Message::Info(Info {
                session_share: reader.bool()?,
                username: reader.string()?,
                client_kind: reader.string()?,
            }),
            MessageType::Text => match OperationKind::from_tag(reader.int()?) {
                Some(OperationKind::Insert) => Message::Text(Operation::Insert {
                    ch: reader.char()?,
                    pid: reader.pid()?,
                }),
                Some(OperationKind::Delete) => Message::Text(Operation::Delete {
                    pid: reader.pid()?,
                    ch: reader.char()?,
                }),
                None => return Err(reader.malformed("unknown operation")),
            },
            MessageType::Available => {
                let is_first = reader.bool()?;
                let site = u32::try_from(reader.int()?)
                    .map_err(|_| reader.malformed("site out of range"))?;
                Message::Available(Available {
                    is_first,
                    site: SiteId(site),
                    session_share: reader.bool()?,
                })
            }
            MessageType::Initial => Message::Initial(Initial {
                buffer_name: reader.string()?,
                buffer_ref: reader.string()?,
                snapshot: Snapshot {
                    pids: reader.pid_list()?,
                    lines: reader.string_list()?,
                },
            }),
            MessageType::Request => Message::Request,
        };
        Ok(decoded)
    }

    /// Validate and serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let frame = self.to_frame();
        validate(&frame)?;
        bincode::serde::encode_to_vec(&frame, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format and validate.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, read): (Frame, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Self::from_frame(frame)
    }
}

/// Sequential typed access to a validated frame's fields.
struct FieldReader<'a, I> {
    message: MessageType,
    index: usize,
    fields: &'a mut I,
}

impl<I: Iterator<Item = Field>> FieldReader<'_, I> {
    fn next(&mut self) -> Result<Field, ProtocolError> {
        let field = self
            .fields
            .next()
            .ok_or_else(|| self.malformed("missing field"))?;
        self.index += 1;
        Ok(field)
    }

    fn malformed(&self, reason: &str) -> ProtocolError {
        ProtocolError::Malformed {
            message: self.message,
            index: self.index.saturating_sub(1),
            reason: reason.to_string(),
        }
    }

    fn bool(&mut self) -> Result<bool, ProtocolError> {
        match self.next()? {
            Field::Bool(value) => Ok(value),
            _ => Err(self.malformed("expected bool")),
        }
    }

    fn int(&mut self) -> Result<u64, ProtocolError> {
        match self.next()? {
            Field::Int(value) => Ok(value),
            _ => Err(self.malformed("expected integer")),
        }
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        match self.next()? {
            Field::Str(value) => Ok(value),
            _ => Err(self.malformed("expected string")),
        }
    }

    fn char(&mut self) -> Result<char, ProtocolError> {
        let value = self.string()?;
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(ch), None) => Ok(ch),
            _ => Err(self.malformed("expected exactly one character")),
        }
    }

    fn pid(&mut self) -> Result<Pid, ProtocolError> {
        match self.next()? {
            Field::Pid(raw) => Pid::from_wire(&raw).map_err(|e| self.malformed(&e.to_string())),
            _ => Err(self.malformed("expected position identifier")),
        }
    }

    fn pid_list(&mut self) -> Result<Vec<Pid>, ProtocolError> {
        match self.next()? {
            Field::PidList(raw) => raw
                .iter()
                .map(|p| Pid::from_wire(p))
                .collect::<Result<_, _>>()
                .map_err(|e| self.malformed(&e.to_string())),
            _ => Err(self.malformed("expected identifier list")),
        }
    }

    fn string_list(&mut self) -> Result<Vec<String>, ProtocolError> {
        match self.next()? {
            Field::StrList(value) => Ok(value),
            _ => Err(self.malformed("expected string list")),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("unknown text operation {0}")]
    UnknownOperation(u64),
    #[error("{message:?} expects {expected} fields, found {found}")]
    Arity {
        message: MessageType,
        expected: usize,
        found: usize,
    },
    #[error("{message:?} field {index}: expected {expected:?}, found {found:?}")]
    FieldType {
        message: MessageType,
        index: usize,
        expected: FieldKind,
        found: FieldKind,
    },
    #[error("{message:?} field {index}: {reason}")]
    Malformed {
        message: MessageType,
        index: usize,
        reason: String,
    },
    #[error("Serialization error: {0}")]
    Encode(String),
    #[error("Deserialization error: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}
