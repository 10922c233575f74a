//! Protocol message model.
//!
//! A [`Message`] is a tagged union of ten kinds. Every kind carries the
//! common triple {kind tag, resource-set id, request number}; the request
//! number is assigned by the application and echoed verbatim in replies,
//! independent of any transport-level serial.
//!
//! Wire format is little-endian positional fields:
//! `[kind:i32][id:u32][reqno:u32]` followed by kind-specific fields.
//! Strings are length-prefixed UTF-8 (`[len:u32][bytes]`).

use std::fmt;

use crate::error::WireError;
use crate::types::{res_str, ModeFlags, ResourceFlags, Role, RsetFlags};

/// Discriminant of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Client announces a new resource set.
    Register,
    /// Client withdraws a resource set.
    Unregister,
    /// Client changes the resource masks of a registered set.
    Update,
    /// Client asks for its resources.
    Acquire,
    /// Client gives its resources back.
    Release,
    /// Manager notifies which resources the set currently holds.
    Grant,
    /// Manager hints which resources could be acquired.
    Advice,
    /// Client attaches an audio stream description to the set.
    Audio,
    /// Client attaches a video stream description to the set.
    Video,
    /// Reply carrying an error code; correlates via the request number.
    Status,
}

impl MessageKind {
    /// Wire tag of this kind.
    pub fn tag(self) -> i32 {
        match self {
            MessageKind::Register => 0,
            MessageKind::Unregister => 1,
            MessageKind::Update => 2,
            MessageKind::Acquire => 3,
            MessageKind::Release => 4,
            MessageKind::Grant => 5,
            MessageKind::Advice => 6,
            MessageKind::Audio => 7,
            MessageKind::Video => 8,
            MessageKind::Status => 9,
        }
    }

    /// Reverse of [`MessageKind::tag`].
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(MessageKind::Register),
            1 => Some(MessageKind::Unregister),
            2 => Some(MessageKind::Update),
            3 => Some(MessageKind::Acquire),
            4 => Some(MessageKind::Release),
            5 => Some(MessageKind::Grant),
            6 => Some(MessageKind::Advice),
            7 => Some(MessageKind::Audio),
            8 => Some(MessageKind::Video),
            9 => Some(MessageKind::Status),
            _ => None,
        }
    }

    /// Bus method member for this kind. Status is a reply, not a method.
    pub fn method(self) -> Option<&'static str> {
        match self {
            MessageKind::Register => Some("register"),
            MessageKind::Unregister => Some("unregister"),
            MessageKind::Update => Some("update"),
            MessageKind::Acquire => Some("acquire"),
            MessageKind::Release => Some("release"),
            MessageKind::Grant => Some("grant"),
            MessageKind::Advice => Some("advice"),
            MessageKind::Audio => Some("audio"),
            MessageKind::Video => Some("video"),
            MessageKind::Status => None,
        }
    }

    /// Human readable kind name.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Status => "status",
            other => other.method().unwrap_or("<unknown>"),
        }
    }

    /// Whether a connection of `role` may register a handler for this kind.
    ///
    /// Checked once at handler registration, never per dispatch.
    pub fn is_valid_for(self, role: Role) -> bool {
        match role {
            Role::Manager => matches!(
                self,
                MessageKind::Register
                    | MessageKind::Unregister
                    | MessageKind::Update
                    | MessageKind::Acquire
                    | MessageKind::Release
                    | MessageKind::Audio
                    | MessageKind::Video
            ),
            Role::Client => matches!(
                self,
                MessageKind::Unregister
                    | MessageKind::Release
                    | MessageKind::Grant
                    | MessageKind::Advice
            ),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of Register and Update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    /// Resource set id.
    pub id: u32,
    /// Application request number.
    pub reqno: u32,
    /// Resource bitmask quadruple.
    pub rset: RsetFlags,
    /// Application class used by manager policy (e.g. "player", "call").
    pub class: String,
    /// Application identifier, may be empty.
    pub app_id: String,
    /// Behavioral mode bits.
    pub mode: ModeFlags,
}

/// Payload of Unregister, Acquire and Release.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Possess {
    /// Resource set id.
    pub id: u32,
    /// Application request number.
    pub reqno: u32,
}

/// Payload of Grant and Advice.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Notify {
    /// Resource set id.
    pub id: u32,
    /// Application request number.
    pub reqno: u32,
    /// Affected resources.
    pub resources: ResourceFlags,
}

/// How a stream property pattern is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMethod {
    /// Exact string equality.
    #[default]
    Equals,
    /// Prefix match.
    StartsWith,
    /// Regular-expression match.
    Matches,
}

impl MatchMethod {
    fn tag(self) -> u32 {
        match self {
            MatchMethod::Equals => 0,
            MatchMethod::StartsWith => 1,
            MatchMethod::Matches => 2,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(MatchMethod::Equals),
            1 => Some(MatchMethod::StartsWith),
            2 => Some(MatchMethod::Matches),
            _ => None,
        }
    }

    /// Human readable method name.
    pub fn name(self) -> &'static str {
        match self {
            MatchMethod::Equals => "equals",
            MatchMethod::StartsWith => "startswith",
            MatchMethod::Matches => "matches",
        }
    }
}

/// Single stream property carried by Audio.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamProperty {
    /// Property name (e.g. "media.name").
    pub name: String,
    /// Match method for the pattern.
    pub method: MatchMethod,
    /// Pattern to match the property value against.
    pub pattern: String,
}

/// Payload of Audio.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioStream {
    /// Resource set id.
    pub id: u32,
    /// Application request number.
    pub reqno: u32,
    /// Audio group the stream belongs to.
    pub group: String,
    /// Pid of the rendering process, 0 if unknown.
    pub pid: u32,
    /// Application identifier of the renderer, may be empty.
    pub app_id: String,
    /// Stream property used to pick the stream.
    pub property: StreamProperty,
}

/// Payload of Video.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VideoStream {
    /// Resource set id.
    pub id: u32,
    /// Application request number.
    pub reqno: u32,
    /// Pid of the rendering process, 0 if unknown.
    pub pid: u32,
}

/// Payload of Status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    /// Resource set id.
    pub id: u32,
    /// Request number of the request being answered.
    pub reqno: u32,
    /// Error code, 0 on success.
    pub errcod: i32,
    /// Error message, empty when none.
    pub errmsg: String,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Announce a resource set.
    Register(Record),
    /// Withdraw a resource set.
    Unregister(Possess),
    /// Change the resource masks.
    Update(Record),
    /// Ask for the resources.
    Acquire(Possess),
    /// Give the resources back.
    Release(Possess),
    /// Resources currently held.
    Grant(Notify),
    /// Resources potentially available.
    Advice(Notify),
    /// Audio stream description.
    Audio(AudioStream),
    /// Video stream description.
    Video(VideoStream),
    /// Reply with error code.
    Status(Status),
}

impl Message {
    /// Kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Register(_) => MessageKind::Register,
            Message::Unregister(_) => MessageKind::Unregister,
            Message::Update(_) => MessageKind::Update,
            Message::Acquire(_) => MessageKind::Acquire,
            Message::Release(_) => MessageKind::Release,
            Message::Grant(_) => MessageKind::Grant,
            Message::Advice(_) => MessageKind::Advice,
            Message::Audio(_) => MessageKind::Audio,
            Message::Video(_) => MessageKind::Video,
            Message::Status(_) => MessageKind::Status,
        }
    }

    /// Resource set id carried by the message.
    pub fn id(&self) -> u32 {
        match self {
            Message::Register(m) | Message::Update(m) => m.id,
            Message::Unregister(m) | Message::Acquire(m) | Message::Release(m) => m.id,
            Message::Grant(m) | Message::Advice(m) => m.id,
            Message::Audio(m) => m.id,
            Message::Video(m) => m.id,
            Message::Status(m) => m.id,
        }
    }

    /// Application request number carried by the message.
    pub fn reqno(&self) -> u32 {
        match self {
            Message::Register(m) | Message::Update(m) => m.reqno,
            Message::Unregister(m) | Message::Acquire(m) | Message::Release(m) => m.reqno,
            Message::Grant(m) | Message::Advice(m) => m.reqno,
            Message::Audio(m) => m.reqno,
            Message::Video(m) => m.reqno,
            Message::Status(m) => m.reqno,
        }
    }

    /// Overwrite the resource set id (the engine stamps the owning set's id
    /// before transmission).
    pub fn set_id(&mut self, id: u32) {
        match self {
            Message::Register(m) | Message::Update(m) => m.id = id,
            Message::Unregister(m) | Message::Acquire(m) | Message::Release(m) => m.id = id,
            Message::Grant(m) | Message::Advice(m) => m.id = id,
            Message::Audio(m) => m.id = id,
            Message::Video(m) => m.id = id,
            Message::Status(m) => m.id = id,
        }
    }

    /// Serialize to the positional little-endian wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new(self.kind(), self.id(), self.reqno());

        match self {
            Message::Register(m) | Message::Update(m) => {
                w.put_u32(m.rset.all.bits());
                w.put_u32(m.rset.opt.bits());
                w.put_u32(m.rset.share.bits());
                w.put_u32(m.rset.mask.bits());
                w.put_str(&m.class);
                w.put_str(&m.app_id);
                w.put_u32(m.mode.bits());
            }
            Message::Unregister(_) | Message::Acquire(_) | Message::Release(_) => {}
            Message::Grant(m) | Message::Advice(m) => {
                w.put_u32(m.resources.bits());
            }
            Message::Audio(m) => {
                w.put_str(&m.group);
                w.put_u32(m.pid);
                w.put_str(&m.app_id);
                w.put_str(&m.property.name);
                w.put_u32(m.property.method.tag());
                w.put_str(&m.property.pattern);
            }
            Message::Video(m) => {
                w.put_u32(m.pid);
            }
            Message::Status(m) => {
                w.put_i32(m.errcod);
                w.put_str(&m.errmsg);
            }
        }

        w.finish()
    }

    /// Parse a message from its wire form.
    ///
    /// Fails on a truncated buffer, an unknown kind tag, invalid UTF-8 in a
    /// string field or trailing bytes. A failed decode drops the message; no
    /// reply is generated for it.
    pub fn decode(data: &[u8]) -> Result<Message, WireError> {
        let mut r = WireReader::new(data);

        let tag = r.get_i32()?;
        let kind = MessageKind::from_tag(tag).ok_or(WireError::UnknownKind { tag })?;
        let id = r.get_u32()?;
        let reqno = r.get_u32()?;

        let msg = match kind {
            MessageKind::Register | MessageKind::Update => {
                let all = ResourceFlags::from_bits_retain(r.get_u32()?);
                let opt = ResourceFlags::from_bits_retain(r.get_u32()?);
                let share = ResourceFlags::from_bits_retain(r.get_u32()?);
                let mask = ResourceFlags::from_bits_retain(r.get_u32()?);
                let class = r.get_str("class")?;
                let app_id = r.get_str("app_id")?;
                let mode = ModeFlags::from_bits_retain(r.get_u32()?);
                let record = Record {
                    id,
                    reqno,
                    rset: RsetFlags::new(all, opt, share, mask),
                    class,
                    app_id,
                    mode,
                };
                if kind == MessageKind::Register {
                    Message::Register(record)
                } else {
                    Message::Update(record)
                }
            }
            MessageKind::Unregister => Message::Unregister(Possess { id, reqno }),
            MessageKind::Acquire => Message::Acquire(Possess { id, reqno }),
            MessageKind::Release => Message::Release(Possess { id, reqno }),
            MessageKind::Grant | MessageKind::Advice => {
                let resources = ResourceFlags::from_bits_retain(r.get_u32()?);
                let notify = Notify {
                    id,
                    reqno,
                    resources,
                };
                if kind == MessageKind::Grant {
                    Message::Grant(notify)
                } else {
                    Message::Advice(notify)
                }
            }
            MessageKind::Audio => {
                let group = r.get_str("group")?;
                let pid = r.get_u32()?;
                let app_id = r.get_str("app_id")?;
                let name = r.get_str("property.name")?;
                let method_tag = r.get_u32()?;
                let method = MatchMethod::from_tag(method_tag).ok_or(WireError::UnknownKind {
                    tag: method_tag as i32,
                })?;
                let pattern = r.get_str("property.pattern")?;
                Message::Audio(AudioStream {
                    id,
                    reqno,
                    group,
                    pid,
                    app_id,
                    property: StreamProperty {
                        name,
                        method,
                        pattern,
                    },
                })
            }
            MessageKind::Video => Message::Video(VideoStream {
                id,
                reqno,
                pid: r.get_u32()?,
            }),
            MessageKind::Status => Message::Status(Status {
                id,
                reqno,
                errcod: r.get_i32()?,
                errmsg: r.get_str("errmsg")?,
            }),
        };

        r.expect_end()?;
        Ok(msg)
    }
}

impl fmt::Display for Message {
    /// Multi-line diagnostic dump.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();
        writeln!(f, "type      : {} ({})", kind.name(), kind.tag())?;
        writeln!(f, "id        : {}", self.id())?;
        write!(f, "reqno     : {}", self.reqno())?;

        match self {
            Message::Register(m) | Message::Update(m) => {
                writeln!(f)?;
                writeln!(f, "rset.all  : {}", res_str(m.rset.all))?;
                writeln!(f, "rset.opt  : {}", res_str(m.rset.opt))?;
                writeln!(f, "rset.share: {}", res_str(m.rset.share))?;
                writeln!(f, "rset.mask : {}", res_str(m.rset.mask))?;
                let class = if m.class.is_empty() {
                    "<unknown>"
                } else {
                    m.class.as_str()
                };
                writeln!(f, "class     : '{}'", class)?;
                write!(f, "mode      : 0x{:x}", m.mode.bits())
            }
            Message::Grant(m) | Message::Advice(m) => {
                writeln!(f)?;
                write!(f, "resrc     : {}", res_str(m.resources))
            }
            Message::Audio(m) => {
                writeln!(f)?;
                writeln!(f, "group     : '{}'", m.group)?;
                writeln!(f, "pid       : {}", m.pid)?;
                write!(
                    f,
                    "property  : {} {} '{}'",
                    m.property.name,
                    m.property.method.name(),
                    m.property.pattern
                )
            }
            Message::Video(m) => {
                writeln!(f)?;
                write!(f, "pid       : {}", m.pid)
            }
            Message::Status(m) => {
                writeln!(f)?;
                writeln!(f, "errcod    : {}", m.errcod)?;
                write!(f, "errmsg    : '{}'", m.errmsg)
            }
            _ => Ok(()),
        }
    }
}

struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn new(kind: MessageKind, id: u32, reqno: u32) -> Self {
        let mut w = Self {
            buf: Vec::with_capacity(32),
        };
        w.put_i32(kind.tag());
        w.put_u32(id);
        w.put_u32(reqno);
        w
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_str(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let available = self.data.len() - self.pos;
        if available < n {
            return Err(WireError::Truncated {
                needed: n,
                available,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_str(&mut self, field: &'static str) -> Result<String, WireError> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidString { field })
    }

    fn expect_end(&self) -> Result<(), WireError> {
        let excess = self.data.len() - self.pos;
        if excess != 0 {
            return Err(WireError::ExcessData { excess });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: MessageKind) -> Message {
        let record = Record {
            id: 3,
            reqno: 7,
            rset: RsetFlags::new(
                ResourceFlags::AUDIO_PLAYBACK | ResourceFlags::VIDEO_PLAYBACK,
                ResourceFlags::VIDEO_PLAYBACK,
                ResourceFlags::empty(),
                ResourceFlags::AUDIO_PLAYBACK,
            ),
            class: "player".to_string(),
            app_id: "org.example.player".to_string(),
            mode: ModeFlags::AUTO_RELEASE,
        };
        match kind {
            MessageKind::Register => Message::Register(record),
            _ => Message::Update(record),
        }
    }

    #[test]
    fn round_trip_all_kinds() {
        let messages = vec![
            record(MessageKind::Register),
            record(MessageKind::Update),
            Message::Unregister(Possess { id: 1, reqno: 2 }),
            Message::Acquire(Possess { id: 1, reqno: 3 }),
            Message::Release(Possess { id: 1, reqno: 4 }),
            Message::Grant(Notify {
                id: 1,
                reqno: 5,
                resources: ResourceFlags::AUDIO_PLAYBACK,
            }),
            Message::Advice(Notify {
                id: 1,
                reqno: 6,
                resources: ResourceFlags::AUDIO_PLAYBACK | ResourceFlags::VIBRA,
            }),
            Message::Audio(AudioStream {
                id: 1,
                reqno: 7,
                group: "ringtone".to_string(),
                pid: 1234,
                app_id: String::new(),
                property: StreamProperty {
                    name: "media.name".to_string(),
                    method: MatchMethod::Equals,
                    pattern: "alarm".to_string(),
                },
            }),
            Message::Video(VideoStream {
                id: 1,
                reqno: 8,
                pid: 4321,
            }),
            Message::Status(Status {
                id: 1,
                reqno: 9,
                errcod: 0,
                errmsg: String::new(),
            }),
        ];

        for msg in messages {
            let bytes = msg.encode();
            let decoded = Message::decode(&bytes).expect("decode");
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let mut bytes = Message::Acquire(Possess { id: 1, reqno: 1 }).encode();
        bytes[0] = 0x7f;
        assert_eq!(
            Message::decode(&bytes),
            Err(WireError::UnknownKind { tag: 0x7f })
        );
    }

    #[test]
    fn decode_rejects_truncation() {
        let bytes = record(MessageKind::Register).encode();
        for cut in [0, 3, 11, bytes.len() - 1] {
            let result = Message::decode(&bytes[..cut]);
            assert!(
                matches!(result, Err(WireError::Truncated { .. })),
                "cut at {} should truncate",
                cut
            );
        }
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = Message::Release(Possess { id: 1, reqno: 1 }).encode();
        bytes.push(0);
        assert_eq!(Message::decode(&bytes), Err(WireError::ExcessData { excess: 1 }));
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let mut bytes = WireWriter::new(MessageKind::Status, 1, 1);
        bytes.put_i32(0);
        bytes.put_u32(2);
        let mut buf = bytes.finish();
        buf.extend_from_slice(&[0xff, 0xfe]);
        assert_eq!(
            Message::decode(&buf),
            Err(WireError::InvalidString { field: "errmsg" })
        );
    }

    #[test]
    fn validity_tables_per_role() {
        use MessageKind::*;

        for kind in [Register, Unregister, Update, Acquire, Release, Audio, Video] {
            assert!(kind.is_valid_for(Role::Manager), "{kind} on manager");
        }
        for kind in [Grant, Advice, Status] {
            assert!(!kind.is_valid_for(Role::Manager), "{kind} on manager");
        }

        for kind in [Unregister, Release, Grant, Advice] {
            assert!(kind.is_valid_for(Role::Client), "{kind} on client");
        }
        for kind in [Register, Update, Acquire, Audio, Video, Status] {
            assert!(!kind.is_valid_for(Role::Client), "{kind} on client");
        }
    }

    #[test]
    fn method_names_are_lowercase_kind_names() {
        assert_eq!(MessageKind::Register.method(), Some("register"));
        assert_eq!(MessageKind::Advice.method(), Some("advice"));
        assert_eq!(MessageKind::Status.method(), None);
    }

    #[test]
    fn render_register_dump() {
        let dump = record(MessageKind::Register).to_string();
        assert!(dump.contains("type      : register (0)"));
        assert!(dump.contains("rset.all  : audio_playback,video_playback (0x3)"));
        assert!(dump.contains("class     : 'player'"));
    }
}
