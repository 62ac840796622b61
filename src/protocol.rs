//! Wire format of the control protocol.
//!
//! A message is a `code: i32` followed by zero or more self-delimited
//! attributes `{ key: u16, length: u16, payload }`, all big-endian. Requests
//! carry a command code; replies reuse the envelope with the code repurposed
//! as a signed status: negative is an OS-style error number, zero is
//! success, positive is a notification. Frames are length-prefixed on the
//! socket by the codec layer; this module only deals with the payload.

use bytes::{Buf, BufMut, BytesMut};
use nix::errno::Errno;

use crate::config::NAME_MAX;

/// Notification code: a watched pid died.
pub const NOTIFY_DIED: i32 = 1;

/// Upper bound on a reply frame's payload, also the `list` page budget.
pub const MAX_FRAME: usize = 8192;

const ATTR_NAME: u16 = 1;
const ATTR_PID: u16 = 2;
const ATTR_EXIT_CODE: u16 = 3;
const ATTR_BUFFER: u16 = 4;
const ATTR_CURSOR: u16 = 5;
const ATTR_HAS_OUTPUT: u16 = 6;
const ATTR_UPTIME: u16 = 7;

/// Command codes understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CommandCode {
    List = 1,
    Status = 2,
    GetBuf = 3,
    Start = 4,
    Spawn = 5,
    Stout = 6,
    Stop = 7,
    Flush = 8,
    Remove = 9,
    Sighup = 10,
    Reboot = 11,
    Shutdown = 12,
    Poweroff = 13,
}

impl CommandCode {
    pub fn from_code(code: i32) -> Option<CommandCode> {
        use CommandCode::*;
        Some(match code {
            1 => List,
            2 => Status,
            3 => GetBuf,
            4 => Start,
            5 => Spawn,
            6 => Stout,
            7 => Stop,
            8 => Flush,
            9 => Remove,
            10 => Sighup,
            11 => Reboot,
            12 => Shutdown,
            13 => Poweroff,
            _ => return None,
        })
    }
}

/// A decoded attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attr {
    Name(String),
    Pid(i32),
    ExitCode(i32),
    Buffer(Vec<u8>),
    Cursor(u32),
    HasOutput,
    Uptime(u64),
}

/// Violations of the wire format. These close the offending connection.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown attribute key {0}")]
    UnknownAttribute(u16),
    #[error("attribute length does not match its type")]
    BadLength,
    #[error("service name is not valid")]
    BadName,
}

/// Command-level failures, surfaced to the client as a negative status in
/// the reply envelope. Never fatal to the daemon.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown service")]
    UnknownService,
    #[error("service already running")]
    AlreadyRunning,
    #[error("service not running")]
    NotRunning,
    #[error("service still running")]
    StillRunning,
    #[error("out of service slots")]
    OutOfSlots,
    #[error("shutdown already in progress")]
    ShutdownInProgress,
    #[error("unknown command")]
    UnknownCommand,
    #[error("{0}")]
    Os(Errno),
}

impl CommandError {
    /// OS-style error number carried on the wire (negated in the reply).
    pub fn errno(&self) -> i32 {
        let e = match self {
            CommandError::UnknownService => Errno::ENOENT,
            CommandError::AlreadyRunning => Errno::EAGAIN,
            CommandError::NotRunning => Errno::EAGAIN,
            CommandError::StillRunning => Errno::EBUSY,
            CommandError::OutOfSlots => Errno::ENOMEM,
            CommandError::ShutdownInProgress => Errno::EALREADY,
            CommandError::UnknownCommand => Errno::EINVAL,
            CommandError::Os(e) => *e,
        };
        e as i32
    }

    pub fn from_io(err: &std::io::Error) -> CommandError {
        match err.raw_os_error() {
            Some(n) => CommandError::Os(Errno::from_raw(n)),
            None => CommandError::Os(Errno::EIO),
        }
    }
}

/// A message is valid to send iff its attributes fit the frame budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: i32,
    pub attrs: Vec<Attr>,
}

impl Message {
    pub fn new(code: i32) -> Self {
        Message { code, attrs: Vec::new() }
    }

    pub fn request(cmd: CommandCode) -> Self {
        Message::new(cmd as i32)
    }

    pub fn ok() -> Self {
        Message::new(0)
    }

    pub fn error(err: &CommandError) -> Self {
        Message::new(-err.errno())
    }

    pub fn with(mut self, attr: Attr) -> Self {
        self.attrs.push(attr);
        self
    }

    /// First name attribute, if any.
    pub fn name(&self) -> Option<&str> {
        self.attrs.iter().find_map(|a| match a {
            Attr::Name(n) => Some(n.as_str()),
            _ => None,
        })
    }

    pub fn cursor(&self) -> Option<u32> {
        self.attrs.iter().find_map(|a| match a {
            Attr::Cursor(c) => Some(*c),
            _ => None,
        })
    }

    pub fn buffer(&self) -> Option<&[u8]> {
        self.attrs.iter().find_map(|a| match a {
            Attr::Buffer(b) => Some(b.as_slice()),
            _ => None,
        })
    }

    pub fn pid(&self) -> Option<i32> {
        self.attrs.iter().find_map(|a| match a {
            Attr::Pid(p) => Some(*p),
            _ => None,
        })
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.attrs.iter().find_map(|a| match a {
            Attr::ExitCode(c) => Some(*c),
            _ => None,
        })
    }

    pub fn has_output(&self) -> bool {
        self.attrs.iter().any(|a| matches!(a, Attr::HasOutput))
    }

    pub fn encode(&self) -> BytesMut {
        let mut dst = BytesMut::with_capacity(64);
        dst.put_i32(self.code);
        for attr in &self.attrs {
            encode_attr(&mut dst, attr);
        }
        dst
    }

    pub fn decode(mut buf: &[u8]) -> Result<Message, ProtocolError> {
        if buf.remaining() < 4 {
            return Err(ProtocolError::Truncated);
        }
        let code = buf.get_i32();
        let mut attrs = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(ProtocolError::Truncated);
            }
            let key = buf.get_u16();
            let len = buf.get_u16() as usize;
            if buf.remaining() < len {
                return Err(ProtocolError::Truncated);
            }
            let payload = &buf[..len];
            attrs.push(decode_attr(key, payload)?);
            buf.advance(len);
        }
        Ok(Message { code, attrs })
    }
}

fn encode_attr(dst: &mut BytesMut, attr: &Attr) {
    match attr {
        Attr::Name(name) => {
            dst.put_u16(ATTR_NAME);
            dst.put_u16(name.len() as u16);
            dst.put_slice(name.as_bytes());
        }
        Attr::Pid(pid) => {
            dst.put_u16(ATTR_PID);
            dst.put_u16(4);
            dst.put_i32(*pid);
        }
        Attr::ExitCode(code) => {
            dst.put_u16(ATTR_EXIT_CODE);
            dst.put_u16(4);
            dst.put_i32(*code);
        }
        Attr::Buffer(bytes) => {
            dst.put_u16(ATTR_BUFFER);
            dst.put_u16(bytes.len() as u16);
            dst.put_slice(bytes);
        }
        Attr::Cursor(cursor) => {
            dst.put_u16(ATTR_CURSOR);
            dst.put_u16(4);
            dst.put_u32(*cursor);
        }
        Attr::HasOutput => {
            dst.put_u16(ATTR_HAS_OUTPUT);
            dst.put_u16(0);
        }
        Attr::Uptime(secs) => {
            dst.put_u16(ATTR_UPTIME);
            dst.put_u16(8);
            dst.put_u64(*secs);
        }
    }
}

fn decode_attr(key: u16, payload: &[u8]) -> Result<Attr, ProtocolError> {
    match key {
        ATTR_NAME => {
            let name = std::str::from_utf8(payload).map_err(|_| ProtocolError::BadName)?;
            validate_name(name)?;
            Ok(Attr::Name(name.to_string()))
        }
        ATTR_PID => Ok(Attr::Pid(get_i32(payload)?)),
        ATTR_EXIT_CODE => Ok(Attr::ExitCode(get_i32(payload)?)),
        ATTR_BUFFER => Ok(Attr::Buffer(payload.to_vec())),
        ATTR_CURSOR => Ok(Attr::Cursor(get_i32(payload)? as u32)),
        ATTR_HAS_OUTPUT => {
            if payload.is_empty() {
                Ok(Attr::HasOutput)
            } else {
                Err(ProtocolError::BadLength)
            }
        }
        ATTR_UPTIME => {
            let bytes: [u8; 8] = payload.try_into().map_err(|_| ProtocolError::BadLength)?;
            Ok(Attr::Uptime(u64::from_be_bytes(bytes)))
        }
        other => Err(ProtocolError::UnknownAttribute(other)),
    }
}

fn get_i32(payload: &[u8]) -> Result<i32, ProtocolError> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| ProtocolError::BadLength)?;
    Ok(i32::from_be_bytes(bytes))
}

/// A service name is a plain, non-hidden file name within the table's
/// fixed width.
pub fn validate_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty()
        || name.len() > NAME_MAX
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\0')
    {
        return Err(ProtocolError::BadName);
    }
    Ok(())
}

/// Encode a success reply whose buffer attribute is gathered from the ring's
/// two wrap segments without an intermediate copy.
pub fn encode_buffer_reply(segments: (&[u8], &[u8])) -> BytesMut {
    let (a, b) = segments;
    let mut dst = BytesMut::with_capacity(8 + a.len() + b.len());
    dst.put_i32(0);
    dst.put_u16(ATTR_BUFFER);
    dst.put_u16((a.len() + b.len()) as u16);
    dst.put_slice(a);
    dst.put_slice(b);
    dst
}

/// Per-service record in a `list` reply. Records are delimited by their
/// leading name attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRecord {
    pub name: String,
    pub pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub has_output: bool,
}

/// Split a decoded `list` reply into records plus the continuation cursor.
pub fn parse_list_reply(msg: &Message) -> (Vec<ListRecord>, Option<u32>) {
    let mut records: Vec<ListRecord> = Vec::new();
    let mut cursor = None;
    for attr in &msg.attrs {
        match attr {
            Attr::Name(name) => records.push(ListRecord {
                name: name.clone(),
                pid: None,
                exit_code: None,
                has_output: false,
            }),
            Attr::Pid(pid) => {
                if let Some(rec) = records.last_mut() {
                    rec.pid = Some(*pid);
                }
            }
            Attr::ExitCode(code) => {
                if let Some(rec) = records.last_mut() {
                    rec.exit_code = Some(*code);
                }
            }
            Attr::HasOutput => {
                if let Some(rec) = records.last_mut() {
                    rec.has_output = true;
                }
            }
            Attr::Cursor(c) => cursor = Some(*c),
            _ => {}
        }
    }
    (records, cursor)
}
