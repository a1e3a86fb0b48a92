//! btroute control wire format.
//!
//! Every control message is framed as `<byteLength>;<payload>`, where
//! `byteLength` is the ASCII decimal count of UTF-8 bytes in `payload` and
//! `payload` is `command,field1,field2,...`.
//!
//! Field contents never contain `,`. Structured fields use their own
//! delimiters, each distinct from the others:
//!
//!   `,`  separates top-level fields
//!   `;`  separates the parts of a map entry
//!   `|`  separates list items (neighbors, services)
//!   `/`  separates the parts of an endpoint or service record
//!   `+`  separates service class UUIDs
//!
//! Free text (display names, service names) is percent-escaped for exactly
//! these characters plus `%` itself, so no value can collide with a
//! delimiter.
//!
//! Changing any of this is a protocol break for every peer on the air.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::str::FromStr;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::types::{
    AddressError, ControlEndpoint, EntryReport, PeerId, ProtocolKind, ServiceDescriptor,
    SessionToken, VisitedSet,
};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Largest payload a single frame may declare.
pub const MAX_FRAME_LEN: usize = 65535;

/// Digits needed to express MAX_FRAME_LEN. A longer prefix is malformed.
pub const MAX_PREFIX_DIGITS: usize = 5;

/// Separator between length prefix and payload.
pub const PREFIX_SEPARATOR: u8 = b';';

/// Service UUID every participating node advertises its control port under.
pub const CONTROL_SERVICE_UUID: Uuid = Uuid::from_u128(0x8ce2_55c0_200a_11e0_ac64_0800_200c_9a66);

/// Advertised name of the control service.
pub const CONTROL_SERVICE_NAME: &str = "btroute-control";

const FIELD_SEP: char = ',';
const ENTRY_SEP: char = ';';
const LIST_SEP: char = '|';
const PART_SEP: char = '/';
const CLASS_SEP: char = '+';
const ESCAPE: char = '%';

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// One-level discovery request.
    Discover,
    /// Multi-hop search request.
    Search,
    /// Aggregated map entries returned to a request's origin.
    Response,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Discover => "discover",
            Command::Search => "search",
            Command::Response => "response",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discover" => Ok(Command::Discover),
            "search" => Ok(Command::Search),
            "response" => Ok(Command::Response),
            other => Err(CodecError::UnknownCommand(other.to_string())),
        }
    }
}

// ── Raw framing ───────────────────────────────────────────────────────────────

/// A decoded frame before field interpretation: `(command, fields)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub command: Command,
    pub fields: Vec<String>,
}

/// Frame a command and its fields.
///
/// Fields must not contain the field separator; structured values should be
/// built with the typed `Packet` API, which escapes free text.
pub fn encode(command: Command, fields: &[String]) -> Result<Bytes, CodecError> {
    let mut payload = String::from(command.as_str());
    for field in fields {
        if field.contains(FIELD_SEP) {
            return Err(CodecError::ReservedCharacter(field.clone()));
        }
        payload.push(FIELD_SEP);
        payload.push_str(field);
    }
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }
    let mut frame = BytesMut::with_capacity(payload.len() + MAX_PREFIX_DIGITS + 1);
    frame.extend_from_slice(payload.len().to_string().as_bytes());
    frame.extend_from_slice(&[PREFIX_SEPARATOR]);
    frame.extend_from_slice(payload.as_bytes());
    Ok(frame.freeze())
}

/// Interpret one frame's payload as `(command, fields)`.
pub fn parse_payload(payload: &[u8]) -> Result<RawPacket, CodecError> {
    let text = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)?;
    let mut parts = text.split(FIELD_SEP);
    // split always yields at least one item
    let command = parts.next().unwrap_or_default().parse()?;
    Ok(RawPacket {
        command,
        fields: parts.map(str::to_string).collect(),
    })
}

/// Incremental frame decoder over an owned byte buffer.
///
/// Feed bytes with `extend`, then drain complete frames with `next_frame` or
/// `next_packet` until they return `None`. A malformed prefix yields an
/// error and drops only the bytes that made it malformed, so a valid frame
/// right behind it still decodes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held but not yet emitted as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete payload, `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Bytes, CodecError>> {
        if self.buf.is_empty() {
            return None;
        }

        let mut declared: usize = 0;
        let mut separator_at = None;
        for i in 0..self.buf.len() {
            match self.buf[i] {
                PREFIX_SEPARATOR if i == 0 => {
                    self.buf.advance(1);
                    return Some(Err(CodecError::MalformedPrefix(String::new())));
                }
                PREFIX_SEPARATOR => {
                    separator_at = Some(i);
                    break;
                }
                digit @ b'0'..=b'9' if i < MAX_PREFIX_DIGITS => {
                    declared = declared * 10 + usize::from(digit - b'0');
                }
                b'0'..=b'9' => {
                    self.skip_digit_run(i);
                    return Some(Err(CodecError::PrefixTooLong));
                }
                _ => {
                    let prefix = String::from_utf8_lossy(&self.buf[..=i]).into_owned();
                    self.buf.advance(i + 1);
                    return Some(Err(CodecError::MalformedPrefix(prefix)));
                }
            }
        }

        // Prefix not complete yet.
        let separator_at = separator_at?;

        if declared == 0 {
            self.buf.advance(separator_at + 1);
            return Some(Err(CodecError::EmptyPayload));
        }
        if declared > MAX_FRAME_LEN {
            self.buf.advance(separator_at + 1);
            return Some(Err(CodecError::FrameTooLarge(declared)));
        }

        let frame_end = separator_at + 1 + declared;
        if self.buf.len() < frame_end {
            return None;
        }

        self.buf.advance(separator_at + 1);
        Some(Ok(self.buf.split_to(declared).freeze()))
    }

    /// Next complete frame, interpreted as `(command, fields)`.
    pub fn next_packet(&mut self) -> Option<Result<RawPacket, CodecError>> {
        self.next_frame()
            .map(|frame| frame.and_then(|payload| parse_payload(&payload)))
    }

    /// Drop an over-long digit run starting before `from`, plus the
    /// separator that ends it. Bytes after that are framed afresh.
    fn skip_digit_run(&mut self, from: usize) {
        let mut end = from;
        while end < self.buf.len() && self.buf[end].is_ascii_digit() {
            end += 1;
        }
        if self.buf.get(end) == Some(&PREFIX_SEPARATOR) {
            end += 1;
        }
        self.buf.advance(end);
    }
}

// ── Streaming reader ──────────────────────────────────────────────────────────

/// Reads control packets from any byte stream.
///
/// Owns the framing buffer only; the transport handle stays with the caller's
/// stream type.
pub struct PacketReader<R> {
    inner: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
        }
    }

    /// Read the next frame as `(command, fields)`.
    ///
    /// Complete frames already buffered are returned without touching the
    /// transport. A zero-length read ends the stream with `ReadError::Closed`.
    pub async fn read_raw(&mut self) -> Result<RawPacket, ReadError> {
        loop {
            if let Some(result) = self.decoder.next_packet() {
                return result.map_err(ReadError::Malformed);
            }

            self.decoder.buf.reserve(4096);
            let n = self
                .inner
                .read_buf(&mut self.decoder.buf)
                .await
                .map_err(ReadError::Io)?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    tracing::debug!(
                        buffered = self.decoder.buffered(),
                        "stream ended mid-frame, discarding partial frame"
                    );
                }
                return Err(ReadError::Closed);
            }
            tracing::trace!(bytes = n, "control stream read");
        }
    }

    /// Read the next typed packet.
    pub async fn read_packet(&mut self) -> Result<Packet, ReadError> {
        let raw = self.read_raw().await?;
        Packet::try_from(raw).map_err(ReadError::Malformed)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Encode and write one packet, then flush.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), CodecError> {
    let frame = packet.encode()?;
    writer.write_all(&frame).await.map_err(CodecError::Io)?;
    writer.flush().await.map_err(CodecError::Io)?;
    Ok(())
}

// ── Typed packets ─────────────────────────────────────────────────────────────

/// A `discover` or `search` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub token: SessionToken,
    /// Control endpoint the single `response` must be sent to.
    pub reply_to: ControlEndpoint,
    /// Every peer already visited by this traversal, sender included.
    pub visited: VisitedSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub token: SessionToken,
    pub responder: ControlEndpoint,
    pub entries: Vec<EntryReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Discover(Request),
    Search(Request),
    Response(Response),
}

impl Packet {
    pub fn command(&self) -> Command {
        match self {
            Packet::Discover(_) => Command::Discover,
            Packet::Search(_) => Command::Search,
            Packet::Response(_) => Command::Response,
        }
    }

    pub fn token(&self) -> SessionToken {
        match self {
            Packet::Discover(r) | Packet::Search(r) => r.token,
            Packet::Response(r) => r.token,
        }
    }

    pub fn to_raw(&self) -> RawPacket {
        let fields = match self {
            Packet::Discover(req) | Packet::Search(req) => {
                let mut fields = vec![req.token.to_string(), req.reply_to.to_string()];
                fields.extend(req.visited.endpoints().map(|ep| ep.to_string()));
                fields
            }
            Packet::Response(resp) => {
                let mut fields = vec![resp.token.to_string(), resp.responder.to_string()];
                fields.extend(resp.entries.iter().map(encode_entry));
                fields
            }
        };
        RawPacket {
            command: self.command(),
            fields,
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let raw = self.to_raw();
        encode(raw.command, &raw.fields)
    }
}

impl TryFrom<RawPacket> for Packet {
    type Error = CodecError;

    fn try_from(raw: RawPacket) -> Result<Self, Self::Error> {
        let command = raw.command;
        let mut fields = raw.fields.into_iter();
        let token: SessionToken = fields
            .next()
            .ok_or(CodecError::MissingField {
                command,
                field: "token",
            })?
            .parse()?;
        let endpoint: ControlEndpoint = fields
            .next()
            .ok_or(CodecError::MissingField {
                command,
                field: "endpoint",
            })?
            .parse()?;

        match command {
            Command::Discover | Command::Search => {
                let mut visited = VisitedSet::new();
                for field in fields {
                    visited.insert(field.parse::<ControlEndpoint>()?);
                }
                let request = Request {
                    token,
                    reply_to: endpoint,
                    visited,
                };
                Ok(if command == Command::Discover {
                    Packet::Discover(request)
                } else {
                    Packet::Search(request)
                })
            }
            Command::Response => Ok(Packet::Response(Response {
                token,
                responder: endpoint,
                entries: fields
                    .map(|f| decode_entry(&f))
                    .collect::<Result<_, _>>()?,
            })),
        }
    }
}

// ── Entry serialization ───────────────────────────────────────────────────────

/// `peer;name;direct;relay;n1|n2|...;svc1|svc2|...`
pub fn encode_entry(entry: &EntryReport) -> String {
    let neighbors: Vec<String> = entry.neighbors.iter().map(PeerId::to_string).collect();
    let services: Vec<String> = entry.services.iter().map(encode_service).collect();
    format!(
        "{peer}{s}{name}{s}{direct}{s}{relay}{s}{neighbors}{s}{services}",
        s = ENTRY_SEP,
        peer = entry.peer,
        name = escape(&entry.name),
        direct = flag(entry.direct),
        relay = flag(entry.relay_capable),
        neighbors = neighbors.join(&LIST_SEP.to_string()),
        services = services.join(&LIST_SEP.to_string()),
    )
}

pub fn decode_entry(text: &str) -> Result<EntryReport, CodecError> {
    let parts: Vec<&str> = text.split(ENTRY_SEP).collect();
    let [peer, name, direct, relay, neighbors, services] = parts.as_slice() else {
        return Err(CodecError::InvalidField {
            field: "entry",
            value: text.to_string(),
        });
    };
    Ok(EntryReport {
        peer: peer.parse::<PeerId>()?,
        name: unescape(name)?,
        direct: parse_flag("direct", direct)?,
        relay_capable: parse_flag("relay", relay)?,
        neighbors: split_list(neighbors)
            .map(str::parse)
            .collect::<Result<BTreeSet<PeerId>, _>>()?,
        services: split_list(services)
            .map(decode_service)
            .collect::<Result<_, _>>()?,
    })
}

/// `kind/port/uuid/name/class1+class2`
fn encode_service(service: &ServiceDescriptor) -> String {
    let classes: Vec<String> = service
        .service_classes
        .iter()
        .map(Uuid::to_string)
        .collect();
    format!(
        "{kind}{s}{port}{s}{uuid}{s}{name}{s}{classes}",
        s = PART_SEP,
        kind = service.kind,
        port = service.port,
        uuid = service.service_uuid,
        name = escape(&service.name),
        classes = classes.join(&CLASS_SEP.to_string()),
    )
}

fn decode_service(text: &str) -> Result<ServiceDescriptor, CodecError> {
    let parts: Vec<&str> = text.split(PART_SEP).collect();
    let [kind, port, uuid, name, classes] = parts.as_slice() else {
        return Err(CodecError::InvalidField {
            field: "service",
            value: text.to_string(),
        });
    };
    Ok(ServiceDescriptor {
        kind: kind.parse::<ProtocolKind>()?,
        port: port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(port.to_string()))?,
        name: unescape(name)?,
        service_uuid: parse_uuid(uuid)?,
        service_classes: classes
            .split(CLASS_SEP)
            .filter(|c| !c.is_empty())
            .map(parse_uuid)
            .collect::<Result<_, _>>()?,
    })
}

fn split_list(text: &str) -> impl Iterator<Item = &str> {
    text.split(LIST_SEP).filter(|item| !item.is_empty())
}

fn parse_uuid(text: &str) -> Result<Uuid, CodecError> {
    Uuid::parse_str(text).map_err(|_| CodecError::InvalidField {
        field: "uuid",
        value: text.to_string(),
    })
}

fn flag(value: bool) -> char {
    if value {
        '1'
    } else {
        '0'
    }
}

fn parse_flag(field: &'static str, text: &str) -> Result<bool, CodecError> {
    match text {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(CodecError::InvalidField {
            field,
            value: other.to_string(),
        }),
    }
}

// ── Escaping ──────────────────────────────────────────────────────────────────

/// Percent-escape every delimiter character and `%`.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            FIELD_SEP | ENTRY_SEP | LIST_SEP | PART_SEP | CLASS_SEP | ESCAPE => {
                out.push_str(&format!("%{:02X}", c as u32));
            }
            other => out.push(other),
        }
    }
    out
}

pub fn unescape(text: &str) -> Result<String, CodecError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE {
            out.push(c);
            continue;
        }
        let hex: String = chars.by_ref().take(2).collect();
        let decoded = u8::from_str_radix(&hex, 16)
            .ok()
            .filter(|_| hex.len() == 2)
            .map(char::from)
            .filter(|c| matches!(*c, FIELD_SEP | ENTRY_SEP | LIST_SEP | PART_SEP | CLASS_SEP | ESCAPE))
            .ok_or_else(|| CodecError::InvalidEscape(format!("%{hex}")))?;
        out.push(decoded);
    }
    Ok(out)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// A single message could not be encoded or decoded.
///
/// Always scoped to one message: the stream it came from is still usable.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("field contains reserved separator: {0:?}")]
    ReservedCharacter(String),

    #[error("malformed length prefix: {0:?}")]
    MalformedPrefix(String),

    #[error("length prefix longer than {} digits", MAX_PREFIX_DIGITS)]
    PrefixTooLong,

    #[error("frame length {0} exceeds maximum {}", MAX_FRAME_LEN)]
    FrameTooLarge(usize),

    #[error("empty payload")]
    EmptyPayload,

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("{command} packet is missing its {field} field")]
    MissingField {
        command: Command,
        field: &'static str,
    },

    #[error("invalid {field} field: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("invalid escape sequence: {0:?}")]
    InvalidEscape(String),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("write failed: {0}")]
    Io(io::Error),
}

/// Why `PacketReader` stopped producing a packet.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// Peer closed the stream. Not an error for the protocol.
    #[error("stream closed")]
    Closed,

    /// The transport failed. The stream is unusable.
    #[error("stream read failed: {0}")]
    Io(io::Error),

    /// One message was bad. The stream is still usable.
    #[error(transparent)]
    Malformed(CodecError),
}

impl ReadError {
    /// True when no further packets can come from this stream.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReadError::Malformed(_))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::new([0x00, 0x1a, 0x7d, 0xda, 0x71, n])
    }

    fn fields(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sample_entry() -> EntryReport {
        EntryReport {
            peer: peer(1),
            name: "kitchen, speaker; 50%|a/b+c".into(),
            direct: true,
            relay_capable: false,
            neighbors: [peer(2), peer(3)].into_iter().collect(),
            services: vec![ServiceDescriptor {
                kind: ProtocolKind::SegmentOriented,
                port: 0x1001,
                name: "Serial/Port".into(),
                service_uuid: Uuid::from_u128(0x1101),
                service_classes: [Uuid::from_u128(0x1101), Uuid::from_u128(0x1200)]
                    .into_iter()
                    .collect(),
            }],
        }
    }

    #[test]
    fn encode_prefixes_utf8_byte_length() {
        let frame = encode(Command::Search, &fields(&["é"])).unwrap();
        // "search,é" is 9 bytes: é is two bytes in UTF-8
        assert_eq!(&frame[..], "9;search,é".as_bytes());
    }

    #[test]
    fn encode_rejects_field_separator() {
        let err = encode(Command::Search, &fields(&["a,b"])).unwrap_err();
        assert!(matches!(err, CodecError::ReservedCharacter(_)));
    }

    #[test]
    fn raw_round_trip() {
        let cases = [
            (Command::Discover, fields(&[])),
            (Command::Search, fields(&["x", "", "y;z"])),
            (Command::Response, fields(&["00000000000000ff", "ünïcode"])),
        ];
        for (command, fs) in cases {
            let frame = encode(command, &fs).unwrap();
            let mut decoder = FrameDecoder::new();
            decoder.extend(&frame);
            let raw = decoder.next_packet().unwrap().unwrap();
            assert_eq!(raw.command, command);
            assert_eq!(raw.fields, fs);
            assert!(decoder.next_packet().is_none());
        }
    }

    #[test]
    fn pipelined_frames_decode_in_order() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode(Command::Search, &fields(&["1"])).unwrap());
        decoder.extend(&encode(Command::Discover, &fields(&["2"])).unwrap());
        let first = decoder.next_packet().unwrap().unwrap();
        let second = decoder.next_packet().unwrap().unwrap();
        assert_eq!(first.command, Command::Search);
        assert_eq!(second.command, Command::Discover);
        assert_eq!(second.fields, fields(&["2"]));
        assert!(decoder.next_packet().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn byte_at_a_time_matches_whole_frame() {
        let frame = encode(Command::Response, &fields(&["a", "b", "c"])).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for byte in frame.iter() {
            decoder.extend(&[*byte]);
            while let Some(result) = decoder.next_packet() {
                decoded.push(result.unwrap());
            }
        }
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].fields, fields(&["a", "b", "c"]));
    }

    #[test]
    fn incomplete_frame_waits() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"12;search");
        assert!(decoder.next_frame().is_none());
        decoder.extend(b",abcde");
        assert_eq!(&decoder.next_frame().unwrap().unwrap()[..], b"search,abcde");
    }

    #[test]
    fn malformed_prefix_skips_to_next_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"x;");
        decoder.extend(&encode(Command::Search, &fields(&["ok"])).unwrap());

        let mut errors = 0;
        let next = loop {
            match decoder.next_packet().unwrap() {
                Ok(raw) => break raw,
                Err(CodecError::MalformedPrefix(_)) => errors += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        };
        assert_eq!(errors, 2);
        assert_eq!(next.fields, fields(&["ok"]));
    }

    #[test]
    fn stray_byte_costs_no_following_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"x");
        decoder.extend(&encode(Command::Search, &fields(&["1"])).unwrap());
        decoder.extend(&encode(Command::Discover, &fields(&["2"])).unwrap());

        assert!(matches!(
            decoder.next_packet(),
            Some(Err(CodecError::MalformedPrefix(p))) if p == "x"
        ));
        let first = decoder.next_packet().unwrap().unwrap();
        let second = decoder.next_packet().unwrap().unwrap();
        assert_eq!(first.command, Command::Search);
        assert_eq!(second.command, Command::Discover);
        assert!(decoder.next_packet().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn digits_then_junk_drop_only_themselves() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"12x");
        decoder.extend(&encode(Command::Response, &fields(&["a"])).unwrap());
        assert!(matches!(
            decoder.next_packet(),
            Some(Err(CodecError::MalformedPrefix(p))) if p == "12x"
        ));
        assert_eq!(decoder.next_packet().unwrap().unwrap().command, Command::Response);
    }

    #[test]
    fn empty_payload_is_an_error_for_that_frame_only() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"0;");
        decoder.extend(&encode(Command::Discover, &fields(&[])).unwrap());
        assert!(matches!(
            decoder.next_packet(),
            Some(Err(CodecError::EmptyPayload))
        ));
        assert_eq!(
            decoder.next_packet().unwrap().unwrap().command,
            Command::Discover
        );
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"99999;");
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(CodecError::FrameTooLarge(99999)))
        ));
        decoder.extend(b"1234567;");
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(CodecError::PrefixTooLong))
        ));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn unknown_command_consumes_its_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"5;hello");
        decoder.extend(&encode(Command::Search, &fields(&[])).unwrap());
        assert!(matches!(
            decoder.next_packet(),
            Some(Err(CodecError::UnknownCommand(_)))
        ));
        assert_eq!(decoder.next_packet().unwrap().unwrap().command, Command::Search);
    }

    #[test]
    fn escape_round_trip_covers_every_delimiter() {
        let text = "a,b;c|d/e+f%g";
        let escaped = escape(text);
        assert!(!escaped.contains([',', ';', '|', '/', '+']));
        assert_eq!(unescape(&escaped).unwrap(), text);
        assert!(unescape("%zz").is_err());
        assert!(unescape("%4").is_err());
        assert!(unescape("%41").is_err(), "only reserved characters are escaped");
    }

    #[test]
    fn entry_round_trip_with_hostile_names() {
        let entry = sample_entry();
        let text = encode_entry(&entry);
        assert!(!text.contains(','));
        assert_eq!(decode_entry(&text).unwrap(), entry);
    }

    #[test]
    fn entry_with_no_neighbors_or_services() {
        let entry = EntryReport {
            peer: peer(9),
            name: String::new(),
            direct: false,
            relay_capable: true,
            neighbors: BTreeSet::new(),
            services: Vec::new(),
        };
        let text = encode_entry(&entry);
        assert_eq!(text, "00:1A:7D:DA:71:09;;0;1;;");
        assert_eq!(decode_entry(&text).unwrap(), entry);
    }

    #[test]
    fn typed_packets_round_trip() {
        let visited: VisitedSet = [
            ControlEndpoint::new(peer(1), 3),
            ControlEndpoint::new(peer(2), 5),
        ]
        .into_iter()
        .collect();
        let packets = [
            Packet::Search(Request {
                token: SessionToken::from_raw(7),
                reply_to: ControlEndpoint::new(peer(1), 3),
                visited: visited.clone(),
            }),
            Packet::Discover(Request {
                token: SessionToken::from_raw(8),
                reply_to: ControlEndpoint::new(peer(2), 5),
                visited,
            }),
            Packet::Response(Response {
                token: SessionToken::from_raw(7),
                responder: ControlEndpoint::new(peer(2), 5),
                entries: vec![sample_entry()],
            }),
            Packet::Response(Response {
                token: SessionToken::from_raw(9),
                responder: ControlEndpoint::new(peer(4), 1),
                entries: Vec::new(),
            }),
        ];
        for packet in packets {
            let frame = packet.encode().unwrap();
            let mut decoder = FrameDecoder::new();
            decoder.extend(&frame);
            let raw = decoder.next_packet().unwrap().unwrap();
            assert_eq!(Packet::try_from(raw).unwrap(), packet);
        }
    }

    #[test]
    fn request_without_reply_endpoint_is_rejected() {
        let raw = RawPacket {
            command: Command::Search,
            fields: fields(&["0000000000000001"]),
        };
        assert!(matches!(
            Packet::try_from(raw),
            Err(CodecError::MissingField { field: "endpoint", .. })
        ));
    }

    #[tokio::test]
    async fn reader_handles_split_reads_and_stream_end() {
        let packet = Packet::Search(Request {
            token: SessionToken::from_raw(42),
            reply_to: ControlEndpoint::new(peer(1), 1),
            visited: VisitedSet::new(),
        });
        let frame = packet.encode().unwrap();
        let (head, tail) = frame.split_at(frame.len() / 2);

        let (mut tx, rx) = tokio::io::duplex(64);
        let writer = {
            let head = head.to_vec();
            let tail = tail.to_vec();
            tokio::spawn(async move {
                tx.write_all(&head).await.unwrap();
                tx.flush().await.unwrap();
                tokio::task::yield_now().await;
                tx.write_all(&tail).await.unwrap();
                tx.write_all(b"garbage;").await.unwrap();
                // drop closes the stream
            })
        };

        let mut reader = PacketReader::new(rx);
        assert_eq!(reader.read_packet().await.unwrap(), packet);
        writer.await.unwrap();

        let mut malformed = 0;
        let end = loop {
            match reader.read_packet().await {
                Err(e) if !e.is_fatal() => malformed += 1,
                other => break other,
            }
        };
        assert!(malformed >= 1, "garbage must surface as a malformed frame");
        assert!(matches!(end, Err(ReadError::Closed)));
    }
}
