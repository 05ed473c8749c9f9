//! BACnet/IP frame codec.
//!
//! Covers the subset the client speaks: BVLC original unicast framing, a
//! minimal NPDU, confirmed ReadProperty / WriteProperty requests and their
//! ComplexACK, SimpleACK, Error, Reject and Abort responses. Request decoding
//! and response encoding are provided too so a device side can be simulated.

use unison_core::{TransportError, TransportResult, Value};

use crate::address::BacnetObjectType;

pub const BVLC_TYPE_BIP: u8 = 0x81;
pub const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
pub const BVLC_ORIGINAL_BROADCAST: u8 = 0x0B;
pub const BVLC_FORWARDED_NPDU: u8 = 0x04;
pub const NPDU_VERSION: u8 = 0x01;

pub const SERVICE_READ_PROPERTY: u8 = 12;
pub const SERVICE_WRITE_PROPERTY: u8 = 15;

const PDU_CONFIRMED_REQUEST: u8 = 0x0;
const PDU_SIMPLE_ACK: u8 = 0x2;
const PDU_COMPLEX_ACK: u8 = 0x3;
const PDU_ERROR: u8 = 0x5;
const PDU_REJECT: u8 = 0x6;
const PDU_ABORT: u8 = 0x7;

const TAG_NULL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_UNSIGNED: u8 = 2;
const TAG_SIGNED: u8 = 3;
const TAG_REAL: u8 = 4;
const TAG_DOUBLE: u8 = 5;
const TAG_CHARACTER_STRING: u8 = 7;
const TAG_ENUMERATED: u8 = 9;

const CHARSET_UTF8: u8 = 0;

fn truncated() -> TransportError {
    TransportError::Protocol("truncated BACnet frame".into())
}

/// Primitive application-tagged value.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplicationValue {
    Null,
    Boolean(bool),
    Unsigned(u32),
    Signed(i32),
    Real(f32),
    Double(f64),
    CharacterString(String),
    Enumerated(u32),
}

impl ApplicationValue {
    /// Value for a write to an object of `object_type`.
    ///
    /// Binary objects take enumerated 0/1, multi-state objects take unsigned
    /// state numbers, everything else numeric is sent as REAL.
    pub fn for_object(object_type: BacnetObjectType, value: &Value) -> TransportResult<Self> {
        let unencodable = || {
            TransportError::Write(format!(
                "cannot write {} to a BACnet {object_type} object",
                value.describe()
            ))
        };
        match value {
            Value::Null => Ok(Self::Null),
            Value::String(s) => Ok(Self::CharacterString(s.clone())),
            Value::Bool(b) if object_type.is_binary() => Ok(Self::Enumerated(u32::from(*b))),
            Value::Bool(b) => Ok(Self::Boolean(*b)),
            Value::Int(i) if object_type.is_binary() => match i {
                0 | 1 => Ok(Self::Enumerated(*i as u32)),
                _ => Err(unencodable()),
            },
            Value::Int(i) if object_type.is_multi_state() => {
                u32::try_from(*i).map(Self::Unsigned).map_err(|_| unencodable())
            }
            Value::Int(i) => Ok(Self::Real(*i as f32)),
            Value::Float(f) if !object_type.is_binary() && !object_type.is_multi_state() => {
                Ok(Self::Real(*f as f32))
            }
            _ => Err(unencodable()),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Boolean(b) => Value::Bool(b),
            Self::Unsigned(u) | Self::Enumerated(u) => Value::Int(i64::from(u)),
            Self::Signed(i) => Value::Int(i64::from(i)),
            // Shortest decimal form, so 0.1f32 reads back as 0.1.
            Self::Real(f) => Value::Float(f.to_string().parse().unwrap_or(f64::from(f))),
            Self::Double(f) => Value::Float(f),
            Self::CharacterString(s) => Value::String(s),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Null => buf.push(TAG_NULL << 4),
            Self::Boolean(b) => buf.push((TAG_BOOLEAN << 4) | u8::from(*b)),
            Self::Unsigned(u) => {
                let bytes = unsigned_bytes(*u);
                tag_header(buf, TAG_UNSIGNED, false, bytes.len());
                buf.extend_from_slice(&bytes);
            }
            Self::Signed(i) => {
                let bytes = signed_bytes(*i);
                tag_header(buf, TAG_SIGNED, false, bytes.len());
                buf.extend_from_slice(&bytes);
            }
            Self::Real(f) => {
                tag_header(buf, TAG_REAL, false, 4);
                buf.extend_from_slice(&f.to_be_bytes());
            }
            Self::Double(f) => {
                tag_header(buf, TAG_DOUBLE, false, 8);
                buf.extend_from_slice(&f.to_be_bytes());
            }
            Self::CharacterString(s) => {
                tag_header(buf, TAG_CHARACTER_STRING, false, s.len() + 1);
                buf.push(CHARSET_UTF8);
                buf.extend_from_slice(s.as_bytes());
            }
            Self::Enumerated(u) => {
                let bytes = unsigned_bytes(*u);
                tag_header(buf, TAG_ENUMERATED, false, bytes.len());
                buf.extend_from_slice(&bytes);
            }
        }
    }

    fn decode(reader: &mut Reader<'_>) -> TransportResult<Self> {
        let tag = reader.tag()?;
        if tag.context {
            return Err(TransportError::Protocol(format!(
                "expected application tag, found context tag {}",
                tag.number
            )));
        }
        if tag.number == TAG_BOOLEAN {
            // Boolean carries its value in the length field.
            return Ok(Self::Boolean(tag.lvt != 0));
        }
        let data = reader.take(tag.length()?)?;
        match tag.number {
            TAG_NULL => Ok(Self::Null),
            TAG_UNSIGNED => Ok(Self::Unsigned(decode_unsigned(data)?)),
            TAG_SIGNED => Ok(Self::Signed(decode_signed(data)?)),
            TAG_REAL => {
                let bytes: [u8; 4] = data.try_into().map_err(|_| truncated())?;
                Ok(Self::Real(f32::from_be_bytes(bytes)))
            }
            TAG_DOUBLE => {
                let bytes: [u8; 8] = data.try_into().map_err(|_| truncated())?;
                Ok(Self::Double(f64::from_be_bytes(bytes)))
            }
            TAG_CHARACTER_STRING => {
                let (charset, text) = data.split_first().ok_or_else(truncated)?;
                if *charset != CHARSET_UTF8 {
                    return Err(TransportError::Protocol(format!(
                        "unsupported BACnet character set {charset}"
                    )));
                }
                String::from_utf8(text.to_vec())
                    .map(Self::CharacterString)
                    .map_err(|_| TransportError::Protocol("invalid UTF-8 in BACnet string".into()))
            }
            TAG_ENUMERATED => Ok(Self::Enumerated(decode_unsigned(data)?)),
            other => Err(TransportError::Protocol(format!(
                "unsupported BACnet application tag {other}"
            ))),
        }
    }
}

fn unsigned_bytes(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(3).take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn signed_bytes(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut skip = 0;
    while skip < 3 {
        let redundant = (bytes[skip] == 0x00 && bytes[skip + 1] & 0x80 == 0)
            || (bytes[skip] == 0xFF && bytes[skip + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        skip += 1;
    }
    bytes[skip..].to_vec()
}

fn decode_unsigned(data: &[u8]) -> TransportResult<u32> {
    if data.is_empty() || data.len() > 4 {
        return Err(TransportError::Protocol(format!(
            "bad unsigned length {}",
            data.len()
        )));
    }
    Ok(data.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

fn decode_signed(data: &[u8]) -> TransportResult<i32> {
    if data.is_empty() || data.len() > 4 {
        return Err(TransportError::Protocol(format!(
            "bad signed length {}",
            data.len()
        )));
    }
    let fill = if data[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut bytes = [fill; 4];
    bytes[4 - data.len()..].copy_from_slice(data);
    Ok(i32::from_be_bytes(bytes))
}

fn tag_header(buf: &mut Vec<u8>, number: u8, context: bool, length: usize) {
    let class = if context { 0x08 } else { 0x00 };
    if length < 5 {
        buf.push((number << 4) | class | length as u8);
        return;
    }
    buf.push((number << 4) | class | 0x05);
    if length <= 253 {
        buf.push(length as u8);
    } else if length <= usize::from(u16::MAX) {
        buf.push(254);
        buf.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        buf.push(255);
        buf.extend_from_slice(&(length as u32).to_be_bytes());
    }
}

fn context_unsigned(buf: &mut Vec<u8>, number: u8, value: u32) {
    let bytes = unsigned_bytes(value);
    tag_header(buf, number, true, bytes.len());
    buf.extend_from_slice(&bytes);
}

fn context_object_id(buf: &mut Vec<u8>, number: u8, object: ObjectId) {
    tag_header(buf, number, true, 4);
    buf.extend_from_slice(&object.encode().to_be_bytes());
}

fn opening_tag(buf: &mut Vec<u8>, number: u8) {
    buf.push((number << 4) | 0x0E);
}

fn closing_tag(buf: &mut Vec<u8>, number: u8) {
    buf.push((number << 4) | 0x0F);
}

struct Tag {
    number: u8,
    context: bool,
    lvt: u8,
    extended_length: Option<usize>,
}

impl Tag {
    fn is_opening(&self, number: u8) -> bool {
        self.context && self.number == number && self.lvt == 6
    }

    fn is_closing(&self, number: u8) -> bool {
        self.context && self.number == number && self.lvt == 7
    }

    fn length(&self) -> TransportResult<usize> {
        match (self.lvt, self.extended_length) {
            (0..=4, _) => Ok(usize::from(self.lvt)),
            (5, Some(len)) => Ok(len),
            _ => Err(TransportError::Protocol(format!(
                "tag {} has no data length",
                self.number
            ))),
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> TransportResult<u8> {
        let byte = *self.buf.get(self.pos).ok_or_else(truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> TransportResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, n: usize) -> TransportResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn tag(&mut self) -> TransportResult<Tag> {
        let first = self.u8()?;
        let mut number = first >> 4;
        if number == 0x0F {
            number = self.u8()?;
        }
        let context = first & 0x08 != 0;
        let lvt = first & 0x07;
        let extended_length = if lvt == 5 {
            let len = match self.u8()? {
                254 => usize::from(self.u16()?),
                255 => {
                    let bytes = self.take(4)?;
                    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                }
                len => usize::from(len),
            };
            Some(len)
        } else {
            None
        };
        Ok(Tag {
            number,
            context,
            lvt,
            extended_length,
        })
    }

    fn peek_tag(&self) -> TransportResult<Tag> {
        let mut probe = Reader {
            buf: self.buf,
            pos: self.pos,
        };
        probe.tag()
    }

    fn context_data(&mut self, number: u8) -> TransportResult<&'a [u8]> {
        let tag = self.tag()?;
        if !tag.context || tag.number != number {
            return Err(TransportError::Protocol(format!(
                "expected context tag {number}, found tag {}",
                tag.number
            )));
        }
        let len = tag.length()?;
        self.take(len)
    }

    fn context_unsigned(&mut self, number: u8) -> TransportResult<u32> {
        decode_unsigned(self.context_data(number)?)
    }

    fn context_object_id(&mut self, number: u8) -> TransportResult<ObjectId> {
        let data = self.context_data(number)?;
        let bytes: [u8; 4] = data.try_into().map_err(|_| truncated())?;
        Ok(ObjectId::decode(u32::from_be_bytes(bytes)))
    }

    fn application_enumerated(&mut self) -> TransportResult<u32> {
        match ApplicationValue::decode(self)? {
            ApplicationValue::Enumerated(v) | ApplicationValue::Unsigned(v) => Ok(v),
            other => Err(TransportError::Protocol(format!(
                "expected enumerated, found {other:?}"
            ))),
        }
    }
}

/// Object identifier: 10-bit type, 22-bit instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectId {
    pub object_type: u16,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: u16, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    fn encode(self) -> u32 {
        (u32::from(self.object_type & 0x3FF) << 22) | (self.instance & 0x3F_FFFF)
    }

    fn decode(raw: u32) -> Self {
        Self {
            object_type: (raw >> 22) as u16,
            instance: raw & 0x3F_FFFF,
        }
    }
}

/// Confirmed service request carried by a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ReadProperty {
        invoke_id: u8,
        object: ObjectId,
        property: u32,
    },
    WriteProperty {
        invoke_id: u8,
        object: ObjectId,
        property: u32,
        value: ApplicationValue,
        priority: Option<u8>,
    },
}

impl Request {
    pub fn invoke_id(&self) -> u8 {
        match self {
            Self::ReadProperty { invoke_id, .. } | Self::WriteProperty { invoke_id, .. } => *invoke_id,
        }
    }

    pub fn service(&self) -> u8 {
        match self {
            Self::ReadProperty { .. } => SERVICE_READ_PROPERTY,
            Self::WriteProperty { .. } => SERVICE_WRITE_PROPERTY,
        }
    }
}

/// Response PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// ReadProperty result
    ComplexAck {
        invoke_id: u8,
        service: u8,
        value: ApplicationValue,
    },
    SimpleAck {
        invoke_id: u8,
        service: u8,
    },
    Error {
        invoke_id: u8,
        service: u8,
        class: u32,
        code: u32,
    },
    Reject {
        invoke_id: u8,
        reason: u8,
    },
    Abort {
        invoke_id: u8,
        reason: u8,
    },
}

impl Response {
    pub fn invoke_id(&self) -> u8 {
        match self {
            Self::ComplexAck { invoke_id, .. }
            | Self::SimpleAck { invoke_id, .. }
            | Self::Error { invoke_id, .. }
            | Self::Reject { invoke_id, .. }
            | Self::Abort { invoke_id, .. } => *invoke_id,
        }
    }
}

/// Max-APDU-accepted code for a confirmed request header.
fn max_apdu_code(max_apdu: usize) -> u8 {
    match max_apdu {
        0..=50 => 0,
        51..=128 => 1,
        129..=206 => 2,
        207..=480 => 3,
        481..=1024 => 4,
        _ => 5,
    }
}

/// Wrap an APDU in NPDU and BVLC headers.
pub fn encode_frame(apdu: &[u8], expecting_reply: bool) -> Vec<u8> {
    let total = 4 + 2 + apdu.len();
    let mut frame = Vec::with_capacity(total);
    frame.push(BVLC_TYPE_BIP);
    frame.push(BVLC_ORIGINAL_UNICAST);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.push(NPDU_VERSION);
    frame.push(if expecting_reply { 0x04 } else { 0x00 });
    frame.extend_from_slice(apdu);
    frame
}

/// Strip BVLC and NPDU headers, returning the APDU.
pub fn decode_frame(frame: &[u8]) -> TransportResult<&[u8]> {
    let mut reader = Reader::new(frame);
    if reader.u8()? != BVLC_TYPE_BIP {
        return Err(TransportError::Protocol("not a BACnet/IP frame".into()));
    }
    let function = reader.u8()?;
    let length = usize::from(reader.u16()?);
    if length != frame.len() {
        return Err(TransportError::Protocol(format!(
            "BVLC length {length} does not match datagram size {}",
            frame.len()
        )));
    }
    match function {
        BVLC_ORIGINAL_UNICAST | BVLC_ORIGINAL_BROADCAST => {}
        BVLC_FORWARDED_NPDU => {
            reader.take(6)?;
        }
        other => {
            return Err(TransportError::Protocol(format!(
                "unsupported BVLC function 0x{other:02X}"
            )))
        }
    }

    if reader.u8()? != NPDU_VERSION {
        return Err(TransportError::Protocol("unsupported NPDU version".into()));
    }
    let control = reader.u8()?;
    if control & 0x80 != 0 {
        return Err(TransportError::Protocol(
            "network layer messages are not supported".into(),
        ));
    }
    let has_destination = control & 0x20 != 0;
    if has_destination {
        reader.u16()?;
        let len = reader.u8()?;
        reader.take(usize::from(len))?;
    }
    if control & 0x08 != 0 {
        reader.u16()?;
        let len = reader.u8()?;
        reader.take(usize::from(len))?;
    }
    if has_destination {
        reader.u8()?; // hop count
    }
    Ok(&frame[reader.pos..])
}

fn confirmed_header(buf: &mut Vec<u8>, invoke_id: u8, service: u8, max_apdu: usize) {
    buf.push(PDU_CONFIRMED_REQUEST << 4);
    buf.push(max_apdu_code(max_apdu));
    buf.push(invoke_id);
    buf.push(service);
}

pub fn encode_read_property(invoke_id: u8, object: ObjectId, property: u32, max_apdu: usize) -> Vec<u8> {
    let mut apdu = Vec::with_capacity(16);
    confirmed_header(&mut apdu, invoke_id, SERVICE_READ_PROPERTY, max_apdu);
    context_object_id(&mut apdu, 0, object);
    context_unsigned(&mut apdu, 1, property);
    apdu
}

pub fn encode_write_property(
    invoke_id: u8,
    object: ObjectId,
    property: u32,
    value: &ApplicationValue,
    priority: Option<u8>,
    max_apdu: usize,
) -> Vec<u8> {
    let mut apdu = Vec::with_capacity(32);
    confirmed_header(&mut apdu, invoke_id, SERVICE_WRITE_PROPERTY, max_apdu);
    context_object_id(&mut apdu, 0, object);
    context_unsigned(&mut apdu, 1, property);
    opening_tag(&mut apdu, 3);
    value.encode(&mut apdu);
    closing_tag(&mut apdu, 3);
    if let Some(priority) = priority {
        context_unsigned(&mut apdu, 4, u32::from(priority));
    }
    apdu
}

/// Skip an optional context-2 array index.
fn skip_array_index(reader: &mut Reader<'_>) -> TransportResult<()> {
    let tag = reader.peek_tag()?;
    if tag.context && tag.number == 2 && tag.lvt < 6 {
        reader.context_data(2)?;
    }
    Ok(())
}

/// Read the application value wrapped in an opening/closing tag pair.
fn enclosed_value(reader: &mut Reader<'_>, number: u8) -> TransportResult<ApplicationValue> {
    if !reader.tag()?.is_opening(number) {
        return Err(TransportError::Protocol(format!(
            "expected opening tag {number}"
        )));
    }
    let value = ApplicationValue::decode(reader)?;
    // Arrays and lists: keep the first element.
    loop {
        let tag = reader.peek_tag()?;
        if tag.is_closing(number) {
            reader.tag()?;
            break;
        }
        ApplicationValue::decode(reader)?;
    }
    Ok(value)
}

pub fn decode_response(apdu: &[u8]) -> TransportResult<Response> {
    let mut reader = Reader::new(apdu);
    let first = reader.u8()?;
    match first >> 4 {
        PDU_COMPLEX_ACK => {
            if first & 0x08 != 0 {
                return Err(TransportError::Protocol(
                    "segmented responses are not supported".into(),
                ));
            }
            let invoke_id = reader.u8()?;
            let service = reader.u8()?;
            if service != SERVICE_READ_PROPERTY {
                return Err(TransportError::Protocol(format!(
                    "unexpected ComplexACK for service {service}"
                )));
            }
            reader.context_object_id(0)?;
            reader.context_unsigned(1)?;
            skip_array_index(&mut reader)?;
            let value = enclosed_value(&mut reader, 3)?;
            Ok(Response::ComplexAck {
                invoke_id,
                service,
                value,
            })
        }
        PDU_SIMPLE_ACK => Ok(Response::SimpleAck {
            invoke_id: reader.u8()?,
            service: reader.u8()?,
        }),
        PDU_ERROR => {
            let invoke_id = reader.u8()?;
            let service = reader.u8()?;
            let class = reader.application_enumerated()?;
            let code = reader.application_enumerated()?;
            Ok(Response::Error {
                invoke_id,
                service,
                class,
                code,
            })
        }
        PDU_REJECT => Ok(Response::Reject {
            invoke_id: reader.u8()?,
            reason: reader.u8()?,
        }),
        PDU_ABORT => Ok(Response::Abort {
            invoke_id: reader.u8()?,
            reason: reader.u8()?,
        }),
        other => Err(TransportError::Protocol(format!(
            "unexpected BACnet PDU type {other}"
        ))),
    }
}

pub fn decode_request(apdu: &[u8]) -> TransportResult<Request> {
    let mut reader = Reader::new(apdu);
    if reader.u8()? >> 4 != PDU_CONFIRMED_REQUEST {
        return Err(TransportError::Protocol("not a confirmed request".into()));
    }
    reader.u8()?; // max segments / max APDU
    let invoke_id = reader.u8()?;
    let service = reader.u8()?;
    let object = reader.context_object_id(0)?;
    let property = reader.context_unsigned(1)?;
    match service {
        SERVICE_READ_PROPERTY => Ok(Request::ReadProperty {
            invoke_id,
            object,
            property,
        }),
        SERVICE_WRITE_PROPERTY => {
            skip_array_index(&mut reader)?;
            let value = enclosed_value(&mut reader, 3)?;
            let priority = if reader.is_empty() {
                None
            } else {
                Some(reader.context_unsigned(4)? as u8)
            };
            Ok(Request::WriteProperty {
                invoke_id,
                object,
                property,
                value,
                priority,
            })
        }
        other => Err(TransportError::Protocol(format!(
            "unsupported confirmed service {other}"
        ))),
    }
}

pub fn encode_read_ack(invoke_id: u8, object: ObjectId, property: u32, value: &ApplicationValue) -> Vec<u8> {
    let mut apdu = vec![PDU_COMPLEX_ACK << 4, invoke_id, SERVICE_READ_PROPERTY];
    context_object_id(&mut apdu, 0, object);
    context_unsigned(&mut apdu, 1, property);
    opening_tag(&mut apdu, 3);
    value.encode(&mut apdu);
    closing_tag(&mut apdu, 3);
    apdu
}

pub fn encode_simple_ack(invoke_id: u8, service: u8) -> Vec<u8> {
    vec![PDU_SIMPLE_ACK << 4, invoke_id, service]
}

pub fn encode_error(invoke_id: u8, service: u8, class: u32, code: u32) -> Vec<u8> {
    let mut apdu = vec![PDU_ERROR << 4, invoke_id, service];
    ApplicationValue::Enumerated(class).encode(&mut apdu);
    ApplicationValue::Enumerated(code).encode(&mut apdu);
    apdu
}

pub fn encode_reject(invoke_id: u8, reason: u8) -> Vec<u8> {
    vec![PDU_REJECT << 4, invoke_id, reason]
}

pub fn encode_abort(invoke_id: u8, reason: u8) -> Vec<u8> {
    vec![(PDU_ABORT << 4) | 0x01, invoke_id, reason]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_property_bytes() {
        let apdu = encode_read_property(7, ObjectId::new(0, 1), 85, 1476);
        assert_eq!(apdu, vec![0x00, 0x05, 0x07, 0x0C, 0x0C, 0x00, 0x00, 0x00, 0x01, 0x19, 0x55]);
        let frame = encode_frame(&apdu, true);
        assert_eq!(&frame[..6], &[0x81, 0x0A, 0x00, 17, 0x01, 0x04]);
        assert_eq!(decode_frame(&frame).unwrap(), apdu.as_slice());
    }

    #[test]
    fn test_application_values_decode() {
        for value in [
            ApplicationValue::Null,
            ApplicationValue::Boolean(true),
            ApplicationValue::Unsigned(70_000),
            ApplicationValue::Signed(-129),
            ApplicationValue::Real(21.5),
            ApplicationValue::Double(-0.25),
            ApplicationValue::CharacterString("zone temperature sensor".into()),
            ApplicationValue::Enumerated(1),
        ] {
            let apdu = encode_read_ack(3, ObjectId::new(2, 9), 85, &value);
            match decode_response(&apdu).unwrap() {
                Response::ComplexAck { invoke_id, value: decoded, .. } => {
                    assert_eq!(invoke_id, 3);
                    assert_eq!(decoded, value);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_signed_minimal_encoding() {
        assert_eq!(signed_bytes(-1), vec![0xFF]);
        assert_eq!(signed_bytes(127), vec![0x7F]);
        assert_eq!(signed_bytes(128), vec![0x00, 0x80]);
        assert_eq!(signed_bytes(-129), vec![0xFF, 0x7F]);
        assert_eq!(decode_signed(&[0xFF, 0x7F]).unwrap(), -129);
    }

    #[test]
    fn test_write_request_decodes() {
        let apdu = encode_write_property(
            9,
            ObjectId::new(1, 4),
            85,
            &ApplicationValue::Real(19.0),
            Some(8),
            1476,
        );
        assert_eq!(
            decode_request(&apdu).unwrap(),
            Request::WriteProperty {
                invoke_id: 9,
                object: ObjectId::new(1, 4),
                property: 85,
                value: ApplicationValue::Real(19.0),
                priority: Some(8),
            }
        );
    }

    #[test]
    fn test_error_pdus() {
        assert_eq!(
            decode_response(&encode_error(4, SERVICE_WRITE_PROPERTY, 2, 40)).unwrap(),
            Response::Error { invoke_id: 4, service: SERVICE_WRITE_PROPERTY, class: 2, code: 40 }
        );
        assert_eq!(
            decode_response(&encode_reject(4, 9)).unwrap(),
            Response::Reject { invoke_id: 4, reason: 9 }
        );
        assert_eq!(
            decode_response(&encode_abort(4, 4)).unwrap(),
            Response::Abort { invoke_id: 4, reason: 4 }
        );
    }

    #[test]
    fn test_routed_npdu_is_skipped() {
        // NPDU with DNET 5 (1-byte MAC) and a hop count.
        let mut frame = vec![0x81, 0x0A, 0x00, 0x00, 0x01, 0x24, 0x00, 0x05, 0x01, 0x42, 0xFF];
        frame.extend_from_slice(&encode_simple_ack(1, SERVICE_WRITE_PROPERTY));
        let len = frame.len() as u16;
        frame[2..4].copy_from_slice(&len.to_be_bytes());
        assert_eq!(decode_frame(&frame).unwrap(), &[0x20, 0x01, 0x0F]);
    }

    #[test]
    fn test_truncated_frames_are_protocol_errors() {
        assert!(matches!(decode_frame(&[0x81]), Err(TransportError::Protocol(_))));
        assert!(matches!(decode_response(&[0x30, 0x01]), Err(TransportError::Protocol(_))));
        let network_message = [0x81, 0x0A, 0x00, 0x07, 0x01, 0x80, 0x00];
        assert!(matches!(decode_frame(&network_message), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_write_values_follow_object_type() {
        assert_eq!(
            ApplicationValue::for_object(BacnetObjectType::BinaryOutput, &Value::Bool(true)).unwrap(),
            ApplicationValue::Enumerated(1)
        );
        assert_eq!(
            ApplicationValue::for_object(BacnetObjectType::MultiStateValue, &Value::Int(3)).unwrap(),
            ApplicationValue::Unsigned(3)
        );
        assert_eq!(
            ApplicationValue::for_object(BacnetObjectType::AnalogValue, &Value::Int(20)).unwrap(),
            ApplicationValue::Real(20.0)
        );
        assert!(ApplicationValue::for_object(BacnetObjectType::BinaryValue, &Value::Int(2)).is_err());
        assert_eq!(ApplicationValue::Real(0.1).into_value(), Value::Float(0.1));
    }
}
