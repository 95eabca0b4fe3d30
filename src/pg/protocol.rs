//! PostgreSQL v3 wire protocol encoding and decoding.
//!
//! Frontend frames are written into the driver's shared output buffer;
//! backend frames are decoded out of the accumulated input buffer. Framing is
//! one type byte plus a big-endian i32 length that includes itself.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::pg::types::{Oid, Value};

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 3 << 16;

/// Parameter/result format codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (client -> server) frames
// ============================================================================

/// Write one tagged frame, back-patching the length field.
fn write_frame(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_at = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - len_at) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup packet. The only frame without a type byte.
pub fn write_startup(buf: &mut BytesMut, params: &[(String, String)]) {
    let len_at = buf.len();
    buf.put_i32(0);
    buf.put_i32(PROTOCOL_VERSION);
    for (key, value) in params {
        put_cstr(buf, key);
        put_cstr(buf, value);
    }
    buf.put_u8(0);
    let len = (buf.len() - len_at) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

/// PasswordMessage ('p'), for cleartext and MD5 responses.
pub fn write_password(buf: &mut BytesMut, password: &str) {
    write_frame(buf, b'p', |b| put_cstr(b, password));
}

/// SASLInitialResponse ('p').
pub fn write_sasl_initial(buf: &mut BytesMut, mechanism: &str, data: &[u8]) {
    write_frame(buf, b'p', |b| {
        put_cstr(b, mechanism);
        b.put_i32(data.len() as i32);
        b.put_slice(data);
    });
}

/// SASLResponse ('p').
pub fn write_sasl_response(buf: &mut BytesMut, data: &[u8]) {
    write_frame(buf, b'p', |b| b.put_slice(data));
}

/// Simple Query ('Q').
pub fn write_query(buf: &mut BytesMut, query: &str) {
    write_frame(buf, b'Q', |b| put_cstr(b, query));
}

/// Parse ('P'): create a prepared statement (empty name = unnamed).
pub fn write_parse(buf: &mut BytesMut, name: &str, query: &str, param_types: &[Oid]) {
    write_frame(buf, b'P', |b| {
        put_cstr(b, name);
        put_cstr(b, query);
        b.put_i16(param_types.len() as i16);
        for oid in param_types {
            b.put_i32(oid.as_i32());
        }
    });
}

/// Bind ('B'): bind parameters to a statement. Binary format both ways.
pub fn write_bind(buf: &mut BytesMut, statement: &str, params: &[Value]) {
    write_frame(buf, b'B', |b| {
        put_cstr(b, ""); // unnamed portal
        put_cstr(b, statement);
        b.put_i16(params.len() as i16);
        for _ in params {
            b.put_i16(Format::Binary as i16);
        }
        b.put_i16(params.len() as i16);
        for param in params {
            if param.is_null() {
                b.put_i32(-1);
            } else {
                let encoded = param.encode_binary();
                b.put_i32(encoded.len() as i32);
                b.put_slice(&encoded);
            }
        }
        b.put_i16(1);
        b.put_i16(Format::Binary as i16);
    });
}

/// Describe ('D') the unnamed portal, so every execution carries its own
/// RowDescription.
pub fn write_describe_portal(buf: &mut BytesMut) {
    write_frame(buf, b'D', |b| {
        b.put_u8(b'P');
        put_cstr(b, "");
    });
}

/// Execute ('E') the unnamed portal without a row limit.
pub fn write_execute(buf: &mut BytesMut) {
    write_frame(buf, b'E', |b| {
        put_cstr(b, "");
        b.put_i32(0);
    });
}

/// Sync ('S'): end of an implicit transaction / pipeline sync point.
pub fn write_sync(buf: &mut BytesMut) {
    write_frame(buf, b'S', |_| {});
}

/// Flush ('H'): ask the server to flush its output buffer.
pub fn write_flush(buf: &mut BytesMut) {
    write_frame(buf, b'H', |_| {});
}

/// Terminate ('X').
pub fn write_terminate(buf: &mut BytesMut) {
    write_frame(buf, b'X', |_| {});
}

// ============================================================================
// Backend (server -> client) frames
// ============================================================================

/// One column of a RowDescription.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password {
        salt: [u8; 4],
    },
    AuthenticationSasl {
        mechanisms: Vec<String>,
    },
    AuthenticationSaslContinue {
        data: Bytes,
    },
    AuthenticationSaslFinal {
        data: Bytes,
    },

    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        type_oids: Vec<Oid>,
    },
}

impl BackendMessage {
    /// Decode the next complete frame out of `buf`, or `None` if more bytes
    /// are needed. Consumes exactly one frame on success.
    pub fn decode_next(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 {
            return Err(Error::Protocol(format!("bad frame length {}", len)));
        }
        let len = len as usize;
        if buf.len() < 1 + len {
            return Ok(None);
        }

        let frame = buf.split_to(1 + len);
        let tag = frame[0];
        let mut body = Bytes::from(frame).slice(5..);

        let message = match tag {
            b'R' => Self::decode_auth(&mut body)?,
            b'T' => Self::decode_row_description(&mut body)?,
            b'D' => Self::decode_data_row(&mut body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: read_cstring(&mut body)?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::from(read_u8(&mut body)?),
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: read_tagged_fields(body)?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: read_tagged_fields(body)?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: read_cstring(&mut body)?,
                value: read_cstring(&mut body)?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: read_i32(&mut body)?,
                secret_key: read_i32(&mut body)?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => Self::decode_parameter_description(&mut body)?,
            b'A' => BackendMessage::NotificationResponse {
                process_id: read_i32(&mut body)?,
                channel: read_cstring(&mut body)?,
                payload: read_cstring(&mut body)?,
            },
            other => {
                return Err(Error::Protocol(format!(
                    "unknown backend message type: {}",
                    other as char
                )));
            }
        };
        Ok(Some(message))
    }

    fn decode_auth(body: &mut Bytes) -> Result<Self> {
        let auth_type = read_i32(body)?;
        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                if body.remaining() < 4 {
                    return Err(Error::Protocol("short MD5 salt".to_string()));
                }
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body[..4]);
                Ok(BackendMessage::AuthenticationMd5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = read_cstring(body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSasl { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSaslContinue { data: body.clone() }),
            12 => Ok(BackendMessage::AuthenticationSaslFinal { data: body.clone() }),
            other => Err(Error::Protocol(format!(
                "unsupported authentication request: {}",
                other
            ))),
        }
    }

    fn decode_row_description(body: &mut Bytes) -> Result<Self> {
        let count = read_i16(body)?.max(0) as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let name = read_cstring(body)?;
            let table_oid = read_i32(body)?;
            let column_attr = read_i16(body)?;
            let type_oid = Oid::from_i32(read_i32(body)?);
            let type_size = read_i16(body)?;
            let type_modifier = read_i32(body)?;
            let format = if read_i16(body)? == 0 {
                Format::Text
            } else {
                Format::Binary
            };
            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }
        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut Bytes) -> Result<Self> {
        let count = read_i16(body)?.max(0) as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_i32(body)?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(read_bytes(body, len as usize)?));
            }
        }
        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(body: &mut Bytes) -> Result<Self> {
        let count = read_i16(body)?.max(0) as usize;
        let mut type_oids = Vec::with_capacity(count);
        for _ in 0..count {
            type_oids.push(Oid::from_i32(read_i32(body)?));
        }
        Ok(BackendMessage::ParameterDescription { type_oids })
    }
}

// Bounds-checked reads. A frame body shorter than its fields claim is a
// protocol error, never a panic.

fn short_frame() -> Error {
    Error::Protocol("truncated backend frame".to_string())
}

fn read_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(short_frame());
    }
    Ok(buf.get_u8())
}

fn read_i16(buf: &mut Bytes) -> Result<i16> {
    if buf.remaining() < 2 {
        return Err(short_frame());
    }
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(short_frame());
    }
    Ok(buf.get_i32())
}

fn read_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    if buf.remaining() < len {
        return Err(short_frame());
    }
    Ok(buf.split_to(len))
}

fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let mut end = 0;
    while end < buf.remaining() && buf[end] != 0 {
        end += 1;
    }
    if end >= buf.remaining() {
        return Err(Error::Protocol("missing null terminator".to_string()));
    }
    let s = std::str::from_utf8(&buf[..end])
        .map(str::to_owned)
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());
    buf.advance(end + 1);
    Ok(s)
}

/// Error/notice bodies: a run of (tag byte, cstring) pairs ended by a zero.
fn read_tagged_fields(mut body: Bytes) -> Result<HashMap<u8, String>> {
    let mut fields = HashMap::new();
    while body.remaining() > 0 {
        let tag = body.get_u8();
        if tag == 0 {
            break;
        }
        fields.insert(tag, read_cstring(&mut body)?);
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_frame_layout() {
        let mut buf = BytesMut::new();
        write_startup(&mut buf, &[("user".to_string(), "alice".to_string())]);

        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len());
        let version = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(buf[buf.len() - 1], 0, "terminator byte");
    }

    #[test]
    fn test_query_frame_layout() {
        let mut buf = BytesMut::new();
        write_query(&mut buf, "SELECT 1");

        assert_eq!(buf[0], b'Q');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        // 4 (length) + 8 (query) + 1 (terminator)
        assert_eq!(len, 13);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn test_sync_and_terminate_are_five_bytes() {
        let mut buf = BytesMut::new();
        write_sync(&mut buf);
        assert_eq!(&buf[..], &[b'S', 0, 0, 0, 4]);

        let mut buf = BytesMut::new();
        write_terminate(&mut buf);
        assert_eq!(&buf[..], &[b'X', 0, 0, 0, 4]);
    }

    #[test]
    fn test_bind_encodes_null_as_negative_length() {
        let mut buf = BytesMut::new();
        write_bind(&mut buf, "s1", &[Value::Null]);
        assert_eq!(buf[0], b'B');
        let needle = (-1i32).to_be_bytes();
        assert!(buf.windows(4).any(|w| w == needle));
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_i32(13);
        buf.put_slice(b"SELEC"); // truncated body

        assert!(matches!(BackendMessage::decode_next(&mut buf), Ok(None)));

        buf.put_slice(b"T 1\0");
        match BackendMessage::decode_next(&mut buf).unwrap() {
            Some(BackendMessage::CommandComplete { tag }) => assert_eq!(tag, "SELECT 1"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_notification() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'A');
        let body = b"\x00\x00\x30\x39updates\0hello\0";
        buf.put_i32(4 + body.len() as i32);
        buf.put_slice(body);

        match BackendMessage::decode_next(&mut buf).unwrap() {
            Some(BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            }) => {
                assert_eq!(process_id, 12345);
                assert_eq!(channel, "updates");
                assert_eq!(payload, "hello");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_negative_frame_length_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_i32(-1);

        assert!(matches!(
            BackendMessage::decode_next(&mut buf),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_frame_body_shorter_than_fields_is_a_protocol_error() {
        // ReadyForQuery with no status byte.
        let mut buf = BytesMut::new();
        buf.put_u8(b'Z');
        buf.put_i32(4);

        assert!(matches!(
            BackendMessage::decode_next(&mut buf),
            Err(Error::Protocol(_))
        ));

        // BackendKeyData missing the secret key.
        let mut buf = BytesMut::new();
        buf.put_u8(b'K');
        buf.put_i32(8);
        buf.put_i32(4242);

        assert!(matches!(
            BackendMessage::decode_next(&mut buf),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_data_row_cell_overrunning_frame_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_i32(4 + 2 + 4 + 2);
        buf.put_i16(1); // one cell
        buf.put_i32(100); // claiming far more bytes than the frame holds
        buf.put_slice(b"ab");

        assert!(matches!(
            BackendMessage::decode_next(&mut buf),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_error_fields() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'E');
        let body = b"SERROR\0C42601\0Msyntax error\0\0";
        buf.put_i32(4 + body.len() as i32);
        buf.put_slice(body);

        match BackendMessage::decode_next(&mut buf).unwrap() {
            Some(BackendMessage::ErrorResponse { fields }) => {
                assert_eq!(fields.get(&b'S').unwrap(), "ERROR");
                assert_eq!(fields.get(&b'C').unwrap(), "42601");
                assert_eq!(fields.get(&b'M').unwrap(), "syntax error");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
