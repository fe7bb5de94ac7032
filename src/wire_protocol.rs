/*!
 * @file wire_protocol.rs
 * @brief MongoDB wire protocol framing: OP_MSG, legacy OP_QUERY/OP_REPLY
 */

use std::io::Cursor;

use bson::Document;

use crate::error::{FerroDBError, Result};

pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_MSG: i32 = 2013;

pub const HEADER_LEN: usize = 16;
/// Maximum accepted wire message, 48 MiB.
pub const MAX_MESSAGE_LEN: i32 = 48 * 1024 * 1024;

pub const FLAG_CHECKSUM_PRESENT: u32 = 1;
pub const FLAG_MORE_TO_COME: u32 = 1 << 1;
pub const FLAG_EXHAUST_ALLOWED: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            message_length: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            request_id: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            response_to: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            op_code: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.message_length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&self.op_code.to_le_bytes());
    }
}

/// A kind-1 document sequence: identifier plus its documents.
#[derive(Debug, Clone)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

/// Decoded OP_MSG body: flags, the single kind-0 command document, and any
/// kind-1 sequences.
#[derive(Debug, Clone)]
pub struct OpMsg {
    pub flags: u32,
    pub document: Document,
    pub sequences: Vec<DocumentSequence>,
}

impl OpMsg {
    pub fn checksum_present(&self) -> bool {
        self.flags & FLAG_CHECKSUM_PRESENT != 0
    }

    pub fn more_to_come(&self) -> bool {
        self.flags & FLAG_MORE_TO_COME != 0
    }

    pub fn exhaust_allowed(&self) -> bool {
        self.flags & FLAG_EXHAUST_ALLOWED != 0
    }
}

fn wire_err(message: impl Into<String>) -> FerroDBError {
    FerroDBError::WireProtocol(message.into())
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let pos = cursor.position() as usize;
    let buf = *cursor.get_ref();
    let byte = *buf.get(pos).ok_or_else(|| wire_err("unexpected end of message"))?;
    cursor.set_position((pos + 1) as u64);
    Ok(byte)
}

fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    let pos = cursor.position() as usize;
    let buf = *cursor.get_ref();
    let bytes = buf
        .get(pos..pos + 4)
        .ok_or_else(|| wire_err("unexpected end of message"))?;
    cursor.set_position((pos + 4) as u64);
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_cstring(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let start = cursor.position() as usize;
    let buf = *cursor.get_ref();
    let rest = buf.get(start..).ok_or_else(|| wire_err("unexpected end of message"))?;
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| wire_err("unterminated cstring"))?;
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|_| wire_err("cstring is not valid UTF-8"))?
        .to_string();
    cursor.set_position((start + nul + 1) as u64);
    Ok(s)
}

fn read_document(cursor: &mut Cursor<&[u8]>) -> Result<Document> {
    let start = cursor.position() as usize;
    let buf = *cursor.get_ref();
    let len_bytes = buf
        .get(start..start + 4)
        .ok_or_else(|| wire_err("truncated document"))?;
    let doc_len = i32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
    if doc_len < 5 {
        return Err(wire_err("invalid document length"));
    }
    let end = start
        .checked_add(doc_len as usize)
        .ok_or_else(|| wire_err("invalid document length"))?;
    let doc_bytes = buf.get(start..end).ok_or_else(|| wire_err("truncated document"))?;
    let doc = Document::from_reader(&mut Cursor::new(doc_bytes))
        .map_err(|e| wire_err(format!("invalid BSON document: {e}")))?;
    cursor.set_position(end as u64);
    Ok(doc)
}

/// Decode an OP_MSG body (everything after the 16-byte header). Exactly one
/// kind-0 section is required; kind-1 sequences are collected. The trailing
/// CRC32C is stripped when `checksumPresent` is set and not validated.
pub fn decode_op_msg(body: &[u8]) -> Result<OpMsg> {
    if body.len() < 5 {
        return Err(wire_err("OP_MSG body too short"));
    }
    let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let payload_end = if flags & FLAG_CHECKSUM_PRESENT != 0 {
        if body.len() < 4 + 4 {
            return Err(wire_err("OP_MSG too short for checksum"));
        }
        body.len() - 4
    } else {
        body.len()
    };
    let sections = &body[4..payload_end];
    let mut cursor = Cursor::new(sections);

    let mut document: Option<Document> = None;
    let mut sequences = Vec::new();
    while (cursor.position() as usize) < sections.len() {
        let kind = read_u8(&mut cursor)?;
        match kind {
            0 => {
                if document.is_some() {
                    return Err(wire_err("OP_MSG contains more than one kind-0 section"));
                }
                document = Some(read_document(&mut cursor)?);
            }
            1 => {
                let section_len = read_i32(&mut cursor)?;
                if section_len < 5 {
                    return Err(wire_err("invalid kind-1 section length"));
                }
                let section_start = cursor.position() as usize - 4;
                let section_end = section_start + section_len as usize;
                if section_end > sections.len() {
                    return Err(wire_err("truncated kind-1 section"));
                }
                let identifier = read_cstring(&mut cursor)?;
                let mut documents = Vec::new();
                while (cursor.position() as usize) < section_end {
                    documents.push(read_document(&mut cursor)?);
                }
                if cursor.position() as usize != section_end {
                    return Err(wire_err("kind-1 section length mismatch"));
                }
                sequences.push(DocumentSequence {
                    identifier,
                    documents,
                });
            }
            other => return Err(wire_err(format!("unsupported OP_MSG section kind {other}"))),
        }
    }

    let document = document.ok_or_else(|| wire_err("OP_MSG has no kind-0 section"))?;
    Ok(OpMsg {
        flags,
        document,
        sequences,
    })
}

/// Encode a single-document OP_MSG reply.
pub fn encode_op_msg(doc: &Document, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
    let doc_bytes = bson::to_vec(doc)?;
    let message_length = (HEADER_LEN + 4 + 1 + doc_bytes.len()) as i32;
    let mut out = Vec::with_capacity(message_length as usize);
    MessageHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_MSG,
    }
    .write_to(&mut out);
    out.extend_from_slice(&0u32.to_le_bytes()); // flags: never moreToCome
    out.push(0u8);
    out.extend_from_slice(&doc_bytes);
    Ok(out)
}

/// Decoded legacy OP_QUERY body.
#[derive(Debug, Clone)]
pub struct OpQuery {
    pub flags: u32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
}

pub fn decode_op_query(body: &[u8]) -> Result<OpQuery> {
    let mut cursor = Cursor::new(body);
    let flags = read_i32(&mut cursor)? as u32;
    let full_collection_name = read_cstring(&mut cursor)?;
    let number_to_skip = read_i32(&mut cursor)?;
    let number_to_return = read_i32(&mut cursor)?;
    let query = read_document(&mut cursor)?;
    // An optional returnFieldsSelector may follow; the handshake path does
    // not use it.
    Ok(OpQuery {
        flags,
        full_collection_name,
        number_to_skip,
        number_to_return,
        query,
    })
}

/// Encode a legacy OP_REPLY carrying the given documents.
pub fn encode_op_reply(docs: &[Document], request_id: i32, response_to: i32) -> Result<Vec<u8>> {
    let mut docs_buf = Vec::new();
    for doc in docs {
        docs_buf.extend_from_slice(&bson::to_vec(doc)?);
    }
    let body_len = 4 + 8 + 4 + 4 + docs_buf.len();
    let message_length = (HEADER_LEN + body_len) as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    MessageHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_REPLY,
    }
    .write_to(&mut out);
    out.extend_from_slice(&0u32.to_le_bytes()); // responseFlags
    out.extend_from_slice(&0i64.to_le_bytes()); // cursorID
    out.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
    out.extend_from_slice(&(docs.len() as i32).to_le_bytes());
    out.extend_from_slice(&docs_buf);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn header_roundtrip() {
        let header = MessageHeader {
            message_length: 1234,
            request_id: 7,
            response_to: 3,
            op_code: OP_MSG,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf);
        let parsed = MessageHeader::parse(&buf.try_into().unwrap());
        assert_eq!(parsed, header);
    }

    #[test]
    fn op_msg_roundtrip() {
        let doc = doc! { "ping": 1i32, "$db": "admin" };
        let msg = encode_op_msg(&doc, 42, 0).unwrap();
        let header = MessageHeader::parse(&msg[..HEADER_LEN].try_into().unwrap());
        assert_eq!(header.op_code, OP_MSG);
        assert_eq!(header.request_id, 42);
        assert_eq!(header.message_length as usize, msg.len());
        let parsed = decode_op_msg(&msg[HEADER_LEN..]).unwrap();
        assert_eq!(parsed.document, doc);
        assert!(parsed.sequences.is_empty());
        assert!(!parsed.more_to_come());
    }

    #[test]
    fn op_msg_with_document_sequence() {
        let command = doc! { "insert": "users", "$db": "test" };
        let d1 = doc! { "_id": 1i32 };
        let d2 = doc! { "_id": 2i32 };

        let command_bytes = bson::to_vec(&command).unwrap();
        let d1_bytes = bson::to_vec(&d1).unwrap();
        let d2_bytes = bson::to_vec(&d2).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(0u8);
        body.extend_from_slice(&command_bytes);
        body.push(1u8);
        let ident = b"documents\0";
        let section_len = 4 + ident.len() + d1_bytes.len() + d2_bytes.len();
        body.extend_from_slice(&(section_len as i32).to_le_bytes());
        body.extend_from_slice(ident);
        body.extend_from_slice(&d1_bytes);
        body.extend_from_slice(&d2_bytes);

        let parsed = decode_op_msg(&body).unwrap();
        assert_eq!(parsed.document, command);
        assert_eq!(parsed.sequences.len(), 1);
        assert_eq!(parsed.sequences[0].identifier, "documents");
        assert_eq!(parsed.sequences[0].documents, vec![d1, d2]);
    }

    #[test]
    fn op_msg_checksum_is_stripped() {
        let doc = doc! { "ping": 1i32 };
        let doc_bytes = bson::to_vec(&doc).unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(&FLAG_CHECKSUM_PRESENT.to_le_bytes());
        body.push(0u8);
        body.extend_from_slice(&doc_bytes);
        body.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let parsed = decode_op_msg(&body).unwrap();
        assert!(parsed.checksum_present());
        assert_eq!(parsed.document, doc);
    }

    #[test]
    fn op_msg_without_body_section_is_rejected() {
        let body = 0u32.to_le_bytes().to_vec();
        assert!(decode_op_msg(&body).is_err());
        let mut kind_only = 0u32.to_le_bytes().to_vec();
        kind_only.push(7u8);
        assert!(decode_op_msg(&kind_only).is_err());
    }

    #[test]
    fn op_query_decode() {
        let query = doc! { "isMaster": 1i32 };
        let query_bytes = bson::to_vec(&query).unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(b"admin.$cmd\0");
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(-1i32).to_le_bytes());
        body.extend_from_slice(&query_bytes);

        let parsed = decode_op_query(&body).unwrap();
        assert_eq!(parsed.full_collection_name, "admin.$cmd");
        assert_eq!(parsed.number_to_return, -1);
        assert_eq!(parsed.query, query);
    }

    #[test]
    fn op_reply_layout() {
        let docs = vec![doc! { "ok": 1.0 }];
        let reply = encode_op_reply(&docs, 9, 5).unwrap();
        let header = MessageHeader::parse(&reply[..HEADER_LEN].try_into().unwrap());
        assert_eq!(header.op_code, OP_REPLY);
        assert_eq!(header.response_to, 5);
        assert_eq!(header.message_length as usize, reply.len());
        let number_returned =
            i32::from_le_bytes([reply[32], reply[33], reply[34], reply[35]]);
        assert_eq!(number_returned, 1);
    }
}
