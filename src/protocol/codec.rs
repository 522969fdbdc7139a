//! Frame codec
//!
//! Encoding and decoding of request and response payloads. Every length
//! field is validated against the remaining payload before any value
//! allocation, so a hostile frame cannot force an oversized allocation.

use super::{
    Opcode, ProtocolError, ProtocolResult, Request, Response, Status, ABSENT_VALUE_LEN, HEADER_LEN,
};

/// Cursor over a request or response payload with bounds-checked reads.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u16(&mut self) -> ProtocolResult<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::Malformed(
                "truncated u16 field".to_string(),
            ));
        }
        let value = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> ProtocolResult<u32> {
        if self.remaining() < 4 {
            return Err(ProtocolError::Malformed(
                "truncated u32 field".to_string(),
            ));
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Read `len` bytes. The bound check happens before the copy.
    fn read_bytes(&mut self, len: usize) -> ProtocolResult<Vec<u8>> {
        if self.remaining() < len {
            return Err(ProtocolError::Malformed(format!(
                "declared length {} exceeds remaining {} bytes",
                len,
                self.remaining()
            )));
        }
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    fn read_key(&mut self) -> ProtocolResult<Vec<u8>> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    fn read_value(&mut self) -> ProtocolResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    fn read_name(&mut self) -> ProtocolResult<String> {
        let bytes = self.read_key()?;
        String::from_utf8(bytes)
            .map_err(|_| ProtocolError::Malformed("queue name is not UTF-8".to_string()))
    }

    /// Guard a declared item count against the bytes actually present.
    fn check_count(&self, count: usize, min_item_len: usize) -> ProtocolResult<()> {
        if count.saturating_mul(min_item_len) > self.remaining() {
            return Err(ProtocolError::Malformed(format!(
                "count {} cannot fit in {} remaining bytes",
                count,
                self.remaining()
            )));
        }
        Ok(())
    }

    fn finish(&self) -> ProtocolResult<()> {
        if self.remaining() != 0 {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes after payload",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Frame builder mirroring the reader.
struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    /// Start a frame with its 5-byte header; the length is patched in
    /// `finish`.
    fn new(type_byte: u8) -> Self {
        let mut buf = Vec::with_capacity(HEADER_LEN + 64);
        buf.push(type_byte);
        buf.extend_from_slice(&[0u8; 4]);
        Self { buf }
    }

    fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_key(&mut self, key: &[u8]) {
        self.write_u16(key.len() as u16);
        self.buf.extend_from_slice(key);
    }

    fn write_value(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    fn finish(mut self) -> Vec<u8> {
        let payload_len = (self.buf.len() - HEADER_LEN) as u32;
        self.buf[1..HEADER_LEN].copy_from_slice(&payload_len.to_be_bytes());
        self.buf
    }
}

/// Encode a request into a complete frame.
pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut w = PayloadWriter::new(request.opcode() as u8);
    match request {
        Request::Set { key, value } => {
            w.write_key(key);
            w.write_value(value);
        }
        Request::Get { key }
        | Request::Delete { key }
        | Request::Exists { key }
        | Request::Incr { key }
        | Request::Decr { key } => {
            w.write_key(key);
        }
        Request::SetMany { pairs } => {
            w.write_u16(pairs.len() as u16);
            for (key, value) in pairs {
                w.write_key(key);
                w.write_value(value);
            }
        }
        Request::GetMany { keys } | Request::DeleteMany { keys } => {
            w.write_u16(keys.len() as u16);
            for key in keys {
                w.write_key(key);
            }
        }
        Request::QueuePush { name, value } => {
            w.write_key(name.as_bytes());
            w.write_value(value);
        }
        Request::QueuePop { name }
        | Request::QueuePeek { name }
        | Request::QueueLen { name }
        | Request::QueueClear { name } => {
            w.write_key(name.as_bytes());
        }
    }
    w.finish()
}

/// Decode a request payload for a given opcode byte.
pub fn decode_request(opcode: u8, payload: &[u8]) -> ProtocolResult<Request> {
    let opcode = Opcode::from_u8(opcode)?;
    let mut r = PayloadReader::new(payload);
    let request = match opcode {
        Opcode::Set => Request::Set {
            key: r.read_key()?,
            value: r.read_value()?,
        },
        Opcode::Get => Request::Get { key: r.read_key()? },
        Opcode::Delete => Request::Delete { key: r.read_key()? },
        Opcode::Exists => Request::Exists { key: r.read_key()? },
        Opcode::Incr => Request::Incr { key: r.read_key()? },
        Opcode::Decr => Request::Decr { key: r.read_key()? },
        Opcode::SetMany => {
            let count = r.read_u16()? as usize;
            // Each pair is at least a 2-byte key header + 4-byte value header.
            r.check_count(count, 6)?;
            let mut pairs = Vec::with_capacity(count);
            for _ in 0..count {
                let key = r.read_key()?;
                let value = r.read_value()?;
                pairs.push((key, value));
            }
            Request::SetMany { pairs }
        }
        Opcode::GetMany => Request::GetMany {
            keys: decode_key_list(&mut r)?,
        },
        Opcode::DeleteMany => Request::DeleteMany {
            keys: decode_key_list(&mut r)?,
        },
        Opcode::QueuePush => Request::QueuePush {
            name: r.read_name()?,
            value: r.read_value()?,
        },
        Opcode::QueuePop => Request::QueuePop { name: r.read_name()? },
        Opcode::QueuePeek => Request::QueuePeek { name: r.read_name()? },
        Opcode::QueueLen => Request::QueueLen { name: r.read_name()? },
        Opcode::QueueClear => Request::QueueClear { name: r.read_name()? },
    };
    r.finish()?;
    Ok(request)
}

fn decode_key_list(r: &mut PayloadReader<'_>) -> ProtocolResult<Vec<Vec<u8>>> {
    let count = r.read_u16()? as usize;
    r.check_count(count, 2)?;
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        keys.push(r.read_key()?);
    }
    Ok(keys)
}

/// Encode a response into a complete frame.
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut w = PayloadWriter::new(response.status() as u8);
    match response {
        Response::Ok(payload) => {
            w.buf.extend_from_slice(payload);
        }
        Response::NotFound => {}
        Response::Error(message) => {
            w.buf.extend_from_slice(message.as_bytes());
        }
        Response::Multi(values) => {
            w.write_u16(values.len() as u16);
            for value in values {
                match value {
                    Some(bytes) => w.write_value(bytes),
                    None => w.write_u32(ABSENT_VALUE_LEN),
                }
            }
        }
    }
    w.finish()
}

/// Decode a response payload for a given status byte.
pub fn decode_response(status: u8, payload: &[u8]) -> ProtocolResult<Response> {
    let status = Status::from_u8(status)?;
    match status {
        Status::Ok => Ok(Response::Ok(payload.to_vec())),
        Status::NotFound => Ok(Response::NotFound),
        Status::Error => Ok(Response::Error(
            String::from_utf8_lossy(payload).into_owned(),
        )),
        Status::Multi => {
            let mut r = PayloadReader::new(payload);
            let count = r.read_u16()? as usize;
            r.check_count(count, 4)?;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                let len = r.read_u32()?;
                if len == ABSENT_VALUE_LEN {
                    values.push(None);
                } else {
                    values.push(Some(r.read_bytes(len as usize)?));
                }
            }
            r.finish()?;
            Ok(Response::Multi(values))
        }
    }
}

/// Split a complete frame into its type byte and payload.
///
/// Used by tests and by client code that has already buffered a whole
/// frame; the server reads the header and payload separately.
pub fn split_frame(frame: &[u8]) -> ProtocolResult<(u8, &[u8])> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::Malformed("frame shorter than header".to_string()));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&frame[1..HEADER_LEN]);
    let declared = u32::from_be_bytes(len_bytes) as usize;
    let payload = &frame[HEADER_LEN..];
    if declared != payload.len() {
        return Err(ProtocolError::Malformed(format!(
            "declared payload length {} but {} bytes present",
            declared,
            payload.len()
        )));
    }
    Ok((frame[0], payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(request: Request) {
        let frame = encode_request(&request);
        let (opcode, payload) = split_frame(&frame).unwrap();
        assert_eq!(decode_request(opcode, payload).unwrap(), request);
    }

    #[test]
    fn test_request_roundtrip_every_opcode() {
        roundtrip(Request::Set {
            key: b"alpha".to_vec(),
            value: "value-\u{3b1}".as_bytes().to_vec(),
        });
        roundtrip(Request::Get { key: b"k".to_vec() });
        roundtrip(Request::Delete { key: b"k".to_vec() });
        roundtrip(Request::Exists { key: b"k".to_vec() });
        roundtrip(Request::Incr { key: b"counter".to_vec() });
        roundtrip(Request::Decr { key: b"counter".to_vec() });
        roundtrip(Request::SetMany {
            pairs: vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), Vec::new()),
            ],
        });
        roundtrip(Request::GetMany {
            keys: vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
        });
        roundtrip(Request::DeleteMany { keys: vec![b"a".to_vec()] });
        roundtrip(Request::QueuePush {
            name: "tasks".to_string(),
            value: b"payload".to_vec(),
        });
        roundtrip(Request::QueuePop { name: "tasks".to_string() });
        roundtrip(Request::QueuePeek { name: "tasks".to_string() });
        roundtrip(Request::QueueLen { name: "tasks".to_string() });
        roundtrip(Request::QueueClear { name: "tasks".to_string() });
    }

    #[test]
    fn test_response_roundtrip() {
        for response in [
            Response::Ok(Vec::new()),
            Response::Ok(b"value".to_vec()),
            Response::NotFound,
            Response::Error("queue is empty".to_string()),
            Response::Multi(vec![Some(b"a".to_vec()), None, Some(Vec::new())]),
        ] {
            let frame = encode_response(&response);
            let (status, payload) = split_frame(&frame).unwrap();
            assert_eq!(decode_response(status, payload).unwrap(), response);
        }
    }

    #[test]
    fn test_set_frame_layout_is_bit_exact() {
        let frame = encode_request(&Request::Set {
            key: b"ab".to_vec(),
            value: b"xyz".to_vec(),
        });
        assert_eq!(
            frame,
            vec![
                0x01, // opcode
                0x00, 0x00, 0x00, 0x09, // payload length
                0x00, 0x02, b'a', b'b', // key
                0x00, 0x00, 0x00, 0x03, b'x', b'y', b'z', // value
            ]
        );
    }

    #[test]
    fn test_multi_absent_marker() {
        let frame = encode_response(&Response::Multi(vec![None]));
        assert_eq!(
            &frame[HEADER_LEN..],
            &[0x00, 0x01, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_truncated_key_rejected() {
        // Declares a 5-byte key but provides 2 bytes.
        let payload = [0x00, 0x05, b'a', b'b'];
        assert!(matches!(
            decode_request(0x02, &payload),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_value_rejected() {
        let mut payload = vec![0x00, 0x01, b'k'];
        payload.extend_from_slice(&100u32.to_be_bytes());
        payload.extend_from_slice(b"short");
        assert!(matches!(
            decode_request(0x01, &payload),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_oversized_count_rejected() {
        // 1000 keys declared, zero bytes of keys present.
        let payload = 1000u16.to_be_bytes();
        assert!(matches!(
            decode_request(0x11, &payload),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert!(matches!(
            decode_request(0x7f, &[]),
            Err(ProtocolError::UnknownOpcode(0x7f))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = encode_request(&Request::Get { key: b"k".to_vec() });
        // Append garbage and fix up the declared length.
        frame.push(0xaa);
        let len = (frame.len() - HEADER_LEN) as u32;
        frame[1..HEADER_LEN].copy_from_slice(&len.to_be_bytes());
        let (opcode, payload) = split_frame(&frame).unwrap();
        assert!(matches!(
            decode_request(opcode, payload),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_multi() {
        let frame = encode_response(&Response::Multi(Vec::new()));
        let (status, payload) = split_frame(&frame).unwrap();
        assert_eq!(
            decode_response(status, payload).unwrap(),
            Response::Multi(Vec::new())
        );
    }

    proptest! {
        #[test]
        fn prop_set_roundtrip(key in proptest::collection::vec(any::<u8>(), 1..64),
                              value in proptest::collection::vec(any::<u8>(), 0..256)) {
            roundtrip(Request::Set { key, value });
        }

        #[test]
        fn prop_get_many_roundtrip(keys in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..32), 0..20)) {
            roundtrip(Request::GetMany { keys });
        }

        #[test]
        fn prop_multi_response_roundtrip(values in proptest::collection::vec(
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..64)), 0..20)) {
            let response = Response::Multi(values);
            let frame = encode_response(&response);
            let (status, payload) = split_frame(&frame).unwrap();
            prop_assert_eq!(decode_response(status, payload).unwrap(), response);
        }

        #[test]
        fn prop_decoder_never_panics_on_noise(opcode in any::<u8>(),
                                              payload in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = decode_request(opcode, &payload);
        }
    }
}
