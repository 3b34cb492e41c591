use tokio_util::bytes::{Buf, BufMut as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Function code for "read holding registers".
const READ_HOLDINGS: u8 = 0x03;
/// Function code for "write single register".
const WRITE_HOLDING: u8 = 0x06;
/// MBAP header: transaction, protocol and length fields.
const HEADER_LEN: usize = 6;

/// Largest number of registers a single read holding registers request may ask for.
pub const MAX_READ_COUNT: u16 = 125;
pub const SERVER_BUSY: u8 = 0x06;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHolding { address: u16, value: u16 },
}

#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::Exception(c) => Some(*c),
            ResponseKind::GetHoldings { values: _ } => None,
            ResponseKind::SetHolding { .. } => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception_code() == Some(SERVER_BUSY)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    Exception(u8),
    GetHoldings { values: Vec<u16> },
    SetHolding { address: u16, value: u16 },
}

#[derive(Default)]
pub struct ModbusTcpCodec {}

impl Encoder<Request> for ModbusTcpCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (function, address, argument) = match req.operation {
            Operation::GetHoldings { address, count } => (READ_HOLDINGS, address, count),
            Operation::SetHolding { address, value } => (WRITE_HOLDING, address, value),
        };
        dst.reserve(HEADER_LEN + 6);
        dst.put_u16(req.transaction_id);
        dst.put_u16(0);
        // unit id, function code, address and argument
        dst.put_u16(6);
        dst.put_u8(req.unit_id);
        dst.put_u8(function);
        dst.put_u16(address);
        dst.put_u16(argument);
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTcpCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some((header, remainder)) = src.split_first_chunk::<HEADER_LEN>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let protocol = u16::from_be_bytes([header[2], header[3]]);
            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            if protocol != 0 || length < 3 {
                // Not a frame boundary; resynchronize one byte at a time.
                src.advance(1);
                continue;
            }
            let Some(data) = remainder.get(..length) else {
                let missing = length - remainder.len();
                src.reserve(missing);
                return Ok(None);
            };
            let (unit_id, function) = (data[0], data[1]);
            let kind = if function & 0x80 != 0 {
                Some(ResponseKind::Exception(data[2]))
            } else {
                match (function, &data[2..]) {
                    (READ_HOLDINGS, [byte_count, payload @ ..])
                        if usize::from(*byte_count) == payload.len() && payload.len() % 2 == 0 =>
                    {
                        let values = payload
                            .chunks_exact(2)
                            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                            .collect();
                        Some(ResponseKind::GetHoldings { values })
                    }
                    (WRITE_HOLDING, &[a0, a1, v0, v1]) => Some(ResponseKind::SetHolding {
                        address: u16::from_be_bytes([a0, a1]),
                        value: u16::from_be_bytes([v0, v1]),
                    }),
                    _ => None,
                }
            };
            src.advance(HEADER_LEN + length);
            let Some(kind) = kind else {
                trace!(message = "skipping unrecognized frame", transaction_id, function);
                continue;
            };
            return Ok(Some(Response { unit_id, transaction_id, kind }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Response> {
        let mut codec = ModbusTcpCodec::default();
        let mut buffer = BytesMut::from(bytes);
        std::iter::from_fn(|| codec.decode(&mut buffer).unwrap()).collect()
    }

    #[test]
    fn encodes_read_request() {
        let mut buffer = BytesMut::new();
        let request = Request {
            unit_id: 1,
            transaction_id: 0x0102,
            operation: Operation::GetHoldings { address: 0x4000, count: 4 },
        };
        ModbusTcpCodec::default().encode(request, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[1, 2, 0, 0, 0, 6, 1, 3, 0x40, 0x00, 0, 4]);
    }

    #[test]
    fn encodes_write_request() {
        let mut buffer = BytesMut::new();
        let request = Request {
            unit_id: 1,
            transaction_id: 7,
            operation: Operation::SetHolding { address: 0x3647, value: 3 },
        };
        ModbusTcpCodec::default().encode(request, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0, 7, 0, 0, 0, 6, 1, 6, 0x36, 0x47, 0, 3]);
    }

    #[test]
    fn decodes_read_response_and_exception() {
        let responses = decode_all(&[
            0, 1, 0, 0, 0, 7, 1, 3, 4, 0x07, 0xE5, 0xFF, 0x38, // holdings
            0, 2, 0, 0, 0, 3, 1, 0x83, 2, // illegal data address
        ]);
        assert_eq!(
            responses,
            [
                Response {
                    unit_id: 1,
                    transaction_id: 1,
                    kind: ResponseKind::GetHoldings { values: vec![0x07E5, 0xFF38] },
                },
                Response { unit_id: 1, transaction_id: 2, kind: ResponseKind::Exception(2) },
            ]
        );
        assert_eq!(responses[1].exception_code(), Some(2));
        assert!(!responses[1].is_server_busy());
    }

    #[test]
    fn waits_for_complete_frames() {
        let mut codec = ModbusTcpCodec::default();
        let mut buffer = BytesMut::from(&[0u8, 9, 0, 0, 0, 6, 1, 6, 0x36][..]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        buffer.extend_from_slice(&[0x47, 0, 3]);
        let response = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(response.kind, ResponseKind::SetHolding { address: 0x3647, value: 3 });
        assert!(buffer.is_empty());
    }

    #[test]
    fn resynchronizes_after_garbage() {
        let responses = decode_all(&[0xFF, 0, 3, 0, 0, 0, 3, 1, 0x86, 6]);
        assert_eq!(responses.len(), 1);
        assert!(responses[0].is_server_busy());
    }
}
