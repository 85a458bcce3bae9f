//! Framed binary decoder for kernel-side BLE management events.
//!
//! The wire format is a 6-byte little-endian header (`event_code: u16,
//! controller_idx: u16, param_len: u16`) followed by `param_len` payload
//! bytes. Parsing never blocks on I/O: [`Decoder::feed`] is handed whatever
//! bytes the transport has available and returns however many complete
//! frames that yields, buffering the remainder, via manual little-endian
//! slicing rather than a parser-combinator or `byteorder` dependency.

use std::collections::HashMap;

use crate::{error::Result, Address, Error, ErrorKind};

const HEADER_LEN: usize = 6;
const MAX_FRAME_LEN: usize = 4096;

const EV_CMD_COMPLETE: u16 = 0x0001;
const EV_CMD_STATUS: u16 = 0x0002;
const EV_DEVICE_FOUND: u16 = 0x0012;
const EV_ADV_MONITOR_DEVICE_FOUND: u16 = 0x002F;

const OP_GET_CONNECTIONS: u16 = 0x0015;
const OP_LOAD_CONN_PARAM: u16 = 0x0035;

/// A single decoded management-protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `DEVICE_FOUND` or `ADV_MONITOR_DEVICE_FOUND`.
    DeviceFound {
        /// Controller index the event pertains to.
        controller_idx: u16,
        /// Device address.
        address: Address,
        /// Address type, preserved as an opaque byte: the source's handling
        /// of this field is inconsistent across branches, so it is carried
        /// through uninterpreted rather than special-cased.
        address_type: u8,
        /// Received signal strength; `None` if the kernel reported "not available" (127).
        rssi: Option<i8>,
        /// Raw event flags.
        flags: u32,
        /// Advertisement-data payload bytes.
        ad_data: Vec<u8>,
    },
    /// `MGMT_EV_CMD_COMPLETE` or `MGMT_EV_CMD_STATUS`, for an opcode this
    /// decoder does not resolve a pending command for.
    CommandResult {
        /// Controller index the event pertains to.
        controller_idx: u16,
        /// Command opcode being completed.
        opcode: u16,
        /// Status byte.
        status: u8,
    },
}

/// Result payload delivered to a pending command's completion handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Status byte from the completion/status event.
    pub status: u8,
    /// Addresses currently connected, as reported by a `GET_CONNECTIONS`
    /// completion. Empty for completions that don't carry a connection
    /// list (e.g. `LOAD_CONN_PARAM`).
    pub connections: Vec<Address>,
}

/// Streaming decoder over a byte-oriented management-protocol transport.
///
/// On a framing error (a declared length exceeding [`MAX_FRAME_LEN`]) the
/// connection is considered lost: the internal buffer is cleared and
/// [`Decoder::feed`] returns `Err`. The connection-lost callback is the
/// caller's responsibility to invoke exactly once upon seeing that error.
#[derive(Default)]
pub struct Decoder {
    buffer: Vec<u8>,
    pending: HashMap<(u16, u16), tokio::sync::oneshot::Sender<CommandResult>>,
}

impl Decoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a completion handle for `(opcode, controller_idx)`. When a
    /// matching `MGMT_EV_CMD_COMPLETE`/`MGMT_EV_CMD_STATUS` frame for
    /// `GET_CONNECTIONS` or `LOAD_CONN_PARAM` arrives, the handle is
    /// resolved instead of the frame being returned from [`feed`](Self::feed).
    pub fn await_command(&mut self, opcode: u16, controller_idx: u16) -> tokio::sync::oneshot::Receiver<CommandResult> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.insert((opcode, controller_idx), tx);
        rx
    }

    /// Feeds newly received bytes into the decoder, returning every frame
    /// that could be fully decoded. Partial trailing bytes are buffered for
    /// the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < HEADER_LEN {
                break;
            }
            let event_code = u16::from_le_bytes([self.buffer[0], self.buffer[1]]);
            let controller_idx = u16::from_le_bytes([self.buffer[2], self.buffer[3]]);
            let param_len = u16::from_le_bytes([self.buffer[4], self.buffer[5]]) as usize;

            if param_len > MAX_FRAME_LEN {
                self.buffer.clear();
                return Err(Error::new(ErrorKind::ManagementProtocolFramingError));
            }

            let total_len = HEADER_LEN + param_len;
            if self.buffer.len() < total_len {
                break;
            }

            let payload = self.buffer[HEADER_LEN..total_len].to_vec();
            self.buffer.drain(..total_len);

            match self.decode_frame(event_code, controller_idx, &payload) {
                Some(frame) => frames.push(frame),
                None => continue,
            }
        }

        Ok(frames)
    }

    fn decode_frame(&mut self, event_code: u16, controller_idx: u16, payload: &[u8]) -> Option<Frame> {
        match event_code {
            EV_DEVICE_FOUND | EV_ADV_MONITOR_DEVICE_FOUND => Self::decode_device_found(controller_idx, payload),
            EV_CMD_COMPLETE | EV_CMD_STATUS => self.decode_command_result(controller_idx, payload),
            _ => {
                log::trace!("ignoring unrecognised management event {event_code:#06x}");
                None
            }
        }
    }

    /// Address bytes in a `DEVICE_FOUND` payload arrive in little-endian
    /// wire order; reverse them to form the address in the conventional
    /// big-endian MAC order.
    fn decode_device_found(controller_idx: u16, payload: &[u8]) -> Option<Frame> {
        if payload.len() < 14 {
            log::debug!("DEVICE_FOUND payload too short ({} bytes)", payload.len());
            return None;
        }
        let mut addr_bytes = [0u8; 6];
        addr_bytes.copy_from_slice(&payload[0..6]);
        addr_bytes.reverse();
        let address_type = payload[6];
        let rssi_raw = payload[7] as i8;
        let rssi = if rssi_raw == 127 { None } else { Some(rssi_raw) };
        let flags = u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]);
        let ad_data_len = u16::from_le_bytes([payload[12], payload[13]]) as usize;
        let ad_data = payload.get(14..14 + ad_data_len)?.to_vec();

        Some(Frame::DeviceFound {
            controller_idx,
            address: Address::new(addr_bytes),
            address_type,
            rssi,
            flags,
            ad_data,
        })
    }

    /// `GET_CONNECTIONS` completions carry, after the opcode and status, a
    /// 2-byte little-endian connection count followed by that many 6-byte
    /// addresses (each in the same little-endian wire order as
    /// `DEVICE_FOUND`, reversed the same way) and a trailing address-type
    /// byte per entry. Other completions (e.g. `LOAD_CONN_PARAM`) carry no
    /// connection list, so `connections` is left empty for them.
    fn decode_command_result(&mut self, controller_idx: u16, payload: &[u8]) -> Option<Frame> {
        if payload.len() < 3 {
            log::debug!("command-result payload too short ({} bytes)", payload.len());
            return None;
        }
        let opcode = u16::from_le_bytes([payload[0], payload[1]]);
        let status = payload[2];

        if matches!(opcode, OP_GET_CONNECTIONS | OP_LOAD_CONN_PARAM) {
            if let Some(tx) = self.pending.remove(&(opcode, controller_idx)) {
                let connections = if opcode == OP_GET_CONNECTIONS {
                    Self::decode_connection_list(&payload[3..])
                } else {
                    Vec::new()
                };
                let _ = tx.send(CommandResult { status, connections });
                return None;
            }
        }

        Some(Frame::CommandResult { controller_idx, opcode, status })
    }

    fn decode_connection_list(rest: &[u8]) -> Vec<Address> {
        if rest.len() < 2 {
            return Vec::new();
        }
        let count = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        let mut connections = Vec::with_capacity(count);
        let mut pos = 2usize;
        for _ in 0..count {
            let Some(entry) = rest.get(pos..pos + 7) else {
                log::debug!("GET_CONNECTIONS payload truncated before {count} entries decoded");
                break;
            };
            let mut addr_bytes = [0u8; 6];
            addr_bytes.copy_from_slice(&entry[0..6]);
            addr_bytes.reverse();
            connections.push(Address::new(addr_bytes));
            pos += 7; // 6 address bytes + 1 address-type byte
        }
        connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_found_frame(controller_idx: u16, wire_address: [u8; 6], rssi: i8, ad_data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&wire_address);
        payload.push(0x01); // address type
        payload.push(rssi as u8);
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&(ad_data.len() as u16).to_le_bytes());
        payload.extend_from_slice(ad_data);

        let mut frame = Vec::new();
        frame.extend_from_slice(&EV_DEVICE_FOUND.to_le_bytes());
        frame.extend_from_slice(&controller_idx.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn decodes_device_found_frame_fed_in_three_chunks() {
        // Wire order is little-endian; the decoded address is the reverse.
        let frame = device_found_frame(0, [0x01, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA], -60, &[0x02, 0x01, 0x06]);
        let (a, rest) = frame.split_at(3);
        let (b, c) = rest.split_at(rest.len() / 2);

        let mut decoder = Decoder::new();
        assert!(decoder.feed(a).unwrap().is_empty());
        assert!(decoder.feed(b).unwrap().is_empty());
        let frames = decoder.feed(c).unwrap();

        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::DeviceFound { address, rssi, ad_data, .. } => {
                assert_eq!(*address, Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]));
                assert_eq!(*rssi, Some(-60));
                assert_eq!(ad_data, &[0x02, 0x01, 0x06]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn rssi_127_decodes_as_not_available() {
        let frame = device_found_frame(0, [1, 2, 3, 4, 5, 6], 127, &[]);
        let mut decoder = Decoder::new();
        let frames = decoder.feed(&frame).unwrap();
        match &frames[0] {
            Frame::DeviceFound { rssi, .. } => assert_eq!(*rssi, None),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn oversized_length_is_a_framing_error() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&EV_DEVICE_FOUND.to_le_bytes());
        frame.extend_from_slice(&0u16.to_le_bytes());
        frame.extend_from_slice(&(MAX_FRAME_LEN as u16 + 1).to_le_bytes());

        let mut decoder = Decoder::new();
        let err = decoder.feed(&frame).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ManagementProtocolFramingError);
    }

    #[tokio::test]
    async fn get_connections_completion_resolves_pending_command() {
        let mut decoder = Decoder::new();
        let rx = decoder.await_command(OP_GET_CONNECTIONS, 0);

        let mut payload = Vec::new();
        payload.extend_from_slice(&OP_GET_CONNECTIONS.to_le_bytes());
        payload.push(0x00);
        payload.extend_from_slice(&2u16.to_le_bytes()); // connection count
        payload.extend_from_slice(&[0x01, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]); // wire order
        payload.push(0x00); // address type
        payload.extend_from_slice(&[0x02, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        payload.push(0x00);

        let mut frame = Vec::new();
        frame.extend_from_slice(&EV_CMD_COMPLETE.to_le_bytes());
        frame.extend_from_slice(&0u16.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&payload);

        let frames = decoder.feed(&frame).unwrap();
        assert!(frames.is_empty());
        let result = rx.await.unwrap();
        assert_eq!(result.status, 0x00);
        assert_eq!(
            result.connections,
            vec![Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]), Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02])]
        );
    }

    #[test]
    fn decode_is_left_inverse_of_encode_for_well_formed_frames() {
        let frames_in = vec![
            device_found_frame(0, [1, 2, 3, 4, 5, 6], -70, &[0x02, 0x01, 0x06]),
            device_found_frame(1, [6, 5, 4, 3, 2, 1], -40, &[]),
        ];
        let mut bytes = Vec::new();
        for f in &frames_in {
            bytes.extend_from_slice(f);
        }
        let mut decoder = Decoder::new();
        let decoded = decoder.feed(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
    }
}
