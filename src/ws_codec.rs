// src/ws_codec.rs
use crate::buffer::Buffer;
use crate::message::{WebSocketFrame, WsOpcode};
use log::warn;

/// RFC 6455 frame codec. Like [`HttpCodec`](crate::http_codec::HttpCodec),
/// it is stateless: incomplete frames stay buffered.
pub struct WebSocketCodec;

impl WebSocketCodec {
    /// Decode every complete frame currently buffered. Payloads come out
    /// unmasked. A frame with a reserved opcode or an illegal length drains
    /// the buffer: the stream is unrecoverable past that point.
    pub fn decode(buf: &mut Buffer) -> Vec<WebSocketFrame> {
        let mut frames = Vec::new();

        loop {
            let data = buf.peek();
            if data.len() < 2 {
                break;
            }

            let fin = data[0] & 0x80 != 0;
            let opcode = match WsOpcode::from_u8(data[0] & 0x0F) {
                Some(op) => op,
                None => {
                    warn!("reserved websocket opcode {:#x}, dropping buffer", data[0] & 0x0F);
                    buf.retrieve_all();
                    break;
                }
            };
            let masked = data[1] & 0x80 != 0;
            let len7 = (data[1] & 0x7F) as usize;

            // Header size depends on the length field and mask flag.
            let (payload_len, mut offset) = match len7 {
                126 => {
                    if data.len() < 4 {
                        break;
                    }
                    (u16::from_be_bytes([data[2], data[3]]) as usize, 4)
                }
                127 => {
                    if data.len() < 10 {
                        break;
                    }
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&data[2..10]);
                    let raw_len = u64::from_be_bytes(raw);
                    // RFC 6455: the most significant bit must be 0.
                    if raw_len & (1 << 63) != 0 {
                        warn!("websocket length has the reserved bit set, dropping buffer");
                        buf.retrieve_all();
                        break;
                    }
                    let Ok(len) = usize::try_from(raw_len) else {
                        warn!("websocket payload length {} not addressable, dropping buffer", raw_len);
                        buf.retrieve_all();
                        break;
                    };
                    (len, 10)
                }
                n => (n, 2),
            };

            let mut masking_key = [0u8; 4];
            if masked {
                if data.len() < offset + 4 {
                    break;
                }
                masking_key.copy_from_slice(&data[offset..offset + 4]);
                offset += 4;
            }

            let frame_end = match offset.checked_add(payload_len) {
                Some(end) => end,
                None => {
                    warn!("websocket frame length overflows, dropping buffer");
                    buf.retrieve_all();
                    break;
                }
            };
            if data.len() < frame_end {
                break;
            }

            let mut payload = data[offset..frame_end].to_vec();
            if masked {
                for (i, byte) in payload.iter_mut().enumerate() {
                    *byte ^= masking_key[i % 4];
                }
            }

            buf.retrieve(frame_end);
            frames.push(WebSocketFrame {
                fin,
                opcode,
                masked,
                masking_key,
                payload,
            });
        }

        frames
    }

    /// Serialize a frame, masking only when the frame says so. Frames built
    /// with the [`WebSocketFrame`] constructors are unmasked, which is the
    /// correct server-to-client form.
    pub fn encode(frame: &WebSocketFrame) -> Vec<u8> {
        let len = frame.payload.len();
        let mut out = Vec::with_capacity(14 + len);

        let fin_bit = if frame.fin { 0x80 } else { 0x00 };
        out.push(fin_bit | frame.opcode as u8);

        let mask_bit = if frame.masked { 0x80 } else { 0x00 };
        if len < 126 {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        if frame.masked {
            out.extend_from_slice(&frame.masking_key);
            out.extend(
                frame
                    .payload
                    .iter()
                    .enumerate()
                    .map(|(i, b)| b ^ frame.masking_key[i % 4]),
            );
        } else {
            out.extend_from_slice(&frame.payload);
        }
        out
    }
}
