use arraydeque::ArrayDeque;
use thiserror::Error;

use crate::LAYER_MAX;

const ETHER_HDR_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IP_MIN_HDR_LEN: usize = 20;
const IPPROTO_UDP: u8 = 17;
const UDP_HDR_LEN: usize = 8;

/// Protocol tag of a decoded layer. `Data` terminates every chain, either as
/// a recognized protocol's payload or as bytes we do not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Data,
    Ether,
    Ip,
    Udp,
}

/// One parsed header's view into the captured frame.
#[derive(Debug)]
pub struct Layer<'a> {
    pub protocol: Protocol,
    pub data: &'a [u8],
}

/// An ordered stack of decoded layers borrowing the captured frame's bytes.
/// Adjacent layers are contiguous and never overlap. The frame must not be
/// retained past the handler call that delivered it.
#[derive(Debug)]
pub struct Frame<'a> {
    layers: ArrayDeque<[Layer<'a>; LAYER_MAX]>,
}

impl<'a> Frame<'a> {
    fn new() -> Frame<'a> {
        Frame {
            layers: ArrayDeque::new(),
        }
    }

    pub fn layer(&self, index: usize) -> Option<&Layer<'a>> {
        self.layers.get(index)
    }

    pub fn layers<'s>(&'s self) -> impl Iterator<Item = &'s Layer<'a>> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn push(&mut self, protocol: Protocol, data: &'a [u8]) -> Result<(), DecodeError> {
        self.layers
            .push_back(Layer { protocol, data })
            .map_err(|_| DecodeError::DepthExceeded)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {0:?} header")]
    Truncated(Protocol),
    #[error("malformed {0:?} header")]
    BadHeader(Protocol),
    #[error("declared length does not match captured bytes")]
    LengthMismatch,
    #[error("encapsulation depth exceeds layer capacity")]
    DepthExceeded,
}

/// Decode `data` into a layer stack, starting from the link-layer protocol
/// detected for the capturing interface.
///
/// Every layer is a subslice of `data`; no parse step reads outside it. On a
/// bounds violation or an internally inconsistent length field the chain
/// stops at the last valid boundary and the error is reported instead of a
/// partial frame.
pub fn decode(data: &[u8], link: Protocol) -> Result<Frame<'_>, DecodeError> {
    let mut frame = Frame::new();
    let mut cursor = 0;
    let mut protocol = link;

    loop {
        let rest = &data[cursor..];
        match protocol {
            Protocol::Ether => {
                if rest.len() < ETHER_HDR_LEN {
                    return Err(DecodeError::Truncated(Protocol::Ether));
                }
                let ether_type = u16::from_be_bytes([rest[12], rest[13]]);
                frame.push(Protocol::Ether, &rest[..ETHER_HDR_LEN])?;
                cursor += ETHER_HDR_LEN;
                protocol = match ether_type {
                    ETHERTYPE_IPV4 => Protocol::Ip,
                    _ => Protocol::Data,
                };
            }
            Protocol::Ip => {
                if rest.len() < IP_MIN_HDR_LEN {
                    return Err(DecodeError::Truncated(Protocol::Ip));
                }
                let header_len = ((rest[0] & 0x0f) as usize) * 4;
                if header_len < IP_MIN_HDR_LEN {
                    return Err(DecodeError::BadHeader(Protocol::Ip));
                }
                if header_len > rest.len() {
                    return Err(DecodeError::Truncated(Protocol::Ip));
                }
                let next = rest[9];
                frame.push(Protocol::Ip, &rest[..header_len])?;
                cursor += header_len;
                protocol = match next {
                    IPPROTO_UDP => Protocol::Udp,
                    _ => Protocol::Data,
                };
            }
            Protocol::Udp => {
                if rest.len() < UDP_HDR_LEN {
                    return Err(DecodeError::Truncated(Protocol::Udp));
                }
                // The kernel delimits one captured datagram per frame, so the
                // declared UDP length must cover the remainder exactly.
                let length = u16::from_be_bytes([rest[4], rest[5]]) as usize;
                if length != rest.len() {
                    return Err(DecodeError::LengthMismatch);
                }
                frame.push(Protocol::Udp, &rest[..UDP_HDR_LEN])?;
                cursor += UDP_HDR_LEN;
                protocol = Protocol::Data;
            }
            Protocol::Data => {
                frame.push(Protocol::Data, rest)?;
                return Ok(frame);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    /// Build a valid ether + ipv4 + udp frame carrying `payload`.
    pub(crate) fn ether_udp(payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; 14];
        packet[12] = 0x08;
        packet[13] = 0x00;

        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        let total = (20 + 8 + payload.len()) as u16;
        ip[2..4].copy_from_slice(&total.to_be_bytes());
        ip[9] = 17;
        packet.extend_from_slice(&ip);

        let mut udp = [0u8; 8];
        let length = (8 + payload.len()) as u16;
        udp[4..6].copy_from_slice(&length.to_be_bytes());
        packet.extend_from_slice(&udp);

        packet.extend_from_slice(payload);
        packet
    }
}
