//! KNXnet/IP frame codec.
//!
//! Covers the subset of the protocol the adapter speaks: tunneling
//! (connect / state / disconnect / tunneling request + ack) and routing
//! (routing indication), with cEMI L_Data payloads carrying group telegrams.

use crate::adapters::knx::addr::GroupAddress;
use crate::adapters::knx::dpt::GroupValue;
use crate::error::{Error, Result};

pub const HEADER_SIZE: u8 = 0x06;
pub const PROTOCOL_VERSION: u8 = 0x10;

pub const SERVICE_CONNECT_REQUEST: u16 = 0x0205;
pub const SERVICE_CONNECT_RESPONSE: u16 = 0x0206;
pub const SERVICE_CONNECTIONSTATE_REQUEST: u16 = 0x0207;
pub const SERVICE_CONNECTIONSTATE_RESPONSE: u16 = 0x0208;
pub const SERVICE_DISCONNECT_REQUEST: u16 = 0x0209;
pub const SERVICE_DISCONNECT_RESPONSE: u16 = 0x020a;
pub const SERVICE_TUNNELING_REQUEST: u16 = 0x0420;
pub const SERVICE_TUNNELING_ACK: u16 = 0x0421;
pub const SERVICE_ROUTING_INDICATION: u16 = 0x0530;

const CEMI_L_DATA_REQ: u8 = 0x11;
const CEMI_L_DATA_IND: u8 = 0x29;
const CEMI_L_DATA_CON: u8 = 0x2e;

/// A decoded group telegram (direction-agnostic).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTelegram {
    pub destination: GroupAddress,
    pub value: GroupValue,
}

/// Write the common 6-byte KNXnet/IP header for a body of known length.
fn header(service: u16, body_len: usize) -> Vec<u8> {
    let total = (body_len + 6) as u16;
    let mut out = Vec::with_capacity(body_len + 6);
    out.push(HEADER_SIZE);
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&service.to_be_bytes());
    out.extend_from_slice(&total.to_be_bytes());
    out
}

/// HPAI (host protocol address information) for UDP/IPv4.
fn hpai(addr: std::net::SocketAddrV4) -> [u8; 8] {
    let ip = addr.ip().octets();
    let port = addr.port().to_be_bytes();
    [0x08, 0x01, ip[0], ip[1], ip[2], ip[3], port[0], port[1]]
}

/// cEMI L_Data frame around a raw APDU.
fn cemi_raw(msg_code: u8, destination: GroupAddress, apdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + apdu.len());
    out.push(msg_code);
    out.push(0x00); // no additional info
    out.push(0xbc); // ctrl1: standard frame, no repeat, normal priority
    out.push(0xe0); // ctrl2: group address, hop count 6
    out.extend_from_slice(&0u16.to_be_bytes()); // source: individual addr 0.0.0
    out.extend_from_slice(&destination.to_u16().to_be_bytes());
    out.push((apdu.len() - 1) as u8); // NPDU length excludes the TPCI octet
    out.extend_from_slice(apdu);
    out
}

/// cEMI L_Data frame for a group write telegram.
fn cemi(msg_code: u8, telegram: &GroupTelegram) -> Vec<u8> {
    cemi_raw(msg_code, telegram.destination, &telegram.value.encode_apdu())
}

/// APDU for a GroupValueRead (APCI 0x00, no data).
const GROUP_READ_APDU: [u8; 2] = [0x00, 0x00];

fn parse_cemi(data: &[u8]) -> Result<Option<GroupTelegram>> {
    if data.len() < 10 {
        return Err(Error::external("cEMI frame truncated"));
    }
    let msg_code = data[0];
    if msg_code != CEMI_L_DATA_IND && msg_code != CEMI_L_DATA_CON && msg_code != CEMI_L_DATA_REQ
    {
        // Not an L_Data frame (e.g. M_PropRead); nothing for us
        return Ok(None);
    }
    let add_info_len = data[1] as usize;
    let base = 2 + add_info_len;
    if data.len() < base + 8 {
        return Err(Error::external("cEMI L_Data truncated"));
    }
    let ctrl2 = data[base + 1];
    if ctrl2 & 0x80 == 0 {
        // Individually-addressed telegram, not a group telegram
        return Ok(None);
    }
    let destination =
        GroupAddress::from_u16(u16::from_be_bytes([data[base + 4], data[base + 5]]));
    let npdu_len = data[base + 6] as usize;
    let apdu = &data[base + 7..];
    if apdu.len() < npdu_len + 1 {
        return Err(Error::external("cEMI APDU truncated"));
    }
    Ok(GroupValue::decode_apdu(&apdu[..npdu_len + 1])
        .map(|value| GroupTelegram { destination, value }))
}

// =============================================================================
// Encoders
// =============================================================================

/// CONNECT_REQUEST for a link-layer tunnel.
pub fn connect_request(local: std::net::SocketAddrV4) -> Vec<u8> {
    let hp = hpai(local);
    let mut body = Vec::with_capacity(20);
    body.extend_from_slice(&hp); // control endpoint
    body.extend_from_slice(&hp); // data endpoint
    body.extend_from_slice(&[0x04, 0x04, 0x02, 0x00]); // CRI: tunnel, link layer
    let mut out = header(SERVICE_CONNECT_REQUEST, body.len());
    out.extend_from_slice(&body);
    out
}

pub fn connectionstate_request(channel: u8, local: std::net::SocketAddrV4) -> Vec<u8> {
    let mut body = vec![channel, 0x00];
    body.extend_from_slice(&hpai(local));
    let mut out = header(SERVICE_CONNECTIONSTATE_REQUEST, body.len());
    out.extend_from_slice(&body);
    out
}

pub fn disconnect_request(channel: u8, local: std::net::SocketAddrV4) -> Vec<u8> {
    let mut body = vec![channel, 0x00];
    body.extend_from_slice(&hpai(local));
    let mut out = header(SERVICE_DISCONNECT_REQUEST, body.len());
    out.extend_from_slice(&body);
    out
}

/// TUNNELING_REQUEST wrapping an outbound group write.
pub fn tunneling_request(channel: u8, seq: u8, telegram: &GroupTelegram) -> Vec<u8> {
    let cemi = cemi(CEMI_L_DATA_REQ, telegram);
    let mut body = vec![0x04, channel, seq, 0x00];
    body.extend_from_slice(&cemi);
    let mut out = header(SERVICE_TUNNELING_REQUEST, body.len());
    out.extend_from_slice(&body);
    out
}

/// TUNNELING_REQUEST carrying a GroupValueRead.
pub fn tunneling_read_request(channel: u8, seq: u8, destination: GroupAddress) -> Vec<u8> {
    let cemi = cemi_raw(CEMI_L_DATA_REQ, destination, &GROUP_READ_APDU);
    let mut body = vec![0x04, channel, seq, 0x00];
    body.extend_from_slice(&cemi);
    let mut out = header(SERVICE_TUNNELING_REQUEST, body.len());
    out.extend_from_slice(&body);
    out
}

pub fn tunneling_ack(channel: u8, seq: u8) -> Vec<u8> {
    let body = [0x04, channel, seq, 0x00];
    let mut out = header(SERVICE_TUNNELING_ACK, body.len());
    out.extend_from_slice(&body);
    out
}

/// ROUTING_INDICATION for multicast routing mode.
pub fn routing_indication(telegram: &GroupTelegram) -> Vec<u8> {
    let cemi = cemi(CEMI_L_DATA_IND, telegram);
    let mut out = header(SERVICE_ROUTING_INDICATION, cemi.len());
    out.extend_from_slice(&cemi);
    out
}

/// ROUTING_INDICATION carrying a GroupValueRead.
pub fn routing_read_indication(destination: GroupAddress) -> Vec<u8> {
    let cemi = cemi_raw(CEMI_L_DATA_IND, destination, &GROUP_READ_APDU);
    let mut out = header(SERVICE_ROUTING_INDICATION, cemi.len());
    out.extend_from_slice(&cemi);
    out
}

// =============================================================================
// Decoder
// =============================================================================

/// A decoded inbound KNXnet/IP frame, reduced to what the adapter acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    ConnectResponse {
        channel: u8,
        status: u8,
    },
    ConnectionstateResponse {
        channel: u8,
        status: u8,
    },
    DisconnectRequest {
        channel: u8,
    },
    DisconnectResponse {
        channel: u8,
    },
    /// Telegram received over a tunnel; must be acked with `seq`.
    Tunneling {
        channel: u8,
        seq: u8,
        telegram: Option<GroupTelegram>,
    },
    TunnelingAck {
        channel: u8,
        seq: u8,
        status: u8,
    },
    /// Telegram received via multicast routing.
    Routing {
        telegram: Option<GroupTelegram>,
    },
}

pub fn decode(datagram: &[u8]) -> Result<InboundFrame> {
    if datagram.len() < 6 {
        return Err(Error::external("KNXnet/IP datagram shorter than header"));
    }
    if datagram[0] != HEADER_SIZE || datagram[1] != PROTOCOL_VERSION {
        return Err(Error::external("unsupported KNXnet/IP header"));
    }
    let service = u16::from_be_bytes([datagram[2], datagram[3]]);
    let total = u16::from_be_bytes([datagram[4], datagram[5]]) as usize;
    if datagram.len() < total {
        return Err(Error::external("KNXnet/IP datagram truncated"));
    }
    let body = &datagram[6..total];

    match service {
        SERVICE_CONNECT_RESPONSE => {
            if body.len() < 2 {
                return Err(Error::external("connect response truncated"));
            }
            Ok(InboundFrame::ConnectResponse {
                channel: body[0],
                status: body[1],
            })
        }
        SERVICE_CONNECTIONSTATE_RESPONSE => {
            if body.len() < 2 {
                return Err(Error::external("connectionstate response truncated"));
            }
            Ok(InboundFrame::ConnectionstateResponse {
                channel: body[0],
                status: body[1],
            })
        }
        SERVICE_DISCONNECT_REQUEST => {
            if body.is_empty() {
                return Err(Error::external("disconnect request truncated"));
            }
            Ok(InboundFrame::DisconnectRequest { channel: body[0] })
        }
        SERVICE_DISCONNECT_RESPONSE => {
            if body.is_empty() {
                return Err(Error::external("disconnect response truncated"));
            }
            Ok(InboundFrame::DisconnectResponse { channel: body[0] })
        }
        SERVICE_TUNNELING_REQUEST => {
            if body.len() < 4 {
                return Err(Error::external("tunneling request truncated"));
            }
            Ok(InboundFrame::Tunneling {
                channel: body[1],
                seq: body[2],
                telegram: parse_cemi(&body[4..])?,
            })
        }
        SERVICE_TUNNELING_ACK => {
            if body.len() < 4 {
                return Err(Error::external("tunneling ack truncated"));
            }
            Ok(InboundFrame::TunnelingAck {
                channel: body[1],
                seq: body[2],
                status: body[3],
            })
        }
        SERVICE_ROUTING_INDICATION => Ok(InboundFrame::Routing {
            telegram: parse_cemi(body)?,
        }),
        other => Err(Error::external(format!(
            "unsupported KNXnet/IP service 0x{:04x}",
            other
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn telegram() -> GroupTelegram {
        GroupTelegram {
            destination: "2/1/14".parse().unwrap(),
            value: GroupValue::Byte(60),
        }
    }

    #[test]
    fn test_connect_request_shape() {
        let frame = connect_request(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 3671));
        assert_eq!(frame[0], 0x06);
        assert_eq!(frame[1], 0x10);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 0x0205);
        assert_eq!(u16::from_be_bytes([frame[4], frame[5]]) as usize, frame.len());
        // CRI trailer: tunnel connection, link layer
        assert_eq!(&frame[frame.len() - 4..], &[0x04, 0x04, 0x02, 0x00]);
    }

    #[test]
    fn test_tunneling_roundtrip() {
        let frame = tunneling_request(7, 3, &telegram());
        match decode(&frame).unwrap() {
            InboundFrame::Tunneling {
                channel,
                seq,
                telegram: Some(t),
            } => {
                assert_eq!(channel, 7);
                assert_eq!(seq, 3);
                assert_eq!(t, telegram());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_routing_roundtrip() {
        let frame = routing_indication(&telegram());
        match decode(&frame).unwrap() {
            InboundFrame::Routing { telegram: Some(t) } => assert_eq!(t, telegram()),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_bool_telegram_roundtrip() {
        let t = GroupTelegram {
            destination: "1/0/1".parse().unwrap(),
            value: GroupValue::Bool(true),
        };
        let frame = routing_indication(&t);
        match decode(&frame).unwrap() {
            InboundFrame::Routing { telegram: Some(got) } => assert_eq!(got, t),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_read_indication_decodes_without_value() {
        let frame = routing_read_indication("3/2/1".parse().unwrap());
        match decode(&frame).unwrap() {
            InboundFrame::Routing { telegram: None } => {}
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(&[0x00]).is_err());
        assert!(decode(&[0x06, 0x10, 0x99, 0x99, 0x00, 0x06]).is_err());
    }

    #[test]
    fn test_ack_roundtrip() {
        let frame = tunneling_ack(9, 250);
        match decode(&frame).unwrap() {
            InboundFrame::TunnelingAck { channel, seq, status } => {
                assert_eq!(channel, 9);
                assert_eq!(seq, 250);
                assert_eq!(status, 0);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
