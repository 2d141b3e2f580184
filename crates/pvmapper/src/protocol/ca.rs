// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel Access frame codec (VERSION/SEARCH/ECHO subset).
//!
//! Every CA frame starts with a fixed 16-byte header, all fields in network
//! byte order, optionally followed by a payload padded to a multiple of 8
//! bytes:
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-------------------------------+-------------------------------+
//! |            command            |          payload_len          |
//! +-------------------------------+-------------------------------+
//! |           data_type           |          data_count           |
//! +-------------------------------+-------------------------------+
//! |                            param1                             |
//! +---------------------------------------------------------------+
//! |                            param2                             |
//! +---------------------------------------------------------------+
//! ```
//!
//! A search reply reuses the SEARCH command with `payload_len == 8` and
//! `data_count == 0`; there `data_type` carries the IOC's TCP server port
//! (a convention of CA servers rather than a header field reuse the
//! protocol documents spell out) and `param1` carries the IOC's IPv4
//! address. IOCs frequently put `255.255.255.255` in `param1`, expecting
//! clients to fall back to the datagram source address; a resolver in the
//! path has to substitute the real address before forwarding.
//!
//! The decoders never fail. A frame that is malformed (declared payload
//! running past the end of the buffer) or simply irrelevant is skipped and
//! the parsable subset is returned.

use std::net::Ipv4Addr;

/// CA_PROTO_VERSION command.
pub const CMD_VERSION: u16 = 0x00;
/// CA_PROTO_SEARCH command.
pub const CMD_SEARCH: u16 = 0x06;
/// CA_PROTO_ECHO command.
pub const CMD_ECHO: u16 = 0x17;

/// Minor protocol version advertised in VERSION and SEARCH headers.
pub const PROTOCOL_VERSION: u16 = 13;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Budget for one outgoing search datagram. Conservative enough to clear a
/// 1500-byte Ethernet MTU after IP/UDP overhead.
pub const SEARCH_DATAGRAM_BUDGET: usize = 1400;

struct Header {
    command: u16,
    payload_len: u16,
    data_type: u16,
    data_count: u16,
    param1: u32,
    param2: u32,
}

impl Header {
    fn read(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            command: u16::from_be_bytes([buf[0], buf[1]]),
            payload_len: u16::from_be_bytes([buf[2], buf[3]]),
            data_type: u16::from_be_bytes([buf[4], buf[5]]),
            data_count: u16::from_be_bytes([buf[6], buf[7]]),
            param1: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            param2: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.command.to_be_bytes());
        out.extend_from_slice(&self.payload_len.to_be_bytes());
        out.extend_from_slice(&self.data_type.to_be_bytes());
        out.extend_from_slice(&self.data_count.to_be_bytes());
        out.extend_from_slice(&self.param1.to_be_bytes());
        out.extend_from_slice(&self.param2.to_be_bytes());
    }
}

fn version_header() -> Header {
    Header {
        command: CMD_VERSION,
        payload_len: 0,
        data_type: 1,
        data_count: PROTOCOL_VERSION,
        param1: 0,
        param2: 0,
    }
}

/// Encode an echo request, optionally prefixed with a VERSION frame for the
/// first exchange on a fresh connection.
pub fn encode_echo(include_version: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * HEADER_LEN);
    if include_version {
        version_header().write(&mut out);
    }
    Header {
        command: CMD_ECHO,
        payload_len: 0,
        data_type: 0,
        data_count: 0,
        param1: 0,
        param2: 0,
    }
    .write(&mut out);
    out
}

/// Encode a search request datagram for a prefix of `pvs`.
///
/// Emits one VERSION frame followed by one SEARCH frame per PV, each
/// carrying the name NUL-padded to the next multiple of 8 bytes and the
/// channel id in both params. Stops before the datagram would exceed
/// [`SEARCH_DATAGRAM_BUDGET`] and returns how many PVs were consumed so the
/// caller can loop over the rest. A name too long to fit a datagram on its
/// own yields `n_consumed == 0`.
pub fn encode_search_request(pvs: &[(u32, String)]) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(SEARCH_DATAGRAM_BUDGET.min(HEADER_LEN * (pvs.len() + 1)));
    version_header().write(&mut out);

    let mut consumed = 0;
    for (chan_id, name) in pvs {
        let name_len = name.len().min(0xFFFF);
        let payload_len = (name_len + 7) & !7;
        if out.len() + HEADER_LEN + payload_len > SEARCH_DATAGRAM_BUDGET {
            break;
        }
        Header {
            command: CMD_SEARCH,
            payload_len: payload_len as u16,
            data_type: 5,
            data_count: PROTOCOL_VERSION,
            param1: *chan_id,
            param2: *chan_id,
        }
        .write(&mut out);
        out.extend_from_slice(&name.as_bytes()[..name_len]);
        out.resize(out.len() + (payload_len - name_len), 0);
        consumed += 1;
    }
    (out, consumed)
}

/// Decode the SEARCH frames of a client request into `(chanId, name)`
/// pairs. Other commands and truncated frames are skipped.
pub fn decode_search_request(buf: &[u8]) -> Vec<(u32, String)> {
    let mut pvs = Vec::new();
    let mut offset = 0;
    while let Some(hdr) = Header::read(&buf[offset.min(buf.len())..]) {
        let payload_len = hdr.payload_len as usize;
        let end = offset + HEADER_LEN + payload_len;
        if hdr.command == CMD_SEARCH && end <= buf.len() {
            let payload = trim_nuls(&buf[offset + HEADER_LEN..end]);
            pvs.push((hdr.param1, String::from_utf8_lossy(payload).into_owned()));
        }
        offset += HEADER_LEN + payload_len;
    }
    pvs
}

/// Decode search reply frames into `(chanId, reply_frame)` pairs.
///
/// A reply frame is a SEARCH header with an 8-byte payload and
/// `data_count == 0`; `param2` echoes the channel id. The most recent
/// VERSION frame, if any, is retained as a prefix of the returned bytes so
/// the reply can be forwarded to a client verbatim.
pub fn decode_search_reply(buf: &[u8]) -> Vec<(u32, Vec<u8>)> {
    let mut replies = Vec::new();
    let mut version: Option<usize> = None;
    let mut offset = 0;
    while let Some(hdr) = Header::read(&buf[offset.min(buf.len())..]) {
        let payload_len = hdr.payload_len as usize;
        let end = offset + HEADER_LEN + payload_len;
        if hdr.command == CMD_VERSION {
            version = Some(offset);
        } else if hdr.command == CMD_SEARCH
            && end <= buf.len()
            && payload_len == 8
            && hdr.data_count == 0
        {
            let mut frame = Vec::with_capacity(2 * HEADER_LEN + 8);
            if let Some(v) = version {
                frame.extend_from_slice(&buf[v..v + HEADER_LEN]);
            }
            frame.extend_from_slice(&buf[offset..end]);
            replies.push((hdr.param2, frame));
        }
        offset += HEADER_LEN + payload_len;
    }
    replies
}

/// Patch the client's channel id into every SEARCH header of `reply`.
/// Idempotent. Returns whether any header was updated.
pub fn rewrite_reply_client_cid(reply: &mut [u8], chan_id: u32) -> bool {
    let mut offset = 0;
    let mut updated = false;
    while offset + HEADER_LEN <= reply.len() {
        let command = u16::from_be_bytes([reply[offset], reply[offset + 1]]);
        let payload_len = u16::from_be_bytes([reply[offset + 2], reply[offset + 3]]) as usize;
        if command == CMD_SEARCH {
            reply[offset + 12..offset + 16].copy_from_slice(&chan_id.to_be_bytes());
            updated = true;
        }
        offset += HEADER_LEN + payload_len;
    }
    updated
}

/// Patch the IOC's real address into every SEARCH header of `reply`: the
/// TCP port into `data_type`, the IPv4 address into `param1`. Required when
/// the IOC answered with the `255.255.255.255` placeholder. Idempotent.
pub fn rewrite_reply_ioc_addr(reply: &mut [u8], ioc_ip: Ipv4Addr, ioc_port: u16) -> bool {
    let mut offset = 0;
    let mut updated = false;
    while offset + HEADER_LEN <= reply.len() {
        let command = u16::from_be_bytes([reply[offset], reply[offset + 1]]);
        let payload_len = u16::from_be_bytes([reply[offset + 2], reply[offset + 3]]) as usize;
        if command == CMD_SEARCH {
            reply[offset + 4..offset + 6].copy_from_slice(&ioc_port.to_be_bytes());
            reply[offset + 8..offset + 12].copy_from_slice(&ioc_ip.octets());
            updated = true;
        }
        offset += HEADER_LEN + payload_len;
    }
    updated
}

/// Extract the IOC's TCP server port from the first search reply frame.
pub fn decode_ioc_port(buf: &[u8]) -> Option<u16> {
    let mut offset = 0;
    while let Some(hdr) = Header::read(&buf[offset.min(buf.len())..]) {
        let payload_len = hdr.payload_len as usize;
        if hdr.command == CMD_SEARCH
            && offset + HEADER_LEN + payload_len <= buf.len()
            && payload_len == 8
            && hdr.data_count == 0
        {
            return Some(hdr.data_type);
        }
        offset += HEADER_LEN + payload_len;
    }
    None
}

fn trim_nuls(payload: &[u8]) -> &[u8] {
    let mut len = payload.len();
    while len > 0 && payload[len - 1] == 0 {
        len -= 1;
    }
    &payload[..len]
}
