//! OpenFlow 1.3 wire layer.
//!
//! Only the slice of the protocol the controller speaks is implemented:
//! handshake (HELLO, FEATURES), liveness (ECHO), role advisories, and
//! FLOW_MOD with OXM matches on `eth_type`/`ipv4_src`/`ipv4_dst` and
//! apply-actions OUTPUT. The codec is symmetric so the emulated datapaths
//! used in tests can speak the same frames. Everything else decodes to
//! [`OfMessage::Other`] and is skipped.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::policy::Ipv4Net;

/* ============================= CONSTANTS ============================= */

pub const OFP_VERSION: u8 = 0x04;
pub const OFP_HEADER_LEN: usize = 8;

const OFPT_HELLO: u8 = 0;
const OFPT_ERROR: u8 = 1;
const OFPT_ECHO_REQUEST: u8 = 2;
const OFPT_ECHO_REPLY: u8 = 3;
const OFPT_FEATURES_REQUEST: u8 = 5;
const OFPT_FEATURES_REPLY: u8 = 6;
const OFPT_FLOW_MOD: u8 = 14;
const OFPT_ROLE_REQUEST: u8 = 24;
const OFPT_ROLE_REPLY: u8 = 25;

/// Forward to the datapath's normal (CNI) pipeline.
pub const OFPP_NORMAL: u32 = 0xffff_fffa;
pub const OFPP_ANY: u32 = 0xffff_ffff;
pub const OFPG_ANY: u32 = 0xffff_ffff;
pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;
pub const OFPTT_ALL: u8 = 0xff;
const OFPCML_NO_BUFFER: u16 = 0xffff;

pub const ETH_TYPE_IPV4: u16 = 0x0800;

const OFPMT_OXM: u16 = 1;
const OFPXMC_OPENFLOW_BASIC: u16 = 0x8000;
const OXM_ETH_TYPE: u8 = 5;
const OXM_IPV4_SRC: u8 = 11;
const OXM_IPV4_DST: u8 = 12;

const OFPIT_APPLY_ACTIONS: u16 = 4;
const OFPAT_OUTPUT: u16 = 0;
const ACTION_OUTPUT_LEN: u16 = 16;

/// Cookie tagging every rule this controller installs, so cookie-scoped
/// cleanup never touches baseline/CNI rules (which carry cookie 0).
pub const ZT_COOKIE: u64 = 0xDEAD_BEEF;

/// Cookie mask for cleanup: all ones, exact-cookie match.
pub const COOKIE_MASK_ALL: u64 = u64::MAX;

/* ============================= TYPES ============================= */

/// Controller role as advised to a datapath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    NoChange,
    Equal,
    Master,
    Slave,
}

impl Role {
    fn to_wire(self) -> u32 {
        match self {
            Role::NoChange => 0,
            Role::Equal => 1,
            Role::Master => 2,
            Role::Slave => 3,
        }
    }

    fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Role::NoChange),
            1 => Some(Role::Equal),
            2 => Some(Role::Master),
            3 => Some(Role::Slave),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowModCommand {
    Add,
    Delete,
    Other(u8),
}

impl FlowModCommand {
    fn to_wire(self) -> u8 {
        match self {
            FlowModCommand::Add => 0,
            FlowModCommand::Delete => 3,
            FlowModCommand::Other(raw) => raw,
        }
    }

    fn from_wire(raw: u8) -> Self {
        match raw {
            0 => FlowModCommand::Add,
            3 => FlowModCommand::Delete,
            other => FlowModCommand::Other(other),
        }
    }
}

/// Match fields carried by a flow rule. Absent fields wildcard; a `/0`
/// network is equivalent to an absent field and is not emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowMatch {
    pub eth_type: Option<u16>,
    pub ipv4_src: Option<Ipv4Net>,
    pub ipv4_dst: Option<Ipv4Net>,
}

impl FlowMatch {
    /// Match-all (the baseline rule's match).
    pub fn any() -> Self {
        Self::default()
    }

    /// IPv4 source/destination pair. `/0` ends on the wildcard side.
    pub fn ipv4_pair(src: Ipv4Net, dst: Ipv4Net) -> Self {
        Self {
            eth_type: Some(ETH_TYPE_IPV4),
            ipv4_src: (!src.is_any()).then_some(src),
            ipv4_dst: (!dst.is_any()).then_some(dst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfAction {
    Output(u32),
}

/// A FLOW_MOD request. Empty `actions` on an add means drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    pub command: FlowModCommand,
    pub cookie: u64,
    pub cookie_mask: u64,
    pub table_id: u8,
    pub priority: u16,
    pub out_port: u32,
    pub out_group: u32,
    pub match_fields: FlowMatch,
    pub actions: Vec<OfAction>,
}

impl FlowMod {
    pub fn add(priority: u16, match_fields: FlowMatch, actions: Vec<OfAction>, cookie: u64) -> Self {
        Self {
            command: FlowModCommand::Add,
            cookie,
            cookie_mask: 0,
            table_id: 0,
            priority,
            out_port: 0,
            out_group: 0,
            match_fields,
            actions,
        }
    }

    /// Bulk removal of every rule carrying `cookie`, across all tables.
    /// The all-ones mask keeps cookie-0 baseline rules untouched.
    pub fn delete_by_cookie(cookie: u64) -> Self {
        Self {
            command: FlowModCommand::Delete,
            cookie,
            cookie_mask: COOKIE_MASK_ALL,
            table_id: OFPTT_ALL,
            priority: 0,
            out_port: OFPP_ANY,
            out_group: OFPG_ANY,
            match_fields: FlowMatch::any(),
            actions: Vec::new(),
        }
    }
}

/// The decoded message set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfMessage {
    Hello { xid: u32 },
    Error { xid: u32, err_type: u16, code: u16 },
    EchoRequest { xid: u32, payload: Bytes },
    EchoReply { xid: u32, payload: Bytes },
    FeaturesRequest { xid: u32 },
    FeaturesReply { xid: u32, datapath_id: u64, n_buffers: u32, n_tables: u8, capabilities: u32 },
    FlowMod { xid: u32, body: FlowMod },
    RoleRequest { xid: u32, role: Role, generation_id: u64 },
    RoleReply { xid: u32, role: Role, generation_id: u64 },
    Other { xid: u32, msg_type: u8 },
}

impl OfMessage {
    pub fn xid(&self) -> u32 {
        match self {
            OfMessage::Hello { xid }
            | OfMessage::Error { xid, .. }
            | OfMessage::EchoRequest { xid, .. }
            | OfMessage::EchoReply { xid, .. }
            | OfMessage::FeaturesRequest { xid }
            | OfMessage::FeaturesReply { xid, .. }
            | OfMessage::FlowMod { xid, .. }
            | OfMessage::RoleRequest { xid, .. }
            | OfMessage::RoleReply { xid, .. }
            | OfMessage::Other { xid, .. } => *xid,
        }
    }

    fn msg_type(&self) -> u8 {
        match self {
            OfMessage::Hello { .. } => OFPT_HELLO,
            OfMessage::Error { .. } => OFPT_ERROR,
            OfMessage::EchoRequest { .. } => OFPT_ECHO_REQUEST,
            OfMessage::EchoReply { .. } => OFPT_ECHO_REPLY,
            OfMessage::FeaturesRequest { .. } => OFPT_FEATURES_REQUEST,
            OfMessage::FeaturesReply { .. } => OFPT_FEATURES_REPLY,
            OfMessage::FlowMod { .. } => OFPT_FLOW_MOD,
            OfMessage::RoleRequest { .. } => OFPT_ROLE_REQUEST,
            OfMessage::RoleReply { .. } => OFPT_ROLE_REPLY,
            OfMessage::Other { msg_type, .. } => *msg_type,
        }
    }
}

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported OpenFlow version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("frame length {0} below header size")]
    BadLength(u16),
    #[error("truncated {0} body")]
    Truncated(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/* ============================= CODEC ============================= */

/// Length-prefixed framing plus message encode/decode, for use with
/// `tokio_util::codec::Framed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenFlowCodec;

impl Decoder for OpenFlowCodec {
    type Item = OfMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<OfMessage>, CodecError> {
        if src.len() < OFP_HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[2], src[3]]) as usize;
        if length < OFP_HEADER_LEN {
            return Err(CodecError::BadLength(length as u16));
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length).freeze();
        let version = frame.get_u8();
        let msg_type = frame.get_u8();
        let _length = frame.get_u16();
        let xid = frame.get_u32();

        // Version negotiation happens via HELLO; any version is tolerated
        // there. Every other message must be 1.3.
        if version != OFP_VERSION && msg_type != OFPT_HELLO {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let message = match msg_type {
            OFPT_HELLO => OfMessage::Hello { xid },
            OFPT_ERROR => decode_error(xid, &mut frame)?,
            OFPT_ECHO_REQUEST => OfMessage::EchoRequest { xid, payload: frame },
            OFPT_ECHO_REPLY => OfMessage::EchoReply { xid, payload: frame },
            OFPT_FEATURES_REQUEST => OfMessage::FeaturesRequest { xid },
            OFPT_FEATURES_REPLY => decode_features_reply(xid, &mut frame)?,
            OFPT_FLOW_MOD => decode_flow_mod(xid, &mut frame)?,
            OFPT_ROLE_REQUEST => decode_role(xid, &mut frame, true)?,
            OFPT_ROLE_REPLY => decode_role(xid, &mut frame, false)?,
            other => OfMessage::Other { xid, msg_type: other },
        };

        Ok(Some(message))
    }
}

impl Encoder<OfMessage> for OpenFlowCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: OfMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut body = BytesMut::new();
        match &msg {
            OfMessage::Hello { .. } | OfMessage::FeaturesRequest { .. } | OfMessage::Other { .. } => {}
            OfMessage::Error { err_type, code, .. } => {
                body.put_u16(*err_type);
                body.put_u16(*code);
            }
            OfMessage::EchoRequest { payload, .. } | OfMessage::EchoReply { payload, .. } => {
                body.extend_from_slice(payload);
            }
            OfMessage::FeaturesReply { datapath_id, n_buffers, n_tables, capabilities, .. } => {
                body.put_u64(*datapath_id);
                body.put_u32(*n_buffers);
                body.put_u8(*n_tables);
                body.put_u8(0); // auxiliary_id
                body.put_bytes(0, 2);
                body.put_u32(*capabilities);
                body.put_u32(0); // reserved
            }
            OfMessage::FlowMod { body: flow_mod, .. } => encode_flow_mod(flow_mod, &mut body),
            OfMessage::RoleRequest { role, generation_id, .. }
            | OfMessage::RoleReply { role, generation_id, .. } => {
                body.put_u32(role.to_wire());
                body.put_bytes(0, 4);
                body.put_u64(*generation_id);
            }
        }

        let length = OFP_HEADER_LEN + body.len();
        dst.reserve(length);
        dst.put_u8(OFP_VERSION);
        dst.put_u8(msg.msg_type());
        dst.put_u16(length as u16);
        dst.put_u32(msg.xid());
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/* ============================= ENCODE ============================= */

fn encode_flow_mod(flow_mod: &FlowMod, out: &mut BytesMut) {
    out.put_u64(flow_mod.cookie);
    out.put_u64(flow_mod.cookie_mask);
    out.put_u8(flow_mod.table_id);
    out.put_u8(flow_mod.command.to_wire());
    out.put_u16(0); // idle_timeout
    out.put_u16(0); // hard_timeout
    out.put_u16(flow_mod.priority);
    out.put_u32(OFP_NO_BUFFER);
    out.put_u32(flow_mod.out_port);
    out.put_u32(flow_mod.out_group);
    out.put_u16(0); // flags
    out.put_bytes(0, 2);

    encode_match(&flow_mod.match_fields, out);

    if !flow_mod.actions.is_empty() {
        let actions_len: u16 = flow_mod.actions.len() as u16 * ACTION_OUTPUT_LEN;
        out.put_u16(OFPIT_APPLY_ACTIONS);
        out.put_u16(8 + actions_len);
        out.put_bytes(0, 4);
        for action in &flow_mod.actions {
            let OfAction::Output(port) = action;
            out.put_u16(OFPAT_OUTPUT);
            out.put_u16(ACTION_OUTPUT_LEN);
            out.put_u32(*port);
            out.put_u16(OFPCML_NO_BUFFER);
            out.put_bytes(0, 6);
        }
    }
}

fn oxm_header(field: u8, has_mask: bool, payload_len: u8) -> u32 {
    (u32::from(OFPXMC_OPENFLOW_BASIC) << 16)
        | (u32::from(field) << 9)
        | (u32::from(has_mask as u8) << 8)
        | u32::from(payload_len)
}

fn put_oxm_ipv4(field: u8, net: Ipv4Net, out: &mut BytesMut) {
    if net.is_host() {
        out.put_u32(oxm_header(field, false, 4));
        out.put_u32(u32::from(net.addr()));
    } else {
        out.put_u32(oxm_header(field, true, 8));
        out.put_u32(u32::from(net.addr()) & net.mask());
        out.put_u32(net.mask());
    }
}

fn encode_match(fields: &FlowMatch, out: &mut BytesMut) {
    let mut oxm = BytesMut::new();
    if let Some(eth_type) = fields.eth_type {
        oxm.put_u32(oxm_header(OXM_ETH_TYPE, false, 2));
        oxm.put_u16(eth_type);
    }
    if let Some(src) = fields.ipv4_src
        && !src.is_any()
    {
        put_oxm_ipv4(OXM_IPV4_SRC, src, &mut oxm);
    }
    if let Some(dst) = fields.ipv4_dst
        && !dst.is_any()
    {
        put_oxm_ipv4(OXM_IPV4_DST, dst, &mut oxm);
    }

    let length = 4 + oxm.len();
    out.put_u16(OFPMT_OXM);
    out.put_u16(length as u16);
    out.extend_from_slice(&oxm);
    out.put_bytes(0, padding_to_8(length));
}

fn padding_to_8(length: usize) -> usize {
    (8 - length % 8) % 8
}

/* ============================= DECODE ============================= */

fn decode_error(xid: u32, frame: &mut Bytes) -> Result<OfMessage, CodecError> {
    if frame.remaining() < 4 {
        return Err(CodecError::Truncated("error"));
    }
    Ok(OfMessage::Error {
        xid,
        err_type: frame.get_u16(),
        code: frame.get_u16(),
    })
}

fn decode_features_reply(xid: u32, frame: &mut Bytes) -> Result<OfMessage, CodecError> {
    if frame.remaining() < 24 {
        return Err(CodecError::Truncated("features reply"));
    }
    let datapath_id = frame.get_u64();
    let n_buffers = frame.get_u32();
    let n_tables = frame.get_u8();
    let _auxiliary_id = frame.get_u8();
    frame.advance(2);
    let capabilities = frame.get_u32();
    let _reserved = frame.get_u32();
    Ok(OfMessage::FeaturesReply { xid, datapath_id, n_buffers, n_tables, capabilities })
}

fn decode_role(xid: u32, frame: &mut Bytes, request: bool) -> Result<OfMessage, CodecError> {
    if frame.remaining() < 16 {
        return Err(CodecError::Truncated("role"));
    }
    let role = Role::from_wire(frame.get_u32()).unwrap_or(Role::NoChange);
    frame.advance(4);
    let generation_id = frame.get_u64();
    Ok(if request {
        OfMessage::RoleRequest { xid, role, generation_id }
    } else {
        OfMessage::RoleReply { xid, role, generation_id }
    })
}

fn decode_flow_mod(xid: u32, frame: &mut Bytes) -> Result<OfMessage, CodecError> {
    if frame.remaining() < 40 {
        return Err(CodecError::Truncated("flow mod"));
    }
    let cookie = frame.get_u64();
    let cookie_mask = frame.get_u64();
    let table_id = frame.get_u8();
    let command = FlowModCommand::from_wire(frame.get_u8());
    let _idle_timeout = frame.get_u16();
    let _hard_timeout = frame.get_u16();
    let priority = frame.get_u16();
    let _buffer_id = frame.get_u32();
    let out_port = frame.get_u32();
    let out_group = frame.get_u32();
    let _flags = frame.get_u16();
    frame.advance(2);

    let match_fields = decode_match(frame)?;
    let actions = decode_instructions(frame)?;

    Ok(OfMessage::FlowMod {
        xid,
        body: FlowMod {
            command,
            cookie,
            cookie_mask,
            table_id,
            priority,
            out_port,
            out_group,
            match_fields,
            actions,
        },
    })
}

fn decode_match(frame: &mut Bytes) -> Result<FlowMatch, CodecError> {
    if frame.remaining() < 4 {
        return Err(CodecError::Truncated("match"));
    }
    let match_type = frame.get_u16();
    let length = frame.get_u16() as usize;
    if length < 4 {
        return Err(CodecError::Truncated("match"));
    }
    let mut oxm_len = length - 4;
    if frame.remaining() < oxm_len + padding_to_8(length) {
        return Err(CodecError::Truncated("match"));
    }

    let mut fields = FlowMatch::default();
    while oxm_len >= 4 {
        let header = frame.get_u32();
        let payload_len = (header & 0xff) as usize;
        oxm_len -= 4;
        if payload_len > oxm_len || frame.remaining() < payload_len {
            return Err(CodecError::Truncated("oxm"));
        }
        oxm_len -= payload_len;

        let class = (header >> 16) as u16;
        let field = ((header >> 9) & 0x7f) as u8;
        let has_mask = (header >> 8) & 1 == 1;

        if class != OFPXMC_OPENFLOW_BASIC || match_type != OFPMT_OXM {
            frame.advance(payload_len);
            continue;
        }

        match (field, has_mask, payload_len) {
            (OXM_ETH_TYPE, false, 2) => fields.eth_type = Some(frame.get_u16()),
            (OXM_IPV4_SRC, false, 4) => {
                fields.ipv4_src = Some(Ipv4Net::host(Ipv4Addr::from(frame.get_u32())));
            }
            (OXM_IPV4_DST, false, 4) => {
                fields.ipv4_dst = Some(Ipv4Net::host(Ipv4Addr::from(frame.get_u32())));
            }
            (OXM_IPV4_SRC, true, 8) => {
                fields.ipv4_src = Some(masked_net(frame.get_u32(), frame.get_u32()));
            }
            (OXM_IPV4_DST, true, 8) => {
                fields.ipv4_dst = Some(masked_net(frame.get_u32(), frame.get_u32()));
            }
            _ => frame.advance(payload_len),
        }
    }

    frame.advance(padding_to_8(length));
    Ok(fields)
}

fn masked_net(value: u32, mask: u32) -> Ipv4Net {
    let prefix_len = mask.leading_ones() as u8;
    Ipv4Net::new(Ipv4Addr::from(value), prefix_len)
        .unwrap_or_else(|_| Ipv4Net::host(Ipv4Addr::from(value)))
}

fn decode_instructions(frame: &mut Bytes) -> Result<Vec<OfAction>, CodecError> {
    let mut actions = Vec::new();
    while frame.remaining() >= 4 {
        let instruction_type = frame.get_u16();
        let instruction_len = frame.get_u16() as usize;
        if instruction_len < 4 || frame.remaining() < instruction_len - 4 {
            return Err(CodecError::Truncated("instruction"));
        }

        if instruction_type != OFPIT_APPLY_ACTIONS {
            frame.advance(instruction_len - 4);
            continue;
        }

        frame.advance(4); // pad
        let mut actions_len = instruction_len - 8;
        while actions_len >= 4 {
            let action_type = frame.get_u16();
            let action_len = frame.get_u16() as usize;
            if action_len < 4 || action_len - 4 > frame.remaining() || action_len > actions_len {
                return Err(CodecError::Truncated("action"));
            }
            actions_len -= action_len;

            if action_type == OFPAT_OUTPUT && action_len == ACTION_OUTPUT_LEN as usize {
                let port = frame.get_u32();
                frame.advance(8); // max_len + pad
                actions.push(OfAction::Output(port));
            } else {
                frame.advance(action_len - 4);
            }
        }
    }
    Ok(actions)
}

/* ============================= TESTS ============================= */
