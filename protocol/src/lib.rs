// Copyright 2025 Oxide Computer Company
use bytes::Bytes;
use num_enum::IntoPrimitive;
use serde::{Deserialize, Serialize};
use strum_macros::EnumDiscriminants;
use uuid::Uuid;

use talus_common::{FileId, ObjectAttrs, ObjectKind, SetAttrs, TalusError};

pub mod codec;
pub mod wire;

pub use codec::{TalusDecoder, TalusEncoder};

/// Largest frame the codec will produce or accept.
pub const MAX_FRM_LEN: usize = 16 * 1024 * 1024; // 16M

/// Wrapper type for a request identifier
///
/// An xid is unique per issuing process and strictly increasing; it is the
/// key used for duplicate/resend detection on the server.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Xid(pub u64);

impl std::fmt::Display for Xid {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}

/// Wrapper type for a transaction number
///
/// Assigned by the server on first successful processing of a mutating
/// request, stable across resends and replays.  Zero means "none assigned
/// yet".
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Transno(pub u64);

impl Transno {
    pub const NONE: Transno = Transno(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Transno {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}

/*
 * Wire flag bits.  These ride in the header flags word of requests, replies
 * and pings.
 */

/// The client never saw a reply for this xid and is sending it again within
/// the same connection generation.
pub const MSG_RESENT: u32 = 1 << 0;

/// This request was already replied to once and is being replayed after a
/// reconnection, carrying its original transno.
pub const MSG_REPLAY: u32 = 1 << 1;

/// Marker ping sent once a client has finished replaying everything it had;
/// the server uses it to retire the client from the recovery window.
pub const MSG_LAST_REPLAY: u32 = 1 << 2;

/**
 * Convenience constants to provide some documentation on what changes have
 * been introduced in the various talus protocol versions.
 */
#[repr(u32)]
#[derive(IntoPrimitive)]
pub enum MessageVersion {
    /// `ConnectReply` carries an explicit `ReconnectStatus` instead of the
    /// client inferring eviction from a zero handle.
    V2 = 2,

    /// Initial version.
    V1 = 1,
}

impl MessageVersion {
    pub const fn current() -> Self {
        Self::V2
    }
}

pub const TALUS_MESSAGE_VERSION: u32 = 2;

/// Request opcodes.
///
/// The engine only implements the protocol machinery plus the compound
/// metadata operations; the set here is the full dispatch surface.
#[repr(u16)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    Hash,
    PartialEq,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
pub enum Opcode {
    Connect = 0,
    Disconnect = 1,
    Ping = 2,
    Getattr = 3,
    Statfs = 4,
    Open = 5,
    Close = 6,
    Sync = 7,
    ReintCreate = 8,
    ReintLink = 9,
    ReintUnlink = 10,
    ReintRename = 11,
    ReintSetattr = 12,
    LockEnqueue = 13,
    LockCancel = 14,
}

impl Opcode {
    /// True for the reintegration opcodes, which mutate durable state and
    /// are therefore assigned transnos and recorded in the client ledger.
    pub fn is_reint(&self) -> bool {
        matches!(
            self,
            Opcode::ReintCreate
                | Opcode::ReintLink
                | Opcode::ReintUnlink
                | Opcode::ReintRename
                | Opcode::ReintSetattr
        )
    }
}

/// How the server classified a connect attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReconnectStatus {
    /// First connection from this client; a fresh ledger slot was allocated.
    First,

    /// The client's previous session was found (or restored from the
    /// ledger); replay of uncommitted state is possible.
    Recovered,

    /// The presented handle is unknown and cannot be restored; all client
    /// state is stale and must be invalidated.
    Evicted,
}

/// Header carried by every request frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub xid: Xid,
    /// Zero unless this is a replay carrying its originally assigned number.
    pub transno: Transno,
    pub flags: u32,
    pub client_id: Uuid,
    /// The session handle the client believes it holds; requests with a
    /// stale handle are rejected rather than executed.
    pub handle: Uuid,
}

/// Header carried by every reply frame.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReplyHeader {
    pub opcode: Opcode,
    pub xid: Xid,
    /// The transno assigned to this request, or zero for non-mutating ops.
    pub transno: Transno,
    pub flags: u32,
    pub status: Result<(), TalusError>,
    /// Advisory: the highest transno the server has made durable.  Clients
    /// prune their replay lists up to this point.
    pub last_committed: Transno,
}

/**
 * These enums are for messages sent between a client and a metadata server.
 */
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, EnumDiscriminants)]
pub enum Message {
    /**
     * Initial negotiation. This is the first message the client sends to
     * the server as soon as the connection starts.
     */
    Connect {
        // The protocol version the client is running.
        version: u32,
        // Stable identity of the client, used to find its ledger slot.
        client_id: Uuid,
        // The session handle from the previous connection, or nil on the
        // first ever connect.
        prev_handle: Uuid,
        // Connection generation on the client side.
        gen: u64,
    },

    /**
     * The server's answer when the versions agree.
     */
    ConnectReply {
        version: u32,
        // The new session handle; all subsequent requests carry it.
        handle: Uuid,
        // How the server classified this connect.
        reconnect: ReconnectStatus,
        // True while the server is inside its recovery window and expects
        // replay before normal traffic.
        recovering: bool,
        // Whether this target supports replay at all.
        replayable: bool,
        // Highest durable transno, for replay-list pruning.
        last_committed: Transno,
    },

    /*
     * Version incompatibility is protocol-fatal: no retry.
     */
    VersionMismatch {
        // Version of Message this server wanted.
        version: u32,
    },

    /// Clean or failover disconnect.  A clean disconnect frees the client's
    /// ledger slot; a failover disconnect preserves it for reconnection.
    Disconnect {
        client_id: Uuid,
        handle: Uuid,
        failover: bool,
    },

    /*
     * Ping related.  A ping carrying MSG_LAST_REPLAY doubles as the
     * end-of-replay marker during recovery.
     */
    Ping {
        xid: Xid,
        flags: u32,
    },
    Pong {
        xid: Xid,
        flags: u32,
        last_committed: Transno,
    },

    /// One RPC request.  The body is opaque to the transport machinery;
    /// its layout is selected by `header.opcode`.
    Request {
        header: RequestHeader,
        body: Bytes,
    },

    /// One RPC reply, matched to its request by xid.
    Reply {
        header: ReplyHeader,
        body: Bytes,
    },

    /// Bulk payload riding alongside a control reply.  A request that
    /// registered a bulk descriptor is not complete until this arrives.
    BulkData {
        xid: Xid,
        data: Bytes,
    },
}

/*
 * Typed request bodies.  The transport treats these as opaque bytes; only
 * the dispatch layer on each end decodes them.
 */

/// Compound metadata operations handled by the reintegration engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReintRequest {
    Create {
        parent: FileId,
        name: String,
        kind: ObjectKind,
        mode: u32,
    },
    Link {
        source: FileId,
        parent: FileId,
        name: String,
    },
    Unlink {
        parent: FileId,
        name: String,
        /// The caller's declared intent: directory vs non-directory.  A
        /// mismatch fails before any other check.
        expect_dir: bool,
    },
    Rename {
        src_parent: FileId,
        src_name: String,
        dst_parent: FileId,
        dst_name: String,
    },
    Setattr {
        target: FileId,
        attrs: SetAttrs,
    },
}

impl ReintRequest {
    pub fn opcode(&self) -> Opcode {
        match self {
            ReintRequest::Create { .. } => Opcode::ReintCreate,
            ReintRequest::Link { .. } => Opcode::ReintLink,
            ReintRequest::Unlink { .. } => Opcode::ReintUnlink,
            ReintRequest::Rename { .. } => Opcode::ReintRename,
            ReintRequest::Setattr { .. } => Opcode::ReintSetattr,
        }
    }
}

/// Storage-layout metadata for an object that was physically removed,
/// returned so the caller can release backing storage objects.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayoutHint {
    pub id: FileId,
    pub blocks: u64,
}

/// Replies from the reintegration engine, paired with [`ReintRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReintReply {
    Create { id: FileId },
    Link,
    Unlink { destroyed: Option<LayoutHint> },
    Rename { unlinked: Option<LayoutHint> },
    Setattr,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetattrRequest {
    pub target: FileId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetattrReply {
    pub attrs: ObjectAttrs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatfsReply {
    pub files: u64,
    pub files_free: u64,
    pub blocks: u64,
    pub blocks_free: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub target: FileId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenReply {
    pub attrs: ObjectAttrs,
    /// Open disposition word, recorded as the ledger's auxiliary opdata so a
    /// replayed open reconstructs the same answer.
    pub disposition: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub target: FileId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockEnqueueRequest {
    pub resource: FileId,
    pub mode: talus_common::LockMode,
    pub policy: talus_common::PolicyBits,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockEnqueueReply {
    /// Opaque cookie naming the granted lock, for later cancel.
    pub cookie: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockCancelRequest {
    pub cookie: u64,
}

/// Serialize a typed body into the opaque request/reply payload.
pub fn encode_body<T: Serialize>(t: &T) -> Result<Bytes, TalusError> {
    Ok(Bytes::from(bincode::serialize(t)?))
}

/// Decode an opaque payload back into its typed body.
pub fn decode_body<T: for<'de> Deserialize<'de>>(
    b: &Bytes,
) -> Result<T, TalusError> {
    Ok(bincode::deserialize(b)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reint_bodies_round_trip() {
        let req = ReintRequest::Rename {
            src_parent: FileId::new(2, 1),
            src_name: "a".to_string(),
            dst_parent: FileId::new(3, 1),
            dst_name: "b".to_string(),
        };
        let body = encode_body(&req).unwrap();
        let back: ReintRequest = decode_body(&body).unwrap();
        assert_eq!(req, back);
        assert_eq!(back.opcode(), Opcode::ReintRename);
    }

    #[test]
    fn garbage_body_is_a_protocol_error() {
        let body = Bytes::from_static(&[0xff; 3]);
        let r: Result<ReintRequest, _> = decode_body(&body);
        assert!(matches!(r, Err(TalusError::Protocol(_))));
    }

    #[test]
    fn reint_opcodes_are_reint() {
        assert!(Opcode::ReintUnlink.is_reint());
        assert!(!Opcode::Getattr.is_reint());
        assert!(!Opcode::Connect.is_reint());
    }
}
