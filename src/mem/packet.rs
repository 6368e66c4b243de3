//! Memory Transactions.
//!
//! A [`Packet`] is an addressed memory operation travelling between ports.
//! Packets are shared through [`PacketPtr`] handles: the initiator keeps one
//! while an interconnect forwards another, and a packet that is owed a
//! response is turned into that response in place. A packet is destroyed
//! when its last handle is dropped.

use crate::common::{Addr, PortId, SimError, SimResult, Tick};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Shared handle to a packet.
pub type PacketPtr = Rc<RefCell<Packet>>;

/// Number of distinct memory commands, for per-command statistics.
pub const NUM_MEM_CMDS: usize = 14;

mod attr {
    pub const IS_READ: u16 = 1 << 0;
    pub const IS_WRITE: u16 = 1 << 1;
    pub const IS_PREFETCH: u16 = 1 << 2;
    pub const IS_INVALIDATE: u16 = 1 << 3;
    pub const IS_REQUEST: u16 = 1 << 4;
    pub const IS_RESPONSE: u16 = 1 << 5;
    pub const NEEDS_RESPONSE: u16 = 1 << 6;
    pub const IS_SW_PREFETCH: u16 = 1 << 7;
    pub const IS_HW_PREFETCH: u16 = 1 << 8;
    pub const HAS_DATA: u16 = 1 << 9;
}

/// Memory commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemCmd {
    ReadReq,
    WriteReq,
    WriteReqNoAck,
    ReadResp,
    WriteResp,
    Writeback,
    SoftPFReq,
    HardPFReq,
    SoftPFResp,
    HardPFResp,
    InvalidateReq,
    UpgradeReq,
    ReadExReq,
    ReadExResp,
}

impl MemCmd {
    /// Every command, in index order.
    pub const ALL: [MemCmd; NUM_MEM_CMDS] = [
        MemCmd::ReadReq,
        MemCmd::WriteReq,
        MemCmd::WriteReqNoAck,
        MemCmd::ReadResp,
        MemCmd::WriteResp,
        MemCmd::Writeback,
        MemCmd::SoftPFReq,
        MemCmd::HardPFReq,
        MemCmd::SoftPFResp,
        MemCmd::HardPFResp,
        MemCmd::InvalidateReq,
        MemCmd::UpgradeReq,
        MemCmd::ReadExReq,
        MemCmd::ReadExResp,
    ];

    const fn attributes(self) -> u16 {
        use attr::*;
        match self {
            MemCmd::ReadReq => IS_READ | IS_REQUEST | NEEDS_RESPONSE,
            MemCmd::WriteReq => IS_WRITE | IS_REQUEST | NEEDS_RESPONSE | HAS_DATA,
            MemCmd::WriteReqNoAck => IS_WRITE | IS_REQUEST | HAS_DATA,
            MemCmd::ReadResp => IS_READ | IS_RESPONSE | HAS_DATA,
            MemCmd::WriteResp => IS_WRITE | IS_RESPONSE,
            MemCmd::Writeback => IS_WRITE | IS_REQUEST | HAS_DATA,
            MemCmd::SoftPFReq => {
                IS_READ | IS_REQUEST | IS_PREFETCH | IS_SW_PREFETCH | NEEDS_RESPONSE
            }
            MemCmd::HardPFReq => {
                IS_READ | IS_REQUEST | IS_PREFETCH | IS_HW_PREFETCH | NEEDS_RESPONSE
            }
            MemCmd::SoftPFResp => {
                IS_READ | IS_RESPONSE | IS_PREFETCH | IS_SW_PREFETCH | HAS_DATA
            }
            MemCmd::HardPFResp => {
                IS_READ | IS_RESPONSE | IS_PREFETCH | IS_HW_PREFETCH | HAS_DATA
            }
            MemCmd::InvalidateReq => IS_INVALIDATE | IS_REQUEST,
            MemCmd::UpgradeReq => IS_INVALIDATE | IS_REQUEST,
            MemCmd::ReadExReq => IS_READ | IS_INVALIDATE | IS_REQUEST | NEEDS_RESPONSE,
            MemCmd::ReadExResp => IS_READ | IS_INVALIDATE | IS_RESPONSE | HAS_DATA,
        }
    }

    #[inline(always)]
    fn has(self, bit: u16) -> bool {
        self.attributes() & bit != 0
    }

    /// Index of the command, for per-command statistics.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The command a response to this request carries, if one is owed.
    pub fn response_command(self) -> Option<MemCmd> {
        match self {
            MemCmd::ReadReq => Some(MemCmd::ReadResp),
            MemCmd::WriteReq => Some(MemCmd::WriteResp),
            MemCmd::SoftPFReq => Some(MemCmd::SoftPFResp),
            MemCmd::HardPFReq => Some(MemCmd::HardPFResp),
            MemCmd::ReadExReq => Some(MemCmd::ReadExResp),
            _ => None,
        }
    }

    pub fn is_read(self) -> bool {
        self.has(attr::IS_READ)
    }

    pub fn is_write(self) -> bool {
        self.has(attr::IS_WRITE)
    }

    pub fn is_prefetch(self) -> bool {
        self.has(attr::IS_PREFETCH)
    }

    pub fn is_invalidate(self) -> bool {
        self.has(attr::IS_INVALIDATE)
    }

    pub fn is_request(self) -> bool {
        self.has(attr::IS_REQUEST)
    }

    pub fn is_response(self) -> bool {
        self.has(attr::IS_RESPONSE)
    }

    pub fn needs_response(self) -> bool {
        self.has(attr::NEEDS_RESPONSE)
    }

    pub fn has_data(self) -> bool {
        self.has(attr::HAS_DATA)
    }

    /// Demand accesses are reads and writes that are not prefetches.
    pub fn is_demand(self) -> bool {
        matches!(self, MemCmd::ReadReq | MemCmd::WriteReq | MemCmd::ReadExReq)
    }

    /// Name of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            MemCmd::ReadReq => "ReadReq",
            MemCmd::WriteReq => "WriteReq",
            MemCmd::WriteReqNoAck => "WriteReqNoAck",
            MemCmd::ReadResp => "ReadResp",
            MemCmd::WriteResp => "WriteResp",
            MemCmd::Writeback => "Writeback",
            MemCmd::SoftPFReq => "SoftPFReq",
            MemCmd::HardPFReq => "HardPFReq",
            MemCmd::SoftPFResp => "SoftPFResp",
            MemCmd::HardPFResp => "HardPFResp",
            MemCmd::InvalidateReq => "InvalidateReq",
            MemCmd::UpgradeReq => "UpgradeReq",
            MemCmd::ReadExReq => "ReadExReq",
            MemCmd::ReadExResp => "ReadExResp",
        }
    }
}

impl fmt::Display for MemCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a packet is headed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dest {
    /// Route by address.
    Broadcast,
    /// Deliver to an explicit interconnect port (used for responses).
    Port(PortId),
}

/// Outcome recorded in a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketResult {
    Unknown,
    Success,
    BadAddress,
    Nacked,
}

/// Packet flags.
pub mod flags {
    /// The access was satisfied by a functional check of in-flight packets.
    pub const SATISFIED: u32 = 1 << 0;
    /// The line was nacked by a lower level; the response reports `Nacked`.
    pub const NACKED_LINE: u32 = 1 << 1;
}

/// Request flags.
pub mod req_flags {
    /// The access must bypass caches.
    pub const UNCACHEABLE: u32 = 1 << 0;
}

/// The request descriptor owning a packet: what the initiator asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    paddr: Addr,
    size: usize,
    flags: u32,
    time: Tick,
}

impl Request {
    /// Creates a request for `size` bytes at `paddr`, issued at `time`.
    pub fn new(paddr: Addr, size: usize, flags: u32, time: Tick) -> Self {
        Self {
            paddr,
            size,
            flags,
            time,
        }
    }

    pub fn paddr(&self) -> Addr {
        self.paddr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Tick the request was issued.
    pub fn time(&self) -> Tick {
        self.time
    }

    pub fn is_uncacheable(&self) -> bool {
        self.flags & req_flags::UNCACHEABLE != 0
    }
}

/// An addressed memory operation.
#[derive(Clone, Debug)]
pub struct Packet {
    /// Current command; a request becomes its response in place.
    pub cmd: MemCmd,
    addr: Addr,
    size: usize,
    data: Option<Vec<u8>>,
    src: Option<PortId>,
    dest: Dest,
    req: Rc<Request>,
    /// Tick at which this packet entered the component that owns it.
    pub time: Tick,
    /// Outcome, set when the packet becomes a response.
    pub result: PacketResult,
    /// See [`flags`].
    pub flags: u32,
    /// Opaque token an issuer attaches to find its bookkeeping again when
    /// the response comes back (for example an MSHR index).
    pub sender_state: Option<usize>,
}

impl Packet {
    /// Creates a packet for `req` carrying `cmd`.
    pub fn new(req: Rc<Request>, cmd: MemCmd, dest: Dest) -> Self {
        Self {
            cmd,
            addr: req.paddr(),
            size: req.size(),
            data: None,
            src: None,
            dest,
            time: req.time(),
            req,
            result: PacketResult::Unknown,
            flags: 0,
            sender_state: None,
        }
    }

    /// Creates a packet and wraps it in a shared handle.
    pub fn new_ptr(req: Rc<Request>, cmd: MemCmd, dest: Dest) -> PacketPtr {
        Rc::new(RefCell::new(Self::new(req, cmd, dest)))
    }

    /// Convenience: a broadcast packet for a fresh request.
    pub fn request(cmd: MemCmd, addr: Addr, size: usize, time: Tick) -> PacketPtr {
        Self::new_ptr(
            Rc::new(Request::new(addr, size, 0, time)),
            cmd,
            Dest::Broadcast,
        )
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The request this packet belongs to.
    pub fn req(&self) -> &Rc<Request> {
        &self.req
    }

    /// The port the packet last entered an interconnect through.
    pub fn src(&self) -> Option<PortId> {
        self.src
    }

    pub fn set_src(&mut self, src: PortId) {
        self.src = Some(src);
    }

    pub fn dest(&self) -> Dest {
        self.dest
    }

    pub fn set_dest(&mut self, dest: Dest) {
        self.dest = dest;
    }

    pub fn needs_response(&self) -> bool {
        self.cmd.needs_response()
    }

    pub fn is_request(&self) -> bool {
        self.cmd.is_request()
    }

    pub fn is_response(&self) -> bool {
        self.cmd.is_response()
    }

    pub fn is_read(&self) -> bool {
        self.cmd.is_read()
    }

    pub fn is_write(&self) -> bool {
        self.cmd.is_write()
    }

    pub fn is_invalidate(&self) -> bool {
        self.cmd.is_invalidate()
    }

    pub fn is_satisfied(&self) -> bool {
        self.flags & flags::SATISFIED != 0
    }

    pub fn cmd_string(&self) -> &'static str {
        self.cmd.as_str()
    }

    /// Payload, if one is attached.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Attaches a payload. It must be exactly `size` bytes.
    pub fn set_data(&mut self, data: Vec<u8>) {
        debug_assert_eq!(data.len(), self.size, "payload size mismatch");
        self.data = Some(data);
    }

    /// Payload, allocating a zeroed one of `size` bytes if none is attached.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        self.data.get_or_insert_with(|| vec![0; size])
    }

    /// Returns `true` if the byte ranges of the two packets overlap.
    pub fn intersects(&self, other: &Packet) -> bool {
        self.size > 0
            && other.size > 0
            && self.addr <= other.addr + (other.size as u64 - 1)
            && other.addr <= self.addr + (self.size as u64 - 1)
    }

    /// Turns a timing request into its response, addressed back to the port
    /// the request came in through.
    pub fn make_timing_response(&mut self) -> SimResult<()> {
        self.make_response()?;
        self.dest = match self.src.take() {
            Some(port) => Dest::Port(port),
            None => Dest::Broadcast,
        };
        Ok(())
    }

    /// Turns an atomic or functional request into its response.
    pub fn make_atomic_response(&mut self) -> SimResult<()> {
        self.make_response()
    }

    fn make_response(&mut self) -> SimResult<()> {
        let resp = self.cmd.response_command().ok_or_else(|| {
            SimError::protocol(
                format!("packet {:#x}", self.addr),
                format!("{} is not owed a response", self.cmd),
            )
        })?;
        self.cmd = resp;
        if self.result == PacketResult::Unknown {
            self.result = PacketResult::Success;
        }
        Ok(())
    }

    /// Reconciles a functional access (`self`) with a packet still in
    /// flight.
    ///
    /// A functional read picks up the bytes carried by an overlapping
    /// in-flight packet; a functional write updates the in-flight payload.
    /// Returns `true` when the functional read is fully satisfied and need
    /// not travel further.
    pub fn fix_functional(&mut self, in_flight: &mut Packet) -> bool {
        if !self.intersects(in_flight) || in_flight.data.is_none() {
            return false;
        }
        let lo = self.addr.max(in_flight.addr);
        let hi = (self.addr + self.size as u64).min(in_flight.addr + in_flight.size as u64);
        let len = (hi - lo) as usize;
        let mine = (lo - self.addr) as usize;
        let theirs = (lo - in_flight.addr) as usize;

        if self.is_read() {
            if let Some(src) = in_flight.data.as_deref() {
                let chunk = src[theirs..theirs + len].to_vec();
                self.data_mut()[mine..mine + len].copy_from_slice(&chunk);
            }
            let covered = lo == self.addr && len == self.size;
            if covered {
                self.flags |= flags::SATISFIED;
            }
            covered
        } else {
            if self.is_write() {
                if let (Some(src), Some(dst)) = (self.data.as_deref(), in_flight.data.as_mut()) {
                    dst[theirs..theirs + len].copy_from_slice(&src[mine..mine + len]);
                }
            }
            false
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} addr {:#x} size {} src {:?} dest {:?}",
            self.cmd, self.addr, self.size, self.src, self.dest
        )
    }
}
