//! Wire protocol message types
//!
//! Defines the fixed-layout request/response records exchanged between
//! runtime clients and the device service. Every message is exactly one
//! packed little-endian record with no length prefix; the receiving side
//! knows the size from the direction it reads.
//!
//! Request and response opcodes live in two separate enumerations whose
//! numeric ranges partially overlap (both use 1001 for `CLOSE`). The two
//! records have different sizes, so a frame delivered to the wrong
//! direction fails to decode instead of being misread.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::common::{Error, Result};

/// Sequence id carried by locally generated wake-up (synthetic close) messages
pub(crate) const WAKE_SEQ_ID: i32 = i32::MIN;

/// Identifies the logical recipient sharing one physical channel
///
/// On the message-queue backend this is the queue message type; clients
/// default to their process id and the service listens on [`RoutingKey::SERVER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(pub i64);

impl RoutingKey {
    /// Key every request is addressed to on the to-server queue
    pub const SERVER: RoutingKey = RoutingKey(101);

    /// Default key for a client: the current process id
    pub fn current_process() -> Self {
        RoutingKey(i64::from(std::process::id()))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RoutingKey {
    fn from(value: i64) -> Self {
        RoutingKey(value)
    }
}

/// Generates an opcode enum with a lossless `Unknown(u32)` fallback
macro_rules! opcodes {
    (
        $(#[$meta:meta])*
        pub enum $name:ident ($unknown:literal) {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal => $label:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// Code outside the catalog, kept verbatim so re-encoding is lossless
            Unknown(u32),
        }

        impl $name {
            /// Every cataloged code, in numeric order
            pub const ALL: &'static [$name] = &[ $( $name::$variant, )+ ];

            pub fn from_raw(raw: u32) -> Self {
                match raw {
                    $( $value => $name::$variant, )+
                    other => $name::Unknown(other),
                }
            }

            pub fn as_raw(self) -> u32 {
                match self {
                    $( $name::$variant => $value, )+
                    $name::Unknown(raw) => raw,
                }
            }

            /// Canonical upper-case name, or the unknown marker
            pub fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                    $name::Unknown(_) => $unknown,
                }
            }

            pub fn is_known(self) -> bool {
                !matches!(self, $name::Unknown(_))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $name::Unknown(raw) => write!(f, "{}({})", $unknown, raw),
                    known => f.write_str(known.name()),
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            /// Accepts a canonical name (any case) or a numeric code
            fn from_str(s: &str) -> Result<Self> {
                if let Some(code) = $name::ALL.iter().find(|c| c.name().eq_ignore_ascii_case(s)) {
                    return Ok(*code);
                }
                s.parse::<u32>().map($name::from_raw).map_err(|_| {
                    Error::Config(format!("unrecognized opcode '{}'", s))
                })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }
    };
}

opcodes! {
    /// Opcodes sent from a client to the service
    pub enum RequestCode ("REQUEST_UNKNOWN") {
        /// `data` carries the process id
        RegisterProcess = 0 => "REGISTER_PROCESS",
        /// `data` carries the requested size
        GetMemory = 1 => "GET_MEMORY",
        /// `data` carries an offset returned by `GetMemory`
        FreeMemory = 2 => "FREE_MEMORY",
        /// Allocates from the top of device memory
        GetMemoryForModel = 3 => "GET_MEMORY_FOR_MODEL",
        DeviceInit = 4 => "DEVICE_INIT",
        DeviceReset = 5 => "DEVICE_RESET",
        DeviceDeinit = 6 => "DEVICE_DEINIT",
        TaskInit = 7 => "TASK_INIT",
        TaskDeinit = 8 => "TASK_DEINIT",
        DeallocateTaskMemory = 9 => "DEALLOCATE_TASK_MEMORY",
        /// Process cleanup
        ProcessDeinit = 10 => "PROCESS_DEINIT",
        ViewFreeMemory = 11 => "VIEW_FREE_MEMORY",
        ViewUsedMemory = 12 => "VIEW_USED_MEMORY",
        ViewAvailableDevice = 15 => "VIEW_AVAILABLE_DEVICE",
        GetUsage = 17 => "GET_USAGE",
        MemoryAllocationAndTransferModel = 100 => "MEMORY_ALLOCATION_AND_TRANSFER_MODEL",
        CompleteTransferModel = 101 => "COMPLETE_TRANSFER_MODEL",
        MemoryAllocationInputAndOutput = 102 => "MEMORY_ALLOCATION_INPUT_AND_OUTPUT",
        TransferInputAndRun = 103 => "TRANSFER_INPUT_AND_RUN",
        CompleteTransferAndRun = 104 => "COMPLETE_TRANSFER_AND_RUN",
        CompleteTransferOutput = 105 => "COMPLETE_TRANSFER_OUTPUT",
        RequestScheduleInference = 301 => "REQUEST_SCHEDULE_INFERENCE",
        InferenceCompleted = 302 => "INFERENCE_COMPLETED",
        Close = 1001 => "CLOSE",
    }
}

opcodes! {
    /// Opcodes sent from the service to a client
    pub enum ResponseCode ("RESPONSE_UNKNOWN") {
        ViewFreeMemoryResult = 13 => "VIEW_FREE_MEMORY_RESULT",
        ViewUsedMemoryResult = 14 => "VIEW_USED_MEMORY_RESULT",
        ViewAvailableDeviceResult = 16 => "VIEW_AVAILABLE_DEVICE_RESULT",
        GetUsageResult = 18 => "GET_USAGE_RESULT",
        ConfirmMemoryAllocationAndTransferModel = 200 => "CONFIRM_MEMORY_ALLOCATION_AND_TRANSFER_MODEL",
        /// `data` carries the allocated offset
        ConfirmMemoryAllocation = 201 => "CONFIRM_MEMORY_ALLOCATION",
        ConfirmTransferInputAndRun = 202 => "CONFIRM_TRANSFER_INPUT_AND_RUN",
        ConfirmMemoryFree = 203 => "CONFIRM_MEMORY_FREE",
        DoScheduledInferenceCh0 = 400 => "DO_SCHEDULED_INFERENCE_CH0",
        DoScheduledInferenceCh1 = 401 => "DO_SCHEDULED_INFERENCE_CH1",
        DoScheduledInferenceCh2 = 402 => "DO_SCHEDULED_INFERENCE_CH2",
        ErrorReport = 900 => "ERROR_REPORT",
        Close = 1001 => "CLOSE",
        InvalidRequestCode = 1234 => "INVALID_REQUEST_CODE",
    }
}

impl RequestCode {
    /// The response code the service answers this request with, if any
    ///
    /// Requests that are notifications (device/task lifecycle, transfer
    /// completion, inference scheduling) have no direct reply.
    pub fn reply_code(self) -> Option<ResponseCode> {
        match self {
            RequestCode::GetMemory | RequestCode::GetMemoryForModel => {
                Some(ResponseCode::ConfirmMemoryAllocation)
            }
            RequestCode::FreeMemory => Some(ResponseCode::ConfirmMemoryFree),
            RequestCode::ViewFreeMemory => Some(ResponseCode::ViewFreeMemoryResult),
            RequestCode::ViewUsedMemory => Some(ResponseCode::ViewUsedMemoryResult),
            RequestCode::ViewAvailableDevice => Some(ResponseCode::ViewAvailableDeviceResult),
            RequestCode::GetUsage => Some(ResponseCode::GetUsageResult),
            RequestCode::MemoryAllocationAndTransferModel => {
                Some(ResponseCode::ConfirmMemoryAllocationAndTransferModel)
            }
            RequestCode::TransferInputAndRun => Some(ResponseCode::ConfirmTransferInputAndRun),
            RequestCode::Close => Some(ResponseCode::Close),
            RequestCode::Unknown(_) => Some(ResponseCode::InvalidRequestCode),
            _ => None,
        }
    }
}

impl ResponseCode {
    /// Scheduled-inference code for a hardware DMA channel
    pub fn scheduled_inference(channel: u32) -> Self {
        match channel {
            1 => ResponseCode::DoScheduledInferenceCh1,
            2 => ResponseCode::DoScheduledInferenceCh2,
            _ => ResponseCode::DoScheduledInferenceCh0,
        }
    }
}

// === Frame encoding helpers ===

/// Appends little-endian fields to a frame buffer
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn put(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    fn i8(&mut self, v: i8) -> &mut Self {
        self.put(&v.to_le_bytes())
    }
    fn u16(&mut self, v: u16) -> &mut Self {
        self.put(&v.to_le_bytes())
    }
    fn i16(&mut self, v: i16) -> &mut Self {
        self.put(&v.to_le_bytes())
    }
    fn u32(&mut self, v: u32) -> &mut Self {
        self.put(&v.to_le_bytes())
    }
    fn i32(&mut self, v: i32) -> &mut Self {
        self.put(&v.to_le_bytes())
    }
    fn u64(&mut self, v: u64) -> &mut Self {
        self.put(&v.to_le_bytes())
    }
    fn i64(&mut self, v: i64) -> &mut Self {
        self.put(&v.to_le_bytes())
    }
}

/// Reads little-endian fields from a frame whose length was already checked
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn i8(&mut self) -> i8 {
        i8::from_le_bytes(self.take())
    }
    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }
    fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.take())
    }
    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }
    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }
    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take())
    }
}

/// A fixed-size record that crosses a channel as one message
pub trait WireRecord: Sized {
    /// Exact encoded size in bytes
    const SIZE: usize;

    fn write_fields(&self, w: &mut FrameWriter);

    fn read_fields(r: &mut FrameReader<'_>) -> Self;

    /// Routing key the record is addressed with
    fn routing_key(&self) -> RoutingKey;

    fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::with_capacity(Self::SIZE);
        self.write_fields(&mut w);
        debug_assert_eq!(w.buf.len(), Self::SIZE);
        w.buf
    }

    /// Decode one record; any length other than [`WireRecord::SIZE`] is malformed
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::MalformedFrame {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self::read_fields(&mut FrameReader::new(bytes)))
    }
}

// === Embedded device payloads ===

/// Device memory descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemInfo {
    pub data: u64,
    pub base: u64,
    pub offset: u32,
    pub size: u32,
}

impl MemInfo {
    const SIZE: usize = 24;

    fn write(&self, w: &mut FrameWriter) {
        w.u64(self.data).u64(self.base).u32(self.offset).u32(self.size);
    }

    fn read(r: &mut FrameReader<'_>) -> Self {
        Self {
            data: r.u64(),
            base: r.u64(),
            offset: r.u32(),
            size: r.u32(),
        }
    }
}

/// Number of checkpoint words in a device request
pub const CHECKPOINT_COUNT: usize = 3;

/// NPU inference request block carried inside a [`ClientMessage`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceRequest {
    pub req_id: u32,
    pub task_id: u32,
    pub input: MemInfo,
    pub output: MemInfo,
    pub npu_id: i16,
    pub model_type: i8,
    pub model_format: i8,
    pub model_cmds: u32,
    pub cmd_offset: u32,
    pub weight_offset: u32,
    pub checkpoints: [u32; CHECKPOINT_COUNT],
    pub dma_ch: i32,
    /// 1 for large-model operation
    pub op_mode: u32,
    pub custom_offset: u32,
    pub proc_id: u32,
    pub prior: u32,
    pub prior_level: u32,
    pub bandwidth: u32,
    pub bound: u32,
    pub queue: u32,
}

impl DeviceRequest {
    const SIZE: usize = 8 + 2 * MemInfo::SIZE + 4 + 12 + 4 * CHECKPOINT_COUNT + 4 + 8 * 4;

    fn write(&self, w: &mut FrameWriter) {
        w.u32(self.req_id).u32(self.task_id);
        self.input.write(w);
        self.output.write(w);
        w.i16(self.npu_id)
            .i8(self.model_type)
            .i8(self.model_format)
            .u32(self.model_cmds)
            .u32(self.cmd_offset)
            .u32(self.weight_offset);
        for word in self.checkpoints {
            w.u32(word);
        }
        w.i32(self.dma_ch)
            .u32(self.op_mode)
            .u32(self.custom_offset)
            .u32(self.proc_id)
            .u32(self.prior)
            .u32(self.prior_level)
            .u32(self.bandwidth)
            .u32(self.bound)
            .u32(self.queue);
    }

    fn read(r: &mut FrameReader<'_>) -> Self {
        Self {
            req_id: r.u32(),
            task_id: r.u32(),
            input: MemInfo::read(r),
            output: MemInfo::read(r),
            npu_id: r.i16(),
            model_type: r.i8(),
            model_format: r.i8(),
            model_cmds: r.u32(),
            cmd_offset: r.u32(),
            weight_offset: r.u32(),
            checkpoints: [r.u32(), r.u32(), r.u32()],
            dma_ch: r.i32(),
            op_mode: r.u32(),
            custom_offset: r.u32(),
            proc_id: r.u32(),
            prior: r.u32(),
            prior_level: r.u32(),
            bandwidth: r.u32(),
            bound: r.u32(),
            queue: r.u32(),
        }
    }
}

/// NPU completion block carried inside a [`ServerMessage`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceResponse {
    pub req_id: u32,
    pub inf_time: u32,
    pub argmax: u16,
    pub model_type: u16,
    pub status: i32,
    pub ppu_filter_num: u32,
    pub proc_id: u32,
    pub queue: u32,
    pub dma_ch: i32,
    /// KB/s
    pub ddr_wr_bw: u32,
    /// KB/s
    pub ddr_rd_bw: u32,
    pub wait_timestamp: u64,
    pub wait_start_time: u64,
    pub wait_end_time: u64,
}

impl DeviceResponse {
    const SIZE: usize = 8 + 4 + 4 * 7 + 3 * 8;

    fn write(&self, w: &mut FrameWriter) {
        w.u32(self.req_id)
            .u32(self.inf_time)
            .u16(self.argmax)
            .u16(self.model_type)
            .i32(self.status)
            .u32(self.ppu_filter_num)
            .u32(self.proc_id)
            .u32(self.queue)
            .i32(self.dma_ch)
            .u32(self.ddr_wr_bw)
            .u32(self.ddr_rd_bw)
            .u64(self.wait_timestamp)
            .u64(self.wait_start_time)
            .u64(self.wait_end_time);
    }

    fn read(r: &mut FrameReader<'_>) -> Self {
        Self {
            req_id: r.u32(),
            inf_time: r.u32(),
            argmax: r.u16(),
            model_type: r.u16(),
            status: r.i32(),
            ppu_filter_num: r.u32(),
            proc_id: r.u32(),
            queue: r.u32(),
            dma_ch: r.i32(),
            ddr_wr_bw: r.u32(),
            ddr_rd_bw: r.u32(),
            wait_timestamp: r.u64(),
            wait_start_time: r.u64(),
            wait_end_time: r.u64(),
        }
    }
}

// === Top-level records ===

/// Request record sent from a client to the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClientMessage {
    pub code: RequestCode,
    pub device_id: u32,
    /// Generic payload: size, offset or pid depending on `code`
    pub data: u64,
    pub pid: i32,
    /// Stamped by the client endpoint before sending
    pub routing_key: RoutingKey,
    pub seq_id: i32,
    pub npu_acc: DeviceRequest,
    /// -1 when the request is not bound to a task
    pub task_id: i32,
    pub model_memory_size: u64,
}

impl Default for ClientMessage {
    fn default() -> Self {
        Self {
            code: RequestCode::RegisterProcess,
            device_id: 0,
            data: 0,
            pid: 0,
            routing_key: RoutingKey(0),
            seq_id: 0,
            npu_acc: DeviceRequest::default(),
            task_id: -1,
            model_memory_size: 0,
        }
    }
}

impl ClientMessage {
    /// A request from the current process
    pub fn new(code: RequestCode) -> Self {
        Self {
            code,
            pid: std::process::id() as i32,
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_data(mut self, data: u64) -> Self {
        self.data = data;
        self
    }

    pub(crate) fn wake_up(key: RoutingKey, token: u64) -> Self {
        Self {
            code: RequestCode::Close,
            routing_key: key,
            seq_id: WAKE_SEQ_ID,
            data: token,
            ..Self::default()
        }
    }

    /// Any locally generated wake-up, regardless of which stop issued it
    pub(crate) fn is_wake_up(&self) -> bool {
        self.code == RequestCode::Close && self.seq_id == WAKE_SEQ_ID
    }
}

impl WireRecord for ClientMessage {
    const SIZE: usize = 4 + 4 + 8 + 4 + 8 + 4 + DeviceRequest::SIZE + 4 + 8;

    fn write_fields(&self, w: &mut FrameWriter) {
        w.u32(self.code.as_raw())
            .u32(self.device_id)
            .u64(self.data)
            .i32(self.pid)
            .i64(self.routing_key.0)
            .i32(self.seq_id);
        self.npu_acc.write(w);
        w.i32(self.task_id).u64(self.model_memory_size);
    }

    fn read_fields(r: &mut FrameReader<'_>) -> Self {
        Self {
            code: RequestCode::from_raw(r.u32()),
            device_id: r.u32(),
            data: r.u64(),
            pid: r.i32(),
            routing_key: RoutingKey(r.i64()),
            seq_id: r.i32(),
            npu_acc: DeviceRequest::read(r),
            task_id: r.i32(),
            model_memory_size: r.u64(),
        }
    }

    fn routing_key(&self) -> RoutingKey {
        self.routing_key
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-message code={} key={}", self.code, self.routing_key)
    }
}

/// Response record sent from the service to one client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerMessage {
    pub code: ResponseCode,
    pub device_id: u32,
    /// 0 on success; `u32::MAX` reports a failure
    pub result: u32,
    pub data: u64,
    /// Recipient; copied from the request being answered
    pub routing_key: RoutingKey,
    pub seq_id: i32,
    pub npu_resp: DeviceResponse,
}

impl Default for ServerMessage {
    fn default() -> Self {
        Self {
            code: ResponseCode::Close,
            device_id: 0,
            result: 0,
            data: 0,
            routing_key: RoutingKey(0),
            seq_id: 0,
            npu_resp: DeviceResponse::default(),
        }
    }
}

impl ServerMessage {
    pub fn new(code: ResponseCode, routing_key: RoutingKey) -> Self {
        Self {
            code,
            routing_key,
            ..Self::default()
        }
    }

    /// Start a response addressed back to the sender of `request`
    pub fn reply_to(request: &ClientMessage, code: ResponseCode) -> Self {
        Self {
            code,
            device_id: request.device_id,
            routing_key: request.routing_key,
            seq_id: request.seq_id,
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: u64) -> Self {
        self.data = data;
        self
    }

    pub fn with_result(mut self, result: u32) -> Self {
        self.result = result;
        self
    }

    pub(crate) fn wake_up(key: RoutingKey, token: u64) -> Self {
        Self {
            code: ResponseCode::Close,
            routing_key: key,
            seq_id: WAKE_SEQ_ID,
            data: token,
            ..Self::default()
        }
    }

    pub(crate) fn is_wake_up(&self) -> bool {
        self.code == ResponseCode::Close && self.seq_id == WAKE_SEQ_ID
    }
}

impl WireRecord for ServerMessage {
    const SIZE: usize = 4 + 4 + 4 + 8 + 8 + 4 + DeviceResponse::SIZE;

    fn write_fields(&self, w: &mut FrameWriter) {
        w.u32(self.code.as_raw())
            .u32(self.device_id)
            .u32(self.result)
            .u64(self.data)
            .i64(self.routing_key.0)
            .i32(self.seq_id);
        self.npu_resp.write(w);
    }

    fn read_fields(r: &mut FrameReader<'_>) -> Self {
        Self {
            code: ResponseCode::from_raw(r.u32()),
            device_id: r.u32(),
            result: r.u32(),
            data: r.u64(),
            routing_key: RoutingKey(r.i64()),
            seq_id: r.i32(),
            npu_resp: DeviceResponse::read(r),
        }
    }

    fn routing_key(&self) -> RoutingKey {
        self.routing_key
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-message code={} key={}", self.code, self.routing_key)
    }
}
