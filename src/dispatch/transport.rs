//! Request/response channel to accelerator firmware.
//!
//! The protocol is a fixed set of opcodes. Every message is framed as a
//! little-endian `u32` length followed by an rkyv archive. Responses carry
//! the sequence number of the request they answer; anything older than the
//! request in flight is a leftover from a timed-out call and is dropped.

use crate::config::ComputeDomain;
use crate::error::{DispatchError, Result};
use kanal::{ReceiveErrorTimeout, Receiver, Sender};
use rkyv::rancor;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const LENGTH_PREFIX: usize = std::mem::size_of::<u32>();

/// Firmware operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum Opcode {
    /// Open a driver handle. Returns the handle as `U64`.
    GetHandle,
    /// Load a model. Takes the path as `Bytes`, returns the model as `U64`.
    LoadModel,
    /// Run one sample. Takes model `U64`, input and output `AddrList`s.
    RunModel,
    /// Run a batch. Takes model `U64`, sample count `U32`, input and output
    /// `AddrList`s.
    RunBatchModel,
    /// Wait for the last run to finish.
    WaitDone,
    /// Query the driver. Returns a status word as `U32`.
    GetStatus,
}

/// Request or response argument.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum Param {
    /// 32-bit word.
    U32(u32),
    /// 64-bit word.
    U64(u64),
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// Physical addresses.
    AddrList(Vec<u64>),
}

impl Param {
    /// The value, if this is a `U32`.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Param::U32(v) => Some(*v),
            _ => None,
        }
    }

    /// The value, if this is a `U64`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Param::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// The value, if this is `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Param::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// The value, if this is an `AddrList`.
    pub fn as_addr_list(&self) -> Option<&[u64]> {
        match self {
            Param::AddrList(v) => Some(v),
            _ => None,
        }
    }
}

/// Message to firmware.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct Request {
    /// Sequence number, assigned by the transport.
    pub seq: u64,
    /// Domain the request is for.
    pub domain: ComputeDomain,
    /// Operation.
    pub opcode: Opcode,
    /// Arguments.
    pub params: Vec<Param>,
}

impl Request {
    /// Create a request; the transport fills in `seq`.
    pub fn new(opcode: Opcode, params: Vec<Param>) -> Self {
        Self {
            seq: 0,
            domain: ComputeDomain::Accelerator,
            opcode,
            params,
        }
    }

    /// Encode as a length-prefixed frame.
    pub fn encode(&self) -> std::result::Result<Vec<u8>, DispatchError> {
        let body = rkyv::to_bytes::<rancor::Error>(self).map_err(|_| DispatchError::MessageLost)?;
        frame(&body)
    }

    /// Decode a length-prefixed frame.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, DispatchError> {
        let body = unframe(bytes)?;
        rkyv::from_bytes::<Self, rancor::Error>(&body).map_err(|_| DispatchError::MessageLost)
    }
}

/// Message from firmware.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct Response {
    /// Sequence number of the request answered.
    pub seq: u64,
    /// Errno-style status, 0 on success.
    pub status: i32,
    /// Results.
    pub outputs: Vec<Param>,
}

impl Response {
    /// Encode as a length-prefixed frame.
    pub fn encode(&self) -> std::result::Result<Vec<u8>, DispatchError> {
        let body = rkyv::to_bytes::<rancor::Error>(self).map_err(|_| DispatchError::MessageLost)?;
        frame(&body)
    }

    /// Decode a length-prefixed frame.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, DispatchError> {
        let body = unframe(bytes)?;
        rkyv::from_bytes::<Self, rancor::Error>(&body).map_err(|_| DispatchError::MessageLost)
    }

    /// Translate the status, returning the outputs on success.
    pub fn into_result(self) -> std::result::Result<Vec<Param>, DispatchError> {
        match self.status {
            0 => Ok(self.outputs),
            errno => Err(DispatchError::from_errno(errno)),
        }
    }
}

fn frame(body: &[u8]) -> std::result::Result<Vec<u8>, DispatchError> {
    let len = u32::try_from(body.len()).map_err(|_| DispatchError::MessageLost)?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

fn unframe(bytes: &[u8]) -> std::result::Result<AlignedVec, DispatchError> {
    let (prefix, body) = bytes
        .split_first_chunk::<LENGTH_PREFIX>()
        .ok_or(DispatchError::MessageLost)?;
    if u32::from_le_bytes(*prefix) as usize != body.len() {
        return Err(DispatchError::MessageLost);
    }
    // Archives must be read from aligned memory.
    let mut aligned = AlignedVec::with_capacity(body.len());
    aligned.extend_from_slice(body);
    Ok(aligned)
}

// =============================================================================
// Transport
// =============================================================================

/// Synchronous request/response link to firmware.
pub trait Transport: Send + Sync {
    /// Send `request` and wait up to `timeout` for its response.
    fn rpc(&self, request: Request, timeout: Duration) -> std::result::Result<Response, DispatchError>;
}

/// Firmware behind a [`ChannelTransport`].
pub trait FirmwareService: Send + 'static {
    /// Handle one request, returning its outputs or an errno.
    fn handle(&mut self, request: &Request) -> std::result::Result<Vec<Param>, i32>;
}

struct Client {
    next_seq: u64,
    requests: Option<Sender<Vec<u8>>>,
    responses: Receiver<Vec<u8>>,
}

/// Transport to a [`FirmwareService`] running on its own thread.
pub struct ChannelTransport {
    client: Mutex<Client>,
    worker: Option<JoinHandle<()>>,
}

impl ChannelTransport {
    /// Start serving `service`.
    pub fn spawn<S: FirmwareService>(service: S) -> Result<Self> {
        let (request_tx, request_rx) = kanal::bounded::<Vec<u8>>(1);
        let (response_tx, response_rx) = kanal::unbounded::<Vec<u8>>();
        let worker = std::thread::Builder::new()
            .name("edgeflow-firmware".into())
            .spawn(move || serve(service, request_rx, response_tx))?;
        Ok(Self {
            client: Mutex::new(Client {
                next_seq: 1,
                requests: Some(request_tx),
                responses: response_rx,
            }),
            worker: Some(worker),
        })
    }
}

fn serve<S: FirmwareService>(mut service: S, requests: Receiver<Vec<u8>>, responses: Sender<Vec<u8>>) {
    while let Ok(bytes) = requests.recv() {
        let request = match Request::decode(&bytes) {
            Ok(request) => request,
            Err(_) => {
                tracing::warn!(len = bytes.len(), "dropping undecodable firmware request");
                continue;
            }
        };
        let response = match service.handle(&request) {
            Ok(outputs) => Response {
                seq: request.seq,
                status: 0,
                outputs,
            },
            Err(status) => Response {
                seq: request.seq,
                status,
                outputs: Vec::new(),
            },
        };
        let Ok(frame) = response.encode() else {
            tracing::warn!(seq = request.seq, "dropping unencodable firmware response");
            continue;
        };
        if responses.send(frame).is_err() {
            break;
        }
    }
}

impl Transport for ChannelTransport {
    fn rpc(&self, mut request: Request, timeout: Duration) -> std::result::Result<Response, DispatchError> {
        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        request.seq = client.next_seq;
        client.next_seq += 1;

        let frame = request.encode()?;
        let deadline = Instant::now().checked_add(timeout);
        client
            .requests
            .as_ref()
            .ok_or(DispatchError::MessageLost)?
            .send(frame)
            .map_err(|_| DispatchError::MessageLost)?;

        loop {
            let received = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    client.responses.recv_timeout(remaining)
                }
                None => client.responses.recv().map_err(|_| ReceiveErrorTimeout::Closed),
            };
            let bytes = match received {
                Ok(bytes) => bytes,
                Err(ReceiveErrorTimeout::Timeout) => {
                    tracing::warn!(seq = request.seq, opcode = ?request.opcode, "firmware request timed out");
                    return Err(DispatchError::Timeout);
                }
                Err(_) => return Err(DispatchError::MessageLost),
            };
            let response = Response::decode(&bytes)?;
            if response.seq < request.seq {
                tracing::debug!(stale = response.seq, seq = request.seq, "discarding stale firmware response");
                continue;
            }
            if response.seq != request.seq {
                return Err(DispatchError::MessageLost);
            }
            return Ok(response);
        }
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.client
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::warn!("firmware worker exited abnormally");
        }
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport").finish_non_exhaustive()
    }
}
