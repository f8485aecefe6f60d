//! Session-control payload parsing (§6.2, C10). The wire format of
//! the control channel itself (IPC framing, command ids) is named out
//! of scope in §1; this module only owns the payload that arrives
//! already framed and dispatched as `CollectTracing`/`CollectTracing2`/
//! `StopTracing`.

use crate::configuration::ProviderConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::{EnableRequest, Pipeline};
use crate::session::SessionMode;
use crate::stream_writer::StreamWriter;
use eventpipe_wire::FormatVersion;
use std::sync::Arc;

/// One provider entry as it arrives over the wire: `keywords`/`level`
/// are validated together with every other entry in the same command
/// before any of them is applied (§6.2: "rejects the whole command").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProviderConfig {
    pub provider_name: String,
    pub keywords: u64,
    pub level: u32,
    /// Free-form per-provider filter string (e.g. `EventCounterIntervalSec=1`).
    /// Accepted on the wire but this crate has no filter-argument
    /// consumer; see `DESIGN.md`.
    pub filter_data: Option<String>,
}

impl RawProviderConfig {
    fn into_provider_config(self) -> Result<ProviderConfig> {
        if self.provider_name.trim().is_empty() {
            return Err(PipelineError::InvalidProviderConfig(
                "provider name must not be empty",
            ));
        }
        if self.level > 5 {
            return Err(PipelineError::InvalidProviderConfig(
                "level must be in 0..=5",
            ));
        }
        Ok(ProviderConfig {
            name: self.provider_name,
            keywords: self.keywords,
            level: self.level as u8,
        })
    }
}

/// `CollectTracing`/`CollectTracing2` request body (§6.2). `CollectTracing`
/// on the wire omits `rundown_requested` (it always implies rundown);
/// `CollectTracing2` carries it explicitly.
pub struct CollectTracingRequest {
    pub circular_buffer_mb: usize,
    pub format: FormatVersion,
    pub rundown_requested: bool,
    pub providers: Vec<RawProviderConfig>,
}

/// Validates and applies session-control commands against a
/// `Pipeline`. Holds no state of its own; everything lives on the
/// pipeline.
pub struct ProtocolHelper {
    pipeline: Arc<Pipeline>,
}

impl ProtocolHelper {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    /// `CollectTracing` (§6.2): rundown is implied.
    pub fn collect_tracing(
        &self,
        circular_buffer_mb: usize,
        format: FormatVersion,
        providers: Vec<RawProviderConfig>,
        sink: Box<dyn StreamWriter>,
    ) -> Result<u64> {
        self.collect_tracing2(
            CollectTracingRequest {
                circular_buffer_mb,
                format,
                rundown_requested: true,
                providers,
            },
            sink,
        )
    }

    /// `CollectTracing2` (§6.2): validates every provider entry before
    /// applying any of them, then enables the session and (for
    /// `IpcStream` delivery) starts the streaming thread immediately,
    /// matching `dotnet-trace`'s observed behavior of pushing bytes as
    /// soon as the session exists.
    pub fn collect_tracing2(
        &self,
        req: CollectTracingRequest,
        sink: Box<dyn StreamWriter>,
    ) -> Result<u64> {
        let mut providers = Vec::with_capacity(req.providers.len());
        for raw in req.providers {
            providers.push(raw.into_provider_config()?);
        }

        let session_id = self.pipeline.enable_checked(EnableRequest {
            sink: Some(sink),
            mode: SessionMode::IpcStream,
            circular_buffer_mb: req.circular_buffer_mb,
            format: req.format,
            rundown_requested: req.rundown_requested,
            providers,
        })?;
        self.pipeline.start_streaming(session_id)?;
        Ok(session_id)
    }

    /// `StopTracing` (§6.2). Idempotent on an unknown or already-closed
    /// session id, matching `Pipeline::disable`.
    pub fn stop_tracing(&self, session_id: u64) {
        self.pipeline.disable(session_id);
    }
}
