//! Request/response cycles between a module and an engine
//!
//! The module side creates the arena and both pipes, then runs cycles:
//!
//! ```text
//! module                                  engine
//! encode -> arena.write
//! signal(EngineSignal)  ───────────────▶  wait(EngineSignal)
//!                                         arena.read -> decode -> infer
//!                                         encode -> arena.write
//! wait(ModuleSignal)    ◀───────────────  signal(ModuleSignal)
//! arena.read -> decode
//! ```
//!
//! Exactly one side touches the arena between two signals.

use crate::arena::SharedMemoryArena;
use crate::codec::{decode_reply, decode_request, encode_reply, encode_request, InputSpec, RequestFrame};
use crate::config::SessionConfig;
use crate::engine::InferenceEngine;
use crate::error::{BridgeError, Result};
use crate::handshake::{HandshakeChannel, Pipe};
use crate::tensor::TensorSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What one module cycle produced
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The engine replied with at least one well-formed output
    Outputs(TensorSet),
    /// The reply was empty or malformed; the session is still usable
    NoValidOutput { reason: String },
}

impl CycleOutcome {
    pub fn outputs(&self) -> Option<&TensorSet> {
        match self {
            CycleOutcome::Outputs(set) => Some(set),
            CycleOutcome::NoValidOutput { .. } => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, CycleOutcome::Outputs(_))
    }
}

/// Module side of a session: owns the arena and the pipes
pub struct ModuleSession {
    channel: Option<HandshakeChannel>,
    arena: Option<SharedMemoryArena>,
    destroy_arena: bool,
    cycle_interval: Duration,
    poll_interval: Duration,
    cycles: u64,
}

impl ModuleSession {
    /// Create the arena, then the pipes
    pub fn start(config: &SessionConfig) -> Result<Self> {
        config.validate()?;

        let mut arena = SharedMemoryArena::create(config.shm_key()?, config.capacity)?;
        arena.set_destroy_on_close(config.destroy_arena_on_close);

        let channel = HandshakeChannel::create(
            config.engine_pipe_path(),
            config.module_pipe_path(),
            config.timeouts(),
        )?;

        log::info!(
            "Module session started: arena id={} capacity={}",
            arena.id(),
            arena.capacity()
        );
        Ok(Self {
            channel: Some(channel),
            arena: Some(arena),
            destroy_arena: config.destroy_arena_on_close,
            cycle_interval: config.cycle_interval(),
            poll_interval: config.timeouts().poll_interval,
            cycles: 0,
        })
    }

    /// Abort waits and the polling loop once `flag` is raised
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        if let Some(channel) = self.channel.as_mut() {
            channel.set_cancel(Some(flag));
        }
        self
    }

    /// Segment id of the arena, for peers that attach by id
    pub fn arena_id(&self) -> Option<i32> {
        self.arena.as_ref().map(SharedMemoryArena::id)
    }

    /// Number of completed cycles
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run the opening probe exchange with the engine
    pub fn connect(&self) -> Result<()> {
        self.parts()?.0.connect()
    }

    /// One full request/response cycle
    ///
    /// A malformed or empty reply is reported as
    /// [`CycleOutcome::NoValidOutput`]; pipe and capacity failures are errors.
    pub fn run_cycle(&mut self, request: &RequestFrame) -> Result<CycleOutcome> {
        let payload = encode_request(request)?;
        let (channel, arena) = self.parts_mut()?;

        arena.write(&payload)?;
        log::debug!(
            "Request of {} tensors ({} bytes) written",
            request.tensors.len(),
            payload.len()
        );
        channel.signal(Pipe::EngineSignal)?;
        channel.wait(Pipe::ModuleSignal)?;

        let outcome = match arena.read().and_then(|reply| {
            if reply.is_empty() {
                Err(BridgeError::Format("engine sent an empty reply".into()))
            } else {
                decode_reply(&reply)
            }
        }) {
            Ok(outputs) if outputs.is_empty() => CycleOutcome::NoValidOutput {
                reason: "reply has no outputs".into(),
            },
            Ok(outputs) => CycleOutcome::Outputs(outputs),
            Err(e) if e.is_format_error() => CycleOutcome::NoValidOutput {
                reason: e.to_string(),
            },
            Err(e) => return Err(e),
        };

        self.cycles += 1;
        match &outcome {
            CycleOutcome::Outputs(outputs) => {
                log::debug!("Cycle {}: {} outputs", self.cycles, outputs.len())
            }
            CycleOutcome::NoValidOutput { reason } => {
                log::warn!("Cycle {}: no valid output ({})", self.cycles, reason)
            }
        }
        Ok(outcome)
    }

    /// Run cycles until `next_request` returns `None` or the cancel flag is raised
    ///
    /// Returns the number of cycles run. Interruption ends the loop cleanly;
    /// every other error ends it with that error.
    pub fn run_polling<F, G>(&mut self, mut next_request: F, mut on_outcome: G) -> Result<u64>
    where
        F: FnMut() -> Option<RequestFrame>,
        G: FnMut(CycleOutcome),
    {
        let mut completed = 0;
        while !self.is_cancelled() {
            let Some(request) = next_request() else {
                break;
            };
            match self.run_cycle(&request) {
                Ok(outcome) => on_outcome(outcome),
                Err(e) if e.is_interrupted() => {
                    log::info!("Polling interrupted after {} cycles", completed);
                    break;
                }
                Err(e) => return Err(e),
            }
            completed += 1;
            self.pause();
        }
        Ok(completed)
    }

    /// Detach (or destroy) the arena and remove the pipes
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn is_cancelled(&self) -> bool {
        self.channel.as_ref().map_or(true, HandshakeChannel::is_cancelled)
    }

    fn pause(&self) {
        let deadline = Instant::now() + self.cycle_interval;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.is_cancelled() {
                return;
            }
            std::thread::sleep(remaining.min(self.poll_interval));
        }
    }

    fn parts(&self) -> Result<(&HandshakeChannel, &SharedMemoryArena)> {
        match (&self.channel, &self.arena) {
            (Some(channel), Some(arena)) => Ok((channel, arena)),
            _ => Err(BridgeError::Config("session is closed".into())),
        }
    }

    fn parts_mut(&mut self) -> Result<(&HandshakeChannel, &mut SharedMemoryArena)> {
        match (&self.channel, &mut self.arena) {
            (Some(channel), Some(arena)) => Ok((channel, arena)),
            _ => Err(BridgeError::Config("session is closed".into())),
        }
    }

    fn release(&mut self) -> Result<()> {
        if self.arena.is_none() && self.channel.is_none() {
            return Ok(());
        }
        let mut result = Ok(());
        if let Some(arena) = self.arena.take() {
            let released = if self.destroy_arena {
                arena.destroy()
            } else {
                arena.close()
            };
            if let Err(e) = released {
                log::error!("{}", e);
                result = Err(e);
            }
        }
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.remove() {
                log::error!("{}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        if result.is_ok() {
            log::info!("Module session closed after {} cycles", self.cycles);
        }
        result
    }
}

impl Drop for ModuleSession {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Engine side of a session: attaches to what the module created
pub struct EngineSession {
    channel: HandshakeChannel,
    arena: SharedMemoryArena,
    inputs: Vec<InputSpec>,
    cycles: u64,
}

impl EngineSession {
    /// Attach to the arena (by id if configured, else by key) and open the pipes
    pub fn attach(config: &SessionConfig) -> Result<Self> {
        config.validate()?;

        let arena = match config.shm_id {
            Some(id) => SharedMemoryArena::attach_id(id)?,
            None => SharedMemoryArena::attach(config.shm_key()?)?,
        };
        let channel = HandshakeChannel::open(
            config.engine_pipe_path(),
            config.module_pipe_path(),
            config.timeouts(),
        )?;

        log::info!("Engine session attached: arena id={}", arena.id());
        Ok(Self {
            channel,
            arena,
            inputs: config.inputs.clone(),
            cycles: 0,
        })
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.channel.set_cancel(Some(flag));
        self
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Answer the module's opening probe
    pub fn accept(&self) -> Result<()> {
        self.channel.accept()
    }

    /// Wait for one request, answer it with `handler`, hand the turn back
    ///
    /// If decoding, the handler or encoding fails, an empty reply is sent so
    /// the module is not left waiting, and the error is returned.
    pub fn serve_cycle<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnOnce(RequestFrame) -> Result<TensorSet>,
    {
        let idle = self.channel.timeouts().connect;
        self.channel.wait_within(Pipe::EngineSignal, idle)?;

        let reply = self
            .arena
            .read()
            .and_then(|payload| decode_request(&payload, &self.inputs))
            .and_then(handler)
            .and_then(|outputs| encode_reply(&outputs))
            .and_then(|reply| self.arena.write(&reply));
        self.cycles += 1;

        if let Err(e) = reply {
            log::warn!("Cycle {}: sending empty reply: {}", self.cycles, e);
            self.arena.write(&[])?;
            self.channel.signal(Pipe::ModuleSignal)?;
            return Err(e);
        }

        self.channel.signal(Pipe::ModuleSignal)
    }

    /// Serve one cycle with `engine`, releasing its outputs afterwards
    pub fn serve_engine<E>(&mut self, engine: &mut E) -> Result<()>
    where
        E: InferenceEngine + ?Sized,
    {
        self.serve_cycle(|request| {
            let outputs = engine.infer(&request.tensors);
            engine.cleanup()?;
            outputs
        })
    }

    /// Detach from the arena; the pipes belong to the module
    pub fn close(self) -> Result<()> {
        self.arena.close()
    }
}
