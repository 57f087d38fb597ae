//! tensor_bridge - Cross-process tensor exchange over FIFOs and SysV shared memory
//!
//! A **module** process produces tensors and an **engine** process runs
//! inference on them. Bulk data travels through one shared memory arena;
//! two named pipes carry one-byte signals that decide whose turn it is.
//!
//! # Architecture
//!
//! - **Arena**: fixed-capacity segment holding one `[u32 LE length][payload]` frame
//! - **Handshake**: edge-triggered signals over `engine_pipe` / `module_pipe`
//! - **Codec**: MessagePack request stream and reply record
//! - **Marshal**: `ndarray` values <-> flat descriptors <-> the engine's C aggregate
//! - **Session**: one request/response cycle per turn, module or engine side
//! - **Worker**: one thread per native engine instance

pub mod arena;
pub mod codec;
pub mod config;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod marshal;
pub mod session;
pub mod shm;
pub mod tensor;
pub mod worker;

pub use arena::SharedMemoryArena;
pub use codec::{InputSpec, RequestFrame};
pub use config::{SessionConfig, WorkerConfig};
pub use dtype::DType;
pub use engine::{InferenceEngine, Isolation, NativeEngine};
pub use error::{BridgeError, ErrorCategory, Result};
pub use handshake::{HandshakeChannel, Pipe};
pub use marshal::TensorValue;
pub use session::{CycleOutcome, EngineSession, ModuleSession};
pub use tensor::{TensorDescriptor, TensorSet};
pub use worker::{EngineWorker, Task};
