//! Example Engine Host (consumer side)
//!
//! Loads a native engine library, attaches to the module's arena and answers
//! one request per cycle until Ctrl+C.
//!
//! Usage: `engine_host <libengine.so> <model> [config.toml] [arena-id]`

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tensor_bridge::{
    BridgeError, DType, EngineSession, InferenceEngine, InputSpec, Isolation, NativeEngine, SessionConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <libengine.so> <model> [config.toml] [arena-id]", args[0]);
        std::process::exit(2);
    }
    let library = PathBuf::from(&args[1]);
    let model = PathBuf::from(&args[2]);

    let mut config = match args.get(3) {
        Some(path) => SessionConfig::from_file(path.as_ref())?,
        None => SessionConfig::default(),
    };
    if let Some(id) = args.get(4) {
        config.shm_id = Some(id.parse()?);
    }
    if config.inputs.is_empty() {
        config.inputs = vec![
            InputSpec::new("image", DType::Float32),
            InputSpec::new("threshold", DType::Float32),
        ];
    }

    let mut engine = NativeEngine::load(&library, Isolation::Shared)?;
    println!("[Engine] {} {}", engine.name(), engine.version());
    engine.initialize()?;
    engine.load_model(&model)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let s = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("Shutdown signal received...");
        s.store(true, Ordering::SeqCst);
    })?;

    let mut session = EngineSession::attach(&config)?.with_cancel(shutdown.clone());
    session.accept()?;
    println!("[Engine] Module connected, serving requests (Ctrl+C to quit)");

    while !shutdown.load(Ordering::SeqCst) {
        match session.serve_engine(&mut engine) {
            Ok(()) => {}
            Err(e) if e.is_interrupted() => break,
            // Module is between cycles or gone; keep listening until Ctrl+C
            Err(BridgeError::TimedOut { .. }) => continue,
            Err(e) if e.is_format_error() => log::warn!("Cycle {} skipped: {}", session.cycles(), e),
            Err(e) => {
                eprintln!("[Engine] {}", e);
                break;
            }
        }
    }

    println!("[Engine] {} cycles served", session.cycles());
    session.close()?;
    engine.destroy()?;
    Ok(())
}
