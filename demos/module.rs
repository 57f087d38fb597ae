//! Example Module (producer side)
//!
//! Creates the arena and pipes, connects to an engine and sends a synthetic
//! NCHW image plus a threshold every cycle until Ctrl+C.
//!
//! Usage: `module [config.toml]`

use ndarray::{ArrayD, IxDyn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tensor_bridge::marshal::{marshal_set, unmarshal_set};
use tensor_bridge::{CycleOutcome, ModuleSession, RequestFrame, SessionConfig, TensorValue};

const HEIGHT: usize = 640;
const WIDTH: usize = 640;

fn synthetic_image(frame: u64) -> ArrayD<f32> {
    let shift = (frame % 255) as f32;
    ArrayD::from_shape_fn(IxDyn(&[1, 3, HEIGHT, WIDTH]), |idx| {
        ((idx[1] * 85 + idx[2] + idx[3]) as f32 + shift) % 256.0 / 255.0
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_file(path.as_ref())?,
        None => SessionConfig::default(),
    };

    println!("[Module] Pipes: {} / {}", config.engine_pipe_path().display(), config.module_pipe_path().display());
    println!("[Module] Arena: {} bytes", config.capacity);

    let shutdown = Arc::new(AtomicBool::new(false));
    let s = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("Shutdown signal received...");
        s.store(true, Ordering::SeqCst);
    })?;

    let mut session = ModuleSession::start(&config)?.with_cancel(shutdown);
    if let Some(id) = session.arena_id() {
        println!("[Module] Arena id: {} (start the engine now)", id);
    }

    if let Err(e) = session.connect() {
        eprintln!("[Module] Engine did not answer: {}", e);
        session.close()?;
        std::process::exit(1);
    }

    let mut frame = 0u64;
    let next_request = || {
        frame += 1;
        let inputs = vec![
            ("image", TensorValue::from(synthetic_image(frame))),
            ("threshold", TensorValue::from(ArrayD::from_elem(IxDyn(&[1]), 0.25f32))),
        ];
        match marshal_set(inputs) {
            Ok(tensors) => Some(RequestFrame::new(tensors).with_mask(vec![HEIGHT, WIDTH])),
            Err(e) => {
                eprintln!("[Module] Cannot build request: {}", e);
                None
            }
        }
    };

    let completed = session.run_polling(next_request, |outcome| match outcome {
        CycleOutcome::Outputs(outputs) => match unmarshal_set(&outputs) {
            Ok(values) => {
                for (name, value) in values {
                    println!("[Module] {} -> {} {:?}", name, value.dtype(), value.shape());
                }
            }
            Err(e) => eprintln!("[Module] Cannot unmarshal outputs: {}", e),
        },
        CycleOutcome::NoValidOutput { reason } => println!("[Module] No valid output: {}", reason),
    })?;

    println!("[Module] {} cycles completed", completed);
    session.close()?;
    Ok(())
}
