//! Example Parallel Engines
//!
//! Loads the same engine library twice into separate link-map namespaces and
//! drives each instance from its own worker thread.
//!
//! Usage: `parallel <libengine.so> <model> [instances]`

use ndarray::{ArrayD, IxDyn};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tensor_bridge::marshal::marshal_set;
use tensor_bridge::{EngineWorker, Isolation, NativeEngine, TensorValue, WorkerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <libengine.so> <model> [instances]", args[0]);
        std::process::exit(2);
    }
    let library = PathBuf::from(&args[1]);
    let model = PathBuf::from(&args[2]);
    let instances: usize = match args.get(3) {
        Some(n) => n.parse()?,
        None => 2,
    };

    let config = WorkerConfig::default();
    let mut workers = Vec::with_capacity(instances);
    for i in 0..instances {
        let engine = NativeEngine::load(&library, Isolation::Namespaced)?;
        let worker = EngineWorker::spawn(format!("engine-{}", i), engine, &config)?;
        worker.initialize()?;
        worker.load_model(model.clone())?;
        workers.push(worker);
    }
    println!("[Parallel] {} engine instances ready", workers.len());

    let start = Instant::now();
    for (i, worker) in workers.iter().enumerate() {
        let image = ArrayD::from_elem(IxDyn(&[1, 3, 224, 224]), i as f32 / instances as f32);
        let inputs = marshal_set(vec![
            ("image", TensorValue::from(image)),
            ("threshold", TensorValue::from(ArrayD::from_elem(IxDyn(&[1]), 0.25f32))),
        ])?;
        worker.infer(inputs)?;
    }

    for worker in &workers {
        match worker.last_result(Some(Duration::from_secs(30))) {
            Some(Ok(outputs)) => {
                for tensor in &outputs {
                    println!("[{}] {} {} {:?}", worker.name(), tensor.name(), tensor.dtype(), tensor.shape());
                }
            }
            Some(Err(e)) => eprintln!("[{}] inference failed: {}", worker.name(), e),
            None => eprintln!("[{}] no result", worker.name()),
        }
        worker.cleanup()?;
    }
    println!("[Parallel] All instances answered in {:?}", start.elapsed());

    for mut worker in workers {
        worker.destroy()?;
        worker.stop();
    }
    Ok(())
}
