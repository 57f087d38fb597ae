//! One thread per engine instance
//!
//! Each [`EngineWorker`] owns its engine, a task channel and a bounded result
//! channel. Only [`Task::Infer`] produces a result; the other tasks report
//! failures through the log. When nobody collects results the oldest unread
//! one is dropped to make room.

use crate::config::WorkerConfig;
use crate::engine::InferenceEngine;
use crate::error::{BridgeError, Result};
use crate::tensor::TensorSet;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Work for an engine thread
#[derive(Debug, Clone)]
pub enum Task {
    Initialize,
    LoadModel(PathBuf),
    Infer(TensorSet),
    Cleanup,
    Destroy,
}

impl Task {
    /// Whether the task's outcome is delivered through the result channel
    pub fn produces_result(&self) -> bool {
        matches!(self, Task::Infer(_))
    }

    fn label(&self) -> &'static str {
        match self {
            Task::Initialize => "initialize",
            Task::LoadModel(_) => "load_model",
            Task::Infer(_) => "infer",
            Task::Cleanup => "cleanup",
            Task::Destroy => "destroy",
        }
    }
}

enum Message {
    Run(Task),
    Shutdown,
}

/// Handle to a thread driving one engine instance
pub struct EngineWorker {
    name: String,
    tasks: Sender<Message>,
    results: Receiver<Result<TensorSet>>,
    handle: Option<JoinHandle<()>>,
}

impl EngineWorker {
    /// Move `engine` onto a new thread
    pub fn spawn<E>(name: impl Into<String>, engine: E, config: &WorkerConfig) -> Result<Self>
    where
        E: InferenceEngine + 'static,
    {
        let name = name.into();
        if config.result_capacity == 0 {
            return Err(BridgeError::Config(
                "worker result_capacity must be at least 1".into(),
            ));
        }

        let (task_tx, task_rx) = channel::unbounded();
        let (result_tx, result_rx) = channel::bounded(config.result_capacity);
        let overflow_rx = result_rx.clone();
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(&thread_name, engine, task_rx, result_tx, overflow_rx))
            .map_err(|e| BridgeError::Worker {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        log::debug!("[Worker:{}] Started", name);
        Ok(Self {
            name,
            tasks: task_tx,
            results: result_rx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task
    pub fn submit(&self, task: Task) -> Result<()> {
        self.tasks
            .send(Message::Run(task))
            .map_err(|_| self.gone("task channel closed"))
    }

    pub fn initialize(&self) -> Result<()> {
        self.submit(Task::Initialize)
    }

    pub fn load_model(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.submit(Task::LoadModel(path.into()))
    }

    pub fn infer(&self, inputs: TensorSet) -> Result<()> {
        self.submit(Task::Infer(inputs))
    }

    pub fn cleanup(&self) -> Result<()> {
        self.submit(Task::Cleanup)
    }

    pub fn destroy(&self) -> Result<()> {
        self.submit(Task::Destroy)
    }

    /// Take the oldest unread result
    ///
    /// `None` waits indefinitely. Returns `None` on timeout or once the
    /// worker has exited with nothing left to read.
    pub fn last_result(&self, timeout: Option<Duration>) -> Option<Result<TensorSet>> {
        match timeout {
            None => self.results.recv().ok(),
            Some(timeout) => match self.results.recv_timeout(timeout) {
                Ok(result) => Some(result),
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!("[Worker:{}] No result within {:?}", self.name, timeout);
                    None
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
        }
    }

    /// Check if the worker thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Ask the thread to exit after queued tasks and wait for it
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tasks.send(Message::Shutdown);
            if handle.join().is_err() {
                log::error!("[Worker:{}] Thread panicked", self.name);
            } else {
                log::debug!("[Worker:{}] Stopped", self.name);
            }
        }
    }

    fn gone(&self, reason: &str) -> BridgeError {
        BridgeError::Worker {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<E: InferenceEngine>(
    name: &str,
    mut engine: E,
    tasks: Receiver<Message>,
    results: Sender<Result<TensorSet>>,
    overflow: Receiver<Result<TensorSet>>,
) {
    for message in tasks.iter() {
        let task = match message {
            Message::Run(task) => task,
            Message::Shutdown => break,
        };

        let label = task.label();
        log::debug!("[Worker:{}] Running {}", name, label);
        let outcome = match task {
            Task::Initialize => engine.initialize().map(|_| None),
            Task::LoadModel(path) => engine.load_model(&path).map(|_| None),
            Task::Infer(inputs) => Ok(Some(engine.infer(&inputs))),
            Task::Cleanup => engine.cleanup().map(|_| None),
            Task::Destroy => engine.destroy().map(|_| None),
        };

        match outcome {
            Ok(Some(result)) => deliver(name, result, &results, &overflow),
            Ok(None) => {}
            Err(e) => log::error!("[Worker:{}] {} failed: {}", name, label, e),
        }
    }
    log::debug!("[Worker:{}] Exiting", name);
}

fn deliver(
    name: &str,
    mut result: Result<TensorSet>,
    results: &Sender<Result<TensorSet>>,
    overflow: &Receiver<Result<TensorSet>>,
) {
    loop {
        match results.try_send(result) {
            Ok(()) => return,
            Err(TrySendError::Full(rejected)) => {
                if overflow.try_recv().is_ok() {
                    log::warn!("[Worker:{}] Result queue full, dropped oldest result", name);
                }
                result = rejected;
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::SummingEngine;
    use crate::tensor::TensorDescriptor;

    fn inputs(value: f32) -> TensorSet {
        TensorSet::from_descriptors(vec![
            TensorDescriptor::from_elements("x", vec![1], &[value]).unwrap(),
        ])
        .unwrap()
    }

    fn sum_of(result: Result<TensorSet>) -> f32 {
        result.unwrap().get("sum").unwrap().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn test_only_infer_produces_results() {
        assert!(Task::Infer(TensorSet::new()).produces_result());
        assert!(!Task::Initialize.produces_result());
        assert!(!Task::LoadModel("m.onnx".into()).produces_result());
        assert!(!Task::Cleanup.produces_result());
        assert!(!Task::Destroy.produces_result());
    }

    #[test]
    fn test_worker_lifecycle() {
        let engine = SummingEngine::default();
        let mut worker = EngineWorker::spawn("engine-0", engine.clone(), &WorkerConfig::default()).unwrap();
        assert!(worker.is_running());

        worker.initialize().unwrap();
        worker.load_model("model.onnx").unwrap();
        worker.infer(inputs(2.5)).unwrap();
        worker.cleanup().unwrap();

        let result = worker.last_result(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(sum_of(result), 2.5);

        // Unit tasks never show up as results
        assert!(worker.last_result(Some(Duration::from_millis(50))).is_none());

        worker.destroy().unwrap();
        worker.stop();
        assert!(!worker.is_running());
        assert_eq!(
            engine.calls(),
            vec!["initialize", "load_model model.onnx", "infer", "cleanup", "destroy"]
        );
        assert!(worker.infer(inputs(1.0)).is_err());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let config = WorkerConfig { result_capacity: 2 };
        let mut worker = EngineWorker::spawn("engine-1", SummingEngine::default(), &config).unwrap();

        for value in [1.0, 2.0, 3.0] {
            worker.infer(inputs(value)).unwrap();
        }
        worker.stop();

        let kept: Vec<f32> = std::iter::from_fn(|| worker.last_result(Some(Duration::from_millis(50))))
            .map(sum_of)
            .collect();
        assert_eq!(kept, vec![2.0, 3.0]);
    }

    #[test]
    fn test_infer_failure_is_a_result() {
        let engine = SummingEngine {
            fail_infer: true,
            ..SummingEngine::default()
        };
        let worker = EngineWorker::spawn("engine-2", engine, &WorkerConfig::default()).unwrap();
        worker.infer(inputs(1.0)).unwrap();

        let err = worker
            .last_result(Some(Duration::from_secs(5)))
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BridgeError::FfiStatus { .. }));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = WorkerConfig { result_capacity: 0 };
        assert!(EngineWorker::spawn("engine-3", SummingEngine::default(), &config).is_err());
    }

    #[test]
    fn test_parallel_workers() {
        let workers: Vec<EngineWorker> = (0..2)
            .map(|i| {
                EngineWorker::spawn(format!("engine-{}", i), SummingEngine::default(), &WorkerConfig::default())
                    .unwrap()
            })
            .collect();

        for (i, worker) in workers.iter().enumerate() {
            worker.infer(inputs(i as f32 + 10.0)).unwrap();
        }
        for (i, worker) in workers.iter().enumerate() {
            let result = worker.last_result(None).unwrap();
            assert_eq!(sum_of(result), i as f32 + 10.0);
        }
    }
}
