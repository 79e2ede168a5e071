//! Out-of-process detection engine.
//! Spawns a detector worker (e.g. `python3 worker.py`) and talks to it over
//! stdin/stdout with MessagePack framing (4-byte BE length prefix + payload).
//! The worker is started lazily and respawned if it dies.

use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use image::ImageFormat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{BoxPx, DetectionEngine, EngineDetection, OcrError, TileImage};

const MAX_MESSAGE_BYTES: usize = 50 * 1024 * 1024;

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

fn ipc_error(step: &'static str) -> impl Fn(std::io::Error) -> OcrError {
    move |e| OcrError::ProcessingFailed(format!("worker {step}: {e}"))
}

impl WorkerProcess {
    /// Write one frame: 4-byte big-endian length, then the payload.
    fn send(&mut self, msg: &[u8]) -> Result<(), OcrError> {
        let mut frame = Vec::with_capacity(msg.len() + 4);
        frame.extend_from_slice(&(msg.len() as u32).to_be_bytes());
        frame.extend_from_slice(msg);
        self.stdin.write_all(&frame).map_err(ipc_error("write"))?;
        self.stdin.flush().map_err(ipc_error("flush"))
    }

    fn recv(&mut self) -> Result<Vec<u8>, OcrError> {
        let mut header = [0u8; 4];
        self.stdout.read_exact(&mut header).map_err(ipc_error("read header"))?;
        let frame_len = u32::from_be_bytes(header) as usize;
        if frame_len > MAX_MESSAGE_BYTES {
            return Err(OcrError::ProcessingFailed(format!(
                "worker frame of {frame_len} bytes exceeds {MAX_MESSAGE_BYTES}"
            )));
        }
        let mut payload = vec![0u8; frame_len];
        self.stdout.read_exact(&mut payload).map_err(ipc_error("read payload"))?;
        Ok(payload)
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Ok(bytes) = rmp_serde::to_vec_named(&WorkerMessage::Shutdown) {
            let _ = self.send(&bytes);
        }
        std::thread::sleep(Duration::from_millis(100));
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// --- IPC message types ---

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerMessage {
    Ping,
    Detect {
        tile_index: usize,
        y_offset: u32,
        #[serde(with = "serde_bytes")]
        image_png: Vec<u8>,
    },
    Shutdown,
}

mod serde_bytes {
    use serde::Serializer;
    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(data)
    }
}

#[derive(Deserialize, Debug)]
struct WorkerResponse {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    detections: Vec<WorkerDetection>,
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WorkerDetection {
    /// x1, y1, x2, y2 in tile-local pixels.
    bbox: (u32, u32, u32, u32),
    text: String,
    confidence: f64,
}

impl WorkerResponse {
    fn into_detections(self) -> Result<Vec<EngineDetection>, OcrError> {
        match self.msg_type.as_str() {
            "detections" => Ok(self
                .detections
                .into_iter()
                .map(|d| EngineDetection {
                    bbox: BoxPx::new(d.bbox.0, d.bbox.1, d.bbox.2, d.bbox.3),
                    text: d.text,
                    confidence: d.confidence as f32,
                })
                .collect()),
            "error" => Err(OcrError::ProcessingFailed(
                self.message.unwrap_or_else(|| "unknown error".into()),
            )),
            other => Err(OcrError::ProcessingFailed(format!(
                "unexpected response type: {other}"
            ))),
        }
    }
}

/// Detection engine backed by a worker process.
pub struct PythonDetectionEngine {
    worker: Mutex<Option<WorkerProcess>>,
    program: String,
    worker_script: PathBuf,
    available: AtomicBool,
    consecutive_failures: AtomicU32,
    max_failures: u32,
}

impl PythonDetectionEngine {
    /// `program` is the interpreter (e.g. "python3" or a venv path),
    /// `worker_script` the detector worker entry point.
    pub fn new(program: &str, worker_script: PathBuf) -> Self {
        Self {
            worker: Mutex::new(None),
            program: program.to_string(),
            worker_script,
            available: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            max_failures: 3,
        }
    }

    fn spawn_worker(&self) -> Result<WorkerProcess, OcrError> {
        info!(
            script = %self.worker_script.display(),
            program = %self.program,
            "spawning detector worker"
        );

        let mut child = Command::new(&self.program)
            .arg(&self.worker_script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| OcrError::ProcessingFailed(format!("failed to spawn worker: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::ProcessingFailed("failed to get worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OcrError::ProcessingFailed("failed to get worker stdout".into()))?;

        info!(pid = child.id(), "detector worker spawned");
        Ok(WorkerProcess {
            child,
            stdin,
            stdout,
        })
    }

    fn send_recv(&self, msg: &WorkerMessage) -> Result<WorkerResponse, OcrError> {
        let mut guard = self.worker.lock();
        let needs_spawn = match guard.as_mut() {
            Some(w) => !w.is_alive(),
            None => true,
        };
        if needs_spawn {
            *guard = Some(self.spawn_worker()?);
        }
        let worker = guard.as_mut().ok_or(OcrError::EngineNotLoaded)?;

        let payload = rmp_serde::to_vec_named(msg)
            .map_err(|e| OcrError::ProcessingFailed(format!("serialize: {e}")))?;
        worker.send(&payload)?;
        let response_bytes = worker.recv()?;
        rmp_serde::from_slice(&response_bytes)
            .map_err(|e| OcrError::ProcessingFailed(format!("deserialize: {e}")))
    }

    fn call(&self, msg: &WorkerMessage) -> Result<WorkerResponse, OcrError> {
        match self.send_recv(msg) {
            Ok(resp) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.available.store(true, Ordering::SeqCst);
                Ok(resp)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.max_failures {
            warn!(failures, "detector worker failing repeatedly, marking unavailable");
            self.available.store(false, Ordering::SeqCst);
            // Next call spawns a fresh worker.
            *self.worker.lock() = None;
        }
    }

    /// Ping the worker; spawns it if needed.
    pub fn health_check(&self) -> bool {
        match self.call(&WorkerMessage::Ping) {
            Ok(resp) if resp.msg_type == "pong" => {
                debug!("detector worker pong");
                true
            }
            Ok(resp) => {
                warn!(msg_type = %resp.msg_type, "unexpected health check response");
                self.record_failure();
                false
            }
            Err(e) => {
                warn!(error = %e, "detector health check failed");
                false
            }
        }
    }
}

impl DetectionEngine for PythonDetectionEngine {
    fn detect(&self, tile: &TileImage) -> Result<Vec<EngineDetection>, OcrError> {
        let mut image_png = Vec::new();
        tile.image
            .write_to(&mut Cursor::new(&mut image_png), ImageFormat::Png)
            .map_err(|e| OcrError::ProcessingFailed(format!("encode tile: {e}")))?;

        let response = self.call(&WorkerMessage::Detect {
            tile_index: tile.tile.index,
            y_offset: tile.tile.y_offset,
            image_png,
        })?;
        response.into_detections()
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_detections_decode() {
        #[derive(Serialize)]
        struct Det {
            bbox: (u32, u32, u32, u32),
            text: &'static str,
            confidence: f64,
        }
        #[derive(Serialize)]
        struct Resp {
            #[serde(rename = "type")]
            msg_type: &'static str,
            detections: Vec<Det>,
        }
        let bytes = rmp_serde::to_vec_named(&Resp {
            msg_type: "detections",
            detections: vec![Det {
                bbox: (40, 12, 10, 30),
                text: "やあ",
                confidence: 0.93,
            }],
        })
        .unwrap();
        let resp: WorkerResponse = rmp_serde::from_slice(&bytes).unwrap();
        let found = resp.into_detections().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].bbox, BoxPx::new(10, 12, 40, 30));
        assert_eq!(found[0].text, "やあ");
    }

    #[test]
    fn worker_error_is_surfaced() {
        let resp = WorkerResponse {
            msg_type: "error".into(),
            detections: Vec::new(),
            message: Some("model missing".into()),
        };
        assert!(matches!(
            resp.into_detections(),
            Err(OcrError::ProcessingFailed(msg)) if msg == "model missing"
        ));
    }

    #[test]
    fn missing_program_marks_engine_unavailable() {
        let engine = PythonDetectionEngine::new(
            "/nonexistent/detector-interpreter",
            PathBuf::from("worker.py"),
        );
        assert!(engine.is_available());
        for _ in 0..3 {
            assert!(!engine.health_check());
        }
        assert!(!engine.is_available());
    }
}
