use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use promptslot_contracts::GenerationRequest;

/// Outbound half of the generation bus. Responses come back through
/// [`crate::PlaceholderEngine::handle_response`].
pub trait GenerationTransport {
    fn emit(&mut self, request: &GenerationRequest) -> anyhow::Result<()>;
}

/// Keeps emitted requests for the host (or a test) to pick up.
#[derive(Debug, Default)]
pub struct QueuedTransport {
    outbox: VecDeque<GenerationRequest>,
    emitted: usize,
}

impl QueuedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<GenerationRequest> {
        self.outbox.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// Total requests ever emitted, drained or not.
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

impl GenerationTransport for QueuedTransport {
    fn emit(&mut self, request: &GenerationRequest) -> anyhow::Result<()> {
        self.outbox.push_back(request.clone());
        self.emitted += 1;
        Ok(())
    }
}

/// Appends one compact JSON request per line for an out-of-process worker.
#[derive(Debug, Clone)]
pub struct JsonlTransport {
    path: PathBuf,
}

impl JsonlTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GenerationTransport for JsonlTransport {
    fn emit(&mut self, request: &GenerationRequest) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(request)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use promptslot_contracts::{ContentKey, GenerationPayload};

    use super::*;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            id: ContentKey::derive(prompt),
            payload: GenerationPayload::prompt(prompt),
        }
    }

    #[test]
    fn queued_transport_drains_in_emit_order() -> anyhow::Result<()> {
        let mut transport = QueuedTransport::new();
        transport.emit(&request("a"))?;
        transport.emit(&request("b"))?;
        let drained: Vec<String> = transport
            .drain()
            .into_iter()
            .map(|row| row.payload.prompt)
            .collect();
        assert_eq!(drained, vec!["a", "b"]);
        assert_eq!(transport.pending(), 0);
        assert_eq!(transport.emitted(), 2);
        Ok(())
    }

    #[test]
    fn jsonl_transport_appends_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("bus").join("requests.jsonl");
        let mut transport = JsonlTransport::new(&path);
        transport.emit(&request("a"))?;
        transport.emit(&request("b"))?;

        let raw = std::fs::read_to_string(&path)?;
        let rows: Vec<GenerationRequest> = raw
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(rows, vec![request("a"), request("b")]);
        Ok(())
    }
}
