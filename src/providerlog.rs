//! Forwards output of the external tooling into the provider log.

/// Re-chunks arbitrary output into complete lines so multi-write output
/// still logs one event per line.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buffer: String,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Whatever is buffered after the final newline.
    pub fn take_rest(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Emits tool output at debug level, tagged with the operation it came
/// from. Flushes any unterminated trailing line on drop.
pub(crate) struct LogWriter {
    operation: &'static str,
    lines: LineBuffer,
}

impl LogWriter {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            lines: LineBuffer::default(),
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        for line in self.lines.push(&String::from_utf8_lossy(chunk)) {
            tracing::debug!("skopeo {}: {}", self.operation, line);
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Some(rest) = self.lines.take_rest() {
            tracing::debug!("skopeo {}: {}", self.operation, rest);
        }
    }
}
