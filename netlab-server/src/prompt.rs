//! Shell prompt detection on VM console output

/// Root shell prompt printed by a node's console once it has booted
pub fn shell_prompt(node: &str) -> String {
    format!("{}:~#", node)
}

/// Finds the shell prompt in a chunked byte stream
///
/// Keeps just enough trailing bytes to catch a prompt split across chunks.
#[derive(Debug)]
pub struct PromptDetector {
    marker: Vec<u8>,
    tail: Vec<u8>,
}

impl PromptDetector {
    pub fn new(node: &str) -> Self {
        Self {
            marker: shell_prompt(node).into_bytes(),
            tail: Vec::new(),
        }
    }

    /// Returns true if the prompt ends somewhere in `chunk`
    pub fn observe(&mut self, chunk: &[u8]) -> bool {
        self.tail.extend_from_slice(chunk);
        let found = self
            .tail
            .windows(self.marker.len())
            .any(|window| window == self.marker.as_slice());

        let keep = self.marker.len().saturating_sub(1);
        if self.tail.len() > keep {
            self.tail.drain(..self.tail.len() - keep);
        }
        found
    }
}
