//! Control-block text format.
//!
//! Package control files, runtime descriptors and repository indices all
//! share one textual format: UTF-8 blocks separated by blank lines, each
//! block a sequence of `Field: value` lines. A line starting with
//! whitespace continues the previous field's value. Field names are
//! case-sensitive. Readers keep a current-block cursor so multi-document
//! files can be walked block by block.

use std::fs;
use std::path::Path;

use thiserror::Error;

/// Errors raised while reading or writing control data.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A line that is neither a field, a continuation nor a separator.
    #[error("malformed line {line}: {content:?}")]
    Malformed {
        /// 1-based line number in the input.
        line: usize,
        /// Offending line content.
        content: String,
    },
}

/// One `Field: value` entry. Values may span multiple lines.
type Entry = (String, String);

/// A parsed control-block document with a block cursor.
#[derive(Debug, Clone, Default)]
pub struct ConfigBlocks {
    blocks: Vec<Vec<Entry>>,
    cursor: usize,
}

impl ConfigBlocks {
    /// Create an empty document containing a single empty block.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: vec![Vec::new()],
            cursor: 0,
        }
    }

    /// Parse a document from text.
    pub fn from_data(data: &str) -> Result<Self, ConfigError> {
        let mut blocks: Vec<Vec<Entry>> = Vec::new();
        let mut current: Vec<Entry> = Vec::new();

        for (lineno, raw) in data.lines().enumerate() {
            if raw.trim().is_empty() {
                if !current.is_empty() {
                    blocks.push(std::mem::take(&mut current));
                }
                continue;
            }

            if raw.starts_with(' ') || raw.starts_with('\t') {
                // Continuation of the previous field's value.
                match current.last_mut() {
                    Some((_, value)) => {
                        value.push('\n');
                        value.push_str(raw.trim_start());
                    }
                    None => {
                        return Err(ConfigError::Malformed {
                            line: lineno + 1,
                            content: raw.to_string(),
                        });
                    }
                }
                continue;
            }

            let Some((field, value)) = raw.split_once(':') else {
                return Err(ConfigError::Malformed {
                    line: lineno + 1,
                    content: raw.to_string(),
                });
            };
            current.push((field.trim().to_string(), value.trim().to_string()));
        }
        if !current.is_empty() {
            blocks.push(current);
        }
        if blocks.is_empty() {
            blocks.push(Vec::new());
        }

        Ok(Self { blocks, cursor: 0 })
    }

    /// Parse a document from a file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_data(&fs::read_to_string(path)?)
    }

    /// Reset the cursor to the first block.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Advance the cursor to the next block. Returns `false` at the end.
    pub fn next_block(&mut self) -> bool {
        if self.cursor + 1 < self.blocks.len() {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    /// Position the cursor at the first block (from the start if `reset`,
    /// otherwise from the block after the current one) whose `field` equals
    /// `value`. Returns `false` if no such block exists; the cursor is left
    /// unchanged in that case.
    pub fn open_block(&mut self, field: &str, value: &str, reset: bool) -> bool {
        let start = if reset { 0 } else { self.cursor + 1 };
        for idx in start..self.blocks.len() {
            let hit = self.blocks[idx]
                .iter()
                .any(|(f, v)| f == field && v == value);
            if hit {
                self.cursor = idx;
                return true;
            }
        }
        false
    }

    /// Append a new empty block and move the cursor to it.
    pub fn new_block(&mut self) {
        // An empty trailing block is reused instead of stacking separators.
        if !self.blocks[self.cursor].is_empty() || self.blocks.len() > 1 {
            self.blocks.push(Vec::new());
        }
        self.cursor = self.blocks.len() - 1;
    }

    /// Get a field's value from the current block.
    #[must_use]
    pub fn get_value(&self, field: &str) -> Option<&str> {
        self.blocks[self.cursor]
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.as_str())
    }

    /// Set a field in the current block, replacing an existing entry.
    pub fn set_value(&mut self, field: &str, value: &str) {
        let block = &mut self.blocks[self.cursor];
        if let Some(entry) = block.iter_mut().find(|(f, _)| f == field) {
            entry.1 = value.to_string();
        } else {
            block.push((field.to_string(), value.to_string()));
        }
    }

    /// Remove a field from the current block if present.
    pub fn remove_value(&mut self, field: &str) {
        self.blocks[self.cursor].retain(|(f, _)| f != field);
    }

    /// Number of blocks in the document.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Serialize the document back to text.
    #[must_use]
    pub fn emit(&self) -> String {
        let mut out = String::new();
        let mut first = true;
        for block in &self.blocks {
            if block.is_empty() {
                continue;
            }
            if !first {
                out.push('\n');
            }
            first = false;
            for (field, value) in block {
                let mut lines = value.split('\n');
                out.push_str(field);
                out.push_str(": ");
                out.push_str(lines.next().unwrap_or(""));
                out.push('\n');
                for cont in lines {
                    out.push(' ');
                    out.push_str(cont);
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Write the document to a file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.emit())?;
        Ok(())
    }
}
