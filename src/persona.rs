//! Core memory stored as a JSON file.
//!
//! ```json
//! { "persona": { "name": "RepoRover", "description": "...", "instructions": ["..."] } }
//! ```
//!
//! A missing file is created with the built-in persona.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use reporover_core::capability::{CoreMemory, Persona};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CoreMemoryFile {
    #[serde(default)]
    persona: Persona,
}

/// Persona loaded once from disk.
pub struct JsonCoreMemory {
    persona: Persona,
}

impl JsonCoreMemory {
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let json = serde_json::to_string_pretty(&CoreMemoryFile::default())?;
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write core memory: {}", path.display()))?;
            tracing::info!(path = %path.display(), "wrote default core memory");
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read core memory: {}", path.display()))?;
        let file: CoreMemoryFile = serde_json::from_str(&content)
            .with_context(|| format!("Invalid core memory file: {}", path.display()))?;
        Ok(Self {
            persona: file.persona,
        })
    }
}

impl CoreMemory for JsonCoreMemory {
    fn persona(&self) -> Persona {
        self.persona.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gets_default_persona() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("memory/core.json");
        let core = JsonCoreMemory::load_or_create(&path).unwrap();
        assert_eq!(core.persona(), Persona::default());
        assert!(path.exists());
    }

    #[test]
    fn test_custom_persona_is_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("core.json");
        std::fs::write(
            &path,
            r#"{"persona": {"name": "Scout", "description": "a terse guide"}}"#,
        )
        .unwrap();
        let persona = JsonCoreMemory::load_or_create(&path).unwrap().persona();
        assert_eq!(persona.name, "Scout");
        assert!(persona.instructions.is_empty());
    }
}
