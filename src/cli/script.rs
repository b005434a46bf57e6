//! Scripted session files for `chorus run`
//!
//! ```toml
//! [[humans]]
//! name = "alice"
//!
//! [[entities]]
//! handle = "Sage"
//! base_persona = "A patient astronomer."
//! strategy = { type = "mention_only" }
//! cooldown_secs = 30
//!
//! [[documents]]
//! entity = "Sage"
//! name = "astronomy.md"
//! path = "astronomy.md"
//!
//! [[rooms]]
//! name = "observatory"
//! members = ["alice", "Sage"]
//!
//! [[messages]]
//! from = "alice"
//! room = "observatory"
//! text = "Hey @Sage, what is a comet?"
//! ```

use anyhow::{bail, Context, Result};
use chorus_core::ResponseStrategy;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default)]
    pub humans: Vec<HumanSpec>,
    #[serde(default)]
    pub entities: Vec<EntitySpec>,
    #[serde(default)]
    pub documents: Vec<DocumentSpec>,
    #[serde(default)]
    pub rooms: Vec<RoomSpec>,
    #[serde(default)]
    pub messages: Vec<MessageSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HumanSpec {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntitySpec {
    pub handle: String,
    #[serde(default)]
    pub base_persona: String,
    pub speaking_style: Option<String>,
    pub example_exchanges: Option<String>,
    pub guidelines: Option<String>,
    #[serde(default)]
    pub strategy: ResponseStrategy,
    pub cooldown_secs: Option<f64>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentSpec {
    pub entity: String,
    pub name: String,
    /// Relative to the script file
    pub path: Option<PathBuf>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomSpec {
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageSpec {
    pub from: String,
    pub text: String,
    pub room: Option<String>,
    /// Private peer
    pub to: Option<String>,
    pub group: Option<Vec<String>>,
    /// Entities addressed explicitly
    #[serde(default)]
    pub addressing: Vec<String>,
    /// Wait for triggered turns before sending the next message
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

impl Script {
    pub fn from_toml(text: &str) -> Result<Self> {
        let script: Script = toml::from_str(text).context("Invalid script")?;
        script.validate()?;
        Ok(script)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        Self::from_toml(&text)
    }

    /// Document text, reading `path` relative to `base_dir` when given
    pub fn document_text(document: &DocumentSpec, base_dir: &Path) -> Result<String> {
        match (&document.text, &document.path) {
            (Some(text), None) => Ok(text.clone()),
            (None, Some(path)) => {
                let full = base_dir.join(path);
                std::fs::read_to_string(&full)
                    .with_context(|| format!("Failed to read document {}", full.display()))
            }
            _ => bail!(
                "Document '{}' needs exactly one of `text` or `path`",
                document.name
            ),
        }
    }

    /// Names must be unique and every reference must resolve
    ///
    /// Target conflicts in messages are left to the router.
    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for name in self
            .humans
            .iter()
            .map(|h| &h.name)
            .chain(self.entities.iter().map(|e| &e.handle))
        {
            if !names.insert(name.as_str()) {
                bail!("Duplicate participant name '{}'", name);
            }
        }
        let humans: HashSet<&str> = self.humans.iter().map(|h| h.name.as_str()).collect();
        let entities: HashSet<&str> = self.entities.iter().map(|e| e.handle.as_str()).collect();

        let mut rooms = HashSet::new();
        for room in &self.rooms {
            if !rooms.insert(room.name.as_str()) {
                bail!("Duplicate room '{}'", room.name);
            }
            for member in &room.members {
                if !names.contains(member.as_str()) {
                    bail!("Room '{}' lists unknown participant '{}'", room.name, member);
                }
            }
        }

        for document in &self.documents {
            if !entities.contains(document.entity.as_str()) {
                bail!("Document '{}' belongs to unknown entity '{}'", document.name, document.entity);
            }
        }

        for (i, message) in self.messages.iter().enumerate() {
            if !humans.contains(message.from.as_str()) {
                bail!("Message {} is from unknown human '{}'", i + 1, message.from);
            }
            if let Some(room) = &message.room {
                if !rooms.contains(room.as_str()) {
                    bail!("Message {} targets unknown room '{}'", i + 1, room);
                }
            }
            let referenced = message
                .to
                .iter()
                .chain(message.group.iter().flatten())
                .chain(message.addressing.iter());
            for name in referenced {
                if !names.contains(name.as_str()) {
                    bail!("Message {} references unknown participant '{}'", i + 1, name);
                }
            }
            for name in &message.addressing {
                if !entities.contains(name.as_str()) {
                    bail!("Message {} addresses '{}', which is not an entity", i + 1, name);
                }
            }
        }
        Ok(())
    }
}
