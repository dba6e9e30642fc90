//! Tool registry.
//!
//! Tool names are derived from enum variants via strum, so the name the
//! model sees, the name the client receives and the name we validate are
//! always the same string.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use super::{
    GetActorInput, ListActorsInput, NoInput, ReadJournalInput, RollDiceInput, RollOnTableInput,
    UpdateActorInput, input_schema,
};
use crate::error::{ServiceError, ServiceResult};
use crate::llm::ToolDefinition;

/// All tool names as an exhaustive enum.
///
/// Adding a tool means adding a variant here and an arm in [`metadata`];
/// the match makes a missing arm a compile error.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    RollDice,
    GetActor,
    ListActors,
    UpdateActor,
    GetCurrentScene,
    GetCombatState,
    RollOnTable,
    ReadJournal,
}

/// Metadata for a tool definition
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: ToolName,
    pub description: &'static str,
    /// JSON Schema for the tool input (built lazily)
    pub parameters: fn() -> serde_json::Value,
}

fn metadata(name: ToolName) -> ToolMetadata {
    let (description, parameters): (&'static str, fn() -> serde_json::Value) = match name {
        ToolName::RollDice => (
            "Roll dice with the game system's dice engine. The roll is shown in the game chat.",
            input_schema::<RollDiceInput>,
        ),
        ToolName::GetActor => (
            "Read a character, NPC or creature sheet by ID or name.",
            input_schema::<GetActorInput>,
        ),
        ToolName::ListActors => (
            "List actors in the world, optionally filtered by type.",
            input_schema::<ListActorsInput>,
        ),
        ToolName::UpdateActor => (
            "Apply a partial update to an actor, such as hit points or conditions.",
            input_schema::<UpdateActorInput>,
        ),
        ToolName::GetCurrentScene => (
            "Describe the active scene: name, notes and the tokens placed on it.",
            input_schema::<NoInput>,
        ),
        ToolName::GetCombatState => (
            "Get the current combat: round, turn order and whose turn it is.",
            input_schema::<NoInput>,
        ),
        ToolName::RollOnTable => (
            "Draw a result from a named rollable table.",
            input_schema::<RollOnTableInput>,
        ),
        ToolName::ReadJournal => (
            "Read a journal entry (notes, handouts, lore) by name.",
            input_schema::<ReadJournalInput>,
        ),
    };

    ToolMetadata {
        name,
        description,
        parameters,
    }
}

/// Central registry of all tools
pub struct ToolRegistry {
    tools: HashMap<ToolName, ToolMetadata>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        let tools = ToolName::iter().map(|n| (n, metadata(n))).collect();
        Self { tools }
    }

    /// Parse and check a tool name coming from the model
    pub fn validate(&self, name: &str) -> ServiceResult<ToolName> {
        ToolName::from_str(name)
            .ok()
            .filter(|n| self.tools.contains_key(n))
            .ok_or_else(|| ServiceError::UnknownTool {
                tool: name.to_string(),
            })
    }

    /// Definitions advertised to the LLM, in declaration order
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        ToolName::iter()
            .filter_map(|n| self.tools.get(&n))
            .map(|t| ToolDefinition {
                name: t.name.to_string(),
                description: t.description.to_string(),
                input_schema: (t.parameters)(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global singleton registry instance
pub static REGISTRY: LazyLock<ToolRegistry> = LazyLock::new(ToolRegistry::new);
