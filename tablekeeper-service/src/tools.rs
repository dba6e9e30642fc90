//! Tools the model may call.
//!
//! Every tool executes on the connected game client; the server only
//! advertises definitions, validates names and relays calls through the
//! tool bridge.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod registry;

pub use registry::{REGISTRY, ToolMetadata, ToolName, ToolRegistry};

/// Input for `roll_dice`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RollDiceInput {
    /// Dice formula in the game system's notation (e.g. "2d6+2", "1d20")
    pub formula: String,
    /// Short label shown with the roll
    #[serde(default)]
    pub label: Option<String>,
    /// Roll privately to the GM
    #[serde(default)]
    pub blind: bool,
}

/// Input for `get_actor`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GetActorInput {
    /// Actor document ID
    #[serde(default)]
    pub actor_id: Option<String>,
    /// Actor name, used when no ID is known
    #[serde(default)]
    pub name: Option<String>,
}

/// Input for `list_actors`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListActorsInput {
    /// Restrict to an actor type (e.g. "character", "npc")
    #[serde(default)]
    pub actor_type: Option<String>,
    /// Maximum results (default 20)
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Input for tools that take no arguments
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NoInput {}

/// Input for `roll_on_table`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RollOnTableInput {
    /// Name of the rollable table
    pub table_name: String,
}

/// Input for `read_journal`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReadJournalInput {
    /// Journal entry name
    pub name: String,
    /// Specific page within the entry
    #[serde(default)]
    pub page: Option<String>,
}

/// Input for `update_actor`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpdateActorInput {
    /// Actor document ID
    pub actor_id: String,
    /// Partial document update (e.g. {"system.attributes.hp.value": 4})
    pub changes: serde_json::Value,
}

/// JSON schema for a tool's input type
pub(crate) fn input_schema<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}
