//! The replicated write commands.
//!
//! Two commands travel through the log: `set` and `delete`. Their names and
//! JSON field names are persisted, so they must never change. Command types
//! live in a process-wide registry that is initialised once, before any
//! engine starts; the engine decodes a fresh command per apply.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::dict::{Dict, DictError};
use crate::engine::{EngineError, StateMachine};

/// A write operation the replicated log can carry.
pub trait Command: Send + Sync + std::fmt::Debug {
    /// Stable name the command is logged under.
    fn name(&self) -> &'static str;
    /// Executes against the local store, returning the new CAS.
    fn apply(&self, dict: &Dict) -> Result<Value, DictError>;
}

/// Writes `value` at `path` under the supplied CAS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCommand {
    pub path: String,
    pub value: Value,
    #[serde(rename = "CAS")]
    pub cas: f64,
}

impl SetCommand {
    pub const NAME: &'static str = "set";

    pub fn new(path: impl Into<String>, value: Value, cas: f64) -> Self {
        Self {
            path: path.into(),
            value,
            cas,
        }
    }
}

impl Command for SetCommand {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, dict: &Dict) -> Result<Value, DictError> {
        dict.set(&self.path, self.value.clone(), self.cas)
            .map(Value::from)
    }
}

/// Removes the field at `path` under the supplied CAS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteCommand {
    pub path: String,
    #[serde(rename = "CAS")]
    pub cas: f64,
}

impl DeleteCommand {
    pub const NAME: &'static str = "delete";

    pub fn new(path: impl Into<String>, cas: f64) -> Self {
        Self {
            path: path.into(),
            cas,
        }
    }
}

impl Command for DeleteCommand {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, dict: &Dict) -> Result<Value, DictError> {
        dict.delete(&self.path, self.cas).map(Value::from)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

type Decoder = fn(&Value) -> Result<Box<dyn Command>, serde_json::Error>;

static REGISTRY: OnceLock<HashMap<&'static str, Decoder>> = OnceLock::new();

fn decode_set(body: &Value) -> Result<Box<dyn Command>, serde_json::Error> {
    Ok(Box::new(serde_json::from_value::<SetCommand>(body.clone())?))
}

fn decode_delete(body: &Value) -> Result<Box<dyn Command>, serde_json::Error> {
    Ok(Box::new(serde_json::from_value::<DeleteCommand>(
        body.clone(),
    )?))
}

/// Registers the command types. Idempotent; must run before any engine
/// starts applying log entries.
pub fn register_commands() {
    REGISTRY.get_or_init(|| {
        let mut registry: HashMap<&'static str, Decoder> = HashMap::new();
        registry.insert(SetCommand::NAME, decode_set);
        registry.insert(DeleteCommand::NAME, decode_delete);
        registry
    });
}

/// Decodes a logged command by name.
pub fn decode(name: &str, body: &Value) -> Result<Box<dyn Command>, EngineError> {
    let registry = REGISTRY
        .get()
        .ok_or_else(|| EngineError::UnknownCommand(name.to_string()))?;
    let decoder = registry
        .get(name)
        .ok_or_else(|| EngineError::UnknownCommand(name.to_string()))?;
    decoder(body).map_err(|e| EngineError::Codec(e.to_string()))
}

// ============================================================================
// MACHINE BINDING
// ============================================================================

/// Binds the document store into the engine's state-machine seam: committed
/// commands dispatch through the registry, snapshots go through the store's
/// save/recover hooks.
pub struct DictMachine {
    dict: Arc<Dict>,
}

impl DictMachine {
    pub fn new(dict: Arc<Dict>) -> Self {
        Self { dict }
    }

    pub fn dict(&self) -> &Arc<Dict> {
        &self.dict
    }
}

impl StateMachine for DictMachine {
    fn apply(&self, name: &str, body: &Value) -> Result<Value, EngineError> {
        let command = decode(name, body)?;
        command
            .apply(&self.dict)
            .map_err(|e| EngineError::Command(e.to_string()))
    }

    fn save(&self) -> Result<Vec<u8>, EngineError> {
        self.dict.save().map_err(|e| EngineError::Codec(e.to_string()))
    }

    fn recover(&self, data: &[u8]) -> Result<(), EngineError> {
        self.dict
            .recover(data)
            .map_err(|e| EngineError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::NULL_CAS;
    use serde_json::json;

    #[test]
    fn wire_field_names_are_stable() {
        let set = SetCommand::new("/a", json!(1), 2.0);
        let raw = serde_json::to_value(&set).unwrap();
        assert_eq!(raw, json!({"path": "/a", "value": 1, "CAS": 2.0}));

        let del = DeleteCommand::new("/a", 2.0);
        let raw = serde_json::to_value(&del).unwrap();
        assert_eq!(raw, json!({"path": "/a", "CAS": 2.0}));

        assert_eq!(SetCommand::NAME, "set");
        assert_eq!(DeleteCommand::NAME, "delete");
    }

    #[test]
    fn registration_is_idempotent() {
        register_commands();
        register_commands();
        assert!(decode("set", &json!({"path": "/a", "value": 1, "CAS": 0.0})).is_ok());
        assert!(decode("delete", &json!({"path": "/a", "CAS": 0.0})).is_ok());
    }

    #[test]
    fn unknown_command_name_is_rejected() {
        register_commands();
        let err = decode("rename", &json!({})).unwrap_err();
        assert!(matches!(err, EngineError::UnknownCommand(_)));
    }

    #[test]
    fn malformed_body_is_a_codec_error() {
        register_commands();
        let err = decode("set", &json!({"value": 1})).unwrap_err();
        assert!(matches!(err, EngineError::Codec(_)));
    }

    #[test]
    fn machine_applies_set_and_delete() {
        register_commands();
        let machine = DictMachine::new(Arc::new(Dict::new()));

        let next = machine
            .apply("set", &json!({"path": "/k", "value": "v", "CAS": 1.0}))
            .unwrap();
        assert_eq!(next, json!(2.0));
        assert_eq!(machine.dict().get("/k").unwrap().0, json!("v"));

        let next = machine
            .apply("delete", &json!({"path": "/k", "CAS": 2.0}))
            .unwrap();
        assert_eq!(next, json!(3.0));
    }

    #[test]
    fn rejected_command_surfaces_the_wire_error() {
        register_commands();
        let machine = DictMachine::new(Arc::new(Dict::new()));

        let err = machine
            .apply("set", &json!({"path": "/k", "value": 1, "CAS": 9.0}))
            .unwrap_err();
        match err {
            EngineError::Command(msg) => assert_eq!(msg, "errorInvalidCAS"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn machine_snapshot_round_trips() {
        register_commands();
        let machine = DictMachine::new(Arc::new(Dict::new()));
        machine
            .apply("set", &json!({"path": "/k", "value": [1, 2], "CAS": 0.0}))
            .unwrap();
        let data = machine.save().unwrap();

        let restored = DictMachine::new(Arc::new(Dict::new()));
        restored.recover(&data).unwrap();
        assert_eq!(restored.dict().get("/k").unwrap().0, json!([1, 2]));
        assert_eq!(restored.dict().cas(), 2.0);
    }

    #[test]
    fn command_apply_with_null_cas_skips_check() {
        let dict = Dict::new();
        let cmd = SetCommand::new("/x", json!(true), NULL_CAS);
        assert_eq!(cmd.apply(&dict).unwrap(), json!(2.0));
    }
}
