//! Drops the listed fields.

use serde::{Deserialize, Serialize};

use super::Function;
use crate::error::Result;
use crate::message::Message;

/// Removes `fields` from the payload in place. Absent fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Omit {
    /// Fields to remove.
    pub fields: Vec<String>,
}

pub(super) fn factory() -> Box<dyn Function> {
    Box::new(Omit::default())
}

impl Function for Omit {
    fn name(&self) -> &'static str {
        "omit"
    }

    fn apply(&self, mut msg: Message) -> Result<Message> {
        for field in &self.fields {
            msg.data.shift_remove(field);
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Op;
    use serde_json::{json, Value};

    fn omit(fields: &[&str], input: Value) -> Value {
        let omit = Omit {
            fields: fields.iter().map(ToString::to_string).collect(),
        };
        let Value::Object(data) = input else {
            panic!("object expected");
        };
        Value::Object(omit.apply(Message::new(Op::Insert, "test", data)).unwrap().data)
    }

    #[test]
    fn test_removes_field() {
        assert_eq!(omit(&["a"], json!({"a": 1, "b": 2})), json!({"b": 2}));
    }

    #[test]
    fn test_absent_field_is_noop() {
        assert_eq!(omit(&["z"], json!({"a": 1, "b": 2})), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_keeps_remaining_order() {
        let out = omit(&["b"], json!({"c": 1, "b": 2, "a": 3}));
        let keys: Vec<&String> = out.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["c", "a"]);
    }
}
