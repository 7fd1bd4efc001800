//! Keeps only the listed fields.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Function;
use crate::error::Result;
use crate::message::{Data, Message};

/// Rebuilds the payload from `fields`, in the order they are listed.
///
/// Fields missing from the payload are skipped; when none match, the
/// message goes on with an empty payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pick {
    /// Fields to keep.
    pub fields: Vec<String>,
}

pub(super) fn factory() -> Box<dyn Function> {
    Box::new(Pick::default())
}

impl Function for Pick {
    fn name(&self) -> &'static str {
        "pick"
    }

    fn apply(&self, mut msg: Message) -> Result<Message> {
        debug!(namespace = %msg.namespace, "picking...");
        let mut picked = Data::new();
        for field in &self.fields {
            if let Some(value) = msg.data.shift_remove(field) {
                picked.insert(field.clone(), value);
            }
        }
        msg.data = picked;
        Ok(msg)
    }
}
