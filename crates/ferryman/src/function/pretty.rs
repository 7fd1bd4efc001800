//! Logs each payload as indented JSON.

use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use tracing::info;

use super::Function;
use crate::error::Result;
use crate::message::{Data, Message};

/// Default indentation width.
pub const DEFAULT_INDENT: usize = 2;

/// Diagnostic passthrough. `spaces = 0` logs compact JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pretty {
    /// Indentation width.
    pub spaces: usize,
}

impl Default for Pretty {
    fn default() -> Self {
        Self {
            spaces: DEFAULT_INDENT,
        }
    }
}

pub(super) fn factory() -> Box<dyn Function> {
    Box::new(Pretty::default())
}

impl Pretty {
    /// Renders `data` with the configured indentation.
    pub fn render(&self, data: &Data) -> Result<String> {
        if self.spaces == 0 {
            return Ok(serde_json::to_string(data)?);
        }
        let indent = " ".repeat(self.spaces);
        let mut out = Vec::new();
        let mut ser =
            serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(indent.as_bytes()));
        data.serialize(&mut ser)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

impl Function for Pretty {
    fn name(&self) -> &'static str {
        "pretty"
    }

    fn apply(&self, msg: Message) -> Result<Message> {
        info!("\n{}", self.render(&msg.data)?);
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Op;
    use serde_json::json;

    fn data() -> Data {
        let mut data = Data::new();
        data.insert("a".to_string(), json!(1));
        data
    }

    #[test]
    fn test_default_indent() {
        assert_eq!(Pretty::default().render(&data()).unwrap(), "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_custom_indent() {
        let pretty = Pretty { spaces: 4 };
        assert_eq!(pretty.render(&data()).unwrap(), "{\n    \"a\": 1\n}");
    }

    #[test]
    fn test_zero_is_compact() {
        let pretty = Pretty { spaces: 0 };
        assert_eq!(pretty.render(&data()).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_passthrough() {
        let out = Pretty::default()
            .apply(Message::new(Op::Update, "t", data()))
            .unwrap();
        assert_eq!(out.op, Op::Update);
        assert_eq!(out.data, data());
    }
}
