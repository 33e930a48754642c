use serde::{Deserialize, Serialize};

/// A labeled producer -> consumer relation.
///
/// The same `variable_name` may appear on several edges: one producer feeding
/// several consumers, or unrelated stage pairs that happen to reuse a label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDef {
  pub variable_name: String,
  pub from: String,
  pub to: String,
}

impl EdgeDef {
  pub fn new(
    variable_name: impl Into<String>,
    from: impl Into<String>,
    to: impl Into<String>,
  ) -> Self {
    Self {
      variable_name: variable_name.into(),
      from: from.into(),
      to: to.into(),
    }
  }
}
