use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The account an operation runs for.
///
/// Every read and write is scoped to one account; number series are
/// allocated per account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountContext {
    pub account_id: Uuid,
}

impl AccountContext {
    pub fn new(account_id: Uuid) -> Self {
        Self { account_id }
    }
}
