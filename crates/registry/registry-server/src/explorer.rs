use alloy::primitives::TxHash;

/// Placeholder substituted with the transaction hash in explorer templates.
pub const TX_HASH_PLACEHOLDER: &str = "{txHash}";

/// Block explorer link template and chain display name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplorerLinks {
    pub explorer_tx_url: String,
    pub chain_name: String,
}

impl ExplorerLinks {
    pub fn new(explorer_tx_url: impl Into<String>, chain_name: impl Into<String>) -> Self {
        Self {
            explorer_tx_url: explorer_tx_url.into(),
            chain_name: chain_name.into(),
        }
    }

    /// Substitutes `{txHash}` when the template has it, appends the hash otherwise.
    pub fn tx_url(&self, tx_hash: &TxHash) -> String {
        let hash = tx_hash.to_string();
        if self.explorer_tx_url.contains(TX_HASH_PLACEHOLDER) {
            self.explorer_tx_url.replace(TX_HASH_PLACEHOLDER, &hash)
        } else {
            format!("{}{hash}", self.explorer_tx_url)
        }
    }
}
