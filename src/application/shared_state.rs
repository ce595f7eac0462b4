//! Working symbol set shared between the collector and the control plane.

use std::collections::BTreeSet;

use tokio::sync::Mutex;
use tracing::info;

use crate::domain::types::Symbol;

/// Mutex-guarded symbol set. Mutations are FIFO under contention; readers
/// always get a detached sorted copy, never the live container.
pub struct SharedSymbolSet {
    symbols: Mutex<BTreeSet<Symbol>>,
}

impl SharedSymbolSet {
    pub fn new(initial: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            symbols: Mutex::new(initial.into_iter().collect()),
        }
    }

    /// Sorted copy of the current working set.
    pub async fn snapshot(&self) -> Vec<Symbol> {
        self.symbols.lock().await.iter().cloned().collect()
    }

    /// Returns false when the symbol was already present.
    pub async fn add(&self, symbol: Symbol) -> bool {
        let mut symbols = self.symbols.lock().await;
        let added = symbols.insert(symbol.clone());
        if added {
            info!("SharedSymbolSet: added {symbol}");
        }
        added
    }

    /// Returns false when the symbol was not present.
    pub async fn remove(&self, symbol: &Symbol) -> bool {
        let mut symbols = self.symbols.lock().await;
        let removed = symbols.remove(symbol);
        if removed {
            info!("SharedSymbolSet: removed {symbol}");
        }
        removed
    }

    /// Replace the whole working set atomically.
    pub async fn replace(&self, new_symbols: impl IntoIterator<Item = Symbol>) -> usize {
        let mut symbols = self.symbols.lock().await;
        let old_len = symbols.len();
        *symbols = new_symbols.into_iter().collect();
        info!(
            "SharedSymbolSet: replaced working set ({} -> {} symbols)",
            old_len,
            symbols.len()
        );
        symbols.len()
    }

    pub async fn len(&self) -> usize {
        self.symbols.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.symbols.lock().await.is_empty()
    }
}
