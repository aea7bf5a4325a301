//! Wasm of the instantiated modules, for the code cache to compile from.
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use sysvmoc_cache::CodeSource;
use sysvmoc_types::{CodeTuple, Digest};

struct Registered {
    wasm: Arc<[u8]>,
    modules: usize,
}

/// Wasm bytes by [`CodeTuple`], counted per instantiated module.
#[derive(Default)]
pub(crate) struct CodeRegistry {
    codes: DashMap<CodeTuple, Registered>,
}

impl CodeRegistry {
    /// Registers one more module for `tuple`. The bytes of the first
    /// registration are kept.
    pub(crate) fn acquire(&self, tuple: CodeTuple, wasm: &[u8]) {
        match self.codes.entry(tuple) {
            Entry::Occupied(mut entry) => entry.get_mut().modules += 1,
            Entry::Vacant(entry) => {
                entry.insert(Registered {
                    wasm: Arc::from(wasm),
                    modules: 1,
                });
            }
        }
    }

    /// Drops one module for `tuple`. Returns `true` if it was the last one.
    pub(crate) fn release(&self, tuple: &CodeTuple) -> bool {
        self.codes
            .remove_if_mut(tuple, |_, registered| {
                registered.modules -= 1;
                registered.modules == 0
            })
            .is_some()
    }

    pub(crate) fn modules(&self, tuple: &CodeTuple) -> usize {
        self.codes.get(tuple).map_or(0, |registered| registered.modules)
    }
}

impl CodeSource for CodeRegistry {
    fn code(&self, code_hash: &Digest, vm_version: u8) -> Option<Arc<[u8]>> {
        self.codes
            .get(&CodeTuple::new(*code_hash, vm_version))
            .map(|registered| registered.wasm.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bytes_live_as_long_as_a_module() {
        let registry = CodeRegistry::default();
        let tuple = CodeTuple::new(Digest::hash(b"wasm"), 0);
        registry.acquire(tuple, b"wasm");
        registry.acquire(tuple, b"ignored");
        assert_eq!(registry.modules(&tuple), 2);
        assert_eq!(&*registry.code(&tuple.code_id, 0).unwrap(), b"wasm");
        assert!(registry.code(&tuple.code_id, 1).is_none());

        assert!(!registry.release(&tuple));
        assert!(registry.code(&tuple.code_id, 0).is_some());
        assert!(registry.release(&tuple));
        assert!(registry.code(&tuple.code_id, 0).is_none());
        assert!(!registry.release(&tuple));
    }
}
