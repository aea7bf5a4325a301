//! The code cache against a real compile monitor.
#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

mod common;

use common::{config, contract, hash, monitor, RET};
use memmap2::Mmap;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use sysvmoc::{CodeCache, CodeCacheError, CodeDescriptor};
use sysvmoc_cache::{CodeSource, MINIMUM_CACHE_SIZE};
use sysvmoc_types::{CodeTuple, Digest, OcConfig, StartOffset, CURRENT_CODEGEN_VERSION};

#[derive(Default)]
struct Codes(Mutex<HashMap<Digest, Arc<[u8]>>>);

impl Codes {
    fn add(&self, wasm: &[u8]) -> Digest {
        let digest = hash(wasm);
        self.0.lock().insert(digest, Arc::from(wasm));
        digest
    }
}

impl CodeSource for Codes {
    fn code(&self, code_hash: &Digest, _vm_version: u8) -> Option<Arc<[u8]>> {
        self.0.lock().get(code_hash).cloned()
    }
}

fn open(dir: &Path, config: OcConfig, codes: &Arc<Codes>, service: BorrowedFd<'_>) -> CodeCache {
    CodeCache::new(dir, config, codes.clone(), service).unwrap()
}

#[test]
#[tracing_test::traced_test]
fn miss_compiles_once_then_hits() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, generator) = monitor(RET);
    let codes = Arc::new(Codes::default());
    let wasm = contract("hello");
    let digest = codes.add(&wasm);
    let cache = open(dir.path(), config(), &codes, monitor.service());

    let descriptor = cache.get_descriptor_for_code_sync(&digest, 0, true).unwrap();
    assert_eq!(descriptor.code_tuple(), CodeTuple::new(digest, 0));
    assert_eq!(descriptor.codegen_version, CURRENT_CODEGEN_VERSION);
    assert_eq!(descriptor.start, StartOffset::NoOffset);
    assert_eq!(descriptor.starting_memory_pages, 1);
    assert_eq!(descriptor.initdata_size, 5);
    assert_eq!(descriptor.initdata_prologue_size, 0);

    let again = cache.get_descriptor_for_code_sync(&digest, 0, true).unwrap();
    assert!(Arc::ptr_eq(&descriptor, &again));
    assert_eq!(generator.generated(), 1);
    assert_eq!(cache.len(), 1);

    let map = unsafe { Mmap::map(cache.cache_file()).unwrap() };
    let code = descriptor.code_begin as usize;
    let initdata = descriptor.initdata_begin as usize;
    assert_eq!(&map[code..code + 1], RET);
    assert_eq!(&map[initdata..initdata + 5], b"hello");
}

#[test]
fn distinct_codes_never_share_storage() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, generator) = monitor(RET);
    let codes = Arc::new(Codes::default());
    let a = codes.add(&contract("a"));
    let b = codes.add(&contract("b"));
    let cache = open(dir.path(), config(), &codes, monitor.service());

    let da = cache.get_descriptor_for_code_sync(&a, 0, true).unwrap();
    let db = cache.get_descriptor_for_code_sync(&b, 0, true).unwrap();
    let da1 = cache.get_descriptor_for_code_sync(&a, 1, true).unwrap();
    assert_ne!(da.code_begin, db.code_begin);
    assert_ne!(da.code_begin, da1.code_begin);
    assert_ne!(da.initdata_begin, db.initdata_begin);
    assert_eq!(da1.vm_version, 1);
    assert_eq!(generator.generated(), 3);
    assert_eq!(cache.len(), 3);
}

#[test]
fn concurrent_misses_compile_once() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, generator) = monitor(RET);
    let codes = Arc::new(Codes::default());
    let digest = codes.add(&contract("shared"));
    let cache = open(dir.path(), config(), &codes, monitor.service());
    let barrier = Barrier::new(6);

    let descriptors: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..6)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    cache.get_descriptor_for_code_sync(&digest, 0, false).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(generator.generated(), 1);
    for descriptor in &descriptors[1..] {
        assert_eq!(**descriptor, *descriptors[0]);
    }
}

#[test]
fn oversized_code_is_a_capacity_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, _) = monitor(&[0xC3; 32 * 1024]);
    let codes = Arc::new(Codes::default());
    let digest = codes.add(&contract("big"));
    let config = OcConfig {
        cache_size: MINIMUM_CACHE_SIZE,
        ..config()
    };
    let cache = open(dir.path(), config, &codes, monitor.service());

    let err = cache.get_descriptor_for_code_sync(&digest, 0, true).unwrap_err();
    assert_eq!(err, CodeCacheError::CacheFull);
    assert!(err.is_capacity_failure());
    assert!(cache.is_empty());
}

#[test]
fn invalid_wasm_is_an_internal_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, generator) = monitor(RET);
    let codes = Arc::new(Codes::default());
    let digest = codes.add(b"\0asm garbage");
    let missing = hash(b"never registered");
    let cache = open(dir.path(), config(), &codes, monitor.service());

    let err = cache.get_descriptor_for_code_sync(&digest, 0, true).unwrap_err();
    assert_eq!(err, CodeCacheError::CompileFailed(CodeTuple::new(digest, 0)));
    assert!(!err.is_capacity_failure());

    let err = cache.get_descriptor_for_code_sync(&missing, 0, true).unwrap_err();
    assert_eq!(err, CodeCacheError::CodeNotFound(CodeTuple::new(missing, 0)));
    assert_eq!(generator.generated(), 0);
}

#[test]
fn compiled_code_survives_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, generator) = monitor(RET);
    let codes = Arc::new(Codes::default());
    let digest = codes.add(&contract("persist"));

    let first = {
        let cache = open(dir.path(), config(), &codes, monitor.service());
        let descriptor = cache.get_descriptor_for_code_sync(&digest, 0, true).unwrap();
        CodeDescriptor::clone(&descriptor)
    };

    let cache = open(dir.path(), config(), &codes, monitor.service());
    assert_eq!(cache.len(), 1);
    let descriptor = cache.get_descriptor_for_code_sync(&digest, 0, true).unwrap();
    assert_eq!(*descriptor, first);
    assert_eq!(generator.generated(), 1);
}

