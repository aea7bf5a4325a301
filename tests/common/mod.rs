//! Helpers shared by the integration tests: a code generator replaying
//! hand-assembled x86-64, contracts, and an apply context.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysvmoc::{Action, ApplyContext, DeadlineTimer, Name, OcConfig, ResourceLimits, TransactionTimer};
use sysvmoc_compiler::{
    spawn_compile_monitor_thread, Cancellation, CodeGenerator, CompileError, CompileMonitorHandle,
    GeneratedCode, ModuleLayout,
};
use sysvmoc_types::memory_layout::intrinsic_offset;
use sysvmoc_types::Digest;

/// `ret`
pub const RET: &[u8] = &[0xC3];

/// `jmp $`
pub const SPIN: &[u8] = &[0xEB, 0xFE];

/// `mov byte [rcx + 0x10000], 0x2a; ret`: a write to the second page.
pub const WRITE_SECOND_PAGE: &[u8] = &[0xC6, 0x81, 0x00, 0x00, 0x01, 0x00, 0x2A, 0xC3];

/// `mov byte [rcx], 0x2a; ret`
pub const WRITE_FIRST_BYTE: &[u8] = &[0xC6, 0x01, 0x2A, 0xC3];

/// Calls intrinsic `ordinal` with no arguments and returns.
pub fn call_intrinsic(ordinal: usize) -> Vec<u8> {
    let disp = -(intrinsic_offset(ordinal) as i32);
    // sub rsp, 8; call [rcx + disp]; add rsp, 8; ret
    let mut code = vec![0x48, 0x83, 0xEC, 0x08, 0xFF, 0x91];
    code.extend_from_slice(&disp.to_le_bytes());
    code.extend_from_slice(&[0x48, 0x83, 0xC4, 0x08, 0xC3]);
    code
}

/// Emits the same native body for every function and counts compiles.
pub struct Scripted {
    body: Vec<u8>,
    generated: AtomicUsize,
}

impl Scripted {
    pub fn new(body: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            body: body.to_vec(),
            generated: AtomicUsize::new(0),
        })
    }

    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }
}

impl CodeGenerator for Scripted {
    fn generate(
        &self,
        module: &ModuleLayout<'_>,
        _: &Cancellation,
    ) -> Result<GeneratedCode, CompileError> {
        self.generated.fetch_add(1, Ordering::SeqCst);
        Ok(GeneratedCode {
            code: self.body.clone(),
            function_offsets: vec![0; module.functions.len()],
            prologue: Vec::new(),
        })
    }
}

/// A compile monitor thread replaying `body`.
pub fn monitor(body: &[u8]) -> (CompileMonitorHandle, Arc<Scripted>) {
    let generator = Scripted::new(body);
    let monitor = spawn_compile_monitor_thread(generator.clone()).unwrap();
    (monitor, generator)
}

/// A contract whose initial memory starts with `tag`, so that every tag
/// gives a distinct code hash.
pub fn contract(tag: &str) -> Vec<u8> {
    wat::parse_str(format!(
        r#"(module
            (memory 1)
            (data (i32.const 0) "{tag}")
            (func (export "apply") (param i64 i64 i64)))"#
    ))
    .unwrap()
}

pub fn config() -> OcConfig {
    OcConfig {
        cache_size: 1024 * 1024,
        compile_timeout: Duration::from_secs(10),
        main_thread_sliced_pages: 4,
        ..OcConfig::default()
    }
}

pub fn hash(wasm: &[u8]) -> Digest {
    Digest::hash(wasm)
}

/// An apply context recording what the contract did.
pub struct TestContext {
    pub action: Action,
    pub write_window: bool,
    pub console: String,
    pub inline_actions: Vec<Vec<u8>>,
    pub timer: Arc<DeadlineTimer>,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            action: Action {
                account: "alice".parse().unwrap(),
                name: "transfer".parse().unwrap(),
                data: b"payload".to_vec(),
            },
            write_window: true,
            console: String::new(),
            inline_actions: Vec::new(),
            timer: Arc::new(DeadlineTimer::new().unwrap()),
        }
    }

    pub fn read_only() -> Self {
        Self {
            write_window: false,
            ..Self::new()
        }
    }
}

impl ApplyContext for TestContext {
    fn receiver(&self) -> Name {
        self.action.account
    }

    fn action(&self) -> &Action {
        &self.action
    }

    fn is_write_window(&self) -> bool {
        self.write_window
    }

    fn pending_block_time(&self) -> u64 {
        1_700_000_000_000_000
    }

    fn is_feature_activated(&self, _feature: &Digest) -> bool {
        false
    }

    fn execute_inline(&mut self, packed_action: &[u8]) -> Result<(), String> {
        self.inline_actions.push(packed_action.to_vec());
        Ok(())
    }

    fn console_append(&mut self, text: &str) {
        self.console.push_str(text);
    }

    fn resource_limits(&self, _account: Name) -> ResourceLimits {
        ResourceLimits {
            ram_bytes: -1,
            net_weight: -1,
            cpu_weight: -1,
        }
    }

    fn timer(&self) -> Arc<dyn TransactionTimer> {
        self.timer.clone()
    }
}
