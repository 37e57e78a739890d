//! A WAT guest implementing the same contract as the ExifTool module.
//!
//! The stub does not interpret programs. Per call it either echoes the
//! program text or prints a canned response, writes a fixed line to stderr,
//! and can copy `/tmp/input` to `/tmp/output` through real WASI calls. It
//! can also unwind a configurable number of times per call, trap on
//! programs starting with `!`, and misbehave on large allocations.
//!
//! Memory layout (64 KiB pages, 2 MiB total):
//!
//! ```text
//! 0x000010  asyncify control record (host owned)
//! 0x000018  asyncify data buffer up to 0x100000
//! 0x100000  iovec, nwritten, fd slot
//! 0x100010  "input", "output", output suffix, stderr line
//! 0x101000  canned response
//! 0x110000  copy buffer (64 KiB)
//! 0x120000  heap
//! ```

use crate::asyncify::{DEFAULT_DATA_END, DEFAULT_DATA_START, DEFAULT_REGION_ADDRESS};

/// Allocations at or above this size fail with a null pointer.
pub const ALLOC_LIMIT: usize = 0x40000;
/// Allocations at or above this size (and below [`ALLOC_LIMIT`]) return a
/// block that runs past the end of memory.
pub const BOGUS_ALLOC_THRESHOLD: usize = 0x20000;
/// Programs starting with this byte trap.
pub const TRAP_MARKER: char = '!';
/// Line written to stderr by every completed call.
pub const STDERR_LINE: &str = "stub: evaluated\n";
/// Bytes appended to the input when copying it to the output slot.
pub const OUTPUT_SUFFIX: &[u8] = b"<stub>";

const IOVEC: u32 = 0x100000;
const NWRITTEN: u32 = 0x100008;
const FD_SLOT: u32 = 0x10000c;
const INPUT_PATH: u32 = 0x100010;
const OUTPUT_PATH: u32 = 0x100020;
const SUFFIX_ADDR: u32 = 0x100040;
const STDERR_ADDR: u32 = 0x100080;
const RESPONSE_ADDR: u32 = 0x101000;
const RESPONSE_MAX: usize = 0xf000;
const COPY_BUF: u32 = 0x110000;
const COPY_BUF_LEN: u32 = 0x10000;
const HEAP_BASE: u32 = 0x120000;
const BOGUS_PTR: u32 = 0x1ffff0;
const SCRATCH_FD: u32 = 3;

/// Builder for the stub guest module.
#[derive(Debug, Clone)]
pub struct StubGuest {
    unwinds_per_call: u32,
    response: Option<Vec<u8>>,
    copy_input: bool,
    optional_exports: bool,
}

impl Default for StubGuest {
    fn default() -> Self {
        Self {
            unwinds_per_call: 0,
            response: None,
            copy_input: false,
            optional_exports: true,
        }
    }
}

impl StubGuest {
    /// A stub that echoes every program to stdout.
    pub fn echo() -> Self {
        Self::default()
    }

    /// A stub that prints `response` for every program.
    pub fn responding(response: impl AsRef<[u8]>) -> Self {
        let response = response.as_ref().to_vec();
        assert!(response.len() <= RESPONSE_MAX, "stub response too large");
        Self {
            response: Some(response),
            ..Self::default()
        }
    }

    /// Unwind `count` times before completing each call.
    pub fn with_unwinds(mut self, count: u32) -> Self {
        self.unwinds_per_call = count;
        self
    }

    /// Copy `/tmp/input` to `/tmp/output` (plus [`OUTPUT_SUFFIX`]) on each call.
    pub fn copying_input(mut self) -> Self {
        self.copy_input = true;
        self
    }

    /// Leave out `_initialize`, `zeroperl_init` and `zeroperl_flush`.
    pub fn without_optional_exports(mut self) -> Self {
        self.optional_exports = false;
        self
    }

    /// Module bytes (WAT text) accepted by `wasmtime::Module::new`.
    pub fn module_bytes(&self) -> Vec<u8> {
        self.to_wat().into_bytes()
    }

    /// Render the module as WAT.
    pub fn to_wat(&self) -> String {
        let (stdout_ptr, stdout_len, response) = match &self.response {
            Some(bytes) => (
                format!("(i32.const {RESPONSE_ADDR})"),
                format!("(i32.const {})", bytes.len()),
                wat_string(bytes),
            ),
            None => (
                "(local.get $code)".to_string(),
                "(call $strlen (local.get $code))".to_string(),
                String::new(),
            ),
        };
        let copy = if self.copy_input {
            "(call $copy_input)"
        } else {
            ""
        };
        let optional = if self.optional_exports {
            r#"
  (func (export "_initialize"))
  (func (export "zeroperl_init") (result i32)
    (global.set $ready (i32.const 1))
    (i32.const 0))
  (func (export "zeroperl_flush")
    (global.set $flushes (i32.add (global.get $flushes) (i32.const 1))))"#
        } else {
            ""
        };
        let ready = if self.optional_exports { 0 } else { 1 };

        format!(
            r#"(module
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_close" (func $fd_close (param i32) (result i32)))
  (import "wasi_snapshot_preview1" "path_open" (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "env" "call_host_function" (func $call_host (param i32 i32 i32) (result i32)))

  (memory (export "memory") 32)

  (global $state (mut i32) (i32.const 0))
  (global $pending (mut i32) (i32.const 0))
  (global $ready (mut i32) (i32.const {ready}))
  (global $heap (mut i32) (i32.const {HEAP_BASE}))
  (global $live (mut i32) (i32.const 0))
  (global $rewinds (mut i32) (i32.const 0))
  (global $evals (mut i32) (i32.const 0))
  (global $flushes (mut i32) (i32.const 0))

  (data (i32.const {INPUT_PATH}) "input")
  (data (i32.const {OUTPUT_PATH}) "output")
  (data (i32.const {SUFFIX_ADDR}) "{suffix}")
  (data (i32.const {STDERR_ADDR}) "{stderr}")
  (data (i32.const {RESPONSE_ADDR}) "{response}")

  (func $strlen (param $p i32) (result i32)
    (local $n i32)
    (block $done
      (loop $next
        (br_if $done (i32.eqz (i32.load8_u (i32.add (local.get $p) (local.get $n)))))
        (local.set $n (i32.add (local.get $n) (i32.const 1)))
        (br $next)))
    (local.get $n))

  (func $emit (param $fd i32) (param $ptr i32) (param $len i32) (result i32)
    (i32.store (i32.const {IOVEC}) (local.get $ptr))
    (i32.store (i32.const {iovec_len}) (local.get $len))
    (call $fd_write (local.get $fd) (i32.const {IOVEC}) (i32.const 1) (i32.const {NWRITTEN})))

  (func $copy_input
    (local $n i32)
    (if (call $path_open (i32.const {SCRATCH_FD}) (i32.const 0) (i32.const {INPUT_PATH}) (i32.const 5)
          (i32.const 0) (i64.const 2) (i64.const 0) (i32.const 0) (i32.const {FD_SLOT}))
      (then (unreachable)))
    (i32.store (i32.const {IOVEC}) (i32.const {COPY_BUF}))
    (i32.store (i32.const {iovec_len}) (i32.const {COPY_BUF_LEN}))
    (if (call $fd_read (i32.load (i32.const {FD_SLOT})) (i32.const {IOVEC}) (i32.const 1) (i32.const {NWRITTEN}))
      (then (unreachable)))
    (local.set $n (i32.load (i32.const {NWRITTEN})))
    (drop (call $fd_close (i32.load (i32.const {FD_SLOT}))))
    (if (call $path_open (i32.const {SCRATCH_FD}) (i32.const 0) (i32.const {OUTPUT_PATH}) (i32.const 6)
          (i32.const 9) (i64.const 64) (i64.const 0) (i32.const 0) (i32.const {FD_SLOT}))
      (then (unreachable)))
    (if (call $emit (i32.load (i32.const {FD_SLOT})) (i32.const {COPY_BUF}) (local.get $n))
      (then (unreachable)))
    (if (call $emit (i32.load (i32.const {FD_SLOT})) (i32.const {SUFFIX_ADDR}) (i32.const {suffix_len}))
      (then (unreachable)))
    (drop (call $fd_close (i32.load (i32.const {FD_SLOT})))))

  (func (export "malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (if (i32.ge_u (local.get $size) (i32.const {ALLOC_LIMIT}))
      (then (return (i32.const 0))))
    (global.set $live (i32.add (global.get $live) (i32.const 1)))
    (if (i32.ge_u (local.get $size) (i32.const {BOGUS_ALLOC_THRESHOLD}))
      (then (return (i32.const {BOGUS_PTR}))))
    (local.set $ptr (global.get $heap))
    (global.set $heap
      (i32.and (i32.add (i32.add (local.get $ptr) (local.get $size)) (i32.const 7)) (i32.const -8)))
    (local.get $ptr))

  (func (export "free") (param $ptr i32)
    (if (i32.eqz (local.get $ptr)) (then (return)))
    (global.set $live (i32.sub (global.get $live) (i32.const 1)))
    (if (i32.eqz (global.get $live))
      (then (global.set $heap (i32.const {HEAP_BASE})))))

  (func (export "asyncify_get_state") (result i32)
    (global.get $state))

  (func (export "asyncify_stop_unwind")
    (if (i32.ne (global.get $state) (i32.const 1)) (then (unreachable)))
    (global.set $state (i32.const 0)))

  (func (export "asyncify_start_rewind") (param $addr i32)
    (if (i32.ne (global.get $state) (i32.const 0)) (then (unreachable)))
    (if (i32.ne (local.get $addr) (i32.const {region})) (then (unreachable)))
    (if (i32.ne (i32.load (local.get $addr)) (i32.const {data_start})) (then (unreachable)))
    (if (i32.ne (i32.load offset=4 (local.get $addr)) (i32.const {data_end})) (then (unreachable)))
    (global.set $rewinds (i32.add (global.get $rewinds) (i32.const 1)))
    (global.set $state (i32.const 2)))

  (func (export "asyncify_stop_rewind")
    (if (i32.ne (global.get $state) (i32.const 2)) (then (unreachable)))
    (global.set $state (i32.const 0)))
{optional}
  (func (export "zeroperl_eval") (param $code i32) (param i32 i32 i32) (result i32)
    (if (i32.eqz (global.get $ready)) (then (unreachable)))
    (if (i32.eqz (global.get $state))
      (then (global.set $pending (i32.const {unwinds}))))
    (if (global.get $pending)
      (then
        (global.set $pending (i32.sub (global.get $pending) (i32.const 1)))
        (i32.store (i32.const {region}) (i32.const -1))
        (global.set $state (i32.const 1))
        (return (i32.const -1))))
    (if (call $call_host (i32.const 0) (local.get $code) (i32.const 0))
      (then (unreachable)))
    (if (i32.eq (i32.load8_u (local.get $code)) (i32.const {trap}))
      (then (unreachable)))
    (global.set $evals (i32.add (global.get $evals) (i32.const 1)))
    {copy}
    (if (call $emit (i32.const 1) {stdout_ptr} {stdout_len})
      (then (unreachable)))
    (if (call $emit (i32.const 2) (i32.const {STDERR_ADDR}) (i32.const {stderr_len}))
      (then (unreachable)))
    (i32.const 0))

  (func (export "stub_live_allocations") (result i32) (global.get $live))
  (func (export "stub_rewinds") (result i32) (global.get $rewinds))
  (func (export "stub_evaluations") (result i32) (global.get $evals))
  (func (export "stub_flushes") (result i32) (global.get $flushes)))
"#,
            iovec_len = IOVEC + 4,
            suffix = wat_string(OUTPUT_SUFFIX),
            suffix_len = OUTPUT_SUFFIX.len(),
            stderr = wat_string(STDERR_LINE.as_bytes()),
            stderr_len = STDERR_LINE.len(),
            region = DEFAULT_REGION_ADDRESS,
            data_start = DEFAULT_DATA_START,
            data_end = DEFAULT_DATA_END,
            unwinds = self.unwinds_per_call,
            trap = TRAP_MARKER as u32,
        )
    }
}

/// Hex-escape every byte for a WAT string literal.
fn wat_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{b:02x}")).collect()
}
