//! Shared test helpers for integration tests.
//!
//! Provides transport modules written in WebAssembly text (compiled on the
//! fly by wasmtime), loopback peers, and connection factories used across
//! all integration test files.

#![allow(dead_code)]

use std::io::Read;
use std::net::{TcpListener, TcpStream};

use water_sandbox::{Config, Connection, Dialer, TransportModule};

// ── Transport Modules ──

/// Capability imports, memory, and the connected handle shared by every
/// test module.
const PRELUDE: &str = r#"
    (import "water_host" "connect" (func $connect (result i32)))
    (import "water_host" "host_read" (func $host_read (param i32 i32 i32) (result i32)))
    (import "water_host" "host_write" (func $host_write (param i32 i32 i32) (result i32)))
    (import "water_host" "host_close" (func $host_close (param i32) (result i32)))
    (memory (export "memory") 1)
    (global $fd (mut i32) (i32.const -1))
"#;

/// `_water_init`: connect once, keep the handle, propagate failure.
const INIT: &str = r#"
    (func (export "_water_init") (result i32)
        (local $r i32)
        (local.set $r (call $connect))
        (if (i32.lt_s (local.get $r) (i32.const 0)) (then (return (local.get $r))))
        (global.set $fd (local.get $r))
        (i32.const 0))
"#;

const CLOSE: &str = r#"
    (func (export "_water_close") (param i32 i32) (result i32)
        (call $host_close (global.get $fd)))
"#;

const PLAIN_IO: &str = r#"
    (func (export "_water_read") (param $off i32) (param $len i32) (result i32)
        (call $host_read (global.get $fd) (local.get $off) (local.get $len)))
    (func (export "_water_write") (param $off i32) (param $len i32) (result i32)
        (call $host_write (global.get $fd) (local.get $off) (local.get $len)))
"#;

/// Reverses `[off, off+len)` in place, then forwards; reads forward first,
/// then reverse what arrived.
const REVERSE_IO: &str = r#"
    (func $reverse (param $off i32) (param $len i32)
        (local $i i32) (local $j i32) (local $t i32)
        (local.set $i (local.get $off))
        (local.set $j (i32.sub (i32.add (local.get $off) (local.get $len)) (i32.const 1)))
        (block $done
            (loop $swap
                (br_if $done (i32.ge_s (local.get $i) (local.get $j)))
                (local.set $t (i32.load8_u (local.get $i)))
                (i32.store8 (local.get $i) (i32.load8_u (local.get $j)))
                (i32.store8 (local.get $j) (local.get $t))
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (local.set $j (i32.sub (local.get $j) (i32.const 1)))
                (br $swap))))
    (func (export "_water_read") (param $off i32) (param $len i32) (result i32)
        (local $n i32)
        (local.set $n (call $host_read (global.get $fd) (local.get $off) (local.get $len)))
        (if (i32.gt_s (local.get $n) (i32.const 0))
            (then (call $reverse (local.get $off) (local.get $n))))
        (local.get $n))
    (func (export "_water_write") (param $off i32) (param $len i32) (result i32)
        (call $reverse (local.get $off) (local.get $len))
        (call $host_write (global.get $fd) (local.get $off) (local.get $len)))
"#;

/// Traps on read; writes pass through.
const TRAPPING_IO: &str = r#"
    (func (export "_water_read") (param i32 i32) (result i32)
        unreachable)
    (func (export "_water_write") (param $off i32) (param $len i32) (result i32)
        (call $host_write (global.get $fd) (local.get $off) (local.get $len)))
"#;

/// Claims to have read one byte more than the window holds.
const OVERREAD_IO: &str = r#"
    (func (export "_water_read") (param $off i32) (param $len i32) (result i32)
        (i32.add (local.get $len) (i32.const 1)))
    (func (export "_water_write") (param $off i32) (param $len i32) (result i32)
        (local.get $len))
"#;

/// Reports every failed host read as end of stream.
const SWALLOWING_IO: &str = r#"
    (func (export "_water_read") (param $off i32) (param $len i32) (result i32)
        (local $n i32)
        (local.set $n (call $host_read (global.get $fd) (local.get $off) (local.get $len)))
        (if (i32.lt_s (local.get $n) (i32.const 0)) (then (return (i32.const 0))))
        (local.get $n))
    (func (export "_water_write") (param $off i32) (param $len i32) (result i32)
        (call $host_write (global.get $fd) (local.get $off) (local.get $len)))
"#;

fn assemble(parts: &[&str]) -> String {
    format!("(module {})", parts.concat())
}

/// Identity transport.
pub fn plain_wat() -> String {
    assemble(&[PRELUDE, INIT, PLAIN_IO, CLOSE])
}

/// Byte-reversing transport, on both read and write.
pub fn reverse_wat() -> String {
    assemble(&[PRELUDE, INIT, REVERSE_IO, CLOSE])
}

/// Connects fine, traps on the first read.
pub fn trapping_wat() -> String {
    assemble(&[PRELUDE, INIT, TRAPPING_IO, CLOSE])
}

/// Reports more bytes than it was given room for.
pub fn overread_wat() -> String {
    assemble(&[PRELUDE, INIT, OVERREAD_IO, CLOSE])
}

/// Hides host read errors from the caller, timeouts included.
pub fn swallowing_wat() -> String {
    assemble(&[PRELUDE, INIT, SWALLOWING_IO, CLOSE])
}

/// Relies on a capability the host does not implement, and fails init
/// with whatever it returns.
pub fn partial_wat() -> String {
    let init = r#"
        (import "water_host" "listen" (func $listen (param i32) (result i32)))
    "#;
    let body = r#"
        (func (export "_water_init") (result i32)
            (call $listen (i32.const 8080)))
    "#;
    assemble(&[init, PRELUDE, body, PLAIN_IO, CLOSE])
}

/// Imports from WASI, which the host never provides.
pub fn wasi_wat() -> String {
    let wasi = r#"
        (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
    "#;
    assemble(&[wasi, PRELUDE, INIT, PLAIN_IO, CLOSE])
}

/// Missing `_water_close`.
pub fn incomplete_wat() -> String {
    assemble(&[PRELUDE, INIT, PLAIN_IO])
}

pub fn module(wat: &str) -> TransportModule {
    TransportModule::new(wat.as_bytes(), 0)
}

pub fn dialer(wat: &str) -> Dialer {
    Dialer::new(module(wat), Config::default()).unwrap()
}

// ── Peers ──

/// A listening loopback socket and its address.
pub fn loopback() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Dial `listener` through `wat` and accept the raw peer end.
pub fn dial_pair(wat: &str) -> (Connection, TcpStream) {
    let (listener, addr) = loopback();
    let conn = dialer(wat).dial("tcp", &addr).unwrap();
    let (peer, _) = listener.accept().unwrap();
    (conn, peer)
}

/// Read exactly `len` bytes from a raw peer.
pub fn read_exact(peer: &mut impl Read, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    peer.read_exact(&mut buf).unwrap();
    buf
}

pub fn reversed(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}
