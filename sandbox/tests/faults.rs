//! Guest faults: traps, bad results, partially conformant modules, and
//! modules rejected before they run.

mod common;

use std::io::Write;

use water_sandbox::{Config, ConnState, Dialer, FaultKind, TransportModule, WaterError};

use common::*;

// ── Test: trap during read ──

#[test]
fn test_trap_faults_connection() {
    let (conn, _peer) = dial_pair(&trapping_wat());

    // Writes pass through before the fault.
    assert_eq!(conn.write(b"ok").unwrap(), 2);

    match conn.read(&mut [0u8; 8]).unwrap_err() {
        WaterError::GuestFault(fault) => {
            assert_eq!(fault.kind, FaultKind::Trap);
            assert!(fault.message.contains("unreachable"), "{fault}");
        }
        other => panic!("expected guest fault, got {other}"),
    }
    assert_eq!(conn.state(), ConnState::Faulted);

    assert!(matches!(conn.read(&mut [0u8; 8]), Err(WaterError::UseOfClosedConnection)));
    assert!(matches!(conn.write(b"x"), Err(WaterError::UseOfClosedConnection)));

    // Closing a faulted connection succeeds and keeps it distinguishable.
    conn.close().unwrap();
    assert_eq!(conn.state(), ConnState::Faulted);
}

#[test]
fn test_trap_releases_raw_connection() {
    let (conn, mut peer) = dial_pair(&trapping_wat());
    assert!(conn.read(&mut [0u8; 8]).is_err());

    let mut rest = Vec::new();
    std::io::Read::read_to_end(&mut peer, &mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_guest_fault_as_io_error() {
    let (mut conn, _peer) = dial_pair(&trapping_wat());
    let err = std::io::Read::read(&mut conn, &mut [0u8; 8]).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Other);

    let err = conn.write_all(b"after").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
}

// ── Test: ABI violation ──

#[test]
fn test_overread_is_memory_fault() {
    let (conn, _peer) = dial_pair(&overread_wat());
    match conn.read(&mut [0u8; 8]).unwrap_err() {
        WaterError::GuestFault(fault) => assert_eq!(fault.kind, FaultKind::Memory),
        other => panic!("expected memory fault, got {other}"),
    }
    assert_eq!(conn.state(), ConnState::Faulted);
}

// ── Test: partially conformant module ──

#[test]
fn test_unimplemented_capability_fails_init() {
    let (listener, addr) = loopback();
    let err = dialer(&partial_wat()).dial("tcp", &addr).unwrap_err();
    match err {
        WaterError::GuestFault(fault) => {
            assert_eq!(fault.kind, FaultKind::Status);
            assert_eq!(fault.code, Some(-4));
        }
        other => panic!("expected guest fault, got {other}"),
    }
    drop(listener);
}

// ── Test: rejected before running ──

#[test]
fn test_missing_export_rejected() {
    let (_listener, addr) = loopback();
    let err = dialer(&incomplete_wat()).dial("tcp", &addr).unwrap_err();
    assert!(matches!(err, WaterError::Instantiate(_)), "got {err}");
    assert!(err.to_string().contains("_water_close"));
}

#[test]
fn test_wasi_import_rejected() {
    let (_listener, addr) = loopback();
    let err = dialer(&wasi_wat()).dial("tcp", &addr).unwrap_err();
    assert!(matches!(err, WaterError::Instantiate(_)), "got {err}");
}

#[test]
fn test_malformed_bytes_rejected() {
    let module = TransportModule::new(vec![0x00, 0x61, 0x73, 0x6d, 0xff], 0);
    let err = Dialer::new(module, Config::default()).unwrap_err();
    assert!(matches!(err, WaterError::Compile(_)), "got {err}");
}

#[test]
fn test_memory_limit_rejects_scratch() {
    let config = Config {
        max_memory_pages: 1,
        ..Config::default()
    };
    let (_listener, addr) = loopback();
    let err = Dialer::new(module(&plain_wat()), config)
        .unwrap()
        .dial("tcp", &addr)
        .unwrap_err();
    assert!(matches!(err, WaterError::Instantiate(_)), "got {err}");
}
