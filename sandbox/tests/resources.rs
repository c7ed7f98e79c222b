//! Deterministic teardown: no instance outlives its connection.
//!
//! Kept to a single test so nothing else in this binary creates instances
//! concurrently with the counter checks.

mod common;

use water_sandbox::{accept_inbound, live_instances, Config, Dialer, MemConn, TransportModule, WaterError};

use common::*;

#[test]
fn test_no_instances_accumulate() {
    assert_eq!(live_instances(), 0);

    // Sequential connections, each closed explicitly.
    let (listener, addr) = loopback();
    let dialer = dialer(&reverse_wat());
    for _ in 0..20 {
        let conn = dialer.dial("tcp", &addr).unwrap();
        let (_peer, _) = listener.accept().unwrap();
        assert_eq!(live_instances(), 1);
        conn.close().unwrap();
        assert_eq!(live_instances(), 0);
    }

    // Inbound, closed explicitly.
    for _ in 0..5 {
        let (ours, _peer) = MemConn::pair();
        let conn = accept_inbound(0, Box::new(ours), plain_wat().as_bytes()).unwrap();
        assert_eq!(live_instances(), 1);
        conn.close().unwrap();
        assert_eq!(live_instances(), 0);
    }

    // Failed dial.
    let err = dialer.dial("tcp", "127.0.0.1:99999").unwrap_err();
    assert!(matches!(err, WaterError::Dial(_)));
    assert_eq!(live_instances(), 0);

    // Unknown version never instantiates.
    let module = TransportModule::new(plain_wat().as_bytes(), 99);
    assert!(Dialer::new(module, Config::default()).is_err());
    assert_eq!(live_instances(), 0);

    // Guest fault releases the instance without a close.
    let (conn, _peer) = dial_pair(&trapping_wat());
    assert_eq!(live_instances(), 1);
    assert!(conn.read(&mut [0u8; 4]).is_err());
    assert_eq!(live_instances(), 0);
    conn.close().unwrap();
}
