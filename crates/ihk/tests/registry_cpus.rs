mod common;

use common::{cpus, host, NUM_CPUS};
use ihk::{CpuId, IhkError};

fn query(host: &common::Host) -> Vec<CpuId> {
    let n = host.root.get_num_reserved_cpus();
    let mut out = vec![CpuId(0); n as usize];
    host.root.query_cpus(Some(&mut out[..]), n).unwrap();
    out
}

#[test]
fn reserve_query_release_range() {
    let host = host();
    let set = cpus(2..14);

    host.root.reserve_cpus(Some(&set[..]), set.len() as i32).unwrap();
    assert_eq!(host.root.get_num_reserved_cpus(), 12);
    assert_eq!(query(&host), set);

    host.root.release_cpus(Some(&set[..]), set.len() as i32).unwrap();
    assert_eq!(host.root.get_num_reserved_cpus(), 0);
    assert!(query(&host).is_empty());
}

#[test]
fn overlapping_reservation_is_busy_and_changes_nothing() {
    let host = host();
    let first = cpus(2..6);
    host.root.reserve_cpus(Some(&first[..]), 4).unwrap();

    let overlap = cpus(5..9);
    let err = host.root.reserve_cpus(Some(&overlap[..]), 4).unwrap_err();
    assert!(matches!(err, IhkError::ResourceBusy(_)), "{:?}", err);
    assert_eq!(err.errno(), -16);
    assert_eq!(query(&host), first);
}

#[test]
fn argument_checks() {
    let host = host();
    let set = cpus(1..3);

    assert!(matches!(
        host.root.reserve_cpus(Some(&set[..]), -1),
        Err(IhkError::InvalidArgument(_))
    ));
    assert!(matches!(
        host.root.reserve_cpus(Some(&set[..]), i32::MIN),
        Err(IhkError::InvalidArgument(_))
    ));
    host.root.reserve_cpus(Some(&set[..]), 0).unwrap();
    host.root.reserve_cpus(None, 0).unwrap();
    assert_eq!(host.root.get_num_reserved_cpus(), 0);

    assert!(matches!(host.root.reserve_cpus(None, 2), Err(IhkError::Fault(_))));
    assert!(matches!(host.root.release_cpus(None, 2), Err(IhkError::Fault(_))));
    assert!(matches!(
        host.root.reserve_cpus(Some(&set[..]), NUM_CPUS as i32 + 1),
        Err(IhkError::InvalidArgument(_))
    ));
    assert!(matches!(
        host.root.reserve_cpus(Some(&set[..]), 3),
        Err(IhkError::Fault(_))
    ));
    assert!(matches!(
        host.root.reserve_cpus(Some(&[CpuId(NUM_CPUS)][..]), 1),
        Err(IhkError::InvalidArgument(_))
    ));
    assert!(matches!(
        host.root.reserve_cpus(Some(&[CpuId(3), CpuId(3)][..]), 2),
        Err(IhkError::InvalidArgument(_))
    ));
    assert_eq!(host.root.get_num_reserved_cpus(), 0);
}

#[test]
fn releasing_unreserved_cpus_is_invalid() {
    let host = host();
    host.root.reserve_cpus(Some(&cpus(4..6)[..]), 2).unwrap();
    let err = host.root.release_cpus(Some(&cpus(4..7)[..]), 3).unwrap_err();
    assert!(matches!(err, IhkError::InvalidArgument(_)));
    assert_eq!(host.root.get_num_reserved_cpus(), 2);
}

#[test]
fn query_requires_exact_count() {
    let host = host();
    host.root.reserve_cpus(Some(&cpus(4..8)[..]), 4).unwrap();

    let mut out = vec![CpuId(0); 8];
    assert!(matches!(
        host.root.query_cpus(Some(&mut out[..]), 3),
        Err(IhkError::InvalidArgument(_))
    ));
    assert!(matches!(host.root.query_cpus(None, 4), Err(IhkError::Fault(_))));
    host.root.query_cpus(Some(&mut out[..]), 4).unwrap();
    assert_eq!(&out[..4], &cpus(4..8)[..]);
}

#[test]
fn unprivileged_callers_are_refused() {
    let host = host();
    let user = host.user(1000, 1000);
    let set = cpus(2..4);

    let err = user.reserve_cpus(Some(&set[..]), 2).unwrap_err();
    assert!(matches!(err, IhkError::PermissionDenied(_)));
    assert_eq!(err.errno(), -1);

    host.root.reserve_cpus(Some(&set[..]), 2).unwrap();
    assert!(matches!(
        user.release_cpus(Some(&set[..]), 2),
        Err(IhkError::PermissionDenied(_))
    ));
    // Queries stay open to everyone
    assert_eq!(user.get_num_reserved_cpus(), 2);
}
