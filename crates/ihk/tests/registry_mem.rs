mod common;

use common::{host, MEM_PER_NODE};
use ihk::{IhkError, MemChunk};

fn query(host: &common::Host) -> Vec<MemChunk> {
    let n = host.root.get_num_reserved_mem();
    let mut out = vec![MemChunk::new(0, 0, 0); n as usize];
    host.root.query_mem(Some(&mut out[..]), n).unwrap();
    out
}

#[test]
fn bad_counts_are_invalid() {
    let host = host();
    let req = [MemChunk::request(4 << 20, 0)];
    for count in [i32::MIN, -1, i32::MAX] {
        assert!(
            matches!(
                host.root.reserve_mem(Some(&req[..]), count),
                Err(IhkError::InvalidArgument(_))
            ),
            "count {}",
            count
        );
    }
    assert_eq!(host.root.get_num_reserved_mem(), 0);
}

#[test]
fn zero_count_is_a_no_op() {
    let host = host();
    assert!(host.root.reserve_mem(None, 0).unwrap().is_empty());
    assert!(host.root.release_mem(None, 0).is_ok());
    assert_eq!(host.root.get_num_reserved_mem(), 0);
}

#[test]
fn null_buffer_faults() {
    let host = host();
    assert!(matches!(host.root.reserve_mem(None, 1), Err(IhkError::Fault(_))));
    assert!(matches!(host.root.release_mem(None, 1), Err(IhkError::Fault(_))));
}

#[test]
fn single_chunk_is_rounded_and_visible() {
    let host = host();
    let granted = host
        .root
        .reserve_mem(Some(&[MemChunk::request(1 << 20, 1)][..]), 1)
        .unwrap();
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0].size, 4 << 20);
    assert_eq!(granted[0].numa_node, 1);
    assert_eq!(query(&host), granted);

    host.root.release_mem(Some(&granted[..]), 1).unwrap();
    assert_eq!(host.root.get_num_reserved_mem(), 0);
}

#[test]
fn all_available_memory_can_be_reserved() {
    let host = host();
    let all = host.device.available_mem();
    assert_eq!(all.len(), common::NUMA_NODES as usize);
    let requests: Vec<MemChunk> = all
        .iter()
        .map(|c| MemChunk::request(c.size, c.numa_node))
        .collect();

    let granted = host
        .root
        .reserve_mem(Some(&requests[..]), requests.len() as i32)
        .unwrap();
    assert_eq!(granted.iter().map(|c| c.size).sum::<u64>(), MEM_PER_NODE * 2);
    assert!(host.device.available_mem().is_empty());
    assert_eq!(query(&host).len(), granted.len());

    let err = host
        .root
        .reserve_mem(Some(&[MemChunk::request(4 << 20, 0)][..]), 1)
        .unwrap_err();
    assert!(matches!(err, IhkError::ResourceExhausted(_)));

    host.root
        .release_mem(Some(&granted[..]), granted.len() as i32)
        .unwrap();
    assert_eq!(host.device.available_mem(), all);
}

#[test]
fn failed_request_reserves_nothing() {
    let host = host();
    let requests = [
        MemChunk::request(8 << 20, 0),
        MemChunk::request(MEM_PER_NODE * 4, 1),
    ];
    assert!(host.root.reserve_mem(Some(&requests[..]), 2).is_err());
    assert_eq!(host.root.get_num_reserved_mem(), 0);
}

#[test]
fn release_must_match_reserved_chunks() {
    let host = host();
    let granted = host
        .root
        .reserve_mem(Some(&[MemChunk::request(8 << 20, 0)][..]), 1)
        .unwrap();
    let mut wrong = granted[0];
    wrong.size /= 2;
    assert!(matches!(
        host.root.release_mem(Some(&[wrong][..]), 1),
        Err(IhkError::InvalidArgument(_))
    ));
    assert_eq!(query(&host), granted);
}

#[test]
fn unprivileged_release_is_refused() {
    let host = host();
    let granted = host
        .root
        .reserve_mem(Some(&[MemChunk::request(4 << 20, 0)][..]), 1)
        .unwrap();
    let user = host.user(1000, 1000);
    let err = user.release_mem(Some(&granted[..]), 1).unwrap_err();
    assert!(matches!(err, IhkError::PermissionDenied(_)));
    assert_eq!(host.root.get_num_reserved_mem(), 1);
}
