mod common;

use common::{Broker, PAGE, Rig};
use kernel_pmr::{PmrError, SparseResize};
use std::sync::atomic::Ordering;

#[test]
fn export_token_trades_for_references() {
    let rig = Rig::new();
    let (pmr, ram) = rig.dense(4 * PAGE);

    let token = pmr.export().unwrap();
    assert!(pmr.is_layout_fixed());
    assert_eq!(pmr.ref_count(), 2);
    assert_eq!(token.size(), 4 * PAGE);
    assert_eq!(token.log2_contiguity(), 12);

    let imported = token
        .import(token.password(), 4 * PAGE, 12)
        .unwrap();
    assert!(imported.ptr_eq(&pmr));
    assert_eq!(pmr.ref_count(), 3);

    assert_eq!(
        token.import(token.password() ^ 1, 4 * PAGE, 12).map(|_| ()),
        Err(PmrError::WrongPasswordOrStaleResource)
    );
    assert_eq!(
        token.import(token.password(), 2 * PAGE, 12).map(|_| ()),
        Err(PmrError::MismatchedAttributes)
    );
    assert_eq!(
        token.import(token.password(), 4 * PAGE, 13).map(|_| ()),
        Err(PmrError::MismatchedAttributes)
    );
    assert_eq!(pmr.ref_count(), 3);

    imported.unimport().unwrap();
    token.unexport().unwrap();
    assert_eq!(pmr.ref_count(), 1);
    pmr.unref_and_maybe_destroy(1).unwrap();
    assert!(ram.is_finalized());
}

#[test]
fn dropping_a_token_gives_back_its_reference() {
    let rig = Rig::new();
    let (pmr, ram) = rig.dense(PAGE);
    let token = pmr.export().unwrap();
    pmr.unref_and_maybe_destroy(1).unwrap();
    assert!(!ram.is_finalized());

    drop(token);
    assert!(ram.is_finalized());
}

#[test]
fn exported_layout_is_frozen() {
    let rig = Rig::new();
    let (pmr, ram) = rig.sparse(4, &[0]);
    let token = pmr.export().unwrap();

    assert_eq!(
        pmr.change_sparse_mem(&[1], &[], SparseResize::alloc_and_free()),
        Err(PmrError::NotPermitted)
    );
    assert!(ram.sparse_changes.lock().unwrap().is_empty());
    assert!(pmr.mapping_table().is_chunk_backed(0));
    assert!(!pmr.mapping_table().is_chunk_backed(1));

    token.unexport().unwrap();
    // Unexporting does not thaw the layout.
    assert!(pmr.is_layout_fixed());
    pmr.unref_and_maybe_destroy(1).unwrap();
}

#[test]
fn local_import_reports_size_and_alignment() {
    let rig = Rig::new();
    let (pmr, ram) = rig.dense(2 * PAGE);
    let handle = pmr.make_local_import_handle().unwrap();
    assert!(!pmr.is_layout_fixed());

    let (imported, size, align) = handle.local_import().unwrap();
    assert!(imported.ptr_eq(&pmr));
    assert_eq!((size, align), (2 * PAGE, PAGE));
    assert_eq!(pmr.ref_count(), 3);

    imported.unref_and_maybe_destroy(1).unwrap();
    handle.unmake().unwrap();
    pmr.unref_and_maybe_destroy(1).unwrap();
    assert!(ram.is_finalized());
}

#[test]
fn secure_exchange_round_trip() {
    let rig = Rig::new();
    let broker = Broker::default();
    let (pmr, ram) = rig.dense(PAGE);

    let handle = pmr.secure_export(&broker).unwrap();
    assert!(pmr.is_layout_fixed());
    assert_eq!(pmr.ref_count(), 2);

    let (imported, size, align) =
        kernel_pmr::Pmr::secure_import(&broker, handle, &rig.device).unwrap();
    assert!(imported.ptr_eq(&pmr));
    assert_eq!((size, align), (PAGE, PAGE));
    assert_eq!(pmr.ref_count(), 3);

    let (other, _) = rig.peer(1, "gpu1");
    assert_eq!(
        kernel_pmr::Pmr::secure_import(&broker, handle, &other).map(|_| ()),
        Err(PmrError::NotPermitted)
    );
    assert_eq!(
        kernel_pmr::Pmr::secure_import(&broker, handle + 1, &rig.device).map(|_| ()),
        Err(PmrError::WrongPasswordOrStaleResource)
    );

    imported.secure_unimport().unwrap();
    kernel_pmr::Pmr::secure_unexport(&broker, handle).unwrap();
    assert_eq!(
        kernel_pmr::Pmr::secure_unexport(&broker, handle),
        Err(PmrError::WrongPasswordOrStaleResource)
    );
    assert_eq!(pmr.ref_count(), 1);
    pmr.unref_and_maybe_destroy(1).unwrap();
    assert!(ram.is_finalized());
}

#[test]
fn refused_secure_export_keeps_nothing() {
    let rig = Rig::new();
    let broker = Broker::default();
    broker.refuse.store(true, Ordering::Release);
    let (pmr, ram) = rig.dense(PAGE);

    assert_eq!(
        pmr.secure_export(&broker),
        Err(PmrError::Factory("broker full"))
    );
    assert_eq!(pmr.ref_count(), 1);
    assert!(!pmr.is_layout_fixed());
    pmr.unref_and_maybe_destroy(1).unwrap();
    assert!(ram.is_finalized());
}

#[test]
fn exporter_and_importer_share_the_memory() {
    let rig = Rig::new();
    let (pmr, ram) = rig.dense(4 * PAGE);
    let token = pmr.export().unwrap();

    let (password, size, log2) = (token.password(), token.size(), token.log2_contiguity());
    let theirs = token.import(password, size, log2).unwrap();

    assert_eq!(pmr.write_bytes(0x10, b"from the exporter"), Ok(17));
    let mut seen = [0u8; 17];
    assert_eq!(theirs.read_bytes(0x10, &mut seen), Ok(17));
    assert_eq!(&seen, b"from the exporter");

    // Any release order works; the last one destroys.
    pmr.unref_and_maybe_destroy(1).unwrap();
    token.unexport().unwrap();
    assert!(!ram.is_finalized());
    assert_eq!(theirs.read_bytes(0x10, &mut seen), Ok(17));
    theirs.unimport().unwrap();
    assert!(ram.is_finalized());
    assert_eq!(rig.ctx.deinit(), Ok(()));
}
