mod common;

use common::{PAGE, Rig, flush_mmu};
use kernel_pmr::{CleanupOutcome, PmrConfig, PmrError, PmrFlags, PowerState, RefOutcome};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn imports_need_a_fixed_layout() {
    let rig = Rig::new();
    let (peer, _) = rig.peer(1, "gpu1");
    let (pmr, _ram) = rig.dense(PAGE);

    assert_eq!(pmr.register_device_import(&peer), Err(PmrError::NotPermitted));
    pmr.set_layout_fixed();
    pmr.register_device_import(&peer).unwrap();
    pmr.register_device_import(&peer).unwrap();
    assert_eq!(pmr.imported_devices_mask(), peer.import_bit());

    // The owner is never recorded.
    pmr.register_device_import(&rig.device).unwrap();
    assert_eq!(pmr.imported_devices_mask(), 1 << 1);

    pmr.unref_and_maybe_destroy(1).unwrap();
    assert_eq!(pmr.imported_devices_mask(), 0);
}

#[test]
fn on_demand_resources_cannot_be_imported() {
    let rig = Rig::new();
    let (peer, _) = rig.peer(1, "gpu1");
    let (pmr, _ram) = rig.dense_with(PAGE, PmrFlags::read_write().with_on_demand(true));
    pmr.set_layout_fixed();
    assert_eq!(pmr.register_device_import(&peer), Err(PmrError::NotPermitted));
    pmr.unref_and_maybe_destroy(1).unwrap();
}

#[test]
fn import_tracking_can_be_switched_off() {
    let config = PmrConfig {
        device_import_deferred_free: false,
        ..PmrConfig::DEFAULT
    };
    let rig = Rig::with_config(config);
    let (peer, _) = rig.peer(1, "gpu1");
    let (pmr, _ram) = rig.dense(PAGE);
    pmr.register_device_import(&peer).unwrap();
    assert_eq!(pmr.imported_devices_mask(), 0);
    pmr.unref_and_maybe_destroy(1).unwrap();
}

#[test]
fn importer_holds_back_destruction() {
    let rig = Rig::new();
    let (peer, _) = rig.peer(1, "gpu1");
    let (pmr, ram) = rig.dense(PAGE);
    pmr.set_layout_fixed();
    pmr.register_device_import(&peer).unwrap();
    pmr.mark_for_defer_free();
    pmr.unref_and_maybe_destroy(1).unwrap();

    assert!(pmr.is_zombie());
    assert_eq!(rig.device.zombie_count(), 1);
    assert_eq!(peer.zombie_count(), 1);

    let mut owner_pass = rig.device.queue_zombies_for_cleanup().unwrap();
    flush_mmu(&rig.device);
    assert!(matches!(owner_pass.run(), CleanupOutcome::Retry { .. }));
    assert!(!ram.is_finalized());

    let mut peer_pass = peer.queue_zombies_for_cleanup().unwrap();
    flush_mmu(&peer);
    assert_eq!(peer_pass.run(), CleanupOutcome::Done);
    assert_eq!(pmr.imported_devices_mask(), 0);

    assert_eq!(owner_pass.run(), CleanupOutcome::Done);
    assert!(ram.is_finalized());
}

#[test]
fn imports_of_unpowered_devices_are_dropped() {
    let rig = Rig::new();
    let (peer, _) = rig.peer(1, "gpu1");
    let (pmr, ram) = rig.dense(PAGE);
    pmr.set_layout_fixed();
    pmr.register_device_import(&peer).unwrap();
    pmr.mark_for_defer_free();

    peer.set_power_state(PowerState::Off);
    pmr.unref_and_maybe_destroy(1).unwrap();
    assert_eq!(pmr.imported_devices_mask(), 0);
    assert_eq!(peer.zombie_count(), 0);
    assert_eq!(rig.device.zombie_count(), 1);

    rig.device.set_power_state(PowerState::Off);
    let mut pass = rig.device.queue_zombies_for_cleanup().unwrap();
    assert_eq!(pass.run(), CleanupOutcome::Done);
    assert!(ram.is_finalized());
}

#[test]
fn everything_off_means_immediate_destruction() {
    let rig = Rig::new();
    let (peer, _) = rig.peer(1, "gpu1");
    let (pmr, ram) = rig.dense(PAGE);
    pmr.set_layout_fixed();
    pmr.register_device_import(&peer).unwrap();
    pmr.mark_for_defer_free();

    peer.set_power_state(PowerState::Off);
    rig.device.set_power_state(PowerState::Off);
    pmr.unref_and_maybe_destroy(1).unwrap();
    assert!(ram.is_finalized());
}

#[test]
fn powered_importer_parks_the_resource_of_an_unpowered_owner() {
    let rig = Rig::new();
    let (peer, _) = rig.peer(1, "gpu1");
    let (pmr, ram) = rig.dense(PAGE);
    pmr.set_layout_fixed();
    pmr.register_device_import(&peer).unwrap();
    pmr.mark_for_defer_free();

    rig.device.set_power_state(PowerState::Off);
    pmr.unref_and_maybe_destroy(1).unwrap();
    assert!(pmr.is_zombie());
    assert!(!ram.is_finalized());

    peer.free_zombies();
    let mut pass = rig.device.queue_zombies_for_cleanup().unwrap();
    assert_eq!(pass.run(), CleanupOutcome::Done);
    assert!(ram.is_finalized());
}

#[test]
fn revival_pulls_imports_back() {
    let rig = Rig::new();
    let (peer, _) = rig.peer(1, "gpu1");
    let (pmr, ram) = rig.dense(PAGE);
    pmr.set_layout_fixed();
    pmr.register_device_import(&peer).unwrap();
    pmr.mark_for_defer_free();
    pmr.unref_and_maybe_destroy(1).unwrap();

    assert_eq!(pmr.ref_or_revive(), Ok(RefOutcome::Revived));
    assert_eq!(peer.zombie_count(), 0);
    assert_eq!(rig.device.zombie_count(), 0);
    assert_eq!(pmr.imported_devices_mask(), peer.import_bit());

    pmr.unref_and_maybe_destroy(1).unwrap();
    peer.free_zombies();
    rig.device.free_zombies();
    assert!(ram.is_finalized());
}

#[test]
fn teardown_hands_imported_zombies_to_the_importer() {
    let rig = Rig::new();
    let (peer, _) = rig.peer(1, "gpu1");
    let (pmr, ram) = rig.dense(PAGE);
    pmr.set_layout_fixed();
    pmr.register_device_import(&peer).unwrap();
    pmr.mark_for_defer_free();
    pmr.unref_and_maybe_destroy(1).unwrap();

    rig.device.free_zombies();
    assert!(!ram.is_finalized());
    assert!(pmr.is_zombie());
    assert_eq!(rig.device.zombie_count(), 0);
    assert_eq!(peer.zombie_count(), 2);

    let mut pass = peer.queue_zombies_for_cleanup().unwrap();
    flush_mmu(&peer);
    assert_eq!(pass.run(), CleanupOutcome::Done);
    assert!(ram.is_finalized());
    assert_eq!(rig.ctx.live_count(), 0);
}

#[test]
fn transferred_zombie_can_still_be_revived() {
    let rig = Rig::new();
    let (peer, _) = rig.peer(1, "gpu1");
    let (pmr, ram) = rig.dense(PAGE);
    pmr.set_layout_fixed();
    pmr.register_device_import(&peer).unwrap();
    pmr.mark_for_defer_free();
    pmr.unref_and_maybe_destroy(1).unwrap();
    rig.device.free_zombies();

    assert_eq!(pmr.ref_or_revive(), Ok(RefOutcome::Revived));
    assert_eq!(peer.zombie_count(), 0);
    assert!(!pmr.is_zombie());

    pmr.unref_and_maybe_destroy(1).unwrap();
    peer.free_zombies();
    rig.device.free_zombies();
    assert!(ram.is_finalized());
}

#[test]
fn cross_imports_revive_without_deadlock() {
    let rig = Rig::new();
    let (peer, peer_heap) = rig.peer(1, "gpu1");

    for _ in 0..100 {
        let (ours, ours_ram) = rig.dense(PAGE);
        let (theirs, theirs_ram) = rig.dense_on(&peer_heap, PAGE);
        for (pmr, importer) in [(&ours, &peer), (&theirs, &rig.device)] {
            pmr.set_layout_fixed();
            pmr.register_device_import(importer).unwrap();
            pmr.mark_for_defer_free();
            pmr.unref_and_maybe_destroy(1).unwrap();
        }

        let barrier = Arc::new(Barrier::new(2));
        let other = {
            let barrier = Arc::clone(&barrier);
            let theirs = theirs.clone();
            thread::spawn(move || {
                barrier.wait();
                theirs.ref_or_revive()
            })
        };
        barrier.wait();
        assert_eq!(ours.ref_or_revive(), Ok(RefOutcome::Revived));
        assert_eq!(other.join().unwrap(), Ok(RefOutcome::Revived));

        for pmr in [&ours, &theirs] {
            pmr.unref_and_maybe_destroy(1).unwrap();
        }
        for device in [&rig.device, &peer, &rig.device] {
            device.free_zombies();
        }
        assert!(ours_ram.is_finalized());
        assert!(theirs_ram.is_finalized());
    }
    assert_eq!(rig.ctx.live_count(), 0);
}
