// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

mod common;

use std::thread;
use std::time::Duration;

use common::{TestSr, HOST, MIB};
use cowstore::{run_coalesce, set_gc_enabled, Callbacks, CowCoalesce, CowVolume};
use disk_image::{CowFile, ImageType};

/// Chain root -> mid -> head with the VDI on head and data in every node.
fn build_chain(sr: &TestSr) -> String {
    let uuid = CowVolume::create("test", &sr.cb, &sr.uri, "disk", "", 4 * MIB, false)
        .unwrap()
        .uuid;
    sr.write_vdi(&uuid, 0, b"root root root");
    sr.write_vdi(&uuid, 2 * MIB, b"root tail");

    for (offset, data) in [(0, &b"mid"[..]), (5, &b"head"[..])] {
        let snap = CowVolume::snapshot("test", &sr.cb, &sr.uri, &uuid).unwrap();
        CowVolume::destroy("test", &sr.cb, &sr.uri, &snap.uuid).unwrap();
        sr.write_vdi(&uuid, offset, data);
    }
    uuid
}

#[test]
fn test_chain_collapses_to_one_node() {
    let sr = TestSr::new();
    let uuid = build_chain(&sr);
    assert_eq!(sr.volume_ids().len(), 3);
    let before = (sr.read_vdi(&uuid, 0, 64), sr.read_vdi(&uuid, 2 * MIB, 64));
    assert_eq!(&before.0[..14], b"midt head root");

    let gc = CowCoalesce::new(&sr.cb, &sr.uri);
    let mut iterations = 0;
    while gc.run_iteration().unwrap() {
        sr.check_tree();
        iterations += 1;
        assert!(iterations < 10);
    }
    gc.remove_garbage_volumes().unwrap();

    let ids = sr.volume_ids();
    assert_eq!(ids.len(), 1);
    assert_eq!(sr.volume_id(&uuid), ids[0]);
    assert_eq!(
        (sr.read_vdi(&uuid, 0, 64), sr.read_vdi(&uuid, 2 * MIB, 64)),
        before
    );
    let stat = CowVolume::stat("test", &sr.cb, &sr.uri, &uuid).unwrap();
    assert!(stat.read_write);
    assert_eq!(stat.virtual_size, 4 * MIB);
    assert!(sr.datapath.calls().is_empty());
}

#[test]
fn test_active_leaf_merge_pauses_datapath() {
    let sr = TestSr::new();
    let uuid = CowVolume::create("test", &sr.cb, &sr.uri, "disk", "", MIB, false)
        .unwrap()
        .uuid;
    let root = sr.volume_id(&uuid);
    let snap = CowVolume::snapshot("test", &sr.cb, &sr.uri, &uuid).unwrap();
    CowVolume::destroy("test", &sr.cb, &sr.uri, &snap.uuid).unwrap();
    sr.write_vdi(&uuid, 0, b"leaf");

    let gc = CowCoalesce::new(&sr.cb, &sr.uri);
    sr.set_active_on(&uuid, Some("host2"));
    assert!(!gc.run_iteration().unwrap());

    sr.set_active_on(&uuid, Some(HOST));
    assert!(gc.run_iteration().unwrap());
    assert_eq!(sr.volume_id(&uuid), root);
    assert_eq!(sr.volume_ids(), vec![root]);
    assert_eq!(
        sr.datapath.calls(),
        vec![format!("pause {uuid}"), format!("unpause {uuid} {root}")]
    );
    assert_eq!(sr.read_vdi(&uuid, 0, 4), b"leaf");
}

#[test]
fn test_merged_leaf_counts_once_in_provisioned_size() {
    let sr = TestSr::new();
    let uuid = CowVolume::create("test", &sr.cb, &sr.uri, "disk", "", 10 * MIB, false)
        .unwrap()
        .uuid;
    let snap = CowVolume::snapshot("test", &sr.cb, &sr.uri, &uuid).unwrap();
    CowVolume::destroy("test", &sr.cb, &sr.uri, &snap.uuid).unwrap();

    let gc = CowCoalesce::new(&sr.cb, &sr.uri);
    let mut iterations = 0;
    while gc.run_iteration().unwrap() {
        iterations += 1;
        assert!(iterations < 10);
    }
    gc.remove_garbage_volumes().unwrap();

    let volumes = sr.db(|db| Ok(db.get_all_volumes()?));
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].psize, None);
    assert_eq!(
        CowVolume::get_sr_provisioned_size(&sr.cb, &sr.uri).unwrap(),
        10 * MIB
    );
}

#[test]
fn test_oversized_leaf_is_frozen() {
    let sr = TestSr::with_options("leaf_coalesce_max_size=0");
    let uuid = CowVolume::create("test", &sr.cb, &sr.uri, "disk", "", MIB, false)
        .unwrap()
        .uuid;
    let root = sr.volume_id(&uuid);
    let snap = CowVolume::snapshot("test", &sr.cb, &sr.uri, &uuid).unwrap();
    CowVolume::destroy("test", &sr.cb, &sr.uri, &snap.uuid).unwrap();
    let leaf = sr.volume_id(&uuid);
    sr.write_vdi(&uuid, 0, b"frozen");
    sr.set_active_on(&uuid, Some(HOST));

    let gc = CowCoalesce::new(&sr.cb, &sr.uri);
    assert!(gc.run_iteration().unwrap());
    let head = sr.volume_id(&uuid);
    let head_volume = sr.db(|db| Ok(db.get_volume_by_id(head)?.unwrap()));
    assert_eq!(head_volume.parent_id, Some(leaf));
    assert_eq!(
        sr.datapath.calls(),
        vec![format!("refresh-clone {uuid} {head}")]
    );

    // The frozen leaf is now an inner node and gets merged into the root.
    assert!(gc.run_iteration().unwrap());
    let head_volume = sr.db(|db| Ok(db.get_volume_by_id(head)?.unwrap()));
    assert_eq!(head_volume.parent_id, Some(root));
    assert_eq!(
        CowFile::open_detached(&sr.volume_path(head), false)
            .unwrap()
            .backing_path(),
        Some(sr.volume_path(root))
    );
    let refresh = sr.db(|db| Ok(db.get_refresh_entries(HOST)?));
    assert_eq!(refresh.len(), 1);
    assert_eq!(refresh[0].old_parent_id, leaf);

    // Pending refresh keeps the merged node alive until it is replayed.
    assert_eq!(gc.remove_garbage_volumes().unwrap(), 0);
    gc.recover_journal().unwrap();
    assert_eq!(
        sr.datapath.calls().last().unwrap(),
        &format!("refresh-coalesce {uuid} {leaf} {root}")
    );
    assert_eq!(gc.remove_garbage_volumes().unwrap(), 1);
    assert!(!sr.volume_ids().contains(&leaf));
    assert_eq!(sr.read_vdi(&uuid, 0, 6), b"frozen");
    sr.check_tree();
}

#[test]
fn test_journal_replay() {
    let sr = TestSr::new();
    let (grandparent, parent, child) = sr.db(|db| {
        let g = db.insert_new_volume(MIB, ImageType::Cow)?;
        let p = db.insert_child_volume(g.id, Some(MIB), false)?;
        let c = db.insert_child_volume(p.id, Some(MIB), false)?;
        db.insert_vdi("disk", "", "vdi-c", c.id, false)?;
        db.update_vdi_active_on("vdi-c", Some(HOST))?;
        Ok((g.id, p.id, c))
    });
    CowFile::create(&sr.volume_path(grandparent), MIB, None).unwrap();
    CowFile::create(
        &sr.volume_path(parent),
        MIB,
        Some(&sr.volume_path(grandparent)),
    )
    .unwrap();
    CowFile::create(&sr.volume_path(child.id), MIB, Some(&sr.volume_path(parent))).unwrap();

    // A collector died after journalling the move.
    sr.db(|db| Ok(db.add_journal_entries(parent, grandparent, &[child.clone()])?));

    let gc = CowCoalesce::new(&sr.cb, &sr.uri);
    gc.recover_journal().unwrap();

    let moved = sr.db(|db| Ok(db.get_volume_by_id(child.id)?.unwrap()));
    assert_eq!(moved.parent_id, Some(grandparent));
    assert_eq!(
        CowFile::open_detached(&sr.volume_path(child.id), false)
            .unwrap()
            .backing_path(),
        Some(sr.volume_path(grandparent))
    );
    assert!(sr.db(|db| Ok(db.get_journal_entries()?)).is_empty());
    assert!(sr.db(|db| Ok(db.get_refresh_entries(HOST)?)).is_empty());
    assert_eq!(
        sr.datapath.calls(),
        vec![format!("refresh-coalesce vdi-c {parent} {grandparent}")]
    );

    // Nothing left to do the second time round.
    gc.recover_journal().unwrap();
    assert_eq!(sr.datapath.calls().len(), 1);
    let again = sr.db(|db| Ok(db.get_volume_by_id(child.id)?.unwrap()));
    assert_eq!(again, moved);

    // The parent left behind is garbage now.
    assert_eq!(gc.remove_garbage_volumes().unwrap(), 1);
    assert!(!sr.volume_ids().contains(&parent));
    assert!(!sr.volume_path(parent).exists());
}

#[test]
fn test_garbage_respects_pending_refresh() {
    let sr = TestSr::new();
    let (orphan, referenced) = sr.db(|db| {
        let orphan = db.insert_new_volume(MIB, ImageType::Cow)?;
        let referenced = db.insert_new_volume(MIB, ImageType::Cow)?;
        let root = db.insert_new_volume(MIB, ImageType::Cow)?;
        let leaf = db.insert_child_volume(root.id, Some(MIB), false)?;
        db.insert_vdi("disk", "", "vdi-leaf", leaf.id, false)?;
        db.update_vdi_active_on("vdi-leaf", Some("host2"))?;
        let vdi = db.get_vdi_by_id("vdi-leaf")?.unwrap();
        db.add_refresh_entries(leaf.id, referenced.id, root.id, &[vdi])?;
        Ok((orphan.id, referenced.id))
    });
    for id in [orphan, referenced] {
        CowFile::create(&sr.volume_path(id), MIB, None).unwrap();
    }

    let gc = CowCoalesce::new(&sr.cb, &sr.uri);
    assert_eq!(gc.remove_garbage_volumes().unwrap(), 1);
    let ids = sr.volume_ids();
    assert!(!ids.contains(&orphan));
    assert!(ids.contains(&referenced));
    assert!(!sr.volume_path(orphan).exists());
    assert_eq!(
        std::fs::read_dir(sr.cb.trash_dir(sr.path())).unwrap().count(),
        0
    );

    // Deactivating the VDI drops its pending refresh.
    sr.set_active_on("vdi-leaf", None);
    assert_eq!(gc.remove_garbage_volumes().unwrap(), 1);
    assert!(!sr.volume_ids().contains(&referenced));
}

#[test]
fn test_gc_loop_stops_when_disabled() {
    let sr = TestSr::new();
    let uuid = build_chain(&sr);

    thread::scope(|s| {
        let runner = s.spawn(|| run_coalesce(&sr.cb, &sr.uri));
        for _ in 0..1000 {
            if sr.volume_ids().len() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        set_gc_enabled(&sr.cb, &sr.uri, false).unwrap();
        runner.join().unwrap().unwrap();
    });
    assert!(sr.cb.gc_disabled_path(sr.path()).exists());
    assert_eq!(sr.volume_ids(), vec![sr.volume_id(&uuid)]);
}
