//! End-to-end scenarios against scripted adapters.

mod common;

use std::time::{Duration, Instant};

use common::*;
use lrs::{
    AdmStatus, Config, Dss, Entity, Family, FsStatus, FsType, MediumInfo, Operation, ReleaseElt,
    Response, SyncThresholds,
};

const LONG: Duration = Duration::from_secs(10);

fn fast_sync(nb_req: usize, time_ms: u64) -> Config {
    Config::new().with_sync(
        FAMILY,
        SyncThresholds {
            time: Duration::from_millis(time_ms),
            nb_req,
            wsize: u64::MAX,
        },
    )
}

#[test]
fn format_success() {
    let mut medium = MediumInfo::new(medium_id("T1"), FsType::Ltfs);
    medium.adm_status = AdmStatus::Locked;
    let bed = testbed(1, vec![medium], Config::new());

    push(
        &bed.sched,
        42,
        Operation::Format {
            medium: medium_id("T1"),
            fs_type: FsType::Ltfs,
            unlock: true,
        },
    );

    match wait_response(&bed.sched, 42, LONG) {
        Response::Format { req_id, medium } => {
            assert_eq!(req_id, 42);
            assert_eq!(medium, medium_id("T1"));
        }
        other => panic!("unexpected response {other:?}"),
    }

    assert_eq!(bed.fs.state.lock().formats, vec!["T1".to_string()]);
    let row = bed.dss.media_get(&medium_id("T1")).unwrap();
    assert_eq!(row.fs_label, "T1");
    assert_eq!(row.fs_status, FsStatus::Empty);
    assert_eq!(row.adm_status, AdmStatus::Unlocked);

    // Clean shutdown returns every distributed lock.
    bed.sched.stop();
    assert!(bed.dss.lock_holder(&Entity::Medium(medium_id("T1"))).is_none());
    assert!(bed.dss.lock_holder(&Entity::Device(device_id(0))).is_none());
}

#[test]
fn read_with_fallback_on_second_candidate() {
    let bed = testbed(
        1,
        vec![formatted_medium("T1"), formatted_medium("T2")],
        Config::new(),
    );
    bed.lib.state.lock().fail_lookup.insert("T1".to_string());

    push(
        &bed.sched,
        7,
        Operation::ReadAlloc {
            n_required: 1,
            candidates: vec![medium_id("T1"), medium_id("T2")],
        },
    );

    match wait_response(&bed.sched, 7, LONG) {
        Response::ReadAlloc { media, .. } => {
            assert_eq!(media.len(), 1);
            assert_eq!(media[0].medium, medium_id("T2"));
            assert!(media[0].root_path.to_string_lossy().ends_with("D0"));
        }
        other => panic!("unexpected response {other:?}"),
    }

    let t1 = bed.dss.media_get(&medium_id("T1")).unwrap();
    assert_eq!(t1.adm_status, AdmStatus::Failed);
    // The failed medium's lock was released after the status write.
    assert!(bed.dss.lock_holder(&Entity::Medium(medium_id("T1"))).is_none());
}

#[test]
fn read_fails_without_spare_candidate() {
    let bed = testbed(1, vec![formatted_medium("T1")], Config::new());
    bed.lib.state.lock().fail_lookup.insert("T1".to_string());

    push(
        &bed.sched,
        8,
        Operation::ReadAlloc {
            n_required: 1,
            candidates: vec![medium_id("T1")],
        },
    );

    match wait_response(&bed.sched, 8, LONG) {
        Response::Error { rc, .. } => assert_eq!(rc, -libc::EIO),
        other => panic!("unexpected response {other:?}"),
    }
}

fn mount_one_for_write(bed: &TestBed, req_id: u64) -> lrs::AllocElt {
    push(
        &bed.sched,
        req_id,
        Operation::WriteAlloc {
            n_required: 1,
            family: Family::Tape,
            tags: Vec::new(),
            min_size: 0,
        },
    );
    match wait_response(&bed.sched, req_id, LONG) {
        Response::WriteAlloc { mut media, .. } => media.remove(0),
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn sync_triggered_by_count() {
    let bed = testbed(1, vec![formatted_medium("T1")], fast_sync(3, 60_000));
    let alloc = mount_one_for_write(&bed, 1);
    assert_eq!(alloc.medium, medium_id("T1"));

    for req_id in 10..13 {
        push(
            &bed.sched,
            req_id,
            Operation::Release {
                media: vec![ReleaseElt {
                    medium: medium_id("T1"),
                    size_written: 1 << 20,
                    nb_obj: 1,
                    client_rc: 0,
                    to_sync: true,
                }],
            },
        );
    }

    for req_id in 10..13 {
        match wait_response(&bed.sched, req_id, LONG) {
            Response::Release { media, .. } => assert_eq!(media, vec![medium_id("T1")]),
            other => panic!("unexpected response {other:?}"),
        }
    }

    // One epoch flushed all three acknowledgements.
    assert_eq!(bed.io.syncs.lock().len(), 1);
    let row = bed.dss.media_get(&medium_id("T1")).unwrap();
    assert_eq!(row.stats.nb_obj, 3);
    assert_eq!(row.stats.logc_used, 3 << 20);
}

#[test]
fn sync_triggered_by_time() {
    let bed = testbed(1, vec![formatted_medium("T1")], fast_sync(100, 200));
    mount_one_for_write(&bed, 1);

    let started = Instant::now();
    push(
        &bed.sched,
        20,
        Operation::Release {
            media: vec![ReleaseElt {
                medium: medium_id("T1"),
                size_written: 0,
                nb_obj: 0,
                client_rc: 0,
                to_sync: true,
            }],
        },
    );

    match wait_response(&bed.sched, 20, LONG) {
        Response::Release { .. } => {}
        other => panic!("unexpected response {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(190),
        "flushed after only {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(2), "flushed late: {elapsed:?}");
    assert_eq!(bed.io.syncs.lock().len(), 1);
}

#[test]
fn client_error_poisons_the_epoch_without_syncing() {
    let bed = testbed(1, vec![formatted_medium("T1")], fast_sync(100, 60_000));
    mount_one_for_write(&bed, 1);

    push(
        &bed.sched,
        30,
        Operation::Release {
            media: vec![ReleaseElt {
                medium: medium_id("T1"),
                size_written: 0,
                nb_obj: 0,
                client_rc: -libc::EIO,
                to_sync: true,
            }],
        },
    );

    match wait_response(&bed.sched, 30, LONG) {
        Response::Error { rc, .. } => assert_eq!(rc, -libc::EIO),
        other => panic!("unexpected response {other:?}"),
    }
    // No I/O sync was performed; the medium went to failed instead.
    assert!(bed.io.syncs.lock().is_empty());
    let row = bed.dss.media_get(&medium_id("T1")).unwrap();
    assert_eq!(row.adm_status, AdmStatus::Failed);
}

#[test]
fn drive_to_drive_refusal_is_retried_not_failed() {
    let bed = testbed(2, vec![formatted_medium("T1")], fast_sync(100, 100));
    {
        let mut state = bed.lib.state.lock();
        state.refuse_drive_to_drive = true;
        // The medium physically sits in the second drive.
        let sibling = state.drives["D1"];
        state.media.insert("T1".to_string(), sibling);
    }

    push(
        &bed.sched,
        50,
        Operation::ReadAlloc {
            n_required: 1,
            candidates: vec![medium_id("T1")],
        },
    );

    // The refused movement is not an error: no response yet.
    assert!(bed.sched.pop_response(Duration::from_millis(400)).is_none());

    // The sibling unloads the medium back to a slot; the pending
    // sub-request succeeds on its next attempt.
    bed.lib
        .state
        .lock()
        .media
        .insert("T1".to_string(), lrs::LibAddr::slot(7));

    match wait_response(&bed.sched, 50, LONG) {
        Response::ReadAlloc { media, .. } => assert_eq!(media[0].medium, medium_id("T1")),
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn write_on_readonly_mount_marks_full_and_retries() {
    let bed = testbed(
        1,
        vec![formatted_medium("T3"), formatted_medium("T4")],
        Config::new(),
    );
    bed.fs.state.lock().readonly_media.insert("T3".to_string());

    push(
        &bed.sched,
        60,
        Operation::WriteAlloc {
            n_required: 1,
            family: Family::Tape,
            tags: Vec::new(),
            min_size: 0,
        },
    );

    match wait_response(&bed.sched, 60, LONG) {
        Response::WriteAlloc { media, .. } => {
            assert_eq!(media[0].medium, medium_id("T4"));
        }
        other => panic!("unexpected response {other:?}"),
    }

    let t3 = bed.dss.media_get(&medium_id("T3")).unwrap();
    assert_eq!(t3.fs_status, FsStatus::Full);
}

#[test]
fn duplicate_release_is_coalesced() {
    let bed = testbed(1, vec![formatted_medium("T1")], fast_sync(2, 60_000));
    mount_one_for_write(&bed, 1);

    // Two acknowledgements of the same medium in one request: the second
    // enrollment is coalesced into the first, so the count threshold of
    // two is only reached by the follow-up request.
    let elt = ReleaseElt {
        medium: medium_id("T1"),
        size_written: 512,
        nb_obj: 1,
        client_rc: 0,
        to_sync: true,
    };
    push(
        &bed.sched,
        70,
        Operation::Release {
            media: vec![elt.clone(), elt.clone()],
        },
    );
    push(&bed.sched, 71, Operation::Release { media: vec![elt] });

    match wait_response(&bed.sched, 70, LONG) {
        Response::Release { media, .. } => assert_eq!(media.len(), 2),
        other => panic!("unexpected response {other:?}"),
    }
    match wait_response(&bed.sched, 71, LONG) {
        Response::Release { media, .. } => assert_eq!(media.len(), 1),
        other => panic!("unexpected response {other:?}"),
    }
    assert_eq!(bed.io.syncs.lock().len(), 1);
}

#[test]
fn release_of_unknown_medium_fails() {
    let bed = testbed(1, vec![], Config::new());
    push(
        &bed.sched,
        80,
        Operation::Release {
            media: vec![ReleaseElt {
                medium: medium_id("ghost"),
                size_written: 0,
                nb_obj: 0,
                client_rc: 0,
                to_sync: true,
            }],
        },
    );
    match wait_response(&bed.sched, 80, LONG) {
        Response::Error { rc, .. } => assert_eq!(rc, -libc::ENODEV),
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn ping_is_answered_inline() {
    let bed = testbed(1, vec![], Config::new());
    push(&bed.sched, 90, Operation::Ping);
    match wait_response(&bed.sched, 90, LONG) {
        Response::Ping { req_id } => assert_eq!(req_id, 90),
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn concurrent_format_of_same_medium_is_rejected() {
    // No drive: the first format stays queued while the second arrives.
    let bed = testbed(0, vec![formatted_medium("T1")], Config::new());
    let op = || Operation::Format {
        medium: medium_id("T1"),
        fs_type: FsType::Ltfs,
        unlock: false,
    };
    push(&bed.sched, 100, op());
    push(&bed.sched, 101, op());
    match wait_response(&bed.sched, 101, LONG) {
        Response::Error { rc, .. } => assert_eq!(rc, -libc::EEXIST),
        other => panic!("unexpected response {other:?}"),
    }
}
