// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end engine tests driven through the public handles, with shell
//! scripts standing in for filesystem tooling.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use enumflags2::BitFlags;

use arbiter_core::{
    ArbitrationHandle, CallbackSpec, CallerIdentity, EngineConfig, Personality,
    PersonalityRegistry, SessionHandle, StaticAuthorizer,
};
use arbiter_types::{
    ArbiterErrorKind, CallbackKind, DiskEvent, DiskId, Dissenter, keys,
};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
    path
}

/// A personality whose probe recognizes everything and whose mount tool
/// appends a line to `<dir>/mount.log`.
fn test_registry(dir: &Path) -> PersonalityRegistry {
    let probe = write_script(
        dir,
        "probe.sh",
        "#!/bin/sh\ncase \"$1\" in\n-p) echo Untitled ;;\n-k) echo 0123456789abcdef ;;\nesac\nexit 0\n",
    );
    let log = dir.join("mount.log");
    let mount = write_script(
        dir,
        "mount.sh",
        &format!("#!/bin/sh\necho \"$@\" >> {}\nexit 0\n", log.display()),
    );
    let rename = write_script(dir, "rename.sh", "#!/bin/sh\nexit 0\n");

    let text = format!(
        r#"
        name = "testfs"
        kind_name = "Test Filesystem"

        [probe]
        executable = "{probe}"
        recognize_args = ["-p"]
        uuid_args = ["-k"]

        [mount]
        executable = "{mount}"

        [rename]
        executable = "{rename}"
        "#,
        probe = probe.display(),
        mount = mount.display(),
        rename = rename.display(),
    );
    let mut registry = PersonalityRegistry::empty();
    registry.insert(
        Personality::from_toml(&dir.join("testfs.toml"), &text).expect("parse personality"),
    );
    registry
}

fn device_properties(path: &str, removable: bool) -> BTreeMap<String, serde_json::Value> {
    let mut properties = BTreeMap::new();
    properties.insert(keys::DEVICE_PATH.to_string(), path.into());
    properties.insert(keys::MEDIA_SIZE.to_string(), 8_000_000u64.into());
    properties.insert(keys::MEDIA_WHOLE.to_string(), true.into());
    properties.insert(keys::MEDIA_REMOVABLE.to_string(), removable.into());
    properties
}

fn engine(dir: &Path, auto_mount: bool) -> ArbitrationHandle {
    let config = EngineConfig {
        admin_group: "no-such-group".to_string(),
        auto_mount,
        mount_root: dir.join("media"),
        ..EngineConfig::default()
    };
    ArbitrationHandle::spawn(
        config,
        test_registry(dir),
        Arc::new(StaticAuthorizer::deny_all()),
    )
}

async fn recv(session: &mut SessionHandle) -> DiskEvent {
    tokio::time::timeout(Duration::from_secs(5), session.next_event())
        .await
        .expect("timed out waiting for an event")
        .expect("engine stopped")
}

async fn connect_root(handle: &ArbitrationHandle) -> SessionHandle {
    handle
        .connect(CallerIdentity::root(), true)
        .await
        .expect("connect")
}

/// Announce a device and wait for its appearance through `session`, which
/// must have a `DiskAppeared` callback registered.
async fn announce(
    handle: &ArbitrationHandle,
    session: &mut SessionHandle,
    path: &str,
) -> DiskId {
    handle.announce_device(device_properties(path, true));
    loop {
        if let DiskEvent::Appeared(snapshot) = recv(session).await {
            assert_eq!(snapshot.id.as_str(), path);
            return snapshot.id;
        }
    }
}

#[tokio::test]
async fn probe_recognizes_disk_before_announcing_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut session = connect_root(&handle).await;
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::Idle))
        .await
        .expect("register");

    handle.announce_device(device_properties("disk/sdb", true));

    let DiskEvent::Appeared(snapshot) = recv(&mut session).await else {
        panic!("expected the appearance first");
    };
    assert_eq!(
        snapshot.description.get_str(keys::VOLUME_KIND),
        Some("Test Filesystem")
    );
    assert_eq!(snapshot.description.volume_name(), Some("Untitled"));
    assert!(snapshot.description.volume_uuid().is_some());

    // The pipeline settles afterwards.
    assert_eq!(recv(&mut session).await, DiskEvent::Idle);
}

#[tokio::test]
async fn peek_runs_for_ordered_observers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut session = connect_root(&handle).await;
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::Peek))
        .await
        .expect("register");

    handle.announce_device(device_properties("disk/sdp", true));

    let first = recv(&mut session).await;
    let second = recv(&mut session).await;
    assert!(matches!(first, DiskEvent::Appeared(_)));
    assert!(matches!(second, DiskEvent::Peek(_)));
}

#[tokio::test]
async fn claims_are_exclusive_until_released() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut watcher = connect_root(&handle).await;
    watcher
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    let first = connect_root(&handle).await;
    let second = connect_root(&handle).await;
    let id = announce(&handle, &mut watcher, "disk/sdc").await;

    assert!(first.claim(&id).await.is_none());

    let dissent = second.claim(&id).await.expect("second claim must lose");
    assert!(dissent.is_kind(ArbiterErrorKind::Busy));

    assert!(first.release(&id).await.is_none());
    assert!(second.claim(&id).await.is_none());
}

#[tokio::test]
async fn claim_transfers_when_the_holder_consents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut holder = connect_root(&handle).await;
    holder
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    holder
        .register_callback(CallbackSpec::for_kind(CallbackKind::ClaimRelease))
        .await
        .expect("register");
    let id = announce(&handle, &mut holder, "disk/sdd").await;
    assert!(holder.claim(&id).await.is_none());

    let challenger = connect_root(&handle).await;
    let (challenge, ()) = tokio::join!(challenger.claim(&id), async {
        match recv(&mut holder).await {
            DiskEvent::ClaimReleaseRequested { round, token, disk } => {
                assert_eq!(disk.id, id);
                holder.respond(round, token, None);
            }
            other => panic!("expected a claim-release request, got {other:?}"),
        }
    });
    assert!(challenge.is_none());

    // The old holder no longer holds anything.
    let dissent = holder.release(&id).await.expect("release must fail");
    assert!(dissent.is_kind(ArbiterErrorKind::BadArgument));
}

#[tokio::test]
async fn claim_stays_when_the_holder_objects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut holder = connect_root(&handle).await;
    holder
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    holder
        .register_callback(CallbackSpec::for_kind(CallbackKind::ClaimRelease))
        .await
        .expect("register");
    let id = announce(&handle, &mut holder, "disk/sde").await;
    assert!(holder.claim(&id).await.is_none());

    let challenger = connect_root(&handle).await;
    let (challenge, ()) = tokio::join!(challenger.claim(&id), async {
        if let DiskEvent::ClaimReleaseRequested { round, token, .. } = recv(&mut holder).await {
            holder.respond(
                round,
                token,
                Some(Dissenter::new(
                    std::process::id(),
                    ArbiterErrorKind::Busy,
                    Some("still writing".to_string()),
                )),
            );
        }
    });
    let dissent = challenge.expect("challenge must lose");
    assert!(dissent.is_kind(ArbiterErrorKind::Busy));
    assert_eq!(dissent.message(), Some("still writing"));

    assert!(holder.release(&id).await.is_none());
}

#[tokio::test]
async fn mount_sets_volume_path_and_notifies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut session = connect_root(&handle).await;
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskDescriptionChanged))
        .await
        .expect("register");
    let id = announce(&handle, &mut session, "disk/sdf").await;

    let target = dir.path().join("mnt");
    let dissent = session
        .mount(&id, Some(&target), &["nodev", "nosuid"], BitFlags::empty())
        .await;
    assert!(dissent.is_none(), "mount failed: {dissent:?}");

    loop {
        let DiskEvent::DescriptionChanged { disk, changed_keys } = recv(&mut session).await
        else {
            continue;
        };
        if changed_keys.contains(&keys::VOLUME_PATH.to_string()) {
            assert_eq!(disk.description.volume_path(), Some(target.to_str().unwrap()));
            break;
        }
    }

    // The mount tool saw -o with the joined option list.
    let log = std::fs::read_to_string(dir.path().join("mount.log")).expect("mount log");
    assert!(log.contains("-o nodev,nosuid"), "unexpected invocation: {log}");
    assert!(log.contains("disk/sdf"));
}

#[tokio::test]
async fn second_mount_waits_for_the_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    // Swap in a mount tool that brackets a pause with log markers.
    let log = dir.path().join("mount.log");
    write_script(
        dir.path(),
        "mount.sh",
        &format!(
            "#!/bin/sh\necho start >> {log}\nsleep 0.2\necho end >> {log}\nexit 0\n",
            log = log.display()
        ),
    );
    let mut session = connect_root(&handle).await;
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    let id = announce(&handle, &mut session, "disk/sds").await;

    let (first, second) = tokio::join!(
        session.mount(&id, None, &[], BitFlags::empty()),
        session.mount(&id, None, &[], BitFlags::empty()),
    );
    assert!(first.is_none(), "first mount failed: {first:?}");
    assert!(second.is_none(), "second mount failed: {second:?}");

    // The second tool run started only after the first one finished.
    let log = std::fs::read_to_string(&log).expect("mount log");
    assert_eq!(log, "start\nend\nstart\nend\n");
}

#[tokio::test]
async fn mount_approval_dissent_blocks_the_mount() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut approver = connect_root(&handle).await;
    approver
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    approver
        .register_callback(CallbackSpec::for_kind(CallbackKind::MountApproval))
        .await
        .expect("register");
    let id = announce(&handle, &mut approver, "disk/sdg").await;

    let requester = connect_root(&handle).await;
    let (outcome, ()) = tokio::join!(
        requester.mount(&id, None, &[], BitFlags::empty()),
        async {
            if let DiskEvent::ApprovalRequested { round, token, kind, .. } = recv(&mut approver).await
            {
                assert_eq!(kind, CallbackKind::MountApproval);
                approver.respond(
                    round,
                    token,
                    Some(Dissenter::new(
                        std::process::id(),
                        ArbiterErrorKind::NotPrivileged,
                        Some("policy says no".to_string()),
                    )),
                );
            }
        }
    );
    let dissent = outcome.expect("mount must be vetoed");
    assert_eq!(dissent.message(), Some("policy says no"));
    assert!(!dir.path().join("mount.log").exists(), "mount tool must not run");
}

#[tokio::test]
async fn first_dissent_short_circuits_the_round() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut watcher = connect_root(&handle).await;
    watcher
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    let id = announce(&handle, &mut watcher, "disk/sdh").await;

    // late registers first but declares a later order.
    let mut late = connect_root(&handle).await;
    late.register_callback(
        CallbackSpec::for_kind(CallbackKind::MountApproval).with_order(10),
    )
    .await
    .expect("register");
    let mut early = connect_root(&handle).await;
    early
        .register_callback(CallbackSpec::for_kind(CallbackKind::MountApproval).with_order(0))
        .await
        .expect("register");

    let requester = connect_root(&handle).await;
    let (outcome, ()) = tokio::join!(
        requester.mount(&id, None, &[], BitFlags::empty()),
        async {
            if let DiskEvent::ApprovalRequested { round, token, .. } = recv(&mut early).await {
                early.respond(
                    round,
                    token,
                    Some(Dissenter::new(0, ArbiterErrorKind::Busy, None)),
                );
            }
        }
    );
    assert!(outcome.is_some());
    // The later-ordered callback was never consulted.
    assert!(late.try_event().is_none());
}

#[tokio::test]
async fn approval_answers_are_matched_to_the_dispatched_callback() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut approver = connect_root(&handle).await;
    approver
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    let id = announce(&handle, &mut approver, "disk/sdq").await;

    // One session, two approval callbacks of the same kind.
    let first = approver
        .register_callback(CallbackSpec::for_kind(CallbackKind::MountApproval).with_order(0))
        .await
        .expect("register");
    let second = approver
        .register_callback(CallbackSpec::for_kind(CallbackKind::MountApproval).with_order(10))
        .await
        .expect("register");

    let requester = connect_root(&handle).await;
    let (outcome, ()) = tokio::join!(
        requester.mount(&id, None, &[], BitFlags::empty()),
        async {
            let DiskEvent::ApprovalRequested { round, token, .. } = recv(&mut approver).await
            else {
                panic!("expected the first approval request");
            };
            assert_eq!(token, first);
            // A dissent under the wrong callback is dropped.
            approver.respond(round, second, Some(Dissenter::new(0, ArbiterErrorKind::Busy, None)));
            approver.respond(round, first, None);

            let DiskEvent::ApprovalRequested { round, token, .. } = recv(&mut approver).await
            else {
                panic!("expected the second approval request");
            };
            assert_eq!(token, second);
            approver.respond(
                round,
                token,
                Some(Dissenter::new(
                    0,
                    ArbiterErrorKind::Busy,
                    Some("second callback objects".to_string()),
                )),
            );
        }
    );
    let dissent = outcome.expect("mount must be vetoed");
    assert_eq!(dissent.message(), Some("second callback objects"));
}

#[tokio::test]
async fn unmounting_an_unmounted_disk_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut session = connect_root(&handle).await;
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    let id = announce(&handle, &mut session, "disk/sdi").await;

    let dissent = session
        .unmount(&id, BitFlags::empty())
        .await
        .expect("unmount must fail");
    assert!(dissent.is_kind(ArbiterErrorKind::BadArgument));
}

#[tokio::test]
async fn operations_on_unknown_disks_report_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let session = connect_root(&handle).await;

    let dissent = session
        .eject(&DiskId::from("disk/nope"))
        .await
        .expect("eject must fail");
    assert!(dissent.is_kind(ArbiterErrorKind::NotFound));
}

#[tokio::test]
async fn rename_updates_the_volume_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut session = connect_root(&handle).await;
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    let id = announce(&handle, &mut session, "disk/sdj").await;

    assert!(session.rename(&id, "Backups").await.is_none());

    let snapshot = handle
        .list_disks()
        .await
        .into_iter()
        .find(|snapshot| snapshot.id == id)
        .expect("disk listed");
    assert_eq!(snapshot.description.volume_name(), Some("Backups"));
}

#[tokio::test]
async fn unprivileged_callers_are_denied_without_rights() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut watcher = connect_root(&handle).await;
    watcher
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");

    // Non-removable media, unknown owner: nothing grants local access and
    // the interactive check denies.
    handle.announce_device(device_properties("disk/sdk", false));
    let id = loop {
        if let DiskEvent::Appeared(snapshot) = recv(&mut watcher).await {
            break snapshot.id;
        }
    };

    let caller = CallerIdentity {
        uid: 12_345,
        gid: 12_345,
        pid: 99,
    };
    let session = handle.connect(caller, true).await.expect("connect");
    let dissent = session
        .mount(&id, None, &[], BitFlags::empty())
        .await
        .expect("mount must be denied");
    assert!(dissent.is_kind(ArbiterErrorKind::NotPrivileged));
}

#[tokio::test]
async fn recorded_owner_authorizes_matching_caller() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut watcher = connect_root(&handle).await;
    watcher
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");

    // Non-removable media, but the device source names an owner.
    let mut properties = device_properties("disk/sdr", false);
    properties.insert(keys::OWNER_UID.to_string(), 12_345u64.into());
    properties.insert(keys::OWNER_GID.to_string(), 12_345u64.into());
    handle.announce_device(properties);
    let id = loop {
        if let DiskEvent::Appeared(snapshot) = recv(&mut watcher).await {
            break snapshot.id;
        }
    };

    let caller = CallerIdentity {
        uid: 12_345,
        gid: 12_345,
        pid: 99,
    };
    let session = handle.connect(caller, true).await.expect("connect");
    // Authorization succeeds on the owner match alone (the interactive
    // check would deny); the unmount then fails on disk state instead.
    let dissent = session
        .unmount(&id, BitFlags::empty())
        .await
        .expect("unmount of an unmounted disk must fail");
    assert!(dissent.is_kind(ArbiterErrorKind::BadArgument));
}

#[tokio::test]
async fn removable_media_auto_mounts_when_enabled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), true);
    let mut session = connect_root(&handle).await;
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskDescriptionChanged))
        .await
        .expect("register");

    handle.announce_device(device_properties("disk/sdl", true));

    loop {
        if let DiskEvent::DescriptionChanged { disk, changed_keys } = recv(&mut session).await {
            if changed_keys.contains(&keys::VOLUME_PATH.to_string()) {
                let path = disk.description.volume_path().expect("mounted path");
                assert!(path.starts_with(dir.path().join("media").to_str().unwrap()));
                break;
            }
        }
    }
}

#[tokio::test]
async fn disappearance_is_deferred_while_a_request_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    // Swap in a mount tool slow enough to keep the disk busy.
    write_script(dir.path(), "mount.sh", "#!/bin/sh\nsleep 0.3\nexit 0\n");
    let mut session = connect_root(&handle).await;
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    session
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskDisappeared))
        .await
        .expect("register");
    let id = announce(&handle, &mut session, "disk/sdm").await;

    let (outcome, ()) = tokio::join!(
        session.mount(&id, None, &[], BitFlags::empty()),
        async {
            // Pull the device while the mount tool is still running.
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.withdraw_device(id.clone());
        }
    );
    assert!(outcome.is_none(), "in-flight mount must still complete");

    loop {
        if let DiskEvent::Disappeared(snapshot) = recv(&mut session).await {
            assert_eq!(snapshot.id, id);
            break;
        }
    }
    assert!(handle.list_disks().await.is_empty());
}

#[tokio::test]
async fn classic_observers_see_the_full_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut observer = connect_root(&handle).await;
    // A single classic registration covers appearance, description
    // changes, and disappearance.
    observer
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskClassic))
        .await
        .expect("register");
    let id = announce(&handle, &mut observer, "disk/sdt").await;

    assert!(observer.rename(&id, "Archive").await.is_none());
    loop {
        if let DiskEvent::DescriptionChanged { changed_keys, .. } = recv(&mut observer).await {
            if changed_keys.contains(&keys::VOLUME_NAME.to_string()) {
                break;
            }
        }
    }

    handle.withdraw_device(id.clone());
    loop {
        if let DiskEvent::Disappeared(snapshot) = recv(&mut observer).await {
            assert_eq!(snapshot.id, id);
            break;
        }
    }
}

#[tokio::test]
async fn claim_observers_are_notified_when_a_claim_lands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut observer = connect_root(&handle).await;
    observer
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    observer
        .register_callback(CallbackSpec::for_kind(CallbackKind::Claim))
        .await
        .expect("register");
    let id = announce(&handle, &mut observer, "disk/sdu").await;

    let claimant = connect_root(&handle).await;
    assert!(claimant.claim(&id).await.is_none());

    loop {
        if let DiskEvent::Claimed(snapshot) = recv(&mut observer).await {
            assert_eq!(snapshot.id, id);
            break;
        }
    }
}

#[tokio::test]
async fn disconnecting_the_holder_releases_its_claim() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = engine(dir.path(), false);
    let mut watcher = connect_root(&handle).await;
    watcher
        .register_callback(CallbackSpec::for_kind(CallbackKind::DiskAppeared))
        .await
        .expect("register");
    let id = announce(&handle, &mut watcher, "disk/sdn").await;

    let holder = connect_root(&handle).await;
    assert!(holder.claim(&id).await.is_none());
    drop(holder);

    // Claiming again succeeds once the disconnect is processed.
    let successor = connect_root(&handle).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match successor.claim(&id).await {
            None => break,
            Some(dissent) if dissent.is_kind(ArbiterErrorKind::Busy) => {
                assert!(tokio::time::Instant::now() < deadline, "claim never released");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Some(dissent) => panic!("unexpected dissent: {dissent:?}"),
        }
    }
}
