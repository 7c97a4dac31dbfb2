/// Integration tests: recipient-side processing.
///
/// Envelopes are staged straight into a node's inbox (or arrive over the
/// loopback network) and `process_inbox` settles each one on its own.
mod common;

use common::{grant, init_tracing, Peer};
use transit_protocol::{
    Capability, CommitOutcome, DriveId, FileRecord, GlobalTransitId, InboxOutcome,
    LoopbackNetwork, ReferencedFile, RejectReason, TransferEnvelope, TransferStatus,
    TransitOptions,
};

fn envelope(sender: &Peer, drive: DriveId, record: FileRecord) -> TransferEnvelope {
    TransferEnvelope::save_file(sender.identity.clone(), drive, record, vec![7; 8])
}

#[tokio::test]
async fn comment_on_unknown_file_is_rejected() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::WriteReactionsAndComments]);

    let about = ReferencedFile {
        drive,
        global_transit_id: GlobalTransitId::generate(),
    };
    let comment = frodo.create_comment(drive, about, "nice photo");
    let result = frodo
        .node
        .send(&comment, &[sam.identity.clone()], &TransitOptions::new())
        .await
        .unwrap();

    assert_eq!(
        result.status(&sam.identity),
        Some(TransferStatus::TotalRejectionClientShouldRetry)
    );
    assert!(sam.files(drive).is_empty());
    assert_eq!(sam.node.inbox().queue_status().unwrap().total, 0);
}

#[tokio::test]
async fn comment_on_known_file_is_written() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::Write]);

    let photo = frodo.create_file(drive, b"photo");
    frodo
        .node
        .send(&photo, &[sam.identity.clone()], &TransitOptions::new().global_transit_id(true))
        .await
        .unwrap();
    let gtid = frodo.file(&photo).await.global_transit_id().unwrap();

    let comment = frodo.create_comment(
        drive,
        ReferencedFile {
            drive,
            global_transit_id: gtid,
        },
        "nice photo",
    );
    let result = frodo
        .node
        .send(&comment, &[sam.identity.clone()], &TransitOptions::new())
        .await
        .unwrap();

    assert_eq!(
        result.status(&sam.identity),
        Some(TransferStatus::DeliveredToTargetDrive)
    );
    let received = sam.files(drive);
    assert_eq!(received.len(), 2);
    assert!(received
        .iter()
        .any(|f| f.record.metadata.referenced_file.is_some() && f.record.payload == b"nice photo"));
}

#[tokio::test]
async fn each_envelope_is_settled_independently() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let gollum = Peer::new(&network, "gollum.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::Write]);

    let good = envelope(&frodo, drive, FileRecord::new("text/plain", b"good".to_vec()));
    let dangling = envelope(
        &frodo,
        drive,
        FileRecord::new("text/plain", b"comment".to_vec()).with_reference(ReferencedFile {
            drive,
            global_transit_id: GlobalTransitId::generate(),
        }),
    );
    let intruder = envelope(&gollum, drive, FileRecord::new("text/plain", b"mine".to_vec()));
    for env in [&dangling, &intruder, &good] {
        sam.node.stage(env).unwrap();
    }

    let report = sam.node.process_inbox().await.unwrap();
    assert_eq!(report.entries.len(), 3);
    assert_eq!(report.committed(), 1);
    assert_eq!(report.rejected(), 2);
    assert!(matches!(
        report.outcome_for(good.transfer_id),
        Some(InboxOutcome::Committed(CommitOutcome::Inserted { .. }))
    ));
    assert!(matches!(
        report.outcome_for(dangling.transfer_id),
        Some(InboxOutcome::Rejected(RejectReason::DanglingReference(_)))
    ));
    assert_eq!(
        report.outcome_for(intruder.transfer_id),
        Some(&InboxOutcome::Rejected(RejectReason::AccessDenied))
    );

    // Rejections are final: nothing is left to retry.
    assert_eq!(sam.node.inbox().queue_status().unwrap().total, 0);
    let files = sam.files(drive);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].record.payload, b"good");
    assert_eq!(files[0].record.key_header, vec![7; 8]);
}

#[tokio::test]
async fn storage_failure_is_retried() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::Write]);

    let env = envelope(&frodo, drive, FileRecord::new("text/plain", b"hello".to_vec()));
    sam.node.stage(&env).unwrap();
    sam.storage.fail_next_writes(1).unwrap();

    let first = sam.node.process_inbox().await.unwrap();
    assert!(matches!(
        first.outcome_for(env.transfer_id),
        Some(InboxOutcome::RetryLater(_))
    ));
    assert!(sam.files(drive).is_empty());
    let status = sam.node.inbox().queue_status().unwrap();
    assert_eq!((status.total, status.leased), (1, 0));

    let second = sam.node.process_inbox().await.unwrap();
    assert_eq!(second.committed(), 1);
    assert_eq!(sam.files(drive).len(), 1);
    assert_eq!(sam.node.inbox().queue_status().unwrap().total, 0);
}

#[tokio::test]
async fn storage_failure_on_sync_path_leaves_envelope_staged() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::Write]);
    sam.storage.fail_next_writes(1).unwrap();

    let file = frodo.create_file(drive, b"hello");
    let result = frodo
        .node
        .send(&file, &[sam.identity.clone()], &TransitOptions::new())
        .await
        .unwrap();
    assert_eq!(
        result.status(&sam.identity),
        Some(TransferStatus::DeliveredToInbox)
    );
    assert!(sam.files(drive).is_empty());

    sam.node.process_inbox().await.unwrap();
    assert_eq!(sam.files(drive).len(), 1);
}

#[tokio::test]
async fn grant_revoked_after_staging_is_enforced() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::Write]);

    let file = frodo.create_file(drive, b"hello");
    frodo
        .node
        .send(&file, &[sam.identity.clone()], &TransitOptions::queued())
        .await
        .unwrap();
    frodo.node.process_outbox().await.unwrap();
    assert_eq!(sam.node.inbox().queue_status().unwrap().total, 1);

    sam.storage.revoke(&frodo.identity, drive).unwrap();
    let report = sam.node.process_inbox().await.unwrap();
    assert_eq!(report.rejected(), 1);
    assert!(sam.files(drive).is_empty());
}

#[tokio::test]
async fn delete_propagates_as_soft_delete() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::Write]);

    let file = frodo.create_file(drive, b"short lived");
    frodo
        .node
        .send(&file, &[sam.identity.clone()], &TransitOptions::new().global_transit_id(true))
        .await
        .unwrap();
    let before = sam.files(drive)[0].clone();
    assert!(before.record.has_content());

    let result = frodo
        .node
        .send_delete(&file, &[sam.identity.clone()], &TransitOptions::new())
        .await
        .unwrap();
    assert_eq!(
        result.status(&sam.identity),
        Some(TransferStatus::DeliveredToTargetDrive)
    );

    // Sender's own copy is soft-deleted too.
    assert!(frodo.file(&file).await.is_deleted);

    let after = sam.get(drive, before.file_id).await.expect("row is kept");
    assert!(after.is_deleted);
    assert!(!after.record.has_content());
    assert_eq!(after.global_transit_id(), before.global_transit_id());

    let changed = sam.storage.modified_since(drive, before.modified).unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].file_id, before.file_id);
}

#[tokio::test]
async fn delete_of_unknown_file_is_a_noop() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::Write]);

    let env = TransferEnvelope::delete_linked_file(
        frodo.identity.clone(),
        drive,
        GlobalTransitId::generate(),
    );
    sam.node.stage(&env).unwrap();
    let report = sam.node.process_inbox().await.unwrap();
    assert_eq!(
        report.outcome_for(env.transfer_id),
        Some(&InboxOutcome::Committed(CommitOutcome::NothingToDelete))
    );
    assert!(sam.files(drive).is_empty());
}

#[tokio::test]
async fn restaging_the_same_transfer_supersedes() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::Write]);

    let env = envelope(&frodo, drive, FileRecord::new("text/plain", b"one".to_vec()));
    sam.node.stage(&env).unwrap();
    sam.node.stage(&env).unwrap();
    assert_eq!(sam.node.inbox().queue_status().unwrap().total, 1);

    let report = sam.node.process_inbox().await.unwrap();
    assert_eq!(report.committed(), 1);
    assert_eq!(sam.files(drive).len(), 1);
}

fn linked(sender: &Peer, drive: DriveId, gtid: GlobalTransitId, payload: &[u8]) -> TransferEnvelope {
    let mut record = FileRecord::new("text/plain", payload.to_vec());
    record.metadata.global_transit_id = Some(gtid);
    let mut env = envelope(sender, drive, record);
    env.use_global_transit_id = true;
    env
}

#[tokio::test]
async fn only_the_original_sender_may_change_a_file() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let mallory = Peer::new(&network, "mallory.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::Write]);
    grant(&sam, &mallory, drive, &[Capability::Write]);

    let gtid = GlobalTransitId::generate();
    let original = linked(&frodo, drive, gtid, b"frodo's words");
    sam.node.stage(&original).unwrap();
    assert_eq!(sam.node.process_inbox().await.unwrap().committed(), 1);

    let overwrite = linked(&mallory, drive, gtid, b"mallory's words");
    let delete = TransferEnvelope::delete_linked_file(mallory.identity.clone(), drive, gtid);
    sam.node.stage(&overwrite).unwrap();
    sam.node.stage(&delete).unwrap();

    let report = sam.node.process_inbox().await.unwrap();
    assert_eq!(report.rejected(), 2);
    for env in [&overwrite, &delete] {
        assert_eq!(
            report.outcome_for(env.transfer_id),
            Some(&InboxOutcome::Rejected(RejectReason::NotOriginalSender))
        );
    }
    assert_eq!(sam.node.inbox().queue_status().unwrap().total, 0);

    let files = sam.files(drive);
    assert_eq!(files.len(), 1);
    assert!(!files[0].is_deleted);
    assert_eq!(files[0].record.payload, b"frodo's words");
    assert_eq!(files[0].sender(), Some(&frodo.identity));
}

#[tokio::test]
async fn late_update_does_not_revive_a_deleted_file() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::Write]);

    let gtid = GlobalTransitId::generate();
    let v1 = linked(&frodo, drive, gtid, b"v1");
    let delete = TransferEnvelope::delete_linked_file(frodo.identity.clone(), drive, gtid);
    let v2 = linked(&frodo, drive, gtid, b"v2");
    for env in [&v1, &delete, &v2] {
        sam.node.stage(env).unwrap();
        sam.node.process_inbox().await.unwrap();
    }

    let files = sam.files(drive);
    assert_eq!(files.len(), 1);
    assert!(files[0].is_deleted);
    assert!(!files[0].record.has_content());
    assert_eq!(sam.node.inbox().queue_status().unwrap().total, 0);

    // A repeated delete is still a no-op.
    let again = TransferEnvelope::delete_linked_file(frodo.identity.clone(), drive, gtid);
    sam.node.stage(&again).unwrap();
    let report = sam.node.process_inbox().await.unwrap();
    assert_eq!(
        report.outcome_for(again.transfer_id),
        Some(&InboxOutcome::Committed(CommitOutcome::NothingToDelete))
    );
}

#[tokio::test]
async fn late_update_is_reported_as_file_deleted() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let frodo = Peer::new(&network, "frodo.example");
    let sam = Peer::new(&network, "sam.example");
    let drive = DriveId::generate();
    grant(&sam, &frodo, drive, &[Capability::Write]);

    let gtid = GlobalTransitId::generate();
    sam.node.stage(&linked(&frodo, drive, gtid, b"v1")).unwrap();
    sam.node
        .stage(&TransferEnvelope::delete_linked_file(frodo.identity.clone(), drive, gtid))
        .unwrap();
    assert_eq!(sam.node.process_inbox().await.unwrap().committed(), 2);

    let late = linked(&frodo, drive, gtid, b"v2");
    sam.node.stage(&late).unwrap();
    let report = sam.node.process_inbox().await.unwrap();
    assert_eq!(
        report.outcome_for(late.transfer_id),
        Some(&InboxOutcome::Rejected(RejectReason::FileDeleted))
    );
}
