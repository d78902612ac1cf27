//! End-to-end ingestion flows over the full stack: feature registry, job
//! queue, indexing chain, deletion reconciliation and the in-memory index.

mod common;

use std::sync::Arc;

use protostar::{Job, JobRequest, JobStep, JobStore, StepKind, StepStatus, UploadedFile};
use serde_json::json;

use accretion::connections::drive::DriveFeature;
use accretion::connections::files::UploadFeature;
use accretion::connections::hub::HubFeature;
use accretion::connections::kms::KmsFeature;
use accretion::index::{DocumentIndex, IndexedChunk};

use common::{
    build_stack, build_stack_with_index, job_steps, wait_settled, CountingIndex, FakeDriveApi,
    FakeDriveFactory, FakeHubApi, FakeHubFactory, FakeKmsApi, FakeKmsFactory,
};

const KIND_CRAWL: i64 = 0;
const KIND_LOAD: i64 = 1;
const KIND_SYNC_DELETIONS: i64 = 2;
const KIND_DELETE: i64 = 3;
const STATUS_DONE: i64 = 3000;

#[tokio::test]
async fn upload_job_loads_the_attachment_into_the_index() {
    let stack = build_stack(vec![Arc::new(UploadFeature)]).await;

    let request = JobRequest {
        datasource: "D1".to_string(),
        upload: Some(Arc::new(UploadedFile {
            filename: "foo.pdf".to_string(),
            content_type: Some("application/pdf".to_string()),
            content: b"hello upload world".to_vec(),
        })),
        ..JobRequest::default()
    };

    let (mut job, step) = stack
        .state
        .features()
        .convert_to_job_and_first_step(&request)
        .unwrap()
        .unwrap();
    assert_eq!(step.kind, StepKind::Load);
    assert_eq!(step.doc_id, None);
    assert_eq!(step.datasource, "D1");

    stack
        .state
        .queue
        .queue_job_step(&mut job, step, None, true)
        .await
        .unwrap();
    let job_id = job.id.unwrap();
    wait_settled(&stack.store, job_id).await;

    let steps = job_steps(&stack.store, job_id).await;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].0, KIND_LOAD);
    assert_eq!(steps[0].1, STATUS_DONE);

    let chunks = stack.index.chunks();
    assert_eq!(chunks.len(), 1, "one insertion for the small document");
    let metadata = &chunks[0].metadata;
    assert_eq!(metadata["title"], "foo.pdf");
    assert_eq!(metadata["doc_id"], "foo.pdf");
    assert_eq!(metadata["source"], "D1/foo.pdf");
    assert_eq!(metadata["datasource"], "D1");
    assert_eq!(metadata["connection_id"], "NONE");
    assert_eq!(metadata["chunk_id"], 0);
}

#[tokio::test]
async fn crawl_job_loads_every_artifact_and_queues_deletion_sync() {
    let api = FakeKmsApi::with_articles(&[1, 2]);
    let stack = build_stack(vec![Arc::new(KmsFeature::with_factory(Arc::new(
        FakeKmsFactory(api),
    )))])
    .await;

    let request = JobRequest {
        datasource: "KMS".to_string(),
        ..JobRequest::default()
    };
    let (mut job, step) = stack
        .state
        .features()
        .convert_to_job_and_first_step(&request)
        .unwrap()
        .unwrap();
    assert_eq!(step.kind, StepKind::Crawl);

    stack
        .state
        .queue
        .queue_job_step(&mut job, step, None, true)
        .await
        .unwrap();
    let job_id = job.id.unwrap();
    wait_settled(&stack.store, job_id).await;

    let steps = job_steps(&stack.store, job_id).await;
    let crawl: Vec<_> = steps.iter().filter(|step| step.0 == KIND_CRAWL).collect();
    let loads: Vec<_> = steps.iter().filter(|step| step.0 == KIND_LOAD).collect();
    let syncs: Vec<_> = steps
        .iter()
        .filter(|step| step.0 == KIND_SYNC_DELETIONS)
        .collect();

    assert_eq!(crawl.len(), 1);
    assert_eq!(crawl[0].1, STATUS_DONE);
    assert_eq!(loads.len(), 2);
    let mut load_ids: Vec<_> = loads
        .iter()
        .map(|step| step.2.clone().unwrap())
        .collect();
    load_ids.sort();
    assert_eq!(load_ids, vec!["1", "2"]);
    assert!(loads.iter().all(|step| step.1 == STATUS_DONE));
    assert_eq!(syncs.len(), 1, "deletion sync queued by default");
    assert_eq!(syncs[0].1, STATUS_DONE);

    assert_eq!(stack.index.metadata_values("doc_id"), vec!["1", "2"]);
}

#[tokio::test]
async fn crawl_with_zero_artifacts_still_syncs_deletions() {
    let api = FakeKmsApi::with_articles(&[]);
    let stack = build_stack(vec![Arc::new(KmsFeature::with_factory(Arc::new(
        FakeKmsFactory(api),
    )))])
    .await;

    let request = JobRequest {
        datasource: "KMS".to_string(),
        ..JobRequest::default()
    };
    let (mut job, step) = stack
        .state
        .features()
        .convert_to_job_and_first_step(&request)
        .unwrap()
        .unwrap();
    stack
        .state
        .queue
        .queue_job_step(&mut job, step, None, true)
        .await
        .unwrap();
    let job_id = job.id.unwrap();
    wait_settled(&stack.store, job_id).await;

    let steps = job_steps(&stack.store, job_id).await;
    assert_eq!(steps.len(), 2, "CRAWL and SYNC_DELETIONS only");
    assert!(steps.iter().any(|step| step.0 == KIND_CRAWL));
    assert!(steps.iter().any(|step| step.0 == KIND_SYNC_DELETIONS));
    assert!(steps.iter().all(|step| step.1 == STATUS_DONE));
    assert!(stack.index.chunks().is_empty());
}

#[tokio::test]
async fn hub_crawl_concatenates_every_article_section() {
    let api = FakeHubApi::with_uuids(&["u1"]);
    let stack = build_stack(vec![Arc::new(HubFeature::with_factory(Arc::new(
        FakeHubFactory(api),
    )))])
    .await;

    let request = JobRequest {
        datasource: "HUB".to_string(),
        ..JobRequest::default()
    };
    let (mut job, step) = stack
        .state
        .features()
        .convert_to_job_and_first_step(&request)
        .unwrap()
        .unwrap();
    assert_eq!(step.kind, StepKind::Crawl);
    stack
        .state
        .queue
        .queue_job_step(&mut job, step, None, true)
        .await
        .unwrap();
    wait_settled(&stack.store, job.id.unwrap()).await;

    let chunks = stack.index.chunks();
    assert_eq!(chunks.len(), 1);
    let chunk = &chunks[0];
    assert!(
        chunk.text.contains("Symptoms=Symptoms of u1")
            && chunk.text.contains("Resolution=Apply the fix"),
        "every content section lands in the indexed text: {}",
        chunk.text
    );
    assert_eq!(chunk.metadata["doc_id"], "u1");
    assert_eq!(chunk.metadata["doc_display_id"], "KB-u1");
    assert_eq!(chunk.metadata["source"], "HUB/outage/KB-u1");
    assert_eq!(chunk.metadata["internal"], true);
    assert_eq!(chunk.metadata["company"], "Acme");
}

fn seeded_chunk(datasource: &str, display_id: &str) -> IndexedChunk {
    let mut metadata = serde_json::Map::new();
    metadata.insert("datasource".to_string(), json!(datasource));
    metadata.insert("doc_display_id".to_string(), json!(display_id));
    metadata.insert("connection_id".to_string(), json!("NONE"));
    IndexedChunk {
        text: format!("seeded {display_id}"),
        embedding: vec![0.0; 8],
        metadata,
    }
}

#[tokio::test]
async fn deletion_sync_deletes_exactly_the_vanished_display_ids() {
    // Source publishes K2 and K3; the index holds K1, K3 and K4.
    let api = FakeDriveApi::with_display_ids(&["K2", "K3"]);
    let stack = build_stack(vec![Arc::new(DriveFeature::with_factory(Arc::new(
        FakeDriveFactory(api),
    )))])
    .await;

    stack
        .index
        .insert_chunks(vec![
            seeded_chunk("DRV", "K1"),
            seeded_chunk("DRV", "K3"),
            seeded_chunk("DRV", "K4"),
        ])
        .await
        .unwrap();

    let mut job = Job {
        datasource: "DRV".to_string(),
        ..Job::default()
    };
    stack.store.store_job(&mut job).await.unwrap();
    let mut sync_step = JobStep {
        job_id: job.id,
        ..JobStep::new(StepKind::SyncDeletions, "DRV")
    };
    stack
        .store
        .store_job_step(&mut sync_step, None)
        .await
        .unwrap();

    // Existing steps mean resume: the sync step runs and drains the DELETEs
    // it queued.
    stack
        .state
        .queue
        .start_or_resume_job(job.id.unwrap())
        .await
        .unwrap();
    wait_settled(&stack.store, job.id.unwrap()).await;

    let steps = job_steps(&stack.store, job.id.unwrap()).await;
    let mut deleted_keys: Vec<_> = steps
        .iter()
        .filter(|step| step.0 == KIND_DELETE)
        .map(|step| step.3.clone().unwrap())
        .collect();
    deleted_keys.sort();
    assert_eq!(deleted_keys, vec!["K1", "K4"], "exactly the vanished keys");
    assert!(steps.iter().all(|step| step.1 == STATUS_DONE));

    assert_eq!(stack.index.metadata_values("doc_display_id"), vec!["K3"]);
}

#[tokio::test]
async fn reindexing_a_document_replaces_its_previous_chunks() {
    let api = FakeKmsApi::with_articles(&[7]);
    let stack = build_stack(vec![Arc::new(KmsFeature::with_factory(Arc::new(
        FakeKmsFactory(api),
    )))])
    .await;

    for _ in 0..2 {
        let request = JobRequest {
            datasource: "KMS".to_string(),
            doc_id: Some("7".to_string()),
            ..JobRequest::default()
        };
        let (mut job, step) = stack
            .state
            .features()
            .convert_to_job_and_first_step(&request)
            .unwrap()
            .unwrap();
        stack
            .state
            .queue
            .queue_job_step(&mut job, step, None, true)
            .await
            .unwrap();
        wait_settled(&stack.store, job.id.unwrap()).await;
    }

    // The second run deleted the first revision before inserting.
    let chunks = stack.index.chunks();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].metadata["doc_id"], "7");
}

#[tokio::test]
async fn duplicate_chunk_keys_delete_the_previous_revision_once() {
    let index = Arc::new(CountingIndex::default());
    let (state, store, _db) =
        build_stack_with_index(vec![Arc::new(UploadFeature)], index.clone()).await;

    // Long enough to split into several chunks, all sharing one doc_id.
    let content = "one two three four five six seven eight nine ten. ".repeat(60);
    let request = JobRequest {
        datasource: "D1".to_string(),
        upload: Some(Arc::new(UploadedFile {
            filename: "big.txt".to_string(),
            content_type: Some("text/plain".to_string()),
            content: content.into_bytes(),
        })),
        ..JobRequest::default()
    };
    let (mut job, step) = state
        .features()
        .convert_to_job_and_first_step(&request)
        .unwrap()
        .unwrap();
    state
        .queue
        .queue_job_step(&mut job, step, None, true)
        .await
        .unwrap();
    wait_settled(&store, job.id.unwrap()).await;

    assert!(
        index.inner.chunks().len() > 1,
        "content must have produced several chunks"
    );
    assert_eq!(
        index.delete_calls.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "one delete per unique key within the indexing call"
    );
    assert_eq!(
        index.bulk_calls.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "chunks are inserted in one bulk call"
    );
}

#[tokio::test]
async fn resuming_a_finished_job_is_a_no_op() {
    let stack = build_stack(vec![Arc::new(UploadFeature)]).await;

    let request = JobRequest {
        datasource: "D1".to_string(),
        upload: Some(Arc::new(UploadedFile {
            filename: "note.txt".to_string(),
            content_type: Some("text/plain".to_string()),
            content: b"note".to_vec(),
        })),
        ..JobRequest::default()
    };
    let (mut job, step) = stack
        .state
        .features()
        .convert_to_job_and_first_step(&request)
        .unwrap()
        .unwrap();
    stack
        .state
        .queue
        .queue_job_step(&mut job, step, None, true)
        .await
        .unwrap();
    let job_id = job.id.unwrap();
    wait_settled(&stack.store, job_id).await;

    let before = job_steps(&stack.store, job_id).await;
    stack.state.queue.start_or_resume_job(job_id).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let after = job_steps(&stack.store, job_id).await;
    assert_eq!(before, after, "no new steps, no status changes");

    let step = stack.store.get_job_step(1).await.unwrap();
    assert_eq!(step.status, StepStatus::Done);
}
