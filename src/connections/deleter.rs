//! Deletion reconciliation between a source system and the index.
//!
//! The reconciler assumes it is reasonable to list the keys of all the
//! published source documents; the indexed side streams through a paged
//! scroll and is never materialized.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::TryStreamExt;
use protostar::{Connection, DeleteDocBy, Job, JobChain, JobStep, StepKind};
use tracing::info;

use crate::index::DocRef;
use crate::indexing::IndexingChain;

/// Synchronizes deletions from one source into the index: documents indexed
/// for the job's scope but no longer published at the source get a DELETE
/// step each.
#[async_trait]
pub trait Deleter: Send + Sync {
    /// Label used in logs, e.g. "KMS article".
    fn source_document_label(&self) -> &str {
        "source document"
    }

    /// The key kind this integration deletes by.
    fn delete_doc_by(&self) -> DeleteDocBy;

    /// The keys of all the published/indexable documents currently available
    /// in the source, in the key kind returned by [`Self::delete_doc_by`].
    async fn source_published_keys(
        &self,
        job: &Job,
        step: &JobStep,
        connection: Option<&Connection>,
    ) -> anyhow::Result<HashSet<String>>;

    /// Enqueues deletions of indexed documents which have been unpublished
    /// or deleted in the source system, then drains the queued DELETE steps.
    async fn sync_deletions(
        &self,
        job: &mut Job,
        step: &JobStep,
        chain: &IndexingChain,
        connection: Option<&Connection>,
    ) -> anyhow::Result<()> {
        let source_keys = self.source_published_keys(job, step, connection).await?;
        let delete_doc_by = self.delete_doc_by();
        let (key_field, job_key_value) =
            delete_doc_by.pick_key_for_delete(step.doc_id.as_deref(), step.doc_display_id.as_deref());

        // The indexed entries adequate for the scope of the job.
        let mut entries = chain.index().scroll_doc_refs(
            job.datasource.clone(),
            job_key_value.as_ref().map(|_| key_field.to_string()),
            job_key_value.clone(),
        );

        let mut already_scheduled: HashSet<String> = HashSet::new();
        while let Some(entry) = entries.try_next().await? {
            if !matches_job_doc_ids(&entry, job) {
                continue;
            }
            let key = match delete_doc_by {
                DeleteDocBy::ByDocId => entry.doc_id,
                DeleteDocBy::ByDocDisplayId => entry.doc_display_id,
            };
            let Some(key) = key else { continue };
            if already_scheduled.contains(&key) || source_keys.contains(&key) {
                continue;
            }

            // A source document we were unaware of went missing: spawn a
            // DELETE step for it.
            info!(
                document = self.source_document_label(),
                key = %key,
                "scheduling a DELETE job step"
            );
            let delete_step = JobStep {
                job_id: job.id,
                doc_id: matches!(delete_doc_by, DeleteDocBy::ByDocId).then(|| key.clone()),
                doc_display_id: matches!(delete_doc_by, DeleteDocBy::ByDocDisplayId)
                    .then(|| key.clone()),
                ..JobStep::new(StepKind::Delete, job.datasource.clone())
            };
            chain.queue_job_step(job, delete_step, connection, false).await?;
            already_scheduled.insert(key);
        }

        chain.execute_job_steps(job).await?;
        Ok(())
    }

    /// Deletes the indexed document specified by the passed DELETE step.
    async fn delete_indexed_document(
        &self,
        job: &Job,
        step: &JobStep,
        chain: &IndexingChain,
        connection: Option<&Connection>,
    ) -> anyhow::Result<()> {
        let delete_doc_by = self.delete_doc_by();
        let (key_field, key_value) =
            delete_doc_by.pick_key_for_delete(step.doc_id.as_deref(), step.doc_display_id.as_deref());

        info!(
            document = self.source_document_label(),
            field = key_field,
            value = ?key_value,
            "deleting indexed document"
        );
        let key_value = key_value.ok_or_else(|| {
            anyhow::anyhow!(
                "unable to determine the index property value to delete documents by ({key_field})"
            )
        })?;

        chain
            .delete_document(
                &job.datasource,
                key_field,
                &key_value,
                connection.map(|connection| connection.id),
            )
            .await
    }
}

/// Whether the indexed entry falls inside the job's narrowing: by doc id if
/// the job has one, else by display id if the job has one, else always.
pub(crate) fn matches_job_doc_ids(entry: &DocRef, job: &Job) -> bool {
    if let Some(doc_id) = &job.doc_id {
        return entry.doc_id.as_ref() == Some(doc_id);
    }
    if let Some(doc_display_id) = &job.doc_display_id {
        return entry.doc_display_id.as_ref() == Some(doc_display_id);
    }
    true
}
