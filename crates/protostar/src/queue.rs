//! Job queue orchestration.
//!
//! The [`JobQueue`] owns the worker pool, the job store and the feature
//! registry. External callers enqueue steps or start/resume jobs; workers
//! claim steps, dispatch them to the handler the accepting [`Feature`]
//! returns, and record the outcome. Handlers never see the queue directly:
//! they get a [`JobChain`], the capability surface for enqueueing further
//! steps, requesting deletion sync and triggering execution.
//!
//! Polling is batched: resuming a job submits one page of PENDING steps and,
//! only when the page was full, a [`PollMoreWork`] carrying the highest
//! display id seen, so a crawl can stage thousands of LOAD steps while
//! workers pull them in bounded batches.

use std::sync::{Arc, Mutex, Weak};

use anyhow::anyhow;
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::store::{
    ConnectionLoader, ConnectionRepository, GenericConnectionLoader, JobStore, StoreError,
};
use crate::workers::{DoWork, WorkerPool};
use crate::{
    Connection, DeleteDocBy, Job, JobRequest, JobStep, PollMoreWork, StepKind, StepStatus,
    StepWork, Work,
};

/// A handler able to execute one (job, step) pair. It may use the chain to
/// spawn other steps, which will further handle the task.
pub type Handler<C> = Arc<
    dyn Fn(Job, JobStep, Arc<C>, Option<Connection>) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// Produces the chain handed to handlers, one per invocation, so the
/// concrete chain is decoupled from the queue.
pub type ChainFactory<C> = Arc<dyn Fn(Arc<JobQueue<C>>) -> Arc<C> + Send + Sync>;

/// Capability surface passed to job handlers to perform further decoupled
/// actions. Implementations wire [`JobChain::job_queue`]; richer chains add
/// more action methods on top.
#[async_trait::async_trait]
pub trait JobChain: Send + Sync + Sized + 'static {
    fn job_queue(&self) -> &Arc<JobQueue<Self>>;

    /// Queues the specified step for execution and returns its store id.
    async fn queue_job_step(
        &self,
        job: &mut Job,
        step: JobStep,
        connection: Option<&Connection>,
        execute_now: bool,
    ) -> Result<i64, StoreError> {
        self.job_queue()
            .queue_job_step(job, step, connection, execute_now)
            .await
    }

    /// If configured in the job, creates and queues a SYNC_DELETIONS step
    /// scoped like the job. Returns the queued step id, or `None` if the job
    /// opted out of deletion sync.
    async fn queue_sync_deletions_if_configured(
        &self,
        job: &mut Job,
        connection: Option<&Connection>,
    ) -> Result<Option<i64>, StoreError> {
        if job.defaulted_sync_deletions() {
            let step = JobStep {
                job_id: job.id,
                doc_id: job.doc_id.clone(),
                doc_display_id: job.doc_display_id.clone(),
                ..JobStep::new(StepKind::SyncDeletions, job.datasource.clone())
            };
            let step_id = self.queue_job_step(job, step, connection, false).await?;
            Ok(Some(step_id))
        } else {
            Ok(None)
        }
    }

    /// Launches the execution of the pending steps of the specified job.
    async fn execute_job_steps(&self, job: &Job) -> Result<(), StoreError> {
        self.job_queue().execute_job_steps(job).await
    }
}

/// Plain chain without further capabilities.
pub struct BasicChain {
    queue: Arc<JobQueue<BasicChain>>,
}

impl BasicChain {
    pub fn new(queue: Arc<JobQueue<BasicChain>>) -> Self {
        Self { queue }
    }
}

#[async_trait::async_trait]
impl JobChain for BasicChain {
    fn job_queue(&self) -> &Arc<JobQueue<Self>> {
        &self.queue
    }
}

/// Binds one datasource to its job construction, handlers, deletion-key
/// strategy and connection loading.
pub trait Feature<C: JobChain>: Send + Sync {
    fn accept_job_request(&self, request: &JobRequest) -> bool;

    /// Turns the request into the corresponding unpersisted job. The default
    /// copies the common fields; features with domain-specific fields
    /// override it.
    fn create_job(&self, request: &JobRequest) -> Job {
        Job::from_request(request)
    }

    fn accept_job(&self, job: &Job) -> bool;

    /// The unpersisted first step of the job (CRAWL for API-backed sources,
    /// LOAD for uploads).
    fn create_first_job_step(&self, job: &Job) -> JobStep;

    /// A handler able to execute the step, or `None` when the step kind is
    /// not supported by this feature.
    fn handler(&self, job: &Job, step: &JobStep) -> Option<Handler<C>>;

    /// Which metadata field points at the indexed documents to delete before
    /// indexing a new revision of a document.
    fn delete_doc_by(&self, job: &Job, step: &JobStep) -> DeleteDocBy;

    /// A connection loader compatible with this feature. The generic record
    /// loader works for most; override for a more specific shape.
    fn connection_loader(
        &self,
        connection_id: i64,
        repository: Arc<dyn ConnectionRepository>,
    ) -> Box<dyn ConnectionLoader> {
        Box::new(GenericConnectionLoader::new(connection_id, repository))
    }
}

/// Ordered list of features; the first accepting feature wins.
pub struct FeatureRegistry<C: JobChain> {
    features: Vec<Arc<dyn Feature<C>>>,
}

impl<C: JobChain> FeatureRegistry<C> {
    pub fn new(features: Vec<Arc<dyn Feature<C>>>) -> Self {
        Self { features }
    }

    pub fn create_job(&self, request: &JobRequest) -> Option<Job> {
        self.features
            .iter()
            .find(|feature| feature.accept_job_request(request))
            .map(|feature| feature.create_job(request))
    }

    fn find_accepting_feature(&self, job: &Job) -> Option<&Arc<dyn Feature<C>>> {
        self.features.iter().find(|feature| feature.accept_job(job))
    }

    pub fn create_first_job_step(&self, job: &Job) -> Option<JobStep> {
        self.find_accepting_feature(job)
            .map(|feature| feature.create_first_job_step(job))
    }

    /// Tries to create an unpersisted job and its first step out of the
    /// request. Returns `None` when no feature supports the request.
    pub fn convert_to_job_and_first_step(
        &self,
        request: &JobRequest,
    ) -> anyhow::Result<Option<(Job, JobStep)>> {
        let Some(job) = self.create_job(request) else {
            return Ok(None);
        };
        // A feature accepting the request but producing no first step should
        // not normally happen.
        let step = self.create_first_job_step(&job).ok_or_else(|| {
            anyhow!(
                "unable to derive a first step for a {} job",
                job.datasource
            )
        })?;
        Ok(Some((job, step)))
    }

    pub fn handler(&self, job: &Job, step: &JobStep) -> Option<Handler<C>> {
        self.find_accepting_feature(job)
            .and_then(|feature| feature.handler(job, step))
    }

    /// The deletion-key strategy for the job/step, or `None` when no feature
    /// accepts the job.
    pub fn delete_doc_by(&self, job: &Job, step: &JobStep) -> Option<DeleteDocBy> {
        self.find_accepting_feature(job)
            .map(|feature| feature.delete_doc_by(job, step))
    }

    /// A connection configuration loader for the job, or `None` when the job
    /// has no connection or no feature accepts it.
    pub fn connection_loader(
        &self,
        job: &Job,
        repository: Arc<dyn ConnectionRepository>,
    ) -> Option<Box<dyn ConnectionLoader>> {
        let connection_id = job.connection_id?;
        self.find_accepting_feature(job)
            .map(|feature| feature.connection_loader(connection_id, repository))
    }
}

/// Configuration for the job queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of parallel workers executing steps.
    pub workers: usize,
    /// Amount of job steps a node will submit for execution at a time.
    pub batch_size: usize,
    /// Identity written to `executing_node` on claim.
    pub node_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 100,
            node_name: default_node_name(),
        }
    }
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "node-local".to_string())
}

/// The orchestrator: persists queued steps, submits work to the pool and
/// executes it (claim, dispatch, record outcome).
pub struct JobQueue<C: JobChain> {
    store: Arc<dyn JobStore>,
    features: Arc<FeatureRegistry<C>>,
    connections: Arc<dyn ConnectionRepository>,
    chain_factory: ChainFactory<C>,
    workers: Mutex<Option<WorkerPool>>,
    batch_size: usize,
    node_name: String,
}

impl<C: JobChain> JobQueue<C> {
    /// Creates the queue and spawns its worker pool. Must be called from a
    /// tokio runtime context.
    pub fn new(
        store: Arc<dyn JobStore>,
        features: Arc<FeatureRegistry<C>>,
        connections: Arc<dyn ConnectionRepository>,
        chain_factory: ChainFactory<C>,
        config: QueueConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<JobQueue<C>>| {
            let weak = weak.clone();
            let do_work: DoWork = Arc::new(move |work| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(queue) = weak.upgrade() {
                        queue.handle_work(work).await;
                    }
                })
            });
            JobQueue {
                store,
                features,
                connections,
                chain_factory,
                workers: Mutex::new(Some(WorkerPool::new(config.workers, do_work))),
                batch_size: config.batch_size.max(1),
                node_name: config.node_name,
            }
        })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn features(&self) -> &Arc<FeatureRegistry<C>> {
        &self.features
    }

    /// Persists the step (persisting the job first if new) and, when
    /// `execute_now`, submits it to the workers immediately. Never blocks on
    /// the handler. Returns the persisted step id.
    pub async fn queue_job_step(
        self: &Arc<Self>,
        job: &mut Job,
        mut step: JobStep,
        connection: Option<&Connection>,
        execute_now: bool,
    ) -> Result<i64, StoreError> {
        self.store.store_job_step(&mut step, Some(job)).await?;
        let step_id = step
            .id
            .ok_or_else(|| StoreError::Backend(anyhow!("store did not assign a job step id")))?;
        if execute_now {
            self.notify_job_step_work(job.clone(), step, connection.cloned());
        }
        Ok(step_id)
    }

    /// Notify the workers that the specified job step is to be handled.
    pub fn notify_job_step_work(&self, job: Job, step: JobStep, connection: Option<Connection>) {
        self.submit(Work::Step(StepWork {
            job,
            step,
            connection,
        }));
    }

    pub fn notify_poll_more_work(
        &self,
        job_id: i64,
        datasource: String,
        after_display_id: Option<String>,
    ) {
        self.submit(Work::PollMore(PollMoreWork {
            job_id,
            datasource,
            after_display_id,
        }));
    }

    fn submit(&self, work: Work) {
        let workers = self.workers.lock().expect("worker pool mutex poisoned");
        match workers.as_ref() {
            Some(pool) => pool.submit(work),
            None => warn!("job queue is shut down, dropping submitted work"),
        }
    }

    /// Worker entry point.
    pub async fn handle_work(self: &Arc<Self>, work: Work) {
        match work {
            Work::Step(work) => self.handle_job_step(work).await,
            Work::PollMore(work) => {
                if let Err(error) = self
                    .poll_more(work.job_id, &work.datasource, work.after_display_id.as_deref())
                    .await
                {
                    error!(job_id = work.job_id, %error, "error while polling more job steps");
                }
            }
        }
    }

    async fn handle_job_step(self: &Arc<Self>, work: StepWork) {
        let StepWork {
            job,
            mut step,
            connection,
        } = work;

        let Some(handler) = self.features.handler(&job, &step) else {
            warn!(step = %step, "unsupported job step, skipping");
            return;
        };

        // Only the claim winner executes; on conflict the work is abandoned.
        if !self.claim_job_step(&mut step).await {
            return;
        }
        let Some(step_id) = step.id else {
            return;
        };

        let chain = (self.chain_factory)(self.clone());
        match handler(job, step.clone(), chain, connection).await {
            Ok(()) => {
                if let Err(error) = self
                    .store
                    .set_job_step_status(step_id, StepStatus::Done, None, None)
                    .await
                {
                    error!(step = %step, %error, "failed to mark job step as done");
                }
            }
            Err(handler_error) => {
                error!(step = %step, error = ?handler_error, "error while handling job step");
                let details = format!("{handler_error:?}");
                if let Err(error) = self
                    .store
                    .set_job_step_status(step_id, StepStatus::Error, None, Some(&details))
                    .await
                {
                    error!(step = %step, %error, "failed to record job step failure");
                }
            }
        }
    }

    async fn claim_job_step(&self, step: &mut JobStep) -> bool {
        match self.store.claim_job_step(step, &self.node_name).await {
            Ok(()) => true,
            Err(StoreError::ClaimConflict { .. }) => {
                warn!(step = %step, "job step cannot be claimed anymore, skipping");
                false
            }
            Err(StoreError::ClaimTransport { .. }) => {
                error!(step = %step, "error while claiming job step, skipping");
                false
            }
            Err(error) => {
                error!(step = %step, %error, "error while claiming job step");
                false
            }
        }
    }

    /// Launches the execution of the pending steps of the specified job.
    pub async fn execute_job_steps(self: &Arc<Self>, job: &Job) -> Result<(), StoreError> {
        let job_id = job
            .id
            .ok_or_else(|| StoreError::Backend(anyhow!("cannot execute steps of an unpersisted job")))?;
        self.poll_more(job_id, &job.datasource, None).await
    }

    /// Batched resumption: submits one page of PENDING steps and, when the
    /// page was full, a poll-more work carrying the highest display id seen.
    pub async fn poll_more(
        self: &Arc<Self>,
        job_id: i64,
        datasource: &str,
        after_display_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let pending = self
            .store
            .get_pending_job_steps(job_id, self.batch_size, after_display_id)
            .await?;
        if pending.is_empty() {
            info!(job = job_id, datasource, "no more steps to poll");
            return Ok(());
        }

        debug!(
            count = pending.len(),
            job = job_id,
            datasource,
            "attempting to resume pending steps"
        );

        let job = self.store.get_job(job_id).await?;
        let connection = self.resolve_connection(&job).await?;

        let batch_len = pending.len();
        let mut max_display_id = pending[0].display_id.clone();
        for step in pending {
            if step.display_id > max_display_id {
                max_display_id = step.display_id.clone();
            }
            self.notify_job_step_work(job.clone(), step, connection.clone());
        }

        // A partial page means the job has no further pending steps right
        // now, so the next polling round is skipped.
        if batch_len >= self.batch_size {
            self.notify_poll_more_work(job_id, datasource.to_string(), max_display_id);
        }
        Ok(())
    }

    /// Starts the job by queueing its first step, or resumes it through
    /// batched polling when steps already exist.
    pub async fn start_or_resume_job(self: &Arc<Self>, job_id: i64) -> Result<(), StoreError> {
        let mut job = self.store.get_job(job_id).await?;
        if self.store.has_job_steps(job_id).await? {
            let datasource = job.datasource.clone();
            self.poll_more(job_id, &datasource, None).await
        } else {
            match self.features.create_first_job_step(&job) {
                Some(step) => {
                    let connection = self.resolve_connection(&job).await?;
                    self.queue_job_step(&mut job, step, connection.as_ref(), true)
                        .await?;
                    Ok(())
                }
                None => {
                    warn!(
                        job = job_id,
                        datasource = %job.datasource,
                        "ignoring job: unable to derive steps from it"
                    );
                    Ok(())
                }
            }
        }
    }

    /// Loads the job's connection configuration through the accepting
    /// feature's loader. `None` when the job has no connection or no
    /// feature accepts it.
    pub async fn resolve_connection(&self, job: &Job) -> Result<Option<Connection>, StoreError> {
        match self.features.connection_loader(job, self.connections.clone()) {
            Some(loader) => Ok(Some(loader.load().await?)),
            None => Ok(None),
        }
    }

    /// Drains the worker pool. Submitted work still in the queue completes;
    /// later submissions are dropped.
    pub async fn shutdown(&self) {
        let pool = {
            self.workers
                .lock()
                .expect("worker pool mutex poisoned")
                .take()
        };
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::sqlite::SqliteJobStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    /// Feature for a fictional datasource with a crawl fanning out one LOAD
    /// per artifact, recording every load execution.
    struct TestFeature {
        datasource: String,
        artifacts: Vec<String>,
        loads: Arc<Mutex<Vec<String>>>,
        load_calls: Arc<AtomicUsize>,
        fail_loads: bool,
    }

    impl TestFeature {
        fn new(datasource: &str, artifacts: &[&str]) -> Self {
            Self {
                datasource: datasource.to_string(),
                artifacts: artifacts.iter().map(|s| s.to_string()).collect(),
                loads: Arc::new(Mutex::new(Vec::new())),
                load_calls: Arc::new(AtomicUsize::new(0)),
                fail_loads: false,
            }
        }
    }

    impl Feature<BasicChain> for TestFeature {
        fn accept_job_request(&self, request: &JobRequest) -> bool {
            request.datasource == self.datasource
        }

        fn accept_job(&self, job: &Job) -> bool {
            job.datasource == self.datasource
        }

        fn create_first_job_step(&self, job: &Job) -> JobStep {
            JobStep {
                doc_id: job.doc_id.clone(),
                doc_display_id: job.doc_display_id.clone(),
                ..JobStep::new(StepKind::Crawl, job.datasource.clone())
            }
        }

        fn handler(&self, _job: &Job, step: &JobStep) -> Option<Handler<BasicChain>> {
            match step.kind {
                StepKind::Crawl => {
                    let artifacts = self.artifacts.clone();
                    Some(Arc::new(move |mut job, _step, chain, connection| {
                        let artifacts = artifacts.clone();
                        Box::pin(async move {
                            for artifact in &artifacts {
                                let step = JobStep {
                                    job_id: job.id,
                                    doc_id: Some(artifact.clone()),
                                    ..JobStep::new(StepKind::Load, job.datasource.clone())
                                };
                                chain
                                    .queue_job_step(&mut job, step, connection.as_ref(), false)
                                    .await?;
                            }
                            chain
                                .queue_sync_deletions_if_configured(&mut job, connection.as_ref())
                                .await?;
                            chain.execute_job_steps(&job).await?;
                            Ok(())
                        })
                    }))
                }
                StepKind::Load => {
                    let loads = self.loads.clone();
                    let calls = self.load_calls.clone();
                    let fail = self.fail_loads;
                    Some(Arc::new(move |_job, step, _chain, _connection| {
                        let loads = loads.clone();
                        let calls = calls.clone();
                        Box::pin(async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            if fail {
                                anyhow::bail!("load exploded");
                            }
                            if let Some(doc_id) = step.doc_id {
                                loads.lock().expect("loads poisoned").push(doc_id);
                            }
                            Ok(())
                        })
                    }))
                }
                StepKind::SyncDeletions => {
                    Some(Arc::new(|_job, _step, _chain, _connection| {
                        Box::pin(async { Ok(()) })
                    }))
                }
                StepKind::Delete => None,
            }
        }

        fn delete_doc_by(&self, _job: &Job, _step: &JobStep) -> DeleteDocBy {
            DeleteDocBy::ByDocId
        }
    }

    async fn open_store() -> (NamedTempFile, Arc<SqliteJobStore>) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(
            SqliteJobStore::open(tmp.path().to_str().unwrap())
                .await
                .unwrap(),
        );
        (tmp, store)
    }

    fn queue_with(
        store: Arc<SqliteJobStore>,
        feature: Arc<TestFeature>,
        batch_size: usize,
    ) -> Arc<JobQueue<BasicChain>> {
        let registry = Arc::new(FeatureRegistry::new(vec![
            feature as Arc<dyn Feature<BasicChain>>,
        ]));
        JobQueue::new(
            store.clone(),
            registry,
            store,
            Arc::new(|queue| Arc::new(BasicChain::new(queue))),
            QueueConfig {
                workers: 2,
                batch_size,
                node_name: "test-node".into(),
            },
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool, message: &str) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {message}");
    }

    async fn wait_for_status(store: &SqliteJobStore, step_id: i64, status: StepStatus) {
        for _ in 0..400 {
            if let Ok(step) = store.get_job_step(step_id).await {
                if step.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for step {step_id} to reach {status}");
    }

    #[tokio::test]
    async fn test_start_job_crawls_and_loads_artifacts() {
        let (_tmp, store) = open_store().await;
        let feature = Arc::new(TestFeature::new("KMS", &["A", "B"]));
        let loads = feature.loads.clone();
        let queue = queue_with(store.clone(), feature, 100);

        let mut job = Job {
            datasource: "KMS".into(),
            ..Job::default()
        };
        store.store_job(&mut job).await.unwrap();
        queue.start_or_resume_job(job.id.unwrap()).await.unwrap();

        wait_for(
            || loads.lock().unwrap().len() == 2,
            "both artifacts to load",
        )
        .await;
        // Give the final status writes a moment to land.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut loaded = loads.lock().unwrap().clone();
        loaded.sort();
        assert_eq!(loaded, vec!["A".to_string(), "B".to_string()]);

        // CRAWL done, both LOAD steps done, plus the defaulted SYNC_DELETIONS.
        let crawl = store.get_job_step(1).await.unwrap();
        assert_eq!(crawl.kind, StepKind::Crawl);
        assert_eq!(crawl.status, StepStatus::Done);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_crawl_with_zero_artifacts_still_queues_sync_deletions() {
        let (_tmp, store) = open_store().await;
        let feature = Arc::new(TestFeature::new("KMS", &[]));
        let load_calls = feature.load_calls.clone();
        let queue = queue_with(store.clone(), feature, 100);

        let mut job = Job {
            datasource: "KMS".into(),
            ..Job::default()
        };
        store.store_job(&mut job).await.unwrap();
        queue.start_or_resume_job(job.id.unwrap()).await.unwrap();

        // The crawl queues only the defaulted SYNC_DELETIONS step.
        wait_for_status(&store, 2, StepStatus::Done).await;

        assert_eq!(load_calls.load(Ordering::SeqCst), 0);
        let crawl = store.get_job_step(1).await.unwrap();
        assert_eq!(crawl.kind, StepKind::Crawl);
        assert_eq!(crawl.status, StepStatus::Done);
        let sync = store.get_job_step(2).await.unwrap();
        assert_eq!(sync.kind, StepKind::SyncDeletions);
        assert!(store.get_job_step(3).await.is_err());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_deletions_not_queued_when_disabled() {
        let (_tmp, store) = open_store().await;
        let feature = Arc::new(TestFeature::new("KMS", &[]));
        let queue = queue_with(store.clone(), feature, 100);

        let mut job = Job {
            datasource: "KMS".into(),
            sync_deletions: Some(false),
            ..Job::default()
        };
        store.store_job(&mut job).await.unwrap();
        queue.start_or_resume_job(job.id.unwrap()).await.unwrap();

        wait_for_status(&store, 1, StepStatus::Done).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(store.get_job_step(2).await.is_err());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_batched_resume_executes_every_pending_step_once() {
        let (_tmp, store) = open_store().await;
        let feature = Arc::new(TestFeature::new("KMS", &[]));
        let load_calls = feature.load_calls.clone();
        let loads = feature.loads.clone();
        // Batch of 2 over 3 staged steps forces one poll-more round.
        let queue = queue_with(store.clone(), feature, 2);

        let mut job = Job {
            datasource: "KMS".into(),
            sync_deletions: Some(false),
            ..Job::default()
        };
        store.store_job(&mut job).await.unwrap();
        for doc in ["001-doc", "002-doc", "003-doc"] {
            let mut step = JobStep {
                job_id: job.id,
                doc_id: Some(doc.into()),
                ..JobStep::new(StepKind::Load, "KMS")
            };
            store.store_job_step(&mut step, None).await.unwrap();
        }

        queue.start_or_resume_job(job.id.unwrap()).await.unwrap();

        wait_for(
            || load_calls.load(Ordering::SeqCst) == 3,
            "all staged loads to execute",
        )
        .await;
        // No further executions after the last partial batch.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(load_calls.load(Ordering::SeqCst), 3);
        let mut loaded = loads.lock().unwrap().clone();
        loaded.sort();
        assert_eq!(loaded, vec!["001-doc", "002-doc", "003-doc"]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_competing_submissions_execute_step_once() {
        let (_tmp, store) = open_store().await;
        let feature = Arc::new(TestFeature::new("KMS", &[]));
        let load_calls = feature.load_calls.clone();
        let queue = queue_with(store.clone(), feature, 100);

        let mut job = Job {
            datasource: "KMS".into(),
            ..Job::default()
        };
        let mut step = JobStep {
            doc_id: Some("A".into()),
            ..JobStep::new(StepKind::Load, "KMS")
        };
        store
            .store_job_step(&mut step, Some(&mut job))
            .await
            .unwrap();

        // Two workers observing the same pending step.
        queue.notify_job_step_work(job.clone(), step.clone(), None);
        queue.notify_job_step_work(job.clone(), step.clone(), None);

        wait_for_status(&store, step.id.unwrap(), StepStatus::Done).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(load_calls.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_failure_marks_step_error_with_details() {
        let (_tmp, store) = open_store().await;
        let mut feature = TestFeature::new("KMS", &[]);
        feature.fail_loads = true;
        let queue = queue_with(store.clone(), Arc::new(feature), 100);

        let mut job = Job {
            datasource: "KMS".into(),
            ..Job::default()
        };
        let mut step = JobStep {
            doc_id: Some("A".into()),
            ..JobStep::new(StepKind::Load, "KMS")
        };
        store
            .store_job_step(&mut step, Some(&mut job))
            .await
            .unwrap();
        queue.notify_job_step_work(job.clone(), step.clone(), None);

        let step_id = step.id.unwrap();
        wait_for_status(&store, step_id, StepStatus::Error).await;

        let failed = store.get_job_step(step_id).await.unwrap();
        assert!(failed
            .error_details
            .as_deref()
            .unwrap_or_default()
            .contains("load exploded"));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsupported_step_is_dropped_and_stays_pending() {
        let (_tmp, store) = open_store().await;
        let feature = Arc::new(TestFeature::new("KMS", &[]));
        let queue = queue_with(store.clone(), feature, 100);

        let mut job = Job {
            datasource: "KMS".into(),
            ..Job::default()
        };
        // TestFeature has no DELETE handler.
        let mut step = JobStep::new(StepKind::Delete, "KMS");
        store
            .store_job_step(&mut step, Some(&mut job))
            .await
            .unwrap();
        queue.notify_job_step_work(job.clone(), step.clone(), None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let untouched = store.get_job_step(step.id.unwrap()).await.unwrap();
        assert_eq!(untouched.status, StepStatus::Pending);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsupported_job_request_yields_no_job() {
        let feature = Arc::new(TestFeature::new("KMS", &[]));
        let registry =
            FeatureRegistry::new(vec![feature as Arc<dyn Feature<BasicChain>>]);
        let request = JobRequest {
            datasource: "UNKNOWN".into(),
            ..JobRequest::default()
        };
        assert!(registry.create_job(&request).is_none());
        assert!(registry
            .convert_to_job_and_first_step(&request)
            .unwrap()
            .is_none());
    }
}
