//! The write service: wraps the operation handlers with telemetry and
//! capacity-unit accounting, drives the put/remove batch, and owns the
//! duplication and bulk-ingest entry points.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;

use urd_storage::keys::restore_raw_key;
use urd_storage::timetag::generate_timetag;
use urd_storage::{DbError, ReplicaStore};
use urd_types::rpc::{
    CheckAndMutateRequest, CheckAndMutateResponse, CheckAndSetRequest, CheckAndSetResponse,
    DuplicateRequest, DuplicateResponse, IncrRequest, IncrResponse, IngestionRequest,
    IngestionResponse, MultiPutRequest, MultiRemoveRequest, MultiRemoveResponse, PutRequest,
    RemoveRequest, RpcCode, UpdateResponse, WriteRequest, WriteResponse,
};
use urd_types::{cluster, status, Decree, IngestStatus, WriteContext};

use crate::capacity::CapacityUnitCalculator;
use crate::ingestion::{self, IngestionPool};
use crate::metrics::{DupLagGuard, WriteMetrics};
use crate::server_write::ReplicaOptions;
use crate::write_impl::WriteImpl;

/// Which per-op counters a batched write fires when the batch resolves.
enum BatchOpKind {
    Put,
    Remove,
}

pub struct WriteService {
    inner: WriteImpl,
    metrics: Arc<WriteMetrics>,
    cu_calculator: CapacityUnitCalculator,
    primary: Arc<AtomicBool>,

    batch_start: Option<Instant>,
    batch_ops: Vec<BatchOpKind>,

    dup_lagging_write_threshold_ms: u64,
    bulk_load_dir: PathBuf,
    verbose_log: bool,

    ingest_status: Arc<AtomicU32>,
    ingestion_pool: IngestionPool,
}

impl WriteService {
    pub fn new(store: Arc<ReplicaStore>, options: &ReplicaOptions) -> anyhow::Result<Self> {
        let metrics = WriteMetrics::new(options.replica);
        let cu_calculator = CapacityUnitCalculator::new(
            Arc::clone(&metrics),
            options.read_capacity_unit_size,
            options.write_capacity_unit_size,
        );
        Ok(WriteService {
            inner: WriteImpl::new(
                store,
                options.replica,
                options.primary_address.clone(),
                options.data_version,
            ),
            metrics,
            cu_calculator,
            primary: Arc::new(AtomicBool::new(false)),
            batch_start: None,
            batch_ops: Vec::new(),
            dup_lagging_write_threshold_ms: options.dup_lagging_write_threshold_ms,
            bulk_load_dir: options.bulk_load_dir.clone(),
            verbose_log: options.verbose_log,
            ingest_status: Arc::new(AtomicU32::new(IngestStatus::NotRunning as u32)),
            ingestion_pool: IngestionPool::new()?,
        })
    }

    pub fn metrics(&self) -> &Arc<WriteMetrics> {
        &self.metrics
    }

    /// The shared engine handle, e.g. for the read path of the embedding
    /// server.
    pub fn store(&self) -> &Arc<ReplicaStore> {
        self.inner.store()
    }

    /// Replica role, flipped by the replication layer. Capacity units are
    /// only accounted on the primary.
    pub fn primary_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.primary)
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Relaxed)
    }

    pub fn set_default_ttl(&self, ttl_sec: u32) {
        self.inner.set_default_ttl(ttl_sec);
    }

    pub fn default_ttl_handle(&self) -> Arc<AtomicU32> {
        self.inner.default_ttl_handle()
    }

    pub fn ingest_status(&self) -> IngestStatus {
        IngestStatus::from_u32(self.ingest_status.load(Ordering::Relaxed))
    }

    pub(crate) fn inner(&self) -> &WriteImpl {
        &self.inner
    }

    pub fn empty_put(&mut self, decree: Decree) -> Result<(), DbError> {
        self.inner.empty_put(decree)
    }

    // -- single-request handlers with telemetry ------------------------------

    pub fn multi_put(
        &mut self,
        ctx: &WriteContext,
        update: &MultiPutRequest,
        resp: &mut UpdateResponse,
    ) -> Result<(), DbError> {
        let start = Instant::now();
        self.metrics.multi_put.incr_qps();
        let r = self.inner.multi_put(ctx, update, resp);
        if self.is_primary() {
            self.cu_calculator.add_multi_put_cu(resp.error, &update.hash_key, &update.kvs);
        }
        self.metrics.multi_put.latency.record(start.elapsed().as_micros() as u64);
        r
    }

    pub fn multi_remove(
        &mut self,
        decree: Decree,
        update: &MultiRemoveRequest,
        resp: &mut MultiRemoveResponse,
    ) -> Result<(), DbError> {
        let start = Instant::now();
        self.metrics.multi_remove.incr_qps();
        let r = self.inner.multi_remove(decree, update, resp);
        if self.is_primary() {
            self.cu_calculator.add_multi_remove_cu(resp.error, &update.hash_key, &update.sort_keys);
        }
        self.metrics.multi_remove.latency.record(start.elapsed().as_micros() as u64);
        r
    }

    pub fn incr(
        &mut self,
        decree: Decree,
        update: &IncrRequest,
        resp: &mut IncrResponse,
    ) -> Result<(), DbError> {
        let start = Instant::now();
        self.metrics.incr.incr_qps();
        let r = self.inner.incr(decree, update, resp);
        if self.is_primary() {
            self.cu_calculator.add_incr_cu(resp.error, &update.key);
        }
        self.metrics.incr.latency.record(start.elapsed().as_micros() as u64);
        r
    }

    pub fn check_and_set(
        &mut self,
        decree: Decree,
        update: &CheckAndSetRequest,
        resp: &mut CheckAndSetResponse,
    ) -> Result<(), DbError> {
        let start = Instant::now();
        self.metrics.check_and_set.incr_qps();
        let r = self.inner.check_and_set(decree, update, resp);
        if self.is_primary() {
            self.cu_calculator.add_check_and_set_cu(
                resp.error,
                &update.hash_key,
                &update.check_sort_key,
                &update.set_sort_key,
                &update.set_value,
            );
        }
        self.metrics.check_and_set.latency.record(start.elapsed().as_micros() as u64);
        r
    }

    pub fn check_and_mutate(
        &mut self,
        decree: Decree,
        update: &CheckAndMutateRequest,
        resp: &mut CheckAndMutateResponse,
    ) -> Result<(), DbError> {
        let start = Instant::now();
        self.metrics.check_and_mutate.incr_qps();
        let r = self.inner.check_and_mutate(decree, update, resp);
        if self.is_primary() {
            self.cu_calculator.add_check_and_mutate_cu(
                resp.error,
                &update.hash_key,
                &update.check_sort_key,
                &update.mutate_list,
            );
        }
        self.metrics.check_and_mutate.latency.record(start.elapsed().as_micros() as u64);
        r
    }

    // -- batch driver --------------------------------------------------------

    pub fn batch_prepare(&mut self, _decree: Decree) {
        debug_assert!(
            self.batch_start.is_none(),
            "batch_prepare and batch_commit/batch_abort must be called in pair"
        );
        self.batch_start = Some(Instant::now());
    }

    pub fn batch_put(
        &mut self,
        ctx: &WriteContext,
        update: &PutRequest,
    ) -> Result<(), DbError> {
        debug_assert!(self.batch_start.is_some(), "batch_put must follow batch_prepare");
        self.batch_ops.push(BatchOpKind::Put);
        let r = self.inner.batch_put(ctx, update);
        if self.is_primary() {
            let status = r.as_ref().err().map_or(status::OK, DbError::code);
            self.cu_calculator.add_put_cu(status, &update.key, &update.value);
        }
        r
    }

    pub fn batch_remove(&mut self, decree: Decree, update: &RemoveRequest) -> Result<(), DbError> {
        debug_assert!(self.batch_start.is_some(), "batch_remove must follow batch_prepare");
        self.batch_ops.push(BatchOpKind::Remove);
        let r = self.inner.batch_remove(decree, &update.key);
        if self.is_primary() {
            let status = r.as_ref().err().map_or(status::OK, DbError::code);
            self.cu_calculator.add_remove_cu(status, &update.key);
        }
        r
    }

    pub fn batch_commit(&mut self, decree: Decree) -> (Result<(), DbError>, Vec<UpdateResponse>) {
        debug_assert!(self.batch_start.is_some(), "batch_commit must follow batch_prepare");
        let result = self.inner.batch_commit(decree);
        self.clear_up_batch_states();
        result
    }

    pub fn batch_abort(&mut self, decree: Decree, err: i32) -> Vec<UpdateResponse> {
        debug_assert!(self.batch_start.is_some(), "batch_abort must follow batch_prepare");
        let responses = self.inner.batch_abort(decree, err);
        self.clear_up_batch_states();
        responses
    }

    /// Fire the per-op counters registered by this batch and reset driver
    /// state. Runs on both the commit and the abort path.
    fn clear_up_batch_states(&mut self) {
        let latency_us = self
            .batch_start
            .take()
            .map(|start| start.elapsed().as_micros() as u64)
            .unwrap_or_default();
        for op in self.batch_ops.drain(..) {
            let metrics = match op {
                BatchOpKind::Put => &self.metrics.put,
                BatchOpKind::Remove => &self.metrics.remove,
            };
            metrics.incr_qps();
            metrics.latency.record(latency_us);
        }
    }

    /// Apply a finalized batch of single puts/removes as one commit. Any
    /// other opcode in the batch is a programmer error upstream and panics.
    pub fn on_batched_writes(
        &mut self,
        ctx: &WriteContext,
        requests: &[WriteRequest],
    ) -> (i32, Vec<WriteResponse>) {
        self.batch_prepare(ctx.decree);

        let mut first_err: Option<DbError> = None;
        for request in requests {
            let local = match request {
                WriteRequest::Put(update) => {
                    self.request_key_check(ctx.decree, RpcCode::Put, &update.key);
                    self.batch_put(ctx, update)
                }
                WriteRequest::Remove(update) => {
                    self.request_key_check(ctx.decree, RpcCode::Remove, &update.key);
                    self.batch_remove(ctx.decree, update)
                }
                other => panic!("rpc code {:?} not allowed in a batched write", other.code()),
            };
            if first_err.is_none() {
                first_err = local.err();
            }
        }

        let (code, responses) = match first_err {
            None => {
                let (r, responses) = self.batch_commit(ctx.decree);
                (r.map_or_else(|e| e.code(), |()| status::OK), responses)
            }
            Some(e) => {
                let responses = self.batch_abort(ctx.decree, e.code());
                (e.code(), responses)
            }
        };
        (code, responses.into_iter().map(WriteResponse::Update).collect())
    }

    fn request_key_check(&self, decree: Decree, code: RpcCode, key: &[u8]) {
        if !self.verbose_log {
            return;
        }
        if let Some((hash_key, sort_key)) = restore_raw_key(key) {
            tracing::debug!(
                decree,
                ?code,
                hash_key = %String::from_utf8_lossy(hash_key),
                sort_key = %String::from_utf8_lossy(sort_key),
                "write"
            );
        }
    }

    // -- duplicate -----------------------------------------------------------

    /// Apply a write replayed from another cluster.
    pub fn duplicate(
        &mut self,
        decree: Decree,
        request: &DuplicateRequest,
        resp: &mut DuplicateResponse,
    ) -> Result<(), DbError> {
        if !cluster::is_cluster_id_configured(request.cluster_id) {
            resp.error = status::INVALID_ARGUMENT;
            resp.error_hint = "request cluster id is unconfigured".to_string();
            return self.inner.empty_put(decree);
        }
        if request.cluster_id == cluster::local_cluster_id() {
            resp.error = status::INVALID_ARGUMENT;
            resp.error_hint = "self-duplicating".to_string();
            return self.inner.empty_put(decree);
        }

        self.metrics.duplicate_qps.fetch_add(1, Ordering::Relaxed);
        let _lag = DupLagGuard::new(
            Arc::clone(&self.metrics),
            request.timestamp,
            self.dup_lagging_write_threshold_ms,
        );

        let is_delete = matches!(request.task_code, RpcCode::Remove | RpcCode::MultiRemove);
        let remote_timetag = generate_timetag(request.timestamp, request.cluster_id, is_delete);
        let ctx = WriteContext::duplicate(decree, remote_timetag, request.verify_timetag);

        match request.task_code {
            RpcCode::MultiPut => {
                let Some(update) = decode_raw::<MultiPutRequest>(&request.raw_message) else {
                    return self.malformed_duplicate(decree, resp);
                };
                let mut update_resp = UpdateResponse::default();
                let r = self.inner.multi_put(&ctx, &update, &mut update_resp);
                resp.error = r.as_ref().err().map_or(status::OK, DbError::code);
                r
            }
            RpcCode::MultiRemove => {
                let Some(update) = decode_raw::<MultiRemoveRequest>(&request.raw_message) else {
                    return self.malformed_duplicate(decree, resp);
                };
                let mut remove_resp = MultiRemoveResponse::default();
                let r = self.inner.multi_remove(ctx.decree, &update, &mut remove_resp);
                resp.error = r.as_ref().err().map_or(status::OK, DbError::code);
                r
            }
            RpcCode::Put => {
                let Some(update) = decode_raw::<PutRequest>(&request.raw_message) else {
                    return self.malformed_duplicate(decree, resp);
                };
                let r = match self.inner.batch_put(&ctx, &update) {
                    Ok(()) => self.inner.batch_commit(ctx.decree).0,
                    Err(e) => {
                        self.inner.batch_abort(ctx.decree, e.code());
                        Err(e)
                    }
                };
                resp.error = r.as_ref().err().map_or(status::OK, DbError::code);
                r
            }
            RpcCode::Remove => {
                let Some(update) = decode_raw::<RemoveRequest>(&request.raw_message) else {
                    return self.malformed_duplicate(decree, resp);
                };
                let r = match self.inner.batch_remove(ctx.decree, &update.key) {
                    Ok(()) => self.inner.batch_commit(ctx.decree).0,
                    Err(e) => {
                        self.inner.batch_abort(ctx.decree, e.code());
                        Err(e)
                    }
                };
                resp.error = r.as_ref().err().map_or(status::OK, DbError::code);
                r
            }
            other => {
                resp.error = status::INVALID_ARGUMENT;
                resp.error_hint = format!("unrecognized task code {other:?}");
                self.inner.empty_put(ctx.decree)
            }
        }
    }

    fn malformed_duplicate(
        &mut self,
        decree: Decree,
        resp: &mut DuplicateResponse,
    ) -> Result<(), DbError> {
        resp.error = status::INVALID_ARGUMENT;
        resp.error_hint = "malformed raw message".to_string();
        self.inner.empty_put(decree)
    }

    // -- bulk ingest ---------------------------------------------------------

    /// Commit the ingest barrier synchronously, then verify and ingest the
    /// files on the `ingestion` pool. Progress is observable through
    /// [`WriteService::ingest_status`].
    pub fn ingestion_files(
        &mut self,
        decree: Decree,
        request: &IngestionRequest,
        resp: &mut IngestionResponse,
    ) -> Result<(), DbError> {
        resp.err = status::OK;
        // An empty put pins the ingest to a well-defined commit barrier.
        if let Err(e) = self.inner.empty_put(decree) {
            resp.rocksdb_error = e.code();
            resp.err = status::TRY_AGAIN;
            return Err(e);
        }
        resp.rocksdb_error = status::OK;

        self.ingest_status.store(IngestStatus::Running as u32, Ordering::Relaxed);
        let store = Arc::clone(self.inner.store());
        let bulk_load_dir = self.bulk_load_dir.clone();
        let files = request.files.clone();
        let ingest_status = Arc::clone(&self.ingest_status);
        let replica = self.inner.replica();
        self.ingestion_pool.execute(move || {
            match ingestion::verify_and_ingest(&store, &bulk_load_dir, &files) {
                Ok(()) => {
                    tracing::info!(%replica, decree, "bulk ingest succeeded");
                    ingest_status.store(IngestStatus::Succeeded as u32, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!(%replica, decree, error = %e, "bulk ingest failed");
                    ingest_status.store(IngestStatus::Failed as u32, Ordering::Relaxed);
                }
            }
        });
        Ok(())
    }
}

fn decode_raw<T: DeserializeOwned>(raw: &[u8]) -> Option<T> {
    bincode::serde::decode_from_slice(raw, bincode::config::standard()).map(|(v, _)| v).ok()
}

/// Encode a request into the duplication `raw_message` form.
pub fn encode_raw<T: serde::Serialize>(request: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(request, bincode::config::standard())
        .expect("request serialization is infallible")
}
