//! Top-level write dispatcher, invoked by the replication layer with one
//! finalized `(decree, timestamp, requests)` tuple at a time, in strict
//! decree order, on the replica's apply thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::Arc;

use urd_storage::{DbError, ReplicaStore};
use urd_types::rpc::{
    CheckAndMutateResponse, CheckAndSetResponse, DuplicateResponse, IncrResponse,
    IngestionResponse, MultiRemoveResponse, UpdateResponse, WriteRequest, WriteResponse,
};
use urd_types::{Decree, IngestStatus, ReplicaId, WriteContext};

use crate::config::Settings;
use crate::write_service::WriteService;

/// Startup parameters of one replica's write path.
#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    pub replica: ReplicaId,
    /// Address of this server, echoed in every response.
    pub primary_address: String,
    pub data_version: u8,
    pub bulk_load_dir: PathBuf,
    pub dup_lagging_write_threshold_ms: u64,
    pub read_capacity_unit_size: u64,
    pub write_capacity_unit_size: u64,
    pub verbose_log: bool,
}

impl ReplicaOptions {
    pub fn from_settings(replica: ReplicaId, primary_address: String, settings: &Settings) -> Self {
        ReplicaOptions {
            replica,
            primary_address,
            data_version: settings.server.data_version,
            bulk_load_dir: settings.server.bulk_load_dir.clone(),
            dup_lagging_write_threshold_ms: settings.server.dup_lagging_write_threshold_ms,
            read_capacity_unit_size: settings.capacity.read_capacity_unit_size,
            write_capacity_unit_size: settings.capacity.write_capacity_unit_size,
            verbose_log: settings.server.verbose_log,
        }
    }
}

pub struct ServerWrite {
    write_svc: WriteService,
}

impl ServerWrite {
    pub fn new(store: Arc<ReplicaStore>, options: &ReplicaOptions) -> anyhow::Result<Self> {
        Ok(ServerWrite { write_svc: WriteService::new(store, options)? })
    }

    /// Apply one decree. The return code goes back to the replication layer
    /// verbatim: non-zero means this replica failed to apply a committed
    /// write and will be removed from the group. User-input errors are not
    /// that; they are reported in the per-request response while an empty
    /// put advances the decree and the dispatcher returns 0.
    pub fn on_batched_write_requests(
        &mut self,
        requests: &[WriteRequest],
        decree: Decree,
        timestamp_us: u64,
    ) -> (i32, Vec<WriteResponse>) {
        let ctx = WriteContext::local(decree, timestamp_us);

        // An empty batch still commits, so the engine's flushed-decree
        // bookkeeping advances on no-op decrees.
        if requests.is_empty() {
            return (result_code(self.write_svc.empty_put(decree)), Vec::new());
        }

        if requests.len() == 1 {
            match &requests[0] {
                WriteRequest::MultiPut(update) => {
                    let mut resp = UpdateResponse::default();
                    let code = result_code(self.write_svc.multi_put(&ctx, update, &mut resp));
                    return (code, vec![WriteResponse::Update(resp)]);
                }
                WriteRequest::MultiRemove(update) => {
                    let mut resp = MultiRemoveResponse::default();
                    let code = result_code(self.write_svc.multi_remove(decree, update, &mut resp));
                    return (code, vec![WriteResponse::MultiRemove(resp)]);
                }
                WriteRequest::Incr(update) => {
                    let mut resp = IncrResponse::default();
                    let code = result_code(self.write_svc.incr(decree, update, &mut resp));
                    return (code, vec![WriteResponse::Incr(resp)]);
                }
                WriteRequest::CheckAndSet(update) => {
                    let mut resp = CheckAndSetResponse::default();
                    let code = result_code(self.write_svc.check_and_set(decree, update, &mut resp));
                    return (code, vec![WriteResponse::CheckAndSet(resp)]);
                }
                WriteRequest::CheckAndMutate(update) => {
                    let mut resp = CheckAndMutateResponse::default();
                    let code =
                        result_code(self.write_svc.check_and_mutate(decree, update, &mut resp));
                    return (code, vec![WriteResponse::CheckAndMutate(resp)]);
                }
                WriteRequest::Duplicate(request) => {
                    let mut resp = DuplicateResponse::default();
                    let code = result_code(self.write_svc.duplicate(decree, request, &mut resp));
                    return (code, vec![WriteResponse::Duplicate(resp)]);
                }
                WriteRequest::BulkLoad(request) => {
                    let mut resp = IngestionResponse::default();
                    let code =
                        result_code(self.write_svc.ingestion_files(decree, request, &mut resp));
                    return (code, vec![WriteResponse::Ingestion(resp)]);
                }
                // Single puts and removes go through the batch driver.
                WriteRequest::Put(_) | WriteRequest::Remove(_) => {}
            }
        }

        self.write_svc.on_batched_writes(&ctx, requests)
    }

    pub fn set_default_ttl(&self, ttl_sec: u32) {
        self.write_svc.set_default_ttl(ttl_sec);
    }

    pub fn default_ttl_handle(&self) -> Arc<AtomicU32> {
        self.write_svc.default_ttl_handle()
    }

    pub fn primary_handle(&self) -> Arc<AtomicBool> {
        self.write_svc.primary_handle()
    }

    pub fn ingest_status(&self) -> IngestStatus {
        self.write_svc.ingest_status()
    }

    pub fn write_svc(&self) -> &WriteService {
        &self.write_svc
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        self.write_svc.store()
    }
}

fn result_code(r: Result<(), DbError>) -> i32 {
    match r {
        Ok(()) => urd_types::status::OK,
        Err(e) => e.code(),
    }
}
