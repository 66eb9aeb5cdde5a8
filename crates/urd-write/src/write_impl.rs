//! Operation handler semantics.
//!
//! Every handler here composes wrapper operations into one atomic engine
//! commit for its decree and fills the response, including on failure. The
//! contract with the dispatcher: an `Err` is replica-fatal; user-input
//! problems land in the response `error` field while the handler commits an
//! empty put and returns `Ok`, so the decree advances either way.

use std::sync::Arc;

use urd_storage::keys::compose_raw_key;
use urd_storage::value;
use urd_storage::{DbError, FjallWrapper, ReplicaStore};
use urd_types::rpc::{
    CasCheckType, CheckAndMutateRequest, CheckAndMutateResponse, CheckAndSetRequest,
    CheckAndSetResponse, IncrRequest, IncrResponse, MultiPutRequest, MultiRemoveRequest,
    MultiRemoveResponse, Mutate, MutateOperation, PutRequest, UpdateResponse,
};
use urd_types::{status, Decree, ReplicaId, WriteContext};

/// Stamp the identity fields every response carries, success or failure.
macro_rules! init_response {
    ($self:ident, $resp:expr, $decree:expr) => {{
        $resp.error = status::OK;
        $resp.app_id = $self.replica.app_id;
        $resp.partition_index = $self.replica.partition_index;
        $resp.decree = $decree;
        $resp.server = $self.primary_address.clone();
    }};
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok().and_then(|s| s.parse::<i64>().ok())
}

pub struct WriteImpl {
    replica: ReplicaId,
    primary_address: String,
    wrapper: FjallWrapper,
    /// Responses of in-flight batched puts/removes, drained on
    /// commit/abort so their errors can be overwritten as one.
    update_responses: Vec<UpdateResponse>,
}

impl WriteImpl {
    pub fn new(
        store: Arc<ReplicaStore>,
        replica: ReplicaId,
        primary_address: String,
        data_version: u8,
    ) -> Self {
        WriteImpl {
            replica,
            primary_address,
            wrapper: FjallWrapper::new(store, data_version),
            update_responses: Vec::new(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        self.wrapper.store()
    }

    pub fn set_default_ttl(&self, ttl_sec: u32) {
        self.wrapper.set_default_ttl(ttl_sec);
    }

    pub fn default_ttl_handle(&self) -> Arc<std::sync::atomic::AtomicU32> {
        self.wrapper.default_ttl_handle()
    }

    /// Batch-state invariants checked by tests: both must read zero/empty
    /// after every dispatched write.
    pub fn batch_len(&self) -> usize {
        self.wrapper.batch_len()
    }

    pub fn pending_response_count(&self) -> usize {
        self.update_responses.len()
    }

    /// Commit a `(key="", value="")` record so the engine's flushed-decree
    /// bookkeeping advances without touching user data.
    pub fn empty_put(&mut self, decree: Decree) -> Result<(), DbError> {
        let r = self
            .wrapper
            .write_batch_put(decree, b"", b"", 0)
            .and_then(|()| self.wrapper.write(decree));
        if r.is_err() {
            self.wrapper.clear_batch();
        }
        r
    }

    // -- multi_put / multi_remove ------------------------------------------

    pub fn multi_put(
        &mut self,
        ctx: &WriteContext,
        update: &MultiPutRequest,
        resp: &mut UpdateResponse,
    ) -> Result<(), DbError> {
        init_response!(self, resp, ctx.decree);

        if update.kvs.is_empty() {
            resp.error = status::INVALID_ARGUMENT;
            return self.empty_put(ctx.decree);
        }

        let r = self.multi_put_batch(ctx, update);
        if let Err(ref e) = r {
            resp.error = e.code();
            self.wrapper.clear_batch();
        }
        r
    }

    fn multi_put_batch(
        &mut self,
        ctx: &WriteContext,
        update: &MultiPutRequest,
    ) -> Result<(), DbError> {
        for kv in &update.kvs {
            let raw_key = compose_raw_key(&update.hash_key, &kv.key);
            self.wrapper.write_batch_put_ctx(ctx, &raw_key, &kv.value, update.expire_ts_seconds)?;
        }
        self.wrapper.write(ctx.decree)
    }

    pub fn multi_remove(
        &mut self,
        decree: Decree,
        update: &MultiRemoveRequest,
        resp: &mut MultiRemoveResponse,
    ) -> Result<(), DbError> {
        init_response!(self, resp, decree);

        if update.sort_keys.is_empty() {
            resp.error = status::INVALID_ARGUMENT;
            return self.empty_put(decree);
        }

        let r = self.multi_remove_batch(decree, update);
        match r {
            Ok(()) => resp.count = update.sort_keys.len() as i64,
            Err(ref e) => {
                resp.error = e.code();
                self.wrapper.clear_batch();
            }
        }
        r
    }

    fn multi_remove_batch(
        &mut self,
        decree: Decree,
        update: &MultiRemoveRequest,
    ) -> Result<(), DbError> {
        for sort_key in &update.sort_keys {
            let raw_key = compose_raw_key(&update.hash_key, sort_key);
            self.wrapper.write_batch_delete(decree, &raw_key)?;
        }
        self.wrapper.write(decree)
    }

    // -- incr ---------------------------------------------------------------

    pub fn incr(
        &mut self,
        decree: Decree,
        update: &IncrRequest,
        resp: &mut IncrResponse,
    ) -> Result<(), DbError> {
        init_response!(self, resp, decree);

        let get = match self.wrapper.get(&update.key) {
            Ok(get) => get,
            Err(e) => {
                resp.error = e.code();
                return Err(e);
            }
        };
        let stored = if get.found && !get.expired {
            value::decode_record(&get.raw_value).map(|r| r.user_value).unwrap_or(&[])
        } else {
            &[]
        };

        let new_value = if stored.is_empty() {
            update.increment
        } else {
            let Some(old) = parse_i64(stored) else {
                resp.error = status::INVALID_ARGUMENT;
                return self.empty_put(decree);
            };
            match old.checked_add(update.increment) {
                Some(v) => v,
                None => {
                    resp.error = status::INVALID_ARGUMENT;
                    resp.new_value = old;
                    return self.empty_put(decree);
                }
            }
        };

        let new_expire_ts = if update.expire_ts_seconds == 0 {
            // Keep the record's current expiration.
            if get.found && !get.expired {
                get.expire_ts
            } else {
                0
            }
        } else if update.expire_ts_seconds < 0 {
            0
        } else {
            update.expire_ts_seconds as u32
        };

        let r = self
            .wrapper
            .write_batch_put(decree, &update.key, new_value.to_string().as_bytes(), new_expire_ts)
            .and_then(|()| self.wrapper.write(decree));
        match r {
            Ok(()) => resp.new_value = new_value,
            Err(ref e) => {
                resp.error = e.code();
                self.wrapper.clear_batch();
            }
        }
        r
    }

    // -- check_and_set / check_and_mutate -----------------------------------

    pub fn check_and_set(
        &mut self,
        decree: Decree,
        update: &CheckAndSetRequest,
        resp: &mut CheckAndSetResponse,
    ) -> Result<(), DbError> {
        init_response!(self, resp, decree);

        let Ok(check_type) = CasCheckType::try_from(update.check_type) else {
            resp.error = status::INVALID_ARGUMENT;
            return self.empty_put(decree);
        };

        let check_key = compose_raw_key(&update.hash_key, &update.check_sort_key);
        let get = match self.wrapper.get(&check_key) {
            Ok(get) => get,
            Err(e) => {
                resp.error = e.code();
                return Err(e);
            }
        };
        let value_exist = get.found && !get.expired;
        let check_value: &[u8] = if value_exist {
            value::decode_record(&get.raw_value).map(|r| r.user_value).unwrap_or(&[])
        } else {
            &[]
        };

        if update.return_check_value {
            resp.check_value_returned = true;
            if value_exist {
                resp.check_value_exist = true;
                resp.check_value = check_value.to_vec();
            }
        }

        let mut invalid_argument = false;
        let passed = Self::validate_check(
            check_type,
            &update.check_operand,
            value_exist,
            check_value,
            &mut invalid_argument,
        );

        let set_key = if update.set_diff_sort_key {
            compose_raw_key(&update.hash_key, &update.set_sort_key)
        } else {
            check_key
        };
        let r = if passed {
            self.wrapper.write_batch_put(
                decree,
                &set_key,
                &update.set_value,
                update.set_expire_ts_seconds,
            )
        } else {
            // Null write so the decree advances even on a failed check.
            self.wrapper.write_batch_put(decree, b"", b"", 0)
        }
        .and_then(|()| self.wrapper.write(decree));

        if let Err(e) = r {
            resp.error = e.code();
            self.wrapper.clear_batch();
            return Err(e);
        }
        if !passed {
            resp.error =
                if invalid_argument { status::INVALID_ARGUMENT } else { status::TRY_AGAIN };
        }
        Ok(())
    }

    pub fn check_and_mutate(
        &mut self,
        decree: Decree,
        update: &CheckAndMutateRequest,
        resp: &mut CheckAndMutateResponse,
    ) -> Result<(), DbError> {
        init_response!(self, resp, decree);

        let Ok(check_type) = CasCheckType::try_from(update.check_type) else {
            resp.error = status::INVALID_ARGUMENT;
            return self.empty_put(decree);
        };
        if update.mutate_list.is_empty() {
            resp.error = status::INVALID_ARGUMENT;
            return self.empty_put(decree);
        }
        let mut mutations: Vec<(MutateOperation, &Mutate)> =
            Vec::with_capacity(update.mutate_list.len());
        for m in &update.mutate_list {
            match MutateOperation::try_from(m.operation) {
                Ok(op) => mutations.push((op, m)),
                Err(_) => {
                    resp.error = status::INVALID_ARGUMENT;
                    return self.empty_put(decree);
                }
            }
        }

        let check_key = compose_raw_key(&update.hash_key, &update.check_sort_key);
        let get = match self.wrapper.get(&check_key) {
            Ok(get) => get,
            Err(e) => {
                resp.error = e.code();
                return Err(e);
            }
        };
        let value_exist = get.found && !get.expired;
        let check_value: &[u8] = if value_exist {
            value::decode_record(&get.raw_value).map(|r| r.user_value).unwrap_or(&[])
        } else {
            &[]
        };

        if update.return_check_value {
            resp.check_value_returned = true;
            if value_exist {
                resp.check_value_exist = true;
                resp.check_value = check_value.to_vec();
            }
        }

        let mut invalid_argument = false;
        let passed = Self::validate_check(
            check_type,
            &update.check_operand,
            value_exist,
            check_value,
            &mut invalid_argument,
        );

        let r = if passed {
            self.apply_mutations(decree, &update.hash_key, &mutations)
        } else {
            self.wrapper.write_batch_put(decree, b"", b"", 0)
        }
        .and_then(|()| self.wrapper.write(decree));

        if let Err(e) = r {
            resp.error = e.code();
            self.wrapper.clear_batch();
            return Err(e);
        }
        if !passed {
            resp.error =
                if invalid_argument { status::INVALID_ARGUMENT } else { status::TRY_AGAIN };
        }
        Ok(())
    }

    fn apply_mutations(
        &mut self,
        decree: Decree,
        hash_key: &[u8],
        mutations: &[(MutateOperation, &Mutate)],
    ) -> Result<(), DbError> {
        for (op, m) in mutations {
            let raw_key = compose_raw_key(hash_key, &m.sort_key);
            match op {
                MutateOperation::Put => {
                    self.wrapper.write_batch_put(
                        decree,
                        &raw_key,
                        &m.value,
                        m.set_expire_ts_seconds,
                    )?;
                }
                MutateOperation::Delete => {
                    self.wrapper.write_batch_delete(decree, &raw_key)?;
                }
            }
        }
        Ok(())
    }

    /// Evaluate `check_type` against the (possibly absent, possibly empty)
    /// check value. Integer comparisons parse both sides as decimal i64; a
    /// parse failure raises `invalid_argument` and fails the check.
    fn validate_check(
        check_type: CasCheckType,
        operand: &[u8],
        value_exist: bool,
        value: &[u8],
        invalid_argument: &mut bool,
    ) -> bool {
        match check_type {
            CasCheckType::NoCheck => true,
            CasCheckType::ValueNotExist => !value_exist,
            CasCheckType::ValueNotExistOrEmpty => !value_exist || value.is_empty(),
            CasCheckType::ValueExist => value_exist,
            CasCheckType::ValueNotEmpty => value_exist && !value.is_empty(),
            CasCheckType::MatchAnywhere
            | CasCheckType::MatchPrefix
            | CasCheckType::MatchPostfix => {
                if !value_exist {
                    return false;
                }
                if operand.is_empty() {
                    return true;
                }
                match check_type {
                    CasCheckType::MatchAnywhere => {
                        value.windows(operand.len()).any(|w| w == operand)
                    }
                    CasCheckType::MatchPrefix => value.starts_with(operand),
                    _ => value.ends_with(operand),
                }
            }
            CasCheckType::BytesLess
            | CasCheckType::BytesLessOrEqual
            | CasCheckType::BytesEqual
            | CasCheckType::BytesGreaterOrEqual
            | CasCheckType::BytesGreater => {
                if !value_exist {
                    return false;
                }
                let ord = value.cmp(operand);
                match check_type {
                    CasCheckType::BytesLess => ord.is_lt(),
                    CasCheckType::BytesLessOrEqual => ord.is_le(),
                    CasCheckType::BytesEqual => ord.is_eq(),
                    CasCheckType::BytesGreaterOrEqual => ord.is_ge(),
                    _ => ord.is_gt(),
                }
            }
            CasCheckType::IntLess
            | CasCheckType::IntLessOrEqual
            | CasCheckType::IntEqual
            | CasCheckType::IntGreaterOrEqual
            | CasCheckType::IntGreater => {
                if !value_exist {
                    return false;
                }
                let Some(value_int) = parse_i64(value) else {
                    *invalid_argument = true;
                    return false;
                };
                let Some(operand_int) = parse_i64(operand) else {
                    *invalid_argument = true;
                    return false;
                };
                match check_type {
                    CasCheckType::IntLess => value_int < operand_int,
                    CasCheckType::IntLessOrEqual => value_int <= operand_int,
                    CasCheckType::IntEqual => value_int == operand_int,
                    CasCheckType::IntGreaterOrEqual => value_int >= operand_int,
                    _ => value_int > operand_int,
                }
            }
        }
    }

    // -- batched single writes ---------------------------------------------

    /// Append one put to the batch; its response is retained so a later
    /// commit failure can overwrite the error.
    pub fn batch_put(&mut self, ctx: &WriteContext, update: &PutRequest) -> Result<(), DbError> {
        let mut resp = UpdateResponse::default();
        init_response!(self, resp, ctx.decree);
        let r = self.wrapper.write_batch_put_ctx(
            ctx,
            &update.key,
            &update.value,
            update.expire_ts_seconds,
        );
        if let Err(ref e) = r {
            resp.error = e.code();
        }
        self.update_responses.push(resp);
        r
    }

    /// Append one tombstone to the batch.
    pub fn batch_remove(&mut self, decree: Decree, key: &[u8]) -> Result<(), DbError> {
        let mut resp = UpdateResponse::default();
        init_response!(self, resp, decree);
        let r = self.wrapper.write_batch_delete(decree, key);
        if let Err(ref e) = r {
            resp.error = e.code();
        }
        self.update_responses.push(resp);
        r
    }

    /// Atomically write the batch. Returns the registered responses in
    /// registration order, with every error overwritten on failure.
    pub fn batch_commit(&mut self, decree: Decree) -> (Result<(), DbError>, Vec<UpdateResponse>) {
        let r = self.wrapper.write(decree);
        let responses = match r {
            Ok(()) => std::mem::take(&mut self.update_responses),
            Err(ref e) => self.clear_up_batch_states(e.code()),
        };
        (r, responses)
    }

    /// Skip the engine write and fail every registered response with `err`.
    pub fn batch_abort(&mut self, _decree: Decree, err: i32) -> Vec<UpdateResponse> {
        debug_assert!(err != status::OK, "abort requires a non-zero error");
        self.clear_up_batch_states(err)
    }

    fn clear_up_batch_states(&mut self, err: i32) -> Vec<UpdateResponse> {
        for resp in &mut self.update_responses {
            resp.error = err;
        }
        self.wrapper.clear_batch();
        std::mem::take(&mut self.update_responses)
    }
}
