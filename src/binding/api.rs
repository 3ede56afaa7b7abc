use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::binding::ctx::{CtxInfo, CtxKeeper, CtxPool, CTX_ARR_SIZE};
use crate::binding::pool::{
    ResultsWrapper, SyncPool, MAX_CONCURRENT_QUERIES, WARN_LARGE_RESULTS_LIMIT,
};
use crate::core::ctx::CancelType;
use crate::core::database::Database;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::item::Item;
use crate::core::namespace::IndexDef;
use crate::core::transaction::Transaction;
use crate::payload::payload::Payload;
use crate::query::types::{ItemModifyMode, QueryType};
use crate::results::serializer::{flags, ResultFetchOpts};
use crate::wire::serializer::Serializer;

pub const FORMAT_JSON: u64 = 0;
pub const FORMAT_CJSON: u64 = 1;

pub const CONNECT_OPT_WARN_VERSION: u32 = 1;
pub const VERIDEX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error half of the binding ABI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingError {
    pub code: i32,
    pub what: Option<String>,
}

impl BindingError {
    pub fn ok() -> Self {
        BindingError::default()
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

fn error2c(err: &Error) -> BindingError {
    BindingError {
        code: err.code(),
        what: (!err.context.is_empty()).then(|| err.context.clone()),
    }
}

fn result2c(res: Result<()>) -> BindingError {
    match res {
        Ok(()) => BindingError::ok(),
        Err(e) => error2c(&e),
    }
}

/// Result buffer handed across the boundary: `data`/`len` point into the
/// owning wrapper's serializer buffer (or an error string when
/// `err_code != 0` and `results_ptr == 0`); the caller frees it exactly
/// once through [`free_buffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResBuffer {
    pub len: u32,
    pub data: usize,
    pub results_ptr: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingRet {
    pub err_code: i32,
    pub out: ResBuffer,
}

/// Reads the bytes a [`ResBuffer`] points at. Valid until the matching
/// [`free_buffer`] call.
///
/// # Safety
/// `buf` must come from a binding call and must not have been freed.
pub unsafe fn resbuffer_bytes(buf: &ResBuffer) -> &[u8] {
    if buf.data == 0 || buf.len == 0 {
        return &[];
    }
    std::slice::from_raw_parts(buf.data as *const u8, buf.len as usize)
}

struct Registry {
    databases: RwLock<HashMap<u64, Arc<Database>>>,
    transactions: Mutex<HashMap<u64, TxWrapper>>,
    results: Mutex<HashMap<u64, Box<ResultsWrapper>>>,
    pool: SyncPool,
    ctx_pool: CtxPool,
    serialized_count: AtomicI32,
    next_handle: AtomicU64,
}

struct TxWrapper {
    db: u64,
    tx: Transaction,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        databases: RwLock::new(HashMap::new()),
        transactions: Mutex::new(HashMap::new()),
        results: Mutex::new(HashMap::new()),
        pool: SyncPool::new(),
        ctx_pool: CtxPool::new(CTX_ARR_SIZE),
        serialized_count: AtomicI32::new(0),
        next_handle: AtomicU64::new(1),
    })
}

fn err_not_init() -> Error {
    Error::new(ErrorKind::NotValid, "veridex db has not initialized")
}

fn err_too_many_queries() -> Error {
    Error::new(ErrorKind::TooManyParallelQueries, "too many parallel queries")
}

fn get_db(rx: u64) -> Result<Arc<Database>> {
    registry()
        .databases
        .read()
        .get(&rx)
        .cloned()
        .ok_or_else(err_not_init)
}

fn new_results() -> Option<Box<ResultsWrapper>> {
    let reg = registry();
    reg.pool.get(reg.serialized_count.load(Ordering::Relaxed))
}

fn leak_error_string(msg: &str) -> (usize, u32) {
    let boxed = msg.as_bytes().to_vec().into_boxed_slice();
    let len = boxed.len() as u32;
    (Box::into_raw(boxed) as *mut u8 as usize, len)
}

fn ret2c(res: Result<ResBuffer>) -> BindingRet {
    match res {
        Ok(out) => BindingRet { err_code: 0, out },
        Err(err) => {
            let (data, len) = if err.context.is_empty() {
                (0, 0)
            } else {
                leak_error_string(&err.context)
            };
            BindingRet {
                err_code: err.code(),
                out: ResBuffer { len, data, results_ptr: 0 },
            }
        }
    }
}

/// Serializes a filled builder and publishes it under a fresh handle.
fn results2c(
    mut wrapper: Box<ResultsWrapper>,
    as_json: bool,
    pt_versions: &[i32],
) -> Result<ResBuffer> {
    let reg = registry();
    let mut res_flags = if as_json {
        flags::FORMAT_JSON
    } else {
        flags::FORMAT_PTRS | flags::WITH_ITEM_ID
    };
    if !pt_versions.is_empty() && !as_json {
        res_flags |= flags::WITH_PAYLOAD_TYPES;
    }
    wrapper.ser.set_opts(ResultFetchOpts {
        flags: res_flags,
        pt_versions: pt_versions.to_vec(),
        fetch_offset: 0,
        fetch_limit: 0,
        with_ns_id: true,
    });
    wrapper.ser.put_results(&wrapper.results)?;

    let out = ResBuffer {
        len: wrapper.ser.len() as u32,
        data: wrapper.ser.buf().as_ptr() as usize,
        results_ptr: reg.next_handle.fetch_add(1, Ordering::Relaxed),
    };
    reg.results.lock().insert(out.results_ptr, wrapper);
    let count = reg.serialized_count.fetch_add(1, Ordering::Relaxed);
    if count > MAX_CONCURRENT_QUERIES {
        warn!(count, pooled = reg.pool.pooled(), "too many serialized results");
    }
    Ok(out)
}

pub fn init() -> u64 {
    let reg = registry();
    let handle = reg.next_handle.fetch_add(1, Ordering::Relaxed);
    reg.databases.write().insert(handle, Arc::new(Database::new()));
    handle
}

pub fn destroy(rx: u64) {
    registry().databases.write().remove(&rx);
}

pub fn ping(rx: u64) -> BindingError {
    result2c(get_db(rx).map(|_| ()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOpts {
    pub options: u32,
}

pub fn connect(rx: u64, dsn: &str, opts: ConnectOpts, client_version: &str) -> BindingError {
    if opts.options & CONNECT_OPT_WARN_VERSION != 0 && client_version != VERIDEX_VERSION {
        warn!(
            client = client_version,
            library = VERIDEX_VERSION,
            "client and library versions differ; keeping them in sync is strongly recommended"
        );
    }
    result2c(get_db(rx).and_then(|db| db.connect(dsn)))
}

pub fn open_namespace(rx: u64, ns: &str, ctx_info: CtxInfo) -> BindingError {
    with_db_ctx(rx, ctx_info, |db, _| db.open_namespace(ns))
}

pub fn close_namespace(rx: u64, ns: &str, ctx_info: CtxInfo) -> BindingError {
    with_db_ctx(rx, ctx_info, |db, _| db.close_namespace(ns))
}

pub fn drop_namespace(rx: u64, ns: &str, ctx_info: CtxInfo) -> BindingError {
    with_db_ctx(rx, ctx_info, |db, _| db.drop_namespace(ns))
}

pub fn truncate_namespace(rx: u64, ns: &str, ctx_info: CtxInfo) -> BindingError {
    with_db_ctx(rx, ctx_info, |db, _| db.truncate_namespace(ns))
}

pub fn rename_namespace(rx: u64, src: &str, dst: &str, ctx_info: CtxInfo) -> BindingError {
    with_db_ctx(rx, ctx_info, |db, _| db.rename_namespace(src, dst))
}

pub fn add_index(rx: u64, ns: &str, index_def_json: &str, ctx_info: CtxInfo) -> BindingError {
    with_db_ctx(rx, ctx_info, |db, _| db.add_index(ns, IndexDef::from_json(index_def_json)?))
}

pub fn update_index(rx: u64, ns: &str, index_def_json: &str, ctx_info: CtxInfo) -> BindingError {
    with_db_ctx(rx, ctx_info, |db, _| db.update_index(ns, IndexDef::from_json(index_def_json)?))
}

pub fn drop_index(rx: u64, ns: &str, index: &str, ctx_info: CtxInfo) -> BindingError {
    with_db_ctx(rx, ctx_info, |db, _| db.drop_index(ns, index))
}

pub fn set_schema(rx: u64, ns: &str, schema_json: &str, ctx_info: CtxInfo) -> BindingError {
    with_db_ctx(rx, ctx_info, |db, _| {
        let schema = serde_json::from_str(schema_json)?;
        db.set_schema(ns, schema)
    })
}

fn with_db_ctx(
    rx: u64,
    ctx_info: CtxInfo,
    f: impl FnOnce(&Database, &crate::core::ctx::RdxContext) -> Result<()>,
) -> BindingError {
    result2c(get_db(rx).and_then(|db| {
        let keeper = CtxKeeper::new(&registry().ctx_pool, ctx_info);
        f(&db, &keeper.ctx)
    }))
}

struct PackedItemArgs {
    format: u64,
    mode: ItemModifyMode,
    state_token: i32,
    precepts: Vec<String>,
}

fn parse_item_args(rd: &mut Serializer) -> Result<PackedItemArgs> {
    let format = rd.get_varuint()?;
    let mode = ItemModifyMode::from_u64(rd.get_varuint()?)?;
    let state_token = rd.get_varint()? as i32;
    let precepts_count = rd.get_varuint()? as usize;
    let mut precepts = Vec::with_capacity(precepts_count);
    for _ in 0..precepts_count {
        precepts.push(rd.get_vstring()?.to_string());
    }
    Ok(PackedItemArgs { format, mode, state_token, precepts })
}

fn process_packed_item(item: &mut Item, args: &PackedItemArgs, data: &[u8]) -> Result<()> {
    match args.format {
        FORMAT_JSON => item.from_json(data)?,
        FORMAT_CJSON => {
            if item.get_state_token() != args.state_token {
                return Err(Error::new(
                    ErrorKind::StateInvalidated,
                    format!(
                        "stateToken mismatch: {:08X}, need {:08X}; can not process item",
                        args.state_token,
                        item.get_state_token()
                    ),
                ));
            }
            item.from_cjson(data)?;
        }
        other => {
            return Err(Error::new(
                ErrorKind::NotValid,
                format!("invalid source item format {}", other),
            ))
        }
    }
    item.set_precepts(args.precepts.clone());
    Ok(())
}

/// Item modification. `args` is the packed argument buffer:
/// namespace, format, mode, state token, precepts.
pub fn modify_item_packed(rx: u64, args: &[u8], data: &[u8], ctx_info: CtxInfo) -> BindingRet {
    ret2c(get_db(rx).and_then(|db| {
        let mut rd = Serializer::new(args);
        let ns = rd.get_vstring()?.to_string();
        let parsed = parse_item_args(&mut rd)?;
        let keeper = CtxKeeper::new(&registry().ctx_pool, ctx_info);

        let mut item = db.new_item(&ns)?;
        let mut err = process_packed_item(&mut item, &parsed, data);
        if let Err(e) = &err {
            // a tags mismatch heals with an item of the current generation
            if e.kind == ErrorKind::TagsMismatch {
                item = db.new_item(&ns)?;
                err = process_packed_item(&mut item, &parsed, data);
            }
        }
        err?;

        let mut wrapper = new_results().ok_or_else(err_too_many_queries)?;
        let stored = db.modify_item(&ns, &mut item, parsed.mode, &keeper.ctx)?;
        if let Some(id) = stored {
            let ns_ref = db.get_ns(&ns)?;
            let ns_id =
                wrapper.results.add_namespace(&ns, ns_ref.payload_type(), ns_ref.tags_matcher());
            wrapper.results.add_item(id, ns_id, item.payload.clone());
        }
        let pt_versions = if item.is_tags_updated() { vec![-1] } else { vec![] };
        results2c(wrapper, false, &pt_versions)
    }))
}

pub fn select(
    rx: u64,
    sql: &str,
    as_json: bool,
    pt_versions: &[i32],
    ctx_info: CtxInfo,
) -> BindingRet {
    ret2c(get_db(rx).and_then(|db| {
        let keeper = CtxKeeper::new(&registry().ctx_pool, ctx_info);
        let mut wrapper = new_results().ok_or_else(err_too_many_queries)?;
        db.select_sql(sql, &mut wrapper.results, &keeper.ctx)?;
        let out = results2c(wrapper, as_json, pt_versions)?;
        if out.len as usize >= WARN_LARGE_RESULTS_LIMIT {
            warn!(len = out.len, query = sql, "query too large results");
        }
        Ok(out)
    }))
}

pub fn select_query(
    rx: u64,
    query: &[u8],
    as_json: bool,
    pt_versions: &[i32],
    ctx_info: CtxInfo,
) -> BindingRet {
    ret2c(get_db(rx).and_then(|db| {
        let mut rd = Serializer::new(query);
        let q = crate::query::codec::deserialize(&mut rd)?;
        let keeper = CtxKeeper::new(&registry().ctx_pool, ctx_info);
        let mut wrapper = new_results().ok_or_else(err_too_many_queries)?;
        db.select(&q, &mut wrapper.results, &keeper.ctx)?;
        results2c(wrapper, as_json, pt_versions)
    }))
}

pub fn update_query(rx: u64, query: &[u8], ctx_info: CtxInfo) -> BindingRet {
    ret2c(get_db(rx).and_then(|db| {
        let mut rd = Serializer::new(query);
        let mut q = crate::query::codec::deserialize(&mut rd)?;
        q.query_type = QueryType::Update;
        let keeper = CtxKeeper::new(&registry().ctx_pool, ctx_info);
        let mut wrapper = new_results().ok_or_else(err_too_many_queries)?;
        db.update(&q, &mut wrapper.results, &keeper.ctx)?;
        results2c(wrapper, false, &[-1])
    }))
}

pub fn delete_query(rx: u64, query: &[u8], ctx_info: CtxInfo) -> BindingRet {
    ret2c(get_db(rx).and_then(|db| {
        let mut rd = Serializer::new(query);
        let mut q = crate::query::codec::deserialize(&mut rd)?;
        q.query_type = QueryType::Delete;
        let keeper = CtxKeeper::new(&registry().ctx_pool, ctx_info);
        let mut wrapper = new_results().ok_or_else(err_too_many_queries)?;
        db.delete(&q, &mut wrapper.results, &keeper.ctx)?;
        results2c(wrapper, false, &[])
    }))
}

pub fn start_transaction(rx: u64, ns: &str) -> (BindingError, u64) {
    match get_db(rx).and_then(|db| db.new_transaction(ns)) {
        Ok(tx) => {
            let reg = registry();
            let handle = reg.next_handle.fetch_add(1, Ordering::Relaxed);
            reg.transactions.lock().insert(handle, TxWrapper { db: rx, tx });
            (BindingError::ok(), handle)
        }
        Err(e) => (error2c(&e), 0),
    }
}

/// Item modification inside a transaction. A tags mismatch retries once
/// against a fresh item issued by the database, not by the transaction.
pub fn modify_item_packed_tx(rx: u64, tx: u64, args: &[u8], data: &[u8]) -> BindingError {
    result2c(get_db(rx).and_then(|db| {
        let mut rd = Serializer::new(args);
        let parsed = parse_item_args(&mut rd)?;
        let reg = registry();
        let mut transactions = reg.transactions.lock();
        let trw = transactions
            .get_mut(&tx)
            .ok_or_else(|| Error::new(ErrorKind::NotValid, "unknown transaction handle"))?;

        let mut item = trw.tx.new_item();
        let mut err = process_packed_item(&mut item, &parsed, data);
        if let Err(e) = &err {
            if e.kind == ErrorKind::TagsMismatch {
                item = db.new_item(&trw.tx.ns_name)?;
                err = process_packed_item(&mut item, &parsed, data);
            }
        }
        err?;
        trw.tx.modify_item(item, parsed.mode)
    }))
}

pub fn update_query_tx(rx: u64, tx: u64, query: &[u8]) -> BindingError {
    modify_query_tx(rx, tx, query, QueryType::Update)
}

pub fn delete_query_tx(rx: u64, tx: u64, query: &[u8]) -> BindingError {
    modify_query_tx(rx, tx, query, QueryType::Delete)
}

fn modify_query_tx(rx: u64, tx: u64, query: &[u8], query_type: QueryType) -> BindingError {
    result2c(get_db(rx).and_then(|_db| {
        let mut rd = Serializer::new(query);
        let mut q = crate::query::codec::deserialize(&mut rd)?;
        q.query_type = query_type;
        let reg = registry();
        let mut transactions = reg.transactions.lock();
        let trw = transactions
            .get_mut(&tx)
            .ok_or_else(|| Error::new(ErrorKind::NotValid, "unknown transaction handle"))?;
        trw.tx.modify_query(q)
    }))
}

pub fn commit_transaction(rx: u64, tx: u64, ctx_info: CtxInfo) -> BindingRet {
    ret2c(get_db(rx).and_then(|db| {
        let reg = registry();
        let mut trw = reg
            .transactions
            .lock()
            .remove(&tx)
            .ok_or_else(|| Error::new(ErrorKind::NotValid, "unknown transaction handle"))?;
        if trw.db != rx {
            return Err(Error::new(ErrorKind::NotValid, "transaction belongs to another database"));
        }
        let keeper = CtxKeeper::new(&reg.ctx_pool, ctx_info);
        let mut wrapper = new_results().ok_or_else(err_too_many_queries)?;
        db.commit_transaction(&mut trw.tx, &mut wrapper.results, &keeper.ctx)?;
        let pt_versions = if trw.tx.is_tags_updated() { vec![-1] } else { vec![] };
        results2c(wrapper, false, &pt_versions)
    }))
}

pub fn rollback_transaction(rx: u64, tx: u64) -> BindingError {
    result2c(get_db(rx).and_then(|db| {
        let reg = registry();
        let trw = reg.transactions.lock().remove(&tx);
        match trw {
            Some(mut trw) => db.rollback_transaction(&mut trw.tx),
            None => Ok(()),
        }
    }))
}

pub fn put_meta(rx: u64, ns: &str, key: &str, data: &str, ctx_info: CtxInfo) -> BindingError {
    with_db_ctx(rx, ctx_info, |db, _| db.put_meta(ns, key, data))
}

pub fn get_meta(rx: u64, ns: &str, key: &str, ctx_info: CtxInfo) -> BindingRet {
    ret2c(get_db(rx).and_then(|db| {
        let _keeper = CtxKeeper::new(&registry().ctx_pool, ctx_info);
        let data = db.get_meta(ns, key)?;
        let mut wrapper = new_results().ok_or_else(err_too_many_queries)?;
        wrapper.ser.write(data.as_bytes());
        let reg = registry();
        let out = ResBuffer {
            len: wrapper.ser.len() as u32,
            data: wrapper.ser.buf().as_ptr() as usize,
            results_ptr: reg.next_handle.fetch_add(1, Ordering::Relaxed),
        };
        reg.results.lock().insert(out.results_ptr, wrapper);
        let count = reg.serialized_count.fetch_add(1, Ordering::Relaxed);
        if count > MAX_CONCURRENT_QUERIES {
            warn!(count, pooled = reg.pool.pooled(), "too many serialized results");
        }
        Ok(out)
    }))
}

/// CJSON extraction buffer; freed once via [`free_cjson`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CjsonBuffer {
    pub len: u32,
    pub data: usize,
}

/// Materializes the CJSON body of one `ptrs`-format item by its handle.
pub fn cptr2cjson(results_ptr: u64, item_handle: u64, ns_id: u32) -> Result<CjsonBuffer> {
    let reg = registry();
    let results = reg.results.lock();
    let wrapper = results
        .get(&results_ptr)
        .ok_or_else(|| Error::new(ErrorKind::NotValid, "unknown results handle"))?;
    let item = wrapper
        .results
        .items
        .get(item_handle as usize)
        .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no item {}", item_handle)))?;
    let pt = wrapper.results.get_payload_type(ns_id)?;
    let mut tm = wrapper.results.get_tags_matcher(ns_id)?.clone();
    let doc = Payload::new(pt, &item.value).document(&tm)?;
    let bytes = crate::cjson::encode(&doc, &mut tm).into_boxed_slice();
    let len = bytes.len() as u32;
    Ok(CjsonBuffer { len, data: Box::into_raw(bytes) as *mut u8 as usize })
}

pub fn free_cjson(buf: CjsonBuffer) {
    if buf.data != 0 {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                buf.data as *mut u8,
                buf.len as usize,
            )));
        }
    }
}

/// Releases one result buffer: the wrapper goes back to the pool; an
/// error-string buffer (results_ptr == 0) frees just the string.
pub fn free_buffer(buf: ResBuffer) -> BindingError {
    let reg = registry();
    if buf.results_ptr == 0 {
        if buf.data != 0 {
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    buf.data as *mut u8,
                    buf.len as usize,
                )));
            }
        }
        return BindingError::ok();
    }
    match reg.results.lock().remove(&buf.results_ptr) {
        Some(wrapper) => {
            reg.pool.put(wrapper);
            let count = reg.serialized_count.fetch_sub(1, Ordering::Relaxed);
            if count < 1 {
                warn!(count, "too many deserialized results");
            }
            BindingError::ok()
        }
        None => BindingError {
            code: ErrorKind::NotValid.code(),
            what: Some("unknown results handle".to_string()),
        },
    }
}

pub fn free_buffers(buffers: &[ResBuffer]) -> BindingError {
    for buf in buffers {
        free_buffer(*buf);
    }
    BindingError::ok()
}

pub fn cancel_context(ctx_info: CtxInfo, how: CancelType) -> BindingError {
    if registry().ctx_pool.cancel_context(ctx_info, how) {
        BindingError::ok()
    } else {
        BindingError {
            code: ErrorKind::Params.code(),
            what: Some("no active context with this id".to_string()),
        }
    }
}

pub use crate::binding::logger::{disable_logger, enable_logger};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::serializer::ResultsReader;
    use crate::wire::serializer::WrSerializer;
    use serde_json::json;

    // the registry is process-wide; tests touching the live counter must
    // not interleave
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn pack_item_args(ns: &str, format: u64, mode: ItemModifyMode, state_token: i32) -> Vec<u8> {
        let mut ser = WrSerializer::new();
        ser.put_vstring(ns);
        ser.put_varuint(format);
        ser.put_varuint(mode as u64);
        ser.put_varint(state_token as i64);
        ser.put_varuint(0); // no precepts
        ser.into_bytes()
    }

    fn seeded_handle() -> u64 {
        let rx = init();
        assert!(open_namespace(rx, "docs", CtxInfo::default()).is_ok());
        for i in 0..3 {
            let args = pack_item_args("docs", FORMAT_JSON, ItemModifyMode::Upsert, 0);
            let data = json!({"id": i, "rating": 10 * i}).to_string();
            let ret = modify_item_packed(rx, &args, data.as_bytes(), CtxInfo::default());
            assert_eq!(ret.err_code, 0, "{:?}", ret);
            assert!(free_buffer(ret.out).is_ok());
        }
        rx
    }

    #[test]
    fn select_round_trips_through_the_buffer_protocol() {
        let _g = TEST_LOCK.lock();
        let rx = seeded_handle();
        let ret = select(rx, "SELECT * FROM docs", true, &[], CtxInfo::default());
        assert_eq!(ret.err_code, 0);
        assert_ne!(ret.out.results_ptr, 0);
        {
            let bytes = unsafe { resbuffer_bytes(&ret.out) };
            let rd = ResultsReader::new(bytes).unwrap();
            assert_eq!(rd.params().count, 3);
        }
        assert!(free_buffer(ret.out).is_ok());
        destroy(rx);
    }

    #[test]
    fn error_buffers_carry_the_message() {
        let _g = TEST_LOCK.lock();
        let rx = init();
        let ret = select(rx, "SELECT * FROM missing_ns", false, &[], CtxInfo::default());
        assert_eq!(ret.err_code, ErrorKind::NotFound.code());
        assert_eq!(ret.out.results_ptr, 0);
        let msg = String::from_utf8_lossy(unsafe { resbuffer_bytes(&ret.out) }).to_string();
        assert!(msg.contains("missing_ns"));
        assert!(free_buffer(ret.out).is_ok());
        destroy(rx);
    }

    #[test]
    fn binary_select_query_and_cjson_extraction() {
        let _g = TEST_LOCK.lock();
        let rx = seeded_handle();
        let q = crate::query::query::Query::new("docs");
        let mut ser = WrSerializer::new();
        crate::query::codec::serialize(&q, &mut ser, crate::query::codec::NORMAL);
        let ret = select_query(rx, ser.slice(), false, &[], CtxInfo::default());
        assert_eq!(ret.err_code, 0);

        let bytes = unsafe { resbuffer_bytes(&ret.out) };
        let mut rd = ResultsReader::new(bytes).unwrap();
        let item = rd.advance().unwrap();
        let handle = match item.body {
            crate::results::serializer::ItemBody::Ptr(h) => h,
            other => panic!("expected ptr body, got {:?}", other),
        };
        let cjson = cptr2cjson(ret.out.results_ptr, handle, item.ns_id).unwrap();
        assert!(cjson.len > 0);
        free_cjson(cjson);
        assert!(free_buffer(ret.out).is_ok());
        destroy(rx);
    }

    #[test]
    fn state_token_mismatch_is_reported() {
        let _g = TEST_LOCK.lock();
        let rx = seeded_handle();
        // bogus token with a CJSON body fails with state-invalidated
        let args = pack_item_args("docs", FORMAT_CJSON, ItemModifyMode::Upsert, 0x1BAD);
        let ret = modify_item_packed(rx, &args, &[7], CtxInfo::default());
        assert_eq!(ret.err_code, ErrorKind::StateInvalidated.code());
        assert!(free_buffer(ret.out).is_ok());
        destroy(rx);
    }

    #[test]
    fn transaction_flow_over_handles() {
        let _g = TEST_LOCK.lock();
        let rx = seeded_handle();
        let (err, tx) = start_transaction(rx, "docs");
        assert!(err.is_ok());
        let args = {
            let mut ser = WrSerializer::new();
            ser.put_varuint(FORMAT_JSON);
            ser.put_varuint(ItemModifyMode::Upsert as u64);
            ser.put_varint(0);
            ser.put_varuint(0);
            ser.into_bytes()
        };
        let data = json!({"id": 50, "rating": 5}).to_string();
        assert!(modify_item_packed_tx(rx, tx, &args, data.as_bytes()).is_ok());

        let ret = commit_transaction(rx, tx, CtxInfo::default());
        assert_eq!(ret.err_code, 0);
        assert!(free_buffer(ret.out).is_ok());

        let check = select(rx, "SELECT * FROM docs WHERE id = 50", true, &[], CtxInfo::default());
        let count = {
            let bytes = unsafe { resbuffer_bytes(&check.out) };
            ResultsReader::new(bytes).unwrap().params().count
        };
        assert_eq!(count, 1);
        assert!(free_buffer(check.out).is_ok());
        destroy(rx);
    }

    #[test]
    fn live_counter_returns_to_start_after_balanced_workload() {
        let _g = TEST_LOCK.lock();
        let rx = seeded_handle();
        let before = registry().serialized_count.load(Ordering::Relaxed);
        let mut buffers = Vec::new();
        for _ in 0..8 {
            let ret = select(rx, "SELECT * FROM docs", false, &[], CtxInfo::default());
            assert_eq!(ret.err_code, 0);
            buffers.push(ret.out);
        }
        assert_eq!(registry().serialized_count.load(Ordering::Relaxed), before + 8);
        free_buffers(&buffers);
        assert_eq!(registry().serialized_count.load(Ordering::Relaxed), before);
        destroy(rx);
    }

    #[test]
    fn cancel_context_without_operation_fails_with_params() {
        let err = cancel_context(CtxInfo { ctx_id: 9999, exec_timeout_ms: 0 }, CancelType::Explicit);
        assert_eq!(err.code, ErrorKind::Params.code());
    }

    #[test]
    fn select_at_the_live_cap_fails_with_too_many_queries() {
        let _g = TEST_LOCK.lock();
        let rx = seeded_handle();
        let reg = registry();
        let saved = reg.serialized_count.swap(MAX_CONCURRENT_QUERIES, Ordering::Relaxed);

        let ret = select(rx, "SELECT * FROM docs", false, &[], CtxInfo::default());
        assert_eq!(ret.err_code, ErrorKind::TooManyParallelQueries.code());
        assert_eq!(ret.out.results_ptr, 0);
        assert!(free_buffer(ret.out).is_ok());

        // one release below the cap and the next select succeeds
        reg.serialized_count.store(MAX_CONCURRENT_QUERIES - 1, Ordering::Relaxed);
        let ret = select(rx, "SELECT * FROM docs", false, &[], CtxInfo::default());
        assert_eq!(ret.err_code, 0);
        assert!(free_buffer(ret.out).is_ok());

        reg.serialized_count.store(saved, Ordering::Relaxed);
        destroy(rx);
    }

    #[test]
    fn canceled_context_aborts_a_select_with_no_buffer() {
        let _g = TEST_LOCK.lock();
        let rx = seeded_handle();
        let info = CtxInfo { ctx_id: 777, exec_timeout_ms: 0 };
        // a long-running operation holds the slot; another thread cancels
        let keeper = CtxKeeper::new(&registry().ctx_pool, info);
        let canceler = std::thread::spawn(move || cancel_context(info, CancelType::Explicit));
        assert!(canceler.join().unwrap().is_ok());

        let ret = select(rx, "SELECT * FROM docs", false, &[], info);
        assert_eq!(ret.err_code, ErrorKind::Canceled.code());
        assert_eq!(ret.out.results_ptr, 0);
        assert!(free_buffer(ret.out).is_ok());
        drop(keeper);
        destroy(rx);
    }
}
