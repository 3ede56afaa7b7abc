use serde_json::Value;

use crate::core::error::{Error, ErrorKind, Result};
use crate::payload::payload::Payload;
use crate::results::{AggregationResult, QueryResults};
use crate::wire::serializer::{Serializer, WrSerializer};

/// Result-wire flags. The low nibble selects the item body format, the
/// rest toggle frame fields.
pub mod flags {
    pub const FORMAT_MASK: u32 = 0xF;
    pub const FORMAT_PURE: u32 = 0;
    pub const FORMAT_PTRS: u32 = 1;
    pub const FORMAT_CJSON: u32 = 2;
    pub const FORMAT_JSON: u32 = 3;
    pub const FORMAT_MSGPACK: u32 = 4;

    pub const WITH_PAYLOAD_TYPES: u32 = 0x10;
    pub const WITH_ITEM_ID: u32 = 0x20;
    pub const WITH_RANK: u32 = 0x40;
    pub const WITH_NS_ID: u32 = 0x80;
    pub const WITH_RAW: u32 = 0x200;
    pub const NEED_OUTPUT_RANK: u32 = 0x400;
    pub const WITH_HEADER_LEN: u32 = 0x800;
}

/// Layout options of one serialization pass.
#[derive(Debug, Clone, Default)]
pub struct ResultFetchOpts {
    pub flags: u32,
    pub pt_versions: Vec<i32>,
    pub fetch_offset: u32,
    pub fetch_limit: u32,
    pub with_ns_id: bool,
}

/// Streams a [`QueryResults`] into the binary result wire.
#[derive(Debug, Default)]
pub struct WrResultSerializer {
    ser: WrSerializer,
    opts: ResultFetchOpts,
}

impl WrResultSerializer {
    pub fn new() -> Self {
        WrResultSerializer::default()
    }

    pub fn set_opts(&mut self, opts: ResultFetchOpts) {
        self.opts = opts;
        if self.opts.with_ns_id {
            self.opts.flags |= flags::WITH_NS_ID;
        }
    }

    pub fn len(&self) -> usize {
        self.ser.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ser.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.ser.cap()
    }

    pub fn buf(&self) -> &[u8] {
        self.ser.slice()
    }

    pub fn reset(&mut self) {
        self.ser.reset();
    }

    /// Raw write used by the meta entry points.
    pub fn write(&mut self, data: &[u8]) {
        self.ser.write(data);
    }

    pub fn put_results(&mut self, results: &QueryResults) -> Result<()> {
        let opts = self.opts.clone();
        let ser = &mut self.ser;
        ser.put_varuint(opts.flags as u64);
        ser.put_varuint(results.total_count as u64);

        let offset = opts.fetch_offset as usize;
        let limit = if opts.fetch_limit == 0 {
            usize::MAX
        } else {
            opts.fetch_limit as usize
        };
        let picked: Vec<usize> = (0..results.count()).skip(offset).take(limit).collect();
        ser.put_varuint(picked.len() as u64);

        ser.put_varuint(results.aggregation_results.len() as u64);
        for agg in &results.aggregation_results {
            let blob = serde_json::to_vec(agg)?;
            ser.put_vbytes(&blob);
        }
        ser.put_vstring(&results.explain_results);

        if opts.flags & flags::WITH_PAYLOAD_TYPES != 0 {
            ser.put_varuint(results.namespaces().len() as u64);
            for (ns_id, ns) in results.namespaces().iter().enumerate() {
                ser.put_varuint(ns_id as u64);
                ser.put_vstring(&ns.name);
                ser.put_varint(ns.tags_matcher.state_token() as i64);
                ser.put_varuint(ns.tags_matcher.version() as u64);
            }
        }

        for idx in picked {
            self.put_item(results, idx)?;
        }
        Ok(())
    }

    fn put_item(&mut self, results: &QueryResults, idx: usize) -> Result<()> {
        let item = &results.items[idx];
        let mut body = WrSerializer::new();

        if self.opts.flags & flags::WITH_ITEM_ID != 0 {
            body.put_varint(item.id);
            body.put_varint(item.value.get_lsn());
        }
        if self.opts.flags & flags::WITH_NS_ID != 0 {
            body.put_varuint(item.ns_id as u64);
        }
        if self.opts.flags & (flags::WITH_RANK | flags::NEED_OUTPUT_RANK) != 0 {
            body.put_varint(item.rank as i64);
        }
        if self.opts.flags & flags::WITH_RAW != 0 {
            body.put_varuint(item.raw as u64);
        }
        match self.opts.flags & flags::FORMAT_MASK {
            flags::FORMAT_PURE => {}
            flags::FORMAT_PTRS => {
                // a stable handle into the producing engine: the item index;
                // bytes are materialized later through the binding
                body.put_varuint(idx as u64);
            }
            flags::FORMAT_JSON => {
                let doc = results.get_item_json(idx)?;
                body.put_vbytes(doc.to_string().as_bytes());
            }
            flags::FORMAT_CJSON => {
                let pt = results.get_payload_type(item.ns_id)?;
                let pl = Payload::new(pt, &item.value);
                let mut tm = results.get_tags_matcher(item.ns_id)?.clone();
                let doc = pl.document(&tm)?;
                let bytes = crate::cjson::encode(&doc, &mut tm);
                body.put_vbytes(&bytes);
            }
            flags::FORMAT_MSGPACK => {
                let doc = results.get_item_json(idx)?;
                let bytes = rmp_serde::to_vec(&doc)
                    .map_err(|e| Error::new(ErrorKind::Logic, format!("msgpack encode: {}", e)))?;
                body.put_vbytes(&bytes);
            }
            other => {
                return Err(Error::new(
                    ErrorKind::Params,
                    format!("unknown results format {}", other),
                ))
            }
        }

        if self.opts.flags & flags::WITH_HEADER_LEN != 0 {
            self.ser.put_varuint(body.len() as u64);
        }
        self.ser.write(body.slice());
        Ok(())
    }
}

/// Header of a serialized result buffer.
#[derive(Debug, Default)]
pub struct RawQueryParams {
    pub flags: u32,
    pub total_count: usize,
    pub count: usize,
    pub aggregations: Vec<AggregationResult>,
    pub explain: String,
    pub ns_versions: Vec<(u32, String, i32, u32)>,
}

/// One decoded item frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemBody {
    None,
    Ptr(u64),
    Json(Vec<u8>),
    CJson(Vec<u8>),
    Msgpack(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ItemParams {
    pub id: i64,
    pub lsn: i64,
    pub ns_id: u32,
    pub rank: i32,
    pub raw: bool,
    pub body: ItemBody,
}

/// Read-side iterator over a serialized result buffer. `read_next` is
/// idempotent at a given position; `advance` moves to the next frame.
pub struct ResultsReader<'a> {
    rd: Serializer<'a>,
    params: RawQueryParams,
    remaining: usize,
}

impl<'a> ResultsReader<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        let mut rd = Serializer::new(buf);
        let mut params = RawQueryParams {
            flags: rd.get_varuint()? as u32,
            total_count: rd.get_varuint()? as usize,
            count: rd.get_varuint()? as usize,
            ..Default::default()
        };
        let agg_count = rd.get_varuint()? as usize;
        for _ in 0..agg_count {
            let blob = rd.get_vbytes()?;
            params.aggregations.push(serde_json::from_slice(blob)?);
        }
        params.explain = rd.get_vstring()?.to_string();
        if params.flags & flags::WITH_PAYLOAD_TYPES != 0 {
            let ns_count = rd.get_varuint()? as usize;
            for _ in 0..ns_count {
                let ns_id = rd.get_varuint()? as u32;
                let name = rd.get_vstring()?.to_string();
                let state_token = rd.get_varint()? as i32;
                let version = rd.get_varuint()? as u32;
                params.ns_versions.push((ns_id, name, state_token, version));
            }
        }
        let remaining = params.count;
        Ok(ResultsReader { rd, params, remaining })
    }

    pub fn params(&self) -> &RawQueryParams {
        &self.params
    }

    pub fn has_next(&self) -> bool {
        self.remaining > 0
    }

    /// Parses the current frame without consuming it.
    pub fn read_next(&mut self) -> Result<ItemParams> {
        let pos = self.rd.pos();
        let item = self.parse_frame()?;
        self.rd.set_pos(pos);
        Ok(item)
    }

    /// Parses the current frame and moves past it.
    pub fn advance(&mut self) -> Result<ItemParams> {
        let item = self.parse_frame()?;
        self.remaining -= 1;
        Ok(item)
    }

    fn parse_frame(&mut self) -> Result<ItemParams> {
        if self.remaining == 0 {
            return Err(Error::new(ErrorKind::NotFound, "no more items in the result buffer"));
        }
        let f = self.params.flags;
        if f & flags::WITH_HEADER_LEN != 0 {
            let _frame_len = self.rd.get_varuint()?;
        }
        let mut item = ItemParams {
            id: 0,
            lsn: 0,
            ns_id: 0,
            rank: 0,
            raw: false,
            body: ItemBody::None,
        };
        if f & flags::WITH_ITEM_ID != 0 {
            item.id = self.rd.get_varint()?;
            item.lsn = self.rd.get_varint()?;
        }
        if f & flags::WITH_NS_ID != 0 {
            item.ns_id = self.rd.get_varuint()? as u32;
        }
        if f & (flags::WITH_RANK | flags::NEED_OUTPUT_RANK) != 0 {
            item.rank = self.rd.get_varint()? as i32;
        }
        if f & flags::WITH_RAW != 0 {
            item.raw = self.rd.get_varuint()? != 0;
        }
        item.body = match f & flags::FORMAT_MASK {
            flags::FORMAT_PURE => ItemBody::None,
            flags::FORMAT_PTRS => ItemBody::Ptr(self.rd.get_varuint()?),
            flags::FORMAT_JSON => ItemBody::Json(self.rd.get_vbytes()?.to_vec()),
            flags::FORMAT_CJSON => ItemBody::CJson(self.rd.get_vbytes()?.to_vec()),
            flags::FORMAT_MSGPACK => ItemBody::Msgpack(self.rd.get_vbytes()?.to_vec()),
            other => {
                return Err(Error::new(
                    ErrorKind::ParseBin,
                    format!("unknown results format {}", other),
                ))
            }
        };
        Ok(item)
    }
}

/// Decodes one body back into a JSON document (format permitting).
pub fn body_to_json(body: &ItemBody, tm: &crate::cjson::TagsMatcher) -> Result<Value> {
    match body {
        ItemBody::Json(bytes) => Ok(serde_json::from_slice(bytes)?),
        ItemBody::CJson(bytes) => crate::cjson::decode(bytes, tm),
        ItemBody::Msgpack(bytes) => rmp_serde::from_slice(bytes)
            .map_err(|e| Error::new(ErrorKind::ParseBin, format!("msgpack decode: {}", e))),
        _ => Err(Error::new(ErrorKind::Params, "body carries no document")),
    }
}
