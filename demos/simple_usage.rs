/// Complete veridex API demo
///
/// Demonstrates the major engine operations:
/// - namespace + index setup
/// - item ingest (JSON)
/// - selects (filters, sorting, aggregation)
/// - update/delete queries
/// - transactions
/// - full-text search
use serde_json::json;

use veridex::core::ctx::RdxContext;
use veridex::core::namespace::IndexDef;
use veridex::core::variant::{Variant, VariantArray};
use veridex::ft::select::FtDslQuery;
use veridex::query::types::{AggType, CondType, ItemModifyMode, QueryType, DEFAULT_LIMIT, DEFAULT_OFFSET};
use veridex::{Database, Query, QueryResults};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("veridex - engine walkthrough\n");

    // Step 1: database + namespace + indexes
    println!("Step 1: creating namespace...");
    let db = Database::new();
    db.open_namespace("books")?;
    for def in [
        r#"{"name": "id", "field_type": "int64", "index_type": "hash"}"#,
        r#"{"name": "year", "field_type": "int", "index_type": "tree"}"#,
        r#"{"name": "title", "field_type": "string", "index_type": "hash"}"#,
        r#"{"name": "descr", "field_type": "string", "index_type": "text"}"#,
    ] {
        db.add_index("books", IndexDef::from_json(def)?)?;
    }
    println!("  done\n");

    // Step 2: ingest
    println!("Step 2: inserting items...");
    let docs = [
        json!({"id": 1, "year": 2008, "title": "The Rust Book", "descr": "systems programming with safety"}),
        json!({"id": 2, "year": 2015, "title": "Query Engines", "descr": "how databases execute queries"}),
        json!({"id": 3, "year": 2021, "title": "Full Text", "descr": "inverted indexes and typo tolerance"}),
    ];
    for doc in docs {
        let mut item = db.new_item("books")?;
        item.set_document(doc)?;
        db.modify_item("books", &mut item, ItemModifyMode::Upsert, &RdxContext::empty())?;
    }
    db.commit("books")?;
    println!("  inserted 3 items\n");

    // Step 3: selects
    println!("Step 3: selecting...");
    let q = Query::new("books")
        .where_cond("year", CondType::Ge, VariantArray::single(Variant::Int(2010)))?
        .sort("year", false);
    let mut qr = QueryResults::new();
    db.select(&q, &mut qr, &RdxContext::empty())?;
    println!("  year >= 2010: {} items", qr.count());
    for i in 0..qr.count() {
        println!("    {}", qr.get_item_json(i)?["title"]);
    }

    let agg = Query::new("books").aggregate(
        AggType::Avg,
        vec!["year".into()],
        vec![],
        DEFAULT_LIMIT,
        DEFAULT_OFFSET,
    )?;
    let mut qr = QueryResults::new();
    db.select(&agg, &mut qr, &RdxContext::empty())?;
    println!("  avg(year) = {:?}\n", qr.aggregation_results[0].value);

    // Step 4: update query
    println!("Step 4: updating...");
    let mut upd = Query::new("books")
        .where_cond("id", CondType::Eq, VariantArray::single(Variant::Int(1)))?
        .set("year", VariantArray::single(Variant::str("year + 1")), true)?;
    upd.query_type = QueryType::Update;
    let mut qr = QueryResults::new();
    db.update(&upd, &mut qr, &RdxContext::empty())?;
    println!("  updated {} item(s)\n", qr.count());

    // Step 5: transaction
    println!("Step 5: transaction...");
    let mut tx = db.new_transaction("books")?;
    let mut item = tx.new_item();
    item.set_document(json!({"id": 4, "year": 2024, "title": "Merge Steps", "descr": "incremental index commits"}))?;
    tx.modify_item(item, ItemModifyMode::Upsert)?;
    let mut qr = QueryResults::new();
    db.commit_transaction(&mut tx, &mut qr, &RdxContext::empty())?;
    println!("  committed, namespace now holds {} items\n", db.get_ns("books")?.item_count());

    // Step 6: full-text search with a typo
    println!("Step 6: full-text search...");
    let ns = db.get_ns("books")?;
    if let Some(merge) = ns.with_ft(|ft| {
        veridex::ft::dataholder::FtIndex::select(
            ft,
            &FtDslQuery::parse("invretd"), // a transposition and a deletion away
            false,
            0,
            None,
            &RdxContext::empty(),
        )
    }) {
        let merge = merge?;
        println!("  'invretd' matched {} document(s), max rank {}", merge.infos.len(), merge.max_rank);
    }

    println!("\nAll done.");
    Ok(())
}
