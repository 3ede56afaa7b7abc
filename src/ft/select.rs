use std::collections::HashMap;

use roaring::RoaringBitmap;
use unicode_segmentation::UnicodeSegmentation;

use crate::core::ctx::RdxContext;
use crate::core::error::Result;
use crate::ft::config::MAX_MERGE_LIMIT;
use crate::ft::dataholder::DataHolder;
use crate::ft::filters::TokenFilter;
use crate::ft::postings::{IdContainer, IdRelType, VDocIdType};
use crate::ft::typos::WordIdType;

/// One term of a full-text DSL query.
#[derive(Debug, Clone, PartialEq)]
pub struct FtDslTerm {
    pub pattern: String,
    /// Whole-word match only, no suffix/typo candidates.
    pub exact: bool,
    pub boost: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FtDslQuery {
    pub terms: Vec<FtDslTerm>,
}

impl FtDslQuery {
    /// Splits a query string into terms. `=word` requires the exact word;
    /// `word^2` boosts the term.
    pub fn parse(input: &str) -> Self {
        let mut terms = Vec::new();
        for raw in input.split_whitespace() {
            let mut exact = false;
            let mut boost = 1.0f64;
            let mut token = raw;
            if let Some(stripped) = token.strip_prefix('=') {
                exact = true;
                token = stripped;
            }
            if let Some((head, factor)) = token.rsplit_once('^') {
                if let Ok(f) = factor.parse::<f64>() {
                    boost = f;
                    token = head;
                }
            }
            for word in token.unicode_words() {
                terms.push(FtDslTerm { pattern: word.to_lowercase(), exact, boost });
            }
        }
        FtDslQuery { terms }
    }
}

/// Final information about one found document.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeInfo {
    /// Virtual id of the merged document (index in vdocs).
    pub id: VDocIdType,
    /// Rank, percent-scaled.
    pub proc: i32,
    pub area_index: u32,
    /// Field where the best match was found.
    pub field: i8,
    /// Offset in the merged output, fits the merge limit.
    pub index_add: u16,
}

pub const NO_AREA: u32 = u32::MAX;

/// Positional areas of the matches within one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AreaHolder {
    pub areas: Vec<(u32, u32)>,
}

#[derive(Debug, Default)]
pub struct MergeData {
    pub infos: Vec<MergeInfo>,
    pub max_rank: i32,
    pub vector_areas: Vec<AreaHolder>,
}

struct Candidate {
    proc: f64,
}

struct MergeEntry {
    rank: f64,
    field: i8,
    positions: IdRelType,
    all_positions: Vec<IdRelType>,
}

/// Runs a DSL query over the holder: candidates per term (exact, suffix,
/// typo, filter variants), rank normalization per field/document, then a
/// position-aware intersection for multi-term queries.
pub fn run_select<C: IdContainer>(
    holder: &DataHolder<C>,
    dsl: &FtDslQuery,
    need_area: bool,
    max_areas_in_doc: i32,
    statuses: Option<&RoaringBitmap>,
    ctx: &RdxContext,
) -> Result<MergeData> {
    let mut out = MergeData::default();
    if dsl.terms.is_empty() || holder.vdocs.is_empty() {
        return Ok(out);
    }

    let mut merged: HashMap<VDocIdType, MergeEntry> = HashMap::new();
    for (term_idx, term) in dsl.terms.iter().enumerate() {
        // cancellation is polled between merge-step iterations
        ctx.check()?;
        let candidates = term_candidates(holder, term);
        let mut this_term: HashMap<VDocIdType, MergeEntry> = HashMap::new();

        for (word_id, cand) in &candidates {
            let word = holder.word_by_id(*word_id);
            for rel in word.vids.to_vec() {
                if let Some(mask) = statuses {
                    if !mask.contains(rel.id) {
                        continue;
                    }
                }
                let rank = doc_rank(holder, &rel, cand.proc);
                let entry = this_term.entry(rel.id).or_insert_with(|| MergeEntry {
                    rank: 0.0,
                    field: rel.pos.first().map(|p| p.field() as i8).unwrap_or(0),
                    positions: rel.clone(),
                    all_positions: Vec::new(),
                });
                if rank > entry.rank {
                    entry.rank = rank;
                    entry.field = rel.pos.first().map(|p| p.field() as i8).unwrap_or(0);
                    entry.positions = rel.clone();
                }
                entry.all_positions.push(rel);
            }
        }

        if term_idx == 0 {
            merged = this_term;
        } else {
            // intersection with positional scoring
            let mut next: HashMap<VDocIdType, MergeEntry> = HashMap::new();
            for (id, mut cur) in this_term {
                if let Some(prev) = merged.remove(&id) {
                    let dist = prev.positions.min_distance(&cur.positions);
                    let proximity = if dist <= 1 { 1.5 } else { 1.0 + 1.0 / (1.0 + dist as f64) };
                    cur.rank = prev.rank + cur.rank * proximity;
                    cur.all_positions.extend(prev.all_positions);
                    next.insert(id, cur);
                }
            }
            merged = next;
        }
        if merged.is_empty() {
            return Ok(out);
        }
    }

    let min_rank = holder.cfg.full_match_proc as f64 * holder.cfg.min_relevancy;
    let mut entries: Vec<(VDocIdType, MergeEntry)> = merged
        .into_iter()
        .filter(|(_, e)| e.rank >= min_rank)
        .collect();
    entries.sort_by(|a, b| b.1.rank.partial_cmp(&a.1.rank).unwrap_or(std::cmp::Ordering::Equal));

    let limit = holder.cfg.merge_limit.min(MAX_MERGE_LIMIT);
    entries.truncate(limit);

    for (idx, (id, entry)) in entries.into_iter().enumerate() {
        let proc = entry.rank.round().max(1.0) as i32;
        out.max_rank = out.max_rank.max(proc);
        let area_index = if need_area {
            let mut holder_areas = AreaHolder::default();
            let mut positions: Vec<u32> = entry
                .all_positions
                .iter()
                .flat_map(|rel| rel.pos.iter().map(|p| p.pos()))
                .collect();
            positions.sort_unstable();
            positions.dedup();
            for pos in positions.into_iter().take(max_areas_in_doc.max(0) as usize) {
                holder_areas.areas.push((pos, pos + 1));
            }
            out.vector_areas.push(holder_areas);
            (out.vector_areas.len() - 1) as u32
        } else {
            NO_AREA
        };
        out.infos.push(MergeInfo {
            id,
            proc,
            area_index,
            field: entry.field,
            index_add: idx as u16,
        });
    }
    Ok(out)
}

/// Candidate words of one term with their base rank (percent).
fn term_candidates<C: IdContainer>(
    holder: &DataHolder<C>,
    term: &FtDslTerm,
) -> HashMap<WordIdType, Candidate> {
    let cfg = &holder.cfg;
    let mut out: HashMap<WordIdType, Candidate> = HashMap::new();
    let mut add = |id: WordIdType, mut proc: f64| {
        if holder.word_by_id(id).virtual_word {
            proc *= 0.8;
        }
        let entry = out.entry(id).or_insert(Candidate { proc: 0.0 });
        if proc > entry.proc {
            entry.proc = proc;
        }
    };

    // query-side variants: the pattern itself plus filter alternatives
    let mut variants: Vec<(String, f64)> = vec![(term.pattern.clone(), 1.0)];
    if !term.exact {
        let mut alt = Vec::new();
        holder.synonyms.variants(&term.pattern, &mut alt);
        holder.translit.variants(&term.pattern, &mut alt);
        holder.kb_layout.variants(&term.pattern, &mut alt);
        holder.stemmers.stem(&term.pattern, &mut alt);
        variants.extend(alt.into_iter().map(|(v, w)| (v, w as f64)));
    }

    for (variant, weight) in &variants {
        let base = cfg.full_match_proc as f64 * term.boost * weight;
        if term.exact {
            if let Some(id) = holder.find_word(variant) {
                add(id, base);
            }
            continue;
        }
        let mut hits = Vec::new();
        for step in &holder.steps {
            step.suffixes.find_containing(variant, &mut hits);
        }
        for (id, suffix_len, whole) in hits.drain(..) {
            let word_len = holder.word_by_id(id).text.chars().count().max(1);
            let proc = if whole && suffix_len == variant.len() {
                base
            } else {
                // partial match: decreased and scaled by the covered share
                let coverage = variant.chars().count() as f64 / word_len as f64;
                (base - cfg.partial_match_decrease as f64) * coverage
            };
            add(id, proc);
        }
        // typo candidates from the precomputed maps
        if cfg.max_typos > 0 {
            let populate_from = |map: &crate::ft::dataholder::TyposMap,
                                 out: &mut dyn FnMut(WordIdType, u32)| {
                if let Some(typos) = map.get(variant.as_str()) {
                    for t in typos {
                        out(t.word, t.positions.len() as u32);
                    }
                }
            };
            for step in &holder.steps {
                let mut sink = |id: WordIdType, edits: u32| {
                    let proc = base - (cfg.typo_proc_decrease * edits as i32) as f64;
                    if proc > 0.0 {
                        add(id, proc);
                    }
                };
                populate_from(&step.typos_half, &mut sink);
                if cfg.max_typos_in_word() != cfg.half_typos() {
                    populate_from(&step.typos_max, &mut sink);
                }
            }
        }
    }
    out
}

/// Rank of one posting: term rank weighted by field, in-document
/// frequency against the most frequent word, and document length against
/// the namespace average.
fn doc_rank<C: IdContainer>(holder: &DataHolder<C>, rel: &IdRelType, term_proc: f64) -> f64 {
    let field = rel.pos.first().map(|p| p.field() as usize).unwrap_or(0);
    let vdoc = &holder.vdocs[rel.id as usize];
    let words_count = vdoc.words_count.get(field).copied().unwrap_or(1.0).max(1.0) as f64;
    let most_freq = vdoc.most_freq_word_count.get(field).copied().unwrap_or(1.0).max(1.0) as f64;
    let avg = holder.avg_words_count.get(field).copied().unwrap_or(words_count).max(1.0);

    let freq_norm = 0.3 + 0.7 * (rel.pos.len() as f64 / most_freq);
    let len_norm = (avg / words_count).sqrt().clamp(0.5, 2.0);
    term_proc * holder.cfg.field_weight(field) * freq_norm * len_norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ctx::{CancelType, RdxContext};
    use crate::ft::config::FtFastConfig;
    use crate::ft::dataholder::FtIndex;
    use crate::ft::postings::IdRelVec;

    fn holder(docs: &[&str]) -> DataHolder<IdRelVec> {
        let mut h = DataHolder::new(FtFastConfig::default());
        for (i, text) in docs.iter().enumerate() {
            h.add_document(i, i, vec![(text.to_string(), 0)]);
        }
        h.start_commit(false);
        h.process(1, false);
        h
    }

    #[test]
    fn single_term_select_ranks_exact_match_first() {
        let h = holder(&[
            "the quick brown fox",
            "quickly quicker quick quick",
            "nothing here",
        ]);
        let res = h
            .select(&FtDslQuery::parse("quick"), false, 0, None, &RdxContext::empty())
            .unwrap();
        assert_eq!(res.infos.len(), 2);
        assert!(res.max_rank > 0);
        // doc 1 repeats the word, so it ranks at least as high
        assert_eq!(res.infos[0].id, 1);
        assert!(res.infos.iter().all(|i| i.area_index == NO_AREA));
        // merged offsets enumerate the output
        assert_eq!(res.infos[0].index_add, 0);
        assert_eq!(res.infos[1].index_add, 1);
    }

    #[test]
    fn multi_term_select_intersects() {
        let h = holder(&["quick brown fox", "quick dog", "brown bear"]);
        let res = h
            .select(&FtDslQuery::parse("quick brown"), false, 0, None, &RdxContext::empty())
            .unwrap();
        assert_eq!(res.infos.len(), 1);
        assert_eq!(res.infos[0].id, 0);
    }

    #[test]
    fn typo_match_finds_word() {
        let h = holder(&["query language"]);
        // one transposition away from "query"
        let res = h
            .select(&FtDslQuery::parse("qeury"), false, 0, None, &RdxContext::empty())
            .unwrap();
        assert_eq!(res.infos.len(), 1);
    }

    #[test]
    fn status_mask_restricts_vdocs() {
        let h = holder(&["quick one", "quick two"]);
        let mut mask = RoaringBitmap::new();
        mask.insert(1);
        let res = h
            .select(&FtDslQuery::parse("quick"), false, 0, Some(&mask), &RdxContext::empty())
            .unwrap();
        assert_eq!(res.infos.len(), 1);
        assert_eq!(res.infos[0].id, 1);
    }

    #[test]
    fn areas_are_collected_and_bounded() {
        let h = holder(&["word here word there word everywhere"]);
        let res = h
            .select(&FtDslQuery::parse("word"), true, 2, None, &RdxContext::empty())
            .unwrap();
        assert_eq!(res.infos.len(), 1);
        let area_idx = res.infos[0].area_index as usize;
        assert_eq!(res.vector_areas[area_idx].areas.len(), 2); // bounded by max_areas_in_doc
    }

    #[test]
    fn canceled_context_aborts_select() {
        let h = holder(&["quick"]);
        let ctx = RdxContext::cancellable();
        ctx.cancel(CancelType::Explicit);
        let err = h
            .select(&FtDslQuery::parse("quick"), false, 0, None, &ctx)
            .unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::Canceled);
    }

    #[test]
    fn exact_term_skips_partial_matches() {
        let h = holder(&["database", "base"]);
        let res = h
            .select(&FtDslQuery::parse("=base"), false, 0, None, &RdxContext::empty())
            .unwrap();
        assert_eq!(res.infos.len(), 1);
        assert_eq!(res.infos[0].id, 1);
    }
}
