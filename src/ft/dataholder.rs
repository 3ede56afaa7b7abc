use std::collections::HashMap;

use rayon::prelude::*;
use roaring::RoaringBitmap;
use unicode_segmentation::UnicodeSegmentation;

use crate::core::ctx::RdxContext;
use crate::core::error::Result;
use crate::ft::config::FtFastConfig;
use crate::ft::filters::{KbLayout, StemmerSet, Synonyms, Translit};
use crate::ft::postings::{IdContainer, IdRelType, IdRelVec, PackedIdRelVec};
use crate::ft::select::{run_select, FtDslQuery, MergeData};
use crate::ft::suffix_map::SuffixMap;
use crate::ft::typos::{for_each_typo, WordIdType, WordTypo};

pub type TyposMap = HashMap<String, Vec<WordTypo>>;

/// Unique text document of the namespace: several rows with the same text
/// share one vdoc.
#[derive(Debug, Clone)]
pub struct VDocEntry {
    /// Handle of the document key entry this vdoc belongs to.
    pub key_entry: usize,
    /// Source texts, field-tagged; kept so a full rebuild needs no caller.
    pub texts: Vec<(String, u32)>,
    /// Word count per field.
    pub words_count: Vec<f32>,
    /// Occurrences of the most frequent word, per field.
    pub most_freq_word_count: Vec<f32>,
}

/// Word of the index with its posting container. `cur_step_pos` remembers
/// the posting count at the start of the last step, so a recommit of that
/// step can roll the container back.
#[derive(Debug, Clone)]
pub struct WordEntry<C> {
    pub text: String,
    pub vids: C,
    pub cur_step_pos: usize,
    /// Stem produced at build time rather than a surface word.
    pub virtual_word: bool,
}

/// One generation of the index: suffix map and typo maps over the words
/// whose ids start at `word_offset`. Immutable once the commit finishes;
/// only the last step may be rebuilt.
#[derive(Debug, Default)]
pub struct CommitStep {
    pub suffixes: SuffixMap,
    /// Words within `max_typos / 2` edits.
    pub typos_half: TyposMap,
    /// Words up to `max_typos_in_word()` edits, populated only when that
    /// differs from the half budget.
    pub typos_max: TyposMap,
    pub word_offset: u32,
}

impl CommitStep {
    pub fn new(word_offset: u32) -> Self {
        CommitStep { word_offset, ..Default::default() }
    }

    pub fn clear(&mut self) {
        self.suffixes.clear();
        self.typos_half.clear();
        self.typos_max.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    FullRebuild,
    RecommitLast,
    CreateNew,
}

/// Capability set of a full-text index implementation.
pub trait FtIndex: Send {
    fn start_commit(&mut self, complete_updated: bool);
    fn process(&mut self, field_size: usize, multithread: bool);
    fn select(
        &self,
        dsl: &FtDslQuery,
        need_area: bool,
        max_areas_in_doc: i32,
        statuses: Option<&RoaringBitmap>,
        ctx: &RdxContext,
    ) -> Result<MergeData>;
    fn mem_stat(&self) -> usize;
    fn clear(&mut self);
    fn set_config(&mut self, cfg: FtFastConfig);
}

/// The fast full-text index: an append-only list of commit steps over a
/// global word array, plus the vdoc table.
pub struct DataHolder<C: IdContainer> {
    pub steps: Vec<CommitStep>,
    pub words: Vec<WordEntry<C>>,
    pub vdocs: Vec<VDocEntry>,
    /// First vdoc not yet built into a step.
    pub cur_vdoc_pos: usize,
    /// First vdoc of the last step; recommit rolls back to it.
    pub vdocs_offset: usize,
    pub status: ProcessStatus,
    pub avg_words_count: Vec<f64>,
    /// Row id to vdoc index (several rows may share a vdoc).
    pub rows_to_vdoc: Vec<usize>,
    pub cfg: FtFastConfig,
    text_to_vdoc: HashMap<String, usize>,
    build_failed: bool,
    pub(crate) stemmers: StemmerSet,
    pub(crate) translit: Translit,
    pub(crate) kb_layout: KbLayout,
    pub(crate) synonyms: Synonyms,
}

struct TokenOcc {
    word: String,
    field: u32,
    pos: u32,
    virtual_word: bool,
}

struct VDocStats {
    words_count: Vec<f32>,
    most_freq_word_count: Vec<f32>,
}

impl<C: IdContainer> DataHolder<C> {
    pub fn new(cfg: FtFastConfig) -> Self {
        let stemmers = StemmerSet::new(&cfg.stemmers);
        let synonyms = Synonyms::new(&cfg);
        DataHolder {
            steps: Vec::new(),
            words: Vec::new(),
            vdocs: Vec::new(),
            cur_vdoc_pos: 0,
            vdocs_offset: 0,
            status: ProcessStatus::CreateNew,
            avg_words_count: Vec::new(),
            rows_to_vdoc: Vec::new(),
            cfg,
            text_to_vdoc: HashMap::new(),
            build_failed: false,
            stemmers,
            translit: Translit::new(),
            kb_layout: KbLayout::new(),
            synonyms,
        }
    }

    /// Queues one row's texts. Rows with identical text share a vdoc.
    pub fn add_document(&mut self, row_id: usize, key_entry: usize, texts: Vec<(String, u32)>) {
        let dedup_key: String = texts
            .iter()
            .map(|(t, f)| format!("{}\u{1}{}", f, t))
            .collect::<Vec<_>>()
            .join("\u{2}");
        let vdoc_id = match self.text_to_vdoc.get(&dedup_key) {
            Some(&id) => id,
            None => {
                let id = self.vdocs.len();
                self.vdocs.push(VDocEntry {
                    key_entry,
                    texts,
                    words_count: Vec::new(),
                    most_freq_word_count: Vec::new(),
                });
                self.text_to_vdoc.insert(dedup_key, id);
                id
            }
        };
        if row_id >= self.rows_to_vdoc.len() {
            self.rows_to_vdoc.resize(row_id + 1, usize::MAX);
        }
        self.rows_to_vdoc[row_id] = vdoc_id;
    }

    pub fn need_rebuild(&self, complete_updated: bool) -> bool {
        self.build_failed || complete_updated
    }

    pub fn need_recommit_last(&self) -> bool {
        match self.steps.last() {
            Some(last) => self.words.len() - (last.word_offset as usize) < self.cfg.max_step_size,
            None => false,
        }
    }

    /// Marks the active step invalid; the next commit runs a full rebuild.
    pub fn mark_build_failed(&mut self) {
        self.build_failed = true;
    }

    pub fn set_words_offset(&mut self, word_offset: u32) {
        if let Some(last) = self.steps.last_mut() {
            last.word_offset = word_offset;
        }
    }

    pub fn words_offset(&self) -> u32 {
        self.steps.last().map(|s| s.word_offset).unwrap_or(0)
    }

    /// Global id of a word local to the active step.
    pub fn build_word_id(&self, local: u32) -> WordIdType {
        self.words_offset() + local
    }

    /// The step owning `id`: its word offset is the greatest one <= id.
    pub fn get_step(&self, id: WordIdType) -> &CommitStep {
        let pos = self.steps.partition_point(|s| s.word_offset <= id);
        &self.steps[pos.saturating_sub(1)]
    }

    /// Exact whole-word lookup across all steps.
    pub fn find_word(&self, word: &str) -> Option<WordIdType> {
        self.steps.iter().find_map(|s| s.suffixes.find_word(word))
    }

    pub fn word_by_id(&self, id: WordIdType) -> &WordEntry<C> {
        &self.words[id as usize]
    }

    fn do_start_commit(&mut self, complete_updated: bool) {
        self.status = if self.need_rebuild(complete_updated) {
            ProcessStatus::FullRebuild
        } else if self.need_recommit_last() {
            ProcessStatus::RecommitLast
        } else {
            ProcessStatus::CreateNew
        };
        match self.status {
            ProcessStatus::FullRebuild => {
                self.steps.clear();
                self.words.clear();
                self.steps.push(CommitStep::new(0));
                self.cur_vdoc_pos = 0;
                self.vdocs_offset = 0;
                self.build_failed = false;
            }
            ProcessStatus::RecommitLast => {
                let word_offset = self.steps.last().map(|s| s.word_offset).unwrap_or(0) as usize;
                self.words.truncate(word_offset);
                for w in &mut self.words {
                    w.vids.truncate(w.cur_step_pos);
                }
                if let Some(last) = self.steps.last_mut() {
                    last.clear();
                }
                self.cur_vdoc_pos = self.vdocs_offset;
            }
            ProcessStatus::CreateNew => {
                let word_offset = self.words.len() as u32;
                for w in &mut self.words {
                    w.cur_step_pos = w.vids.len();
                }
                self.steps.push(CommitStep::new(word_offset));
                self.vdocs_offset = self.cur_vdoc_pos;
            }
        }
    }

    fn do_process(&mut self, field_size: usize, multithread: bool) {
        if self.steps.is_empty() {
            self.steps.push(CommitStep::new(0));
        }
        let pending: Vec<usize> = (self.cur_vdoc_pos..self.vdocs.len()).collect();
        if pending.is_empty() {
            return;
        }

        // Phase 1: tokenize pending vdocs (fans out when asked to).
        let tokenized: Vec<(VDocStats, Vec<TokenOcc>)> = {
            let vdocs = &self.vdocs;
            let stemmers = &self.stemmers;
            let run = |&i: &usize| tokenize_vdoc(&vdocs[i].texts, stemmers, field_size);
            if multithread {
                pending.par_iter().map(run).collect()
            } else {
                pending.iter().map(run).collect()
            }
        };

        // Phase 2: stats + postings + new word registration.
        let word_offset = self.words_offset() as usize;
        let mut active_words: HashMap<String, WordIdType> = self
            .words
            .iter()
            .enumerate()
            .skip(word_offset)
            .map(|(i, w)| (w.text.clone(), i as WordIdType))
            .collect();
        let mut new_word_ids: Vec<WordIdType> = Vec::new();

        for (k, &vdoc_idx) in pending.iter().enumerate() {
            let (stats, tokens) = &tokenized[k];
            self.vdocs[vdoc_idx].words_count = stats.words_count.clone();
            self.vdocs[vdoc_idx].most_freq_word_count = stats.most_freq_word_count.clone();

            let mut per_word: HashMap<&str, (IdRelType, bool)> = HashMap::new();
            for occ in tokens {
                let entry = per_word
                    .entry(occ.word.as_str())
                    .or_insert_with(|| (IdRelType::new(vdoc_idx as u32), occ.virtual_word));
                entry.0.add(occ.pos, occ.field);
            }
            for (word, (rel, virtual_word)) in per_word {
                let id = match active_words.get(word).copied().or_else(|| self.find_word(word)) {
                    Some(id) => id,
                    None => {
                        let id = self.build_word_id((self.words.len() - word_offset) as u32);
                        self.words.push(WordEntry {
                            text: word.to_string(),
                            vids: C::default(),
                            cur_step_pos: 0,
                            virtual_word,
                        });
                        active_words.insert(word.to_string(), id);
                        new_word_ids.push(id);
                        id
                    }
                };
                self.words[id as usize].vids.push(&rel);
            }
        }

        // Phase 3: suffix map and typo maps of the active step.
        let half = self.cfg.half_typos();
        let max_in_word = self.cfg.max_typos_in_word();
        let max_typo_len = self.cfg.max_typo_len;
        let step = self.steps.last_mut().expect("active step exists");
        for &id in &new_word_ids {
            let text = self.words[id as usize].text.clone();
            step.suffixes.insert_word(&text, id);
            if max_in_word > 0 && text.chars().count() <= max_typo_len {
                let typos_half = &mut step.typos_half;
                let typos_max = &mut step.typos_max;
                for_each_typo(&text, max_in_word, &mut |variant, edits, positions| {
                    let target = if edits <= half { &mut *typos_half } else { &mut *typos_max };
                    target
                        .entry(variant.to_string())
                        .or_default()
                        .push(WordTypo::with_positions(id, *positions));
                });
            }
        }
        step.suffixes.build();

        // Phase 4: per-field average word counts over all vdocs.
        self.avg_words_count = vec![0.0; field_size];
        for vdoc in &self.vdocs {
            for (f, c) in vdoc.words_count.iter().enumerate().take(field_size) {
                self.avg_words_count[f] += *c as f64;
            }
        }
        if !self.vdocs.is_empty() {
            for avg in &mut self.avg_words_count {
                *avg /= self.vdocs.len() as f64;
            }
        }

        self.cur_vdoc_pos = self.vdocs.len();
    }
}

fn tokenize_vdoc(texts: &[(String, u32)], stemmers: &StemmerSet, field_size: usize) -> (VDocStats, Vec<TokenOcc>) {
    let mut tokens = Vec::new();
    let mut words_count = vec![0f32; field_size];
    let mut freq: Vec<HashMap<String, u32>> = vec![HashMap::new(); field_size];
    for (text, field) in texts {
        let f = (*field as usize).min(field_size.saturating_sub(1));
        for (pos, raw) in text.unicode_words().enumerate() {
            let word = raw.to_lowercase();
            words_count[f] += 1.0;
            *freq[f].entry(word.clone()).or_insert(0) += 1;
            let mut stems = Vec::new();
            stemmers.stem(&word, &mut stems);
            for (stem, _) in stems {
                tokens.push(TokenOcc {
                    word: stem,
                    field: *field,
                    pos: pos as u32,
                    virtual_word: true,
                });
            }
            tokens.push(TokenOcc { word, field: *field, pos: pos as u32, virtual_word: false });
        }
    }
    let most_freq_word_count = freq
        .iter()
        .map(|m| m.values().copied().max().unwrap_or(0) as f32)
        .collect();
    (VDocStats { words_count, most_freq_word_count }, tokens)
}

impl<C: IdContainer> FtIndex for DataHolder<C> {
    fn start_commit(&mut self, complete_updated: bool) {
        self.do_start_commit(complete_updated);
    }

    fn process(&mut self, field_size: usize, multithread: bool) {
        self.do_process(field_size, multithread);
    }

    fn select(
        &self,
        dsl: &FtDslQuery,
        need_area: bool,
        max_areas_in_doc: i32,
        statuses: Option<&RoaringBitmap>,
        ctx: &RdxContext,
    ) -> Result<MergeData> {
        run_select(self, dsl, need_area, max_areas_in_doc, statuses, ctx)
    }

    fn mem_stat(&self) -> usize {
        let mut total = 0usize;
        for step in &self.steps {
            total += step.suffixes.heap_size();
            total += (step.typos_half.len() + step.typos_max.len()) * std::mem::size_of::<WordTypo>();
        }
        for w in &self.words {
            total += w.text.capacity() + w.vids.heap_size();
        }
        for v in &self.vdocs {
            total += v.texts.iter().map(|(t, _)| t.capacity()).sum::<usize>();
        }
        total
    }

    fn clear(&mut self) {
        self.steps.clear();
        self.words.clear();
        self.vdocs.clear();
        self.rows_to_vdoc.clear();
        self.text_to_vdoc.clear();
        self.avg_words_count.clear();
        self.cur_vdoc_pos = 0;
        self.vdocs_offset = 0;
        self.build_failed = false;
        self.status = ProcessStatus::CreateNew;
    }

    fn set_config(&mut self, cfg: FtFastConfig) {
        self.stemmers = StemmerSet::new(&cfg.stemmers);
        self.synonyms = Synonyms::new(&cfg);
        self.cfg = cfg;
    }
}

/// The two index flavors differ only by the posting container.
pub enum AnyDataHolder {
    Plain(DataHolder<IdRelVec>),
    Packed(DataHolder<PackedIdRelVec>),
}

impl AnyDataHolder {
    pub fn new(cfg: FtFastConfig, packed: bool) -> Self {
        if packed {
            AnyDataHolder::Packed(DataHolder::new(cfg))
        } else {
            AnyDataHolder::Plain(DataHolder::new(cfg))
        }
    }

    pub fn add_document(&mut self, row_id: usize, key_entry: usize, texts: Vec<(String, u32)>) {
        match self {
            AnyDataHolder::Plain(h) => h.add_document(row_id, key_entry, texts),
            AnyDataHolder::Packed(h) => h.add_document(row_id, key_entry, texts),
        }
    }
}

impl FtIndex for AnyDataHolder {
    fn start_commit(&mut self, complete_updated: bool) {
        match self {
            AnyDataHolder::Plain(h) => h.start_commit(complete_updated),
            AnyDataHolder::Packed(h) => h.start_commit(complete_updated),
        }
    }

    fn process(&mut self, field_size: usize, multithread: bool) {
        match self {
            AnyDataHolder::Plain(h) => h.process(field_size, multithread),
            AnyDataHolder::Packed(h) => h.process(field_size, multithread),
        }
    }

    fn select(
        &self,
        dsl: &FtDslQuery,
        need_area: bool,
        max_areas_in_doc: i32,
        statuses: Option<&RoaringBitmap>,
        ctx: &RdxContext,
    ) -> Result<MergeData> {
        match self {
            AnyDataHolder::Plain(h) => h.select(dsl, need_area, max_areas_in_doc, statuses, ctx),
            AnyDataHolder::Packed(h) => h.select(dsl, need_area, max_areas_in_doc, statuses, ctx),
        }
    }

    fn mem_stat(&self) -> usize {
        match self {
            AnyDataHolder::Plain(h) => h.mem_stat(),
            AnyDataHolder::Packed(h) => h.mem_stat(),
        }
    }

    fn clear(&mut self) {
        match self {
            AnyDataHolder::Plain(h) => h.clear(),
            AnyDataHolder::Packed(h) => h.clear(),
        }
    }

    fn set_config(&mut self, cfg: FtFastConfig) {
        match self {
            AnyDataHolder::Plain(h) => h.set_config(cfg),
            AnyDataHolder::Packed(h) => h.set_config(cfg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder_with(cfg: FtFastConfig, docs: &[&str]) -> DataHolder<IdRelVec> {
        let mut h = DataHolder::new(cfg);
        for (i, text) in docs.iter().enumerate() {
            h.add_document(i, i, vec![(text.to_string(), 0)]);
        }
        h.start_commit(false);
        h.process(1, false);
        h
    }

    #[test]
    fn typo_bucketing_half_vs_max() {
        let mut cfg = FtFastConfig::default();
        cfg.max_typos = 2;
        let h = holder_with(cfg, &["query"]);
        let id = h.find_word("query").expect("word indexed");
        let step = h.get_step(id);
        assert_eq!(step.word_offset, 0);

        // all 1-edit variants land in typos_half, 2-edit in typos_max
        assert!(!step.typos_half.is_empty());
        assert!(!step.typos_max.is_empty());
        for typos in step.typos_half.values() {
            for t in typos {
                assert!(t.positions.len() <= 1, "half map must hold <= 1 edits");
            }
        }
        assert!(step
            .typos_max
            .values()
            .flatten()
            .all(|t| t.positions.len() == 2));
    }

    #[test]
    fn word_ids_are_monotonic_across_steps() {
        let mut cfg = FtFastConfig::default();
        cfg.max_step_size = 0; // force a new step each commit
        let mut h = holder_with(cfg, &["alpha beta"]);
        let first_step_words = h.words.len();
        assert!(first_step_words >= 2);

        h.add_document(1, 1, vec![("gamma delta".to_string(), 0)]);
        h.start_commit(false);
        h.process(1, false);

        assert_eq!(h.steps.len(), 2);
        let gamma = h.find_word("gamma").unwrap();
        assert!(gamma as usize >= first_step_words);
        assert_eq!(h.get_step(gamma).word_offset as usize, first_step_words);
        // each id belongs to exactly one step
        let alpha = h.find_word("alpha").unwrap();
        assert_eq!(h.get_step(alpha).word_offset, 0);
    }

    #[test]
    fn recommit_last_rolls_back_the_step() {
        let cfg = FtFastConfig::default(); // big max_step_size keeps one step
        let mut h = holder_with(cfg, &["alpha beta"]);
        assert_eq!(h.steps.len(), 1);
        let words_before = h.words.len();

        h.add_document(1, 1, vec![("beta gamma".to_string(), 0)]);
        h.start_commit(false);
        assert_eq!(h.status, ProcessStatus::RecommitLast);
        h.process(1, false);

        // still one step, rebuilt with the union of words
        assert_eq!(h.steps.len(), 1);
        assert!(h.words.len() > words_before);
        assert!(h.find_word("gamma").is_some());
        assert!(h.find_word("alpha").is_some());
        // beta occurs in both vdocs
        let beta = h.find_word("beta").unwrap();
        assert_eq!(h.words[beta as usize].vids.len(), 2);
    }

    #[test]
    fn full_rebuild_after_failure_marker() {
        let mut h = holder_with(FtFastConfig::default(), &["alpha"]);
        h.mark_build_failed();
        h.add_document(1, 1, vec![("beta".to_string(), 0)]);
        h.start_commit(false);
        assert_eq!(h.status, ProcessStatus::FullRebuild);
        h.process(1, false);
        assert!(h.find_word("alpha").is_some());
        assert!(h.find_word("beta").is_some());
        assert_eq!(h.steps.len(), 1);
    }

    #[test]
    fn same_text_rows_share_a_vdoc() {
        let mut h = DataHolder::<IdRelVec>::new(FtFastConfig::default());
        h.add_document(0, 0, vec![("same text".to_string(), 0)]);
        h.add_document(1, 1, vec![("same text".to_string(), 0)]);
        assert_eq!(h.vdocs.len(), 1);
        assert_eq!(h.rows_to_vdoc, vec![0, 0]);
    }

    #[test]
    fn multithread_build_matches_single_thread() {
        let docs = &["the quick brown fox", "jumps over the lazy dog", "quick dog"];
        let single = holder_with(FtFastConfig::default(), docs);
        let mut multi = DataHolder::<IdRelVec>::new(FtFastConfig::default());
        for (i, text) in docs.iter().enumerate() {
            multi.add_document(i, i, vec![(text.to_string(), 0)]);
        }
        multi.start_commit(false);
        multi.process(1, true);
        assert_eq!(single.words.len(), multi.words.len());
        assert_eq!(single.find_word("quick").is_some(), multi.find_word("quick").is_some());
    }
}
