use crate::ft::typos::WordIdType;

#[derive(Debug, Clone, PartialEq)]
struct SuffixEntry {
    suffix: String,
    word_id: WordIdType,
    whole_word: bool,
}

/// Immutable-after-build multimap from every suffix of every indexed word
/// to the word id. Lookup by prefix of a suffix gives substring matching
/// over the word set.
#[derive(Debug, Clone)]
pub struct SuffixMap {
    entries: Vec<SuffixEntry>,
    sorted: bool,
}

impl Default for SuffixMap {
    fn default() -> Self {
        // an empty map is trivially sorted and lookupable
        SuffixMap { entries: Vec::new(), sorted: true }
    }
}

impl SuffixMap {
    pub fn new() -> Self {
        SuffixMap::default()
    }

    /// Registers all suffixes of `word`.
    pub fn insert_word(&mut self, word: &str, id: WordIdType) {
        for (i, _) in word.char_indices() {
            self.entries.push(SuffixEntry {
                suffix: word[i..].to_string(),
                word_id: id,
                whole_word: i == 0,
            });
        }
        self.sorted = false;
    }

    /// Sorts the map; required before any lookup.
    pub fn build(&mut self) {
        self.entries.sort_by(|a, b| a.suffix.cmp(&b.suffix));
        self.sorted = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.sorted = true;
    }

    pub fn heap_size(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<SuffixEntry>()
            + self.entries.iter().map(|e| e.suffix.capacity()).sum::<usize>()
    }

    /// Id of the exact whole word, if indexed.
    pub fn find_word(&self, word: &str) -> Option<WordIdType> {
        debug_assert!(self.sorted, "lookup on an unbuilt suffix map");
        let start = self.entries.partition_point(|e| e.suffix.as_str() < word);
        self.entries[start..]
            .iter()
            .take_while(|e| e.suffix == word)
            .find(|e| e.whole_word)
            .map(|e| e.word_id)
    }

    /// All words containing `pattern`; `(word_id, suffix_len, whole_word)`
    /// triples let the caller score full vs partial matches.
    pub fn find_containing(&self, pattern: &str, out: &mut Vec<(WordIdType, usize, bool)>) {
        debug_assert!(self.sorted, "lookup on an unbuilt suffix map");
        let start = self.entries.partition_point(|e| e.suffix.as_str() < pattern);
        for e in &self.entries[start..] {
            if !e.suffix.starts_with(pattern) {
                break;
            }
            out.push((e.word_id, e.suffix.len(), e.whole_word && e.suffix.len() == pattern.len()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_word_lookup() {
        let mut m = SuffixMap::new();
        m.insert_word("query", 1);
        m.insert_word("uery", 2); // a word equal to another's suffix
        m.build();
        assert_eq!(m.find_word("query"), Some(1));
        assert_eq!(m.find_word("uery"), Some(2));
        assert_eq!(m.find_word("ery"), None);
    }

    #[test]
    fn containing_lookup_covers_substrings() {
        let mut m = SuffixMap::new();
        m.insert_word("database", 1);
        m.insert_word("base", 2);
        m.build();
        let mut hits = Vec::new();
        m.find_containing("base", &mut hits);
        let ids: Vec<WordIdType> = hits.iter().map(|(id, _, _)| *id).collect();
        assert!(ids.contains(&1)); // "base" is a suffix of "database"
        assert!(ids.contains(&2));
        // the whole-word flag marks only the exact word
        assert!(hits.iter().any(|(id, _, whole)| *id == 2 && *whole));
        assert!(!hits.iter().any(|(id, _, whole)| *id == 1 && *whole));
    }
}
