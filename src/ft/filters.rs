use std::collections::HashMap;

use rust_stemmers::{Algorithm, Stemmer};

use crate::ft::config::FtFastConfig;

/// Produces alternative spellings of a word, each with a rank weight.
pub trait TokenFilter: Send + Sync {
    fn variants(&self, word: &str, out: &mut Vec<(String, f32)>);
}

/// Russian <-> latin transliteration.
pub struct Translit {
    ru2en: HashMap<char, &'static str>,
}

impl Translit {
    pub fn new() -> Self {
        let pairs: &[(char, &'static str)] = &[
            ('а', "a"), ('б', "b"), ('в', "v"), ('г', "g"), ('д', "d"), ('е', "e"),
            ('ё', "yo"), ('ж', "zh"), ('з', "z"), ('и', "i"), ('й', "j"), ('к', "k"),
            ('л', "l"), ('м', "m"), ('н', "n"), ('о', "o"), ('п', "p"), ('р', "r"),
            ('с', "s"), ('т', "t"), ('у', "u"), ('ф', "f"), ('х', "h"), ('ц', "c"),
            ('ч', "ch"), ('ш', "sh"), ('щ', "sch"), ('ъ', ""), ('ы', "y"), ('ь', ""),
            ('э', "e"), ('ю', "yu"), ('я', "ya"),
        ];
        Translit { ru2en: pairs.iter().copied().collect() }
    }
}

impl TokenFilter for Translit {
    fn variants(&self, word: &str, out: &mut Vec<(String, f32)>) {
        if !word.chars().any(|c| self.ru2en.contains_key(&c)) {
            return;
        }
        let mut translit = String::with_capacity(word.len());
        for c in word.chars() {
            match self.ru2en.get(&c) {
                Some(s) => translit.push_str(s),
                None => translit.push(c),
            }
        }
        if translit != word && !translit.is_empty() {
            out.push((translit, 0.9));
        }
    }
}

/// Wrong-keyboard-layout recovery (qwerty <-> йцукен).
pub struct KbLayout {
    en2ru: HashMap<char, char>,
    ru2en: HashMap<char, char>,
}

impl KbLayout {
    pub fn new() -> Self {
        let en = "qwertyuiop[]asdfghjkl;'zxcvbnm,.";
        let ru = "йцукенгшщзхъфывапролджэячсмитьбю";
        let en2ru: HashMap<char, char> = en.chars().zip(ru.chars()).collect();
        let ru2en: HashMap<char, char> = ru.chars().zip(en.chars()).collect();
        KbLayout { en2ru, ru2en }
    }
}

impl TokenFilter for KbLayout {
    fn variants(&self, word: &str, out: &mut Vec<(String, f32)>) {
        for map in [&self.en2ru, &self.ru2en] {
            if word.chars().all(|c| map.contains_key(&c)) {
                let converted: String = word.chars().map(|c| map[&c]).collect();
                if converted != word {
                    out.push((converted, 0.87));
                }
            }
        }
    }
}

/// Query-side synonym expansion from the index config.
pub struct Synonyms {
    map: HashMap<String, Vec<String>>,
}

impl Synonyms {
    pub fn new(cfg: &FtFastConfig) -> Self {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for def in &cfg.synonyms {
            for token in &def.tokens {
                map.entry(token.to_lowercase())
                    .or_default()
                    .extend(def.alternatives.iter().map(|a| a.to_lowercase()));
            }
        }
        Synonyms { map }
    }
}

impl TokenFilter for Synonyms {
    fn variants(&self, word: &str, out: &mut Vec<(String, f32)>) {
        if let Some(alts) = self.map.get(word) {
            for alt in alts {
                out.push((alt.clone(), 0.95));
            }
        }
    }
}

/// Language to stemmer object.
pub struct StemmerSet {
    stemmers: HashMap<String, Stemmer>,
}

impl StemmerSet {
    pub fn new(langs: &[String]) -> Self {
        let mut stemmers = HashMap::new();
        for lang in langs {
            let algo = match lang.as_str() {
                "en" => Some(Algorithm::English),
                "ru" => Some(Algorithm::Russian),
                "de" => Some(Algorithm::German),
                "fr" => Some(Algorithm::French),
                "es" => Some(Algorithm::Spanish),
                _ => None,
            };
            if let Some(algo) = algo {
                stemmers.insert(lang.clone(), Stemmer::create(algo));
            }
        }
        StemmerSet { stemmers }
    }

    /// Stem variants of the word across configured languages.
    pub fn stem(&self, word: &str, out: &mut Vec<(String, f32)>) {
        for stemmer in self.stemmers.values() {
            let stem = stemmer.stem(word);
            if stem != word && stem.len() > 2 {
                out.push((stem.to_string(), 0.8));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translit_converts_cyrillic() {
        let f = Translit::new();
        let mut out = Vec::new();
        f.variants("кот", &mut out);
        assert_eq!(out[0].0, "kot");
        out.clear();
        f.variants("cat", &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn kb_layout_round_trips() {
        let f = KbLayout::new();
        let mut out = Vec::new();
        f.variants("ghbdtn", &mut out); // "привет" typed on qwerty
        assert!(out.iter().any(|(v, _)| v == "привет"));
    }

    #[test]
    fn stemmer_produces_stems() {
        let s = StemmerSet::new(&["en".to_string()]);
        let mut out = Vec::new();
        s.stem("running", &mut out);
        assert!(out.iter().any(|(v, _)| v == "run"));
    }

    #[test]
    fn synonyms_expand_from_config() {
        let mut cfg = FtFastConfig::default();
        cfg.synonyms.push(crate::ft::config::SynonymDef {
            tokens: vec!["fast".into()],
            alternatives: vec!["quick".into(), "rapid".into()],
        });
        let syn = Synonyms::new(&cfg);
        let mut out = Vec::new();
        syn.variants("fast", &mut out);
        assert_eq!(out.len(), 2);
    }
}
