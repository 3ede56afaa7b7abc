use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind, Result};

/// Merge offsets travel in a 16-bit field of [`crate::ft::select::MergeInfo`];
/// the merge limit can never reach that width.
pub const MAX_MERGE_LIMIT: usize = 65000;
const _: () = assert!(u16::MAX as usize > MAX_MERGE_LIMIT);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynonymDef {
    pub tokens: Vec<String>,
    pub alternatives: Vec<String>,
}

/// Tuning knobs of the fast full-text index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtFastConfig {
    /// Total edits allowed when matching typos (0..=4).
    pub max_typos: u32,
    /// Words longer than this get no typo variants.
    pub max_typo_len: usize,
    /// Upper bound of documents coming out of one merge.
    pub merge_limit: usize,
    pub max_areas_in_doc: i32,
    /// Word-count threshold under which the last step is recommitted in
    /// place instead of starting a new one.
    pub max_step_size: usize,
    /// Per-field weight; missing entries default to 1.0.
    pub field_weights: Vec<f64>,
    /// Rank of a whole-word match, percent.
    pub full_match_proc: i32,
    /// Rank decrease for suffix/prefix matches, percent.
    pub partial_match_decrease: i32,
    /// Rank decrease per typo edit, percent.
    pub typo_proc_decrease: i32,
    pub min_relevancy: f64,
    /// Stemmer languages ("en", "ru", ...).
    pub stemmers: Vec<String>,
    pub enable_translit: bool,
    pub enable_kb_layout: bool,
    pub synonyms: Vec<SynonymDef>,
}

impl Default for FtFastConfig {
    fn default() -> Self {
        FtFastConfig {
            max_typos: 2,
            max_typo_len: 15,
            merge_limit: 20000,
            max_areas_in_doc: 5,
            max_step_size: 4000,
            field_weights: Vec::new(),
            full_match_proc: 100,
            partial_match_decrease: 15,
            typo_proc_decrease: 30,
            min_relevancy: 0.05,
            stemmers: vec!["en".to_string()],
            enable_translit: true,
            enable_kb_layout: true,
            synonyms: Vec::new(),
        }
    }
}

impl FtFastConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: FtFastConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_typos > 4 {
            return Err(Error::new(ErrorKind::Params, "max_typos must be in 0..4"));
        }
        if self.merge_limit > MAX_MERGE_LIMIT {
            return Err(Error::new(
                ErrorKind::Params,
                format!("merge_limit must not exceed {}", MAX_MERGE_LIMIT),
            ));
        }
        Ok(())
    }

    /// Edit budget of the `typos_half` map.
    pub fn half_typos(&self) -> u32 {
        self.max_typos / 2
    }

    /// Full edit budget; when it equals the half budget only the half map
    /// is populated.
    pub fn max_typos_in_word(&self) -> u32 {
        self.max_typos
    }

    pub fn field_weight(&self, field: usize) -> f64 {
        self.field_weights.get(field).copied().unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        FtFastConfig::default().validate().unwrap();
    }

    #[test]
    fn config_parses_from_json() {
        let cfg = FtFastConfig::from_json(r#"{"max_typos": 1, "stemmers": ["en", "ru"]}"#).unwrap();
        assert_eq!(cfg.max_typos, 1);
        assert_eq!(cfg.stemmers.len(), 2);
        assert_eq!(cfg.merge_limit, 20000); // default survives
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(FtFastConfig::from_json(r#"{"max_typos": 9}"#).is_err());
        assert!(FtFastConfig::from_json(r#"{"merge_limit": 100000}"#).is_err());
    }
}
