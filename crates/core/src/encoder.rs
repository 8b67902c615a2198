//! Item feature encoding.
//!
//! An item becomes one raw feature vector: a TF-IDF sub-vector over a bounded
//! vocabulary (built from the concatenated text fields) followed by one
//! min-max scaled value per numeric column.
//!
//! [`FeatureEncoder::fit`] consumes the entire corpus in a single call and
//! returns an immutable [`FittedEncoder`]. Every later transform in the run
//! goes through that one value, which is what keeps all items in the same
//! feature space. There is no partial or streaming fit.
//!
//! # Layout
//!
//! ```text
//! [ tfidf(term_0) .. tfidf(term_{V-1}) | scaled(num_0) .. scaled(num_{M-1}) ]
//! ```
//!
//! `V` is the vocabulary size (at most `max_features`), `M` the number of
//! schema numeric fields that carried at least one finite value at fit time.

use crate::{EmbedRecError, ItemRecord, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// What to do with record fields the schema does not declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFieldPolicy {
    /// Fail with [`EmbedRecError::UnknownField`].
    #[default]
    Reject,
    /// Skip the field (logged at debug level).
    Ignore,
}

/// Declared shape of an [`ItemRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSchema {
    /// Text fields, concatenated in this order into one document per item.
    pub text_fields: Vec<String>,
    /// Numeric fields, in feature-vector column order.
    pub numeric_fields: Vec<String>,
    #[serde(default)]
    pub unknown_fields: UnknownFieldPolicy,
}

impl ItemSchema {
    pub fn new<T, N>(text_fields: T, numeric_fields: N) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<String>,
    {
        Self {
            text_fields: text_fields.into_iter().map(Into::into).collect(),
            numeric_fields: numeric_fields.into_iter().map(Into::into).collect(),
            unknown_fields: UnknownFieldPolicy::default(),
        }
    }

    pub fn with_unknown_fields(mut self, policy: UnknownFieldPolicy) -> Self {
        self.unknown_fields = policy;
        self
    }

    /// Reject repeated field names, within or across the two lists.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for field in self.text_fields.iter().chain(&self.numeric_fields) {
            if !seen.insert(field.as_str()) {
                return Err(EmbedRecError::InvalidConfig(format!(
                    "schema field `{field}` is declared more than once"
                )));
            }
        }
        Ok(())
    }

    fn check_fields(&self, record: &ItemRecord) -> Result<()> {
        let undeclared = record
            .text
            .keys()
            .filter(|f| !self.text_fields.contains(f))
            .chain(
                record
                    .numeric
                    .keys()
                    .filter(|f| !self.numeric_fields.contains(f)),
            );

        for field in undeclared {
            match self.unknown_fields {
                UnknownFieldPolicy::Reject => {
                    return Err(EmbedRecError::UnknownField {
                        item: record.id.clone(),
                        field: field.clone(),
                    })
                }
                UnknownFieldPolicy::Ignore => {
                    tracing::debug!(item = %record.id, field = %field, "ignoring undeclared field");
                }
            }
        }
        Ok(())
    }

    /// Concatenate the declared text fields of `record`, substituting
    /// `placeholder` for missing or blank values.
    fn document(&self, record: &ItemRecord, placeholder: &str) -> String {
        self.text_fields
            .iter()
            .map(|field| match record.text.get(field) {
                Some(value) if !value.trim().is_empty() => value.as_str(),
                _ => placeholder,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Encoder hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Upper bound on vocabulary size.
    pub max_features: usize,
    /// Stand-in for a missing text field.
    pub placeholder: String,
    /// Scaled value used when a record lacks a fitted numeric column.
    pub numeric_default: f32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_features: 100,
            placeholder: "unknown".to_string(),
            numeric_default: 0.0,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_features == 0 {
            return Err(EmbedRecError::InvalidConfig(
                "`max_features` must be >= 1".into(),
            ));
        }
        if tokenize(&self.placeholder).is_empty() {
            return Err(EmbedRecError::InvalidConfig(format!(
                "placeholder {:?} contains no indexable token",
                self.placeholder
            )));
        }
        if !(0.0..=1.0).contains(&self.numeric_default) {
            return Err(EmbedRecError::InvalidConfig(format!(
                "`numeric_default` must lie in [0, 1], got {}",
                self.numeric_default
            )));
        }
        Ok(())
    }
}

/// Unfitted encoder: a schema plus hyperparameters.
#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    config: EncoderConfig,
    schema: ItemSchema,
}

impl FeatureEncoder {
    pub fn new(config: EncoderConfig, schema: ItemSchema) -> Self {
        Self { config, schema }
    }

    /// Fit the vocabulary and numeric scaler on the full corpus.
    ///
    /// # Errors
    ///
    /// - [`EmbedRecError::EmptyCorpus`] if `corpus` is empty.
    /// - [`EmbedRecError::UnknownField`] for undeclared fields under
    ///   [`UnknownFieldPolicy::Reject`].
    /// - [`EmbedRecError::InvalidConfig`] for a bad schema or config, or if
    ///   the corpus yields no features at all.
    pub fn fit(&self, corpus: &[ItemRecord]) -> Result<FittedEncoder> {
        if corpus.is_empty() {
            return Err(EmbedRecError::EmptyCorpus(
                "cannot fit the feature encoder on zero items".into(),
            ));
        }
        self.schema.validate()?;
        self.config.validate()?;
        for record in corpus {
            self.schema.check_fields(record)?;
        }

        let documents: Vec<Vec<String>> = corpus
            .iter()
            .map(|r| tokenize(&self.schema.document(r, &self.config.placeholder)))
            .collect();
        let vocabulary = Vocabulary::fit(&documents, self.config.max_features);
        let numeric = self.fit_numeric(corpus);

        if vocabulary.len() + numeric.len() == 0 {
            return Err(EmbedRecError::InvalidConfig(
                "schema yields an empty feature space".into(),
            ));
        }

        tracing::info!(
            items = corpus.len(),
            vocabulary = vocabulary.len(),
            numeric_columns = numeric.len(),
            "fitted feature encoder"
        );

        Ok(FittedEncoder {
            config: self.config.clone(),
            schema: self.schema.clone(),
            vocabulary,
            numeric,
        })
    }

    fn fit_numeric(&self, corpus: &[ItemRecord]) -> Vec<NumericColumn> {
        let mut columns = Vec::new();
        for field in &self.schema.numeric_fields {
            let range = corpus
                .iter()
                .filter_map(|r| r.numeric.get(field).copied())
                .filter(|v| v.is_finite())
                .fold(None, |acc: Option<(f64, f64)>, v| match acc {
                    None => Some((v, v)),
                    Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
                });
            match range {
                Some((min, max)) => columns.push(NumericColumn {
                    name: field.clone(),
                    min,
                    max,
                }),
                None => tracing::debug!(field = %field, "numeric field absent from corpus; no column"),
            }
        }
        columns
    }
}

/// Fitted encoder state. Immutable; shared read-only by every transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedEncoder {
    config: EncoderConfig,
    schema: ItemSchema,
    vocabulary: Vocabulary,
    numeric: Vec<NumericColumn>,
}

impl FittedEncoder {
    /// Width of every raw feature vector this encoder produces.
    pub fn width(&self) -> usize {
        self.vocabulary.len() + self.numeric.len()
    }

    /// Vocabulary terms in column order.
    pub fn vocabulary(&self) -> &[String] {
        &self.vocabulary.terms
    }

    /// Names of the fitted numeric columns in column order.
    pub fn numeric_columns(&self) -> impl Iterator<Item = &str> {
        self.numeric.iter().map(|c| c.name.as_str())
    }

    pub fn schema(&self) -> &ItemSchema {
        &self.schema
    }

    /// Encode one record into a raw feature vector of length [`width`].
    ///
    /// Text terms outside the vocabulary are dropped. Missing numeric values
    /// are imputed with `numeric_default`.
    ///
    /// # Errors
    ///
    /// - [`EmbedRecError::UnseenNumericColumn`] if the record carries a
    ///   declared numeric field that had no values at fit time.
    /// - [`EmbedRecError::UnknownField`] under [`UnknownFieldPolicy::Reject`].
    ///
    /// [`width`]: FittedEncoder::width
    pub fn transform(&self, record: &ItemRecord) -> Result<Vec<f32>> {
        self.schema.check_fields(record)?;
        for field in record.numeric.keys() {
            if self.schema.numeric_fields.contains(field)
                && !self.numeric.iter().any(|c| &c.name == field)
            {
                return Err(EmbedRecError::UnseenNumericColumn {
                    item: record.id.clone(),
                    field: field.clone(),
                });
            }
        }

        let tokens = tokenize(&self.schema.document(record, &self.config.placeholder));
        let mut features = self.vocabulary.transform(&tokens);
        features.extend(self.numeric.iter().map(|column| {
            match record.numeric.get(&column.name).filter(|v| v.is_finite()) {
                Some(&v) => column.scale(v),
                None => self.config.numeric_default,
            }
        }));
        Ok(features)
    }

    /// Encode many records. Rows come back in input order; on failure the
    /// error of the first failing record is returned.
    pub fn transform_all(&self, records: &[ItemRecord]) -> Result<Vec<Vec<f32>>> {
        let rows: Vec<Result<Vec<f32>>> = records.par_iter().map(|r| self.transform(r)).collect();
        rows.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// TF-IDF vocabulary
// ---------------------------------------------------------------------------

/// Bounded vocabulary with smoothed inverse document frequencies.
///
/// `terms` is sorted, so lookups are a binary search and the column order is
/// alphabetical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Vocabulary {
    terms: Vec<String>,
    idf: Vec<f32>,
}

impl Vocabulary {
    /// Keep the `max_features` most frequent terms across the corpus (ties by
    /// term) and weight each by `ln((1 + n) / (1 + df)) + 1`.
    fn fit(documents: &[Vec<String>], max_features: usize) -> Self {
        let mut term_freq: HashMap<&str, usize> = HashMap::new();
        let mut doc_freq: HashMap<&str, usize> = HashMap::new();

        for doc in documents {
            let mut seen: HashSet<&str> = HashSet::new();
            for token in doc {
                *term_freq.entry(token.as_str()).or_insert(0) += 1;
                if seen.insert(token.as_str()) {
                    *doc_freq.entry(token.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut ranked: Vec<(&str, usize)> = term_freq.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.truncate(max_features);

        let mut terms: Vec<&str> = ranked.into_iter().map(|(t, _)| t).collect();
        terms.sort_unstable();

        let n_docs = documents.len() as f64;
        let idf = terms
            .iter()
            .map(|t| {
                let df = doc_freq.get(t).copied().unwrap_or(0) as f64;
                (((1.0 + n_docs) / (1.0 + df)).ln() + 1.0) as f32
            })
            .collect();

        Self {
            terms: terms.into_iter().map(str::to_string).collect(),
            idf,
        }
    }

    fn len(&self) -> usize {
        self.terms.len()
    }

    fn column(&self, term: &str) -> Option<usize> {
        self.terms.binary_search_by(|t| t.as_str().cmp(term)).ok()
    }

    /// Count × IDF, L2-normalised. All zeros when no term is in vocabulary.
    fn transform(&self, tokens: &[String]) -> Vec<f32> {
        let mut row = vec![0.0f32; self.terms.len()];
        for token in tokens {
            if let Some(col) = self.column(token) {
                row[col] += 1.0;
            }
        }
        for (value, idf) in row.iter_mut().zip(&self.idf) {
            *value *= idf;
        }
        let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            row.iter_mut().for_each(|x| *x /= norm);
        }
        row
    }
}

// ---------------------------------------------------------------------------
// Min-max scaling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NumericColumn {
    name: String,
    min: f64,
    max: f64,
}

impl NumericColumn {
    /// Scale into `[0, 1]`. A constant column maps to 0.
    fn scale(&self, value: f64) -> f32 {
        let range = self.max - self.min;
        if range <= f64::EPSILON {
            return 0.0;
        }
        ((value - self.min) / range).clamp(0.0, 1.0) as f32
    }
}

/// Lowercased runs of alphanumeric or `_` characters, at least two long.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ItemSchema {
        ItemSchema::new(["title", "category"], ["price", "rating"])
    }

    fn corpus() -> Vec<ItemRecord> {
        vec![
            ItemRecord::new("1")
                .with_text("title", "Red running shoe")
                .with_text("category", "footwear")
                .with_number("price", 40.0),
            ItemRecord::new("2")
                .with_text("title", "Blue running shoe")
                .with_text("category", "footwear")
                .with_number("price", 60.0),
            ItemRecord::new("3")
                .with_text("title", "Frying pan")
                .with_number("price", 20.0),
        ]
    }

    fn fitted() -> FittedEncoder {
        FeatureEncoder::new(EncoderConfig::default(), schema())
            .fit(&corpus())
            .unwrap()
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    // ------------------------------------------------------------------
    // tokenize
    // ------------------------------------------------------------------

    #[test]
    fn tokenize_lowercases_and_drops_short_tokens() {
        assert_eq!(
            tokenize("A Red-Shoe, size_9 x"),
            vec!["red", "shoe", "size_9"]
        );
    }

    // ------------------------------------------------------------------
    // fit
    // ------------------------------------------------------------------

    #[test]
    fn fit_empty_corpus_is_error() {
        let err = FeatureEncoder::new(EncoderConfig::default(), schema())
            .fit(&[])
            .unwrap_err();
        assert!(matches!(err, EmbedRecError::EmptyCorpus(_)));
    }

    #[test]
    fn width_is_vocabulary_plus_present_numeric_columns() {
        let enc = fitted();
        // "rating" never appears in the corpus, so only "price" is a column.
        assert_eq!(enc.numeric_columns().collect::<Vec<_>>(), ["price"]);
        assert_eq!(enc.width(), enc.vocabulary().len() + 1);
    }

    #[test]
    fn missing_text_field_uses_placeholder() {
        let enc = fitted();
        // Item 3 has no category.
        assert!(enc.vocabulary().iter().any(|t| t == "unknown"));
    }

    #[test]
    fn vocabulary_is_capped_by_term_frequency() {
        let config = EncoderConfig {
            max_features: 2,
            ..EncoderConfig::default()
        };
        let enc = FeatureEncoder::new(config, schema()).fit(&corpus()).unwrap();
        // running, shoe and footwear each occur twice; ties go to the
        // alphabetically first terms.
        assert_eq!(enc.vocabulary(), ["footwear", "running"]);
    }

    #[test]
    fn fit_rejects_zero_max_features() {
        let config = EncoderConfig {
            max_features: 0,
            ..EncoderConfig::default()
        };
        let err = FeatureEncoder::new(config, schema()).fit(&corpus()).unwrap_err();
        assert!(matches!(err, EmbedRecError::InvalidConfig(_)));
    }

    #[test]
    fn schema_rejects_field_declared_twice() {
        let bad = ItemSchema::new(["title"], ["title"]);
        assert!(matches!(bad.validate(), Err(EmbedRecError::InvalidConfig(_))));
    }

    // ------------------------------------------------------------------
    // transform
    // ------------------------------------------------------------------

    #[test]
    fn transform_has_fixed_width_and_unit_text_part() {
        let enc = fitted();
        let v = enc.transform(&corpus()[0]).unwrap();
        assert_eq!(v.len(), enc.width());
        let text_part = &v[..enc.vocabulary().len()];
        assert!((norm(text_part) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn numeric_values_are_min_max_scaled() {
        let enc = fitted();
        let price = |id: usize| *enc.transform(&corpus()[id]).unwrap().last().unwrap();
        assert!((price(0) - 0.5).abs() < 1e-6);
        assert!((price(1) - 1.0).abs() < 1e-6);
        assert!(price(2).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_numeric_is_clamped() {
        let enc = fitted();
        let record = ItemRecord::new("4")
            .with_text("title", "shoe")
            .with_number("price", 500.0);
        assert_eq!(*enc.transform(&record).unwrap().last().unwrap(), 1.0);
    }

    #[test]
    fn missing_numeric_is_imputed_with_default() {
        let config = EncoderConfig {
            numeric_default: 0.25,
            ..EncoderConfig::default()
        };
        let enc = FeatureEncoder::new(config, schema()).fit(&corpus()).unwrap();
        let record = ItemRecord::new("4").with_text("title", "shoe");
        assert_eq!(*enc.transform(&record).unwrap().last().unwrap(), 0.25);
    }

    #[test]
    fn constant_numeric_column_scales_to_zero() {
        let records = vec![
            ItemRecord::new("a").with_text("title", "one").with_number("price", 5.0),
            ItemRecord::new("b").with_text("title", "two").with_number("price", 5.0),
        ];
        let enc = FeatureEncoder::new(EncoderConfig::default(), schema())
            .fit(&records)
            .unwrap();
        assert_eq!(*enc.transform(&records[0]).unwrap().last().unwrap(), 0.0);
    }

    #[test]
    fn out_of_vocabulary_terms_are_dropped() {
        let enc = fitted();
        let record = ItemRecord::new("4")
            .with_text("title", "zebra xylophone")
            .with_text("category", "quartz");
        let v = enc.transform(&record).unwrap();
        assert!(v[..enc.vocabulary().len()].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn unseen_numeric_column_is_error() {
        let enc = fitted();
        let record = ItemRecord::new("4")
            .with_text("title", "shoe")
            .with_number("rating", 4.5);
        let err = enc.transform(&record).unwrap_err();
        assert!(
            matches!(err, EmbedRecError::UnseenNumericColumn { ref field, .. } if field == "rating")
        );
    }

    #[test]
    fn undeclared_field_rejected_by_default() {
        let enc = fitted();
        let record = ItemRecord::new("4").with_text("colour", "red");
        let err = enc.transform(&record).unwrap_err();
        assert!(matches!(err, EmbedRecError::UnknownField { .. }));
    }

    #[test]
    fn undeclared_field_ignored_when_configured() {
        let schema = schema().with_unknown_fields(UnknownFieldPolicy::Ignore);
        let enc = FeatureEncoder::new(EncoderConfig::default(), schema)
            .fit(&corpus())
            .unwrap();
        let plain = ItemRecord::new("4").with_text("title", "red shoe");
        let extra = plain.clone().with_text("colour", "red").with_number("weight", 1.0);
        assert_eq!(enc.transform(&plain).unwrap(), enc.transform(&extra).unwrap());
    }

    #[test]
    fn transform_all_preserves_order() {
        let enc = fitted();
        let records = corpus();
        let rows = enc.transform_all(&records).unwrap();
        assert_eq!(rows.len(), records.len());
        for (row, record) in rows.iter().zip(&records) {
            assert_eq!(row, &enc.transform(record).unwrap());
        }
    }

    #[test]
    fn fitted_encoder_survives_json_round_trip() {
        let enc = fitted();
        let json = serde_json::to_string(&enc).unwrap();
        let restored: FittedEncoder = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, enc);
        assert_eq!(
            restored.transform(&corpus()[1]).unwrap(),
            enc.transform(&corpus()[1]).unwrap()
        );
    }
}
