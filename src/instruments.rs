//! Instrument universe - the fixed set of symbols tracked each session

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("duplicate {field} {value:?} in instrument list")]
    Duplicate { field: &'static str, value: String },
    #[error("instrument list is empty")]
    Empty,
}

/// One tradable instrument. `token` is the feed's identifier, `symbol` is
/// the id used everywhere else in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub token: String,
    pub symbol: String,
    pub segment: String,
}

#[derive(Debug, Clone)]
pub struct InstrumentUniverse {
    instruments: Vec<Instrument>,
    by_symbol: HashMap<String, usize>,
    by_token: HashMap<String, usize>,
}

impl InstrumentUniverse {
    pub fn load(path: impl AsRef<Path>, expected: usize) -> Result<Self, UniverseError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| UniverseError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let instruments: Vec<Instrument> = serde_json::from_str(&raw)?;
        let universe = Self::from_instruments(instruments)?;

        if universe.len() != expected {
            log::warn!(
                "⚠️  Loaded {} instruments from {}, expected {}",
                universe.len(),
                path.display(),
                expected
            );
        } else {
            log::info!("✅ Loaded {} instruments from {}", universe.len(), path.display());
        }
        Ok(universe)
    }

    pub fn from_instruments(instruments: Vec<Instrument>) -> Result<Self, UniverseError> {
        if instruments.is_empty() {
            return Err(UniverseError::Empty);
        }

        let mut by_symbol = HashMap::with_capacity(instruments.len());
        let mut by_token = HashMap::with_capacity(instruments.len());
        for (idx, instrument) in instruments.iter().enumerate() {
            if by_symbol.insert(instrument.symbol.clone(), idx).is_some() {
                return Err(UniverseError::Duplicate {
                    field: "symbol",
                    value: instrument.symbol.clone(),
                });
            }
            if by_token.insert(instrument.token.clone(), idx).is_some() {
                return Err(UniverseError::Duplicate {
                    field: "token",
                    value: instrument.token.clone(),
                });
            }
        }

        Ok(Self {
            instruments,
            by_symbol,
            by_token,
        })
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    /// Symbols in file order
    pub fn symbols(&self) -> Vec<String> {
        self.instruments.iter().map(|i| i.symbol.clone()).collect()
    }

    /// Feed tokens in file order
    pub fn tokens(&self) -> Vec<String> {
        self.instruments.iter().map(|i| i.token.clone()).collect()
    }

    pub fn segment(&self, symbol: &str) -> Option<&str> {
        self.by_symbol
            .get(symbol)
            .map(|&idx| self.instruments[idx].segment.as_str())
    }

    pub fn symbol_for_token(&self, token: &str) -> Option<&str> {
        self.by_token
            .get(token)
            .map(|&idx| self.instruments[idx].symbol.as_str())
    }

    pub fn token_for_symbol(&self, symbol: &str) -> Option<&str> {
        self.by_symbol
            .get(symbol)
            .map(|&idx| self.instruments[idx].token.as_str())
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.by_symbol.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn instrument(token: &str, symbol: &str) -> Instrument {
        Instrument {
            token: token.to_string(),
            symbol: symbol.to_string(),
            segment: "NSE_EQ".to_string(),
        }
    }

    #[test]
    fn test_lookup_by_token_and_symbol() {
        let universe = InstrumentUniverse::from_instruments(vec![
            instrument("2885", "RELIANCE"),
            instrument("11536", "TCS"),
        ])
        .unwrap();

        assert_eq!(universe.len(), 2);
        assert_eq!(universe.symbols(), vec!["RELIANCE", "TCS"]);
        assert_eq!(universe.symbol_for_token("11536"), Some("TCS"));
        assert_eq!(universe.token_for_symbol("RELIANCE"), Some("2885"));
        assert_eq!(universe.segment("TCS"), Some("NSE_EQ"));
        assert!(universe.contains("TCS"));
        assert!(!universe.contains("INFY"));
        assert_eq!(universe.symbol_for_token("999"), None);
    }

    #[test]
    fn test_duplicates_rejected() {
        let err = InstrumentUniverse::from_instruments(vec![instrument("1", "A"), instrument("2", "A")]).unwrap_err();
        assert!(matches!(err, UniverseError::Duplicate { field: "symbol", .. }));

        let err = InstrumentUniverse::from_instruments(vec![instrument("1", "A"), instrument("1", "B")]).unwrap_err();
        assert!(matches!(err, UniverseError::Duplicate { field: "token", .. }));

        assert!(matches!(
            InstrumentUniverse::from_instruments(Vec::new()),
            Err(UniverseError::Empty)
        ));
    }

    #[test]
    fn test_load_from_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("instruments.json");
        fs::write(
            &path,
            r#"[{"token":"2885","symbol":"RELIANCE","segment":"NSE_EQ"},
               {"token":"26000","symbol":"NIFTY","segment":"NSE_INDEX"}]"#,
        )
        .unwrap();

        // Count mismatch is only a warning
        let universe = InstrumentUniverse::load(&path, 178).unwrap();
        assert_eq!(universe.segment("NIFTY"), Some("NSE_INDEX"));

        assert!(matches!(
            InstrumentUniverse::load(dir.path().join("missing.json"), 178),
            Err(UniverseError::Io { .. })
        ));
    }
}
