//! The trained artifact and its binary container.
//!
//! Layout: a fixed header (`magic`, `version`, `feature_count`) followed by
//! six length-prefixed bincode sections: field definitions, weights, bias,
//! predicate disjunction, stop-word tables, and document-frequency tables.
//! Sections are independently framed, so a reader can skip what it does not
//! need and future versions can append sections without breaking old
//! readers' framing.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::algo::logistic::LogisticModel;
use crate::algo::tfidf::Corpus;
use crate::error::{Error, Result};
use crate::model::FieldDef;
use crate::predicates::CompoundPredicate;

const MAGIC: [u8; 4] = *b"LNK1";
const VERSION: u32 = 1;

/// Everything the runtime needs to match records: the immutable output of
/// training.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub defs: Vec<FieldDef>,
    pub classifier: LogisticModel,
    pub predicates: Vec<CompoundPredicate>,
    /// High-frequency tokens per text field, for inspection and reuse.
    pub stop_words: BTreeMap<String, Vec<String>>,
    /// Document-frequency tables per corpus-backed field. May be empty for
    /// models without Text or corpus-weighted Set fields.
    pub corpora: HashMap<String, Corpus>,
}

impl Settings {
    /// Serialise into the versioned binary container.
    pub fn write(&self, mut writer: impl Write) -> Result<()> {
        writer.write_all(&MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&(self.classifier.weights.len() as u32).to_le_bytes())?;

        write_section(&mut writer, &self.defs)?;
        write_section(&mut writer, &self.classifier.weights)?;
        write_section(&mut writer, &self.classifier.bias)?;
        write_section(&mut writer, &self.predicates)?;
        write_section(&mut writer, &self.stop_words)?;
        write_section(&mut writer, &self.corpora)?;
        Ok(())
    }

    /// Deserialise from the binary container, validating the header.
    pub fn read(mut reader: impl Read) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(Error::Settings("bad magic: not a settings file".into()));
        }

        let version = read_u32(&mut reader)?;
        if version != VERSION {
            return Err(Error::Settings(format!(
                "unsupported settings version {version}, expected {VERSION}"
            )));
        }
        let feature_count = read_u32(&mut reader)? as usize;

        let defs: Vec<FieldDef> = read_section(&mut reader)?;
        let weights: Vec<f32> = read_section(&mut reader)?;
        let bias: f32 = read_section(&mut reader)?;
        let predicates: Vec<CompoundPredicate> = read_section(&mut reader)?;
        let stop_words: BTreeMap<String, Vec<String>> = read_section(&mut reader)?;
        let corpora: HashMap<String, Corpus> = read_section(&mut reader)?;

        if weights.len() != feature_count {
            return Err(Error::Settings(format!(
                "weight vector has {} entries, header declares {feature_count}",
                weights.len()
            )));
        }

        Ok(Self {
            defs,
            classifier: LogisticModel { weights, bias },
            predicates,
            stop_words,
            corpora,
        })
    }
}

fn write_section(writer: &mut impl Write, value: &impl Serialize) -> Result<()> {
    let bytes = bincode::serialize(value)
        .map_err(|e| Error::Settings(format!("could not serialise section: {e}")))?;
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&bytes)?;
    Ok(())
}

fn read_section<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T> {
    let length = read_u32(reader)? as usize;
    let mut bytes = vec![0u8; length];
    reader.read_exact(&mut bytes)?;
    bincode::deserialize(&bytes)
        .map_err(|e| Error::Settings(format!("could not deserialise section: {e}")))
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buffer = [0u8; 4];
    reader.read_exact(&mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldKind;
    use crate::predicates::{PredicateKind, SimplePredicate};

    fn sample_settings() -> Settings {
        let mut corpora = HashMap::new();
        let mut corpus = Corpus::new();
        corpus.add_document(&["acme".into(), "pipe".into()]);
        corpus.add_document(&["acme".into(), "corp".into()]);
        corpora.insert("name".into(), corpus);

        Settings {
            defs: vec![
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("zip", FieldKind::Exact).with_missing(),
            ],
            classifier: LogisticModel {
                weights: vec![-4.5, -1.25, 0.5],
                bias: 2.0,
            },
            predicates: vec![
                CompoundPredicate::simple(SimplePredicate::new(
                    "name",
                    0,
                    PredicateKind::WholeField,
                )),
                CompoundPredicate::conjunction(
                    SimplePredicate::new("name", 0, PredicateKind::FirstChars(3)),
                    SimplePredicate::new("zip", 1, PredicateKind::WholeField),
                ),
            ],
            stop_words: BTreeMap::from([("name".into(), vec!["inc".into(), "llc".into()])]),
            corpora,
        }
    }

    #[test]
    fn roundtrip_preserves_everything() {
        let settings = sample_settings();
        let mut buffer = Vec::new();
        settings.write(&mut buffer).unwrap();
        let back = Settings::read(buffer.as_slice()).unwrap();
        assert_eq!(settings, back);
    }

    #[test]
    fn header_layout() {
        let settings = sample_settings();
        let mut buffer = Vec::new();
        settings.write(&mut buffer).unwrap();
        assert_eq!(&buffer[0..4], b"LNK1");
        assert_eq!(u32::from_le_bytes(buffer[4..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(buffer[8..12].try_into().unwrap()), 3);
    }

    #[test]
    fn bad_magic_rejected() {
        let result = Settings::read(&b"NOPE\x01\x00\x00\x00"[..]);
        assert!(matches!(result, Err(Error::Settings(_))));
    }

    #[test]
    fn wrong_version_rejected() {
        let settings = sample_settings();
        let mut buffer = Vec::new();
        settings.write(&mut buffer).unwrap();
        buffer[4] = 99;
        assert!(matches!(
            Settings::read(buffer.as_slice()),
            Err(Error::Settings(_))
        ));
    }

    #[test]
    fn truncated_file_rejected() {
        let settings = sample_settings();
        let mut buffer = Vec::new();
        settings.write(&mut buffer).unwrap();
        buffer.truncate(buffer.len() / 2);
        assert!(Settings::read(buffer.as_slice()).is_err());
    }

    #[test]
    fn feature_count_mismatch_rejected() {
        let settings = sample_settings();
        let mut buffer = Vec::new();
        settings.write(&mut buffer).unwrap();
        // Corrupt the declared feature count.
        buffer[8] = 7;
        assert!(matches!(
            Settings::read(buffer.as_slice()),
            Err(Error::Settings(_))
        ));
    }

    #[test]
    fn roundtrip_scores_agree_exactly() {
        let settings = sample_settings();
        let mut buffer = Vec::new();
        settings.write(&mut buffer).unwrap();
        let back = Settings::read(buffer.as_slice()).unwrap();

        let features = [0.2f32, 0.7, 1.0];
        assert_eq!(
            settings.classifier.score(&features),
            back.classifier.score(&features)
        );
    }
}
