//! Probabilistic record deduplication and record linkage.
//!
//! Given one or two collections of dirty, partially missing records, the
//! engine partitions them into clusters referring to the same real-world
//! entity. The pipeline has three stages: learned blocking predicates
//! generate candidate pairs, a trained logistic classifier scores each
//! pair's field-distance vector, and the cluster engine aggregates scored
//! pairs into transitive clusters (or bipartite matches for linkage).
//!
//! Training consumes labeled pairs and produces an immutable artifact
//! (weights, bias, predicate disjunction, and TF-IDF tables) that
//! [`Matcher`] applies at runtime. Ingestion, interactive labeling, and
//! reporting live in collaborating crates.

pub mod algo;
pub mod blocking;
pub mod cancel;
pub mod candidates;
pub mod error;
pub mod features;
pub mod model;
pub mod ops;
pub mod predicates;
pub mod record;
pub mod scorer;
pub mod settings;
pub mod threshold;
pub mod training;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use model::{DataModel, FieldDef, FieldKind};
pub use ops::{Cluster, Gazetteer, Matcher, TrainingOptions};
pub use record::{record, FieldValue, Record, RecordId};
pub use settings::Settings;
pub use training::TrainingPairs;
