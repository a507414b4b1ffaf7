use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unknown admission policy \"{requested}\"; valid options: {valid:?}")]
    UnknownAdmission {
        requested: String,
        valid: &'static [&'static str],
    },
    #[error("unknown routing policy \"{requested}\"; valid options: {valid:?}")]
    UnknownRouting {
        requested: String,
        valid: &'static [&'static str],
    },
    #[error("unknown scorer \"{requested}\"; valid options: {valid:?}")]
    UnknownScorer {
        requested: String,
        valid: &'static [&'static str],
    },
    #[error("unknown scheduling policy \"{requested}\"; valid options: {valid:?}")]
    UnknownScheduling {
        requested: String,
        valid: &'static [&'static str],
    },
    #[error("unknown priority policy \"{requested}\"; valid options: {valid:?}")]
    UnknownPriority {
        requested: String,
        valid: &'static [&'static str],
    },
    #[error("unknown batch formation policy \"{requested}\"; valid options: {valid:?}")]
    UnknownBatchFormation {
        requested: String,
        valid: &'static [&'static str],
    },
}
