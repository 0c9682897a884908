//! Verification kinds understood by the backend.

use serde::{Deserialize, Serialize};
use std::path::Path;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// The prover / checker a job is verified with.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProverKind {
    Coq,
    Lean,
    Isabelle,
    Agda,
    Z3,
    Cvc5,
    Metamath,
    HolLight,
    Mizar,
    Pvs,
    Acl2,
    Hol4,
}

impl ProverKind {
    /// Source file extensions this prover checks, without the dot.
    pub fn file_extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Coq => &["v"],
            Self::Lean => &["lean"],
            Self::Isabelle => &["thy"],
            Self::Agda => &["agda", "lagda"],
            Self::Z3 | Self::Cvc5 => &["smt2"],
            Self::Metamath => &["mm"],
            Self::HolLight => &["ml"],
            Self::Mizar => &["miz"],
            Self::Pvs => &["pvs"],
            Self::Acl2 => &["lisp"],
            Self::Hol4 => &["sml"],
        }
    }

    /// Whether `entry` has one of this prover's extensions.
    pub fn accepts(&self, entry: &Path) -> bool {
        entry
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.file_extensions()
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }

    /// First prover whose extensions match `entry`.
    pub fn detect(entry: &Path) -> Option<Self> {
        Self::iter().find(|kind| kind.accepts(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_form_is_lowercase() {
        assert_eq!(ProverKind::HolLight.to_string(), "hollight");
        assert_eq!("Lean".parse::<ProverKind>().unwrap(), ProverKind::Lean);
    }

    #[test]
    fn test_accepts_by_extension() {
        assert!(ProverKind::Coq.accepts(Path::new("theories/Nat.v")));
        assert!(ProverKind::Agda.accepts(Path::new("src/Main.LAGDA")));
        assert!(!ProverKind::Coq.accepts(Path::new("Main.lean")));
        assert!(!ProverKind::Coq.accepts(Path::new("Makefile")));
    }

    #[test]
    fn test_detect() {
        assert_eq!(ProverKind::detect(Path::new("a.thy")), Some(ProverKind::Isabelle));
        assert_eq!(ProverKind::detect(Path::new("q.smt2")), Some(ProverKind::Z3));
        assert_eq!(ProverKind::detect(Path::new("README.md")), None);
    }
}
